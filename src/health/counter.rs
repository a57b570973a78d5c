//! Per-endpoint call result counter.
//!
//! # Responsibilities
//! - Count successes and failures of completed RPCs
//! - Swap the active bucket at each interval boundary
//!
//! # Design Decisions
//! - Two buckets and an atomic index; the hot path never takes a lock
//! - Only the interval sweep calls `swap`, and it only reads the bucket it
//!   just retired, so its reads never race with live increments
//! - A completion that loaded the index just before a swap lands in the
//!   retired bucket; that bucket is not read again until it is reset

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Success and failure tallies for one interval.
#[derive(Debug, Default)]
struct Bucket {
    successes: AtomicU32,
    failures: AtomicU32,
}

impl Bucket {
    fn reset(&self) {
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot {
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of a bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub successes: u32,
    pub failures: u32,
}

impl BucketSnapshot {
    pub fn total(&self) -> u64 {
        u64::from(self.successes) + u64::from(self.failures)
    }

    /// Fraction of successful requests. Zero when the bucket is empty.
    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => f64::from(self.successes) / total as f64,
        }
    }

    /// Failures as a percentage of all requests. Zero when the bucket is empty.
    pub fn failure_percentage(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => f64::from(self.failures) / total as f64 * 100.0,
        }
    }
}

/// Dual-bucket call counter.
#[derive(Debug, Default)]
pub struct CallCounter {
    buckets: [Bucket; 2],
    active: AtomicUsize,
}

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one RPC in the active bucket.
    pub fn record(&self, success: bool) {
        let bucket = &self.buckets[self.active.load(Ordering::Acquire)];
        if success {
            bucket.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            bucket.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Retire the active bucket and start counting into a zeroed one.
    pub fn swap(&self) {
        let retired = self.active.load(Ordering::Acquire);
        let next = retired ^ 1;
        self.buckets[next].reset();
        self.active.store(next, Ordering::Release);
    }

    /// Reset both buckets.
    pub fn clear(&self) {
        self.buckets[0].reset();
        self.buckets[1].reset();
    }

    /// Tallies of the bucket retired by the last `swap`.
    pub fn inactive(&self) -> BucketSnapshot {
        self.buckets[self.active.load(Ordering::Acquire) ^ 1].snapshot()
    }

    /// Tallies accumulated so far in the current interval.
    pub fn active(&self) -> BucketSnapshot {
        self.buckets[self.active.load(Ordering::Acquire)].snapshot()
    }
}
