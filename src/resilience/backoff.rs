//! Exponential ejection back-off.

use std::time::Duration;

use tokio::time::Instant;

/// How long an endpoint stays ejected after its `multiplier`-th ejection.
///
/// Grows linearly in the multiplier and is capped at
/// `max(base, max_ejection_time)`.
pub fn ejection_backoff(multiplier: u32, base: Duration, max_ejection_time: Duration) -> Duration {
    let cap = base.max(max_ejection_time);
    base.saturating_mul(multiplier).min(cap)
}

/// True once `now` is strictly past the end of the ejection that started at
/// `ejected_at`.
pub fn ejection_expired(
    ejected_at: Instant,
    multiplier: u32,
    base: Duration,
    max_ejection_time: Duration,
    now: Instant,
) -> bool {
    match ejected_at.checked_add(ejection_backoff(multiplier, base, max_ejection_time)) {
        Some(deadline) => now > deadline,
        None => false,
    }
}
