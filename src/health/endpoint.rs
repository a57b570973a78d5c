//! Endpoint record.
//!
//! # Responsibilities
//! - Represent a single resolved address
//! - Own the address's call counter
//! - Track ejection timestamp and back-off multiplier
//! - Fan ejection changes out to every attached channel wrapper

use std::sync::Arc;

use tokio::time::Instant;

use crate::health::counter::CallCounter;
use crate::load_balancer::wrapper::ChannelWrapper;

/// Runtime outlier detection state of one address.
///
/// Owned by the endpoint map. Wrappers only hold the call counter, so the
/// record and its wrappers do not keep each other alive.
#[derive(Debug, Default)]
pub struct EndpointRecord {
    call_counter: Arc<CallCounter>,
    /// Start of the interval in which the endpoint was ejected; `None` while
    /// the endpoint is in service.
    latest_ejection: Option<Instant>,
    ejection_time_multiplier: u32,
    attached: Vec<Arc<ChannelWrapper>>,
}

impl EndpointRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_counter(&self) -> &Arc<CallCounter> {
        &self.call_counter
    }

    pub fn is_ejected(&self) -> bool {
        self.latest_ejection.is_some()
    }

    pub fn latest_ejection(&self) -> Option<Instant> {
        self.latest_ejection
    }

    pub fn ejection_time_multiplier(&self) -> u32 {
        self.ejection_time_multiplier
    }

    pub fn attached(&self) -> &[Arc<ChannelWrapper>] {
        &self.attached
    }

    /// Bind a wrapper to this endpoint so its RPCs are counted here.
    pub(crate) fn attach(&mut self, wrapper: &Arc<ChannelWrapper>) {
        if !self.attached.iter().any(|w| Arc::ptr_eq(w, wrapper)) {
            self.attached.push(wrapper.clone());
        }
        wrapper.bind(self.call_counter.clone());
    }

    /// Unbind a wrapper. Returns false if it was not attached here.
    pub(crate) fn detach(&mut self, wrapper: &Arc<ChannelWrapper>) -> bool {
        let before = self.attached.len();
        self.attached.retain(|w| !Arc::ptr_eq(w, wrapper));
        let removed = self.attached.len() != before;
        if removed {
            wrapper.unbind();
        }
        removed
    }

    /// Unbind every wrapper.
    pub(crate) fn detach_all(&mut self) {
        for wrapper in self.attached.drain(..) {
            wrapper.unbind();
        }
    }

    pub(crate) fn eject(&mut self, now: Instant) {
        self.latest_ejection = Some(now);
        self.ejection_time_multiplier = self.ejection_time_multiplier.saturating_add(1);
        for wrapper in &self.attached {
            wrapper.eject();
        }
    }

    pub(crate) fn uneject(&mut self) {
        self.latest_ejection = None;
        for wrapper in &self.attached {
            wrapper.uneject();
        }
    }

    /// One clean interval passed; decay the multiplier (floor zero).
    pub(crate) fn decay_multiplier(&mut self) {
        self.ejection_time_multiplier = self.ejection_time_multiplier.saturating_sub(1);
    }

    pub(crate) fn reset_multiplier(&mut self) {
        self.ejection_time_multiplier = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eject_and_uneject() {
        let mut record = EndpointRecord::new();
        assert!(!record.is_ejected());

        let now = Instant::now();
        record.eject(now);
        assert!(record.is_ejected());
        assert_eq!(record.latest_ejection(), Some(now));
        assert_eq!(record.ejection_time_multiplier(), 1);

        record.uneject();
        assert!(!record.is_ejected());
        assert_eq!(record.ejection_time_multiplier(), 1);

        record.eject(now);
        assert_eq!(record.ejection_time_multiplier(), 2);
    }

    #[test]
    fn test_multiplier_floor() {
        let mut record = EndpointRecord::new();
        record.decay_multiplier();
        assert_eq!(record.ejection_time_multiplier(), 0);

        record.eject(Instant::now());
        record.decay_multiplier();
        record.decay_multiplier();
        assert_eq!(record.ejection_time_multiplier(), 0);
    }
}
