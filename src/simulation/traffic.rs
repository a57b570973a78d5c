//! Synthetic RPC traffic.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;

use crate::config::schema::SimulationConfig;
use crate::load_balancer::{DoneInfo, LbError, PickInfo};
use crate::simulation::SimulatedController;

/// Counts for one or more batches of RPCs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub succeeded: u64,
    pub failed: u64,
    pub pick_errors: u64,
    /// Completed RPCs per backend address.
    pub per_backend: HashMap<String, u64>,
}

impl TrafficStats {
    pub fn merge(&mut self, other: TrafficStats) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.pick_errors += other.pick_errors;
        for (addr, count) in other.per_backend {
            *self.per_backend.entry(addr).or_default() += count;
        }
    }

    pub fn total(&self) -> u64 {
        self.succeeded + self.failed + self.pick_errors
    }
}

/// Issues RPCs through the latest published picker and fails them with each
/// backend's configured probability.
pub struct TrafficGenerator {
    controller: Arc<SimulatedController>,
    failure_rates: HashMap<String, f64>,
}

impl TrafficGenerator {
    pub fn new(controller: Arc<SimulatedController>, config: &SimulationConfig) -> Self {
        let mut generator = Self {
            controller,
            failure_rates: HashMap::new(),
        };
        generator.update_backends(config);
        generator
    }

    pub fn update_backends(&mut self, config: &SimulationConfig) {
        self.failure_rates = config
            .backends
            .iter()
            .map(|b| (b.address.clone(), b.failure_rate))
            .collect();
    }

    /// Send `count` RPCs.
    pub fn send_batch(&self, count: u32) -> TrafficStats {
        let mut rng = rand::thread_rng();
        let mut stats = TrafficStats::default();
        for _ in 0..count {
            match self.send_one(&mut rng) {
                Ok((addr, success)) => {
                    if success {
                        stats.succeeded += 1;
                    } else {
                        stats.failed += 1;
                    }
                    *stats.per_backend.entry(addr).or_default() += 1;
                }
                Err(_) => stats.pick_errors += 1,
            }
        }
        stats
    }

    /// Pick, then complete. Returns the backend and whether the RPC succeeded.
    pub fn send_one<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<(String, bool), LbError> {
        let picker = self
            .controller
            .latest_picker()
            .ok_or(LbError::NoChannelAvailable)?;
        let result = picker.pick(&PickInfo::default())?;
        let addr = self
            .controller
            .address_of(&result.channel)
            .unwrap_or_default();

        let failure_rate = self.failure_rates.get(&addr).copied().unwrap_or(0.0);
        let success = !rng.gen_bool(failure_rate.clamp(0.0, 1.0));
        let info = if success {
            DoneInfo::success()
        } else {
            DoneInfo::failure("simulated backend failure")
        };
        result.complete(&info);
        Ok((addr, success))
    }
}
