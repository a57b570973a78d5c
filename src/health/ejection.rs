//! Ejection algorithms and the interval sweep.
//!
//! # Data Flow
//! ```text
//! Interval timer fires:
//!     → swap every call counter (last interval becomes readable)
//!     → success-rate algorithm (if configured)
//!     → failure-percentage algorithm (if configured)
//!     → expire ejections whose back-off elapsed, decay clean multipliers
//! ```
//!
//! Both algorithms only read the retired bucket, stop as soon as the
//! ejection cap is reached, and draw an independent enforcement roll per
//! endpoint.

use std::fmt;

use rand::Rng;
use tokio::time::Instant;

use crate::config::{
    FailurePercentageEjectionConfig, OutlierDetectionConfig, SuccessRateEjectionConfig,
};
use crate::health::counter::BucketSnapshot;
use crate::health::state::EndpointSet;
use crate::resilience::backoff::ejection_expired;

/// Which algorithm flagged an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    SuccessRate,
    FailurePercentage,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::SuccessRate => "success_rate",
            Algorithm::FailurePercentage => "failure_percentage",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one sweep changed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IntervalOutcome {
    pub ejected: Vec<(String, Algorithm)>,
    pub unejected: Vec<String>,
}

/// Run one full interval over the endpoint map.
///
/// `now` is recorded as the ejection timestamp of anything ejected in this
/// sweep and is the reference point for expiring older ejections.
pub fn run_interval<R: Rng + ?Sized>(
    endpoints: &mut EndpointSet,
    config: &OutlierDetectionConfig,
    now: Instant,
    rng: &mut R,
) -> IntervalOutcome {
    let mut outcome = IntervalOutcome::default();

    endpoints.swap_counters();

    if let Some(sre) = &config.success_rate_ejection {
        success_rate_ejection(endpoints, sre, config.max_ejection_percent, now, rng, &mut outcome);
    }
    if let Some(fpe) = &config.failure_percentage_ejection {
        failure_percentage_ejection(
            endpoints,
            fpe,
            config.max_ejection_percent,
            now,
            rng,
            &mut outcome,
        );
    }

    expire_ejections(endpoints, config, now, &mut outcome);

    outcome
}

/// Endpoints whose last interval saw at least `request_volume` calls.
fn candidates(endpoints: &EndpointSet, request_volume: u32) -> Vec<(String, BucketSnapshot)> {
    endpoints
        .iter()
        .filter_map(|(addr, record)| {
            let bucket = record.call_counter().inactive();
            (bucket.total() >= u64::from(request_volume)).then(|| (addr.clone(), bucket))
        })
        .collect()
}

fn enforced<R: Rng + ?Sized>(rng: &mut R, enforcement_percentage: u32) -> bool {
    rng.gen_range(0..100u32) < enforcement_percentage
}

fn success_rate_ejection<R: Rng + ?Sized>(
    endpoints: &mut EndpointSet,
    config: &SuccessRateEjectionConfig,
    max_ejection_percent: u32,
    now: Instant,
    rng: &mut R,
    outcome: &mut IntervalOutcome,
) {
    let candidates = candidates(endpoints, config.request_volume);
    if candidates.len() < config.minimum_hosts as usize {
        return;
    }

    let rates: Vec<f64> = candidates.iter().map(|(_, b)| b.success_rate()).collect();
    let (mean, std_dev) = mean_and_std_dev(&rates);
    let required = mean - std_dev * (f64::from(config.stdev_factor) / 1000.0);

    for ((addr, _), rate) in candidates.iter().zip(rates) {
        if endpoints.ejection_cap_reached(max_ejection_percent) {
            return;
        }
        if endpoints.get(addr).is_some_and(|r| r.is_ejected()) {
            continue;
        }
        if rate < required && enforced(rng, config.enforcement_percentage) {
            tracing::info!(
                address = %addr,
                success_rate = rate,
                required_success_rate = required,
                "Ejecting endpoint: success rate outlier"
            );
            if endpoints.eject(addr, now) {
                outcome.ejected.push((addr.clone(), Algorithm::SuccessRate));
            }
        }
    }
}

fn failure_percentage_ejection<R: Rng + ?Sized>(
    endpoints: &mut EndpointSet,
    config: &FailurePercentageEjectionConfig,
    max_ejection_percent: u32,
    now: Instant,
    rng: &mut R,
    outcome: &mut IntervalOutcome,
) {
    let candidates = candidates(endpoints, config.request_volume);
    if candidates.len() < config.minimum_hosts as usize {
        return;
    }

    for (addr, bucket) in &candidates {
        if endpoints.ejection_cap_reached(max_ejection_percent) {
            return;
        }
        if endpoints.get(addr).is_some_and(|r| r.is_ejected()) {
            continue;
        }
        let failure_percentage = bucket.failure_percentage();
        if failure_percentage > f64::from(config.threshold)
            && enforced(rng, config.enforcement_percentage)
        {
            tracing::info!(
                address = %addr,
                failure_percentage,
                threshold = config.threshold,
                "Ejecting endpoint: failure percentage above threshold"
            );
            if endpoints.eject(addr, now) {
                outcome.ejected.push((addr.clone(), Algorithm::FailurePercentage));
            }
        }
    }
}

fn expire_ejections(
    endpoints: &mut EndpointSet,
    config: &OutlierDetectionConfig,
    now: Instant,
    outcome: &mut IntervalOutcome,
) {
    let base = config.base_ejection_time();
    let max = config.max_ejection_time();

    let addrs: Vec<String> = endpoints.iter().map(|(addr, _)| addr.clone()).collect();
    for addr in addrs {
        let Some(record) = endpoints.get_mut(&addr) else {
            continue;
        };
        match record.latest_ejection() {
            None => record.decay_multiplier(),
            Some(ejected_at) => {
                if ejection_expired(ejected_at, record.ejection_time_multiplier(), base, max, now)
                    && endpoints.uneject(&addr)
                {
                    tracing::info!(address = %addr, "Un-ejecting endpoint: ejection time elapsed");
                    outcome.unejected.push(addr);
                }
            }
        }
    }
}

/// Population mean and standard deviation.
pub fn mean_and_std_dev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::Address;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    fn endpoint_set(addrs: &[&str]) -> EndpointSet {
        let mut set = EndpointSet::new();
        let list: Vec<Address> = addrs.iter().map(|a| Address::new(*a)).collect();
        set.sync_addresses(&list);
        set
    }

    fn record(set: &EndpointSet, addr: &str, successes: u32, failures: u32) {
        let counter = set.get(addr).unwrap().call_counter();
        for _ in 0..successes {
            counter.record(true);
        }
        for _ in 0..failures {
            counter.record(false);
        }
    }

    fn failure_percentage_config(max_ejection_percent: u32) -> OutlierDetectionConfig {
        OutlierDetectionConfig {
            max_ejection_percent,
            failure_percentage_ejection: Some(FailurePercentageEjectionConfig {
                threshold: 50,
                enforcement_percentage: 100,
                minimum_hosts: 2,
                request_volume: 10,
            }),
            base_ejection_time_ms: 10_000,
            max_ejection_time_ms: 30_000,
            ..OutlierDetectionConfig::new("round_robin")
        }
    }

    fn success_rate_config(max_ejection_percent: u32) -> OutlierDetectionConfig {
        OutlierDetectionConfig {
            max_ejection_percent,
            success_rate_ejection: Some(SuccessRateEjectionConfig {
                stdev_factor: 1000,
                enforcement_percentage: 100,
                minimum_hosts: 5,
                request_volume: 100,
            }),
            base_ejection_time_ms: 10_000,
            max_ejection_time_ms: 30_000,
            ..OutlierDetectionConfig::new("round_robin")
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_mean_and_std_dev() {
        let (mean, std_dev) = mean_and_std_dev(&[1.0, 1.0, 1.0, 1.0, 0.8]);
        assert!((mean - 0.96).abs() < 1e-9);
        assert!((std_dev - 0.08).abs() < 1e-9);
        assert_eq!(mean_and_std_dev(&[]), (0.0, 0.0));
    }

    #[test]
    fn test_failure_percentage_ejects_failing_endpoint() {
        let mut set = endpoint_set(&["a", "b"]);
        record(&set, "a", 0, 20);
        record(&set, "b", 20, 0);

        let now = Instant::now();
        let outcome = run_interval(&mut set, &failure_percentage_config(50), now, &mut rng());

        assert_eq!(
            outcome.ejected,
            vec![("a".to_string(), Algorithm::FailurePercentage)]
        );
        assert!(set.get("a").unwrap().is_ejected());
        assert!(!set.get("b").unwrap().is_ejected());
        assert_eq!(set.get("a").unwrap().latest_ejection(), Some(now));
    }

    #[test]
    fn test_below_request_volume_is_ignored() {
        let mut set = endpoint_set(&["a", "b"]);
        record(&set, "a", 0, 9);
        record(&set, "b", 20, 0);

        let outcome = run_interval(&mut set, &failure_percentage_config(50), Instant::now(), &mut rng());
        assert!(outcome.ejected.is_empty());
    }

    #[test]
    fn test_too_few_hosts_does_nothing() {
        let mut set = endpoint_set(&["a", "b"]);
        record(&set, "a", 0, 20);

        let outcome = run_interval(&mut set, &failure_percentage_config(50), Instant::now(), &mut rng());
        assert!(outcome.ejected.is_empty());
    }

    #[test]
    fn test_success_rate_ejects_outlier() {
        let mut set = endpoint_set(&["a", "b", "c", "d", "e"]);
        for addr in ["a", "b", "c", "d"] {
            record(&set, addr, 100, 0);
        }
        record(&set, "e", 80, 20);

        let outcome = run_interval(&mut set, &success_rate_config(50), Instant::now(), &mut rng());
        assert_eq!(outcome.ejected, vec![("e".to_string(), Algorithm::SuccessRate)]);
        assert_eq!(set.ejected_count(), 1);
    }

    #[test]
    fn test_cap_allows_first_ejection_only() {
        let mut set = endpoint_set(&["a", "b", "c", "d", "e"]);
        record(&set, "a", 100, 0);
        record(&set, "b", 100, 0);
        for addr in ["c", "d", "e"] {
            record(&set, addr, 10, 90);
        }
        let mut config = success_rate_config(10);
        config.success_rate_ejection.as_mut().unwrap().stdev_factor = 100;

        let outcome = run_interval(&mut set, &config, Instant::now(), &mut rng());
        assert_eq!(outcome.ejected.len(), 1);
        assert_eq!(set.ejected_count(), 1);
    }

    #[test]
    fn test_zero_max_ejection_percent_never_ejects() {
        let mut set = endpoint_set(&["a", "b"]);
        record(&set, "a", 0, 20);
        record(&set, "b", 20, 0);

        let outcome = run_interval(&mut set, &failure_percentage_config(0), Instant::now(), &mut rng());
        assert!(outcome.ejected.is_empty());
    }

    #[test]
    fn test_zero_enforcement_never_ejects() {
        let mut set = endpoint_set(&["a", "b"]);
        record(&set, "a", 0, 20);
        record(&set, "b", 20, 0);
        let mut config = failure_percentage_config(50);
        config
            .failure_percentage_ejection
            .as_mut()
            .unwrap()
            .enforcement_percentage = 0;

        let outcome = run_interval(&mut set, &config, Instant::now(), &mut rng());
        assert!(outcome.ejected.is_empty());
    }

    #[test]
    fn test_both_algorithms_increment_multiplier_once() {
        let mut set = endpoint_set(&["a", "b", "c", "d", "e"]);
        for addr in ["a", "b", "c", "d"] {
            record(&set, addr, 100, 0);
        }
        record(&set, "e", 0, 100);
        let mut config = success_rate_config(50);
        config.failure_percentage_ejection = Some(FailurePercentageEjectionConfig {
            threshold: 50,
            enforcement_percentage: 100,
            minimum_hosts: 2,
            request_volume: 10,
        });

        let outcome = run_interval(&mut set, &config, Instant::now(), &mut rng());
        assert_eq!(outcome.ejected, vec![("e".to_string(), Algorithm::SuccessRate)]);
        assert_eq!(set.get("e").unwrap().ejection_time_multiplier(), 1);
    }

    #[test]
    fn test_expiry_and_multiplier_decay() {
        let mut set = endpoint_set(&["a", "b"]);
        let config = failure_percentage_config(50);
        let start = Instant::now();

        record(&set, "a", 0, 20);
        record(&set, "b", 20, 0);
        run_interval(&mut set, &config, start, &mut rng());
        assert!(set.get("a").unwrap().is_ejected());

        // Exactly at the deadline: still ejected.
        let outcome = run_interval(&mut set, &config, start + Duration::from_secs(10), &mut rng());
        assert!(outcome.unejected.is_empty());

        let later = start + Duration::from_secs(11);
        let outcome = run_interval(&mut set, &config, later, &mut rng());
        assert_eq!(outcome.unejected, vec!["a".to_string()]);
        assert_eq!(set.get("a").unwrap().ejection_time_multiplier(), 1);

        run_interval(&mut set, &config, later + Duration::from_secs(1), &mut rng());
        assert_eq!(set.get("a").unwrap().ejection_time_multiplier(), 0);
    }

    #[test]
    fn test_repeat_ejection_lasts_longer() {
        let mut set = endpoint_set(&["a", "b"]);
        let config = failure_percentage_config(50);
        let start = Instant::now();

        record(&set, "a", 0, 20);
        record(&set, "b", 20, 0);
        run_interval(&mut set, &config, start, &mut rng());
        run_interval(&mut set, &config, start + Duration::from_secs(11), &mut rng());
        assert!(!set.get("a").unwrap().is_ejected());

        // Fails again during the next interval, multiplier becomes 2.
        let second = start + Duration::from_secs(12);
        record(&set, "a", 0, 20);
        record(&set, "b", 20, 0);
        run_interval(&mut set, &config, second, &mut rng());
        assert_eq!(set.get("a").unwrap().ejection_time_multiplier(), 2);

        run_interval(&mut set, &config, second + Duration::from_secs(15), &mut rng());
        assert!(set.get("a").unwrap().is_ejected());
        run_interval(&mut set, &config, second + Duration::from_secs(21), &mut rng());
        assert!(!set.get("a").unwrap().is_ejected());
    }
}
