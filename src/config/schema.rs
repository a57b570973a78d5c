//! Configuration schema definitions.
//!
//! This module defines the outlier detection configuration and the root
//! configuration of the simulator binary. All types derive Serde traits for
//! deserialization from TOML files or JSON service configs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the simulator.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SimulatorConfig {
    /// The outlier detection policy under test.
    pub outlier_detection: OutlierDetectionConfig,

    /// Simulated backends and traffic shape.
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Logging and metrics settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Outlier detection load balancing configuration.
///
/// Durations are signed milliseconds so that negative values survive parsing
/// and can be reported by validation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OutlierDetectionConfig {
    /// Time between ejection analysis sweeps.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: i64,

    /// Base time an endpoint stays ejected; multiplied per repeat ejection.
    #[serde(default = "default_base_ejection_time_ms")]
    pub base_ejection_time_ms: i64,

    /// Upper bound on the ejection time (never below the base time).
    #[serde(default = "default_max_ejection_time_ms")]
    pub max_ejection_time_ms: i64,

    /// Maximum percentage of endpoints that may be ejected at once.
    #[serde(default = "default_max_ejection_percent")]
    pub max_ejection_percent: u32,

    /// Success rate based ejection. Disabled when absent.
    #[serde(default)]
    pub success_rate_ejection: Option<SuccessRateEjectionConfig>,

    /// Failure percentage based ejection. Disabled when absent.
    #[serde(default)]
    pub failure_percentage_ejection: Option<FailurePercentageEjectionConfig>,

    /// The policy that actually picks endpoints.
    pub child_policy: ChildPolicyConfig,
}

impl OutlierDetectionConfig {
    /// A configuration with every default and the named child policy.
    pub fn new(child_policy: impl Into<String>) -> Self {
        Self {
            interval_ms: default_interval_ms(),
            base_ejection_time_ms: default_base_ejection_time_ms(),
            max_ejection_time_ms: default_max_ejection_time_ms(),
            max_ejection_percent: default_max_ejection_percent(),
            success_rate_ejection: None,
            failure_percentage_ejection: None,
            child_policy: ChildPolicyConfig::new(child_policy),
        }
    }

    pub fn interval(&self) -> Duration {
        millis(self.interval_ms)
    }

    pub fn base_ejection_time(&self) -> Duration {
        millis(self.base_ejection_time_ms)
    }

    pub fn max_ejection_time(&self) -> Duration {
        millis(self.max_ejection_time_ms)
    }

    /// True when neither ejection algorithm is enabled. The layer then only
    /// passes traffic through and never counts RPCs.
    pub fn is_noop(&self) -> bool {
        self.success_rate_ejection.is_none() && self.failure_percentage_ejection.is_none()
    }
}

fn millis(value: i64) -> Duration {
    Duration::from_millis(u64::try_from(value).unwrap_or(0))
}

fn default_interval_ms() -> i64 {
    10_000
}

fn default_base_ejection_time_ms() -> i64 {
    30_000
}

fn default_max_ejection_time_ms() -> i64 {
    300_000
}

fn default_max_ejection_percent() -> u32 {
    10
}

/// Success rate ejection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SuccessRateEjectionConfig {
    /// Standard deviation factor, in thousandths.
    pub stdev_factor: u32,

    /// Chance (percent) that a detected outlier is actually ejected.
    pub enforcement_percentage: u32,

    /// Minimum endpoints with enough volume before the algorithm runs.
    pub minimum_hosts: u32,

    /// Minimum requests in an interval for an endpoint to be considered.
    pub request_volume: u32,
}

impl Default for SuccessRateEjectionConfig {
    fn default() -> Self {
        Self {
            stdev_factor: 1900,
            enforcement_percentage: 100,
            minimum_hosts: 5,
            request_volume: 100,
        }
    }
}

/// Failure percentage ejection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FailurePercentageEjectionConfig {
    /// Failure percentage above which an endpoint is an outlier.
    pub threshold: u32,

    /// Chance (percent) that a detected outlier is actually ejected.
    pub enforcement_percentage: u32,

    /// Minimum endpoints with enough volume before the algorithm runs.
    pub minimum_hosts: u32,

    /// Minimum requests in an interval for an endpoint to be considered.
    pub request_volume: u32,
}

impl Default for FailurePercentageEjectionConfig {
    fn default() -> Self {
        Self {
            threshold: 85,
            enforcement_percentage: 0,
            minimum_hosts: 5,
            request_volume: 50,
        }
    }
}

/// Child policy selection.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChildPolicyConfig {
    /// Registered policy name (e.g. "round_robin").
    pub name: String,

    /// Opaque policy-specific configuration, forwarded as-is.
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

impl ChildPolicyConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: None,
        }
    }
}

/// Simulated backends and traffic.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Backends fed to the balancer as resolver addresses.
    pub backends: Vec<SimBackendConfig>,

    /// RPCs issued per second by the traffic generator.
    pub requests_per_second: u32,

    /// How often the endpoint report is printed, in milliseconds.
    pub report_interval_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            requests_per_second: 200,
            report_interval_ms: 1000,
        }
    }
}

/// One simulated backend.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SimBackendConfig {
    /// Backend address (e.g. "10.0.0.1:50051").
    pub address: String,

    /// Fraction of RPCs that fail, between 0.0 and 1.0.
    #[serde(default)]
    pub failure_rate: f64,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Pretty or JSON log lines.
    pub log_format: LogFormat,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
