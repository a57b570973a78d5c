//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Reject negative durations and percentages above 100
//! - Check that the child policy is registered
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function of the config and the registry
//! - Runs before config is accepted into the system

use thiserror::Error;

use crate::config::schema::{OutlierDetectionConfig, SimulationConfig, SimulatorConfig};
use crate::load_balancer::Registry;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("{field} = {value_ms}ms; must be >= 0")]
    NegativeDuration { field: &'static str, value_ms: i64 },

    #[error("{field} = {value}; must be <= 100")]
    PercentageOutOfRange { field: &'static str, value: u32 },

    #[error("{field} must be >= 1")]
    ZeroRequestVolume { field: &'static str },

    #[error("child policy {0:?} not registered")]
    UnknownChildPolicy(String),

    #[error("backend {address}: failure_rate = {value}; must be within [0, 1]")]
    InvalidFailureRate { address: String, value: f64 },

    #[error("simulation.requests_per_second must be >= 1")]
    ZeroRequestRate,
}

/// Validate an outlier detection configuration.
pub fn validate_lb_config(
    config: &OutlierDetectionConfig,
    registry: &Registry,
) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for (field, value_ms) in [
        ("interval_ms", config.interval_ms),
        ("base_ejection_time_ms", config.base_ejection_time_ms),
        ("max_ejection_time_ms", config.max_ejection_time_ms),
    ] {
        if value_ms < 0 {
            errors.push(ValidationError::NegativeDuration { field, value_ms });
        }
    }

    check_percentage(&mut errors, "max_ejection_percent", config.max_ejection_percent);

    if let Some(sre) = &config.success_rate_ejection {
        check_percentage(
            &mut errors,
            "success_rate_ejection.enforcement_percentage",
            sre.enforcement_percentage,
        );
        if sre.request_volume == 0 {
            errors.push(ValidationError::ZeroRequestVolume {
                field: "success_rate_ejection.request_volume",
            });
        }
    }

    if let Some(fpe) = &config.failure_percentage_ejection {
        check_percentage(&mut errors, "failure_percentage_ejection.threshold", fpe.threshold);
        check_percentage(
            &mut errors,
            "failure_percentage_ejection.enforcement_percentage",
            fpe.enforcement_percentage,
        );
        if fpe.request_volume == 0 {
            errors.push(ValidationError::ZeroRequestVolume {
                field: "failure_percentage_ejection.request_volume",
            });
        }
    }

    if !registry.contains(&config.child_policy.name) {
        errors.push(ValidationError::UnknownChildPolicy(
            config.child_policy.name.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate the full simulator configuration.
pub fn validate_config(
    config: &SimulatorConfig,
    registry: &Registry,
) -> Result<(), Vec<ValidationError>> {
    let mut errors = match validate_lb_config(&config.outlier_detection, registry) {
        Ok(()) => Vec::new(),
        Err(errors) => errors,
    };
    validate_simulation(&config.simulation, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_simulation(simulation: &SimulationConfig, errors: &mut Vec<ValidationError>) {
    if simulation.requests_per_second == 0 {
        errors.push(ValidationError::ZeroRequestRate);
    }
    for backend in &simulation.backends {
        if !(0.0..=1.0).contains(&backend.failure_rate) {
            errors.push(ValidationError::InvalidFailureRate {
                address: backend.address.clone(),
                value: backend.failure_rate,
            });
        }
    }
}

fn check_percentage(errors: &mut Vec<ValidationError>, field: &'static str, value: u32) {
    if value > 100 {
        errors.push(ValidationError::PercentageOutOfRange { field, value });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{
        FailurePercentageEjectionConfig, SimBackendConfig, SuccessRateEjectionConfig,
    };

    fn registry() -> Registry {
        Registry::with_defaults()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = OutlierDetectionConfig::new("round_robin");
        assert!(validate_lb_config(&config, &registry()).is_ok());
    }

    #[test]
    fn test_negative_durations_rejected() {
        let mut config = OutlierDetectionConfig::new("round_robin");
        config.interval_ms = -1;
        config.max_ejection_time_ms = -10;
        let errors = validate_lb_config(&config, &registry()).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors[0],
            ValidationError::NegativeDuration {
                field: "interval_ms",
                value_ms: -1
            }
        );
        assert!(errors[1].to_string().contains("max_ejection_time_ms"));
    }

    #[test]
    fn test_percentages_rejected_above_100() {
        let mut config = OutlierDetectionConfig::new("round_robin");
        config.max_ejection_percent = 101;
        config.success_rate_ejection = Some(SuccessRateEjectionConfig {
            enforcement_percentage: 150,
            ..Default::default()
        });
        config.failure_percentage_ejection = Some(FailurePercentageEjectionConfig {
            threshold: 200,
            enforcement_percentage: 101,
            ..Default::default()
        });
        let errors = validate_lb_config(&config, &registry()).unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors
            .iter()
            .all(|e| matches!(e, ValidationError::PercentageOutOfRange { .. })));
    }

    #[test]
    fn test_boundary_percentages_accepted() {
        let mut config = OutlierDetectionConfig::new("round_robin");
        config.max_ejection_percent = 100;
        config.failure_percentage_ejection = Some(FailurePercentageEjectionConfig {
            threshold: 100,
            enforcement_percentage: 100,
            ..Default::default()
        });
        assert!(validate_lb_config(&config, &registry()).is_ok());
    }

    #[test]
    fn test_zero_request_volume_rejected() {
        let mut config = OutlierDetectionConfig::new("round_robin");
        config.success_rate_ejection = Some(SuccessRateEjectionConfig {
            request_volume: 0,
            ..Default::default()
        });
        let errors = validate_lb_config(&config, &registry()).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::ZeroRequestVolume {
                field: "success_rate_ejection.request_volume"
            }]
        );
    }

    #[test]
    fn test_unknown_child_rejected() {
        let config = OutlierDetectionConfig::new("weighted_target");
        let errors = validate_lb_config(&config, &registry()).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::UnknownChildPolicy("weighted_target".into())]
        );
    }

    #[test]
    fn test_simulation_checks() {
        let mut config = SimulatorConfig {
            outlier_detection: OutlierDetectionConfig::new("round_robin"),
            simulation: Default::default(),
            observability: Default::default(),
        };
        config.simulation.requests_per_second = 0;
        config.simulation.backends.push(SimBackendConfig {
            address: "10.0.0.1:80".into(),
            failure_rate: 1.5,
        });
        let errors = validate_config(&config, &registry()).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0], ValidationError::ZeroRequestRate);
    }
}
