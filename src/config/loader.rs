//! Configuration loading from disk and from service-config JSON.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::{OutlierDetectionConfig, SimulatorConfig};
use crate::config::validation::{validate_config, validate_lb_config, ValidationError};
use crate::load_balancer::Registry;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate the simulator configuration from a TOML file.
pub fn load_config(path: &Path, registry: &Registry) -> Result<SimulatorConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content, registry)
}

/// Parse and validate the simulator configuration from TOML text.
pub fn parse_config(content: &str, registry: &Registry) -> Result<SimulatorConfig, ConfigError> {
    let config: SimulatorConfig = toml::from_str(content)?;
    validate_config(&config, registry).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Parse and validate a single outlier detection config in JSON form.
pub fn parse_lb_config(
    json: &str,
    registry: &Registry,
) -> Result<OutlierDetectionConfig, ConfigError> {
    let config: OutlierDetectionConfig = serde_json::from_str(json)?;
    validate_lb_config(&config, registry).map_err(ConfigError::Validation)?;
    Ok(config)
}
