//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) or service config (JSON)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, child policy lookup)
//!     → OutlierDetectionConfig (validated, immutable)
//!     → handed to OutlierDetectionBalancer::update_client_conn_state
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → new config sent over a channel to the simulator
//!     → simulator re-applies it to the balancer
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes are applied as a whole
//! - Every optional field has a default; only the child policy is required
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::ConfigError;
pub use schema::ChildPolicyConfig;
pub use schema::FailurePercentageEjectionConfig;
pub use schema::ObservabilityConfig;
pub use schema::OutlierDetectionConfig;
pub use schema::SimulatorConfig;
pub use schema::SuccessRateEjectionConfig;
