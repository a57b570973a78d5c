//! Outlier detection load balancing.
//!
//! A load balancing layer that sits between a channel and a child policy,
//! counts the result of every RPC per endpoint, and periodically ejects
//! endpoints whose success rate or failure percentage makes them outliers.
//! Ejected endpoints are reported to the child as TRANSIENT_FAILURE until
//! their back-off elapses.

// Core subsystems
pub mod config;
pub mod health;
pub mod load_balancer;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

// Simulated owning channel and traffic
pub mod simulation;

pub use config::{ConfigError, OutlierDetectionConfig, SimulatorConfig};
pub use lifecycle::Shutdown;
pub use load_balancer::{LbError, OutlierDetectionBalancer, Registry};
