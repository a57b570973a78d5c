//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Endpoint ejected (health/ejection.rs):
//!     → multiplier incremented
//!     → backoff.rs computes how long the ejection lasts
//!     → each interval sweep checks whether the ejection expired
//! ```
//!
//! # Design Decisions
//! - Repeat offenders stay out longer (linear in the multiplier)
//! - The ejection time is always capped, so no endpoint is lost forever
//! - The multiplier decays by one per clean interval

pub mod backoff;
