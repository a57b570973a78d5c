//! Outlier detection subsystem.
//!
//! # Data Flow
//! ```text
//! RPC completes (load_balancer/picker.rs):
//!     → counter.rs records success or failure in the active bucket
//!
//! Interval timer fires (load_balancer/outlier.rs):
//!     → ejection.rs swaps counters, runs the configured algorithms
//!     → state.rs ejects / un-ejects endpoints
//!     → endpoint.rs fans the change out to attached channel wrappers
//! ```
//!
//! # Design Decisions
//! - Detection is passive only: no probes, just observed RPC results
//! - Health state is per-address, shared by every channel to that address
//! - Ejection state survives resolver updates as long as the address stays

pub mod counter;
pub mod ejection;
pub mod endpoint;
pub mod state;

pub use counter::{BucketSnapshot, CallCounter};
pub use ejection::{Algorithm, IntervalOutcome};
pub use endpoint::EndpointRecord;
pub use state::EndpointSet;
