//! In-process simulation of the channel that owns the balancer.
//!
//! # Data Flow
//! ```text
//! traffic.rs: pick via latest picker
//!     → complete the RPC as success or failure (per backend failure rate)
//!     → counters feed the ejection sweep
//!
//! controller.rs: SimulatedController
//!     → creates SimChannels on request of the balancer
//!     → records every published picker
//!     → lets tests and the simulator drive channel states by address
//! ```

pub mod controller;
pub mod traffic;

pub use controller::{SimChannel, SimulatedController};
pub use traffic::{TrafficGenerator, TrafficStats};
