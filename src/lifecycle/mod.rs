//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     trigger() → every subscribed task leaves its loop
//!
//! Signals (signals.rs):
//!     SIGINT / Ctrl-C → trigger shutdown
//! ```
//!
//! # Design Decisions
//! - One broadcast channel per owner; subscribers are cheap
//! - Triggering twice is harmless

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
