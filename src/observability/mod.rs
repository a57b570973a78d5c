//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Coordinator and ejection sweep produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (ejection counters, ejected-endpoint gauge)
//!
//! Consumers:
//!     → stdout (pretty or JSON lines)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Metric updates are fire-and-forget; without an installed recorder
//!   they are no-ops, so library users pay nothing
//! - Log level comes from RUST_LOG first, then the config file

pub mod logging;
pub mod metrics;
