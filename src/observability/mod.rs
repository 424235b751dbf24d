//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! forward engine, plugin host, listeners
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (forward outcomes, pool occupancy)
//!
//! Consumers:
//!     → stdout (fmt layer, filtered by RUST_LOG or config)
//!     → Prometheus scrape endpoint (optional)
//! ```

pub mod logging;
pub mod metrics;
