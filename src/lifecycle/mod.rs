//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs → plugin host):
//!     Load config → Parse directives → Configure plugins → Start workers
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain connections → Join workers
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
