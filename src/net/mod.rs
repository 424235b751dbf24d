//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! http_listen ip port backlog
//!     → listener.rs (socket2 bind + listen(backlog))
//!     → per worker: Listener::from_std (connection limit)
//!     → connection.rs (ConnectionId as client key, drain tracking)
//!     → hand off to the HTTP plugin worker
//! ```

pub mod connection;
pub mod listener;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{bind_listener, ConnectionPermit, Listener, ListenerError};
