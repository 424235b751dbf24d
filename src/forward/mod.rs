//! Forward engine subsystem.
//!
//! # Data Flow
//! ```text
//! start_forward(request, client_key, callback)
//!     → Init                 acquire context from the pool, select backend
//!     → AwaitBackendConnect  non-blocking connect, wait for writability
//!     → SendHeader           resumable cursor over the request head
//!     → SendBody             resumable cursor over the request body
//!     → AwaitResponse        backend bytes → framing → client
//!     → Done | Failed        callback(status), release context
//! ```
//!
//! # Design Decisions
//! - The engine is sans-IO: it never waits. Every call does as much work as
//!   the sockets allow (`try_read`/`try_write`) and reports what to wait for
//! - `driver.rs` owns the waiting, mapping tokio readiness onto `IoEvent`s
//! - A `ForwardId` carries the pool slot generation, so events for a
//!   released context are recognised as stale and dropped

pub mod context;
pub mod driver;
pub mod engine;
pub mod transport;

use std::fmt;

pub use context::ForwardContext;
pub use driver::{forward, ForwardOutcome, SharedEngine};
pub use engine::ForwardEngine;
pub use transport::{BackendConnector, TcpConnector, Transport};

/// Phase of one forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardState {
    #[default]
    Init,
    AwaitBackendConnect,
    SendHeader,
    SendBody,
    AwaitResponse,
    Done,
    Failed,
}

impl ForwardState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ForwardState::Done | ForwardState::Failed)
    }
}

/// Terminal status handed to the completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardStatus {
    Success,
    /// Forward context pool exhausted.
    AllocationFailure,
    NoBackend,
    BackendUnreachable,
    IoError,
    ClientDisconnected,
    /// The client key already has a forward in flight.
    Busy,
}

impl ForwardStatus {
    /// Integer status code.
    pub fn code(self) -> i32 {
        match self {
            ForwardStatus::Success => 0,
            ForwardStatus::AllocationFailure => 1,
            ForwardStatus::NoBackend => 2,
            ForwardStatus::BackendUnreachable => 3,
            ForwardStatus::IoError => 4,
            ForwardStatus::ClientDisconnected => 5,
            ForwardStatus::Busy => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ForwardStatus::Success => "success",
            ForwardStatus::AllocationFailure => "allocation_failure",
            ForwardStatus::NoBackend => "no_backend",
            ForwardStatus::BackendUnreachable => "backend_unreachable",
            ForwardStatus::IoError => "io_error",
            ForwardStatus::ClientDisconnected => "client_disconnected",
            ForwardStatus::Busy => "busy",
        }
    }

    pub fn is_success(self) -> bool {
        self == ForwardStatus::Success
    }
}

impl fmt::Display for ForwardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Names one in-flight forward: pool slot index plus its generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForwardId {
    pub index: usize,
    pub generation: u32,
}

impl fmt::Display for ForwardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fwd-{}.{}", self.index, self.generation)
    }
}

/// Readiness notification delivered to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    BackendWritable,
    BackendReadable,
    ClientWritable,
    /// The client hung up or reset the connection.
    ClientClosed,
}

/// What a pending forward is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Wait {
    pub backend_read: bool,
    pub backend_write: bool,
    pub client_write: bool,
}

impl Wait {
    pub const BACKEND_WRITABLE: Wait = Wait {
        backend_read: false,
        backend_write: true,
        client_write: false,
    };

    pub fn backend_interest(self) -> Option<tokio::io::Interest> {
        use tokio::io::Interest;
        match (self.backend_read, self.backend_write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Result of driving the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Pending { id: ForwardId, wait: Wait },
    /// The callback has fired and the context is back in the pool.
    Finished { status: ForwardStatus, relayed: u64 },
    /// The id no longer names a live forward; nothing was touched.
    Stale,
}

/// Completion callback. Runs exactly once per started forward.
pub type Completion = Box<dyn FnOnce(ForwardStatus) + Send>;
