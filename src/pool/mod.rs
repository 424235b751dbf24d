//! Lookaside pool subsystem.
//!
//! # Data Flow
//! ```text
//! Worker process start
//!     → LookasidePool::new(max_fds, tag, options)   (entries allocated once)
//!     → PoolHandle::Exclusive | PoolHandle::Shared  (thread_safe decides)
//!
//! Per request:
//!     acquire() → Slot<T> (moved out, owned by the forward engine)
//!     ... request lifetime, no lock held ...
//!     release(slot) → validated, pushed back on the free list
//! ```
//!
//! # Design Decisions
//! - Capacity is fixed at construction; exhaustion is an error, never growth
//! - Free list is LIFO so a just-released entry is the next one handed out
//! - A slot is a move-only value; tag/generation checks catch handles that
//!   crossed pool boundaries
//! - Without zero-on-acquire the previous value is recycled as-is, keeping
//!   buffer capacity warm

pub mod handle;
pub mod lookaside;

pub use handle::PoolHandle;
pub use lookaside::{LookasidePool, Slot};

/// Construction-time pool behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolOptions {
    /// Reset every acquired value to `T::default()`.
    pub zero_on_acquire: bool,
    /// Reject released slots carrying another pool's tag. Generations are
    /// checked either way.
    pub tag_check: bool,
    /// Guard acquire/release with a mutex so workers can share the pool.
    pub thread_safe: bool,
}

/// Errors raised by the lookaside pool.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    /// Backing storage for the entries could not be reserved.
    #[error("failed to allocate {capacity} pool entries of {object_size} bytes")]
    Allocation { capacity: usize, object_size: usize },

    /// Every entry is in use.
    #[error("pool exhausted ({capacity} entries in use)")]
    Exhausted { capacity: usize },

    /// A released slot does not belong to this pool or was already released.
    #[error("pool corruption on entry {index}: {reason}")]
    Corruption { index: usize, reason: &'static str },
}
