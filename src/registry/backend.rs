//! Backend descriptor.
//!
//! # Responsibilities
//! - Represent a single origin server
//! - Track in-flight forwards
//! - Carry the liveness flag consulted by selection policies
//! - Count passive failures (connect refused, broken exchanges)

use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Liveness state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Unknown = 0,
    Live = 1,
    Down = 2,
}

impl From<u8> for Liveness {
    fn from(val: u8) -> Self {
        match val {
            1 => Liveness::Live,
            2 => Liveness::Down,
            _ => Liveness::Unknown,
        }
    }
}

/// A single origin server.
#[derive(Debug)]
pub struct Backend {
    /// Address and port of the origin.
    pub addr: SocketAddr,
    /// Forwards currently using this backend.
    in_flight: AtomicUsize,
    /// Current liveness (see [`Liveness`]).
    state: AtomicU8,
    failures: AtomicU64,
    consecutive_failures: AtomicU64,
}

impl Backend {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            in_flight: AtomicUsize::new(0),
            state: AtomicU8::new(Liveness::Unknown as u8),
            failures: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
        }
    }

    /// Failed forwards attributed to this backend since startup.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let streak = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(backend = %self.addr, streak, "Backend failure recorded");
    }

    /// A completed exchange proves the backend live.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.set_liveness(Liveness::Live);
    }

    /// Number of forwards holding a guard on this backend.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Unknown counts as live: nothing has proven otherwise.
    pub fn is_live(&self) -> bool {
        self.liveness() != Liveness::Down
    }

    pub fn liveness(&self) -> Liveness {
        Liveness::from(self.state.load(Ordering::Relaxed))
    }

    pub fn set_liveness(&self, liveness: Liveness) {
        let prev = Liveness::from(self.state.swap(liveness as u8, Ordering::Relaxed));
        if prev != liveness {
            tracing::info!(backend = %self.addr, from = ?prev, to = ?liveness, "Backend liveness changed");
        }
    }

    /// Count a forward against this backend until the guard drops.
    pub fn track(self: &Arc<Self>) -> BackendGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        BackendGuard {
            backend: Arc::clone(self),
        }
    }
}

/// RAII guard for the in-flight counter.
#[derive(Debug)]
pub struct BackendGuard {
    backend: Arc<Backend>,
}

impl Deref for BackendGuard {
    type Target = Backend;
    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for BackendGuard {
    fn drop(&mut self) {
        self.backend.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
