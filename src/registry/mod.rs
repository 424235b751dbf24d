//! Backend registry subsystem.
//!
//! # Data Flow
//! ```text
//! http_backend <ip> <port>
//!     → BackendRegistry::add   (append, index by address)
//!
//! Forward engine Init
//!     → BackendRegistry::select
//!         → SelectionPolicy (round_robin.rs)
//!         → liveness predicate filters candidates
//!     → Arc<Backend> or NoBackend
//!
//! Plugin context teardown
//!     → remove_all (one backend at a time)
//! ```
//!
//! # Design Decisions
//! - Backends are kept in configuration order; the first configured
//!   backend is selected first
//! - The registry is built once and then only read; the round-robin
//!   cursor is the only shared mutable state and is atomic
//! - Duplicate addresses are allowed and act as weights

pub mod backend;
pub mod round_robin;

use std::collections::hash_map::RandomState;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::http::request::ProxyRequest;
use crate::index::{HashIndex, HashedKeys, NodeArena, NodeStore};

pub use backend::{Backend, BackendGuard, Liveness};
pub use round_robin::RoundRobin;

const INDEX_BUCKETS: usize = 64;

/// Picks the next backend out of the registry's list.
pub trait SelectionPolicy: Send + Sync + fmt::Debug {
    /// `None` when no candidate is live.
    fn next_backend(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no live backend configured")]
    NoBackend,
}

/// Ordered set of configured origin servers.
#[derive(Debug)]
pub struct BackendRegistry {
    backends: Vec<Arc<Backend>>,
    index: HashIndex<HashedKeys<RandomState>>,
    nodes: NodeArena<SocketAddr, Arc<Backend>>,
    policy: Box<dyn SelectionPolicy>,
}

impl BackendRegistry {
    /// Empty registry with round-robin selection.
    pub fn new() -> Self {
        Self::with_policy(Box::new(RoundRobin::new()))
    }

    pub fn with_policy(policy: Box<dyn SelectionPolicy>) -> Self {
        let index = match HashIndex::new(INDEX_BUCKETS, HashedKeys::default()) {
            Ok(index) => index,
            Err(e) => unreachable!("constant bucket count is non-zero: {e}"),
        };
        Self {
            backends: Vec::new(),
            index,
            nodes: NodeArena::new(),
            policy,
        }
    }

    /// Append a backend.
    pub fn add(&mut self, addr: SocketAddr) -> Arc<Backend> {
        let backend = Arc::new(Backend::new(addr));
        if self.find(&addr).is_some() {
            tracing::warn!(backend = %addr, "Backend configured more than once");
        }

        let node = self.nodes.alloc(addr, Arc::clone(&backend));
        self.index.insert(&mut self.nodes, node);
        self.backends.push(Arc::clone(&backend));

        tracing::debug!(backend = %addr, position = self.backends.len() - 1, "Backend registered");
        backend
    }

    /// Choose a backend for `request`.
    ///
    /// Round-robin ignores the request; hash-based policies can use it.
    pub fn select(&self, _request: &ProxyRequest) -> Result<Arc<Backend>, RegistryError> {
        self.policy.next_backend(&self.backends).ok_or_else(|| {
            tracing::debug!(backend_count = self.backends.len(), "No live backend");
            RegistryError::NoBackend
        })
    }

    /// Most recently added backend with this address.
    pub fn find(&self, addr: &SocketAddr) -> Option<Arc<Backend>> {
        self.index
            .find(&self.nodes, addr)
            .map(|id| Arc::clone(&self.nodes.node(id).value))
    }

    /// Drain every backend, one at a time. Returns how many were removed.
    pub fn remove_all(&mut self) -> usize {
        let mut removed = 0;
        while let Some(backend) = self.backends.pop() {
            let nodes = &mut self.nodes;
            let mut unlinked = Vec::new();
            self.index.delete_with(nodes, &backend.addr, |id| unlinked.push(id));
            for id in unlinked {
                nodes.free(id);
            }
            tracing::debug!(backend = %backend.addr, "Backend removed");
            removed += 1;
        }
        removed
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn select_rotates_in_configuration_order() {
        let mut registry = BackendRegistry::new();
        let a = addr("10.0.0.1:80");
        let b = addr("10.0.0.2:80");
        let c = addr("10.0.0.3:80");
        for x in [a, b, c] {
            registry.add(x);
        }

        let request = ProxyRequest::default();
        let picks: Vec<_> = (0..4).map(|_| registry.select(&request).unwrap().addr).collect();
        assert_eq!(picks, vec![a, b, c, a]);
    }

    #[test]
    fn n_selects_visit_each_backend_once() {
        let mut registry = BackendRegistry::new();
        for port in 9000..9007 {
            registry.add(addr(&format!("127.0.0.1:{port}")));
        }
        let request = ProxyRequest::default();

        // Advance the cursor off zero first.
        registry.select(&request).unwrap();
        let mut seen: Vec<_> = (0..7).map(|_| registry.select(&request).unwrap().addr.port()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (9000..9007).collect::<Vec<_>>());
    }

    #[test]
    fn empty_registry_has_no_backend() {
        let registry = BackendRegistry::new();
        let request = ProxyRequest::default();
        for _ in 0..3 {
            assert_eq!(registry.select(&request).unwrap_err(), RegistryError::NoBackend);
        }
    }

    #[test]
    fn find_and_remove_all() {
        let mut registry = BackendRegistry::new();
        let a = addr("10.0.0.1:80");
        let first = registry.add(a);
        let second = registry.add(a);
        registry.add(addr("10.0.0.2:80"));

        let found = registry.find(&a).unwrap();
        assert!(Arc::ptr_eq(&found, &second));
        assert!(!Arc::ptr_eq(&found, &first));

        assert_eq!(registry.remove_all(), 3);
        assert!(registry.is_empty());
        assert!(registry.find(&a).is_none());
        assert_eq!(
            registry.select(&ProxyRequest::default()).unwrap_err(),
            RegistryError::NoBackend
        );
    }
}
