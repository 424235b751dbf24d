//! Round-robin selection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::registry::{backend::Backend, SelectionPolicy};

/// Rotates through backends in registry order with a shared cursor.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionPolicy for RoundRobin {
    fn next_backend(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let len = backends.len();

        // Skip down backends, at most one full lap.
        for i in 0..len {
            let backend = &backends[(start.wrapping_add(i)) % len];
            if backend.is_live() {
                return Some(Arc::clone(backend));
            }
        }
        None
    }
}
