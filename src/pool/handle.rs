//! Exclusive or mutex-guarded access to a lookaside pool.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::pool::{LookasidePool, PoolError, PoolOptions, Slot};

/// A worker's view of a lookaside pool.
///
/// `Exclusive` is used when a single worker owns the pool and carries no
/// lock. `Shared` serializes acquire/release across workers; the lock is
/// never held while a slot is in use.
#[derive(Debug)]
pub enum PoolHandle<T> {
    Exclusive(LookasidePool<T>),
    Shared(Arc<Mutex<LookasidePool<T>>>),
}

impl<T: Default> PoolHandle<T> {
    /// Build a pool and wrap it according to `options.thread_safe`.
    pub fn new(capacity: usize, tag: u32, options: PoolOptions) -> Result<Self, PoolError> {
        let pool = LookasidePool::new(capacity, tag, options)?;
        if options.thread_safe {
            Ok(PoolHandle::Shared(Arc::new(Mutex::new(pool))))
        } else {
            Ok(PoolHandle::Exclusive(pool))
        }
    }

    pub fn acquire(&mut self) -> Result<Slot<T>, PoolError> {
        match self {
            PoolHandle::Exclusive(pool) => pool.acquire(),
            PoolHandle::Shared(pool) => lock(pool).acquire(),
        }
    }

    pub fn release(&mut self, slot: Slot<T>) -> Result<(), PoolError> {
        match self {
            PoolHandle::Exclusive(pool) => pool.release(slot),
            PoolHandle::Shared(pool) => lock(pool).release(slot),
        }
    }
}

impl<T> PoolHandle<T> {
    /// Another handle onto the same pool, if it is shareable.
    pub fn share(&self) -> Option<Self> {
        match self {
            PoolHandle::Exclusive(_) => None,
            PoolHandle::Shared(pool) => Some(PoolHandle::Shared(Arc::clone(pool))),
        }
    }

    pub fn in_use(&self) -> usize {
        self.inspect(LookasidePool::in_use)
    }

    pub fn capacity(&self) -> usize {
        self.inspect(LookasidePool::capacity)
    }

    pub fn is_free(&self, index: usize) -> bool {
        self.inspect(|pool| pool.is_free(index))
    }

    fn inspect<R>(&self, f: impl FnOnce(&LookasidePool<T>) -> R) -> R {
        match self {
            PoolHandle::Exclusive(pool) => f(pool),
            PoolHandle::Shared(pool) => f(&lock(pool)),
        }
    }
}

fn lock<T>(pool: &Mutex<LookasidePool<T>>) -> MutexGuard<'_, LookasidePool<T>> {
    // Acquire/release never leave the pool half-updated, so a poisoned
    // guard is still consistent.
    pool.lock().unwrap_or_else(PoisonError::into_inner)
}
