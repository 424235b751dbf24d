//! Fixed-capacity slab of reusable objects.
//!
//! # Responsibilities
//! - Allocate every entry once, up front
//! - Hand out entries in O(1) through an index-linked free list
//! - Detect foreign and double releases

use std::mem;

use crate::pool::{PoolError, PoolOptions};

/// Marks the end of the free list.
const FREE_LIST_END: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Free { next: usize },
    InUse,
}

#[derive(Debug)]
struct Entry<T> {
    state: EntryState,
    generation: u32,
    /// `None` while the value is lent out through a `Slot`.
    value: Option<T>,
}

/// An acquired pool entry.
///
/// Owns the object until it is handed back with [`LookasidePool::release`].
#[derive(Debug)]
pub struct Slot<T> {
    index: usize,
    generation: u32,
    tag: u32,
    value: T,
}

impl<T> Slot<T> {
    /// Rebuild a slot from raw parts, e.g. a handle that crossed an FFI
    /// boundary. The pool validates it on release.
    pub fn from_raw_parts(index: usize, generation: u32, tag: u32, value: T) -> Self {
        Self {
            index,
            generation,
            tag,
            value,
        }
    }

    /// Index of the backing entry.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Generation of the backing entry at acquisition.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Tag of the pool that handed this slot out.
    pub fn tag(&self) -> u32 {
        self.tag
    }
}

impl<T> std::ops::Deref for Slot<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> std::ops::DerefMut for Slot<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

/// Lookaside list of `T` with a fixed number of entries.
#[derive(Debug)]
pub struct LookasidePool<T> {
    entries: Box<[Entry<T>]>,
    head_free: usize,
    in_use: usize,
    tag: u32,
    options: PoolOptions,
}

impl<T: Default> LookasidePool<T> {
    /// Allocate `capacity` entries tagged with `tag`.
    pub fn new(capacity: usize, tag: u32, options: PoolOptions) -> Result<Self, PoolError> {
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(capacity)
            .map_err(|_| PoolError::Allocation {
                capacity,
                object_size: mem::size_of::<T>(),
            })?;

        for i in 0..capacity {
            let next = if i + 1 == capacity { FREE_LIST_END } else { i + 1 };
            entries.push(Entry {
                state: EntryState::Free { next },
                generation: 0,
                value: Some(T::default()),
            });
        }

        tracing::debug!(
            capacity,
            object_size = mem::size_of::<T>(),
            tag,
            ?options,
            "Lookaside pool initialized"
        );

        Ok(Self {
            entries: entries.into_boxed_slice(),
            head_free: if capacity == 0 { FREE_LIST_END } else { 0 },
            in_use: 0,
            tag,
            options,
        })
    }

    /// Take a free entry.
    pub fn acquire(&mut self) -> Result<Slot<T>, PoolError> {
        if self.head_free == FREE_LIST_END {
            return Err(PoolError::Exhausted {
                capacity: self.entries.len(),
            });
        }

        let index = self.head_free;
        let entry = &mut self.entries[index];
        let EntryState::Free { next } = entry.state else {
            // The free list only ever links free entries.
            return Err(PoolError::Corruption {
                index,
                reason: "free list points at an entry in use",
            });
        };

        let mut value = entry.value.take().unwrap_or_default();
        if self.options.zero_on_acquire {
            value = T::default();
        }

        entry.state = EntryState::InUse;
        self.head_free = next;
        self.in_use += 1;

        Ok(Slot {
            index,
            generation: entry.generation,
            tag: self.tag,
            value,
        })
    }

    /// Return an entry to the free list.
    ///
    /// On corruption the slot is dropped and its entry stays out of circulation.
    pub fn release(&mut self, slot: Slot<T>) -> Result<(), PoolError> {
        let index = slot.index;
        if let Err(reason) = self.validate(&slot) {
            tracing::error!(
                index,
                tag = slot.tag,
                expected_tag = self.tag,
                generation = slot.generation,
                reason,
                "Lookaside pool corruption detected on release"
            );
            return Err(PoolError::Corruption { index, reason });
        }

        let entry = &mut self.entries[index];
        entry.value = Some(slot.value);
        entry.generation = entry.generation.wrapping_add(1);
        entry.state = EntryState::Free {
            next: self.head_free,
        };
        self.head_free = index;
        self.in_use -= 1;
        Ok(())
    }

    fn validate(&self, slot: &Slot<T>) -> Result<(), &'static str> {
        let Some(entry) = self.entries.get(slot.index) else {
            return Err("index out of range");
        };
        if self.options.tag_check && slot.tag != self.tag {
            return Err("tag mismatch");
        }
        // Freeing a re-acquired entry would hand it out twice.
        if entry.state == EntryState::InUse && slot.generation != entry.generation {
            return Err("stale generation");
        }
        if entry.state != EntryState::InUse {
            return Err("entry already free");
        }
        Ok(())
    }
}

impl<T> LookasidePool<T> {
    /// Total number of entries.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Entries currently lent out.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Entries ready to be acquired.
    pub fn available(&self) -> usize {
        self.entries.len() - self.in_use
    }

    /// Whether the entry at `index` is on the free list.
    pub fn is_free(&self, index: usize) -> bool {
        matches!(
            self.entries.get(index).map(|e| e.state),
            Some(EntryState::Free { .. })
        )
    }

    /// Pool validation tag.
    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn options(&self) -> PoolOptions {
        self.options
    }
}
