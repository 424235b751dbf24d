//! Bucketed hash index over caller-owned nodes.
//!
//! # Data Flow
//! ```text
//! caller allocates node (NodeArena / any NodeStore)
//!     → insert(store, id)   prepend to bucket chain
//!     → find(store, key)    first equal node in chain order
//!     → delete(store, key)  unlink every equal node
//!     → caller frees the unlinked nodes
//! ```
//!
//! # Design Decisions
//! - The index stores only `NodeId`s; it never allocates or frees nodes
//! - Duplicate keys are allowed, newest shadows oldest on `find`
//! - Hashing and equality come from a `KeyStrategy`, so keys can be
//!   addresses, strings or integers

pub mod arena;

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

pub use arena::{HashNode, NodeArena, NodeStore};

/// Handle to a node in caller storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// Bucket selection and key comparison.
pub trait KeyStrategy<K: ?Sized> {
    /// Map `key` onto `0..bucket_count`.
    fn bucket(&self, key: &K, bucket_count: usize) -> usize;
    fn equals(&self, a: &K, b: &K) -> bool;
}

/// Strategy backed by a std `BuildHasher` and `Eq`.
#[derive(Debug, Clone, Default)]
pub struct HashedKeys<S = RandomState> {
    hasher: S,
}

impl<S> HashedKeys<S> {
    pub fn with_hasher(hasher: S) -> Self {
        Self { hasher }
    }
}

impl<K: Hash + Eq + ?Sized, S: BuildHasher> KeyStrategy<K> for HashedKeys<S> {
    fn bucket(&self, key: &K, bucket_count: usize) -> usize {
        (self.hasher.hash_one(key) % bucket_count as u64) as usize
    }

    fn equals(&self, a: &K, b: &K) -> bool {
        a == b
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("hash index needs at least one bucket")]
    ZeroBuckets,
    #[error("failed to allocate {0} hash buckets")]
    Allocation(usize),
}

/// Hash index with a fixed bucket count.
#[derive(Debug)]
pub struct HashIndex<S> {
    buckets: Box<[Option<NodeId>]>,
    len: usize,
    strategy: S,
}

impl<S> HashIndex<S> {
    pub fn new(bucket_count: usize, strategy: S) -> Result<Self, IndexError> {
        if bucket_count == 0 {
            return Err(IndexError::ZeroBuckets);
        }
        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(bucket_count)
            .map_err(|_| IndexError::Allocation(bucket_count))?;
        buckets.resize(bucket_count, None);

        Ok(Self {
            buckets: buckets.into_boxed_slice(),
            len: 0,
            strategy,
        })
    }

    /// Linked nodes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Link node `id` at the head of its bucket.
    pub fn insert<K, V>(&mut self, store: &mut impl NodeStore<K, V>, id: NodeId)
    where
        S: KeyStrategy<K>,
    {
        let bucket = self.bucket_of(&store.node(id).key);
        store.node_mut(id).next = self.buckets[bucket];
        self.buckets[bucket] = Some(id);
        self.len += 1;
    }

    /// The most recently inserted node whose key equals `key`.
    pub fn find<K, V>(&self, store: &impl NodeStore<K, V>, key: &K) -> Option<NodeId>
    where
        S: KeyStrategy<K>,
    {
        let mut cursor = self.buckets[self.bucket_of(key)];
        while let Some(id) = cursor {
            let node = store.node(id);
            if self.strategy.equals(&node.key, key) {
                return Some(id);
            }
            cursor = node.next;
        }
        None
    }

    /// Unlink every node whose key equals `key`. Returns how many were removed.
    pub fn delete<K, V>(&mut self, store: &mut impl NodeStore<K, V>, key: &K) -> usize
    where
        S: KeyStrategy<K>,
    {
        self.delete_with(store, key, |_| {})
    }

    /// Like [`delete`](Self::delete), reporting each unlinked node so the
    /// caller can free it.
    pub fn delete_with<K, V>(
        &mut self,
        store: &mut impl NodeStore<K, V>,
        key: &K,
        mut on_unlink: impl FnMut(NodeId),
    ) -> usize
    where
        S: KeyStrategy<K>,
    {
        let bucket = self.bucket_of(key);
        let mut removed = 0;
        let mut prev: Option<NodeId> = None;
        let mut cursor = self.buckets[bucket];

        while let Some(id) = cursor {
            let node = store.node(id);
            let next = node.next;
            if self.strategy.equals(&node.key, key) {
                match prev {
                    Some(p) => store.node_mut(p).next = next,
                    None => self.buckets[bucket] = next,
                }
                store.node_mut(id).next = None;
                on_unlink(id);
                removed += 1;
            } else {
                prev = Some(id);
            }
            cursor = next;
        }

        self.len -= removed;
        removed
    }

    /// Visit every linked node, bucket by bucket in chain order.
    pub fn for_each<K, V>(&self, store: &impl NodeStore<K, V>, mut visit: impl FnMut(NodeId, &K, &V)) {
        for head in self.buckets.iter() {
            let mut cursor = *head;
            while let Some(id) = cursor {
                let node = store.node(id);
                visit(id, &node.key, &node.value);
                cursor = node.next;
            }
        }
    }

    fn bucket_of<K>(&self, key: &K) -> usize
    where
        S: KeyStrategy<K>,
    {
        self.strategy.bucket(key, self.buckets.len()) % self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Forces every key into one chain.
    #[derive(Debug)]
    struct SingleBucket;

    impl KeyStrategy<u32> for SingleBucket {
        fn bucket(&self, _key: &u32, _bucket_count: usize) -> usize {
            0
        }
        fn equals(&self, a: &u32, b: &u32) -> bool {
            a == b
        }
    }

    #[test]
    fn find_returns_latest_insert() {
        let mut arena = NodeArena::new();
        let mut index = HashIndex::new(8, HashedKeys::<RandomState>::default()).unwrap();

        let first = arena.alloc("backend".to_string(), 1);
        let second = arena.alloc("backend".to_string(), 2);
        let other = arena.alloc("other".to_string(), 3);
        index.insert(&mut arena, first);
        index.insert(&mut arena, second);
        index.insert(&mut arena, other);

        let found = index.find(&arena, &"backend".to_string()).unwrap();
        assert_eq!(arena.node(found).value, 2);
        assert_eq!(index.len(), 3);
        assert!(index.find(&arena, &"missing".to_string()).is_none());
    }

    #[test]
    fn delete_removes_every_equal_key() {
        let mut arena = NodeArena::new();
        let mut index = HashIndex::new(1, SingleBucket).unwrap();

        for (key, value) in [(1u32, 'a'), (2, 'b'), (1, 'c'), (3, 'd'), (1, 'e')] {
            let id = arena.alloc(key, value);
            index.insert(&mut arena, id);
        }
        assert_eq!(index.len(), 5);

        let mut unlinked = Vec::new();
        let removed = index.delete_with(&mut arena, &1, |id| unlinked.push(id));
        assert_eq!(removed, 3);
        assert_eq!(index.len(), 2);
        assert!(index.find(&arena, &1).is_none());
        assert_eq!(arena.node(index.find(&arena, &2).unwrap()).value, 'b');
        assert_eq!(arena.node(index.find(&arena, &3).unwrap()).value, 'd');

        // Unlinked nodes are still owned by the caller until freed.
        assert_eq!(arena.len(), 5);
        for id in unlinked {
            assert_eq!(arena.free(id).map(|(k, _)| k), Some(1));
        }
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn count_tracks_inserts_minus_deletes() {
        let mut arena = NodeArena::new();
        let mut index = HashIndex::new(4, HashedKeys::<RandomState>::default()).unwrap();

        for key in 0u32..20 {
            let id = arena.alloc(key % 7, key);
            index.insert(&mut arena, id);
        }
        let removed = index.delete(&mut arena, &3) + index.delete(&mut arena, &5);
        assert_eq!(index.len(), 20 - removed);
        assert_eq!(index.delete(&mut arena, &3), 0);
    }

    #[test]
    fn for_each_visits_all_nodes() {
        let mut arena = NodeArena::new();
        let mut index = HashIndex::new(3, HashedKeys::<RandomState>::default()).unwrap();
        for key in 0u32..10 {
            let id = arena.alloc(key, key * 10);
            index.insert(&mut arena, id);
        }

        let mut seen = Vec::new();
        index.for_each(&arena, |_, key, value| seen.push((*key, *value)));
        seen.sort_unstable();
        assert_eq!(seen, (0..10).map(|k| (k, k * 10)).collect::<Vec<_>>());
    }

    #[test]
    fn zero_buckets_rejected() {
        assert_eq!(
            HashIndex::new(0, SingleBucket).unwrap_err(),
            IndexError::ZeroBuckets
        );
    }
}
