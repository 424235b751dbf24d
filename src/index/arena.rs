//! Caller-owned node storage for the hash index.

use crate::index::NodeId;

/// A node linked into a hash index bucket.
#[derive(Debug, Clone)]
pub struct HashNode<K, V> {
    pub key: K,
    pub value: V,
    pub(crate) next: Option<NodeId>,
}

impl<K, V> HashNode<K, V> {
    pub fn new(key: K, value: V) -> Self {
        Self {
            key,
            value,
            next: None,
        }
    }
}

/// Storage the index reads and relinks nodes through.
pub trait NodeStore<K, V> {
    fn node(&self, id: NodeId) -> &HashNode<K, V>;
    fn node_mut(&mut self, id: NodeId) -> &mut HashNode<K, V>;
}

/// Slab of hash nodes with its own free list.
#[derive(Debug)]
pub struct NodeArena<K, V> {
    slots: Vec<Option<HashNode<K, V>>>,
    free: Vec<usize>,
}

impl<K, V> NodeArena<K, V> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
        }
    }

    /// Store a new unlinked node.
    pub fn alloc(&mut self, key: K, value: V) -> NodeId {
        let node = HashNode::new(key, value);
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(node);
                NodeId(index)
            }
            None => {
                self.slots.push(Some(node));
                NodeId(self.slots.len() - 1)
            }
        }
    }

    /// Drop a node. It must already be unlinked from every index.
    pub fn free(&mut self, id: NodeId) -> Option<(K, V)> {
        let node = self.slots.get_mut(id.0)?.take()?;
        self.free.push(id.0);
        Some((node.key, node.value))
    }

    pub fn get(&self, id: NodeId) -> Option<&HashNode<K, V>> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    /// Nodes currently stored.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for NodeArena<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> NodeStore<K, V> for NodeArena<K, V> {
    fn node(&self, id: NodeId) -> &HashNode<K, V> {
        match self.slots.get(id.0) {
            Some(Some(node)) => node,
            _ => panic!("hash node {} is not allocated", id.0),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut HashNode<K, V> {
        match self.slots.get_mut(id.0) {
            Some(Some(node)) => node,
            _ => panic!("hash node {} is not allocated", id.0),
        }
    }
}
