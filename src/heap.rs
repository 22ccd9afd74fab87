//! Per-transaction node heap (spec §2 "Node heap", §9 "Cyclic structures").
//!
//! The heap is the "arena+opaque-id" the design notes call for: an id-keyed
//! map from heap slot to mutable node, with explicit removal. Slots are
//! addressed from the rest of the tree via [`NodeRef::heap`].

use std::collections::HashMap;

use crate::node::{Branch, Leaf};
use crate::noderef::NodeRef;

/// A node owned by a transaction's heap. Sparse leaves never live here —
/// they are self-describing `NodeRef`s with no backing allocation.
#[derive(Debug, Clone)]
pub enum HeapNode {
    Branch(Branch),
    Leaf(Leaf),
}

impl HeapNode {
    /// Approximate resident size, used to decide when the heap exceeds its
    /// configured cap (spec §2 "size-bounded cache management").
    fn approx_bytes(&self) -> u64 {
        match self {
            HeapNode::Branch(b) => 64 + (b.len() as u64) * 24,
            HeapNode::Leaf(l) => 32 + l.size() as u64,
        }
    }

    pub fn as_branch(&self) -> Option<&Branch> {
        match self {
            HeapNode::Branch(b) => Some(b),
            HeapNode::Leaf(_) => None,
        }
    }

    pub fn as_branch_mut(&mut self) -> Option<&mut Branch> {
        match self {
            HeapNode::Branch(b) => Some(b),
            HeapNode::Leaf(_) => None,
        }
    }

    pub fn as_leaf(&self) -> Option<&Leaf> {
        match self {
            HeapNode::Leaf(l) => Some(l),
            HeapNode::Branch(_) => None,
        }
    }

    pub fn as_leaf_mut(&mut self) -> Option<&mut Leaf> {
        match self {
            HeapNode::Leaf(l) => Some(l),
            HeapNode::Branch(_) => None,
        }
    }
}

/// Per-transaction scratch arena for mutable nodes.
#[derive(Debug, Default)]
pub struct NodeHeap {
    next_slot: u64,
    nodes: HashMap<u64, HeapNode>,
    bytes_used: u64,
}

impl NodeHeap {
    pub fn new() -> Self {
        NodeHeap::default()
    }

    pub fn insert(&mut self, node: HeapNode) -> NodeRef {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.bytes_used += node.approx_bytes();
        self.nodes.insert(slot, node);
        NodeRef::heap(slot)
    }

    pub fn get(&self, r: NodeRef) -> Option<&HeapNode> {
        r.as_heap_slot().and_then(|s| self.nodes.get(&s))
    }

    pub fn get_mut(&mut self, r: NodeRef) -> Option<&mut HeapNode> {
        r.as_heap_slot().and_then(|s| self.nodes.get_mut(&s))
    }

    /// Replaces the node at `r`'s slot in place, updating the size tally.
    pub fn replace(&mut self, r: NodeRef, node: HeapNode) {
        if let Some(slot) = r.as_heap_slot() {
            self.bytes_used += node.approx_bytes();
            if let Some(old) = self.nodes.insert(slot, node) {
                self.bytes_used = self.bytes_used.saturating_sub(old.approx_bytes());
            }
        }
    }

    /// Unwinds (discards) a single heap node, e.g. when disposing an
    /// uncommitted transaction or unlinking a stale child after flush.
    pub fn remove(&mut self, r: NodeRef) -> Option<HeapNode> {
        let slot = r.as_heap_slot()?;
        let node = self.nodes.remove(&slot);
        if let Some(n) = &node {
            self.bytes_used = self.bytes_used.saturating_sub(n.approx_bytes());
        }
        node
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn bytes_used(&self) -> u64 {
        self.bytes_used
    }

    pub fn exceeds_cap(&self, cap_bytes: u64) -> bool {
        self.bytes_used > cap_bytes
    }

    /// All currently-live heap slots, for the write sequencer (spec §4.6).
    pub fn slots(&self) -> impl Iterator<Item = u64> + '_ {
        self.nodes.keys().copied()
    }

    pub fn drain(&mut self) -> std::collections::hash_map::IntoIter<u64, HeapNode> {
        let nodes = std::mem::take(&mut self.nodes);
        self.bytes_used = 0;
        nodes.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;

    #[test]
    fn insert_and_fetch_roundtrip() {
        let mut heap = NodeHeap::new();
        let r = heap.insert(HeapNode::Leaf(Leaf::new_owned(Key::new(0, 0, 1), vec![1, 2, 3])));
        assert!(r.is_heap());
        assert_eq!(heap.get(r).unwrap().as_leaf().unwrap().size(), 3);
    }

    #[test]
    fn remove_frees_the_slot_and_tracks_bytes() {
        let mut heap = NodeHeap::new();
        let r = heap.insert(HeapNode::Leaf(Leaf::new_owned(Key::new(0, 0, 1), vec![0; 100])));
        assert!(heap.bytes_used() >= 100);
        heap.remove(r);
        assert!(heap.get(r).is_none());
        assert_eq!(heap.bytes_used(), 0);
    }
}
