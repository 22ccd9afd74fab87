//! Flush planning (spec §4.6 "TreeWriteSequence"): turns a transaction's
//! dirty node-heap subtree into store-resident nodes.
//!
//! Every heap child of a branch is flushed before the branch itself is
//! encoded, so a branch's word array only ever needs concrete, already
//! -allocated child references — no node is ever written with a forward
//! reference that later needs patching. `Store::write_area` stays reserved
//! for the leaf refcount patch in [`crate::treesystem`].

use std::collections::HashMap;

use crate::encoding;
use crate::error::TreeResult;
use crate::heap::{HeapNode, NodeHeap};
use crate::noderef::NodeRef;
use crate::store::Store;

/// Flushes every heap-resident node reachable from `root` into `store`,
/// returning the equivalent store reference. Already-store-resident and
/// sparse references are left untouched. `resolved` memoizes heap refs
/// already flushed during this walk, so a node reachable through more than
/// one path in the dirty subtree is written exactly once.
pub fn flush_dirty_subtree(heap: &mut NodeHeap, store: &dyn Store, root: NodeRef) -> TreeResult<NodeRef> {
    let mut resolved = HashMap::new();
    flush_rec(heap, store, root, &mut resolved)
}

fn flush_rec(
    heap: &mut NodeHeap,
    store: &dyn Store,
    r: NodeRef,
    resolved: &mut HashMap<NodeRef, NodeRef>,
) -> TreeResult<NodeRef> {
    if !r.is_heap() {
        return Ok(r);
    }
    if let Some(done) = resolved.get(&r) {
        return Ok(*done);
    }
    let node = heap
        .remove(r)
        .expect("a reachable heap ref always names a live heap node");
    let store_ref = match node {
        HeapNode::Leaf(leaf) => {
            let bytes = encoding::encode_leaf(1, leaf.as_bytes());
            let area = store.create_area(&bytes)?;
            NodeRef::store_area(area)
        }
        HeapNode::Branch(mut branch) => {
            for i in 0..branch.len() {
                let resolved_child = flush_rec(heap, store, branch.child(i), resolved)?;
                branch.set_child(i, resolved_child);
            }
            let bytes = encoding::encode_branch(&branch);
            let area = store.create_area(&bytes)?;
            NodeRef::store_area(area)
        }
    };
    resolved.insert(r, store_ref);
    Ok(store_ref)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;
    use crate::node::{Branch, Leaf};
    use crate::store::MemoryStore;

    #[test]
    fn flushes_a_two_leaf_branch_bottom_up() {
        let mut heap = NodeHeap::new();
        let left = heap.insert(HeapNode::Leaf(Leaf::new_owned(Key::HEAD, vec![1, 1, 1, 1])));
        let right = heap.insert(HeapNode::Leaf(Leaf::new_owned(Key::TAIL, vec![1, 1, 1, 1])));
        let branch = Branch::set(left, 4, Key::TAIL, right, 4);
        let root = heap.insert(HeapNode::Branch(branch));

        let store = MemoryStore::new();
        let flushed = flush_dirty_subtree(&mut heap, &store, root).unwrap();
        assert!(flushed.is_store());
        assert!(heap.is_empty(), "every flushed node is removed from the heap");
        assert_eq!(store.area_count(), 3);
    }

    #[test]
    fn leaves_already_store_resident_untouched() {
        let mut heap = NodeHeap::new();
        let store = MemoryStore::new();
        let existing = store.create_area(&encoding::encode_leaf(1, b"x")).unwrap();
        let r = NodeRef::store_area(existing);
        let flushed = flush_dirty_subtree(&mut heap, &store, r).unwrap();
        assert_eq!(flushed, r);
        assert_eq!(store.area_count(), 1);
    }
}
