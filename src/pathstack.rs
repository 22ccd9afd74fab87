//! Path stack: descent, copy-on-write mutation, and rebalancing (spec §4.3,
//! §4.4, §4.5).
//!
//! The spec describes an explicit frame stack of `(childIndex,
//! leftByteOffset, nodeRef)`. We keep exactly that data shape as [`Frame`],
//! but drive it with the Rust call stack instead of a second, hand-rolled
//! one: each mutating operation builds the frame list top-down with
//! [`Cursor::setup_for_position`], then walks it bottom-up re-homing
//! copy-on-write nodes with [`Cursor::propagate`]. Recursion plays the role
//! the source's explicit stack replay does, without the frame-reuse
//! bookkeeping that only paid for itself in a language without stack
//! unwinding safety.

use std::sync::Arc;

use crate::cache::BranchCache;
use crate::config::Config;
use crate::encoding;
use crate::error::{TreeError, TreeResult};
use crate::heap::{HeapNode, NodeHeap};
use crate::key::Key;
use crate::node::branch::MergeOutcome;
use crate::node::{Branch, Leaf, SparseLeaf};
use crate::noderef::NodeRef;
use crate::store::Store;

/// One level of the path from root to leaf. `index` is the child of `node`
/// that was descended into to reach the next frame (meaningless on the
/// last, leaf frame). `left_offset` is `node`'s absolute byte offset within
/// the whole tree.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub node: NodeRef,
    pub index: usize,
    pub left_offset: u64,
}

enum Fetched {
    Branch(Branch),
    Leaf(Leaf),
    Sparse(SparseLeaf),
}

/// The result of a bottom-up structural change, threaded one level up the
/// frame stack at a time (spec §4.3 "insertLeaf ... walks up propagating").
enum Propagate {
    /// The child at `frame.index` is simply replaced (count may have
    /// changed, shape did not).
    Replace { child: NodeRef, count: u64 },
    /// The child at `frame.index` is split into two adjacent children.
    Split { left: NodeRef, left_count: u64, mid: Key, right: NodeRef, right_count: u64 },
    /// The child at `at` and its neighbor at `at + 1` are fully merged into
    /// one (`at` is always the lower of the two original indices).
    Merge { at: usize, merged: NodeRef, merged_count: u64 },
    /// The child at `at` and its neighbor at `at + 1` exchanged some of
    /// their own children; both survive under a new separator.
    Redistribute { at: usize, left: NodeRef, left_count: u64, mid: Key, right: NodeRef, right_count: u64 },
}

/// Borrowed view over everything a mutation needs to read or allocate nodes:
/// the transaction's private heap, the shared store and branch cache, and
/// the tree's tuning parameters.
pub struct Cursor<'t> {
    pub heap: &'t mut NodeHeap,
    pub store: &'t dyn Store,
    pub cache: &'t BranchCache,
    pub config: &'t Config,
}

impl<'t> Cursor<'t> {
    fn fetch(&mut self, r: NodeRef) -> TreeResult<Fetched> {
        if let Some((byte, len)) = r.as_sparse() {
            return Ok(Fetched::Sparse(SparseLeaf::new(Key::HEAD, byte, len)));
        }
        if let Some(node) = self.heap.get(r) {
            return Ok(match node.clone() {
                HeapNode::Branch(b) => Fetched::Branch(b),
                HeapNode::Leaf(l) => Fetched::Leaf(l),
            });
        }
        let area = r
            .as_store_area()
            .ok_or_else(|| TreeError::consistency("node reference is neither heap, sparse, nor store"))?;
        if let Some(cached) = self.cache.get(r) {
            return Ok(Fetched::Branch((*cached).clone()));
        }
        let bytes = self.store.read_area(area)?;
        let magic = u16::from_le_bytes(bytes.as_ref()[0..2].try_into().unwrap());
        if magic == encoding::BRANCH_MAGIC {
            let branch = encoding::decode_branch(bytes.as_ref())?;
            self.cache.insert(r, Arc::new(branch.clone()));
            Ok(Fetched::Branch(branch))
        } else {
            let decoded = encoding::decode_leaf_header(bytes.as_ref())?;
            let payload = bytes.as_ref()[decoded.payload_range].to_vec();
            Ok(Fetched::Leaf(Leaf::new_shared(Key::HEAD, anybytes::Bytes::from_source(payload))))
        }
    }

    fn fetch_branch(&mut self, r: NodeRef) -> TreeResult<Branch> {
        match self.fetch(r)? {
            Fetched::Branch(b) => Ok(b),
            _ => Err(TreeError::consistency("expected a branch node")),
        }
    }

    /// Materializes `r` as an owned, mutable [`Leaf`] tagged with `key` (the
    /// store/heap encoding does not carry the key on its own; the caller
    /// always knows it from the branch separators it descended through).
    fn fetch_leaf_for_key(&mut self, r: NodeRef, key: Key) -> TreeResult<Leaf> {
        match self.fetch(r)? {
            Fetched::Leaf(l) => Ok(Leaf::new_owned(key, l.as_bytes().to_vec())),
            Fetched::Sparse(s) => Ok(Leaf::new_owned(key, s.materialize().as_bytes().to_vec())),
            Fetched::Branch(_) => Err(TreeError::consistency("expected a leaf node")),
        }
    }

    fn install_branch(&mut self, branch: Branch) -> NodeRef {
        self.heap.insert(HeapNode::Branch(branch))
    }

    fn install_leaf(&mut self, leaf: Leaf) -> NodeRef {
        self.heap.insert(HeapNode::Leaf(leaf))
    }

    /// spec §4.3 `setupForPosition`: descend from `root`, choosing
    /// `childAtOffset` at each branch, until a leaf-like node is reached.
    /// `abs_pos` must already be within an existing key's byte range (see
    /// [`Cursor::locate_key`]).
    pub fn setup_for_position(&mut self, root: NodeRef, key: Key, abs_pos: u64) -> TreeResult<Vec<Frame>> {
        let mut frames = Vec::new();
        let mut node = root;
        let mut left_offset = 0u64;
        let mut relative = abs_pos;
        loop {
            match self.fetch(node)? {
                Fetched::Branch(branch) => {
                    let (idx, child_left) = branch.child_at_offset(&key, relative);
                    let child = branch.child(idx);
                    frames.push(Frame { node, index: idx, left_offset });
                    relative -= child_left;
                    left_offset += child_left;
                    node = child;
                }
                Fetched::Leaf(_) | Fetched::Sparse(_) => {
                    frames.push(Frame { node, index: 0, left_offset });
                    return Ok(frames);
                }
            }
        }
    }

    /// Locates `key`'s data without reading any leaf payload: returns
    /// `(start_offset, size, exists)`. Walks the branch separators exactly
    /// as the spec's key invariant promises (`key[i]` is the leftmost leaf
    /// key of child `i + 1`), tracking the inherited key label of the subtree
    /// currently under consideration so a query for a key that was never
    /// written is distinguished from one that was.
    pub fn locate_key(&mut self, root: NodeRef, key: Key) -> TreeResult<(u64, u32, bool)> {
        self.locate_key_rec(root, key, Key::HEAD, 0)
    }

    fn locate_key_rec(&mut self, node: NodeRef, key: Key, inherited_label: Key, offset_acc: u64) -> TreeResult<(u64, u32, bool)> {
        match self.fetch(node)? {
            Fetched::Leaf(l) => Ok((offset_acc, if inherited_label == key { l.size() } else { 0 }, inherited_label == key)),
            Fetched::Sparse(s) => Ok((offset_acc, if inherited_label == key { s.size() } else { 0 }, inherited_label == key)),
            Fetched::Branch(b) => {
                let raw = b.search_first(&key);
                if raw < 0 {
                    let first_idx = (-raw) as usize;
                    let last_idx = b.search_last(&key);
                    let mut left = offset_acc;
                    for i in 0..first_idx {
                        left += b.count(i);
                    }
                    let mut total = 0u64;
                    for i in first_idx..=last_idx {
                        total += b.count(i);
                    }
                    Ok((left, total as u32, true))
                } else {
                    let idx = (raw as usize).min(b.len() - 1);
                    let mut left = offset_acc;
                    for i in 0..idx {
                        left += b.count(i);
                    }
                    let label = if idx > 0 { b.key(idx) } else { inherited_label };
                    self.locate_key_rec(b.child(idx), key, label, left)
                }
            }
        }
    }

    /// spec §4.2/§4.3 `get`.
    pub fn get(&mut self, root: NodeRef, key: Key, pos: u32, buf: &mut [u8]) -> TreeResult<()> {
        let (start, size, exists) = self.locate_key(root, key)?;
        if !exists || pos as u64 + buf.len() as u64 > size as u64 {
            return Err(TreeError::out_of_bounds(key, pos as u64, size as u64));
        }
        if buf.is_empty() {
            return Ok(());
        }
        let frames = self.setup_for_position(root, key, start + pos as u64)?;
        let leaf_frame = *frames.last().expect("non-empty");
        let local_pos = (start + pos as u64 - leaf_frame.left_offset) as u32;
        match self.fetch(leaf_frame.node)? {
            Fetched::Leaf(l) => l.get(local_pos, buf),
            Fetched::Sparse(s) => s.get(local_pos, buf),
            Fetched::Branch(_) => Err(TreeError::consistency("descended into a branch at leaf depth")),
        }
    }

    /// Checks `branch` (whose own frame has already been popped off `frames`,
    /// so `frames.last()` is its parent, if any) for overflow or underfill
    /// and produces the [`Propagate`] to apply one level up. Every level of
    /// a mutation goes through this same check — the level where a child was
    /// directly spliced in or removed, and every level above it that
    /// `propagate` visits afterward.
    fn finish_level(&mut self, frames: &[Frame], mut branch: Branch) -> TreeResult<Propagate> {
        if branch.len() > self.config.max_branch as usize {
            let mut right = Branch::from_parts(vec![], vec![], vec![]);
            let mid = branch.move_last_half_into(&mut right);
            let left_count = branch.subtree_bytes();
            let right_count = right.subtree_bytes();
            let left_ref = self.install_branch(branch);
            let right_ref = self.install_branch(right);
            return Ok(Propagate::Split { left: left_ref, left_count, mid, right: right_ref, right_count });
        }

        if branch.is_underfull(self.config.min_branch()) {
            if let Some(parent_frame) = frames.last().copied() {
                let parent = self.fetch_branch(parent_frame.node)?;
                if parent.len() > 1 {
                    return self.rebalance_with_sibling(branch, &parent, parent_frame.index);
                }
            }
        }

        let count = branch.subtree_bytes();
        let child = self.install_branch(branch);
        Ok(Propagate::Replace { child, count })
    }

    /// spec §4.3 `insertLeaf`: splices `new_leaf` next to the leaf named by
    /// `frames`'s last entry, before or after it, propagating structural
    /// changes to the root.
    fn insert_leaf(&mut self, mut frames: Vec<Frame>, new_leaf: Leaf, before: bool) -> TreeResult<NodeRef> {
        frames.pop().expect("setup_for_position always yields a leaf frame");
        let parent_frame = frames.pop().expect("tree always has a root branch above any leaf");
        let mut parent = self.fetch_branch(parent_frame.node)?;

        let existing_ref = parent.child(parent_frame.index);
        let existing_count = parent.count(parent_frame.index);
        let new_count = new_leaf.size() as u64;
        let new_key = new_leaf.key();
        let new_ref = self.install_leaf(new_leaf);

        if before {
            parent.replace_with_pair(parent_frame.index, new_ref, new_count, new_key, existing_ref, existing_count);
        } else {
            parent.replace_with_pair(parent_frame.index, existing_ref, existing_count, new_key, new_ref, new_count);
        }

        let prop = self.finish_level(&frames, parent)?;
        self.propagate(frames, prop)
    }

    /// Applies `prop` (produced for `frames.last()`) and walks the remaining
    /// frames up to the root, handling further splits or rebalancing at
    /// each level, finally returning the new root reference.
    fn propagate(&mut self, mut frames: Vec<Frame>, mut prop: Propagate) -> TreeResult<NodeRef> {
        while let Some(frame) = frames.pop() {
            let mut branch = self.fetch_branch(frame.node)?;
            match prop {
                Propagate::Replace { child, count } => {
                    branch.set_child(frame.index, child);
                    branch.set_count(frame.index, count);
                }
                Propagate::Split { left, left_count, mid, right, right_count } => {
                    branch.replace_with_pair(frame.index, left, left_count, mid, right, right_count);
                }
                Propagate::Merge { at, merged, merged_count } => {
                    branch.set_child(at, merged);
                    branch.set_count(at, merged_count);
                    branch.remove_child(at + 1);
                }
                Propagate::Redistribute { at, left, left_count, mid, right, right_count } => {
                    branch.set_child(at, left);
                    branch.set_count(at, left_count);
                    branch.set_key(at + 1, mid);
                    branch.set_child(at + 1, right);
                    branch.set_count(at + 1, right_count);
                }
            }

            if frames.is_empty() {
                // `branch` is now the root: overflow still splits (the new
                // root grows a level), but underfill is never rebalanced —
                // there is no sibling above the root.
                if branch.len() > self.config.max_branch as usize {
                    prop = self.finish_level(&frames, branch)?;
                    continue;
                }
                let child = self.install_branch(branch);
                return Ok(child);
            }

            prop = self.finish_level(&frames, branch)?;
        }

        match prop {
            Propagate::Replace { child, .. } => Ok(child),
            Propagate::Split { left, left_count, mid, right, right_count } => {
                Ok(self.install_branch(Branch::set(left, left_count, mid, right, right_count)))
            }
            Propagate::Merge { merged, .. } => Ok(merged),
            Propagate::Redistribute { .. } => Err(TreeError::consistency("root cannot redistribute with a sibling")),
        }
    }

    /// Tries to merge or redistribute `branch` (found at `parent.child(my_index)`)
    /// with its right sibling, falling back to its left sibling (spec §4.3
    /// "prefers right, falls back to left"). Callers only reach this with
    /// `parent.len() > 1`, so one of the two sibling arms always applies.
    fn rebalance_with_sibling(
        &mut self,
        mut branch: Branch,
        parent: &Branch,
        my_index: usize,
    ) -> TreeResult<Propagate> {
        let max_branch = self.config.max_branch as usize;
        if my_index + 1 < parent.len() {
            let sib_ref = parent.child(my_index + 1);
            let mut sibling = self.fetch_branch(sib_ref)?;
            let mid_key = parent.key(my_index + 1);
            return Ok(match branch.merge_or_redistribute(&mut sibling, mid_key, max_branch) {
                MergeOutcome::Merged => {
                    let merged_count = branch.subtree_bytes();
                    let merged = self.install_branch(branch);
                    Propagate::Merge { at: my_index, merged, merged_count }
                }
                MergeOutcome::Redistributed(new_mid) => {
                    let left_count = branch.subtree_bytes();
                    let right_count = sibling.subtree_bytes();
                    let left = self.install_branch(branch);
                    let right = self.install_branch(sibling);
                    Propagate::Redistribute { at: my_index, left, left_count, mid: new_mid, right, right_count }
                }
                MergeOutcome::Unchanged => {
                    let count = branch.subtree_bytes();
                    let child = self.install_branch(branch);
                    Propagate::Replace { child, count }
                }
            });
        }
        debug_assert!(my_index > 0, "parent.len() > 1 guarantees a left or right sibling exists");
        let sib_ref = parent.child(my_index - 1);
        let mut sibling = self.fetch_branch(sib_ref)?;
        let mid_key = parent.key(my_index);
        Ok(match sibling.merge_or_redistribute(&mut branch, mid_key, max_branch) {
            MergeOutcome::Merged => {
                let merged_count = sibling.subtree_bytes();
                let merged = self.install_branch(sibling);
                Propagate::Merge { at: my_index - 1, merged, merged_count }
            }
            MergeOutcome::Redistributed(new_mid) => {
                let left_count = sibling.subtree_bytes();
                let right_count = branch.subtree_bytes();
                let left = self.install_branch(sibling);
                let right = self.install_branch(branch);
                Propagate::Redistribute { at: my_index - 1, left, left_count, mid: new_mid, right, right_count }
            }
            MergeOutcome::Unchanged => {
                let count = branch.subtree_bytes();
                let child = self.install_branch(branch);
                Propagate::Replace { child, count }
            }
        })
    }

    /// Collapses a root branch that has shrunk to a single child, repeatedly,
    /// until it has ≥ 2 children or is leaf-like (spec §4.4 step 3).
    pub fn collapse_root(&mut self, mut root: NodeRef) -> TreeResult<NodeRef> {
        loop {
            match self.fetch(root)? {
                Fetched::Branch(b) if b.len() == 1 => root = b.child(0),
                _ => return Ok(root),
            }
        }
    }

    /// spec §4.3 `put`: write `data` at `pos` within `key`'s file, creating
    /// the key's leaf chain if this is the first write and growing it if
    /// `pos + data.len()` reaches past the current size.
    pub fn put(&mut self, root: NodeRef, key: Key, pos: u32, data: &[u8]) -> TreeResult<NodeRef> {
        if data.is_empty() {
            return Ok(root);
        }
        let (_, current_size, _) = self.locate_key(root, key)?;
        let required_end = pos
            .checked_add(data.len() as u32)
            .ok_or_else(|| TreeError::consistency("put length overflow"))?;

        let mut root = root;
        if required_end > current_size {
            root = self.grow_key(root, key, current_size, required_end - current_size)?;
        }

        let mut remaining = data;
        let mut write_pos = pos;
        while !remaining.is_empty() {
            let (start, _, _) = self.locate_key(root, key)?;
            let mut frames = self.setup_for_position(root, key, start + write_pos as u64)?;
            let leaf_frame = frames.pop().expect("setup_for_position always yields a leaf frame");
            let mut leaf = self.fetch_leaf_for_key(leaf_frame.node, key)?;
            let local_pos = (start + write_pos as u64 - leaf_frame.left_offset) as u32;
            let room_in_leaf = leaf.size().saturating_sub(local_pos).max(1) as usize;
            let chunk = room_in_leaf.min(remaining.len());
            leaf.put(local_pos, &remaining[..chunk], self.config.max_leaf)?;
            let count = leaf.size() as u64;
            let child = self.install_leaf(leaf);
            root = self.propagate(frames, Propagate::Replace { child, count })?;
            remaining = &remaining[chunk..];
            write_pos += chunk as u32;
        }
        Ok(root)
    }

    /// Extends `key`'s data by `extra` bytes of zero fill at its current
    /// end (spec §4.3 `expandLeaf`/`addSpaceAfter`). When the key has no
    /// data yet, seeds a single leaf (or chain of leaves, for an extension
    /// larger than one leaf's capacity) at the sorted insertion point.
    fn grow_key(&mut self, root: NodeRef, key: Key, current_size: u32, extra: u32) -> TreeResult<NodeRef> {
        let mut root = root;
        let mut remaining = extra;

        if current_size == 0 {
            let (start, _, _) = self.locate_key(root, key)?;
            let frames = self.setup_for_position(root, key, start)?;
            let first_chunk = remaining.min(self.config.max_leaf);
            let leaf = Leaf::new_owned(key, vec![0u8; first_chunk as usize]);
            root = self.insert_leaf(frames, leaf, false)?;
            remaining -= first_chunk;
        }

        while remaining > 0 {
            let (start, size, _) = self.locate_key(root, key)?;
            let mut frames = self.setup_for_position(root, key, start + size as u64 - 1)?;
            let last_frame = frames.last().copied().unwrap();
            let leaf = self.fetch_leaf_for_key(last_frame.node, key)?;
            let room = self.config.max_leaf.saturating_sub(leaf.size());
            if room > 0 {
                let add = room.min(remaining);
                let mut leaf = leaf;
                let new_size = leaf.size() + add;
                leaf.set_size(new_size, self.config.max_leaf)?;
                let count = leaf.size() as u64;
                let child = self.install_leaf(leaf);
                frames.pop();
                root = self.propagate(frames, Propagate::Replace { child, count })?;
                remaining -= add;
            } else {
                let chunk = remaining.min(self.config.max_leaf);
                let new_leaf = Leaf::new_owned(key, vec![0u8; chunk as usize]);
                root = self.insert_leaf(frames, new_leaf, false)?;
                remaining -= chunk;
            }
        }
        Ok(root)
    }

    /// spec §4.3 `trimAtPosition`/`shiftData`'s shrink case: drops bytes
    /// from the tail of `key`'s chain until its size reaches `new_size`.
    /// Returns the new root along with every store-resident leaf ref that
    /// was unlinked entirely, for the caller to record against the version
    /// that will eventually dispose them (spec §4.7 `disposeNode`).
    pub fn shrink_key(&mut self, root: NodeRef, key: Key, new_size: u32) -> TreeResult<(NodeRef, Vec<NodeRef>)> {
        let mut root = root;
        let mut unlinked = Vec::new();
        loop {
            let (start, size, exists) = self.locate_key(root, key)?;
            if !exists || size <= new_size {
                return Ok((root, unlinked));
            }
            let mut frames = self.setup_for_position(root, key, start + size as u64 - 1)?;
            let frame = frames.last().copied().unwrap();
            let mut leaf = self.fetch_leaf_for_key(frame.node, key)?;
            let local_size = leaf.size();
            let drop_from_this_leaf = (size - new_size).min(local_size);
            if drop_from_this_leaf == local_size {
                let (new_root, removed) = self.delete_leaf_at(root, key, frame.left_offset)?;
                root = new_root;
                if let Some(r) = removed {
                    unlinked.push(r);
                }
            } else {
                leaf.set_size(local_size - drop_from_this_leaf, self.config.max_leaf)?;
                let count = leaf.size() as u64;
                let child = self.install_leaf(leaf);
                frames.pop();
                root = self.propagate(frames, Propagate::Replace { child, count })?;
            }
        }
    }

    /// spec §4.3 `deleteLeaf`: removes the leaf at absolute offset
    /// `leaf_left_offset` entirely, rebalancing its parent chain. Returns
    /// the new root and, if the removed child was store-resident, its ref.
    fn delete_leaf_at(&mut self, root: NodeRef, key: Key, leaf_left_offset: u64) -> TreeResult<(NodeRef, Option<NodeRef>)> {
        let mut frames = self.setup_for_position(root, key, leaf_left_offset)?;
        frames.pop().expect("setup_for_position always yields a leaf frame");
        let parent_frame = frames.pop().expect("tree always has a root branch above any leaf");
        let mut parent = self.fetch_branch(parent_frame.node)?;
        let removed_ref = parent.child(parent_frame.index);
        parent.remove_child(parent_frame.index);
        let prop = self.finish_level(&frames, parent)?;
        let new_root = self.propagate(frames, prop)?;
        let new_root = self.collapse_root(new_root)?;
        let removed = removed_ref.is_store().then_some(removed_ref);
        Ok((new_root, removed))
    }

    /// Deletes every leaf carrying `key` (spec §4.4's single-key special
    /// case of `removeAbsoluteBounds`).
    pub fn delete_key(&mut self, root: NodeRef, key: Key) -> TreeResult<(NodeRef, Vec<NodeRef>)> {
        self.shrink_key(root, key, 0)
    }

    /// The key label of the leaf covering absolute byte `offset`, descending
    /// purely by offset rather than by key comparison. Ties at an exact
    /// child boundary always resolve to the child on the right (passing
    /// `Key::TAIL` to `child_at_offset`'s tie-break), i.e. byte `offset`
    /// belongs to the key whose data starts there, not the one that ends
    /// there (spec §4.9 `keyAtPosition`).
    fn locate_label_at_offset(&mut self, node: NodeRef, offset: u64, inherited_label: Key) -> TreeResult<Key> {
        match self.fetch(node)? {
            Fetched::Leaf(_) | Fetched::Sparse(_) => Ok(inherited_label),
            Fetched::Branch(b) => {
                let (idx, child_left) = b.child_at_offset(&Key::TAIL, offset);
                let label = if idx > 0 { b.key(idx) } else { inherited_label };
                self.locate_label_at_offset(b.child(idx), offset - child_left, label)
            }
        }
    }

    pub fn key_at_offset(&mut self, root: NodeRef, offset: u64) -> TreeResult<Key> {
        self.locate_label_at_offset(root, offset, Key::HEAD)
    }

    /// Enumerates `key`'s leaf chain as `(ref, size)` pairs in byte order,
    /// without materializing any payload. Returns `None` if any leaf in the
    /// chain is still heap-resident — the zero-copy path of
    /// `DataFile::copy_from` only links leaves the store already owns (spec
    /// §4.8 "leaf-linking fast path").
    pub fn store_leaf_chain(&mut self, root: NodeRef, key: Key) -> TreeResult<Option<Vec<(NodeRef, u32)>>> {
        let (start, size, exists) = self.locate_key(root, key)?;
        if !exists || size == 0 {
            return Ok(Some(Vec::new()));
        }
        let mut chain = Vec::new();
        let mut pos = start;
        let end = start + size as u64;
        while pos < end {
            let frames = self.setup_for_position(root, key, pos)?;
            let frame = *frames.last().expect("non-empty");
            if !(frame.node.is_store() || frame.node.is_sparse()) {
                return Ok(None);
            }
            let leaf_size = match self.fetch(frame.node)? {
                Fetched::Leaf(l) => l.size(),
                Fetched::Sparse(s) => s.size(),
                Fetched::Branch(_) => return Err(TreeError::consistency("descended into a branch at leaf depth")),
            };
            chain.push((frame.node, leaf_size));
            pos = frame.left_offset + leaf_size as u64;
        }
        Ok(Some(chain))
    }

    /// Inserts a pre-existing leaf reference (already store-resident or
    /// sparse, already accounted for by the caller) instead of allocating
    /// one from owned bytes — the splicing primitive behind
    /// `splice_leaf_chain`. Mirrors `insert_leaf`, parameterized on the ref
    /// and count directly rather than a freshly built [`Leaf`].
    fn insert_leaf_ref(&mut self, mut frames: Vec<Frame>, leaf_ref: NodeRef, count: u64, key: Key, before: bool) -> TreeResult<NodeRef> {
        frames.pop().expect("setup_for_position always yields a leaf frame");
        let parent_frame = frames.pop().expect("tree always has a root branch above any leaf");
        let mut parent = self.fetch_branch(parent_frame.node)?;

        let existing_ref = parent.child(parent_frame.index);
        let existing_count = parent.count(parent_frame.index);

        if before {
            parent.replace_with_pair(parent_frame.index, leaf_ref, count, key, existing_ref, existing_count);
        } else {
            parent.replace_with_pair(parent_frame.index, existing_ref, existing_count, key, leaf_ref, count);
        }

        let prop = self.finish_level(&frames, parent)?;
        self.propagate(frames, prop)
    }

    /// Splices `chain` in as the entirety of `key`'s data. Used only when
    /// `key` currently has none: splicing into the middle of existing data
    /// would additionally need target-leaf splitting at the boundary, which
    /// this engine does not implement, so `DataFile::copy_from` only takes
    /// this path for a whole-file copy into a fresh key (spec §4.8).
    pub fn splice_leaf_chain(&mut self, root: NodeRef, key: Key, chain: &[(NodeRef, u32)]) -> TreeResult<NodeRef> {
        let mut root = root;
        let mut first = true;
        for &(leaf_ref, size) in chain {
            if size == 0 {
                continue;
            }
            let (start, current_size, _) = self.locate_key(root, key)?;
            let frames = if first {
                self.setup_for_position(root, key, start)?
            } else {
                self.setup_for_position(root, key, start + current_size as u64 - 1)?
            };
            root = self.insert_leaf_ref(frames, leaf_ref, size as u64, key, false)?;
            first = false;
        }
        Ok(root)
    }
}
