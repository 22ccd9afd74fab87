//! Interior branch node (spec §3 "Branch", §4.1 "Branch operations").
//!
//! On disk a branch is a flat array of `5·children - 2` 64-bit words (spec
//! §3, §6); in memory we keep the same information as three parallel `Vec`s,
//! which is equivalent but lets every operation below be written as ordinary
//! safe slice surgery instead of raw word-offset arithmetic (see DESIGN.md).

use crate::key::Key;
use crate::noderef::NodeRef;

/// An interior node: `children.len()` child refs with per-child subtree byte
/// counts, separated by `children.len() - 1` keys. `keys[i]` is the key of
/// the leftmost leaf reachable through `children[i + 1]` (spec §3 invariant
/// "for all i > 0, key i is the key of the leftmost leaf of child i").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    children: Vec<NodeRef>,
    counts: Vec<u64>,
    keys: Vec<Key>,
}

/// Outcome of [`Branch::merge_or_redistribute`] (spec §4.5).
pub enum MergeOutcome {
    /// Status 1: right fully absorbed into left; right should be deleted.
    Merged,
    /// Status 2: some children moved across the seam; new separator key.
    Redistributed(Key),
    /// Status 3: nothing changed.
    Unchanged,
}

impl Branch {
    /// spec §4.1 `set(...)`: a blank branch with exactly two children.
    pub fn set(child1: NodeRef, cnt1: u64, key: Key, child2: NodeRef, cnt2: u64) -> Self {
        Branch {
            children: vec![child1, child2],
            counts: vec![cnt1, cnt2],
            keys: vec![key],
        }
    }

    /// `children` may legitimately be empty (a fresh split destination
    /// before `move_last_half_into` populates it); otherwise `keys.len() + 1
    /// == children.len()` must hold.
    pub fn from_parts(children: Vec<NodeRef>, counts: Vec<u64>, keys: Vec<Key>) -> Self {
        debug_assert_eq!(children.len(), counts.len());
        debug_assert!(children.is_empty() || keys.len() + 1 == children.len());
        Branch { children, counts, keys }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn child(&self, i: usize) -> NodeRef {
        self.children[i]
    }

    pub fn count(&self, i: usize) -> u64 {
        self.counts[i]
    }

    pub fn set_child(&mut self, i: usize, r: NodeRef) {
        self.children[i] = r;
    }

    pub fn set_count(&mut self, i: usize, c: u64) {
        self.counts[i] = c;
    }

    /// `keys[i]` for `i in 1..len()`; panics for `i == 0`.
    pub fn key(&self, i: usize) -> Key {
        self.keys[i - 1]
    }

    pub fn set_key(&mut self, i: usize, k: Key) {
        self.keys[i - 1] = k;
    }

    pub fn children(&self) -> &[NodeRef] {
        &self.children
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// Exact sum of leaf payload bytes reachable from this branch (spec §3
    /// invariant 1 / §8 property 1).
    pub fn subtree_bytes(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// spec §4.1 `searchFirst`: binary search returning the child index to
    /// descend for the *first* occurrence of `key`. A negative return
    /// (`-i as isize`) means position `i`'s key equals the query, so both
    /// `children[i-1]` and `children[i]` may hold matches.
    pub fn search_first(&self, key: &Key) -> isize {
        match self.keys.binary_search(key) {
            Ok(i) => -((i + 1) as isize),
            Err(i) => i as isize,
        }
    }

    /// spec §4.1 `searchLast`: rightmost matching index.
    pub fn search_last(&self, key: &Key) -> usize {
        let mut idx = match self.keys.binary_search(key) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        while idx + 1 < self.children.len() && idx > 0 && self.keys.get(idx) == Some(key) {
            idx += 1;
        }
        idx
    }

    /// spec §4.1 `childAtOffset`: locate the child whose byte range contains
    /// `offset`, returning `(child_index, left_byte_offset_of_that_child)`.
    /// On an exact boundary the key breaks the tie: go left when the
    /// boundary key compares strictly greater than the query key, else right.
    pub fn child_at_offset(&self, key: &Key, offset: u64) -> (usize, u64) {
        let mut left = 0u64;
        for i in 0..self.children.len() {
            let right = left + self.counts[i];
            if offset < right {
                return (i, left);
            }
            if offset == right && i + 1 < self.children.len() {
                let boundary_key = self.keys[i];
                if &boundary_key > key {
                    return (i, left);
                }
            }
            left = right;
        }
        (self.children.len() - 1, left - self.counts[self.children.len() - 1])
    }

    /// spec §4.1 `insert`: splice a pair of children with their separator in
    /// place of the single child at `at`.
    pub fn replace_with_pair(
        &mut self,
        at: usize,
        left: NodeRef,
        left_cnt: u64,
        mid_key: Key,
        right: NodeRef,
        right_cnt: u64,
    ) {
        self.children[at] = left;
        self.counts[at] = left_cnt;
        self.children.insert(at + 1, right);
        self.counts.insert(at + 1, right_cnt);
        self.keys.insert(at, mid_key);
    }

    /// spec §4.1 `removeChild`: drop child `i` and its adjacent key (the
    /// right key when `i == 0`, else the left key).
    pub fn remove_child(&mut self, i: usize) {
        self.children.remove(i);
        self.counts.remove(i);
        if i == 0 {
            if !self.keys.is_empty() {
                self.keys.remove(0);
            }
        } else {
            self.keys.remove(i - 1);
        }
    }

    /// spec §4.1 `moveLastHalfInto`: split a full branch, moving the upper
    /// half of children into `dest`. The midpoint key is consumed (removed
    /// from `self`) and returned for the caller to propagate upward.
    pub fn move_last_half_into(&mut self, dest: &mut Branch) -> Key {
        let n = self.children.len();
        let split_at = n / 2;
        let mid_key = self.keys[split_at - 1];

        dest.children = self.children.split_off(split_at);
        dest.counts = self.counts.split_off(split_at);
        dest.keys = self.keys.split_off(split_at);
        self.keys.pop(); // drop the consumed midpoint from the left half

        mid_key
    }

    /// spec §4.5 "Branches": fold `right` into `self` (status Merged), a
    /// partial redistribution (status Redistributed), or leave both alone
    /// (status Unchanged).
    pub fn merge_or_redistribute(
        &mut self,
        right: &mut Branch,
        mid_key: Key,
        max_branch: usize,
    ) -> MergeOutcome {
        let total = self.len() + right.len();
        if total <= max_branch {
            self.keys.push(mid_key);
            self.children.append(&mut right.children);
            self.counts.append(&mut right.counts);
            self.keys.append(&mut right.keys);
            return MergeOutcome::Merged;
        }

        let threshold = max_branch * 75 / 100;
        if self.len() < threshold {
            let deficit = threshold.saturating_sub(self.len());
            let movable = right.len().saturating_sub(1);
            let to_move = deficit.min(movable);
            if to_move >= 3 {
                self.keys.push(mid_key);
                for _ in 0..to_move {
                    self.children.push(right.children.remove(0));
                    self.counts.push(right.counts.remove(0));
                    if !right.keys.is_empty() {
                        self.keys.push(right.keys.remove(0));
                    }
                }
                let new_mid = self.keys.pop().expect("at least one key after move");
                return MergeOutcome::Redistributed(new_mid);
            }
        }
        MergeOutcome::Unchanged
    }

    pub fn is_underfull(&self, min_children: usize) -> bool {
        self.len() < min_children
    }
}
