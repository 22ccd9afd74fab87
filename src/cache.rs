//! Bounded interior-branch cache (spec §2 "Cache layer", §4.7 `fetchNode`).
//!
//! Branches decoded from the store are immutable until a transaction copies
//! them onto its own heap to mutate, so a single cache can be shared by every
//! concurrent reader and writer: a hit returns a cheap `Arc` clone instead of
//! re-running [`crate::encoding::decode_branch`].

use std::sync::Arc;

use quick_cache::sync::Cache;

use crate::node::Branch;
use crate::noderef::NodeRef;

/// Weighs a cached branch by its approximate resident size so the cache's
/// byte budget (`branch_node_cache_bytes`, spec §6) means what it says
/// instead of counting every entry as one unit.
#[derive(Clone)]
struct BranchWeighter;

impl quick_cache::Weighter<NodeRef, Arc<Branch>> for BranchWeighter {
    fn weight(&self, _key: &NodeRef, val: &Arc<Branch>) -> u64 {
        (64 + val.len() * 24) as u64
    }
}

/// Cache of store-resident branches, keyed by their [`NodeRef`]. Only store
/// references are ever inserted; heap references are transaction-local and
/// would be meaningless once the transaction disposes.
pub struct BranchCache {
    inner: Cache<NodeRef, Arc<Branch>, BranchWeighter>,
}

impl BranchCache {
    pub fn with_capacity_bytes(capacity_bytes: u64) -> Self {
        BranchCache {
            inner: Cache::with_weighter(
                // quick_cache's `estimated_items_capacity` only sizes the
                // hash table; eviction is driven by `weight_capacity` below.
                (capacity_bytes / 256).max(16) as usize,
                capacity_bytes,
                BranchWeighter,
            ),
        }
    }

    pub fn get(&self, r: NodeRef) -> Option<Arc<Branch>> {
        debug_assert!(r.is_store(), "only store refs are cacheable");
        self.inner.get(&r)
    }

    pub fn insert(&self, r: NodeRef, branch: Arc<Branch>) {
        debug_assert!(r.is_store(), "only store refs are cacheable");
        self.inner.insert(r, branch);
    }

    /// Drops the entry for `r`, used when a node is disposed (spec §4.7
    /// `disposeNode`) so a stale reference can never be served from cache.
    pub fn invalidate(&self, r: NodeRef) {
        self.inner.remove(&r);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}
