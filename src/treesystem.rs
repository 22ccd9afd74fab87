//! The engine's owning object (spec §4.7 "TreeSystem operations", §5
//! "Global mutable state").
//!
//! `TreeSystem` owns the store, the shared branch cache, the version list,
//! and the two process-wide locks the spec calls for: a commit lock
//! serializing publish, and a latched critical-stop flag that, once set by
//! an I/O or consistency failure, fails every later call with the same
//! wrapped error (spec §7, §9 "exception-as-control-flow").

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::Span;

use crate::cache::BranchCache;
use crate::config::Config;
use crate::encoding;
use crate::error::{TreeError, TreeResult};
use crate::node::{Branch, Leaf};
use crate::noderef::NodeRef;
use crate::store::Store;
use crate::transaction::Transaction;
use crate::version::VersionList;
use crate::writeseq::flush_dirty_subtree;

/// Owns one tree's store, cache, and version history. Cheap to share via
/// `&TreeSystem` across threads creating independent transactions; `commit`
/// internally serializes on `commit_lock`.
pub struct TreeSystem<S: Store> {
    id: u64,
    store: S,
    config: Config,
    cache: BranchCache,
    versions: VersionList,
    commit_lock: Mutex<()>,
    refcount_lock: Mutex<()>,
    critical_stop: Mutex<Option<Arc<TreeError>>>,
    span: Span,
}

/// Capability a [`crate::datafile::DataFile`] uses to decide whether its
/// copy source is a peer of the same engine eligible for the zero-copy
/// leaf-linking path, and to perform the link itself without needing the
/// concrete `S: Store` type parameter at the call site (spec §9 "dynamic
/// dispatch": the fast path is reached only through a capability opaque to
/// the core, never a downcast on `TreeSystem<S>` itself).
pub trait LeafLinker {
    fn tree_system_id(&self) -> u64;
    fn link_leaf(&self, r: NodeRef) -> TreeResult<bool>;
}

impl<S: Store> LeafLinker for TreeSystem<S> {
    fn tree_system_id(&self) -> u64 {
        self.id
    }

    fn link_leaf(&self, r: NodeRef) -> TreeResult<bool> {
        TreeSystem::link_leaf(self, r)
    }
}

impl<S: Store> TreeSystem<S> {
    /// spec §3 "Tree": opens a fresh tree whose root is a branch of two
    /// sentinel leaves, `HEAD_KEY` and `TAIL_KEY`, each seeded with
    /// `{1,1,1,1}`.
    pub fn open(store: S, config: Config) -> TreeResult<Self> {
        config.validate()?;
        let id = next_tree_system_id();
        let span = tracing::info_span!("tree_system", id);
        let _enter = span.enter();

        let head = Leaf::new_owned(crate::key::Key::HEAD, vec![1, 1, 1, 1]);
        let tail = Leaf::new_owned(crate::key::Key::TAIL, vec![1, 1, 1, 1]);
        let head_area = store.create_area(&encoding::encode_leaf(1, head.as_bytes()))?;
        let tail_area = store.create_area(&encoding::encode_leaf(1, tail.as_bytes()))?;
        let branch = Branch::set(NodeRef::store_area(head_area), 4, crate::key::Key::TAIL, NodeRef::store_area(tail_area), 4);
        let root_area = store.create_area(&encoding::encode_branch(&branch))?;
        let root = NodeRef::store_area(root_area);

        drop(_enter);
        Ok(TreeSystem {
            id,
            store,
            cache: BranchCache::with_capacity_bytes(config.branch_node_cache_bytes),
            config,
            versions: VersionList::new(root),
            commit_lock: Mutex::new(()),
            refcount_lock: Mutex::new(()),
            critical_stop: Mutex::new(None),
            span,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The backing store this system was opened over, for callers that need
    /// to observe its allocation footprint directly (e.g. confirming a
    /// zero-copy `copyFrom` didn't duplicate payload areas).
    pub fn store(&self) -> &S {
        &self.store
    }

    fn check_critical_stop(&self) -> TreeResult<()> {
        if let Some(latched) = self.critical_stop.lock().clone() {
            return Err(TreeError::CriticalStop(latched));
        }
        Ok(())
    }

    /// Latches `err` into the critical-stop state if it is the kind of
    /// failure that should (I/O, consistency violation), logging once, and
    /// returns it unchanged either way.
    fn observe(&self, err: TreeError) -> TreeError {
        if err.latches_critical_stop() {
            let mut latched = self.critical_stop.lock();
            if latched.is_none() {
                tracing::error!(parent: &self.span, error = %err, "critical stop latched");
                *latched = Some(Arc::new(err.clone()));
            }
        }
        err
    }

    /// spec §4.7 `createTransaction`: snapshots the latest version,
    /// incrementing its lock count.
    pub fn create_transaction(&self, read_only: bool) -> TreeResult<Transaction<'_>> {
        self.check_critical_stop()?;
        let version = self.versions.acquire_latest();
        tracing::debug!(parent: &self.span, version_id = version.version_id, read_only, "transaction created");
        Ok(Transaction::new(&self.store, &self.cache, &self.config, version.version_id, self.id, version.root, read_only))
    }

    /// spec §4.7 `commit`: rejects a transaction whose base version is no
    /// longer the latest, flushes its dirty subtree, and publishes a new
    /// version under the commit lock.
    pub fn commit(&self, mut txn: Transaction<'_>) -> TreeResult<u64> {
        self.check_critical_stop()?;
        let _commit_guard = self.commit_lock.lock();

        let base = txn.base_version_id();
        let latest = self.versions.latest_version_id();
        if base != latest {
            tracing::warn!(parent: &self.span, base, latest, "commit rejected: non-sequential version");
            self.versions.release(base);
            return Err(TreeError::NonSequentialVersion { expected: base, found: latest });
        }

        let dirty_nodes = txn.heap().len();
        let new_root = flush_dirty_subtree(txn.heap_mut(), &self.store, txn.root()).map_err(|e| self.observe(e))?;

        self.store.lock_for_write().map_err(|e| self.observe(e.into()))?;
        let deleted = txn.deleted_leaves().to_vec();
        let record_bytes = encoding::encode_version_record(latest + 1, new_root, &deleted);
        let record_result = self.store.create_area(&record_bytes);
        self.store.unlock_for_write().map_err(|e| self.observe(e.into()))?;
        record_result.map_err(|e| self.observe(e.into()))?;

        let new_version_id = latest + 1;
        self.versions.append(new_version_id, new_root, deleted.clone());
        tracing::info!(
            parent: &self.span,
            old_version = base,
            new_version = new_version_id,
            dirty_nodes,
            deleted_leaves = deleted.len(),
            "commit succeeded"
        );

        self.reclaim(self.versions.release(base))?;
        Ok(new_version_id)
    }

    /// spec §4.7 `dispose`: releases the transaction's version lock. Since
    /// this engine only flushes a transaction's heap at commit (no
    /// heap-cap-triggered partial auto-flush), an uncommitted transaction
    /// never allocates store areas to roll back — dropping its heap is
    /// enough.
    pub fn dispose(&self, txn: Transaction<'_>) -> TreeResult<()> {
        tracing::debug!(parent: &self.span, version_id = txn.base_version_id(), "transaction disposed");
        let reclaimable = self.versions.release(txn.base_version_id());
        self.reclaim(reclaimable)
    }

    fn reclaim(&self, leaves: Vec<NodeRef>) -> TreeResult<()> {
        if !leaves.is_empty() {
            tracing::warn!(parent: &self.span, count = leaves.len(), "reclaiming version, disposing deleted leaves");
        }
        for leaf in leaves {
            self.dispose_node(leaf).map_err(|e| self.observe(e))?;
        }
        Ok(())
    }

    /// spec §4.7 `linkLeaf`: atomically increments a store-resident leaf's
    /// refcount under the refcount lock; `false` if it would overflow.
    /// Special/sparse/heap refs are no-ops (never refcounted).
    pub fn link_leaf(&self, r: NodeRef) -> TreeResult<bool> {
        let Some(area) = r.as_store_area() else { return Ok(true) };
        let _guard = self.refcount_lock.lock();
        let bytes = self.store.read_area(area)?;
        let decoded = encoding::decode_leaf_header(bytes.as_ref())?;
        if decoded.ref_count == u32::MAX {
            return Ok(false);
        }
        let mut owned = bytes.as_ref().to_vec();
        encoding::patch_leaf_ref_count(&mut owned, decoded.ref_count + 1)?;
        self.store.write_area(area, &owned)?;
        Ok(true)
    }

    /// spec §4.7 `disposeNode`: unconditionally deletes a branch; decrements
    /// a leaf's refcount, deleting only at zero. Sparse refs are no-ops.
    pub fn dispose_node(&self, r: NodeRef) -> TreeResult<()> {
        let Some(area) = r.as_store_area() else { return Ok(()) };
        let bytes = self.store.read_area(area)?;
        let magic = u16::from_le_bytes(bytes.as_ref()[0..2].try_into().unwrap());
        if magic == encoding::BRANCH_MAGIC {
            self.store.delete_area(area)?;
            self.cache.invalidate(r);
            return Ok(());
        }
        let _guard = self.refcount_lock.lock();
        let decoded = encoding::decode_leaf_header(bytes.as_ref())?;
        if decoded.ref_count <= 1 {
            self.store.delete_area(area)?;
        } else {
            let mut owned = bytes.as_ref().to_vec();
            encoding::patch_leaf_ref_count(&mut owned, decoded.ref_count - 1)?;
            self.store.write_area(area, &owned)?;
        }
        Ok(())
    }

    /// spec §4.7 `fetchNode`, restricted to branches: returns the cached
    /// instance or deserializes and caches it. Used by callers (scans,
    /// debug assertions) that need tree shape without a transaction.
    pub fn fetch_branch(&self, r: NodeRef) -> TreeResult<Arc<Branch>> {
        if let Some(cached) = self.cache.get(r) {
            return Ok(cached);
        }
        let area = r.as_store_area().ok_or_else(|| TreeError::consistency("expected a store-resident branch"))?;
        let bytes = self.store.read_area(area)?;
        let branch = encoding::decode_branch(bytes.as_ref())?;
        let arc = Arc::new(branch);
        self.cache.insert(r, arc.clone());
        Ok(arc)
    }

    pub fn check_point(&self) -> TreeResult<()> {
        self.store.check_point().map_err(|e| self.observe(e.into()))
    }

    pub fn latest_version_id(&self) -> u64 {
        self.versions.latest_version_id()
    }
}

fn next_tree_system_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;
    use crate::store::MemoryStore;

    fn fresh() -> TreeSystem<MemoryStore> {
        TreeSystem::open(MemoryStore::new(), Config::default()).unwrap()
    }

    #[test]
    fn fresh_tree_has_no_user_keys_and_height_two() {
        let sys = fresh();
        let mut txn = sys.create_transaction(true).unwrap();
        assert_eq!(txn.size(Key::new(1, 1, 1)).unwrap(), 0);
        let root_branch = sys.fetch_branch(txn.root()).unwrap();
        assert_eq!(root_branch.len(), 2);
    }

    #[test]
    fn commit_publishes_a_new_version_visible_to_later_transactions() {
        let sys = fresh();
        let mut txn = sys.create_transaction(false).unwrap();
        let key = Key::new(1, 1, 1);
        txn.put(key, 0, b"ABC").unwrap();
        let v1 = sys.commit(txn).unwrap();
        assert_eq!(v1, 1);

        let mut reader = sys.create_transaction(true).unwrap();
        assert_eq!(reader.size(key).unwrap(), 3);
        let mut buf = [0u8; 3];
        reader.get(key, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"ABC");
    }

    #[test]
    fn snapshot_isolation_pre_commit_reader_does_not_see_writes() {
        let sys = fresh();
        let before = sys.create_transaction(true).unwrap();
        let key = Key::new(2, 2, 2);

        let mut writer = sys.create_transaction(false).unwrap();
        writer.put(key, 0, b"xyz").unwrap();
        sys.commit(writer).unwrap();

        let mut before = before;
        assert_eq!(before.size(key).unwrap(), 0);
        sys.dispose(before).unwrap();
    }

    #[test]
    fn racing_commits_on_the_same_base_fail_non_sequential() {
        let sys = fresh();
        let key = Key::new(3, 3, 3);
        let mut t1 = sys.create_transaction(false).unwrap();
        let mut t2 = sys.create_transaction(false).unwrap();
        t1.put(key, 0, b"a").unwrap();
        t2.put(key, 0, b"b").unwrap();
        sys.commit(t1).unwrap();
        let err = sys.commit(t2).unwrap_err();
        assert!(matches!(err, TreeError::NonSequentialVersion { .. }));
    }

    #[test]
    fn version_reclamation_disposes_deleted_leaves() {
        let sys = fresh();
        let key = Key::new(4, 4, 4);
        let mut t1 = sys.create_transaction(false).unwrap();
        t1.put(key, 0, b"hello").unwrap();
        sys.commit(t1).unwrap();

        let t_reader = sys.create_transaction(true).unwrap();
        let mut t2 = sys.create_transaction(false).unwrap();
        t2.delete_key(key).unwrap();
        sys.commit(t2).unwrap();

        // the reader still holds v1's lock, so v1's leaves are not yet reclaimed.
        sys.dispose(t_reader).unwrap();
    }
}
