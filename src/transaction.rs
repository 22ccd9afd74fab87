//! Transactional view over the tree (spec §4.3, §5 "Per-transaction").
//!
//! A `Transaction` pairs a private [`NodeHeap`] with the snapshot it was
//! opened against. Every mutation runs through a [`pathstack::Cursor`]
//! borrowing that heap and threads the evolving root reference back into
//! `self.root`. `update_version`/`lowest_size_changed_key` are the watermark
//! a [`crate::datafile::DataFile`]/[`crate::datarange::DataRange`] cursor
//! checks to know whether its cached size is still valid — cheaper than
//! recomputing bounds on every read.
//!
//! Not `Send`/`Sync`: all cursors derived from one transaction share its
//! heap and path-stack state, so callers must synchronize externally if a
//! transaction is used from more than one thread (spec §5).

use crate::cache::BranchCache;
use crate::config::Config;
use crate::config::validate_user_key;
use crate::error::{TreeError, TreeResult};
use crate::heap::NodeHeap;
use crate::key::Key;
use crate::noderef::NodeRef;
use crate::pathstack::Cursor;
use crate::store::Store;

pub struct Transaction<'t> {
    store: &'t dyn Store,
    cache: &'t BranchCache,
    config: &'t Config,
    heap: NodeHeap,
    root: NodeRef,
    base_version_id: u64,
    tree_system_id: u64,
    read_only: bool,
    update_version: u64,
    lowest_size_changed_key: Option<Key>,
    deleted_leaves: Vec<NodeRef>,
}

impl<'t> Transaction<'t> {
    pub(crate) fn new(
        store: &'t dyn Store,
        cache: &'t BranchCache,
        config: &'t Config,
        base_version_id: u64,
        tree_system_id: u64,
        root: NodeRef,
        read_only: bool,
    ) -> Self {
        Transaction {
            store,
            cache,
            config,
            heap: NodeHeap::new(),
            root,
            base_version_id,
            tree_system_id,
            read_only,
            update_version: 0,
            lowest_size_changed_key: None,
            deleted_leaves: Vec::new(),
        }
    }

    /// Identifies the `TreeSystem` this transaction was created from, used
    /// by `DataFile::copy_from` to decide whether its source is a peer of
    /// the same engine eligible for the zero-copy leaf-linking path (spec
    /// §4.8, §9 "dynamic dispatch").
    pub fn tree_system_id(&self) -> u64 {
        self.tree_system_id
    }

    /// Store-resident leaves this transaction unlinked entirely, to be
    /// recorded against the version it produces at commit (spec §4.7
    /// `disposeNode`/version reclamation).
    pub(crate) fn deleted_leaves(&self) -> &[NodeRef] {
        &self.deleted_leaves
    }

    pub fn base_version_id(&self) -> u64 {
        self.base_version_id
    }

    pub fn root(&self) -> NodeRef {
        self.root
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn update_version(&self) -> u64 {
        self.update_version
    }

    /// The smallest key any mutation in this transaction may have changed
    /// the size of, since it was last observed. A cursor caching `size` for
    /// a key `>=` this watermark must recompute it.
    pub fn lowest_size_changed_key(&self) -> Option<Key> {
        self.lowest_size_changed_key
    }

    pub(crate) fn heap_mut(&mut self) -> &mut NodeHeap {
        &mut self.heap
    }

    pub(crate) fn heap(&self) -> &NodeHeap {
        &self.heap
    }

    fn cursor(&mut self) -> Cursor<'_> {
        Cursor {
            heap: &mut self.heap,
            store: self.store,
            cache: self.cache,
            config: self.config,
        }
    }

    fn require_writable(&self, operation: &'static str) -> TreeResult<()> {
        if self.read_only {
            return Err(TreeError::read_only(operation));
        }
        Ok(())
    }

    fn note_mutation(&mut self, key: Key) {
        self.update_version += 1;
        self.lowest_size_changed_key = Some(match self.lowest_size_changed_key {
            Some(lowest) if lowest <= key => lowest,
            _ => key,
        });
    }

    /// spec §4.8 `size`: 0 for a key that was never written.
    pub fn size(&mut self, key: Key) -> TreeResult<u32> {
        let (_, size, exists) = self.cursor().locate_key(self.root, key)?;
        Ok(if exists { size } else { 0 })
    }

    /// `(absolute_start_offset, size, exists)` for `key`, without reading
    /// any payload — the primitive `DataRange` key navigation is built on.
    pub(crate) fn locate(&mut self, key: Key) -> TreeResult<(u64, u32, bool)> {
        self.cursor().locate_key(self.root, key)
    }

    /// The key label of the leaf covering absolute byte `offset` (spec §4.9
    /// `keyAtPosition`).
    pub(crate) fn key_at_offset(&mut self, offset: u64) -> TreeResult<Key> {
        self.cursor().key_at_offset(self.root, offset)
    }

    /// `key`'s leaf chain as `(ref, size)` pairs, or `None` if any leaf is
    /// still heap-resident (spec §4.8 copyFrom's leaf-linking fast path).
    pub(crate) fn store_leaf_chain(&mut self, key: Key) -> TreeResult<Option<Vec<(NodeRef, u32)>>> {
        self.cursor().store_leaf_chain(self.root, key)
    }

    /// Splices `chain` in as the entirety of `key`'s data — `key` must
    /// currently be empty.
    pub(crate) fn splice_leaf_chain(&mut self, key: Key, chain: &[(NodeRef, u32)]) -> TreeResult<()> {
        self.root = self.cursor().splice_leaf_chain(self.root, key, chain)?;
        self.note_mutation(key);
        Ok(())
    }

    pub fn get(&mut self, key: Key, pos: u32, buf: &mut [u8]) -> TreeResult<()> {
        self.cursor().get(self.root, key, pos, buf)
    }

    /// spec §4.8 `put*`: writes `data` at `pos`, growing the key's file if
    /// `pos + data.len()` reaches past its current size.
    pub fn put(&mut self, key: Key, pos: u32, data: &[u8]) -> TreeResult<()> {
        self.require_writable("put")?;
        validate_user_key(key)?;
        self.root = self.cursor().put(self.root, key, pos, data)?;
        self.note_mutation(key);
        Ok(())
    }

    /// spec §4.8 `setSize`: zero-extend past the current size, or truncate.
    pub fn set_size(&mut self, key: Key, new_size: u32) -> TreeResult<()> {
        self.require_writable("setSize")?;
        validate_user_key(key)?;
        let (_, current, _) = self.cursor().locate_key(self.root, key)?;
        if new_size > current {
            self.root = self.cursor().put(self.root, key, current, &vec![0u8; (new_size - current) as usize])?;
        } else {
            let (new_root, unlinked) = self.cursor().shrink_key(self.root, key, new_size)?;
            self.root = new_root;
            self.deleted_leaves.extend(unlinked);
        }
        self.note_mutation(key);
        Ok(())
    }

    /// spec §4.3 `shiftData`: moves every byte at or after `pos` by `delta`,
    /// growing the file with zero fill (`delta > 0`) or dropping bytes
    /// (`delta < 0`).
    pub fn shift(&mut self, key: Key, pos: u32, delta: i64) -> TreeResult<()> {
        self.require_writable("shift")?;
        if delta == 0 {
            return Ok(());
        }
        let (_, size, _) = self.cursor().locate_key(self.root, key)?;
        let pos = pos.min(size);

        if delta > 0 {
            let grow = delta as u32;
            let tail_len = size - pos;
            let mut tail = vec![0u8; tail_len as usize];
            if tail_len > 0 {
                self.cursor().get(self.root, key, pos, &mut tail)?;
            }
            self.root = self.cursor().put(self.root, key, size, &vec![0u8; grow as usize])?;
            if tail_len > 0 {
                self.root = self.cursor().put(self.root, key, pos + grow, &tail)?;
            }
        } else {
            let shrink = (-delta) as u32;
            if shrink > size - pos {
                return Err(TreeError::out_of_bounds(key, pos as u64, size as u64));
            }
            let tail_len = size - pos - shrink;
            if tail_len > 0 {
                let mut tail = vec![0u8; tail_len as usize];
                self.cursor().get(self.root, key, pos + shrink, &mut tail)?;
                self.root = self.cursor().put(self.root, key, pos, &tail)?;
            }
            let (new_root, unlinked) = self.cursor().shrink_key(self.root, key, size - shrink)?;
            self.root = new_root;
            self.deleted_leaves.extend(unlinked);
        }
        self.note_mutation(key);
        Ok(())
    }

    /// spec §4.3/§4.4 `deleteLeaf`'s single-key case.
    pub fn delete_key(&mut self, key: Key) -> TreeResult<()> {
        self.require_writable("delete")?;
        let (new_root, unlinked) = self.cursor().delete_key(self.root, key)?;
        self.root = new_root;
        self.deleted_leaves.extend(unlinked);
        self.note_mutation(key);
        Ok(())
    }

    /// spec §3 "DataFile": opens a cursor over `key`, read-only if this
    /// transaction is read-only.
    pub fn data_file(&mut self, key: Key) -> crate::datafile::DataFile<'_, 't> {
        let mode = if self.read_only { crate::datafile::AccessMode::ReadOnly } else { crate::datafile::AccessMode::ReadWrite };
        crate::datafile::DataFile::new(self, key, mode)
    }

    /// spec §3 "DataRange": opens a view spanning every key in `[lower,
    /// upper]`, read-only if this transaction is read-only.
    pub fn data_range(&mut self, lower: Key, upper: Key) -> crate::datarange::DataRange<'_, 't> {
        let mode = if self.read_only { crate::datafile::AccessMode::ReadOnly } else { crate::datafile::AccessMode::ReadWrite };
        crate::datarange::DataRange::new(self, lower, upper, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BranchCache;
    use crate::store::MemoryStore;

    fn fresh() -> (MemoryStore, BranchCache, Config) {
        (MemoryStore::new(), BranchCache::with_capacity_bytes(1 << 20), Config::default())
    }

    fn empty_root(store: &MemoryStore) -> NodeRef {
        let head = crate::node::Leaf::new_owned(Key::HEAD, vec![1, 1, 1, 1]);
        let tail = crate::node::Leaf::new_owned(Key::TAIL, vec![1, 1, 1, 1]);
        let head_area = store.create_area(&crate::encoding::encode_leaf(1, head.as_bytes())).unwrap();
        let tail_area = store.create_area(&crate::encoding::encode_leaf(1, tail.as_bytes())).unwrap();
        let branch = crate::node::Branch::set(NodeRef::store_area(head_area), 4, Key::TAIL, NodeRef::store_area(tail_area), 4);
        let bytes = crate::encoding::encode_branch(&branch);
        let area = store.create_area(&bytes).unwrap();
        NodeRef::store_area(area)
    }

    #[test]
    fn put_then_get_roundtrips() {
        let (store, cache, config) = fresh();
        let root = empty_root(&store);
        let mut txn = Transaction::new(&store, &cache, &config, 0, 0, root, false);
        let key = Key::new(1, 1, 1);
        txn.put(key, 0, b"ABC").unwrap();
        assert_eq!(txn.size(key).unwrap(), 3);
        let mut buf = [0u8; 3];
        txn.get(key, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"ABC");
    }

    #[test]
    fn shift_grow_preserves_prefix_and_moves_tail() {
        let (store, cache, config) = fresh();
        let root = empty_root(&store);
        let mut config = config;
        config.max_leaf = 16;
        let mut txn = Transaction::new(&store, &cache, &config, 0, 0, root, false);
        let key = Key::new(1, 1, 1);
        txn.put(key, 0, &vec![0u8; 40]).unwrap();
        txn.shift(key, 8, 4).unwrap();
        assert_eq!(txn.size(key).unwrap(), 44);
    }

    #[test]
    fn read_only_transaction_rejects_writes() {
        let (store, cache, config) = fresh();
        let root = empty_root(&store);
        let mut txn = Transaction::new(&store, &cache, &config, 0, 0, root, true);
        let key = Key::new(1, 1, 1);
        assert!(matches!(txn.put(key, 0, b"x"), Err(TreeError::ReadOnly { .. })));
    }
}
