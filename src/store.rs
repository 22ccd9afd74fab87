//! Byte-addressable backing store (spec §6 "External interfaces").
//!
//! `Store` is deliberately dumb: areas are opaque byte blobs, identified by
//! an id the store hands back from `create_area`. Everything node-shaped —
//! magics, word arrays, refcounts — is layered on top in
//! [`crate::encoding`]; `Store` itself never parses its own payloads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anybytes::Bytes;
use parking_lot::Mutex;

use crate::error::StoreError;

/// Durable (or, for [`MemoryStore`], process-lifetime) byte storage backing a
/// [`crate::treesystem::TreeSystem`]. A real implementation backs this with a
/// memory-mapped file the way the teacher's `repo::pile` does; `MemoryStore`
/// below is the in-memory test double used throughout this crate's tests.
pub trait Store: Send + Sync {
    /// Allocates a new area holding exactly `bytes`, returning its id.
    fn create_area(&self, bytes: &[u8]) -> Result<u64, StoreError>;

    /// Reads the current contents of area `id`.
    fn read_area(&self, id: u64) -> Result<Bytes, StoreError>;

    /// Overwrites area `id` in place with `bytes`, which must be the same
    /// length as the area's current contents (used only to patch the
    /// `refCount` header field of a leaf record — see
    /// [`crate::encoding::patch_leaf_ref_count`]).
    fn write_area(&self, id: u64, bytes: &[u8]) -> Result<(), StoreError>;

    /// Frees area `id`. Its id may be reused by a later `create_area`.
    fn delete_area(&self, id: u64) -> Result<(), StoreError>;

    /// Acquires the store's single-writer lock, excluding any other process
    /// from committing concurrently (spec §6). `TreeSystem`'s own commit
    /// lock already serializes writers within one process; this is the
    /// cross-process counterpart.
    fn lock_for_write(&self) -> Result<(), StoreError>;

    fn unlock_for_write(&self) -> Result<(), StoreError>;

    /// Flushes any buffered writes and makes them durable.
    fn check_point(&self) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryStoreInner {
    next_id: u64,
    areas: HashMap<u64, Vec<u8>>,
}

/// In-memory [`Store`], grounded on the teacher's `repo::memoryrepo::MemoryRepo`
/// test double: a plain map guarded by a lock, with no actual durability.
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
    write_locked: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore {
            inner: Mutex::new(MemoryStoreInner::default()),
            write_locked: AtomicBool::new(false),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn area_count(&self) -> usize {
        self.inner.lock().areas.len()
    }
}

impl Store for MemoryStore {
    fn create_area(&self, bytes: &[u8]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.areas.insert(id, bytes.to_vec());
        Ok(id)
    }

    fn read_area(&self, id: u64) -> Result<Bytes, StoreError> {
        let inner = self.inner.lock();
        let bytes = inner.areas.get(&id).ok_or(StoreError::MissingArea(id))?;
        Ok(Bytes::from_source(bytes.clone()))
    }

    fn write_area(&self, id: u64, bytes: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let area = inner.areas.get_mut(&id).ok_or(StoreError::MissingArea(id))?;
        *area = bytes.to_vec();
        Ok(())
    }

    fn delete_area(&self, id: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.areas.remove(&id).ok_or(StoreError::MissingArea(id))?;
        Ok(())
    }

    fn lock_for_write(&self) -> Result<(), StoreError> {
        self.write_locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| StoreError::Io("store is already locked for write".into()))
    }

    fn unlock_for_write(&self) -> Result<(), StoreError> {
        self.write_locked.store(false, Ordering::Release);
        Ok(())
    }

    fn check_point(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
