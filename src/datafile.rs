//! Logical byte-sequence view over one key (spec §3 "DataFile", §4.8
//! "DataFile contract").
//!
//! A `DataFile` pairs a [`Transaction`] with a `key` and a cursor position.
//! Every typed `get*`/`put*` primitive is a thin wrapper over the
//! transaction's byte-range `get`/`put`, advancing the cursor by the
//! primitive's width.

use crate::error::{TreeError, TreeResult};
use crate::key::Key;
use crate::transaction::Transaction;
use crate::treesystem::LeafLinker;

/// Whole-file or byte-range access mode a `DataFile`/`DataRange` is opened
/// with; read-only handles never reach a transaction's mutators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// The capability `DataFile::get_block_location_meta` hands out: enough
/// information for a peer `copy_from` call to recognize this range as
/// coming from the same engine, without exposing the tree internals
/// themselves (spec §4.8, §9 "dynamic dispatch").
#[derive(Debug, Clone, Copy)]
pub struct BlockLocationMeta {
    pub tree_system_id: u64,
    pub key: Key,
    pub start: u32,
    pub end: u32,
}

const COPY_BUFFER_BYTES: usize = 1024;

pub struct DataFile<'a, 't> {
    txn: &'a mut Transaction<'t>,
    key: Key,
    position: u32,
    mode: AccessMode,
}

impl<'a, 't> DataFile<'a, 't> {
    pub(crate) fn new(txn: &'a mut Transaction<'t>, key: Key, mode: AccessMode) -> Self {
        DataFile { txn, key, position: 0, mode }
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn set_position(&mut self, pos: u32) {
        self.position = pos;
    }

    pub fn size(&mut self) -> TreeResult<u32> {
        self.txn.size(self.key)
    }

    fn require_writable(&self) -> TreeResult<()> {
        if self.mode == AccessMode::ReadOnly {
            return Err(TreeError::read_only("DataFile"));
        }
        Ok(())
    }

    /// spec §4.8: reading past `size` fails with out-of-bounds; the cursor
    /// advances by `buf.len()` on success.
    pub fn get_bytes(&mut self, buf: &mut [u8]) -> TreeResult<()> {
        self.txn.get(self.key, self.position, buf)?;
        self.position += buf.len() as u32;
        Ok(())
    }

    pub fn get_u8(&mut self) -> TreeResult<u8> {
        let mut buf = [0u8; 1];
        self.get_bytes(&mut buf)?;
        Ok(buf[0])
    }

    pub fn get_i16(&mut self) -> TreeResult<i16> {
        let mut buf = [0u8; 2];
        self.get_bytes(&mut buf)?;
        Ok(i16::from_le_bytes(buf))
    }

    pub fn get_char(&mut self) -> TreeResult<u16> {
        let mut buf = [0u8; 2];
        self.get_bytes(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn get_i32(&mut self) -> TreeResult<i32> {
        let mut buf = [0u8; 4];
        self.get_bytes(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    pub fn get_i64(&mut self) -> TreeResult<i64> {
        let mut buf = [0u8; 8];
        self.get_bytes(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    /// spec §4.8: writing at or past `size` grows the file; writing in the
    /// middle overwrites in place.
    pub fn put_bytes(&mut self, data: &[u8]) -> TreeResult<()> {
        self.require_writable()?;
        self.txn.put(self.key, self.position, data)?;
        self.position += data.len() as u32;
        Ok(())
    }

    pub fn put_u8(&mut self, v: u8) -> TreeResult<()> {
        self.put_bytes(&[v])
    }

    pub fn put_i16(&mut self, v: i16) -> TreeResult<()> {
        self.put_bytes(&v.to_le_bytes())
    }

    pub fn put_char(&mut self, v: u16) -> TreeResult<()> {
        self.put_bytes(&v.to_le_bytes())
    }

    pub fn put_i32(&mut self, v: i32) -> TreeResult<()> {
        self.put_bytes(&v.to_le_bytes())
    }

    pub fn put_i64(&mut self, v: i64) -> TreeResult<()> {
        self.put_bytes(&v.to_le_bytes())
    }

    /// spec §4.3/§4.8 `shift`: moves every byte after the cursor by `delta`.
    pub fn shift(&mut self, delta: i64) -> TreeResult<()> {
        self.require_writable()?;
        self.txn.shift(self.key, self.position, delta)
    }

    pub fn set_size(&mut self, new_size: u32) -> TreeResult<()> {
        self.require_writable()?;
        self.txn.set_size(self.key, new_size)
    }

    pub fn delete(&mut self) -> TreeResult<()> {
        self.require_writable()?;
        self.txn.delete_key(self.key)?;
        self.position = 0;
        Ok(())
    }

    pub fn get_block_location_meta(&self, start: u32, end: u32) -> BlockLocationMeta {
        BlockLocationMeta { tree_system_id: self.txn.tree_system_id(), key: self.key, start, end }
    }

    /// spec §4.8 `copyFrom`: copies from a `DataFile` over a different
    /// transaction (the borrow checker already rules out `src` aliasing
    /// `self`'s own transaction, since two live `&mut` transactions can
    /// never point at the same one). Tries the zero-copy leaf-linking path
    /// first — whole-file copy into a key with no existing data, both
    /// transactions opened from `linker`'s tree system, every source leaf
    /// already store-resident — and falls back to a 1KB-buffered byte copy
    /// otherwise.
    pub fn copy_from(&mut self, src: &mut DataFile<'_, '_>, size: u32, linker: &dyn LeafLinker) -> TreeResult<()> {
        self.require_writable()?;

        if self.try_copy_via_leaf_linking(src.txn, src.key, src.position, size, linker)? {
            src.position += size;
            self.position += size;
            return Ok(());
        }
        self.buffered_copy(src.txn, src.key, src.position, size)?;
        src.position += size;
        Ok(())
    }

    /// spec §4.8 `copyFrom`, same-transaction form: copies `size` bytes
    /// starting at `src_pos` in `src_key` into `self` at its current
    /// position, both within the transaction `self` already belongs to.
    /// Rejects a source that is `self`'s own key — that would alias the
    /// range being written.
    pub fn copy_from_key(&mut self, src_key: Key, src_pos: u32, size: u32, linker: &dyn LeafLinker) -> TreeResult<()> {
        self.require_writable()?;
        if src_key == self.key {
            return Err(TreeError::SelfAliasedCopy);
        }

        let eligible = self.position == 0
            && self.size()? == 0
            && src_pos == 0
            && size == self.txn.size(src_key)?
            && self.txn.tree_system_id() == linker.tree_system_id();
        if eligible {
            if let Some(chain) = self.txn.store_leaf_chain(src_key)? {
                if Self::link_chain(&chain, linker)? {
                    self.txn.splice_leaf_chain(self.key, &chain)?;
                    self.position += size;
                    return Ok(());
                }
            }
        }

        let mut remaining = size as usize;
        let mut src_pos = src_pos;
        let mut buf = [0u8; COPY_BUFFER_BYTES];
        while remaining > 0 {
            let chunk = remaining.min(COPY_BUFFER_BYTES);
            self.txn.get(src_key, src_pos, &mut buf[..chunk])?;
            self.put_bytes(&buf[..chunk])?;
            src_pos += chunk as u32;
            remaining -= chunk;
        }
        Ok(())
    }

    fn try_copy_via_leaf_linking(
        &mut self,
        src_txn: &mut Transaction<'_>,
        src_key: Key,
        src_pos: u32,
        size: u32,
        linker: &dyn LeafLinker,
    ) -> TreeResult<bool> {
        let eligible = self.txn.tree_system_id() == linker.tree_system_id()
            && src_txn.tree_system_id() == linker.tree_system_id()
            && self.position == 0
            && self.size()? == 0
            && src_pos == 0
            && size == src_txn.size(src_key)?;
        if !eligible {
            return Ok(false);
        }
        let Some(chain) = src_txn.store_leaf_chain(src_key)? else {
            return Ok(false);
        };
        if !Self::link_chain(&chain, linker)? {
            return Ok(false);
        }
        self.txn.splice_leaf_chain(self.key, &chain)?;
        Ok(true)
    }

    /// Links every store-resident leaf in `chain`, bailing out (without
    /// leaving a partially-linked chain a caller would act on) if any
    /// refcount would overflow.
    fn link_chain(chain: &[(crate::noderef::NodeRef, u32)], linker: &dyn LeafLinker) -> TreeResult<bool> {
        for &(leaf_ref, _) in chain {
            if leaf_ref.is_store() && !linker.link_leaf(leaf_ref)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn buffered_copy(&mut self, src_txn: &mut Transaction<'_>, src_key: Key, src_pos: u32, size: u32) -> TreeResult<()> {
        let mut remaining = size as usize;
        let mut src_pos = src_pos;
        let mut buf = [0u8; COPY_BUFFER_BYTES];
        while remaining > 0 {
            let chunk = remaining.min(COPY_BUFFER_BYTES);
            src_txn.get(src_key, src_pos, &mut buf[..chunk])?;
            self.put_bytes(&buf[..chunk])?;
            src_pos += chunk as u32;
            remaining -= chunk;
        }
        Ok(())
    }

    /// spec §4.8: `delete(); src.position(0); copyFrom(src, src.size())`.
    pub fn replicate_from(&mut self, src: &mut DataFile<'_, '_>, linker: &dyn LeafLinker) -> TreeResult<()> {
        self.delete()?;
        src.set_position(0);
        let size = src.size()?;
        self.copy_from(src, size, linker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::MemoryStore;
    use crate::treesystem::TreeSystem;

    fn fresh() -> TreeSystem<MemoryStore> {
        TreeSystem::open(MemoryStore::new(), Config::default()).unwrap()
    }

    #[test]
    fn typed_put_get_roundtrip() {
        let sys = fresh();
        let mut txn = sys.create_transaction(false).unwrap();
        let key = Key::new(1, 0, 1);
        let mut f = DataFile::new(&mut txn, key, AccessMode::ReadWrite);
        f.put_i32(0x1234_5678).unwrap();
        f.put_u8(0xAB).unwrap();
        f.set_position(0);
        assert_eq!(f.get_i32().unwrap(), 0x1234_5678);
        assert_eq!(f.get_u8().unwrap(), 0xAB);
    }

    #[test]
    fn copy_from_key_rejects_self_alias() {
        let sys = fresh();
        let mut txn = sys.create_transaction(false).unwrap();
        let key = Key::new(2, 0, 1);
        txn.put(key, 0, b"hello").unwrap();
        let mut dst = DataFile::new(&mut txn, key, AccessMode::ReadWrite);
        let err = dst.copy_from_key(key, 0, 5, &sys).unwrap_err();
        assert!(matches!(err, TreeError::SelfAliasedCopy));
    }

    #[test]
    fn buffered_copy_from_key_distinct_key_same_transaction() {
        let sys = fresh();
        let mut txn = sys.create_transaction(false).unwrap();
        let src_key = Key::new(3, 0, 1);
        let dst_key = Key::new(3, 0, 2);
        txn.put(src_key, 0, b"abcdefgh").unwrap();

        let mut dst = DataFile::new(&mut txn, dst_key, AccessMode::ReadWrite);
        dst.copy_from_key(src_key, 0, 8, &sys).unwrap();
        assert_eq!(dst.size().unwrap(), 8);
        let mut buf = [0u8; 8];
        dst.set_position(0);
        dst.get_bytes(&mut buf).unwrap();
        assert_eq!(&buf, b"abcdefgh");
    }

    #[test]
    fn zero_copy_fast_path_across_transactions_avoids_buffering_payload() {
        let sys = fresh();
        let src_key = Key::new(4, 0, 1);
        let mut writer = sys.create_transaction(false).unwrap();
        let payload = vec![0x42u8; 4096];
        writer.put(src_key, 0, &payload).unwrap();
        sys.commit(writer).unwrap();

        let mut reader = sys.create_transaction(true).unwrap();
        let mut txn_b = sys.create_transaction(false).unwrap();
        let dst_key = Key::new(4, 0, 2);
        let mut src = DataFile::new(&mut reader, src_key, AccessMode::ReadOnly);
        let mut dst = DataFile::new(&mut txn_b, dst_key, AccessMode::ReadWrite);
        dst.copy_from(&mut src, payload.len() as u32, &sys).unwrap();
        assert_eq!(dst.size().unwrap(), payload.len() as u32);
        let mut buf = vec![0u8; payload.len()];
        dst.set_position(0);
        dst.get_bytes(&mut buf).unwrap();
        assert_eq!(buf, payload);
    }
}
