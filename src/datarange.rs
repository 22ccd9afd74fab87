//! Logical byte-sequence view over a contiguous run of keys (spec §3
//! "DataRange", §4.9 "DataRange contract").
//!
//! The tree lays every key's bytes out contiguously in key order within one
//! global byte space — for any existing key, `start(key) + size(key)` is
//! exactly `start(next_key)`. A `DataRange` rides that invariant: its own
//! `size` is just `start(upper) + size(upper) - start(lower)`, and
//! navigating to an absolute position within the range is a single
//! `Transaction::key_at_offset` call rather than a walk over the range's
//! constituent keys.

use crate::datafile::{AccessMode, DataFile};
use crate::error::{TreeError, TreeResult};
use crate::key::Key;
use crate::transaction::Transaction;
use crate::treesystem::LeafLinker;

pub struct DataRange<'a, 't> {
    txn: &'a mut Transaction<'t>,
    lower: Key,
    upper: Key,
    mode: AccessMode,
}

impl<'a, 't> DataRange<'a, 't> {
    pub(crate) fn new(txn: &'a mut Transaction<'t>, lower: Key, upper: Key, mode: AccessMode) -> Self {
        debug_assert!(lower <= upper);
        DataRange { txn, lower, upper, mode }
    }

    pub fn lower(&self) -> Key {
        self.lower
    }

    pub fn upper(&self) -> Key {
        self.upper
    }

    fn require_writable(&self) -> TreeResult<()> {
        if self.mode == AccessMode::ReadOnly {
            return Err(TreeError::read_only("DataRange"));
        }
        Ok(())
    }

    fn require_in_range(&self, key: Key) -> TreeResult<()> {
        if key < self.lower || key > self.upper {
            return Err(TreeError::invalid_key(key, "key lies outside this range's [lower, upper] bound"));
        }
        Ok(())
    }

    fn lower_start(&mut self) -> TreeResult<u64> {
        Ok(self.txn.locate(self.lower)?.0)
    }

    /// spec §4.9 `size`: the byte span from the start of `lower` to the end
    /// of `upper`, inclusive of both.
    pub fn size(&mut self) -> TreeResult<u64> {
        let lower_start = self.lower_start()?;
        let (upper_start, upper_size, _) = self.txn.locate(self.upper)?;
        Ok(upper_start + upper_size as u64 - lower_start)
    }

    /// spec §4.9 `keyAtPosition`: the key label covering byte `pos`,
    /// relative to the start of this range.
    pub fn key_at_position(&mut self, pos: u64) -> TreeResult<Key> {
        let lower_start = self.lower_start()?;
        self.txn.key_at_offset(lower_start + pos)
    }

    /// The position, relative to this range, where `key`'s data begins.
    pub fn position_on_key_start(&mut self, key: Key) -> TreeResult<u64> {
        self.require_in_range(key)?;
        let lower_start = self.lower_start()?;
        let (start, _, _) = self.txn.locate(key)?;
        Ok(start - lower_start)
    }

    /// The position where the key immediately following `key` begins —
    /// exactly `key`'s own start plus its size, since keys are laid out
    /// contiguously.
    pub fn position_on_next_key(&mut self, key: Key) -> TreeResult<u64> {
        self.require_in_range(key)?;
        let lower_start = self.lower_start()?;
        let (start, size, _) = self.txn.locate(key)?;
        Ok(start + size as u64 - lower_start)
    }

    /// The position where the key immediately preceding `key` begins.
    /// `key` must not be this range's `lower` bound — there is no key in
    /// range before it.
    pub fn position_on_previous_key(&mut self, key: Key) -> TreeResult<u64> {
        self.require_in_range(key)?;
        let lower_start = self.lower_start()?;
        let (start, _, _) = self.txn.locate(key)?;
        if start <= lower_start {
            return Err(TreeError::invalid_key(key, "no key precedes the range's lower bound"));
        }
        let prev_label = self.txn.key_at_offset(start - 1)?;
        let (prev_start, _, _) = self.txn.locate(prev_label)?;
        Ok(prev_start - lower_start)
    }

    /// spec §4.9: a `DataFile` over one key within this range. `key` must
    /// lie within `[lower, upper]`.
    pub fn get_data_file(&mut self, key: Key) -> TreeResult<DataFile<'_, 't>> {
        self.require_in_range(key)?;
        Ok(DataFile::new(self.txn, key, self.mode))
    }

    /// A composite cursor reading/writing across every key in this range as
    /// one contiguous byte sequence, transparently crossing key boundaries.
    pub fn cursor(&mut self) -> RangeCursor<'_, 't> {
        RangeCursor { txn: &mut *self.txn, lower: self.lower, upper: self.upper, mode: self.mode, position: 0 }
    }

    /// spec §4.9 `delete`: removes every key whose data falls in this
    /// range, by repeatedly deleting the first remaining key until the
    /// range is empty. There is no generic byte-range delete in this
    /// engine — only whole-key deletion — so a range that doesn't start or
    /// end on a key boundary deletes those boundary keys' data in full.
    pub fn delete(&mut self) -> TreeResult<()> {
        self.require_writable()?;
        loop {
            if self.size()? == 0 {
                return Ok(());
            }
            let first = self.key_at_position(0)?;
            self.txn.delete_key(first)?;
        }
    }

    /// Clears this range, then copies `other`'s bytes in starting at
    /// `lower`, growing the boundary key as needed.
    pub fn replicate_from(&mut self, other: &mut DataRange<'_, '_>, linker: &dyn LeafLinker) -> TreeResult<()> {
        self.require_writable()?;
        self.delete()?;
        let size = other.size()?;
        if size == 0 {
            return Ok(());
        }
        let mut dst = self.get_data_file(self.lower)?;
        let mut src = other.get_data_file(other.lower)?;
        src.set_position(0);
        dst.copy_from(&mut src, size as u32, linker)
    }
}

/// Position-tracking cursor over a whole [`DataRange`], splitting each
/// `get`/`put` at constituent key boundaries. Carries its own handle onto
/// the transaction (rather than borrowing the `DataRange` it was built
/// from) since a `DataRange`'s own borrow of that handle cannot itself be
/// re-lent out with a shorter lifetime once captured in a struct field.
pub struct RangeCursor<'a, 't> {
    txn: &'a mut Transaction<'t>,
    lower: Key,
    upper: Key,
    mode: AccessMode,
    position: u64,
}

impl<'a, 't> RangeCursor<'a, 't> {
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn set_position(&mut self, pos: u64) {
        self.position = pos;
    }

    fn require_in_range(&self, key: Key) -> TreeResult<()> {
        if key < self.lower || key > self.upper {
            return Err(TreeError::invalid_key(key, "key lies outside this range's [lower, upper] bound"));
        }
        Ok(())
    }

    fn lower_start(&mut self) -> TreeResult<u64> {
        Ok(self.txn.locate(self.lower)?.0)
    }

    fn bounds_of_key_at(&mut self, pos: u64) -> TreeResult<(Key, u64, u64)> {
        let lower_start = self.lower_start()?;
        let key = self.txn.key_at_offset(lower_start + pos)?;
        self.require_in_range(key)?;
        let (start, size, _) = self.txn.locate(key)?;
        Ok((key, start - lower_start, start + size as u64 - lower_start))
    }

    pub fn get_bytes(&mut self, mut buf: &mut [u8]) -> TreeResult<()> {
        while !buf.is_empty() {
            let (key, key_start, key_end) = self.bounds_of_key_at(self.position)?;
            let offset_in_key = (self.position - key_start) as u32;
            let available = (key_end - self.position) as usize;
            let chunk = buf.len().min(available);

            let mut file = DataFile::new(self.txn, key, self.mode);
            file.set_position(offset_in_key);
            file.get_bytes(&mut buf[..chunk])?;

            self.position += chunk as u64;
            buf = &mut buf[chunk..];
        }
        Ok(())
    }

    pub fn put_bytes(&mut self, mut data: &[u8]) -> TreeResult<()> {
        if self.mode == AccessMode::ReadOnly {
            return Err(TreeError::read_only("DataRange"));
        }
        while !data.is_empty() {
            let (key, key_start, key_end) = self.bounds_of_key_at(self.position)?;
            let offset_in_key = (self.position - key_start) as u32;
            let available = (key_end - self.position) as usize;
            let chunk = if available == 0 { data.len() } else { data.len().min(available) };

            let mut file = DataFile::new(self.txn, key, self.mode);
            file.set_position(offset_in_key);
            file.put_bytes(&data[..chunk])?;

            self.position += chunk as u64;
            data = &data[chunk..];
        }
        Ok(())
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
    fn size_spans_lower_through_upper_inclusive() {
        let sys = fresh();
        let mut txn = sys.create_transaction(false).unwrap();
        let k1 = Key::new(5, 0, 1);
        let k2 = Key::new(5, 0, 2);
        txn.put(k1, 0, b"abc").unwrap();
        txn.put(k2, 0, b"defgh").unwrap();

        let mut range = DataRange::new(&mut txn, k1, k2, AccessMode::ReadWrite);
        assert_eq!(range.size().unwrap(), 8);
    }

    #[test]
    fn key_at_position_crosses_boundary() {
        let sys = fresh();
        let mut txn = sys.create_transaction(false).unwrap();
        let k1 = Key::new(6, 0, 1);
        let k2 = Key::new(6, 0, 2);
        txn.put(k1, 0, b"abc").unwrap();
        txn.put(k2, 0, b"defgh").unwrap();

        let mut range = DataRange::new(&mut txn, k1, k2, AccessMode::ReadWrite);
        assert_eq!(range.key_at_position(0).unwrap(), k1);
        assert_eq!(range.key_at_position(2).unwrap(), k1);
        assert_eq!(range.key_at_position(3).unwrap(), k2);
        assert_eq!(range.key_at_position(7).unwrap(), k2);
    }

    #[test]
    fn cursor_reads_and_writes_across_keys() {
        let sys = fresh();
        let mut txn = sys.create_transaction(false).unwrap();
        let k1 = Key::new(7, 0, 1);
        let k2 = Key::new(7, 0, 2);
        txn.put(k1, 0, b"abc").unwrap();
        txn.put(k2, 0, b"defgh").unwrap();

        let mut range = DataRange::new(&mut txn, k1, k2, AccessMode::ReadWrite);
        let mut buf = [0u8; 8];
        range.cursor().get_bytes(&mut buf).unwrap();
        assert_eq!(&buf, b"abcdefgh");

        let mut cursor = range.cursor();
        cursor.set_position(2);
        cursor.put_bytes(b"XY").unwrap();
        drop(cursor);

        let mut buf = [0u8; 8];
        range.cursor().get_bytes(&mut buf).unwrap();
        assert_eq!(&buf, b"abXYefgh");
    }

    #[test]
    fn delete_empties_whole_range() {
        let sys = fresh();
        let mut txn = sys.create_transaction(false).unwrap();
        let k1 = Key::new(8, 0, 1);
        let k2 = Key::new(8, 0, 2);
        txn.put(k1, 0, b"abc").unwrap();
        txn.put(k2, 0, b"defgh").unwrap();

        let mut range = DataRange::new(&mut txn, k1, k2, AccessMode::ReadWrite);
        range.delete().unwrap();
        assert_eq!(range.size().unwrap(), 0);
    }
}
