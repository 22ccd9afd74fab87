//! [`NodeRef`]: the 128-bit dual-role node identity (spec §3 "NodeRef").
//!
//! A `NodeRef` either names a slot in a transaction's [`crate::heap::NodeHeap`]
//! ("heap reference"), addresses an immutable node in the [`crate::store::Store`]
//! ("store reference"), or — as a special case of a store reference — encodes a
//! *special-sparse* leaf: `N` copies of one byte, with no backing store area at
//! all (spec §6, §9 "Special-sparse leaf").

use arbitrary::Arbitrary;
use zerocopy::{Immutable, IntoBytes, KnownLayout, TryFromBytes};

const TAG_STORE: u64 = 0;
const TAG_HEAP: u64 = 1;
const TAG_SPARSE: u64 = 2;
const TAG_SHIFT: u32 = 62;
const TAG_MASK: u64 = 0b11 << TAG_SHIFT;

/// Bitwise-equal, 128-bit node identity. Never confuse a heap reference with
/// a store reference: equality is bitwise over both words (spec §3).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Arbitrary)]
pub struct NodeRef {
    hi: u64,
    lo: u64,
}

impl std::fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(slot) = self.as_heap_slot() {
            write!(f, "NodeRef::Heap({slot})")
        } else if let Some((byte, len)) = self.as_sparse() {
            write!(f, "NodeRef::Sparse(byte={byte:#04x}, len={len})")
        } else if let Some(area) = self.as_store_area() {
            write!(f, "NodeRef::Store({area})")
        } else {
            write!(f, "NodeRef(hi={:#x}, lo={:#x})", self.hi, self.lo)
        }
    }
}

impl NodeRef {
    fn tag(&self) -> u64 {
        (self.hi & TAG_MASK) >> TAG_SHIFT
    }

    fn payload_hi(&self) -> u64 {
        self.hi & !TAG_MASK
    }

    pub fn heap(slot: u64) -> Self {
        NodeRef {
            hi: TAG_HEAP << TAG_SHIFT,
            lo: slot,
        }
    }

    pub fn store_area(area_id: u64) -> Self {
        NodeRef {
            hi: TAG_STORE << TAG_SHIFT,
            lo: area_id,
        }
    }

    /// A virtual leaf of `len` copies of `byte`, materialized without any
    /// store allocation. `len` must fit in 16 bits (spec §3, §6).
    pub fn sparse(byte: u8, len: u16) -> Self {
        NodeRef {
            hi: TAG_SPARSE << TAG_SHIFT,
            lo: (byte as u64) | ((len as u64) << 8),
        }
    }

    pub fn is_heap(&self) -> bool {
        self.tag() == TAG_HEAP
    }

    pub fn is_sparse(&self) -> bool {
        self.tag() == TAG_SPARSE
    }

    pub fn is_store(&self) -> bool {
        self.tag() == TAG_STORE
    }

    pub fn as_heap_slot(&self) -> Option<u64> {
        self.is_heap().then_some(self.lo)
    }

    pub fn as_store_area(&self) -> Option<u64> {
        (self.is_store() && self.payload_hi() == 0).then_some(self.lo)
    }

    pub fn as_sparse(&self) -> Option<(u8, u16)> {
        self.is_sparse().then(|| (self.lo as u8, (self.lo >> 8) as u16))
    }

    pub fn to_words(self) -> (u64, u64) {
        (self.hi, self.lo)
    }

    pub fn from_words(hi: u64, lo: u64) -> Self {
        NodeRef { hi, lo }
    }
}

/// On-disk/word-array encoding matching [`NodeRef::to_words`].
#[derive(Clone, Copy, Debug, IntoBytes, TryFromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RawNodeRefWords {
    pub hi: u64,
    pub lo: u64,
}

impl From<NodeRef> for RawNodeRefWords {
    fn from(r: NodeRef) -> Self {
        let (hi, lo) = r.to_words();
        RawNodeRefWords { hi, lo }
    }
}

impl From<RawNodeRefWords> for NodeRef {
    fn from(raw: RawNodeRefWords) -> Self {
        NodeRef::from_words(raw.hi, raw.lo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_and_store_refs_are_distinguishable() {
        let h = NodeRef::heap(7);
        let s = NodeRef::store_area(7);
        assert_ne!(h, s);
        assert!(h.is_heap() && !h.is_store());
        assert!(s.is_store() && !s.is_heap());
    }

    #[test]
    fn sparse_roundtrips_byte_and_len() {
        let r = NodeRef::sparse(0xAB, 12345);
        assert_eq!(r.as_sparse(), Some((0xAB, 12345)));
        assert!(r.is_sparse());
    }

    #[test]
    fn words_roundtrip() {
        let r = NodeRef::heap(0xDEAD_BEEF);
        let (hi, lo) = r.to_words();
        assert_eq!(NodeRef::from_words(hi, lo), r);
    }
}
