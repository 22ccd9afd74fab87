//! On-disk node/record encodings (spec §6 "Node encoding on disk").
//!
//! These are pure byte-level (de)serializers over the abstract byte-addressable
//! [`crate::store::Store`]; they know nothing about heap references, caches,
//! or transactions.

use crate::error::{TreeError, TreeResult};
use crate::key::Key;
use crate::node::Branch;
use crate::noderef::NodeRef;

pub const LEAF_MAGIC: u16 = 0x19EC;
pub const BRANCH_MAGIC: u16 = 0x22EB;
pub const NODE_VERSION: u16 = 1;

pub const VERSION_RECORD_MAGIC: u32 = 0x0004_EA23;

fn read_u16(bytes: &[u8], at: &mut usize) -> u16 {
    let v = u16::from_le_bytes(bytes[*at..*at + 2].try_into().unwrap());
    *at += 2;
    v
}
fn read_u32(bytes: &[u8], at: &mut usize) -> u32 {
    let v = u32::from_le_bytes(bytes[*at..*at + 4].try_into().unwrap());
    *at += 4;
    v
}
fn read_u64(bytes: &[u8], at: &mut usize) -> u64 {
    let v = u64::from_le_bytes(bytes[*at..*at + 8].try_into().unwrap());
    *at += 8;
    v
}
fn read_u128(bytes: &[u8], at: &mut usize) -> u128 {
    let v = u128::from_le_bytes(bytes[*at..*at + 16].try_into().unwrap());
    *at += 16;
    v
}

/// spec §6 "Leaf": `u16 type, u16 version, u32 refCount, u32 payloadLength, payload`.
pub fn encode_leaf(ref_count: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + payload.len());
    out.extend_from_slice(&LEAF_MAGIC.to_le_bytes());
    out.extend_from_slice(&NODE_VERSION.to_le_bytes());
    out.extend_from_slice(&ref_count.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

pub struct DecodedLeaf {
    pub ref_count: u32,
    pub payload_range: std::ops::Range<usize>,
}

pub fn decode_leaf_header(bytes: &[u8]) -> TreeResult<DecodedLeaf> {
    let mut at = 0usize;
    if bytes.len() < 12 {
        return Err(TreeError::consistency("leaf record too short"));
    }
    let magic = read_u16(bytes, &mut at);
    if magic != LEAF_MAGIC {
        return Err(TreeError::consistency("bad leaf magic"));
    }
    let _version = read_u16(bytes, &mut at);
    let ref_count = read_u32(bytes, &mut at);
    let len = read_u32(bytes, &mut at) as usize;
    if bytes.len() < at + len {
        return Err(TreeError::consistency("leaf payload truncated"));
    }
    Ok(DecodedLeaf { ref_count, payload_range: at..at + len })
}

/// Rewrites only the `refCount` header field in an already-encoded leaf
/// record, used by `linkLeaf`/`disposeNode` (spec §4.7) to avoid rewriting
/// the whole payload on every refcount change.
pub fn patch_leaf_ref_count(bytes: &mut [u8], new_ref_count: u32) -> TreeResult<()> {
    if bytes.len() < 8 || u16::from_le_bytes(bytes[0..2].try_into().unwrap()) != LEAF_MAGIC {
        return Err(TreeError::consistency("bad leaf magic"));
    }
    bytes[4..8].copy_from_slice(&new_ref_count.to_le_bytes());
    Ok(())
}

/// spec §3 "Branch" word layout: for each child `i`, `[refHi, refLo,
/// subtreeByteCount]`, separated from the next by a 128-bit key. Total words
/// = `5*children - 2`.
pub fn branch_to_words(branch: &Branch) -> Vec<u64> {
    let n = branch.len();
    let mut words = Vec::with_capacity(5 * n - 2);
    for i in 0..n {
        let (hi, lo) = branch.child(i).to_words();
        words.push(hi);
        words.push(lo);
        words.push(branch.count(i));
        if i + 1 < n {
            let (khi, klo) = branch.key(i + 1).to_sort_words();
            words.push(khi);
            words.push(klo);
        }
    }
    words
}

pub fn words_to_branch(words: &[u64]) -> TreeResult<Branch> {
    if words.is_empty() || (words.len() + 2) % 5 != 0 {
        return Err(TreeError::consistency("malformed branch word count"));
    }
    let n = (words.len() + 2) / 5;
    let mut children = Vec::with_capacity(n);
    let mut counts = Vec::with_capacity(n);
    let mut keys = Vec::with_capacity(n - 1);
    let mut at = 0usize;
    for i in 0..n {
        let hi = words[at];
        let lo = words[at + 1];
        let cnt = words[at + 2];
        at += 3;
        children.push(NodeRef::from_words(hi, lo));
        counts.push(cnt);
        if i + 1 < n {
            let khi = words[at];
            let klo = words[at + 1];
            at += 2;
            keys.push(Key::from_sort_words(khi, klo));
        }
    }
    Ok(Branch::from_parts(children, counts, keys))
}

/// spec §6 "Branch" record: `u16 type, u16 version, u32 wordCount, words`.
pub fn encode_branch(branch: &Branch) -> Vec<u8> {
    let words = branch_to_words(branch);
    let mut out = Vec::with_capacity(8 + words.len() * 8);
    out.extend_from_slice(&BRANCH_MAGIC.to_le_bytes());
    out.extend_from_slice(&NODE_VERSION.to_le_bytes());
    out.extend_from_slice(&(words.len() as u32).to_le_bytes());
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

pub fn decode_branch(bytes: &[u8]) -> TreeResult<Branch> {
    let mut at = 0usize;
    if bytes.len() < 8 {
        return Err(TreeError::consistency("branch record too short"));
    }
    let magic = read_u16(bytes, &mut at);
    if magic != BRANCH_MAGIC {
        return Err(TreeError::consistency("bad branch magic"));
    }
    let _version = read_u16(bytes, &mut at);
    let word_count = read_u32(bytes, &mut at) as usize;
    if bytes.len() < at + word_count * 8 {
        return Err(TreeError::consistency("branch words truncated"));
    }
    let mut words = Vec::with_capacity(word_count);
    for _ in 0..word_count {
        words.push(read_u64(bytes, &mut at));
    }
    words_to_branch(&words)
}

/// spec §6 "Version record": `u32 magic, u32 version, u64 versionId, u128
/// rootRef, u32 deletedCount, deletedCount x u128 refs`.
pub fn encode_version_record(version_id: u64, root: NodeRef, deleted: &[NodeRef]) -> Vec<u8> {
    let mut out = Vec::with_capacity(24 + deleted.len() * 16);
    out.extend_from_slice(&VERSION_RECORD_MAGIC.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&version_id.to_le_bytes());
    let (hi, lo) = root.to_words();
    out.extend_from_slice(&(((hi as u128) << 64) | lo as u128).to_le_bytes());
    out.extend_from_slice(&(deleted.len() as u32).to_le_bytes());
    for r in deleted {
        let (hi, lo) = r.to_words();
        out.extend_from_slice(&(((hi as u128) << 64) | lo as u128).to_le_bytes());
    }
    out
}

pub struct DecodedVersionRecord {
    pub version_id: u64,
    pub root: NodeRef,
    pub deleted: Vec<NodeRef>,
}

pub fn decode_version_record(bytes: &[u8]) -> TreeResult<DecodedVersionRecord> {
    let mut at = 0usize;
    if bytes.len() < 24 {
        return Err(TreeError::consistency("version record too short"));
    }
    let magic = read_u32(bytes, &mut at);
    if magic != VERSION_RECORD_MAGIC {
        return Err(TreeError::consistency("bad version record magic"));
    }
    let _version = read_u32(bytes, &mut at);
    let version_id = read_u64(bytes, &mut at);
    let root_packed = read_u128(bytes, &mut at);
    let root = NodeRef::from_words((root_packed >> 64) as u64, root_packed as u64);
    let count = read_u32(bytes, &mut at) as usize;
    if bytes.len() < at + count * 16 {
        return Err(TreeError::consistency("version record deleted-list truncated"));
    }
    let mut deleted = Vec::with_capacity(count);
    for _ in 0..count {
        let packed = read_u128(bytes, &mut at);
        deleted.push(NodeRef::from_words((packed >> 64) as u64, packed as u64));
    }
    Ok(DecodedVersionRecord { version_id, root, deleted })
}
