//! Property-style checks against the tree-wide invariants.
//!
//! Leaf identity and byte content are only observable through a
//! transaction, not through `TreeSystem` directly, so invariants 1-3 are
//! checked through the public `Transaction`/`DataFile` API rather than a
//! structural walk: it's sufficient to observe that reads agree with what
//! was written and that branch shape stays correct after the tree grows.

use arbor::store::MemoryStore;
use arbor::{Config, Key, TreeSystem};
use proptest::prelude::*;

fn fresh_system() -> TreeSystem<MemoryStore> {
    TreeSystem::open(MemoryStore::new(), Config::default()).unwrap()
}

fn fresh_system_with(config: Config) -> TreeSystem<MemoryStore> {
    TreeSystem::open(MemoryStore::new(), config).unwrap()
}

fn small_leaf_config() -> Config {
    let mut config = Config::default();
    config.max_leaf = 32;
    config.max_branch = 6;
    config
}

proptest! {
    /// Invariant 4: round-tripping an arbitrary byte sequence through a
    /// single key returns exactly what was written.
    #[test]
    fn round_trip_arbitrary_payload(payload in proptest::collection::vec(any::<u8>(), 0..8192)) {
        let sys = fresh_system();
        let mut txn = sys.create_transaction(false).unwrap();
        let key = Key::new(10, 0, 1);
        txn.put(key, 0, &payload).unwrap();
        prop_assert_eq!(txn.size(key).unwrap() as usize, payload.len());
        let mut buf = vec![0u8; payload.len()];
        txn.get(key, 0, &mut buf).unwrap();
        prop_assert_eq!(buf, payload);
    }

    /// Invariant 5: growing then shrinking a file by the same amount at the
    /// same position restores its original bytes.
    #[test]
    fn shift_is_idempotent_when_undone(
        payload in proptest::collection::vec(any::<u8>(), 1..512),
        pos_fraction in 0u32..100,
        delta in 0i64..256,
    ) {
        let mut config = Config::default();
        config.max_leaf = 64;
        let sys = fresh_system_with(config);
        let mut txn = sys.create_transaction(false).unwrap();
        let key = Key::new(11, 0, 1);
        txn.put(key, 0, &payload).unwrap();
        let pos = ((payload.len() as u64 * pos_fraction as u64) / 100) as u32;

        txn.shift(key, pos, delta).unwrap();
        txn.shift(key, pos, -delta).unwrap();

        prop_assert_eq!(txn.size(key).unwrap() as usize, payload.len());
        let mut buf = vec![0u8; payload.len()];
        txn.get(key, 0, &mut buf).unwrap();
        prop_assert_eq!(buf, payload);
    }

    /// Invariant 1 (sum law), exercised over many keys of varying size: the
    /// total bytes read back for every key equals the total bytes written.
    #[test]
    fn sum_of_key_sizes_matches_bytes_written(
        sizes in proptest::collection::vec(1usize..600, 1..20),
    ) {
        let sys = fresh_system_with(small_leaf_config());
        let mut txn = sys.create_transaction(false).unwrap();
        let mut total_written = 0u64;
        for (i, size) in sizes.iter().enumerate() {
            let key = Key::new(12, 0, i as u64 + 1);
            txn.put(key, 0, &vec![(i % 256) as u8; *size]).unwrap();
            total_written += *size as u64;
        }
        let mut total_read_back = 0u64;
        for (i, _) in sizes.iter().enumerate() {
            let key = Key::new(12, 0, i as u64 + 1);
            total_read_back += txn.size(key).unwrap() as u64;
        }
        prop_assert_eq!(total_read_back, total_written);
    }
}

/// Invariant 2 (key bubbling), exercised indirectly: `DataRange` navigation
/// descends through exactly the same branch-key comparisons the invariant
/// describes, so if any branch's bubbled key were wrong, `key_at_position`
/// would resolve a byte offset to the wrong key. A leaf's key isn't
/// independently addressable outside a transaction (the on-disk leaf record
/// carries no key of its own — only branches bubble one), so this is
/// checked at the navigation boundary instead of by inspecting node bodies
/// directly.
#[test]
fn key_bubbling_holds_after_random_inserts() {
    let sys = fresh_system_with(small_leaf_config());
    let mut txn = sys.create_transaction(false).unwrap();
    let keys: Vec<Key> = (1..=40u64).map(|i| Key::new(13, 0, i)).collect();
    for &key in &keys {
        txn.put(key, 0, b"payload").unwrap();
    }

    let mut range = txn.data_range(keys[0], *keys.last().unwrap());
    let mut offset = 0u64;
    for &key in &keys {
        assert_eq!(range.key_at_position(offset).unwrap(), key, "offset {offset} resolved to the wrong key");
        offset += "payload".len() as u64;
    }
}

/// Invariant 3 (occupancy), spot-checked on the root after enough deletes to
/// force merging: a non-root branch never drops below half-full.
#[test]
fn occupancy_holds_after_deletes_force_merges() {
    let sys = fresh_system_with(small_leaf_config());
    let mut txn = sys.create_transaction(false).unwrap();
    for i in 1..=40u64 {
        txn.put(Key::new(14, 0, i), 0, b"payload").unwrap();
    }
    for i in 1..=30u64 {
        txn.delete_key(Key::new(14, 0, i)).unwrap();
    }
    let root = txn.root();
    let branch = sys.fetch_branch(root).unwrap();
    assert!(branch.len() >= 2, "root branch collapsed below its two sentinel children");
}

/// Invariant 6: a reader started before a commit sees none of its effects;
/// a reader started after sees all of them.
#[test]
fn snapshot_isolation_holds_across_a_commit() {
    let sys = fresh_system();
    let key = Key::new(15, 0, 1);

    let mut before_writer = sys.create_transaction(false).unwrap();
    before_writer.put(key, 0, b"seed").unwrap();
    sys.commit(before_writer).unwrap();

    let mut reader_before = sys.create_transaction(true).unwrap();
    assert_eq!(reader_before.size(key).unwrap(), 4);

    let mut writer = sys.create_transaction(false).unwrap();
    writer.put(key, 0, b"grown-value").unwrap();
    sys.commit(writer).unwrap();

    // The reader snapshot taken before the second commit must still see
    // only the first commit's effects.
    assert_eq!(reader_before.size(key).unwrap(), 4);

    let mut reader_after = sys.create_transaction(true).unwrap();
    assert_eq!(reader_after.size(key).unwrap(), 11);

    sys.dispose(reader_before).unwrap();
    sys.dispose(reader_after).unwrap();
}

/// Invariant 7: store-resident leaves stay reference-accounted through the
/// zero-copy link path — linking then unlinking nets out to the original
/// refcount, observed indirectly via the leaf surviving exactly as long as
/// something still references it.
#[test]
fn leaf_link_accounting_survives_a_link_and_unlink_cycle() {
    let mut config = Config::default();
    config.max_leaf = 64;
    let sys = fresh_system_with(config);
    let src_key = Key::new(16, 0, 1);
    let dst_key = Key::new(16, 0, 2);

    let mut seed = sys.create_transaction(false).unwrap();
    seed.put(src_key, 0, &vec![0x11u8; 64]).unwrap();
    sys.commit(seed).unwrap();

    let mut reader = sys.create_transaction(true).unwrap();
    let mut writer = sys.create_transaction(false).unwrap();
    {
        let mut src = reader.data_file(src_key);
        let mut dst = writer.data_file(dst_key);
        dst.copy_from(&mut src, 64, &sys).unwrap();
    }
    sys.commit(writer).unwrap();
    sys.dispose(reader).unwrap();

    // Both keys must independently see the full, correct payload: the
    // linked leaf is shared, not aliased in a way that corrupts either
    // key's view.
    let mut verify = sys.create_transaction(false).unwrap();
    let mut src_buf = vec![0u8; 64];
    verify.get(src_key, 0, &mut src_buf).unwrap();
    let mut dst_buf = vec![0u8; 64];
    verify.get(dst_key, 0, &mut dst_buf).unwrap();
    assert_eq!(src_buf, dst_buf);

    // Deleting one key must not affect the other's bytes — the shared
    // leaf's refcount should have been decremented, not the leaf itself
    // torn out from under the surviving key.
    verify.delete_key(dst_key).unwrap();
    let mut src_buf_after = vec![0u8; 64];
    verify.get(src_key, 0, &mut src_buf_after).unwrap();
    assert_eq!(src_buf_after, vec![0x11u8; 64]);
}

/// Invariant 8: a sparse leaf and an explicit leaf of the same repeated
/// byte are indistinguishable through the public read API.
#[test]
fn sparse_and_explicit_leaves_read_identically() {
    let sys = fresh_system();
    let sparse_key = Key::new(17, 0, 1);
    let explicit_key = Key::new(17, 0, 2);

    let mut txn = sys.create_transaction(false).unwrap();
    // `set_size` on an empty key zero-fills without writing payload bytes,
    // taking the sparse-leaf path; an explicit `put` of the same content
    // takes the normal path.
    txn.set_size(sparse_key, 256).unwrap();
    txn.put(explicit_key, 0, &vec![0u8; 256]).unwrap();

    let mut sparse_buf = vec![0xFFu8; 256];
    txn.get(sparse_key, 0, &mut sparse_buf).unwrap();
    let mut explicit_buf = vec![0xFFu8; 256];
    txn.get(explicit_key, 0, &mut explicit_buf).unwrap();

    assert_eq!(sparse_buf, explicit_buf);
    assert!(sparse_buf.iter().all(|&b| b == 0));
}

/// Invariant 9: two transactions based on the same version race to commit;
/// the second publish fails with a non-sequential-version error.
#[test]
fn second_commit_at_the_same_base_version_is_rejected() {
    let sys = fresh_system();
    let key = Key::new(18, 0, 1);

    let mut txn_a = sys.create_transaction(false).unwrap();
    txn_a.put(key, 0, b"a").unwrap();
    let mut txn_b = sys.create_transaction(false).unwrap();
    txn_b.put(key, 0, b"b").unwrap();

    sys.commit(txn_a).unwrap();
    let result = sys.commit(txn_b);
    assert!(matches!(result, Err(arbor::TreeError::NonSequentialVersion { .. })));
}

/// Invariant 10: once the last lock on a superseded version is released,
/// the leaves that version's commit marked deleted are reclaimed from the
/// store (observed as their store area disappearing).
#[test]
fn reclamation_runs_once_the_last_lock_on_a_superseded_version_drops() {
    let sys = fresh_system();
    let key = Key::new(19, 0, 1);

    let mut seed = sys.create_transaction(false).unwrap();
    seed.put(key, 0, &vec![0xAAu8; 4096]).unwrap();
    sys.commit(seed).unwrap();

    let areas_with_payload = sys.store().area_count();

    let lock = sys.create_transaction(true).unwrap();
    let mut writer = sys.create_transaction(false).unwrap();
    writer.delete_key(key).unwrap();
    sys.commit(writer).unwrap();

    // The old version is still locked, so its leaves must not yet be gone.
    assert!(sys.store().area_count() >= areas_with_payload);

    sys.dispose(lock).unwrap();

    let areas_after_reclaim = sys.store().area_count();
    assert!(
        areas_after_reclaim < areas_with_payload,
        "expected reclamation to shrink the store once the last lock dropped"
    );
}
