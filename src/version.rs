//! Version list and reclamation (spec §4.7 "Version management", §9
//! "Multi-version concurrency").
//!
//! Every commit appends a new [`Version`]; open transactions each hold a
//! lock on the version they started from so concurrent readers never see a
//! root that has been reclaimed out from under them. A version's leaves
//! become eligible for physical deletion only once every version at or
//! before it is unlocked — the same oldest-first discipline the teacher's
//! blob store uses for `keep`.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::noderef::NodeRef;

/// One committed snapshot: the root it points to, and the store-resident
/// leaves that stopped being reachable as of this commit (spec §4.5 "leaves
/// unlinked during a delete are recorded against the version that unlinked
/// them, not deleted immediately").
#[derive(Debug, Clone)]
pub struct Version {
    pub version_id: u64,
    pub root: NodeRef,
    pub deleted_leaves: Vec<NodeRef>,
}

struct Entry {
    version: Version,
    lock_count: u64,
}

struct Inner {
    entries: VecDeque<Entry>,
}

/// Append-only sequence of versions with reference-counted retention.
pub struct VersionList {
    inner: Mutex<Inner>,
}

impl VersionList {
    /// Seeds the list with an empty initial version (`versionId == 0`, a
    /// sparse-empty root) that is never reclaimed on its own — every real
    /// tree has at least this one version.
    pub fn new(genesis_root: NodeRef) -> Self {
        VersionList {
            inner: Mutex::new(Inner {
                entries: VecDeque::from([Entry {
                    version: Version { version_id: 0, root: genesis_root, deleted_leaves: Vec::new() },
                    lock_count: 1,
                }]),
            }),
        }
    }

    /// spec §4.7 `commit`: appends a new version. The caller is responsible
    /// for having already checked `version_id == latest().version_id + 1`.
    pub fn append(&self, version_id: u64, root: NodeRef, deleted_leaves: Vec<NodeRef>) {
        let mut inner = self.inner.lock();
        inner.entries.push_back(Entry {
            version: Version { version_id, root, deleted_leaves },
            lock_count: 0,
        });
    }

    pub fn latest(&self) -> Version {
        let inner = self.inner.lock();
        inner.entries.back().expect("version list is never empty").version.clone()
    }

    pub fn latest_version_id(&self) -> u64 {
        self.inner.lock().entries.back().expect("version list is never empty").version.version_id
    }

    /// Opens a new reader/writer against the latest version, bumping its
    /// lock count, and returns the snapshot it should see.
    pub fn acquire_latest(&self) -> Version {
        let mut inner = self.inner.lock();
        let entry = inner.entries.back_mut().expect("version list is never empty");
        entry.lock_count += 1;
        entry.version.clone()
    }

    pub fn acquire(&self, version_id: u64) -> Option<Version> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.iter_mut().find(|e| e.version.version_id == version_id)?;
        entry.lock_count += 1;
        Some(entry.version.clone())
    }

    /// Releases one lock on `version_id`, then reclaims every version from
    /// the front of the list whose lock count has dropped to zero, stopping
    /// at the first still-locked (or the last remaining) entry — spec §4.7
    /// "reclamation never skips over a locked version". Returns leaves freed
    /// by the reclaimed versions for the caller to actually unlink from the
    /// store.
    pub fn release(&self, version_id: u64) -> Vec<NodeRef> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.version.version_id == version_id) {
            entry.lock_count = entry.lock_count.saturating_sub(1);
        }

        let mut reclaimed = Vec::new();
        while inner.entries.len() > 1 {
            let is_reclaimable = inner.entries.front().map(|e| e.lock_count == 0).unwrap_or(false);
            if !is_reclaimable {
                break;
            }
            let front = inner.entries.pop_front().expect("checked non-empty above");
            reclaimed.extend(front.version.deleted_leaves);
        }
        reclaimed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reclamation_waits_for_all_locks_to_drop() {
        let list = VersionList::new(NodeRef::sparse(0, 0));
        // version 0 starts with one implicit lock from `new`.
        list.append(1, NodeRef::store_area(1), vec![NodeRef::store_area(100)]);
        let _v1 = list.acquire(1).unwrap();
        list.append(2, NodeRef::store_area(2), vec![]);
        assert_eq!(list.len(), 3);

        // version 1 is still locked, so releasing version 0 can reclaim only
        // version 0 itself (no deleted leaves) and must stop before version 1.
        let freed = list.release(0);
        assert!(freed.is_empty());
        assert_eq!(list.len(), 2);

        // releasing version 1's lock now unlocks it, and since it is no
        // longer the latest version it is free to be reclaimed, surfacing
        // the leaves it deleted.
        let freed = list.release(1);
        assert_eq!(freed, vec![NodeRef::store_area(100)]);
        assert_eq!(list.len(), 1);

        // the sole remaining (current) version is never reclaimed.
        let freed = list.release(2);
        assert!(freed.is_empty());
        assert_eq!(list.len(), 1);
    }
}
