//! Workload cache implementation.

use crate::models::{WorkloadInfo, WorkloadSummary, WorkloadUid};
use crate::netns::{NamespaceHandle, NamespaceId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// One cache entry.
#[derive(Debug, Clone)]
pub struct CachedWorkload {
    pub info: WorkloadInfo,
    /// Absent until the namespace has been resolved.
    pub netns: Option<Arc<NamespaceHandle>>,
}

impl CachedWorkload {
    pub fn netns_id(&self) -> Option<&NamespaceId> {
        self.netns.as_deref().map(NamespaceHandle::id)
    }
}

/// Point-in-time copy of the cache.
///
/// Entries are shallow clones: namespace handles are shared with the cache,
/// so iterating a snapshot never holds the cache lock.
#[derive(Debug, Clone, Default)]
pub struct WorkloadSnapshot {
    entries: HashMap<WorkloadUid, CachedWorkload>,
}

impl WorkloadSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, uid: &WorkloadUid) -> Option<&CachedWorkload> {
        self.entries.get(uid)
    }

    pub fn contains(&self, uid: &WorkloadUid) -> bool {
        self.entries.contains_key(uid)
    }

    /// Entries ordered by identity, for a deterministic replay order.
    pub fn sorted(&self) -> Vec<(&WorkloadUid, &CachedWorkload)> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    /// Listing rows for the ingress `list_workloads` method.
    pub fn summaries(&self) -> Vec<WorkloadSummary> {
        self.sorted()
            .into_iter()
            .map(|(uid, entry)| WorkloadSummary {
                uid: uid.clone(),
                info: entry.info.clone(),
                netns_id: entry.netns_id().map(|id| id.to_string()),
            })
            .collect()
    }
}

/// Thread-safe map of node-local workloads.
#[derive(Debug, Default)]
pub struct WorkloadCache {
    entries: RwLock<HashMap<WorkloadUid, CachedWorkload>>,
}

impl WorkloadCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<WorkloadUid, CachedWorkload>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<WorkloadUid, CachedWorkload>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or update `uid`, returning the handle the cache now owns.
    ///
    /// - New identity: the entry is inserted as given.
    /// - Existing handle with the same namespace id: metadata is replaced, the
    ///   existing handle is kept and returned, and `netns` is dropped.
    /// - Existing handle with a different namespace id: the entry is replaced
    ///   and the cache releases its reference on the old handle.
    /// - No incoming handle: metadata is replaced and any existing handle is
    ///   kept.
    pub fn upsert(
        &self,
        uid: WorkloadUid,
        info: WorkloadInfo,
        netns: Option<Arc<NamespaceHandle>>,
    ) -> Option<Arc<NamespaceHandle>> {
        let mut entries = self.write();

        let existing = entries.get(&uid).and_then(|entry| entry.netns.clone());
        let netns = match (existing, netns) {
            (Some(existing), Some(incoming)) if existing.id() == incoming.id() => {
                debug!(uid = %uid, netns = %existing.id(), "namespace unchanged, keeping cached handle");
                Some(existing)
            }
            (Some(existing), Some(incoming)) => {
                debug!(
                    uid = %uid,
                    old = %existing.id(),
                    new = %incoming.id(),
                    "namespace changed, replacing cached handle"
                );
                Some(incoming)
            }
            (Some(existing), None) => Some(existing),
            (None, incoming) => incoming,
        };

        entries.insert(
            uid,
            CachedWorkload {
                info,
                netns: netns.clone(),
            },
        );
        netns
    }

    /// Get the namespace handle for `uid`, if both are known.
    pub fn get(&self, uid: &WorkloadUid) -> Option<Arc<NamespaceHandle>> {
        self.read().get(uid).and_then(|entry| entry.netns.clone())
    }

    pub fn contains(&self, uid: &WorkloadUid) -> bool {
        self.read().contains_key(uid)
    }

    /// Copy the whole cache under the read lock.
    pub fn snapshot(&self) -> WorkloadSnapshot {
        WorkloadSnapshot {
            entries: self.read().clone(),
        }
    }

    /// Remove `uid`, returning its entry.
    pub fn remove(&self, uid: &WorkloadUid) -> Option<CachedWorkload> {
        self.write().remove(uid)
    }

    /// Find the workload holding the namespace with `id`.
    pub fn find_by_namespace_id(&self, id: &NamespaceId) -> Option<WorkloadUid> {
        self.read()
            .iter()
            .find(|(_, entry)| entry.netns_id() == Some(id))
            .map(|(uid, _)| uid.clone())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
