//! Reconciliation of the probe set against the live workload set.

use super::{IpSetBackend, IpSetEntry};
use crate::config::IpFamily;
use crate::error::{NodeAgentError, Result};
use crate::models::{Workload, WorkloadUid};
use crate::telemetry::Telemetry;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Sole writer of the probe set.
pub struct IpSetSynchronizer {
    backend: Arc<dyn IpSetBackend>,
    family: IpFamily,
    telemetry: Telemetry,
}

impl IpSetSynchronizer {
    pub fn new(backend: Arc<dyn IpSetBackend>, family: IpFamily, telemetry: Telemetry) -> Self {
        Self {
            backend,
            family,
            telemetry: telemetry.for_component("ipset"),
        }
    }

    pub fn backend(&self) -> &Arc<dyn IpSetBackend> {
        &self.backend
    }

    /// Create the set if it does not exist.
    pub async fn create(&self) -> Result<()> {
        self.backend.create().await
    }

    /// Current entries.
    pub async fn entries(&self) -> Result<Vec<IpSetEntry>> {
        self.backend.list().await
    }

    fn in_family(&self, uid: &WorkloadUid, address: &IpAddr) -> bool {
        if self.family.contains(address) {
            return true;
        }
        debug!(uid = %uid, address = %address, family = self.family.as_str(), "skipping address outside set family");
        false
    }

    /// Add `addresses` for `uid` without replacing existing entries.
    ///
    /// An address already in the set is a collision: duplicate workload
    /// addresses point at broken address management and must surface rather
    /// than be papered over. Returns the addresses that were added and the
    /// aggregated failures for the rest.
    pub async fn add_addresses(
        &self,
        uid: &WorkloadUid,
        addresses: &[IpAddr],
    ) -> (Vec<IpAddr>, Result<()>) {
        let mut added = Vec::new();
        let mut errors = Vec::new();

        for address in addresses.iter().filter(|a| self.in_family(uid, a)) {
            debug!(uid = %uid, address = %address, set = self.backend.name(), "adding probe address");
            let entry = IpSetEntry::new(*address, uid.clone());
            match self.backend.add(&entry, false).await {
                Ok(()) => added.push(*address),
                Err(e) => {
                    if e.is_address_collision() {
                        self.telemetry.metrics().record_ipset_collision();
                    }
                    error!(uid = %uid, address = %address, set = self.backend.name(), "failed adding probe address: {}", e);
                    errors.push(e);
                }
            }
        }

        (added, NodeAgentError::join(errors))
    }

    /// Reconcile the set with `workloads`.
    ///
    /// Entries already owned by the right workload are left alone, missing
    /// ones are added, and every entry outside the expected set is pruned.
    /// When the set already matches, nothing is written. An address counts
    /// as duplicated only when two snapshot workloads list it: the current
    /// owner (or the lower identity) keeps it and the other is reported as a
    /// collision. An entry whose owner no longer lists the address is
    /// reclaimed.
    pub async fn sync_from_snapshot(&self, workloads: &[Workload]) -> Result<()> {
        let actual = match self.backend.list().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("unable to list probe set {}: {}", self.backend.name(), e);
                return Err(e);
            }
        };
        let mut owners: HashMap<IpAddr, WorkloadUid> = actual
            .into_iter()
            .map(|entry| (entry.address, entry.owner))
            .collect();
        let wanted: HashSet<(IpAddr, WorkloadUid)> = workloads
            .iter()
            .flat_map(|w| w.addresses.iter().map(|address| (*address, w.uid.clone())))
            .collect();

        let mut sorted: Vec<&Workload> = workloads.iter().collect();
        sorted.sort_by(|a, b| a.uid.cmp(&b.uid));

        let mut expected: HashSet<IpAddr> = HashSet::new();
        let mut errors = Vec::new();

        for workload in sorted {
            if workload.addresses.is_empty() {
                warn!(uid = %workload.uid, name = %workload.info.name, "workload has no assigned addresses, not syncing with probe set");
                continue;
            }
            let uid = &workload.uid;

            for address in workload.addresses.iter().filter(|a| self.in_family(uid, a)) {
                let claimed = expected.contains(address);
                let replace = match owners.get(address) {
                    Some(owner) if owner == uid => {
                        expected.insert(*address);
                        continue;
                    }
                    Some(owner) if claimed || wanted.contains(&(*address, owner.clone())) => {
                        self.telemetry.metrics().record_ipset_collision();
                        error!(uid = %uid, address = %address, owner = %owner, "address collision, workload will fail health checks");
                        errors.push(NodeAgentError::AddressCollision {
                            address: *address,
                            uid: uid.clone(),
                            owner: owner.to_string(),
                        });
                        continue;
                    }
                    // Left behind by a departed workload or one that moved off it.
                    Some(_) => true,
                    None => false,
                };

                let entry = IpSetEntry::new(*address, uid.clone());
                match self.backend.add(&entry, replace).await {
                    Ok(()) => {
                        owners.insert(*address, uid.clone());
                        expected.insert(*address);
                    }
                    Err(e) => {
                        if e.is_address_collision() {
                            self.telemetry.metrics().record_ipset_collision();
                        }
                        error!(uid = %uid, address = %address, "failed adding probe address during sync: {}", e);
                        errors.push(e);
                    }
                }
            }
        }

        let mut stale: Vec<IpAddr> = owners
            .keys()
            .filter(|address| !expected.contains(address))
            .copied()
            .collect();
        stale.sort();
        for address in stale {
            match self.backend.delete_address(address).await {
                Ok(()) => debug!(address = %address, set = self.backend.name(), "removed stale probe address"),
                Err(e) => errors.push(e),
            }
        }

        info!(
            set = self.backend.name(),
            entries = expected.len(),
            "probe set reconciled"
        );
        NodeAgentError::join(errors)
    }

    /// Remove every entry owned by `uid`.
    pub async fn remove_workload(&self, uid: &WorkloadUid) -> Result<()> {
        let entries = self.backend.list().await?;
        let mut errors = Vec::new();
        for entry in entries.into_iter().filter(|entry| &entry.owner == uid) {
            match self.backend.delete_address(entry.address).await {
                Ok(()) => {
                    debug!(uid = %uid, address = %entry.address, set = self.backend.name(), "removed probe address")
                }
                Err(e) => errors.push(e),
            }
        }
        NodeAgentError::join(errors)
    }

    /// Flush and destroy the set on clean shutdown.
    pub async fn teardown(&self) -> Result<()> {
        info!(set = self.backend.name(), "destroying probe set");
        let mut errors = Vec::new();
        if let Err(e) = self.backend.flush().await {
            warn!("could not flush probe set: {}", e);
            errors.push(e);
        }
        if let Err(e) = self.backend.destroy().await {
            warn!("could not destroy probe set: {}", e);
            errors.push(e);
        }
        NodeAgentError::join(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipset::InMemoryIpSet;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    async fn synchronizer() -> (IpSetSynchronizer, Arc<InMemoryIpSet>) {
        let set = Arc::new(InMemoryIpSet::new("probes"));
        let sync = IpSetSynchronizer::new(set.clone(), IpFamily::Inet, Telemetry::new());
        sync.create().await.unwrap();
        (sync, set)
    }

    #[tokio::test]
    async fn test_add_addresses_reports_partial_success() {
        let (sync, set) = synchronizer().await;
        let a = WorkloadUid::new("a");
        let b = WorkloadUid::new("b");
        let (added, result) = sync.add_addresses(&a, &[addr("10.0.0.1")]).await;
        assert_eq!(added, vec![addr("10.0.0.1")]);
        assert!(result.is_ok());

        let (added, result) = sync
            .add_addresses(&b, &[addr("10.0.0.1"), addr("10.0.0.2")])
            .await;
        assert_eq!(added, vec![addr("10.0.0.2")]);
        assert!(result.unwrap_err().is_address_collision());

        let owners: Vec<_> = set.entries().into_iter().map(|e| e.owner).collect();
        assert_eq!(owners, vec![a, b]);
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let (sync, set) = synchronizer().await;
        let workloads = vec![
            Workload::new("a", "ns", "a").with_addresses([addr("10.0.0.1")]),
            Workload::new("b", "ns", "b").with_addresses([addr("10.0.0.2"), addr("10.0.0.3")]),
        ];

        sync.sync_from_snapshot(&workloads).await.unwrap();
        let after_first = set.mutations();
        assert_eq!(set.entries().len(), 3);

        sync.sync_from_snapshot(&workloads).await.unwrap();
        assert_eq!(set.mutations(), after_first);
    }

    #[tokio::test]
    async fn test_sync_prunes_stale_entries() {
        let (sync, set) = synchronizer().await;
        set.add(&IpSetEntry::new(addr("10.0.0.9"), "gone".into()), false)
            .await
            .unwrap();

        let workloads = vec![Workload::new("a", "ns", "a").with_addresses([addr("10.0.0.1")])];
        sync.sync_from_snapshot(&workloads).await.unwrap();

        let addresses: Vec<_> = set.entries().into_iter().map(|e| e.address).collect();
        assert_eq!(addresses, vec![addr("10.0.0.1")]);
    }

    #[tokio::test]
    async fn test_sync_reclaims_address_from_departed_owner() {
        let (sync, set) = synchronizer().await;
        set.add(&IpSetEntry::new(addr("10.0.0.1"), "gone".into()), false)
            .await
            .unwrap();

        let workloads = vec![Workload::new("new", "ns", "n").with_addresses([addr("10.0.0.1")])];
        sync.sync_from_snapshot(&workloads).await.unwrap();

        assert_eq!(set.entries()[0].owner.as_str(), "new");
    }

    #[tokio::test]
    async fn test_restart_keeps_live_entries_and_prunes_stale() {
        let (sync, set) = synchronizer().await;
        let _ = sync
            .add_addresses(&"a".into(), &[addr("10.0.0.1")])
            .await;
        let _ = sync
            .add_addresses(&"gone".into(), &[addr("10.0.0.9")])
            .await;

        // A restarted agent creates the set again before reconciling.
        sync.create().await.unwrap();
        assert_eq!(set.entries().len(), 2);

        let workloads = vec![Workload::new("a", "ns", "a").with_addresses([addr("10.0.0.1")])];
        sync.sync_from_snapshot(&workloads).await.unwrap();

        let entries = set.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].owner.as_str(), "a");
    }

    #[tokio::test]
    async fn test_sync_reclaims_address_moved_off_live_owner() {
        let (sync, set) = synchronizer().await;
        set.add(&IpSetEntry::new(addr("10.0.0.1"), "x".into()), false)
            .await
            .unwrap();

        let workloads = vec![
            Workload::new("x", "ns", "x").with_addresses([addr("10.0.0.2")]),
            Workload::new("y", "ns", "y").with_addresses([addr("10.0.0.1")]),
        ];
        sync.sync_from_snapshot(&workloads).await.unwrap();

        let entries: Vec<_> = set
            .entries()
            .into_iter()
            .map(|e| (e.address, e.owner))
            .collect();
        assert_eq!(
            entries,
            vec![
                (addr("10.0.0.1"), WorkloadUid::new("y")),
                (addr("10.0.0.2"), WorkloadUid::new("x")),
            ]
        );

        let after_first = set.mutations();
        sync.sync_from_snapshot(&workloads).await.unwrap();
        assert_eq!(set.mutations(), after_first);
    }

    #[tokio::test]
    async fn test_live_owner_keeps_address_it_still_lists() {
        let (sync, set) = synchronizer().await;
        set.add(&IpSetEntry::new(addr("10.0.0.1"), "z".into()), false)
            .await
            .unwrap();

        let workloads = vec![
            Workload::new("a", "ns", "a").with_addresses([addr("10.0.0.1")]),
            Workload::new("z", "ns", "z").with_addresses([addr("10.0.0.1")]),
        ];
        let err = sync.sync_from_snapshot(&workloads).await.unwrap_err();
        assert!(err.is_address_collision());

        let entries = set.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].owner.as_str(), "z");
    }

    #[tokio::test]
    async fn test_duplicate_address_excludes_one_workload() {
        let (sync, set) = synchronizer().await;
        let workloads = vec![
            Workload::new("b", "ns", "b").with_addresses([addr("10.0.0.1")]),
            Workload::new("a", "ns", "a").with_addresses([addr("10.0.0.1")]),
        ];

        let err = sync.sync_from_snapshot(&workloads).await.unwrap_err();
        assert!(err.is_address_collision());

        let entries = set.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].owner.as_str(), "a");
    }

    #[tokio::test]
    async fn test_remove_workload_by_owner_tag() {
        let (sync, set) = synchronizer().await;
        let a = WorkloadUid::new("a");
        let b = WorkloadUid::new("b");
        let _ = sync.add_addresses(&a, &[addr("10.0.0.1"), addr("10.0.0.2")]).await;
        let _ = sync.add_addresses(&b, &[addr("10.0.0.3")]).await;

        sync.remove_workload(&a).await.unwrap();

        let owners: Vec<_> = set.entries().into_iter().map(|e| e.owner).collect();
        assert_eq!(owners, vec![b]);
    }

    #[tokio::test]
    async fn test_addresses_outside_family_are_skipped() {
        let (sync, set) = synchronizer().await;
        let (added, result) = sync
            .add_addresses(&"a".into(), &[addr("fd00::1"), addr("10.0.0.1")])
            .await;
        assert!(result.is_ok());
        assert_eq!(added, vec![addr("10.0.0.1")]);
        assert_eq!(set.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_teardown_destroys_set() {
        let (sync, set) = synchronizer().await;
        let _ = sync.add_addresses(&"a".into(), &[addr("10.0.0.1")]).await;
        sync.teardown().await.unwrap();
        assert!(!set.exists());
    }
}
