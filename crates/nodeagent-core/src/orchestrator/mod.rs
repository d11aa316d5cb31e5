//! Workload enrollment orchestration.
//!
//! [`MeshDataplane`] owns one agent's components and sequences each workload
//! event across them: the dataplane, the platform's enrollment annotation,
//! and the health-probe IP set.

mod builder;

pub use builder::MeshDataplaneBuilder;

use crate::cancel::CancellationToken;
use crate::config::AgentConfig;
use crate::dataplane::DataplaneServer;
use crate::error::{NodeAgentError, Result};
use crate::ipset::IpSetSynchronizer;
use crate::models::{Workload, WorkloadSummary};
use crate::platform::WorkloadPlatform;
use crate::telemetry::{MetricsSnapshot, Telemetry};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

/// Point-in-time view of the agent, served over the ingress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub ready: bool,
    pub live_connections: usize,
    /// Id of the connection adds are sent to.
    pub active_connection: Option<String>,
    pub cached_workloads: usize,
    pub metrics: MetricsSnapshot,
}

/// Node agent for one node's mesh dataplane.
pub struct MeshDataplane {
    server: Arc<DataplaneServer>,
    ipset: IpSetSynchronizer,
    platform: Arc<dyn WorkloadPlatform>,
    telemetry: Telemetry,
    ready: AtomicBool,
    cancel: CancellationToken,
    server_task: std::sync::Mutex<Option<JoinHandle<Result<()>>>>,
}

impl MeshDataplane {
    pub fn builder(config: AgentConfig) -> MeshDataplaneBuilder {
        MeshDataplaneBuilder::new(config)
    }

    fn new(
        server: Arc<DataplaneServer>,
        ipset: IpSetSynchronizer,
        platform: Arc<dyn WorkloadPlatform>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            server,
            ipset,
            platform,
            telemetry,
            ready: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            server_task: std::sync::Mutex::new(None),
        }
    }

    pub fn server(&self) -> &DataplaneServer {
        &self.server
    }

    pub fn ipset(&self) -> &IpSetSynchronizer {
        &self.ipset
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Token cancelled by [`MeshDataplane::stop`].
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True once the initial snapshot has been constructed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Discover node-local workloads, seed the cache and reconcile the IP set.
    ///
    /// Runs once, before [`MeshDataplane::start`]. The agent is marked ready
    /// even if some step failed; every failure is logged and returned.
    pub async fn construct_initial_snapshot(&self) -> Result<()> {
        let workloads = match self.platform.list_node_workloads().await {
            Ok(workloads) => workloads,
            Err(e) => {
                error!("unable to list node-local workloads, starting with an empty snapshot: {}", e);
                self.ready.store(true, Ordering::Release);
                return Err(e);
            }
        };
        info!(workloads = workloads.len(), "constructing initial snapshot");

        let mut errors = Vec::new();
        if let Err(e) = self.server.construct_initial_snapshot(&workloads).await {
            warn!("initial snapshot is incomplete: {}", e);
            errors.push(e);
        }
        match self.ipset.create().await {
            Ok(()) => {
                if let Err(e) = self.ipset.sync_from_snapshot(&workloads).await {
                    warn!("probe set reconciliation failed: {}", e);
                    errors.push(e);
                }
            }
            Err(e) => {
                error!("unable to create probe set: {}", e);
                errors.push(e);
            }
        }

        self.ready.store(true, Ordering::Release);
        info!("node agent ready");
        NodeAgentError::join(errors)
    }

    /// Spawn the dataplane accept loop.
    pub fn start(&self) -> Result<()> {
        let mut task = self.server_task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return Err(NodeAgentError::Config {
                message: "node agent is already started".to_string(),
            });
        }
        let server = Arc::clone(&self.server);
        let cancel = self.cancel.child_token();
        *task = Some(tokio::spawn(
            server.run(cancel).instrument(self.telemetry.span()),
        ));
        Ok(())
    }

    /// Enroll `workload`.
    ///
    /// A dataplane failure other than a partial enrollment aborts before the
    /// platform or the IP set is touched. The addresses are registered for
    /// health-probe redirection only once both the dataplane and the platform
    /// accepted the workload.
    pub async fn add_workload(&self, workload: &Workload) -> Result<()> {
        let uid = &workload.uid;
        let metrics = self.telemetry.metrics();
        let mut errors = Vec::new();
        let mut partial = false;

        match self.server.workload_added(&self.cancel, workload).await {
            Ok(()) => {}
            Err(e) if e.is_partial_enrollment() => {
                warn!(uid = %uid, name = %workload.info.name, "workload partially enrolled: {}", e);
                partial = true;
                errors.push(e);
            }
            Err(e) => {
                error!(uid = %uid, name = %workload.info.name, "failed to enroll workload: {}", e);
                metrics.record_failed_add();
                return Err(e);
            }
        }

        let annotated = match self.platform.annotate_enrolled(workload).await {
            Ok(()) => true,
            Err(e) => {
                error!(uid = %uid, "failed to annotate workload enrolled: {}", e);
                errors.push(e);
                false
            }
        };

        if !partial && annotated {
            let (added, result) = self.ipset.add_addresses(uid, &workload.addresses).await;
            info!(uid = %uid, addresses = added.len(), "workload enrolled");
            if let Err(e) = result {
                errors.push(e);
            }
        }

        if partial {
            metrics.record_partially_enrolled();
        } else if errors.is_empty() {
            metrics.record_enrolled();
        } else {
            metrics.record_failed_add();
        }
        NodeAgentError::join(errors)
    }

    /// Unenroll `workload`.
    ///
    /// Probe set entries go first and unconditionally. The enrollment
    /// annotation is only removed once every dataplane connection has
    /// dropped the workload.
    pub async fn remove_workload(&self, workload: &Workload) -> Result<()> {
        let uid = &workload.uid;
        let mut errors = Vec::new();

        if let Err(e) = self.ipset.remove_workload(uid).await {
            error!(uid = %uid, "failed to remove probe addresses: {}", e);
            errors.push(e);
        }

        if let Err(e) = self.server.workload_deleted(&self.cancel, uid).await {
            error!(uid = %uid, "dataplane failed to remove workload, keeping annotation: {}", e);
            errors.push(e);
            self.telemetry.metrics().record_removal(false);
            return NodeAgentError::join(errors);
        }

        if let Err(e) = self.platform.annotate_unenrolled(workload).await {
            error!(uid = %uid, "failed to remove enrollment annotation: {}", e);
            errors.push(e);
        }

        self.telemetry.metrics().record_removal(errors.is_empty());
        if errors.is_empty() {
            info!(uid = %uid, name = %workload.info.name, "workload removed");
        }
        NodeAgentError::join(errors)
    }

    /// Workloads currently known to the dataplane side.
    pub fn list_workloads(&self) -> Vec<WorkloadSummary> {
        self.server.snapshot().summaries()
    }

    pub fn status(&self) -> AgentStatus {
        let connections = self.server.connections();
        AgentStatus {
            ready: self.is_ready(),
            live_connections: connections.count(),
            active_connection: connections.active().map(|conn| conn.id().to_string()),
            cached_workloads: self.server.cache().len(),
            metrics: self.telemetry.metrics().snapshot(),
        }
    }

    /// Close the listener and every connection, then destroy the probe set.
    pub async fn stop(&self) -> Result<()> {
        info!("stopping node agent");
        self.cancel.cancel();

        let task = self
            .server_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let mut errors = Vec::new();
        if let Some(task) = task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(NodeAgentError::Other(format!(
                    "dataplane server task failed: {}",
                    e
                ))),
            }
        } else {
            self.server.connections().close_all();
        }

        if let Err(e) = self.ipset.teardown().await {
            errors.push(e);
        }
        NodeAgentError::join(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipset::InMemoryIpSet;
    use crate::netns::StaticNamespaceResolver;
    use crate::platform::InMemoryPlatform;
    use std::net::IpAddr;

    struct Fixture {
        _dir: tempfile::TempDir,
        agent: MeshDataplane,
        ipset: Arc<InMemoryIpSet>,
        platform: Arc<InMemoryPlatform>,
    }

    fn fixture(workloads: Vec<Workload>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            dataplane_socket: dir.path().join("dp.sock"),
            ingress_socket: dir.path().join("ingress.sock"),
            ..AgentConfig::default()
        };
        let resolver = Arc::new(StaticNamespaceResolver::new());
        resolver.insert("/netns/p1", "ns-1");
        let ipset = Arc::new(InMemoryIpSet::new("probes"));
        let platform = Arc::new(InMemoryPlatform::with_workloads(workloads));

        let agent = MeshDataplane::builder(config)
            .resolver(resolver)
            .ipset_backend(ipset.clone())
            .platform(platform.clone())
            .build()
            .unwrap();
        Fixture {
            _dir: dir,
            agent,
            ipset,
            platform,
        }
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_initial_snapshot_marks_ready_and_syncs() {
        let p1 = Workload::new("p1", "default", "a")
            .with_netns("/netns/p1")
            .with_addresses(vec![addr("10.0.0.1")]);
        let f = fixture(vec![p1]);
        assert!(!f.agent.is_ready());

        f.agent.construct_initial_snapshot().await.unwrap();

        assert!(f.agent.is_ready());
        assert_eq!(f.agent.list_workloads().len(), 1);
        assert_eq!(f.ipset.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_add_is_annotated_but_not_redirected() {
        let f = fixture(vec![]);
        f.agent.construct_initial_snapshot().await.unwrap();
        let mutations = f.ipset.mutations();

        let p3 = Workload::new("p3", "default", "c")
            .with_netns("/netns/p1")
            .with_addresses(vec![addr("10.0.0.3")]);
        let err = f.agent.add_workload(&p3).await.unwrap_err();

        assert!(err.is_partial_enrollment());
        assert!(f.platform.is_enrolled(&p3.uid));
        assert_eq!(f.ipset.mutations(), mutations);
        assert_eq!(f.agent.telemetry().metrics().snapshot().partially_enrolled, 1);
    }

    #[tokio::test]
    async fn test_broken_namespace_aborts_add() {
        let f = fixture(vec![]);
        let resolver = Arc::new(StaticNamespaceResolver::new());
        resolver.fail("/netns/broken");
        let dir = tempfile::tempdir().unwrap();
        let agent = MeshDataplane::builder(AgentConfig {
            dataplane_socket: dir.path().join("dp.sock"),
            ingress_socket: dir.path().join("ingress.sock"),
            ..AgentConfig::default()
        })
        .resolver(resolver)
        .ipset_backend(f.ipset.clone())
        .platform(f.platform.clone())
        .build()
        .unwrap();

        let workload = Workload::new("p9", "default", "x").with_netns("/netns/broken");
        let err = agent.add_workload(&workload).await.unwrap_err();

        assert!(!err.is_partial_enrollment());
        assert!(!f.platform.is_enrolled(&workload.uid));
        assert_eq!(agent.telemetry().metrics().snapshot().failed_adds, 1);
    }

    #[tokio::test]
    async fn test_remove_without_connections_unannotates() {
        let p1 = Workload::new("p1", "default", "a").with_addresses(vec![addr("10.0.0.1")]);
        let f = fixture(vec![p1.clone()]);
        f.agent.construct_initial_snapshot().await.unwrap();
        f.agent.add_workload(&p1).await.unwrap_err();
        assert!(f.platform.is_enrolled(&p1.uid));

        f.agent.remove_workload(&p1).await.unwrap();

        assert!(f.ipset.entries().is_empty());
        assert!(!f.platform.is_enrolled(&p1.uid));
        assert!(f.agent.list_workloads().is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_and_stop() {
        let f = fixture(vec![]);
        f.agent.construct_initial_snapshot().await.unwrap();
        f.agent.start().unwrap();
        assert!(matches!(f.agent.start(), Err(NodeAgentError::Config { .. })));

        f.agent.stop().await.unwrap();
        assert!(!f.ipset.exists());
        assert!(!f.agent.server().socket_path().exists());
    }

    #[tokio::test]
    async fn test_status_reports_readiness() {
        let f = fixture(vec![]);
        let status = f.agent.status();
        assert!(!status.ready);
        assert_eq!(status.live_connections, 0);
        assert!(status.active_connection.is_none());
    }
}
