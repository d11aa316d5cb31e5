//! Dataplane listener and workload fan-out.
//!
//! Accepts dataplane connections at a bounded rate, replays the workload
//! cache to each one, and routes workload adds (to the active connection) and
//! deletes (to every connection).

use super::connection::{ConnectionHandle, DataplaneConnection};
use super::manager::ConnectionManager;
use super::protocol::WorkloadRequest;
use super::socket::{SeqPacketListener, SeqPacketStream};
use crate::cache::{WorkloadCache, WorkloadSnapshot};
use crate::cancel::CancellationToken;
use crate::config::{ConnectionTimeouts, ListenerConfig};
use crate::error::{NodeAgentError, Result};
use crate::models::{Workload, WorkloadUid};
use crate::netns::{NamespaceHandle, NamespaceResolver, ResolvedNamespace};
use crate::telemetry::Telemetry;
use futures::future::join_all;
use governor::{Quota, RateLimiter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn, Instrument};

/// Dataplane-facing half of the agent.
pub struct DataplaneServer {
    listener: Mutex<Option<SeqPacketListener>>,
    socket_path: PathBuf,
    cache: Arc<WorkloadCache>,
    connections: Arc<ConnectionManager>,
    resolver: Arc<dyn NamespaceResolver>,
    timeouts: ConnectionTimeouts,
    telemetry: Telemetry,
}

impl DataplaneServer {
    /// Bind the dataplane socket. Failing to bind is fatal.
    pub fn bind(
        socket_path: impl AsRef<Path>,
        resolver: Arc<dyn NamespaceResolver>,
        timeouts: ConnectionTimeouts,
        telemetry: Telemetry,
    ) -> Result<Self> {
        let listener = SeqPacketListener::bind(socket_path.as_ref())?;
        let telemetry = telemetry.for_component("dataplane");
        Ok(Self {
            socket_path: listener.path().to_path_buf(),
            listener: Mutex::new(Some(listener)),
            cache: Arc::new(WorkloadCache::new()),
            connections: Arc::new(ConnectionManager::new(telemetry.clone())),
            resolver,
            timeouts,
            telemetry,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn cache(&self) -> &WorkloadCache {
        &self.cache
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Point-in-time copy of the workload cache.
    pub fn snapshot(&self) -> WorkloadSnapshot {
        self.cache.snapshot()
    }

    /// Run the accept loop until `cancel` fires.
    ///
    /// Each connection runs on its own task under a child of `cancel`. On
    /// return the listener is closed and its socket file removed.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| NodeAgentError::Config {
                message: "dataplane server is already running".to_string(),
            })?;

        // At most one or two dataplane instances live on a node and they
        // connect once. A reconnect loop must not be able to exhaust us.
        let limiter = RateLimiter::direct(
            Quota::per_second(ListenerConfig::ACCEPT_RATE_PER_SECOND)
                .allow_burst(ListenerConfig::ACCEPT_BURST),
        );

        info!("Dataplane server listening on {}", listener.path().display());
        loop {
            if cancel.run_until_cancelled(limiter.until_ready()).await.is_err() {
                break;
            }
            let stream = match cancel.run_until_cancelled(listener.accept()).await {
                Err(_) => break,
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    error!("Failed to accept dataplane connection: {}", e);
                    continue;
                }
            };
            debug!("Dataplane connection accepted");
            self.telemetry.metrics().record_connection_accepted();

            let server = Arc::clone(&self);
            let conn_cancel = cancel.child_token();
            tokio::spawn(
                async move {
                    if let Err(e) = server.handle_connection(stream, conn_cancel).await {
                        warn!("Dataplane connection ended with error: {}", e);
                    }
                }
                .instrument(self.telemetry.span()),
            );
        }

        info!("Dataplane server stopping");
        self.connections.close_all();
        drop(listener);
        Ok(())
    }

    async fn handle_connection(
        &self,
        stream: SeqPacketStream,
        cancel: CancellationToken,
    ) -> Result<()> {
        let conn = DataplaneConnection::new(stream, self.timeouts, cancel, self.telemetry.clone());
        let id = conn.id();

        // Registered before the hello, so adds issued during replay queue up
        // behind it instead of failing.
        self.connections.add(conn.handle().clone());
        let cache = Arc::clone(&self.cache);
        let result = conn.run(move || cache.snapshot()).await;
        self.connections.remove(id);
        result
    }

    /// Resolve a workload's namespace.
    ///
    /// A missing reference or a namespace that is not up yet is `Ok(None)`.
    async fn resolve_netns(&self, workload: &Workload) -> Result<Option<NamespaceHandle>> {
        let Some(reference) = &workload.netns else {
            return Ok(None);
        };
        match self.resolver.resolve(reference).await? {
            ResolvedNamespace::Handle(handle) => Ok(Some(handle)),
            ResolvedNamespace::NotYetAvailable => {
                info!(uid = %workload.uid, netns = %reference, "namespace not yet available");
                Ok(None)
            }
        }
    }

    /// Populate the cache from the workloads running at startup.
    ///
    /// Runs before any dataplane connection exists. A workload whose namespace
    /// fails to resolve is still cached without a handle and the failure is
    /// reported.
    pub async fn construct_initial_snapshot(&self, workloads: &[Workload]) -> Result<()> {
        let mut errors = Vec::new();
        for workload in workloads {
            let netns = match self.resolve_netns(workload).await {
                Ok(netns) => netns,
                Err(e) => {
                    warn!(uid = %workload.uid, "failed to resolve namespace for snapshot: {}", e);
                    errors.push(e);
                    None
                }
            };
            self.cache
                .upsert(workload.uid.clone(), workload.info.clone(), netns.map(Arc::new));
        }
        info!(workloads = self.cache.len(), "initial snapshot constructed");
        NodeAgentError::join(errors)
    }

    /// Enroll `workload` with the active dataplane connection.
    ///
    /// The cache is always updated first, so a later connection's replay
    /// picks the workload up. Anything that leaves the workload cached but
    /// not confirmed by the dataplane is a [`NodeAgentError::PartialEnrollment`].
    pub async fn workload_added(&self, cancel: &CancellationToken, workload: &Workload) -> Result<()> {
        let uid = &workload.uid;
        let netns = self.resolve_netns(workload).await?;
        let netns = self
            .cache
            .upsert(uid.clone(), workload.info.clone(), netns.map(Arc::new));

        let Some(netns) = netns else {
            return Err(NodeAgentError::partial(
                uid,
                NodeAgentError::Namespace {
                    reference: workload
                        .netns
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                    message: "namespace not yet available".to_string(),
                },
            ));
        };
        let Some(conn) = self.connections.active() else {
            return Err(NodeAgentError::partial(uid, NodeAgentError::NoActiveConnection));
        };

        info!(
            connection = %conn.id(),
            uid = %uid,
            name = %workload.info.name,
            namespace = %workload.info.namespace,
            service_account = %workload.info.service_account,
            "sending workload add to dataplane"
        );
        let request = WorkloadRequest::Add {
            uid: uid.clone(),
            workload_info: workload.info.clone(),
        };
        let response = match conn.send(cancel, request, Some(netns)).await {
            Ok(response) => response,
            Err(NodeAgentError::Cancelled) => return Err(NodeAgentError::Cancelled),
            Err(e) => return Err(NodeAgentError::partial(uid, e)),
        };

        if let Some(error) = response.ack_error() {
            error!(uid = %uid, "failed to add workload: {}", error);
            return Err(NodeAgentError::partial(
                uid,
                NodeAgentError::AckError {
                    operation: "add",
                    uid: uid.to_string(),
                    message: error.to_string(),
                },
            ));
        }
        Ok(())
    }

    /// Remove `uid` from every live dataplane connection.
    ///
    /// Zero live connections is success. The cache entry is dropped only once
    /// every connection acknowledged, so a failed removal is replayed to the
    /// next connection.
    pub async fn workload_deleted(&self, cancel: &CancellationToken, uid: &WorkloadUid) -> Result<()> {
        let conns = self.connections.all();
        debug!(uid = %uid, connections = conns.len(), "sending workload delete to dataplane");

        let request = WorkloadRequest::Del { uid: uid.clone() };
        let results = join_all(
            conns
                .iter()
                .map(|conn| conn.send(cancel, request.clone(), None)),
        )
        .await;

        let mut errors = Vec::new();
        for (conn, result) in conns.iter().zip(results) {
            match result {
                Ok(response) => log_delete_ack(conn, uid, response.ack_error()),
                Err(e) => errors.push(e),
            }
        }
        NodeAgentError::join(errors)?;

        self.cache.remove(uid);
        Ok(())
    }
}

fn log_delete_ack(conn: &ConnectionHandle, uid: &WorkloadUid, ack_error: Option<&str>) {
    match ack_error {
        Some(error) => warn!(connection = %conn.id(), uid = %uid, "dataplane delete acked error: {}", error),
        None => debug!(connection = %conn.id(), uid = %uid, "dataplane acked delete"),
    }
}
