//! Per-connection protocol engine.
//!
//! Each accepted dataplane connection is driven by one task that owns the
//! socket. Other components never write to the wire directly: they enqueue an
//! [`UpdateRequest`] through a [`ConnectionHandle`] and wait on a private
//! response slot. Funnelling every write through the owning task is what keeps
//! request/ack pairs strictly sequential.
//!
//! ```text
//! Open -> HelloAwaited -> SnapshotReplaying -> Serving -> Closed
//! ```

use super::protocol::{DataplaneHello, DataplaneWire, Incoming, WorkloadRequest, WorkloadResponse};
use super::socket::SeqPacketStream;
use crate::cache::WorkloadSnapshot;
use crate::cancel::CancellationToken;
use crate::config::{ConnectionTimeouts, ProtocolConfig};
use crate::error::{NodeAgentError, Result};
use crate::netns::NamespaceHandle;
use crate::telemetry::Telemetry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque id assigned to a connection at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dp-{}", self.0)
    }
}

/// Lifecycle of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Open,
    HelloAwaited,
    SnapshotReplaying,
    Serving,
    Closed,
}

/// A request queued for a connection's writer task.
#[derive(Debug)]
pub struct UpdateRequest {
    pub request: WorkloadRequest,
    /// Namespace attached as `SCM_RIGHTS`. Held until the write completes.
    pub netns: Option<Arc<NamespaceHandle>>,
    respond_to: oneshot::Sender<Result<WorkloadResponse>>,
}

/// Cloneable reference to a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    updates: mpsc::Sender<UpdateRequest>,
    state: watch::Receiver<ConnectionState>,
    version: Arc<OnceLock<u32>>,
    cancel: CancellationToken,
    connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Protocol version from the dataplane's hello, once received.
    pub fn version(&self) -> Option<u32> {
        self.version.get().copied()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Ask the connection's task to shut down.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait until the connection reaches `Closed`.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Enqueue `request` and wait for the dataplane's ack.
    ///
    /// Both the enqueue and the wait give up when `cancel` fires. Giving up
    /// only detaches the caller: a request already queued is still written to
    /// the dataplane and its ack discarded. Only cancelling the connection
    /// itself drops queued requests. A connection that closes first fails the
    /// call with [`NodeAgentError::ConnectionClosed`].
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        request: WorkloadRequest,
        netns: Option<Arc<NamespaceHandle>>,
    ) -> Result<WorkloadResponse> {
        let closed = || NodeAgentError::ConnectionClosed {
            connection: self.id.get(),
        };
        let (respond_to, response) = oneshot::channel();
        let update = UpdateRequest {
            request,
            netns,
            respond_to,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NodeAgentError::Cancelled),
            sent = self.updates.send(update) => sent.map_err(|_| closed())?,
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NodeAgentError::Cancelled),
            response = response => response.map_err(|_| closed())?,
        }
    }
}

/// Task-side state of one connection.
pub struct DataplaneConnection {
    handle: ConnectionHandle,
    wire: DataplaneWire,
    updates: mpsc::Receiver<UpdateRequest>,
    state: watch::Sender<ConnectionState>,
    timeouts: ConnectionTimeouts,
    telemetry: Telemetry,
}

impl DataplaneConnection {
    /// Wrap an accepted stream. `cancel` should be a child of the server token.
    pub fn new(
        stream: SeqPacketStream,
        timeouts: ConnectionTimeouts,
        cancel: CancellationToken,
        telemetry: Telemetry,
    ) -> Self {
        let (updates_tx, updates) = mpsc::channel(ProtocolConfig::UPDATE_QUEUE_DEPTH);
        let (state, state_rx) = watch::channel(ConnectionState::Open);
        let handle = ConnectionHandle {
            id: ConnectionId::next(),
            updates: updates_tx,
            state: state_rx,
            version: Arc::new(OnceLock::new()),
            cancel,
            connected_at: Utc::now(),
        };

        Self {
            handle,
            wire: DataplaneWire::new(stream),
            updates,
            state,
            timeouts,
            telemetry,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == state {
                return false;
            }
            debug!(connection = %self.handle.id, from = ?*current, to = ?state, "connection state change");
            *current = state;
            true
        });
    }

    /// Drive the connection to completion.
    ///
    /// `snapshot` is called once the hello arrives, so the replay reflects the
    /// cache at that moment rather than at accept time. Returns `Ok` on a
    /// clean close (peer EOF or cancellation).
    pub async fn run<F>(mut self, snapshot: F) -> Result<()>
    where
        F: FnOnce() -> WorkloadSnapshot,
    {
        let cancel = self.handle.cancel.clone();
        let result: Result<()> = async {
            match cancel.run_until_cancelled(self.await_hello()).await {
                Err(_) => return Ok(()),
                Ok(hello) => hello?,
            };
            match cancel.run_until_cancelled(self.replay_snapshot(snapshot())).await {
                Err(_) => return Ok(()),
                Ok(replay) => replay?,
            };
            self.serve().await
        }
        .await;

        self.set_state(ConnectionState::Closed);
        result
    }

    /// Wait for the dataplane's hello.
    pub async fn await_hello(&mut self) -> Result<u32> {
        self.set_state(ConnectionState::HelloAwaited);
        let hello = match self
            .wire
            .read_message::<DataplaneHello>(self.timeouts.read_write)
            .await?
        {
            Incoming::Message(hello) => hello,
            Incoming::Closed => {
                return Err(NodeAgentError::ProtocolViolation {
                    message: "connection closed before hello".to_string(),
                })
            }
        };

        info!(connection = %self.handle.id, version = hello.version, "received hello from dataplane");
        if hello.version != ProtocolConfig::VERSION {
            warn!(
                connection = %self.handle.id,
                version = hello.version,
                expected = ProtocolConfig::VERSION,
                "dataplane speaks a different protocol version"
            );
        }
        let _ = self.handle.version.set(hello.version);
        Ok(hello.version)
    }

    /// Replay the cache, one acknowledged request per workload, then
    /// `SnapshotSent`.
    ///
    /// Ack errors are logged and skipped; transport failures end the replay
    /// and the connection.
    pub async fn replay_snapshot(&mut self, snapshot: WorkloadSnapshot) -> Result<()> {
        self.set_state(ConnectionState::SnapshotReplaying);
        debug!(connection = %self.handle.id, workloads = snapshot.len(), "sending snapshot to dataplane");

        for (uid, entry) in snapshot.sorted() {
            let (request, fd) = match &entry.netns {
                Some(netns) => {
                    info!(
                        connection = %self.handle.id,
                        uid = %uid,
                        name = %entry.info.name,
                        namespace = %entry.info.namespace,
                        "sending workload to dataplane as part of snapshot"
                    );
                    (
                        WorkloadRequest::Add {
                            uid: uid.clone(),
                            workload_info: entry.info.clone(),
                        },
                        Some(netns.fd()),
                    )
                }
                None => {
                    info!(
                        connection = %self.handle.id,
                        uid = %uid,
                        "namespace not available for workload, sending keep"
                    );
                    (WorkloadRequest::Keep { uid: uid.clone() }, None)
                }
            };

            let response = self.exchange(&request, fd).await?;
            if let Some(error) = response.ack_error() {
                warn!(connection = %self.handle.id, uid = %uid, error, "snapshot {}: got ack error", request.operation());
            }
        }

        let response = self.exchange(&WorkloadRequest::SnapshotSent, None).await?;
        if let Some(error) = response.ack_error() {
            warn!(connection = %self.handle.id, error, "snapshot_sent: got ack error");
        }
        self.telemetry.metrics().record_snapshot_replay();
        debug!(connection = %self.handle.id, "snapshot sent to dataplane");
        Ok(())
    }

    async fn exchange(
        &mut self,
        request: &WorkloadRequest,
        fd: Option<BorrowedFd<'_>>,
    ) -> Result<WorkloadResponse> {
        self.wire
            .send_and_wait_for_ack(request, fd, self.timeouts.read_write)
            .await
    }

    /// Serve queued updates and probe liveness until closed.
    pub async fn serve(&mut self) -> Result<()> {
        self.set_state(ConnectionState::Serving);
        let cancel = self.handle.cancel.clone();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(connection = %self.handle.id, "connection cancelled");
                    return Ok(());
                }
                update = self.updates.recv() => {
                    let Some(update) = update else {
                        debug!(connection = %self.handle.id, "update channel closed");
                        return Ok(());
                    };
                    if !self.process_update(&cancel, update).await {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(self.timeouts.keepalive_interval) => {
                    if !self.keepalive().await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Write one update and hand its outcome to the waiting caller.
    ///
    /// Returns `false` when the connection must close: once a request fails
    /// mid-exchange a late ack could be mistaken for the next request's.
    async fn process_update(&mut self, cancel: &CancellationToken, update: UpdateRequest) -> bool {
        let UpdateRequest {
            request,
            netns,
            respond_to,
        } = update;
        let fd = netns.as_deref().map(NamespaceHandle::fd);
        debug!(connection = %self.handle.id, operation = request.operation(), "sending update to dataplane");

        let outcome = cancel
            .run_until_cancelled(self.wire.send_and_wait_for_ack(&request, fd, self.timeouts.read_write))
            .await;

        match outcome {
            Err(_) => {
                let _ = respond_to.send(Err(NodeAgentError::Cancelled));
                false
            }
            Ok(Ok(response)) => {
                if let Some(error) = response.ack_error() {
                    warn!(connection = %self.handle.id, operation = request.operation(), error, "dataplane acked error");
                } else {
                    debug!(connection = %self.handle.id, operation = request.operation(), "dataplane acked");
                }
                // The caller may have given up; that is not the connection's problem.
                let _ = respond_to.send(Ok(response));
                true
            }
            Ok(Err(e)) => {
                warn!(connection = %self.handle.id, operation = request.operation(), "request failed, closing connection: {}", e);
                let _ = respond_to.send(Err(e));
                false
            }
        }
    }

    /// Short read to check the peer is still there.
    ///
    /// The dataplane never speaks first, so silence means alive. Returns
    /// `Ok(false)` when the peer closed cleanly.
    async fn keepalive(&mut self) -> Result<bool> {
        match self.wire.probe(self.timeouts.keepalive_probe).await {
            Err(NodeAgentError::Timeout(_)) => Ok(true),
            Ok(Incoming::Closed) => {
                debug!(connection = %self.handle.id, "dataplane closed the connection");
                Ok(false)
            }
            Ok(Incoming::Message(_)) => {
                self.telemetry.metrics().record_keepalive_failure();
                warn!(connection = %self.handle.id, "dataplane protocol error, unexpected message");
                Err(NodeAgentError::ProtocolViolation {
                    message: "unexpected message from dataplane".to_string(),
                })
            }
            Err(e) => {
                self.telemetry.metrics().record_keepalive_failure();
                debug!(connection = %self.handle.id, "dataplane keepalive failed: {}", e);
                Err(e)
            }
        }
    }
}

impl Drop for DataplaneConnection {
    fn drop(&mut self) {
        self.state.send_replace(ConnectionState::Closed);
    }
}
