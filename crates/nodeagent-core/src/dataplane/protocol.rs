//! Dataplane wire messages and the request/ack exchange.
//!
//! Every datagram is one JSON document. The controller speaks only after the
//! dataplane's hello, and every request it sends is answered by exactly one
//! [`WorkloadResponse`]. There is no correlation id: the ack for a request is
//! simply the next datagram read after writing it.

use super::socket::SeqPacketStream;
use crate::config::ProtocolConfig;
use crate::error::{NodeAgentError, Result};
use crate::models::{WorkloadInfo, WorkloadUid};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::os::fd::BorrowedFd;
use std::time::Duration;

/// First message on every connection, sent by the dataplane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataplaneHello {
    pub version: u32,
}

/// Request sent by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkloadRequest {
    /// Enroll a workload. Carries the namespace descriptor as an attachment.
    Add {
        uid: WorkloadUid,
        workload_info: WorkloadInfo,
    },
    /// Keep a workload whose namespace is not known yet. Only sent during
    /// snapshot replay.
    Keep { uid: WorkloadUid },
    /// Remove a workload.
    Del { uid: WorkloadUid },
    /// Marks the end of snapshot replay.
    SnapshotSent,
}

impl WorkloadRequest {
    /// Short operation name used in logs and errors.
    pub fn operation(&self) -> &'static str {
        match self {
            WorkloadRequest::Add { .. } => "add",
            WorkloadRequest::Keep { .. } => "keep",
            WorkloadRequest::Del { .. } => "del",
            WorkloadRequest::SnapshotSent => "snapshot_sent",
        }
    }

    pub fn uid(&self) -> Option<&WorkloadUid> {
        match self {
            WorkloadRequest::Add { uid, .. }
            | WorkloadRequest::Keep { uid }
            | WorkloadRequest::Del { uid } => Some(uid),
            WorkloadRequest::SnapshotSent => None,
        }
    }
}

/// Acknowledgement payload. An empty error string means success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default)]
    pub error: String,
}

/// Reply to every [`WorkloadRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadResponse {
    #[serde(default)]
    pub ack: Option<Ack>,
}

impl WorkloadResponse {
    pub fn ok() -> Self {
        Self {
            ack: Some(Ack::default()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ack: Some(Ack {
                error: message.into(),
            }),
        }
    }

    /// The dataplane's error, if it rejected the request.
    pub fn ack_error(&self) -> Option<&str> {
        self.ack
            .as_ref()
            .map(|ack| ack.error.as_str())
            .filter(|error| !error.is_empty())
    }
}

/// Result of a bounded read.
#[derive(Debug)]
pub enum Incoming<M> {
    Message(M),
    /// The peer closed the connection.
    Closed,
}

/// Controller side of one dataplane connection's wire.
///
/// Holds the fixed receive buffer; all reads and writes go through `&mut self`
/// so only the connection's own task can touch the socket.
#[derive(Debug)]
pub struct DataplaneWire {
    stream: SeqPacketStream,
    buf: Vec<u8>,
}

impl DataplaneWire {
    pub fn new(stream: SeqPacketStream) -> Self {
        Self {
            stream,
            buf: vec![0u8; ProtocolConfig::RECEIVE_BUFFER_SIZE],
        }
    }

    /// Read one datagram within `timeout`, returning its payload length.
    ///
    /// Elapsing is reported as [`NodeAgentError::Timeout`]. Descriptors are
    /// never expected from the dataplane and are dropped.
    async fn read_raw(&mut self, timeout: Duration) -> Result<Option<usize>> {
        match tokio::time::timeout(timeout, self.stream.recv(&mut self.buf)).await {
            Err(_elapsed) => Err(NodeAgentError::Timeout(timeout)),
            Ok(Ok(Some(datagram))) => Ok(Some(datagram.len)),
            Ok(Ok(None)) => Ok(None),
            Ok(Err(e)) => Err(e),
        }
    }

    /// Read and decode one message within `timeout`.
    pub async fn read_message<M: DeserializeOwned>(
        &mut self,
        timeout: Duration,
    ) -> Result<Incoming<M>> {
        match self.read_raw(timeout).await? {
            None => Ok(Incoming::Closed),
            Some(len) => Ok(Incoming::Message(serde_json::from_slice(&self.buf[..len])?)),
        }
    }

    /// Read a datagram without decoding it.
    ///
    /// Used by the liveness probe, where any datagram at all is unexpected.
    pub async fn probe(&mut self, timeout: Duration) -> Result<Incoming<usize>> {
        match self.read_raw(timeout).await? {
            None => Ok(Incoming::Closed),
            Some(len) => Ok(Incoming::Message(len)),
        }
    }

    /// Write `request` within `deadline`, then wait up to `deadline` for its ack.
    pub async fn send_and_wait_for_ack(
        &mut self,
        request: &WorkloadRequest,
        fd: Option<BorrowedFd<'_>>,
        deadline: Duration,
    ) -> Result<WorkloadResponse> {
        let payload = serde_json::to_vec(request)?;
        tokio::time::timeout(deadline, self.stream.send(&payload, fd))
            .await
            .map_err(|_| NodeAgentError::Timeout(deadline))??;

        match self.read_message::<WorkloadResponse>(deadline).await? {
            Incoming::Message(response) => Ok(response),
            Incoming::Closed => Err(NodeAgentError::Io {
                context: format!("waiting for {} ack", request.operation()),
                message: "dataplane closed the connection".to_string(),
                source: None,
            }),
        }
    }
}
