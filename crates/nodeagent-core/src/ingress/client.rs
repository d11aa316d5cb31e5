//! Ingress client.
//!
//! Access to the stream is serialized with a tokio `Mutex`, so one client can
//! be shared between tasks.

use super::dispatch::WorkloadParams;
use super::protocol::{read_frame, write_frame, RpcRequest, RpcResponse};
use crate::config::IngressConfig;
use crate::error::{NodeAgentError, Result};
use crate::models::{Workload, WorkloadSummary};
use crate::orchestrator::AgentStatus;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
pub struct IngressClient {
    stream: Mutex<UnixStream>,
    path: PathBuf,
    next_id: AtomicU64,
}

impl IngressClient {
    /// Connect to the agent listening on `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stream = tokio::time::timeout(IngressConfig::CONNECT_TIMEOUT, UnixStream::connect(&path))
            .await
            .map_err(|_| NodeAgentError::Timeout(IngressConfig::CONNECT_TIMEOUT))?
            .map_err(|e| {
                NodeAgentError::io_with_context(e, format!("connecting to {}", path.display()))
            })?;
        debug!("Ingress client connected to {}", path.display());

        Ok(Self {
            stream: Mutex::new(stream),
            path,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Call `method` and return its raw result.
    ///
    /// Errors reported by the agent come back as [`NodeAgentError::Rpc`]
    /// with the agent's error code.
    pub async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = serde_json::to_vec(&RpcRequest::new(method, params, id))?;

        let mut stream = self.stream.lock().await;
        let (mut reader, mut writer) = stream.split();
        write_frame(&mut writer, &request).await?;
        let bytes = read_frame(&mut reader).await?.ok_or_else(|| NodeAgentError::Io {
            context: format!("calling {}", method),
            message: "agent closed the connection".to_string(),
            source: None,
        })?;

        let response: RpcResponse = serde_json::from_slice(&bytes)?;
        if let Some(err) = response.error {
            return Err(err.into());
        }
        response.result.ok_or_else(|| NodeAgentError::Other(format!(
            "response to {} is missing a result",
            method
        )))
    }

    async fn call_typed<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<T> {
        Ok(serde_json::from_value(self.call(method, params).await?)?)
    }

    pub async fn add_workload(&self, workload: &Workload) -> Result<()> {
        self.call("add_workload", serde_json::to_value(WorkloadParams::from(workload))?)
            .await
            .map(drop)
    }

    pub async fn remove_workload(&self, workload: &Workload) -> Result<()> {
        self.call("remove_workload", serde_json::to_value(WorkloadParams::from(workload))?)
            .await
            .map(drop)
    }

    pub async fn list_workloads(&self) -> Result<Vec<WorkloadSummary>> {
        self.call_typed("list_workloads", serde_json::json!({})).await
    }

    pub async fn status(&self) -> Result<AgentStatus> {
        self.call_typed("status", serde_json::json!({})).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::server::{IngressDispatch, IngressServer};
    use std::sync::Arc;

    struct PingDispatch;

    #[async_trait::async_trait]
    impl IngressDispatch for PingDispatch {
        async fn dispatch(&self, method: &str, _params: serde_json::Value) -> Result<serde_json::Value> {
            match method {
                "ping" => Ok(serde_json::json!("pong")),
                _ => Err(NodeAgentError::MethodNotFound {
                    method: method.to_string(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn test_call_success_and_error() {
        let dir = tempfile::tempdir().unwrap();
        let handle = IngressServer::start(dir.path().join("in.sock"), Arc::new(PingDispatch))
            .await
            .unwrap();
        let client = IngressClient::connect(handle.path()).await.unwrap();

        let result = client.call("ping", serde_json::json!({})).await.unwrap();
        assert_eq!(result, serde_json::json!("pong"));

        match client.call("nonexistent", serde_json::json!({})).await {
            Err(NodeAgentError::Rpc { code, .. }) => assert_eq!(code, -32601),
            other => panic!("Expected Rpc error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_to_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = IngressClient::connect(dir.path().join("missing.sock")).await;
        assert!(matches!(result, Err(NodeAgentError::Io { .. })));
    }

    #[tokio::test]
    async fn test_detects_server_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = IngressServer::start(dir.path().join("in.sock"), Arc::new(PingDispatch))
            .await
            .unwrap();
        let client = IngressClient::connect(handle.path()).await.unwrap();
        assert!(client.call("ping", serde_json::json!({})).await.is_ok());

        handle.shutdown();

        let mut detected_shutdown = false;
        for _ in 0..20 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            if client.call("ping", serde_json::json!({})).await.is_err() {
                detected_shutdown = true;
                break;
            }
        }
        assert!(detected_shutdown, "client should notice the agent going away");
    }
}
