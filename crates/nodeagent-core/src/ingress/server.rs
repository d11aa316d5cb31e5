//! Ingress server.
//!
//! Each connection is handled on its own task; requests on one connection
//! are processed in order.

use super::protocol::{read_frame, write_frame, RpcRequest, RpcResponse};
use crate::config::IngressConfig;
use crate::error::{NodeAgentError, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running ingress server. Dropping it shuts the server down and
/// removes the socket file.
pub struct IngressServerHandle {
    path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl IngressServerHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting and close every open connection.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for IngressServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Routes ingress method calls.
#[async_trait::async_trait]
pub trait IngressDispatch: Send + Sync + 'static {
    async fn dispatch(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value>;
}

pub struct IngressServer;

impl IngressServer {
    /// Bind `path` and serve `dispatch` on background tasks.
    pub async fn start<D: IngressDispatch + ?Sized>(
        path: impl AsRef<Path>,
        dispatch: Arc<D>,
    ) -> Result<IngressServerHandle> {
        let path = path.as_ref().to_path_buf();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("removed stale ingress socket {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(NodeAgentError::Config {
                    message: format!("cannot remove stale ingress socket {}: {}", path.display(), e),
                })
            }
        }
        let listener = UnixListener::bind(&path).map_err(|e| NodeAgentError::Config {
            message: format!("cannot bind ingress socket {}: {}", path.display(), e),
        })?;
        info!("Ingress server listening on {}", path.display());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            dispatch,
            shutdown_rx,
            conn_shutdown_rx,
            Arc::new(AtomicUsize::new(0)),
        ));

        Ok(IngressServerHandle {
            path,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<D: IngressDispatch + ?Sized>(
        listener: UnixListener,
        dispatch: Arc<D>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Ingress server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    let stream = match accept_result {
                        Ok((stream, _addr)) => stream,
                        Err(e) => {
                            error!("Ingress accept error: {}", e);
                            continue;
                        }
                    };
                    if active_connections.load(Ordering::Relaxed) >= IngressConfig::MAX_CONNECTIONS {
                        warn!(
                            "Rejecting ingress connection: at max capacity ({})",
                            IngressConfig::MAX_CONNECTIONS
                        );
                        continue;
                    }

                    active_connections.fetch_add(1, Ordering::Relaxed);
                    let dispatch = Arc::clone(&dispatch);
                    let conns = Arc::clone(&active_connections);
                    let mut conn_shutdown = conn_shutdown_rx.clone();

                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, &*dispatch, &mut conn_shutdown).await {
                            debug!("Ingress connection ended: {}", e);
                        }
                        conns.fetch_sub(1, Ordering::Relaxed);
                    });
                }
            }
        }
    }

    async fn handle_connection<D: IngressDispatch + ?Sized>(
        mut stream: UnixStream,
        dispatch: &D,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.split();

        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result? {
                        Some(frame) => frame,
                        None => return Ok(()),
                    }
                }
                _ = shutdown_rx.changed() => return Ok(()),
            };

            let response = Self::process_request(&frame, dispatch).await;
            write_frame(&mut writer, &serde_json::to_vec(&response)?).await?;
        }
    }

    async fn process_request<D: IngressDispatch + ?Sized>(frame: &[u8], dispatch: &D) -> RpcResponse {
        let request: RpcRequest = match serde_json::from_slice(frame) {
            Ok(request) => request,
            Err(e) => return RpcResponse::error(None, -32700, format!("Parse error: {}", e)),
        };

        if request.jsonrpc != "2.0" {
            return RpcResponse::error(
                request.id,
                -32600,
                "Invalid Request: expected jsonrpc 2.0".to_string(),
            );
        }

        let params = request
            .params
            .unwrap_or(serde_json::Value::Object(Default::default()));

        match dispatch.dispatch(&request.method, params).await {
            Ok(result) => RpcResponse::success(request.id, result),
            Err(e) => {
                debug!(method = %request.method, "ingress call failed: {}", e);
                RpcResponse::from_error(request.id, &e)
            }
        }
    }
}
