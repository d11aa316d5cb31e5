//! Ingress framing and JSON-RPC types.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::config::IngressConfig;
use crate::error::{NodeAgentError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    pub id: Option<serde_json::Value>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: serde_json::Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
            id: Some(serde_json::Value::Number(id.into())),
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Option<serde_json::Value>,
}

impl RpcResponse {
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<serde_json::Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }

    /// Build the error response for `err`.
    pub fn from_error(id: Option<serde_json::Value>, err: &NodeAgentError) -> Self {
        Self::error(id, err.to_rpc_error_code(), err.to_string())
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl From<RpcError> for NodeAgentError {
    fn from(err: RpcError) -> Self {
        NodeAgentError::Rpc {
            code: err.code,
            message: err.message,
        }
    }
}

/// Read one frame. Returns `None` on clean EOF.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NodeAgentError::io_with_context(e, "reading ingress frame")),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > IngressConfig::MAX_MESSAGE_SIZE {
        return Err(NodeAgentError::InvalidParams {
            message: format!(
                "ingress message size {} exceeds maximum {}",
                len,
                IngressConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| NodeAgentError::io_with_context(e, "reading ingress frame"))?;
    Ok(Some(payload))
}

/// Write one frame.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len as usize <= IngressConfig::MAX_MESSAGE_SIZE)
        .ok_or_else(|| NodeAgentError::InvalidParams {
            message: format!("ingress message of {} bytes is too large", payload.len()),
        })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_shapes() {
        let ok = serde_json::to_string(&RpcResponse::success(
            Some(1.into()),
            serde_json::json!({"ready": true}),
        ))
        .unwrap();
        assert!(ok.contains("\"result\""));
        assert!(!ok.contains("\"error\""));

        let err = RpcResponse::from_error(Some(2.into()), &NodeAgentError::NoActiveConnection);
        let json = serde_json::to_string(&err).unwrap();
        assert!(!json.contains("\"result\""));
        assert!(json.contains("-32000"));
    }

    #[tokio::test]
    async fn test_frame_read_write() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"{\"method\":\"status\"}").await.unwrap();
        assert_eq!(&buf[..4], &19u32.to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        let frame = read_frame(&mut cursor).await.unwrap();
        assert_eq!(frame.as_deref(), Some(&b"{\"method\":\"status\"}"[..]));
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let huge_len = (IngressConfig::MAX_MESSAGE_SIZE + 1) as u32;
        let mut buf = huge_len.to_be_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(NodeAgentError::InvalidParams { .. })
        ));
    }
}
