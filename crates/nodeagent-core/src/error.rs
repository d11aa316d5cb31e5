//! Error types for the node agent.
//!
//! The variants follow the failure taxonomy the agent has to act on:
//! transient I/O, protocol violations, partial enrollment, address
//! collisions in the probe IP set, and fatal configuration problems.
//! Multi-step operations aggregate their sub-failures with
//! [`NodeAgentError::join`] so callers see every failure, not just the first.

use std::net::IpAddr;
use thiserror::Error;

use crate::models::WorkloadUid;

/// Main error type for the node agent.
#[derive(Debug, Error)]
pub enum NodeAgentError {
    // Transport errors
    #[error("IO error during {context}: {message}")]
    Io {
        context: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Dataplane connection {connection} is closed")]
    ConnectionClosed { connection: u64 },

    #[error("No active dataplane connection")]
    NoActiveConnection,

    // Protocol errors
    #[error("Dataplane protocol violation: {message}")]
    ProtocolViolation { message: String },

    #[error("Truncated {what} received from dataplane")]
    Truncated { what: &'static str },

    #[error("Dataplane rejected {operation} for {uid}: {message}")]
    AckError {
        operation: &'static str,
        uid: String,
        message: String,
    },

    /// The workload is known to the dataplane layer but not fully functional.
    ///
    /// Callers branch on this with [`NodeAgentError::is_partial_enrollment`]:
    /// the workload is still annotated, but never registered for probe
    /// redirection.
    #[error("Workload {uid} partially enrolled: {cause}")]
    PartialEnrollment {
        uid: WorkloadUid,
        #[source]
        cause: Box<NodeAgentError>,
    },

    // Collaborator errors
    #[error("Address {address} is already owned by {owner} (wanted by {uid})")]
    AddressCollision {
        address: IpAddr,
        uid: WorkloadUid,
        owner: String,
    },

    #[error("IP set error: {message}")]
    IpSet { message: String },

    #[error("Network namespace {reference}: {message}")]
    Namespace { reference: String, message: String },

    #[error("Platform error for {uid}: {message}")]
    Platform { uid: String, message: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    /// Error returned by a remote agent over the ingress.
    #[error("Agent returned error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("{}", format_multiple(.0))]
    Multiple(Vec<NodeAgentError>),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for node agent operations.
pub type Result<T> = std::result::Result<T, NodeAgentError>;

fn format_multiple(errors: &[NodeAgentError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<std::io::Error> for NodeAgentError {
    fn from(err: std::io::Error) -> Self {
        NodeAgentError::Io {
            context: "io".to_string(),
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for NodeAgentError {
    fn from(err: serde_json::Error) -> Self {
        NodeAgentError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

#[cfg(unix)]
impl From<nix::errno::Errno> for NodeAgentError {
    fn from(err: nix::errno::Errno) -> Self {
        NodeAgentError::from(std::io::Error::from(err))
    }
}

impl NodeAgentError {
    /// Create an IO error with operation context.
    pub fn io_with_context(err: std::io::Error, context: impl Into<String>) -> Self {
        NodeAgentError::Io {
            context: context.into(),
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// Wrap an error as a partial enrollment of `uid`.
    pub fn partial(uid: &WorkloadUid, cause: NodeAgentError) -> Self {
        NodeAgentError::PartialEnrollment {
            uid: uid.clone(),
            cause: Box::new(cause),
        }
    }

    /// Aggregate a list of errors.
    ///
    /// An empty list is success, a single error is returned as-is, and
    /// anything more is wrapped in [`NodeAgentError::Multiple`].
    pub fn join(mut errors: Vec<NodeAgentError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(NodeAgentError::Multiple(errors)),
        }
    }

    /// Check whether this error is (or only contains) a partial enrollment.
    pub fn is_partial_enrollment(&self) -> bool {
        match self {
            NodeAgentError::PartialEnrollment { .. } => true,
            NodeAgentError::Multiple(errors) => {
                !errors.is_empty() && errors.iter().all(NodeAgentError::is_partial_enrollment)
            }
            _ => false,
        }
    }

    /// Check whether this error contains an address collision anywhere.
    pub fn is_address_collision(&self) -> bool {
        match self {
            NodeAgentError::AddressCollision { .. } => true,
            NodeAgentError::Multiple(errors) => {
                errors.iter().any(NodeAgentError::is_address_collision)
            }
            _ => false,
        }
    }

    /// Check if this error is transient and should be retried by a higher layer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NodeAgentError::Io { .. }
                | NodeAgentError::Timeout(_)
                | NodeAgentError::ConnectionClosed { .. }
                | NodeAgentError::NoActiveConnection
        )
    }

    /// Convert to a JSON-RPC error code for the event ingress.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Application codes:
    /// - -32000: Dataplane transport error
    /// - -32001: Partial enrollment
    /// - -32002: Address collision
    /// - -32003: Dataplane protocol error or rejection
    /// - -32004: Cancelled
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            NodeAgentError::Rpc { code, .. } => *code,

            NodeAgentError::MethodNotFound { .. } => -32601,

            NodeAgentError::Multiple(_) if self.is_partial_enrollment() => -32001,
            NodeAgentError::Multiple(_) if self.is_address_collision() => -32002,

            NodeAgentError::Io { .. }
            | NodeAgentError::Timeout(_)
            | NodeAgentError::ConnectionClosed { .. }
            | NodeAgentError::NoActiveConnection => -32000,

            NodeAgentError::PartialEnrollment { .. } => -32001,

            NodeAgentError::AddressCollision { .. } => -32002,

            NodeAgentError::ProtocolViolation { .. }
            | NodeAgentError::Truncated { .. }
            | NodeAgentError::AckError { .. } => -32003,

            NodeAgentError::Cancelled => -32004,

            NodeAgentError::InvalidParams { .. } | NodeAgentError::Json { .. } => -32602,

            _ => -32603,
        }
    }
}
