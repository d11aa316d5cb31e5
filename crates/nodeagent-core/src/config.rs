//! Centralized configuration for the node agent.
//!
//! Compile-time defaults live in constant-only structs, grouped by the
//! component that consumes them. Runtime settings that vary per node (socket
//! paths, IP set name, backend choice) live in [`AgentConfig`], which the
//! daemon fills from its command line.

use crate::error::{NodeAgentError, Result};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

/// Dataplane wire protocol constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Version this controller speaks.
    pub const VERSION: u32 = 1;
    /// Deadline for a single write and for the ack that follows it.
    pub const READ_WRITE_DEADLINE: Duration = Duration::from_secs(5);
    /// How long the connection may sit idle before a liveness probe.
    pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
    /// Read deadline of the liveness probe.
    pub const KEEPALIVE_PROBE_TIMEOUT: Duration = Duration::from_millis(10);
    /// Fixed receive buffer; longer datagrams are a protocol error.
    pub const RECEIVE_BUFFER_SIZE: usize = 1024;
    /// Outbound requests queued per connection before senders wait.
    pub const UPDATE_QUEUE_DEPTH: usize = 100;
}

/// Dataplane listener constants.
pub struct ListenerConfig;

impl ListenerConfig {
    pub const DEFAULT_SOCKET_PATH: &'static str = "/var/run/nodeagent/dataplane.sock";
    /// Accepted connections per second. At most one or two dataplane
    /// instances exist per node, so anything above this is a reconnect loop.
    pub const ACCEPT_RATE_PER_SECOND: NonZeroU32 = match NonZeroU32::new(5) {
        Some(rate) => rate,
        None => panic!("accept rate must be non-zero"),
    };
    pub const ACCEPT_BURST: NonZeroU32 = NonZeroU32::MIN;
    pub const LISTEN_BACKLOG: i32 = 16;
}

/// Probe IP set constants.
pub struct IpSetConfig;

impl IpSetConfig {
    pub const DEFAULT_SET_NAME: &'static str = "nodeagent-probes";
    pub const IPSET_BINARY: &'static str = "ipset";
    pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Event ingress constants.
pub struct IngressConfig;

impl IngressConfig {
    pub const DEFAULT_SOCKET_PATH: &'static str = "/var/run/nodeagent/ingress.sock";
    /// Maximum size of one JSON-RPC frame.
    pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
    pub const MAX_CONNECTIONS: usize = 32;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    /// Upper bound on a single add/remove call made through the ingress.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Platform annotation constants.
pub struct AnnotationConfig;

impl AnnotationConfig {
    pub const ENROLLMENT_KEY: &'static str = "nodeagent.mesh/redirection";
    pub const ENROLLED_VALUE: &'static str = "enabled";
}

/// Address family of the probe IP set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    #[default]
    Inet,
    Inet6,
}

impl IpFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpFamily::Inet => "inet",
            IpFamily::Inet6 => "inet6",
        }
    }

    /// Check whether `addr` belongs to this family.
    pub fn contains(&self, addr: &std::net::IpAddr) -> bool {
        match self {
            IpFamily::Inet => addr.is_ipv4(),
            IpFamily::Inet6 => addr.is_ipv6(),
        }
    }
}

/// Which IP set implementation the agent drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpSetBackendKind {
    /// The kernel set, managed through the `ipset` utility.
    #[default]
    Kernel,
    /// An in-process set, for nodes without the utility.
    Memory,
}

/// Timeouts applied to one dataplane connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTimeouts {
    /// Hello wait, write deadline, and ack wait.
    pub read_write: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_probe: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            read_write: ProtocolConfig::READ_WRITE_DEADLINE,
            keepalive_interval: ProtocolConfig::KEEPALIVE_INTERVAL,
            keepalive_probe: ProtocolConfig::KEEPALIVE_PROBE_TIMEOUT,
        }
    }
}

/// Runtime configuration for one node agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Seqpacket socket the dataplane process connects to.
    pub dataplane_socket: PathBuf,
    /// Stream socket the platform event source talks JSON-RPC on.
    pub ingress_socket: PathBuf,
    pub ipset_name: String,
    pub ipset_family: IpFamily,
    pub ipset_backend: IpSetBackendKind,
    /// Optional JSON file with the node-local workloads present at startup.
    pub initial_workloads: Option<PathBuf>,
    pub timeouts: ConnectionTimeouts,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            dataplane_socket: PathBuf::from(ListenerConfig::DEFAULT_SOCKET_PATH),
            ingress_socket: PathBuf::from(IngressConfig::DEFAULT_SOCKET_PATH),
            ipset_name: IpSetConfig::DEFAULT_SET_NAME.to_string(),
            ipset_family: IpFamily::default(),
            ipset_backend: IpSetBackendKind::default(),
            initial_workloads: None,
            timeouts: ConnectionTimeouts::default(),
        }
    }
}

impl AgentConfig {
    /// Reject settings the agent cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.dataplane_socket.as_os_str().is_empty() {
            return Err(NodeAgentError::Config {
                message: "dataplane socket path cannot be empty".to_string(),
            });
        }
        if self.ingress_socket.as_os_str().is_empty() {
            return Err(NodeAgentError::Config {
                message: "ingress socket path cannot be empty".to_string(),
            });
        }
        if self.dataplane_socket == self.ingress_socket {
            return Err(NodeAgentError::Config {
                message: "dataplane and ingress sockets must differ".to_string(),
            });
        }
        // ipset names are limited to 31 bytes by the kernel.
        if self.ipset_name.is_empty() || self.ipset_name.len() > 31 {
            return Err(NodeAgentError::Config {
                message: format!("invalid ipset name {:?}", self.ipset_name),
            });
        }
        if self.timeouts.keepalive_probe >= self.timeouts.keepalive_interval {
            return Err(NodeAgentError::Config {
                message: "keepalive probe must be shorter than the keepalive interval".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_socket_path_rejected() {
        let config = AgentConfig {
            dataplane_socket: PathBuf::new(),
            ..AgentConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(NodeAgentError::Config { .. })
        ));
    }

    #[test]
    fn test_long_ipset_name_rejected() {
        let config = AgentConfig {
            ipset_name: "x".repeat(32),
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"ipset_name": "probes", "ipset_backend": "memory"}"#).unwrap();
        assert_eq!(config.ipset_name, "probes");
        assert_eq!(config.ipset_backend, IpSetBackendKind::Memory);
        assert_eq!(config.timeouts, ConnectionTimeouts::default());
    }

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(ProtocolConfig::KEEPALIVE_PROBE_TIMEOUT < ProtocolConfig::KEEPALIVE_INTERVAL);
        assert!(ProtocolConfig::READ_WRITE_DEADLINE > Duration::ZERO);
        assert_eq!(ListenerConfig::ACCEPT_RATE_PER_SECOND.get(), 5);
        assert_eq!(ListenerConfig::ACCEPT_BURST.get(), 1);
    }
}
