//! Node agent for a sidecar-less mesh dataplane.
//!
//! The agent enrolls node-local workloads with a separate dataplane process.
//! It hands the dataplane each workload's network namespace over a local
//! seqpacket socket, records enrollment on the platform, and keeps the
//! health-probe IP set in sync with the enrolled workloads.
//!
//! # Example
//!
//! ```rust,ignore
//! use nodeagent::{AgentConfig, IngressServer, MeshDataplane};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> nodeagent::Result<()> {
//!     let config = AgentConfig::default();
//!     let agent = Arc::new(MeshDataplane::builder(config.clone()).build()?);
//!
//!     if let Err(e) = agent.construct_initial_snapshot().await {
//!         tracing::warn!("initial snapshot incomplete: {}", e);
//!     }
//!     agent.start()?;
//!     let _ingress = IngressServer::start(&config.ingress_socket, agent.clone()).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     agent.stop().await
//! }
//! ```

pub mod cache;
pub mod cancel;
pub mod config;
pub mod dataplane;
pub mod error;
pub mod ingress;
pub mod ipset;
pub mod models;
pub mod netns;
pub mod orchestrator;
pub mod platform;
pub mod telemetry;

pub use cache::{CachedWorkload, WorkloadCache, WorkloadSnapshot};
pub use cancel::{CancellationToken, CancelledError};
pub use config::{AgentConfig, ConnectionTimeouts, IpFamily, IpSetBackendKind};
pub use dataplane::{ConnectionHandle, ConnectionId, ConnectionManager, ConnectionState, DataplaneServer};
pub use error::{NodeAgentError, Result};
pub use ingress::{IngressClient, IngressDispatch, IngressServer, IngressServerHandle};
pub use ipset::{InMemoryIpSet, IpSetBackend, IpSetEntry, IpSetSynchronizer, IpsetCli};
pub use models::{NamespaceRef, Workload, WorkloadInfo, WorkloadSummary, WorkloadUid};
pub use netns::{
    NamespaceHandle, NamespaceId, NamespaceResolver, NetnsPathResolver, ResolvedNamespace,
    StaticNamespaceResolver,
};
pub use orchestrator::{AgentStatus, MeshDataplane, MeshDataplaneBuilder};
pub use platform::{InMemoryPlatform, WorkloadPlatform};
pub use telemetry::{AgentMetrics, MetricsSnapshot, Telemetry};
