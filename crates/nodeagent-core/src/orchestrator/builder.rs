//! Builder for wiring a [`MeshDataplane`].

use super::MeshDataplane;
use crate::config::{AgentConfig, IpSetBackendKind};
use crate::dataplane::DataplaneServer;
use crate::error::Result;
use crate::ipset::{IpSetBackend, IpSetSynchronizer, InMemoryIpSet, IpsetCli};
use crate::netns::{NamespaceResolver, NetnsPathResolver};
use crate::platform::{InMemoryPlatform, WorkloadPlatform};
use crate::telemetry::Telemetry;
use std::sync::Arc;

/// Builder for configuring a [`MeshDataplane`].
///
/// Every collaborator has a default derived from the [`AgentConfig`]; tests
/// swap in the in-memory ones.
///
/// # Example
///
/// ```rust,ignore
/// use nodeagent::{AgentConfig, MeshDataplane};
///
/// let agent = MeshDataplane::builder(AgentConfig::default())
///     .platform(platform)
///     .build()?;
/// agent.construct_initial_snapshot().await?;
/// agent.start()?;
/// ```
pub struct MeshDataplaneBuilder {
    config: AgentConfig,
    resolver: Option<Arc<dyn NamespaceResolver>>,
    ipset_backend: Option<Arc<dyn IpSetBackend>>,
    platform: Option<Arc<dyn WorkloadPlatform>>,
    telemetry: Option<Telemetry>,
}

impl MeshDataplaneBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            resolver: None,
            ipset_backend: None,
            platform: None,
            telemetry: None,
        }
    }

    /// Namespace resolver.
    ///
    /// Default: [`NetnsPathResolver`]
    pub fn resolver(mut self, resolver: Arc<dyn NamespaceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// IP set backend.
    ///
    /// Default: chosen by `ipset_backend` in the config.
    pub fn ipset_backend(mut self, backend: Arc<dyn IpSetBackend>) -> Self {
        self.ipset_backend = Some(backend);
        self
    }

    /// Platform collaborator.
    ///
    /// Default: an empty [`InMemoryPlatform`]
    pub fn platform(mut self, platform: Arc<dyn WorkloadPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Observability context shared by every component.
    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Validate the config and bind the dataplane socket.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<MeshDataplane> {
        self.config.validate()?;

        let telemetry = self.telemetry.unwrap_or_default();
        let resolver: Arc<dyn NamespaceResolver> = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(NetnsPathResolver::new()),
        };
        let backend: Arc<dyn IpSetBackend> = match (self.ipset_backend, self.config.ipset_backend) {
            (Some(backend), _) => backend,
            (None, IpSetBackendKind::Kernel) => Arc::new(IpsetCli::new(
                self.config.ipset_name.clone(),
                self.config.ipset_family,
            )),
            (None, IpSetBackendKind::Memory) => {
                Arc::new(InMemoryIpSet::new(self.config.ipset_name.clone()))
            }
        };
        let platform: Arc<dyn WorkloadPlatform> = match self.platform {
            Some(platform) => platform,
            None => Arc::new(InMemoryPlatform::new()),
        };

        let server = DataplaneServer::bind(
            &self.config.dataplane_socket,
            resolver,
            self.config.timeouts,
            telemetry.clone(),
        )?;
        let ipset = IpSetSynchronizer::new(backend, self.config.ipset_family, telemetry.clone());

        Ok(MeshDataplane::new(Arc::new(server), ipset, platform, telemetry))
    }
}
