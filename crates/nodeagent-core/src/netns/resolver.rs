//! Namespace resolvers.

use super::{NamespaceHandle, NamespaceId, NamespaceResolver, ResolvedNamespace};
use crate::error::{NodeAgentError, Result};
use crate::models::NamespaceRef;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::os::fd::OwnedFd;
use std::os::unix::fs::MetadataExt;
use std::sync::RwLock;
use tracing::debug;

/// Resolves namespace file paths such as `/proc/<pid>/ns/net`.
///
/// A missing file means the workload's sandbox is not up yet and resolves to
/// [`ResolvedNamespace::NotYetAvailable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NetnsPathResolver;

impl NetnsPathResolver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NamespaceResolver for NetnsPathResolver {
    async fn resolve(&self, reference: &NamespaceRef) -> Result<ResolvedNamespace> {
        let file = match tokio::fs::File::open(reference.as_str()).await {
            Ok(file) => file.into_std().await,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(netns = %reference, "namespace file not present yet");
                return Ok(ResolvedNamespace::NotYetAvailable);
            }
            Err(err) => {
                return Err(NodeAgentError::Namespace {
                    reference: reference.to_string(),
                    message: format!("failed to open: {}", err),
                })
            }
        };

        let metadata = file.metadata().map_err(|err| NodeAgentError::Namespace {
            reference: reference.to_string(),
            message: format!("failed to stat: {}", err),
        })?;
        let id = NamespaceId::from_dev_ino(metadata.dev(), metadata.ino());
        debug!(netns = %reference, id = %id, "resolved namespace");

        Ok(ResolvedNamespace::Handle(NamespaceHandle::new(
            id,
            OwnedFd::from(file),
        )))
    }
}

/// Resolver backed by a fixed table, for tests and dry runs.
///
/// Known references resolve to a handle over `/dev/null` carrying the
/// configured id. Unknown references are not yet available.
#[derive(Debug, Default)]
pub struct StaticNamespaceResolver {
    known: RwLock<HashMap<NamespaceRef, NamespaceId>>,
    broken: RwLock<HashSet<NamespaceRef>>,
}

impl StaticNamespaceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `reference` resolve to `id`.
    pub fn insert(&self, reference: impl Into<String>, id: impl Into<String>) {
        self.known
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(NamespaceRef::new(reference), NamespaceId::new(id));
    }

    /// Make `reference` fail with a hard error.
    pub fn fail(&self, reference: impl Into<String>) {
        self.broken
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(NamespaceRef::new(reference));
    }
}

#[async_trait]
impl NamespaceResolver for StaticNamespaceResolver {
    async fn resolve(&self, reference: &NamespaceRef) -> Result<ResolvedNamespace> {
        if self
            .broken
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(reference)
        {
            return Err(NodeAgentError::Namespace {
                reference: reference.to_string(),
                message: "resolution failed".to_string(),
            });
        }

        let id = self
            .known
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(reference)
            .cloned();
        let Some(id) = id else {
            return Ok(ResolvedNamespace::NotYetAvailable);
        };

        let file = std::fs::File::open("/dev/null")
            .map_err(|e| NodeAgentError::io_with_context(e, "open placeholder namespace"))?;
        Ok(ResolvedNamespace::Handle(NamespaceHandle::new(
            id,
            OwnedFd::from(file),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_path_resolver_missing_file_is_not_yet_available() {
        let dir = tempfile::tempdir().unwrap();
        let reference = NamespaceRef::new(dir.path().join("net").to_string_lossy());

        let resolved = NetnsPathResolver::new().resolve(&reference).await.unwrap();
        assert!(matches!(resolved, ResolvedNamespace::NotYetAvailable));
    }

    #[tokio::test]
    async fn test_path_resolver_identity_is_stable_across_opens() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let reference = NamespaceRef::new(file.path().to_string_lossy());
        let resolver = NetnsPathResolver::new();

        let first = match resolver.resolve(&reference).await.unwrap() {
            ResolvedNamespace::Handle(handle) => handle,
            other => panic!("Expected handle, got: {:?}", other),
        };
        let second = match resolver.resolve(&reference).await.unwrap() {
            ResolvedNamespace::Handle(handle) => handle,
            other => panic!("Expected handle, got: {:?}", other),
        };

        assert_eq!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticNamespaceResolver::new();
        resolver.insert("/netns/a", "ns-a");
        resolver.fail("/netns/broken");

        match resolver.resolve(&NamespaceRef::new("/netns/a")).await.unwrap() {
            ResolvedNamespace::Handle(handle) => assert_eq!(handle.id().as_str(), "ns-a"),
            other => panic!("Expected handle, got: {:?}", other),
        }
        assert!(matches!(
            resolver.resolve(&NamespaceRef::new("/netns/b")).await.unwrap(),
            ResolvedNamespace::NotYetAvailable
        ));
        assert!(matches!(
            resolver.resolve(&NamespaceRef::new("/netns/broken")).await,
            Err(NodeAgentError::Namespace { .. })
        ));
    }
}
