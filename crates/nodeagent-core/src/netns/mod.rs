//! Network namespace capability.
//!
//! The agent never interprets a namespace itself. It needs a stable identity
//! to deduplicate re-adds and a descriptor to hand to the dataplane. Both are
//! captured by [`NamespaceHandle`]; how a platform reference becomes a handle
//! is behind the [`NamespaceResolver`] trait.

mod resolver;

pub use resolver::{NetnsPathResolver, StaticNamespaceResolver};

use crate::error::Result;
use crate::models::NamespaceRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

/// Platform-stable identity of a network namespace.
///
/// Two handles with equal ids refer to the same kernel namespace even when
/// they were opened through different paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceId(String);

impl NamespaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity of a namespace file from its device and inode numbers.
    pub fn from_dev_ino(dev: u64, ino: u64) -> Self {
        Self(format!("{dev}:{ino}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owned reference to an OS network namespace.
///
/// Dropping the handle closes the descriptor. Handles are shared as
/// `Arc<NamespaceHandle>` between the workload cache and in-flight protocol
/// requests, so the descriptor stays open until the last holder lets go.
#[derive(Debug)]
pub struct NamespaceHandle {
    id: NamespaceId,
    fd: OwnedFd,
}

impl NamespaceHandle {
    pub fn new(id: NamespaceId, fd: OwnedFd) -> Self {
        Self { id, fd }
    }

    pub fn id(&self) -> &NamespaceId {
        &self.id
    }

    /// Descriptor passed to the dataplane as an `SCM_RIGHTS` attachment.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Release the OS resource now.
    pub fn close(self) {
        drop(self.fd);
    }
}

/// Outcome of resolving a namespace reference.
#[derive(Debug)]
pub enum ResolvedNamespace {
    Handle(NamespaceHandle),
    /// The namespace does not exist yet; retry on a later event.
    NotYetAvailable,
}

/// Turns a platform namespace reference into an owned handle.
#[async_trait]
pub trait NamespaceResolver: Send + Sync + 'static {
    /// Resolve `reference`.
    ///
    /// A namespace that does not exist yet is `Ok(NotYetAvailable)`, not an
    /// error. Errors are reserved for references that can never resolve.
    async fn resolve(&self, reference: &NamespaceRef) -> Result<ResolvedNamespace>;
}
