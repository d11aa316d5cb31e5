//! Health-probe IP set.
//!
//! The node redirects kubelet-style health probes for enrolled workloads
//! based on membership in a kernel IP set. Each entry is tagged with the
//! owning workload's identity so entries can be listed and removed per
//! workload without a side index.

mod cli;
mod memory;
mod synchronizer;

pub use cli::IpsetCli;
pub use memory::InMemoryIpSet;
pub use synchronizer::IpSetSynchronizer;

use crate::error::Result;
use crate::models::WorkloadUid;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// IP protocol number recorded with each entry.
pub const PROBE_PROTOCOL: u8 = libc::IPPROTO_TCP as u8;

/// One member of the probe set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpSetEntry {
    pub address: IpAddr,
    pub protocol: u8,
    /// Identity of the workload the address belongs to.
    pub owner: WorkloadUid,
}

impl IpSetEntry {
    pub fn new(address: IpAddr, owner: WorkloadUid) -> Self {
        Self {
            address,
            protocol: PROBE_PROTOCOL,
            owner,
        }
    }
}

/// Storage for the probe set.
///
/// Entries are keyed by address: a set never holds two entries for one
/// address.
#[async_trait]
pub trait IpSetBackend: Send + Sync + 'static {
    /// Name of the set, for logs.
    fn name(&self) -> &str;

    /// Create the set. Succeeds if it already exists.
    async fn create(&self) -> Result<()>;

    /// Insert `entry`.
    ///
    /// Without `replace`, an existing entry for the same address fails with
    /// [`crate::error::NodeAgentError::AddressCollision`].
    async fn add(&self, entry: &IpSetEntry, replace: bool) -> Result<()>;

    /// Remove the entry for `address`, if any.
    async fn delete_address(&self, address: IpAddr) -> Result<()>;

    async fn list(&self) -> Result<Vec<IpSetEntry>>;

    async fn flush(&self) -> Result<()>;

    async fn destroy(&self) -> Result<()>;
}
