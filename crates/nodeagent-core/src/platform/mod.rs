//! Orchestration platform collaborator.
//!
//! The agent does not watch the platform itself. Workload events arrive
//! through the ingress, and the agent calls back into the platform only to
//! record enrollment on the workload and to list node-local workloads at
//! startup.

mod memory;

pub use memory::InMemoryPlatform;

use crate::error::Result;
use crate::models::Workload;
use async_trait::async_trait;

/// Calls the agent makes into the orchestration platform.
#[async_trait]
pub trait WorkloadPlatform: Send + Sync + 'static {
    /// Mark `workload` as enrolled in the mesh dataplane.
    async fn annotate_enrolled(&self, workload: &Workload) -> Result<()>;

    /// Clear the enrollment mark from `workload`.
    async fn annotate_unenrolled(&self, workload: &Workload) -> Result<()>;

    /// Workloads currently running on this node that belong in the mesh.
    async fn list_node_workloads(&self) -> Result<Vec<Workload>>;
}
