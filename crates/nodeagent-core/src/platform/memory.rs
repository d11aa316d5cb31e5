//! Platform collaborator kept in process.

use super::WorkloadPlatform;
use crate::config::AnnotationConfig;
use crate::error::{NodeAgentError, Result};
use crate::models::{Workload, WorkloadUid};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::{debug, info};

/// In-memory platform.
///
/// Holds the node-local workload list (optionally loaded from a JSON file)
/// and records enrollment annotations per workload.
#[derive(Debug, Default)]
pub struct InMemoryPlatform {
    workloads: RwLock<BTreeMap<WorkloadUid, Workload>>,
    annotations: RwLock<HashMap<WorkloadUid, BTreeMap<String, String>>>,
    fail_annotations: AtomicBool,
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workloads(workloads: impl IntoIterator<Item = Workload>) -> Self {
        let platform = Self::new();
        for workload in workloads {
            platform.insert_workload(workload);
        }
        platform
    }

    /// Load the node-local workload list from a JSON array file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            NodeAgentError::io_with_context(e, format!("read workloads file {}", path.display()))
        })?;
        let workloads: Vec<Workload> = serde_json::from_str(&contents)?;
        info!("Loaded {} workloads from {}", workloads.len(), path.display());
        Ok(Self::with_workloads(workloads))
    }

    pub fn insert_workload(&self, workload: Workload) {
        self.workloads
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(workload.uid.clone(), workload);
    }

    pub fn remove_workload(&self, uid: &WorkloadUid) -> Option<Workload> {
        self.workloads
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(uid)
    }

    /// Make annotation calls fail, to exercise error paths.
    pub fn set_fail_annotations(&self, fail: bool) {
        self.fail_annotations.store(fail, Ordering::Relaxed);
    }

    /// Annotations currently recorded on `uid`.
    pub fn annotations(&self, uid: &WorkloadUid) -> BTreeMap<String, String> {
        self.annotations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(uid)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_enrolled(&self, uid: &WorkloadUid) -> bool {
        self.annotations(uid)
            .get(AnnotationConfig::ENROLLMENT_KEY)
            .is_some_and(|value| value == AnnotationConfig::ENROLLED_VALUE)
    }

    fn check_failure(&self, workload: &Workload) -> Result<()> {
        if self.fail_annotations.load(Ordering::Relaxed) {
            return Err(NodeAgentError::Platform {
                uid: workload.uid.to_string(),
                message: "annotation update rejected".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl WorkloadPlatform for InMemoryPlatform {
    async fn annotate_enrolled(&self, workload: &Workload) -> Result<()> {
        self.check_failure(workload)?;
        debug!(uid = %workload.uid, name = %workload.info.name, "annotating workload enrolled");
        self.annotations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(workload.uid.clone())
            .or_default()
            .insert(
                AnnotationConfig::ENROLLMENT_KEY.to_string(),
                AnnotationConfig::ENROLLED_VALUE.to_string(),
            );
        Ok(())
    }

    async fn annotate_unenrolled(&self, workload: &Workload) -> Result<()> {
        self.check_failure(workload)?;
        debug!(uid = %workload.uid, name = %workload.info.name, "removing enrollment annotation");
        let mut annotations = self.annotations.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = annotations.get_mut(&workload.uid) {
            entry.remove(AnnotationConfig::ENROLLMENT_KEY);
            if entry.is_empty() {
                annotations.remove(&workload.uid);
            }
        }
        Ok(())
    }

    async fn list_node_workloads(&self) -> Result<Vec<Workload>> {
        Ok(self
            .workloads
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_annotation_round() {
        let platform = InMemoryPlatform::new();
        let workload = Workload::new("p1", "default", "web");

        platform.annotate_enrolled(&workload).await.unwrap();
        assert!(platform.is_enrolled(&workload.uid));

        platform.annotate_unenrolled(&workload).await.unwrap();
        assert!(!platform.is_enrolled(&workload.uid));
        assert!(platform.annotations(&workload.uid).is_empty());
    }

    #[tokio::test]
    async fn test_failing_annotations() {
        let platform = InMemoryPlatform::new();
        platform.set_fail_annotations(true);
        let result = platform
            .annotate_enrolled(&Workload::new("p1", "default", "web"))
            .await;
        assert!(matches!(result, Err(NodeAgentError::Platform { .. })));
    }

    #[tokio::test]
    async fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workloads.json");
        std::fs::write(
            &path,
            r#"[
                {"uid": "b", "namespace": "ns", "name": "two", "addresses": ["10.0.0.2"]},
                {"uid": "a", "namespace": "ns", "name": "one", "netns": "/proc/1/ns/net"}
            ]"#,
        )
        .unwrap();

        let platform = InMemoryPlatform::from_file(&path).await.unwrap();
        let workloads = platform.list_node_workloads().await.unwrap();
        assert_eq!(workloads.len(), 2);
        assert_eq!(workloads[0].uid.as_str(), "a");
    }

    #[tokio::test]
    async fn test_from_missing_file_is_io_error() {
        let result = InMemoryPlatform::from_file("/nonexistent/workloads.json").await;
        assert!(matches!(result, Err(NodeAgentError::Io { .. })));
    }
}
