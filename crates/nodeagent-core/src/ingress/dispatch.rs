//! Ingress methods served by the orchestrator.

use super::server::IngressDispatch;
use crate::config::IngressConfig;
use crate::error::{NodeAgentError, Result};
use crate::models::Workload;
use crate::orchestrator::MeshDataplane;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Methods the agent answers.
pub const METHODS: &[&str] = &["add_workload", "remove_workload", "list_workloads", "status"];

/// Params of `add_workload` and `remove_workload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadParams {
    pub workload: Workload,
}

impl From<&Workload> for WorkloadParams {
    fn from(workload: &Workload) -> Self {
        Self {
            workload: workload.clone(),
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: serde_json::Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| NodeAgentError::InvalidParams {
        message: e.to_string(),
    })
}

async fn bounded<F: Future<Output = Result<()>>>(fut: F) -> Result<()> {
    tokio::time::timeout(IngressConfig::REQUEST_TIMEOUT, fut)
        .await
        .map_err(|_| NodeAgentError::Timeout(IngressConfig::REQUEST_TIMEOUT))?
}

#[async_trait::async_trait]
impl IngressDispatch for MeshDataplane {
    async fn dispatch(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        match method {
            "add_workload" => {
                let WorkloadParams { workload } = parse_params(params)?;
                bounded(self.add_workload(&workload)).await?;
                Ok(serde_json::json!({ "uid": workload.uid }))
            }
            "remove_workload" => {
                let WorkloadParams { workload } = parse_params(params)?;
                bounded(self.remove_workload(&workload)).await?;
                Ok(serde_json::json!({ "uid": workload.uid }))
            }
            "list_workloads" => Ok(serde_json::to_value(self.list_workloads())?),
            "status" => Ok(serde_json::to_value(self.status())?),
            _ => Err(NodeAgentError::MethodNotFound {
                method: method.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_params_are_invalid_params() {
        let result: Result<WorkloadParams> = parse_params(serde_json::json!({"uid": "p1"}));
        let err = result.unwrap_err();
        assert_eq!(err.to_rpc_error_code(), -32602);
    }

    #[test]
    fn test_workload_params_shape() {
        let params: WorkloadParams = parse_params(serde_json::json!({
            "workload": {"uid": "p1", "namespace": "default", "name": "web", "addresses": ["10.0.0.1"]}
        }))
        .unwrap();
        assert_eq!(params.workload.uid.as_str(), "p1");
        assert_eq!(params.workload.addresses.len(), 1);
    }
}
