//! Driving the agent through its ingress socket.

mod common;

use common::{within, FakeDataplane, HarnessBuilder};
use nodeagent::dataplane::WorkloadRequest;
use nodeagent::{IngressClient, IngressServer, NodeAgentError, Workload};
use std::sync::Arc;

#[tokio::test]
async fn test_ingress_add_list_remove() {
    let harness = HarnessBuilder::new()
        .namespace("/netns/web", "ns-web")
        .start()
        .await;
    let _ingress = IngressServer::start(harness.ingress_socket(), Arc::clone(&harness.agent))
        .await
        .unwrap();
    let mut dataplane = FakeDataplane::connect(&harness).await;
    dataplane.finish_replay().await;
    harness.wait_for_serving(1).await;

    let client = IngressClient::connect(harness.ingress_socket()).await.unwrap();
    let status = client.status().await.unwrap();
    assert!(status.ready);
    assert_eq!(status.live_connections, 1);

    let web = Workload::new("web-1", "shop", "web")
        .with_netns("/netns/web")
        .with_addresses(vec!["10.1.0.5".parse().unwrap()]);

    let add = {
        let web = web.clone();
        let socket = harness.ingress_socket();
        tokio::spawn(async move {
            let client = IngressClient::connect(socket).await.unwrap();
            client.add_workload(&web).await
        })
    };
    assert!(matches!(dataplane.accept_next().await.request, WorkloadRequest::Add { .. }));
    within(add).await.unwrap().unwrap();

    let listed = client.list_workloads().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].uid, web.uid);
    assert_eq!(listed[0].netns_id.as_deref(), Some("ns-web"));

    let remove = {
        let web = web.clone();
        let socket = harness.ingress_socket();
        tokio::spawn(async move {
            let client = IngressClient::connect(socket).await.unwrap();
            client.remove_workload(&web).await
        })
    };
    assert!(matches!(dataplane.accept_next().await.request, WorkloadRequest::Del { .. }));
    within(remove).await.unwrap().unwrap();

    assert!(client.list_workloads().await.unwrap().is_empty());
    let status = client.status().await.unwrap();
    assert_eq!(status.metrics.enrolled, 1);
    assert_eq!(status.metrics.removals, 1);
}

#[tokio::test]
async fn test_ingress_reports_partial_enrollment_code() {
    let harness = HarnessBuilder::new().start().await;
    let _ingress = IngressServer::start(harness.ingress_socket(), Arc::clone(&harness.agent))
        .await
        .unwrap();
    let client = IngressClient::connect(harness.ingress_socket()).await.unwrap();

    // No namespace reference and no dataplane: known but not functional.
    let result = client
        .add_workload(&Workload::new("batch-1", "jobs", "batch"))
        .await;

    match result {
        Err(NodeAgentError::Rpc { code, .. }) => assert_eq!(code, -32001),
        other => panic!("Expected partial enrollment error, got: {:?}", other),
    }
    assert!(harness.platform.is_enrolled(&"batch-1".into()));
}

#[tokio::test]
async fn test_ingress_rejects_bad_params_and_unknown_methods() {
    let harness = HarnessBuilder::new().start().await;
    let _ingress = IngressServer::start(harness.ingress_socket(), Arc::clone(&harness.agent))
        .await
        .unwrap();
    let client = IngressClient::connect(harness.ingress_socket()).await.unwrap();

    match client.call("add_workload", serde_json::json!({"uid": 7})).await {
        Err(NodeAgentError::Rpc { code, .. }) => assert_eq!(code, -32602),
        other => panic!("Expected invalid params, got: {:?}", other),
    }
    match client.call("drain_node", serde_json::json!({})).await {
        Err(NodeAgentError::Rpc { code, .. }) => assert_eq!(code, -32601),
        other => panic!("Expected method not found, got: {:?}", other),
    }
}
