//! Shared harness for the agent integration tests.
//!
//! Wires a [`MeshDataplane`] to in-memory collaborators and drives it with a
//! scripted dataplane peer over a real seqpacket socket.

#![allow(dead_code)]

use nodeagent::config::ProtocolConfig;
use nodeagent::dataplane::{DataplaneHello, SeqPacketStream, WorkloadRequest, WorkloadResponse};
use nodeagent::{
    AgentConfig, ConnectionState, ConnectionTimeouts, InMemoryIpSet, InMemoryPlatform,
    MeshDataplane, StaticNamespaceResolver, Workload,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Fail the test instead of hanging when `fut` stalls.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(STEP_TIMEOUT, fut)
        .await
        .expect("test step timed out")
}

pub struct Harness {
    pub dir: TempDir,
    pub agent: Arc<MeshDataplane>,
    pub ipset: Arc<InMemoryIpSet>,
    pub platform: Arc<InMemoryPlatform>,
    pub resolver: Arc<StaticNamespaceResolver>,
}

pub struct HarnessBuilder {
    workloads: Vec<Workload>,
    known_namespaces: Vec<(&'static str, &'static str)>,
    timeouts: ConnectionTimeouts,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            workloads: Vec::new(),
            known_namespaces: Vec::new(),
            timeouts: ConnectionTimeouts::default(),
        }
    }

    pub fn workload(mut self, workload: Workload) -> Self {
        self.workloads.push(workload);
        self
    }

    pub fn namespace(mut self, reference: &'static str, id: &'static str) -> Self {
        self.known_namespaces.push((reference, id));
        self
    }

    pub fn read_write_deadline(mut self, deadline: Duration) -> Self {
        self.timeouts.read_write = deadline;
        self
    }

    pub async fn start(self) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            dataplane_socket: dir.path().join("dataplane.sock"),
            ingress_socket: dir.path().join("ingress.sock"),
            timeouts: self.timeouts,
            ..AgentConfig::default()
        };

        let resolver = Arc::new(StaticNamespaceResolver::new());
        for (reference, id) in self.known_namespaces {
            resolver.insert(reference, id);
        }
        let ipset = Arc::new(InMemoryIpSet::new(config.ipset_name.clone()));
        let platform = Arc::new(InMemoryPlatform::with_workloads(self.workloads));

        let agent = MeshDataplane::builder(config)
            .resolver(resolver.clone())
            .ipset_backend(ipset.clone())
            .platform(platform.clone())
            .build()
            .unwrap();
        agent.construct_initial_snapshot().await.unwrap();
        agent.start().unwrap();

        Harness {
            dir,
            agent: Arc::new(agent),
            ipset,
            platform,
            resolver,
        }
    }
}

impl Harness {
    pub fn dataplane_socket(&self) -> PathBuf {
        self.dir.path().join("dataplane.sock")
    }

    pub fn ingress_socket(&self) -> PathBuf {
        self.dir.path().join("ingress.sock")
    }

    /// Wait until `count` connections are live and the active one is serving.
    pub async fn wait_for_serving(&self, count: usize) {
        within(async {
            loop {
                let connections = self.agent.server().connections();
                let serving = connections
                    .active()
                    .is_some_and(|conn| conn.state() == ConnectionState::Serving);
                if serving && connections.count() == count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
    }

    pub async fn wait_for_connections(&self, count: usize) {
        within(async {
            while self.agent.server().connections().count() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
    }
}

/// A request as seen by the dataplane, with the number of descriptors attached.
#[derive(Debug)]
pub struct Received {
    pub request: WorkloadRequest,
    pub fds: usize,
}

/// Scripted dataplane peer.
pub struct FakeDataplane {
    stream: SeqPacketStream,
    buf: Vec<u8>,
}

impl FakeDataplane {
    /// Connect and say hello.
    pub async fn connect(harness: &Harness) -> Self {
        let stream = SeqPacketStream::connect(harness.dataplane_socket()).unwrap();
        let hello = serde_json::to_vec(&DataplaneHello {
            version: ProtocolConfig::VERSION,
        })
        .unwrap();
        stream.send(&hello, None).await.unwrap();
        Self {
            stream,
            buf: vec![0u8; 4096],
        }
    }

    pub async fn recv(&mut self) -> Received {
        let datagram = within(self.stream.recv(&mut self.buf))
            .await
            .unwrap()
            .expect("agent closed the connection");
        Received {
            request: serde_json::from_slice(&self.buf[..datagram.len]).unwrap(),
            fds: datagram.fds.len(),
        }
    }

    pub async fn ack(&self) {
        self.reply(&WorkloadResponse::ok()).await;
    }

    pub async fn reject(&self, error: &str) {
        self.reply(&WorkloadResponse::error(error)).await;
    }

    async fn reply(&self, response: &WorkloadResponse) {
        let payload = serde_json::to_vec(response).unwrap();
        self.stream.send(&payload, None).await.unwrap();
    }

    /// Receive the next request and ack it.
    pub async fn accept_next(&mut self) -> Received {
        let received = self.recv().await;
        self.ack().await;
        received
    }

    /// Ack every replayed request up to and including `SnapshotSent`.
    pub async fn finish_replay(&mut self) -> Vec<Received> {
        let mut replayed = Vec::new();
        loop {
            let received = self.accept_next().await;
            let done = received.request == WorkloadRequest::SnapshotSent;
            replayed.push(received);
            if done {
                return replayed;
            }
        }
    }

    /// True once the agent has closed its end.
    pub async fn is_closed(&mut self) -> bool {
        matches!(within(self.stream.recv(&mut self.buf)).await, Ok(None) | Err(_))
    }
}
