//! Observability context passed to each component at construction.
//!
//! The daemon creates one [`Telemetry`] and hands a component-scoped clone to
//! every part of the agent. There is no process-global registry: two agents in
//! one process (as in the integration tests) keep separate counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::Span;

/// Counters and gauges for the enrollment engine.
#[derive(Debug, Default)]
pub struct AgentMetrics {
    live_connections: AtomicU64,
    accepted_connections: AtomicU64,
    snapshot_replays: AtomicU64,
    keepalive_failures: AtomicU64,

    enrolled: AtomicU64,
    partially_enrolled: AtomicU64,
    failed_adds: AtomicU64,
    removals: AtomicU64,
    failed_removals: AtomicU64,

    ipset_collisions: AtomicU64,
}

impl AgentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the live connection gauge.
    pub fn set_live_connections(&self, count: usize) {
        self.live_connections.store(count as u64, Ordering::Relaxed);
    }

    pub fn record_connection_accepted(&self) {
        self.accepted_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot_replay(&self) {
        self.snapshot_replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_keepalive_failure(&self) {
        self.keepalive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enrolled(&self) {
        self.enrolled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partially_enrolled(&self) {
        self.partially_enrolled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_add(&self) {
        self.failed_adds.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of a workload removal.
    pub fn record_removal(&self, success: bool) {
        if success {
            self.removals.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_removals.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_ipset_collision(&self) {
        self.ipset_collisions.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            live_connections: self.live_connections.load(Ordering::Relaxed),
            accepted_connections: self.accepted_connections.load(Ordering::Relaxed),
            snapshot_replays: self.snapshot_replays.load(Ordering::Relaxed),
            keepalive_failures: self.keepalive_failures.load(Ordering::Relaxed),
            enrolled: self.enrolled.load(Ordering::Relaxed),
            partially_enrolled: self.partially_enrolled.load(Ordering::Relaxed),
            failed_adds: self.failed_adds.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            failed_removals: self.failed_removals.load(Ordering::Relaxed),
            ipset_collisions: self.ipset_collisions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`AgentMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub live_connections: u64,
    pub accepted_connections: u64,
    pub snapshot_replays: u64,
    pub keepalive_failures: u64,
    pub enrolled: u64,
    pub partially_enrolled: u64,
    pub failed_adds: u64,
    pub removals: u64,
    pub failed_removals: u64,
    pub ipset_collisions: u64,
}

/// Component-scoped observability handle.
#[derive(Debug, Clone)]
pub struct Telemetry {
    component: &'static str,
    metrics: Arc<AgentMetrics>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    /// Create a root context with fresh metrics.
    pub fn new() -> Self {
        Self {
            component: "agent",
            metrics: Arc::new(AgentMetrics::new()),
        }
    }

    /// Derive a context for `component` sharing the same metrics.
    pub fn for_component(&self, component: &'static str) -> Self {
        Self {
            component,
            metrics: Arc::clone(&self.metrics),
        }
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    pub fn metrics(&self) -> &AgentMetrics {
        &self.metrics
    }

    /// Span used to instrument this component's spawned tasks.
    pub fn span(&self) -> Span {
        tracing::info_span!("nodeagent", component = self.component)
    }
}
