//! In-process probe set.

use super::{IpSetBackend, IpSetEntry};
use crate::error::{NodeAgentError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct State {
    created: bool,
    entries: BTreeMap<IpAddr, IpSetEntry>,
}

/// Probe set kept in memory.
///
/// Used on nodes without the `ipset` utility and in tests. Counts every
/// change to the set so callers can assert that an operation was a no-op.
#[derive(Debug)]
pub struct InMemoryIpSet {
    name: String,
    state: Mutex<State>,
    mutations: AtomicU64,
}

impl InMemoryIpSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
            mutations: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of changes applied to the set so far.
    pub fn mutations(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    pub fn exists(&self) -> bool {
        self.lock().created
    }

    /// Current entries, ordered by address.
    pub fn entries(&self) -> Vec<IpSetEntry> {
        self.lock().entries.values().cloned().collect()
    }

    fn missing(&self) -> NodeAgentError {
        NodeAgentError::IpSet {
            message: format!("set {} does not exist", self.name),
        }
    }
}

#[async_trait]
impl IpSetBackend for InMemoryIpSet {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.created {
            state.created = true;
            self.mutated();
        }
        Ok(())
    }

    async fn add(&self, entry: &IpSetEntry, replace: bool) -> Result<()> {
        let mut state = self.lock();
        if !state.created {
            return Err(self.missing());
        }
        if let Some(existing) = state.entries.get(&entry.address) {
            if !replace {
                return Err(NodeAgentError::AddressCollision {
                    address: entry.address,
                    uid: entry.owner.clone(),
                    owner: existing.owner.to_string(),
                });
            }
            if existing == entry {
                return Ok(());
            }
        }
        state.entries.insert(entry.address, entry.clone());
        self.mutated();
        Ok(())
    }

    async fn delete_address(&self, address: IpAddr) -> Result<()> {
        let mut state = self.lock();
        if !state.created {
            return Err(self.missing());
        }
        if state.entries.remove(&address).is_some() {
            self.mutated();
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<IpSetEntry>> {
        let state = self.lock();
        if !state.created {
            return Err(self.missing());
        }
        Ok(state.entries.values().cloned().collect())
    }

    async fn flush(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.created {
            return Err(self.missing());
        }
        if !state.entries.is_empty() {
            state.entries.clear();
            self.mutated();
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.created {
            return Err(self.missing());
        }
        state.created = false;
        state.entries.clear();
        self.mutated();
        Ok(())
    }
}
