//! Set of live dataplane connections.
//!
//! The most recently added connection is the *active* one and receives
//! unicast adds. Removing it clears the pointer without falling back to an
//! older connection, so a send with nothing active fails loudly. Deletes are
//! broadcast to every live connection.

use super::connection::{ConnectionHandle, ConnectionId};
use crate::telemetry::Telemetry;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct Connections {
    by_id: HashMap<ConnectionId, ConnectionHandle>,
    active: Option<ConnectionId>,
}

/// Tracks live connections and elects the active one.
#[derive(Debug)]
pub struct ConnectionManager {
    inner: RwLock<Connections>,
    telemetry: Telemetry,
}

impl ConnectionManager {
    pub fn new(telemetry: Telemetry) -> Self {
        Self {
            inner: RwLock::new(Connections::default()),
            telemetry,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Connections> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Connections> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `conn` and make it the active connection.
    pub fn add(&self, conn: ConnectionHandle) {
        let mut inner = self.write();
        let id = conn.id();
        inner.by_id.insert(id, conn);
        inner.active = Some(id);
        self.telemetry.metrics().set_live_connections(inner.by_id.len());
        debug!(connection = %id, live = inner.by_id.len(), "dataplane connected");
    }

    /// Forget connection `id`, clearing the active pointer if it was active.
    pub fn remove(&self, id: ConnectionId) {
        let mut inner = self.write();
        inner.by_id.remove(&id);
        if inner.active == Some(id) {
            inner.active = None;
        }
        self.telemetry.metrics().set_live_connections(inner.by_id.len());
        debug!(connection = %id, live = inner.by_id.len(), "dataplane disconnected");
    }

    /// The connection unicast sends go to.
    pub fn active(&self) -> Option<ConnectionHandle> {
        let inner = self.read();
        inner.active.and_then(|id| inner.by_id.get(&id).cloned())
    }

    /// Call `f` on every live connection while holding the read lock.
    ///
    /// `f` must not block or await; use [`ConnectionManager::all`] to fan out
    /// I/O.
    pub fn for_each(&self, mut f: impl FnMut(&ConnectionHandle)) {
        for conn in self.read().by_id.values() {
            f(conn);
        }
    }

    /// Clones of every live connection handle, ordered by id.
    pub fn all(&self) -> Vec<ConnectionHandle> {
        let mut conns: Vec<_> = self.read().by_id.values().cloned().collect();
        conns.sort_by_key(ConnectionHandle::id);
        conns
    }

    pub fn count(&self) -> usize {
        self.read().by_id.len()
    }

    /// Close every live connection.
    pub fn close_all(&self) {
        self.for_each(ConnectionHandle::close);
    }
}
