//! Connection registry: tracks live connections by id.
//!
//! Connections insert themselves once established and remove themselves
//! exactly once during teardown through [`ConnectionStore`]. The
//! [`ConnectionRegistry`] implementation is a concurrent map that also
//! publishes [`RegistryEvent`]s to subscribers.

use crate::connection::SocketHandle;
use dashmap::DashMap;
use peerwire_types::ConnectionId;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the registry event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The store a connection publishes itself into.
///
/// Must tolerate concurrent inserts and removes across many ids, and a
/// remove of an id it does not hold.
pub trait ConnectionStore: Send + Sync + 'static {
    fn insert(&self, handle: SocketHandle);
    fn remove(&self, id: &ConnectionId);
}

/// A change to the registry's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    Added(ConnectionId),
    Removed(ConnectionId),
}

/// Thread-safe registry of live connections.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<ConnectionId, SocketHandle>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connections: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Subscribe to additions and removals.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Get the handle for a connection.
    pub fn get(&self, id: &ConnectionId) -> Option<SocketHandle> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ids of all live connections.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Snapshot of all live connection handles.
    pub fn handles(&self) -> Vec<SocketHandle> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Close every live connection. Returns how many were closed.
    pub fn disconnect_all(&self) -> usize {
        // Snapshot first: teardown removes from the map.
        let handles = self.handles();
        handles.iter().filter(|handle| handle.close()).count()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStore for ConnectionRegistry {
    fn insert(&self, handle: SocketHandle) {
        let id = handle.id();
        if self.connections.insert(id, handle).is_none() {
            debug!(conn = %id, "peerwire: registered connection");
            let _ = self.events.send(RegistryEvent::Added(id));
        }
    }

    fn remove(&self, id: &ConnectionId) {
        if self.connections.remove(id).is_some() {
            debug!(conn = %id, "peerwire: unregistered connection");
            let _ = self.events.send(RegistryEvent::Removed(*id));
        }
    }
}
