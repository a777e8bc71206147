//! Connection registry with a channel reverse index.
//!
//! Maps connection ids to live [`Connection`]s and keeps a reverse index from
//! channel id so a transport event can be routed back to its connection.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::channel::{Channel, ChannelId, CloseStatus};

use super::{Connection, ConnectionId, Identity, DEFAULT_OUTBOX_CAPACITY};

#[derive(Debug, Default)]
struct Inner {
    /// All connections by id.
    connections: HashMap<ConnectionId, Arc<Connection>>,
    /// Reverse index: channel -> connection id.
    by_channel: HashMap<ChannelId, ConnectionId>,
}

/// Registry of all live connections in this process.
///
/// Both maps sit behind one lock so they never disagree.
#[derive(Debug)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    outbox_capacity: usize,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::with_outbox_capacity(DEFAULT_OUTBOX_CAPACITY)
    }
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry whose connections queue at most `capacity`
    /// outbound messages.
    pub fn with_outbox_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::default(),
            outbox_capacity: capacity,
        }
    }

    /// Create and register a connection for `channel`.
    ///
    /// Must run inside a Tokio runtime.
    pub fn add_connection(
        &self,
        channel: Arc<Channel>,
        identity: Option<Identity>,
    ) -> Arc<Connection> {
        let channel_id = channel.id();
        let connection = Arc::new(Connection::new(channel, identity, self.outbox_capacity));

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_channel
            .insert(channel_id, connection.id().clone());
        inner
            .connections
            .insert(connection.id().clone(), Arc::clone(&connection));
        drop(inner);

        log::debug!("[Hub] registered connection {} on {channel_id}", connection.id());
        connection
    }

    /// Look up a connection by id.
    pub fn get_by_id(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.connections.get(id).cloned()
    }

    /// Look up the connection bound to `channel`.
    pub fn get_by_channel(&self, channel: &Channel) -> Option<Arc<Connection>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let id = inner.by_channel.get(&channel.id())?;
        inner.connections.get(id).cloned()
    }

    /// Snapshot of every live connection.
    pub fn get_all(&self) -> Vec<Arc<Connection>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.connections.values().cloned().collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.connections.len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a connection, fire its cancellation token and close its
    /// transport normally.
    ///
    /// Returns the removed connection; unknown or already-removed ids are a
    /// no-op returning `None`.
    pub async fn remove_connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let removed = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let removed = inner.connections.remove(id)?;
            inner.by_channel.remove(&removed.channel().id());
            removed
        };

        removed.cancellation.cancel();
        removed
            .channel()
            .close(CloseStatus::Normal, "connection removed")
            .await;
        log::debug!("[Hub] removed connection {id}");
        Some(removed)
    }
}
