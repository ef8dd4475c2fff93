//! Connection registry.
//!
//! The registry owns every live [`Connection`]: its identity and the outbox
//! the session task drains into the socket. Other components refer to
//! connections by [`ConnectionId`] only.

use crate::rooms::RoomIndex;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_protocol::{ConnectionId, PresenceEntry, ServerEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

/// Outbound event queue of a connection.
pub type Outbox = mpsc::Sender<Arc<ServerEvent>>;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A connection with this ID is already registered.
    #[error("Connection already registered: {0}")]
    DuplicateConnection(ConnectionId),

    /// No connection with this ID is registered.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The connection already has a display name.
    #[error("Connection {0} has already joined")]
    IdentityAlreadySet(ConnectionId),
}

/// A live connection.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    display_name: Option<String>,
    /// Order in which the connection joined; drives snapshot ordering.
    joined_seq: u64,
    outbox: Outbox,
}

impl Connection {
    fn new(id: ConnectionId, outbox: Outbox) -> Self {
        Self {
            id,
            display_name: None,
            joined_seq: 0,
            outbox,
        }
    }

    /// Connection ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Display name, once the connection has joined.
    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Whether the connection has established an identity.
    #[must_use]
    pub fn is_identified(&self) -> bool {
        self.display_name.is_some()
    }

    /// Queue an event for this connection.
    ///
    /// Returns `false` if the outbox is full or the session has gone away.
    pub fn send(&self, event: Arc<ServerEvent>) -> bool {
        match self.outbox.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(connection = %self.id, event = event.name(), "Outbox full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                trace!(connection = %self.id, "Outbox closed");
                false
            }
        }
    }
}

/// Registry of live connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
    join_counter: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is already registered.
    pub fn register(
        &self,
        connection_id: ConnectionId,
        outbox: Outbox,
    ) -> Result<Connection, RegistryError> {
        match self.connections.entry(connection_id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateConnection(connection_id)),
            Entry::Vacant(entry) => {
                let connection = Connection::new(connection_id, outbox);
                entry.insert(connection.clone());
                debug!(connection = %connection.id, "Connection registered");
                Ok(connection)
            }
        }
    }

    /// Set the display name of a connection. Allowed once per connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown or already named.
    pub fn set_identity(
        &self,
        connection_id: &ConnectionId,
        display_name: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let mut connection = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| RegistryError::UnknownConnection(connection_id.clone()))?;

        if connection.display_name.is_some() {
            return Err(RegistryError::IdentityAlreadySet(connection_id.clone()));
        }

        connection.display_name = Some(display_name.into());
        connection.joined_seq = self.join_counter.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(())
    }

    /// Remove a connection, returning its record.
    ///
    /// Unregistering an absent connection is a no-op.
    pub fn unregister(&self, connection_id: &ConnectionId) -> Option<Connection> {
        let removed = self.connections.remove(connection_id).map(|(_, c)| c);
        if removed.is_some() {
            debug!(connection = %connection_id, "Connection unregistered");
        }
        removed
    }

    /// Look up a connection.
    #[must_use]
    pub fn get(&self, connection_id: &ConnectionId) -> Option<Connection> {
        self.connections.get(connection_id).map(|c| c.clone())
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Display name of a connection, if registered and joined.
    #[must_use]
    pub fn display_name(&self, connection_id: &ConnectionId) -> Option<String> {
        self.connections
            .get(connection_id)
            .and_then(|c| c.display_name.clone())
    }

    /// Queue an event for one connection.
    ///
    /// Returns `false` if the connection is gone or its outbox rejected the event.
    pub fn deliver(&self, connection_id: &ConnectionId, event: Arc<ServerEvent>) -> bool {
        // Clone the sender so no map guard is held while queueing.
        let Some(connection) = self.get(connection_id) else {
            trace!(connection = %connection_id, "Delivery to unknown connection dropped");
            return false;
        };
        connection.send(event)
    }

    /// Queue an event for every registered connection.
    ///
    /// Returns the number of connections that accepted it.
    pub fn deliver_all(&self, event: &Arc<ServerEvent>) -> usize {
        let connections: Vec<Connection> = self.connections.iter().map(|c| c.clone()).collect();
        connections
            .iter()
            .filter(|c| c.send(Arc::clone(event)))
            .count()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of connections that have joined with a display name.
    #[must_use]
    pub fn identified_count(&self) -> usize {
        self.connections.iter().filter(|c| c.is_identified()).count()
    }

    /// Who is online, in join order.
    ///
    /// Connections that have not joined yet are not listed.
    #[must_use]
    pub fn snapshot_online(&self, rooms: &RoomIndex) -> Vec<PresenceEntry> {
        let mut online: Vec<(u64, PresenceEntry)> = self
            .connections
            .iter()
            .filter_map(|c| {
                let display_name = c.display_name.clone()?;
                Some((
                    c.joined_seq,
                    PresenceEntry {
                        display_name,
                        connection_id: c.id.clone(),
                        current_room: None,
                    },
                ))
            })
            .collect();
        online.sort_by_key(|(seq, _)| *seq);

        online
            .into_iter()
            .map(|(_, mut entry)| {
                entry.current_room = rooms.room_of(&entry.connection_id);
                entry
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox() -> (Outbox, mpsc::Receiver<Arc<ServerEvent>>) {
        mpsc::channel(8)
    }

    #[test]
    fn test_register_duplicate() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = outbox();

        registry.register("conn-1".into(), tx.clone()).unwrap();
        assert!(matches!(
            registry.register("conn-1".into(), tx),
            Err(RegistryError::DuplicateConnection(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_identity_set_once() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = outbox();
        let id = ConnectionId::from("conn-1");

        assert!(matches!(
            registry.set_identity(&id, "alice"),
            Err(RegistryError::UnknownConnection(_))
        ));

        registry.register(id.clone(), tx).unwrap();
        registry.set_identity(&id, "alice").unwrap();
        assert_eq!(registry.display_name(&id).as_deref(), Some("alice"));

        assert!(matches!(
            registry.set_identity(&id, "bob"),
            Err(RegistryError::IdentityAlreadySet(_))
        ));
        assert_eq!(registry.display_name(&id).as_deref(), Some("alice"));
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = outbox();
        let id = ConnectionId::from("conn-1");

        registry.register(id.clone(), tx).unwrap();
        assert!(registry.unregister(&id).is_some());
        assert!(registry.unregister(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_lists_joined_connections_in_order() {
        let registry = ConnectionRegistry::new();
        let rooms = RoomIndex::new(vec!["general".to_string()], true);
        let (tx, _rx) = outbox();

        for id in ["conn-b", "conn-a", "conn-c"] {
            registry.register(id.into(), tx.clone()).unwrap();
        }
        registry.set_identity(&"conn-b".into(), "bob").unwrap();
        registry.set_identity(&"conn-a".into(), "alice").unwrap();
        rooms.join(&"conn-b".into(), "general", &registry).unwrap();

        let snapshot = registry.snapshot_online(&rooms);
        let names: Vec<_> = snapshot.iter().map(|e| e.display_name.as_str()).collect();
        assert_eq!(names, ["bob", "alice"]);
        assert_eq!(snapshot[0].current_room.as_deref(), Some("general"));
        assert_eq!(snapshot[1].current_room, None);
        assert_eq!(registry.identified_count(), 2);
    }

    #[tokio::test]
    async fn test_deliver_full_outbox() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(1);
        let id = ConnectionId::from("conn-1");
        registry.register(id.clone(), tx).unwrap();

        let event = Arc::new(ServerEvent::error(1001, "x"));
        assert!(registry.deliver(&id, Arc::clone(&event)));
        assert!(!registry.deliver(&id, Arc::clone(&event)));
        assert!(!registry.deliver(&"conn-2".into(), event));

        assert_eq!(rx.recv().await.unwrap().name(), "error_notice");
    }
}
