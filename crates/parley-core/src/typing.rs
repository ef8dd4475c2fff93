//! Typing indicators.
//!
//! Each room keeps the set of connections currently composing a message.
//! The sets are ephemeral: they are cleared when a connection changes room
//! or disconnects.

use crate::registry::ConnectionRegistry;
use dashmap::DashMap;
use parley_protocol::{ConnectionId, RoomId};
use std::collections::BTreeSet;
use tracing::trace;

/// Per-room typing sets.
#[derive(Debug, Default)]
pub struct TypingTracker {
    /// Ordered sets so name lists come out in a stable order.
    rooms: DashMap<RoomId, BTreeSet<ConnectionId>>,
}

impl TypingTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or clear the typing flag of a connection in a room.
    ///
    /// Returns the display names of everyone now typing in the room.
    pub fn set_typing(
        &self,
        connection_id: &ConnectionId,
        room: &str,
        is_typing: bool,
        registry: &ConnectionRegistry,
    ) -> Vec<String> {
        if is_typing {
            self.rooms
                .entry(room.to_string())
                .or_default()
                .insert(connection_id.clone());
        } else {
            if let Some(mut typing) = self.rooms.get_mut(room) {
                typing.remove(connection_id);
            }
            self.rooms.remove_if(room, |_, typing| typing.is_empty());
        }

        trace!(connection = %connection_id, room = %room, is_typing, "Typing updated");
        self.typing_names(room, registry)
    }

    /// Remove a connection from every typing set.
    ///
    /// Returns the rooms whose set changed.
    pub fn clear_all(&self, connection_id: &ConnectionId) -> Vec<RoomId> {
        let mut touched = Vec::new();
        for mut entry in self.rooms.iter_mut() {
            if entry.value_mut().remove(connection_id) {
                touched.push(entry.key().clone());
            }
        }
        for room in &touched {
            self.rooms.remove_if(room, |_, typing| typing.is_empty());
        }
        touched
    }

    /// Display names of everyone typing in a room.
    ///
    /// Connections whose name cannot be resolved are skipped.
    #[must_use]
    pub fn typing_names(&self, room: &str, registry: &ConnectionRegistry) -> Vec<String> {
        // Copy the IDs out before touching the registry.
        let ids: Vec<ConnectionId> = self
            .rooms
            .get(room)
            .map(|typing| typing.iter().cloned().collect())
            .unwrap_or_default();

        ids.iter()
            .filter_map(|id| registry.display_name(id))
            .collect()
    }

    /// Check if a connection is typing in a room.
    #[must_use]
    pub fn is_typing(&self, connection_id: &ConnectionId, room: &str) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|typing| typing.contains(connection_id))
    }
}
