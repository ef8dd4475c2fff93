//! Room membership index.
//!
//! Rooms are named broadcast channels. A connection occupies at most one
//! room at a time: joining a room moves it out of the previous one.
//! Private messages never touch this index.

use crate::registry::ConnectionRegistry;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_protocol::{ConnectionId, RoomId};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 64;

/// Room index errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidName(&'static str),

    /// Room is not declared and rooms cannot be created on demand.
    #[error("Room not found: {0}")]
    UnknownRoom(RoomId),

    /// The connection is not registered.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.starts_with('$') {
        return Err("Room names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// Bidirectional room ↔ connection index.
#[derive(Debug)]
pub struct RoomIndex {
    /// Members of each room.
    members: DashMap<RoomId, HashSet<ConnectionId>>,
    /// Current room of each connection.
    current: DashMap<ConnectionId, RoomId>,
    /// Rooms that exist even when empty, in declaration order.
    declared: Vec<RoomId>,
    /// Whether undeclared rooms are created on first join.
    auto_create: bool,
}

impl RoomIndex {
    /// Create an index with a set of permanent rooms.
    #[must_use]
    pub fn new(declared: Vec<RoomId>, auto_create: bool) -> Self {
        let members = DashMap::new();
        for room in &declared {
            members.insert(room.clone(), HashSet::new());
        }
        Self {
            members,
            current: DashMap::new(),
            declared,
            auto_create,
        }
    }

    /// Check that a room name is valid and the room can be joined.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid, or the room does not exist
    /// and cannot be created.
    pub fn resolve(&self, room: &str) -> Result<(), RoomError> {
        validate_room_name(room).map_err(RoomError::InvalidName)?;
        if !self.auto_create && !self.room_exists(room) {
            return Err(RoomError::UnknownRoom(room.to_string()));
        }
        Ok(())
    }

    /// Move a connection into `room`, leaving its previous room.
    ///
    /// Returns the previous room, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not registered or the room
    /// cannot be joined.
    pub fn join(
        &self,
        connection_id: &ConnectionId,
        room: &str,
        registry: &ConnectionRegistry,
    ) -> Result<Option<RoomId>, RoomError> {
        if !registry.contains(connection_id) {
            return Err(RoomError::UnknownConnection(connection_id.clone()));
        }
        self.resolve(room)?;

        // The `current` slot stays locked until both member sets are updated,
        // so no reader can observe the connection in two rooms.
        let previous = match self.current.entry(connection_id.clone()) {
            Entry::Occupied(mut slot) => {
                let previous = slot.insert(room.to_string());
                self.remove_member(&previous, connection_id);
                self.add_member(room, connection_id);
                Some(previous)
            }
            Entry::Vacant(slot) => {
                let _slot = slot.insert(room.to_string());
                self.add_member(room, connection_id);
                None
            }
        };

        debug!(
            connection = %connection_id,
            room = %room,
            previous = ?previous,
            "Joined room"
        );
        Ok(previous)
    }

    /// Remove a connection from every room.
    ///
    /// Returns the rooms it was removed from.
    pub fn leave_all(&self, connection_id: &ConnectionId) -> Vec<RoomId> {
        let Some((_, room)) = self.current.remove(connection_id) else {
            return Vec::new();
        };
        self.remove_member(&room, connection_id);
        debug!(connection = %connection_id, room = %room, "Left room");
        vec![room]
    }

    /// Members of a room. Empty for unknown rooms.
    #[must_use]
    pub fn members_of(&self, room: &str) -> Vec<ConnectionId> {
        self.members
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of members in a room.
    #[must_use]
    pub fn member_count(&self, room: &str) -> usize {
        self.members.get(room).map(|m| m.len()).unwrap_or(0)
    }

    /// Current room of a connection.
    #[must_use]
    pub fn room_of(&self, connection_id: &ConnectionId) -> Option<RoomId> {
        self.current.get(connection_id).map(|r| r.clone())
    }

    /// Check if a room exists.
    #[must_use]
    pub fn room_exists(&self, room: &str) -> bool {
        self.members.contains_key(room)
    }

    /// All rooms: declared rooms first, then rooms created on demand, sorted.
    #[must_use]
    pub fn room_names(&self) -> Vec<RoomId> {
        let mut dynamic: Vec<RoomId> = self
            .members
            .iter()
            .map(|e| e.key().clone())
            .filter(|r| !self.declared.contains(r))
            .collect();
        dynamic.sort();

        self.declared.iter().cloned().chain(dynamic).collect()
    }

    /// Number of rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.members.len()
    }

    fn add_member(&self, room: &str, connection_id: &ConnectionId) {
        self.members
            .entry(room.to_string())
            .or_insert_with(|| {
                debug!(room = %room, "Creating room");
                HashSet::new()
            })
            .insert(connection_id.clone());
    }

    fn remove_member(&self, room: &str, connection_id: &ConnectionId) {
        if let Some(mut members) = self.members.get_mut(room) {
            members.remove(connection_id);
        }
        // Rooms created on demand disappear once empty.
        if !self.declared.iter().any(|r| r == room) {
            if self
                .members
                .remove_if(room, |_, members| members.is_empty())
                .is_some()
            {
                debug!(room = %room, "Deleted empty room");
            }
        }
    }
}
