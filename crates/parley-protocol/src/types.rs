//! Records carried inside protocol events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A room name.
pub type RoomId = String;

/// Identifier of a routed message, assigned after the persistence attempt.
pub type MessageId = String;

/// Process-wide counter backing [`ConnectionId::generate`].
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a live connection.
///
/// Identifiers are never reused within a process: a reconnecting client
/// always receives a fresh one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocate the next connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let n = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{n:x}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An opaque file attached to a message.
///
/// The server never inspects `data`; it is passed through as sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Original file name.
    pub name: String,
    /// MIME type reported by the client.
    #[serde(rename = "type")]
    pub mime_type: String,
    /// Base64 encoded contents.
    pub data: String,
}

impl Attachment {
    /// Size of the encoded payload in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.data.len()
    }
}

/// Where a message is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    /// Broadcast to the members of a room.
    Room(&'a str),
    /// Delivered to a single connection (and echoed to the sender).
    Private(&'a ConnectionId),
}

/// A chat message as routed to clients and handed to persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Delivery ID. Empty until the router has attempted persistence.
    #[serde(default)]
    pub id: MessageId,
    /// Display name of the author.
    pub sender: String,
    /// Connection that authored the message.
    pub sender_id: ConnectionId,
    /// Message text.
    pub body: String,
    /// Optional opaque attachment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    /// Room for broadcast messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomId>,
    /// Recipient for private messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<ConnectionId>,
    /// Whether this is a private message.
    #[serde(default)]
    pub is_private: bool,
    /// Milliseconds since the Unix epoch, assigned by the router.
    pub timestamp: u64,
    /// Set once a reader has acknowledged the message.
    #[serde(default)]
    pub read: bool,
}

impl ChatMessage {
    /// Create a message addressed to a room.
    #[must_use]
    pub fn to_room(
        sender: impl Into<String>,
        sender_id: ConnectionId,
        room: impl Into<RoomId>,
        body: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            id: MessageId::new(),
            sender: sender.into(),
            sender_id,
            body: body.into(),
            attachment: None,
            room: Some(room.into()),
            to: None,
            is_private: false,
            timestamp,
            read: false,
        }
    }

    /// Create a private message addressed to one connection.
    #[must_use]
    pub fn private(
        sender: impl Into<String>,
        sender_id: ConnectionId,
        to: ConnectionId,
        body: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            id: MessageId::new(),
            sender: sender.into(),
            sender_id,
            body: body.into(),
            attachment: None,
            room: None,
            to: Some(to),
            is_private: true,
            timestamp,
            read: false,
        }
    }

    /// Attach an opaque file.
    #[must_use]
    pub fn with_attachment(mut self, attachment: Option<Attachment>) -> Self {
        self.attachment = attachment;
        self
    }

    /// Set the delivery ID.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = id.into();
        self
    }

    /// Resolve the delivery target.
    ///
    /// Returns `None` when the record does not have exactly one of
    /// `room` / `to` set, which can only happen for hand-built or
    /// foreign records.
    #[must_use]
    pub fn target(&self) -> Option<Target<'_>> {
        match (&self.room, &self.to) {
            (Some(room), None) if !self.is_private => Some(Target::Room(room)),
            (None, Some(to)) if self.is_private => Some(Target::Private(to)),
            _ => None,
        }
    }
}

/// One line of the "who is online" list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// Display name chosen at join.
    pub display_name: String,
    /// Live connection.
    pub connection_id: ConnectionId,
    /// Broadcast room the connection currently occupies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_room: Option<RoomId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_room_message_target() {
        let msg = ChatMessage::to_room("alice", "conn-1".into(), "general", "hi", 10);
        assert_eq!(msg.target(), Some(Target::Room("general")));
        assert!(!msg.is_private);
        assert!(msg.id.is_empty());
    }

    #[test]
    fn test_private_message_target() {
        let to = ConnectionId::from("conn-2");
        let msg = ChatMessage::private("alice", "conn-1".into(), to.clone(), "psst", 10)
            .with_id("m-1");
        assert_eq!(msg.target(), Some(Target::Private(&to)));
        assert_eq!(msg.id, "m-1");
    }

    #[test]
    fn test_inconsistent_target_is_rejected() {
        let mut msg = ChatMessage::to_room("alice", "conn-1".into(), "general", "hi", 10);
        msg.to = Some("conn-2".into());
        assert_eq!(msg.target(), None);
    }

    #[test]
    fn test_attachment_type_field_name() {
        let attachment = Attachment {
            name: "cat.png".into(),
            mime_type: "image/png".into(),
            data: "aGVsbG8=".into(),
        };
        let json = serde_json::to_value(&attachment).unwrap();
        assert_eq!(json["type"], "image/png");
        assert_eq!(attachment.encoded_len(), 8);
    }
}
