//! Event types for the Parley protocol.
//!
//! Every frame on the wire is one tagged event. The `type` field selects the
//! variant; the remaining fields are the payload.

use serde::{Deserialize, Serialize};

use crate::types::{Attachment, ChatMessage, ConnectionId, MessageId, PresenceEntry, RoomId};
use crate::version::Version;

/// Events sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Establish the connection's identity and enter the default room.
    Join {
        /// Name shown to other users.
        display_name: String,
    },

    /// Move to another broadcast room.
    JoinRoom {
        /// Target room.
        room: RoomId,
    },

    /// Post a message to a room.
    SendMessage {
        /// Message text.
        #[serde(default)]
        body: String,
        /// Room to post in; defaults to the current room.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<RoomId>,
        /// Optional opaque attachment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment: Option<Attachment>,
    },

    /// Send a message to a single connection.
    PrivateMessage {
        /// Recipient connection.
        to: ConnectionId,
        /// Message text.
        #[serde(default)]
        body: String,
        /// Optional opaque attachment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment: Option<Attachment>,
    },

    /// Start or stop the typing indicator in the current room.
    Typing {
        /// Whether the user is typing.
        is_typing: bool,
    },

    /// Mark a message as read.
    MessageRead {
        /// Message being read.
        message_id: MessageId,
        /// Room the message was read in.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<RoomId>,
    },

    /// React to a message.
    AddReaction {
        /// Message reacted to.
        message_id: MessageId,
        /// Reaction emoji.
        emoji: String,
        /// Room to broadcast in; defaults to the current room.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<RoomId>,
    },

    /// Fetch a page of older messages.
    RequestMessages {
        /// Room to page through.
        room: RoomId,
        /// Only return messages strictly older than this timestamp.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<u64>,
        /// Page size.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },

    /// Application-level keepalive.
    Ping {
        /// Optional timestamp echoed in the pong.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientEvent {
    /// Event name, as it appears in the `type` field.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Join { .. } => "join",
            ClientEvent::JoinRoom { .. } => "join_room",
            ClientEvent::SendMessage { .. } => "send_message",
            ClientEvent::PrivateMessage { .. } => "private_message",
            ClientEvent::Typing { .. } => "typing",
            ClientEvent::MessageRead { .. } => "message_read",
            ClientEvent::AddReaction { .. } => "add_reaction",
            ClientEvent::RequestMessages { .. } => "request_messages",
            ClientEvent::Ping { .. } => "ping",
        }
    }

    /// Create a Join event.
    #[must_use]
    pub fn join(display_name: impl Into<String>) -> Self {
        ClientEvent::Join {
            display_name: display_name.into(),
        }
    }

    /// Create a JoinRoom event.
    #[must_use]
    pub fn join_room(room: impl Into<RoomId>) -> Self {
        ClientEvent::JoinRoom { room: room.into() }
    }

    /// Create a SendMessage event for the current room.
    #[must_use]
    pub fn send(body: impl Into<String>) -> Self {
        ClientEvent::SendMessage {
            body: body.into(),
            room: None,
            attachment: None,
        }
    }

    /// Create a PrivateMessage event.
    #[must_use]
    pub fn private(to: impl Into<ConnectionId>, body: impl Into<String>) -> Self {
        ClientEvent::PrivateMessage {
            to: to.into(),
            body: body.into(),
            attachment: None,
        }
    }

    /// Create a Typing event.
    #[must_use]
    pub fn typing(is_typing: bool) -> Self {
        ClientEvent::Typing { is_typing }
    }
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent once, right after the socket is accepted.
    Connected {
        /// Identifier assigned to this connection.
        connection_id: ConnectionId,
        /// Server protocol version.
        version: Version,
        /// Heartbeat interval in milliseconds.
        heartbeat_ms: u64,
    },

    /// Everyone currently online.
    PresenceSnapshot {
        /// Online users.
        users: Vec<PresenceEntry>,
    },

    /// A user joined the service.
    UserJoined {
        /// Display name.
        display_name: String,
        /// Connection of the user.
        connection_id: ConnectionId,
        /// Milliseconds since the Unix epoch.
        timestamp: u64,
    },

    /// A user left the service.
    UserLeft {
        /// Display name.
        display_name: String,
        /// Connection of the user.
        connection_id: ConnectionId,
        /// Milliseconds since the Unix epoch.
        timestamp: u64,
    },

    /// A page of room history, oldest first.
    RoomHistory {
        /// Room the page belongs to.
        room: RoomId,
        /// Messages in chronological order.
        messages: Vec<ChatMessage>,
        /// Whether older messages exist.
        has_more: bool,
    },

    /// A room message.
    MessageReceived {
        /// The routed message.
        message: ChatMessage,
    },

    /// A private message (sent to both recipient and sender).
    PrivateMessageReceived {
        /// The routed message.
        message: ChatMessage,
    },

    /// Delivery acknowledgment, sent to the author only.
    MessageAcknowledged {
        /// Assigned delivery ID.
        delivery_id: MessageId,
        /// Assigned timestamp.
        timestamp: u64,
    },

    /// Who is typing in a room.
    TypingUsers {
        /// Room.
        room: RoomId,
        /// Display names of typing users.
        display_names: Vec<String>,
    },

    /// A message was read.
    ReadReceipt {
        /// Message that was read.
        message_id: MessageId,
        /// Display name of the reader.
        reader_name: String,
        /// Milliseconds since the Unix epoch.
        read_at: u64,
    },

    /// A reaction was added to a message.
    ReactionAdded {
        /// Message reacted to.
        message_id: MessageId,
        /// Reaction emoji.
        emoji: String,
        /// Display name of the reacting user.
        display_name: String,
        /// Connection of the reacting user.
        connection_id: ConnectionId,
    },

    /// An event from this connection could not be processed.
    ErrorNotice {
        /// Error code.
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Answer to a client ping.
    Pong {
        /// Echoed timestamp from the ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerEvent {
    /// Event name, as it appears in the `type` field.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::PresenceSnapshot { .. } => "presence_snapshot",
            ServerEvent::UserJoined { .. } => "user_joined",
            ServerEvent::UserLeft { .. } => "user_left",
            ServerEvent::RoomHistory { .. } => "room_history",
            ServerEvent::MessageReceived { .. } => "message_received",
            ServerEvent::PrivateMessageReceived { .. } => "private_message_received",
            ServerEvent::MessageAcknowledged { .. } => "message_acknowledged",
            ServerEvent::TypingUsers { .. } => "typing_users",
            ServerEvent::ReadReceipt { .. } => "read_receipt",
            ServerEvent::ReactionAdded { .. } => "reaction_added",
            ServerEvent::ErrorNotice { .. } => "error_notice",
            ServerEvent::Pong { .. } => "pong",
        }
    }

    /// Create a Connected event.
    #[must_use]
    pub fn connected(connection_id: ConnectionId, version: Version, heartbeat_ms: u64) -> Self {
        ServerEvent::Connected {
            connection_id,
            version,
            heartbeat_ms,
        }
    }

    /// Create an ErrorNotice event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::ErrorNotice {
            code,
            message: message.into(),
        }
    }

    /// Create a MessageAcknowledged event.
    #[must_use]
    pub fn ack(delivery_id: impl Into<MessageId>, timestamp: u64) -> Self {
        ServerEvent::MessageAcknowledged {
            delivery_id: delivery_id.into(),
            timestamp,
        }
    }
}
