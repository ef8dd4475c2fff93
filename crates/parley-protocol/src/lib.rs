//! # parley-protocol
//!
//! Wire protocol definitions for the Parley chat engine.
//!
//! This crate defines the events exchanged between chat clients and the
//! server, the records they carry, and the codecs used to put them on a
//! WebSocket.
//!
//! ## Events
//!
//! - [`ClientEvent`] - everything a client may send (`join`, `send_message`, ...)
//! - [`ServerEvent`] - everything the server pushes back (`message_received`,
//!   `presence_snapshot`, `error_notice`, ...)
//!
//! ## Encodings
//!
//! Text frames carry JSON, binary frames carry length-prefixed MessagePack.
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, ClientEvent};
//!
//! let event = ClientEvent::send("hello, world");
//!
//! let json = codec::encode_json(&event).unwrap();
//! let decoded: ClientEvent = codec::decode_json(&json).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod events;
pub mod types;
pub mod version;

pub use codec::{decode, encode, Encoded, Encoding, ProtocolError};
pub use events::{ClientEvent, ServerEvent};
pub use types::{Attachment, ChatMessage, ConnectionId, MessageId, PresenceEntry, RoomId, Target};
pub use version::{Version, PROTOCOL_VERSION};
