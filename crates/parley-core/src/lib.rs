//! # parley-core
//!
//! Live session state and event routing for the Parley chat engine.
//!
//! This crate provides the pieces that have to stay consistent while many
//! connections talk at once:
//!
//! - **Registry** - every live connection and its display name
//! - **Rooms** - which broadcast room each connection occupies
//! - **Typing** - per-room "currently typing" sets
//! - **Store** - history and persistence collaborators (no-op and in-memory)
//! - **Router** - turns client events into fan-out to the right connections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Session    │────▶│ EventRouter │────▶│  Registry   │──▶ outboxes
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                       │    │    │
//!             ┌─────────┘    │    └─────────┐
//!             ▼              ▼              ▼
//!      ┌─────────────┐ ┌─────────────┐ ┌─────────────┐
//!      │  RoomIndex  │ │   Typing    │ │    Store    │
//!      └─────────────┘ └─────────────┘ └─────────────┘
//! ```

pub mod message;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod store;
pub mod typing;

pub use message::Clock;
pub use registry::{Connection, ConnectionRegistry, Outbox, RegistryError};
pub use rooms::{RoomError, RoomIndex};
pub use router::{EventRouter, RoomStats, RouterConfig, RouterError, RouterStats};
pub use store::{
    HistoryProvider, HistoryQuery, InMemoryStore, NoopStore, PersistenceSink, StoreError,
    UserRecord, DEFAULT_MAX_MESSAGES_PER_ROOM, DEFAULT_MAX_PRIVATE_MESSAGES,
};
pub use typing::TypingTracker;
