//! History and persistence collaborators.
//!
//! The router never depends on a database directly. It talks to a
//! [`HistoryProvider`] for paging and a [`PersistenceSink`] for durable
//! writes, and treats both as best-effort: every call is bounded by a
//! timeout and failures degrade to in-memory operation.
//!
//! Two implementations ship with the crate:
//!
//! - [`NoopStore`] - no persistence at all
//! - [`InMemoryStore`] - process-local storage, useful for development and tests

use crate::message::fallback_delivery_id;
use async_trait::async_trait;
use dashmap::DashMap;
use parley_protocol::{ChatMessage, ConnectionId, MessageId, PresenceEntry, RoomId, Target};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{trace, warn};

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store cannot serve the request.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The call did not finish in time.
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),
}

/// A page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Room to page through.
    pub room: RoomId,
    /// Only messages with a timestamp strictly lower than this.
    pub before: Option<u64>,
    /// Maximum number of messages.
    pub limit: usize,
}

impl HistoryQuery {
    /// Most recent messages of a room.
    #[must_use]
    pub fn latest(room: impl Into<RoomId>, limit: usize) -> Self {
        Self {
            room: room.into(),
            before: None,
            limit,
        }
    }

    /// Messages older than a cursor.
    #[must_use]
    pub fn before(mut self, cursor: Option<u64>) -> Self {
        self.before = cursor;
        self
    }
}

/// A user as seen by the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    /// Display name.
    pub display_name: String,
    /// Connection the user is on.
    pub connection_id: ConnectionId,
    /// Current broadcast room.
    pub current_room: Option<RoomId>,
    /// Whether the user is online.
    pub online: bool,
    /// Last activity, milliseconds since the Unix epoch.
    pub last_active: u64,
}

/// Source of room history.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Fetch the most recent `limit` messages of `room` older than `before`.
    ///
    /// Messages are returned oldest first.
    async fn query(&self, query: &HistoryQuery) -> Result<Vec<ChatMessage>, StoreError>;
}

/// Durable storage of messages and users.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Backend name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Store a message and return the ID it was stored under.
    async fn write_message(&self, message: &ChatMessage) -> Result<MessageId, StoreError>;

    /// Mark a message read. Returns the stored record, or `None` if unknown.
    async fn mark_read(&self, message_id: &str) -> Result<Option<ChatMessage>, StoreError>;

    /// Create or update a user.
    async fn upsert_user(&self, user: &UserRecord) -> Result<(), StoreError>;

    /// Flag a user offline. Stores may drop the record.
    async fn set_offline(&self, connection_id: &ConnectionId) -> Result<(), StoreError>;

    /// Users currently flagged online.
    async fn list_online(&self) -> Result<Vec<PresenceEntry>, StoreError>;

    /// Number of stored messages in a room.
    async fn message_count(&self, room: &str) -> Result<usize, StoreError>;
}

/// Run a store call with a deadline, logging failures.
///
/// # Errors
///
/// Returns the store error, or [`StoreError::Timeout`] if the deadline passed.
pub async fn with_timeout<T, F>(
    timeout: Duration,
    operation: &'static str,
    call: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            warn!(operation, error = %e, "Store call failed");
            Err(e)
        }
        Err(_) => {
            warn!(operation, timeout_ms = timeout.as_millis() as u64, "Store call timed out");
            Err(StoreError::Timeout(timeout))
        }
    }
}

/// Store used when persistence is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

const NOOP_REASON: &str = "persistence disabled";

#[async_trait]
impl HistoryProvider for NoopStore {
    async fn query(&self, _query: &HistoryQuery) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl PersistenceSink for NoopStore {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn write_message(&self, message: &ChatMessage) -> Result<MessageId, StoreError> {
        Ok(fallback_delivery_id(message.timestamp, &message.sender_id))
    }

    async fn mark_read(&self, _message_id: &str) -> Result<Option<ChatMessage>, StoreError> {
        Ok(None)
    }

    async fn upsert_user(&self, _user: &UserRecord) -> Result<(), StoreError> {
        Ok(())
    }

    async fn set_offline(&self, _connection_id: &ConnectionId) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list_online(&self) -> Result<Vec<PresenceEntry>, StoreError> {
        Err(StoreError::Unavailable(NOOP_REASON.into()))
    }

    async fn message_count(&self, _room: &str) -> Result<usize, StoreError> {
        Ok(0)
    }
}

/// Default number of messages kept per room by [`InMemoryStore`].
pub const DEFAULT_MAX_MESSAGES_PER_ROOM: usize = 1000;

/// Default number of private messages kept by [`InMemoryStore`].
pub const DEFAULT_MAX_PRIVATE_MESSAGES: usize = 10_000;

/// Message tables guarded by one lock.
#[derive(Debug, Default)]
struct Tables {
    /// Room messages, kept in timestamp order.
    rooms: HashMap<RoomId, VecDeque<ChatMessage>>,
    /// Room of each stored room message.
    locations: HashMap<MessageId, RoomId>,
    /// Private messages by ID.
    private: HashMap<MessageId, ChatMessage>,
    /// Private message IDs, oldest first.
    private_order: VecDeque<MessageId>,
}

/// Process-local message and user storage.
///
/// Retention is bounded: each room keeps its newest
/// `max_messages_per_room` messages and at most `max_private_messages`
/// private messages are kept overall. Users are dropped when they go
/// offline.
#[derive(Debug)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    users: DashMap<ConnectionId, UserRecord>,
    next_id: AtomicU64,
    max_messages_per_room: usize,
    max_private_messages: usize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::with_retention(DEFAULT_MAX_MESSAGES_PER_ROOM, DEFAULT_MAX_PRIVATE_MESSAGES)
    }
}

impl InMemoryStore {
    /// Create an empty store with default retention.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store with explicit retention limits.
    ///
    /// Limits below 1 are raised to 1.
    #[must_use]
    pub fn with_retention(max_messages_per_room: usize, max_private_messages: usize) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            users: DashMap::new(),
            next_id: AtomicU64::new(0),
            max_messages_per_room: max_messages_per_room.max(1),
            max_private_messages: max_private_messages.max(1),
        }
    }

    /// Number of user records held.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    fn allocate_id(&self) -> MessageId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("msg_{n:08x}")
    }

    fn poisoned() -> StoreError {
        StoreError::Unavailable("message table lock poisoned".into())
    }
}

#[async_trait]
impl HistoryProvider for InMemoryStore {
    async fn query(&self, query: &HistoryQuery) -> Result<Vec<ChatMessage>, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        let Some(messages) = tables.rooms.get(&query.room) else {
            return Ok(Vec::new());
        };

        let end = match query.before {
            Some(cursor) => messages.partition_point(|m| m.timestamp < cursor),
            None => messages.len(),
        };
        let start = end.saturating_sub(query.limit);
        Ok(messages.range(start..end).cloned().collect())
    }
}

#[async_trait]
impl PersistenceSink for InMemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn write_message(&self, message: &ChatMessage) -> Result<MessageId, StoreError> {
        let id = self.allocate_id();
        let stored = message.clone().with_id(id.clone());
        let room = match stored.target() {
            Some(Target::Room(room)) => Some(room.to_string()),
            Some(Target::Private(_)) => None,
            None => {
                return Err(StoreError::Unavailable(
                    "message has neither a room nor a recipient".into(),
                ))
            }
        };

        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
        let Tables {
            rooms,
            locations,
            private,
            private_order,
        } = &mut *tables;

        match room {
            Some(room) => {
                let messages = rooms.entry(room.clone()).or_default();
                // Concurrent writers may finish out of timestamp order.
                let at = messages.partition_point(|m| m.timestamp <= stored.timestamp);
                messages.insert(at, stored);
                locations.insert(id.clone(), room);
                while messages.len() > self.max_messages_per_room {
                    if let Some(evicted) = messages.pop_front() {
                        locations.remove(&evicted.id);
                    }
                }
            }
            None => {
                private.insert(id.clone(), stored);
                private_order.push_back(id.clone());
                while private_order.len() > self.max_private_messages {
                    if let Some(evicted) = private_order.pop_front() {
                        private.remove(&evicted);
                    }
                }
            }
        }

        trace!(message = %id, "Message stored");
        Ok(id)
    }

    async fn mark_read(&self, message_id: &str) -> Result<Option<ChatMessage>, StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
        if let Some(message) = tables.private.get_mut(message_id) {
            message.read = true;
            return Ok(Some(message.clone()));
        }

        let Some(room) = tables.locations.get(message_id).cloned() else {
            return Ok(None);
        };
        let found = tables
            .rooms
            .get_mut(&room)
            .and_then(|messages| messages.iter_mut().find(|m| m.id == message_id))
            .map(|message| {
                message.read = true;
                message.clone()
            });
        Ok(found)
    }

    async fn upsert_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        self.users.insert(user.connection_id.clone(), user.clone());
        Ok(())
    }

    async fn set_offline(&self, connection_id: &ConnectionId) -> Result<(), StoreError> {
        self.users.remove(connection_id);
        Ok(())
    }

    async fn list_online(&self) -> Result<Vec<PresenceEntry>, StoreError> {
        let mut online: Vec<PresenceEntry> = self
            .users
            .iter()
            .filter(|u| u.online)
            .map(|u| PresenceEntry {
                display_name: u.display_name.clone(),
                connection_id: u.connection_id.clone(),
                current_room: u.current_room.clone(),
            })
            .collect();
        online.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.connection_id.cmp(&b.connection_id))
        });
        Ok(online)
    }

    async fn message_count(&self, room: &str) -> Result<usize, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(tables.rooms.get(room).map_or(0, VecDeque::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room_message(ts: u64) -> ChatMessage {
        ChatMessage::to_room("alice", "conn-1".into(), "general", format!("m{ts}"), ts)
    }

    #[tokio::test]
    async fn test_query_latest_page_in_order() {
        let store = InMemoryStore::new();
        for ts in 1..=30 {
            store.write_message(&room_message(ts)).await.unwrap();
        }

        let page = store.query(&HistoryQuery::latest("general", 20)).await.unwrap();
        let stamps: Vec<u64> = page.iter().map(|m| m.timestamp).collect();
        assert_eq!(stamps, (11..=30).collect::<Vec<_>>());

        let older = store
            .query(&HistoryQuery::latest("general", 20).before(Some(11)))
            .await
            .unwrap();
        assert_eq!(older.len(), 10);
        assert!(older.iter().all(|m| m.timestamp < 11));
    }

    #[tokio::test]
    async fn test_out_of_order_writes_are_sorted() {
        let store = InMemoryStore::new();
        for ts in [5, 3, 9, 1] {
            store.write_message(&room_message(ts)).await.unwrap();
        }
        let page = store.query(&HistoryQuery::latest("general", 10)).await.unwrap();
        let stamps: Vec<u64> = page.iter().map(|m| m.timestamp).collect();
        assert_eq!(stamps, [1, 3, 5, 9]);
        assert_eq!(store.message_count("general").await.unwrap(), 4);
        assert_eq!(store.message_count("random").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_read() {
        let store = InMemoryStore::new();
        let room_id = store.write_message(&room_message(1)).await.unwrap();
        let private = ChatMessage::private("alice", "conn-1".into(), "conn-2".into(), "psst", 2);
        let private_id = store.write_message(&private).await.unwrap();

        let read = store.mark_read(&room_id).await.unwrap().unwrap();
        assert!(read.read);
        assert_eq!(read.id, room_id);
        assert!(store.mark_read(&private_id).await.unwrap().unwrap().read);
        assert!(store.mark_read("missing").await.unwrap().is_none());

        // Private messages never show up in room history.
        let page = store.query(&HistoryQuery::latest("general", 10)).await.unwrap();
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn test_users_online() {
        let store = InMemoryStore::new();
        for (id, name) in [("conn-2", "bob"), ("conn-1", "alice")] {
            store
                .upsert_user(&UserRecord {
                    display_name: name.into(),
                    connection_id: id.into(),
                    current_room: Some("general".into()),
                    online: true,
                    last_active: 0,
                })
                .await
                .unwrap();
        }
        store.set_offline(&"conn-2".into()).await.unwrap();

        let online = store.list_online().await.unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].display_name, "alice");
        assert_eq!(store.user_count(), 1);
    }

    #[tokio::test]
    async fn test_room_retention_drops_oldest() {
        let store = InMemoryStore::with_retention(5, 100);
        let mut ids = Vec::new();
        for ts in 1..=8 {
            ids.push(store.write_message(&room_message(ts)).await.unwrap());
        }

        assert_eq!(store.message_count("general").await.unwrap(), 5);
        let page = store.query(&HistoryQuery::latest("general", 50)).await.unwrap();
        let stamps: Vec<u64> = page.iter().map(|m| m.timestamp).collect();
        assert_eq!(stamps, [4, 5, 6, 7, 8]);

        // Evicted messages can no longer be found by ID.
        assert!(store.mark_read(&ids[0]).await.unwrap().is_none());
        assert!(store.mark_read(&ids[7]).await.unwrap().is_some());
        assert_eq!(store.tables.read().unwrap().locations.len(), 5);
    }

    #[tokio::test]
    async fn test_private_retention_drops_oldest() {
        let store = InMemoryStore::with_retention(10, 2);
        let mut ids = Vec::new();
        for ts in 1..=3 {
            let message =
                ChatMessage::private("alice", "conn-1".into(), "conn-2".into(), "psst", ts);
            ids.push(store.write_message(&message).await.unwrap());
        }

        assert!(store.mark_read(&ids[0]).await.unwrap().is_none());
        assert!(store.mark_read(&ids[1]).await.unwrap().is_some());
        assert!(store.mark_read(&ids[2]).await.unwrap().is_some());
        assert_eq!(store.tables.read().unwrap().private.len(), 2);
    }

    #[tokio::test]
    async fn test_offline_users_are_dropped() {
        let store = InMemoryStore::new();
        for i in 0..100 {
            let id = ConnectionId::from(format!("conn-{i}"));
            store
                .upsert_user(&UserRecord {
                    display_name: format!("user{i}"),
                    connection_id: id.clone(),
                    current_room: Some("general".into()),
                    online: true,
                    last_active: 0,
                })
                .await
                .unwrap();
            store.set_offline(&id).await.unwrap();
        }

        assert_eq!(store.user_count(), 0);
        assert!(store.list_online().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_message_without_target_is_rejected() {
        let store = InMemoryStore::new();
        let mut message = room_message(1);
        message.room = None;
        assert!(matches!(
            store.write_message(&message).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_noop_store() {
        let store = NoopStore;
        assert!(store.query(&HistoryQuery::latest("general", 5)).await.unwrap().is_empty());
        let message = room_message(1);
        assert_eq!(
            store.write_message(&message).await.unwrap(),
            format!("1-{}", message.sender_id)
        );
        assert!(store.mark_read("anything").await.unwrap().is_none());
        assert!(matches!(
            store.list_online().await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout() {
        let result: Result<(), StoreError> = with_timeout(
            Duration::from_millis(50),
            "stall",
            std::future::pending(),
        )
        .await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));

        let value = with_timeout(Duration::from_millis(50), "ok", async { Ok(7) }).await;
        assert_eq!(value.unwrap(), 7);
    }
}
