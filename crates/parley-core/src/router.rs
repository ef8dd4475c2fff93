//! Event router for Parley.
//!
//! The router receives decoded client events, updates the registry, room
//! index and typing tracker, and fans the resulting server events out to
//! the right outboxes. It owns no durable state: history and persistence go
//! through the store collaborators, and their failures never stop a live
//! broadcast.
//!
//! In-memory mutations never await, so membership is consistent at every
//! suspension point. Events of one connection are expected to be handled
//! one at a time by its session task.

use crate::message::{
    fallback_delivery_id, now_millis, validate_body, validate_display_name, validate_emoji, Clock,
};
use crate::registry::{ConnectionRegistry, RegistryError};
use crate::rooms::{validate_room_name, RoomError, RoomIndex};
use crate::store::{
    with_timeout, HistoryProvider, HistoryQuery, NoopStore, PersistenceSink, StoreError,
    UserRecord,
};
use crate::typing::TypingTracker;
use parley_protocol::{
    Attachment, ChatMessage, ClientEvent, ConnectionId, MessageId, PresenceEntry, RoomId,
    ServerEvent,
};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Router errors.
///
/// Every error is reported to the originating connection as an
/// `error_notice` carrying [`RouterError::code`].
#[derive(Debug, Error)]
pub enum RouterError {
    /// The event referenced a connection that is not registered.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// A connection with this ID already exists.
    #[error("Connection already registered: {0}")]
    DuplicateConnection(ConnectionId),

    /// The connection has not joined yet.
    #[error("Join with a display name first")]
    NotJoined,

    /// The event payload was rejected.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The persistence layer could not serve the request.
    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(#[from] StoreError),
}

impl RouterError {
    /// Numeric code sent in `error_notice`.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            RouterError::Validation(_) => 1001,
            RouterError::NotJoined => 1002,
            RouterError::UnknownConnection(_) => 1003,
            RouterError::DuplicateConnection(_) => 1004,
            RouterError::PersistenceUnavailable(_) => 1005,
        }
    }

    fn validation(reason: impl Into<String>) -> Self {
        RouterError::Validation(reason.into())
    }
}

impl From<RegistryError> for RouterError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::DuplicateConnection(id) => RouterError::DuplicateConnection(id),
            RegistryError::UnknownConnection(id) => RouterError::UnknownConnection(id),
            RegistryError::IdentityAlreadySet(_) => RouterError::validation("Already joined"),
        }
    }
}

impl From<RoomError> for RouterError {
    fn from(e: RoomError) -> Self {
        match e {
            RoomError::UnknownConnection(id) => RouterError::UnknownConnection(id),
            other => RouterError::Validation(other.to_string()),
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Room every connection enters on join.
    pub default_room: RoomId,
    /// Rooms that always exist.
    pub rooms: Vec<RoomId>,
    /// Whether undeclared rooms are created on first join.
    pub auto_create_rooms: bool,
    /// History page delivered on join and room switch.
    pub join_history_size: usize,
    /// Page size when a pagination request names none.
    pub default_page_size: usize,
    /// Upper bound on any page size.
    pub max_page_size: usize,
    /// Deadline for every store call.
    pub store_timeout: Duration,
    /// Per-connection outbox capacity.
    pub outbox_capacity: usize,
    /// Maximum body plus attachment size in bytes.
    pub max_body_len: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_room: "general".to_string(),
            rooms: vec!["general".into(), "random".into(), "tech".into()],
            auto_create_rooms: true,
            join_history_size: 50,
            default_page_size: 20,
            max_page_size: 100,
            store_timeout: Duration::from_secs(2),
            outbox_capacity: 1024,
            max_body_len: 64 * 1024,
        }
    }
}

/// State of a joined connection, captured at the start of an event.
struct Session {
    display_name: String,
    room: RoomId,
}

/// The central event router.
pub struct EventRouter {
    registry: ConnectionRegistry,
    rooms: RoomIndex,
    typing: TypingTracker,
    clock: Clock,
    history: Arc<dyn HistoryProvider>,
    sink: Arc<dyn PersistenceSink>,
    store_failures: Arc<AtomicU64>,
    config: RouterConfig,
}

impl EventRouter {
    /// Create a router with default configuration and no persistence.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a router with custom configuration and no persistence.
    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        info!("Creating router with config: {:?}", config);
        let mut rooms = config.rooms.clone();
        if !rooms.contains(&config.default_room) {
            rooms.insert(0, config.default_room.clone());
        }
        Self {
            registry: ConnectionRegistry::new(),
            rooms: RoomIndex::new(rooms, config.auto_create_rooms),
            typing: TypingTracker::new(),
            clock: Clock::new(),
            history: Arc::new(NoopStore),
            sink: Arc::new(NoopStore),
            store_failures: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    /// Use one store for both history and persistence.
    #[must_use]
    pub fn with_store<S>(self, store: Arc<S>) -> Self
    where
        S: HistoryProvider + PersistenceSink + 'static,
    {
        let history: Arc<dyn HistoryProvider> = store.clone();
        self.with_history(history).with_sink(store)
    }

    /// Set the history provider.
    #[must_use]
    pub fn with_history(mut self, history: Arc<dyn HistoryProvider>) -> Self {
        self.history = history;
        self
    }

    /// Set the persistence sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Router configuration.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Name of the persistence backend.
    #[must_use]
    pub fn persistence_backend(&self) -> &'static str {
        self.sink.name()
    }

    /// Store calls that failed or timed out since startup.
    #[must_use]
    pub fn store_failures(&self) -> u64 {
        self.store_failures.load(Ordering::Relaxed)
    }

    /// Register a new connection.
    ///
    /// Returns its ID and the receiver the session must drain into the socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the generated ID collides with a live connection.
    pub fn connect(
        &self,
    ) -> Result<(ConnectionId, mpsc::Receiver<Arc<ServerEvent>>), RouterError> {
        let connection_id = ConnectionId::generate();
        let (outbox, receiver) = mpsc::channel(self.config.outbox_capacity);
        self.registry.register(connection_id.clone(), outbox)?;
        debug!(connection = %connection_id, "Connected");
        Ok((connection_id, receiver))
    }

    /// Handle an event, reporting any failure to the originator.
    ///
    /// The error is returned as well so callers can record it.
    ///
    /// # Errors
    ///
    /// Returns the error that was reported to the connection.
    pub async fn dispatch(
        &self,
        connection_id: &ConnectionId,
        event: ClientEvent,
    ) -> Result<(), RouterError> {
        let name = event.name();
        let result = self.handle(connection_id, event).await;
        if let Err(e) = &result {
            warn!(connection = %connection_id, event = name, error = %e, "Event rejected");
            self.report_error(connection_id, e);
        }
        result
    }

    /// Send an `error_notice` for `error` to one connection.
    pub fn report_error(&self, connection_id: &ConnectionId, error: &RouterError) -> bool {
        self.send_to(connection_id, ServerEvent::error(error.code(), error.to_string()))
    }

    /// Handle an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown, has not joined, or the
    /// payload is invalid. Nothing is mutated when an error is returned.
    pub async fn handle(
        &self,
        connection_id: &ConnectionId,
        event: ClientEvent,
    ) -> Result<(), RouterError> {
        trace!(connection = %connection_id, event = event.name(), "Handling event");

        match event {
            ClientEvent::Ping { timestamp } => {
                self.require_connection(connection_id)?;
                self.send_to(connection_id, ServerEvent::Pong { timestamp });
                Ok(())
            }
            ClientEvent::Join { display_name } => self.join(connection_id, &display_name).await,
            event => {
                let session = self.session(connection_id)?;
                match event {
                    ClientEvent::JoinRoom { room } => {
                        self.switch_room(connection_id, &session, room).await
                    }
                    ClientEvent::SendMessage {
                        body,
                        room,
                        attachment,
                    } => {
                        self.send_room_message(connection_id, &session, body, room, attachment)
                            .await
                    }
                    ClientEvent::PrivateMessage {
                        to,
                        body,
                        attachment,
                    } => {
                        self.send_private_message(connection_id, &session, to, body, attachment)
                            .await
                    }
                    ClientEvent::Typing { is_typing } => {
                        self.set_typing(connection_id, &session, is_typing);
                        Ok(())
                    }
                    ClientEvent::MessageRead { message_id, .. } => {
                        self.mark_read(&session, message_id).await;
                        Ok(())
                    }
                    ClientEvent::AddReaction {
                        message_id,
                        emoji,
                        room,
                    } => self.add_reaction(connection_id, &session, message_id, emoji, room),
                    ClientEvent::RequestMessages {
                        room,
                        before,
                        limit,
                    } => self.request_messages(connection_id, room, before, limit).await,
                    ClientEvent::Join { .. } | ClientEvent::Ping { .. } => Ok(()),
                }
            }
        }
    }

    /// Tear down a connection.
    ///
    /// Safe to call more than once; later calls do nothing.
    pub fn disconnect(&self, connection_id: &ConnectionId) {
        let Some(connection) = self.registry.unregister(connection_id) else {
            return;
        };

        let typing_rooms = self.typing.clear_all(connection_id);
        let left = self.rooms.leave_all(connection_id);
        self.rebroadcast_typing(&typing_rooms);

        let Some(display_name) = connection.display_name().map(str::to_string) else {
            debug!(connection = %connection_id, "Disconnected before joining");
            return;
        };

        let sink = Arc::clone(&self.sink);
        let failures = Arc::clone(&self.store_failures);
        let timeout = self.config.store_timeout;
        let offline_id = connection_id.clone();
        tokio::spawn(async move {
            if with_timeout(timeout, "set_offline", sink.set_offline(&offline_id))
                .await
                .is_err()
            {
                failures.fetch_add(1, Ordering::Relaxed);
            }
        });

        self.broadcast_all(ServerEvent::UserLeft {
            display_name: display_name.clone(),
            connection_id: connection_id.clone(),
            timestamp: now_millis(),
        });
        self.broadcast_presence();

        info!(connection = %connection_id, user = %display_name, rooms = ?left, "User left");
    }

    /// Who is online right now.
    #[must_use]
    pub fn presence_snapshot(&self) -> Vec<PresenceEntry> {
        self.registry.snapshot_online(&self.rooms)
    }

    /// Online users as recorded by the persistence sink.
    ///
    /// Falls back to the live snapshot when the sink cannot answer.
    pub async fn online_users(&self) -> Vec<PresenceEntry> {
        match self.store_call("list_online", self.sink.list_online()).await {
            Ok(users) => users,
            Err(_) => self.presence_snapshot(),
        }
    }

    /// A page of room history, oldest first, and whether older messages exist.
    ///
    /// Store failures yield an empty page.
    pub async fn history_page(
        &self,
        room: &str,
        before: Option<u64>,
        limit: usize,
    ) -> (Vec<ChatMessage>, bool) {
        // Ask for one extra record to know whether another page exists.
        let query = HistoryQuery::latest(room, limit.saturating_add(1)).before(before);
        let mut messages = match self.store_call("history", self.history.query(&query)).await {
            Ok(messages) => messages,
            Err(_) => return (Vec::new(), false),
        };

        let has_more = messages.len() > limit;
        if has_more {
            let excess = messages.len() - limit;
            messages.drain(..excess);
        }
        (messages, has_more)
    }

    /// Router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            connection_count: self.registry.len(),
            user_count: self.registry.identified_count(),
            room_count: self.rooms.room_count(),
        }
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Known rooms, declared rooms first.
    #[must_use]
    pub fn room_names(&self) -> Vec<RoomId> {
        self.rooms.room_names()
    }

    /// Per-room member and stored message counts.
    pub async fn room_stats(&self) -> Vec<RoomStats> {
        let mut stats = Vec::new();
        for room in self.rooms.room_names() {
            let messages = self
                .store_call("message_count", self.sink.message_count(&room))
                .await
                .unwrap_or(0);
            stats.push(RoomStats {
                members: self.rooms.member_count(&room),
                name: room,
                messages,
            });
        }
        stats
    }

    /// Members of a room.
    #[must_use]
    pub fn members_of(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms.members_of(room)
    }

    /// Current room of a connection.
    #[must_use]
    pub fn room_of(&self, connection_id: &ConnectionId) -> Option<RoomId> {
        self.rooms.room_of(connection_id)
    }

    /// Check if a connection is typing in a room.
    #[must_use]
    pub fn is_typing(&self, connection_id: &ConnectionId, room: &str) -> bool {
        self.typing.is_typing(connection_id, room)
    }

    // Event handlers

    async fn join(
        &self,
        connection_id: &ConnectionId,
        display_name: &str,
    ) -> Result<(), RouterError> {
        self.require_connection(connection_id)?;
        let display_name = validate_display_name(display_name).map_err(RouterError::validation)?;
        let room = self.config.default_room.clone();

        self.registry.set_identity(connection_id, display_name.as_str())?;
        self.rooms.join(connection_id, &room, &self.registry)?;

        self.broadcast_presence();
        self.broadcast_all(ServerEvent::UserJoined {
            display_name: display_name.clone(),
            connection_id: connection_id.clone(),
            timestamp: now_millis(),
        });

        info!(connection = %connection_id, user = %display_name, room = %room, "User joined");

        let limit = self.config.join_history_size;
        self.send_history(connection_id, &room, None, limit).await;
        self.record_user(connection_id, &display_name, &room).await;
        Ok(())
    }

    async fn switch_room(
        &self,
        connection_id: &ConnectionId,
        session: &Session,
        room: RoomId,
    ) -> Result<(), RouterError> {
        self.rooms.resolve(&room)?;

        let typing_rooms = self.typing.clear_all(connection_id);
        let previous = self.rooms.join(connection_id, &room, &self.registry)?;
        self.rebroadcast_typing(&typing_rooms);
        self.broadcast_presence();

        debug!(
            connection = %connection_id,
            from = ?previous,
            to = %room,
            "Switched room"
        );

        let limit = self.config.join_history_size;
        self.send_history(connection_id, &room, None, limit).await;
        self.record_user(connection_id, &session.display_name, &room)
            .await;
        Ok(())
    }

    async fn send_room_message(
        &self,
        connection_id: &ConnectionId,
        session: &Session,
        body: String,
        room: Option<RoomId>,
        attachment: Option<Attachment>,
    ) -> Result<(), RouterError> {
        let room = Self::target_room(session, room)?;
        validate_body(&body, attachment.as_ref(), self.config.max_body_len)
            .map_err(RouterError::validation)?;

        let timestamp = self.clock.now();
        let message = ChatMessage::to_room(
            session.display_name.as_str(),
            connection_id.clone(),
            room.as_str(),
            body,
            timestamp,
        )
        .with_attachment(attachment);

        let delivery_id = self.persist(&message).await;
        let message = message.with_id(delivery_id.clone());

        let recipients =
            self.broadcast_room(&room, ServerEvent::MessageReceived { message }, None);
        self.send_to(connection_id, ServerEvent::ack(delivery_id.clone(), timestamp));

        debug!(
            connection = %connection_id,
            room = %room,
            message = %delivery_id,
            recipients,
            "Message routed"
        );
        Ok(())
    }

    async fn send_private_message(
        &self,
        connection_id: &ConnectionId,
        session: &Session,
        to: ConnectionId,
        body: String,
        attachment: Option<Attachment>,
    ) -> Result<(), RouterError> {
        validate_body(&body, attachment.as_ref(), self.config.max_body_len)
            .map_err(RouterError::validation)?;

        let timestamp = self.clock.now();
        let message = ChatMessage::private(
            session.display_name.as_str(),
            connection_id.clone(),
            to.clone(),
            body,
            timestamp,
        )
        .with_attachment(attachment);

        let delivery_id = self.persist(&message).await;
        let event = Arc::new(ServerEvent::PrivateMessageReceived {
            message: message.with_id(delivery_id.clone()),
        });

        if to != *connection_id && !self.registry.deliver(&to, Arc::clone(&event)) {
            debug!(connection = %connection_id, recipient = %to, "Recipient offline, private message not delivered");
        }
        self.registry.deliver(connection_id, event);
        self.send_to(connection_id, ServerEvent::ack(delivery_id, timestamp));
        Ok(())
    }

    fn set_typing(&self, connection_id: &ConnectionId, session: &Session, is_typing: bool) {
        let display_names =
            self.typing
                .set_typing(connection_id, &session.room, is_typing, &self.registry);
        self.broadcast_room(
            &session.room,
            ServerEvent::TypingUsers {
                room: session.room.clone(),
                display_names,
            },
            Some(connection_id),
        );
    }

    async fn mark_read(&self, session: &Session, message_id: MessageId) {
        let read = self
            .store_call("mark_read", self.sink.mark_read(&message_id))
            .await;

        let message = match read {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(message = %message_id, "Read receipt for unknown message");
                return;
            }
            Err(_) => return,
        };

        let receipt = ServerEvent::ReadReceipt {
            message_id,
            reader_name: session.display_name.clone(),
            read_at: now_millis(),
        };
        if !self.send_to(&message.sender_id, receipt) {
            trace!(sender = %message.sender_id, "Read receipt sender offline");
        }
    }

    fn add_reaction(
        &self,
        connection_id: &ConnectionId,
        session: &Session,
        message_id: MessageId,
        emoji: String,
        room: Option<RoomId>,
    ) -> Result<(), RouterError> {
        let room = Self::target_room(session, room)?;
        validate_emoji(&emoji).map_err(RouterError::validation)?;

        self.broadcast_room(
            &room,
            ServerEvent::ReactionAdded {
                message_id,
                emoji,
                display_name: session.display_name.clone(),
                connection_id: connection_id.clone(),
            },
            None,
        );
        Ok(())
    }

    async fn request_messages(
        &self,
        connection_id: &ConnectionId,
        room: RoomId,
        before: Option<u64>,
        limit: Option<usize>,
    ) -> Result<(), RouterError> {
        validate_room_name(&room).map_err(|e| RouterError::validation(e.to_string()))?;
        let limit = limit
            .unwrap_or(self.config.default_page_size)
            .clamp(1, self.config.max_page_size);
        self.send_history(connection_id, &room, before, limit).await;
        Ok(())
    }

    // Helpers

    fn require_connection(&self, connection_id: &ConnectionId) -> Result<(), RouterError> {
        if self.registry.contains(connection_id) {
            Ok(())
        } else {
            Err(RouterError::UnknownConnection(connection_id.clone()))
        }
    }

    fn session(&self, connection_id: &ConnectionId) -> Result<Session, RouterError> {
        let connection = self
            .registry
            .get(connection_id)
            .ok_or_else(|| RouterError::UnknownConnection(connection_id.clone()))?;
        let display_name = connection
            .display_name()
            .ok_or(RouterError::NotJoined)?
            .to_string();
        let room = self
            .rooms
            .room_of(connection_id)
            .ok_or(RouterError::NotJoined)?;
        Ok(Session { display_name, room })
    }

    /// Room messages and reactions may only target the sender's room.
    fn target_room(session: &Session, requested: Option<RoomId>) -> Result<RoomId, RouterError> {
        match requested {
            None => Ok(session.room.clone()),
            Some(room) if room == session.room => Ok(room),
            Some(room) => Err(RouterError::validation(format!(
                "Not a member of room: {room}"
            ))),
        }
    }

    /// Write a message, returning the ID to deliver it under.
    async fn persist(&self, message: &ChatMessage) -> MessageId {
        let written = self
            .store_call("write_message", self.sink.write_message(message))
            .await
            .map_err(RouterError::from);

        match written {
            Ok(id) => id,
            Err(e) => {
                debug!(error = %e, "Delivering without a stored ID");
                fallback_delivery_id(message.timestamp, &message.sender_id)
            }
        }
    }

    /// Upsert the user record before the event completes.
    ///
    /// Awaiting here keeps a connection's record writes in event order, so
    /// the `set_offline` issued by [`EventRouter::disconnect`] always lands
    /// after the last upsert.
    async fn record_user(&self, connection_id: &ConnectionId, display_name: &str, room: &str) {
        let user = UserRecord {
            display_name: display_name.to_string(),
            connection_id: connection_id.clone(),
            current_room: Some(room.to_string()),
            online: true,
            last_active: now_millis(),
        };
        if let Err(e) = self.store_call("upsert_user", self.sink.upsert_user(&user)).await {
            debug!(connection = %connection_id, error = %e, "User record not stored");
        }
    }

    async fn store_call<T, F>(&self, operation: &'static str, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let result = with_timeout(self.config.store_timeout, operation, call).await;
        if result.is_err() {
            self.store_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn send_history(
        &self,
        connection_id: &ConnectionId,
        room: &str,
        before: Option<u64>,
        limit: usize,
    ) {
        let (messages, has_more) = self.history_page(room, before, limit).await;
        self.send_to(
            connection_id,
            ServerEvent::RoomHistory {
                room: room.to_string(),
                messages,
                has_more,
            },
        );
    }

    fn send_to(&self, connection_id: &ConnectionId, event: ServerEvent) -> bool {
        self.registry.deliver(connection_id, Arc::new(event))
    }

    fn broadcast_all(&self, event: ServerEvent) -> usize {
        self.registry.deliver_all(&Arc::new(event))
    }

    fn broadcast_presence(&self) {
        self.broadcast_all(ServerEvent::PresenceSnapshot {
            users: self.presence_snapshot(),
        });
    }

    fn broadcast_room(
        &self,
        room: &str,
        event: ServerEvent,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        let event = Arc::new(event);
        self.rooms
            .members_of(room)
            .iter()
            .filter(|member| Some(*member) != exclude)
            .filter(|member| self.registry.deliver(member, Arc::clone(&event)))
            .count()
    }

    fn rebroadcast_typing(&self, rooms: &[RoomId]) {
        for room in rooms {
            let display_names = self.typing.typing_names(room, &self.registry);
            self.broadcast_room(
                room,
                ServerEvent::TypingUsers {
                    room: room.clone(),
                    display_names,
                },
                None,
            );
        }
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Router statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    /// Live connections.
    pub connection_count: usize,
    /// Connections that have joined.
    pub user_count: usize,
    /// Known rooms.
    pub room_count: usize,
}

/// Statistics for one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomStats {
    /// Room name.
    pub name: RoomId,
    /// Current members.
    pub members: usize,
    /// Stored messages.
    pub messages: usize,
}
