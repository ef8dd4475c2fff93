//! Connection handlers for Parley server.
//!
//! Every WebSocket gets one session task. The task decodes inbound frames,
//! hands the events to the router one at a time, and drains the
//! connection's outbox back into the socket.

use crate::api;
use crate::config::{Config, PersistenceBackend};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parley_core::{EventRouter, InMemoryStore, RouterError};
use parley_protocol::codec::{self, Encoded, Encoding, ProtocolError, MAX_FRAME_SIZE};
use parley_protocol::{ClientEvent, ConnectionId, ServerEvent, PROTOCOL_VERSION};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The event router.
    pub router: EventRouter,
    /// Server configuration.
    pub config: Config,
    /// Flipped to `true` when the server starts shutting down.
    shutdown: watch::Sender<bool>,
    /// Connection slots taken, counted from before the upgrade.
    slots: Arc<AtomicUsize>,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let router = EventRouter::with_config(config.router_config());
        let router = match config.persistence.backend {
            PersistenceBackend::Memory => router.with_store(Arc::new(InMemoryStore::with_retention(
                config.persistence.max_messages_per_room,
                config.persistence.max_private_messages,
            ))),
            PersistenceBackend::None => router,
        };
        let (shutdown, _) = watch::channel(false);

        Self {
            router,
            config,
            shutdown,
            slots: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Take one of the `limits.max_connections` slots.
    ///
    /// Returns `None` when every slot is taken. The slot is freed when the
    /// returned guard drops.
    pub fn try_reserve_slot(&self) -> Option<ConnectionSlot> {
        let limit = self.config.limits.max_connections;
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                (taken < limit).then_some(taken + 1)
            })
            .ok()
            .map(|_| ConnectionSlot {
                slots: Arc::clone(&self.slots),
            })
    }

    /// Number of slots currently taken.
    #[must_use]
    pub fn slots_taken(&self) -> usize {
        self.slots.load(Ordering::Acquire)
    }

    /// Ask every session to close.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// A reserved connection slot.
pub struct ConnectionSlot {
    slots: Arc<AtomicUsize>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.slots.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Build the HTTP and WebSocket routes.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();

    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(api::health))
        .route("/api/rooms", get(api::rooms))
        .route("/api/users", get(api::users))
        .route("/api/messages/:room", get(api::messages))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C or SIGTERM.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    serve(listener, Arc::new(AppState::new(config)), shutdown_signal()).await
}

/// Serve on an already bound listener until `signal` resolves.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, signal: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );
    info!(
        backend = state.router.persistence_backend(),
        rooms = ?state.router.room_names(),
        "Router ready"
    );

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            signal.await;
            info!("Shutting down, closing sessions");
            shutdown_state.begin_shutdown();
        })
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    // The slot is taken before the upgrade so concurrent handshakes cannot
    // overshoot the limit. It travels with the session and frees on drop.
    let Some(slot) = state.try_reserve_slot() else {
        let limit = state.config.limits.max_connections;
        warn!(limit, "Connection limit reached, rejecting upgrade");
        metrics::record_rejected_connection();
        return (StatusCode::SERVICE_UNAVAILABLE, "Server is at capacity").into_response();
    };

    // Frames above the configured limit are answered with an error, so the
    // transport itself only enforces the protocol maximum.
    ws.max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| handle_websocket(socket, state, slot))
}

type WsSink = SplitSink<WebSocket, Message>;

/// Per-connection read state.
struct Session {
    /// Encoding of the last inbound frame; replies use the same one.
    encoding: Encoding,
    read_buffer: BytesMut,
    last_seen: Instant,
    max_frame: usize,
}

impl Session {
    fn new(max_frame: usize) -> Self {
        Self {
            encoding: Encoding::Json,
            read_buffer: BytesMut::with_capacity(4096),
            last_seen: Instant::now(),
            max_frame,
        }
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    fn read_text(&mut self, text: &str) -> Vec<Result<ClientEvent, RouterError>> {
        self.encoding = Encoding::Json;
        if text.len() > self.max_frame {
            return vec![Err(self.too_large(text.len()))];
        }
        vec![codec::decode_json(text).map_err(malformed)]
    }

    fn read_binary(&mut self, data: &[u8]) -> Vec<Result<ClientEvent, RouterError>> {
        self.encoding = Encoding::MessagePack;
        if data.len() > self.max_frame {
            return vec![Err(self.too_large(data.len()))];
        }

        self.read_buffer.extend_from_slice(data);
        let mut events = Vec::new();
        loop {
            match codec::decode_from(&mut self.read_buffer) {
                Ok(Some(event)) => events.push(Ok(event)),
                Ok(None) => break,
                Err(e) => {
                    self.read_buffer.clear();
                    events.push(Err(malformed(e)));
                    break;
                }
            }
        }

        // A partial frame may not grow past the limit either.
        if self.read_buffer.len() > self.max_frame {
            let size = self.read_buffer.len();
            self.read_buffer.clear();
            events.push(Err(self.too_large(size)));
        }
        events
    }

    fn too_large(&self, size: usize) -> RouterError {
        RouterError::Validation(format!(
            "Frame of {size} bytes exceeds the {} byte limit",
            self.max_frame
        ))
    }
}

fn malformed(e: ProtocolError) -> RouterError {
    RouterError::Validation(format!("Malformed event: {e}"))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, _slot: ConnectionSlot) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (connection_id, mut outbox) = match state.router.connect() {
        Ok(registered) => registered,
        Err(e) => {
            error!(error = %e, "Failed to register connection");
            return;
        }
    };

    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let mut shutdown = state.shutdown.subscribe();
    let mut session = Session::new(state.config.limits.max_message_size);

    let interval = Duration::from_millis(state.config.heartbeat.interval_ms);
    let idle_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);

    let connected = ServerEvent::connected(
        connection_id.clone(),
        PROTOCOL_VERSION,
        state.config.heartbeat.interval_ms,
    );
    if let Err(e) = send_event(&mut sender, &connected, session.encoding).await {
        warn!(connection = %connection_id, error = %e, "Failed to send connected event");
        state.router.disconnect(&connection_id);
        return;
    }

    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            // Events routed to this connection
            Some(event) = outbox.recv() => {
                if let Err(e) = send_event(&mut sender, &event, session.encoding).await {
                    debug!(connection = %connection_id, error = %e, "Send failed");
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                let message = match msg {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                };
                session.touch();

                match message {
                    Message::Text(text) => {
                        let frames = session.read_text(&text);
                        process_frames(&state, &connection_id, frames, text.len()).await;
                    }
                    Message::Binary(data) => {
                        let frames = session.read_binary(&data);
                        process_frames(&state, &connection_id, frames, data.len()).await;
                    }
                    Message::Ping(data) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if session.last_seen.elapsed() >= idle_timeout {
                    info!(connection = %connection_id, "Heartbeat timeout, closing");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.router.disconnect(&connection_id);
    update_gauges(&state);

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Route decoded frames in arrival order.
async fn process_frames(
    state: &AppState,
    connection_id: &ConnectionId,
    frames: Vec<Result<ClientEvent, RouterError>>,
    bytes: usize,
) {
    for frame in frames {
        let event = match frame {
            Ok(event) => event,
            Err(e) => {
                debug!(connection = %connection_id, error = %e, "Rejected frame");
                metrics::record_error("frame");
                state.router.report_error(connection_id, &e);
                continue;
            }
        };

        let kind = event.name();
        metrics::record_event(kind, bytes, "inbound");

        let start = Instant::now();
        if let Err(e) = state.router.dispatch(connection_id, event).await {
            metrics::record_error(&e.code().to_string());
        }
        metrics::record_latency(start.elapsed().as_secs_f64());

        if matches!(kind, "join" | "join_room") {
            update_gauges(state);
        }
    }
    metrics::set_store_failures(state.router.store_failures());
}

fn update_gauges(state: &AppState) {
    let stats = state.router.stats();
    metrics::set_router_gauges(stats.room_count, stats.user_count);
}

/// Encode and send one event.
async fn send_event(sender: &mut WsSink, event: &ServerEvent, encoding: Encoding) -> Result<()> {
    let encoded = codec::encode_as(encoding, event)?;
    metrics::record_event(event.name(), encoded.len(), "outbound");

    let message = match encoded {
        Encoded::Text(text) => Message::Text(text),
        Encoded::Binary(data) => Message::Binary(data.to_vec()),
    };
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct TestServer {
        addr: SocketAddr,
        state: Arc<AppState>,
        _stop: oneshot::Sender<()>,
    }

    async fn start(config: Config) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(AppState::new(config));
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(serve(listener, Arc::clone(&state), async {
            let _ = stopped.await;
        }));
        TestServer {
            addr,
            state,
            _stop: stop,
        }
    }

    async fn connect(server: &TestServer) -> Client {
        let (client, _) = connect_async(format!("ws://{}/ws", server.addr))
            .await
            .unwrap();
        client
    }

    async fn next_event(client: &mut Client) -> ServerEvent {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for an event")
                .expect("stream ended")
                .unwrap();
            match message {
                WsMessage::Text(text) => return codec::decode_json(&text).unwrap(),
                WsMessage::Binary(data) => return codec::decode(&data).unwrap(),
                _ => continue,
            }
        }
    }

    async fn send_json(client: &mut Client, event: &ClientEvent) {
        let text = codec::encode_json(event).unwrap();
        client.send(WsMessage::Text(text)).await.unwrap();
    }

    #[tokio::test]
    async fn test_join_and_message_over_websocket() {
        let server = start(Config::default()).await;
        let mut client = connect(&server).await;

        let connection_id = match next_event(&mut client).await {
            ServerEvent::Connected { connection_id, .. } => connection_id,
            other => panic!("unexpected event {other:?}"),
        };

        send_json(&mut client, &ClientEvent::join("alice")).await;
        assert_eq!(next_event(&mut client).await.name(), "presence_snapshot");
        assert_eq!(next_event(&mut client).await.name(), "user_joined");
        assert_eq!(next_event(&mut client).await.name(), "room_history");

        send_json(&mut client, &ClientEvent::send("hello")).await;
        match next_event(&mut client).await {
            ServerEvent::MessageReceived { message } => {
                assert_eq!(message.body, "hello");
                assert_eq!(message.sender_id, connection_id);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(next_event(&mut client).await.name(), "message_acknowledged");
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let server = start(Config::default()).await;
        let mut client = connect(&server).await;
        next_event(&mut client).await;

        client
            .send(WsMessage::Text("{\"type\":\"nonsense\"}".into()))
            .await
            .unwrap();
        match next_event(&mut client).await {
            ServerEvent::ErrorNotice { code, .. } => assert_eq!(code, 1001),
            other => panic!("unexpected event {other:?}"),
        }

        send_json(&mut client, &ClientEvent::Ping { timestamp: Some(9) }).await;
        assert_eq!(
            next_event(&mut client).await,
            ServerEvent::Pong { timestamp: Some(9) }
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let mut config = Config::default();
        config.limits.max_message_size = 256;
        let server = start(config).await;
        let mut client = connect(&server).await;
        next_event(&mut client).await;

        let event = ClientEvent::join("x".repeat(300));
        send_json(&mut client, &event).await;
        match next_event(&mut client).await {
            ServerEvent::ErrorNotice { code, message } => {
                assert_eq!(code, 1001);
                assert!(message.contains("exceeds"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_messagepack_client_gets_binary_replies() {
        let server = start(Config::default()).await;
        let mut client = connect(&server).await;
        next_event(&mut client).await;

        let frame = codec::encode(&ClientEvent::join("bob")).unwrap();
        client.send(WsMessage::Binary(frame.to_vec())).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match reply {
            WsMessage::Binary(data) => {
                let event: ServerEvent = codec::decode(&data).unwrap();
                assert_eq!(event.name(), "presence_snapshot");
            }
            other => panic!("expected a binary frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = Config::default();
        config.limits.max_connections = 1;
        let server = start(config).await;

        let mut first = connect(&server).await;
        next_event(&mut first).await;

        match connect_async(format!("ws://{}/ws", server.addr)).await {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE.as_u16());
            }
            other => panic!("expected rejection, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_slots_are_reserved_atomically() {
        let mut config = Config::default();
        config.limits.max_connections = 2;
        let state = AppState::new(config);

        let first = state.try_reserve_slot().unwrap();
        let second = state.try_reserve_slot().unwrap();
        assert!(state.try_reserve_slot().is_none());
        assert_eq!(state.slots_taken(), 2);

        drop(first);
        assert_eq!(state.slots_taken(), 1);
        let third = state.try_reserve_slot();
        assert!(third.is_some());
        assert!(state.try_reserve_slot().is_none());

        drop(second);
        drop(third);
        assert_eq!(state.slots_taken(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upgrades_respect_limit() {
        let mut config = Config::default();
        config.limits.max_connections = 3;
        let server = start(config).await;
        let url = format!("ws://{}/ws", server.addr);

        let attempts: Vec<_> = (0..12)
            .map(|_| tokio::spawn(connect_async(url.clone())))
            .collect();
        let mut clients = Vec::new();
        let mut rejected = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok((client, _)) => clients.push(client),
                Err(tungstenite::Error::Http(response)) => {
                    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE.as_u16());
                    rejected += 1;
                }
                Err(e) => panic!("unexpected handshake error {e}"),
            }
        }

        assert_eq!(clients.len(), 3);
        assert_eq!(rejected, 9);
        assert!(server.state.slots_taken() <= 3);
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up() {
        let server = start(Config::default()).await;
        let mut alice = connect(&server).await;
        next_event(&mut alice).await;
        send_json(&mut alice, &ClientEvent::join("alice")).await;
        for _ in 0..3 {
            next_event(&mut alice).await;
        }

        let mut bob = connect(&server).await;
        next_event(&mut bob).await;
        send_json(&mut bob, &ClientEvent::join("bob")).await;
        for _ in 0..3 {
            next_event(&mut bob).await;
        }
        // Alice sees bob arrive.
        next_event(&mut alice).await;
        next_event(&mut alice).await;

        bob.close(None).await.unwrap();

        assert_eq!(next_event(&mut alice).await.name(), "user_left");
        match next_event(&mut alice).await {
            ServerEvent::PresenceSnapshot { users } => {
                let names: Vec<_> = users.iter().map(|u| u.display_name.as_str()).collect();
                assert_eq!(names, ["alice"]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(server.state.router.connection_count(), 1);
    }
}
