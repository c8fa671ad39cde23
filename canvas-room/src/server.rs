//! WebSocket gateway routing sessions to room actors.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://<bind>/rooms/<roomId>?sessionId=<id>
//!             ├── handle_connection ── RoomHost ── RoomActor (roomId)
//! Client B ──┘         │                               │
//!                      │  ClientMessage (push, ping)   ├── MergeEngine
//!                      │ ◄──── Arc<Vec<u8>> frames ────┤
//!                      │                               └── KvStore
//!                      │                                     ├── RocksStore
//!                      │                                     └── MemoryStore
//! ```
//!
//! Each connection is one task that only forwards inbound frames to its
//! room's queue and outbound frames to its socket.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::host::RoomHost;
use crate::merge::{MergeEngine, RecordMerge};
use crate::protocol::{
    ClientMessage, CloseReason, ConnectParams, ServerMessage, SessionId,
    DEFAULT_MAX_MESSAGE_BYTES, MAX_FRAME_BYTES,
};
use crate::room::{Lifecycle, RoomConfig, RoomError, RoomHandle, SessionRejection};
use crate::session::{
    outbound_channel_with_capacity, SessionReceiver, SessionSender, DEFAULT_SESSION_QUEUE,
};
use crate::storage::{KvStore, MemoryStore, RocksStore, StoreConfig, StoreError};

/// Attempts to attach a session when the room is going to sleep underneath it.
const CONNECT_ATTEMPTS: usize = 3;

/// How long a closing connection waits for the peer's close reply.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;
type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Snapshot storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Per-room tuning
    pub room: RoomConfig,
    /// Rooms without sessions are slept after this long
    pub idle_timeout: Duration,
    /// How often idle rooms are looked for
    pub reap_interval: Duration,
    /// Inbound frames above this size are dropped
    pub max_message_bytes: usize,
    /// Outbound frames buffered per session before it is dropped as lagging
    pub session_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            room: RoomConfig::default(),
            idle_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(10),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            session_queue: DEFAULT_SESSION_QUEUE,
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value {value:?} for {key}: {reason}")]
pub struct ConfigError {
    pub key: String,
    pub value: String,
    pub reason: String,
}

impl ServerConfig {
    pub const ENV_BIND_ADDR: &'static str = "CANVAS_BIND_ADDR";
    pub const ENV_DATA_DIR: &'static str = "CANVAS_DATA_DIR";
    pub const ENV_PERSIST_INTERVAL_MS: &'static str = "CANVAS_PERSIST_INTERVAL_MS";
    pub const ENV_IDLE_TIMEOUT_SECS: &'static str = "CANVAS_IDLE_TIMEOUT_SECS";
    pub const ENV_REAP_INTERVAL_SECS: &'static str = "CANVAS_REAP_INTERVAL_SECS";
    pub const ENV_MAX_MESSAGE_BYTES: &'static str = "CANVAS_MAX_MESSAGE_BYTES";
    pub const ENV_SESSION_QUEUE: &'static str = "CANVAS_SESSION_QUEUE";

    /// Defaults overridden by `CANVAS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns per variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = lookup(Self::ENV_BIND_ADDR) {
            addr.parse::<SocketAddr>().map_err(|e| ConfigError {
                key: Self::ENV_BIND_ADDR.into(),
                value: addr.clone(),
                reason: e.to_string(),
            })?;
            config.bind_addr = addr;
        }
        if let Some(dir) = lookup(Self::ENV_DATA_DIR).filter(|dir| !dir.is_empty()) {
            config.storage_path = Some(PathBuf::from(dir));
        }
        if let Some(ms) = parse_positive(&lookup, Self::ENV_PERSIST_INTERVAL_MS)? {
            config.room.persist_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_positive(&lookup, Self::ENV_IDLE_TIMEOUT_SECS)? {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_positive(&lookup, Self::ENV_REAP_INTERVAL_SECS)? {
            config.reap_interval = Duration::from_secs(secs);
        }
        if let Some(bytes) = parse_positive(&lookup, Self::ENV_MAX_MESSAGE_BYTES)? {
            if bytes > MAX_FRAME_BYTES as u64 {
                return Err(ConfigError {
                    key: Self::ENV_MAX_MESSAGE_BYTES.into(),
                    value: bytes.to_string(),
                    reason: format!("must not exceed {MAX_FRAME_BYTES}"),
                });
            }
            config.max_message_bytes = bytes as usize;
        }
        if let Some(frames) = parse_positive(&lookup, Self::ENV_SESSION_QUEUE)? {
            config.session_queue = frames as usize;
        }

        Ok(config)
    }

    /// Ephemeral port, in-memory store, short timers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            storage_path: None,
            room: RoomConfig::for_testing(),
            idle_timeout: Duration::from_secs(60),
            reap_interval: Duration::from_secs(60),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            session_queue: DEFAULT_SESSION_QUEUE,
        }
    }
}

fn parse_positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let invalid = |reason: String| ConfigError {
        key: key.into(),
        value: raw.clone(),
        reason,
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(invalid("must be greater than zero".into())),
        Ok(value) => Ok(Some(value)),
        Err(e) => Err(invalid(e.to_string())),
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub dropped_messages: u64,
    pub active_rooms: usize,
}

/// Lock-free counters for the connection hot path.
#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    dropped_messages: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    host: Arc<RoomHost>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Create a server, opening RocksDB when a storage path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn KvStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig::at(path.clone()))?),
            None => {
                log::warn!("No data directory configured; snapshots live in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an existing store with the default merge engine.
    pub fn with_store(config: ServerConfig, store: Arc<dyn KvStore>) -> Self {
        Self::with_engine(config, store, Arc::new(RecordMerge::default()))
    }

    pub fn with_engine(
        config: ServerConfig,
        store: Arc<dyn KvStore>,
        engine: Arc<dyn MergeEngine>,
    ) -> Self {
        let host = Arc::new(RoomHost::new(store, engine, config.room.clone()));
        Self {
            config,
            host,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        let reaper = self
            .host
            .spawn_reaper(self.config.reap_interval, self.config.idle_timeout);

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(ServerError::Io(e)),
            };
            log::debug!("New TCP connection from {addr}");

            let host = Arc::clone(&self.host);
            let stats = Arc::clone(&self.stats);
            let max_message_bytes = self.config.max_message_bytes;
            let session_queue = self.config.session_queue;

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(
                    stream,
                    addr,
                    host,
                    &stats,
                    max_message_bytes,
                    session_queue,
                )
                .await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        reaper.abort();
        result
    }

    /// Sleep every room, flushing final snapshots.
    pub async fn shutdown(&self) -> usize {
        log::info!("Sync server shutting down");
        self.host.shutdown().await
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        host: Arc<RoomHost>,
        stats: &AtomicServerStats,
        max_message_bytes: usize,
        session_queue: usize,
    ) -> ConnectionResult {
        let mut target = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                target = Some((
                    req.uri().path().to_owned(),
                    req.uri().query().map(str::to_owned),
                ));
                Ok(resp)
            },
        )
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        stats.total_connections.fetch_add(1, Ordering::Relaxed);

        let (path, query) = target.unwrap_or_default();
        let params = match ConnectParams::parse(&path, query.as_deref()) {
            Ok(params) => params,
            Err(reason) => {
                log::warn!("Rejected connection from {addr} for {path}: {reason}");
                stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                close_with(&mut ws_sender, &mut ws_receiver, reason).await;
                return Ok(());
            }
        };

        let (outbound_tx, mut outbound_rx) = outbound_channel_with_capacity(session_queue);
        let room = match attach(&host, &params, outbound_tx).await {
            Ok(room) => room,
            Err(reason) => {
                log::warn!(
                    "Rejected session {} for room {} from {addr}: {reason}",
                    params.session_id,
                    params.room_id
                );
                stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                close_with(&mut ws_sender, &mut ws_receiver, reason).await;
                return Ok(());
            }
        };

        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Session {} attached to room {} from {addr}",
            params.session_id,
            params.room_id
        );

        let result = Self::pump(
            &room,
            &params.session_id,
            &mut ws_sender,
            &mut ws_receiver,
            &mut outbound_rx,
            stats,
            max_message_bytes,
        )
        .await;

        // Detach only while the room still holds our sender: once it dropped
        // us, a reconnect under the same id may already own the slot.
        if !outbound_rx.is_closed() {
            room.disconnect(params.session_id.clone());
        }
        drop(outbound_rx);
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection closed from {addr} ({})", params.session_id);

        result
    }

    /// Shuttle frames between the socket and the room until either side closes.
    async fn pump(
        room: &RoomHandle,
        session_id: &SessionId,
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        outbound_rx: &mut SessionReceiver,
        stats: &AtomicServerStats,
        max_message_bytes: usize,
    ) -> ConnectionResult {
        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            stats.total_messages.fetch_add(1, Ordering::Relaxed);
                            stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

                            match ClientMessage::decode_limited(&data, max_message_bytes) {
                                Ok(ClientMessage::Push { op }) => {
                                    if room.receive_operation(session_id.clone(), op).is_err() {
                                        log::debug!("Room {} is sleeping; dropped push from {session_id}", room.room_id());
                                    }
                                }
                                Ok(ClientMessage::Ping) => {
                                    let pong = ServerMessage::Pong.encode()?;
                                    ws_sender.send(Message::Binary(pong.into())).await?;
                                }
                                Err(e) => {
                                    stats.dropped_messages.fetch_add(1, Ordering::Relaxed);
                                    log::warn!("Dropped frame from {session_id} in room {}: {e}", room.room_id());
                                }
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => return Ok(()),

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {session_id}: {e}");
                            return Ok(());
                        }

                        _ => {}
                    }
                }

                // Outgoing room frame
                frame = outbound_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                        }
                        None => {
                            let reason = detach_reason(room).await;
                            log::info!("Room {} dropped session {session_id}: {reason}", room.room_id());
                            close_with(ws_sender, ws_receiver, reason).await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    pub fn host(&self) -> &Arc<RoomHost> {
        &self.host
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            dropped_messages: self.stats.dropped_messages.load(Ordering::Relaxed),
            active_rooms: self.host.room_count().await,
        }
    }
}

/// Place the session in its room, retrying when the room falls asleep mid-connect.
async fn attach(
    host: &RoomHost,
    params: &ConnectParams,
    sender: SessionSender,
) -> Result<RoomHandle, CloseReason> {
    for attempt in 1..=CONNECT_ATTEMPTS {
        let room = host.get_or_create(&params.room_id).await.map_err(|e| {
            log::error!("Room {} could not be loaded: {e}", params.room_id);
            CloseReason::RoomUnavailable
        })?;

        match room.connect(params.session_id.clone(), sender.clone()).await {
            Ok(()) => return Ok(room),
            Err(RoomError::Sleeping(_)) => {
                log::debug!(
                    "Room {} slept during connect (attempt {attempt}/{CONNECT_ATTEMPTS})",
                    params.room_id
                );
            }
            Err(RoomError::InvalidSession {
                reason: SessionRejection::Duplicate,
                ..
            }) => return Err(CloseReason::DuplicateSessionId),
            Err(RoomError::InvalidSession { .. }) => return Err(CloseReason::InvalidSessionId),
            Err(e) => {
                log::error!("Room {} refused session: {e}", params.room_id);
                return Err(CloseReason::RoomUnavailable);
            }
        }
    }
    Err(CloseReason::RoomUnavailable)
}

/// Why a room ended a session's outbound stream: it fell asleep, or it
/// evicted the session for not keeping up.
async fn detach_reason(room: &RoomHandle) -> CloseReason {
    match room.info().await {
        Ok(info) if info.lifecycle == Lifecycle::Active => CloseReason::SessionLagging,
        _ => CloseReason::RoomSleeping,
    }
}

/// Send a close frame and give the peer a moment to acknowledge it.
async fn close_with(ws_sender: &mut WsSink, ws_receiver: &mut WsSource, reason: CloseReason) {
    let frame = CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: reason.message().into(),
    };
    if let Err(e) = ws_sender.send(Message::Close(Some(frame))).await {
        log::debug!("Close frame not delivered: {e}");
        return;
    }
    let _ = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(_)) = ws_receiver.next().await {}
    })
    .await;
}
