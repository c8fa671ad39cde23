//! Room actor: single owner of one document's authoritative state.
//!
//! Architecture:
//! ```text
//!  session tasks ──┐   RoomCommand (unbounded mpsc)
//!  RoomHost ───────┼──────────────────────────────► RoomActor ──► MergeEngine
//!                  │                                    │  ▲
//!                  │         Arc<Vec<u8>> per session   │  │ PersistFailed
//!  session tasks ◄─┴────────────────────────────────────┤  │
//!                                                       ▼  │
//!                                               writer task ──► KvStore
//!                                               (spawn_blocking, in order)
//! ```
//!
//! Session queues are bounded; a session that falls a full queue behind is
//! dropped from the room and its transport closes with "Session lagging".
//!
//! Persistence is a trailing-edge throttle: the first change arms a
//! deadline `persist_interval` away, later changes ride along, and the
//! deadline writes the then-current state exactly once. A sleep signal
//! cancels the deadline and performs a final write unconditionally.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::codec;
use crate::document::DocumentState;
use crate::merge::{MergeEngine, Operation};
use crate::protocol::{RoomId, ServerMessage, SessionId};
use crate::session::{FanoutStats, SessionSender, SessionSet};
use crate::storage::{snapshot_key, KvStore, StoreError};

/// Room tuning.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Delay between the first unsaved change and its snapshot write
    pub persist_interval: Duration,
    /// Upper bound on loading the snapshot at creation
    pub load_timeout: Duration,
    /// Attempts for the final write on sleep
    pub final_write_attempts: u32,
    /// Pause between final write attempts
    pub final_write_backoff: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            persist_interval: Duration::from_secs(1),
            load_timeout: Duration::from_secs(5),
            final_write_attempts: 3,
            final_write_backoff: Duration::from_millis(100),
        }
    }
}

impl RoomConfig {
    /// Short intervals for tests.
    pub fn for_testing() -> Self {
        Self {
            persist_interval: Duration::from_millis(50),
            load_timeout: Duration::from_secs(1),
            final_write_attempts: 3,
            final_write_backoff: Duration::from_millis(10),
        }
    }
}

/// Host-driven room lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Sleeping,
}

/// Why a connect was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionRejection {
    #[error("session id is empty")]
    Empty,
    #[error("session id is malformed")]
    Malformed,
    #[error("session id is already attached")]
    Duplicate,
    #[error("transport closed before admission")]
    TransportClosed,
}

/// Room errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("session '{session_id}' rejected: {reason}")]
    InvalidSession {
        session_id: SessionId,
        reason: SessionRejection,
    },
    #[error("invalid room id: {0}")]
    InvalidRoom(String),
    #[error("room '{0}' is sleeping")]
    Sleeping(RoomId),
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
    #[error("encoding failed: {0}")]
    Encode(String),
}

/// Point-in-time view of a room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub lifecycle: Lifecycle,
    /// Attached sessions
    pub sessions: usize,
    pub record_count: usize,
    pub clock: u64,
    /// A snapshot write is armed but has not fired yet
    pub persist_pending: bool,
    /// Time since the last session left, `None` while sessions are attached
    pub idle_for: Option<Duration>,
    /// Snapshot writes handed to the writer so far
    pub snapshots_scheduled: u64,
    pub fanout: FanoutStats,
}

pub(crate) enum RoomCommand {
    Connect {
        session_id: SessionId,
        sender: SessionSender,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    Operation {
        session_id: SessionId,
        op: Operation,
    },
    Disconnect {
        session_id: SessionId,
    },
    Sleep {
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    Inspect {
        reply: oneshot::Sender<RoomInfo>,
    },
    Document {
        reply: oneshot::Sender<DocumentState>,
    },
    /// Writer feedback: a scheduled write did not reach the store
    PersistFailed {
        clock: u64,
        error: StoreError,
    },
}

/// Handle to a running room. Cheap to clone.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: RoomId,
    commands: mpsc::UnboundedSender<RoomCommand>,
}

impl std::fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle")
            .field("room_id", &self.room_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RoomHandle {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Attach a session. The full document is queued on `sender` before
    /// the session starts receiving changes.
    pub async fn connect(
        &self,
        session_id: SessionId,
        sender: SessionSender,
    ) -> Result<(), RoomError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Connect {
            session_id,
            sender,
            reply,
        })?;
        rx.await.map_err(|_| self.sleeping())?
    }

    /// Queue an operation (fire-and-forget).
    pub fn receive_operation(&self, session_id: SessionId, op: Operation) -> Result<(), RoomError> {
        self.send(RoomCommand::Operation { session_id, op })
    }

    /// Detach a session. No-op once the room sleeps.
    pub fn disconnect(&self, session_id: SessionId) {
        let _ = self.send(RoomCommand::Disconnect { session_id });
    }

    /// Flush a final snapshot and stop the room.
    pub async fn sleep(&self) -> Result<(), RoomError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Sleep { reply })?;
        rx.await.map_err(|_| self.sleeping())?
    }

    pub async fn info(&self) -> Result<RoomInfo, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Inspect { reply })?;
        rx.await.map_err(|_| self.sleeping())
    }

    /// Copy of the current document state.
    pub async fn document(&self) -> Result<DocumentState, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Document { reply })?;
        rx.await.map_err(|_| self.sleeping())
    }

    /// The actor has stopped accepting commands.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Both handles address the same actor instance.
    pub fn same_room(&self, other: &RoomHandle) -> bool {
        self.commands.same_channel(&other.commands)
    }

    fn send(&self, cmd: RoomCommand) -> Result<(), RoomError> {
        self.commands.send(cmd).map_err(|_| self.sleeping())
    }

    fn sleeping(&self) -> RoomError {
        RoomError::Sleeping(self.room_id.clone())
    }
}

/// Room construction.
pub struct Room;

impl Room {
    /// Load the room's snapshot and start its actor.
    ///
    /// A missing or corrupt snapshot yields an empty document. A store that
    /// cannot be read (or does not answer within `load_timeout`) fails with
    /// `StoreUnavailable`, so unreadable data is never overwritten.
    pub async fn create(
        room_id: RoomId,
        store: Arc<dyn KvStore>,
        engine: Arc<dyn MergeEngine>,
        config: RoomConfig,
    ) -> Result<RoomHandle, RoomError> {
        let key = snapshot_key(&room_id);
        let schema_version = engine.schema().version();

        let loaded = {
            let store = Arc::clone(&store);
            let key = key.clone();
            tokio::time::timeout(
                config.load_timeout,
                tokio::task::spawn_blocking(move || store.get(&key)),
            )
            .await
        };
        let bytes = match loaded {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => return Err(StoreError::Unavailable(format!("load task failed: {e}")).into()),
            Err(_) => {
                return Err(StoreError::Unavailable(format!(
                    "load timed out after {:?}",
                    config.load_timeout
                ))
                .into())
            }
        };

        let state = match bytes {
            None => DocumentState::empty(schema_version),
            Some(bytes) => match codec::decode(&bytes) {
                Ok(state) if state.schema_version > schema_version => {
                    log::warn!(
                        "Snapshot for room {room_id} uses schema v{} (room speaks v{schema_version}); starting empty",
                        state.schema_version
                    );
                    DocumentState::empty(schema_version)
                }
                Ok(mut state) => {
                    state.schema_version = schema_version;
                    state
                }
                Err(e) => {
                    log::warn!("Ignoring snapshot for room {room_id}: {e}");
                    DocumentState::empty(schema_version)
                }
            },
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(
            room_id.clone(),
            key,
            store,
            writer_rx,
            commands_tx.downgrade(),
        ));

        log::info!(
            "Room {room_id} active ({} records, clock {})",
            state.len(),
            state.clock
        );

        let actor = RoomActor {
            room_id: room_id.clone(),
            engine,
            config,
            state,
            sessions: SessionSet::new(),
            lifecycle: Lifecycle::Active,
            commands: commands_rx,
            writer: writer_tx,
            persist_deadline: None,
            dirty: false,
            snapshots_scheduled: 0,
            idle_since: Some(Instant::now()),
        };
        tokio::spawn(actor.run());

        Ok(RoomHandle {
            room_id,
            commands: commands_tx,
        })
    }
}

/// Snapshot write request for the writer task.
struct PersistJob {
    clock: u64,
    bytes: Vec<u8>,
    /// Present for the final write, whose outcome the actor awaits
    done: Option<oneshot::Sender<Result<(), StoreError>>>,
}

/// Performs snapshot writes one at a time, in submission order.
async fn run_writer(
    room_id: RoomId,
    key: String,
    store: Arc<dyn KvStore>,
    mut jobs: mpsc::UnboundedReceiver<PersistJob>,
    feedback: mpsc::WeakUnboundedSender<RoomCommand>,
) {
    while let Some(PersistJob { clock, bytes, done }) = jobs.recv().await {
        let size = bytes.len();
        let result = {
            let store = Arc::clone(&store);
            let key = key.clone();
            tokio::task::spawn_blocking(move || store.put(&key, &bytes))
                .await
                .unwrap_or_else(|e| Err(StoreError::Unavailable(format!("write task failed: {e}"))))
        };

        match (result, done) {
            (result, Some(done)) => {
                let _ = done.send(result);
            }
            (Ok(()), None) => {
                log::debug!("Persisted room {room_id} at clock {clock} ({size} bytes)");
            }
            (Err(error), None) => {
                log::warn!("Snapshot write for room {room_id} at clock {clock} failed: {error}");
                if let Some(commands) = feedback.upgrade() {
                    let _ = commands.send(RoomCommand::PersistFailed { clock, error });
                }
            }
        }
    }
}

/// The actor state. Runs inside its own task.
struct RoomActor {
    room_id: RoomId,
    engine: Arc<dyn MergeEngine>,
    config: RoomConfig,
    state: DocumentState,
    sessions: SessionSet,
    lifecycle: Lifecycle,
    commands: mpsc::UnboundedReceiver<RoomCommand>,
    writer: mpsc::UnboundedSender<PersistJob>,
    /// Armed persistence timer
    persist_deadline: Option<Instant>,
    /// State changed since the last write was issued
    dirty: bool,
    snapshots_scheduled: u64,
    idle_since: Option<Instant>,
}

impl RoomActor {
    async fn run(mut self) {
        loop {
            let deadline = self.persist_deadline;
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(RoomCommand::Sleep { reply }) => {
                        let result = self.sleep().await;
                        self.commands.close();
                        let _ = reply.send(result);
                        break;
                    }
                    Some(cmd) => self.handle(cmd),
                    None => {
                        self.abandon();
                        break;
                    }
                },
                _ = wait_until(deadline) => self.persist(),
            }
        }

        self.drain();
        log::debug!("Room {} actor stopped", self.room_id);
    }

    fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Connect {
                session_id,
                sender,
                reply,
            } => {
                let result = self.connect(session_id, sender);
                let _ = reply.send(result);
            }
            RoomCommand::Operation { session_id, op } => self.apply(session_id, op),
            RoomCommand::Disconnect { session_id } => self.disconnect(session_id),
            RoomCommand::Inspect { reply } => {
                let _ = reply.send(self.info());
            }
            RoomCommand::Document { reply } => {
                let _ = reply.send(self.state.clone());
            }
            RoomCommand::PersistFailed { clock, error } => {
                log::warn!(
                    "Room {} will retry persisting (write at clock {clock} failed: {error})",
                    self.room_id
                );
                self.schedule_persist();
            }
            // Handled by the run loop
            RoomCommand::Sleep { reply } => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn connect(&mut self, session_id: SessionId, sender: SessionSender) -> Result<(), RoomError> {
        let reject = |reason| RoomError::InvalidSession {
            session_id: session_id.clone(),
            reason,
        };
        if session_id.is_empty() {
            return Err(reject(SessionRejection::Empty));
        }
        if session_id.validate().is_err() {
            return Err(reject(SessionRejection::Malformed));
        }
        if sender.is_closed() {
            return Err(reject(SessionRejection::TransportClosed));
        }
        if self.sessions.is_live(&session_id) {
            log::warn!(
                "Rejected duplicate session {session_id} in room {}",
                self.room_id
            );
            return Err(reject(SessionRejection::Duplicate));
        }

        let hello = ServerMessage::Connected {
            session_id: session_id.clone(),
            schema_version: self.state.schema_version,
            clock: self.state.clock,
            records: self.state.records().cloned().collect(),
        }
        .encode()
        .map_err(|e| RoomError::Encode(e.to_string()))?;
        if sender.try_send(Arc::new(hello)).is_err() {
            return Err(reject(SessionRejection::TransportClosed));
        }

        if self.sessions.admit(session_id.clone(), sender).is_some() {
            log::debug!("Session {session_id} replaced a closed transport");
        }
        self.idle_since = None;
        log::info!(
            "Session {session_id} joined room {} ({} attached)",
            self.room_id,
            self.sessions.len()
        );
        Ok(())
    }

    fn apply(&mut self, session_id: SessionId, op: Operation) {
        if !self.sessions.contains(&session_id) {
            log::warn!(
                "Dropped operation from unknown session {session_id} in room {}",
                self.room_id
            );
            return;
        }

        let (next, diff) = match self.engine.apply(&self.state, &op) {
            Ok(applied) => applied,
            Err(e) => {
                log::warn!(
                    "Dropped invalid operation from {session_id} in room {}: {e}",
                    self.room_id
                );
                return;
            }
        };
        self.state = next;
        if diff.is_empty() {
            log::trace!("Operation from {session_id} changed nothing");
            return;
        }

        let changes = ServerMessage::Changes {
            clock: self.state.clock,
            origin: session_id.clone(),
            diff,
        };
        match changes.encode() {
            Ok(bytes) => {
                let delivered = self.sessions.broadcast_except(&session_id, &Arc::new(bytes));
                log::trace!(
                    "Room {} clock {} fanned out to {delivered} sessions",
                    self.room_id,
                    self.state.clock
                );
            }
            Err(e) => log::error!("Failed to encode changes for room {}: {e}", self.room_id),
        }

        self.schedule_persist();
    }

    fn disconnect(&mut self, session_id: SessionId) {
        if !self.sessions.remove(&session_id) {
            return;
        }
        log::info!(
            "Session {session_id} left room {} ({} attached)",
            self.room_id,
            self.sessions.len()
        );
        if self.sessions.is_empty() {
            self.idle_since = Some(Instant::now());
        }
    }

    fn info(&self) -> RoomInfo {
        RoomInfo {
            room_id: self.room_id.clone(),
            lifecycle: self.lifecycle,
            sessions: self.sessions.len(),
            record_count: self.state.len(),
            clock: self.state.clock,
            persist_pending: self.persist_deadline.is_some(),
            idle_for: self.idle_since.map(|since| since.elapsed()),
            snapshots_scheduled: self.snapshots_scheduled,
            fanout: self.sessions.stats(),
        }
    }

    /// Mark dirty and arm the timer unless it is already pending.
    fn schedule_persist(&mut self) {
        self.dirty = true;
        if self.persist_deadline.is_none() {
            self.persist_deadline = Some(Instant::now() + self.config.persist_interval);
        }
    }

    /// Timer fired: hand the current state to the writer and disarm.
    fn persist(&mut self) {
        self.persist_deadline = None;
        if !self.dirty {
            return;
        }
        self.dirty = false;
        self.submit(None);
    }

    fn submit(&mut self, done: Option<oneshot::Sender<Result<(), StoreError>>>) -> bool {
        let bytes = match codec::encode(&self.state) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode snapshot for room {}: {e}", self.room_id);
                return false;
            }
        };
        let job = PersistJob {
            clock: self.state.clock,
            bytes,
            done,
        };
        if self.writer.send(job).is_err() {
            log::error!("Snapshot writer for room {} has stopped", self.room_id);
            return false;
        }
        self.snapshots_scheduled += 1;
        true
    }

    async fn sleep(&mut self) -> Result<(), RoomError> {
        self.persist_deadline = None;
        self.lifecycle = Lifecycle::Sleeping;

        let result = self.final_write().await;
        let closed = self.sessions.close_all();
        log::info!(
            "Room {} sleeping at clock {} ({closed} sessions closed)",
            self.room_id,
            self.state.clock
        );
        result
    }

    /// Unconditional write of the current state, retried with backoff.
    async fn final_write(&mut self) -> Result<(), RoomError> {
        let attempts = self.config.final_write_attempts.max(1);
        let mut last_error = StoreError::Unavailable("no write attempted".into());

        for attempt in 1..=attempts {
            let (done, outcome) = oneshot::channel();
            if !self.submit(Some(done)) {
                return Err(RoomError::Encode(format!(
                    "room {} could not submit its final snapshot",
                    self.room_id
                )));
            }
            match outcome.await {
                Ok(Ok(())) => {
                    self.dirty = false;
                    log::info!(
                        "Final snapshot for room {} written at clock {}",
                        self.room_id,
                        self.state.clock
                    );
                    return Ok(());
                }
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = StoreError::Unavailable("snapshot writer stopped".into()),
            }

            log::warn!(
                "Final snapshot attempt {attempt}/{attempts} for room {} failed: {last_error}",
                self.room_id
            );
            if attempt < attempts {
                tokio::time::sleep(self.config.final_write_backoff).await;
            }
        }

        log::error!(
            "Room {} lost its final snapshot at clock {}: {last_error}",
            self.room_id,
            self.state.clock
        );
        Err(RoomError::StoreUnavailable(last_error))
    }

    /// Every handle dropped without a sleep signal.
    fn abandon(&mut self) {
        if self.dirty {
            log::warn!(
                "Room {} dropped without sleep; queueing best-effort snapshot",
                self.room_id
            );
            self.dirty = false;
            self.submit(None);
        }
        self.sessions.close_all();
    }

    /// Answer commands that raced with shutdown.
    fn drain(&mut self) {
        self.lifecycle = Lifecycle::Sleeping;
        self.commands.close();
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                RoomCommand::Connect { reply, .. } => {
                    let _ = reply.send(Err(RoomError::Sleeping(self.room_id.clone())));
                }
                RoomCommand::Sleep { reply } => {
                    let _ = reply.send(Ok(()));
                }
                RoomCommand::Inspect { reply } => {
                    let _ = reply.send(self.info());
                }
                RoomCommand::Document { reply } => {
                    let _ = reply.send(self.state.clone());
                }
                RoomCommand::Operation { session_id, .. } => {
                    log::debug!(
                        "Dropped operation from {session_id}: room {} is sleeping",
                        self.room_id
                    );
                }
                RoomCommand::Disconnect { .. } | RoomCommand::PersistFailed { .. } => {}
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
