//! Per-room session set with N-1 fan-out.
//!
//! Each session owns a bounded outbound channel drained by its transport
//! task. Messages are encoded once and shared as `Arc<Vec<u8>>` across all
//! recipients. Sends never wait: a session whose queue is full is evicted,
//! which ends its stream so the transport can close and the client re-sync.
//!
//! The set is owned by the room actor, so no lock guards it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::protocol::SessionId;

/// Frames buffered per session before it counts as lagging.
pub const DEFAULT_SESSION_QUEUE: usize = 512;

/// Pre-encoded outbound frame.
pub type Outbound = Arc<Vec<u8>>;

/// Sending half of a session's outbound channel.
pub type SessionSender = mpsc::Sender<Outbound>;

/// Receiving half of a session's outbound channel.
pub type SessionReceiver = mpsc::Receiver<Outbound>;

/// Create an outbound channel holding [`DEFAULT_SESSION_QUEUE`] frames.
pub fn outbound_channel() -> (SessionSender, SessionReceiver) {
    outbound_channel_with_capacity(DEFAULT_SESSION_QUEUE)
}

pub fn outbound_channel_with_capacity(capacity: usize) -> (SessionSender, SessionReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    /// Sessions detached because their queue was full
    pub sessions_evicted: u64,
}

/// Sessions attached to one room.
#[derive(Debug, Default)]
pub struct SessionSet {
    sessions: HashMap<SessionId, SessionSender>,
    stats: FanoutStats,
}

impl SessionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, returning the sender it replaced (if any).
    pub fn admit(&mut self, id: SessionId, sender: SessionSender) -> Option<SessionSender> {
        self.sessions.insert(id, sender)
    }

    /// Remove a session. Dropping its sender ends the transport's outbound stream.
    pub fn remove(&mut self, id: &SessionId) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Attached and its transport still reading.
    pub fn is_live(&self, id: &SessionId) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|sender| !sender.is_closed())
    }

    /// Send to every session except `origin`, evicting sessions that lag.
    ///
    /// Returns the number of sessions the frame was queued for.
    pub fn broadcast_except(&mut self, origin: &SessionId, frame: &Outbound) -> usize {
        let mut delivered = 0;
        let mut lagging = Vec::new();
        for (id, sender) in &self.sessions {
            if id == origin {
                continue;
            }
            match sender.try_send(Arc::clone(frame)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => lagging.push(id.clone()),
                Err(TrySendError::Closed(_)) => {
                    log::debug!("Dropped frame for closed session {id}");
                    self.stats.messages_dropped += 1;
                }
            }
        }

        for id in lagging {
            log::warn!("Evicted session {id}: outbound queue full");
            self.sessions.remove(&id);
            self.stats.messages_dropped += 1;
            self.stats.sessions_evicted += 1;
        }
        self.stats.messages_sent += delivered as u64;
        delivered
    }

    /// Detach every session, closing their outbound channels.
    pub fn close_all(&mut self) -> usize {
        let count = self.sessions.len();
        self.sessions.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn stats(&self) -> FanoutStats {
        self.stats
    }
}
