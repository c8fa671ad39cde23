//! Durable key-value storage for room snapshots.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  put(rooms/<id>/snapshot)  ┌──────────────┐
//! │ Room writer │ ─────────────────────────► │ dyn KvStore  │
//! │ (blocking)  │                            ├──────────────┤
//! └─────────────┘                            │ MemoryStore  │
//!        ▲            get on create          │ RocksStore   │
//!        └────────────────────────────────── └──────────────┘
//! ```
//!
//! Each room uses exactly one key; a put replaces the previous value.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{EntryMetadata, RocksStore, StoreConfig};

use crate::protocol::RoomId;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Store temporarily unreachable
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Backend failure
    #[error("database error: {0}")]
    Database(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Byte-oriented durable store.
///
/// Calls are blocking; async callers go through `spawn_blocking`.
pub trait KvStore: Send + Sync {
    /// Read the value at `key`, `None` when absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the value at `key`.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
}

/// Storage key holding a room's current snapshot.
pub fn snapshot_key(room_id: &RoomId) -> String {
    format!("rooms/{}/snapshot", room_id.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_key_is_deterministic() {
        let id = RoomId::new("board-42").unwrap();
        assert_eq!(snapshot_key(&id), "rooms/board-42/snapshot");
        assert_eq!(snapshot_key(&id), snapshot_key(&id.clone()));
    }

    #[test]
    fn test_distinct_rooms_distinct_keys() {
        let a = RoomId::new("a").unwrap();
        let b = RoomId::new("b").unwrap();
        assert_ne!(snapshot_key(&a), snapshot_key(&b));
    }
}
