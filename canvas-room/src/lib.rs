//! # canvas-room: Per-room sync backend for a multiplayer canvas
//!
//! Each room is an actor owning one authoritative document. Sessions
//! attach over WebSocket, push operations through a pluggable merge
//! engine, and receive everyone else's changes. Room state is snapshotted
//! to a key-value store on a throttle and once more when the room sleeps.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ RoomClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (gateway)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴──────┐
//!                                     │  RoomHost   │ one actor per roomId
//!                                     └──────┬──────┘
//!                                            │
//!                     ┌──────────────────────┼──────────────────┐
//!                     ▼                      ▼                  ▼
//!              ┌─────────────┐       ┌─────────────┐     ┌─────────────┐
//!              │ MergeEngine │       │ SessionSet  │     │  KvStore    │
//!              │ (pure)      │       │ (fan-out)   │     │ (snapshots) │
//!              └─────────────┘       └─────────────┘     └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`]: Records, document state and schema
//! - [`merge`]: Operations and the merge engine seam
//! - [`codec`]: Versioned, compressed snapshot format
//! - [`storage`]: Key-value stores (RocksDB, in-memory)
//! - [`protocol`]: Binary wire protocol and connect parameters
//! - [`session`]: Per-room session set with N-1 fan-out
//! - [`room`]: The room actor
//! - [`host`]: Placement and idle eviction
//! - [`server`]: WebSocket gateway
//! - [`client`]: WebSocket room client
//! - [`enrich`]: Asset uploads and link previews

pub mod client;
pub mod codec;
pub mod document;
pub mod enrich;
pub mod host;
pub mod merge;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use client::{ClientError, ClientEvent, RoomClient};
pub use codec::{CodecError, Snapshot};
pub use document::{DocumentState, PropValue, Props, Record, RecordId, Schema};
pub use enrich::{
    AssetMetadata, AssetRef, EnrichmentError, FsAssetStore, LinkPreview, LinkUnfurler,
};
pub use host::{HostStats, RoomHost};
pub use merge::{Change, MergeEngine, MergeError, Operation, RecordMerge, RecordsDiff};
pub use protocol::{
    ClientMessage, CloseReason, ConnectParams, ProtocolError, RoomId, ServerMessage, SessionId,
};
pub use room::{Lifecycle, Room, RoomConfig, RoomError, RoomHandle, RoomInfo, SessionRejection};
pub use server::{ConfigError, ServerConfig, ServerError, ServerStats, SyncServer};
pub use session::{FanoutStats, SessionSet};
pub use storage::{KvStore, MemoryStore, RocksStore, StoreConfig, StoreError};
