//! Snapshot codec: full document state ⇄ bytes.
//!
//! Layout:
//! ```text
//! ┌──────────┬─────────┬───────────────┬──────────────────────────────┐
//! │ "CVRS"   │ version │ raw size (LE) │ lz4 block                    │
//! │ 4 bytes  │ 1 byte  │ 4 bytes       │ bincode(Snapshot)            │
//! └──────────┴─────────┴───────────────┴──────────────────────────────┘
//! ```
//!
//! Decoding never trusts the declared size beyond [`MAX_SNAPSHOT_BYTES`].

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::document::DocumentState;

/// File magic for snapshot blobs.
pub const SNAPSHOT_MAGIC: &[u8; 4] = b"CVRS";

/// Current snapshot format version.
pub const FORMAT_VERSION: u8 = 1;

/// Upper bound on the decompressed payload (256MB).
pub const MAX_SNAPSHOT_BYTES: usize = 256 * 1024 * 1024;

const HEADER_LEN: usize = SNAPSHOT_MAGIC.len() + 1;

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),
    #[error("snapshot encoding failed: {0}")]
    Encode(String),
}

/// Immutable, timestamped copy of a document state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Milliseconds since the Unix epoch
    pub taken_at_ms: u64,
    pub state: DocumentState,
}

impl Snapshot {
    /// Snapshot of `state` stamped with the current time.
    pub fn now(state: DocumentState) -> Self {
        Self {
            taken_at_ms: now_ms(),
            state,
        }
    }
}

/// Borrowed twin of [`Snapshot`] so encoding never clones the state.
#[derive(Serialize)]
struct SnapshotRef<'a> {
    taken_at_ms: u64,
    state: &'a DocumentState,
}

/// Encode a state, stamping it with the current time.
pub fn encode(state: &DocumentState) -> Result<Vec<u8>, CodecError> {
    encode_parts(now_ms(), state)
}

/// Decode a blob produced by [`encode`] back into the document state.
pub fn decode(bytes: &[u8]) -> Result<DocumentState, CodecError> {
    decode_snapshot(bytes).map(|snapshot| snapshot.state)
}

/// Encode a full snapshot, keeping its timestamp.
pub fn encode_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>, CodecError> {
    encode_parts(snapshot.taken_at_ms, &snapshot.state)
}

/// Decode a full snapshot including its timestamp.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(corrupt(format!("{} bytes is shorter than the header", bytes.len())));
    }
    if &bytes[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = bytes[SNAPSHOT_MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(corrupt(format!("unknown format version {version}")));
    }

    let block = &bytes[HEADER_LEN..];
    if block.len() < 4 {
        return Err(corrupt("missing size prefix"));
    }
    let declared = u32::from_le_bytes([block[0], block[1], block[2], block[3]]) as usize;
    if declared > MAX_SNAPSHOT_BYTES {
        return Err(corrupt(format!("declared size {declared} exceeds limit")));
    }

    let raw = lz4_flex::decompress_size_prepended(block)
        .map_err(|e| corrupt(format!("lz4: {e}")))?;

    let config = bincode::config::standard().with_limit::<MAX_SNAPSHOT_BYTES>();
    let (snapshot, used): (Snapshot, usize) = bincode::serde::decode_from_slice(&raw, config)
        .map_err(|e| corrupt(format!("bincode: {e}")))?;
    if used != raw.len() {
        return Err(corrupt(format!("{} trailing bytes", raw.len() - used)));
    }

    Ok(snapshot)
}

fn encode_parts(taken_at_ms: u64, state: &DocumentState) -> Result<Vec<u8>, CodecError> {
    let payload = bincode::serde::encode_to_vec(
        SnapshotRef { taken_at_ms, state },
        bincode::config::standard(),
    )
    .map_err(|e| CodecError::Encode(e.to_string()))?;
    if payload.len() > MAX_SNAPSHOT_BYTES {
        return Err(CodecError::Encode(format!(
            "snapshot of {} bytes exceeds limit",
            payload.len()
        )));
    }

    let compressed = lz4_flex::compress_prepend_size(&payload);
    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(SNAPSHOT_MAGIC);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&compressed);
    Ok(out)
}

fn corrupt(reason: impl Into<String>) -> CodecError {
    CodecError::CorruptSnapshot(reason.into())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
