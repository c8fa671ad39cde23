//! Binary protocol between canvas clients and room sessions.
//!
//! Endpoint: `ws://<bind>/rooms/<roomId>?sessionId=<id>`
//!
//! Wire format (bincode-encoded, one message per binary frame):
//! ```text
//! client ──► server            server ──► client
//! ─────────────────            ─────────────────────────────────────────
//! Push { op }                  Connected { session_id, schema_version,
//! Ping                                     clock, records }   (first)
//!                              Changes   { clock, origin, diff }
//!                              Pong
//! ```
//!
//! Protocol violations at connect time are answered with a close frame
//! carrying a [`CloseReason`].

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::codec::MAX_SNAPSHOT_BYTES;
use crate::document::Record;
use crate::merge::{Operation, RecordsDiff};

/// Maximum length of room and session identifiers.
pub const MAX_ID_LEN: usize = 128;

/// Default cap on inbound frames (1MB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Hard ceiling for inbound frames, and the decode budget of client messages.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Query parameter carrying the session identifier.
pub const SESSION_PARAM: &str = "sessionId";

/// Path prefix of room endpoints.
pub const ROOMS_PATH: &str = "/rooms/";

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("message encoding failed: {0}")]
    Encode(String),
    #[error("malformed message: {0}")]
    Decode(String),
    #[error("message of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("invalid room id: {0}")]
    InvalidRoomId(String),
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
}

/// Room identifier: 1–128 chars from `[A-Za-z0-9._:-]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Result<Self, ProtocolError> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_ID_LEN {
            return Err(ProtocolError::InvalidRoomId(format!(
                "length {} outside 1..={MAX_ID_LEN}",
                id.len()
            )));
        }
        if let Some(c) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-')))
        {
            return Err(ProtocolError::InvalidRoomId(format!(
                "illegal character {c:?}"
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-chosen session identifier.
///
/// Construction is unchecked so that rooms can reject bad ids with a
/// proper reason; see [`SessionId::validate`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 1–128 printable, non-whitespace characters.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.0.is_empty() {
            return Err(ProtocolError::InvalidSessionId("empty".into()));
        }
        if self.0.len() > MAX_ID_LEN {
            return Err(ProtocolError::InvalidSessionId(format!(
                "length {} exceeds {MAX_ID_LEN}",
                self.0.len()
            )));
        }
        if self.0.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ProtocolError::InvalidSessionId(
                "contains whitespace or control characters".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Client → server message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Submit an operation to the room
    Push { op: Operation },
    /// Heartbeat ping
    Ping,
}

/// Server → client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Full document state, always the first frame of a session
    Connected {
        session_id: SessionId,
        schema_version: u32,
        clock: u64,
        records: Vec<Record>,
    },
    /// Net changes produced by another session's operation
    Changes {
        clock: u64,
        origin: SessionId,
        diff: RecordsDiff,
    },
    /// Heartbeat pong
    Pong,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_message(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_message::<_, MAX_FRAME_BYTES>(bytes)
    }

    /// Decode, rejecting frames larger than `limit` up front.
    pub fn decode_limited(bytes: &[u8], limit: usize) -> Result<Self, ProtocolError> {
        let limit = limit.min(MAX_FRAME_BYTES);
        if bytes.len() > limit {
            return Err(ProtocolError::TooLarge {
                size: bytes.len(),
                limit,
            });
        }
        Self::decode(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_message(self)
    }

    /// `Connected` carries the whole document, so the snapshot budget applies.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_message::<_, MAX_SNAPSHOT_BYTES>(bytes)
    }
}

fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn decode_message<T, const LIMIT: usize>(bytes: &[u8]) -> Result<T, ProtocolError>
where
    T: serde::de::DeserializeOwned,
{
    let config = bincode::config::standard().with_limit::<LIMIT>();
    let (msg, _) = bincode::serde::decode_from_slice(bytes, config)
        .map_err(|e| ProtocolError::Decode(e.to_string()))?;
    Ok(msg)
}

/// Machine-readable reasons a session is closed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    MissingRoom,
    MissingSessionId,
    InvalidSessionId,
    DuplicateSessionId,
    RoomSleeping,
    RoomUnavailable,
    /// The session's outbound queue filled up
    SessionLagging,
}

impl CloseReason {
    /// WebSocket close code (RFC 6455 §7.4.1).
    pub fn code(self) -> u16 {
        match self {
            Self::MissingRoom
            | Self::MissingSessionId
            | Self::InvalidSessionId
            | Self::DuplicateSessionId => 1008,
            Self::RoomSleeping => 1001,
            Self::RoomUnavailable => 1011,
            Self::SessionLagging => 1013,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::MissingRoom => "Missing room",
            Self::MissingSessionId => "Missing sessionId",
            Self::InvalidSessionId => "Invalid sessionId",
            Self::DuplicateSessionId => "Duplicate sessionId",
            Self::RoomSleeping => "Room sleeping",
            Self::RoomUnavailable => "Room unavailable",
            Self::SessionLagging => "Session lagging",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.message())
    }
}

/// Room and session addressed by an upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub room_id: RoomId,
    pub session_id: SessionId,
}

impl ConnectParams {
    /// Parse `/rooms/<roomId>` plus the `sessionId` query parameter.
    pub fn parse(path: &str, query: Option<&str>) -> Result<Self, CloseReason> {
        let target = match query {
            Some(query) => format!("{path}?{query}"),
            None => path.to_owned(),
        };
        let url = Url::parse(&format!("ws://localhost{target}"))
            .map_err(|_| CloseReason::MissingRoom)?;
        let room_id = room_from_path(&url).ok_or(CloseReason::MissingRoom)?;

        let session_id = url
            .query_pairs()
            .find_map(|(key, value)| (key == SESSION_PARAM).then_some(value))
            .filter(|value| !value.is_empty())
            .map(|value| SessionId::new(value.into_owned()))
            .ok_or(CloseReason::MissingSessionId)?;
        if session_id.validate().is_err() {
            return Err(CloseReason::InvalidSessionId);
        }

        Ok(Self {
            room_id,
            session_id,
        })
    }

    /// Request target for these parameters (`/rooms/<id>?sessionId=<id>`).
    pub fn request_target(&self) -> String {
        format!(
            "{ROOMS_PATH}{}?{SESSION_PARAM}={}",
            urlencoding::encode(self.room_id.as_str()),
            urlencoding::encode(self.session_id.as_str())
        )
    }
}

/// Exactly one segment below `/rooms`, percent-decoded and validated.
fn room_from_path(url: &Url) -> Option<RoomId> {
    let mut segments: Vec<&str> = url.path_segments()?.collect();
    if segments.last() == Some(&"") {
        segments.pop();
    }
    match segments.as_slice() {
        [prefix, raw] if *prefix == ROOMS_PATH.trim_matches('/') => {
            let decoded = urlencoding::decode(raw).ok()?;
            RoomId::new(decoded.into_owned()).ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_validation() {
        assert!(RoomId::new("board-1").is_ok());
        assert!(RoomId::new("team.a:board_2").is_ok());
        assert!(RoomId::new("").is_err());
        assert!(RoomId::new("has space").is_err());
        assert!(RoomId::new("slash/room").is_err());
        assert!(RoomId::new("x".repeat(MAX_ID_LEN)).is_ok());
        assert!(RoomId::new("x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_session_id_validation() {
        assert!(SessionId::from("s1").validate().is_ok());
        assert!(SessionId::from("é-ünïcode").validate().is_ok());
        assert!(SessionId::from("").validate().is_err());
        assert!(SessionId::from("a b").validate().is_err());
        assert!(SessionId::from("tab\t").validate().is_err());
        assert!(SessionId::new("x".repeat(MAX_ID_LEN + 1)).validate().is_err());
        assert!(SessionId::generate().validate().is_ok());
    }

    #[test]
    fn test_client_message_roundtrip() {
        let msg = ClientMessage::Push {
            op: Operation::put(1, Record::new("shape:1", "shape").with_prop("x", 3i64)),
        };
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_server_message_roundtrip() {
        let msg = ServerMessage::Changes {
            clock: 9,
            origin: "s1".into(),
            diff: RecordsDiff {
                put: vec![Record::new("page:1", "page")],
                removed: vec!["shape:2".into()],
            },
        };
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_ping_is_tiny() {
        let encoded = ClientMessage::Ping.encode().unwrap();
        assert!(encoded.len() <= 2, "ping took {} bytes", encoded.len());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(ClientMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(ServerMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_limited() {
        let bytes = ClientMessage::Ping.encode().unwrap();
        assert_eq!(ClientMessage::decode_limited(&bytes, 16).unwrap(), ClientMessage::Ping);
        let big = vec![0u8; 32];
        assert_eq!(
            ClientMessage::decode_limited(&big, 16),
            Err(ProtocolError::TooLarge {
                size: 32,
                limit: 16
            })
        );
    }

    #[test]
    fn test_close_reason_codes() {
        assert_eq!(CloseReason::MissingSessionId.code(), 1008);
        assert_eq!(CloseReason::MissingSessionId.message(), "Missing sessionId");
        assert_eq!(CloseReason::DuplicateSessionId.code(), 1008);
        assert_eq!(CloseReason::RoomSleeping.code(), 1001);
        assert_eq!(CloseReason::RoomUnavailable.code(), 1011);
        assert_eq!(CloseReason::SessionLagging.code(), 1013);
        assert_eq!(CloseReason::MissingRoom.to_string(), "1008 Missing room");
    }

    #[test]
    fn test_connect_params_parse() {
        let params = ConnectParams::parse("/rooms/board-1", Some("sessionId=abc")).unwrap();
        assert_eq!(params.room_id.as_str(), "board-1");
        assert_eq!(params.session_id.as_str(), "abc");

        let params =
            ConnectParams::parse("/rooms/board-1/", Some("x=1&sessionId=a%3Ab&y")).unwrap();
        assert_eq!(params.session_id.as_str(), "a:b");

        let params = ConnectParams::parse("/rooms/board-1", Some("sessionId=a%2Bb")).unwrap();
        assert_eq!(params.session_id.as_str(), "a+b");

        let params = ConnectParams::parse("/rooms/team%3Aboard", Some("sessionId=s")).unwrap();
        assert_eq!(params.room_id.as_str(), "team:board");
    }

    #[test]
    fn test_connect_params_errors() {
        assert_eq!(
            ConnectParams::parse("/rooms/board-1", None),
            Err(CloseReason::MissingSessionId)
        );
        assert_eq!(
            ConnectParams::parse("/rooms/board-1", Some("sessionId=")),
            Err(CloseReason::MissingSessionId)
        );
        assert_eq!(
            ConnectParams::parse("/rooms/board-1", Some("sessionId=a+b")),
            Err(CloseReason::InvalidSessionId)
        );
        assert_eq!(
            ConnectParams::parse("/rooms/board-1", Some("sessionId=%09")),
            Err(CloseReason::InvalidSessionId)
        );
        assert_eq!(
            ConnectParams::parse("/", Some("sessionId=s")),
            Err(CloseReason::MissingRoom)
        );
        assert_eq!(
            ConnectParams::parse("/rooms/", Some("sessionId=s")),
            Err(CloseReason::MissingRoom)
        );
        assert_eq!(
            ConnectParams::parse("/rooms/a/b", Some("sessionId=s")),
            Err(CloseReason::MissingRoom)
        );
        assert_eq!(
            ConnectParams::parse("/rooms/bad%20room", Some("sessionId=s")),
            Err(CloseReason::MissingRoom)
        );
    }

    #[test]
    fn test_request_target_parses_back() {
        let params = ConnectParams {
            room_id: RoomId::new("team:board.1").unwrap(),
            session_id: SessionId::from("user@host#1"),
        };
        let target = params.request_target();
        let (path, query) = target.split_once('?').unwrap();
        assert_eq!(ConnectParams::parse(path, Some(query)).unwrap(), params);
    }

    #[test]
    fn test_request_target_escapes_unicode() {
        let params = ConnectParams {
            room_id: RoomId::new("lobby").unwrap(),
            session_id: SessionId::from("é-ünïcode/?&"),
        };
        let target = params.request_target();
        assert!(target.is_ascii());
        let (path, query) = target.split_once('?').unwrap();
        assert_eq!(ConnectParams::parse(path, Some(query)).unwrap(), params);
    }

    #[test]
    fn test_client_decode_budget_is_frame_sized() {
        let blob = "x".repeat(MAX_FRAME_BYTES);
        let huge = ClientMessage::Push {
            op: Operation::put(1, Record::new("shape:1", "shape").with_prop("blob", blob)),
        };
        let bytes = huge.encode().unwrap();
        assert!(matches!(ClientMessage::decode(&bytes), Err(ProtocolError::Decode(_))));
        assert!(matches!(
            ClientMessage::decode_limited(&bytes, usize::MAX),
            Err(ProtocolError::TooLarge { limit: MAX_FRAME_BYTES, .. })
        ));
    }
}
