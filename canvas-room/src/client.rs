//! WebSocket client for a single room session.
//!
//! Provides:
//! - Connect handshake (waits for the initial `Connected` state or a rejection)
//! - Operation push and heartbeat ping
//! - Server message stream, ending in a close event

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::document::Record;
use crate::merge::Operation;
use crate::protocol::{
    ClientMessage, ConnectParams, ProtocolError, RoomId, ServerMessage, SessionId,
};

/// How long `connect` waits for the room to answer.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Close code reported when the socket ends without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code reported for a close frame without a status.
const NO_STATUS: u16 = 1005;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(Box<tungstenite::Error>),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("connection rejected: {code} {reason}")]
    Rejected { code: u16, reason: String },
    #[error("unexpected first message: {0}")]
    UnexpectedMessage(String),
    #[error("connection closed")]
    Closed,
    #[error("timed out waiting for the room")]
    Timeout,
}

impl From<tungstenite::Error> for ClientError {
    fn from(e: tungstenite::Error) -> Self {
        Self::Transport(Box::new(e))
    }
}

/// Events yielded by [`RoomClient::next_message`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Message(ServerMessage),
    Closed { code: u16, reason: String },
}

/// A connected room session.
pub struct RoomClient {
    room_id: RoomId,
    session_id: SessionId,
    schema_version: u32,
    clock: u64,
    records: Vec<Record>,
    sender: SplitSink<WsStream, Message>,
    receiver: SplitStream<WsStream>,
}

impl RoomClient {
    /// Connect to `<base_url>/rooms/<room_id>?sessionId=<session_id>`.
    ///
    /// Resolves once the room has sent its initial state. A close frame
    /// received instead is returned as [`ClientError::Rejected`].
    pub async fn connect(
        base_url: &str,
        room_id: &RoomId,
        session_id: &SessionId,
    ) -> Result<Self, ClientError> {
        let params = ConnectParams {
            room_id: room_id.clone(),
            session_id: session_id.clone(),
        };
        let url = format!("{}{}", base_url.trim_end_matches('/'), params.request_target());
        Self::connect_url(&url, room_id.clone(), session_id.clone()).await
    }

    /// Connect to a prepared endpoint URL.
    pub async fn connect_url(
        url: &str,
        room_id: RoomId,
        session_id: SessionId,
    ) -> Result<Self, ClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (sender, mut receiver) = ws_stream.split();

        let first = tokio::time::timeout(CONNECT_TIMEOUT, next_event(&mut receiver))
            .await
            .map_err(|_| ClientError::Timeout)??;

        match first {
            ClientEvent::Message(ServerMessage::Connected {
                session_id: confirmed,
                schema_version,
                clock,
                records,
            }) => {
                log::debug!("Session {confirmed} connected to room {room_id} at clock {clock}");
                Ok(Self {
                    room_id,
                    session_id,
                    schema_version,
                    clock,
                    records,
                    sender,
                    receiver,
                })
            }
            ClientEvent::Message(other) => Err(ClientError::UnexpectedMessage(format!("{other:?}"))),
            ClientEvent::Closed { code, reason } => Err(ClientError::Rejected { code, reason }),
        }
    }

    /// Submit an operation to the room.
    pub async fn push(&mut self, op: Operation) -> Result<(), ClientError> {
        self.send(&ClientMessage::Push { op }).await
    }

    /// Send a heartbeat ping; the room answers with `Pong`.
    pub async fn ping(&mut self) -> Result<(), ClientError> {
        self.send(&ClientMessage::Ping).await
    }

    /// Send raw bytes as a binary frame.
    pub async fn send_raw(&mut self, bytes: Vec<u8>) -> Result<(), ClientError> {
        self.sender.send(Message::Binary(bytes.into())).await?;
        Ok(())
    }

    /// Wait for the next server message or the close of the session.
    pub async fn next_message(&mut self) -> Result<ClientEvent, ClientError> {
        next_event(&mut self.receiver).await
    }

    /// Close the session.
    pub async fn close(mut self) -> Result<(), ClientError> {
        match self.sender.close().await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Schema version announced by the room.
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Document clock at connect time.
    pub fn initial_clock(&self) -> u64 {
        self.clock
    }

    /// Records received at connect time.
    pub fn initial_records(&self) -> &[Record] {
        &self.records
    }

    async fn send(&mut self, msg: &ClientMessage) -> Result<(), ClientError> {
        let encoded = msg.encode()?;
        self.sender.send(Message::Binary(encoded.into())).await?;
        Ok(())
    }
}

async fn next_event(receiver: &mut SplitStream<WsStream>) -> Result<ClientEvent, ClientError> {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                return Ok(ClientEvent::Message(ServerMessage::decode(&data)?));
            }
            Ok(Message::Close(frame)) => return Ok(closed(frame)),
            Ok(_) => {}
            Err(tungstenite::Error::ConnectionClosed) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(ClientEvent::Closed {
        code: ABNORMAL_CLOSURE,
        reason: String::new(),
    })
}

fn closed(frame: Option<CloseFrame>) -> ClientEvent {
    match frame {
        Some(frame) => ClientEvent::Closed {
            code: u16::from(frame.code),
            reason: frame.reason.as_str().to_owned(),
        },
        None => ClientEvent::Closed {
            code: NO_STATUS,
            reason: String::new(),
        },
    }
}
