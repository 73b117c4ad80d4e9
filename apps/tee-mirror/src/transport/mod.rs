//! Reconnecting subscription to the relay's push channel.
//!
//! A [`Connector`] opens one [`EventStream`]; the [`supervisor`] owns the
//! reconnect policy and is the only place streams are created, so there is
//! never more than one live connection per scope.

use std::collections::HashMap;

use async_trait::async_trait;
use tee_protocol::ServerMessage;
use thiserror::Error;

pub mod mock;
pub mod sse;
pub mod supervisor;
pub mod websocket;

pub use sse::SseConnector;
pub use supervisor::{Supervisor, SupervisorHandle};
pub use websocket::{OutboundSlot, WebSocketConnector};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("invalid endpoint: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// What the engine hears from the transport layer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    Message(ServerMessage),
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a stream for `scope`. Resolves once the connection is usable.
    async fn connect(&self, scope: &str) -> Result<Box<dyn EventStream>, TransportError>;

    fn name(&self) -> &'static str;
}

#[async_trait]
pub trait EventStream: Send {
    /// Next decoded message. `Ok(None)` means the peer closed the stream.
    /// Payloads that fail to decode are dropped inside the stream.
    async fn next_message(&mut self) -> Result<Option<ServerMessage>, TransportError>;
}

/// Decodes one text frame, logging and dropping anything malformed.
pub(crate) fn decode_frame(transport: &'static str, text: &str) -> Option<ServerMessage> {
    match ServerMessage::decode(text) {
        Ok(ServerMessage::Unknown) => {
            tracing::debug!(target: "mirror.transport", transport, "ignoring unrecognized message type");
            None
        }
        Ok(message) => Some(message),
        Err(err) => {
            tracing::debug!(
                target: "mirror.transport",
                transport,
                error = %err,
                bytes = text.len(),
                "dropping malformed message"
            );
            None
        }
    }
}

/// Drops `output` messages whose sequence number was already seen for that
/// session. Messages without a sequence number always pass.
#[derive(Debug, Default)]
pub struct Deduper {
    last_seq: HashMap<String, u64>,
}

impl Deduper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, message: &ServerMessage) -> bool {
        let ServerMessage::Output {
            session_id,
            seq: Some(seq),
            ..
        } = message
        else {
            return true;
        };
        match self.last_seq.get(session_id) {
            Some(last) if seq <= last => false,
            _ => {
                self.last_seq.insert(session_id.clone(), *seq);
                true
            }
        }
    }

    /// Drops the high-water mark of a session that no longer exists.
    pub fn forget(&mut self, session_id: &str) -> bool {
        self.last_seq.remove(session_id).is_some()
    }

    pub fn tracked(&self) -> usize {
        self.last_seq.len()
    }
}
