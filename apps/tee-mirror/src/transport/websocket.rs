use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tee_protocol::ServerMessage;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

use super::{Connector, EventStream, TransportError, decode_frame};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Writer side of whichever socket is currently live. Shared with
/// [`crate::input::SocketInputSender`] so input follows reconnects.
#[derive(Clone, Default)]
pub struct OutboundSlot {
    current: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

impl OutboundSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a text frame on the live socket. False when disconnected.
    pub fn send(&self, frame: String) -> bool {
        match self.current.lock().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    pub(crate) fn install(&self, tx: mpsc::UnboundedSender<String>) {
        *self.current.lock() = Some(tx);
    }

    fn release(&self, tx: &mpsc::UnboundedSender<String>) {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|live| live.same_channel(tx)) {
            *current = None;
        }
    }
}

/// Connects to `{ws(s)}://host/ws/ui?token=…`.
pub struct WebSocketConnector {
    base_url: Url,
    outbound: OutboundSlot,
}

impl WebSocketConnector {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            outbound: OutboundSlot::new(),
        }
    }

    pub fn outbound(&self) -> OutboundSlot {
        self.outbound.clone()
    }

    pub fn socket_url(&self, scope: &str) -> Result<Url, TransportError> {
        let mut url = self.base_url.join("ws/ui")?;
        url.query_pairs_mut().append_pair("token", scope);
        Ok(url)
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, scope: &str) -> Result<Box<dyn EventStream>, TransportError> {
        let url = self.socket_url(scope)?;
        let (socket, _response) = connect_async(url.as_str()).await?;
        let (mut sink, stream) = socket.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(err) = sink.send(Message::Text(frame)).await {
                    tracing::debug!(target: "mirror.transport", error = %err, "websocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });
        self.outbound.install(tx.clone());

        Ok(Box::new(WebSocketEvents {
            stream,
            writer,
            tx,
            outbound: self.outbound.clone(),
        }))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

struct WebSocketEvents {
    stream: SplitStream<Socket>,
    writer: JoinHandle<()>,
    tx: mpsc::UnboundedSender<String>,
    outbound: OutboundSlot,
}

#[async_trait]
impl EventStream for WebSocketEvents {
    async fn next_message(&mut self) -> Result<Option<ServerMessage>, TransportError> {
        while let Some(frame) = self.stream.next().await {
            match frame? {
                Message::Text(text) => {
                    if let Some(message) = decode_frame("websocket", &text) {
                        return Ok(Some(message));
                    }
                }
                Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                    Ok(text) => {
                        if let Some(message) = decode_frame("websocket", text) {
                            return Ok(Some(message));
                        }
                    }
                    Err(_) => {
                        tracing::debug!(target: "mirror.transport", bytes = bytes.len(), "dropping non-utf8 frame");
                    }
                },
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
        Ok(None)
    }
}

impl Drop for WebSocketEvents {
    fn drop(&mut self) {
        self.outbound.release(&self.tx);
        self.writer.abort();
    }
}
