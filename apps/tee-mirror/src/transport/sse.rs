use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest_eventsource::{Event, EventSource, retry::Never};
use tee_protocol::ServerMessage;
use url::Url;

use super::{Connector, EventStream, TransportError, decode_frame};

/// Subscribes to `GET {base}/api/events?token=…`.
pub struct SseConnector {
    client: reqwest::Client,
    base_url: Url,
}

impl SseConnector {
    pub fn new(base_url: Url) -> Result<Self, TransportError> {
        // No overall timeout: the response body is the long-lived stream.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .no_proxy()
            .build()?;
        Ok(Self { client, base_url })
    }

    pub fn events_url(&self, scope: &str) -> Result<Url, TransportError> {
        let mut url = self.base_url.join("api/events")?;
        url.query_pairs_mut().append_pair("token", scope);
        Ok(url)
    }
}

#[async_trait]
impl Connector for SseConnector {
    async fn connect(&self, scope: &str) -> Result<Box<dyn EventStream>, TransportError> {
        let url = self.events_url(scope)?;
        let mut source = EventSource::new(self.client.get(url))
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        // Reconnect timing belongs to the supervisor.
        source.set_retry_policy(Box::new(Never));
        let mut source = Box::pin(source);

        match source.next().await {
            Some(Ok(Event::Open)) => Ok(Box::new(SseStream {
                source,
                pending: None,
            })),
            Some(Ok(Event::Message(message))) => Ok(Box::new(SseStream {
                source,
                pending: decode_frame("sse", &message.data),
            })),
            Some(Err(err)) => Err(TransportError::Connect(err.to_string())),
            None => Err(TransportError::Connect("event source ended before open".into())),
        }
    }

    fn name(&self) -> &'static str {
        "sse"
    }
}

/// Dropping the stream drops the underlying response and closes the socket.
struct SseStream {
    source: Pin<Box<EventSource>>,
    pending: Option<ServerMessage>,
}

#[async_trait]
impl EventStream for SseStream {
    async fn next_message(&mut self) -> Result<Option<ServerMessage>, TransportError> {
        if let Some(message) = self.pending.take() {
            return Ok(Some(message));
        }
        loop {
            match self.source.next().await {
                Some(Ok(Event::Open)) => continue,
                Some(Ok(Event::Message(message))) => {
                    if let Some(decoded) = decode_frame("sse", &message.data) {
                        return Ok(Some(decoded));
                    }
                }
                Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => return Ok(None),
                Some(Err(err)) => return Err(TransportError::Stream(err.to_string())),
            }
        }
    }
}
