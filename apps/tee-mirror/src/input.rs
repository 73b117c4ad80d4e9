//! Outbound input submission. Failures are reported to the caller and logged;
//! nothing is retried automatically.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tee_protocol::{ClientMessage, InputRequest};
use thiserror::Error;
use url::Url;

use crate::transport::OutboundSlot;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("no live socket to write to")]
    NotConnected,
    #[error("failed to encode input: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid input endpoint: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("mirror has shut down")]
    Closed,
}

#[async_trait]
pub trait InputSender: Send + Sync {
    async fn send(&self, scope: &str, session_id: &str, content: &str) -> Result<(), InputError>;
}

/// `POST {base}/api/input` with `{token, session_id, content}`.
pub struct HttpInputSender {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpInputSender {
    pub fn new(base_url: &Url) -> Result<Self, InputError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            endpoint: base_url.join("api/input")?,
        })
    }
}

#[async_trait]
impl InputSender for HttpInputSender {
    async fn send(&self, scope: &str, session_id: &str, content: &str) -> Result<(), InputError> {
        let request = InputRequest {
            token: scope.to_string(),
            session_id: session_id.to_string(),
            content: content.to_string(),
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(InputError::HttpStatus(response.status()));
        }
        Ok(())
    }
}

/// Writes `ClientMessage::Input` frames to the live websocket.
pub struct SocketInputSender {
    outbound: OutboundSlot,
}

impl SocketInputSender {
    pub fn new(outbound: OutboundSlot) -> Self {
        Self { outbound }
    }
}

#[async_trait]
impl InputSender for SocketInputSender {
    async fn send(&self, _scope: &str, session_id: &str, content: &str) -> Result<(), InputError> {
        let frame = serde_json::to_string(&ClientMessage::input(session_id, content))?;
        if self.outbound.send(frame) {
            Ok(())
        } else {
            Err(InputError::NotConnected)
        }
    }
}
