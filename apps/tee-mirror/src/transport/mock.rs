//! Scripted connector for exercising the supervisor and engine without a relay.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tee_protocol::ServerMessage;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{Connector, EventStream, TransportError};

pub enum MockOutcome {
    Refuse(String),
    Accept(MockStream),
}

/// Test-side end of a scripted stream.
#[derive(Clone)]
pub struct MockFeed {
    tx: mpsc::UnboundedSender<Result<ServerMessage, TransportError>>,
}

impl MockFeed {
    pub fn push(&self, message: ServerMessage) -> bool {
        self.tx.send(Ok(message)).is_ok()
    }

    pub fn fail(&self, reason: &str) -> bool {
        self.tx
            .send(Err(TransportError::Stream(reason.to_string())))
            .is_ok()
    }

    /// True while the supervisor still holds the matching stream.
    pub fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }
}

pub struct MockStream {
    rx: mpsc::UnboundedReceiver<Result<ServerMessage, TransportError>>,
}

pub fn mock_stream() -> (MockFeed, MockStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MockFeed { tx }, MockStream { rx })
}

#[async_trait]
impl EventStream for MockStream {
    async fn next_message(&mut self) -> Result<Option<ServerMessage>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}

#[derive(Default)]
struct MockState {
    script: VecDeque<MockOutcome>,
    attempts: Vec<(Instant, String)>,
}

/// Plays back queued outcomes, one per connect attempt. An empty script
/// refuses every attempt.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_next(&self, reason: &str) {
        self.state
            .lock()
            .script
            .push_back(MockOutcome::Refuse(reason.to_string()));
    }

    /// Queues an accepted connection and returns its feed.
    pub fn accept_next(&self) -> MockFeed {
        let (feed, stream) = mock_stream();
        self.state
            .lock()
            .script
            .push_back(MockOutcome::Accept(stream));
        feed
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.state.lock().attempts.iter().map(|(at, _)| *at).collect()
    }

    pub fn attempt_count(&self) -> usize {
        self.state.lock().attempts.len()
    }

    pub fn scopes(&self) -> Vec<String> {
        self.state
            .lock()
            .attempts
            .iter()
            .map(|(_, scope)| scope.clone())
            .collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, scope: &str) -> Result<Box<dyn EventStream>, TransportError> {
        let outcome = {
            let mut state = self.state.lock();
            state.attempts.push((Instant::now(), scope.to_string()));
            state.script.pop_front()
        };
        match outcome {
            Some(MockOutcome::Accept(stream)) => Ok(Box::new(stream)),
            Some(MockOutcome::Refuse(reason)) => Err(TransportError::Connect(reason)),
            None => Err(TransportError::Connect("no scripted connection".into())),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
