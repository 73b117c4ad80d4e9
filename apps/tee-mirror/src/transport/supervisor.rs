use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use super::{Connector, Deduper, EventStream, TransportEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    ConnectNow,
    Forget(String),
    Shutdown,
}

/// Control side of a running [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SupervisorHandle {
    /// Skips any pending backoff and connects immediately. Ignored while a
    /// stream is live.
    pub fn connect_now(&self) {
        let _ = self.commands.send(Command::ConnectNow);
    }

    /// Stops tracking delivery sequence numbers for a purged session.
    pub fn forget_session(&self, session_id: &str) {
        let _ = self.commands.send(Command::Forget(session_id.to_string()));
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

enum PumpExit {
    Failed(String),
    Shutdown,
}

/// Keeps at most one stream alive and schedules exactly one reconnect attempt
/// `reconnect_delay` after each failure.
pub struct Supervisor {
    connector: Arc<dyn Connector>,
    scope: String,
    reconnect_delay: Duration,
    events: mpsc::Sender<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    dedupe: Deduper,
}

impl Supervisor {
    pub fn spawn(
        connector: Arc<dyn Connector>,
        scope: impl Into<String>,
        reconnect_delay: Duration,
        events: mpsc::Sender<TransportEvent>,
    ) -> (SupervisorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor {
            connector,
            scope: scope.into(),
            reconnect_delay,
            events,
            commands: rx,
            dedupe: Deduper::new(),
        };
        let task = tokio::spawn(supervisor.run());
        (SupervisorHandle { commands: tx }, task)
    }

    async fn run(mut self) {
        let mut retry_at: Option<Instant> = None;
        loop {
            if self.events.is_closed() {
                break;
            }
            if let Some(deadline) = retry_at.take() {
                if !self.wait_for_retry(deadline).await {
                    break;
                }
            }

            let stream = match self.connector.connect(&self.scope).await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(
                        target: "mirror.transport",
                        transport = self.connector.name(),
                        error = %err,
                        retry_in_ms = self.reconnect_delay.as_millis() as u64,
                        "connect failed"
                    );
                    retry_at = Some(Instant::now() + self.reconnect_delay);
                    continue;
                }
            };

            tracing::info!(target: "mirror.transport", transport = self.connector.name(), "connected");
            if self.events.send(TransportEvent::Connected).await.is_err() {
                break;
            }

            match self.pump(stream).await {
                PumpExit::Shutdown => break,
                PumpExit::Failed(reason) => {
                    tracing::info!(
                        target: "mirror.transport",
                        transport = self.connector.name(),
                        reason = %reason,
                        retry_in_ms = self.reconnect_delay.as_millis() as u64,
                        "disconnected"
                    );
                    if self
                        .events
                        .send(TransportEvent::Disconnected { reason })
                        .await
                        .is_err()
                    {
                        break;
                    }
                    retry_at = Some(Instant::now() + self.reconnect_delay);
                }
            }
        }
        tracing::debug!(target: "mirror.transport", "supervisor stopped");
    }

    /// Sleeps until `deadline` or a connect-now. False on shutdown.
    async fn wait_for_retry(&mut self, deadline: Instant) -> bool {
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return true,
                command = self.commands.recv() => match command {
                    Some(Command::ConnectNow) => {
                        tracing::debug!(target: "mirror.transport", "pending reconnect cancelled by connect-now");
                        return true;
                    }
                    Some(Command::Forget(session_id)) => {
                        self.dedupe.forget(&session_id);
                    }
                    Some(Command::Shutdown) | None => return false,
                },
            }
        }
    }

    async fn pump(&mut self, mut stream: Box<dyn EventStream>) -> PumpExit {
        loop {
            tokio::select! {
                next = stream.next_message() => match next {
                    Ok(Some(message)) => {
                        if !self.dedupe.admit(&message) {
                            tracing::debug!(
                                target: "mirror.transport",
                                session_id = message.session_id().unwrap_or_default(),
                                "dropping redelivered output"
                            );
                            continue;
                        }
                        if self.events.send(TransportEvent::Message(message)).await.is_err() {
                            return PumpExit::Shutdown;
                        }
                    }
                    Ok(None) => return PumpExit::Failed("stream closed by peer".into()),
                    Err(err) => return PumpExit::Failed(err.to_string()),
                },
                command = self.commands.recv() => match command {
                    Some(Command::ConnectNow) => {}
                    Some(Command::Forget(session_id)) => {
                        self.dedupe.forget(&session_id);
                    }
                    Some(Command::Shutdown) | None => return PumpExit::Shutdown,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockConnector;
    use tee_protocol::ServerMessage;

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("event before timeout")
            .expect("supervisor alive")
    }

    #[tokio::test(start_paused = true)]
    async fn stream_error_schedules_one_retry_after_delay() {
        let connector = MockConnector::new();
        let feed = connector.accept_next();
        let _second = connector.accept_next();
        let (tx, mut rx) = mpsc::channel(16);
        let (handle, task) =
            Supervisor::spawn(Arc::new(connector.clone()), "t1", Duration::from_secs(2), tx);

        assert_eq!(next_event(&mut rx).await, TransportEvent::Connected);
        let failed_at = Instant::now();
        feed.fail("reset by peer");
        assert!(matches!(
            next_event(&mut rx).await,
            TransportEvent::Disconnected { .. }
        ));
        assert_eq!(next_event(&mut rx).await, TransportEvent::Connected);

        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1] - failed_at, Duration::from_secs(2));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempt_count(), 2);
        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connects_retry_at_fixed_interval() {
        let connector = MockConnector::new();
        connector.refuse_next("down");
        connector.refuse_next("still down");
        let _live = connector.accept_next();
        let (tx, mut rx) = mpsc::channel(16);
        let start = Instant::now();
        let (handle, task) =
            Supervisor::spawn(Arc::new(connector.clone()), "t1", Duration::from_secs(2), tx);

        assert_eq!(next_event(&mut rx).await, TransportEvent::Connected);
        let offsets: Vec<Duration> = connector.attempts().iter().map(|at| *at - start).collect();
        assert_eq!(
            offsets,
            vec![Duration::ZERO, Duration::from_secs(2), Duration::from_secs(4)]
        );
        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn connect_now_cancels_pending_attempt() {
        let connector = MockConnector::new();
        let first = connector.accept_next();
        let second = connector.accept_next();
        let (tx, mut rx) = mpsc::channel(16);
        let (handle, task) =
            Supervisor::spawn(Arc::new(connector.clone()), "t1", Duration::from_secs(2), tx);

        assert_eq!(next_event(&mut rx).await, TransportEvent::Connected);
        first.fail("gone");
        assert!(matches!(
            next_event(&mut rx).await,
            TransportEvent::Disconnected { .. }
        ));

        handle.connect_now();
        assert_eq!(next_event(&mut rx).await, TransportEvent::Connected);
        assert_eq!(connector.attempt_count(), 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.attempt_count(), 2);
        assert!(second.is_live());

        handle.connect_now();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.attempt_count(), 2, "no second live stream");
        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn redelivered_output_is_dropped() {
        let connector = MockConnector::new();
        let feed = connector.accept_next();
        let (tx, mut rx) = mpsc::channel(16);
        let (handle, task) =
            Supervisor::spawn(Arc::new(connector.clone()), "t1", Duration::from_secs(2), tx);
        assert_eq!(next_event(&mut rx).await, TransportEvent::Connected);

        let sequenced = |seq: u64| ServerMessage::Output {
            session_id: "s".into(),
            content: format!("#{seq}"),
            timestamp: None,
            seq: Some(seq),
        };
        feed.push(sequenced(1));
        feed.push(sequenced(1));
        feed.push(sequenced(2));

        assert_eq!(next_event(&mut rx).await, TransportEvent::Message(sequenced(1)));
        assert_eq!(next_event(&mut rx).await, TransportEvent::Message(sequenced(2)));
        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn forgotten_session_accepts_restarted_sequence() {
        let connector = MockConnector::new();
        let feed = connector.accept_next();
        let (tx, mut rx) = mpsc::channel(16);
        let (handle, task) =
            Supervisor::spawn(Arc::new(connector.clone()), "t1", Duration::from_secs(2), tx);
        assert_eq!(next_event(&mut rx).await, TransportEvent::Connected);

        let sequenced = |seq: u64| ServerMessage::Output {
            session_id: "s".into(),
            content: format!("#{seq}"),
            timestamp: None,
            seq: Some(seq),
        };
        feed.push(sequenced(3));
        assert_eq!(next_event(&mut rx).await, TransportEvent::Message(sequenced(3)));

        handle.forget_session("s");
        tokio::time::sleep(Duration::from_millis(10)).await;
        feed.push(sequenced(1));
        assert_eq!(next_event(&mut rx).await, TransportEvent::Message(sequenced(1)));
        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn scope_is_passed_to_connector() {
        let connector = MockConnector::new();
        let _feed = connector.accept_next();
        let (tx, mut rx) = mpsc::channel(16);
        let (handle, task) =
            Supervisor::spawn(Arc::new(connector.clone()), "scope-123", Duration::from_secs(2), tx);
        next_event(&mut rx).await;
        assert_eq!(connector.scopes(), vec!["scope-123".to_string()]);
        handle.shutdown();
        task.await.unwrap();
    }
}
