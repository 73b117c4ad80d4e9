//! The synchronization engine.
//!
//! One task owns the [`SessionRegistry`] and the [`OutputBuffer`]. Everything
//! that mutates them (transport events, user actions, flush ticks) is funnelled
//! into that task, so ordering is the arrival order of the transport and no
//! locks guard engine state. Consumers observe through a watch channel and the
//! [`OutputBus`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tee_protocol::ServerMessage;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::buffer::{FlushReport, OutputBuffer};
use crate::config::MirrorConfig;
use crate::input::{InputError, InputSender};
use crate::session::{
    EndOutcome, OutputBus, OutputChunk, OutputListener, RegistrySnapshot, Session,
    SessionRegistry, Subscription,
};
use crate::store::{LogStore, SessionRecord};
use crate::transport::{Connector, Supervisor, SupervisorHandle, TransportEvent};

const EVENT_CAPACITY: usize = 256;
const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("mirror has shut down")]
    Closed,
}

enum Command {
    Remove {
        session_id: String,
        reply: oneshot::Sender<bool>,
    },
    InputFailed {
        session_id: String,
    },
    Transcript {
        session_id: String,
        reply: oneshot::Sender<Option<String>>,
    },
    Flush {
        reply: oneshot::Sender<FlushReport>,
    },
    Shutdown {
        reply: oneshot::Sender<FlushReport>,
    },
}

pub struct Mirror;

impl Mirror {
    /// Cleans stale scopes and primes state from the log before the transport
    /// is allowed to deliver anything, then spawns the supervisor and the engine.
    pub async fn start(
        config: MirrorConfig,
        scope: impl Into<String>,
        store: Arc<dyn LogStore>,
        connector: Arc<dyn Connector>,
        input: Arc<dyn InputSender>,
    ) -> MirrorHandle {
        let scope: String = scope.into();

        if let Err(err) = store.delete_stale_scopes(&scope).await {
            tracing::warn!(target: "mirror.store", error = %err, "stale scope cleanup failed");
        }

        let mut registry = SessionRegistry::new();
        let mut buffer = OutputBuffer::new();
        prime(&scope, store.as_ref(), &mut registry, &mut buffer).await;

        let (snapshot_tx, snapshot_rx) = watch::channel(registry.snapshot());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let bus = OutputBus::new();

        // The supervisor only queues events until the engine task drains them.
        let (supervisor, supervisor_task) =
            Supervisor::spawn(connector, scope.clone(), config.reconnect_delay, event_tx);
        let engine = Engine {
            scope: scope.clone(),
            retain_ended: config.retain_ended_sessions,
            store,
            registry,
            buffer,
            bus: bus.clone(),
            snapshots: snapshot_tx,
            supervisor: supervisor.clone(),
        };
        let engine_task = tokio::spawn(engine.run(event_rx, command_rx, config.flush_interval));

        MirrorHandle {
            scope: Arc::from(scope),
            commands: command_tx,
            sessions: snapshot_rx,
            bus,
            supervisor,
            input,
            tasks: Arc::new(Mutex::new(vec![supervisor_task, engine_task])),
        }
    }
}

async fn prime(
    scope: &str,
    store: &dyn LogStore,
    registry: &mut SessionRegistry,
    buffer: &mut OutputBuffer,
) {
    match store.load_sessions(scope).await {
        Ok(records) => {
            for record in records {
                registry.restore(Session {
                    id: record.session_id,
                    name: record.name,
                    status: Default::default(),
                    app_scope: record.app_scope,
                });
            }
        }
        Err(err) => {
            tracing::warn!(target: "mirror.store", error = %err, "failed to load session metadata");
        }
    }

    match store.load_all_outputs(scope).await {
        Ok(outputs) => {
            for (session_id, transcript) in outputs {
                if !registry.contains(&session_id) {
                    registry.restore(Session::new(session_id.clone()));
                }
                buffer.seed(&session_id, transcript);
            }
        }
        Err(err) => {
            tracing::warn!(target: "mirror.store", error = %err, "failed to load transcripts");
        }
    }

    tracing::debug!(target: "mirror.registry", sessions = registry.len(), "primed from log");
}

struct Engine {
    scope: String,
    retain_ended: bool,
    store: Arc<dyn LogStore>,
    registry: SessionRegistry,
    buffer: OutputBuffer,
    bus: OutputBus,
    snapshots: watch::Sender<RegistrySnapshot>,
    supervisor: SupervisorHandle,
}

/// Whether the engine loop keeps running after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

impl Engine {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<TransportEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        flush_interval: Duration,
    ) {
        let flush_interval = if flush_interval.is_zero() {
            tracing::warn!(
                target: "mirror.flush",
                fallback_ms = MIN_FLUSH_INTERVAL.as_millis() as u64,
                "zero flush interval; using fallback"
            );
            MIN_FLUSH_INTERVAL
        } else {
            flush_interval
        };
        let mut ticker = interval_at(Instant::now() + flush_interval, flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut transport_open = true;

        loop {
            tokio::select! {
                event = events.recv(), if transport_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        transport_open = false;
                        self.set_connected(false);
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await == Flow::Stop {
                            break;
                        }
                    }
                    None => {
                        self.flush().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }
        tracing::debug!(target: "mirror.registry", "engine stopped");
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.set_connected(true),
            TransportEvent::Disconnected { .. } => self.set_connected(false),
            TransportEvent::Message(message) => self.handle_message(message).await,
        }
    }

    async fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Output {
                session_id,
                content,
                ..
            } => {
                let before = self.registry.get(&session_id).map(|session| session.status);
                self.registry.touch_output(&session_id);
                self.buffer.append(&session_id, &content);
                self.bus.publish(&OutputChunk {
                    session_id: session_id.clone(),
                    content,
                });
                let after = self.registry.get(&session_id).map(|session| session.status);
                if before != after {
                    self.publish();
                }
            }
            ServerMessage::SessionStart {
                session_id,
                name,
                app_root,
                ..
            } => {
                let created = self.registry.start(&session_id, name, app_root);
                tracing::debug!(target: "mirror.registry", session_id = %session_id, created, "session start");
                self.publish();
                if let Some(record) = self.record_for(&session_id) {
                    if let Err(err) = self.store.save_session_meta(record).await {
                        tracing::warn!(target: "mirror.store", session_id = %session_id, error = %err, "failed to persist session metadata");
                    }
                }
            }
            ServerMessage::SessionEnd { session_id, .. } => {
                match self.registry.end(&session_id, self.retain_ended) {
                    EndOutcome::Removed => {
                        tracing::debug!(target: "mirror.registry", session_id = %session_id, "session ended");
                        self.purge(&session_id).await;
                        self.publish();
                    }
                    EndOutcome::Retained => {
                        tracing::debug!(target: "mirror.registry", session_id = %session_id, "session ended; kept as done");
                        self.publish();
                    }
                    EndOutcome::Unknown => {}
                }
            }
            message @ ServerMessage::ActiveSessions { .. } => {
                let snapshot = message.snapshot().unwrap_or_default();
                let removed = self.registry.reconcile(&snapshot);
                if !removed.is_empty() {
                    tracing::info!(
                        target: "mirror.registry",
                        removed = removed.len(),
                        live = snapshot.len(),
                        "reconciled against snapshot"
                    );
                }
                for session_id in &removed {
                    self.purge(session_id).await;
                }
                self.publish();
            }
            ServerMessage::Unknown => {}
        }
    }

    async fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Remove { session_id, reply } => {
                let existed = self.registry.remove(&session_id).is_some();
                self.purge(&session_id).await;
                if existed {
                    self.publish();
                }
                let _ = reply.send(existed);
            }
            Command::InputFailed { session_id } => {
                if self.registry.mark_error(&session_id) {
                    self.publish();
                }
            }
            Command::Transcript { session_id, reply } => {
                let transcript = self.buffer.transcript(&session_id).map(str::to_string);
                let _ = reply.send(transcript);
            }
            Command::Flush { reply } => {
                let report = self.flush().await;
                let _ = reply.send(report);
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(self.flush().await);
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Drops a session's buffer and its persisted rows.
    async fn purge(&mut self, session_id: &str) {
        self.buffer.clear(session_id);
        self.supervisor.forget_session(session_id);
        if let Err(err) = self.store.delete_session(&self.scope, session_id).await {
            tracing::warn!(target: "mirror.store", session_id = %session_id, error = %err, "failed to delete persisted session");
        }
    }

    async fn flush(&mut self) -> FlushReport {
        let scope = self.scope.as_str();
        let registry = &self.registry;
        self.buffer
            .flush(scope, self.store.as_ref(), |session_id| {
                record_from(scope, session_id, registry.get(session_id))
            })
            .await
    }

    fn record_for(&self, session_id: &str) -> Option<SessionRecord> {
        self.registry
            .get(session_id)
            .map(|session| record_from(&self.scope, session_id, Some(session)))
    }

    fn set_connected(&mut self, connected: bool) {
        if self.registry.set_connected(connected) {
            self.publish();
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.registry.snapshot());
    }
}

fn record_from(scope: &str, session_id: &str, session: Option<&Session>) -> SessionRecord {
    SessionRecord::new(scope, session_id)
        .with_name(session.and_then(|session| session.name.clone()))
        .with_app_scope(session.and_then(|session| session.app_scope.clone()))
}

/// Cloneable front door to a running engine.
#[derive(Clone)]
pub struct MirrorHandle {
    scope: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    sessions: watch::Receiver<RegistrySnapshot>,
    bus: OutputBus,
    supervisor: SupervisorHandle,
    input: Arc<dyn InputSender>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MirrorHandle {
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Registry snapshots; a new value is published after every change.
    pub fn sessions(&self) -> watch::Receiver<RegistrySnapshot> {
        self.sessions.clone()
    }

    pub fn subscribe<L>(&self, session_id: &str, listener: L) -> Subscription
    where
        L: OutputListener + 'static,
    {
        self.bus.subscribe(session_id, listener)
    }

    pub fn subscribe_all<L>(&self, listener: L) -> Subscription
    where
        L: OutputListener + 'static,
    {
        self.bus.subscribe_all(listener)
    }

    /// Local removal: drops the session, its buffer and its persisted rows.
    pub async fn remove(&self, session_id: &str) -> Result<bool, MirrorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Remove {
            session_id: session_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| MirrorError::Closed)
    }

    /// Submits input for a session. A failure is logged and marks the session
    /// as errored; nothing is rolled back or retried.
    pub async fn send_input(&self, session_id: &str, content: &str) -> Result<(), InputError> {
        match self.input.send(&self.scope, session_id, content).await {
            Ok(()) => {
                tracing::debug!(target: "mirror.input", session_id = %session_id, bytes = content.len(), "input delivered");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(target: "mirror.input", session_id = %session_id, error = %err, "input submission failed");
                self.send(Command::InputFailed {
                    session_id: session_id.to_string(),
                })
                .map_err(|_| InputError::Closed)?;
                Err(err)
            }
        }
    }

    /// Full accumulated transcript, history included.
    pub async fn transcript(&self, session_id: &str) -> Result<Option<String>, MirrorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Transcript {
            session_id: session_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| MirrorError::Closed)
    }

    pub async fn flush_now(&self) -> Result<FlushReport, MirrorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Flush { reply })?;
        rx.await.map_err(|_| MirrorError::Closed)
    }

    pub fn reconnect_now(&self) {
        self.supervisor.connect_now();
    }

    /// Stops the transport, runs the final flush and waits for both tasks.
    pub async fn shutdown(&self) -> Result<FlushReport, MirrorError> {
        self.supervisor.shutdown();
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply })?;
        let report = rx.await.map_err(|_| MirrorError::Closed)?;
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(target: "mirror.registry", error = %err, "mirror task ended abnormally");
            }
        }
        Ok(report)
    }

    fn send(&self, command: Command) -> Result<(), MirrorError> {
        self.commands.send(command).map_err(|_| MirrorError::Closed)
    }
}
