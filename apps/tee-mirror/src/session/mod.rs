//! Authoritative map of live sessions, mutated only by the engine in response
//! to relay messages and explicit user actions.

pub mod fanout;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tee_protocol::SessionBasicInfo;

pub use fanout::{OutputBus, OutputChunk, OutputListener, Subscription};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Idle,
    Streaming,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: Option<String>,
    pub status: SessionStatus,
    pub app_scope: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            status: SessionStatus::Idle,
            app_scope: None,
        }
    }

    /// `name (abcdef12)` or just the short id when unnamed.
    pub fn label(&self) -> String {
        let short = short_id(&self.id);
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => format!("{name} ({short})"),
            _ => short.to_string(),
        }
    }
}

/// First eight characters of a session id.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Read-only view published to consumers after every registry change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub connected: bool,
    pub sessions: Vec<Session>,
}

impl RegistrySnapshot {
    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.iter().find(|session| session.id == session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.get(session_id).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    Removed,
    Retained,
    Unknown,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<String, Session>,
    connected: bool,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.sessions.keys().map(String::as_str)
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    /// Returns true when the flag actually changed.
    pub fn set_connected(&mut self, connected: bool) -> bool {
        let changed = self.connected != connected;
        self.connected = connected;
        changed
    }

    /// Inserts a session recovered from the log.
    pub fn restore(&mut self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }

    /// Explicit start. Returns true when the session was new.
    pub fn start(
        &mut self,
        session_id: &str,
        name: Option<String>,
        app_scope: Option<String>,
    ) -> bool {
        let created = !self.sessions.contains_key(session_id);
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
        if name.is_some() {
            session.name = name;
        }
        if app_scope.is_some() {
            session.app_scope = app_scope;
        }
        session.status = SessionStatus::Idle;
        created
    }

    /// Records output for a session, creating it on first sight.
    pub fn touch_output(&mut self, session_id: &str) -> bool {
        let created = !self.sessions.contains_key(session_id);
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
        session.status = SessionStatus::Streaming;
        created
    }

    pub fn end(&mut self, session_id: &str, retain: bool) -> EndOutcome {
        if retain {
            match self.sessions.get_mut(session_id) {
                Some(session) => {
                    session.status = SessionStatus::Done;
                    EndOutcome::Retained
                }
                None => EndOutcome::Unknown,
            }
        } else if self.sessions.remove(session_id).is_some() {
            EndOutcome::Removed
        } else {
            EndOutcome::Unknown
        }
    }

    pub fn remove(&mut self, session_id: &str) -> Option<Session> {
        self.sessions.remove(session_id)
    }

    pub fn mark_error(&mut self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(session) => {
                session.status = SessionStatus::Error;
                true
            }
            None => false,
        }
    }

    /// Applies a full snapshot: unknown entries are created, names refreshed,
    /// and every local session absent from it is dropped. Returns the dropped
    /// ids so the caller can purge their buffers and log rows.
    pub fn reconcile(&mut self, snapshot: &[SessionBasicInfo]) -> Vec<String> {
        let removed: Vec<String> = self
            .sessions
            .keys()
            .filter(|id| !snapshot.iter().any(|info| &info.id == *id))
            .cloned()
            .collect();
        for id in &removed {
            self.sessions.remove(id);
        }
        for info in snapshot {
            let session = self
                .sessions
                .entry(info.id.clone())
                .or_insert_with(|| Session::new(info.id.clone()));
            if info.name.is_some() {
                session.name = info.name.clone();
            }
        }
        removed
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            connected: self.connected,
            sessions: self.sessions.values().cloned().collect(),
        }
    }
}
