//! Wire types shared by the session relay server and its mirroring clients.
//! Kept in a dedicated crate so server and client agree on one JSON shape
//! without pulling in either side's runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Messages pushed from the relay to a mirroring client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Raw terminal output for a session.
    Output {
        session_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        /// Per-session delivery sequence, when the relay provides one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    SessionStart {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_root: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    SessionEnd {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    /// Full snapshot of the sessions alive on the relay.
    ActiveSessions {
        #[serde(default)]
        sessions: Vec<SessionBasicInfo>,
        /// Older relays only send bare ids.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        session_ids: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBasicInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl ServerMessage {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn output(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Output {
            session_id: session_id.into(),
            content: content.into(),
            timestamp: Some(Utc::now()),
            seq: None,
        }
    }

    pub fn session_start(session_id: impl Into<String>, name: Option<String>) -> Self {
        Self::SessionStart {
            session_id: session_id.into(),
            name,
            command: None,
            app_root: None,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn session_end(session_id: impl Into<String>) -> Self {
        Self::SessionEnd {
            session_id: session_id.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn active_sessions(sessions: Vec<SessionBasicInfo>) -> Self {
        Self::ActiveSessions {
            sessions,
            session_ids: Vec::new(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Output { session_id, .. }
            | Self::SessionStart { session_id, .. }
            | Self::SessionEnd { session_id, .. } => Some(session_id),
            Self::ActiveSessions { .. } | Self::Unknown => None,
        }
    }

    /// Snapshot entries of an `active_sessions` message, merging both shapes.
    pub fn snapshot(&self) -> Option<Vec<SessionBasicInfo>> {
        let Self::ActiveSessions {
            sessions,
            session_ids,
            ..
        } = self
        else {
            return None;
        };
        let mut merged = sessions.clone();
        for id in session_ids {
            if !merged.iter().any(|info| &info.id == id) {
                merged.push(SessionBasicInfo {
                    id: id.clone(),
                    name: None,
                });
            }
        }
        Some(merged)
    }
}

/// Messages a client writes to a bidirectional socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Input { session_id: String, content: String },
}

impl ClientMessage {
    pub fn input(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Input {
            session_id: session_id.into(),
            content: content.into(),
        }
    }
}

/// Body of `POST /api/input`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequest {
    pub token: String,
    pub session_id: String,
    pub content: String,
}

/// Response of `POST /api/token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub ws_url: Option<String>,
    pub command_hint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenValidateRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenValidateResponse {
    pub valid: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}
