//! Durable log of session metadata and transcript chunks, partitioned by scope.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod memory;
mod sqlite;

pub use memory::InMemoryLogStore;
pub use sqlite::{SCHEMA_VERSION, SqliteLogStore};

/// One metadata row per (scope, session); last write wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub scope: String,
    pub session_id: String,
    pub name: Option<String>,
    pub app_scope: Option<String>,
    /// Milliseconds since the unix epoch.
    pub updated_at: i64,
}

impl SessionRecord {
    pub fn new(scope: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            session_id: session_id.into(),
            name: None,
            app_scope: None,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn with_app_scope(mut self, app_scope: Option<String>) -> Self {
        self.app_scope = app_scope;
        self
    }

    /// `scope:session_id`, the primary key of the metadata table.
    pub fn composite_key(&self) -> String {
        composite_key(&self.scope, &self.session_id)
    }
}

pub fn composite_key(scope: &str, session_id: &str) -> String {
    format!("{scope}:{session_id}")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Persistence backend for the mirror. Every multi-row operation is atomic.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn load_sessions(&self, scope: &str) -> Result<Vec<SessionRecord>, StoreError>;

    async fn save_session_meta(&self, record: SessionRecord) -> Result<(), StoreError>;

    async fn append_chunk(
        &self,
        scope: &str,
        session_id: &str,
        content: &str,
    ) -> Result<(), StoreError>;

    /// Concatenation of a session's chunks in insertion order.
    async fn load_session_output(
        &self,
        scope: &str,
        session_id: &str,
    ) -> Result<String, StoreError>;

    async fn load_all_outputs(&self, scope: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Removes the metadata row and every chunk of the session.
    async fn delete_session(&self, scope: &str, session_id: &str) -> Result<(), StoreError>;

    /// Removes every row, in both tables, whose scope differs from `current_scope`.
    async fn delete_stale_scopes(&self, current_scope: &str) -> Result<(), StoreError>;
}
