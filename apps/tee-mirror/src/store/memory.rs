use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{LogStore, SessionRecord, StoreError, composite_key};

#[derive(Debug, Clone)]
struct ChunkRow {
    scope: String,
    session_id: String,
    content: String,
}

#[derive(Debug, Default)]
struct Tables {
    sessions: HashMap<String, SessionRecord>,
    chunks: Vec<ChunkRow>,
}

/// Volatile backend with the same semantics as the sqlite log. Used when no
/// database path is configured and throughout the tests.
#[derive(Debug, Default)]
pub struct InMemoryLogStore {
    tables: Mutex<Tables>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk_count(&self, scope: &str, session_id: &str) -> usize {
        self.tables
            .lock()
            .chunks
            .iter()
            .filter(|row| row.scope == scope && row.session_id == session_id)
            .count()
    }

    pub fn chunks(&self, scope: &str, session_id: &str) -> Vec<String> {
        self.tables
            .lock()
            .chunks
            .iter()
            .filter(|row| row.scope == scope && row.session_id == session_id)
            .map(|row| row.content.clone())
            .collect()
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn load_sessions(&self, scope: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let tables = self.tables.lock();
        let mut rows: Vec<SessionRecord> = tables
            .sessions
            .values()
            .filter(|record| record.scope == scope)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(rows)
    }

    async fn save_session_meta(&self, record: SessionRecord) -> Result<(), StoreError> {
        self.tables
            .lock()
            .sessions
            .insert(record.composite_key(), record);
        Ok(())
    }

    async fn append_chunk(
        &self,
        scope: &str,
        session_id: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        self.tables.lock().chunks.push(ChunkRow {
            scope: scope.to_string(),
            session_id: session_id.to_string(),
            content: content.to_string(),
        });
        Ok(())
    }

    async fn load_session_output(
        &self,
        scope: &str,
        session_id: &str,
    ) -> Result<String, StoreError> {
        Ok(self.chunks(scope, session_id).concat())
    }

    async fn load_all_outputs(&self, scope: &str) -> Result<HashMap<String, String>, StoreError> {
        let tables = self.tables.lock();
        let mut outputs: HashMap<String, String> = HashMap::new();
        for row in tables.chunks.iter().filter(|row| row.scope == scope) {
            outputs
                .entry(row.session_id.clone())
                .or_default()
                .push_str(&row.content);
        }
        Ok(outputs)
    }

    async fn delete_session(&self, scope: &str, session_id: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        tables.sessions.remove(&composite_key(scope, session_id));
        tables
            .chunks
            .retain(|row| !(row.scope == scope && row.session_id == session_id));
        Ok(())
    }

    async fn delete_stale_scopes(&self, current_scope: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        tables
            .sessions
            .retain(|_, record| record.scope == current_scope);
        tables.chunks.retain(|row| row.scope == current_scope);
        Ok(())
    }
}
