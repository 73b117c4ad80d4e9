use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, params};

use super::{LogStore, SessionRecord, StoreError, composite_key};

pub const SCHEMA_VERSION: i64 = 2;

/// Sqlite-backed log holding one long-lived connection for the lifetime of
/// the mirror. Blocking calls run on the tokio blocking pool.
#[derive(Clone)]
pub struct SqliteLogStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLogStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        schema_version(&self.conn.lock())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Unavailable(err.to_string()))?
    }
}

fn schema_version(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let mut current = schema_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchemaVersion {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }

    if current < 1 {
        conn.execute_batch(include_str!("../../migrations/0001_initial.sql"))?;
        conn.pragma_update(None, "user_version", 1)?;
        current = 1;
    }

    if current < 2 {
        conn.execute_batch(include_str!("../../migrations/0002_app_scope.sql"))?;
        conn.pragma_update(None, "user_version", 2)?;
    }

    Ok(())
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn load_sessions(&self, scope: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let scope = scope.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "
                SELECT scope, session_id, name, app_scope, updated_at
                FROM sessions
                WHERE scope = ?1
                ORDER BY session_id ASC
                ",
            )?;
            let rows = stmt.query_map(params![scope], |row| {
                Ok(SessionRecord {
                    scope: row.get(0)?,
                    session_id: row.get(1)?,
                    name: row.get(2)?,
                    app_scope: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn save_session_meta(&self, record: SessionRecord) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "
                INSERT INTO sessions (id, scope, session_id, name, app_scope, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    app_scope = excluded.app_scope,
                    updated_at = excluded.updated_at
                ",
                params![
                    record.composite_key(),
                    record.scope,
                    record.session_id,
                    record.name,
                    record.app_scope,
                    record.updated_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn append_chunk(
        &self,
        scope: &str,
        session_id: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        let (scope, session_id, content) =
            (scope.to_string(), session_id.to_string(), content.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO output_chunks (scope, session_id, content) VALUES (?1, ?2, ?3)",
                params![scope, session_id, content],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_session_output(
        &self,
        scope: &str,
        session_id: &str,
    ) -> Result<String, StoreError> {
        let (scope, session_id) = (scope.to_string(), session_id.to_string());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "
                SELECT content FROM output_chunks
                WHERE scope = ?1 AND session_id = ?2
                ORDER BY id ASC
                ",
            )?;
            let mut transcript = String::new();
            let rows = stmt.query_map(params![scope, session_id], |row| row.get::<_, String>(0))?;
            for chunk in rows {
                transcript.push_str(&chunk?);
            }
            Ok(transcript)
        })
        .await
    }

    async fn load_all_outputs(&self, scope: &str) -> Result<HashMap<String, String>, StoreError> {
        let scope = scope.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "
                SELECT session_id, content FROM output_chunks
                WHERE scope = ?1
                ORDER BY id ASC
                ",
            )?;
            let rows = stmt.query_map(params![scope], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut outputs: HashMap<String, String> = HashMap::new();
            for row in rows {
                let (session_id, content) = row?;
                outputs.entry(session_id).or_default().push_str(&content);
            }
            Ok(outputs)
        })
        .await
    }

    async fn delete_session(&self, scope: &str, session_id: &str) -> Result<(), StoreError> {
        let (scope, session_id) = (scope.to_string(), session_id.to_string());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM sessions WHERE id = ?1",
                params![composite_key(&scope, &session_id)],
            )?;
            tx.execute(
                "DELETE FROM output_chunks WHERE scope = ?1 AND session_id = ?2",
                params![scope, session_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete_stale_scopes(&self, current_scope: &str) -> Result<(), StoreError> {
        let current_scope = current_scope.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let sessions = tx.execute(
                "DELETE FROM sessions WHERE scope <> ?1",
                params![current_scope],
            )?;
            let chunks = tx.execute(
                "DELETE FROM output_chunks WHERE scope <> ?1",
                params![current_scope],
            )?;
            tx.commit()?;
            if sessions + chunks > 0 {
                tracing::debug!(
                    target: "mirror.store",
                    sessions,
                    chunks,
                    "removed rows from stale scopes"
                );
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    fn store() -> SqliteLogStore {
        SqliteLogStore::open_in_memory().expect("open in-memory sqlite")
    }

    #[tokio::test]
    async fn reload_concatenates_in_order() {
        contract::reload_concatenates_in_order(&store()).await;
    }

    #[tokio::test]
    async fn metadata_is_last_write_wins() {
        contract::metadata_is_last_write_wins(&store()).await;
    }

    #[tokio::test]
    async fn delete_session_removes_rows() {
        contract::delete_session_removes_rows(&store()).await;
    }

    #[tokio::test]
    async fn stale_scopes_are_collected() {
        contract::stale_scopes_are_collected(&store()).await;
    }

    #[tokio::test]
    async fn fresh_database_is_at_current_version() {
        assert_eq!(store().schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn upgrade_from_v1_preserves_rows_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(include_str!("../../migrations/0001_initial.sql"))
                .unwrap();
            conn.pragma_update(None, "user_version", 1).unwrap();
            conn.execute(
                "INSERT INTO sessions (id, scope, session_id, name, updated_at)
                 VALUES ('t1:s', 't1', 's', 'build', 5)",
                [],
            )
            .unwrap();
            for chunk in ["one ", "two ", "three"] {
                conn.execute(
                    "INSERT INTO output_chunks (scope, session_id, content) VALUES ('t1', 's', ?1)",
                    params![chunk],
                )
                .unwrap();
            }
        }

        let store = SqliteLogStore::open(&path).unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
        let rows = store.load_sessions("t1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name.as_deref(), Some("build"));
        assert_eq!(rows[0].app_scope, None);
        assert_eq!(rows[0].updated_at, 5);
        assert_eq!(
            store.load_session_output("t1", "s").await.unwrap(),
            "one two three"
        );
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.db");
        {
            let store = SqliteLogStore::open(&path).unwrap();
            store.append_chunk("t1", "s", "persisted").await.unwrap();
        }
        let store = SqliteLogStore::open(&path).unwrap();
        assert_eq!(
            store.load_session_output("t1", "s").await.unwrap(),
            "persisted"
        );
    }

    #[test]
    fn rejects_newer_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", 99).unwrap();
        }
        match SqliteLogStore::open(&path) {
            Err(StoreError::UnsupportedSchemaVersion { found, supported }) => {
                assert_eq!(found, 99);
                assert_eq!(supported, SCHEMA_VERSION);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("newer schema should be rejected"),
        }
    }
}
