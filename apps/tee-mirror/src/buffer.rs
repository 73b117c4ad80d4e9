//! Per-session transcript accumulation and incremental flush to the log.

use std::collections::BTreeMap;

use crate::store::{LogStore, SessionRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferEntry {
    full_text: String,
    flushed_len: usize,
}

impl BufferEntry {
    pub fn full_text(&self) -> &str {
        &self.full_text
    }

    pub fn flushed_len(&self) -> usize {
        self.flushed_len
    }

    /// The suffix not yet written to the log.
    pub fn pending(&self) -> &str {
        &self.full_text[self.flushed_len..]
    }
}

/// Outcome of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub chunks_written: usize,
    pub bytes_written: usize,
    pub failures: usize,
}

#[derive(Debug, Default)]
pub struct OutputBuffer {
    entries: BTreeMap<String, BufferEntry>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, session_id: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        self.entries
            .entry(session_id.to_string())
            .or_default()
            .full_text
            .push_str(text);
    }

    /// Primes a session with history already in the log, so nothing is pending.
    pub fn seed(&mut self, session_id: &str, transcript: String) {
        let flushed_len = transcript.len();
        self.entries.insert(
            session_id.to_string(),
            BufferEntry {
                full_text: transcript,
                flushed_len,
            },
        );
    }

    pub fn clear(&mut self, session_id: &str) -> bool {
        self.entries.remove(session_id).is_some()
    }

    pub fn entry(&self, session_id: &str) -> Option<&BufferEntry> {
        self.entries.get(session_id)
    }

    pub fn transcript(&self, session_id: &str) -> Option<&str> {
        self.entries.get(session_id).map(|entry| entry.full_text.as_str())
    }

    pub fn flushed_len(&self, session_id: &str) -> usize {
        self.entries
            .get(session_id)
            .map(|entry| entry.flushed_len)
            .unwrap_or(0)
    }

    pub fn pending(&self, session_id: &str) -> &str {
        self.entries
            .get(session_id)
            .map(BufferEntry::pending)
            .unwrap_or("")
    }

    pub fn has_pending(&self) -> bool {
        self.entries
            .values()
            .any(|entry| entry.full_text.len() > entry.flushed_len)
    }

    pub fn session_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Advances the watermark; never moves it backwards or past the text.
    pub fn mark_flushed(&mut self, session_id: &str, len: usize) {
        if let Some(entry) = self.entries.get_mut(session_id) {
            let len = len.min(entry.full_text.len());
            if len > entry.flushed_len {
                entry.flushed_len = len;
            }
        }
    }

    /// Writes each session's unflushed suffix as one chunk and refreshes its
    /// metadata row. A failed chunk write leaves the watermark in place so the
    /// same suffix is retried by the next flush.
    pub async fn flush<F>(&mut self, scope: &str, store: &dyn LogStore, record_for: F) -> FlushReport
    where
        F: Fn(&str) -> SessionRecord,
    {
        let mut report = FlushReport::default();
        let dirty: Vec<(String, usize, String)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.full_text.len() > entry.flushed_len)
            .map(|(id, entry)| (id.clone(), entry.full_text.len(), entry.pending().to_string()))
            .collect();

        for (session_id, target_len, delta) in dirty {
            if let Err(err) = store.append_chunk(scope, &session_id, &delta).await {
                report.failures += 1;
                tracing::warn!(
                    target: "mirror.flush",
                    session_id = %session_id,
                    bytes = delta.len(),
                    error = %err,
                    "failed to persist transcript chunk"
                );
                continue;
            }
            self.mark_flushed(&session_id, target_len);
            report.chunks_written += 1;
            report.bytes_written += delta.len();

            if let Err(err) = store.save_session_meta(record_for(&session_id)).await {
                tracing::warn!(
                    target: "mirror.flush",
                    session_id = %session_id,
                    error = %err,
                    "failed to persist session metadata"
                );
            }
        }

        if report.chunks_written > 0 || report.failures > 0 {
            tracing::trace!(
                target: "mirror.flush",
                chunks = report.chunks_written,
                bytes = report.bytes_written,
                failures = report.failures,
                "flush pass finished"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryLogStore, StoreError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn record(scope: &str) -> impl Fn(&str) -> SessionRecord + '_ {
        move |id| SessionRecord::new(scope, id).with_name(Some(format!("name-{id}")))
    }

    #[tokio::test]
    async fn flushed_chunks_reassemble_transcript() {
        let store = InMemoryLogStore::new();
        let mut buffer = OutputBuffer::new();
        let mut expected = String::new();

        for piece in ["$ cargo", " build\n", "", "Compiling tee\n", "done ✓\n"] {
            buffer.append("s", piece);
            expected.push_str(piece);
            buffer.flush("t1", &store, record("t1")).await;
            assert_eq!(buffer.flushed_len("s"), expected.len());
            assert_eq!(buffer.pending("s"), "");
        }

        assert_eq!(store.chunks("t1", "s").concat(), expected);
        assert_eq!(store.chunk_count("t1", "s"), 4);
        let meta = store.load_sessions("t1").await.unwrap();
        assert_eq!(meta[0].name.as_deref(), Some("name-s"));
    }

    #[tokio::test]
    async fn second_flush_without_append_writes_nothing() {
        let store = InMemoryLogStore::new();
        let mut buffer = OutputBuffer::new();
        buffer.append("s", "abc");

        let first = buffer.flush("t1", &store, record("t1")).await;
        let second = buffer.flush("t1", &store, record("t1")).await;

        assert_eq!(first.chunks_written, 1);
        assert_eq!(second, FlushReport::default());
        assert_eq!(store.chunk_count("t1", "s"), 1);
    }

    #[tokio::test]
    async fn seeded_history_has_nothing_pending() {
        let store = InMemoryLogStore::new();
        store.append_chunk("t1", "s", "abc").await.unwrap();
        store.append_chunk("t1", "s", "def").await.unwrap();

        let mut buffer = OutputBuffer::new();
        let transcript = store.load_session_output("t1", "s").await.unwrap();
        assert_eq!(transcript, "abcdef");
        buffer.seed("s", transcript);

        assert_eq!(buffer.flushed_len("s"), 6);
        let report = buffer.flush("t1", &store, record("t1")).await;
        assert_eq!(report.chunks_written, 0);
        assert_eq!(store.chunk_count("t1", "s"), 2);

        buffer.append("s", "g");
        buffer.flush("t1", &store, record("t1")).await;
        assert_eq!(store.chunks("t1", "s"), vec!["abc", "def", "g"]);
    }

    #[test]
    fn watermark_is_monotonic_and_bounded() {
        let mut buffer = OutputBuffer::new();
        buffer.append("s", "hello");
        buffer.mark_flushed("s", 3);
        buffer.mark_flushed("s", 1);
        assert_eq!(buffer.flushed_len("s"), 3);
        buffer.mark_flushed("s", 99);
        assert_eq!(buffer.flushed_len("s"), 5);
        assert!(!buffer.has_pending());
    }

    #[test]
    fn clear_drops_session() {
        let mut buffer = OutputBuffer::new();
        buffer.append("a", "x");
        buffer.append("b", "y");
        assert!(buffer.clear("a"));
        assert!(!buffer.clear("a"));
        assert_eq!(buffer.transcript("a"), None);
        assert_eq!(buffer.session_ids().collect::<Vec<_>>(), vec!["b"]);
    }

    /// Rejects chunk writes while `failing` is set.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryLogStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl LogStore for FlakyStore {
        async fn load_sessions(&self, scope: &str) -> Result<Vec<SessionRecord>, StoreError> {
            self.inner.load_sessions(scope).await
        }
        async fn save_session_meta(&self, record: SessionRecord) -> Result<(), StoreError> {
            self.inner.save_session_meta(record).await
        }
        async fn append_chunk(&self, scope: &str, id: &str, content: &str) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("quota exceeded".into()));
            }
            self.inner.append_chunk(scope, id, content).await
        }
        async fn load_session_output(&self, scope: &str, id: &str) -> Result<String, StoreError> {
            self.inner.load_session_output(scope, id).await
        }
        async fn load_all_outputs(
            &self,
            scope: &str,
        ) -> Result<HashMap<String, String>, StoreError> {
            self.inner.load_all_outputs(scope).await
        }
        async fn delete_session(&self, scope: &str, id: &str) -> Result<(), StoreError> {
            self.inner.delete_session(scope, id).await
        }
        async fn delete_stale_scopes(&self, scope: &str) -> Result<(), StoreError> {
            self.inner.delete_stale_scopes(scope).await
        }
    }

    #[tokio::test]
    async fn failed_write_is_retried_without_gaps() {
        let store = FlakyStore::default();
        let mut buffer = OutputBuffer::new();
        buffer.append("s", "one ");
        buffer.flush("t1", &store, record("t1")).await;

        store.failing.store(true, Ordering::SeqCst);
        buffer.append("s", "two ");
        let report = buffer.flush("t1", &store, record("t1")).await;
        assert_eq!(report.failures, 1);
        assert_eq!(buffer.pending("s"), "two ");

        store.failing.store(false, Ordering::SeqCst);
        buffer.append("s", "three");
        buffer.flush("t1", &store, record("t1")).await;

        assert_eq!(
            store.inner.chunks("t1", "s"),
            vec!["one ".to_string(), "two three".to_string()]
        );
        assert_eq!(buffer.transcript("s"), Some("one two three"));
    }
}
