//! Streaming Capture (C9): a process-local in-memory buffer for chunked
//! agent output, finalized into a `Memory` on demand or by TTL eviction.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::error::{Result, StoreError};
use crate::model::{Memory, MemoryType, Scope};
use crate::store::{AddOptions, Store, UpsertOutcome};

/// §3 "StreamBuffer ... TTL = 1h".
pub const STREAM_TTL: Duration = Duration::hours(1);

#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub memory_type: Option<MemoryType>,
    pub scope: Option<Scope>,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub tags: Vec<String>,
    pub category: Option<String>,
}

struct BufferEntry {
    chunks: Vec<String>,
    opts: StreamOptions,
    created_at: DateTime<Utc>,
    last_chunk_at: DateTime<Utc>,
}

/// Process-wide buffer map (§5 "the in-memory StreamBuffer map ... is
/// process-wide with the same discipline" as the SSE connections map — a
/// single mutex serializes reads/writes, mirroring `dashmap`-free teacher
/// code that guards shared maps with a `Mutex`).
pub struct StreamBuffer {
    entries: Mutex<HashMap<String, BufferEntry>>,
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// §4.9 "Start(opts) -> id".
    pub fn start(&self, opts: StreamOptions, now: DateTime<Utc>) -> String {
        let id = crate::id::new_id();
        let mut guard = self.entries.lock().expect("stream buffer mutex poisoned");
        guard.insert(
            id.clone(),
            BufferEntry { chunks: Vec::new(), opts, created_at: now, last_chunk_at: now },
        );
        id
    }

    /// §4.9 "Append(id, chunk) fails if unknown/expired".
    pub fn append(&self, id: &str, chunk: &str, now: DateTime<Utc>) -> Result<()> {
        let mut guard = self.entries.lock().expect("stream buffer mutex poisoned");
        let entry = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("STREAM_NOT_FOUND", format!("no stream buffer '{id}'")))?;
        if now - entry.last_chunk_at > STREAM_TTL {
            guard.remove(id);
            return Err(StoreError::not_found("STREAM_NOT_FOUND", format!("stream buffer '{id}' expired")));
        }
        entry.chunks.push(chunk.to_string());
        entry.last_chunk_at = now;
        Ok(())
    }

    /// §4.9 "Cancel(id)".
    pub fn cancel(&self, id: &str) {
        let mut guard = self.entries.lock().expect("stream buffer mutex poisoned");
        guard.remove(id);
    }

    /// §4.9 "Finalize(id) -> Memory | null ... joins chunks, trims, returns
    /// null if empty; otherwise delegates to Memory.Add".
    pub fn finalize(
        &self,
        store: &Store,
        id: &str,
        ttl_hours: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<Memory>> {
        let entry = {
            let mut guard = self.entries.lock().expect("stream buffer mutex poisoned");
            guard.remove(id)
        };
        let Some(entry) = entry else {
            return Err(StoreError::not_found("STREAM_NOT_FOUND", format!("no stream buffer '{id}'")));
        };

        let joined = entry.chunks.join("");
        if joined.trim().is_empty() {
            return Ok(None);
        }

        let add_opts = AddOptions {
            memory_type: entry.opts.memory_type,
            scope: entry.opts.scope,
            project_id: entry.opts.project_id,
            user_id: entry.opts.user_id,
            tags: entry.opts.tags,
            category: entry.opts.category,
            ..Default::default()
        };
        let (memory, _outcome): (Memory, UpsertOutcome) = store.add(&joined, add_opts, ttl_hours, now)?;
        Ok(Some(memory))
    }

    /// Background cleanup (§4.9 "a background cleanup runs every 5 minutes
    /// and evicts entries idle > TTL"). Returns the count evicted.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut guard = self.entries.lock().expect("stream buffer mutex poisoned");
        let before = guard.len();
        guard.retain(|_, entry| now - entry.last_chunk_at <= STREAM_TTL);
        before - guard.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("stream buffer mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Convenience wrapper pairing a `StreamBuffer` with the interval used by the
/// background cleanup task (§4.9).
pub struct StreamCapture {
    pub buffer: StreamBuffer,
}

impl Default for StreamCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamCapture {
    pub fn new() -> Self {
        Self { buffer: StreamBuffer::new() }
    }

    pub const CLEANUP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5 * 60);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use chrono::TimeZone;
    use rusqlite::Connection;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn start_append_finalize_produces_memory() {
        let conn = Connection::open_in_memory().unwrap();
        schema::ensure(&conn).unwrap();
        let store = Store::new(&conn);
        let buf = StreamBuffer::new();

        let id = buf.start(StreamOptions::default(), now());
        buf.append(&id, "Hello, ", now()).unwrap();
        buf.append(&id, "world!", now()).unwrap();

        let memory = buf.finalize(&store, &id, 24.0, now()).unwrap().unwrap();
        assert_eq!(memory.content, "Hello, world!");
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn finalize_empty_buffer_returns_none() {
        let conn = Connection::open_in_memory().unwrap();
        schema::ensure(&conn).unwrap();
        let store = Store::new(&conn);
        let buf = StreamBuffer::new();

        let id = buf.start(StreamOptions::default(), now());
        let result = buf.finalize(&store, &id, 24.0, now()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn append_to_unknown_id_fails() {
        let buf = StreamBuffer::new();
        let err = buf.append("doesnotexist", "x", now()).unwrap_err();
        assert_eq!(err.code(), "STREAM_NOT_FOUND");
    }

    #[test]
    fn append_after_ttl_expiry_fails_and_evicts() {
        let buf = StreamBuffer::new();
        let id = buf.start(StreamOptions::default(), now());
        let later = now() + STREAM_TTL + Duration::seconds(1);
        let err = buf.append(&id, "late", later).unwrap_err();
        assert_eq!(err.code(), "STREAM_NOT_FOUND");
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn cancel_removes_buffer() {
        let buf = StreamBuffer::new();
        let id = buf.start(StreamOptions::default(), now());
        buf.cancel(&id);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn evict_expired_removes_idle_entries_only() {
        let buf = StreamBuffer::new();
        let stale = buf.start(StreamOptions::default(), now());
        let fresh_start = now() + STREAM_TTL / 2;
        let fresh = buf.start(StreamOptions::default(), fresh_start);
        let _ = stale;

        let later = now() + STREAM_TTL + Duration::seconds(1);
        let evicted = buf.evict_expired(later);
        assert_eq!(evicted, 1);
        assert_eq!(buf.len(), 1);
        buf.append(&fresh, "still alive", later).unwrap();
    }
}
