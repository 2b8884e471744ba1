//! Embedding backfill (C5, §4.5): drive historical memories through the
//! embedding queue in checkpointed batches, resumable across restarts.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use mem_core::Store;

use crate::error::Result;
use crate::model::{BackfillState, BackfillStatus, JobOperation, scope_key};
use crate::queue::{EmbeddingQueue, RetryPolicy};

#[derive(Debug, Clone)]
pub struct BackfillScope {
    pub model: String,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
}

impl BackfillScope {
    fn key(&self) -> String {
        scope_key(&self.model, self.project_id.as_deref(), self.user_id.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct RunBatchResult {
    pub scanned: usize,
    pub enqueued: usize,
    pub status: BackfillStatus,
    pub completed: bool,
}

pub struct Backfill<'a> {
    conn: &'a Connection,
}

impl<'a> Backfill<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// §4.5 "Status(scope)": lazily creates an `idle` row on first read
    /// (ignore-if-exists, per the embedding schema's scope_key rationale).
    pub fn status(&self, scope: &BackfillScope, now: DateTime<Utc>) -> Result<BackfillState> {
        self.ensure_state_row(scope, now)?;
        self.load_state(scope)
    }

    /// §4.5 "SetPaused(scope, paused)".
    pub fn set_paused(&self, scope: &BackfillScope, paused: bool, now: DateTime<Utc>) -> Result<BackfillState> {
        self.ensure_state_row(scope, now)?;
        let status = if paused { BackfillStatus::Paused } else { BackfillStatus::Running };
        self.conn.execute(
            "UPDATE memory_embedding_backfill_state SET status=?1, last_run_at=?2 WHERE scope_key=?3",
            params![status.as_str(), now.to_rfc3339(), scope.key()],
        )?;
        self.load_state(scope)
    }

    /// §4.5 "RunBatch(scope, batchLimit)": scans the next checkpointed
    /// batch of Active memories, enqueues each (debounced by the queue's
    /// UPSERT), advances the checkpoint strictly by `(created_at, id)`, and
    /// flips to `completed` once a scan returns fewer than `batchLimit`
    /// rows. Paused scopes are a no-op.
    pub fn run_batch(
        &self,
        scope: &BackfillScope,
        batch_limit: usize,
        retry_policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<RunBatchResult> {
        self.ensure_state_row(scope, now)?;
        let state = self.load_state(scope)?;
        if state.status == BackfillStatus::Paused {
            return Ok(RunBatchResult { scanned: 0, enqueued: 0, status: state.status, completed: false });
        }

        let started = std::time::Instant::now();
        let after = match (&state.checkpoint_created_at, &state.checkpoint_memory_id) {
            (Some(ts), Some(id)) => Some((ts.to_rfc3339(), id.clone())),
            _ => None,
        };

        let store = Store::new(self.conn);
        let rows = store.scan_for_backfill(
            &scope.model,
            scope.project_id.as_deref(),
            scope.user_id.as_deref(),
            after.as_ref().map(|(ts, id)| (ts.as_str(), id.as_str())),
            batch_limit,
            now,
        )?;

        let queue = EmbeddingQueue::new(self.conn, retry_policy);
        let mut enqueued = 0usize;
        let mut last_cursor: Option<(DateTime<Utc>, String)> = None;
        for memory in &rows {
            let outcome = queue.enqueue(
                &memory.id,
                &memory.content,
                &scope.model,
                JobOperation::Backfill,
                None,
                None,
                now,
            )?;
            if !outcome.skipped {
                enqueued += 1;
            }
            last_cursor = Some((memory.created_at, memory.id.clone()));
        }

        let scanned = rows.len();
        let completed = scanned < batch_limit;
        let status = if completed { BackfillStatus::Completed } else { BackfillStatus::Running };
        let estimated_total = store.count_for_backfill(&scope.model, scope.project_id.as_deref(), scope.user_id.as_deref(), now)?;

        if let Some((checkpoint_ts, checkpoint_id)) = &last_cursor {
            self.conn.execute(
                "UPDATE memory_embedding_backfill_state SET \
                 status=?1, checkpoint_created_at=?2, checkpoint_memory_id=?3, \
                 scanned_count=scanned_count+?4, enqueued_count=enqueued_count+?5, \
                 estimated_total=?6, estimated_remaining=max(?6 - (scanned_count+?4), 0), \
                 started_at=COALESCE(started_at, ?7), last_run_at=?7, \
                 completed_at=CASE WHEN ?1='completed' THEN ?7 ELSE completed_at END \
                 WHERE scope_key=?8",
                params![
                    status.as_str(),
                    checkpoint_ts.to_rfc3339(),
                    checkpoint_id,
                    scanned as i64,
                    enqueued as i64,
                    estimated_total,
                    now.to_rfc3339(),
                    scope.key(),
                ],
            )?;
        } else {
            // nothing scanned this round: still a chance to flip idle->completed
            self.conn.execute(
                "UPDATE memory_embedding_backfill_state SET status=?1, last_run_at=?2, \
                 estimated_total=?3, estimated_remaining=0, \
                 completed_at=CASE WHEN ?1='completed' THEN ?2 ELSE completed_at END \
                 WHERE scope_key=?4",
                params![status.as_str(), now.to_rfc3339(), estimated_total, scope.key()],
            )?;
        }

        self.record_metric(scope, status, scanned, enqueued, started, None, now)?;
        Ok(RunBatchResult { scanned, enqueued, status, completed })
    }

    /// §4.5 "ETA": `estimated_remaining / throughput_per_sec`, `None` when
    /// throughput can't be estimated yet.
    pub fn eta(&self, scope: &BackfillScope, throughput_per_sec: f64) -> Result<Option<Duration>> {
        let state = self.load_state(scope)?;
        if throughput_per_sec <= 0.0 || state.estimated_remaining <= 0 {
            return Ok(None);
        }
        let seconds = state.estimated_remaining as f64 / throughput_per_sec;
        Ok(Some(Duration::milliseconds((seconds * 1000.0) as i64)))
    }

    fn ensure_state_row(&self, scope: &BackfillScope, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO memory_embedding_backfill_state \
             (scope_key, model, project_id, user_id, status, last_run_at) \
             VALUES (?1, ?2, ?3, ?4, 'idle', ?5) \
             ON CONFLICT(scope_key) DO NOTHING",
            params![scope.key(), scope.model, scope.project_id, scope.user_id, now.to_rfc3339()],
        )?;
        Ok(())
    }

    fn load_state(&self, scope: &BackfillScope) -> Result<BackfillState> {
        self.conn
            .query_row(
                "SELECT model, project_id, user_id, status, checkpoint_created_at, checkpoint_memory_id, \
                        scanned_count, enqueued_count, estimated_total, estimated_remaining, batch_limit, \
                        throttle_ms, started_at, last_run_at, completed_at, last_error \
                 FROM memory_embedding_backfill_state WHERE scope_key=?1",
                params![scope.key()],
                |r| {
                    let checkpoint_created_at: Option<String> = r.get(4)?;
                    let started_at: Option<String> = r.get(12)?;
                    let last_run_at: Option<String> = r.get(13)?;
                    let completed_at: Option<String> = r.get(14)?;
                    Ok(BackfillState {
                        model: r.get(0)?,
                        project_id: r.get(1)?,
                        user_id: r.get(2)?,
                        status: BackfillStatus::parse(&r.get::<_, String>(3)?),
                        checkpoint_created_at: checkpoint_created_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
                        checkpoint_memory_id: r.get(5)?,
                        scanned_count: r.get(6)?,
                        enqueued_count: r.get(7)?,
                        estimated_total: r.get(8)?,
                        estimated_remaining: r.get(9)?,
                        batch_limit: r.get(10)?,
                        throttle_ms: r.get(11)?,
                        started_at: started_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
                        last_run_at: last_run_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
                        completed_at: completed_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
                        last_error: r.get(15)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| crate::error::EmbeddingError::InvalidData(format!("no backfill state for {}", scope.key())))
    }

    fn record_metric(
        &self,
        scope: &BackfillScope,
        status: BackfillStatus,
        scanned: usize,
        enqueued: usize,
        started: std::time::Instant,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO memory_embedding_backfill_metrics \
             (model, project_id, user_id, status, scanned, enqueued, duration_ms, error, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                scope.model,
                scope.project_id,
                scope.user_id,
                status.as_str(),
                scanned as i64,
                enqueued as i64,
                started.elapsed().as_millis() as i64,
                error,
                now.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mem_core::AddOptions;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        mem_core::schema::ensure(&conn).unwrap();
        crate::schema::ensure(&conn).unwrap();
        conn
    }

    fn scope() -> BackfillScope {
        BackfillScope { model: "model-a".to_string(), project_id: None, user_id: None }
    }

    #[test]
    fn status_lazily_creates_idle_row() {
        let conn = setup();
        let backfill = Backfill::new(&conn);
        let state = backfill.status(&scope(), now()).unwrap();
        assert_eq!(state.status, BackfillStatus::Idle);
    }

    #[test]
    fn run_batch_advances_checkpoint_and_completes_when_batch_is_short() {
        let conn = setup();
        {
            let store = Store::new(&conn);
            for i in 0..3 {
                store.add(&format!("memory {i}"), AddOptions::default(), 24.0, now() + Duration::seconds(i)).unwrap();
            }
        }

        let backfill = Backfill::new(&conn);
        let result = backfill.run_batch(&scope(), 10, RetryPolicy::default(), now() + Duration::minutes(1)).unwrap();
        assert_eq!(result.scanned, 3);
        assert_eq!(result.enqueued, 3);
        assert!(result.completed);
        assert_eq!(result.status, BackfillStatus::Completed);

        let state = backfill.status(&scope(), now()).unwrap();
        assert_eq!(state.enqueued_count, 3);
        assert_eq!(state.estimated_remaining, 0);

        // Simulate the queue having embedded every enqueued memory, then
        // reset the checkpoint so the next scan starts from the top again —
        // isolating the `LEFT JOIN memory_embeddings` filter (not checkpoint
        // advancement) as the reason a second pass finds nothing left to do.
        let ids: Vec<String> = conn
            .prepare("SELECT id FROM memories")
            .unwrap()
            .query_map([], |r| r.get::<_, String>(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        for id in &ids {
            conn.execute(
                "INSERT INTO memory_embeddings (memory_id, model, model_version, dimension, embedding, created_at, updated_at) \
                 VALUES (?1, 'model-a', NULL, 1, X'00000000', ?2, ?2)",
                params![id, now().to_rfc3339()],
            )
            .unwrap();
        }
        conn.execute(
            "UPDATE memory_embedding_backfill_state SET checkpoint_created_at=NULL, checkpoint_memory_id=NULL WHERE scope_key=?1",
            params![scope().key()],
        )
        .unwrap();

        let second = backfill.run_batch(&scope(), 10, RetryPolicy::default(), now() + Duration::minutes(2)).unwrap();
        assert_eq!(second.scanned, 0);
        assert_eq!(second.enqueued, 0);
        assert_eq!(second.status, BackfillStatus::Completed);
    }

    #[test]
    fn run_batch_stays_running_when_more_rows_remain() {
        let conn = setup();
        {
            let store = Store::new(&conn);
            for i in 0..5 {
                store.add(&format!("memory {i}"), AddOptions::default(), 24.0, now() + Duration::seconds(i)).unwrap();
            }
        }

        let backfill = Backfill::new(&conn);
        let first = backfill.run_batch(&scope(), 2, RetryPolicy::default(), now() + Duration::minutes(1)).unwrap();
        assert_eq!(first.scanned, 2);
        assert!(!first.completed);
        assert_eq!(first.status, BackfillStatus::Running);

        let second = backfill.run_batch(&scope(), 2, RetryPolicy::default(), now() + Duration::minutes(2)).unwrap();
        assert_eq!(second.scanned, 2);
        assert!(!second.completed);

        let third = backfill.run_batch(&scope(), 2, RetryPolicy::default(), now() + Duration::minutes(3)).unwrap();
        assert_eq!(third.scanned, 1);
        assert!(third.completed);
    }

    #[test]
    fn paused_scope_runs_batch_as_a_no_op() {
        let conn = setup();
        {
            let store = Store::new(&conn);
            store.add("memory", AddOptions::default(), 24.0, now()).unwrap();
        }
        let backfill = Backfill::new(&conn);
        backfill.set_paused(&scope(), true, now()).unwrap();

        let result = backfill.run_batch(&scope(), 10, RetryPolicy::default(), now()).unwrap();
        assert_eq!(result.scanned, 0);
        assert_eq!(result.enqueued, 0);
        assert!(!result.completed);
    }
}
