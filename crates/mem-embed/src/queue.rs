//! Embedding Queue (C4): enqueue, claim, process, retry, dead-letter, metrics
//! (§4.4).

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use mem_core::StoreError;

use crate::error::{EmbeddingError, Result};
use crate::model::{JobOperation, JobOutcome, JobStatus, decode_embedding, encode_embedding};
use crate::provider::EmbeddingProvider;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: i64,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub processing_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::milliseconds(500),
            max_backoff: Duration::seconds(60),
            processing_timeout: Duration::minutes(5),
        }
    }
}

impl RetryPolicy {
    /// §4.4 step 5: `backoff = clamp(base * 2^(attempt-1), [base, max])`.
    pub fn backoff_for_attempt(&self, attempt: i64) -> Duration {
        let exp = attempt.max(1) - 1;
        let factor = 1i64.checked_shl(exp.min(40) as u32).unwrap_or(i64::MAX);
        let scaled_ms = (self.base_backoff.num_milliseconds()).saturating_mul(factor);
        let clamped_ms = scaled_ms.clamp(self.base_backoff.num_milliseconds(), self.max_backoff.num_milliseconds());
        Duration::milliseconds(clamped_ms)
    }
}

pub struct EmbeddingQueue<'a> {
    conn: &'a Connection,
    policy: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub job_id: Option<i64>,
    pub skipped: bool,
}

impl<'a> EmbeddingQueue<'a> {
    pub fn new(conn: &'a Connection, policy: RetryPolicy) -> Self {
        Self { conn, policy }
    }

    /// §4.4 "Enqueue". Skips empty content. UPSERT on `(memory_id, model)`:
    /// on conflict resets to queued — the debounce mechanism for repeated
    /// edits of the same memory.
    pub fn enqueue(
        &self,
        memory_id: &str,
        content: &str,
        model: &str,
        operation: JobOperation,
        model_version: Option<&str>,
        max_attempts: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        if content.trim().is_empty() {
            return Ok(EnqueueOutcome { job_id: None, skipped: true });
        }

        let max_attempts = max_attempts.unwrap_or(self.policy.max_attempts);
        self.conn.execute(
            "INSERT INTO memory_embedding_jobs \
             (memory_id, model, model_version, operation, status, attempt_count, max_attempts, \
              next_attempt_at, claimed_by, claimed_at, last_error, dead_letter_reason, dead_letter_at, \
              created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 'queued', 0, ?5, ?6, NULL, NULL, NULL, NULL, NULL, ?6, ?6) \
             ON CONFLICT(memory_id, model) DO UPDATE SET \
               status='queued', attempt_count=0, next_attempt_at=excluded.next_attempt_at, \
               claimed_by=NULL, claimed_at=NULL, last_error=NULL, dead_letter_reason=NULL, \
               dead_letter_at=NULL, operation=excluded.operation, updated_at=excluded.updated_at",
            params![memory_id, model, model_version, operation.as_str(), max_attempts, now.to_rfc3339()],
        )?;

        let job_id: i64 = self.conn.query_row(
            "SELECT id FROM memory_embedding_jobs WHERE memory_id=?1 AND model=?2",
            params![memory_id, model],
            |r| r.get(0),
        )?;
        Ok(EnqueueOutcome { job_id: Some(job_id), skipped: false })
    }

    /// §4.4 "ProcessDueJobs(maxJobs)". Requeues stale `processing` rows
    /// first, then claims and processes up to `maxJobs` due jobs via a
    /// conditional UPDATE (§5 "atomic via conditional UPDATE + immediate
    /// read-back by claimed_by token").
    pub async fn process_due_jobs(
        &self,
        max_jobs: usize,
        worker_id: &str,
        provider: &dyn EmbeddingProvider,
        memory_lookup: &dyn MemoryLookup,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobOutcome>> {
        self.requeue_stale_processing(now)?;

        let mut outcomes = Vec::with_capacity(max_jobs);
        for i in 0..max_jobs {
            let claim_token = format!("{worker_id}-{}", i);
            let Some(job_id) = self.claim_next_due(&claim_token, now)? else {
                break;
            };
            let outcome = self.process_claimed(job_id, provider, memory_lookup, now).await?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn requeue_stale_processing(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.policy.processing_timeout;
        let n = self.conn.execute(
            "UPDATE memory_embedding_jobs SET status='queued', next_attempt_at=?1, \
             claimed_by=NULL, claimed_at=NULL \
             WHERE status='processing' AND claimed_at <= ?2",
            params![now.to_rfc3339(), cutoff.to_rfc3339()],
        )?;
        Ok(n)
    }

    fn claim_next_due(&self, claim_token: &str, now: DateTime<Utc>) -> Result<Option<i64>> {
        let rows = self.conn.execute(
            "UPDATE memory_embedding_jobs SET status='processing', claimed_by=?1, claimed_at=?2 \
             WHERE id = ( \
               SELECT id FROM memory_embedding_jobs \
               WHERE status='queued' AND next_attempt_at <= ?2 \
               ORDER BY next_attempt_at ASC, created_at ASC LIMIT 1 \
             ) AND status='queued' AND next_attempt_at <= ?2",
            params![claim_token, now.to_rfc3339()],
        )?;
        if rows == 0 {
            return Ok(None);
        }
        let job_id: i64 = self.conn.query_row(
            "SELECT id FROM memory_embedding_jobs WHERE claimed_by=?1",
            params![claim_token],
            |r| r.get(0),
        )?;
        Ok(Some(job_id))
    }

    async fn process_claimed(
        &self,
        job_id: i64,
        provider: &dyn EmbeddingProvider,
        memory_lookup: &dyn MemoryLookup,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome> {
        let job = self.load_job(job_id)?;
        let started = std::time::Instant::now();

        // §4.4 step 3: missing/deleted source memory -> purge embedding, succeed as skipped
        match memory_lookup.content_if_active(&job.memory_id)? {
            None => {
                self.purge_embedding(&job.memory_id, &job.model)?;
                self.mark_succeeded(job_id, now)?;
                self.record_metric(&job, JobOutcome::Skipped, started, None, None, now)?;
                return Ok(JobOutcome::Skipped);
            }
            Some(content) => {
                match provider.embed(&job.model, &content).await {
                    Ok(result) => {
                        self.upsert_embedding(&job.memory_id, &job.model, job.model_version.as_deref(), &result.vector, now)?;
                        self.mark_succeeded(job_id, now)?;
                        self.record_metric(&job, JobOutcome::Success, started, None, None, now)?;
                        Ok(JobOutcome::Success)
                    }
                    Err(provider_err) => {
                        let next_attempt = job.attempt_count + 1;
                        if provider_err.is_retryable() && next_attempt < job.max_attempts {
                            let backoff = self.policy.backoff_for_attempt(next_attempt);
                            self.mark_retry(job_id, next_attempt, now + backoff, &provider_err.to_string(), now)?;
                            self.record_metric(&job, JobOutcome::Retry, started, None, Some(provider_err.to_string()), now)?;
                            Ok(JobOutcome::Retry)
                        } else {
                            let reason = if provider_err.is_retryable() {
                                "max_attempts_exhausted"
                            } else {
                                "non_retryable_provider_error"
                            };
                            self.mark_dead_letter(job_id, reason, &provider_err.to_string(), now)?;
                            self.record_metric(&job, JobOutcome::DeadLetter, started, Some(reason.to_string()), Some(provider_err.to_string()), now)?;
                            Ok(JobOutcome::DeadLetter)
                        }
                    }
                }
            }
        }
    }

    fn load_job(&self, job_id: i64) -> Result<LoadedJob> {
        self.conn
            .query_row(
                "SELECT id, memory_id, model, model_version, attempt_count, max_attempts FROM memory_embedding_jobs WHERE id=?1",
                params![job_id],
                |r: &Row| {
                    Ok(LoadedJob {
                        id: r.get(0)?,
                        memory_id: r.get(1)?,
                        model: r.get(2)?,
                        model_version: r.get(3)?,
                        attempt_count: r.get(4)?,
                        max_attempts: r.get(5)?,
                    })
                },
            )
            .map_err(EmbeddingError::from)
    }

    fn mark_succeeded(&self, job_id: i64, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE memory_embedding_jobs SET status='succeeded', updated_at=?1 WHERE id=?2",
            params![now.to_rfc3339(), job_id],
        )?;
        Ok(())
    }

    fn mark_retry(&self, job_id: i64, attempt: i64, next_attempt_at: DateTime<Utc>, error: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE memory_embedding_jobs SET status='queued', attempt_count=?1, \
             next_attempt_at=?2, claimed_by=NULL, claimed_at=NULL, last_error=?3, updated_at=?4 WHERE id=?5",
            params![attempt, next_attempt_at.to_rfc3339(), error, now.to_rfc3339(), job_id],
        )?;
        Ok(())
    }

    fn mark_dead_letter(&self, job_id: i64, reason: &str, error: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE memory_embedding_jobs SET status='dead_letter', dead_letter_reason=?1, \
             dead_letter_at=?2, last_error=?3, updated_at=?2 WHERE id=?4",
            params![reason, now.to_rfc3339(), error, job_id],
        )?;
        Ok(())
    }

    fn record_metric(
        &self,
        job: &LoadedJob,
        outcome: JobOutcome,
        started: std::time::Instant,
        error_code: Option<String>,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let duration_ms = started.elapsed().as_millis() as i64;
        // §9 Open Question: a metrics-insert failure is logged, never fails the job.
        if let Err(e) = self.conn.execute(
            "INSERT INTO memory_embedding_job_metrics \
             (job_id, memory_id, model, outcome, duration_ms, error_code, error_message, attempt, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                job.id,
                job.memory_id,
                job.model,
                outcome.as_str(),
                duration_ms,
                error_code,
                error_message,
                job.attempt_count,
                now.to_rfc3339(),
            ],
        ) {
            tracing::warn!("failed to record embedding job metric for job {}: {e}", job.id);
        }
        Ok(())
    }

    fn purge_embedding(&self, memory_id: &str, model: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM memory_embeddings WHERE memory_id=?1 AND model=?2",
            params![memory_id, model],
        )?;
        Ok(())
    }

    fn upsert_embedding(
        &self,
        memory_id: &str,
        model: &str,
        model_version: Option<&str>,
        vector: &[f32],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let blob = encode_embedding(vector);
        self.conn.execute(
            "INSERT INTO memory_embeddings (memory_id, model, model_version, dimension, embedding, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) \
             ON CONFLICT(memory_id, model) DO UPDATE SET \
               model_version=excluded.model_version, dimension=excluded.dimension, \
               embedding=excluded.embedding, updated_at=excluded.updated_at",
            params![memory_id, model, model_version, vector.len() as i64, blob, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_embedding(&self, memory_id: &str, model: &str) -> Result<Option<(usize, Vec<f32>)>> {
        let row = self
            .conn
            .query_row(
                "SELECT dimension, embedding FROM memory_embeddings WHERE memory_id=?1 AND model=?2",
                params![memory_id, model],
                |r| {
                    let dim: i64 = r.get(0)?;
                    let blob: Vec<u8> = r.get(1)?;
                    Ok((dim as usize, blob))
                },
            )
            .optional()?;
        Ok(row.map(|(dim, blob)| (dim, decode_embedding(&blob))))
    }

    pub fn job_status(&self, memory_id: &str, model: &str) -> Result<Option<JobStatus>> {
        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM memory_embedding_jobs WHERE memory_id=?1 AND model=?2",
                params![memory_id, model],
                |r| r.get(0),
            )
            .optional()?;
        Ok(status.map(|s| JobStatus::parse(&s)))
    }
}

struct LoadedJob {
    id: i64,
    memory_id: String,
    model: String,
    model_version: Option<String>,
    attempt_count: i64,
    max_attempts: i64,
}

/// Seam for looking up whether a memory is still active, without pulling in
/// all of `mem_core::Store`'s request-shaped options (§4.4 step 3).
pub trait MemoryLookup: Send + Sync {
    fn content_if_active(&self, memory_id: &str) -> std::result::Result<Option<String>, StoreError>;
}

pub struct StoreMemoryLookup<'a> {
    conn: &'a Connection,
    now: DateTime<Utc>,
}

impl<'a> StoreMemoryLookup<'a> {
    pub fn new(conn: &'a Connection, now: DateTime<Utc>) -> Self {
        Self { conn, now }
    }
}

impl MemoryLookup for StoreMemoryLookup<'_> {
    fn content_if_active(&self, memory_id: &str) -> std::result::Result<Option<String>, StoreError> {
        let store = mem_core::Store::new(self.conn);
        Ok(store.get_by_id(memory_id, None, self.now)?.map(|m| m.content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::ScriptedProvider;
    use crate::schema;
    use chrono::TimeZone;
    use std::cell::RefCell;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        mem_core::schema::ensure(&conn).unwrap();
        schema::ensure(&conn).unwrap();
        conn
    }

    struct AlwaysActive(RefCell<Option<String>>);
    impl MemoryLookup for AlwaysActive {
        fn content_if_active(&self, _id: &str) -> std::result::Result<Option<String>, StoreError> {
            Ok(self.0.borrow().clone())
        }
    }

    #[test]
    fn backoff_doubles_and_clamps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for_attempt(1), Duration::milliseconds(500));
        assert_eq!(policy.backoff_for_attempt(2), Duration::milliseconds(1000));
        assert_eq!(policy.backoff_for_attempt(3), Duration::milliseconds(2000));
        assert_eq!(policy.backoff_for_attempt(20), policy.max_backoff);
    }

    #[tokio::test]
    async fn enqueue_then_process_succeeds_and_stores_embedding() {
        let conn = setup();
        let queue = EmbeddingQueue::new(&conn, RetryPolicy::default());
        queue.enqueue("mem1", "hello world", "model-a", JobOperation::Add, None, None, now()).unwrap();

        let provider = ScriptedProvider::new(vec![Ok(vec![0.1, 0.2, 0.3])]);
        let lookup = AlwaysActive(RefCell::new(Some("hello world".to_string())));

        let outcomes = queue.process_due_jobs(10, "worker-1", &provider, &lookup, now()).await.unwrap();
        assert_eq!(outcomes, vec![JobOutcome::Success]);

        let (dim, vector) = queue.get_embedding("mem1", "model-a").unwrap().unwrap();
        assert_eq!(dim, 3);
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn enqueue_skips_empty_content() {
        let conn = setup();
        let queue = EmbeddingQueue::new(&conn, RetryPolicy::default());
        let outcome = queue.enqueue("mem1", "   ", "model-a", JobOperation::Add, None, None, now()).unwrap();
        assert!(outcome.skipped);
    }

    #[test]
    fn enqueue_twice_debounces_to_one_queued_job() {
        let conn = setup();
        let queue = EmbeddingQueue::new(&conn, RetryPolicy::default());
        let first = queue.enqueue("mem1", "v1", "model-a", JobOperation::Add, None, None, now()).unwrap();
        let second = queue.enqueue("mem1", "v2", "model-a", JobOperation::Edit, None, None, now()).unwrap();
        assert_eq!(first.job_id, second.job_id);

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM memory_embedding_jobs", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn retryable_failure_requeues_then_dead_letters_after_max_attempts() {
        let conn = setup();
        let policy = RetryPolicy { max_attempts: 2, ..RetryPolicy::default() };
        let queue = EmbeddingQueue::new(&conn, policy);
        queue.enqueue("mem1", "hello", "model-a", JobOperation::Add, None, Some(2), now()).unwrap();

        let provider = ScriptedProvider::new(vec![
            Err(crate::error::ProviderError::ServerError { status: 503 }),
            Err(crate::error::ProviderError::ServerError { status: 503 }),
        ]);
        let lookup = AlwaysActive(RefCell::new(Some("hello".to_string())));

        let first = queue.process_due_jobs(1, "worker-1", &provider, &lookup, now()).await.unwrap();
        assert_eq!(first, vec![JobOutcome::Retry]);

        let later = now() + Duration::seconds(61);
        let second = queue.process_due_jobs(1, "worker-1", &provider, &lookup, later).await.unwrap();
        assert_eq!(second, vec![JobOutcome::DeadLetter]);

        let metrics_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_embedding_job_metrics", [], |r| r.get(0))
            .unwrap();
        assert_eq!(metrics_count, 2);
    }

    #[tokio::test]
    async fn missing_memory_purges_embedding_and_succeeds_as_skipped() {
        let conn = setup();
        let queue = EmbeddingQueue::new(&conn, RetryPolicy::default());
        queue.enqueue("mem-gone", "anything", "model-a", JobOperation::Add, None, None, now()).unwrap();

        let provider = ScriptedProvider::new(vec![]);
        let lookup = AlwaysActive(RefCell::new(None));

        let outcomes = queue.process_due_jobs(1, "worker-1", &provider, &lookup, now()).await.unwrap();
        assert_eq!(outcomes, vec![JobOutcome::Skipped]);
        assert_eq!(provider.call_count(), 0);
    }

    #[test]
    fn stale_processing_is_requeued() {
        let conn = setup();
        let policy = RetryPolicy::default();
        let queue = EmbeddingQueue::new(&conn, policy);
        queue.enqueue("mem1", "hello", "model-a", JobOperation::Add, None, None, now()).unwrap();
        queue.claim_next_due("stale-worker", now()).unwrap();

        let much_later = now() + Duration::minutes(10);
        let requeued = queue.requeue_stale_processing(much_later).unwrap();
        assert_eq!(requeued, 1);

        let status: String = conn
            .query_row("SELECT status FROM memory_embedding_jobs WHERE memory_id='mem1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "queued");
    }
}
