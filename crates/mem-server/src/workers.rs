//! Background maintenance loops: the embedding worker (§4.4 step 1-6), the
//! inactivity compaction worker (§4.7), and the stream-buffer TTL sweep
//! (§4.9 "a background cleanup runs every 5 minutes").
//!
//! Each loop sweeps every currently-open tenant database rather than a
//! single one (SPEC_FULL.md "Vacuum is also reachable as a scheduled/
//! background op", generalized to every idle-triggered maintenance pass).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use mem_embed::{EmbeddingQueue, RetryPolicy, StoreMemoryLookup};
use mem_session::{InactivityWorkerOptions, run_inactivity_compaction_worker};

use crate::state::AppState;

const EMBEDDING_WORKER_INTERVAL: Duration = Duration::from_secs(5);
const COMPACTION_WORKER_INTERVAL: Duration = Duration::from_secs(60);
const STREAM_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub fn spawn_all(state: Arc<AppState>) {
    spawn_embedding_worker(state.clone());
    spawn_compaction_worker(state.clone());
    spawn_stream_cleanup(state);
}

fn spawn_embedding_worker(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EMBEDDING_WORKER_INTERVAL);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            let policy = RetryPolicy {
                max_attempts: state.config.embedding_job_max_attempts,
                base_backoff: chrono::Duration::from_std(state.config.embedding_retry_base).unwrap_or_default(),
                max_backoff: chrono::Duration::from_std(state.config.embedding_retry_max).unwrap_or_default(),
                processing_timeout: chrono::Duration::from_std(state.config.embedding_processing_timeout).unwrap_or_default(),
            };
            for db_key in state.tenant_pool.open_keys() {
                let Ok(handle) = state.tenant_pool.get_or_open(&db_key) else { continue };
                let conn = handle.conn.lock().await;
                let queue = EmbeddingQueue::new(&conn, policy);
                let lookup = StoreMemoryLookup::new(&conn, now);
                let worker_id = format!("worker-{db_key}");
                match queue.process_due_jobs(state.config.embedding_worker_batch_size, &worker_id, state.provider.as_ref(), &lookup, now).await {
                    Ok(outcomes) if !outcomes.is_empty() => {
                        tracing::info!(tenant = %db_key, processed = outcomes.len(), "embedding worker processed jobs");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(tenant = %db_key, error = %e, "embedding worker pass failed"),
                }
            }
        }
    });
}

fn spawn_compaction_worker(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(COMPACTION_WORKER_INTERVAL);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            for db_key in state.tenant_pool.open_keys() {
                let Ok(handle) = state.tenant_pool.get_or_open(&db_key) else { continue };
                let conn = handle.conn.lock().await;
                match run_inactivity_compaction_worker(&conn, InactivityWorkerOptions::default(), now) {
                    Ok(result) if result.compacted > 0 => {
                        tracing::info!(tenant = %db_key, compacted = result.compacted, "inactivity compaction ran");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(tenant = %db_key, error = %e, "inactivity compaction pass failed"),
                }
            }
        }
    });
}

fn spawn_stream_cleanup(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STREAM_CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            for db_key in state.stream_buffer_keys() {
                let buffer = state.stream_buffer(&db_key);
                let evicted = buffer.evict_expired(now);
                if evicted > 0 {
                    tracing::debug!(tenant = %db_key, evicted, "stream buffer TTL sweep");
                }
            }
        }
    });
}
