//! Embedding Observability (C6, §4.6): aggregate queue/worker/backfill/
//! retrieval/cost telemetry into one snapshot and evaluate it against fixed
//! SLOs.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::Serialize;

use crate::error::Result;

/// External collaborator seam for the cost section (§6 "Usage loader ...
/// not implemented by the core"), mirroring `EmbeddingProvider`'s shape.
pub trait UsageLoader: Send + Sync {
    fn summary(&self, scope: &CostScope) -> CostSummary;
}

#[derive(Debug, Clone, Default)]
pub struct CostScope {
    pub tenant_id: Option<String>,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub usage_month: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CostSummary {
    pub available: bool,
    pub total_usd: f64,
    pub notes: Option<String>,
}

/// A usage loader is an external integration; absent one, the cost section
/// reports itself unavailable rather than fabricating numbers.
pub struct NoUsageLoader;
impl UsageLoader for NoUsageLoader {
    fn summary(&self, _scope: &CostScope) -> CostSummary {
        CostSummary { available: false, total_usd: 0.0, notes: Some("no usage loader configured".to_string()) }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub queued: i64,
    pub processing: i64,
    pub succeeded: i64,
    pub dead_letter: i64,
    pub stale_processing_count: i64,
    pub oldest_due_at: Option<DateTime<Utc>>,
    pub oldest_claimed_at: Option<DateTime<Utc>>,
    pub queue_lag_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub attempts: i64,
    pub successes: i64,
    pub retries: i64,
    pub dead_letters: i64,
    pub failure_rate: f64,
    pub retry_rate: f64,
    pub p50_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub top_error_codes: Vec<(String, i64)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillSnapshot {
    pub runs: i64,
    pub error_runs: i64,
    pub scanned: i64,
    pub enqueued: i64,
    pub active_running: i64,
    pub active_paused: i64,
    pub active_completed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalSnapshot {
    pub hybrid_requested: i64,
    pub fallback_count: i64,
    pub fallback_rate: f64,
    pub p50_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub last_fallback_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmLevel {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alarm {
    pub code: &'static str,
    pub level: AlarmLevel,
    pub value: f64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub samples: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub window_hours: i64,
    pub queue: QueueSnapshot,
    pub worker: WorkerSnapshot,
    pub backfill: BackfillSnapshot,
    pub retrieval: RetrievalSnapshot,
    pub cost: CostSummary,
    pub alarms: Vec<Alarm>,
    pub overall_health: OverallHealth,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotScope {
    pub tenant_id: Option<String>,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub model_id: Option<String>,
    pub window_hours: Option<i64>,
    pub usage_month: Option<String>,
}

/// One `Store::search`/`Retriever::get_context` call's fallback telemetry
/// (§4.6 "Retrieval"), recorded by whichever crate drives retrieval —
/// `mem-embed` owns the table but never calls `mem_core::Store` itself.
#[derive(Debug, Clone, Default)]
pub struct RetrievalRecord {
    pub tenant_id: Option<String>,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub used_fallback: bool,
    pub fallback_reason: Option<String>,
    pub duration_ms: i64,
}

/// Records one retrieval call into `graph_rollout_metrics`. Matches
/// `queue::record_metric`'s policy (§9 Open Question): a metrics-insert
/// failure is logged, never propagated to the caller.
pub fn record_retrieval(conn: &Connection, record: &RetrievalRecord, now: DateTime<Utc>) {
    if let Err(e) = conn.execute(
        "INSERT INTO graph_rollout_metrics \
         (tenant_id, project_id, user_id, used_fallback, fallback_reason, duration_ms, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.tenant_id,
            record.project_id,
            record.user_id,
            record.used_fallback as i64,
            record.fallback_reason,
            record.duration_ms,
            now.to_rfc3339(),
        ],
    ) {
        tracing::warn!("failed to record retrieval metric: {e}");
    }
}

fn stale_processing_timeout() -> Duration {
    Duration::minutes(5)
}

pub struct Observability<'a> {
    conn: &'a Connection,
}

impl<'a> Observability<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn snapshot(&self, scope: &SnapshotScope, usage_loader: &dyn UsageLoader, now: DateTime<Utc>) -> Result<Snapshot> {
        let window_hours = scope.window_hours.unwrap_or(24);
        let since = now - Duration::hours(window_hours);

        let queue = self.queue_snapshot(scope, now)?;
        let worker = self.worker_snapshot(scope, since)?;
        let backfill = self.backfill_snapshot(scope, since)?;
        let retrieval = self.retrieval_snapshot(scope, since)?;
        let cost = usage_loader.summary(&CostScope {
            tenant_id: scope.tenant_id.clone(),
            project_id: scope.project_id.clone(),
            user_id: scope.user_id.clone(),
            usage_month: scope.usage_month.clone(),
        });

        let alarms = evaluate_alarms(&queue, &worker, &retrieval, &backfill);
        let overall_health = if alarms.iter().any(|a| a.level == AlarmLevel::Critical) {
            OverallHealth::Critical
        } else if alarms.iter().any(|a| a.level == AlarmLevel::Warning) {
            OverallHealth::Degraded
        } else {
            OverallHealth::Healthy
        };

        Ok(Snapshot { window_hours, queue, worker, backfill, retrieval, cost, alarms, overall_health })
    }

    fn queue_snapshot(&self, scope: &SnapshotScope, now: DateTime<Utc>) -> Result<QueueSnapshot> {
        let model_clause = scope.model_id.as_deref().map(|_| " AND model=?").unwrap_or("");
        let count = |status: &str| -> Result<i64> {
            let sql = format!("SELECT COUNT(*) FROM memory_embedding_jobs WHERE status=?1{model_clause}");
            let n = if let Some(m) = &scope.model_id {
                self.conn.query_row(&sql, params![status, m], |r| r.get(0))?
            } else {
                self.conn.query_row(&sql, params![status], |r| r.get(0))?
            };
            Ok(n)
        };

        let stale_cutoff = now - stale_processing_timeout();
        let stale_sql = format!("SELECT COUNT(*) FROM memory_embedding_jobs WHERE status='processing' AND claimed_at <= ?1{model_clause}");
        let stale_processing_count: i64 = if let Some(m) = &scope.model_id {
            self.conn.query_row(&stale_sql, params![stale_cutoff.to_rfc3339(), m], |r| r.get(0))?
        } else {
            self.conn.query_row(&stale_sql, params![stale_cutoff.to_rfc3339()], |r| r.get(0))?
        };

        let oldest_due_sql = format!("SELECT MIN(next_attempt_at) FROM memory_embedding_jobs WHERE status='queued'{model_clause}");
        let oldest_due_at: Option<String> = if let Some(m) = &scope.model_id {
            self.conn.query_row(&oldest_due_sql, params![m], |r| r.get(0)).optional()?.flatten()
        } else {
            self.conn.query_row(&oldest_due_sql, [], |r| r.get(0)).optional()?.flatten()
        };
        let oldest_due_at = oldest_due_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc));

        let oldest_claimed_sql = format!("SELECT MIN(claimed_at) FROM memory_embedding_jobs WHERE status='processing'{model_clause}");
        let oldest_claimed_at: Option<String> = if let Some(m) = &scope.model_id {
            self.conn.query_row(&oldest_claimed_sql, params![m], |r| r.get(0)).optional()?.flatten()
        } else {
            self.conn.query_row(&oldest_claimed_sql, [], |r| r.get(0)).optional()?.flatten()
        };
        let oldest_claimed_at = oldest_claimed_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc));

        let queue_lag_ms = oldest_due_at.map(|t| (now - t).num_milliseconds().max(0)).unwrap_or(0);

        Ok(QueueSnapshot {
            queued: count("queued")?,
            processing: count("processing")?,
            succeeded: count("succeeded")?,
            dead_letter: count("dead_letter")?,
            stale_processing_count,
            oldest_due_at,
            oldest_claimed_at,
            queue_lag_ms,
        })
    }

    fn worker_snapshot(&self, scope: &SnapshotScope, since: DateTime<Utc>) -> Result<WorkerSnapshot> {
        let model_clause = scope.model_id.as_deref().map(|_| " AND model=?").unwrap_or("");
        let sql = format!("SELECT outcome, duration_ms, error_code FROM memory_embedding_job_metrics WHERE created_at >= ?1{model_clause}");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows: Vec<(String, i64, Option<String>)> = if let Some(m) = &scope.model_id {
            stmt.query_map(params![since.to_rfc3339(), m], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            stmt.query_map(params![since.to_rfc3339()], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let attempts = rows.len() as i64;
        let successes = rows.iter().filter(|(o, _, _)| o == "success").count() as i64;
        let retries = rows.iter().filter(|(o, _, _)| o == "retry").count() as i64;
        let dead_letters = rows.iter().filter(|(o, _, _)| o == "dead_letter").count() as i64;

        let mut durations: Vec<i64> = rows.iter().map(|(_, d, _)| *d).collect();
        durations.sort_unstable();
        let p50_duration_ms = percentile(&durations, 0.50);
        let p95_duration_ms = percentile(&durations, 0.95);

        let mut error_counts: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
        for (_, _, code) in &rows {
            if let Some(c) = code {
                *error_counts.entry(c.clone()).or_insert(0) += 1;
            }
        }
        let mut top_error_codes: Vec<(String, i64)> = error_counts.into_iter().collect();
        top_error_codes.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_error_codes.truncate(5);

        Ok(WorkerSnapshot {
            attempts,
            successes,
            retries,
            dead_letters,
            failure_rate: safe_div(dead_letters, attempts),
            retry_rate: safe_div(retries, attempts),
            p50_duration_ms,
            p95_duration_ms,
            top_error_codes,
        })
    }

    fn backfill_snapshot(&self, scope: &SnapshotScope, since: DateTime<Utc>) -> Result<BackfillSnapshot> {
        let model_clause = scope.model_id.as_deref().map(|_| " AND model=?").unwrap_or("");
        let metrics_sql = format!(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN error IS NOT NULL THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(scanned), 0), COALESCE(SUM(enqueued), 0) \
             FROM memory_embedding_backfill_metrics WHERE created_at >= ?1{model_clause}"
        );
        let (runs, error_runs, scanned, enqueued): (i64, i64, i64, i64) = if let Some(m) = &scope.model_id {
            self.conn.query_row(&metrics_sql, params![since.to_rfc3339(), m], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
        } else {
            self.conn.query_row(&metrics_sql, params![since.to_rfc3339()], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
        };

        let state_sql = format!("SELECT status, COUNT(*) FROM memory_embedding_backfill_state WHERE 1=1{model_clause} GROUP BY status");
        let mut stmt = self.conn.prepare(&state_sql)?;
        let state_rows: Vec<(String, i64)> = if let Some(m) = &scope.model_id {
            stmt.query_map(params![m], |r| Ok((r.get(0)?, r.get(1)?)))?.collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let by_status = |s: &str| state_rows.iter().find(|(st, _)| st == s).map(|(_, n)| *n).unwrap_or(0);

        Ok(BackfillSnapshot {
            runs,
            error_runs,
            scanned,
            enqueued,
            active_running: by_status("running"),
            active_paused: by_status("paused"),
            active_completed: by_status("completed"),
        })
    }

    /// §4.6 "Retrieval": totals over `graph_rollout_metrics` within the
    /// window; `fallbackRate = fallbackCount / hybridRequested`; p50/p95 on
    /// `duration_ms`; last fallback reason.
    fn retrieval_snapshot(&self, scope: &SnapshotScope, since: DateTime<Utc>) -> Result<RetrievalSnapshot> {
        let mut where_extra = String::new();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(since.to_rfc3339())];
        if let Some(tid) = &scope.tenant_id {
            where_extra.push_str(" AND tenant_id=?");
            args.push(Box::new(tid.clone()));
        }
        if let Some(pid) = &scope.project_id {
            where_extra.push_str(" AND project_id=?");
            args.push(Box::new(pid.clone()));
        }
        if let Some(uid) = &scope.user_id {
            where_extra.push_str(" AND user_id=?");
            args.push(Box::new(uid.clone()));
        }

        let sql = format!(
            "SELECT used_fallback, duration_ms, fallback_reason FROM graph_rollout_metrics \
             WHERE created_at >= ?1{where_extra} ORDER BY created_at ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows: Vec<(i64, i64, Option<String>)> = stmt
            .query_map(params_from_iter(args.iter().map(|b| b.as_ref())), |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let hybrid_requested = rows.len() as i64;
        let fallback_count = rows.iter().filter(|(f, _, _)| *f != 0).count() as i64;

        let mut durations: Vec<i64> = rows.iter().map(|(_, d, _)| *d).collect();
        durations.sort_unstable();
        let p50_duration_ms = percentile(&durations, 0.50);
        let p95_duration_ms = percentile(&durations, 0.95);

        let last_fallback_reason = rows.iter().rev().find_map(|(f, _, reason)| if *f != 0 { reason.clone() } else { None });

        Ok(RetrievalSnapshot {
            hybrid_requested,
            fallback_count,
            fallback_rate: safe_div(fallback_count, hybrid_requested),
            p50_duration_ms,
            p95_duration_ms,
            last_fallback_reason,
        })
    }
}

fn safe_div(n: i64, d: i64) -> f64 {
    if d == 0 { 0.0 } else { n as f64 / d as f64 }
}

/// Sorted-array percentile with linear interpolation (§4.6 "Worker").
fn percentile(sorted: &[i64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = p * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo] as f64;
    }
    let frac = rank - lo as f64;
    sorted[lo] as f64 + (sorted[hi] as f64 - sorted[lo] as f64) * frac
}

fn evaluate_alarms(queue: &QueueSnapshot, worker: &WorkerSnapshot, retrieval: &RetrievalSnapshot, backfill: &BackfillSnapshot) -> Vec<Alarm> {
    let mut alarms = Vec::new();

    alarms.push(Alarm {
        code: "EMBEDDING_QUEUE_LAG",
        level: level_for(queue.queue_lag_ms as f64, 120_000.0, 600_000.0),
        value: queue.queue_lag_ms as f64,
        warning_threshold: 120_000.0,
        critical_threshold: 600_000.0,
        samples: 0,
    });

    alarms.push(Alarm {
        code: "EMBEDDING_STALE_JOBS",
        level: level_for(queue.stale_processing_count as f64, 1.0, 5.0),
        value: queue.stale_processing_count as f64,
        warning_threshold: 1.0,
        critical_threshold: 5.0,
        samples: 0,
    });

    alarms.push(alarm_with_min_samples(
        "EMBEDDING_DEAD_LETTER_RATE",
        worker.failure_rate,
        0.02,
        0.05,
        worker.attempts,
        20,
    ));

    alarms.push(alarm_with_min_samples(
        "EMBEDDING_RETRIEVAL_FALLBACK_RATE",
        retrieval.fallback_rate,
        0.05,
        0.15,
        retrieval.hybrid_requested,
        20,
    ));

    alarms.push(alarm_with_min_samples(
        "EMBEDDING_RETRIEVAL_LATENCY",
        retrieval.p95_duration_ms,
        1200.0,
        2500.0,
        retrieval.hybrid_requested,
        10,
    ));

    alarms.push(Alarm {
        code: "EMBEDDING_BACKFILL_ERRORS",
        level: level_for(backfill.error_runs as f64, 1.0, 5.0),
        value: backfill.error_runs as f64,
        warning_threshold: 1.0,
        critical_threshold: 5.0,
        samples: 0,
    });

    alarms
}

fn level_for(value: f64, warning: f64, critical: f64) -> AlarmLevel {
    if value >= critical {
        AlarmLevel::Critical
    } else if value >= warning {
        AlarmLevel::Warning
    } else {
        AlarmLevel::Ok
    }
}

fn alarm_with_min_samples(code: &'static str, value: f64, warning: f64, critical: f64, samples: i64, min_samples: i64) -> Alarm {
    let level = if samples < min_samples { AlarmLevel::Ok } else { level_for(value, warning, critical) };
    Alarm { code, level, value, warning_threshold: warning, critical_threshold: critical, samples }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        mem_core::schema::ensure(&conn).unwrap();
        crate::schema::ensure(&conn).unwrap();
        conn
    }

    #[test]
    fn percentile_matches_known_values() {
        let sorted = vec![10, 20, 30, 40, 100];
        assert_eq!(percentile(&sorted, 0.5), 30.0);
        assert_eq!(percentile(&sorted, 0.0), 10.0);
        assert_eq!(percentile(&sorted, 1.0), 100.0);
    }

    #[test]
    fn empty_snapshot_is_healthy() {
        let conn = setup();
        let obs = Observability::new(&conn);
        let snap = obs.snapshot(&SnapshotScope::default(), &NoUsageLoader, now()).unwrap();
        assert_eq!(snap.overall_health, OverallHealth::Healthy);
        assert!(!snap.cost.available);
    }

    #[test]
    fn dead_letter_rate_below_min_samples_does_not_alarm() {
        let conn = setup();
        for i in 0..19 {
            conn.execute(
                "INSERT INTO memory_embedding_job_metrics (job_id, memory_id, model, outcome, duration_ms, attempt, created_at) \
                 VALUES (?1, 'm', 'model-a', 'dead_letter', 10, 1, ?2)",
                params![i, now().to_rfc3339()],
            )
            .unwrap();
        }
        let obs = Observability::new(&conn);
        let snap = obs.snapshot(&SnapshotScope::default(), &NoUsageLoader, now()).unwrap();
        let alarm = snap.alarms.iter().find(|a| a.code == "EMBEDDING_DEAD_LETTER_RATE").unwrap();
        assert_eq!(alarm.level, AlarmLevel::Ok);
    }

    #[test]
    fn dead_letter_rate_above_critical_with_enough_samples_alarms_critical() {
        let conn = setup();
        for i in 0..20 {
            let outcome = if i < 2 { "success" } else { "dead_letter" };
            conn.execute(
                "INSERT INTO memory_embedding_job_metrics (job_id, memory_id, model, outcome, duration_ms, attempt, created_at) \
                 VALUES (?1, 'm', 'model-a', ?2, 10, 1, ?3)",
                params![i, outcome, now().to_rfc3339()],
            )
            .unwrap();
        }
        let obs = Observability::new(&conn);
        let snap = obs.snapshot(&SnapshotScope::default(), &NoUsageLoader, now()).unwrap();
        let alarm = snap.alarms.iter().find(|a| a.code == "EMBEDDING_DEAD_LETTER_RATE").unwrap();
        assert_eq!(alarm.level, AlarmLevel::Critical);
        assert_eq!(snap.overall_health, OverallHealth::Critical);
    }

    #[test]
    fn retrieval_fallback_rate_below_min_samples_does_not_alarm() {
        let conn = setup();
        for _ in 0..19 {
            conn.execute(
                "INSERT INTO graph_rollout_metrics (tenant_id, project_id, user_id, used_fallback, fallback_reason, duration_ms, created_at) \
                 VALUES (NULL, NULL, NULL, 1, 'fts5 syntax error', 10, ?1)",
                params![now().to_rfc3339()],
            )
            .unwrap();
        }
        let obs = Observability::new(&conn);
        let snap = obs.snapshot(&SnapshotScope::default(), &NoUsageLoader, now()).unwrap();
        let alarm = snap.alarms.iter().find(|a| a.code == "EMBEDDING_RETRIEVAL_FALLBACK_RATE").unwrap();
        assert_eq!(alarm.level, AlarmLevel::Ok);
    }

    #[test]
    fn retrieval_fallback_rate_above_critical_with_enough_samples_alarms_critical() {
        let conn = setup();
        for i in 0..20 {
            let used_fallback = if i < 18 { 1 } else { 0 };
            conn.execute(
                "INSERT INTO graph_rollout_metrics (tenant_id, project_id, user_id, used_fallback, fallback_reason, duration_ms, created_at) \
                 VALUES (NULL, NULL, NULL, ?1, 'fts5 syntax error', 10, ?2)",
                params![used_fallback, now().to_rfc3339()],
            )
            .unwrap();
        }
        let obs = Observability::new(&conn);
        let snap = obs.snapshot(&SnapshotScope::default(), &NoUsageLoader, now()).unwrap();
        let alarm = snap.alarms.iter().find(|a| a.code == "EMBEDDING_RETRIEVAL_FALLBACK_RATE").unwrap();
        assert_eq!(alarm.level, AlarmLevel::Critical);
        assert_eq!(snap.retrieval.last_fallback_reason.as_deref(), Some("fts5 syntax error"));
        assert_eq!(snap.overall_health, OverallHealth::Critical);
    }

    #[test]
    fn retrieval_latency_above_critical_alarms_with_fewer_required_samples() {
        let conn = setup();
        for i in 0..10 {
            conn.execute(
                "INSERT INTO graph_rollout_metrics (tenant_id, project_id, user_id, used_fallback, fallback_reason, duration_ms, created_at) \
                 VALUES (NULL, NULL, NULL, 0, NULL, 3000, ?1)",
                params![(now() - Duration::seconds(i)).to_rfc3339()],
            )
            .unwrap();
        }
        let obs = Observability::new(&conn);
        let snap = obs.snapshot(&SnapshotScope::default(), &NoUsageLoader, now()).unwrap();
        let alarm = snap.alarms.iter().find(|a| a.code == "EMBEDDING_RETRIEVAL_LATENCY").unwrap();
        assert_eq!(alarm.level, AlarmLevel::Critical);
        let fallback_alarm = snap.alarms.iter().find(|a| a.code == "EMBEDDING_RETRIEVAL_FALLBACK_RATE").unwrap();
        assert_eq!(fallback_alarm.level, AlarmLevel::Ok, "fallback rate alarm needs 20 samples, latency needs 10");
    }

    #[test]
    fn stale_processing_triggers_warning() {
        let conn = setup();
        conn.execute(
            "INSERT INTO memory_embedding_jobs \
             (memory_id, model, operation, status, attempt_count, max_attempts, next_attempt_at, \
              claimed_by, claimed_at, created_at, updated_at) \
             VALUES ('m1', 'model-a', 'add', 'processing', 0, 5, ?1, 'w1', ?1, ?1, ?1)",
            params![(now() - Duration::minutes(10)).to_rfc3339()],
        )
        .unwrap();
        let obs = Observability::new(&conn);
        let snap = obs.snapshot(&SnapshotScope::default(), &NoUsageLoader, now()).unwrap();
        assert_eq!(snap.queue.stale_processing_count, 1);
        let alarm = snap.alarms.iter().find(|a| a.code == "EMBEDDING_STALE_JOBS").unwrap();
        assert_eq!(alarm.level, AlarmLevel::Warning);
    }
}
