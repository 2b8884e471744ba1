//! Schema ownership for the embedding subsystem (§3 ownership note: "The
//! Embedding subsystem exclusively owns job/backfill/metric tables").

use rusqlite::Connection;

use crate::error::Result;

pub fn ensure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS memory_embeddings (
            memory_id      TEXT NOT NULL,
            model          TEXT NOT NULL,
            model_version  TEXT,
            dimension      INTEGER NOT NULL,
            embedding      BLOB NOT NULL,
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL,
            PRIMARY KEY (memory_id, model)
        );

        CREATE TABLE IF NOT EXISTS memory_embedding_jobs (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            memory_id           TEXT NOT NULL,
            model               TEXT NOT NULL,
            model_version       TEXT,
            operation           TEXT NOT NULL,
            status              TEXT NOT NULL DEFAULT 'queued',
            attempt_count       INTEGER NOT NULL DEFAULT 0,
            max_attempts        INTEGER NOT NULL,
            next_attempt_at     TEXT NOT NULL,
            claimed_by          TEXT,
            claimed_at          TEXT,
            last_error          TEXT,
            dead_letter_reason  TEXT,
            dead_letter_at      TEXT,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL,
            UNIQUE (memory_id, model)
        );

        CREATE TABLE IF NOT EXISTS memory_embedding_job_metrics (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id          INTEGER NOT NULL,
            memory_id       TEXT NOT NULL,
            model           TEXT NOT NULL,
            outcome         TEXT NOT NULL,
            duration_ms     INTEGER NOT NULL,
            error_code      TEXT,
            error_message   TEXT,
            attempt         INTEGER NOT NULL,
            created_at      TEXT NOT NULL
        );

        -- One row per (model, project_id-or-'*', user_id-or-'*') scope
        -- (§3, §4.5). `scope_key` is the PK rather than the three columns
        -- directly: SQLite treats NULL as distinct-from-NULL in uniqueness
        -- checks, which would break ON CONFLICT upserts for global/shared
        -- scopes where project_id/user_id are absent.
        CREATE TABLE IF NOT EXISTS memory_embedding_backfill_state (
            scope_key               TEXT PRIMARY KEY,
            model                   TEXT NOT NULL,
            project_id              TEXT,
            user_id                 TEXT,
            status                  TEXT NOT NULL DEFAULT 'idle',
            checkpoint_created_at   TEXT,
            checkpoint_memory_id    TEXT,
            scanned_count           INTEGER NOT NULL DEFAULT 0,
            enqueued_count          INTEGER NOT NULL DEFAULT 0,
            estimated_total         INTEGER NOT NULL DEFAULT 0,
            estimated_remaining     INTEGER NOT NULL DEFAULT 0,
            batch_limit             INTEGER NOT NULL DEFAULT 100,
            throttle_ms             INTEGER NOT NULL DEFAULT 0,
            started_at              TEXT,
            last_run_at             TEXT,
            completed_at            TEXT,
            last_error              TEXT
        );

        CREATE TABLE IF NOT EXISTS memory_embedding_backfill_metrics (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            model       TEXT NOT NULL,
            project_id  TEXT,
            user_id     TEXT,
            status      TEXT NOT NULL,
            scanned     INTEGER NOT NULL,
            enqueued    INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            error       TEXT,
            created_at  TEXT NOT NULL
        );

        -- One row per retrieval call (§4.6 "Retrieval": totals over
        -- graph_rollout_metrics within window). `used_fallback` records
        -- whether `Store::search` downgraded from FTS to LIKE for that call.
        CREATE TABLE IF NOT EXISTS graph_rollout_metrics (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id       TEXT,
            project_id      TEXT,
            user_id         TEXT,
            used_fallback   INTEGER NOT NULL,
            fallback_reason TEXT,
            duration_ms     INTEGER NOT NULL,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_embedding_jobs_status ON memory_embedding_jobs(status, next_attempt_at, created_at);
        CREATE INDEX IF NOT EXISTS idx_graph_rollout_metrics_created_at ON graph_rollout_metrics(created_at);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        ensure(&conn).unwrap();
        ensure(&conn).unwrap();
    }
}
