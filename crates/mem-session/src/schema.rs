//! Schema ownership for the session machine (§3 ownership note: "The
//! Session machine owns session tables but may write a checkpoint row
//! through the Memory Store for WAL compaction").

use rusqlite::Connection;

use crate::error::Result;

pub fn ensure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS memory_sessions (
            id                TEXT PRIMARY KEY,
            scope             TEXT NOT NULL,
            project_id        TEXT,
            user_id           TEXT,
            client            TEXT,
            status            TEXT NOT NULL DEFAULT 'active',
            title             TEXT,
            metadata          TEXT,
            started_at        TEXT NOT NULL,
            last_activity_at  TEXT NOT NULL,
            ended_at          TEXT
        );

        CREATE TABLE IF NOT EXISTS memory_session_events (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id     TEXT NOT NULL,
            role           TEXT NOT NULL,
            kind           TEXT NOT NULL,
            content        TEXT NOT NULL,
            token_count    INTEGER,
            turn_index     INTEGER,
            is_meaningful  INTEGER NOT NULL DEFAULT 1,
            created_at     TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS memory_session_snapshots (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id      TEXT NOT NULL,
            slug            TEXT NOT NULL,
            source_trigger  TEXT NOT NULL,
            transcript_md   TEXT NOT NULL,
            message_count   INTEGER NOT NULL,
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS memory_compaction_events (
            id                    INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id            TEXT NOT NULL,
            trigger_type          TEXT NOT NULL,
            reason                TEXT,
            token_count_before    INTEGER NOT NULL,
            turn_count_before     INTEGER NOT NULL,
            summary_tokens        INTEGER NOT NULL,
            checkpoint_memory_id  TEXT,
            created_at            TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_session_events_session ON memory_session_events(session_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_sessions_status_activity ON memory_sessions(status, last_activity_at);
        ",
    )?;
    Ok(())
}

pub fn now_str(now: chrono::DateTime<chrono::Utc>) -> String {
    now.to_rfc3339()
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
