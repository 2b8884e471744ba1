//! Scope & Schema Guard (C1): idempotent schema evolution plus the filter
//! builders shared by the store and retrieval pipeline.

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::Result;
use crate::model::Layer;

/// Ensure the `memories`, `memory_history`, `memory_links` tables and the
/// `memories_fts` FTS5 index exist, evolving an older schema in place.
/// Idempotent — safe to call on every connection open. Caching "ensured"
/// per client handle is the caller's responsibility (§4.1); this function
/// itself is cheap enough (`CREATE TABLE IF NOT EXISTS` + `ALTER TABLE`
/// probes) to call defensively.
pub fn ensure(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS memories (
            id                  TEXT PRIMARY KEY,
            content             TEXT NOT NULL,
            type                TEXT NOT NULL,
            memory_layer        TEXT,
            scope               TEXT NOT NULL,
            project_id          TEXT,
            user_id             TEXT,
            tags                TEXT NOT NULL DEFAULT '',
            paths               TEXT NOT NULL DEFAULT '',
            category            TEXT,
            metadata            TEXT,
            source_session_id   TEXT,
            confidence          REAL,
            last_confirmed_at   TEXT,
            upsert_key          TEXT,
            superseded_by       TEXT,
            superseded_at       TEXT,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL,
            deleted_at          TEXT,
            expires_at          TEXT
        );

        CREATE TABLE IF NOT EXISTS memory_history (
            memory_id    TEXT NOT NULL,
            changed_at   TEXT NOT NULL,
            change_type  TEXT NOT NULL,
            content      TEXT NOT NULL,
            type         TEXT NOT NULL,
            memory_layer TEXT,
            tags         TEXT NOT NULL DEFAULT '',
            paths        TEXT NOT NULL DEFAULT '',
            category     TEXT,
            metadata     TEXT,
            expires_at   TEXT,
            upsert_key   TEXT,
            PRIMARY KEY (memory_id, changed_at)
        );

        CREATE TABLE IF NOT EXISTS memory_links (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id   TEXT NOT NULL,
            target_id   TEXT NOT NULL,
            link_type   TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            UNIQUE (source_id, target_id, link_type)
        );

        CREATE TABLE IF NOT EXISTS memory_consolidation_runs (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            input_count       INTEGER NOT NULL,
            merged_count      INTEGER NOT NULL,
            superseded_count  INTEGER NOT NULL,
            conflicted_count  INTEGER NOT NULL,
            model             TEXT,
            metadata          TEXT,
            created_at        TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_memories_scope ON memories(user_id, scope, project_id);
        CREATE INDEX IF NOT EXISTS idx_memories_upsert ON memories(scope, project_id, type, upsert_key);
        CREATE INDEX IF NOT EXISTS idx_memory_links_source ON memory_links(source_id);
        ",
    )?;

    // memories_fts: external-content FTS5 table over `content`, kept in
    // sync with triggers so Search's FTS path never needs bespoke
    // bookkeeping (SPEC_FULL.md "SQLite FTS5 contentless-delete consistency").
    let fts_exists: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='memories_fts'",
            [],
            |_| Ok(true),
        )
        .unwrap_or(false);

    if !fts_exists {
        // FTS5 may be unavailable in some sqlite builds; swallow failure here,
        // Search falls back to LIKE (§4.2, §9).
        let _ = conn.execute_batch(
            "
            CREATE VIRTUAL TABLE memories_fts USING fts5(
                content, content='memories', content_rowid='rowid'
            );

            CREATE TRIGGER memories_ai AFTER INSERT ON memories BEGIN
                INSERT INTO memories_fts(rowid, content) VALUES (new.rowid, new.content);
            END;

            CREATE TRIGGER memories_ad AFTER DELETE ON memories BEGIN
                INSERT INTO memories_fts(memories_fts, rowid, content) VALUES ('delete', old.rowid, old.content);
            END;

            CREATE TRIGGER memories_au AFTER UPDATE ON memories BEGIN
                INSERT INTO memories_fts(memories_fts, rowid, content) VALUES ('delete', old.rowid, old.content);
                INSERT INTO memories_fts(rowid, content) VALUES (new.rowid, new.content);
            END;
            ",
        );
    }

    Ok(())
}

/// `(clause, args)` pair for the Active filter (§4.1).
pub fn active_clause() -> &'static str {
    "(deleted_at IS NULL AND (expires_at IS NULL OR expires_at > ?))"
}

/// `(clause, args)` pair for the user-scope filter (§4.1).
pub fn user_scope_clause(user_id: &Option<String>) -> (&'static str, Vec<String>) {
    match user_id {
        Some(uid) => ("(user_id IS NULL OR user_id = ?)", vec![uid.clone()]),
        None => ("user_id IS NULL", vec![]),
    }
}

/// Layer filter clause (§4.1): rule matches `memory_layer='rule' OR type='rule'`;
/// long_term matches `memory_layer='long_term' OR (memory_layer IS NULL AND type != 'rule')`.
pub fn layer_clause(layers: &[Layer]) -> Option<String> {
    if layers.is_empty() {
        return None;
    }
    let mut parts = Vec::new();
    for layer in layers {
        let part = match layer {
            Layer::Rule => "(memory_layer = 'rule' OR type = 'rule')".to_string(),
            Layer::Working => "(memory_layer = 'working')".to_string(),
            Layer::LongTerm => {
                "(memory_layer = 'long_term' OR (memory_layer IS NULL AND type != 'rule'))".to_string()
            }
        };
        if !parts.contains(&part) {
            parts.push(part);
        }
    }
    Some(format!("({})", parts.join(" OR ")))
}

pub fn now_str(now: DateTime<Utc>) -> String {
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
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn layer_clause_rule_matches_type_rule_fallback() {
        let clause = layer_clause(&[Layer::Rule]).unwrap();
        assert!(clause.contains("type = 'rule'"));
    }

    #[test]
    fn layer_clause_empty_is_none() {
        assert!(layer_clause(&[]).is_none());
    }
}
