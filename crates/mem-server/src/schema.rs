//! Tenancy Router's own tables (§4.11). Deployed over the same embeddable
//! SQL store as everything else (§6 "Persisted state layout"); this crate
//! collapses the original's per-tenant-database routing onto a single file
//! with a `tenant_id`/`owner_scope_key` column, since a single SQLite file
//! is this service's persistence model end to end (see DESIGN.md).

use rusqlite::Connection;

use crate::error::Result;

pub fn ensure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS mcp_api_keys (
            api_key_hash    TEXT PRIMARY KEY,
            owner_user_id   TEXT NOT NULL,
            owner_scope_key TEXT NOT NULL,
            expires_at      TEXT,
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sdk_tenant_databases (
            api_key_hash     TEXT NOT NULL,
            tenant_id        TEXT NOT NULL,
            owner_scope_key  TEXT,
            status           TEXT NOT NULL DEFAULT 'ready',
            project_id       TEXT,
            user_id          TEXT,
            created_at       TEXT NOT NULL,
            PRIMARY KEY (api_key_hash, tenant_id)
        );
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
