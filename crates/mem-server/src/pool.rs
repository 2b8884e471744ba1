//! Tenant database pool.
//!
//! §4.11 speaks of routing to "the correct tenant database" (a separate
//! Turso `(url, token)` pair per tenant in the original). This port keeps
//! `rusqlite` as the one storage engine everywhere and models a tenant
//! database as its own on-disk SQLite file, keyed by the resolved
//! `owner_scope_key` (§4.11 `TenantContext`).
//! A `TenantPool` caches one open `Connection` per key behind a `Mutex`
//! (§5 "every database call ... every connection owns its own ... Turso
//! handle", generalized to "owns its own connection") and records the
//! Schema Guard's "ensured" bit per handle exactly once (§4.1 "Cache
//! 'ensured' state per client handle to skip re-checks").

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use rusqlite::Connection;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::Result;

pub struct TenantHandle {
    pub conn: AsyncMutex<Connection>,
}

pub struct TenantPool {
    data_dir: PathBuf,
    handles: DashMap<String, Arc<TenantHandle>>,
}

impl TenantPool {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), handles: DashMap::new() }
    }

    /// Get-or-open the tenant database for `db_key`, ensuring every
    /// schema-owning crate's tables exist (C1, plus the embedding/session
    /// schema-owning equivalents) exactly once per freshly opened handle.
    pub fn get_or_open(&self, db_key: &str) -> Result<Arc<TenantHandle>> {
        if let Some(existing) = self.handles.get(db_key) {
            return Ok(existing.clone());
        }

        let path = self.db_path(db_key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                crate::error::ApiError::new(
                    mem_core::ErrorKind::InternalError,
                    "TOOL_EXECUTION_FAILED",
                    format!("failed to create tenant data directory: {e}"),
                    false,
                )
            })?;
        }
        let conn = Connection::open(&path)?;
        mem_core::schema::ensure(&conn)?;
        mem_embed::schema::ensure(&conn)?;
        mem_session::schema::ensure(&conn)?;

        let handle = Arc::new(TenantHandle { conn: AsyncMutex::new(conn) });
        self.handles.insert(db_key.to_string(), handle.clone());
        Ok(handle)
    }

    fn db_path(&self, db_key: &str) -> PathBuf {
        let safe: String = db_key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.data_dir.join(format!("{safe}.db"))
    }

    /// Every currently-open tenant key, for background workers that must
    /// sweep every tenant database (embedding worker, inactivity
    /// compaction, stream-buffer cleanup; SPEC_FULL.md "Vacuum is also
    /// reachable as a scheduled/background op").
    pub fn open_keys(&self) -> Vec<String> {
        self.handles.iter().map(|e| e.key().clone()).collect()
    }
}

pub fn default_data_dir() -> PathBuf {
    std::env::var("MEM_DATA_DIR").map(PathBuf::from).unwrap_or_else(|_| Path::new("./mem-data").to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_open_reuses_handle_for_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let pool = TenantPool::new(dir.path());
        let a = pool.get_or_open("tenant-a").unwrap();
        let b = pool.get_or_open("tenant-a").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_keys_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let pool = TenantPool::new(dir.path());
        pool.get_or_open("tenant-a").unwrap();
        pool.get_or_open("tenant-b").unwrap();
        assert!(dir.path().join("tenant-a.db").exists());
        assert!(dir.path().join("tenant-b.db").exists());
    }
}
