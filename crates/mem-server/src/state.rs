//! Shared process-wide state (§5 "Shared resources"): the tenant database
//! pool, the router (API-key/tenant-routing) database, the embedding
//! provider, and the per-tenant stream-buffer maps.

use std::sync::Arc;

use dashmap::DashMap;
use mem_core::StreamBuffer;
use rusqlite::Connection;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::mcp::ConnectionRegistry;
use crate::pool::TenantPool;

/// The control-plane database: `mcp_api_keys` / `sdk_tenant_databases`
/// (§4.11). Kept separate from tenant data files so a tenant's own SQLite
/// file never needs routing metadata mixed into it.
pub struct RouterDb {
    pub conn: AsyncMutex<Connection>,
}

impl RouterDb {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        crate::schema::ensure(&conn)?;
        Ok(Self { conn: AsyncMutex::new(conn) })
    }
}

pub struct AppState {
    pub config: ServerConfig,
    pub router_db: RouterDb,
    pub tenant_pool: TenantPool,
    pub provider: Arc<dyn mem_embed::EmbeddingProvider>,
    pub connections: ConnectionRegistry,
    stream_buffers: DashMap<String, Arc<StreamBuffer>>,
}

impl AppState {
    pub fn new(config: ServerConfig, router_db: RouterDb, tenant_pool: TenantPool, provider: Arc<dyn mem_embed::EmbeddingProvider>) -> Self {
        Self {
            config,
            router_db,
            tenant_pool,
            provider,
            connections: ConnectionRegistry::new(),
            stream_buffers: DashMap::new(),
        }
    }

    pub fn stream_buffer(&self, db_key: &str) -> Arc<StreamBuffer> {
        self.stream_buffers.entry(db_key.to_string()).or_insert_with(|| Arc::new(StreamBuffer::new())).clone()
    }

    pub fn stream_buffer_keys(&self) -> Vec<String> {
        self.stream_buffers.iter().map(|e| e.key().clone()).collect()
    }
}
