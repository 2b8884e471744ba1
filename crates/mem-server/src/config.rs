//! Server configuration from environment variables (§6 "Environment
//! variables"), following `am-cli`'s pattern of typed defaults with a
//! warn-and-fall-back-to-default on parse failure.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: String,
    pub bind_addr: String,

    pub mcp_max_connections_per_key: usize,
    pub mcp_max_connections_per_ip: usize,
    pub mcp_session_idle: Duration,

    pub working_memory_ttl_hours: f64,

    pub embedding_job_max_attempts: i64,
    pub embedding_retry_base: Duration,
    pub embedding_retry_max: Duration,
    pub embedding_processing_timeout: Duration,
    pub embedding_worker_batch_size: usize,
    pub embedding_backfill_batch_size: usize,
    pub embedding_backfill_throttle: Duration,
    pub default_embedding_model_id: String,

    pub ai_gateway_api_key: Option<String>,
    pub ai_gateway_base_url: Option<String>,

    pub openclaw_file_mode_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: "mem.db".to_string(),
            bind_addr: "0.0.0.0:8787".to_string(),
            mcp_max_connections_per_key: 5,
            mcp_max_connections_per_ip: 20,
            mcp_session_idle: Duration::from_secs(15 * 60),
            working_memory_ttl_hours: 24.0,
            embedding_job_max_attempts: 5,
            embedding_retry_base: Duration::from_millis(500),
            embedding_retry_max: Duration::from_secs(60),
            embedding_processing_timeout: Duration::from_secs(5 * 60),
            embedding_worker_batch_size: 10,
            embedding_backfill_batch_size: 100,
            embedding_backfill_throttle: Duration::from_millis(0),
            default_embedding_model_id: "text-embedding-3-small".to_string(),
            ai_gateway_api_key: None,
            ai_gateway_base_url: None,
            openclaw_file_mode_enabled: false,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            db_path: env::var("MEM_DB_PATH").unwrap_or(default.db_path),
            bind_addr: env::var("MEM_BIND_ADDR").unwrap_or(default.bind_addr),
            mcp_max_connections_per_key: env_usize("MCP_MAX_CONNECTIONS_PER_KEY", default.mcp_max_connections_per_key),
            mcp_max_connections_per_ip: env_usize("MCP_MAX_CONNECTIONS_PER_IP", default.mcp_max_connections_per_ip),
            mcp_session_idle: env_duration_ms("MCP_SESSION_IDLE_MS", default.mcp_session_idle),
            working_memory_ttl_hours: env_f64("MEMORIES_WORKING_MEMORY_TTL_HOURS")
                .or_else(|| env_f64("MCP_WORKING_MEMORY_TTL_HOURS"))
                .unwrap_or(default.working_memory_ttl_hours),
            embedding_job_max_attempts: env_i64("SDK_EMBEDDING_JOB_MAX_ATTEMPTS", default.embedding_job_max_attempts),
            embedding_retry_base: env_duration_ms("SDK_EMBEDDING_JOB_RETRY_BASE_MS", default.embedding_retry_base),
            embedding_retry_max: env_duration_ms("SDK_EMBEDDING_JOB_RETRY_MAX_MS", default.embedding_retry_max),
            embedding_processing_timeout: env_duration_ms("SDK_EMBEDDING_JOB_PROCESSING_TIMEOUT_MS", default.embedding_processing_timeout),
            embedding_worker_batch_size: env_usize("SDK_EMBEDDING_JOB_WORKER_BATCH_SIZE", default.embedding_worker_batch_size),
            embedding_backfill_batch_size: env_usize("SDK_EMBEDDING_JOB_BACKFILL_BATCH_SIZE", default.embedding_backfill_batch_size),
            embedding_backfill_throttle: env_duration_ms("SDK_EMBEDDING_JOB_BACKFILL_THROTTLE_MS", default.embedding_backfill_throttle),
            default_embedding_model_id: env::var("SDK_DEFAULT_EMBEDDING_MODEL_ID").unwrap_or(default.default_embedding_model_id),
            ai_gateway_api_key: env::var("AI_GATEWAY_API_KEY").ok(),
            ai_gateway_base_url: env::var("AI_GATEWAY_BASE_URL").ok(),
            openclaw_file_mode_enabled: env::var("MEMORY_OPENCLAW_FILE_MODE_ENABLED").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!("{key}={v:?} is not a valid usize, using default {default}");
            default
        }),
        Err(_) => default,
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    match env::var(key) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!("{key}={v:?} is not a valid integer, using default {default}");
            default
        }),
        Err(_) => default,
    }
}

fn env_f64(key: &str) -> Option<f64> {
    match env::var(key) {
        Ok(v) => match v.parse() {
            Ok(n) => Some(n),
            Err(_) => {
                tracing::warn!("{key}={v:?} is not a valid number, ignoring");
                None
            }
        },
        Err(_) => None,
    }
}

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    match env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .map(Duration::from_millis)
            .unwrap_or_else(|_| {
                tracing::warn!("{key}={v:?} is not a valid millisecond duration, using default {default:?}");
                default
            }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.mcp_max_connections_per_key, 5);
        assert_eq!(cfg.mcp_max_connections_per_ip, 20);
        assert_eq!(cfg.mcp_session_idle, Duration::from_secs(900));
        assert_eq!(cfg.working_memory_ttl_hours, 24.0);
    }
}
