//! Tenancy Router & Model Selection (C11, §4.11).

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};

use mem_core::ErrorKind;

use crate::error::{ApiError, Result};

#[derive(Debug, Clone)]
pub struct TenantContext {
    pub owner_user_id: String,
    pub owner_scope_key: String,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
}

pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// §4.11 "Authenticate(apiKey)": validate format, hash, look up, reject
/// expired keys.
pub fn authenticate(conn: &Connection, api_key: &str, now: DateTime<Utc>) -> Result<TenantContext> {
    if api_key.trim().is_empty() {
        return Err(ApiError::new(ErrorKind::AuthError, "MISSING_API_KEY", "missing API key", false));
    }
    if api_key.len() < 16 {
        return Err(ApiError::new(ErrorKind::AuthError, "INVALID_API_KEY_FORMAT", "API key is malformed", false));
    }

    let hash = hash_api_key(api_key);
    let row: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT owner_user_id, owner_scope_key, expires_at FROM mcp_api_keys WHERE api_key_hash=?1",
            params![hash],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(ApiError::from)?;

    let Some((owner_user_id, owner_scope_key, expires_at)) = row else {
        return Err(ApiError::new(ErrorKind::AuthError, "INVALID_API_KEY", "no such API key", false));
    };

    if let Some(exp) = expires_at {
        if let Ok(exp) = DateTime::parse_from_rfc3339(&exp) {
            if exp.with_timezone(&Utc) <= now {
                return Err(ApiError::new(ErrorKind::AuthError, "API_KEY_EXPIRED", "API key has expired", false));
            }
        }
    }

    Ok(TenantContext { owner_user_id, owner_scope_key, project_id: None, user_id: None })
}

/// §4.11 "ResolveTenant(apiKeyHash, tenantId)".
pub fn resolve_tenant(conn: &Connection, api_key_hash: &str, tenant_id: &str) -> Result<TenantContext> {
    let row: Option<(String, String, Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT status, owner_scope_key, project_id, user_id FROM sdk_tenant_databases \
             WHERE api_key_hash=?1 AND tenant_id=?2",
            params![api_key_hash, tenant_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(ApiError::from)?;

    let Some((status, owner_scope_key, project_id, user_id)) = row else {
        return Err(ApiError::new(ErrorKind::NotFoundError, "TENANT_DATABASE_NOT_CONFIGURED", format!("no tenant database for '{tenant_id}'"), false));
    };

    if status != "ready" {
        return Err(ApiError::new(ErrorKind::ToolError, "TENANT_DATABASE_NOT_READY", format!("tenant database '{tenant_id}' is {status}"), true));
    }
    if owner_scope_key.is_empty() {
        return Err(ApiError::new(ErrorKind::NotFoundError, "TENANT_DATABASE_CREDENTIALS_MISSING", "tenant database is missing credentials", false));
    }

    Ok(TenantContext { owner_user_id: owner_scope_key.clone(), owner_scope_key, project_id, user_id })
}

/// §4.11 "PerRequestRouting": `tenant_id` in tool args takes priority, then
/// `project_id` re-resolution, else the caller's default context.
pub fn route_for_request(
    conn: &Connection,
    api_key_hash: &str,
    default: &TenantContext,
    tenant_id: Option<&str>,
    project_id: Option<&str>,
) -> Result<TenantContext> {
    if let Some(tenant_id) = tenant_id {
        return resolve_tenant(conn, api_key_hash, tenant_id);
    }
    if let Some(project_id) = project_id {
        return Ok(TenantContext { project_id: Some(project_id.to_string()), ..default.clone() });
    }
    Ok(default.clone())
}

/// §4.11 "Model selection": priority `request override -> project override
/// -> workspace default -> workspace tenant default -> system default`.
pub fn select_embedding_model(
    request_override: Option<&str>,
    project_override: Option<&str>,
    workspace_default: Option<&str>,
    workspace_tenant_default: Option<&str>,
    system_default: &str,
) -> String {
    request_override
        .or(project_override)
        .or(workspace_default)
        .or(workspace_tenant_default)
        .unwrap_or(system_default)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::schema::ensure(&conn).unwrap();
        conn
    }

    #[test]
    fn empty_key_is_rejected_as_missing() {
        let conn = setup();
        let err = authenticate(&conn, "", now()).unwrap_err();
        assert_eq!(err.detail.code, "MISSING_API_KEY");
    }

    #[test]
    fn short_key_is_rejected_as_malformed() {
        let conn = setup();
        let err = authenticate(&conn, "short", now()).unwrap_err();
        assert_eq!(err.detail.code, "INVALID_API_KEY_FORMAT");
    }

    #[test]
    fn unknown_key_is_rejected() {
        let conn = setup();
        let err = authenticate(&conn, "a-long-enough-fake-api-key", now()).unwrap_err();
        assert_eq!(err.detail.code, "INVALID_API_KEY");
    }

    #[test]
    fn expired_key_is_rejected() {
        let conn = setup();
        let key = "a-long-enough-fake-api-key";
        let hash = hash_api_key(key);
        conn.execute(
            "INSERT INTO mcp_api_keys (api_key_hash, owner_user_id, owner_scope_key, expires_at, created_at) VALUES (?1, 'u1', 'scope1', ?2, ?3)",
            params![hash, (now() - Duration::hours(1)).to_rfc3339(), now().to_rfc3339()],
        )
        .unwrap();

        let err = authenticate(&conn, key, now()).unwrap_err();
        assert_eq!(err.detail.code, "API_KEY_EXPIRED");
    }

    #[test]
    fn valid_key_resolves_context() {
        let conn = setup();
        let key = "a-long-enough-fake-api-key";
        let hash = hash_api_key(key);
        conn.execute(
            "INSERT INTO mcp_api_keys (api_key_hash, owner_user_id, owner_scope_key, expires_at, created_at) VALUES (?1, 'u1', 'scope1', NULL, ?2)",
            params![hash, now().to_rfc3339()],
        )
        .unwrap();

        let ctx = authenticate(&conn, key, now()).unwrap();
        assert_eq!(ctx.owner_user_id, "u1");
    }

    #[test]
    fn resolve_tenant_rejects_unready_status() {
        let conn = setup();
        conn.execute(
            "INSERT INTO sdk_tenant_databases (api_key_hash, tenant_id, owner_scope_key, status, created_at) VALUES ('h', 't1', 'scope1', 'provisioning', ?1)",
            params![now().to_rfc3339()],
        )
        .unwrap();
        let err = resolve_tenant(&conn, "h", "t1").unwrap_err();
        assert_eq!(err.detail.code, "TENANT_DATABASE_NOT_READY");
    }

    #[test]
    fn resolve_tenant_rejects_missing_row() {
        let conn = setup();
        let err = resolve_tenant(&conn, "h", "unknown").unwrap_err();
        assert_eq!(err.detail.code, "TENANT_DATABASE_NOT_CONFIGURED");
    }

    #[test]
    fn model_selection_follows_priority_chain() {
        assert_eq!(select_embedding_model(Some("req"), Some("proj"), None, None, "sys"), "req");
        assert_eq!(select_embedding_model(None, Some("proj"), Some("ws"), None, "sys"), "proj");
        assert_eq!(select_embedding_model(None, None, None, None, "sys"), "sys");
    }
}
