//! MCP Transport (C10): SSE session lifecycle, JSON-RPC dispatch, per-key/
//! per-IP caps, idle timeout (§4.10, §5, §6).

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};

use mem_core::ErrorKind;

use crate::auth::{self, TenantContext};
use crate::error::ApiError;
use crate::rpc::{JsonRpcRequest, JsonRpcResponse, error_response, initialize_result, method_not_found, tools_list_result};
use crate::state::AppState;
use crate::tools::{self, ToolContext};

struct ConnectionEntry {
    api_key_hash: String,
    ip: String,
    tenant: TenantContext,
    db_key: String,
    tx: mpsc::UnboundedSender<String>,
    notify: Arc<Notify>,
}

/// Process-wide SSE session map (§5 "the active-connections map ... is
/// process-wide; all reads/writes must be serialized or use a concurrent
/// map"). Each entry owns its own sender and idle-reset `Notify`.
pub struct ConnectionRegistry {
    conns: DashMap<String, Arc<ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self { conns: DashMap::new() }
    }

    fn count_for_key(&self, api_key_hash: &str) -> usize {
        self.conns.iter().filter(|e| e.value().api_key_hash == api_key_hash).count()
    }

    fn count_for_ip(&self, ip: &str) -> usize {
        self.conns.iter().filter(|e| e.value().ip == ip).count()
    }

    pub fn check_caps(&self, api_key_hash: &str, ip: &str, max_per_key: usize, max_per_ip: usize) -> Result<(), ApiError> {
        if self.count_for_key(api_key_hash) >= max_per_key {
            return Err(rate_limit_error("TOO_MANY_KEY_SESSIONS", "too many sessions for this API key"));
        }
        if self.count_for_ip(ip) >= max_per_ip {
            return Err(rate_limit_error("TOO_MANY_IP_SESSIONS", "too many sessions from this IP"));
        }
        Ok(())
    }

    fn insert(&self, session_id: String, entry: Arc<ConnectionEntry>) {
        self.conns.insert(session_id, entry);
    }

    fn get(&self, session_id: &str) -> Option<Arc<ConnectionEntry>> {
        self.conns.get(session_id).map(|e| e.clone())
    }

    fn remove(&self, session_id: &str) {
        self.conns.remove(session_id);
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn rate_limit_error(code: &'static str, msg: &'static str) -> ApiError {
    ApiError::new(ErrorKind::RateLimitError, code, msg, true)
}

fn bearer_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[derive(Debug, Deserialize, Default)]
pub struct SessionQuery {
    pub session: Option<String>,
}

/// `GET /api/mcp`: public descriptor without a key, SSE channel with one.
pub async fn get_mcp(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(api_key) = bearer_key(&headers) else {
        return Json(serde_json::json!({"status": "ok", "name": "mem-serve", "version": env!("CARGO_PKG_VERSION"), "transport": "sse"})).into_response();
    };

    let now = Utc::now();
    let router_conn = state.router_db.conn.lock().await;
    let auth_result = auth::authenticate(&router_conn, &api_key, now);
    drop(router_conn);

    let tenant = match auth_result {
        Ok(t) => t,
        Err(e) => return api_error_response(e),
    };

    let api_key_hash = auth::hash_api_key(&api_key);
    let ip = client_ip(&headers);
    if let Err(e) = state.connections.check_caps(&api_key_hash, &ip, state.config.mcp_max_connections_per_key, state.config.mcp_max_connections_per_ip) {
        return api_error_response(e);
    }

    let session_id = mem_core::id::new_id();
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let notify = Arc::new(Notify::new());

    let entry = Arc::new(ConnectionEntry {
        api_key_hash,
        ip,
        tenant: tenant.clone(),
        db_key: tenant.owner_scope_key.clone(),
        tx: tx.clone(),
        notify: notify.clone(),
    });
    state.connections.insert(session_id.clone(), entry);

    let endpoint_frame = format!("/api/mcp?session={session_id}");
    let _ = tx.send(format!("event: endpoint\ndata: {}\n\n", serde_json::to_string(&endpoint_frame).unwrap_or_default()));

    spawn_idle_watcher(state.clone(), session_id.clone(), notify, state.config.mcp_session_idle);

    let stream = make_sse_stream(rx);
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn make_sse_stream(mut rx: mpsc::UnboundedReceiver<String>) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        while let Some(frame) = rx.recv().await {
            yield Ok(Event::default().data(frame));
        }
    }
}

fn spawn_idle_watcher(state: Arc<AppState>, session_id: String, notify: Arc<Notify>, idle: StdDuration) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(idle) => {
                    if let Some(entry) = state.connections.get(&session_id) {
                        let _ = entry.tx.send("event: session_closed\ndata: {\"reason\":\"idle_timeout\"}\n\n".to_string());
                    }
                    state.connections.remove(&session_id);
                    break;
                }
                _ = notify.notified() => {
                    // touched: loop again and restart the idle clock
                }
            }
        }
    });
}

fn api_error_response(err: ApiError) -> Response {
    let status = StatusCode::from_u16(err.detail.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Json(mem_core::ToolEnvelope::err("mcp", err.detail.clone(), Utc::now()).to_flattened_json()).into_response();
    *response.status_mut() = status;
    if err.detail.code == "TOO_MANY_KEY_SESSIONS" || err.detail.code == "TOO_MANY_IP_SESSIONS" {
        response.headers_mut().insert("Retry-After", "60".parse().unwrap());
    }
    response
}

/// `POST /api/mcp[?session=<id>]`: JSON-RPC request/response, optionally
/// echoed onto the SSE stream when a session is open.
pub async fn post_mcp(State(state): State<Arc<AppState>>, Query(q): Query<SessionQuery>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(_) => return Json(JsonRpcResponse::parse_error()).into_response(),
    };
    if request.method.is_empty() {
        return Json(JsonRpcResponse::invalid_request(request.id.clone())).into_response();
    }

    let now = Utc::now();

    let resolved = match resolve_session(&state, q.session.as_deref(), &headers, now).await {
        Ok(v) => v,
        Err(e) => return Json(error_response(request.id.clone(), e)).into_response(),
    };

    if request.method == "notifications/initialized" {
        return StatusCode::NO_CONTENT.into_response();
    }

    let session_entry = resolved.session_entry.clone();
    let response = handle_method(&state, &resolved, &request, now).await;

    if let Some(entry) = &session_entry {
        entry.notify.notify_one();
        if let Ok(text) = serde_json::to_string(&response) {
            let _ = entry.tx.send(format!("event: message\ndata: {text}\n\n"));
        }
    }

    Json(response).into_response()
}

struct ResolvedSession {
    tenant: TenantContext,
    db_key: String,
    api_key_hash: String,
    session_entry: Option<Arc<ConnectionEntry>>,
}

async fn resolve_session(
    state: &Arc<AppState>,
    session: Option<&str>,
    headers: &HeaderMap,
    now: chrono::DateTime<Utc>,
) -> Result<ResolvedSession, ApiError> {
    if let Some(session_id) = session
        && let Some(entry) = state.connections.get(session_id)
    {
        return Ok(ResolvedSession {
            tenant: entry.tenant.clone(),
            db_key: entry.db_key.clone(),
            api_key_hash: entry.api_key_hash.clone(),
            session_entry: Some(entry),
        });
    }

    let Some(api_key) = bearer_key(headers) else {
        return Err(ApiError::new(ErrorKind::AuthError, "MISSING_API_KEY", "missing API key", false));
    };
    let router_conn = state.router_db.conn.lock().await;
    let tenant = auth::authenticate(&router_conn, &api_key, now)?;
    let api_key_hash = auth::hash_api_key(&api_key);
    Ok(ResolvedSession { db_key: tenant.owner_scope_key.clone(), tenant, api_key_hash, session_entry: None })
}

async fn handle_method(
    state: &Arc<AppState>,
    resolved: &ResolvedSession,
    request: &JsonRpcRequest,
    now: chrono::DateTime<Utc>,
) -> JsonRpcResponse {
    match request.method.as_str() {
        "initialize" => JsonRpcResponse::ok(request.id.clone(), initialize_result()),
        "ping" => JsonRpcResponse::ok(request.id.clone(), serde_json::json!({})),
        "tools/list" => JsonRpcResponse::ok(request.id.clone(), tools_list_result()),
        "tools/call" => handle_tools_call(state, resolved, request, now).await,
        other => method_not_found(request.id.clone(), other),
    }
}

async fn handle_tools_call(
    state: &Arc<AppState>,
    resolved: &ResolvedSession,
    request: &JsonRpcRequest,
    now: chrono::DateTime<Utc>,
) -> JsonRpcResponse {
    let Some(tool_name) = request.params.get("name").and_then(|v| v.as_str()) else {
        return error_response(
            request.id.clone(),
            ApiError::new(ErrorKind::ValidationError, "TOOL_NOT_FOUND", "missing tool name", false),
        );
    };
    let empty = Value::Object(Default::default());
    let args = request.params.get("arguments").unwrap_or(&empty);

    // §4.11 "PerRequestRouting": tenant_id/project_id in tool args re-resolve
    // the effective tenant context for just this call.
    let router_tenant_id = args.get("tenant_id").and_then(|v| v.as_str());
    let router_project_id = args.get("project_id").and_then(|v| v.as_str());

    let routed = if router_tenant_id.is_some() || router_project_id.is_some() {
        let router_conn = state.router_db.conn.lock().await;
        match auth::route_for_request(&router_conn, &resolved.api_key_hash, &resolved.tenant, router_tenant_id, router_project_id) {
            Ok(t) => t,
            Err(e) => return error_response(request.id.clone(), e),
        }
    } else {
        resolved.tenant.clone()
    };

    let effective_db_key = if router_tenant_id.is_some() { routed.owner_scope_key.clone() } else { resolved.db_key.clone() };

    let handle = match state.tenant_pool.get_or_open(&effective_db_key) {
        Ok(h) => h,
        Err(e) => return error_response(request.id.clone(), e),
    };
    let conn_guard = handle.conn.lock().await;

    let ctx = ToolContext {
        conn: &conn_guard,
        tenant: &routed,
        default_model: &state.config.default_embedding_model_id,
        working_memory_ttl_hours: state.config.working_memory_ttl_hours,
    };

    match tools::dispatch(tool_name, args, &ctx, now) {
        Ok(data) => {
            let tool_result = serde_json::json!({
                "content": [{"type": "text", "text": data.to_string()}],
                "structuredContent": data,
            });
            JsonRpcResponse::ok(request.id.clone(), tool_result)
        }
        Err(e) => error_response(request.id.clone(), e),
    }
}

pub async fn options_mcp() -> Response {
    StatusCode::NO_CONTENT.into_response()
}
