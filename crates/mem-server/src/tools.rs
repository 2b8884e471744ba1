//! Tool catalog and dispatch for the MCP surface's nine tools (§4.11's
//! per-request routing feeds this module a `TenantContext`; §4.12 governs
//! the envelope every tool result carries).

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::{Value, json};

use mem_core::{
    AddOptions, ConsolidateOptions, ContextMode, ContextOptions, ErrorKind, ForgetFilter, Layer,
    ListOptions, Memory, MemoryType, Retriever, RuleOptions, Scope, SearchOptions, Store,
    ToolEnvelope, UpdateRequest,
};
use mem_embed::{EmbeddingQueue, JobOperation, RetrievalRecord, RetryPolicy, record_retrieval};

use crate::auth::TenantContext;
use crate::error::{ApiError, Result};

fn val_str(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(|x| x.as_str()).map(|s| s.to_string())
}

fn val_f64(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(|x| x.as_f64())
}

fn val_bool(v: &Value, key: &str) -> bool {
    v.get(key).and_then(|x| x.as_bool()).unwrap_or(false)
}

fn val_str_vec(v: &Value, key: &str) -> Vec<String> {
    v.get(key)
        .and_then(|x| x.as_array())
        .map(|arr| arr.iter().filter_map(|e| e.as_str().map(|s| s.to_string())).collect())
        .unwrap_or_default()
}

fn validation(code: &'static str, msg: impl Into<String>) -> ApiError {
    ApiError::new(ErrorKind::ValidationError, code, msg, false)
}

fn not_found(code: &'static str, msg: impl Into<String>) -> ApiError {
    ApiError::new(ErrorKind::NotFoundError, code, msg, false)
}

fn parse_type(v: &Value, key: &str) -> Result<Option<MemoryType>> {
    match val_str(v, key) {
        None => Ok(None),
        Some(s) => MemoryType::parse(&s).map(Some).map_err(ApiError::from),
    }
}

fn parse_layer(v: &Value, key: &str) -> Result<Option<Layer>> {
    match val_str(v, key) {
        None => Ok(None),
        Some(s) => Layer::parse(&s).map(Some).map_err(ApiError::from),
    }
}

/// Enqueues the `add`/`edit` embedding job for a just-written memory.
/// Fire-and-forget (§4.2 "Embedding enqueue ... failure is logged, never
/// surfaced to callers"): the enqueue itself is synchronous (a local
/// UPSERT) but its *outcome* never changes the tool's response.
fn enqueue_embedding(conn: &Connection, memory: &Memory, model: &str, operation: JobOperation, now: DateTime<Utc>) {
    let queue = EmbeddingQueue::new(conn, RetryPolicy::default());
    if let Err(e) = queue.enqueue(&memory.id, &memory.content, model, operation, None, None, now) {
        tracing::warn!(memory_id = %memory.id, error = %e, "embedding enqueue failed");
    }
}

/// §4.12: the public tool catalog surfaced by `tools/list`.
pub fn catalog() -> Value {
    json!([
        {"name": "get_context", "description": "Assemble rules + retrieved memories for the current turn.",
         "inputSchema": {"type": "object", "properties": {
            "query": {"type": "string"}, "project_id": {"type": "string"}, "user_id": {"type": "string"},
            "tenant_id": {"type": "string"}, "limit": {"type": "number"}, "mode": {"type": "string"}
         }}},
        {"name": "get_rules", "description": "List global-then-project rule memories.",
         "inputSchema": {"type": "object", "properties": {
            "project_id": {"type": "string"}, "user_id": {"type": "string"}, "tenant_id": {"type": "string"}
         }}},
        {"name": "add_memory", "description": "Create or upsert a memory.",
         "inputSchema": {"type": "object", "required": ["content"], "properties": {
            "content": {"type": "string"}, "type": {"type": "string"}, "project_id": {"type": "string"},
            "user_id": {"type": "string"}, "tenant_id": {"type": "string"}, "layer": {"type": "string"},
            "tags": {"type": "array", "items": {"type": "string"}}, "paths": {"type": "array", "items": {"type": "string"}},
            "category": {"type": "string"}, "metadata": {"type": "object"}
         }}},
        {"name": "edit_memory", "description": "Patch fields on an existing memory.",
         "inputSchema": {"type": "object", "required": ["id"], "properties": {
            "id": {"type": "string"}, "content": {"type": "string"}, "type": {"type": "string"},
            "tags": {"type": "array", "items": {"type": "string"}}, "paths": {"type": "array", "items": {"type": "string"}},
            "category": {"type": "string"}, "metadata": {"type": "object"}, "user_id": {"type": "string"},
            "tenant_id": {"type": "string"}
         }}},
        {"name": "forget_memory", "description": "Soft-delete a memory by id.",
         "inputSchema": {"type": "object", "required": ["id"], "properties": {
            "id": {"type": "string"}, "user_id": {"type": "string"}, "tenant_id": {"type": "string"}
         }}},
        {"name": "search_memories", "description": "Full-text search over active memories.",
         "inputSchema": {"type": "object", "required": ["query"], "properties": {
            "query": {"type": "string"}, "project_id": {"type": "string"}, "user_id": {"type": "string"},
            "tenant_id": {"type": "string"}, "type": {"type": "string"}, "layer": {"type": "string"},
            "limit": {"type": "number"}
         }}},
        {"name": "list_memories", "description": "List memories with filters, no text match.",
         "inputSchema": {"type": "object", "properties": {
            "type": {"type": "string"}, "tags": {"type": "array", "items": {"type": "string"}},
            "project_id": {"type": "string"}, "user_id": {"type": "string"}, "tenant_id": {"type": "string"},
            "layer": {"type": "string"}, "limit": {"type": "number"}
         }}},
        {"name": "bulk_forget_memories", "description": "Soft-delete many memories by filter.",
         "inputSchema": {"type": "object", "properties": {
            "types": {"type": "array", "items": {"type": "string"}}, "tags": {"type": "array", "items": {"type": "string"}},
            "older_than_days": {"type": "number"}, "pattern": {"type": "string"}, "project_id": {"type": "string"},
            "user_id": {"type": "string"}, "tenant_id": {"type": "string"}, "dry_run": {"type": "boolean"},
            "all": {"type": "boolean"}
         }}},
        {"name": "vacuum_memories", "description": "Permanently delete soft-deleted memories.",
         "inputSchema": {"type": "object", "properties": {
            "user_id": {"type": "string"}, "tenant_id": {"type": "string"}
         }}},
    ])
}

pub struct ToolContext<'a> {
    pub conn: &'a Connection,
    pub tenant: &'a TenantContext,
    pub default_model: &'a str,
    pub working_memory_ttl_hours: f64,
}

/// Dispatches `tools/call` by name, returning the flattened envelope JSON
/// (§9 "merge the canonical envelope with tool-specific fields").
pub fn dispatch(name: &str, params: &Value, ctx: &ToolContext, now: DateTime<Utc>) -> Result<Value> {
    let tool: &'static str = match name {
        "get_context" => "get_context",
        "get_rules" => "get_rules",
        "add_memory" => "add_memory",
        "edit_memory" => "edit_memory",
        "forget_memory" => "forget_memory",
        "search_memories" => "search_memories",
        "list_memories" => "list_memories",
        "bulk_forget_memories" => "bulk_forget_memories",
        "vacuum_memories" => "vacuum_memories",
        other => {
            return Err(ApiError::new(ErrorKind::ToolError, "TOOL_NOT_FOUND", format!("unknown tool '{other}'"), false));
        }
    };

    let data = match tool {
        "get_context" => get_context(params, ctx, now)?,
        "get_rules" => get_rules(params, ctx, now)?,
        "add_memory" => add_memory(params, ctx, now)?,
        "edit_memory" => edit_memory(params, ctx, now)?,
        "forget_memory" => forget_memory(params, ctx, now)?,
        "search_memories" => search_memories(params, ctx, now)?,
        "list_memories" => list_memories(params, ctx, now)?,
        "bulk_forget_memories" => bulk_forget_memories(params, ctx, now)?,
        "vacuum_memories" => vacuum_memories(params, ctx, now)?,
        _ => unreachable!(),
    };

    Ok(ToolEnvelope::ok(tool, data, now).to_flattened_json())
}

fn effective_user_id(params: &Value, ctx: &ToolContext) -> Option<String> {
    val_str(params, "user_id").or_else(|| ctx.tenant.user_id.clone())
}

fn effective_project_id(params: &Value, ctx: &ToolContext) -> Option<String> {
    val_str(params, "project_id").or_else(|| ctx.tenant.project_id.clone())
}

fn get_context(params: &Value, ctx: &ToolContext, now: DateTime<Utc>) -> Result<Value> {
    let mode = match val_str(params, "mode").as_deref() {
        Some("rules_only") => ContextMode::RulesOnly,
        Some(s) if !s.is_empty() && s != "all" => {
            let layer = Layer::parse(s).map_err(ApiError::from)?;
            ContextMode::Layer(layer)
        }
        _ => ContextMode::All,
    };
    let project_id = effective_project_id(params, ctx);
    let user_id = effective_user_id(params, ctx);

    let started = std::time::Instant::now();
    let retriever = Retriever::new(ctx.conn);
    let result = retriever.get_context(
        ContextOptions { query: val_str(params, "query"), project_id: project_id.clone(), user_id: user_id.clone(), limit: val_f64(params, "limit"), mode },
        now,
    )?;
    record_retrieval(
        ctx.conn,
        &RetrievalRecord {
            tenant_id: Some(ctx.tenant.owner_scope_key.clone()),
            project_id,
            user_id,
            used_fallback: result.used_fallback,
            fallback_reason: result.fallback_reason.clone(),
            duration_ms: started.elapsed().as_millis() as i64,
        },
        now,
    );
    Ok(json!({"rules": result.rules, "memories": result.memories}))
}

fn get_rules(params: &Value, ctx: &ToolContext, now: DateTime<Utc>) -> Result<Value> {
    let store = Store::new(ctx.conn);
    let rules = store.get_rules(
        RuleOptions { project_id: effective_project_id(params, ctx), user_id: effective_user_id(params, ctx) },
        now,
    )?;
    Ok(json!({"rules": rules}))
}

fn add_memory(params: &Value, ctx: &ToolContext, now: DateTime<Utc>) -> Result<Value> {
    let content = val_str(params, "content").ok_or_else(|| validation("MEMORY_CONTENT_REQUIRED", "content is required"))?;
    let opts = AddOptions {
        memory_type: parse_type(params, "type")?,
        layer: parse_layer(params, "layer")?,
        scope: effective_project_id(params, ctx).as_ref().map(|_| Scope::Project),
        project_id: effective_project_id(params, ctx),
        user_id: effective_user_id(params, ctx),
        tags: val_str_vec(params, "tags"),
        paths: val_str_vec(params, "paths"),
        category: val_str(params, "category"),
        metadata: params.get("metadata").cloned(),
        source_session_id: val_str(params, "source_session_id"),
        confidence: val_f64(params, "confidence"),
        last_confirmed_at: None,
        upsert_key: val_str(params, "upsert_key"),
        expires_at: None,
    };

    let store = Store::new(ctx.conn);
    let (memory, outcome) = store.add(&content, opts, ctx.working_memory_ttl_hours, now)?;
    let operation = match outcome {
        mem_core::UpsertOutcome::Inserted => JobOperation::Add,
        mem_core::UpsertOutcome::Updated => JobOperation::Edit,
    };
    enqueue_embedding(ctx.conn, &memory, ctx.default_model, operation, now);

    Ok(json!({"memory": memory, "outcome": match outcome {
        mem_core::UpsertOutcome::Inserted => "inserted",
        mem_core::UpsertOutcome::Updated => "updated",
    }}))
}

fn edit_memory(params: &Value, ctx: &ToolContext, now: DateTime<Utc>) -> Result<Value> {
    let id = val_str(params, "id").ok_or_else(|| validation("MEMORY_ID_REQUIRED", "id is required"))?;

    // SPEC_FULL.md supplement: editing a superseded id resolves to the
    // winner rather than silently updating dead state.
    if let Some(winner) = mem_core::links::resolve_winner(ctx.conn, &id)?
        && winner.id != id
    {
        return Err(validation("MEMORY_SUPERSEDED", format!("memory '{id}' was superseded by '{}'", winner.id)));
    }

    let updates = UpdateRequest {
        content: val_str(params, "content"),
        memory_type: parse_type(params, "type")?,
        layer: parse_layer(params, "layer")?,
        tags: params.get("tags").map(|_| val_str_vec(params, "tags")),
        paths: params.get("paths").map(|_| val_str_vec(params, "paths")),
        category: params.get("category").map(|v| v.as_str().map(|s| s.to_string())),
        metadata: params.get("metadata").map(|v| if v.is_null() { None } else { Some(v.clone()) }),
        expires_at: None,
        upsert_key: None,
        source_session_id: None,
        confidence: None,
        last_confirmed_at: None,
    };

    let store = Store::new(ctx.conn);
    let user_id = effective_user_id(params, ctx);
    let updated = store.update(&id, updates, false, user_id.as_deref(), now)?;
    let Some(memory) = updated else {
        return Err(not_found("MEMORY_NOT_FOUND", format!("no such memory '{id}'")));
    };
    enqueue_embedding(ctx.conn, &memory, ctx.default_model, JobOperation::Edit, now);
    Ok(json!({"memory": memory}))
}

fn forget_memory(params: &Value, ctx: &ToolContext, now: DateTime<Utc>) -> Result<Value> {
    let id = val_str(params, "id").ok_or_else(|| validation("MEMORY_ID_REQUIRED", "id is required"))?;
    let store = Store::new(ctx.conn);
    let user_id = effective_user_id(params, ctx);
    let forgotten = store.forget(&id, user_id.as_deref(), now)?;
    Ok(json!({"forgotten": forgotten, "id": id}))
}

fn search_memories(params: &Value, ctx: &ToolContext, now: DateTime<Utc>) -> Result<Value> {
    let query = val_str(params, "query").ok_or_else(|| validation("QUERY_REQUIRED", "query is required"))?;
    let layer = parse_layer(params, "layer")?;
    let memory_type = parse_type(params, "type")?;
    let project_id = effective_project_id(params, ctx);
    let user_id = effective_user_id(params, ctx);

    let started = std::time::Instant::now();
    let store = Store::new(ctx.conn);
    let results = store.search(
        &query,
        SearchOptions {
            scope_global: true,
            scope_project: project_id.is_some(),
            project_id: project_id.clone(),
            user_id: user_id.clone(),
            layers: layer.into_iter().collect(),
            types: memory_type.into_iter().collect(),
            limit: val_f64(params, "limit"),
        },
        now,
    )?;
    record_retrieval(
        ctx.conn,
        &RetrievalRecord {
            tenant_id: Some(ctx.tenant.owner_scope_key.clone()),
            project_id,
            user_id,
            used_fallback: results.used_fallback,
            fallback_reason: results.fallback_reason.clone(),
            duration_ms: started.elapsed().as_millis() as i64,
        },
        now,
    );
    Ok(json!({"memories": results.memories}))
}

fn list_memories(params: &Value, ctx: &ToolContext, now: DateTime<Utc>) -> Result<Value> {
    let layer = parse_layer(params, "layer")?;
    let memory_type = parse_type(params, "type")?;
    let project_id = effective_project_id(params, ctx);

    let store = Store::new(ctx.conn);
    let results = store.list(
        ListOptions {
            scope_global: true,
            scope_project: project_id.is_some(),
            project_id,
            user_id: effective_user_id(params, ctx),
            layers: layer.into_iter().collect(),
            types: memory_type.into_iter().collect(),
            tags: val_str_vec(params, "tags"),
            limit: val_f64(params, "limit"),
        },
        now,
    )?;
    Ok(json!({"memories": results}))
}

fn bulk_forget_memories(params: &Value, ctx: &ToolContext, now: DateTime<Utc>) -> Result<Value> {
    let all = val_bool(params, "all");
    let types: Vec<MemoryType> = val_str_vec(params, "types")
        .iter()
        .map(|s| MemoryType::parse(s))
        .collect::<mem_core::Result<Vec<_>>>()
        .map_err(ApiError::from)?;
    let tags = val_str_vec(params, "tags");
    let older_than_days = val_f64(params, "older_than_days").map(|n| n as i64);
    let pattern = val_str(params, "pattern");
    let project_id = effective_project_id(params, ctx);

    let has_filters = !types.is_empty() || !tags.is_empty() || older_than_days.is_some() || pattern.is_some() || project_id.is_some();
    if !all && !has_filters {
        return Err(validation("BULK_FORGET_NO_FILTERS", "bulk_forget_memories requires filters or all=true"));
    }
    if all && has_filters {
        return Err(validation("BULK_FORGET_INVALID_FILTERS", "all=true cannot be combined with other filters"));
    }

    let store = Store::new(ctx.conn);
    let filter = ForgetFilter {
        types,
        tags,
        older_than_days,
        pattern,
        project_id,
        user_id: effective_user_id(params, ctx),
        all,
    };
    let matches = store.find_to_forget(filter, now)?;
    let dry_run = val_bool(params, "dry_run");

    if dry_run {
        return Ok(json!({"matched": matches.len(), "dry_run": true}));
    }

    let ids: Vec<String> = matches.iter().map(|m| m.id.clone()).collect();
    let forgotten = store.bulk_forget_by_ids(&ids, now)?;
    Ok(json!({"forgotten": forgotten, "dry_run": false}))
}

fn vacuum_memories(params: &Value, ctx: &ToolContext, _now: DateTime<Utc>) -> Result<Value> {
    let store = Store::new(ctx.conn);
    let user_id = effective_user_id(params, ctx);
    let removed = store.vacuum(user_id.as_deref())?;
    Ok(json!({"removed": removed}))
}

/// §4.8 exposed to the CLI (not a listed MCP tool, but used by
/// `mem-cli consolidate` and the periodic maintenance loop).
pub fn consolidate(conn: &Connection, opts: ConsolidateOptions, now: DateTime<Utc>) -> Result<Value> {
    let consolidator = mem_core::Consolidator::new(conn);
    let result = consolidator.consolidate(opts, now)?;
    Ok(json!({
        "run_id": result.run_id,
        "input_count": result.input_count,
        "merged_count": result.merged_count,
        "superseded_ids": result.superseded_ids,
        "winner_ids": result.winner_ids,
        "conflicted_count": result.conflicted_count,
    }))
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
        mem_embed::schema::ensure(&conn).unwrap();
        conn
    }

    fn tenant() -> TenantContext {
        TenantContext { owner_user_id: "u1".into(), owner_scope_key: "scope1".into(), project_id: None, user_id: None }
    }

    #[test]
    fn add_then_search_round_trips_through_envelope() {
        let conn = setup();
        let t = tenant();
        let ctx = ToolContext { conn: &conn, tenant: &t, default_model: "text-embedding-3-small", working_memory_ttl_hours: 24.0 };

        let added = add_memory(&json!({"content": "Use Zod for validation", "type": "rule"}), &ctx, now()).unwrap();
        assert_eq!(added["outcome"], json!("inserted"));

        let found = search_memories(&json!({"query": "Zod"}), &ctx, now()).unwrap();
        assert_eq!(found["memories"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn add_memory_requires_content() {
        let conn = setup();
        let t = tenant();
        let ctx = ToolContext { conn: &conn, tenant: &t, default_model: "m", working_memory_ttl_hours: 24.0 };
        let err = add_memory(&json!({}), &ctx, now()).unwrap_err();
        assert_eq!(err.detail.code, "MEMORY_CONTENT_REQUIRED");
    }

    #[test]
    fn bulk_forget_rejects_all_with_filters() {
        let conn = setup();
        let t = tenant();
        let ctx = ToolContext { conn: &conn, tenant: &t, default_model: "m", working_memory_ttl_hours: 24.0 };
        let err = bulk_forget_memories(&json!({"all": true, "types": ["note"]}), &ctx, now()).unwrap_err();
        assert_eq!(err.detail.code, "BULK_FORGET_INVALID_FILTERS");
    }

    #[test]
    fn bulk_forget_rejects_no_filters_and_no_all() {
        let conn = setup();
        let t = tenant();
        let ctx = ToolContext { conn: &conn, tenant: &t, default_model: "m", working_memory_ttl_hours: 24.0 };
        let err = bulk_forget_memories(&json!({}), &ctx, now()).unwrap_err();
        assert_eq!(err.detail.code, "BULK_FORGET_NO_FILTERS");
    }

    #[test]
    fn forget_then_vacuum_removes_row() {
        let conn = setup();
        let t = tenant();
        let ctx = ToolContext { conn: &conn, tenant: &t, default_model: "m", working_memory_ttl_hours: 24.0 };
        let added = add_memory(&json!({"content": "temp"}), &ctx, now()).unwrap();
        let id = added["memory"]["id"].as_str().unwrap().to_string();

        forget_memory(&json!({"id": id}), &ctx, now()).unwrap();
        let removed = vacuum_memories(&json!({}), &ctx, now()).unwrap();
        assert_eq!(removed["removed"], json!(1));
    }
}
