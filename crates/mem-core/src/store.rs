//! Memory Store Engine (C2): CRUD, upsert-by-key, history, soft-delete,
//! bulk operations, vacuum.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params_from_iter};

use crate::error::{Result, StoreError};
use crate::id::new_id;
use crate::model::{
    Layer, Memory, MemoryType, Scope, derive_upsert_key, join_tokens, normalize_tokens,
    split_tokens,
};
use crate::schema::{self, active_clause, layer_clause, user_scope_clause};

const MEMORY_COLUMNS: &str = "id, content, type, memory_layer, scope, project_id, user_id, tags, \
     paths, category, metadata, source_session_id, confidence, last_confirmed_at, upsert_key, \
     superseded_by, superseded_at, created_at, updated_at, deleted_at, expires_at";

pub const LIST_DEFAULT: usize = 50;
pub const LIST_MAX: usize = 100;
pub const SEARCH_DEFAULT: usize = 20;
pub const SEARCH_MAX: usize = 50;

/// §4.2 "Limit clamping": invalid/non-positive -> default; excessive -> clamped.
pub fn clamp_limit(requested: Option<f64>, default: usize, max: usize) -> usize {
    match requested {
        None => default,
        Some(n) if !n.is_finite() || n <= 0.0 => default,
        Some(n) => (n as usize).min(max),
    }
}

#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub memory_type: Option<MemoryType>,
    pub layer: Option<Layer>,
    pub scope: Option<Scope>,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub tags: Vec<String>,
    pub paths: Vec<String>,
    pub category: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub source_session_id: Option<String>,
    pub confidence: Option<f64>,
    pub last_confirmed_at: Option<DateTime<Utc>>,
    pub upsert_key: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Distinguishes "field absent" (don't touch) from "field set to null"
/// (update to null) per §9's design note on dynamic property merges.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub content: Option<String>,
    pub memory_type: Option<MemoryType>,
    pub layer: Option<Layer>,
    pub tags: Option<Vec<String>>,
    pub paths: Option<Vec<String>>,
    pub category: Option<Option<String>>,
    pub metadata: Option<Option<serde_json::Value>>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub upsert_key: Option<Option<String>>,
    pub source_session_id: Option<Option<String>>,
    pub confidence: Option<Option<f64>>,
    pub last_confirmed_at: Option<Option<DateTime<Utc>>>,
}

/// §4.2 "Search" result plus fallback telemetry (§4.6/§9): whether the LIKE
/// fallback path fired and why, so a caller can feed a retrieval snapshot
/// without `Store` itself knowing about any metrics table.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub memories: Vec<Memory>,
    pub used_fallback: bool,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub scope_global: bool,
    pub scope_project: bool,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub layers: Vec<Layer>,
    pub types: Vec<MemoryType>,
    pub limit: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub scope_global: bool,
    pub scope_project: bool,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub layers: Vec<Layer>,
    pub types: Vec<MemoryType>,
    pub tags: Vec<String>,
    pub limit: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct RuleOptions {
    pub project_id: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ForgetFilter {
    pub types: Vec<MemoryType>,
    pub tags: Vec<String>,
    pub older_than_days: Option<i64>,
    pub pattern: Option<String>,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub all: bool,
}

pub struct Store<'a> {
    conn: &'a Connection,
}

impl<'a> Store<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    // ---------------------------------------------------------------
    // Add
    // ---------------------------------------------------------------

    /// §4.2 "Add". `ttl_hours` is `MEMORIES_WORKING_MEMORY_TTL_HOURS` (default 24).
    pub fn add(
        &self,
        content: &str,
        opts: AddOptions,
        ttl_hours: f64,
        now: DateTime<Utc>,
    ) -> Result<(Memory, UpsertOutcome)> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(StoreError::validation(
                "MEMORY_CONTENT_REQUIRED",
                "content must be non-empty",
            ));
        }

        let memory_type = opts.memory_type.unwrap_or(MemoryType::Note);
        let layer = opts.layer.unwrap_or_else(|| Layer::default_for_type(memory_type));
        let scope = opts.scope.unwrap_or(Scope::Global);

        if scope == Scope::Project && opts.project_id.is_none() {
            return Err(StoreError::validation(
                "PROJECT_ID_REQUIRED",
                "project_id is required when scope=project",
            ));
        }

        let expires_at = if layer == Layer::Working {
            Some(opts.expires_at.unwrap_or_else(|| now + Duration::milliseconds((ttl_hours * 3_600_000.0) as i64)))
        } else {
            None
        };

        let tags = normalize_tokens(&opts.tags);
        let paths = normalize_tokens(&opts.paths);

        let upsert_key = opts
            .upsert_key
            .clone()
            .or_else(|| derive_upsert_key(memory_type, opts.category.as_deref(), trimmed));

        if let Some(key) = &upsert_key {
            if let Some(existing) = self.find_by_upsert_key(scope, opts.project_id.as_deref(), memory_type, key)? {
                self.record_history(&existing, "updated", now)?;

                self.conn.execute(
                    "UPDATE memories SET content=?1, tags=?2, memory_layer=?3, expires_at=?4, \
                     upsert_key=?5, source_session_id=?6, confidence=?7, last_confirmed_at=?8, \
                     paths=?9, category=?10, metadata=?11, updated_at=?12 WHERE id=?13",
                    rusqlite::params![
                        trimmed,
                        join_tokens(&tags),
                        layer.as_str(),
                        expires_at.map(|d| d.to_rfc3339()),
                        key,
                        opts.source_session_id,
                        opts.confidence,
                        opts.last_confirmed_at.map(|d| d.to_rfc3339()),
                        join_tokens(&paths),
                        opts.category,
                        opts.metadata.as_ref().map(|v| v.to_string()),
                        now.to_rfc3339(),
                        existing.id,
                    ],
                )?;

                let updated = self.get_row_by_id(&existing.id)?.expect("row just updated");
                return Ok((updated, UpsertOutcome::Updated));
            }
        }

        let id = new_id();
        self.conn.execute(
            &format!(
                "INSERT INTO memories ({MEMORY_COLUMNS}) VALUES \
                 (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)"
            ),
            rusqlite::params![
                id,
                trimmed,
                memory_type.as_str(),
                layer.as_str(),
                scope.as_str(),
                opts.project_id,
                opts.user_id,
                join_tokens(&tags),
                join_tokens(&paths),
                opts.category,
                opts.metadata.as_ref().map(|v| v.to_string()),
                opts.source_session_id,
                opts.confidence,
                opts.last_confirmed_at.map(|d| d.to_rfc3339()),
                upsert_key,
                Option::<String>::None,
                Option::<String>::None,
                now.to_rfc3339(),
                now.to_rfc3339(),
                Option::<String>::None,
                expires_at.map(|d| d.to_rfc3339()),
            ],
        )?;

        let inserted = self.get_row_by_id(&id)?.expect("row just inserted");
        Ok((inserted, UpsertOutcome::Inserted))
    }

    fn find_by_upsert_key(
        &self,
        scope: Scope,
        project_id: Option<&str>,
        memory_type: MemoryType,
        key: &str,
    ) -> Result<Option<Memory>> {
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE scope=?1 AND (project_id IS ?2) AND \
             type=?3 AND upsert_key=?4 AND superseded_at IS NULL AND deleted_at IS NULL LIMIT 1"
        );
        let row = self
            .conn
            .query_row(
                &sql,
                rusqlite::params![scope.as_str(), project_id, memory_type.as_str(), key],
                row_to_memory,
            )
            .optional()?;
        row.transpose()
    }

    // ---------------------------------------------------------------
    // Read
    // ---------------------------------------------------------------

    fn get_row_by_id(&self, id: &str) -> Result<Option<Memory>> {
        let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id=?1");
        self.conn
            .query_row(&sql, [id], row_to_memory)
            .optional()?
            .transpose()
    }

    /// Fetch a row by id regardless of soft-delete/expiry/supersession state
    /// (used by the links/consolidation read paths, never by request-facing
    /// reads which must go through `get_by_id`'s Active filter).
    pub fn get_row_by_id_any_state(&self, id: &str) -> Result<Option<Memory>> {
        self.get_row_by_id(id)
    }

    /// Mark `loser_id` as superseded by `winner_id` (§4.8 Consolidation),
    /// recording History first.
    pub fn mark_superseded(&self, loser_id: &str, winner_id: &str, now: DateTime<Utc>) -> Result<()> {
        if let Some(loser) = self.get_row_by_id(loser_id)? {
            self.record_history(&loser, "superseded", now)?;
        }
        self.conn.execute(
            "UPDATE memories SET superseded_by=?1, superseded_at=?2, updated_at=?2 WHERE id=?3",
            rusqlite::params![winner_id, now.to_rfc3339(), loser_id],
        )?;
        Ok(())
    }

    /// Align `loser`'s `upsert_key` with `winner`'s (§4.8 step 5).
    pub fn align_upsert_key(&self, memory_id: &str, upsert_key: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE memories SET upsert_key=?1 WHERE id=?2",
            rusqlite::params![upsert_key, memory_id],
        )?;
        Ok(())
    }

    /// Persist a derived `upsert_key` onto a row that lacked one (§4.8 step 2).
    pub fn set_upsert_key(&self, memory_id: &str, upsert_key: &str) -> Result<()> {
        self.align_upsert_key(memory_id, upsert_key)
    }

    /// Active, non-superseded candidates for consolidation (§4.8 step 1),
    /// optionally scoped to a project and/or restricted to `global` rows,
    /// filtered by `types` when non-empty.
    pub fn consolidation_candidates(
        &self,
        project_id: Option<&str>,
        include_global: bool,
        global_only: bool,
        types: &[MemoryType],
        now: DateTime<Utc>,
    ) -> Result<Vec<Memory>> {
        let mut sql = format!(
            "SELECT {cols} FROM memories m WHERE {active} AND m.superseded_at IS NULL",
            cols = qualified_columns("m"),
            active = active_clause_qualified("m"),
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(now.to_rfc3339())];

        if global_only {
            sql.push_str(" AND m.scope='global'");
        } else if let Some(pid) = project_id {
            if include_global {
                sql.push_str(" AND (m.scope='global' OR (m.scope='project' AND m.project_id=?))");
                args.push(Box::new(pid.to_string()));
            } else {
                sql.push_str(" AND m.scope='project' AND m.project_id=?");
                args.push(Box::new(pid.to_string()));
            }
        } else {
            sql.push_str(" AND m.scope='global'");
        }

        if let Some(tc) = type_filter(types) {
            sql.push_str(&format!(" AND {}", tc.replace("type", "m.type")));
        }

        self.run_memory_query(&sql, &args)
    }

    /// Active rows in strict `(created_at, id)` order, optionally scoped to
    /// a project/user and resuming after a checkpoint cursor (embedding
    /// backfill §4.5). `after` is `(created_at, id)` of the last row seen.
    /// `model` restricts to memories with no embedding row for that model
    /// (or whose stored embedding is for a different model) — §4.5 step 4's
    /// `LEFT JOIN memory_embeddings ... (e.memory_id IS NULL OR e.model !=
    /// scope.model)`, the join that makes this a scan over *unembedded*
    /// memories rather than all active ones.
    pub fn scan_for_backfill(
        &self,
        model: &str,
        project_id: Option<&str>,
        user_id: Option<&str>,
        after: Option<(&str, &str)>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Memory>> {
        let mut sql = format!(
            "SELECT {cols} FROM memories m \
             LEFT JOIN memory_embeddings e ON e.memory_id = m.id AND e.model = ? \
             WHERE {active} AND (e.memory_id IS NULL OR e.model != ?)",
            cols = qualified_columns("m"),
            active = active_clause_qualified("m"),
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(model.to_string()), Box::new(now.to_rfc3339()), Box::new(model.to_string())];

        if let Some(pid) = project_id {
            sql.push_str(" AND m.project_id=?");
            args.push(Box::new(pid.to_string()));
        }
        if let Some(uid) = user_id {
            sql.push_str(" AND m.user_id=?");
            args.push(Box::new(uid.to_string()));
        }
        if let Some((created_at, id)) = after {
            sql.push_str(" AND (m.created_at > ? OR (m.created_at = ? AND m.id > ?))");
            args.push(Box::new(created_at.to_string()));
            args.push(Box::new(created_at.to_string()));
            args.push(Box::new(id.to_string()));
        }
        sql.push_str(" ORDER BY m.created_at ASC, m.id ASC LIMIT ?");
        args.push(Box::new(limit as i64));

        self.run_memory_query(&sql, &args)
    }

    /// Count of rows in the same unembedded-for-`model` scope as
    /// [`scan_for_backfill`], used to estimate `estimated_total`/
    /// `estimated_remaining` (§4.5).
    pub fn count_for_backfill(&self, model: &str, project_id: Option<&str>, user_id: Option<&str>, now: DateTime<Utc>) -> Result<i64> {
        let mut sql = format!(
            "SELECT COUNT(*) FROM memories m \
             LEFT JOIN memory_embeddings e ON e.memory_id = m.id AND e.model = ? \
             WHERE {} AND (e.memory_id IS NULL OR e.model != ?)",
            active_clause_qualified("m")
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(model.to_string()), Box::new(now.to_rfc3339()), Box::new(model.to_string())];
        if let Some(pid) = project_id {
            sql.push_str(" AND m.project_id=?");
            args.push(Box::new(pid.to_string()));
        }
        if let Some(uid) = user_id {
            sql.push_str(" AND m.user_id=?");
            args.push(Box::new(uid.to_string()));
        }
        let count: i64 = self.conn.query_row(&sql, params_from_iter(args.iter().map(|b| b.as_ref())), |r| r.get(0))?;
        Ok(count)
    }

    /// §4.2 "GetById": returns the row only if Active.
    pub fn get_by_id(&self, id: &str, user_id: Option<&str>, now: DateTime<Utc>) -> Result<Option<Memory>> {
        let (user_clause, user_args) = user_scope_clause(&user_id.map(str::to_string));
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE id=? AND {} AND {user_clause}",
            active_clause()
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
            Box::new(id.to_string()),
            Box::new(now.to_rfc3339()),
        ];
        for a in user_args {
            args.push(Box::new(a));
        }
        self.conn
            .query_row(&sql, params_from_iter(args.iter().map(|b| b.as_ref())), row_to_memory)
            .optional()?
            .transpose()
    }

    /// §4.2 "Search": FTS with bm25 ranking, falling back to LIKE on any
    /// FTS error (§9 "FTS fallback").
    pub fn search(&self, query: &str, opts: SearchOptions, now: DateTime<Utc>) -> Result<SearchOutcome> {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Ok(SearchOutcome::default());
        }

        let limit = clamp_limit(opts.limit, SEARCH_DEFAULT, SEARCH_MAX);
        let (scope_clause, mut scope_args) = scope_filter(opts.scope_global, opts.scope_project, opts.project_id.as_deref());
        let type_clause = type_filter(&opts.types);
        let layer_clause_str = layer_clause(&opts.layers);
        let (user_clause, user_args) = user_scope_clause(&opts.user_id);

        let mut extra_where = String::new();
        extra_where.push_str(&format!(" AND {scope_clause} AND {user_clause}"));
        if let Some(tc) = &type_clause {
            extra_where.push_str(&format!(" AND {tc}"));
        }
        if let Some(lc) = &layer_clause_str {
            extra_where.push_str(&format!(" AND {lc}"));
        }

        let match_expr = trimmed
            .split_whitespace()
            .map(|term| format!("\"{}\"*", term.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR ");

        let fts_sql = format!(
            "SELECT {cols} FROM memories m JOIN memories_fts f ON m.rowid = f.rowid \
             WHERE f.content MATCH ?1 AND {active} {extra_where} \
             ORDER BY bm25(memories_fts) LIMIT ?lim",
            cols = qualified_columns("m"),
            active = active_clause_qualified("m"),
        )
        .replace("?lim", &format!("?{}", 2 + scope_args.len() + user_args.len() + 1));

        let mut fts_args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(match_expr), Box::new(now.to_rfc3339())];
        for a in &scope_args {
            fts_args.push(Box::new(a.clone()));
        }
        for a in &user_args {
            fts_args.push(Box::new(a.clone()));
        }
        fts_args.push(Box::new(limit as i64));

        let fts_result = self.run_memory_query(&fts_sql, &fts_args);

        match fts_result {
            Ok(rows) => Ok(SearchOutcome { memories: rows, used_fallback: false, fallback_reason: None }),
            Err(e) => {
                tracing::warn!("FTS search failed, falling back to LIKE: {e}");
                let like_sql = format!(
                    "SELECT {cols} FROM memories m WHERE m.content LIKE ?1 ESCAPE '\\' AND {active} {extra_where} \
                     ORDER BY m.created_at DESC LIMIT ?lim",
                    cols = qualified_columns("m"),
                    active = active_clause_qualified("m"),
                )
                .replace("?lim", &format!("?{}", 2 + scope_args.len() + user_args.len() + 1));

                let like_pattern = format!("%{}%", escape_like(trimmed));
                let mut like_args: Vec<Box<dyn rusqlite::types::ToSql>> =
                    vec![Box::new(like_pattern), Box::new(now.to_rfc3339())];
                for a in scope_args.drain(..) {
                    like_args.push(Box::new(a));
                }
                for a in &user_args {
                    like_args.push(Box::new(a.clone()));
                }
                like_args.push(Box::new(limit as i64));
                let rows = self.run_memory_query(&like_sql, &like_args)?;
                Ok(SearchOutcome { memories: rows, used_fallback: true, fallback_reason: Some(e.to_string()) })
            }
        }
    }

    /// §4.2 "List": same filter stack, no text match.
    pub fn list(&self, opts: ListOptions, now: DateTime<Utc>) -> Result<Vec<Memory>> {
        let limit = clamp_limit(opts.limit, LIST_DEFAULT, LIST_MAX);
        let (scope_clause, scope_args) = scope_filter(opts.scope_global, opts.scope_project, opts.project_id.as_deref());
        let type_clause = type_filter(&opts.types);
        let layer_clause_str = layer_clause(&opts.layers);
        let (user_clause, user_args) = user_scope_clause(&opts.user_id);

        let mut sql = format!(
            "SELECT {cols} FROM memories m WHERE {active} AND {scope_clause} AND {user_clause}",
            cols = qualified_columns("m"),
            active = active_clause_qualified("m"),
        );
        if let Some(tc) = &type_clause {
            sql.push_str(&format!(" AND {tc}"));
        }
        if let Some(lc) = &layer_clause_str {
            sql.push_str(&format!(" AND {lc}"));
        }
        if !opts.tags.is_empty() {
            let clauses: Vec<String> = opts
                .tags
                .iter()
                .map(|_| "m.tags LIKE ?".to_string())
                .collect();
            sql.push_str(&format!(" AND ({})", clauses.join(" OR ")));
        }
        sql.push_str(" ORDER BY m.type ASC, m.scope ASC, m.created_at DESC LIMIT ?");

        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(now.to_rfc3339())];
        for a in scope_args {
            args.push(Box::new(a));
        }
        for a in user_args {
            args.push(Box::new(a));
        }
        for t in &opts.tags {
            args.push(Box::new(format!("%{}%", escape_like(t))));
        }
        args.push(Box::new(limit as i64));

        self.run_memory_query(&sql, &args)
    }

    /// §4.2 "GetRules": type=rule, global first then project, ignores layer filter.
    pub fn get_rules(&self, opts: RuleOptions, now: DateTime<Utc>) -> Result<Vec<Memory>> {
        let (user_clause, user_args) = user_scope_clause(&opts.user_id);
        let mut sql = format!(
            "SELECT {cols} FROM memories m WHERE {active} AND m.type='rule' AND {user_clause}",
            cols = qualified_columns("m"),
            active = active_clause_qualified("m"),
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(now.to_rfc3339())];
        for a in user_args {
            args.push(Box::new(a));
        }
        if let Some(pid) = &opts.project_id {
            sql.push_str(" AND (m.scope='global' OR (m.scope='project' AND m.project_id=?))");
            args.push(Box::new(pid.clone()));
        } else {
            sql.push_str(" AND m.scope='global'");
        }
        sql.push_str(" ORDER BY m.scope ASC, m.created_at DESC");

        self.run_memory_query(&sql, &args)
    }

    fn run_memory_query(&self, sql: &str, args: &[Box<dyn rusqlite::types::ToSql>]) -> Result<Vec<Memory>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter().map(|b| b.as_ref())), row_to_memory)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r??);
        }
        Ok(out)
    }

    // ---------------------------------------------------------------
    // Update / Forget / Vacuum
    // ---------------------------------------------------------------

    /// §4.2 "Update". Records History ("updated") before applying fields,
    /// unless `skip_history`. `user_id`, when given, scopes by exact match.
    pub fn update(
        &self,
        id: &str,
        updates: UpdateRequest,
        skip_history: bool,
        user_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Memory>> {
        let existing = match self.get_owned_row(id, user_id, now)? {
            Some(m) => m,
            None => return Ok(None),
        };

        if !skip_history {
            self.record_history(&existing, "updated", now)?;
        }

        let mut sets: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(content) = &updates.content {
            let trimmed = content.trim();
            if trimmed.is_empty() {
                return Err(StoreError::validation("MEMORY_CONTENT_REQUIRED", "content must be non-empty"));
            }
            sets.push("content=?".into());
            args.push(Box::new(trimmed.to_string()));
        }
        if let Some(t) = updates.memory_type {
            sets.push("type=?".into());
            args.push(Box::new(t.as_str().to_string()));
        }
        if let Some(l) = updates.layer {
            sets.push("memory_layer=?".into());
            args.push(Box::new(l.as_str().to_string()));
        }
        if let Some(tags) = &updates.tags {
            sets.push("tags=?".into());
            args.push(Box::new(join_tokens(&normalize_tokens(tags))));
        }
        if let Some(paths) = &updates.paths {
            sets.push("paths=?".into());
            args.push(Box::new(join_tokens(&normalize_tokens(paths))));
        }
        if let Some(category) = &updates.category {
            sets.push("category=?".into());
            args.push(Box::new(category.clone()));
        }
        if let Some(metadata) = &updates.metadata {
            sets.push("metadata=?".into());
            args.push(Box::new(metadata.as_ref().map(|v| v.to_string())));
        }
        if let Some(expires_at) = updates.expires_at {
            sets.push("expires_at=?".into());
            args.push(Box::new(expires_at.map(|d| d.to_rfc3339())));
        }
        if let Some(upsert_key) = &updates.upsert_key {
            sets.push("upsert_key=?".into());
            args.push(Box::new(upsert_key.clone()));
        }
        if let Some(source_session_id) = &updates.source_session_id {
            sets.push("source_session_id=?".into());
            args.push(Box::new(source_session_id.clone()));
        }
        if let Some(confidence) = updates.confidence {
            sets.push("confidence=?".into());
            args.push(Box::new(confidence));
        }
        if let Some(last_confirmed_at) = updates.last_confirmed_at {
            sets.push("last_confirmed_at=?".into());
            args.push(Box::new(last_confirmed_at.map(|d| d.to_rfc3339())));
        }

        sets.push("updated_at=?".into());
        args.push(Box::new(now.to_rfc3339()));
        args.push(Box::new(id.to_string()));

        let sql = format!("UPDATE memories SET {} WHERE id=?", sets.join(", "));
        self.conn.execute(&sql, params_from_iter(args.iter().map(|b| b.as_ref())))?;

        self.get_row_by_id(id)
    }

    fn get_owned_row(&self, id: &str, user_id: Option<&str>, now: DateTime<Utc>) -> Result<Option<Memory>> {
        let active = self.get_row_by_id(id)?;
        let Some(row) = active else { return Ok(None) };
        if !row.is_active(now) {
            return Ok(None);
        }
        if let Some(uid) = user_id
            && row.user_id.as_deref() != Some(uid)
        {
            return Ok(None);
        }
        Ok(Some(row))
    }

    /// §4.2 "Forget": soft-delete, Active rows only.
    pub fn forget(&self, id: &str, user_id: Option<&str>, now: DateTime<Utc>) -> Result<bool> {
        let sql = if let Some(_uid) = user_id {
            "UPDATE memories SET deleted_at=?1 WHERE id=?2 AND deleted_at IS NULL AND \
             (expires_at IS NULL OR expires_at > ?1) AND user_id=?3"
        } else {
            "UPDATE memories SET deleted_at=?1 WHERE id=?2 AND deleted_at IS NULL AND \
             (expires_at IS NULL OR expires_at > ?1)"
        };
        let rows = if let Some(uid) = user_id {
            self.conn.execute(sql, rusqlite::params![now.to_rfc3339(), id, uid])?
        } else {
            self.conn.execute(sql, rusqlite::params![now.to_rfc3339(), id])?
        };
        Ok(rows > 0)
    }

    /// §4.2 "FindToForget".
    pub fn find_to_forget(&self, filter: ForgetFilter, now: DateTime<Utc>) -> Result<Vec<Memory>> {
        let mut sql = format!(
            "SELECT {cols} FROM memories m WHERE {active}",
            cols = qualified_columns("m"),
            active = active_clause_qualified("m"),
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(now.to_rfc3339())];

        if let Some(tc) = type_filter(&filter.types) {
            sql.push_str(&format!(" AND {}", tc.replace("type", "m.type")));
        }
        if !filter.tags.is_empty() {
            let clauses: Vec<String> = filter.tags.iter().map(|_| "m.tags LIKE ?".to_string()).collect();
            sql.push_str(&format!(" AND ({})", clauses.join(" OR ")));
            for t in &filter.tags {
                args.push(Box::new(format!("%{}%", escape_like(t))));
            }
        }
        if let Some(days) = filter.older_than_days {
            sql.push_str(" AND m.created_at < ?");
            args.push(Box::new((now - Duration::days(days)).to_rfc3339()));
        }
        if let Some(pattern) = &filter.pattern {
            sql.push_str(" AND m.content LIKE ? ESCAPE '\\'");
            args.push(Box::new(glob_to_like(pattern)));
        }
        if let Some(pid) = &filter.project_id {
            sql.push_str(" AND m.scope='project' AND m.project_id=?");
            args.push(Box::new(pid.clone()));
        }
        if let Some(uid) = &filter.user_id {
            sql.push_str(" AND m.user_id=?");
            args.push(Box::new(uid.clone()));
        }

        // §9 Open Question: cap preview at 1001 rows rather than an
        // unbounded COUNT(*) for "more than 1000" reporting.
        sql.push_str(" LIMIT 1001");

        self.run_memory_query(&sql, &args)
    }

    /// §4.2 "BulkForgetByIds": batched at 500 ids per UPDATE.
    pub fn bulk_forget_by_ids(&self, ids: &[String], now: DateTime<Utc>) -> Result<u64> {
        let mut total = 0u64;
        for chunk in ids.chunks(500) {
            let placeholders = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "UPDATE memories SET deleted_at=? WHERE deleted_at IS NULL AND id IN ({placeholders})"
            );
            let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(now.to_rfc3339())];
            for id in chunk {
                args.push(Box::new(id.clone()));
            }
            total += self.conn.execute(&sql, params_from_iter(args.iter().map(|b| b.as_ref())))? as u64;
        }
        Ok(total)
    }

    /// §4.2 "Vacuum": atomic pair, reports the `changes()` count.
    pub fn vacuum(&self, user_id: Option<&str>) -> Result<u64> {
        let tx = self.conn.unchecked_transaction()?;
        let affected = if let Some(uid) = user_id {
            tx.execute("DELETE FROM memories WHERE deleted_at IS NOT NULL AND user_id=?1", [uid])?
        } else {
            tx.execute("DELETE FROM memories WHERE deleted_at IS NOT NULL AND user_id IS NULL", [])?
        };
        tx.commit()?;
        Ok(affected as u64)
    }

    // ---------------------------------------------------------------
    // History
    // ---------------------------------------------------------------

    fn record_history(&self, memory: &Memory, change_type: &str, changed_at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO memory_history (memory_id, changed_at, change_type, content, type, \
             memory_layer, tags, paths, category, metadata, expires_at, upsert_key) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            rusqlite::params![
                memory.id,
                changed_at.to_rfc3339(),
                change_type,
                memory.content,
                memory.memory_type.as_str(),
                memory.layer.as_str(),
                join_tokens(&memory.tags),
                join_tokens(&memory.paths),
                memory.category,
                memory.metadata.as_ref().map(|v| v.to_string()),
                memory.expires_at.map(|d| d.to_rfc3339()),
                memory.upsert_key,
            ],
        )?;
        Ok(())
    }

    pub fn history_count(&self, memory_id: &str) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM memory_history WHERE memory_id=?1",
            [memory_id],
            |r| r.get(0),
        )?)
    }
}

fn scope_filter(scope_global: bool, scope_project: bool, project_id: Option<&str>) -> (String, Vec<String>) {
    let both = scope_global == scope_project;
    if both || (scope_global && scope_project) {
        return ("m.scope IN ('global','project')".to_string(), vec![]);
    }
    if scope_project {
        if let Some(pid) = project_id {
            return ("(m.scope='project' AND m.project_id=?)".to_string(), vec![pid.to_string()]);
        }
        return ("m.scope='project'".to_string(), vec![]);
    }
    ("m.scope='global'".to_string(), vec![])
}

fn type_filter(types: &[MemoryType]) -> Option<String> {
    if types.is_empty() {
        return None;
    }
    let list = types
        .iter()
        .map(|t| format!("'{}'", t.as_str()))
        .collect::<Vec<_>>()
        .join(",");
    Some(format!("type IN ({list})"))
}

fn qualified_columns(alias: &str) -> String {
    MEMORY_COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn active_clause_qualified(alias: &str) -> String {
    format!("({alias}.deleted_at IS NULL AND ({alias}.expires_at IS NULL OR {alias}.expires_at > ?))")
}

/// Escape `%`, `_`, `\` for a LIKE pattern using `ESCAPE '\'`.
fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// §4.2 "pattern (glob with `*`→`%`, `?`→`_`, other `%/_/\\` escaped)".
fn glob_to_like(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '*' => out.push('%'),
            '?' => out.push('_'),
            '%' | '_' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out
}

fn row_to_memory(row: &Row) -> rusqlite::Result<Result<Memory>> {
    Ok((|| -> Result<Memory> {
        let id: String = row.get(0)?;
        let content: String = row.get(1)?;
        let memory_type = MemoryType::parse(&row.get::<_, String>(2)?)?;
        let memory_layer_raw: Option<String> = row.get(3)?;
        let layer = match memory_layer_raw {
            Some(s) => Layer::parse(&s)?,
            None => Layer::default_for_type(memory_type),
        };
        let scope = Scope::parse(&row.get::<_, String>(4)?)?;
        let project_id: Option<String> = row.get(5)?;
        let user_id: Option<String> = row.get(6)?;
        let tags = split_tokens(&row.get::<_, String>(7)?);
        let paths = split_tokens(&row.get::<_, String>(8)?);
        let category: Option<String> = row.get(9)?;
        let metadata_raw: Option<String> = row.get(10)?;
        let metadata = metadata_raw
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| StoreError::InvalidData(format!("bad metadata json: {e}")))?;
        let source_session_id: Option<String> = row.get(11)?;
        let confidence: Option<f64> = row.get(12)?;
        let last_confirmed_at = parse_opt_dt(row.get(13)?)?;
        let upsert_key: Option<String> = row.get(14)?;
        let superseded_by: Option<String> = row.get(15)?;
        let superseded_at = parse_opt_dt(row.get(16)?)?;
        let created_at = parse_dt(row.get::<_, String>(17)?)?;
        let updated_at = parse_dt(row.get::<_, String>(18)?)?;
        let deleted_at = parse_opt_dt(row.get(19)?)?;
        let expires_at = parse_opt_dt(row.get(20)?)?;

        Ok(Memory {
            id,
            content,
            memory_type,
            layer,
            scope,
            project_id,
            user_id,
            tags,
            paths,
            category,
            metadata,
            source_session_id,
            confidence,
            last_confirmed_at,
            upsert_key,
            superseded_by,
            superseded_at,
            created_at,
            updated_at,
            deleted_at,
            expires_at,
        })
    })())
}

fn parse_dt(s: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("bad timestamp '{s}': {e}")))
}

fn parse_opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(parse_dt).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::ensure(&conn).unwrap();
        conn
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn add_then_get_by_id_roundtrips() {
        let conn = setup();
        let store = Store::new(&conn);
        let (mem, outcome) = store.add("Use Zod for validation", AddOptions {
            memory_type: Some(MemoryType::Rule),
            ..Default::default()
        }, 24.0, now()).unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert_eq!(mem.content, "Use Zod for validation");
        assert_eq!(mem.created_at, mem.updated_at);

        let fetched = store.get_by_id(&mem.id, None, now()).unwrap().unwrap();
        assert_eq!(fetched.content, mem.content);
        assert!(fetched.deleted_at.is_none());
    }

    #[test]
    fn add_trims_content() {
        let conn = setup();
        let store = Store::new(&conn);
        let (mem, _) = store.add("  hello world  ", AddOptions::default(), 24.0, now()).unwrap();
        assert_eq!(mem.content, "hello world");
    }

    #[test]
    fn add_rejects_empty_content() {
        let conn = setup();
        let store = Store::new(&conn);
        let err = store.add("   ", AddOptions::default(), 24.0, now()).unwrap_err();
        assert_eq!(err.code(), "MEMORY_CONTENT_REQUIRED");
    }

    #[test]
    fn add_working_layer_sets_expiry() {
        let conn = setup();
        let store = Store::new(&conn);
        let (mem, _) = store.add("temp state", AddOptions {
            layer: Some(Layer::Working),
            ..Default::default()
        }, 24.0, now()).unwrap();
        assert!(mem.expires_at.is_some());
        assert_eq!(mem.expires_at.unwrap(), now() + Duration::hours(24));
    }

    #[test]
    fn upsert_key_hit_updates_in_place_and_records_history() {
        let conn = setup();
        let store = Store::new(&conn);
        let (first, outcome1) = store.add("version one", AddOptions {
            upsert_key: Some("note:my-key".to_string()),
            ..Default::default()
        }, 24.0, now()).unwrap();
        assert_eq!(outcome1, UpsertOutcome::Inserted);

        let later = now() + Duration::seconds(5);
        let (second, outcome2) = store.add("version two", AddOptions {
            upsert_key: Some("note:my-key".to_string()),
            ..Default::default()
        }, 24.0, later).unwrap();

        assert_eq!(outcome2, UpsertOutcome::Updated);
        assert_eq!(second.id, first.id);
        assert_eq!(second.content, "version two");
        assert_eq!(store.history_count(&first.id).unwrap(), 1);
    }

    #[test]
    fn forget_soft_deletes_active_row() {
        let conn = setup();
        let store = Store::new(&conn);
        let (mem, _) = store.add("to be forgotten", AddOptions::default(), 24.0, now()).unwrap();

        assert!(store.forget(&mem.id, None, now()).unwrap());
        assert!(store.get_by_id(&mem.id, None, now()).unwrap().is_none());
    }

    #[test]
    fn forget_unknown_id_returns_false() {
        let conn = setup();
        let store = Store::new(&conn);
        assert!(!store.forget("doesnotexist12", None, now()).unwrap());
    }

    #[test]
    fn forget_already_deleted_returns_false() {
        let conn = setup();
        let store = Store::new(&conn);
        let (mem, _) = store.add("content", AddOptions::default(), 24.0, now()).unwrap();
        assert!(store.forget(&mem.id, None, now()).unwrap());
        assert!(!store.forget(&mem.id, None, now()).unwrap());
    }

    #[test]
    fn search_empty_query_returns_empty() {
        let conn = setup();
        let store = Store::new(&conn);
        store.add("Use Zod for validation", AddOptions::default(), 24.0, now()).unwrap();
        assert!(store.search("", SearchOptions::default(), now()).unwrap().memories.is_empty());
        assert!(store.search("   ", SearchOptions::default(), now()).unwrap().memories.is_empty());
    }

    #[test]
    fn search_finds_matching_content() {
        let conn = setup();
        let store = Store::new(&conn);
        store.add("Use Zod for validation", AddOptions {
            memory_type: Some(MemoryType::Rule),
            ..Default::default()
        }, 24.0, now()).unwrap();

        let results = store.search("Zod", SearchOptions {
            scope_global: true,
            ..Default::default()
        }, now()).unwrap();
        assert_eq!(results.memories.len(), 1);
        assert_eq!(results.memories[0].memory_type, MemoryType::Rule);
        assert!(!results.used_fallback);
    }

    #[test]
    fn working_layer_expired_row_absent_from_reads() {
        let conn = setup();
        let store = Store::new(&conn);
        let (mem, _) = store.add("Temp state", AddOptions {
            layer: Some(Layer::Working),
            tags: vec!["ephemeral".to_string()],
            ..Default::default()
        }, 24.0, now()).unwrap();

        let expired_now = mem.expires_at.unwrap() + Duration::seconds(1);

        assert!(store.get_by_id(&mem.id, None, expired_now).unwrap().is_none());
        let listed = store.list(ListOptions {
            scope_global: true,
            tags: vec!["ephemeral".to_string()],
            ..Default::default()
        }, expired_now).unwrap();
        assert!(listed.is_empty());
        let searched = store.search("Temp state", SearchOptions {
            scope_global: true,
            ..Default::default()
        }, expired_now).unwrap();
        assert!(searched.memories.is_empty());
    }

    #[test]
    fn update_with_wrong_user_is_not_found_right_user_succeeds() {
        let conn = setup();
        let store = Store::new(&conn);
        let (mem, _) = store.add("secret", AddOptions {
            user_id: Some("user-42".to_string()),
            ..Default::default()
        }, 24.0, now()).unwrap();

        let miss = store.update(&mem.id, UpdateRequest {
            content: Some("new".to_string()),
            ..Default::default()
        }, false, Some("user-9"), now()).unwrap();
        assert!(miss.is_none());

        let hit = store.update(&mem.id, UpdateRequest {
            content: Some("new".to_string()),
            ..Default::default()
        }, false, Some("user-42"), now()).unwrap();
        assert_eq!(hit.unwrap().content, "new");
    }

    #[test]
    fn vacuum_then_vacuum_again_returns_zero() {
        let conn = setup();
        let store = Store::new(&conn);
        let (mem, _) = store.add("gone", AddOptions::default(), 24.0, now()).unwrap();
        store.forget(&mem.id, None, now()).unwrap();

        assert_eq!(store.vacuum(None).unwrap(), 1);
        assert_eq!(store.vacuum(None).unwrap(), 0);
    }

    #[test]
    fn bulk_forget_by_ids_batches_correctly() {
        let conn = setup();
        let store = Store::new(&conn);
        let mut ids = Vec::new();
        for i in 0..10 {
            let (mem, _) = store.add(&format!("item {i}"), AddOptions::default(), 24.0, now()).unwrap();
            ids.push(mem.id);
        }
        let count = store.bulk_forget_by_ids(&ids, now()).unwrap();
        assert_eq!(count, 10);
    }

    #[test]
    fn find_to_forget_filters_by_older_than_days() {
        let conn = setup();
        let store = Store::new(&conn);
        let old_time = now() - Duration::days(40);
        store.add("old memory", AddOptions::default(), 24.0, old_time).unwrap();
        store.add("new memory", AddOptions::default(), 24.0, now()).unwrap();

        let found = store.find_to_forget(ForgetFilter {
            older_than_days: Some(30),
            ..Default::default()
        }, now()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, "old memory");
    }

    #[test]
    fn limit_clamping_defaults_and_max() {
        assert_eq!(clamp_limit(None, LIST_DEFAULT, LIST_MAX), LIST_DEFAULT);
        assert_eq!(clamp_limit(Some(0.0), LIST_DEFAULT, LIST_MAX), LIST_DEFAULT);
        assert_eq!(clamp_limit(Some(f64::NAN), LIST_DEFAULT, LIST_MAX), LIST_DEFAULT);
        assert_eq!(clamp_limit(Some(9999.0), LIST_DEFAULT, LIST_MAX), LIST_MAX);
        assert_eq!(clamp_limit(Some(10.0), LIST_DEFAULT, LIST_MAX), 10);
    }
}
