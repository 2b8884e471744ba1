//! Retrieval Pipeline (C3): layer tiering on top of `Store::search`/`get_rules`,
//! context assembly, and the shared token estimator (§4.3).

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::Result;
use crate::model::{Layer, Memory, MemoryType};
use crate::store::{RuleOptions, SearchOptions, Store, clamp_limit};

pub const CONTEXT_WORKING_DEFAULT: usize = 3;
pub const CONTEXT_LONG_TERM_DEFAULT: usize = 10;
pub const CONTEXT_LONG_TERM_MAX: usize = 50;

/// §4.3 "GetContext(..., mode)".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    /// Retrieve across every non-rule layer.
    All,
    /// Retrieve from a single selected layer (never `rule` — rules are
    /// always returned separately).
    Layer(Layer),
    /// Only resolve `rules`; `memories` is always empty.
    RulesOnly,
}

impl Default for ContextMode {
    fn default() -> Self {
        ContextMode::All
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub query: Option<String>,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub limit: Option<f64>,
    pub mode: ContextMode,
}

#[derive(Debug, Clone, Default)]
pub struct ContextResult {
    pub rules: Vec<Memory>,
    pub memories: Vec<Memory>,
    /// Whether either retrieval tier fell back from FTS to LIKE (§4.6
    /// "retrieval" telemetry; see `Store::search`'s `SearchOutcome`).
    pub used_fallback: bool,
    pub fallback_reason: Option<String>,
}

/// The non-rule types eligible for the working/long-term tiers (§4.3 step 3).
const TIER_TYPES: &[MemoryType] = &[MemoryType::Decision, MemoryType::Fact, MemoryType::Note];

pub struct Retriever<'a> {
    conn: &'a Connection,
}

impl<'a> Retriever<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// §4.3 "GetContext". Always resolves `rules`; for `RulesOnly` mode,
    /// returns immediately with an empty `memories`. Otherwise splits into a
    /// working tier (max 3) and a long-term tier (remaining budget, max 50),
    /// concatenated working-first. Never includes rule-type rows in
    /// `memories` — rules are carried in the separate `rules` field.
    pub fn get_context(&self, opts: ContextOptions, now: DateTime<Utc>) -> Result<ContextResult> {
        let store = Store::new(self.conn);
        let rules = store.get_rules(
            RuleOptions {
                project_id: opts.project_id.clone(),
                user_id: opts.user_id.clone(),
            },
            now,
        )?;

        if opts.mode == ContextMode::RulesOnly {
            return Ok(ContextResult { rules, memories: Vec::new(), used_fallback: false, fallback_reason: None });
        }

        let query = opts.query.as_deref().unwrap_or("").trim();
        if query.is_empty() {
            return Ok(ContextResult { rules, memories: Vec::new(), used_fallback: false, fallback_reason: None });
        }

        let requested = clamp_limit(opts.limit, CONTEXT_LONG_TERM_DEFAULT, CONTEXT_LONG_TERM_MAX);
        let working_limit = requested.min(CONTEXT_WORKING_DEFAULT);

        let working = store.search(
            query,
            SearchOptions {
                scope_global: true,
                scope_project: true,
                project_id: opts.project_id.clone(),
                user_id: opts.user_id.clone(),
                layers: vec![Layer::Working],
                types: TIER_TYPES.to_vec(),
                limit: Some(working_limit as f64),
            },
            now,
        )?;

        let remaining = requested.saturating_sub(working.memories.len()).min(CONTEXT_LONG_TERM_MAX);
        let mut memories = working.memories;
        let mut used_fallback = working.used_fallback;
        let mut fallback_reason = working.fallback_reason;

        if remaining > 0 {
            let long_term_layers = match opts.mode {
                ContextMode::All => vec![Layer::LongTerm],
                ContextMode::Layer(l) => vec![l],
                ContextMode::RulesOnly => unreachable!("handled above"),
            };
            let long_term = store.search(
                query,
                SearchOptions {
                    scope_global: true,
                    scope_project: true,
                    project_id: opts.project_id,
                    user_id: opts.user_id,
                    layers: long_term_layers,
                    types: TIER_TYPES.to_vec(),
                    limit: Some(remaining as f64),
                },
                now,
            )?;
            memories.extend(long_term.memories);
            if long_term.used_fallback {
                used_fallback = true;
                fallback_reason = long_term.fallback_reason;
            }
        }

        // never surface rule-type rows via `memories` even if a tier query
        // somehow matched one (defense-in-depth; TIER_TYPES already excludes it)
        memories.retain(|m| m.memory_type != MemoryType::Rule);

        Ok(ContextResult { rules, memories, used_fallback, fallback_reason })
    }
}

/// §4.3 "Token estimation for context". Seeds write-ahead compaction
/// decisions in C7 too (same estimator).
pub fn estimate_tokens(rules: &[Memory], memories: &[Memory]) -> u64 {
    let mut total: u64 = 24;
    for r in rules {
        total += 8 + content_tokens(&r.content) + tags_tokens(&r.tags);
    }
    for m in memories {
        total += 12 + content_tokens(&m.content) + tags_tokens(&m.tags);
        if let Some(cat) = &m.category {
            total += content_tokens(cat);
        }
    }
    total
}

fn content_tokens(s: &str) -> u64 {
    ceil_div(s.chars().count() as u64, 4)
}

fn tags_tokens(tags: &[String]) -> u64 {
    let joined = tags.join(",");
    ceil_div(joined.chars().count() as u64, 4)
}

fn ceil_div(n: u64, d: u64) -> u64 {
    n.div_ceil(d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use crate::store::AddOptions;
    use crate::model::{MemoryType, Scope};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::ensure(&conn).unwrap();
        conn
    }

    #[test]
    fn rules_only_mode_never_returns_memories() {
        let conn = setup();
        let store = Store::new(&conn);
        store
            .add("Use Zod for validation", AddOptions { memory_type: Some(MemoryType::Rule), ..Default::default() }, 24.0, now())
            .unwrap();
        store
            .add("We chose Postgres", AddOptions { memory_type: Some(MemoryType::Decision), ..Default::default() }, 24.0, now())
            .unwrap();

        let retriever = Retriever::new(&conn);
        let result = retriever
            .get_context(ContextOptions { query: Some("Postgres".into()), mode: ContextMode::RulesOnly, ..Default::default() }, now())
            .unwrap();
        assert_eq!(result.rules.len(), 1);
        assert!(result.memories.is_empty());
    }

    #[test]
    fn empty_query_returns_rules_with_no_memories() {
        let conn = setup();
        let store = Store::new(&conn);
        store
            .add("rule one", AddOptions { memory_type: Some(MemoryType::Rule), ..Default::default() }, 24.0, now())
            .unwrap();

        let retriever = Retriever::new(&conn);
        let result = retriever.get_context(ContextOptions::default(), now()).unwrap();
        assert_eq!(result.rules.len(), 1);
        assert!(result.memories.is_empty());
    }

    #[test]
    fn working_tier_is_capped_at_three_and_precedes_long_term() {
        let conn = setup();
        let store = Store::new(&conn);
        for i in 0..5 {
            store
                .add(
                    &format!("working fact number {i}"),
                    AddOptions { memory_type: Some(MemoryType::Fact), layer: Some(Layer::Working), ..Default::default() },
                    24.0,
                    now(),
                )
                .unwrap();
        }
        store
            .add(
                "long term fact number",
                AddOptions { memory_type: Some(MemoryType::Fact), layer: Some(Layer::LongTerm), ..Default::default() },
                24.0,
                now(),
            )
            .unwrap();

        let retriever = Retriever::new(&conn);
        let result = retriever
            .get_context(ContextOptions { query: Some("fact number".into()), ..Default::default() }, now())
            .unwrap();
        let working_count = result.memories.iter().filter(|m| m.layer == Layer::Working).count();
        assert!(working_count <= CONTEXT_WORKING_DEFAULT);
    }

    #[test]
    fn token_estimate_grows_with_content_length() {
        let short = Memory {
            id: "a".into(),
            content: "hi".into(),
            memory_type: MemoryType::Note,
            layer: Layer::LongTerm,
            scope: Scope::Global,
            project_id: None,
            user_id: None,
            tags: vec![],
            paths: vec![],
            category: None,
            metadata: None,
            source_session_id: None,
            confidence: None,
            last_confirmed_at: None,
            upsert_key: None,
            superseded_by: None,
            superseded_at: None,
            created_at: now(),
            updated_at: now(),
            deleted_at: None,
            expires_at: None,
        };
        let mut long = short.clone();
        long.content = "a".repeat(400);

        assert!(estimate_tokens(&[], &[long]) > estimate_tokens(&[], &[short]));
    }
}
