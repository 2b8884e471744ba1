use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// §3 "type: one of {rule, decision, fact, note, skill}".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Rule,
    Decision,
    Fact,
    Note,
    Skill,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Rule => "rule",
            MemoryType::Decision => "decision",
            MemoryType::Fact => "fact",
            MemoryType::Note => "note",
            MemoryType::Skill => "skill",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "rule" => Ok(MemoryType::Rule),
            "decision" => Ok(MemoryType::Decision),
            "fact" => Ok(MemoryType::Fact),
            "note" => Ok(MemoryType::Note),
            "skill" => Ok(MemoryType::Skill),
            other => Err(StoreError::validation(
                "MEMORY_TYPE_INVALID",
                format!("unknown memory type '{other}'"),
            )),
        }
    }
}

/// §3 "layer: one of {rule, working, long_term}".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Rule,
    Working,
    LongTerm,
}

impl Layer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Rule => "rule",
            Layer::Working => "working",
            Layer::LongTerm => "long_term",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "rule" => Ok(Layer::Rule),
            "working" => Ok(Layer::Working),
            "long_term" => Ok(Layer::LongTerm),
            other => Err(StoreError::validation(
                "MEMORY_LAYER_INVALID",
                format!("unknown layer '{other}'"),
            )),
        }
    }

    /// Default layer for a given type, per §3: "default is `rule` when
    /// type=rule else `long_term`".
    pub fn default_for_type(t: MemoryType) -> Self {
        if t == MemoryType::Rule {
            Layer::Rule
        } else {
            Layer::LongTerm
        }
    }
}

/// §3 "scope: {global, project}".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    Project,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Project => "project",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "global" => Ok(Scope::Global),
            "project" => Ok(Scope::Project),
            other => Err(StoreError::validation(
                "TENANT_ID_INVALID",
                format!("unknown scope '{other}'"),
            )),
        }
    }
}

/// §3 "MemoryLink ... link_type ∈ {supersedes, contradicts}".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Supersedes,
    Contradicts,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Supersedes => "supersedes",
            LinkType::Contradicts => "contradicts",
        }
    }
}

/// The central record (§3 "Memory").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub content: String,
    pub memory_type: MemoryType,
    pub layer: Layer,
    pub scope: Scope,
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
    pub superseded_by: Option<String>,
    pub superseded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Memory {
    /// §3 Invariant (Active): not soft-deleted and not expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.deleted_at.is_none() && self.expires_at.is_none_or(|exp| exp > now)
    }
}

/// §3 "MemoryHistory — append-only prior versions".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHistory {
    pub memory_id: String,
    pub changed_at: DateTime<Utc>,
    pub change_type: String,
    pub content: String,
    pub memory_type: MemoryType,
    pub layer: Layer,
    pub tags: Vec<String>,
    pub paths: Vec<String>,
    pub category: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub expires_at: Option<DateTime<Utc>>,
    pub upsert_key: Option<String>,
}

/// §3 "MemoryLink — directional relations".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryLink {
    pub id: i64,
    pub source_id: String,
    pub target_id: String,
    pub link_type: LinkType,
    pub created_at: DateTime<Utc>,
}

/// Normalize a tag/path token list: trim, drop blanks, dedupe preserving
/// first occurrence (§4.2 "Add").
pub fn normalize_tokens(tokens: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for t in tokens {
        let trimmed = t.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            out.push(trimmed.to_string());
        }
    }
    out
}

/// Tags/paths are persisted as comma-joined strings (§3).
pub fn join_tokens(tokens: &[String]) -> String {
    tokens.join(",")
}

pub fn split_tokens(s: &str) -> Vec<String> {
    if s.is_empty() {
        return Vec::new();
    }
    s.split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Normalize `type:slug` upsert keys (§3, §4.8): lowercase, collapse
/// whitespace/punctuation runs to `-`.
pub fn normalize_upsert_key(memory_type: MemoryType, raw_key: &str) -> String {
    let slug = normalize_slug(raw_key);
    format!("{}:{}", memory_type.as_str(), slug)
}

pub fn normalize_slug(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut last_was_dash = false;
    for c in lower.chars() {
        if c.is_alphanumeric() {
            out.push(c);
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// §4.8 "normalize(content) ... lowercase, collapse whitespace".
pub fn normalize_content(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Derive an upsert key from category or the first line of content when
/// the caller didn't supply one explicitly (§4.2, §4.8).
pub fn derive_upsert_key(memory_type: MemoryType, category: Option<&str>, content: &str) -> Option<String> {
    if let Some(cat) = category
        && !cat.trim().is_empty()
    {
        return Some(normalize_upsert_key(memory_type, cat));
    }
    let first_line = content.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return None;
    }
    // Keep derivation conservative: only derive from a short, slug-like
    // first line (e.g. "Use Zod for validation" -> "use-zod-for-validation"),
    // not from arbitrary prose paragraphs.
    if first_line.len() > 80 {
        return None;
    }
    Some(normalize_upsert_key(memory_type, first_line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_tokens_trims_dedupes_preserves_order() {
        let input = vec![
            " rust ".to_string(),
            "rust".to_string(),
            "".to_string(),
            "  ".to_string(),
            "async".to_string(),
        ];
        assert_eq!(normalize_tokens(&input), vec!["rust", "async"]);
    }

    #[test]
    fn join_and_split_roundtrip() {
        let tokens = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let joined = join_tokens(&tokens);
        assert_eq!(joined, "a,b,c");
        assert_eq!(split_tokens(&joined), tokens);
    }

    #[test]
    fn split_tokens_empty_string_is_empty_vec() {
        assert!(split_tokens("").is_empty());
    }

    #[test]
    fn normalize_upsert_key_lowercases_and_slugifies() {
        assert_eq!(
            normalize_upsert_key(MemoryType::Rule, "Use Zod For Validation!"),
            "rule:use-zod-for-validation"
        );
    }

    #[test]
    fn normalize_content_collapses_whitespace_and_case() {
        assert_eq!(normalize_content("Use   Zod\nFor Validation"), "use zod for validation");
    }

    #[test]
    fn default_layer_for_type() {
        assert_eq!(Layer::default_for_type(MemoryType::Rule), Layer::Rule);
        assert_eq!(Layer::default_for_type(MemoryType::Note), Layer::LongTerm);
    }
}
