//! Row shapes for the session machine (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionScope {
    Global,
    Project,
}

impl SessionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionScope::Global => "global",
            SessionScope::Project => "project",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "project" => SessionScope::Project,
            _ => SessionScope::Global,
        }
    }
}

/// §3 "status ∈ {active,compacted,closed}". Terminal states reject new events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Compacted,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Compacted => "compacted",
            SessionStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "compacted" => SessionStatus::Compacted,
            "closed" => SessionStatus::Closed,
            _ => SessionStatus::Active,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub scope: SessionScope,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub client: Option<String>,
    pub status: SessionStatus,
    pub title: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventRole {
    User,
    Assistant,
    Tool,
}

impl EventRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventRole::User => "user",
            EventRole::Assistant => "assistant",
            EventRole::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "user" => EventRole::User,
            "tool" => EventRole::Tool,
            _ => EventRole::Assistant,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Checkpoint,
    Summary,
    Event,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::Checkpoint => "checkpoint",
            EventKind::Summary => "summary",
            EventKind::Event => "event",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "checkpoint" => EventKind::Checkpoint,
            "summary" => EventKind::Summary,
            "event" => EventKind::Event,
            _ => EventKind::Message,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub id: i64,
    pub session_id: String,
    pub role: EventRole,
    pub kind: EventKind,
    pub content: String,
    pub token_count: Option<i64>,
    pub turn_index: Option<i64>,
    pub is_meaningful: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTrigger {
    NewSession,
    Reset,
    Manual,
    AutoCompaction,
}

impl SourceTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTrigger::NewSession => "new_session",
            SourceTrigger::Reset => "reset",
            SourceTrigger::Manual => "manual",
            SourceTrigger::AutoCompaction => "auto_compaction",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: i64,
    pub session_id: String,
    pub slug: String,
    pub source_trigger: String,
    pub transcript_md: String,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionTrigger {
    Count,
    Time,
    Semantic,
}

impl CompactionTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompactionTrigger::Count => "count",
            CompactionTrigger::Time => "time",
            CompactionTrigger::Semantic => "semantic",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompactionEvent {
    pub id: i64,
    pub session_id: String,
    pub trigger_type: String,
    pub reason: Option<String>,
    pub token_count_before: i64,
    pub turn_count_before: i64,
    pub summary_tokens: i64,
    pub checkpoint_memory_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionStatusSummary {
    pub event_count: i64,
    pub checkpoint_count: i64,
    pub snapshot_count: i64,
    pub latest_event_at: Option<DateTime<Utc>>,
    pub latest_checkpoint_at: Option<DateTime<Utc>>,
    pub latest_snapshot_at: Option<DateTime<Utc>>,
}

/// Slug normalization (§4.7 "CreateSnapshot"): lowercase, non-alnum -> `-`,
/// trim `-`, truncate to 80, fallback `snapshot-<ts>`.
pub fn normalize_slug(raw: Option<&str>, now: DateTime<Utc>) -> String {
    let fallback = || format!("snapshot-{}", now.timestamp_millis());
    let Some(raw) = raw else { return fallback() };

    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    let truncated: String = trimmed.chars().take(80).collect();
    let truncated = truncated.trim_matches('-');
    if truncated.is_empty() {
        fallback()
    } else {
        truncated.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn slug_normalizes_and_truncates() {
        assert_eq!(normalize_slug(Some("  Hello, World! "), now()), "hello-world");
        let long = "a".repeat(200);
        assert_eq!(normalize_slug(Some(&long), now()).len(), 80);
    }

    #[test]
    fn slug_falls_back_when_empty_after_normalization() {
        let slug = normalize_slug(Some("!!!"), now());
        assert!(slug.starts_with("snapshot-"));
    }

    #[test]
    fn slug_falls_back_when_absent() {
        let slug = normalize_slug(None, now());
        assert!(slug.starts_with("snapshot-"));
    }
}
