//! Write-ahead compaction and the inactivity worker (§4.7).

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;

use mem_core::{Memory, Store};

use crate::error::Result;
use crate::model::{CompactionEvent, EventRole, SessionEvent, SessionStatus};
use crate::session::{CheckpointOptions, EndSessionOptions, SessionStore};

const RULES_CAP: usize = 5;
const MEMORIES_CAP: usize = 8;
const TRUNCATE_CHARS: usize = 140;

#[derive(Debug, Clone, Default)]
pub struct WriteAheadOptions {
    pub token_count_before: Option<i64>,
    pub turn_count_before: i64,
    pub trigger_type: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WriteAheadResult {
    pub checkpoint_event: SessionEvent,
    pub compaction_event: CompactionEvent,
    pub token_count_before: i64,
}

/// §4.3 "The same estimator seeds write-ahead compaction decisions in C7."
/// ceil(chars/4), matching `mem_core::retrieval`'s per-field token formula.
fn estimate_text_tokens(s: &str) -> i64 {
    s.chars().count().div_ceil(4) as i64
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

/// Builds the multi-line checkpoint body, capping rules at 5 and memories
/// at 8, each truncated to 140 chars (§4.7 step 2).
pub fn build_checkpoint_content(rules: &[Memory], memories: &[Memory]) -> String {
    let mut lines = Vec::new();
    lines.push("# Memory checkpoint".to_string());
    if !rules.is_empty() {
        lines.push("## Rules".to_string());
        for r in rules.iter().take(RULES_CAP) {
            lines.push(format!("- {}", truncate(&r.content, TRUNCATE_CHARS)));
        }
    }
    if !memories.is_empty() {
        lines.push("## Memories".to_string());
        for m in memories.iter().take(MEMORIES_CAP) {
            lines.push(format!("- {}", truncate(&m.content, TRUNCATE_CHARS)));
        }
    }
    lines.join("\n")
}

pub struct Compactor<'a> {
    conn: &'a Connection,
}

impl<'a> Compactor<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// §4.7 "WriteAheadCompactionCheckpoint": estimates tokens-before when
    /// not supplied, writes a checkpoint event, then logs a compaction
    /// event referencing it.
    pub fn write_ahead_checkpoint(
        &self,
        session_id: &str,
        rules: &[Memory],
        memories: &[Memory],
        opts: WriteAheadOptions,
        now: DateTime<Utc>,
    ) -> Result<WriteAheadResult> {
        let token_count_before = opts.token_count_before.unwrap_or_else(|| mem_core::estimate_tokens(rules, memories) as i64);
        let checkpoint_content = build_checkpoint_content(rules, memories);
        let summary_tokens = estimate_text_tokens(&checkpoint_content);

        let sessions = SessionStore::new(self.conn);
        let checkpoint_event = sessions.checkpoint(
            session_id,
            &checkpoint_content,
            CheckpointOptions { role: Some(EventRole::Assistant), token_count: Some(summary_tokens), ..Default::default() },
            now,
        )?;

        let compaction_event = sessions.record_compaction_event(
            session_id,
            &opts.trigger_type,
            opts.reason.as_deref(),
            token_count_before,
            opts.turn_count_before,
            summary_tokens,
            Some(&checkpoint_event.id.to_string()),
            now,
        )?;

        Ok(WriteAheadResult { checkpoint_event, compaction_event, token_count_before })
    }
}

#[derive(Debug, Clone, Default)]
pub struct InactivityWorkerOptions {
    pub inactivity_minutes: i64,
    pub limit: usize,
    pub event_window: usize,
}

impl InactivityWorkerOptions {
    pub fn with_defaults(self) -> Self {
        Self {
            inactivity_minutes: if self.inactivity_minutes > 0 { self.inactivity_minutes } else { 60 },
            limit: if self.limit > 0 { self.limit } else { 25 },
            event_window: if self.event_window > 0 { self.event_window } else { 8 },
        }
    }
}

#[derive(Debug, Clone)]
pub struct InactivityWorkerResult {
    pub inactivity_minutes: i64,
    pub scanned: usize,
    pub checkpointed: usize,
    pub compacted: usize,
    pub failures: Vec<(String, String)>,
}

/// §4.7 "RunInactivityCompactionWorker": per-item failures never abort the
/// run (§7 propagation policy — background loops absorb failures into an
/// aggregate result).
pub fn run_inactivity_compaction_worker(
    conn: &Connection,
    opts: InactivityWorkerOptions,
    now: DateTime<Utc>,
) -> Result<InactivityWorkerResult> {
    let opts = opts.with_defaults();
    let cutoff = now - Duration::minutes(opts.inactivity_minutes);

    let sessions = SessionStore::new(conn);
    let due = sessions.active_sessions_due_for_inactivity(cutoff, opts.limit)?;

    let mut checkpointed = 0usize;
    let mut compacted = 0usize;
    let mut failures = Vec::new();

    for session in &due {
        match compact_one_session(conn, &session.id, opts.event_window, now) {
            Ok(()) => {
                checkpointed += 1;
                compacted += 1;
            }
            Err(e) => {
                failures.push((session.id.clone(), e.to_string()));
            }
        }
    }

    Ok(InactivityWorkerResult { inactivity_minutes: opts.inactivity_minutes, scanned: due.len(), checkpointed, compacted, failures })
}

fn compact_one_session(conn: &Connection, session_id: &str, event_window: usize, now: DateTime<Utc>) -> Result<()> {
    let sessions = SessionStore::new(conn);
    let events = sessions.list_events(session_id, crate::session::ListEventsOptions { limit: Some(event_window), meaningful_only: true })?;

    let synthetic_content = build_synthetic_checkpoint_content(&events);
    let compactor = Compactor::new(conn);
    let memory_store = Store::new(conn);
    let rules = memory_store.get_rules(mem_core::RuleOptions::default(), now)?;

    compactor.write_ahead_checkpoint(
        session_id,
        &rules,
        &[],
        WriteAheadOptions {
            token_count_before: Some(estimate_text_tokens(&synthetic_content)),
            turn_count_before: events.len() as i64,
            trigger_type: "time".to_string(),
            reason: Some("inactivity".to_string()),
        },
        now,
    )?;

    sessions.end_session(session_id, EndSessionOptions { status: Some(SessionStatus::Compacted) }, now)?;
    Ok(())
}

fn build_synthetic_checkpoint_content(events: &[SessionEvent]) -> String {
    let mut lines = vec!["# Inactivity compaction".to_string()];
    for e in events {
        lines.push(format!("- [{}] {}", e.role.as_str(), truncate(&e.content, TRUNCATE_CHARS)));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StartSessionOptions;
    use chrono::TimeZone;
    use mem_core::AddOptions;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        mem_core::schema::ensure(&conn).unwrap();
        crate::schema::ensure(&conn).unwrap();
        conn
    }

    #[test]
    fn checkpoint_content_caps_rules_and_memories() {
        let rules: Vec<Memory> = Vec::new();
        let memories: Vec<Memory> = Vec::new();
        let content = build_checkpoint_content(&rules, &memories);
        assert_eq!(content, "# Memory checkpoint");
    }

    #[test]
    fn write_ahead_checkpoint_writes_checkpoint_and_compaction_event() {
        let conn = setup();
        let sessions = SessionStore::new(&conn);
        sessions.start_session(StartSessionOptions::default(), "s1".into(), now()).unwrap();

        let compactor = Compactor::new(&conn);
        let result = compactor
            .write_ahead_checkpoint(
                "s1",
                &[],
                &[],
                WriteAheadOptions { trigger_type: "count".to_string(), turn_count_before: 10, ..Default::default() },
                now(),
            )
            .unwrap();

        assert_eq!(result.compaction_event.trigger_type, "count");
        assert_eq!(result.compaction_event.turn_count_before, 10);
        assert!(result.token_count_before >= 0);
    }

    #[test]
    fn inactivity_worker_compacts_stale_sessions_and_skips_active_ones() {
        let conn = setup();
        {
            let store = mem_core::Store::new(&conn);
            store.add("a rule", AddOptions { memory_type: Some(mem_core::MemoryType::Rule), ..Default::default() }, 24.0, now()).unwrap();
        }
        let sessions = SessionStore::new(&conn);
        sessions.start_session(StartSessionOptions::default(), "stale".into(), now() - Duration::hours(2)).unwrap();
        sessions.start_session(StartSessionOptions::default(), "fresh".into(), now()).unwrap();

        let result = run_inactivity_compaction_worker(&conn, InactivityWorkerOptions::default(), now()).unwrap();
        assert_eq!(result.scanned, 1);
        assert_eq!(result.compacted, 1);
        assert!(result.failures.is_empty());

        let stale = sessions.get_session("stale").unwrap().unwrap();
        assert_eq!(stale.status, SessionStatus::Compacted);
        let fresh = sessions.get_session("fresh").unwrap().unwrap();
        assert_eq!(fresh.status, SessionStatus::Active);
    }
}
