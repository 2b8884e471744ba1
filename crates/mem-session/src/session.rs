//! Session lifecycle operations (§4.7): StartSession, Checkpoint,
//! ListEvents, CreateSnapshot, EndSession, Status.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::{Result, SessionError};
use crate::model::{
    CompactionEvent, EventKind, EventRole, Session, SessionEvent, SessionScope, SessionSnapshot,
    SessionStatus, SessionStatusSummary, normalize_slug,
};

#[derive(Debug, Clone, Default)]
pub struct StartSessionOptions {
    pub global: bool,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub client: Option<String>,
    pub title: Option<String>,
    pub metadata: Option<serde_json::Value>,
    /// §4.7 "If an external OpenClaw bootstrap context exists ... immediately
    /// writes one summary-kind checkpoint with the bootstrap content."
    pub bootstrap_content: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointOptions {
    pub role: Option<EventRole>,
    pub kind: Option<EventKind>,
    pub token_count: Option<i64>,
    pub turn_index: Option<i64>,
    pub is_meaningful: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ListEventsOptions {
    pub limit: Option<usize>,
    pub meaningful_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CreateSnapshotOptions {
    pub slug: Option<String>,
    pub source_trigger: String,
    pub transcript_md: String,
    pub message_count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct EndSessionOptions {
    pub status: Option<SessionStatus>,
}

const LIST_EVENTS_DEFAULT: usize = 50;

pub struct SessionStore<'a> {
    conn: &'a Connection,
}

impl<'a> SessionStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn start_session(&self, opts: StartSessionOptions, id: String, now: DateTime<Utc>) -> Result<Session> {
        let scope = if !opts.global && opts.project_id.is_some() { SessionScope::Project } else { SessionScope::Global };
        let project_id = if scope == SessionScope::Project { opts.project_id.clone() } else { None };

        self.conn.execute(
            "INSERT INTO memory_sessions \
             (id, scope, project_id, user_id, client, status, title, metadata, started_at, last_activity_at, ended_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?7, ?8, ?8, NULL)",
            params![
                id,
                scope.as_str(),
                project_id,
                opts.user_id,
                opts.client,
                opts.title,
                opts.metadata.as_ref().map(|v| v.to_string()),
                now.to_rfc3339(),
            ],
        )?;

        if let Some(bootstrap) = &opts.bootstrap_content {
            self.checkpoint(
                &id,
                bootstrap,
                CheckpointOptions { kind: Some(EventKind::Summary), ..Default::default() },
                now,
            )?;
        }

        self.get_session(&id)?.ok_or_else(|| SessionError::NotFound(id.clone()))
    }

    /// §4.7 "Checkpoint": fails if the session isn't active; defaults
    /// role=assistant, kind=checkpoint, is_meaningful=true; bumps
    /// `last_activity_at`.
    pub fn checkpoint(&self, session_id: &str, content: &str, opts: CheckpointOptions, now: DateTime<Utc>) -> Result<SessionEvent> {
        let session = self.get_session(session_id)?.ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if session.status != SessionStatus::Active {
            return Err(SessionError::InvalidState {
                session_id: session_id.to_string(),
                status: session.status.as_str().to_string(),
                action: "checkpoint".to_string(),
            });
        }

        let role = opts.role.unwrap_or(EventRole::Assistant);
        let kind = opts.kind.unwrap_or(EventKind::Checkpoint);
        let is_meaningful = opts.is_meaningful.unwrap_or(true);

        self.conn.execute(
            "INSERT INTO memory_session_events \
             (session_id, role, kind, content, token_count, turn_index, is_meaningful, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session_id,
                role.as_str(),
                kind.as_str(),
                content,
                opts.token_count,
                opts.turn_index,
                is_meaningful as i64,
                now.to_rfc3339(),
            ],
        )?;
        let event_id = self.conn.last_insert_rowid();

        self.conn.execute(
            "UPDATE memory_sessions SET last_activity_at=?1 WHERE id=?2",
            params![now.to_rfc3339(), session_id],
        )?;

        self.get_event(event_id)
    }

    /// §4.7 "ListEvents": select the last N then present ascending.
    pub fn list_events(&self, session_id: &str, opts: ListEventsOptions) -> Result<Vec<SessionEvent>> {
        let limit = opts.limit.unwrap_or(LIST_EVENTS_DEFAULT);
        let meaningful_clause = if opts.meaningful_only { "AND is_meaningful=1" } else { "" };
        let sql = format!(
            "SELECT id, session_id, role, kind, content, token_count, turn_index, is_meaningful, created_at \
             FROM (SELECT * FROM memory_session_events WHERE session_id=?1 {meaningful_clause} ORDER BY created_at DESC, id DESC LIMIT ?2) \
             ORDER BY created_at ASC, id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![session_id, limit as i64], row_to_event)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r??);
        }
        Ok(out)
    }

    /// §4.7 "CreateSnapshot". Bumps `last_activity_at`.
    pub fn create_snapshot(&self, session_id: &str, opts: CreateSnapshotOptions, now: DateTime<Utc>) -> Result<SessionSnapshot> {
        self.get_session(session_id)?.ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let slug = normalize_slug(opts.slug.as_deref(), now);

        self.conn.execute(
            "INSERT INTO memory_session_snapshots \
             (session_id, slug, source_trigger, transcript_md, message_count, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![session_id, slug, opts.source_trigger, opts.transcript_md, opts.message_count, now.to_rfc3339()],
        )?;
        let snapshot_id = self.conn.last_insert_rowid();

        self.conn.execute(
            "UPDATE memory_sessions SET last_activity_at=?1 WHERE id=?2",
            params![now.to_rfc3339(), session_id],
        )?;

        self.get_snapshot(snapshot_id)
    }

    /// §4.7 "EndSession": default status=closed; sets `ended_at`.
    pub fn end_session(&self, session_id: &str, opts: EndSessionOptions, now: DateTime<Utc>) -> Result<Option<Session>> {
        let status = opts.status.unwrap_or(SessionStatus::Closed);
        let updated = self.conn.execute(
            "UPDATE memory_sessions SET status=?1, ended_at=?2 WHERE id=?3",
            params![status.as_str(), now.to_rfc3339(), session_id],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        self.get_session(session_id)
    }

    /// §4.7 "Status": counts of events, checkpoints, snapshots; latest
    /// timestamps.
    pub fn status(&self, session_id: &str) -> Result<SessionStatusSummary> {
        let event_count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM memory_session_events WHERE session_id=?1",
            params![session_id],
            |r| r.get(0),
        )?;
        let checkpoint_count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM memory_session_events WHERE session_id=?1 AND kind='checkpoint'",
            params![session_id],
            |r| r.get(0),
        )?;
        let snapshot_count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM memory_session_snapshots WHERE session_id=?1",
            params![session_id],
            |r| r.get(0),
        )?;
        let latest_event_at = self.latest_ts("SELECT MAX(created_at) FROM memory_session_events WHERE session_id=?1", session_id)?;
        let latest_checkpoint_at = self.latest_ts(
            "SELECT MAX(created_at) FROM memory_session_events WHERE session_id=?1 AND kind='checkpoint'",
            session_id,
        )?;
        let latest_snapshot_at = self.latest_ts("SELECT MAX(created_at) FROM memory_session_snapshots WHERE session_id=?1", session_id)?;

        Ok(SessionStatusSummary {
            event_count,
            checkpoint_count,
            snapshot_count,
            latest_event_at,
            latest_checkpoint_at,
            latest_snapshot_at,
        })
    }

    fn latest_ts(&self, sql: &str, session_id: &str) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self.conn.query_row(sql, params![session_id], |r| r.get(0))?;
        Ok(raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)))
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.conn
            .query_row(
                "SELECT id, scope, project_id, user_id, client, status, title, metadata, started_at, last_activity_at, ended_at \
                 FROM memory_sessions WHERE id=?1",
                params![session_id],
                row_to_session,
            )
            .optional()?
            .transpose()
    }

    pub fn active_sessions_due_for_inactivity(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Session>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, scope, project_id, user_id, client, status, title, metadata, started_at, last_activity_at, ended_at \
             FROM memory_sessions WHERE status='active' AND last_activity_at <= ?1 ORDER BY last_activity_at ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![cutoff.to_rfc3339(), limit as i64], row_to_session)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r??);
        }
        Ok(out)
    }

    fn get_event(&self, id: i64) -> Result<SessionEvent> {
        self.conn
            .query_row(
                "SELECT id, session_id, role, kind, content, token_count, turn_index, is_meaningful, created_at \
                 FROM memory_session_events WHERE id=?1",
                params![id],
                row_to_event,
            )?
    }

    fn get_snapshot(&self, id: i64) -> Result<SessionSnapshot> {
        self.conn.query_row(
            "SELECT id, session_id, slug, source_trigger, transcript_md, message_count, created_at \
             FROM memory_session_snapshots WHERE id=?1",
            params![id],
            |r: &Row| {
                let created_at: String = r.get(6)?;
                Ok(SessionSnapshot {
                    id: r.get(0)?,
                    session_id: r.get(1)?,
                    slug: r.get(2)?,
                    source_trigger: r.get(3)?,
                    transcript_md: r.get(4)?,
                    message_count: r.get(5)?,
                    created_at: parse_dt(&created_at),
                })
            },
        ).map_err(SessionError::from)
    }

    pub fn record_compaction_event(
        &self,
        session_id: &str,
        trigger_type: &str,
        reason: Option<&str>,
        token_count_before: i64,
        turn_count_before: i64,
        summary_tokens: i64,
        checkpoint_memory_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<CompactionEvent> {
        self.conn.execute(
            "INSERT INTO memory_compaction_events \
             (session_id, trigger_type, reason, token_count_before, turn_count_before, summary_tokens, checkpoint_memory_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![session_id, trigger_type, reason, token_count_before, turn_count_before, summary_tokens, checkpoint_memory_id, now.to_rfc3339()],
        )?;
        let id = self.conn.last_insert_rowid();
        self.conn.query_row(
            "SELECT id, session_id, trigger_type, reason, token_count_before, turn_count_before, summary_tokens, checkpoint_memory_id, created_at \
             FROM memory_compaction_events WHERE id=?1",
            params![id],
            |r: &Row| {
                let created_at: String = r.get(8)?;
                Ok(CompactionEvent {
                    id: r.get(0)?,
                    session_id: r.get(1)?,
                    trigger_type: r.get(2)?,
                    reason: r.get(3)?,
                    token_count_before: r.get(4)?,
                    turn_count_before: r.get(5)?,
                    summary_tokens: r.get(6)?,
                    checkpoint_memory_id: r.get(7)?,
                    created_at: parse_dt(&created_at),
                })
            },
        ).map_err(SessionError::from)
    }
}

fn row_to_session(r: &Row) -> rusqlite::Result<Result<Session>> {
    let scope: String = r.get(1)?;
    let status: String = r.get(5)?;
    let metadata: Option<String> = r.get(7)?;
    let started_at: String = r.get(8)?;
    let last_activity_at: String = r.get(9)?;
    let ended_at: Option<String> = r.get(10)?;

    Ok(Ok(Session {
        id: r.get(0)?,
        scope: SessionScope::parse(&scope),
        project_id: r.get(2)?,
        user_id: r.get(3)?,
        client: r.get(4)?,
        status: SessionStatus::parse(&status),
        title: r.get(6)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        started_at: parse_dt(&started_at),
        last_activity_at: parse_dt(&last_activity_at),
        ended_at: ended_at.map(|s| parse_dt(&s)),
    }))
}

fn row_to_event(r: &Row) -> rusqlite::Result<Result<SessionEvent>> {
    let role: String = r.get(2)?;
    let kind: String = r.get(3)?;
    let is_meaningful: i64 = r.get(7)?;
    let created_at: String = r.get(8)?;

    Ok(Ok(SessionEvent {
        id: r.get(0)?,
        session_id: r.get(1)?,
        role: EventRole::parse(&role),
        kind: EventKind::parse(&kind),
        content: r.get(4)?,
        token_count: r.get(5)?,
        turn_index: r.get(6)?,
        is_meaningful: is_meaningful != 0,
        created_at: parse_dt(&created_at),
    }))
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
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
        crate::schema::ensure(&conn).unwrap();
        conn
    }

    #[test]
    fn start_session_defaults_to_global_without_project() {
        let conn = setup();
        let store = SessionStore::new(&conn);
        let session = store.start_session(StartSessionOptions::default(), "s1".into(), now()).unwrap();
        assert_eq!(session.scope, SessionScope::Global);
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[test]
    fn start_session_scopes_to_project_when_not_global() {
        let conn = setup();
        let store = SessionStore::new(&conn);
        let opts = StartSessionOptions { global: false, project_id: Some("proj-1".into()), ..Default::default() };
        let session = store.start_session(opts, "s1".into(), now()).unwrap();
        assert_eq!(session.scope, SessionScope::Project);
        assert_eq!(session.project_id.as_deref(), Some("proj-1"));
    }

    #[test]
    fn bootstrap_content_writes_a_summary_checkpoint() {
        let conn = setup();
        let store = SessionStore::new(&conn);
        let opts = StartSessionOptions { bootstrap_content: Some("bootstrap context".into()), ..Default::default() };
        store.start_session(opts, "s1".into(), now()).unwrap();

        let events = store.list_events("s1", ListEventsOptions::default()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Summary);
        assert_eq!(events[0].content, "bootstrap context");
    }

    #[test]
    fn checkpoint_fails_on_non_active_session() {
        let conn = setup();
        let store = SessionStore::new(&conn);
        store.start_session(StartSessionOptions::default(), "s1".into(), now()).unwrap();
        store.end_session("s1", EndSessionOptions::default(), now()).unwrap();

        let err = store.checkpoint("s1", "content", CheckpointOptions::default(), now()).unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { .. }));
    }

    #[test]
    fn checkpoint_defaults_role_and_kind_and_bumps_activity() {
        let conn = setup();
        let store = SessionStore::new(&conn);
        store.start_session(StartSessionOptions::default(), "s1".into(), now()).unwrap();

        let event = store.checkpoint("s1", "note", CheckpointOptions::default(), now() + chrono::Duration::minutes(5)).unwrap();
        assert_eq!(event.role, EventRole::Assistant);
        assert_eq!(event.kind, EventKind::Checkpoint);
        assert!(event.is_meaningful);

        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.last_activity_at, now() + chrono::Duration::minutes(5));
    }

    #[test]
    fn list_events_orders_ascending_after_selecting_last_n() {
        let conn = setup();
        let store = SessionStore::new(&conn);
        store.start_session(StartSessionOptions::default(), "s1".into(), now()).unwrap();
        for i in 0..5 {
            store.checkpoint("s1", &format!("event {i}"), CheckpointOptions::default(), now() + chrono::Duration::seconds(i)).unwrap();
        }

        let events = store.list_events("s1", ListEventsOptions { limit: Some(3), meaningful_only: false }).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].content, "event 2");
        assert_eq!(events[2].content, "event 4");
    }

    #[test]
    fn create_snapshot_normalizes_slug() {
        let conn = setup();
        let store = SessionStore::new(&conn);
        store.start_session(StartSessionOptions::default(), "s1".into(), now()).unwrap();

        let snapshot = store
            .create_snapshot(
                "s1",
                CreateSnapshotOptions { slug: Some("My Snapshot!".into()), source_trigger: "manual".into(), transcript_md: "# hi".into(), message_count: 2 },
                now(),
            )
            .unwrap();
        assert_eq!(snapshot.slug, "my-snapshot");
    }

    #[test]
    fn end_session_returns_none_for_unknown_id() {
        let conn = setup();
        let store = SessionStore::new(&conn);
        let result = store.end_session("nope", EndSessionOptions::default(), now()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn status_reports_counts_and_latest_timestamps() {
        let conn = setup();
        let store = SessionStore::new(&conn);
        store.start_session(StartSessionOptions::default(), "s1".into(), now()).unwrap();
        store.checkpoint("s1", "a", CheckpointOptions::default(), now()).unwrap();
        store
            .create_snapshot("s1", CreateSnapshotOptions { source_trigger: "manual".into(), transcript_md: "x".into(), message_count: 1, ..Default::default() }, now())
            .unwrap();

        let status = store.status("s1").unwrap();
        assert_eq!(status.event_count, 1);
        assert_eq!(status.checkpoint_count, 1);
        assert_eq!(status.snapshot_count, 1);
        assert!(status.latest_event_at.is_some());
    }
}
