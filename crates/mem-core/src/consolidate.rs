//! Consolidation Engine (C8): group-by-upsert-key, winner selection,
//! supersession, and conflict links (§4.8).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::Result;
use crate::links::write_link;
use crate::model::{LinkType, Memory, MemoryType, derive_upsert_key, normalize_content, normalize_upsert_key};
use crate::store::Store;

#[derive(Debug, Clone, Default)]
pub struct ConsolidateOptions {
    pub project_id: Option<String>,
    pub include_global: bool,
    pub global_only: bool,
    pub types: Vec<MemoryType>,
    pub dry_run: bool,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConsolidateResult {
    pub run_id: Option<i64>,
    pub input_count: usize,
    pub merged_count: usize,
    pub superseded_ids: Vec<String>,
    pub winner_ids: Vec<String>,
    pub conflicted_count: usize,
}

pub struct Consolidator<'a> {
    conn: &'a Connection,
}

impl<'a> Consolidator<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// §4.8 "Consolidate". Idempotent: a second run over the same inputs
    /// finds every group already size 1 (prior losers are `superseded_at
    /// IS NOT NULL` and so excluded from `consolidation_candidates`) and
    /// is a no-op.
    pub fn consolidate(&self, opts: ConsolidateOptions, now: DateTime<Utc>) -> Result<ConsolidateResult> {
        let store = Store::new(self.conn);

        let candidates = store.consolidation_candidates(
            opts.project_id.as_deref(),
            opts.include_global,
            opts.global_only,
            &opts.types,
            now,
        )?;
        let input_count = candidates.len();

        // step 2: derive upsert_key where missing, persisting when not dry_run
        let mut keyed: Vec<(String, Memory)> = Vec::with_capacity(candidates.len());
        for mut m in candidates {
            let key = match &m.upsert_key {
                Some(k) => k.clone(),
                None => {
                    let derived = derive_upsert_key(m.memory_type, m.category.as_deref(), &m.content)
                        .unwrap_or_else(|| normalize_upsert_key(m.memory_type, &m.id));
                    if !opts.dry_run {
                        store.set_upsert_key(&m.id, &derived)?;
                    }
                    m.upsert_key = Some(derived.clone());
                    derived
                }
            };
            keyed.push((key, m));
        }

        // step 3: group by (scope, project_id|'global', type, upsert_key)
        let mut groups: BTreeMap<(String, String, String, String), Vec<Memory>> = BTreeMap::new();
        for (key, m) in keyed {
            let scope_key = m.project_id.clone().unwrap_or_else(|| "global".to_string());
            groups
                .entry((m.scope.as_str().to_string(), scope_key, m.memory_type.as_str().to_string(), key))
                .or_default()
                .push(m);
        }

        let mut merged_count = 0usize;
        let mut superseded_ids = Vec::new();
        let mut winner_ids = Vec::new();
        let mut conflicted_count = 0usize;

        for (_, mut members) in groups {
            if members.len() < 2 {
                continue;
            }
            merged_count += 1;

            // step 4: sort by (updated_at DESC, created_at DESC); winner = head
            members.sort_by(|a, b| {
                b.updated_at.cmp(&a.updated_at).then_with(|| b.created_at.cmp(&a.created_at))
            });
            let winner = members[0].clone();
            winner_ids.push(winner.id.clone());

            if opts.dry_run {
                for loser in &members[1..] {
                    superseded_ids.push(loser.id.clone());
                    if normalize_content(&loser.content) != normalize_content(&winner.content) {
                        conflicted_count += 1;
                    }
                }
                continue;
            }

            let winner_key = winner.upsert_key.clone().unwrap_or_default();
            for loser in &members[1..] {
                store.mark_superseded(&loser.id, &winner.id, now)?;
                store.align_upsert_key(&loser.id, &winner_key)?;
                write_link(self.conn, &loser.id, &winner.id, LinkType::Supersedes, now)?;
                if normalize_content(&loser.content) != normalize_content(&winner.content) {
                    write_link(self.conn, &loser.id, &winner.id, LinkType::Contradicts, now)?;
                    conflicted_count += 1;
                }
                superseded_ids.push(loser.id.clone());
            }
        }

        let run_id = if opts.dry_run {
            None
        } else {
            Some(self.record_run(input_count, merged_count, superseded_ids.len(), conflicted_count, &opts, now)?)
        };

        Ok(ConsolidateResult {
            run_id,
            input_count,
            merged_count,
            superseded_ids,
            winner_ids,
            conflicted_count,
        })
    }

    fn record_run(
        &self,
        input_count: usize,
        merged_count: usize,
        superseded_count: usize,
        conflicted_count: usize,
        opts: &ConsolidateOptions,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO memory_consolidation_runs \
             (input_count, merged_count, superseded_count, conflicted_count, model, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                input_count as i64,
                merged_count as i64,
                superseded_count as i64,
                conflicted_count as i64,
                opts.model,
                Option::<String>::None,
                now.to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::ensure(&conn).unwrap();
        conn
    }

    /// Insert a memory row directly, bypassing `Store::add`'s upsert-by-key
    /// collapse — simulates rows that predate a shared `upsert_key` (e.g.
    /// derived later by consolidation step 2, or written before the
    /// uniqueness invariant was backfilled), which is the realistic input
    /// `Consolidate` is designed to clean up.
    fn insert_raw(conn: &Connection, id: &str, content: &str, upsert_key: &str, created_at: DateTime<Utc>) {
        conn.execute(
            "INSERT INTO memories (id, content, type, memory_layer, scope, project_id, user_id, tags, \
             paths, category, metadata, source_session_id, confidence, last_confirmed_at, upsert_key, \
             superseded_by, superseded_at, created_at, updated_at, deleted_at, expires_at) \
             VALUES (?1, ?2, 'decision', 'long_term', 'global', NULL, NULL, '', '', NULL, NULL, NULL, \
             NULL, NULL, ?3, NULL, NULL, ?4, ?4, NULL, NULL)",
            rusqlite::params![id, content, upsert_key, created_at.to_rfc3339()],
        )
        .unwrap();
    }

    #[test]
    fn consolidate_groups_by_upsert_key_and_supersedes_losers() {
        let conn = setup();
        let store = Store::new(&conn);
        insert_raw(&conn, "older0000001", "Use tabs", "decision:indentation", now());
        let later = now() + Duration::seconds(10);
        insert_raw(&conn, "newer0000001", "Use spaces", "decision:indentation", later);
        let older = store.get_row_by_id_any_state("older0000001").unwrap().unwrap();
        let newer = store.get_row_by_id_any_state("newer0000001").unwrap().unwrap();

        let consolidator = Consolidator::new(&conn);
        let result = consolidator
            .consolidate(ConsolidateOptions { include_global: true, ..Default::default() }, later)
            .unwrap();

        assert_eq!(result.merged_count, 1);
        assert_eq!(result.winner_ids, vec![newer.id.clone()]);
        assert_eq!(result.superseded_ids, vec![older.id.clone()]);
        assert!(result.conflicted_count >= 1);

        let reloaded = store.get_row_by_id_any_state(&older.id).unwrap().unwrap();
        assert_eq!(reloaded.superseded_by.as_deref(), Some(newer.id.as_str()));
    }

    #[test]
    fn consolidate_is_idempotent() {
        let conn = setup();
        insert_raw(&conn, "idem00000001", "A", "decision:x", now());
        insert_raw(&conn, "idem00000002", "B", "decision:x", now() + Duration::seconds(1));

        let consolidator = Consolidator::new(&conn);
        let first = consolidator.consolidate(ConsolidateOptions { include_global: true, ..Default::default() }, now()).unwrap();
        assert_eq!(first.merged_count, 1);

        let second = consolidator.consolidate(ConsolidateOptions { include_global: true, ..Default::default() }, now()).unwrap();
        assert_eq!(second.merged_count, 0);
        assert!(second.superseded_ids.is_empty());
    }

    #[test]
    fn dry_run_does_not_mutate_rows() {
        let conn = setup();
        let store = Store::new(&conn);
        insert_raw(&conn, "dry000000001", "A", "decision:x", now());
        insert_raw(&conn, "dry000000002", "B", "decision:x", now() + Duration::seconds(1));

        let consolidator = Consolidator::new(&conn);
        let result = consolidator
            .consolidate(ConsolidateOptions { include_global: true, dry_run: true, ..Default::default() }, now())
            .unwrap();
        assert_eq!(result.merged_count, 1);
        assert!(result.run_id.is_none());

        let reloaded = store.get_row_by_id_any_state("dry000000001").unwrap().unwrap();
        assert!(reloaded.superseded_by.is_none());
    }
}
