//! `MemoryLink` read path (SPEC_FULL.md "Supplemented features").
//!
//! §3 defines `memory_links` and §4.8 (Consolidation) writes `supersedes`/
//! `contradicts` rows into it, but no spec operation reads the chain back.
//! `supersession_chain` follows `superseded_by` from a given memory to its
//! current winner, bounded by the total row count (§9 "Cyclic consolidation
//! links" — a flat table, no graph pointer soup, so a cycle can only loop
//! through memories we've already visited).

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::Result;
use crate::model::{LinkType, Memory};
use crate::store::Store;

/// Follow `superseded_by` from `memory_id` to the current winner.
///
/// Returns the chain in visitation order: `[start, ..., winner]` (or just
/// `[start]` if it was never superseded, or `[]` if `memory_id` doesn't
/// exist). Used internally by `edit_memory` (§4.11 per-request routing)
/// when the caller targets an id that has since been superseded.
pub fn supersession_chain(conn: &Connection, memory_id: &str) -> Result<Vec<Memory>> {
    let store = Store::new(conn);
    let mut chain = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut current = memory_id.to_string();

    loop {
        if !seen.insert(current.clone()) {
            break; // cycle guard: a flat table can't legitimately cycle, but never trust it blindly
        }
        let Some(row) = store.get_row_by_id_any_state(&current)? else {
            break;
        };
        let next = row.superseded_by.clone();
        chain.push(row);
        match next {
            Some(n) => current = n,
            None => break,
        }
        if chain.len() > MAX_CHAIN_LEN {
            break;
        }
    }

    Ok(chain)
}

/// Resolve `memory_id` to the current, non-superseded winner at the end of
/// its supersession chain (or itself, if it was never superseded).
pub fn resolve_winner(conn: &Connection, memory_id: &str) -> Result<Option<Memory>> {
    Ok(supersession_chain(conn, memory_id)?.into_iter().last())
}

/// Bound on chain length so a corrupted table can't spin forever: the
/// `seen` set already prevents infinite loops, this is a defense against
/// a pathologically long (but acyclic) chain.
const MAX_CHAIN_LEN: usize = 100_000;

/// Insert a `memory_links` row, ignoring the insert if the
/// `(source_id, target_id, link_type)` triple already exists (§3 unique
/// constraint; consolidation re-runs are idempotent, §4.8 step 6).
pub fn write_link(
    conn: &Connection,
    source_id: &str,
    target_id: &str,
    link_type: LinkType,
    created_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO memory_links (source_id, target_id, link_type, created_at) \
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![source_id, target_id, link_type.as_str(), created_at.to_rfc3339()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use crate::store::AddOptions;
    use chrono::{TimeZone, Utc};

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn chain_of_one_for_unsuperseded_memory() {
        let conn = Connection::open_in_memory().unwrap();
        schema::ensure(&conn).unwrap();
        let store = Store::new(&conn);
        let (mem, _) = store.add("hello", AddOptions::default(), 24.0, now()).unwrap();

        let chain = supersession_chain(&conn, &mem.id).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].id, mem.id);
    }

    #[test]
    fn chain_follows_superseded_by_to_winner() {
        let conn = Connection::open_in_memory().unwrap();
        schema::ensure(&conn).unwrap();
        let store = Store::new(&conn);
        let (loser, _) = store.add("loser", AddOptions::default(), 24.0, now()).unwrap();
        let (winner, _) = store.add("winner", AddOptions::default(), 24.0, now()).unwrap();
        store.mark_superseded(&loser.id, &winner.id, now()).unwrap();

        let chain = supersession_chain(&conn, &loser.id).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].id, loser.id);
        assert_eq!(chain[1].id, winner.id);

        let resolved = resolve_winner(&conn, &loser.id).unwrap().unwrap();
        assert_eq!(resolved.id, winner.id);
    }

    #[test]
    fn missing_memory_yields_empty_chain() {
        let conn = Connection::open_in_memory().unwrap();
        schema::ensure(&conn).unwrap();
        assert!(supersession_chain(&conn, "nonexistent1").unwrap().is_empty());
    }
}
