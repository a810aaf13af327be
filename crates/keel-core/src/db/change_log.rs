//! Change log repository
//!
//! Append-only queue of local mutations. A change moves
//! `pending -> in_flight -> synced`, or back to `pending` on a retryable
//! failure, or to `failed` once its retries are exhausted. Changes converted
//! into a conflict leave the log entirely.

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::{params, Connection, OptionalExtension};

use super::columns::{json_column, parsed_column, to_json_text};
use crate::error::{Error, Result};
use crate::models::{Change, ChangeId, ChangeState, Payload, Version};
use crate::util::{compact_text, unix_millis_now};

const DEFAULT_MAX_RETRIES: u32 = 5;

const CHANGE_COLUMNS: &str = "seq, id, entity_type, entity_id, payload, base_version, created_at, state, retry_count, last_error, replace_fields";

/// Trait for change log operations
pub trait ChangeLog {
    /// Append a PENDING change. Fails with `Validation` on an empty entity id.
    fn enqueue(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: Payload,
        base_version: Option<Version>,
    ) -> Result<Change>;

    /// Append a PENDING change whose payload replaces the whole entity, so
    /// fields missing from it are removed when it is applied.
    fn enqueue_replacement(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: Payload,
        base_version: Version,
    ) -> Result<Change>;

    /// Get a change by ID
    fn get(&self, id: &ChangeId) -> Result<Option<Change>>;

    /// List changes in insertion order, optionally filtered by state
    fn list(&self, state: Option<ChangeState>) -> Result<Vec<Change>>;

    /// Atomically move up to `limit` PENDING changes to IN_FLIGHT.
    ///
    /// Takes at most the oldest pending change per entity and skips entities
    /// that already have an IN_FLIGHT change.
    fn claim_pending(&self, limit: usize) -> Result<Vec<Change>>;

    /// IN_FLIGHT -> SYNCED
    fn mark_synced(&self, id: &ChangeId) -> Result<()>;

    /// IN_FLIGHT -> PENDING with one more retry, or -> FAILED once the retry
    /// threshold is reached (reported as `RetryExhausted`).
    fn mark_failed(&self, id: &ChangeId, reason: &str) -> Result<ChangeState>;

    /// IN_FLIGHT -> PENDING without consuming a retry
    fn release(&self, id: &ChangeId) -> Result<()>;

    /// Replace payload and base version of an IN_FLIGHT change and return it
    /// to PENDING
    fn rebase(&self, id: &ChangeId, payload: &Payload, base_version: &Version) -> Result<Change>;

    /// Remove a change that has been converted into a conflict
    fn remove_for_conflict(&self, id: &ChangeId) -> Result<Change>;

    /// Reset every IN_FLIGHT change to PENDING (crash recovery)
    fn recover_in_flight(&self) -> Result<usize>;

    /// FAILED -> PENDING with a fresh retry budget
    fn retry(&self, id: &ChangeId) -> Result<Change>;

    /// Delete a PENDING or FAILED change
    fn discard(&self, id: &ChangeId) -> Result<Change>;

    /// Number of changes in PENDING or FAILED
    fn pending_count(&self) -> Result<usize>;

    /// Whether the entity has a PENDING or IN_FLIGHT change
    fn has_queued(&self, entity_type: &str, entity_id: &str) -> Result<bool>;

    /// Delete SYNCED changes created before `before` (Unix ms)
    fn purge_synced(&self, before: i64) -> Result<usize>;
}

/// `SQLite` implementation of `ChangeLog`
pub struct SqliteChangeLog<'a> {
    conn: &'a Connection,
    max_retries: u32,
}

impl<'a> SqliteChangeLog<'a> {
    /// Create a new change log with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Set the retry threshold used by `mark_failed`
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Parse a change from a database row
    fn parse_change(row: &rusqlite::Row<'_>) -> rusqlite::Result<Change> {
        Ok(Change {
            sequence: row.get(0)?,
            id: parsed_column(row, 1)?,
            entity_type: row.get(2)?,
            entity_id: row.get(3)?,
            payload: json_column(row, 4)?,
            base_version: row.get::<_, Option<String>>(5)?.map(Version::new),
            created_at: row.get(6)?,
            state: parsed_column(row, 7)?,
            retry_count: row.get(8)?,
            last_error: row.get(9)?,
            replace: row.get(10)?,
        })
    }

    fn require(&self, id: &ChangeId) -> Result<Change> {
        self.get(id)?
            .ok_or_else(|| Error::NotFound(format!("change {id}")))
    }

    fn require_state(change: &Change, expected: &[ChangeState]) -> Result<()> {
        if expected.contains(&change.state) {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "change {} is {}, expected {}",
                change.id,
                change.state,
                expected
                    .iter()
                    .map(|state| state.as_str())
                    .collect::<Vec<_>>()
                    .join(" or ")
            )))
        }
    }

    /// Transition a change between states, failing if it is not in `from`
    fn transition(&self, id: &ChangeId, from: ChangeState, to: ChangeState) -> Result<()> {
        let now = unix_millis_now();
        let rows = self.conn.execute(
            "UPDATE changes SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state = ?4",
            params![to.as_str(), now, id.as_str(), from.as_str()],
        )?;

        if rows == 0 {
            let change = self.require(id)?;
            Self::require_state(&change, &[from])?;
        }
        Ok(())
    }

    fn insert(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: &Payload,
        base_version: Option<&Version>,
        replace: bool,
    ) -> Result<Change> {
        let entity_type = entity_type.trim();
        let entity_id = entity_id.trim();
        if entity_id.is_empty() {
            return Err(Error::Validation("entity id cannot be empty".into()));
        }
        if entity_type.is_empty() {
            return Err(Error::Validation("entity type cannot be empty".into()));
        }

        let id = ChangeId::new();
        let now = unix_millis_now();
        self.conn.execute(
            "INSERT INTO changes (id, entity_type, entity_id, payload, base_version, created_at, updated_at, state, replace_fields)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?8)",
            params![
                id.as_str(),
                entity_type,
                entity_id,
                to_json_text(payload)?,
                base_version.map(Version::as_str),
                now,
                ChangeState::Pending.as_str(),
                replace
            ],
        )?;

        tracing::debug!("Enqueued change {id} for {entity_type}/{entity_id}");
        self.require(&id)
    }
}

impl ChangeLog for SqliteChangeLog<'_> {
    fn enqueue(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: Payload,
        base_version: Option<Version>,
    ) -> Result<Change> {
        self.insert(entity_type, entity_id, &payload, base_version.as_ref(), false)
    }

    fn enqueue_replacement(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: Payload,
        base_version: Version,
    ) -> Result<Change> {
        self.insert(entity_type, entity_id, &payload, Some(&base_version), true)
    }

    fn get(&self, id: &ChangeId) -> Result<Option<Change>> {
        let change = self
            .conn
            .query_row(
                &format!("SELECT {CHANGE_COLUMNS} FROM changes WHERE id = ?1"),
                params![id.as_str()],
                Self::parse_change,
            )
            .optional()?;
        Ok(change)
    }

    fn list(&self, state: Option<ChangeState>) -> Result<Vec<Change>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHANGE_COLUMNS} FROM changes
             WHERE ?1 IS NULL OR state = ?1
             ORDER BY seq ASC"
        ))?;

        let changes = stmt
            .query_map(params![state.map(ChangeState::as_str)], Self::parse_change)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(changes)
    }

    fn claim_pending(&self, limit: usize) -> Result<Vec<Change>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let tx = self.conn.unchecked_transaction()?;
        let candidates = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {CHANGE_COLUMNS} FROM changes c
                 WHERE c.state = 'pending'
                   AND NOT EXISTS (
                       SELECT 1 FROM changes f
                       WHERE f.entity_type = c.entity_type
                         AND f.entity_id = c.entity_id
                         AND f.state = 'in_flight'
                   )
                   AND c.seq = (
                       SELECT MIN(p.seq) FROM changes p
                       WHERE p.entity_type = c.entity_type
                         AND p.entity_id = c.entity_id
                         AND p.state = 'pending'
                   )
                 ORDER BY c.seq ASC
                 LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(params![limit as i64], Self::parse_change)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let now = unix_millis_now();
        let mut claimed = Vec::with_capacity(candidates.len());
        for mut change in candidates {
            let rows = tx.execute(
                "UPDATE changes SET state = 'in_flight', updated_at = ?1
                 WHERE seq = ?2 AND state = 'pending'",
                params![now, change.sequence],
            )?;
            if rows == 1 {
                change.state = ChangeState::InFlight;
                claimed.push(change);
            }
        }
        tx.commit()?;

        if !claimed.is_empty() {
            tracing::debug!("Claimed {} pending change(s)", claimed.len());
        }
        Ok(claimed)
    }

    fn mark_synced(&self, id: &ChangeId) -> Result<()> {
        self.transition(id, ChangeState::InFlight, ChangeState::Synced)?;
        self.conn.execute(
            "UPDATE changes SET last_error = NULL WHERE id = ?1",
            params![id.as_str()],
        )?;
        tracing::debug!("Change {id} synced");
        Ok(())
    }

    fn mark_failed(&self, id: &ChangeId, reason: &str) -> Result<ChangeState> {
        let change = self.require(id)?;
        Self::require_state(&change, &[ChangeState::InFlight])?;

        let attempts = change.retry_count.saturating_add(1);
        let next = if attempts >= self.max_retries {
            ChangeState::Failed
        } else {
            ChangeState::Pending
        };

        let reason = compact_text(reason);
        let now = unix_millis_now();
        self.conn.execute(
            "UPDATE changes SET state = ?1, retry_count = ?2, last_error = ?3, updated_at = ?4
             WHERE id = ?5",
            params![next.as_str(), attempts, reason, now, id.as_str()],
        )?;

        if next == ChangeState::Failed {
            tracing::warn!("Change {id} failed permanently after {attempts} attempts: {reason}");
            return Err(Error::RetryExhausted {
                change_id: id.to_string(),
                attempts,
            });
        }

        tracing::debug!("Change {id} failed (attempt {attempts}), returned to pending: {reason}");
        Ok(next)
    }

    fn release(&self, id: &ChangeId) -> Result<()> {
        self.transition(id, ChangeState::InFlight, ChangeState::Pending)
    }

    fn rebase(&self, id: &ChangeId, payload: &Payload, base_version: &Version) -> Result<Change> {
        let now = unix_millis_now();
        let rows = self.conn.execute(
            "UPDATE changes SET payload = ?1, base_version = ?2, state = 'pending', updated_at = ?3
             WHERE id = ?4 AND state = 'in_flight'",
            params![to_json_text(payload)?, base_version.as_str(), now, id.as_str()],
        )?;

        let change = self.require(id)?;
        if rows == 0 {
            Self::require_state(&change, &[ChangeState::InFlight])?;
        }
        tracing::debug!("Rebased change {id} onto version {base_version}");
        Ok(change)
    }

    fn remove_for_conflict(&self, id: &ChangeId) -> Result<Change> {
        let change = self.require(id)?;
        self.conn
            .execute("DELETE FROM changes WHERE id = ?1", params![id.as_str()])?;
        tracing::debug!("Removed change {id} into a conflict");
        Ok(change)
    }

    fn recover_in_flight(&self) -> Result<usize> {
        let now = unix_millis_now();
        let rows = self.conn.execute(
            "UPDATE changes SET state = 'pending', updated_at = ?1 WHERE state = 'in_flight'",
            params![now],
        )?;
        if rows > 0 {
            tracing::info!("Recovered {rows} in-flight change(s) as pending");
        }
        Ok(rows)
    }

    fn retry(&self, id: &ChangeId) -> Result<Change> {
        let now = unix_millis_now();
        let rows = self.conn.execute(
            "UPDATE changes SET state = 'pending', retry_count = 0, updated_at = ?1
             WHERE id = ?2 AND state = 'failed'",
            params![now, id.as_str()],
        )?;

        let change = self.require(id)?;
        if rows == 0 {
            Self::require_state(&change, &[ChangeState::Failed])?;
        }
        Ok(change)
    }

    fn discard(&self, id: &ChangeId) -> Result<Change> {
        let change = self.require(id)?;
        Self::require_state(&change, &[ChangeState::Pending, ChangeState::Failed])?;
        self.conn
            .execute("DELETE FROM changes WHERE id = ?1", params![id.as_str()])?;
        tracing::info!("Discarded change {id} for {}", change.key());
        Ok(change)
    }

    fn pending_count(&self) -> Result<usize> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM changes WHERE state IN ('pending', 'failed')",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn has_queued(&self, entity_type: &str, entity_id: &str) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM changes
                WHERE entity_type = ?1 AND entity_id = ?2 AND state IN ('pending', 'in_flight')
            )",
            params![entity_type, entity_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn purge_synced(&self, before: i64) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM changes WHERE state = 'synced' AND created_at < ?1",
            params![before],
        )?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn payload(value: serde_json::Value) -> Payload {
        crate::models::payload_from_value(value).unwrap()
    }

    #[test]
    fn test_enqueue_and_get() {
        let db = setup();
        let log = SqliteChangeLog::new(db.connection());

        let change = log
            .enqueue("goal", "g1", payload(json!({"title": "A"})), Some("1".into()))
            .unwrap();
        assert_eq!(change.state, ChangeState::Pending);
        assert_eq!(change.retry_count, 0);

        let fetched = log.get(&change.id).unwrap().unwrap();
        assert_eq!(fetched, change);
        assert_eq!(fetched.base_version, Some(Version::from("1")));
    }

    #[test]
    fn test_replacement_flag_survives_claim_and_rebase() {
        let db = setup();
        let log = SqliteChangeLog::new(db.connection());

        let plain = log.enqueue("task", "t1", payload(json!({"n": 1})), None).unwrap();
        assert!(!plain.replace);

        let change = log
            .enqueue_replacement("task", "t2", payload(json!({"status": "done"})), "2".into())
            .unwrap();
        assert!(change.replace);
        assert_eq!(change.base_version, Some(Version::from("2")));

        let claimed = log.claim_pending(10).unwrap();
        assert!(claimed.iter().any(|claimed| claimed.id == change.id && claimed.replace));

        let rebased = log
            .rebase(&change.id, &payload(json!({"status": "done", "n": 2})), &"3".into())
            .unwrap();
        assert!(rebased.replace);
    }

    #[test]
    fn test_enqueue_rejects_empty_entity_id() {
        let db = setup();
        let log = SqliteChangeLog::new(db.connection());

        let error = log.enqueue("goal", "  ", Payload::new(), None).unwrap_err();
        assert!(matches!(error, Error::Validation(_)));
        assert_eq!(log.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_claim_takes_one_change_per_entity_in_order() {
        let db = setup();
        let log = SqliteChangeLog::new(db.connection());

        let first = log.enqueue("task", "t1", payload(json!({"n": 1})), None).unwrap();
        let second = log.enqueue("task", "t1", payload(json!({"n": 2})), None).unwrap();
        let other = log.enqueue("task", "t2", payload(json!({"n": 3})), None).unwrap();

        let claimed = log.claim_pending(10).unwrap();
        let ids = claimed.iter().map(|change| change.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![first.id, other.id]);
        assert!(claimed.iter().all(|change| change.state == ChangeState::InFlight));

        // t1 still has an in-flight change, so its second change waits
        assert!(log.claim_pending(10).unwrap().is_empty());

        log.mark_synced(&first.id).unwrap();
        let claimed = log.claim_pending(10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, second.id);
    }

    #[test]
    fn test_claim_respects_limit() {
        let db = setup();
        let log = SqliteChangeLog::new(db.connection());
        for index in 0..5 {
            log.enqueue("task", &format!("t{index}"), Payload::new(), None)
                .unwrap();
        }

        assert_eq!(log.claim_pending(2).unwrap().len(), 2);
        assert_eq!(log.claim_pending(0).unwrap().len(), 0);
        assert_eq!(log.claim_pending(10).unwrap().len(), 3);
    }

    #[test]
    fn test_mark_failed_retries_then_exhausts() {
        let db = setup();
        let log = SqliteChangeLog::new(db.connection()).with_max_retries(2);
        let change = log.enqueue("task", "t1", Payload::new(), None).unwrap();

        log.claim_pending(1).unwrap();
        let state = log.mark_failed(&change.id, "timeout").unwrap();
        assert_eq!(state, ChangeState::Pending);
        assert_eq!(log.get(&change.id).unwrap().unwrap().retry_count, 1);

        log.claim_pending(1).unwrap();
        let error = log.mark_failed(&change.id, "timeout").unwrap_err();
        assert!(matches!(error, Error::RetryExhausted { attempts: 2, .. }));

        let failed = log.get(&change.id).unwrap().unwrap();
        assert_eq!(failed.state, ChangeState::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("timeout"));

        // Permanently failed changes are not claimed again but still count as pending work
        assert!(log.claim_pending(10).unwrap().is_empty());
        assert_eq!(log.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_failed_change_does_not_block_newer_changes() {
        let db = setup();
        let log = SqliteChangeLog::new(db.connection()).with_max_retries(1);
        let stuck = log.enqueue("task", "t1", Payload::new(), None).unwrap();
        log.claim_pending(1).unwrap();
        log.mark_failed(&stuck.id, "rejected").unwrap_err();

        let newer = log.enqueue("task", "t1", Payload::new(), None).unwrap();
        let claimed = log.claim_pending(10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, newer.id);
    }

    #[test]
    fn test_retry_and_discard_failed_change() {
        let db = setup();
        let log = SqliteChangeLog::new(db.connection()).with_max_retries(1);
        let change = log.enqueue("task", "t1", Payload::new(), None).unwrap();
        log.claim_pending(1).unwrap();
        log.mark_failed(&change.id, "rejected").unwrap_err();

        let retried = log.retry(&change.id).unwrap();
        assert_eq!(retried.state, ChangeState::Pending);
        assert_eq!(retried.retry_count, 0);

        // retry only applies to failed changes
        assert!(matches!(log.retry(&change.id), Err(Error::Validation(_))));

        log.discard(&change.id).unwrap();
        assert!(log.get(&change.id).unwrap().is_none());
    }

    #[test]
    fn test_discard_refuses_in_flight_change() {
        let db = setup();
        let log = SqliteChangeLog::new(db.connection());
        let change = log.enqueue("task", "t1", Payload::new(), None).unwrap();
        log.claim_pending(1).unwrap();

        assert!(matches!(log.discard(&change.id), Err(Error::Validation(_))));
    }

    #[test]
    fn test_rebase_returns_change_to_pending() {
        let db = setup();
        let log = SqliteChangeLog::new(db.connection());
        let change = log
            .enqueue("goal", "g1", payload(json!({"title": "A"})), Some("1".into()))
            .unwrap();
        log.claim_pending(1).unwrap();

        let merged = payload(json!({"title": "A", "description": "B"}));
        let rebased = log.rebase(&change.id, &merged, &Version::from("2")).unwrap();
        assert_eq!(rebased.state, ChangeState::Pending);
        assert_eq!(rebased.base_version, Some(Version::from("2")));
        assert_eq!(rebased.payload, merged);
        assert_eq!(rebased.retry_count, 0);
    }

    #[test]
    fn test_remove_for_conflict() {
        let db = setup();
        let log = SqliteChangeLog::new(db.connection());
        let change = log.enqueue("task", "t1", Payload::new(), None).unwrap();

        let removed = log.remove_for_conflict(&change.id).unwrap();
        assert_eq!(removed.id, change.id);
        assert!(matches!(
            log.remove_for_conflict(&change.id),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_recover_in_flight() {
        let db = setup();
        let log = SqliteChangeLog::new(db.connection());
        log.enqueue("task", "t1", Payload::new(), None).unwrap();
        log.enqueue("task", "t2", Payload::new(), None).unwrap();
        log.claim_pending(10).unwrap();

        assert_eq!(log.recover_in_flight().unwrap(), 2);
        assert_eq!(log.list(Some(ChangeState::Pending)).unwrap().len(), 2);
    }

    #[test]
    fn test_transitions_require_in_flight() {
        let db = setup();
        let log = SqliteChangeLog::new(db.connection());
        let change = log.enqueue("task", "t1", Payload::new(), None).unwrap();

        assert!(matches!(log.mark_synced(&change.id), Err(Error::Validation(_))));
        assert!(matches!(
            log.mark_failed(&change.id, "x"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            log.mark_synced(&ChangeId::new()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_has_queued_and_purge() {
        let db = setup();
        let log = SqliteChangeLog::new(db.connection());
        let change = log.enqueue("task", "t1", Payload::new(), None).unwrap();
        assert!(log.has_queued("task", "t1").unwrap());
        assert!(!log.has_queued("task", "t2").unwrap());

        log.claim_pending(1).unwrap();
        log.mark_synced(&change.id).unwrap();
        assert!(!log.has_queued("task", "t1").unwrap());
        assert_eq!(log.pending_count().unwrap(), 0);

        assert_eq!(log.purge_synced(i64::MAX).unwrap(), 1);
        assert!(log.list(None).unwrap().is_empty());
    }
}
