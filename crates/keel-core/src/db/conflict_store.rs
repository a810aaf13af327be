//! Conflict store repository

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension};

use super::columns::{json_column, optional_json_column, parsed_column, to_json_text};
use crate::error::{Error, Result};
use crate::models::{
    ConflictId, ConflictRecord, ConflictStats, EntityKey, Payload, Resolution, Version,
};
use crate::util::unix_millis_now;

const CONFLICT_COLUMNS: &str = "id, entity_type, entity_id, change_id, local_data, server_data, server_version, conflicting_fields, resolution, resolved_data, resolved_at, resolved_by, created_at";

/// Trait for conflict storage operations
pub trait ConflictStore {
    /// Persist a new conflict record
    fn save(&self, conflict: &ConflictRecord) -> Result<()>;

    /// Get a conflict by ID, resolved or not
    fn get(&self, id: &ConflictId) -> Result<Option<ConflictRecord>>;

    /// Unresolved conflicts, oldest first
    fn find_unresolved(&self, entity_type: Option<&str>) -> Result<Vec<ConflictRecord>>;

    /// Every conflict including resolved history, oldest first
    fn find_all(&self, entity_type: Option<&str>) -> Result<Vec<ConflictRecord>>;

    fn count_unresolved(&self, entity_type: Option<&str>) -> Result<usize>;

    /// Whether the entity has an unresolved conflict
    fn has_unresolved(&self, key: &EntityKey) -> Result<bool>;

    /// Set the resolution of an unresolved conflict.
    ///
    /// Fails with `AlreadyResolved` if another caller resolved it first.
    fn mark_resolved(
        &self,
        id: &ConflictId,
        resolution: Resolution,
        resolved_data: &Payload,
        resolved_by: &str,
    ) -> Result<ConflictRecord>;

    /// Totals and breakdowns across all records
    fn stats(&self) -> Result<ConflictStats>;

    /// Delete resolved conflicts resolved before `before` (Unix ms)
    fn purge_resolved(&self, before: i64) -> Result<usize>;
}

/// `SQLite` implementation of `ConflictStore`
pub struct SqliteConflictStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteConflictStore<'a> {
    /// Create a new store with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a conflict from a database row
    fn parse_conflict(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConflictRecord> {
        Ok(ConflictRecord {
            id: parsed_column(row, 0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            change_id: parsed_column(row, 3)?,
            local_data: json_column(row, 4)?,
            server_data: json_column(row, 5)?,
            server_version: Version::new(row.get::<_, String>(6)?),
            conflicting_fields: json_column(row, 7)?,
            resolution: parsed_column(row, 8)?,
            resolved_data: optional_json_column(row, 9)?,
            resolved_at: row.get(10)?,
            resolved_by: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn query(&self, unresolved_only: bool, entity_type: Option<&str>) -> Result<Vec<ConflictRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts
             WHERE (?1 = 0 OR resolution = 'none')
               AND (?2 IS NULL OR entity_type = ?2)
             ORDER BY created_at ASC, id ASC"
        ))?;

        let conflicts = stmt
            .query_map(params![unresolved_only, entity_type], Self::parse_conflict)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }
}

impl ConflictStore for SqliteConflictStore<'_> {
    fn save(&self, conflict: &ConflictRecord) -> Result<()> {
        if conflict.is_resolved() != conflict.resolved_data.is_some() {
            return Err(Error::Validation(format!(
                "conflict {} must carry resolved data exactly when resolved",
                conflict.id
            )));
        }
        if conflict.conflicting_fields.is_empty() {
            return Err(Error::Validation(format!(
                "conflict {} has no disputed fields",
                conflict.id
            )));
        }

        self.conn.execute(
            &format!(
                "INSERT INTO conflicts ({CONFLICT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                conflict.id.as_str(),
                conflict.entity_type,
                conflict.entity_id,
                conflict.change_id.as_str(),
                to_json_text(&conflict.local_data)?,
                to_json_text(&conflict.server_data)?,
                conflict.server_version.as_str(),
                to_json_text(&conflict.conflicting_fields)?,
                conflict.resolution.as_str(),
                conflict
                    .resolved_data
                    .as_ref()
                    .map(to_json_text)
                    .transpose()?,
                conflict.resolved_at,
                conflict.resolved_by,
                conflict.created_at,
            ],
        )?;

        tracing::info!(
            "Recorded conflict {} for {}/{} on fields [{}]",
            conflict.id,
            conflict.entity_type,
            conflict.entity_id,
            conflict.field_names().join(", ")
        );
        Ok(())
    }

    fn get(&self, id: &ConflictId) -> Result<Option<ConflictRecord>> {
        let conflict = self
            .conn
            .query_row(
                &format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id = ?1"),
                params![id.as_str()],
                Self::parse_conflict,
            )
            .optional()?;
        Ok(conflict)
    }

    fn find_unresolved(&self, entity_type: Option<&str>) -> Result<Vec<ConflictRecord>> {
        self.query(true, entity_type)
    }

    fn find_all(&self, entity_type: Option<&str>) -> Result<Vec<ConflictRecord>> {
        self.query(false, entity_type)
    }

    fn count_unresolved(&self, entity_type: Option<&str>) -> Result<usize> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM conflicts
             WHERE resolution = 'none' AND (?1 IS NULL OR entity_type = ?1)",
            params![entity_type],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn has_unresolved(&self, key: &EntityKey) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM conflicts
                WHERE entity_type = ?1 AND entity_id = ?2 AND resolution = 'none'
            )",
            params![key.entity_type, key.entity_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn mark_resolved(
        &self,
        id: &ConflictId,
        resolution: Resolution,
        resolved_data: &Payload,
        resolved_by: &str,
    ) -> Result<ConflictRecord> {
        if resolution == Resolution::None {
            return Err(Error::Validation(
                "a conflict cannot be resolved with resolution 'none'".into(),
            ));
        }

        let now = unix_millis_now();
        let rows = self.conn.execute(
            "UPDATE conflicts
             SET resolution = ?1, resolved_data = ?2, resolved_at = ?3, resolved_by = ?4
             WHERE id = ?5 AND resolution = 'none'",
            params![
                resolution.as_str(),
                to_json_text(resolved_data)?,
                now,
                resolved_by,
                id.as_str()
            ],
        )?;

        let conflict = self
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("conflict {id}")))?;
        if rows == 0 {
            return Err(Error::AlreadyResolved(id.to_string()));
        }

        tracing::info!("Resolved conflict {id} with strategy {resolution}");
        Ok(conflict)
    }

    fn stats(&self) -> Result<ConflictStats> {
        let mut stmt = self
            .conn
            .prepare("SELECT entity_type, resolution, created_at, resolved_at FROM conflicts")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stats = ConflictStats::default();
        let mut by_entity_type = BTreeMap::new();
        let mut by_resolution = BTreeMap::new();
        let mut resolution_time_total: i64 = 0;

        for (entity_type, resolution, created_at, resolved_at) in rows {
            stats.total += 1;
            *by_entity_type.entry(entity_type).or_insert(0) += 1;
            if resolution == Resolution::None.as_str() {
                stats.unresolved += 1;
            } else {
                stats.resolved += 1;
                if let Some(resolved_at) = resolved_at {
                    resolution_time_total += resolved_at.saturating_sub(created_at).max(0);
                }
            }
            *by_resolution.entry(resolution).or_insert(0) += 1;
        }

        stats.by_entity_type = by_entity_type;
        stats.by_resolution = by_resolution;
        stats.average_resolution_ms = i64::try_from(stats.resolved)
            .ok()
            .filter(|resolved| *resolved > 0)
            .map(|resolved| resolution_time_total / resolved);
        Ok(stats)
    }

    fn purge_resolved(&self, before: i64) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM conflicts WHERE resolution <> 'none' AND resolved_at < ?1",
            params![before],
        )?;
        Ok(rows)
    }
}
