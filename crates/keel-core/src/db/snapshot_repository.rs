//! Local replica of last-synchronized entity state

use rusqlite::{params, Connection, OptionalExtension};

use super::columns::{json_column, to_json_text};
use crate::error::Result;
use crate::models::{RemoteEntity, Version};
use crate::util::unix_millis_now;

/// `SQLite` storage for entity snapshots
pub struct SqliteSnapshotRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSnapshotRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<RemoteEntity> {
        Ok(RemoteEntity {
            entity_type: row.get(0)?,
            entity_id: row.get(1)?,
            version: Version::new(row.get::<_, String>(2)?),
            data: json_column(row, 3)?,
        })
    }

    /// Get the stored snapshot of an entity
    pub fn get(&self, entity_type: &str, entity_id: &str) -> Result<Option<RemoteEntity>> {
        let entity = self
            .conn
            .query_row(
                "SELECT entity_type, entity_id, version, data FROM entity_snapshots
                 WHERE entity_type = ?1 AND entity_id = ?2",
                params![entity_type, entity_id],
                Self::parse_entity,
            )
            .optional()?;
        Ok(entity)
    }

    /// Insert or replace the snapshot of an entity
    pub fn upsert(&self, entity: &RemoteEntity) -> Result<()> {
        let now = unix_millis_now();
        self.conn.execute(
            "INSERT INTO entity_snapshots (entity_type, entity_id, version, data, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(entity_type, entity_id)
             DO UPDATE SET version = excluded.version, data = excluded.data, updated_at = excluded.updated_at",
            params![
                entity.entity_type,
                entity.entity_id,
                entity.version.as_str(),
                to_json_text(&entity.data)?,
                now
            ],
        )?;
        Ok(())
    }

    /// List snapshots of one entity type
    pub fn list(&self, entity_type: &str) -> Result<Vec<RemoteEntity>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_type, entity_id, version, data FROM entity_snapshots
             WHERE entity_type = ?1
             ORDER BY entity_id ASC",
        )?;
        let entities = stmt
            .query_map(params![entity_type], Self::parse_entity)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::payload_from_value;
    use serde_json::json;

    #[test]
    fn test_upsert_replaces_snapshot() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteSnapshotRepository::new(db.connection());

        let mut entity = RemoteEntity {
            entity_type: "goal".into(),
            entity_id: "g1".into(),
            version: Version::from("1"),
            data: payload_from_value(json!({"title": "old"})).unwrap(),
        };
        repo.upsert(&entity).unwrap();

        entity.version = Version::from("2");
        entity.data = payload_from_value(json!({"title": "new"})).unwrap();
        repo.upsert(&entity).unwrap();

        assert_eq!(repo.get("goal", "g1").unwrap(), Some(entity));
        assert!(repo.get("goal", "missing").unwrap().is_none());
        assert_eq!(repo.list("goal").unwrap().len(), 1);
    }
}
