//! Shared store service wrapping the local database.
//!
//! Every repository call runs under one async mutex, so multi-step operations
//! (filing a conflict, committing a resolution) execute inside a single
//! `SQLite` transaction without interleaving with other writers.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::SyncConfig;
use crate::db::{
    ChangeLog, ConflictStore, Database, DeviceRegistry, SqliteChangeLog, SqliteConflictStore,
    SqliteDeviceRegistry, SqliteSnapshotRepository,
};
use crate::error::Result;
use crate::models::{
    Change, ChangeId, ChangeState, ConflictId, ConflictRecord, ConflictStats, DeviceInfo,
    EntityKey, Payload, RemoteEntity, Resolution, SyncCursor, Version,
};
use crate::sync::EntitySnapshotProvider;

/// Thread-safe service for change log, conflict and replica operations.
#[derive(Clone)]
pub struct SyncStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
    max_retries: u32,
    device_name: Option<String>,
}

impl SyncStore {
    /// Open a store at the given filesystem path.
    ///
    /// Changes left IN_FLIGHT by a previous process are returned to PENDING.
    pub async fn open_path(db_path: impl Into<PathBuf>, config: &SyncConfig) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::open(&db_path)?;
        let store = Self::from_database(db, Some(db_path), config);
        store.recover_in_flight().await?;
        Ok(store)
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory(config: &SyncConfig) -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self::from_database(db, None, config))
    }

    fn from_database(db: Database, db_path: Option<PathBuf>, config: &SyncConfig) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            db_path,
            max_retries: config.max_retries,
            device_name: config.device_name.clone(),
        }
    }

    /// Filesystem location of the database, if not in memory.
    #[must_use]
    pub fn db_path(&self) -> Option<&PathBuf> {
        self.db_path.as_ref()
    }

    // -- Change log --------------------------------------------------------

    /// Queue a local mutation.
    pub async fn enqueue(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: Payload,
        base_version: Option<Version>,
    ) -> Result<Change> {
        let db = self.db.lock().await;
        let log = self.change_log(&db);
        log.enqueue(entity_type, entity_id, payload, base_version)
    }

    pub async fn get_change(&self, id: &ChangeId) -> Result<Option<Change>> {
        let db = self.db.lock().await;
        self.change_log(&db).get(id)
    }

    pub async fn list_changes(&self, state: Option<ChangeState>) -> Result<Vec<Change>> {
        let db = self.db.lock().await;
        self.change_log(&db).list(state)
    }

    pub async fn claim_pending(&self, limit: usize) -> Result<Vec<Change>> {
        let db = self.db.lock().await;
        self.change_log(&db).claim_pending(limit)
    }

    pub async fn mark_synced(&self, id: &ChangeId) -> Result<()> {
        let db = self.db.lock().await;
        self.change_log(&db).mark_synced(id)
    }

    pub async fn mark_failed(&self, id: &ChangeId, reason: &str) -> Result<ChangeState> {
        let db = self.db.lock().await;
        self.change_log(&db).mark_failed(id, reason)
    }

    pub async fn release(&self, id: &ChangeId) -> Result<()> {
        let db = self.db.lock().await;
        self.change_log(&db).release(id)
    }

    pub async fn rebase(
        &self,
        id: &ChangeId,
        payload: &Payload,
        base_version: &Version,
    ) -> Result<Change> {
        let db = self.db.lock().await;
        self.change_log(&db).rebase(id, payload, base_version)
    }

    pub async fn recover_in_flight(&self) -> Result<usize> {
        let db = self.db.lock().await;
        self.change_log(&db).recover_in_flight()
    }

    /// Return a FAILED change to PENDING with a fresh retry budget.
    pub async fn retry_change(&self, id: &ChangeId) -> Result<Change> {
        let db = self.db.lock().await;
        self.change_log(&db).retry(id)
    }

    /// Drop a PENDING or FAILED change without syncing it.
    pub async fn discard_change(&self, id: &ChangeId) -> Result<Change> {
        let db = self.db.lock().await;
        self.change_log(&db).discard(id)
    }

    pub async fn pending_count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        self.change_log(&db).pending_count()
    }

    pub async fn has_queued(&self, entity_type: &str, entity_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        self.change_log(&db).has_queued(entity_type, entity_id)
    }

    /// Delete SYNCED changes created before `before` (Unix ms).
    pub async fn purge_synced(&self, before: i64) -> Result<usize> {
        let db = self.db.lock().await;
        self.change_log(&db).purge_synced(before)
    }

    // -- Conflicts ---------------------------------------------------------

    /// Persist a conflict and drop the change it consumed, atomically.
    pub async fn file_conflict(&self, conflict: &ConflictRecord) -> Result<()> {
        let db = self.db.lock().await;
        let tx = db.connection().unchecked_transaction()?;
        SqliteConflictStore::new(&tx).save(conflict)?;
        SqliteChangeLog::new(&tx).remove_for_conflict(&conflict.change_id)?;
        tx.commit()?;
        Ok(())
    }

    pub async fn get_conflict(&self, id: &ConflictId) -> Result<Option<ConflictRecord>> {
        let db = self.db.lock().await;
        SqliteConflictStore::new(db.connection()).get(id)
    }

    pub async fn find_unresolved(&self, entity_type: Option<&str>) -> Result<Vec<ConflictRecord>> {
        let db = self.db.lock().await;
        SqliteConflictStore::new(db.connection()).find_unresolved(entity_type)
    }

    pub async fn find_conflicts(&self, entity_type: Option<&str>) -> Result<Vec<ConflictRecord>> {
        let db = self.db.lock().await;
        SqliteConflictStore::new(db.connection()).find_all(entity_type)
    }

    pub async fn count_unresolved(&self) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteConflictStore::new(db.connection()).count_unresolved(None)
    }

    pub async fn has_unresolved(&self, key: &EntityKey) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteConflictStore::new(db.connection()).has_unresolved(key)
    }

    pub async fn conflict_stats(&self) -> Result<ConflictStats> {
        let db = self.db.lock().await;
        SqliteConflictStore::new(db.connection()).stats()
    }

    /// Delete resolved conflicts resolved before `before` (Unix ms).
    pub async fn purge_resolved(&self, before: i64) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteConflictStore::new(db.connection()).purge_resolved(before)
    }

    /// Record a resolution and queue its merged payload, atomically.
    ///
    /// The queued change is based on the conflict's server version.
    pub async fn commit_resolution(
        &self,
        conflict: &ConflictRecord,
        resolution: Resolution,
        merged: &Payload,
        resolved_by: &str,
    ) -> Result<(ConflictRecord, Change)> {
        let db = self.db.lock().await;
        let tx = db.connection().unchecked_transaction()?;

        let resolved =
            SqliteConflictStore::new(&tx).mark_resolved(&conflict.id, resolution, merged, resolved_by)?;
        let change = SqliteChangeLog::new(&tx)
            .with_max_retries(self.max_retries)
            .enqueue_replacement(
                &conflict.entity_type,
                &conflict.entity_id,
                merged.clone(),
                conflict.server_version.clone(),
            )?;
        tx.commit()?;

        Ok((resolved, change))
    }

    // -- Device ------------------------------------------------------------

    /// Identity of this device, registering it on first use.
    pub async fn local_device(&self) -> Result<DeviceInfo> {
        let db = self.db.lock().await;
        self.device_registry(&db).local_device()
    }

    pub async fn cursor(&self) -> Result<Option<SyncCursor>> {
        let db = self.db.lock().await;
        self.device_registry(&db).cursor()
    }

    pub async fn set_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        let db = self.db.lock().await;
        self.device_registry(&db).set_cursor(cursor)
    }

    // -- Replica -----------------------------------------------------------

    /// Last synchronized state of an entity.
    pub async fn snapshot(&self, entity_type: &str, entity_id: &str) -> Result<Option<RemoteEntity>> {
        let db = self.db.lock().await;
        SqliteSnapshotRepository::new(db.connection()).get(entity_type, entity_id)
    }

    pub async fn list_snapshots(&self, entity_type: &str) -> Result<Vec<RemoteEntity>> {
        let db = self.db.lock().await;
        SqliteSnapshotRepository::new(db.connection()).list(entity_type)
    }

    /// What the user currently sees: the synchronized state with every
    /// unsynced change applied in queue order.
    pub async fn local_view(&self, entity_type: &str, entity_id: &str) -> Result<Option<Payload>> {
        let db = self.db.lock().await;
        let snapshot = SqliteSnapshotRepository::new(db.connection()).get(entity_type, entity_id)?;
        let key = EntityKey::new(entity_type, entity_id);
        let queued = self
            .change_log(&db)
            .list(None)?
            .into_iter()
            .filter(|change| change.key() == key && change.state != ChangeState::Synced)
            .collect::<Vec<_>>();

        if snapshot.is_none() && queued.is_empty() {
            return Ok(None);
        }

        let view = queued.iter().fold(
            snapshot.map(|entity| entity.data).unwrap_or_default(),
            |view, change| change.apply_to(&view),
        );
        Ok(Some(view))
    }

    fn change_log<'a>(&self, db: &'a Database) -> SqliteChangeLog<'a> {
        SqliteChangeLog::new(db.connection()).with_max_retries(self.max_retries)
    }

    fn device_registry<'a>(&self, db: &'a Database) -> SqliteDeviceRegistry<'a> {
        SqliteDeviceRegistry::new(db.connection()).with_device_name(self.device_name.clone())
    }
}

impl EntitySnapshotProvider for SyncStore {
    async fn local_snapshot(&self, entity_type: &str, entity_id: &str) -> Result<Option<Payload>> {
        Ok(self
            .snapshot(entity_type, entity_id)
            .await?
            .map(|entity| entity.data))
    }

    async fn apply_remote(&self, entity: &RemoteEntity) -> Result<()> {
        let db = self.db.lock().await;
        SqliteSnapshotRepository::new(db.connection()).upsert(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{payload_from_value, FieldDiff};
    use crate::Error;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        payload_from_value(value).unwrap()
    }

    async fn store() -> SyncStore {
        SyncStore::open_in_memory(&SyncConfig::default()).await.unwrap()
    }

    fn status_conflict(change_id: ChangeId) -> ConflictRecord {
        ConflictRecord::new(
            &EntityKey::new("task", "t1"),
            change_id,
            payload(json!({"status": "done"})),
            payload(json!({"status": "cancelled"})),
            Version::from("2"),
            vec![FieldDiff {
                field: "status".into(),
                local_value: Some(json!("done")),
                server_value: Some(json!("cancelled")),
            }],
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_conflict_consumes_the_change() {
        let store = store().await;
        let change = store
            .enqueue("task", "t1", payload(json!({"status": "done"})), Some(Version::from("1")))
            .await
            .unwrap();
        store.claim_pending(10).await.unwrap();

        store.file_conflict(&status_conflict(change.id)).await.unwrap();

        assert!(store.get_change(&change.id).await.unwrap().is_none());
        assert!(store
            .has_unresolved(&EntityKey::new("task", "t1"))
            .await
            .unwrap());
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_conflict_rolls_back_when_change_is_missing() {
        let store = store().await;
        let result = store.file_conflict(&status_conflict(ChangeId::new())).await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(store.count_unresolved().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn commit_resolution_requeues_merged_payload() {
        let store = store().await;
        let change = store
            .enqueue("task", "t1", payload(json!({"status": "done"})), Some(Version::from("1")))
            .await
            .unwrap();
        store.claim_pending(10).await.unwrap();
        let conflict = status_conflict(change.id);
        store.file_conflict(&conflict).await.unwrap();

        let merged = payload(json!({"status": "done"}));
        let (resolved, requeued) = store
            .commit_resolution(&conflict, Resolution::Local, &merged, "device-a")
            .await
            .unwrap();

        assert_eq!(resolved.resolution, Resolution::Local);
        assert_eq!(resolved.resolved_by.as_deref(), Some("device-a"));
        assert_eq!(requeued.base_version, Some(Version::from("2")));
        assert_eq!(requeued.state, ChangeState::Pending);
        assert_eq!(requeued.payload, merged);
        assert!(requeued.replace);

        // Nothing is queued when the conflict was already resolved
        let again = store
            .commit_resolution(&conflict, Resolution::Server, &merged, "device-a")
            .await;
        assert!(matches!(again, Err(Error::AlreadyResolved(_))));
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_view_overlays_queued_changes() {
        let store = store().await;
        store
            .apply_remote(&RemoteEntity {
                entity_type: "goal".into(),
                entity_id: "g1".into(),
                version: Version::from("1"),
                data: payload(json!({"title": "T", "description": "D"})),
            })
            .await
            .unwrap();
        store
            .enqueue("goal", "g1", payload(json!({"title": "A"})), Some(Version::from("1")))
            .await
            .unwrap();

        let view = store.local_view("goal", "g1").await.unwrap().unwrap();
        assert_eq!(view, payload(json!({"title": "A", "description": "D"})));
        assert!(store.local_view("goal", "missing").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_path_recovers_in_flight_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("keel.db");
        let config = SyncConfig::default();

        {
            let store = SyncStore::open_path(&path, &config).await.unwrap();
            store
                .enqueue("goal", "g1", payload(json!({"title": "A"})), None)
                .await
                .unwrap();
            assert_eq!(store.claim_pending(10).await.unwrap().len(), 1);
        }

        let reopened = SyncStore::open_path(&path, &config).await.unwrap();
        let pending = reopened
            .list_changes(Some(ChangeState::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(reopened.db_path(), Some(&path));
    }
}
