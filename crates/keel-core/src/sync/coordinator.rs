//! Sync coordinator.
//!
//! Drives cycles of push, reconcile and pull against a remote authority,
//! tracks connectivity and exposes conflict resolution to clients. At most
//! one cycle runs at a time; entity-level work is serialized through
//! [`EntityLocks`].

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::detector::{ConflictDetector, Detection};
use super::locks::EntityLocks;
use super::protocol::{EntitySnapshotProvider, ProtocolClient};
use super::resolution::{merge_local, merge_manual, merge_server};
use super::status::{CycleTicket, StatusTracker, TriggerOutcome};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::models::{
    Change, ChangeId, ConflictId, ConflictRecord, ConflictStats, DeviceInfo, EntityKey,
    FieldChoice, MergeResult, Payload, PushResult, RemoteEntity, SyncReport, SyncStats,
    SyncSummary, Version,
};
use crate::services::SyncStore;

/// Push rounds per cycle; the second round only re-pushes auto-merged changes
const MAX_PUSH_ROUNDS: usize = 2;

/// Orchestrates sync cycles for one device.
///
/// Cheap to clone; clones share the same state.
pub struct SyncCoordinator<P, S> {
    inner: Arc<Inner<P, S>>,
}

impl<P, S> Clone for SyncCoordinator<P, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<P, S> {
    store: SyncStore,
    protocol: P,
    snapshots: S,
    detector: ConflictDetector,
    config: SyncConfig,
    device: DeviceInfo,
    status: StatusTracker,
    locks: EntityLocks,
}

#[derive(Debug, Default)]
struct CycleRun {
    report: SyncReport,
    /// Last permanent failure seen by an otherwise successful cycle
    warning: Option<String>,
}

impl<P: ProtocolClient, S: EntitySnapshotProvider> SyncCoordinator<P, S> {
    /// Build a coordinator for the device registered in `store`.
    pub async fn new(store: SyncStore, protocol: P, snapshots: S, config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let device = store.local_device().await?;

        tracing::info!(
            "Sync coordinator ready for device {} ({}, {})",
            device.device_id,
            device.device_name,
            device.platform
        );

        Ok(Self {
            inner: Arc::new(Inner {
                detector: ConflictDetector::from_config(&config),
                store,
                protocol,
                snapshots,
                config,
                device,
                status: StatusTracker::default(),
                locks: EntityLocks::default(),
            }),
        })
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.inner.device
    }

    pub fn store(&self) -> &SyncStore {
        &self.inner.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Queue a local mutation of an entity.
    pub async fn enqueue(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: Payload,
        base_version: Option<Version>,
    ) -> Result<Change> {
        let _guard = self
            .inner
            .locks
            .lock(&EntityKey::new(entity_type, entity_id))
            .await;
        self.inner
            .store
            .enqueue(entity_type, entity_id, payload, base_version)
            .await
    }

    /// Start a cycle in the background.
    ///
    /// Returns once the request has been accepted or refused; a trigger while
    /// a cycle is running is a no-op. Must be called within a Tokio runtime.
    pub fn trigger_sync(&self) -> TriggerOutcome {
        self.spawn_cycle(false)
    }

    /// Like [`Self::trigger_sync`], but supersedes a cycle that has made no
    /// progress for `stall_timeout`.
    pub fn force_sync(&self) -> TriggerOutcome {
        self.spawn_cycle(true)
    }

    /// Run one cycle to completion on the current task.
    ///
    /// Returns `Ok(None)` when no cycle was run (offline or already syncing)
    /// or when the cycle was superseded by a forced one.
    pub async fn sync_now(&self) -> Result<Option<SyncReport>> {
        match self
            .inner
            .status
            .begin(false, self.inner.config.stall_timeout)
        {
            Ok(ticket) => self.inner.run_cycle(ticket).await,
            Err(outcome) => {
                tracing::debug!("Sync not started: {outcome:?}");
                Ok(None)
            }
        }
    }

    fn spawn_cycle(&self, force: bool) -> TriggerOutcome {
        match self
            .inner
            .status
            .begin(force, self.inner.config.stall_timeout)
        {
            Ok(ticket) => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    // Failures are recorded in the status and logged
                    let _ = inner.run_cycle(ticket).await;
                });
                TriggerOutcome::Started
            }
            Err(outcome) => {
                tracing::debug!("Sync not started: {outcome:?}");
                outcome
            }
        }
    }

    /// Probe the remote and update the online/offline state.
    pub async fn check_connectivity(&self) -> bool {
        let online = match self.inner.call("ping", self.inner.protocol.ping()).await {
            Ok(()) => true,
            Err(error @ Error::Network(_)) => {
                tracing::debug!("Connectivity check failed: {error}");
                false
            }
            Err(error) => {
                tracing::warn!("Remote reachable but refused ping: {error}");
                true
            }
        };

        let was_online = self.inner.status.set_online(online);
        if was_online && !online {
            tracing::info!("Connectivity lost; sync paused");
        } else if !was_online && online {
            tracing::info!("Connectivity restored");
        }
        online
    }

    pub fn is_online(&self) -> bool {
        self.inner.status.is_online()
    }

    /// Check connectivity and trigger a cycle every `interval`.
    ///
    /// The task runs until the returned handle is aborted.
    pub fn run_periodic(&self, interval: Duration) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if coordinator.check_connectivity().await {
                    coordinator.trigger_sync();
                }
            }
        })
    }

    /// Start [`Self::run_periodic`] at the configured `sync_interval`.
    ///
    /// Returns `None` when no interval is configured.
    pub fn start_periodic(&self) -> Option<JoinHandle<()>> {
        let interval = self.inner.config.sync_interval?;
        tracing::info!("Periodic sync every {interval:?}");
        Some(self.run_periodic(interval))
    }

    pub async fn get_summary(&self) -> Result<SyncSummary> {
        let pending_count = self.inner.store.pending_count().await?;
        let unresolved_conflicts = self.inner.store.count_unresolved().await?;
        let status = &self.inner.status;
        let device = &self.inner.device;

        Ok(SyncSummary {
            device_id: device.device_id.clone(),
            device_name: device.device_name.clone(),
            platform: device.platform.clone(),
            pending_count,
            sync_state: status.state(),
            last_sync_at: status.last_sync_at(),
            last_error: status.last_error(),
            unresolved_conflicts,
        })
    }

    pub fn get_stats(&self) -> SyncStats {
        self.inner.status.stats()
    }

    pub async fn get_unresolved_conflicts(
        &self,
        entity_type: Option<&str>,
    ) -> Result<Vec<ConflictRecord>> {
        self.inner.store.find_unresolved(entity_type).await
    }

    pub async fn get_conflict_stats(&self) -> Result<ConflictStats> {
        self.inner.store.conflict_stats().await
    }

    /// Resolve by keeping the local snapshot.
    pub async fn resolve_with_local(&self, id: &ConflictId) -> Result<MergeResult> {
        self.inner.resolve(id, merge_local).await
    }

    /// Resolve by keeping the server snapshot.
    pub async fn resolve_with_server(&self, id: &ConflictId) -> Result<MergeResult> {
        self.inner.resolve(id, merge_server).await
    }

    /// Resolve with a side chosen for every disputed field.
    pub async fn resolve_manually(
        &self,
        id: &ConflictId,
        selections: &BTreeMap<String, FieldChoice>,
    ) -> Result<MergeResult> {
        self.inner
            .resolve(id, |conflict| merge_manual(conflict, selections))
            .await
    }
}

impl<P: ProtocolClient, S: EntitySnapshotProvider> Inner<P, S> {
    /// Apply the per-call timeout; a timeout is a network failure.
    async fn call<T>(
        &self,
        operation: &str,
        request: impl Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.call_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(Error::Network(format!(
                "{operation} timed out after {:?}",
                self.config.call_timeout
            ))),
        }
    }

    async fn run_cycle(&self, ticket: CycleTicket) -> Result<Option<SyncReport>> {
        let started = Instant::now();
        tracing::info!("Sync cycle {} started", ticket.generation);

        match self.cycle(ticket).await {
            Ok(Some(run)) => {
                let report = run.report;
                tracing::info!(
                    "Sync cycle {} finished: {} pushed, {} auto-merged, {} conflicts, {} pulled, {} failed",
                    ticket.generation,
                    report.pushed,
                    report.auto_merged,
                    report.conflicts,
                    report.pulled,
                    report.failed + report.exhausted
                );
                self.status
                    .finish_success(ticket.generation, &report, started.elapsed(), run.warning);
                Ok(Some(report))
            }
            Ok(None) => {
                tracing::warn!("Sync cycle {} was superseded", ticket.generation);
                Ok(None)
            }
            Err(error) => {
                tracing::warn!("Sync cycle {} failed: {error}", ticket.generation);
                if self.status.is_current(ticket.generation) {
                    if let Err(recover_error) = self.store.recover_in_flight().await {
                        tracing::warn!("Could not release in-flight changes: {recover_error}");
                    }
                }
                self.status
                    .finish_failure(ticket.generation, &error, started.elapsed());
                Err(error)
            }
        }
    }

    /// One cycle. `Ok(None)` means a forced cycle took over.
    async fn cycle(&self, ticket: CycleTicket) -> Result<Option<CycleRun>> {
        let generation = ticket.generation;

        // Only one cycle is current, so anything still IN_FLIGHT was left
        // behind by a crash or a superseded cycle
        let recovered = self.store.recover_in_flight().await?;
        if ticket.took_over {
            tracing::info!("Reclaimed {recovered} change(s) from the stalled cycle");
        }

        let mut run = CycleRun::default();

        for _ in 0..MAX_PUSH_ROUNDS {
            let claimed = self.store.claim_pending(self.config.claim_batch_size).await?;
            if !self.status.progress(generation) {
                return Ok(None);
            }
            if claimed.is_empty() {
                break;
            }

            match self.push_batch(generation, claimed, &mut run).await? {
                None => return Ok(None),
                Some(0) => break,
                Some(_) => {}
            }
        }

        let cursor = self.store.cursor().await?;
        let response = self
            .call("pull", self.protocol.pull(cursor.as_ref()))
            .await?;
        if !self.status.progress(generation) {
            return Ok(None);
        }

        for entity in &response.entities {
            if self.apply_pulled(entity).await? {
                run.report.pulled += 1;
            }
        }
        self.store.set_cursor(&response.new_cursor).await?;

        if !self.status.progress(generation) {
            return Ok(None);
        }
        Ok(Some(run))
    }

    /// Push one claimed batch. Returns how many changes were rebased for
    /// another push, or `None` once superseded.
    async fn push_batch(
        &self,
        generation: u64,
        batch: Vec<Change>,
        run: &mut CycleRun,
    ) -> Result<Option<usize>> {
        tracing::debug!("Pushing {} change(s)", batch.len());

        let pushed = self.call("push", self.protocol.push(&batch)).await;
        // A superseding cycle owns the claimed changes from here on; the
        // remote ignores the duplicate push by change id
        if !self.status.progress(generation) {
            return Ok(None);
        }
        let results = match pushed {
            Ok(results) => results,
            Err(error) => {
                // Anything else is released with the cycle without using a retry
                if error.is_transport() {
                    let reason = error.to_string();
                    for change in &batch {
                        self.fail_change(change, &reason, run).await?;
                    }
                }
                return Err(error);
            }
        };

        let mut results = results
            .into_iter()
            .map(|result| (result.change_id(), result))
            .collect::<HashMap<ChangeId, PushResult>>();

        let mut rebased = 0;
        for change in batch {
            if !self.status.progress(generation) {
                return Ok(None);
            }
            match results.remove(&change.id) {
                Some(PushResult::Applied { version, .. }) => {
                    self.apply_pushed(&change, version).await?;
                    run.report.pushed += 1;
                }
                Some(PushResult::Stale { current, .. }) => {
                    if self.reconcile(&change, current, run).await? {
                        rebased += 1;
                    }
                }
                Some(PushResult::Rejected { reason, .. }) => {
                    self.fail_change(&change, &reason, run).await?;
                }
                None => {
                    self.fail_change(&change, "remote returned no result for change", run)
                        .await?;
                }
            }
        }

        Ok(self.status.progress(generation).then_some(rebased))
    }

    /// Mark a pushed change synced and advance the replica to the version
    /// the remote assigned.
    async fn apply_pushed(&self, change: &Change, version: Version) -> Result<()> {
        let _guard = self.locks.lock(&change.key()).await;
        let base = self
            .snapshots
            .local_snapshot(&change.entity_type, &change.entity_id)
            .await?
            .unwrap_or_default();

        self.store.mark_synced(&change.id).await?;
        self.snapshots
            .apply_remote(&RemoteEntity {
                entity_type: change.entity_type.clone(),
                entity_id: change.entity_id.clone(),
                version,
                data: change.apply_to(&base),
            })
            .await
    }

    /// Handle a change the remote reported as stale. Returns true when the
    /// change was rebased and should be pushed again.
    async fn reconcile(
        &self,
        change: &Change,
        current: RemoteEntity,
        run: &mut CycleRun,
    ) -> Result<bool> {
        let key = change.key();
        let _guard = self.locks.lock(&key).await;
        let base = self
            .snapshots
            .local_snapshot(&change.entity_type, &change.entity_id)
            .await?;

        match self.detector.detect(change, base.as_ref(), Some(&current)) {
            Detection::FastForward => {
                tracing::debug!("Remote reported {key} stale at its base version; retrying");
                self.store.release(&change.id).await?;
                Ok(false)
            }
            Detection::AutoMerge { payload } => {
                self.store
                    .rebase(&change.id, &payload, &current.version)
                    .await?;
                self.snapshots.apply_remote(&current).await?;
                run.report.auto_merged += 1;
                tracing::info!(
                    "Auto-merged change {} for {key} onto version {}",
                    change.id,
                    current.version
                );
                Ok(true)
            }
            Detection::Converged => {
                self.store.mark_synced(&change.id).await?;
                self.snapshots.apply_remote(&current).await?;
                tracing::debug!("Change {} for {key} already matches the remote", change.id);
                Ok(false)
            }
            Detection::Conflict(conflict) => {
                self.store.file_conflict(&conflict).await?;
                self.snapshots.apply_remote(&current).await?;
                run.report.conflicts += 1;
                Ok(false)
            }
        }
    }

    /// Write a pulled entity to the replica unless local work is pending on
    /// it. Returns whether it was applied.
    async fn apply_pulled(&self, entity: &RemoteEntity) -> Result<bool> {
        let key = entity.key();
        let _guard = self.locks.lock(&key).await;

        if self
            .store
            .has_queued(&entity.entity_type, &entity.entity_id)
            .await?
            || self.store.has_unresolved(&key).await?
        {
            tracing::debug!("Deferred remote update of {key}: local work pending");
            return Ok(false);
        }

        self.snapshots.apply_remote(entity).await?;
        Ok(true)
    }

    async fn fail_change(&self, change: &Change, reason: &str, run: &mut CycleRun) -> Result<()> {
        match self.store.mark_failed(&change.id, reason).await {
            Ok(_) => {
                run.report.failed += 1;
                Ok(())
            }
            Err(Error::RetryExhausted { change_id, .. }) => {
                run.report.exhausted += 1;
                run.warning = Some(format!("change {change_id} failed permanently: {reason}"));
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn resolve(
        &self,
        id: &ConflictId,
        strategy: impl FnOnce(&ConflictRecord) -> Result<MergeResult> + Send,
    ) -> Result<MergeResult> {
        let key = self
            .store
            .get_conflict(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {id}")))?
            .key();
        let _guard = self.locks.lock(&key).await;

        // Re-read under the entity lock so a concurrent resolution is seen
        let conflict = self
            .store
            .get_conflict(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {id}")))?;
        let result = strategy(&conflict)?;

        let (_, change) = self
            .store
            .commit_resolution(
                &conflict,
                result.strategy,
                &result.merged_data,
                &self.device.device_id,
            )
            .await?;
        self.snapshots
            .apply_remote(&RemoteEntity {
                entity_type: conflict.entity_type.clone(),
                entity_id: conflict.entity_id.clone(),
                version: conflict.server_version.clone(),
                data: conflict.server_data.clone(),
            })
            .await?;

        tracing::info!(
            "Conflict {id} for {key} resolved with {}; queued change {}",
            result.strategy,
            change.id
        );
        Ok(result)
    }
}
