//! Sync status views handed to clients

use serde::{Deserialize, Serialize};

use crate::state::SyncState;

/// Point-in-time view of sync health for the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub device_id: String,
    pub device_name: String,
    pub platform: String,
    /// Changes in PENDING or FAILED
    pub pending_count: usize,
    pub sync_state: SyncState,
    /// Last successful cycle (Unix ms)
    pub last_sync_at: Option<i64>,
    pub last_error: Option<String>,
    pub unresolved_conflicts: usize,
}

/// Counters accumulated by the coordinator since construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub cycles_started: u64,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub changes_pushed: u64,
    pub entities_pulled: u64,
    pub auto_merged: u64,
    pub conflicts_detected: u64,
    pub retries_exhausted: u64,
    pub last_cycle_duration_ms: Option<u64>,
}

/// Outcome of one completed sync cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Changes acknowledged by the remote
    pub pushed: usize,
    /// Changes rebased onto newer remote state without a conflict
    pub auto_merged: usize,
    /// Conflicts filed this cycle
    pub conflicts: usize,
    /// Remote entities applied to the local replica
    pub pulled: usize,
    /// Changes rejected and returned for retry
    pub failed: usize,
    /// Changes that exhausted their retries this cycle
    pub exhausted: usize,
}
