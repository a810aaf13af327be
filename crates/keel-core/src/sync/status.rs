//! Sync state machine and counters.
//!
//! ```text
//! idle ──trigger──▶ syncing ──success──▶ idle
//!                      │
//!                      └──failure──▶ error ──trigger──▶ syncing
//! any ──connectivity lost──▶ offline ──restored──▶ idle
//! ```
//!
//! Connectivity is tracked apart from the cycle state so that `offline`
//! takes precedence in reporting even while a cycle is running.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::models::{SyncReport, SyncStats};
use crate::state::SyncState;
use crate::util::unix_millis_now;

/// Result of asking for a new cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A cycle was started
    Started,
    /// A cycle is already running; the request was a no-op
    AlreadySyncing,
    /// Connectivity is down; nothing was started
    Offline,
}

/// Permission to run one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CycleTicket {
    pub generation: u64,
    /// The cycle replaced a stalled one and must reclaim its changes
    pub took_over: bool,
}

#[derive(Debug)]
struct Inner {
    state: SyncState,
    online: bool,
    generation: u64,
    last_progress: Option<Instant>,
    last_sync_at: Option<i64>,
    last_error: Option<String>,
    stats: SyncStats,
}

#[derive(Debug)]
pub(crate) struct StatusTracker {
    inner: Mutex<Inner>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SyncState::Idle,
                online: true,
                generation: 0,
                last_progress: None,
                last_sync_at: None,
                last_error: None,
                stats: SyncStats::default(),
            }),
        }
    }
}

impl StatusTracker {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter `syncing` unless offline or a cycle is already running.
    ///
    /// With `force`, a running cycle that has made no progress for
    /// `stall_timeout` is superseded instead.
    pub fn begin(
        &self,
        force: bool,
        stall_timeout: Duration,
    ) -> std::result::Result<CycleTicket, TriggerOutcome> {
        let mut inner = self.lock();
        if !inner.online {
            return Err(TriggerOutcome::Offline);
        }

        let mut took_over = false;
        if inner.state == SyncState::Syncing {
            let stalled = inner
                .last_progress
                .is_some_and(|progress| progress.elapsed() >= stall_timeout);
            if !(force && stalled) {
                return Err(TriggerOutcome::AlreadySyncing);
            }
            tracing::warn!(
                "Sync cycle {} stalled for more than {:?}; taking over",
                inner.generation,
                stall_timeout
            );
            took_over = true;
        }

        inner.generation += 1;
        inner.state = SyncState::Syncing;
        inner.last_progress = Some(Instant::now());
        inner.stats.cycles_started += 1;
        Ok(CycleTicket {
            generation: inner.generation,
            took_over,
        })
    }

    /// Record progress; false once the cycle has been superseded.
    pub fn progress(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        inner.last_progress = Some(Instant::now());
        true
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// `syncing -> idle`. `warning` is kept as the last error when some
    /// change failed permanently during an otherwise successful cycle.
    pub fn finish_success(
        &self,
        generation: u64,
        report: &SyncReport,
        elapsed: Duration,
        warning: Option<String>,
    ) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        inner.state = SyncState::Idle;
        inner.last_progress = None;
        inner.last_sync_at = Some(unix_millis_now());
        inner.last_error = warning;

        let stats = &mut inner.stats;
        stats.cycles_completed += 1;
        stats.changes_pushed += report.pushed as u64;
        stats.entities_pulled += report.pulled as u64;
        stats.auto_merged += report.auto_merged as u64;
        stats.conflicts_detected += report.conflicts as u64;
        stats.retries_exhausted += report.exhausted as u64;
        stats.last_cycle_duration_ms = Some(duration_millis(elapsed));
    }

    /// `syncing -> error`
    pub fn finish_failure(&self, generation: u64, error: &crate::Error, elapsed: Duration) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        inner.state = SyncState::Error;
        inner.last_progress = None;
        inner.last_error = Some(error.to_string());
        inner.stats.cycles_failed += 1;
        inner.stats.last_cycle_duration_ms = Some(duration_millis(elapsed));
    }

    /// Apply a connectivity observation; returns the previous value.
    pub fn set_online(&self, online: bool) -> bool {
        let mut inner = self.lock();
        let previous = inner.online;
        inner.online = online;
        if online && !previous && inner.state != SyncState::Syncing {
            inner.state = SyncState::Idle;
        }
        previous
    }

    pub fn is_online(&self) -> bool {
        self.lock().online
    }

    /// State as reported to clients
    pub fn state(&self) -> SyncState {
        let inner = self.lock();
        if inner.online {
            inner.state
        } else {
            SyncState::Offline
        }
    }

    pub fn last_sync_at(&self) -> Option<i64> {
        self.lock().last_sync_at
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn stats(&self) -> SyncStats {
        self.lock().stats
    }
}

fn duration_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
