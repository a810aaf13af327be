//! In-process remote authority with fault injection.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::RemoteState;
use crate::error::{Error, Result};
use crate::models::{Change, Payload, PullResponse, PushResult, RemoteEntity, SyncCursor};
use crate::sync::ProtocolClient;

/// Failure injected into the next push or pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Network,
    Auth,
    ServerRejected,
    /// A response the client cannot decode
    Malformed,
}

impl FailureKind {
    fn into_error(self) -> Error {
        match self {
            Self::Network => Error::Network("simulated connection reset".into()),
            Self::Auth => Error::Auth("simulated expired token".into()),
            Self::ServerRejected => Error::ServerRejected("simulated server error".into()),
            Self::Malformed => Error::Serialization(serde::de::Error::custom(
                "simulated malformed response",
            )),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: RemoteState,
    offline: bool,
    failures: VecDeque<FailureKind>,
    rejected: BTreeSet<String>,
    latency: Option<Duration>,
    push_calls: usize,
    pull_calls: usize,
}

impl Shared {
    fn check_available(&mut self) -> Result<()> {
        if self.offline {
            return Err(Error::Network("remote unreachable".into()));
        }
        match self.failures.pop_front() {
            Some(kind) => Err(kind.into_error()),
            None => Ok(()),
        }
    }
}

/// Remote authority held in memory; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse every call with a network error while set
    pub fn set_offline(&self, offline: bool) {
        self.shared().offline = offline;
    }

    /// Fail the next `count` push or pull calls
    pub fn fail_next(&self, kind: FailureKind, count: usize) {
        self.shared()
            .failures
            .extend(std::iter::repeat(kind).take(count));
    }

    /// Answer every push for this entity with `Rejected`
    pub fn reject_entity(&self, entity_type: &str, entity_id: &str) {
        self.shared()
            .rejected
            .insert(format!("{entity_type}/{entity_id}"));
    }

    /// Delay every call, e.g. to exercise timeouts
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.shared().latency = latency;
    }

    /// Write fields as another device would.
    pub fn write(&self, entity_type: &str, entity_id: &str, fields: &Payload) -> RemoteEntity {
        self.shared().state.write(entity_type, entity_id, fields)
    }

    pub fn entity(&self, entity_type: &str, entity_id: &str) -> Option<RemoteEntity> {
        self.shared().state.entity(entity_type, entity_id)
    }

    pub fn push_calls(&self) -> usize {
        self.shared().push_calls
    }

    pub fn pull_calls(&self) -> usize {
        self.shared().pull_calls
    }

    async fn delay(&self) {
        let latency = self.shared().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl ProtocolClient for MemoryRemote {
    async fn ping(&self) -> Result<()> {
        self.delay().await;
        if self.shared().offline {
            return Err(Error::Network("remote unreachable".into()));
        }
        Ok(())
    }

    async fn push(&self, changes: &[Change]) -> Result<Vec<PushResult>> {
        self.delay().await;
        let mut shared = self.shared();
        shared.push_calls += 1;
        shared.check_available()?;

        let mut results = Vec::with_capacity(changes.len());
        for change in changes {
            if shared.rejected.contains(&change.key().to_string()) {
                results.push(PushResult::Rejected {
                    change_id: change.id,
                    reason: format!("{} is read-only", change.key()),
                });
            } else {
                results.push(shared.state.apply(change));
            }
        }
        Ok(results)
    }

    async fn pull(&self, cursor: Option<&SyncCursor>) -> Result<PullResponse> {
        self.delay().await;
        let mut shared = self.shared();
        shared.pull_calls += 1;
        shared.check_available()?;
        shared.state.changes_since(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{payload_from_value, ChangeId, ChangeState};
    use serde_json::json;

    fn change() -> Change {
        Change {
            id: ChangeId::new(),
            sequence: 1,
            entity_type: "goal".into(),
            entity_id: "g1".into(),
            payload: payload_from_value(json!({"title": "T"})).unwrap(),
            base_version: None,
            created_at: 0,
            state: ChangeState::InFlight,
            retry_count: 0,
            last_error: None,
            replace: false,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_remote_refuses_calls() {
        let remote = MemoryRemote::new();
        remote.set_offline(true);

        assert!(matches!(remote.ping().await, Err(Error::Network(_))));
        assert!(matches!(remote.push(&[change()]).await, Err(Error::Network(_))));

        remote.set_offline(false);
        assert!(remote.ping().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn injected_failures_are_consumed_in_order() {
        let remote = MemoryRemote::new();
        remote.fail_next(FailureKind::Auth, 1);
        remote.fail_next(FailureKind::ServerRejected, 1);

        assert!(matches!(remote.pull(None).await, Err(Error::Auth(_))));
        assert!(matches!(
            remote.push(&[change()]).await,
            Err(Error::ServerRejected(_))
        ));
        assert_eq!(remote.push(&[change()]).await.unwrap().len(), 1);
        assert_eq!(remote.push_calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_entities() {
        let remote = MemoryRemote::new();
        remote.reject_entity("goal", "g1");

        let results = remote.push(&[change()]).await.unwrap();
        assert!(matches!(results[0], PushResult::Rejected { .. }));
        assert!(remote.entity("goal", "g1").is_none());
    }
}
