//! Boundaries the sync core consumes: the remote authority and the local
//! entity store.

use std::future::Future;

use crate::error::Result;
use crate::models::{Change, Payload, PullResponse, PushResult, RemoteEntity, SyncCursor};

/// Network boundary to the remote authority.
///
/// Failures surface as `Error::Network`, `Error::Auth` or
/// `Error::ServerRejected`. Pushes are keyed by change id, so pushing the same
/// change twice must be a no-op on the remote side.
pub trait ProtocolClient: Send + Sync + 'static {
    /// Cheap reachability probe
    fn ping(&self) -> impl Future<Output = Result<()>> + Send;

    /// Push changes; one result per change, in any order
    fn push(&self, changes: &[Change]) -> impl Future<Output = Result<Vec<PushResult>>> + Send;

    /// Remote entities changed since `cursor` (everything when `None`)
    fn pull(
        &self,
        cursor: Option<&SyncCursor>,
    ) -> impl Future<Output = Result<PullResponse>> + Send;
}

/// Local entity store the sync core reads base snapshots from and writes
/// authoritative remote state into.
///
/// `local_snapshot` returns the last synchronized state of the entity, which
/// is the pre-mutation state of every change queued against it.
pub trait EntitySnapshotProvider: Send + Sync + 'static {
    fn local_snapshot(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> impl Future<Output = Result<Option<Payload>>> + Send;

    fn apply_remote(&self, entity: &RemoteEntity) -> impl Future<Output = Result<()>> + Send;
}
