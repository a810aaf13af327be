//! Data exchanged with the remote authority

use serde::{Deserialize, Serialize};

use super::change::{ChangeId, EntityKey};
use super::payload::Payload;
use super::version::{SyncCursor, Version};

/// Authoritative remote state of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntity {
    pub entity_type: String,
    pub entity_id: String,
    pub version: Version,
    pub data: Payload,
}

impl RemoteEntity {
    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.entity_id)
    }
}

/// Per-change answer to a push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PushResult {
    /// Change accepted (or already accepted earlier under the same id)
    Applied { change_id: ChangeId, version: Version },
    /// Remote moved past the change's base version
    Stale {
        change_id: ChangeId,
        current: RemoteEntity,
    },
    /// Remote refused this change
    Rejected { change_id: ChangeId, reason: String },
}

impl PushResult {
    #[must_use]
    pub const fn change_id(&self) -> ChangeId {
        match self {
            Self::Applied { change_id, .. }
            | Self::Stale { change_id, .. }
            | Self::Rejected { change_id, .. } => *change_id,
        }
    }
}

/// Remote entities changed since a cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    pub entities: Vec<RemoteEntity>,
    pub new_cursor: SyncCursor,
}
