//! Reference remote authorities.
//!
//! [`MemoryRemote`] keeps state in process and can simulate outages, latency
//! and rejections. [`FileRemote`] persists the same state as JSON so several
//! local stores (or CLI invocations) can sync through one file.
//!
//! Both assign integer versions per entity and use a global write sequence
//! as the pull cursor. Pushes are optimistic: a change whose base version is
//! not the entity's current version is answered with `Stale`.

mod file;
mod memory;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use file::FileRemote;
pub use memory::{FailureKind, MemoryRemote};

use crate::error::{Error, Result};
use crate::models::{
    overlay, Change, EntityKey, Payload, PullResponse, PushResult, RemoteEntity, SyncCursor,
    Version,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntity {
    entity_type: String,
    entity_id: String,
    version: u64,
    /// Write sequence of the last change to this entity
    sequence: u64,
    data: Payload,
}

impl StoredEntity {
    fn to_remote(&self) -> RemoteEntity {
        RemoteEntity {
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
            version: Version::new(self.version.to_string()),
            data: self.data.clone(),
        }
    }
}

/// Authoritative entity state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteState {
    sequence: u64,
    entities: BTreeMap<String, StoredEntity>,
    /// Change id -> version it produced, for idempotent re-pushes
    applied: BTreeMap<String, String>,
}

impl RemoteState {
    /// Apply one pushed change.
    pub fn apply(&mut self, change: &Change) -> PushResult {
        let change_id = change.id;
        if let Some(version) = self.applied.get(&change_id.as_str()) {
            return PushResult::Applied {
                change_id,
                version: Version::new(version.clone()),
            };
        }

        if let Some(current) = self.entities.get(&change.key().to_string()) {
            let current_version = current.version.to_string();
            if change.base_version.as_ref().map(Version::as_str) != Some(current_version.as_str())
            {
                return PushResult::Stale {
                    change_id,
                    current: current.to_remote(),
                };
            }
        }

        let entity = self.store(
            &change.entity_type,
            &change.entity_id,
            &change.payload,
            change.replace,
        );
        self.applied
            .insert(change_id.as_str(), entity.version.as_str().to_string());
        PushResult::Applied {
            change_id,
            version: entity.version,
        }
    }

    /// Write fields directly, as another client of the authority would.
    pub fn write(&mut self, entity_type: &str, entity_id: &str, fields: &Payload) -> RemoteEntity {
        self.store(entity_type, entity_id, fields, false)
    }

    /// Bump the entity's version. A `replace` write stores `fields` as the
    /// whole entity; otherwise they are laid over the current fields.
    fn store(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        fields: &Payload,
        replace: bool,
    ) -> RemoteEntity {
        self.sequence += 1;
        let sequence = self.sequence;
        let stored = self
            .entities
            .entry(EntityKey::new(entity_type, entity_id).to_string())
            .and_modify(|entity| {
                entity.version += 1;
                entity.sequence = sequence;
                entity.data = if replace {
                    fields.clone()
                } else {
                    overlay(&entity.data, fields)
                };
            })
            .or_insert_with(|| StoredEntity {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
                version: 1,
                sequence,
                data: fields.clone(),
            });
        stored.to_remote()
    }

    pub fn entity(&self, entity_type: &str, entity_id: &str) -> Option<RemoteEntity> {
        self.entities
            .get(&EntityKey::new(entity_type, entity_id).to_string())
            .map(StoredEntity::to_remote)
    }

    /// Entities written after `cursor`, oldest write first.
    pub fn changes_since(&self, cursor: Option<&SyncCursor>) -> Result<PullResponse> {
        let since = match cursor {
            Some(cursor) => cursor.as_str().parse::<u64>().map_err(|_| {
                Error::ServerRejected(format!("unknown pull cursor '{cursor}'"))
            })?,
            None => 0,
        };

        let mut changed = self
            .entities
            .values()
            .filter(|entity| entity.sequence > since)
            .collect::<Vec<_>>();
        changed.sort_by_key(|entity| entity.sequence);

        Ok(PullResponse {
            entities: changed.into_iter().map(StoredEntity::to_remote).collect(),
            new_cursor: SyncCursor::new(self.sequence.to_string()),
        })
    }
}
