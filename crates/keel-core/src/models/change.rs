//! Change model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::payload::{overlay, Payload};
use super::version::Version;
use crate::error::Error;

/// A unique identifier for a change, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeId(Uuid);

impl ChangeId {
    /// Create a new unique change ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ChangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChangeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Entity addressed by a change or conflict
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    #[must_use]
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// Sync lifecycle of a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    /// Waiting for a sync cycle to claim it
    Pending,
    /// Claimed by the running cycle
    InFlight,
    /// Acknowledged by the remote authority
    Synced,
    /// Retries exhausted, waiting for manual intervention
    Failed,
}

impl ChangeState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "in_flight" | "in-flight" | "inflight" => Ok(Self::InFlight),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Validation(format!("unknown change state '{other}'"))),
        }
    }
}

/// A single local mutation queued for synchronization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Unique identifier, also the idempotency key for pushes
    pub id: ChangeId,
    /// Local insertion order
    pub sequence: i64,
    pub entity_type: String,
    pub entity_id: String,
    /// Post-mutation field values
    pub payload: Payload,
    /// Remote version the mutation was derived from (`None` for new entities)
    pub base_version: Option<Version>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    pub state: ChangeState,
    /// Failed push attempts so far
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// The payload is the whole entity; fields it lacks are removed on apply
    #[serde(default)]
    pub replace: bool,
}

impl Change {
    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.entity_id)
    }

    /// Full local view of the entity: `base` with this change applied.
    #[must_use]
    pub fn apply_to(&self, base: &Payload) -> Payload {
        if self.replace {
            self.payload.clone()
        } else {
            overlay(base, &self.payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_id_unique_and_parseable() {
        let first = ChangeId::new();
        let second = ChangeId::new();
        assert_ne!(first, second);

        let parsed: ChangeId = first.as_str().parse().unwrap();
        assert_eq!(parsed, first);
    }

    #[test]
    fn change_state_round_trips_through_text() {
        for state in [
            ChangeState::Pending,
            ChangeState::InFlight,
            ChangeState::Synced,
            ChangeState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<ChangeState>().unwrap(), state);
        }
        assert!("done".parse::<ChangeState>().is_err());
    }

    #[test]
    fn replacing_change_drops_fields_missing_from_payload() {
        let base = crate::models::payload_from_value(
            serde_json::json!({"status": "todo", "owner": "sam"}),
        )
        .unwrap();
        let mut change = Change {
            id: ChangeId::new(),
            sequence: 1,
            entity_type: "task".into(),
            entity_id: "t1".into(),
            payload: crate::models::payload_from_value(serde_json::json!({"status": "done"}))
                .unwrap(),
            base_version: Some(Version::from("2")),
            created_at: 0,
            state: ChangeState::Pending,
            retry_count: 0,
            last_error: None,
            replace: false,
        };

        assert_eq!(change.apply_to(&base).get("owner"), base.get("owner"));

        change.replace = true;
        assert_eq!(change.apply_to(&base), change.payload);
    }

    #[test]
    fn entity_key_display() {
        assert_eq!(EntityKey::new("goal", "g1").to_string(), "goal/g1");
    }
}
