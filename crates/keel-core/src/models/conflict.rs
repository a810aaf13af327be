//! Sync conflict model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::change::{ChangeId, EntityKey};
use super::payload::Payload;
use super::version::Version;
use crate::error::Error;
use crate::util::unix_millis_now;

/// A unique identifier for a conflict record, using UUID v7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictId(Uuid);

impl ConflictId {
    /// Create a new unique conflict ID using UUID v7.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID.
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConflictId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// How a conflict was settled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Still waiting for an explicit strategy
    #[default]
    None,
    Local,
    Server,
    Manual,
}

impl Resolution {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Local => "local",
            Self::Server => "server",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "local" => Ok(Self::Local),
            "server" => Ok(Self::Server),
            "manual" => Ok(Self::Manual),
            other => Err(Error::Validation(format!("unknown resolution '{other}'"))),
        }
    }
}

/// Side picked for one disputed field in a manual resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldChoice {
    Local,
    Server,
}

impl FromStr for FieldChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "server" => Ok(Self::Server),
            other => Err(Error::Validation(format!(
                "field choice must be 'local' or 'server', got '{other}'"
            ))),
        }
    }
}

/// One disputed field. `None` means the field is absent on that side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub local_value: Option<Value>,
    pub server_value: Option<Value>,
}

/// An unresolved or resolved divergence for one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub entity_type: String,
    pub entity_id: String,
    /// Change consumed into this conflict
    pub change_id: ChangeId,
    /// Full local snapshot
    pub local_data: Payload,
    /// Full remote snapshot
    pub server_data: Payload,
    /// Remote version at conflict time
    pub server_version: Version,
    /// Disputed fields, sorted by field name
    pub conflicting_fields: Vec<FieldDiff>,
    pub resolution: Resolution,
    pub resolved_data: Option<Payload>,
    /// Resolution timestamp (Unix ms)
    pub resolved_at: Option<i64>,
    /// Device that resolved it
    pub resolved_by: Option<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
}

impl ConflictRecord {
    /// Build an unresolved conflict record.
    #[must_use]
    pub fn new(
        key: &EntityKey,
        change_id: ChangeId,
        local_data: Payload,
        server_data: Payload,
        server_version: Version,
        mut conflicting_fields: Vec<FieldDiff>,
    ) -> Self {
        conflicting_fields.sort_by(|left, right| left.field.cmp(&right.field));
        conflicting_fields.dedup_by(|left, right| left.field == right.field);
        Self {
            id: ConflictId::new(),
            entity_type: key.entity_type.clone(),
            entity_id: key.entity_id.clone(),
            change_id,
            local_data,
            server_data,
            server_version,
            conflicting_fields,
            resolution: Resolution::None,
            resolved_data: None,
            resolved_at: None,
            resolved_by: None,
            created_at: unix_millis_now(),
        }
    }

    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.entity_id)
    }

    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        !matches!(self.resolution, Resolution::None)
    }

    /// Names of the disputed fields, in order.
    #[must_use]
    pub fn field_names(&self) -> Vec<String> {
        self.conflicting_fields
            .iter()
            .map(|diff| diff.field.clone())
            .collect()
    }
}

/// Aggregate view over the conflict store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictStats {
    pub total: usize,
    pub unresolved: usize,
    pub resolved: usize,
    pub by_entity_type: BTreeMap<String, usize>,
    pub by_resolution: BTreeMap<String, usize>,
    /// Mean of `resolved_at - created_at` over resolved records (ms)
    pub average_resolution_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn diff(field: &str) -> FieldDiff {
        FieldDiff {
            field: field.to_string(),
            local_value: Some(json!("l")),
            server_value: Some(json!("s")),
        }
    }

    #[test]
    fn new_record_sorts_and_dedups_fields() {
        let record = ConflictRecord::new(
            &EntityKey::new("task", "t1"),
            ChangeId::new(),
            Payload::new(),
            Payload::new(),
            Version::from("2"),
            vec![diff("title"), diff("status"), diff("title")],
        );
        assert_eq!(record.field_names(), vec!["status", "title"]);
        assert!(!record.is_resolved());
        assert!(record.resolved_data.is_none());
    }

    #[test]
    fn resolution_parses_case_insensitively() {
        assert_eq!("Manual".parse::<Resolution>().unwrap(), Resolution::Manual);
        assert!("both".parse::<Resolution>().is_err());
        assert_eq!("server".parse::<FieldChoice>().unwrap(), FieldChoice::Server);
    }
}
