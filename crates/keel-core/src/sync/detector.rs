//! Conflict detection.
//!
//! Decides what happens to a local change once the remote authority reports a
//! newer version of its entity. Detection is a pure function of the change,
//! the pre-mutation snapshot the change was made against, and the remote
//! entity, so it can be tested without storage or network.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::config::SyncConfig;
use crate::models::{
    field_equal, field_union, Change, ConflictRecord, FieldDiff, Payload, RemoteEntity,
};

/// Outcome of comparing a local change against remote state
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Remote is still at the change's base version; push as is
    FastForward,
    /// Local and remote touched disjoint fields. `payload` is the full merged
    /// entity to push on top of the remote version.
    AutoMerge { payload: Payload },
    /// Both sides already agree on every field
    Converged,
    /// Overlapping edits disagree
    Conflict(ConflictRecord),
}

/// Field-level comparison rules
#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    tolerant_fields: BTreeMap<String, f64>,
}

impl ConflictDetector {
    #[must_use]
    pub fn new(tolerant_fields: BTreeMap<String, f64>) -> Self {
        Self { tolerant_fields }
    }

    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.tolerant_fields.clone())
    }

    /// Compare one field; numeric fields configured as tolerant are equal
    /// when they differ by at most their tolerance.
    #[must_use]
    pub fn fields_equal(&self, field: &str, left: Option<&Value>, right: Option<&Value>) -> bool {
        if let (Some(tolerance), Some(Value::Number(left)), Some(Value::Number(right))) =
            (self.tolerant_fields.get(field), left, right)
        {
            if let (Some(left), Some(right)) = (left.as_f64(), right.as_f64()) {
                return (left - right).abs() <= *tolerance;
            }
        }
        field_equal(left, right)
    }

    /// Fields whose value differs between two payloads, sorted.
    #[must_use]
    pub fn changed_fields(&self, before: &Payload, after: &Payload) -> Vec<String> {
        field_union(before, after)
            .into_iter()
            .filter(|field| !self.fields_equal(field, before.get(field), after.get(field)))
            .collect()
    }

    /// Field-level differences between a local and a server snapshot.
    #[must_use]
    pub fn diff(&self, local: &Payload, server: &Payload) -> Vec<FieldDiff> {
        self.changed_fields(local, server)
            .into_iter()
            .map(|field| FieldDiff {
                local_value: local.get(&field).cloned(),
                server_value: server.get(&field).cloned(),
                field,
            })
            .collect()
    }

    /// Classify `change` against the remote entity.
    ///
    /// `base` is the snapshot the change was made against (empty when the
    /// entity is new locally). A change only conflicts when a field it
    /// modified was also modified remotely to a different value.
    #[must_use]
    pub fn detect(
        &self,
        change: &Change,
        base: Option<&Payload>,
        remote: Option<&RemoteEntity>,
    ) -> Detection {
        let Some(remote) = remote else {
            return Detection::FastForward;
        };
        if change.base_version.as_ref() == Some(&remote.version) {
            return Detection::FastForward;
        }

        let empty = Payload::new();
        let base = base.unwrap_or(&empty);
        let local = change.apply_to(base);

        // Fields this change sets, or removes, relative to its base
        let touched = self.changed_fields(base, &local);

        let remote_changed = self.changed_fields(base, &remote.data);
        let overlapping = touched.iter().any(|field| {
            remote_changed.contains(field)
                && !self.fields_equal(field, local.get(field), remote.data.get(field))
        });

        if !overlapping {
            let mut merged = remote.data.clone();
            let mut edited = false;
            for field in &touched {
                if self.fields_equal(field, local.get(field), remote.data.get(field)) {
                    continue;
                }
                edited = true;
                match local.get(field) {
                    Some(value) => merged.insert(field.clone(), value.clone()),
                    None => merged.remove(field),
                };
            }
            if !edited {
                return Detection::Converged;
            }
            return Detection::AutoMerge { payload: merged };
        }

        let diffs = self.diff(&local, &remote.data);
        if diffs.is_empty() {
            return Detection::Converged;
        }

        Detection::Conflict(ConflictRecord::new(
            &change.key(),
            change.id,
            local,
            remote.data.clone(),
            remote.version.clone(),
            diffs,
        ))
    }
}
