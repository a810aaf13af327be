//! Merge strategies for resolving a conflict.
//!
//! These only compute the merged entity. Persisting the resolution and
//! queuing the merged payload is done by the coordinator.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::models::{ConflictRecord, FieldChoice, MergeResult, Resolution};

/// Keep the full local snapshot.
pub fn merge_local(conflict: &ConflictRecord) -> Result<MergeResult> {
    ensure_unresolved(conflict)?;
    Ok(MergeResult {
        success: true,
        strategy: Resolution::Local,
        merged_data: conflict.local_data.clone(),
        manual_fields: None,
    })
}

/// Keep the full server snapshot.
pub fn merge_server(conflict: &ConflictRecord) -> Result<MergeResult> {
    ensure_unresolved(conflict)?;
    Ok(MergeResult {
        success: true,
        strategy: Resolution::Server,
        merged_data: conflict.server_data.clone(),
        manual_fields: None,
    })
}

/// Pick a side per disputed field, starting from the server snapshot.
///
/// Every disputed field needs a selection. Choosing a side on which the field
/// is absent removes the field from the merged entity.
pub fn merge_manual(
    conflict: &ConflictRecord,
    selections: &BTreeMap<String, FieldChoice>,
) -> Result<MergeResult> {
    ensure_unresolved(conflict)?;

    let missing = conflict
        .conflicting_fields
        .iter()
        .filter(|diff| !selections.contains_key(&diff.field))
        .map(|diff| diff.field.clone())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(Error::IncompleteSelection { missing });
    }

    if let Some(unknown) = selections.keys().find(|field| {
        !conflict
            .conflicting_fields
            .iter()
            .any(|diff| &diff.field == *field)
    }) {
        return Err(Error::Validation(format!(
            "field '{unknown}' is not disputed in conflict {}",
            conflict.id
        )));
    }

    let mut merged = conflict.server_data.clone();
    for diff in &conflict.conflicting_fields {
        let chosen = match selections.get(&diff.field) {
            Some(FieldChoice::Local) => diff.local_value.clone(),
            _ => diff.server_value.clone(),
        };
        match chosen {
            Some(value) => merged.insert(diff.field.clone(), value),
            None => merged.remove(&diff.field),
        };
    }

    let mut manual_fields = conflict.field_names();
    manual_fields.sort();

    Ok(MergeResult {
        success: true,
        strategy: Resolution::Manual,
        merged_data: merged,
        manual_fields: Some(manual_fields),
    })
}

fn ensure_unresolved(conflict: &ConflictRecord) -> Result<()> {
    if conflict.is_resolved() {
        return Err(Error::AlreadyResolved(conflict.id.to_string()));
    }
    Ok(())
}
