use std::path::Path;

use keel_core::models::{ChangeState, Version};

use crate::commands::common::{
    change_to_list_item, format_change_lines, open_store, parse_assignments, resolve_change,
    ChangeListItem,
};
use crate::error::CliError;

pub async fn run_change_add(
    entity_type: &str,
    entity_id: &str,
    assignments: &[String],
    base: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let payload = parse_assignments(assignments)?;
    let store = open_store(db_path).await?;

    let base_version = match base {
        Some(version) => Some(Version::new(version.trim())),
        None => store
            .snapshot(entity_type, entity_id)
            .await?
            .map(|entity| entity.version),
    };

    let change = store
        .enqueue(entity_type, entity_id, payload, base_version)
        .await?;
    tracing::debug!(
        "Queued change {} for {entity_type}/{entity_id} on base {:?}",
        change.id,
        change.base_version
    );
    println!("{}", change.id);
    Ok(())
}

pub async fn run_change_list(
    state: Option<&str>,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let state = state.map(str::parse::<ChangeState>).transpose()?;
    let store = open_store(db_path).await?;
    let changes = store.list_changes(state).await?;

    if as_json {
        let json_items = changes
            .iter()
            .map(change_to_list_item)
            .collect::<Vec<ChangeListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if changes.is_empty() {
        println!("No changes recorded.");
        return Ok(());
    }

    for line in format_change_lines(&changes) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_change_retry(id: &str, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let change = resolve_change(id, &store).await?;
    let change = store.retry_change(&change.id).await?;
    println!("{}", change.id);
    Ok(())
}

pub async fn run_change_discard(id: &str, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let change = resolve_change(id, &store).await?;
    let change = store.discard_change(&change.id).await?;
    println!("{}", change.id);
    Ok(())
}
