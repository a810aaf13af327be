use std::path::Path;

use keel_core::models::{ChangeState, EntityKey, Payload};
use serde::Serialize;

use crate::commands::common::open_store;
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct EntityView {
    entity_type: String,
    entity_id: String,
    /// Last synced remote version
    version: Option<String>,
    queued_changes: usize,
    data: Payload,
}

pub async fn run_entity_show(
    entity_type: &str,
    entity_id: &str,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let key = EntityKey::new(entity_type, entity_id);
    let data = store
        .local_view(entity_type, entity_id)
        .await?
        .ok_or_else(|| CliError::EntityNotFound(key.to_string()))?;

    let version = store
        .snapshot(entity_type, entity_id)
        .await?
        .map(|entity| entity.version.to_string());
    let queued_changes = store
        .list_changes(None)
        .await?
        .iter()
        .filter(|change| change.key() == key && change.state != ChangeState::Synced)
        .count();

    let view = EntityView {
        entity_type: entity_type.to_string(),
        entity_id: entity_id.to_string(),
        version,
        queued_changes,
        data,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!(
        "{key}  version={}  queued={}",
        view.version.as_deref().unwrap_or("-"),
        view.queued_changes
    );
    for (field, value) in &view.data {
        println!("  {field}: {value}");
    }
    Ok(())
}
