use std::collections::BTreeMap;
use std::path::Path;

use keel_core::models::{FieldChoice, MergeResult};

use crate::commands::common::{
    conflict_to_list_item, format_conflict_lines, format_timestamp, open_coordinator, open_store,
    parse_pick, render_value, resolve_conflict, ConflictListItem,
};
use crate::error::CliError;

pub async fn run_conflicts_list(
    entity_type: Option<&str>,
    include_resolved: bool,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let conflicts = if include_resolved {
        store.find_conflicts(entity_type).await?
    } else {
        store.find_unresolved(entity_type).await?
    };

    if as_json {
        let json_items = conflicts
            .iter()
            .map(conflict_to_list_item)
            .collect::<Vec<ConflictListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_conflicts_show(id: &str, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let conflict = resolve_conflict(id, &store).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflict)?);
        return Ok(());
    }

    println!("Conflict {}", conflict.id);
    println!("Entity:   {}", conflict.key());
    println!("Server:   version {}", conflict.server_version);
    println!("Created:  {}", format_timestamp(conflict.created_at));
    match conflict.resolved_at {
        Some(resolved_at) => println!(
            "Resolved: {} at {} by {}",
            conflict.resolution,
            format_timestamp(resolved_at),
            conflict.resolved_by.as_deref().unwrap_or("-")
        ),
        None => println!("Resolved: no"),
    }
    for diff in &conflict.conflicting_fields {
        println!(
            "  {}: local={} server={}",
            diff.field,
            render_value(diff.local_value.as_ref()),
            render_value(diff.server_value.as_ref())
        );
    }
    Ok(())
}

pub async fn run_conflicts_stats(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let stats = store.conflict_stats().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!(
        "Total: {}  unresolved: {}  resolved: {}",
        stats.total, stats.unresolved, stats.resolved
    );
    for (entity_type, count) in &stats.by_entity_type {
        println!("  type {entity_type:<16} {count}");
    }
    for (resolution, count) in &stats.by_resolution {
        println!("  resolution {resolution:<10} {count}");
    }
    if let Some(average) = stats.average_resolution_ms {
        println!("Average time to resolve: {}s", average / 1000);
    }
    Ok(())
}

/// How the user asked to settle a conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveChoice {
    Local,
    Server,
    Manual(BTreeMap<String, FieldChoice>),
}

impl ResolveChoice {
    pub fn from_flags(local: bool, server: bool, picks: &[String]) -> Result<Self, CliError> {
        if local {
            return Ok(Self::Local);
        }
        if server {
            return Ok(Self::Server);
        }

        let mut selections = BTreeMap::new();
        for pick in picks {
            let (field, choice) = parse_pick(pick)?;
            if selections.insert(field.clone(), choice).is_some() {
                return Err(CliError::DuplicateField(field));
            }
        }
        Ok(Self::Manual(selections))
    }
}

pub async fn run_conflicts_resolve(
    id: &str,
    choice: &ResolveChoice,
    db_path: &Path,
    remote_path: &Path,
) -> Result<(), CliError> {
    let coordinator = open_coordinator(db_path, remote_path).await?;
    let conflict = resolve_conflict(id, coordinator.store()).await?;

    let result = match choice {
        ResolveChoice::Local => coordinator.resolve_with_local(&conflict.id).await?,
        ResolveChoice::Server => coordinator.resolve_with_server(&conflict.id).await?,
        ResolveChoice::Manual(selections) => {
            coordinator
                .resolve_manually(&conflict.id, selections)
                .await?
        }
    };

    tracing::info!(
        "Conflict {} for {} resolved with {}",
        conflict.id,
        conflict.key(),
        result.strategy
    );
    print_merge_result(&conflict.id.to_string(), &result)?;
    Ok(())
}

fn print_merge_result(conflict_id: &str, result: &MergeResult) -> Result<(), CliError> {
    println!(
        "Resolved {conflict_id} with {}; merged state queued for the next sync",
        result.strategy
    );
    println!("{}", serde_json::to_string_pretty(&result.merged_data)?);
    Ok(())
}
