use std::env;
use std::path::{Path, PathBuf};

use keel_core::models::{Change, ConflictRecord, FieldChoice, Payload};
use keel_core::remote::FileRemote;
use keel_core::util::unix_millis_now;
use keel_core::{SyncConfig, SyncCoordinator, SyncStore};
use serde::Serialize;
use serde_json::Value;

use crate::error::CliError;

pub type Coordinator = SyncCoordinator<FileRemote, SyncStore>;

#[derive(Debug, Serialize)]
pub struct ChangeListItem {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub state: String,
    pub base_version: Option<String>,
    pub payload: Payload,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub relative_time: String,
}

#[derive(Debug, Serialize)]
pub struct ConflictListItem {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub fields: Vec<String>,
    pub resolution: String,
    pub created_at: i64,
    pub created_at_iso: String,
    pub resolved_by: Option<String>,
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("KEEL_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(|| data_dir().join("keel.db"))
}

pub fn resolve_remote_path(cli_remote: Option<PathBuf>) -> PathBuf {
    cli_remote
        .or_else(|| env::var_os("KEEL_REMOTE_PATH").map(PathBuf::from))
        .unwrap_or_else(|| data_dir().join("remote.json"))
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("keel")
}

pub async fn open_store(db_path: &Path) -> Result<SyncStore, CliError> {
    let config = SyncConfig::from_env()?;
    Ok(SyncStore::open_path(db_path, &config).await?)
}

pub async fn open_coordinator(db_path: &Path, remote_path: &Path) -> Result<Coordinator, CliError> {
    open_coordinator_with(db_path, remote_path, SyncConfig::from_env()?).await
}

pub async fn open_coordinator_with(
    db_path: &Path,
    remote_path: &Path,
    config: SyncConfig,
) -> Result<Coordinator, CliError> {
    let store = SyncStore::open_path(db_path, &config).await?;
    let remote = FileRemote::new(remote_path);
    Ok(SyncCoordinator::new(store.clone(), remote, store, config).await?)
}

/// Parse `FIELD=VALUE`. VALUE is read as JSON when it parses, otherwise as a
/// plain string, so `title=Draft` and `title="Draft"` are the same.
pub fn parse_assignment(raw: &str) -> Result<(String, Value), CliError> {
    let (field, value) = raw
        .split_once('=')
        .ok_or_else(|| CliError::InvalidAssignment(raw.to_string()))?;
    let field = field.trim();
    if field.is_empty() {
        return Err(CliError::InvalidAssignment(raw.to_string()));
    }

    let value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((field.to_string(), value))
}

pub fn parse_assignments(raw: &[String]) -> Result<Payload, CliError> {
    let mut payload = Payload::new();
    for assignment in raw {
        let (field, value) = parse_assignment(assignment)?;
        if payload.contains_key(&field) {
            return Err(CliError::DuplicateField(field));
        }
        payload.insert(field, value);
    }

    if payload.is_empty() {
        return Err(CliError::EmptyPayload);
    }
    Ok(payload)
}

pub fn parse_pick(raw: &str) -> Result<(String, FieldChoice), CliError> {
    let (field, side) = raw
        .split_once('=')
        .ok_or_else(|| CliError::InvalidAssignment(raw.to_string()))?;
    let field = field.trim();
    if field.is_empty() {
        return Err(CliError::InvalidAssignment(raw.to_string()));
    }
    Ok((field.to_string(), side.parse::<FieldChoice>()?))
}

pub fn normalize_identifier(id: &str, kind: &'static str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyId { kind })
    } else {
        Ok(trimmed.to_string())
    }
}

/// Pick the single candidate whose ID starts with `query`.
pub fn unique_by_prefix<T>(
    query: &str,
    kind: &'static str,
    candidates: Vec<(String, T)>,
) -> Result<T, CliError> {
    let mut matching = candidates
        .into_iter()
        .filter(|(id, _)| id.starts_with(query))
        .collect::<Vec<_>>();

    match matching.len() {
        0 => Err(CliError::NotFound {
            kind,
            query: query.to_string(),
        }),
        1 => Ok(matching.remove(0).1),
        _ => {
            let options = matching
                .iter()
                .take(3)
                .map(|(id, _)| short_id(id))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

pub async fn resolve_change(query: &str, store: &SyncStore) -> Result<Change, CliError> {
    let query = normalize_identifier(query, "Change")?;
    if let Ok(id) = query.parse() {
        if let Some(change) = store.get_change(&id).await? {
            return Ok(change);
        }
    }

    let candidates = store
        .list_changes(None)
        .await?
        .into_iter()
        .map(|change| (change.id.to_string(), change))
        .collect();
    unique_by_prefix(&query, "Change", candidates)
}

pub async fn resolve_conflict(query: &str, store: &SyncStore) -> Result<ConflictRecord, CliError> {
    let query = normalize_identifier(query, "Conflict")?;
    if let Ok(id) = query.parse() {
        if let Some(conflict) = store.get_conflict(&id).await? {
            return Ok(conflict);
        }
    }

    let candidates = store
        .find_conflicts(None)
        .await?
        .into_iter()
        .map(|conflict| (conflict.id.to_string(), conflict))
        .collect();
    unique_by_prefix(&query, "Conflict", candidates)
}

pub fn short_id(id: &str) -> String {
    id.chars().take(13).collect()
}

pub fn change_to_list_item(change: &Change) -> ChangeListItem {
    ChangeListItem {
        id: change.id.to_string(),
        entity_type: change.entity_type.clone(),
        entity_id: change.entity_id.clone(),
        state: change.state.as_str().to_string(),
        base_version: change.base_version.as_ref().map(ToString::to_string),
        payload: change.payload.clone(),
        retry_count: change.retry_count,
        last_error: change.last_error.clone(),
        created_at: change.created_at,
        relative_time: format_relative_time(change.created_at, unix_millis_now()),
    }
}

pub fn conflict_to_list_item(conflict: &ConflictRecord) -> ConflictListItem {
    ConflictListItem {
        id: conflict.id.to_string(),
        entity_type: conflict.entity_type.clone(),
        entity_id: conflict.entity_id.clone(),
        fields: conflict.field_names(),
        resolution: conflict.resolution.as_str().to_string(),
        created_at: conflict.created_at,
        created_at_iso: format_timestamp(conflict.created_at),
        resolved_by: conflict.resolved_by.clone(),
    }
}

pub fn format_change_lines(changes: &[Change]) -> Vec<String> {
    let now_ms = unix_millis_now();
    changes
        .iter()
        .map(|change| {
            let short_id = short_id(&change.id.to_string());
            let entity = change.key().to_string();
            let preview = payload_preview(&change.payload, 40);
            let relative_time = format_relative_time(change.created_at, now_ms);
            let state = change.state.as_str();

            match change.last_error.as_deref() {
                Some(error) => format!(
                    "{short_id:<13}  {state:<9}  {entity:<24}  {preview:<40}  {relative_time:<10}  {error}"
                ),
                None => format!(
                    "{short_id:<13}  {state:<9}  {entity:<24}  {preview:<40}  {relative_time}"
                ),
            }
        })
        .collect()
}

pub fn format_conflict_lines(conflicts: &[ConflictRecord]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{:<13}  {}  {:<6}  {:<24}  fields={}",
                short_id(&conflict.id.to_string()),
                format_timestamp(conflict.created_at),
                conflict.resolution.as_str(),
                conflict.key().to_string(),
                conflict.field_names().join(",")
            )
        })
        .collect()
}

/// Single-line JSON rendering of a payload, truncated to `max_chars`.
pub fn payload_preview(payload: &Payload, max_chars: usize) -> String {
    let rendered = Value::Object(payload.clone()).to_string();
    if rendered.chars().count() <= max_chars {
        rendered
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = rendered.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn render_value(value: Option<&Value>) -> String {
    value.map_or_else(|| "(absent)".to_string(), Value::to_string)
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}
