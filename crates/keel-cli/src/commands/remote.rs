use std::path::Path;

use keel_core::remote::FileRemote;

use crate::commands::common::parse_assignments;
use crate::error::CliError;

pub fn run_remote_set(
    entity_type: &str,
    entity_id: &str,
    assignments: &[String],
    remote_path: &Path,
) -> Result<(), CliError> {
    let fields = parse_assignments(assignments)?;
    let entity = FileRemote::new(remote_path).write(entity_type, entity_id, &fields)?;
    println!("{}  version={}", entity.key(), entity.version);
    Ok(())
}

pub fn run_remote_show(
    entity_type: &str,
    entity_id: &str,
    remote_path: &Path,
) -> Result<(), CliError> {
    let entity = FileRemote::new(remote_path)
        .entity(entity_type, entity_id)?
        .ok_or_else(|| CliError::EntityNotFound(format!("{entity_type}/{entity_id}")))?;
    println!("{}", serde_json::to_string_pretty(&entity)?);
    Ok(())
}
