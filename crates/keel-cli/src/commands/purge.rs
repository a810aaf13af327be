use std::path::Path;

use keel_core::util::{days_before, unix_millis_now};

use crate::commands::common::open_store;
use crate::error::CliError;

pub async fn run_purge(older_than_days: u32, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let before = days_before(unix_millis_now(), older_than_days);
    tracing::debug!("Purging sync history created before {before} ({older_than_days} day(s) back)");

    let changes = store.purge_synced(before).await?;
    let conflicts = store.purge_resolved(before).await?;
    println!("Purged {changes} synced changes and {conflicts} resolved conflicts");
    Ok(())
}
