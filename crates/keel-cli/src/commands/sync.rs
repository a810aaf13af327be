use std::path::Path;

use keel_core::models::{SyncReport, SyncSummary};
use keel_core::SyncConfig;
use serde::Serialize;

use crate::commands::common::{format_timestamp, open_coordinator, open_coordinator_with};
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct SyncStatusView {
    remote: String,
    online: bool,
    cursor: Option<String>,
    #[serde(flatten)]
    summary: SyncSummary,
}

pub async fn run_sync(db_path: &Path, remote_path: &Path) -> Result<(), CliError> {
    let coordinator = open_coordinator(db_path, remote_path).await?;
    if !coordinator.check_connectivity().await {
        return Err(CliError::RemoteUnreachable(remote_path.display().to_string()));
    }

    let Some(report) = coordinator.sync_now().await? else {
        return Err(CliError::SyncInProgress);
    };
    tracing::debug!(
        "Synced {} against {}",
        db_path.display(),
        remote_path.display()
    );
    println!("{}", format_sync_report(&report));

    let summary = coordinator.get_summary().await?;
    if let Some(warning) = summary.last_error {
        println!("Warning: {warning}");
    }
    if summary.unresolved_conflicts > 0 {
        println!(
            "{} unresolved conflict(s); run `keel conflicts list`",
            summary.unresolved_conflicts
        );
    }
    Ok(())
}

/// Sync in the background at the configured interval until interrupted.
pub async fn run_sync_watch(db_path: &Path, remote_path: &Path) -> Result<(), CliError> {
    let config = watch_config(SyncConfig::from_env()?);
    let coordinator = open_coordinator_with(db_path, remote_path, config).await?;
    let handle = coordinator.start_periodic().ok_or_else(|| {
        keel_core::Error::Config("periodic sync needs a sync interval".into())
    })?;

    println!("Watching {} (Ctrl-C to stop)", remote_path.display());
    tokio::signal::ctrl_c().await?;
    handle.abort();

    let summary = coordinator.get_summary().await?;
    let stats = coordinator.get_stats();
    tracing::info!(
        "Stopped watching after {} completed cycle(s)",
        stats.cycles_completed
    );
    println!(
        "Stopped: {} pending, {} unresolved conflict(s)",
        summary.pending_count, summary.unresolved_conflicts
    );
    Ok(())
}

/// Watching without a configured interval falls back to the default one.
pub fn watch_config(config: SyncConfig) -> SyncConfig {
    if config.sync_interval.is_some() {
        config
    } else {
        config.with_default_sync_interval()
    }
}

pub async fn run_sync_status(
    as_json: bool,
    db_path: &Path,
    remote_path: &Path,
) -> Result<(), CliError> {
    let coordinator = open_coordinator(db_path, remote_path).await?;
    let online = coordinator.check_connectivity().await;
    let cursor = coordinator.store().cursor().await?;
    let summary = coordinator.get_summary().await?;

    let view = SyncStatusView {
        remote: remote_path.display().to_string(),
        online,
        cursor: cursor.map(|cursor| cursor.to_string()),
        summary,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    let summary = &view.summary;
    println!("Device:     {} ({})", summary.device_name, summary.device_id);
    println!("Remote:     {}", view.remote);
    println!("State:      {}", summary.sync_state);
    println!("Pending:    {}", summary.pending_count);
    println!("Conflicts:  {}", summary.unresolved_conflicts);
    println!("Cursor:     {}", view.cursor.as_deref().unwrap_or("-"));
    if let Some(last_sync_at) = summary.last_sync_at {
        println!("Last sync:  {}", format_timestamp(last_sync_at));
    }
    if let Some(error) = &summary.last_error {
        println!("Last error: {error}");
    }
    Ok(())
}

pub fn format_sync_report(report: &SyncReport) -> String {
    let mut line = format!(
        "Sync completed: pushed {}, auto-merged {}, conflicts {}, pulled {}",
        report.pushed, report.auto_merged, report.conflicts, report.pulled
    );
    if report.failed > 0 || report.exhausted > 0 {
        line.push_str(&format!(
            ", failed {}, exhausted {}",
            report.failed, report.exhausted
        ));
    }
    line
}
