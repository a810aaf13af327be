//! Keel CLI - drive the local change queue and sync from the terminal
//!
//! Each invocation opens the local database, does one thing and exits. The
//! remote authority is a JSON file, so two databases pointed at the same
//! `--remote` behave like two devices.

mod cli;
mod commands;
mod error;

#[cfg(test)]
mod tests;

use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use crate::cli::{
    ChangeCommands, Cli, Commands, ConflictCommands, EntityCommands, RemoteCommands, SyncCommands,
};
use crate::commands::change::{run_change_add, run_change_discard, run_change_list, run_change_retry};
use crate::commands::common::{resolve_db_path, resolve_remote_path};
use crate::commands::conflicts::{
    run_conflicts_list, run_conflicts_resolve, run_conflicts_show, run_conflicts_stats,
    ResolveChoice,
};
use crate::commands::device::run_device;
use crate::commands::entity::run_entity_show;
use crate::commands::purge::run_purge;
use crate::commands::remote::{run_remote_set, run_remote_show};
use crate::commands::sync::{run_sync, run_sync_status, run_sync_watch};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("keel=info,keel_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);
    let remote_path = resolve_remote_path(cli.remote);

    match cli.command {
        Some(Commands::Change { command }) => match command {
            ChangeCommands::Add {
                entity_type,
                entity_id,
                assignments,
                base,
            } => {
                run_change_add(
                    &entity_type,
                    &entity_id,
                    &assignments,
                    base.as_deref(),
                    &db_path,
                )
                .await?;
            }
            ChangeCommands::List { state, json } => {
                run_change_list(state.as_deref(), json, &db_path).await?;
            }
            ChangeCommands::Retry { id } => run_change_retry(&id, &db_path).await?,
            ChangeCommands::Discard { id } => run_change_discard(&id, &db_path).await?,
        },
        Some(Commands::Entity { command }) => match command {
            EntityCommands::Show {
                entity_type,
                entity_id,
                json,
            } => run_entity_show(&entity_type, &entity_id, json, &db_path).await?,
        },
        Some(Commands::Sync { watch, command }) => match command {
            None if watch => run_sync_watch(&db_path, &remote_path).await?,
            None => run_sync(&db_path, &remote_path).await?,
            Some(SyncCommands::Status { json }) => {
                run_sync_status(json, &db_path, &remote_path).await?;
            }
        },
        Some(Commands::Conflicts { command }) => match command {
            ConflictCommands::List {
                entity_type,
                all,
                json,
            } => run_conflicts_list(entity_type.as_deref(), all, json, &db_path).await?,
            ConflictCommands::Show { id, json } => run_conflicts_show(&id, json, &db_path).await?,
            ConflictCommands::Stats { json } => run_conflicts_stats(json, &db_path).await?,
            ConflictCommands::Resolve {
                id,
                local,
                server,
                pick,
            } => {
                let choice = ResolveChoice::from_flags(local, server, &pick)?;
                run_conflicts_resolve(&id, &choice, &db_path, &remote_path).await?;
            }
        },
        Some(Commands::Device { json }) => run_device(json, &db_path).await?,
        Some(Commands::Remote { command }) => match command {
            RemoteCommands::Set {
                entity_type,
                entity_id,
                assignments,
            } => run_remote_set(&entity_type, &entity_id, &assignments, &remote_path)?,
            RemoteCommands::Show {
                entity_type,
                entity_id,
            } => run_remote_show(&entity_type, &entity_id, &remote_path)?,
        },
        Some(Commands::Purge { older_than_days }) => run_purge(older_than_days, &db_path).await?,
        None => {
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
