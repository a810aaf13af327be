use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Queue, sync and reconcile local entity changes")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Shared remote state file (defaults to KEEL_REMOTE_PATH)
    #[arg(long, global = true, value_name = "PATH")]
    pub remote: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Queue and manage local changes
    Change {
        #[command(subcommand)]
        command: ChangeCommands,
    },
    /// Inspect entities as this device sees them
    Entity {
        #[command(subcommand)]
        command: EntityCommands,
    },
    /// Run one sync cycle against the remote
    Sync {
        /// Keep syncing at KEEL_SYNC_INTERVAL_SECS (default 60) until Ctrl-C
        #[arg(long)]
        watch: bool,

        #[command(subcommand)]
        command: Option<SyncCommands>,
    },
    /// List, inspect and resolve sync conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Show this device's identity
    Device {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write to the remote directly, as another device would
    Remote {
        #[command(subcommand)]
        command: RemoteCommands,
    },
    /// Delete synced changes and resolved conflicts older than a cutoff
    Purge {
        /// Age cutoff in days
        #[arg(long, default_value = "30", value_name = "DAYS")]
        older_than_days: u32,
    },
}

#[derive(Subcommand)]
pub enum ChangeCommands {
    /// Queue a change to an entity
    Add {
        /// Entity type, e.g. "goal"
        entity_type: String,
        /// Entity ID
        entity_id: String,
        /// Field assignment; VALUE is parsed as JSON, falling back to a string
        #[arg(long = "set", value_name = "FIELD=VALUE", required = true)]
        assignments: Vec<String>,
        /// Remote version the change is based on (defaults to the last synced version)
        #[arg(long, value_name = "VERSION")]
        base: Option<String>,
    },
    /// List queued and synced changes
    List {
        /// Only show changes in this state (pending, in_flight, synced, failed)
        #[arg(long)]
        state: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Return a failed change to the queue with a fresh retry budget
    Retry {
        /// Change ID or unique ID prefix
        id: String,
    },
    /// Drop a pending or failed change
    Discard {
        /// Change ID or unique ID prefix
        id: String,
    },
}

#[derive(Subcommand)]
pub enum EntityCommands {
    /// Show the last synced state overlaid with queued changes
    Show {
        entity_type: String,
        entity_id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Show pending work, conflicts and connectivity
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List conflicts (unresolved only unless --all)
    List {
        /// Filter by entity type
        #[arg(long, value_name = "TYPE")]
        entity_type: Option<String>,
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the disputed fields of one conflict
    Show {
        /// Conflict ID or unique ID prefix
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Summarize conflict history
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a conflict and queue the result for the next sync
    #[command(group(
        ArgGroup::new("strategy")
            .required(true)
            .args(["local", "server", "pick"])
    ))]
    Resolve {
        /// Conflict ID or unique ID prefix
        id: String,
        /// Keep this device's version
        #[arg(long)]
        local: bool,
        /// Keep the remote version
        #[arg(long)]
        server: bool,
        /// Choose a side for one disputed field
        #[arg(long, value_name = "FIELD=local|server")]
        pick: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum RemoteCommands {
    /// Overwrite fields of a remote entity
    Set {
        entity_type: String,
        entity_id: String,
        /// Field assignment; VALUE is parsed as JSON, falling back to a string
        #[arg(long = "set", value_name = "FIELD=VALUE", required = true)]
        assignments: Vec<String>,
    },
    /// Show a remote entity
    Show {
        entity_type: String,
        entity_id: String,
    },
}
