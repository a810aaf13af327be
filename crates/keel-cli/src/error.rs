use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] keel_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid assignment '{0}', expected FIELD=VALUE")]
    InvalidAssignment(String),
    #[error("Field '{0}' is assigned more than once")]
    DuplicateField(String),
    #[error("At least one --set FIELD=VALUE is required")]
    EmptyPayload,
    #[error("{kind} ID cannot be empty")]
    EmptyId { kind: &'static str },
    #[error("{kind} not found for id/prefix: {query}")]
    NotFound { kind: &'static str, query: String },
    #[error("{0}")]
    AmbiguousId(String),
    #[error("Entity {0} has no local state")]
    EntityNotFound(String),
    #[error("Remote at {0} is unreachable; local changes stay queued")]
    RemoteUnreachable(String),
    #[error("A sync cycle is already running for this database")]
    SyncInProgress,
}
