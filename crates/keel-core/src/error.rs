//! Error types for keel-core

use thiserror::Error;

/// Result type alias using keel-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in keel-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input, never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transport failure or timeout talking to the remote authority
    #[error("Network error: {0}")]
    Network(String),

    /// Remote authority refused our credentials
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Remote authority rejected the request as a whole
    #[error("Server rejected request: {0}")]
    ServerRejected(String),

    /// Change moved to FAILED after exhausting its retries
    #[error("Change {change_id} failed permanently after {attempts} attempts")]
    RetryExhausted { change_id: String, attempts: u32 },

    /// Conflict already carries a resolution
    #[error("Conflict already resolved: {0}")]
    AlreadyResolved(String),

    /// Manual resolution did not cover every disputed field
    #[error("Selection is missing disputed fields: {}", missing.join(", "))]
    IncompleteSelection { missing: Vec<String> },

    /// Change or conflict not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// SQLite error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Failures of the remote call itself. A failed push of this kind counts
    /// against the retry budget of every change in the batch.
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Auth(_) | Self::ServerRejected(_)
        )
    }
}
