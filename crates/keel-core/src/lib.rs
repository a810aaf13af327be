//! keel-core - Core library for Keel
//!
//! This crate contains the change log, conflict store, device registry and
//! sync coordinator shared by every Keel client. Local mutations are queued
//! durably, pushed to a remote authority when connectivity allows, and
//! divergent edits are either merged automatically or filed as conflicts for
//! explicit resolution.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod services;
pub mod state;
pub mod sync;
pub mod util;

pub use config::SyncConfig;
pub use error::{Error, Result};
pub use models::{Change, ChangeId, ConflictId, ConflictRecord, Payload};
pub use services::SyncStore;
pub use state::SyncState;
pub use sync::SyncCoordinator;
