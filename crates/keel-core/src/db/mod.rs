//! Database layer for Keel

mod change_log;
mod columns;
mod conflict_store;
mod connection;
mod device_registry;
mod migrations;
mod snapshot_repository;

pub use change_log::{ChangeLog, SqliteChangeLog};
pub use conflict_store::{ConflictStore, SqliteConflictStore};
pub use connection::Database;
pub use device_registry::{DeviceRegistry, SqliteDeviceRegistry};
pub use snapshot_repository::SqliteSnapshotRepository;
