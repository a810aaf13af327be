//! Shared services used across clients.

mod sync_store;

pub use sync_store::SyncStore;
