//! Sync engine: conflict detection, resolution and the cycle coordinator.

mod coordinator;
pub mod detector;
mod locks;
mod protocol;
pub mod resolution;
mod status;


pub use coordinator::SyncCoordinator;
pub use detector::{ConflictDetector, Detection};
pub use locks::EntityLocks;
pub use protocol::{EntitySnapshotProvider, ProtocolClient};
pub use status::TriggerOutcome;
