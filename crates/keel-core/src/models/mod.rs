//! Data models for Keel

mod change;
mod conflict;
mod device;
mod merge;
mod payload;
mod remote;
mod summary;
mod version;

pub use change::{Change, ChangeId, ChangeState, EntityKey};
pub use conflict::{ConflictId, ConflictRecord, ConflictStats, FieldChoice, FieldDiff, Resolution};
pub use device::{current_platform, default_device_name, DeviceInfo};
pub use merge::MergeResult;
pub use payload::{field_equal, field_union, overlay, payload_from_value, values_equal, Payload};
pub use remote::{PullResponse, PushResult, RemoteEntity};
pub use summary::{SyncReport, SyncStats, SyncSummary};
pub use version::{SyncCursor, Version};
