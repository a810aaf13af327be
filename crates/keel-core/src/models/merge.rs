//! Merge result model

use serde::{Deserialize, Serialize};

use super::conflict::Resolution;
use super::payload::Payload;

/// Output of a resolution action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub success: bool,
    /// Strategy used; never `Resolution::None`
    pub strategy: Resolution,
    /// Entity fields after the merge
    pub merged_data: Payload,
    /// Fields decided by a manual per-field choice, sorted (manual strategy only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_fields: Option<Vec<String>>,
}
