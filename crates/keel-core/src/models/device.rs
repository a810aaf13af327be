//! Local device identity

use serde::{Deserialize, Serialize};

/// Identity of this device, generated once and persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
    pub platform: String,
}

/// Platform label for the running build
#[must_use]
pub fn current_platform() -> String {
    std::env::consts::OS.to_string()
}

/// Default device name when none is configured
#[must_use]
pub fn default_device_name() -> String {
    format!("{}-device", std::env::consts::OS)
}
