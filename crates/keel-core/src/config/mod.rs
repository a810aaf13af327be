//! Sync configuration.
//!
//! `SyncConfig` carries the knobs of the coordinator and the change log. It
//! can be built in code with the builder-style setters or read from `KEEL_*`
//! environment variables.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::util::normalize_text_option;

const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_CLAIM_BATCH_SIZE: usize = 50;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STALL_TIMEOUT_SECS: u64 = 120;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;

/// Coordinator and change log configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Failed pushes allowed before a change becomes permanently FAILED
    pub max_retries: u32,
    /// Upper bound on changes claimed per cycle
    pub claim_batch_size: usize,
    /// Timeout applied to every push/pull/ping call
    pub call_timeout: Duration,
    /// Time without progress after which a cycle counts as stalled
    pub stall_timeout: Duration,
    /// Interval for `SyncCoordinator::start_periodic` (None: manual sync only)
    pub sync_interval: Option<Duration>,
    /// Device name used when the device is first registered
    pub device_name: Option<String>,
    /// Numeric fields compared within an absolute tolerance
    pub tolerant_fields: BTreeMap<String, f64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            claim_batch_size: DEFAULT_CLAIM_BATCH_SIZE,
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            stall_timeout: Duration::from_secs(DEFAULT_STALL_TIMEOUT_SECS),
            sync_interval: None,
            device_name: None,
            tolerant_fields: BTreeMap::new(),
        }
    }
}

impl SyncConfig {
    /// Read configuration from `KEEL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    /// Read configuration through an arbitrary lookup (testable without env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = parse_number::<u32>(&lookup, "KEEL_MAX_RETRIES")? {
            config.max_retries = value;
        }
        if let Some(value) = parse_number::<usize>(&lookup, "KEEL_CLAIM_BATCH_SIZE")? {
            config.claim_batch_size = value;
        }
        if let Some(value) = parse_number::<u64>(&lookup, "KEEL_CALL_TIMEOUT_SECS")? {
            config.call_timeout = Duration::from_secs(value);
        }
        if let Some(value) = parse_number::<u64>(&lookup, "KEEL_STALL_TIMEOUT_SECS")? {
            config.stall_timeout = Duration::from_secs(value);
        }
        if let Some(value) = parse_number::<u64>(&lookup, "KEEL_SYNC_INTERVAL_SECS")? {
            config.sync_interval = (value > 0).then(|| Duration::from_secs(value));
        }
        config.device_name = normalize_text_option(lookup("KEEL_DEVICE_NAME"));
        if let Some(raw) = normalize_text_option(lookup("KEEL_TOLERANT_FIELDS")) {
            config.tolerant_fields = parse_tolerant_fields(&raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the coordinator cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be at least 1".into()));
        }
        if self.claim_batch_size == 0 {
            return Err(Error::Config("claim_batch_size must be at least 1".into()));
        }
        if self.call_timeout.is_zero() {
            return Err(Error::Config("call_timeout must be positive".into()));
        }
        if self.stall_timeout.is_zero() {
            return Err(Error::Config("stall_timeout must be positive".into()));
        }
        Ok(())
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub const fn with_claim_batch_size(mut self, size: usize) -> Self {
        self.claim_batch_size = size;
        self
    }

    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Enable periodic sync (default interval: 60 seconds)
    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    #[must_use]
    pub const fn with_default_sync_interval(self) -> Self {
        self.with_sync_interval(Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS))
    }

    #[must_use]
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = normalize_text_option(Some(name.into()));
        self
    }

    #[must_use]
    pub fn with_tolerant_field(mut self, field: impl Into<String>, tolerance: f64) -> Self {
        self.tolerant_fields.insert(field.into(), tolerance.abs());
        self
    }
}

// ---------------------------------------------------------------------------
// Private
// ---------------------------------------------------------------------------

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    let Some(raw) = normalize_text_option(lookup(name)) else {
        return Ok(None);
    };
    raw.parse::<T>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{name} must be a non-negative integer, got '{raw}'")))
}

fn parse_tolerant_fields(raw: &str) -> Result<BTreeMap<String, f64>> {
    let mut fields = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let (field, tolerance) = entry.split_once(':').ok_or_else(|| {
            Error::Config(format!(
                "KEEL_TOLERANT_FIELDS entry '{entry}' must look like field:tolerance"
            ))
        })?;
        let field = field.trim();
        if field.is_empty() {
            return Err(Error::Config(
                "KEEL_TOLERANT_FIELDS entry has an empty field name".into(),
            ));
        }
        let tolerance = tolerance.trim().parse::<f64>().map_err(|_| {
            Error::Config(format!(
                "KEEL_TOLERANT_FIELDS tolerance for '{field}' is not a number"
            ))
        })?;
        if !tolerance.is_finite() {
            return Err(Error::Config(format!(
                "KEEL_TOLERANT_FIELDS tolerance for '{field}' must be finite"
            )));
        }
        fields.insert(field.to_string(), tolerance.abs());
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect::<HashMap<_, _>>();
        move |name| values.get(name).cloned()
    }

    #[test]
    fn empty_lookup_yields_defaults() {
        let config = SyncConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.max_retries, 5);
        assert!(config.sync_interval.is_none());
    }

    #[test]
    fn reads_overrides() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("KEEL_MAX_RETRIES", "3"),
            ("KEEL_CLAIM_BATCH_SIZE", "10"),
            ("KEEL_CALL_TIMEOUT_SECS", "5"),
            ("KEEL_SYNC_INTERVAL_SECS", "15"),
            ("KEEL_DEVICE_NAME", "  laptop  "),
            ("KEEL_TOLERANT_FIELDS", "progress:0.01, estimate:0.5"),
        ]))
        .unwrap();

        assert_eq!(config.max_retries, 3);
        assert_eq!(config.claim_batch_size, 10);
        assert_eq!(config.call_timeout, Duration::from_secs(5));
        assert_eq!(config.sync_interval, Some(Duration::from_secs(15)));
        assert_eq!(config.device_name.as_deref(), Some("laptop"));
        assert_eq!(config.tolerant_fields.get("progress"), Some(&0.01));
        assert_eq!(config.tolerant_fields.get("estimate"), Some(&0.5));
    }

    #[test]
    fn zero_interval_disables_periodic_sync() {
        let config =
            SyncConfig::from_lookup(lookup_from(&[("KEEL_SYNC_INTERVAL_SECS", "0")])).unwrap();
        assert!(config.sync_interval.is_none());
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(SyncConfig::from_lookup(lookup_from(&[("KEEL_MAX_RETRIES", "many")])).is_err());
        assert!(SyncConfig::from_lookup(lookup_from(&[("KEEL_MAX_RETRIES", "0")])).is_err());
        assert!(
            SyncConfig::from_lookup(lookup_from(&[("KEEL_TOLERANT_FIELDS", "progress")])).is_err()
        );
    }
}
