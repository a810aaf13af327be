//! Device registry repository

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::{current_platform, default_device_name, DeviceInfo, SyncCursor};
use crate::util::{normalize_text_option, unix_millis_now};

const CURSOR_KEY: &str = "sync_cursor";

/// Trait for device identity and sync cursor storage
pub trait DeviceRegistry {
    /// Identity of this device; generated on first use, stable afterwards
    fn local_device(&self) -> Result<DeviceInfo>;

    /// Cursor of the last successful pull
    fn cursor(&self) -> Result<Option<SyncCursor>>;

    fn set_cursor(&self, cursor: &SyncCursor) -> Result<()>;
}

/// `SQLite` implementation of `DeviceRegistry`
pub struct SqliteDeviceRegistry<'a> {
    conn: &'a Connection,
    device_name: Option<String>,
}

impl<'a> SqliteDeviceRegistry<'a> {
    /// Create a new registry with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            device_name: None,
        }
    }

    /// Name used if the device has not been registered yet
    #[must_use]
    pub fn with_device_name(mut self, name: Option<String>) -> Self {
        self.device_name = normalize_text_option(name);
        self
    }

    fn load(&self) -> Result<Option<DeviceInfo>> {
        let device = self
            .conn
            .query_row(
                "SELECT device_id, device_name, platform FROM device WHERE id = 1",
                [],
                |row| {
                    Ok(DeviceInfo {
                        device_id: row.get(0)?,
                        device_name: row.get(1)?,
                        platform: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(device)
    }
}

impl DeviceRegistry for SqliteDeviceRegistry<'_> {
    fn local_device(&self) -> Result<DeviceInfo> {
        if let Some(device) = self.load()? {
            return Ok(device);
        }

        let device_id = uuid::Uuid::now_v7().to_string();
        let device_name = self
            .device_name
            .clone()
            .unwrap_or_else(default_device_name);
        let now = unix_millis_now();

        // A concurrent first registration keeps whichever row landed first
        self.conn.execute(
            "INSERT OR IGNORE INTO device (id, device_id, device_name, platform, created_at)
             VALUES (1, ?1, ?2, ?3, ?4)",
            params![device_id, device_name, current_platform(), now],
        )?;

        let device = self.load()?.ok_or_else(|| {
            crate::Error::NotFound("device row missing after registration".into())
        })?;
        tracing::info!(
            "Registered local device {} ({})",
            device.device_id,
            device.device_name
        );
        Ok(device)
    }

    fn cursor(&self) -> Result<Option<SyncCursor>> {
        let cursor = self
            .conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                [CURSOR_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(cursor.map(SyncCursor::new))
    }

    fn set_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
            [CURSOR_KEY, cursor.as_str()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_device_is_generated_once() {
        let db = setup();
        let registry =
            SqliteDeviceRegistry::new(db.connection()).with_device_name(Some("laptop".into()));

        let first = registry.local_device().unwrap();
        assert_eq!(first.device_name, "laptop");
        assert_eq!(first.platform, std::env::consts::OS);

        // A different configured name never regenerates an existing device
        let renamed =
            SqliteDeviceRegistry::new(db.connection()).with_device_name(Some("phone".into()));
        assert_eq!(renamed.local_device().unwrap(), first);
    }

    #[test]
    fn test_default_device_name() {
        let db = setup();
        let registry = SqliteDeviceRegistry::new(db.connection()).with_device_name(Some("  ".into()));
        let device = registry.local_device().unwrap();
        assert_eq!(device.device_name, default_device_name());
    }

    #[test]
    fn test_cursor_round_trip() {
        let db = setup();
        let registry = SqliteDeviceRegistry::new(db.connection());

        assert!(registry.cursor().unwrap().is_none());
        registry.set_cursor(&SyncCursor::new("42")).unwrap();
        registry.set_cursor(&SyncCursor::new("43")).unwrap();
        assert_eq!(registry.cursor().unwrap(), Some(SyncCursor::new("43")));
    }
}
