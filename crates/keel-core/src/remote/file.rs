//! Remote authority persisted in a JSON file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::RemoteState;
use crate::error::{Error, Result};
use crate::models::{Change, Payload, PullResponse, PushResult, RemoteEntity, SyncCursor};
use crate::sync::ProtocolClient;

/// Remote authority stored at `path`.
///
/// Every call loads the file, applies the request and writes it back through
/// a temporary file and rename. Calls are not serialized across processes.
#[derive(Debug, Clone)]
pub struct FileRemote {
    path: PathBuf,
}

impl FileRemote {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write fields as another device would.
    pub fn write(&self, entity_type: &str, entity_id: &str, fields: &Payload) -> Result<RemoteEntity> {
        let mut state = self.load()?;
        let entity = state.write(entity_type, entity_id, fields);
        self.save(&state)?;
        Ok(entity)
    }

    pub fn entity(&self, entity_type: &str, entity_id: &str) -> Result<Option<RemoteEntity>> {
        Ok(self.load()?.entity(entity_type, entity_id))
    }

    fn load(&self) -> Result<RemoteState> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|error| {
                Error::ServerRejected(format!(
                    "remote state at {} is unreadable: {error}",
                    self.path.display()
                ))
            }),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(RemoteState::default()),
            Err(error) => Err(self.unreachable(&error)),
        }
    }

    fn save(&self, state: &RemoteState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|error| self.unreachable(&error))?;
        }
        let temp = self.path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(state)?;
        fs::write(&temp, raw).map_err(|error| self.unreachable(&error))?;
        fs::rename(&temp, &self.path).map_err(|error| self.unreachable(&error))?;
        Ok(())
    }

    fn unreachable(&self, error: &std::io::Error) -> Error {
        Error::Network(format!("remote at {} unreachable: {error}", self.path.display()))
    }
}

impl ProtocolClient for FileRemote {
    async fn ping(&self) -> Result<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => {
                Err(Error::Network(format!(
                    "remote directory {} does not exist",
                    parent.display()
                )))
            }
            _ => Ok(()),
        }
    }

    async fn push(&self, changes: &[Change]) -> Result<Vec<PushResult>> {
        let mut state = self.load()?;
        let results = changes
            .iter()
            .map(|change| state.apply(change))
            .collect::<Vec<_>>();
        self.save(&state)?;
        Ok(results)
    }

    async fn pull(&self, cursor: Option<&SyncCursor>) -> Result<PullResponse> {
        self.load()?.changes_since(cursor)
    }
}
