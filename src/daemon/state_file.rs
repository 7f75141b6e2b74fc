//! Durable JSON snapshot of the running daemon's identity.
//!
//! The record doubles as the "is a daemon running" signal for local clients
//! and as an operator-visible heartbeat log.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Persisted daemon state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonPersistedState {
    /// Daemon pid.
    pub pid: u32,
    /// Loopback control port.
    pub http_port: u16,
    /// Start time (RFC 3339).
    pub start_time: String,
    /// Version the daemon was started as.
    pub started_with_cli_version: String,
    /// Most recent heartbeat (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<String>,
    /// Log file of the daemon.
    pub daemon_log_path: String,
}

/// Reads and writes the state record at a fixed path.
#[derive(Debug, Clone)]
pub struct DaemonStateStore {
    path: PathBuf,
}

impl DaemonStateStore {
    /// Store backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the record.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize `state` and atomically replace the record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::State` if the temporary file cannot be written or
    /// renamed into place.
    pub fn write(&self, state: &DaemonPersistedState) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| AppError::State(format!("{} has no parent", self.path.display())))?;
        fs::create_dir_all(dir)
            .map_err(|err| AppError::State(format!("failed to create {}: {err}", dir.display())))?;

        let body = serde_json::to_vec_pretty(state)
            .map_err(|err| AppError::State(format!("failed to serialize state: {err}")))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|err| AppError::State(format!("failed to create temp state file: {err}")))?;
        tmp.write_all(&body)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|err| AppError::State(format!("failed to write temp state file: {err}")))?;
        tmp.persist(&self.path)
            .map_err(|err| AppError::State(format!("failed to replace state file: {err}")))?;

        debug!(path = %self.path.display(), pid = state.pid, "daemon state written");
        Ok(())
    }

    /// Read the record. Absent or unparseable means "no daemon".
    #[must_use]
    pub fn read(&self) -> Option<DaemonPersistedState> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(%err, path = %self.path.display(), "failed to read daemon state");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(%err, path = %self.path.display(), "ignoring unparseable daemon state");
                None
            }
        }
    }

    /// Remove the record. Already absent is not an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::State` if the record exists but cannot be removed.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::State(format!(
                "failed to remove {}: {err}",
                self.path.display()
            ))),
        }
    }
}
