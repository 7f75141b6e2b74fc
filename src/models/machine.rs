//! Machine record mirrored from the remote authority.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Origin of a shutdown request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownSource {
    /// Remote authority invoked `request-shutdown`.
    Remote,
    /// Local control surface `/stop`.
    Local,
    /// SIGINT / SIGTERM.
    OsSignal,
    /// Panic or internal consistency failure.
    Exception,
}

/// Daemon status as published to the remote authority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DaemonStatus {
    /// Accepting work.
    Running,
    /// Shutdown sequence in progress.
    ShuttingDown,
    /// No daemon is running on the machine.
    Offline,
}

/// Dynamic daemon state (`daemonState` field of the machine record).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonState {
    /// Current status.
    pub status: DaemonStatus,
    /// Daemon pid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Control surface port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    /// Start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When shutdown was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_requested_at: Option<DateTime<Utc>>,
    /// Who requested shutdown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_source: Option<ShutdownSource>,
}

impl DaemonState {
    /// State for a daemon that just reached `running`.
    #[must_use]
    pub fn running(pid: u32, http_port: u16, started_at: DateTime<Utc>) -> Self {
        Self {
            status: DaemonStatus::Running,
            pid: Some(pid),
            http_port: Some(http_port),
            started_at: Some(started_at),
            shutdown_requested_at: None,
            shutdown_source: None,
        }
    }

    /// Copy of `self` marked as shutting down.
    #[must_use]
    pub fn shutting_down(&self, source: ShutdownSource, at: DateTime<Utc>) -> Self {
        Self {
            status: DaemonStatus::ShuttingDown,
            shutdown_requested_at: Some(at),
            shutdown_source: Some(source),
            ..self.clone()
        }
    }
}

/// Static-ish machine identity (`metadata` field of the machine record).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineMetadata {
    /// Host name.
    pub host: String,
    /// Operating system.
    pub platform: String,
    /// Daemon version.
    pub cli_version: String,
    /// User home directory.
    pub home_dir: String,
    /// Daemon home directory.
    pub steward_home_dir: String,
}

impl MachineMetadata {
    /// Describe the current machine.
    #[must_use]
    pub fn current(version: &str, steward_home: &Path) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "unknown".to_owned());
        Self {
            host,
            platform: std::env::consts::OS.to_owned(),
            cli_version: version.to_owned(),
            home_dir: std::env::var("HOME").unwrap_or_default(),
            steward_home_dir: steward_home.display().to_string(),
        }
    }
}

/// A value paired with the authority's version counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Versioned<T> {
    /// Last known value.
    pub value: T,
    /// Version the authority assigned to `value`.
    pub version: u64,
}

impl<T> Versioned<T> {
    /// Pair `value` with `version`.
    pub fn new(value: T, version: u64) -> Self {
        Self { value, version }
    }
}
