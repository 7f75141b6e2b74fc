//! Tracked session model.

use serde::{Deserialize, Serialize};

use crate::process;

/// Who launched a tracked session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartedBy {
    /// Launched by this daemon's spawner.
    Daemon,
    /// Launched independently and announced through the self-report webhook.
    External,
}

/// Metadata a session process reports about itself.
///
/// Only `host_pid` is interpreted by the daemon; every other field is kept
/// verbatim so list snapshots can echo it back.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    /// OS pid of the reporting process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_pid: Option<u32>,
    /// Working directory of the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Self-described launcher (`daemon` or `terminal`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_by: Option<String>,
    /// Remaining self-described fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Signal-only handle to a daemon-spawned child.
///
/// The child's `tokio::process::Child` is owned by its exit monitor so it
/// can be reaped; the registry entry keeps this handle to deliver
/// termination signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildHandle {
    pid: u32,
}

impl ChildHandle {
    /// Wrap the pid of a child this daemon spawned.
    #[must_use]
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    /// Process id of the child.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Ask the child to terminate (`SIGTERM`).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the signal cannot be delivered.
    pub fn terminate(&self) -> crate::Result<()> {
        process::terminate(self.pid)
    }
}

/// A child agent process the daemon knows about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackedSession {
    /// OS process id; primary key within the registry.
    pub pid: u32,
    /// Launcher of the process.
    pub started_by: StartedBy,
    /// Identifier assigned once the process reports itself.
    pub remote_session_id: Option<String>,
    /// Present only for daemon-spawned children.
    #[serde(skip)]
    pub child: Option<ChildHandle>,
    /// Whether the spawner created the working directory.
    #[serde(default)]
    pub directory_was_created: bool,
    /// Informational note recorded at spawn time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    /// Metadata from the most recent self-report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SessionMetadata>,
}

impl TrackedSession {
    /// New entry for a child this daemon just launched.
    #[must_use]
    pub fn spawned(pid: u32, directory_was_created: bool) -> Self {
        Self {
            pid,
            started_by: StartedBy::Daemon,
            remote_session_id: None,
            child: Some(ChildHandle::new(pid)),
            directory_was_created,
            user_message: directory_was_created
                .then(|| "The session directory was created by the daemon.".to_owned()),
            metadata: None,
        }
    }

    /// New entry for an independently launched process that reported itself.
    #[must_use]
    pub fn external(pid: u32, remote_session_id: String, metadata: SessionMetadata) -> Self {
        Self {
            pid,
            started_by: StartedBy::External,
            remote_session_id: Some(remote_session_id),
            child: None,
            directory_was_created: false,
            user_message: None,
            metadata: Some(metadata),
        }
    }

    /// Identifier used by stop requests when no remote id is known yet.
    #[must_use]
    pub fn fallback_id(&self) -> String {
        format!("PID-{}", self.pid)
    }
}
