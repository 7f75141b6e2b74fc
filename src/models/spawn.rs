//! Spawn request options and the tagged spawn outcome.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Agent flavor, deciding how auth material reaches the child.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentFlavor {
    /// Token exported as an OAuth environment variable.
    #[default]
    Claude,
    /// Token written to an `auth.json` inside a private home directory.
    Codex,
}

/// Parameters for a spawn request, shared by the control surface and the
/// remote RPC path.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpawnOptions {
    /// Working directory for the session.
    pub directory: PathBuf,
    /// Existing remote session to resume, if any.
    #[serde(default, rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub remote_session_id: Option<String>,
    /// Caller approved creating `directory` when it does not exist.
    #[serde(default)]
    pub approved_new_directory_creation: bool,
    /// Agent flavor.
    #[serde(default)]
    pub agent: AgentFlavor,
    /// Auth token injected for the flavor; always overrides caller variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Extra environment variables for the child.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment_variables: HashMap<String, String>,
}

impl SpawnOptions {
    /// Options for `directory` with every other field defaulted.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }
}

/// Outcome of a spawn request.
///
/// Asking for directory approval is a distinct outcome, not an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SpawnResult {
    /// The child reported itself under `session_id`.
    #[serde(rename_all = "camelCase")]
    Success {
        /// Remote session id reported by the child.
        session_id: String,
    },
    /// The spawn failed with a human-readable message.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Message suitable for showing to the requester.
        error_message: String,
    },
    /// The directory is missing and creating it needs approval.
    #[serde(rename_all = "camelCase")]
    RequestToApproveDirectoryCreation {
        /// Directory that would be created.
        directory: PathBuf,
    },
}

impl SpawnResult {
    /// Shorthand for the error variant.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error_message: message.into(),
        }
    }
}
