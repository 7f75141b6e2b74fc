//! Child environment assembly and directory preparation for spawns.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::models::spawn::AgentFlavor;
use crate::{AppError, Result};

/// Environment variable carrying a Claude OAuth token.
pub const CLAUDE_TOKEN_VAR: &str = "CLAUDE_CODE_OAUTH_TOKEN";
/// Environment variable pointing Codex at its private home.
pub const CODEX_HOME_VAR: &str = "CODEX_HOME";

/// Merge environments with increasing precedence: `base` < `caller` < `auth`.
///
/// Auth material always wins so a caller cannot accidentally shadow it.
#[must_use]
pub fn merge_environment(
    base: impl IntoIterator<Item = (String, String)>,
    caller: &HashMap<String, String>,
    auth: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged: HashMap<String, String> = base.into_iter().collect();
    for (key, value) in caller.iter().chain(auth.iter()) {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Auth material for one spawn.
///
/// Holds the private directory written for the agent, if any; dropping the
/// value deletes it, so it must live as long as the child does.
#[derive(Debug, Default)]
pub struct AgentAuth {
    /// Variables to inject into the child environment.
    pub env: HashMap<String, String>,
    scratch: Option<TempDir>,
}

impl AgentAuth {
    /// Private directory holding written credentials.
    #[must_use]
    pub fn scratch_path(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
    }

    /// Take ownership of the private directory.
    #[must_use]
    pub fn into_scratch(self) -> Option<TempDir> {
        self.scratch
    }
}

/// Turn a flavor's token into environment variables.
///
/// Codex reads credentials from `auth.json` under `CODEX_HOME`, so a private
/// directory is created under `scratch_dir` for it.
///
/// # Errors
///
/// Returns `AppError::Io` if the Codex home cannot be written.
pub fn auth_environment(
    flavor: AgentFlavor,
    token: Option<&str>,
    scratch_dir: &Path,
) -> Result<AgentAuth> {
    let mut auth = AgentAuth::default();
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return Ok(auth);
    };

    match flavor {
        AgentFlavor::Claude => {
            auth.env
                .insert(CLAUDE_TOKEN_VAR.to_owned(), token.to_owned());
        }
        AgentFlavor::Codex => {
            fs::create_dir_all(scratch_dir).map_err(|err| {
                AppError::Io(format!("failed to create {}: {err}", scratch_dir.display()))
            })?;
            let home = tempfile::Builder::new()
                .prefix("codex-")
                .tempdir_in(scratch_dir)
                .map_err(|err| AppError::Io(format!("failed to create codex home: {err}")))?;
            fs::write(home.path().join("auth.json"), token)
                .map_err(|err| AppError::Io(format!("failed to write codex auth: {err}")))?;
            debug!(home = %home.path().display(), "prepared codex home");
            auth.env
                .insert(CODEX_HOME_VAR.to_owned(), home.path().display().to_string());
            auth.scratch = Some(home);
        }
    }
    Ok(auth)
}

/// Result of checking a spawn directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryStatus {
    /// The directory already existed.
    Existing,
    /// The directory was created.
    Created,
    /// The directory is missing and creation was not approved.
    NeedsApproval(PathBuf),
}

/// Ensure `directory` exists, creating it only when `approved`.
///
/// # Errors
///
/// Returns `AppError::Spawn` with a human-readable message when creation
/// fails.
pub fn prepare_directory(directory: &Path, approved: bool) -> Result<DirectoryStatus> {
    if directory.is_dir() {
        return Ok(DirectoryStatus::Existing);
    }
    if !approved {
        return Ok(DirectoryStatus::NeedsApproval(directory.to_path_buf()));
    }
    fs::create_dir_all(directory)
        .map_err(|err| AppError::Spawn(describe_directory_error(directory, &err)))?;
    Ok(DirectoryStatus::Created)
}

/// Human-readable explanation of a directory creation failure.
#[must_use]
pub fn describe_directory_error(directory: &Path, err: &io::Error) -> String {
    let dir = directory.display();
    match classify(err) {
        DirectoryFailure::PermissionDenied => format!(
            "Permission denied: you do not have write access to create '{dir}'. \
             Choose a different location or check the permissions of its parent."
        ),
        DirectoryFailure::NotADirectory => format!(
            "Cannot create '{dir}' because a file already exists at that path or one of its parents. \
             Choose a different path."
        ),
        DirectoryFailure::NoSpace => {
            format!("Cannot create '{dir}' because the disk is full. Free up space and try again.")
        }
        DirectoryFailure::ReadOnly => format!(
            "Cannot create '{dir}' because the file system is read-only. Choose a writable location."
        ),
        DirectoryFailure::Other => format!(
            "Unable to create '{dir}': {err}. Check that the path is valid and that you have permission to create it."
        ),
    }
}

enum DirectoryFailure {
    PermissionDenied,
    NotADirectory,
    NoSpace,
    ReadOnly,
    Other,
}

#[cfg(unix)]
fn classify(err: &io::Error) -> DirectoryFailure {
    use nix::errno::Errno;

    if err.kind() == io::ErrorKind::PermissionDenied {
        return DirectoryFailure::PermissionDenied;
    }
    match err.raw_os_error().map(Errno::from_raw) {
        Some(Errno::EACCES | Errno::EPERM) => DirectoryFailure::PermissionDenied,
        Some(Errno::ENOTDIR | Errno::EEXIST) => DirectoryFailure::NotADirectory,
        Some(Errno::ENOSPC) => DirectoryFailure::NoSpace,
        Some(Errno::EROFS) => DirectoryFailure::ReadOnly,
        _ => DirectoryFailure::Other,
    }
}

#[cfg(not(unix))]
fn classify(err: &io::Error) -> DirectoryFailure {
    match err.kind() {
        io::ErrorKind::PermissionDenied => DirectoryFailure::PermissionDenied,
        io::ErrorKind::AlreadyExists => DirectoryFailure::NotADirectory,
        _ => DirectoryFailure::Other,
    }
}
