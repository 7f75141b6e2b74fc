//! PID-stamped exclusive lock marker.
//!
//! The marker is stamped with the holder pid in a temp file and linked into
//! place without clobbering, so concurrent attempts fail for all but one
//! caller and the marker never exists without its pid. Correctness rests on
//! existence; the pid only decides whether a leftover marker is stale.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tempfile::NamedTempFile;

use tracing::{debug, info, warn};

use crate::{AppError, Result};

/// Age after which a marker without a readable pid counts as abandoned.
pub const UNREADABLE_MARKER_GRACE: Duration = Duration::from_secs(30);

/// Creates and inspects the lock marker at a fixed path.
#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
    unreadable_grace: Duration,
}

/// Proof of holding the lock. Release explicitly on graceful shutdown.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
}

impl LockManager {
    /// Manager for the marker at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            unreadable_grace: UNREADABLE_MARKER_GRACE,
        }
    }

    /// Override how old a pid-less marker must be before it is cleared.
    #[must_use]
    pub fn with_unreadable_grace(mut self, grace: Duration) -> Self {
        self.unreadable_grace = grace;
        self
    }

    /// Path of the marker.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to create the marker, retrying while another holder has it.
    ///
    /// Returns `Ok(None)` after `max_attempts` failed attempts; callers treat
    /// that as "another instance is running", not as an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lock` for failures other than the marker already
    /// existing (missing parent that cannot be created, permissions, …).
    pub async fn acquire(&self, max_attempts: u32, delay: Duration) -> Result<Option<LockHandle>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::Lock(format!("failed to create {}: {err}", parent.display()))
            })?;
        }

        let attempts = max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.try_create() {
                Ok(handle) => {
                    info!(path = %self.path.display(), "daemon lock acquired");
                    return Ok(Some(handle));
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    debug!(
                        attempt,
                        holder = ?self.holder_pid(),
                        "daemon lock held by another process"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => {
                    return Err(AppError::Lock(format!(
                        "failed to create {}: {err}",
                        self.path.display()
                    )));
                }
            }
        }

        Ok(None)
    }

    fn try_create(&self) -> std::io::Result<LockHandle> {
        let dir = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut stamp = NamedTempFile::new_in(dir)?;
        write!(stamp, "{}", std::process::id())?;
        stamp.as_file().sync_all()?;
        stamp
            .persist_noclobber(&self.path)
            .map_err(|err| err.error)?;
        Ok(LockHandle {
            path: self.path.clone(),
        })
    }

    /// Pid recorded in the marker, if present and readable.
    #[must_use]
    pub fn holder_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.path).ok()?.trim().parse().ok()
    }

    /// Remove a marker left behind by a holder that is no longer alive.
    ///
    /// A marker without a readable pid is left alone until it is older than
    /// the unreadable grace. Returns `true` when a marker was removed.
    pub fn clear_stale(&self, is_alive: impl Fn(u32) -> bool) -> bool {
        if !self.path.exists() {
            return false;
        }
        match self.holder_pid() {
            Some(pid) if is_alive(pid) => false,
            None if !self.marker_older_than(self.unreadable_grace) => {
                debug!(path = %self.path.display(), "lock marker has no pid yet, treating as held");
                false
            }
            holder => {
                match fs::remove_file(&self.path) {
                    Ok(()) => {
                        warn!(?holder, path = %self.path.display(), "removed stale daemon lock");
                        true
                    }
                    Err(err) => {
                        warn!(%err, "failed to remove stale daemon lock");
                        false
                    }
                }
            }
        }
    }

    fn marker_older_than(&self, age: Duration) -> bool {
        fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|elapsed| elapsed >= age)
    }
}

impl LockHandle {
    /// Path of the held marker.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the marker. Already removed is not an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lock` if the marker exists but cannot be removed.
    pub fn release(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "daemon lock released");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::Lock(format!(
                "failed to remove {}: {err}",
                self.path.display()
            ))),
        }
    }
}
