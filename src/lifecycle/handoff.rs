//! Running-daemon detection and version handoff.
//!
//! A starting daemon inspects the state record. A live daemon of the same
//! version means there is nothing to do. A live daemon of another version is
//! asked to stop over its control surface and force-killed if it does not go
//! away in time. A record whose pid is dead is stale and is removed together
//! with any stale lock marker.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::control::client::ControlClient;
use crate::daemon::lock::LockManager;
use crate::daemon::state_file::{DaemonPersistedState, DaemonStateStore};
use crate::{process, AppError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What the state record says about another daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunningDaemon {
    /// No live daemon.
    None,
    /// A live daemon of this version.
    SameVersion(DaemonPersistedState),
    /// A live daemon of another version.
    OtherVersion(DaemonPersistedState),
}

/// Classify the daemon named by the state record, clearing stale artifacts.
pub fn inspect_running(
    store: &DaemonStateStore,
    lock: &LockManager,
    version: &str,
) -> RunningDaemon {
    let Some(state) = store.read() else {
        lock.clear_stale(process::is_alive);
        return RunningDaemon::None;
    };

    if !process::is_alive(state.pid) {
        warn!(pid = state.pid, "removing stale daemon state");
        if let Err(err) = store.clear() {
            warn!(%err, "failed to remove stale daemon state");
        }
        lock.clear_stale(process::is_alive);
        return RunningDaemon::None;
    }

    if state.started_with_cli_version == version {
        RunningDaemon::SameVersion(state)
    } else {
        RunningDaemon::OtherVersion(state)
    }
}

/// Ask the daemon described by `state` to stop and wait up to `wait` for it
/// to go away, then force-kill it.
///
/// # Errors
///
/// Returns `AppError::Timeout` if the daemon is still alive after the force
/// kill grace period.
pub async fn stop_daemon(
    store: &DaemonStateStore,
    state: &DaemonPersistedState,
    wait: Duration,
) -> Result<()> {
    let pid = state.pid;
    info!(
        pid,
        version = state.started_with_cli_version,
        "stopping daemon of another version"
    );

    match ControlClient::new(state.http_port) {
        Ok(client) => {
            if let Err(err) = client.stop_daemon().await {
                warn!(pid, %err, "stop request failed, waiting for exit anyway");
            }
        }
        Err(err) => warn!(%err, "could not build control client"),
    }

    if wait_until_gone(store, pid, wait).await {
        info!(pid, "previous daemon stopped");
        return Ok(());
    }

    if pid == std::process::id() {
        return Err(AppError::Timeout("refusing to kill the current process".into()));
    }
    warn!(pid, "previous daemon did not stop in time, killing it");
    if let Err(err) = process::force_kill(pid) {
        warn!(pid, %err, "force kill failed");
    }

    if wait_until_gone(store, pid, Duration::from_secs(2)).await || !process::is_alive(pid) {
        if store.read().is_some_and(|s| s.pid == pid) {
            store.clear()?;
        }
        return Ok(());
    }
    Err(AppError::Timeout(format!("daemon {pid} survived SIGKILL")))
}

/// Poll until the state record no longer names `pid` or `pid` is dead.
async fn wait_until_gone(store: &DaemonStateStore, pid: u32, wait: Duration) -> bool {
    let deadline = Instant::now() + wait;
    loop {
        let still_recorded = store.read().is_some_and(|s| s.pid == pid);
        if !still_recorded || !process::is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Launch `<exe> run` detached from this process.
///
/// # Errors
///
/// Returns `AppError::Io` if the process cannot be started.
pub fn spawn_detached_daemon(exe: &Path) -> Result<u32> {
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("run")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let child = cmd
        .spawn()
        .map_err(|err| AppError::Io(format!("failed to start {}: {err}", exe.display())))?;
    info!(pid = child.id(), exe = %exe.display(), "detached daemon launched");
    Ok(child.id())
}
