//! OS process probes and signal delivery.

use crate::{AppError, Result};

/// Check whether a process with the given pid is alive.
#[cfg(unix)]
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    // Values that wrap negative would address process groups.
    let Ok(raw_pid) = i32::try_from(pid) else {
        return false;
    };
    if raw_pid <= 0 {
        return false;
    }
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw_pid), None) {
        Ok(()) => true,
        // EPERM: the process exists but belongs to someone else.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Send `SIGTERM` to `pid`.
///
/// # Errors
///
/// Returns `AppError::Io` if the pid is invalid or the signal cannot be
/// delivered (for example, the process is already gone).
#[cfg(unix)]
pub fn terminate(pid: u32) -> Result<()> {
    send(pid, nix::sys::signal::Signal::SIGTERM)
}

/// Send `SIGKILL` to `pid`.
///
/// # Errors
///
/// Returns `AppError::Io` if the signal cannot be delivered.
#[cfg(unix)]
pub fn force_kill(pid: u32) -> Result<()> {
    send(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(unix)]
fn send(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    if pid == std::process::id() {
        return Err(AppError::Io(format!("refusing to send {signal} to own pid {pid}")));
    }
    let raw_pid = i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| AppError::Io(format!("invalid pid {pid}")))?;
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw_pid), signal)
        .map_err(|errno| AppError::Io(format!("failed to send {signal} to {pid}: {errno}")))
}

/// Check whether a process with the given pid is alive.
#[cfg(not(unix))]
#[must_use]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// Signal delivery is unsupported on this platform.
///
/// # Errors
///
/// Always returns `AppError::Io`.
#[cfg(not(unix))]
pub fn terminate(pid: u32) -> Result<()> {
    Err(AppError::Io(format!("cannot signal {pid} on this platform")))
}

/// Signal delivery is unsupported on this platform.
///
/// # Errors
///
/// Always returns `AppError::Io`.
#[cfg(not(unix))]
pub fn force_kill(pid: u32) -> Result<()> {
    Err(AppError::Io(format!("cannot signal {pid} on this platform")))
}
