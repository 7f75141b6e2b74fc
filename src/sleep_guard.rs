//! Keeps the machine awake while the daemon runs (macOS `caffeinate`).

use tokio::process::Child;
use tracing::{debug, warn};

/// Running sleep-prevention helper.
pub struct SleepGuard {
    child: Child,
}

impl SleepGuard {
    /// Start `caffeinate -i -w <pid>` unless disabled. Returns `None` on
    /// other platforms or if the helper cannot be started.
    #[must_use]
    pub fn start(disabled: bool) -> Option<Self> {
        if disabled || !cfg!(target_os = "macos") {
            debug!(disabled, "sleep prevention not started");
            return None;
        }
        let pid = std::process::id().to_string();
        match tokio::process::Command::new("caffeinate")
            .args(["-i", "-w", &pid])
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => {
                debug!(helper_pid = child.id(), "sleep prevention started");
                Some(Self { child })
            }
            Err(err) => {
                warn!(%err, "failed to start caffeinate");
                None
            }
        }
    }

    /// Stop the helper.
    pub async fn stop(mut self) {
        if let Err(err) = self.child.kill().await {
            debug!(%err, "caffeinate already gone");
        }
    }
}
