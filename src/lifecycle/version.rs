//! Installed-version probe used to detect upgrades under a running daemon.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::BoxFuture;

/// Reports the version of the daemon binary currently installed on disk.
pub trait VersionProbe: Send + Sync {
    /// Installed version, or `None` if it cannot be determined right now.
    fn installed_version(&self) -> BoxFuture<'_, Option<String>>;
}

/// Runs `<exe> --version` and takes the last whitespace-separated token.
#[derive(Debug, Clone)]
pub struct ExecutableVersionProbe {
    exe: PathBuf,
}

impl ExecutableVersionProbe {
    /// Probe for the binary at `exe`.
    #[must_use]
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }
}

impl VersionProbe for ExecutableVersionProbe {
    fn installed_version(&self) -> BoxFuture<'_, Option<String>> {
        Box::pin(async move {
            let output = Command::new(&self.exe)
                .arg("--version")
                .stdin(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .output();
            let output = match tokio::time::timeout(Duration::from_secs(10), output).await {
                Ok(Ok(output)) if output.status.success() => output,
                Ok(Ok(output)) => {
                    debug!(status = %output.status, "version probe exited unsuccessfully");
                    return None;
                }
                Ok(Err(err)) => {
                    debug!(%err, exe = %self.exe.display(), "version probe failed to run");
                    return None;
                }
                Err(_) => {
                    debug!("version probe timed out");
                    return None;
                }
            };
            parse_version_output(&String::from_utf8_lossy(&output.stdout))
        })
    }
}

/// Extract the version from `--version` output such as `agent-steward 1.2.3`.
#[must_use]
pub fn parse_version_output(output: &str) -> Option<String> {
    output
        .lines()
        .next()?
        .split_whitespace()
        .last()
        .map(|v| v.trim_start_matches('v').to_owned())
}
