//! Exit listener for daemon-spawned children.
//!
//! Each child gets one background task that owns its `tokio::process::Child`,
//! forwards its output to debug logs, reaps it on exit, and drops it from the
//! registry. Credentials written for the child are deleted once it exits.

use std::sync::Arc;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::registry::SessionRegistry;

/// Spawn the exit listener for `child`. `scratch` is removed after exit.
///
/// Dropping the returned handle detaches the task; it keeps running until
/// the child exits.
#[must_use]
pub fn watch_child(
    pid: u32,
    mut child: Child,
    registry: Arc<SessionRegistry>,
    scratch: Option<TempDir>,
) -> JoinHandle<()> {
    if let Some(stdout) = child.stdout.take() {
        forward_output(pid, "stdout", stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        forward_output(pid, "stderr", stderr);
    }

    tokio::spawn(async move {
        let status_text = match child.wait().await {
            Ok(status) => status.code().map_or_else(
                || "terminated by signal".to_owned(),
                |c| format!("exited with code {c}"),
            ),
            Err(err) => {
                warn!(pid, %err, "failed to wait for child process");
                "status unknown".to_owned()
            }
        };
        info!(pid, status = %status_text, "spawned session process exited");
        registry.remove(pid);
        if let Some(scratch) = scratch {
            let path = scratch.path().display().to_string();
            if let Err(err) = scratch.close() {
                warn!(pid, path, %err, "failed to remove session scratch directory");
            }
        }
    })
}

fn forward_output<R>(pid: u32, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(pid, stream, "{line}"),
                Ok(None) => break,
                Err(err) => {
                    debug!(pid, stream, %err, "stopped reading child output");
                    break;
                }
            }
        }
    });
}
