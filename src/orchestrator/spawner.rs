//! Session spawner.
//!
//! Launches the configured agent program as a detached child in its own
//! process group, registers it, and waits for the child to report itself
//! through the control surface webhook. The child is never killed when the
//! daemon drops its handle; it outlives a daemon restart.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{info, info_span, warn, Instrument};

use super::child_monitor::watch_child;
use super::environment::{auth_environment, merge_environment, prepare_directory, DirectoryStatus};
use super::registry::SessionRegistry;
use crate::config::DaemonConfig;
use crate::models::session::TrackedSession;
use crate::models::spawn::{SpawnOptions, SpawnResult};
use crate::AppError;

/// Port of the daemon's control surface, exported to every child.
pub const ENV_DAEMON_PORT: &str = "STEWARD_DAEMON_PORT";
/// Marks a child as launched by the daemon.
pub const ENV_STARTED_BY: &str = "STEWARD_STARTED_BY";
/// Remote session the child should resume.
pub const ENV_RESUME_SESSION_ID: &str = "STEWARD_RESUME_SESSION_ID";

/// Launches agent sessions on behalf of the control surface and RPC
/// handlers.
pub struct SessionSpawner {
    registry: Arc<SessionRegistry>,
    config: DaemonConfig,
    control_port: u16,
}

impl SessionSpawner {
    /// Spawner reporting children into `registry` and telling them to call
    /// back on `control_port`.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, config: DaemonConfig, control_port: u16) -> Self {
        Self {
            registry,
            config,
            control_port,
        }
    }

    /// Spawn a session and wait for it to report its remote id.
    ///
    /// Every failure is folded into [`SpawnResult::Error`]; a missing
    /// directory without approval yields
    /// [`SpawnResult::RequestToApproveDirectoryCreation`].
    pub async fn spawn(&self, options: SpawnOptions) -> SpawnResult {
        let span = info_span!(
            "spawn_session",
            directory = %options.directory.display(),
            agent = ?options.agent,
            resume = options.remote_session_id.as_deref().unwrap_or("")
        );
        self.spawn_inner(options).instrument(span).await
    }

    async fn spawn_inner(&self, options: SpawnOptions) -> SpawnResult {
        let directory_was_created =
            match prepare_directory(&options.directory, options.approved_new_directory_creation) {
                Ok(DirectoryStatus::Existing) => false,
                Ok(DirectoryStatus::Created) => {
                    info!("created session directory");
                    true
                }
                Ok(DirectoryStatus::NeedsApproval(directory)) => {
                    info!("directory missing, asking for approval");
                    return SpawnResult::RequestToApproveDirectoryCreation { directory };
                }
                Err(AppError::Spawn(message)) => return SpawnResult::error(message),
                Err(err) => return SpawnResult::error(err.to_string()),
            };

        let auth = match auth_environment(
            options.agent,
            options.token.as_deref(),
            &self.config.tmp_dir(),
        ) {
            Ok(auth) => auth,
            Err(err) => {
                warn!(%err, "failed to prepare agent credentials");
                return SpawnResult::error(format!("Failed to prepare agent credentials: {err}"));
            }
        };

        let mut env = merge_environment(
            std::env::vars(),
            &options.environment_variables,
            &auth.env,
        );
        env.extend(self.daemon_environment(&options));

        let mut cmd = Command::new(&self.config.agent_program);
        cmd.args(&self.config.agent_args);
        if let Some(resume) = &options.remote_session_id {
            cmd.arg("--resume").arg(resume);
        }
        cmd.env_clear()
            .envs(&env)
            .current_dir(&options.directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(%err, program = %self.config.agent_program, "failed to launch agent");
                return SpawnResult::error(format!(
                    "Failed to launch '{}': {err}",
                    self.config.agent_program
                ));
            }
        };

        let Some(pid) = child.id() else {
            return SpawnResult::error("Agent process exited before its pid could be read");
        };
        info!(pid, program = %self.config.agent_program, "agent process spawned");

        self.registry
            .register_spawned(TrackedSession::spawned(pid, directory_was_created));
        // Detached: the monitor keeps running after this call returns.
        drop(watch_child(
            pid,
            child,
            Arc::clone(&self.registry),
            auth.into_scratch(),
        ));

        match self
            .registry
            .await_report(pid, self.config.spawn_report_timeout)
            .await
        {
            Ok(session) => match session.remote_session_id {
                Some(session_id) => {
                    info!(pid, session_id, "session reported itself");
                    SpawnResult::Success { session_id }
                }
                None => SpawnResult::error(format!("Session with pid {pid} reported without an id")),
            },
            Err(err) => {
                warn!(pid, %err, "session did not report in time");
                SpawnResult::error(format!(
                    "Session process {pid} did not report back within {} seconds",
                    self.config.spawn_report_timeout.as_secs()
                ))
            }
        }
    }

    fn daemon_environment(&self, options: &SpawnOptions) -> HashMap<String, String> {
        let mut env = HashMap::from([
            (ENV_DAEMON_PORT.to_owned(), self.control_port.to_string()),
            (ENV_STARTED_BY.to_owned(), "daemon".to_owned()),
        ]);
        if let Some(resume) = &options.remote_session_id {
            env.insert(ENV_RESUME_SESSION_ID.to_owned(), resume.clone());
        }
        env
    }
}
