//! Periodic heartbeat: dead-session sweep, version drift detection,
//! supersession check and state refresh.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::handoff::spawn_detached_daemon;
use super::shutdown::ShutdownSignal;
use super::version::VersionProbe;
use crate::daemon::state_file::{DaemonPersistedState, DaemonStateStore};
use crate::models::machine::ShutdownSource;
use crate::orchestrator::registry::SessionRegistry;
use crate::process;

/// Result of one heartbeat tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing unusual; state refreshed.
    Continue,
    /// A previous tick is still running.
    Skipped,
    /// The installed binary reports a different version.
    VersionDrift {
        /// Version found on disk.
        installed: String,
    },
    /// The state record names another daemon.
    Superseded {
        /// Pid found in the record.
        pid: u32,
    },
}

/// Heartbeat state and collaborators.
pub struct Heartbeat {
    registry: Arc<SessionRegistry>,
    store: DaemonStateStore,
    probe: Arc<dyn VersionProbe>,
    state: DaemonPersistedState,
    in_flight: AtomicBool,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Heartbeat {
    /// Heartbeat that rewrites `state` on every tick.
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: DaemonStateStore,
        probe: Arc<dyn VersionProbe>,
        state: DaemonPersistedState,
    ) -> Self {
        Self {
            registry,
            store,
            probe,
            state,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Run one tick unless another is in flight.
    pub async fn tick(&self) -> TickOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("heartbeat tick still in flight, skipping");
            return TickOutcome::Skipped;
        }
        let _guard = InFlight(&self.in_flight);

        let removed = self.registry.sweep_dead(process::is_alive);
        if !removed.is_empty() {
            debug!(count = removed.len(), "swept dead sessions");
        }

        if let Some(installed) = self.probe.installed_version().await {
            if installed != self.state.started_with_cli_version {
                info!(
                    running = self.state.started_with_cli_version,
                    installed, "installed version differs from running version"
                );
                return TickOutcome::VersionDrift { installed };
            }
        }

        if let Some(on_disk) = self.store.read() {
            if on_disk.pid != self.state.pid {
                warn!(pid = on_disk.pid, "state file names another daemon");
                return TickOutcome::Superseded { pid: on_disk.pid };
            }
        }

        let mut state = self.state.clone();
        state.last_heartbeat = Some(chrono::Utc::now().to_rfc3339());
        if let Err(err) = self.store.write(&state) {
            warn!(%err, "failed to write heartbeat");
        }
        TickOutcome::Continue
    }
}

/// How the heartbeat loop reacts to version drift.
#[derive(Debug, Clone)]
pub struct DriftPolicy {
    /// Binary launched as the replacement; `None` skips the launch.
    pub replacement_exe: Option<PathBuf>,
    /// How long to idle after launching before shutting down regardless.
    pub grace: Duration,
}

/// Drive `heartbeat` every `interval` until `ct` is cancelled, drift is
/// detected, or the daemon is superseded.
#[must_use]
pub fn spawn_heartbeat_loop(
    heartbeat: Arc<Heartbeat>,
    interval: Duration,
    drift: DriftPolicy,
    shutdown: ShutdownSignal,
    ct: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            timer.tick().await;

            loop {
                tokio::select! {
                    () = ct.cancelled() => break,
                    _ = timer.tick() => {}
                }

                match heartbeat.tick().await {
                    TickOutcome::Continue | TickOutcome::Skipped => {}
                    TickOutcome::Superseded { pid } => {
                        shutdown.request(
                            ShutdownSource::Exception,
                            format!("superseded by daemon {pid}"),
                        );
                        break;
                    }
                    TickOutcome::VersionDrift { installed } => {
                        if let Some(exe) = &drift.replacement_exe {
                            if let Err(err) = spawn_detached_daemon(exe) {
                                warn!(%err, "failed to launch replacement daemon");
                            }
                        }
                        tokio::select! {
                            () = ct.cancelled() => {}
                            () = tokio::time::sleep(drift.grace) => {
                                shutdown.request(
                                    ShutdownSource::Exception,
                                    format!("replaced by version {installed}"),
                                );
                            }
                        }
                        break;
                    }
                }
            }
            debug!("heartbeat loop stopped");
        }
        .instrument(info_span!("heartbeat")),
    )
}
