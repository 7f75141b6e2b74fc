//! Daemon lifecycle: startup checks, steady state and ordered shutdown.
//!
//! ```text
//! starting -> locked -> running -> shutting-down -> terminated
//!     \________\___ aborting (fatal setup error)
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use super::handoff::{inspect_running, stop_daemon, RunningDaemon};
use super::heartbeat::{spawn_heartbeat_loop, DriftPolicy, Heartbeat};
use super::shutdown::{ShutdownRequest, ShutdownSignal};
use super::version::VersionProbe;
use crate::config::{Credentials, DaemonConfig};
use crate::control::server::{bind_loopback, ControlServer, ControlState};
use crate::daemon::lock::{LockHandle, LockManager};
use crate::daemon::state_file::{DaemonPersistedState, DaemonStateStore};
use crate::models::machine::{DaemonState, MachineMetadata};
use crate::orchestrator::registry::SessionRegistry;
use crate::orchestrator::spawner::SessionSpawner;
use crate::sleep_guard::SleepGuard;
use crate::sync::api::ApiClient;
use crate::sync::backoff::Backoff;
use crate::sync::channel::{ChannelConfig, WsChannel};
use crate::sync::client::{MachineSnapshot, MachineSyncClient, RetryPolicy};
use crate::sync::crypto::{AesGcmCipher, Cipher};
use crate::sync::rpc::{DaemonRpcHandler, RpcDispatcher};
use crate::Result;

const LOCK_ATTEMPTS: u32 = 5;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(200);
const SHUTDOWN_STATE_WAIT: Duration = Duration::from_secs(5);

/// Collaborators that differ between production and tests.
pub struct DaemonDeps {
    /// Shutdown signal shared with signal handlers and the panic hook.
    pub shutdown: ShutdownSignal,
    /// Installed-version probe used by the heartbeat.
    pub probe: Arc<dyn VersionProbe>,
    /// Binary launched when drift is detected.
    pub replacement_exe: Option<PathBuf>,
    /// Idle period after launching a replacement.
    pub drift_grace: Duration,
    /// How long a daemon of another version gets to exit before it is
    /// force-killed.
    pub handoff_wait: Duration,
    /// Log file recorded in the state file.
    pub log_path: PathBuf,
}

/// Result of [`Daemon::start`].
pub enum StartOutcome {
    /// This process is now the daemon.
    Running(Box<Daemon>),
    /// A daemon of the same version is alive; nothing was changed.
    AlreadyRunning {
        /// Pid of the running daemon.
        pid: u32,
        /// Its control port.
        http_port: u16,
    },
    /// Another instance holds the lock.
    LockUnavailable,
}

struct RemoteSync {
    client: Arc<MachineSyncClient>,
    initial_updates: Vec<JoinHandle<()>>,
}

/// A running daemon.
pub struct Daemon {
    config: DaemonConfig,
    registry: Arc<SessionRegistry>,
    store: DaemonStateStore,
    lock: LockHandle,
    control: ControlServer,
    sync: Option<RemoteSync>,
    heartbeat_ct: CancellationToken,
    heartbeat_task: JoinHandle<()>,
    sleep_guard: Option<SleepGuard>,
    shutdown: ShutdownSignal,
    started_at: DateTime<Utc>,
}

impl Daemon {
    /// Run the startup sequence.
    ///
    /// # Errors
    ///
    /// Returns an error for fatal setup failures (lock I/O, control server
    /// bind, state write, malformed credentials, a previous daemon that
    /// cannot be stopped). No partial cleanup is attempted.
    pub async fn start(config: DaemonConfig, deps: DaemonDeps) -> Result<StartOutcome> {
        let span = info_span!("daemon_start", version = %config.version);
        Self::start_inner(config, deps).instrument(span).await
    }

    async fn start_inner(config: DaemonConfig, deps: DaemonDeps) -> Result<StartOutcome> {
        let store = DaemonStateStore::new(config.state_path());
        let lock_manager = LockManager::new(config.lock_path());

        match inspect_running(&store, &lock_manager, &config.version) {
            RunningDaemon::None => {}
            RunningDaemon::SameVersion(state) => {
                info!(pid = state.pid, port = state.http_port, "daemon already running");
                return Ok(StartOutcome::AlreadyRunning {
                    pid: state.pid,
                    http_port: state.http_port,
                });
            }
            RunningDaemon::OtherVersion(state) => {
                stop_daemon(&store, &state, deps.handoff_wait).await?;
                lock_manager.clear_stale(crate::process::is_alive);
            }
        }

        let Some(lock) = lock_manager.acquire(LOCK_ATTEMPTS, LOCK_RETRY_DELAY).await? else {
            info!(holder = ?lock_manager.holder_pid(), "daemon lock unavailable");
            return Ok(StartOutcome::LockUnavailable);
        };

        let credentials = config.load_credentials()?;
        let registry = Arc::new(SessionRegistry::new());

        let (listener, port) = bind_loopback().await?;
        let spawner = Arc::new(SessionSpawner::new(
            Arc::clone(&registry),
            config.clone(),
            port,
        ));
        let control = ControlServer::start(
            listener,
            ControlState {
                registry: Arc::clone(&registry),
                spawner: Arc::clone(&spawner),
                shutdown: deps.shutdown.clone(),
            },
        )?;

        let started_at = Utc::now();
        let pid = std::process::id();
        let persisted = DaemonPersistedState {
            pid,
            http_port: port,
            start_time: started_at.to_rfc3339(),
            started_with_cli_version: config.version.clone(),
            last_heartbeat: None,
            daemon_log_path: deps.log_path.display().to_string(),
        };
        store.write(&persisted)?;
        info!(pid, port, "daemon state written");

        let sync = match (&config.server_url, credentials) {
            (Some(server_url), Some(credentials)) => Some(
                connect_remote(
                    &config,
                    server_url,
                    &credentials,
                    DaemonState::running(pid, port, started_at),
                    Arc::new(DaemonRpcHandler::new(
                        Arc::clone(&spawner),
                        Arc::clone(&registry),
                        deps.shutdown.clone(),
                    )),
                )
                .await?,
            ),
            (None, _) => {
                info!("no server configured; running in local-only mode");
                None
            }
            (Some(_), None) => {
                info!("no credentials found; running in local-only mode");
                None
            }
        };

        let heartbeat = Arc::new(Heartbeat::new(
            Arc::clone(&registry),
            store.clone(),
            deps.probe,
            persisted,
        ));
        let heartbeat_ct = CancellationToken::new();
        let heartbeat_task = spawn_heartbeat_loop(
            heartbeat,
            config.heartbeat_interval,
            DriftPolicy {
                replacement_exe: deps.replacement_exe,
                grace: deps.drift_grace,
            },
            deps.shutdown.clone(),
            heartbeat_ct.clone(),
        );

        let sleep_guard = SleepGuard::start(config.disable_caffeinate);
        info!(pid, port, "daemon running");

        Ok(StartOutcome::Running(Box::new(Self {
            config,
            registry,
            store,
            lock,
            control,
            sync,
            heartbeat_ct,
            heartbeat_task,
            sleep_guard,
            shutdown: deps.shutdown,
            started_at,
        })))
    }

    /// Control surface port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.control.port()
    }

    /// Tracked sessions.
    #[must_use]
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Signal that ends [`run_until_shutdown`](Self::run_until_shutdown).
    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Block until a shutdown request arrives, then shut down.
    pub async fn run_until_shutdown(self) -> ShutdownRequest {
        let request = self.shutdown.wait().await;
        self.shutdown(&request).await;
        request
    }

    /// Ordered shutdown. Runs once; `self` is consumed.
    pub async fn shutdown(self, request: &ShutdownRequest) {
        self.shutdown.mark_started();
        let span = info_span!("daemon_shutdown", source = ?request.source);
        async move {
            info!(message = request.message, "shutting down");

            self.heartbeat_ct.cancel();
            if let Err(err) = self.heartbeat_task.await {
                warn!(%err, "heartbeat task failed");
            }

            if let Some(sync) = &self.sync {
                for task in &sync.initial_updates {
                    task.abort();
                }
                let pid = std::process::id();
                let port = self.control.port();
                let started_at = self.started_at;
                let source = request.source;
                let now = Utc::now();
                let push = sync.client.update_daemon_state(move |current| {
                    current
                        .cloned()
                        .unwrap_or_else(|| DaemonState::running(pid, port, started_at))
                        .shutting_down(source, now)
                });
                match tokio::time::timeout(SHUTDOWN_STATE_WAIT, push).await {
                    Ok(Ok(_)) => info!("published shutting-down state"),
                    Ok(Err(err)) => warn!(%err, "failed to publish shutting-down state"),
                    Err(_) => warn!("timed out publishing shutting-down state"),
                }
                sync.client.shutdown().await;
            }

            self.control.stop().await;

            if let Err(err) = self.store.clear() {
                error!(%err, "failed to clear daemon state");
            }
            if let Err(err) = self.lock.release() {
                error!(%err, "failed to release daemon lock");
            }
            if let Some(guard) = self.sleep_guard {
                guard.stop().await;
            }
            info!(home = %self.config.home_dir.display(), "daemon terminated");
        }
        .instrument(span)
        .await;
    }
}

async fn connect_remote(
    config: &DaemonConfig,
    server_url: &str,
    credentials: &Credentials,
    running: DaemonState,
    handler: Arc<DaemonRpcHandler>,
) -> Result<RemoteSync> {
    let machine_id = config.machine_id()?;
    let metadata = MachineMetadata::current(&config.version, &config.home_dir);

    let cipher: Arc<dyn Cipher> = Arc::new(AesGcmCipher::new(&credentials.secret));
    let snapshot = match ApiClient::new(server_url, &credentials.token)?
        .register_machine(&machine_id, cipher.as_ref(), &metadata, Some(&running))
        .await
    {
        Ok(machine) => machine.snapshot(cipher.as_ref()),
        Err(err) => {
            warn!(%err, "machine registration failed, continuing with an empty snapshot");
            MachineSnapshot::default()
        }
    };

    let dispatcher = Arc::new(RpcDispatcher::new(
        machine_id.clone(),
        Arc::clone(&cipher),
        handler,
    ));
    let channel = WsChannel::connect(
        ChannelConfig {
            server_url: server_url.to_owned(),
            token: credentials.token.clone(),
            machine_id: machine_id.clone(),
            keepalive_interval: config.keepalive_interval,
            reconnect: Backoff::default(),
        },
        dispatcher,
    );
    let client = Arc::new(MachineSyncClient::new(
        machine_id,
        channel,
        cipher,
        snapshot,
        RetryPolicy::default(),
    ));

    let state_client = Arc::clone(&client);
    let state_task = tokio::spawn(async move {
        if let Err(err) = state_client
            .update_daemon_state(|_| running.clone())
            .await
        {
            warn!(%err, "failed to publish running state");
        }
    });
    let metadata_client = Arc::clone(&client);
    let metadata_task = tokio::spawn(async move {
        if let Err(err) = metadata_client
            .update_metadata(|_| metadata.clone())
            .await
        {
            warn!(%err, "failed to publish machine metadata");
        }
    });

    info!("remote sync started");
    Ok(RemoteSync {
        client,
        initial_updates: vec![state_task, metadata_task],
    })
}
