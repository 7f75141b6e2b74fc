#![forbid(unsafe_code)]

//! Background daemon binary for `agent-steward`.
//!
//! `run` keeps the daemon in the foreground (this is what every detached
//! launch executes); `start` launches it detached and waits until its
//! control surface answers.

use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use agent_steward::control::client::ControlClient;
use agent_steward::daemon::state_file::DaemonStateStore;
use agent_steward::lifecycle::daemon::{Daemon, DaemonDeps, StartOutcome};
use agent_steward::lifecycle::handoff::spawn_detached_daemon;
use agent_steward::lifecycle::shutdown::ShutdownSignal;
use agent_steward::lifecycle::signals::{install_panic_hook, install_signal_handlers};
use agent_steward::lifecycle::version::ExecutableVersionProbe;
use agent_steward::{process, AppError, DaemonConfig, Result};

const WATCHDOG_GRACE: Duration = Duration::from_secs(1);
const DRIFT_GRACE: Duration = Duration::from_secs(30);
const HANDOFF_WAIT: Duration = Duration::from_secs(10);
const START_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-steward", about = "Agent session supervisor daemon", version, long_about = None)]
struct Cli {
    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon in the foreground.
    Run,
    /// Start the daemon in the background and wait until it is reachable.
    Start,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let config = DaemonConfig::load()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?;

    match args.command {
        Command::Run => {
            let log_path = init_file_tracing(&config, args.log_format)?;
            runtime.block_on(run_daemon(config, log_path))
        }
        Command::Start => {
            init_tracing(args.log_format, config.debug)?;
            runtime.block_on(start_background(&config))
        }
    }
}

async fn run_daemon(config: DaemonConfig, log_path: PathBuf) -> Result<()> {
    info!(version = config.version, home = %config.home_dir.display(), "agent-steward bootstrap");

    let shutdown = ShutdownSignal::with_watchdog(WATCHDOG_GRACE);
    install_signal_handlers(shutdown.clone());
    install_panic_hook(shutdown.clone());

    let exe = std::env::current_exe()
        .map_err(|err| AppError::Config(format!("cannot locate own executable: {err}")))?;
    let deps = DaemonDeps {
        shutdown,
        probe: Arc::new(ExecutableVersionProbe::new(&exe)),
        replacement_exe: Some(exe),
        drift_grace: DRIFT_GRACE,
        handoff_wait: HANDOFF_WAIT,
        log_path,
    };

    match Daemon::start(config, deps).await {
        Ok(StartOutcome::Running(daemon)) => {
            let request = daemon.run_until_shutdown().await;
            info!(source = ?request.source, "agent-steward shut down");
            Ok(())
        }
        Ok(StartOutcome::AlreadyRunning { pid, http_port }) => {
            info!(pid, http_port, "daemon already running, exiting");
            Ok(())
        }
        Ok(StartOutcome::LockUnavailable) => {
            info!("another instance holds the lock, exiting");
            Ok(())
        }
        Err(err) => {
            error!(%err, "daemon startup failed");
            Err(err)
        }
    }
}

async fn start_background(config: &DaemonConfig) -> Result<()> {
    let store = DaemonStateStore::new(config.state_path());
    if let Some(state) = store.read() {
        if process::is_alive(state.pid) && state.started_with_cli_version == config.version {
            println!(
                "agent-steward already running (pid {}, port {})",
                state.pid, state.http_port
            );
            return Ok(());
        }
    }

    let exe = std::env::current_exe()
        .map_err(|err| AppError::Config(format!("cannot locate own executable: {err}")))?;
    let launched = spawn_detached_daemon(&exe)?;
    info!(pid = launched, "waiting for daemon to come up");

    let deadline = Instant::now() + START_TIMEOUT;
    while Instant::now() < deadline {
        if let Some(state) = store.read() {
            if state.started_with_cli_version == config.version
                && ControlClient::new(state.http_port)?.health().await.is_ok()
            {
                println!(
                    "agent-steward started (pid {}, port {})",
                    state.pid, state.http_port
                );
                return Ok(());
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    Err(AppError::Timeout(format!(
        "daemon did not become reachable within {} seconds",
        START_TIMEOUT.as_secs()
    )))
}

fn env_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }))
}

fn init_tracing(log_format: LogFormat, debug: bool) -> Result<()> {
    let subscriber = fmt()
        .with_env_filter(env_filter(debug))
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }
    Ok(())
}

/// Log to `<home>/logs/<timestamp>-daemon.log` and return its path.
fn init_file_tracing(config: &DaemonConfig, log_format: LogFormat) -> Result<PathBuf> {
    let dir = config.logs_dir();
    fs::create_dir_all(&dir)
        .map_err(|err| AppError::Config(format!("failed to create {}: {err}", dir.display())))?;
    let path = dir.join(format!(
        "{}-daemon.log",
        chrono::Local::now().format("%Y-%m-%d-%H-%M-%S")
    ));
    let file = File::create(&path)
        .map_err(|err| AppError::Config(format!("failed to create log file: {err}")))?;

    let subscriber = fmt()
        .with_env_filter(env_filter(config.debug))
        .with_ansi(false)
        .with_writer(Mutex::new(file));

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }
    Ok(path)
}
