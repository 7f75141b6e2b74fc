#![forbid(unsafe_code)]

//! `agent-steward-ctl`: local CLI companion for `agent-steward`.
//!
//! Finds the running daemon through its state file and talks to its
//! loopback control surface.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use agent_steward::control::client::ControlClient;
use agent_steward::daemon::state_file::{DaemonPersistedState, DaemonStateStore};
use agent_steward::models::spawn::{AgentFlavor, SpawnOptions, SpawnResult};
use agent_steward::{process, AppError, DaemonConfig, Result};

#[derive(Debug, Parser)]
#[command(
    name = "agent-steward-ctl",
    about = "Local CLI for the agent-steward daemon",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum Agent {
    Claude,
    Codex,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show whether a daemon is running.
    Status,

    /// List tracked sessions.
    List,

    /// Spawn a session in a directory.
    Spawn {
        /// Working directory for the session.
        directory: PathBuf,
        /// Create the directory if it does not exist.
        #[arg(long)]
        create: bool,
        /// Agent flavor.
        #[arg(long, value_enum, default_value_t = Agent::Claude)]
        agent: Agent,
        /// Remote session to resume.
        #[arg(long)]
        resume: Option<String>,
    },

    /// Stop a session by remote id or `PID-<n>`.
    StopSession {
        /// Session identifier.
        session_id: String,
    },

    /// Ask the daemon to shut down.
    Shutdown,
}

fn main() {
    let args = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(args.command)) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run(command: Command) -> Result<()> {
    let config = DaemonConfig::load()?;
    let Some(state) = running_daemon(&config) else {
        if matches!(command, Command::Status) {
            println!("not running");
            return Ok(());
        }
        return Err(AppError::Control(
            "agent-steward is not running; start it with `agent-steward start`".into(),
        ));
    };

    let client = ControlClient::with_timeout(
        state.http_port,
        config.spawn_report_timeout + Duration::from_secs(10),
    )?;

    match command {
        Command::Status => {
            client.health().await?;
            println!(
                "running (pid {}, port {}, version {}, since {})",
                state.pid, state.http_port, state.started_with_cli_version, state.start_time
            );
            if let Some(beat) = &state.last_heartbeat {
                println!("last heartbeat: {beat}");
            }
            println!("log: {}", state.daemon_log_path);
        }
        Command::List => {
            let sessions = client.list().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&sessions).unwrap_or_default()
            );
        }
        Command::Spawn {
            directory,
            create,
            agent,
            resume,
        } => {
            let mut options = SpawnOptions::new(directory);
            options.approved_new_directory_creation = create;
            options.remote_session_id = resume;
            options.agent = match agent {
                Agent::Claude => AgentFlavor::Claude,
                Agent::Codex => AgentFlavor::Codex,
            };
            match client.spawn_session(&options).await? {
                SpawnResult::Success { session_id } => println!("spawned session {session_id}"),
                SpawnResult::RequestToApproveDirectoryCreation { directory } => {
                    println!(
                        "{} does not exist; rerun with --create to create it",
                        directory.display()
                    );
                }
                SpawnResult::Error { error_message } => {
                    return Err(AppError::Spawn(error_message));
                }
            }
        }
        Command::StopSession { session_id } => {
            if client.stop_session(&session_id).await? {
                println!("stopped {session_id}");
            } else {
                return Err(AppError::Control(format!("no session matches '{session_id}'")));
            }
        }
        Command::Shutdown => {
            client.stop_daemon().await?;
            println!("stopping");
        }
    }
    Ok(())
}

fn running_daemon(config: &DaemonConfig) -> Option<DaemonPersistedState> {
    DaemonStateStore::new(config.state_path())
        .read()
        .filter(|state| process::is_alive(state.pid))
}
