//! Unit tests for heartbeat ticks and the heartbeat loop.

use std::sync::Arc;
use std::time::Duration;

use agent_steward::daemon::state_file::{DaemonPersistedState, DaemonStateStore};
use agent_steward::lifecycle::heartbeat::{
    spawn_heartbeat_loop, DriftPolicy, Heartbeat, TickOutcome,
};
use agent_steward::lifecycle::shutdown::ShutdownSignal;
use agent_steward::lifecycle::version::{ExecutableVersionProbe, VersionProbe};
use agent_steward::models::machine::ShutdownSource;
use agent_steward::models::session::TrackedSession;
use agent_steward::orchestrator::registry::SessionRegistry;
use agent_steward::BoxFuture;
use tokio_util::sync::CancellationToken;

const VERSION: &str = "0.3.0";
const DEAD_PID: u32 = i32::MAX as u32;

struct FixedProbe(Option<String>);

impl VersionProbe for FixedProbe {
    fn installed_version(&self) -> BoxFuture<'_, Option<String>> {
        let version = self.0.clone();
        Box::pin(async move { version })
    }
}

fn persisted() -> DaemonPersistedState {
    DaemonPersistedState {
        pid: std::process::id(),
        http_port: 41_000,
        start_time: "2026-01-01T00:00:00+00:00".into(),
        started_with_cli_version: VERSION.into(),
        last_heartbeat: None,
        daemon_log_path: "/tmp/daemon.log".into(),
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    store: DaemonStateStore,
    registry: Arc<SessionRegistry>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = DaemonStateStore::new(dir.path().join("daemon.state.json"));
    store.write(&persisted()).expect("seed state");
    Fixture {
        _dir: dir,
        store,
        registry: Arc::new(SessionRegistry::new()),
    }
}

fn heartbeat(fx: &Fixture, installed: Option<&str>) -> Heartbeat {
    Heartbeat::new(
        Arc::clone(&fx.registry),
        fx.store.clone(),
        Arc::new(FixedProbe(installed.map(str::to_owned))),
        persisted(),
    )
}

#[tokio::test]
async fn tick_refreshes_last_heartbeat() {
    let fx = fixture();
    let outcome = heartbeat(&fx, Some(VERSION)).tick().await;

    assert_eq!(outcome, TickOutcome::Continue);
    let state = fx.store.read().expect("state present");
    assert!(state.last_heartbeat.is_some());
    assert_eq!(state.pid, std::process::id());
}

#[tokio::test]
async fn unknown_installed_version_is_not_drift() {
    let fx = fixture();
    assert_eq!(heartbeat(&fx, None).tick().await, TickOutcome::Continue);
}

#[tokio::test]
async fn tick_sweeps_dead_sessions() {
    let fx = fixture();
    fx.registry.register(TrackedSession::spawned(DEAD_PID, false));

    heartbeat(&fx, Some(VERSION)).tick().await;
    assert!(fx.registry.is_empty());
}

#[tokio::test]
async fn different_installed_version_is_drift() {
    let fx = fixture();
    let outcome = heartbeat(&fx, Some("0.4.0")).tick().await;

    assert_eq!(
        outcome,
        TickOutcome::VersionDrift {
            installed: "0.4.0".into()
        }
    );
    assert!(
        fx.store.read().expect("state").last_heartbeat.is_none(),
        "drift does not refresh the state"
    );
}

#[tokio::test]
async fn foreign_state_record_means_superseded() {
    let fx = fixture();
    let mut other = persisted();
    other.pid = DEAD_PID;
    fx.store.write(&other).expect("overwrite");

    let outcome = heartbeat(&fx, Some(VERSION)).tick().await;
    assert_eq!(outcome, TickOutcome::Superseded { pid: DEAD_PID });
    assert_eq!(fx.store.read().expect("state").pid, DEAD_PID, "left untouched");
}

#[tokio::test]
async fn loop_requests_shutdown_when_superseded() {
    let fx = fixture();
    let mut other = persisted();
    other.pid = DEAD_PID;
    fx.store.write(&other).expect("overwrite");

    let shutdown = ShutdownSignal::new();
    let task = spawn_heartbeat_loop(
        Arc::new(heartbeat(&fx, Some(VERSION))),
        Duration::from_millis(10),
        DriftPolicy {
            replacement_exe: None,
            grace: Duration::from_millis(10),
        },
        shutdown.clone(),
        CancellationToken::new(),
    );

    let request = tokio::time::timeout(Duration::from_secs(2), shutdown.wait())
        .await
        .expect("shutdown requested");
    assert_eq!(request.source, ShutdownSource::Exception);
    assert!(request.message.contains("superseded"));
    task.await.expect("loop exits");
}

#[tokio::test]
async fn loop_requests_shutdown_after_drift_grace() {
    let fx = fixture();
    let shutdown = ShutdownSignal::new();
    let task = spawn_heartbeat_loop(
        Arc::new(heartbeat(&fx, Some("9.9.9"))),
        Duration::from_millis(10),
        DriftPolicy {
            replacement_exe: None,
            grace: Duration::from_millis(20),
        },
        shutdown.clone(),
        CancellationToken::new(),
    );

    let request = tokio::time::timeout(Duration::from_secs(2), shutdown.wait())
        .await
        .expect("shutdown requested");
    assert_eq!(request.message, "replaced by version 9.9.9");
    task.await.expect("loop exits");
}

#[tokio::test]
async fn cancelled_loop_stops_without_shutdown() {
    let fx = fixture();
    let shutdown = ShutdownSignal::new();
    let ct = CancellationToken::new();
    let task = spawn_heartbeat_loop(
        Arc::new(heartbeat(&fx, Some(VERSION))),
        Duration::from_millis(10),
        DriftPolicy {
            replacement_exe: None,
            grace: Duration::from_secs(30),
        },
        shutdown.clone(),
        ct.clone(),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    ct.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("loop stops promptly")
        .expect("join");
    assert!(!shutdown.is_requested());
    assert!(fx.store.read().expect("state").last_heartbeat.is_some());
}

#[tokio::test]
async fn missing_executable_has_no_version() {
    let probe = ExecutableVersionProbe::new("/nonexistent/agent-steward");
    assert!(probe.installed_version().await.is_none());
}
