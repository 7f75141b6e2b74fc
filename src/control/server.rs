//! Loopback HTTP control surface.
//!
//! Serves local clients (the ctl binary, freshly spawned sessions reporting
//! themselves, a newer daemon asking this one to stop) on an ephemeral port
//! bound to `127.0.0.1`. The port is published through the state file.
//!
//! ## Endpoints
//!
//! | Method | Path | Body | Response |
//! |---|---|---|---|
//! | POST | `/session-started` | `{sessionId, metadata}` | `{status:"ok"}` |
//! | POST | `/list` | | `{children:[...]}` |
//! | POST | `/stop-session` | `{sessionId}` | `{success}` |
//! | POST | `/spawn-session` | spawn options | tagged spawn result |
//! | POST | `/stop` | | `{status:"stopping"}` |
//! | GET | `/health` | | `ok` |

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::lifecycle::shutdown::ShutdownSignal;
use crate::models::machine::ShutdownSource;
use crate::models::session::{SessionMetadata, TrackedSession};
use crate::models::spawn::{SpawnOptions, SpawnResult};
use crate::orchestrator::registry::{ReportOutcome, SessionRegistry};
use crate::orchestrator::spawner::SessionSpawner;
use crate::{AppError, Result};

/// Shared handler state.
#[derive(Clone)]
pub struct ControlState {
    /// Tracked sessions.
    pub registry: Arc<SessionRegistry>,
    /// Spawner used by `/spawn-session`.
    pub spawner: Arc<SessionSpawner>,
    /// Published by `/stop`.
    pub shutdown: ShutdownSignal,
}

/// Body of `/session-started`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartedRequest {
    /// Remote id of the reporting session.
    pub session_id: String,
    /// Self-described metadata; `hostPid` identifies the process.
    #[serde(default)]
    pub metadata: SessionMetadata,
}

/// Body of `/stop-session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopSessionRequest {
    /// Remote id or `PID-<n>`.
    pub session_id: String,
}

/// Response of `/stop-session`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopSessionResponse {
    /// Whether a matching session was found.
    pub success: bool,
}

/// Response of `/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    /// Every tracked session.
    pub children: Vec<TrackedSession>,
}

/// Generic `{status}` acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusResponse {
    /// `ok` or `stopping`.
    pub status: String,
}

impl StatusResponse {
    fn new(status: &str) -> Self {
        Self {
            status: status.to_owned(),
        }
    }
}

/// A running control server.
pub struct ControlServer {
    port: u16,
    ct: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

/// Bind the loopback listener on an ephemeral port.
///
/// Binding happens before the spawner is built so children can be told the
/// port.
///
/// # Errors
///
/// Returns `AppError::Control` if the socket cannot be bound.
pub async fn bind_loopback() -> Result<(TcpListener, u16)> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .map_err(|err| AppError::Control(format!("failed to bind control server: {err}")))?;
    let port = listener
        .local_addr()
        .map_err(|err| AppError::Control(format!("failed to read bound address: {err}")))?
        .port();
    Ok((listener, port))
}

/// Routes of the control surface.
pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/session-started", post(session_started))
        .route("/list", post(list_sessions))
        .route("/stop-session", post(stop_session))
        .route("/spawn-session", post(spawn_session))
        .route("/stop", post(stop_daemon))
        .route("/health", get(health))
        .with_state(state)
}

impl ControlServer {
    /// Serve `state` on an already bound listener until [`stop`](Self::stop).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Control` if the listener address cannot be read.
    pub fn start(listener: TcpListener, state: ControlState) -> Result<Self> {
        let port = listener
            .local_addr()
            .map_err(|err| AppError::Control(format!("failed to read bound address: {err}")))?
            .port();
        let ct = CancellationToken::new();
        let server_ct = ct.clone();
        let app = router(state);

        let handle = tokio::spawn(
            async move {
                info!(port, "control server listening");
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { server_ct.cancelled().await })
                    .await
                    .map_err(|err| AppError::Control(format!("control server error: {err}")))
            }
            .instrument(info_span!("control_server", port)),
        );

        Ok(Self { port, ct, handle })
    }

    /// Bound port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn stop(self) {
        self.ct.cancel();
        match self.handle.await {
            Ok(Ok(())) => info!("control server stopped"),
            Ok(Err(err)) => warn!(%err, "control server exited with error"),
            Err(err) => warn!(%err, "control server task failed"),
        }
    }
}

async fn session_started(
    State(state): State<ControlState>,
    Json(body): Json<SessionStartedRequest>,
) -> Json<StatusResponse> {
    let Some(pid) = body.metadata.host_pid else {
        warn!(session_id = body.session_id, "session report without hostPid, ignoring");
        return Json(StatusResponse::new("ok"));
    };

    let session_id = body.session_id.clone();
    let outcome = state
        .registry
        .record_report(pid, body.session_id, body.metadata);
    match outcome {
        ReportOutcome::ConfirmedSpawned => info!(pid, session_id, "spawned session reported"),
        ReportOutcome::UpdatedExternal => info!(pid, session_id, "external session updated"),
        ReportOutcome::RegisteredExternal => info!(pid, session_id, "external session registered"),
    }
    Json(StatusResponse::new("ok"))
}

async fn list_sessions(State(state): State<ControlState>) -> Json<ListResponse> {
    Json(ListResponse {
        children: state.registry.list(),
    })
}

async fn stop_session(
    State(state): State<ControlState>,
    Json(body): Json<StopSessionRequest>,
) -> Json<StopSessionResponse> {
    Json(StopSessionResponse {
        success: state.registry.stop(&body.session_id),
    })
}

async fn spawn_session(
    State(state): State<ControlState>,
    Json(options): Json<SpawnOptions>,
) -> Json<SpawnResult> {
    Json(state.spawner.spawn(options).await)
}

async fn stop_daemon(State(state): State<ControlState>) -> Json<StatusResponse> {
    info!("stop requested over control surface");
    state
        .shutdown
        .request(ShutdownSource::Local, "stop requested over control surface");
    Json(StatusResponse::new("stopping"))
}

async fn health() -> &'static str {
    "ok"
}
