//! Typed RPC methods served to the remote authority.
//!
//! Requests arrive as `<machineId>:<method>` with encrypted JSON params. The
//! dispatcher decrypts, validates into an [`RpcRequest`], hands it to an
//! [`RpcHandler`], and encrypts the reply.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, info_span, warn, Instrument};

use super::channel::RpcService;
use super::crypto::{decrypt_json, encrypt_json, Cipher};
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::models::machine::ShutdownSource;
use crate::models::spawn::{SpawnOptions, SpawnResult};
use crate::orchestrator::registry::SessionRegistry;
use crate::orchestrator::spawner::SessionSpawner;
use crate::{AppError, BoxFuture, Result};

/// `spawn-session` method name.
pub const METHOD_SPAWN_SESSION: &str = "spawn-session";
/// `stop-session` method name.
pub const METHOD_STOP_SESSION: &str = "stop-session";
/// `request-shutdown` method name.
pub const METHOD_REQUEST_SHUTDOWN: &str = "request-shutdown";

const METHODS: [&str; 3] = [
    METHOD_SPAWN_SESSION,
    METHOD_STOP_SESSION,
    METHOD_REQUEST_SHUTDOWN,
];

/// A validated RPC request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcRequest {
    /// Spawn a session.
    SpawnSession(SpawnOptions),
    /// Stop a session by remote id or `PID-<n>`.
    StopSession {
        /// Target session.
        session_id: String,
    },
    /// Ask the daemon to shut down.
    RequestShutdown,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopSessionParams {
    session_id: String,
}

impl RpcRequest {
    /// Validate decrypted `params` for the unqualified `method`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` for unknown methods or invalid params.
    pub fn parse(method: &str, params: Value) -> Result<Self> {
        match method {
            METHOD_SPAWN_SESSION => {
                let options: SpawnOptions = serde_json::from_value(params)
                    .map_err(|err| AppError::Rpc(format!("invalid spawn params: {err}")))?;
                if options.directory.as_os_str().is_empty() {
                    return Err(AppError::Rpc("spawn requires a directory".into()));
                }
                Ok(Self::SpawnSession(options))
            }
            METHOD_STOP_SESSION => {
                let params: StopSessionParams = serde_json::from_value(params)
                    .map_err(|err| AppError::Rpc(format!("invalid stop params: {err}")))?;
                if params.session_id.trim().is_empty() {
                    return Err(AppError::Rpc("stop requires a sessionId".into()));
                }
                Ok(Self::StopSession {
                    session_id: params.session_id,
                })
            }
            METHOD_REQUEST_SHUTDOWN => Ok(Self::RequestShutdown),
            other => Err(AppError::Rpc(format!("unknown method '{other}'"))),
        }
    }
}

/// Reply to a stop or shutdown request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcMessage {
    /// Human-readable outcome.
    pub message: String,
}

/// Reply sent when a request could not be handled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcError {
    /// Reason.
    pub error: String,
}

/// Daemon operations reachable over RPC.
pub trait RpcHandler: Send + Sync {
    /// Spawn a session.
    fn spawn_session(&self, options: SpawnOptions) -> BoxFuture<'_, SpawnResult>;
    /// Stop a session; `false` if it was not found.
    fn stop_session(&self, session_id: &str) -> bool;
    /// Publish a remote shutdown request.
    fn request_shutdown(&self);
}

/// [`RpcHandler`] backed by the daemon's spawner, registry and shutdown
/// signal.
pub struct DaemonRpcHandler {
    spawner: Arc<SessionSpawner>,
    registry: Arc<SessionRegistry>,
    shutdown: ShutdownSignal,
}

impl DaemonRpcHandler {
    /// Handler over the daemon's components.
    #[must_use]
    pub fn new(
        spawner: Arc<SessionSpawner>,
        registry: Arc<SessionRegistry>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            spawner,
            registry,
            shutdown,
        }
    }
}

impl RpcHandler for DaemonRpcHandler {
    fn spawn_session(&self, options: SpawnOptions) -> BoxFuture<'_, SpawnResult> {
        Box::pin(self.spawner.spawn(options))
    }

    fn stop_session(&self, session_id: &str) -> bool {
        self.registry.stop(session_id)
    }

    fn request_shutdown(&self) {
        self.shutdown
            .request(ShutdownSource::Remote, "shutdown requested by remote authority");
    }
}

/// Decrypting dispatcher registered on the sync channel.
pub struct RpcDispatcher {
    machine_id: String,
    cipher: Arc<dyn Cipher>,
    handler: Arc<dyn RpcHandler>,
}

impl RpcDispatcher {
    /// Dispatcher for `machine_id`'s methods.
    #[must_use]
    pub fn new(machine_id: String, cipher: Arc<dyn Cipher>, handler: Arc<dyn RpcHandler>) -> Self {
        Self {
            machine_id,
            cipher,
            handler,
        }
    }

    /// Handle a validated request and build its plaintext reply.
    pub async fn handle(&self, request: RpcRequest) -> Value {
        let reply = match request {
            RpcRequest::SpawnSession(options) => {
                serde_json::to_value(self.handler.spawn_session(options).await)
            }
            RpcRequest::StopSession { session_id } => {
                let message = if self.handler.stop_session(&session_id) {
                    "Session stopped"
                } else {
                    "Session not found"
                };
                serde_json::to_value(RpcMessage {
                    message: message.to_owned(),
                })
            }
            RpcRequest::RequestShutdown => {
                self.handler.request_shutdown();
                serde_json::to_value(RpcMessage {
                    message: "Shutdown initiated".to_owned(),
                })
            }
        };
        reply.unwrap_or(Value::Null)
    }

    /// Every request gets a sealed reply; refusals travel as `{error}`.
    async fn dispatch(&self, method: &str, params: &str) -> Result<String> {
        let name = method
            .strip_prefix(&self.machine_id)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| AppError::Rpc(format!("method '{method}' is not for this machine")));

        let request = name.and_then(|name| {
            let params: Value = decrypt_json(self.cipher.as_ref(), params)?;
            RpcRequest::parse(name, params)
        });
        let reply = match request {
            Ok(request) => {
                info!(method, "handling rpc request");
                self.handle(request).await
            }
            Err(err) => {
                warn!(method, %err, "rejecting rpc request");
                serde_json::to_value(RpcError {
                    error: err.to_string(),
                })
                .unwrap_or(Value::Null)
            }
        };
        encrypt_json(self.cipher.as_ref(), &reply)
    }
}

impl RpcService for RpcDispatcher {
    fn methods(&self) -> Vec<String> {
        METHODS
            .iter()
            .map(|name| format!("{}:{name}", self.machine_id))
            .collect()
    }

    fn call(&self, method: String, params: String) -> BoxFuture<'_, Result<String>> {
        let span = info_span!("rpc", method = %method);
        Box::pin(async move { self.dispatch(&method, &params).await }.instrument(span))
    }
}
