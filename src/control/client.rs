//! HTTP client for a running daemon's control surface.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::server::{
    ListResponse, SessionStartedRequest, StatusResponse, StopSessionRequest, StopSessionResponse,
};
use crate::models::session::{SessionMetadata, TrackedSession};
use crate::models::spawn::{SpawnOptions, SpawnResult};
use crate::{AppError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client bound to `http://127.0.0.1:<port>`.
#[derive(Debug, Clone)]
pub struct ControlClient {
    base: String,
    http: reqwest::Client,
}

impl ControlClient {
    /// Client for the daemon listening on `port`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Control` if the HTTP client cannot be built.
    pub fn new(port: u16) -> Result<Self> {
        Self::with_timeout(port, DEFAULT_TIMEOUT)
    }

    /// Client with a custom per-request timeout. Spawns can take as long as
    /// the self-report window, so callers of `spawn_session` pass a larger
    /// value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Control` if the HTTP client cannot be built.
    pub fn with_timeout(port: u16, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            base: format!("http://127.0.0.1:{port}"),
            http,
        })
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{path}", self.base);
        debug!(url, "control request");
        let response = self.http.post(&url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Control(format!("{path} returned {status}")));
        }
        Ok(response.json().await?)
    }

    /// `GET /health`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Control` if the daemon is unreachable.
    pub async fn health(&self) -> Result<()> {
        let response = self
            .http
            .get(format!("{}/health", self.base))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AppError::Control(format!(
                "/health returned {}",
                response.status()
            )))
        }
    }

    /// `POST /list`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Control` on transport or decode failure.
    pub async fn list(&self) -> Result<Vec<TrackedSession>> {
        let response: ListResponse = self.post("/list", &serde_json::json!({})).await?;
        Ok(response.children)
    }

    /// `POST /session-started`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Control` on transport or decode failure.
    pub async fn session_started(
        &self,
        session_id: &str,
        metadata: SessionMetadata,
    ) -> Result<()> {
        let body = SessionStartedRequest {
            session_id: session_id.to_owned(),
            metadata,
        };
        let _: StatusResponse = self.post("/session-started", &body).await?;
        Ok(())
    }

    /// `POST /stop-session`. Returns whether a session matched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Control` on transport or decode failure.
    pub async fn stop_session(&self, session_id: &str) -> Result<bool> {
        let body = StopSessionRequest {
            session_id: session_id.to_owned(),
        };
        let response: StopSessionResponse = self.post("/stop-session", &body).await?;
        Ok(response.success)
    }

    /// `POST /spawn-session`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Control` on transport or decode failure.
    pub async fn spawn_session(&self, options: &SpawnOptions) -> Result<SpawnResult> {
        self.post("/spawn-session", options).await
    }

    /// `POST /stop`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Control` on transport or decode failure.
    pub async fn stop_daemon(&self) -> Result<()> {
        let _: StatusResponse = self.post("/stop", &serde_json::json!({})).await?;
        Ok(())
    }
}
