//! HTTPS registration of the machine record.
//!
//! `metadata` and `daemonState` are sent and returned as base64 cipher
//! output; only versions and the machine id are readable by the authority.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::client::{open_value, MachineSnapshot};
use super::crypto::{encrypt_json, Cipher};
use crate::models::machine::{DaemonState, MachineMetadata, Versioned};
use crate::{AppError, Result};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterMachineRequest<'a> {
    id: &'a str,
    metadata: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    daemon_state: Option<String>,
}

/// Machine record returned by the authority.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMachine {
    /// Machine identity.
    pub id: String,
    /// Current metadata, sealed.
    #[serde(default)]
    pub metadata: Value,
    /// Version of `metadata`.
    #[serde(default)]
    pub metadata_version: u64,
    /// Current daemon state, sealed.
    #[serde(default)]
    pub daemon_state: Value,
    /// Version of `daemon_state`.
    #[serde(default)]
    pub daemon_state_version: u64,
}

#[derive(Deserialize)]
struct RegisterMachineResponse {
    machine: RemoteMachine,
}

impl RemoteMachine {
    /// Versions and values opened with `cipher`, for seeding the sync
    /// client. A value that cannot be opened is treated as absent; its
    /// version is still adopted.
    #[must_use]
    pub fn snapshot(&self, cipher: &dyn Cipher) -> MachineSnapshot {
        MachineSnapshot {
            metadata: Versioned::new(open_value(cipher, &self.metadata), self.metadata_version),
            daemon_state: Versioned::new(
                open_value(cipher, &self.daemon_state),
                self.daemon_state_version,
            ),
        }
    }
}

/// REST client for the remote authority.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base: String,
    token: String,
    http: reqwest::Client,
}

impl ApiClient {
    /// Client for `server_url` authenticating with `token`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Sync` if the HTTP client cannot be built.
    pub fn new(server_url: &str, token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|err| AppError::Sync(format!("failed to build http client: {err}")))?;
        Ok(Self {
            base: server_url.trim_end_matches('/').to_owned(),
            token: token.to_owned(),
            http,
        })
    }

    /// Create the machine record if absent and return its current state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Crypto` if a value cannot be sealed, or
    /// `AppError::Sync` on transport failure, a non-success status, or an
    /// unreadable body.
    pub async fn register_machine(
        &self,
        machine_id: &str,
        cipher: &dyn Cipher,
        metadata: &MachineMetadata,
        daemon_state: Option<&DaemonState>,
    ) -> Result<RemoteMachine> {
        let url = format!("{}/v1/machines", self.base);
        debug!(url, machine_id, "registering machine");
        let request = RegisterMachineRequest {
            id: machine_id,
            metadata: encrypt_json(cipher, metadata)?,
            daemon_state: daemon_state
                .map(|state| encrypt_json(cipher, state))
                .transpose()?,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .map_err(|err| AppError::Sync(format!("machine registration failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Sync(format!(
                "machine registration returned {status}: {body}"
            )));
        }

        let body: RegisterMachineResponse = response
            .json()
            .await
            .map_err(|err| AppError::Sync(format!("invalid registration response: {err}")))?;
        info!(
            machine_id = body.machine.id,
            metadata_version = body.machine.metadata_version,
            daemon_state_version = body.machine.daemon_state_version,
            "machine registered"
        );
        Ok(body.machine)
    }
}
