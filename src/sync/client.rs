//! Machine-scoped sync client with optimistic-concurrency field updates.
//!
//! The remote machine record has two independently versioned fields,
//! `metadata` and `daemonState`. Each has its own async mutex: updates to the
//! same field run one at a time, updates to different fields interleave.
//!
//! An update applies a mutator to the last known value and sends it with
//! the last known version. On `version-mismatch` the authority's value and
//! version are adopted and the mutator is re-applied to them, so only the
//! accepted attempt's result is ever stored remotely.
//!
//! Field values travel encrypted: the daemon sends base64 cipher output and
//! the authority echoes values back in the same form.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::channel::SyncTransport;
use super::crypto::{decrypt_json, encrypt_json, Cipher};
use super::protocol::{UpdateAck, EVENT_UPDATE_METADATA, EVENT_UPDATE_STATE};
use crate::models::machine::{DaemonState, MachineMetadata, Versioned};
use crate::{AppError, Result};

/// Retry policy for optimistic updates.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the retry delay.
    pub max_delay: Duration,
    /// Total time allowed for one update, retries included.
    pub budget: Duration,
    /// How long to wait for each ack.
    pub ack_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            budget: Duration::from_secs(300),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

/// Machine record as last seen by this client.
#[derive(Debug, Clone, Default)]
pub struct MachineSnapshot {
    /// `metadata` field.
    pub metadata: Versioned<Option<MachineMetadata>>,
    /// `daemonState` field.
    pub daemon_state: Versioned<Option<DaemonState>>,
}

struct FieldSpec {
    event: &'static str,
    key: &'static str,
}

const METADATA_FIELD: FieldSpec = FieldSpec {
    event: EVENT_UPDATE_METADATA,
    key: "metadata",
};

const DAEMON_STATE_FIELD: FieldSpec = FieldSpec {
    event: EVENT_UPDATE_STATE,
    key: "daemonState",
};

/// Client for the machine record.
pub struct MachineSyncClient {
    machine_id: String,
    transport: Arc<dyn SyncTransport>,
    cipher: Arc<dyn Cipher>,
    metadata: Mutex<Versioned<Option<MachineMetadata>>>,
    daemon_state: Mutex<Versioned<Option<DaemonState>>>,
    policy: RetryPolicy,
}

impl MachineSyncClient {
    /// Client seeded with `snapshot`, sending over `transport` and sealing
    /// field values with `cipher`.
    #[must_use]
    pub fn new(
        machine_id: String,
        transport: Arc<dyn SyncTransport>,
        cipher: Arc<dyn Cipher>,
        snapshot: MachineSnapshot,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            machine_id,
            transport,
            cipher,
            metadata: Mutex::new(snapshot.metadata),
            daemon_state: Mutex::new(snapshot.daemon_state),
            policy,
        }
    }

    /// Machine identity.
    #[must_use]
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// Last adopted daemon state and its version.
    pub async fn daemon_state(&self) -> Versioned<Option<DaemonState>> {
        self.daemon_state.lock().await.clone()
    }

    /// Last adopted metadata and its version.
    pub async fn metadata(&self) -> Versioned<Option<MachineMetadata>> {
        self.metadata.lock().await.clone()
    }

    /// Apply `mutator` to the daemon state and push it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Sync` if the authority reports an error, or
    /// `AppError::Timeout` if the retry budget runs out.
    pub async fn update_daemon_state<F>(&self, mutator: F) -> Result<DaemonState>
    where
        F: Fn(Option<&DaemonState>) -> DaemonState + Send + Sync,
    {
        self.update_field(&self.daemon_state, &DAEMON_STATE_FIELD, mutator)
            .await
    }

    /// Apply `mutator` to the metadata and push it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Sync` if the authority reports an error, or
    /// `AppError::Timeout` if the retry budget runs out.
    pub async fn update_metadata<F>(&self, mutator: F) -> Result<MachineMetadata>
    where
        F: Fn(Option<&MachineMetadata>) -> MachineMetadata + Send + Sync,
    {
        self.update_field(&self.metadata, &METADATA_FIELD, mutator)
            .await
    }

    async fn update_field<T, F>(
        &self,
        field: &Mutex<Versioned<Option<T>>>,
        target: &FieldSpec,
        mutator: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send,
        F: Fn(Option<&T>) -> T + Send + Sync,
    {
        let mut current = field.lock().await;
        let deadline = Instant::now() + self.policy.budget;
        let mut backoff = Backoff::new(self.policy.initial_delay, self.policy.max_delay);

        loop {
            let next = mutator(current.value.as_ref());
            let encoded = encrypt_json(self.cipher.as_ref(), &next)
                .map_err(|err| AppError::Sync(format!("failed to seal {}: {err}", target.key)))?;
            let mut payload = Map::new();
            payload.insert("machineId".to_owned(), Value::String(self.machine_id.clone()));
            payload.insert(target.key.to_owned(), Value::String(encoded));
            payload.insert("expectedVersion".to_owned(), Value::from(current.version));

            match self
                .transport
                .emit_with_ack(target.event, Value::Object(payload), self.policy.ack_timeout)
                .await
            {
                Ok(raw) => match serde_json::from_value::<UpdateAck>(raw) {
                    Ok(UpdateAck::Success { version, value }) => {
                        let adopted = open_value(self.cipher.as_ref(), &value).unwrap_or(next);
                        *current = Versioned::new(Some(adopted.clone()), version);
                        debug!(field = target.key, version, "update accepted");
                        return Ok(adopted);
                    }
                    Ok(UpdateAck::VersionMismatch { version, value }) => {
                        info!(
                            field = target.key,
                            expected = current.version,
                            actual = version,
                            "version mismatch, adopting remote value"
                        );
                        *current = Versioned::new(open_value(self.cipher.as_ref(), &value), version);
                    }
                    Ok(UpdateAck::Error { message }) => {
                        let message = message.unwrap_or_else(|| "unspecified error".to_owned());
                        warn!(field = target.key, message, "update rejected, abandoning");
                        return Err(AppError::Sync(format!("{} rejected: {message}", target.key)));
                    }
                    Err(err) => {
                        warn!(field = target.key, %err, "unreadable update ack");
                    }
                },
                Err(err) => warn!(field = target.key, %err, "update not acknowledged"),
            }

            let delay = backoff.next_delay();
            if Instant::now() + delay > deadline {
                return Err(AppError::Timeout(format!(
                    "{} update did not converge within {:?}",
                    target.key, self.policy.budget
                )));
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// Close the underlying channel.
    pub async fn shutdown(&self) {
        self.transport.close().await;
    }
}

/// Decrypt a field value echoed by the authority; `None` when it is absent
/// or cannot be opened with `cipher`.
pub(crate) fn open_value<T: DeserializeOwned>(cipher: &dyn Cipher, value: &Value) -> Option<T> {
    let Value::String(sealed) = value else {
        return None;
    };
    match decrypt_json(cipher, sealed) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            warn!(%err, "ignoring unreadable field value");
            None
        }
    }
}
