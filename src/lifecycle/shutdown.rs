//! Single-fire shutdown request shared by every trigger.
//!
//! Signals, the panic hook, the control surface `/stop`, the heartbeat and
//! the remote `request-shutdown` RPC all publish here. Only the first request
//! is recorded; later ones are logged and dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::models::machine::ShutdownSource;

/// A recorded shutdown request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownRequest {
    /// Who asked.
    pub source: ShutdownSource,
    /// Free-form reason, logged during shutdown.
    pub message: String,
}

struct Inner {
    request: OnceLock<ShutdownRequest>,
    fired: CancellationToken,
    started: AtomicBool,
    watchdog: Option<Duration>,
}

/// Cloneable handle to the daemon's shutdown request.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    /// Signal without a watchdog.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Signal that force-exits the process with status 1 if graceful
    /// shutdown has not begun within `grace` of the first request.
    #[must_use]
    pub fn with_watchdog(grace: Duration) -> Self {
        Self::build(Some(grace))
    }

    fn build(watchdog: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                request: OnceLock::new(),
                fired: CancellationToken::new(),
                started: AtomicBool::new(false),
                watchdog,
            }),
        }
    }

    /// Publish a shutdown request. Returns `true` if this call won.
    pub fn request(&self, source: ShutdownSource, message: impl Into<String>) -> bool {
        let request = ShutdownRequest {
            source,
            message: message.into(),
        };
        if let Err(rejected) = self.inner.request.set(request) {
            debug!(source = ?rejected.source, "shutdown already requested, ignoring");
            return false;
        }
        info!(?source, "shutdown requested");
        self.inner.fired.cancel();

        if let Some(grace) = self.inner.watchdog {
            let inner = Arc::clone(&self.inner);
            // A plain thread so a wedged runtime cannot starve it.
            std::thread::spawn(move || {
                std::thread::sleep(grace);
                if !inner.started.load(Ordering::SeqCst) {
                    error!("graceful shutdown did not start in time, forcing exit");
                    std::process::exit(1);
                }
            });
        }
        true
    }

    /// The recorded request, if any.
    #[must_use]
    pub fn requested(&self) -> Option<ShutdownRequest> {
        self.inner.request.get().cloned()
    }

    /// Whether a request has been published.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.inner.request.get().is_some()
    }

    /// Wait for the first request.
    pub async fn wait(&self) -> ShutdownRequest {
        self.inner.fired.cancelled().await;
        self.requested().unwrap_or(ShutdownRequest {
            source: ShutdownSource::Exception,
            message: "shutdown fired without a request".to_owned(),
        })
    }

    /// Token cancelled when the first request lands.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.inner.fired.clone()
    }

    /// Record that graceful shutdown has begun, disarming the watchdog.
    pub fn mark_started(&self) {
        self.inner.started.store(true, Ordering::SeqCst);
    }
}
