//! In-memory registry of tracked child sessions keyed by OS pid, plus the
//! pending self-report awaiters for freshly spawned children.
//!
//! The maps are guarded by a plain mutex that is never held across an
//! `.await`. Webhook reports and awaiter registration may arrive in either
//! order: a report that lands first is kept on the session, and a later
//! awaiter resolves immediately from it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::models::session::{SessionMetadata, StartedBy, TrackedSession};
use crate::{process, AppError, Result};

/// What a self-report did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// A daemon-spawned entry was confirmed (and its awaiter resolved).
    ConfirmedSpawned,
    /// An already-known external entry was refreshed.
    UpdatedExternal,
    /// A previously unknown process was registered as external.
    RegisteredExternal,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<u32, TrackedSession>,
    awaiters: HashMap<u32, oneshot::Sender<TrackedSession>>,
}

/// Registry of tracked sessions and their pending awaiters.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite the entry for `session.pid`.
    pub fn register(&self, session: TrackedSession) {
        debug!(pid = session.pid, started_by = ?session.started_by, "session registered");
        self.lock().sessions.insert(session.pid, session);
    }

    /// Register a daemon-spawned child.
    ///
    /// If the child already reported itself before the spawner got here, the
    /// reported id and metadata are kept.
    pub fn register_spawned(&self, mut session: TrackedSession) {
        let mut inner = self.lock();
        if let Some(early) = inner.sessions.get(&session.pid) {
            if session.remote_session_id.is_none() {
                session.remote_session_id.clone_from(&early.remote_session_id);
            }
            if session.metadata.is_none() {
                session.metadata.clone_from(&early.metadata);
            }
            debug!(pid = session.pid, "spawned child had already reported itself");
        }
        inner.sessions.insert(session.pid, session);
    }

    /// Snapshot of every tracked session.
    #[must_use]
    pub fn list(&self) -> Vec<TrackedSession> {
        self.lock().sessions.values().cloned().collect()
    }

    /// Entry for `pid`, if tracked.
    #[must_use]
    pub fn get(&self, pid: u32) -> Option<TrackedSession> {
        self.lock().sessions.get(&pid).cloned()
    }

    /// Number of tracked sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the entry for `pid`. Removing an unknown pid is a no-op.
    pub fn remove(&self, pid: u32) -> Option<TrackedSession> {
        let removed = self.lock().sessions.remove(&pid);
        if removed.is_some() {
            debug!(pid, "session removed");
        }
        removed
    }

    /// Find a session by the id it reported.
    #[must_use]
    pub fn find_by_remote_id(&self, remote_session_id: &str) -> Option<TrackedSession> {
        self.lock()
            .sessions
            .values()
            .find(|s| s.remote_session_id.as_deref() == Some(remote_session_id))
            .cloned()
    }

    /// Stop the session addressed by `session_id` (a remote id or
    /// `PID-<n>`).
    ///
    /// Daemon-spawned children are signalled through their handle, external
    /// sessions by raw pid. The entry is removed whether or not the signal
    /// lands. Returns `false` when nothing matched.
    pub fn stop(&self, session_id: &str) -> bool {
        let target = self.find_by_remote_id(session_id).or_else(|| {
            session_id
                .strip_prefix("PID-")
                .and_then(|raw| raw.parse::<u32>().ok())
                .and_then(|pid| self.get(pid))
        });
        let Some(session) = target else {
            debug!(session_id, "stop requested for unknown session");
            return false;
        };

        let signalled = match (&session.child, session.started_by) {
            (Some(handle), StartedBy::Daemon) => handle.terminate(),
            _ => process::terminate(session.pid),
        };
        if let Err(err) = signalled {
            warn!(pid = session.pid, %err, "failed to signal session");
        }
        self.remove(session.pid);
        info!(pid = session.pid, session_id, "session stopped");
        true
    }

    /// Drop every entry whose process is no longer alive. Returns the
    /// removed pids.
    pub fn sweep_dead(&self, is_alive: impl Fn(u32) -> bool) -> Vec<u32> {
        let mut inner = self.lock();
        let dead: Vec<u32> = inner
            .sessions
            .keys()
            .copied()
            .filter(|pid| !is_alive(*pid))
            .collect();
        for pid in &dead {
            inner.sessions.remove(pid);
        }
        drop(inner);

        if !dead.is_empty() {
            info!(pids = ?dead, "removed dead sessions");
        }
        dead
    }

    /// Apply a self-report from the webhook.
    ///
    /// Daemon-spawned entries are updated in place and their awaiter is
    /// resolved; unknown pids become external entries.
    pub fn record_report(
        &self,
        pid: u32,
        remote_session_id: String,
        metadata: SessionMetadata,
    ) -> ReportOutcome {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let outcome = match inner.sessions.get_mut(&pid) {
            Some(existing) => {
                existing.remote_session_id = Some(remote_session_id);
                existing.metadata = Some(metadata);
                match existing.started_by {
                    StartedBy::Daemon => ReportOutcome::ConfirmedSpawned,
                    StartedBy::External => ReportOutcome::UpdatedExternal,
                }
            }
            None => {
                inner.sessions.insert(
                    pid,
                    TrackedSession::external(pid, remote_session_id, metadata),
                );
                ReportOutcome::RegisteredExternal
            }
        };

        let resolved = inner.sessions.get(&pid).cloned();
        let waiter = inner.awaiters.remove(&pid);
        drop(guard);

        if let (Some(tx), Some(session)) = (waiter, resolved) {
            // The receiver may have timed out already.
            let _ = tx.send(session);
        }
        outcome
    }

    /// Fulfil the awaiter for `pid`, if any. A second resolution is ignored.
    pub fn resolve_report(&self, pid: u32, session: TrackedSession) {
        let waiter = self.lock().awaiters.remove(&pid);
        match waiter {
            Some(tx) => {
                let _ = tx.send(session);
            }
            None => debug!(pid, "no pending awaiter to resolve"),
        }
    }

    /// Whether an awaiter is pending for `pid`.
    #[must_use]
    pub fn has_awaiter(&self, pid: u32) -> bool {
        self.lock().awaiters.contains_key(&pid)
    }

    /// Wait until `pid` reports itself, or `timeout` elapses.
    ///
    /// A session that already carries a remote id resolves immediately. On
    /// timeout the awaiter is removed but the session entry is left alone.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Timeout` if no report arrives in time.
    pub async fn await_report(&self, pid: u32, timeout: Duration) -> Result<TrackedSession> {
        let rx = {
            let mut inner = self.lock();
            if let Some(session) = inner.sessions.get(&pid) {
                if session.remote_session_id.is_some() {
                    return Ok(session.clone());
                }
            }
            let (tx, rx) = oneshot::channel();
            if inner.awaiters.insert(pid, tx).is_some() {
                warn!(pid, "replaced an existing awaiter");
            }
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(_closed)) => Err(AppError::Timeout(format!(
                "awaiter for pid {pid} was dropped before a report arrived"
            ))),
            Err(_elapsed) => {
                self.lock().awaiters.remove(&pid);
                Err(AppError::Timeout(format!(
                    "session with pid {pid} did not report within {timeout:?}"
                )))
            }
        }
    }
}
