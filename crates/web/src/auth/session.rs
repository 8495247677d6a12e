//! Web UI sessions
//!
//! Sessions are opaque 64 hex char ids with a fixed wall-clock lifetime.
//! Expired entries are dropped lazily when presented and by a periodic sweep.

use chrono::{DateTime, Duration, Utc};
use flint_common::credentials::random_hex;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Session cookie name
pub const SESSION_COOKIE: &str = "flint_session";

/// Session lifetime, also used as the cookie Max-Age
pub const SESSION_TTL_SECS: i64 = 24 * 60 * 60;

/// How often expired sessions are swept
pub const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60 * 60);

const SESSION_ID_BYTES: usize = 32;

/// In-memory session table
#[derive(Debug)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, DateTime<Utc>>>,
    ttl: Duration,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl: Duration::seconds(SESSION_TTL_SECS),
        }
    }

    /// Issue a new session id
    pub fn create_session(&self) -> flint_common::Result<String> {
        self.create_session_at(Utc::now())
    }

    pub fn create_session_at(&self, now: DateTime<Utc>) -> flint_common::Result<String> {
        let id = random_hex(SESSION_ID_BYTES)?;
        self.sessions.write().insert(id.clone(), now + self.ttl);
        debug!(sessions = self.len(), "Session created");
        Ok(id)
    }

    /// Whether `id` names a live session
    pub fn is_valid(&self, id: &str) -> bool {
        self.is_valid_at(id, Utc::now())
    }

    pub fn is_valid_at(&self, id: &str, now: DateTime<Utc>) -> bool {
        let expiry = match self.sessions.read().get(id).copied() {
            Some(expiry) => expiry,
            None => return false,
        };

        if now > expiry {
            // Re-check under the write lock; another request may have replaced it
            let mut sessions = self.sessions.write();
            if sessions.get(id).is_some_and(|e| now > *e) {
                sessions.remove(id);
            }
            return false;
        }

        true
    }

    /// Remove every session that has expired as of `now`
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, expiry| now <= *expiry);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the periodic sweep. The task runs until the returned handle is
    /// stopped or dropped.
    pub fn start_sweeper(self: &Arc<Self>, every: std::time::Duration) -> SweeperHandle {
        let manager = Arc::clone(self);
        spawn_sweeper("sessions", every, move || manager.sweep_at(Utc::now()))
    }
}

/// Run `sweep` every `every` until the returned handle is stopped or
/// dropped. `sweep` returns how many entries it removed.
pub(crate) fn spawn_sweeper<F>(
    what: &'static str,
    every: std::time::Duration,
    sweep: F,
) -> SweeperHandle
where
    F: Fn() -> usize + Send + 'static,
{
    let token = CancellationToken::new();
    let cancelled = token.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = sweep();
                    if removed > 0 {
                        debug!(removed, "Swept expired {}", what);
                    }
                }
            }
        }
        debug!("Sweeper for {} stopped", what);
    });

    SweeperHandle {
        token,
        task: Some(task),
    }
}

/// Owner of the background sweep task
#[derive(Debug)]
pub struct SweeperHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Cancel the sweep and wait for the task to finish
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
