//! In-memory session store shared by every connection

use super::store::{Session, SessionLimits};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A session behind its own lock.
///
/// The lock is synchronous: hold it only for non-suspending mutation and
/// never across an `.await`.
pub type SharedSession = Arc<Mutex<Session>>;

/// Process-lifetime map from session id to session state
#[derive(Debug)]
pub struct SessionStore {
    limits: SessionLimits,
    sessions: RwLock<HashMap<String, SharedSession>>,
}

impl SessionStore {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            limits,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    /// Get or create a session
    pub fn get_or_create(&self, id: &str) -> SharedSession {
        if let Some(existing) = self.sessions.read().get(id) {
            return Arc::clone(existing);
        }

        let mut sessions = self.sessions.write();
        let entry = sessions.entry(id.to_string()).or_insert_with(|| {
            debug!(session = %id, "Creating session");
            Arc::new(Mutex::new(Session::new(id, self.limits, Instant::now())))
        });
        Arc::clone(entry)
    }

    /// Get a session if it exists
    pub fn get(&self, id: &str) -> Option<SharedSession> {
        self.sessions.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<SharedSession> {
        self.sessions.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Drop sessions idle for longer than `ttl`.
    ///
    /// A session still referenced outside the store (a live connection holds
    /// it) is kept regardless of age. Returns the number removed.
    pub fn evict_idle(&self, now: Instant, ttl: Duration) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|id, session| {
            if Arc::strong_count(session) > 1 {
                return true;
            }
            let idle = now.saturating_duration_since(session.lock().last_active());
            let keep = idle < ttl;
            if !keep {
                debug!(session = %id, idle_secs = idle.as_secs(), "Evicting idle session");
            }
            keep
        });
        before - sessions.len()
    }
}
