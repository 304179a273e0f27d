//! Background eviction of idle sessions

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use parley_core::session::SessionStore;

/// Periodically drops sessions nobody has touched for `ttl`.
///
/// A `ttl` of zero keeps sessions for the life of the process.
pub struct SessionSweeper {
    store: Arc<SessionStore>,
    ttl: Duration,
    interval: Duration,
    running: Arc<RwLock<bool>>,
    task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl SessionSweeper {
    pub fn new(store: Arc<SessionStore>, ttl: Duration, interval: Duration) -> Self {
        Self {
            store,
            ttl,
            interval,
            running: Arc::new(RwLock::new(false)),
            task: Arc::new(RwLock::new(None)),
        }
    }

    /// Start the sweep loop
    pub async fn start(&self) {
        if self.ttl.is_zero() || self.interval.is_zero() {
            info!("Session sweeper disabled");
            return;
        }

        {
            let running_guard = self.running.read().await;
            if *running_guard {
                debug!("Session sweeper already running");
                return;
            }
        }

        *self.running.write().await = true;

        let store = Arc::clone(&self.store);
        let running = Arc::clone(&self.running);
        let ttl = self.ttl;
        let interval = self.interval;

        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !*running.read().await {
                    break;
                }
                let removed = store.evict_idle(Instant::now(), ttl);
                if removed > 0 {
                    info!(removed, remaining = store.len(), "Evicted idle sessions");
                }
            }
        });

        *self.task.write().await = Some(task);
        info!(
            "Session sweeper started (ttl {}s, every {}s)",
            ttl.as_secs(),
            interval.as_secs()
        );
    }

    /// Stop the sweep loop
    pub async fn stop(&self) {
        *self.running.write().await = false;

        let mut task_guard = self.task.write().await;
        if let Some(task) = task_guard.take() {
            task.abort();
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Run one eviction pass now
    pub fn sweep_once(&self) -> usize {
        if self.ttl.is_zero() {
            return 0;
        }
        self.store.evict_idle(Instant::now(), self.ttl)
    }
}
