//! Connection registry with best-effort fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::connection::ClientConnection;

/// Live connections eligible for a broadcast.
///
/// A member whose delivery fails is removed on the spot; delivery to the
/// remaining members carries on.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<ClientConnection>>>,
    active_count: AtomicUsize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            active_count: AtomicUsize::new(0),
        }
    }

    pub async fn add(&self, connection: Arc<ClientConnection>) {
        let mut conns = self.connections.write().await;
        if conns.insert(connection.id.clone(), connection).is_none() {
            let _ = self.active_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn remove(&self, connection_id: &str) -> bool {
        let mut conns = self.connections.write().await;
        let removed = conns.remove(connection_id).is_some();
        if removed {
            let _ = self.active_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Serialize `event` once and offer it to every member.
    ///
    /// Returns the number of successful deliveries.
    pub async fn broadcast<T: Serialize>(&self, event: &T) -> usize {
        let json = match serde_json::to_string(event) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!(error = %e, "failed to serialize broadcast");
                return 0;
            }
        };

        // iterate a snapshot so membership can change underneath
        let members: Vec<Arc<ClientConnection>> =
            self.connections.read().await.values().cloned().collect();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for conn in &members {
            if conn.send(Arc::clone(&json)) {
                delivered += 1;
            } else {
                dead.push(conn.id.clone());
            }
        }
        debug!(recipients = members.len(), delivered, "broadcast");

        for id in dead {
            if self.remove(&id).await {
                debug!(conn_id = %id, "pruned connection after failed delivery");
            }
        }
        delivered
    }

    /// Number of active connections
    pub fn connection_count(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
