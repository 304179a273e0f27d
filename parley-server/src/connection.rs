//! One live client, decoupled from the transport.
//!
//! A connection is an id plus a bounded outbound queue; a separate writer
//! task drains the queue into the socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

/// Outbound frames buffered per connection before sends start failing
pub const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct ClientConnection {
    pub id: String,
    /// Remote address, for records and logs
    pub peer: String,
    tx: mpsc::Sender<Arc<String>>,
    drops: AtomicU64,
}

impl ClientConnection {
    pub fn new(id: impl Into<String>, peer: impl Into<String>, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id: id.into(),
            peer: peer.into(),
            tx,
            drops: AtomicU64::new(0),
        }
    }

    /// Queue a serialized frame. A full or closed queue counts as a failed
    /// delivery and returns `false`.
    pub fn send(&self, frame: Arc<String>) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                let _ = self.drops.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Serialize and queue any outbound value
    pub fn send_json<T: Serialize>(&self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send(Arc::new(json)),
            Err(e) => {
                warn!(conn_id = %self.id, error = %e, "failed to serialize outbound frame");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Total failed deliveries over the connection's life
    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}
