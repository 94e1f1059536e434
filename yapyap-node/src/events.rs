//! Observer registry.
//!
//! A closed set of pipeline events fanned out to subscribers. The bus is
//! owned by the supervisor and handed to subcomponents by reference; there
//! is no process-global state. Listeners are observability only: a dead or
//! slow subscriber is dropped and logged, never an error the pipeline sees.

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::store::{OutboxStatus, ReplicaState};

/// Events emitted by the delivery pipeline for consumers (CLI, admin API,
/// tests) to observe.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// An inbound data message was admitted and decrypted.
    MessageReceived {
        message_id: String,
        from: String,
        payload: Value,
        timestamp: u64,
    },

    /// An outbox entry changed status.
    OutboxUpdated {
        message_id: String,
        target: String,
        status: OutboxStatus,
        attempts: u32,
    },

    /// A replica assignment changed state.
    ReplicaUpdated {
        message_id: String,
        replica: String,
        state: ReplicaState,
    },

    /// A peer connection was established.
    PeerConnected { peer_id: String },

    /// A pipeline component hit an error worth surfacing.
    NodeError { context: String, error: String },
}

/// Fan-out bus for [`NodeEvent`].
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<NodeEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber. The receiver sees every event emitted
    /// after this call.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<NodeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Emit an event to all live subscribers. Closed subscribers are
    /// pruned; emission never fails.
    pub fn emit(&self, event: NodeEvent) {
        let mut subs = self.subscribers.lock();
        let before = subs.len();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
        let dropped = before - subs.len();
        if dropped > 0 {
            tracing::debug!(dropped, "pruned closed event subscribers");
        }
    }
}
