//! Store-and-forward routing.
//!
//! When a recipient is unreachable, the originator replicates the message
//! to up to K connected relay peers. Each relay stores the carried message
//! in its own outbox (original sender preserved) and attempts delivery
//! until its own TTL expires. Replica state is tracked locally so the
//! originator knows which relays acknowledged storage; a later delivery
//! receipt flips the whole set to delivered.

use std::sync::Arc;

use crate::config::NodeConfig;
use crate::envelope::{self, Envelope};
use crate::events::{EventBus, NodeEvent};
use crate::inbound::{AckOutcome, AckRegistry};
use crate::store::{OutboxEntry, ReplicaState, Store};
use crate::transport::Transport;

pub struct SafRouter {
    store: Store,
    transport: Arc<Transport>,
    acks: Arc<AckRegistry>,
    events: Arc<EventBus>,
    config: Arc<NodeConfig>,
    local_peer_id: String,
}

impl SafRouter {
    pub fn new(
        store: Store,
        transport: Arc<Transport>,
        acks: Arc<AckRegistry>,
        events: Arc<EventBus>,
        config: Arc<NodeConfig>,
        local_peer_id: String,
    ) -> Self {
        Self {
            store,
            transport,
            acks,
            events,
            config,
            local_peer_id,
        }
    }

    /// Pick relay candidates from the connected set: never the target or
    /// ourselves, trusted contacts first, then freshest routing entries.
    pub(crate) fn select_relays(&self, target: &str, connected: &[String]) -> Vec<String> {
        let mut candidates: Vec<(bool, u64, String)> = connected
            .iter()
            .filter(|peer| peer.as_str() != target && peer.as_str() != self.local_peer_id)
            .map(|peer| {
                let trusted = self
                    .store
                    .get_contact(peer)
                    .ok()
                    .flatten()
                    .map(|c| c.is_trusted)
                    .unwrap_or(false);
                let last_seen = self
                    .store
                    .get_routing(peer)
                    .ok()
                    .flatten()
                    .map(|r| r.last_seen)
                    .unwrap_or(0);
                (trusted, last_seen, peer.clone())
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.cmp(&a.1))
                .then(a.2.cmp(&b.2))
        });
        candidates
            .into_iter()
            .take(self.config.relay_fanout)
            .map(|(_, _, peer)| peer)
            .collect()
    }

    /// Replicate `data` to relay peers. Existing `(message, relay)`
    /// assignments are no-ops; new relays are topped up to the fan-out.
    /// Returns how many replicas are currently stored (or delivered).
    pub async fn replicate(&self, entry: &OutboxEntry, data: &Envelope) -> usize {
        let connected = self.transport.connected_peers();
        let relays = self.select_relays(&entry.target_peer_id, &connected);
        if relays.is_empty() {
            tracing::debug!(msg_id = %entry.message_id, "no relay candidates available");
        }

        for relay in relays {
            match self.store.assign_replica(&entry.message_id, &relay) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!(msg_id = %entry.message_id, %relay, "replica assignment failed: {e}");
                    continue;
                }
            }
            self.events.emit(NodeEvent::ReplicaUpdated {
                message_id: entry.message_id.clone(),
                replica: relay.clone(),
                state: ReplicaState::Assigned,
            });

            let saf =
                Envelope::new_store_and_forward(&self.local_peer_id, &relay, data.clone());
            let outcome = self.send_to_relay(&relay, &saf).await;
            match outcome {
                Ok(()) => {
                    if let Err(e) = self.store.mark_replica_stored(&entry.message_id, &relay) {
                        tracing::warn!(msg_id = %entry.message_id, "replica update failed: {e}");
                        continue;
                    }
                    tracing::info!(msg_id = %entry.message_id, %relay, "replica stored");
                    self.events.emit(NodeEvent::ReplicaUpdated {
                        message_id: entry.message_id.clone(),
                        replica: relay.clone(),
                        state: ReplicaState::Stored,
                    });
                }
                Err(reason) => {
                    tracing::warn!(msg_id = %entry.message_id, %relay, %reason, "replica store failed");
                    if let Err(e) =
                        self.store
                            .mark_replica_failed(&entry.message_id, &relay, &reason)
                    {
                        tracing::warn!(msg_id = %entry.message_id, "replica update failed: {e}");
                    }
                    self.events.emit(NodeEvent::ReplicaUpdated {
                        message_id: entry.message_id.clone(),
                        replica: relay.clone(),
                        state: ReplicaState::Failed,
                    });
                }
            }
        }

        self.store
            .list_replicas(&entry.message_id)
            .map(|replicas| {
                replicas
                    .iter()
                    .filter(|r| {
                        matches!(r.state, ReplicaState::Stored | ReplicaState::Delivered)
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    /// Send the carrier envelope and wait for the relay's ACK.
    async fn send_to_relay(&self, relay: &str, saf: &Envelope) -> Result<(), String> {
        let bytes = envelope::to_bytes(saf).map_err(|e| e.to_string())?;
        let ack_rx = self.acks.register(saf.id());

        if let Err(e) = self.transport.deliver(relay, &bytes).await {
            self.acks.forget(saf.id());
            return Err(e.to_string());
        }

        let wait = std::time::Duration::from_millis(self.config.ack_timeout_ms);
        match tokio::time::timeout(wait, ack_rx).await {
            Ok(Ok(AckOutcome::Ack)) => Ok(()),
            Ok(Ok(AckOutcome::Nak(reason))) => Err(format!("nak:{reason}")),
            Ok(Err(_)) => Err("ack channel dropped".to_string()),
            Err(_) => {
                self.acks.forget(saf.id());
                Err("ack-timeout".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::now_ms;
    use crate::store::{Contact, OutboxStatus, RoutingEntry};
    use crate::transport::{MemNetwork, MemTransport, RawInbound};
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    fn router_with(store: Store, transport: Arc<Transport>, acks: Arc<AckRegistry>) -> SafRouter {
        let config = NodeConfig {
            relay_fanout: 2,
            ack_timeout_ms: 500,
            ..NodeConfig::default()
        };
        SafRouter::new(
            store,
            transport,
            acks,
            Arc::new(EventBus::new()),
            Arc::new(config),
            "local".to_string(),
        )
    }

    fn entry(message_id: &str, target: &str) -> OutboxEntry {
        OutboxEntry {
            message_id: message_id.to_string(),
            target_peer_id: target.to_string(),
            status: OutboxStatus::Processing,
            attempts: 8,
            next_retry_at: 0,
            expires_at: now_ms() + 60_000,
            last_error: None,
            message_blob: Vec::new(),
        }
    }

    fn mem_transport(net: &MemNetwork, peer: &str) -> (Arc<Transport>, mpsc::Receiver<RawInbound>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Arc::new(Transport::Mem(MemTransport::new(net.clone(), peer, tx))),
            rx,
        )
    }

    #[test]
    fn relay_selection_excludes_target_and_self_prefers_trusted() {
        let store = Store::open_memory().unwrap();
        let net = MemNetwork::new();
        let (transport, _rx) = mem_transport(&net, "local");
        let router = router_with(store.clone(), transport, Arc::new(AckRegistry::new()));

        store
            .upsert_contact(&Contact {
                peer_id: "trusted".to_string(),
                last_seen: 10,
                metadata: serde_json::Value::Null,
                is_trusted: true,
            })
            .unwrap();
        store
            .upsert_routing(&RoutingEntry {
                peer_id: "fresh".to_string(),
                last_seen: 99_999,
                multiaddrs: vec![],
                is_available: true,
                ttl: 0,
            })
            .unwrap();
        store
            .upsert_routing(&RoutingEntry {
                peer_id: "stale".to_string(),
                last_seen: 1,
                multiaddrs: vec![],
                is_available: true,
                ttl: 0,
            })
            .unwrap();

        let connected: Vec<String> = ["target", "local", "trusted", "fresh", "stale"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let relays = router.select_relays("target", &connected);

        assert_eq!(relays, vec!["trusted".to_string(), "fresh".to_string()]);
    }

    #[tokio::test]
    async fn replicate_stores_on_cooperative_relay() {
        let store = Store::open_memory().unwrap();
        let net = MemNetwork::new();
        let (transport, _local_rx) = mem_transport(&net, "local");
        let (relay_tx, mut relay_rx) = mpsc::channel::<RawInbound>(16);
        net.register("relay-1", relay_tx);

        let acks = Arc::new(AckRegistry::new());
        let router = router_with(store.clone(), transport, Arc::clone(&acks));

        // Cooperative relay: acks every carrier envelope it sees.
        let relay_acks = Arc::clone(&acks);
        tokio::spawn(async move {
            while let Some(raw) = relay_rx.recv().await {
                let env = envelope::from_bytes(&raw.frame).unwrap();
                relay_acks.resolve(env.id(), AckOutcome::Ack);
            }
        });

        let data = Envelope::new_data("local", "target", "cGF5bG9hZA==".to_string(), 1, BTreeMap::new());
        let entry = entry("m1", "target");
        let stored = router.replicate(&entry, &data).await;

        assert_eq!(stored, 1);
        let replicas = store.list_replicas("m1").unwrap();
        assert_eq!(replicas.len(), 1);
        assert_eq!(replicas[0].replica_peer_id, "relay-1");
        assert_eq!(replicas[0].state, ReplicaState::Stored);

        // A second round is a no-op: the pair is already assigned.
        let stored = router.replicate(&entry, &data).await;
        assert_eq!(stored, 1);
        assert_eq!(store.list_replicas("m1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replicate_marks_unresponsive_relay_failed() {
        let store = Store::open_memory().unwrap();
        let net = MemNetwork::new();
        let (transport, _local_rx) = mem_transport(&net, "local");
        let (relay_tx, _relay_rx) = mpsc::channel::<RawInbound>(16);
        net.register("relay-1", relay_tx);

        let acks = Arc::new(AckRegistry::new());
        let router = router_with(store.clone(), transport, Arc::clone(&acks));

        let data = Envelope::new_data("local", "target", "cGF5bG9hZA==".to_string(), 1, BTreeMap::new());
        let stored = router.replicate(&entry("m1", "target"), &data).await;

        assert_eq!(stored, 0);
        let replicas = store.list_replicas("m1").unwrap();
        assert_eq!(replicas[0].state, ReplicaState::Failed);
        assert_eq!(replicas[0].last_error.as_deref(), Some("ack-timeout"));
    }

    #[tokio::test]
    async fn replicate_with_no_candidates_is_declined() {
        let store = Store::open_memory().unwrap();
        let net = MemNetwork::new();
        let (transport, _local_rx) = mem_transport(&net, "local");
        let router = router_with(store.clone(), transport, Arc::new(AckRegistry::new()));

        let data = Envelope::new_data("local", "target", "cGF5bG9hZA==".to_string(), 1, BTreeMap::new());
        let stored = router.replicate(&entry("m1", "target"), &data).await;
        assert_eq!(stored, 0);
        assert!(store.list_replicas("m1").unwrap().is_empty());
    }
}
