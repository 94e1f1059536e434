//! Inbound stream processing.
//!
//! Consumes `(authenticated peer, frame)` pairs from the transport, decodes
//! them, and runs the admission pipeline: dedup, sequence high-water mark,
//! vector clock merge, and the variant-specific side effect, all in one
//! storage transaction. Acknowledgements go back on a freshly opened
//! stream. ACK/NAK frames are correlated to waiting dispatch workers
//! through the [`AckRegistry`]; with no waiter they fall through to direct
//! outbox transitions (the late-ACK and delivery-receipt paths).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::NodeConfig;
use crate::envelope::{self, Envelope};
use crate::error::NakReason;
use crate::events::{EventBus, NodeEvent};
use crate::identity::NodeIdentity;
use crate::now_ms;
use crate::sealed;
use crate::store::{AdmissionEffect, OutboxStatus, RoutingEntry, Store};
use crate::transport::{RawInbound, Transport};

/// Resolution of a pending acknowledgement wait.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    Ack,
    Nak(NakReason),
}

/// Correlates inbound ACK/NAK envelopes to dispatch workers waiting on
/// `original_message_id`.
#[derive(Default)]
pub struct AckRegistry {
    waiting: Mutex<HashMap<String, oneshot::Sender<AckOutcome>>>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a message id. A later registration for the
    /// same id replaces the earlier one.
    pub fn register(&self, message_id: &str) -> oneshot::Receiver<AckOutcome> {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(message_id.to_string(), tx);
        rx
    }

    /// Hand an outcome to the waiter, if any. Returns whether a waiter
    /// consumed it.
    pub fn resolve(&self, message_id: &str, outcome: AckOutcome) -> bool {
        match self.waiting.lock().remove(message_id) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn forget(&self, message_id: &str) {
        self.waiting.lock().remove(message_id);
    }
}

/// The stream handler side of the pipeline.
pub struct InboundProcessor {
    store: Store,
    identity: NodeIdentity,
    transport: Arc<Transport>,
    acks: Arc<AckRegistry>,
    events: Arc<EventBus>,
    config: Arc<NodeConfig>,
}

impl InboundProcessor {
    pub fn new(
        store: Store,
        identity: NodeIdentity,
        transport: Arc<Transport>,
        acks: Arc<AckRegistry>,
        events: Arc<EventBus>,
        config: Arc<NodeConfig>,
    ) -> Self {
        Self {
            store,
            identity,
            transport,
            acks,
            events,
            config,
        }
    }

    /// Drive the inbound channel until shutdown.
    pub async fn run(self, mut rx: mpsc::Receiver<RawInbound>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                raw = rx.recv() => match raw {
                    Some(raw) => self.handle_frame(raw).await,
                    None => break,
                },
            }
        }
        tracing::debug!("inbound processor stopped");
    }

    pub(crate) async fn handle_frame(&self, raw: RawInbound) {
        let envelope = match envelope::from_bytes(&raw.frame) {
            Ok(env) => env,
            Err(e) => {
                // The id was never decodable; drop the stream with no reply.
                tracing::warn!(peer = %raw.peer_id, "undecodable inbound envelope: {e}");
                return;
            }
        };
        self.touch_routing(&raw.peer_id);

        match envelope {
            Envelope::Ack {
                original_message_id,
                from,
                ..
            } => self.handle_ack(&from, &original_message_id).await,
            Envelope::Nak {
                original_message_id,
                reason,
                from,
                ..
            } => self.handle_nak(&from, &original_message_id, &reason).await,
            data @ Envelope::Data { .. } => self.handle_data(&raw.peer_id, data).await,
            saf @ Envelope::StoreAndForward { .. } => {
                self.handle_store_and_forward(&raw.peer_id, saf).await
            }
        }
    }

    /// Keep the routing table fresh from observed traffic.
    fn touch_routing(&self, peer_id: &str) {
        let multiaddrs = match self.store.get_routing(peer_id) {
            Ok(Some(existing)) => existing.multiaddrs,
            _ => Vec::new(),
        };
        let entry = RoutingEntry {
            peer_id: peer_id.to_string(),
            last_seen: now_ms(),
            multiaddrs,
            is_available: true,
            ttl: self.config.default_ttl_ms,
        };
        if let Err(e) = self.store.upsert_routing(&entry) {
            tracing::warn!(peer = %peer_id, "routing upsert failed: {e}");
        }
    }

    async fn handle_ack(&self, from: &str, original_message_id: &str) {
        if self
            .acks
            .resolve(original_message_id, AckOutcome::Ack)
        {
            return;
        }

        // No worker is waiting: late ACK after a timeout, or a delivery
        // receipt forwarded by a relay.
        tracing::debug!(%from, msg_id = %original_message_id, "uncorrelated ack");
        match self.store.mark_delivered(original_message_id) {
            Ok(true) => {
                if let Ok(Some(entry)) = self.store.outbox_entry(original_message_id) {
                    self.events.emit(NodeEvent::OutboxUpdated {
                        message_id: entry.message_id,
                        target: entry.target_peer_id,
                        status: OutboxStatus::Delivered,
                        attempts: entry.attempts,
                    });
                }
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(msg_id = %original_message_id, "ack transition failed: {e}");
                return;
            }
        }
        match self.store.mark_replicas_delivered(original_message_id) {
            Ok(0) => {}
            Ok(_) => {
                if let Ok(replicas) = self.store.list_replicas(original_message_id) {
                    for replica in replicas {
                        self.events.emit(NodeEvent::ReplicaUpdated {
                            message_id: replica.message_id,
                            replica: replica.replica_peer_id,
                            state: replica.state,
                        });
                    }
                }
            }
            Err(e) => {
                tracing::warn!(msg_id = %original_message_id, "replica transition failed: {e}")
            }
        }
    }

    async fn handle_nak(&self, from: &str, original_message_id: &str, reason: &str) {
        let reason = NakReason::parse(reason);
        if self
            .acks
            .resolve(original_message_id, AckOutcome::Nak(reason.clone()))
        {
            return;
        }

        tracing::debug!(%from, msg_id = %original_message_id, %reason, "uncorrelated nak");
        let result = if reason.is_terminal() {
            self.store
                .mark_failed(original_message_id, &format!("nak:{reason}"))
                .map(|_| ())
        } else {
            self.store.schedule_retry(
                original_message_id,
                now_ms() + self.config.backoff_base_ms,
                &format!("nak:{reason}"),
            )
        };
        if let Err(e) = result {
            tracing::error!(msg_id = %original_message_id, "nak transition failed: {e}");
        }
    }

    async fn handle_data(&self, transport_peer: &str, envelope: Envelope) {
        let Envelope::Data {
            id,
            from,
            to,
            timestamp,
            payload,
            sequence_number,
            vector_clock,
            ..
        } = envelope
        else {
            return;
        };

        if to != self.identity.peer_id() {
            tracing::warn!(peer = %transport_peer, msg_id = %id, "data not addressed to us");
            self.send_nak(transport_peer, &id, &NakReason::UnknownRecipient)
                .await;
            return;
        }

        let plaintext = match sealed::open(self.identity.signing_key(), &payload) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(peer = %transport_peer, msg_id = %id, "payload decrypt failed: {e}");
                self.send_nak(transport_peer, &id, &NakReason::DecryptFailed)
                    .await;
                return;
            }
        };
        let payload_value: Value = match serde_json::from_slice(&plaintext) {
            Ok(v) => v,
            Err(_) => Value::String(String::from_utf8_lossy(&plaintext).into_owned()),
        };

        let admission = self.store.persist_incoming_atomically(
            &id,
            &from,
            sequence_number,
            &vector_clock,
            AdmissionEffect::Inbox {
                payload: payload_value.to_string(),
                timestamp,
            },
        );
        match admission {
            Err(e) => {
                // No ACK on a storage fault; the sender retries.
                tracing::error!(msg_id = %id, "admission failed: {e}");
                self.events.emit(NodeEvent::NodeError {
                    context: "inbound admission".to_string(),
                    error: e.to_string(),
                });
            }
            Ok(admission) if admission.duplicate => {
                // Idempotent acknowledgement: our earlier ACK may have been
                // lost.
                tracing::debug!(msg_id = %id, "duplicate message, re-acking");
                self.send_ack(transport_peer, &id).await;
            }
            Ok(_) => {
                tracing::info!(peer = %from, msg_id = %id, seq = sequence_number, "message admitted");
                self.events.emit(NodeEvent::MessageReceived {
                    message_id: id.clone(),
                    from: from.clone(),
                    payload: payload_value,
                    timestamp,
                });
                self.send_ack(transport_peer, &id).await;
            }
        }
    }

    async fn handle_store_and_forward(&self, transport_peer: &str, envelope: Envelope) {
        let Envelope::StoreAndForward {
            id,
            from,
            to,
            stored_message,
            ..
        } = envelope
        else {
            return;
        };

        if to != self.identity.peer_id() {
            self.send_nak(transport_peer, &id, &NakReason::UnknownRecipient)
                .await;
            return;
        }
        let stored = *stored_message;
        if !matches!(stored, Envelope::Data { .. }) {
            tracing::warn!(peer = %transport_peer, msg_id = %id, "store-and-forward carrying non-data envelope");
            self.send_nak(
                transport_peer,
                &id,
                &NakReason::Other("malformed-stored-message".to_string()),
            )
            .await;
            return;
        }

        // Edge case: we are the final recipient; admit directly and still
        // acknowledge the carrier envelope.
        if stored.to_peer() == self.identity.peer_id() {
            self.handle_data(transport_peer, stored).await;
            self.send_ack(transport_peer, &id).await;
            return;
        }

        let carried_id = stored.id().to_string();
        let carried_target = stored.to_peer().to_string();
        let blob = match envelope::to_bytes(&stored) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(msg_id = %id, "carried envelope re-encode failed: {e}");
                return;
            }
        };

        // If the carried message is already in our outbox (a second relay
        // assignment through a different carrier), only record the marker.
        let effect = match self.store.outbox_entry(&carried_id) {
            Ok(Some(_)) => AdmissionEffect::None,
            Ok(None) => AdmissionEffect::RelayOutbox {
                message_id: carried_id.clone(),
                target_peer_id: carried_target.clone(),
                blob,
                next_retry_at: now_ms(),
                expires_at: now_ms() + self.config.default_ttl_ms,
            },
            Err(e) => {
                tracing::error!(msg_id = %id, "outbox lookup failed: {e}");
                return;
            }
        };

        match self
            .store
            .persist_incoming_atomically(&id, &from, 0, &BTreeMap::new(), effect)
        {
            Err(e) => {
                tracing::error!(msg_id = %id, "store-and-forward admission failed: {e}");
                self.events.emit(NodeEvent::NodeError {
                    context: "relay admission".to_string(),
                    error: e.to_string(),
                });
            }
            Ok(admission) => {
                if admission.applied {
                    tracing::info!(
                        origin = %from,
                        msg_id = %carried_id,
                        target = %carried_target,
                        "stored carried message for forwarding"
                    );
                    self.events.emit(NodeEvent::OutboxUpdated {
                        message_id: carried_id,
                        target: carried_target,
                        status: OutboxStatus::Pending,
                        attempts: 0,
                    });
                }
                self.send_ack(transport_peer, &id).await;
            }
        }
    }

    async fn send_ack(&self, to: &str, original_message_id: &str) {
        let ack = Envelope::new_ack(self.identity.peer_id(), to, original_message_id);
        self.send_reply(to, &ack).await;
    }

    async fn send_nak(&self, to: &str, original_message_id: &str, reason: &NakReason) {
        let nak = Envelope::new_nak(self.identity.peer_id(), to, original_message_id, reason);
        self.send_reply(to, &nak).await;
    }

    async fn send_reply(&self, to: &str, reply: &Envelope) {
        let bytes = match envelope::to_bytes(reply) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("reply encode failed: {e}");
                return;
            }
        };
        if let Err(e) = self.transport.deliver(to, &bytes).await {
            tracing::debug!(peer = %to, kind = reply.type_str(), "reply delivery failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemNetwork, MemTransport};

    struct Fixture {
        processor: InboundProcessor,
        store: Store,
        identity: NodeIdentity,
        acks: Arc<AckRegistry>,
        events: mpsc::UnboundedReceiver<NodeEvent>,
        /// Frames the processor sent back to `sender`.
        sender_rx: mpsc::Receiver<RawInbound>,
        sender: NodeIdentity,
    }

    fn fixture() -> Fixture {
        let store = Store::open_memory().unwrap();
        let identity = NodeIdentity::load_or_create(&store).unwrap();
        let sender_store = Store::open_memory().unwrap();
        let sender = NodeIdentity::load_or_create(&sender_store).unwrap();

        let net = MemNetwork::new();
        let (node_tx, _node_rx) = mpsc::channel(16);
        let transport = Arc::new(Transport::Mem(MemTransport::new(
            net.clone(),
            identity.peer_id(),
            node_tx,
        )));
        let (sender_tx, sender_rx) = mpsc::channel(16);
        net.register(sender.peer_id(), sender_tx);

        let acks = Arc::new(AckRegistry::new());
        let bus = Arc::new(EventBus::new());
        let events = bus.subscribe();
        let config = Arc::new(NodeConfig::default());

        let processor = InboundProcessor::new(
            store.clone(),
            identity.clone(),
            Arc::clone(&transport),
            Arc::clone(&acks),
            bus,
            config,
        );
        Fixture {
            processor,
            store,
            identity,
            acks,
            events,
            sender_rx,
            sender,
        }
    }

    fn sealed_data(fx: &Fixture, payload: &str, seq: u64) -> Envelope {
        let recipient = crate::identity::verifying_key_for(fx.identity.peer_id()).unwrap();
        let sealed = sealed::seal(&recipient, payload.as_bytes()).unwrap();
        Envelope::new_data(
            fx.sender.peer_id(),
            fx.identity.peer_id(),
            sealed,
            seq,
            BTreeMap::new(),
        )
    }

    fn raw(fx: &Fixture, env: &Envelope) -> RawInbound {
        RawInbound {
            peer_id: fx.sender.peer_id().to_string(),
            frame: envelope::to_bytes(env).unwrap(),
        }
    }

    async fn next_reply(fx: &mut Fixture) -> Envelope {
        let raw = fx.sender_rx.recv().await.expect("reply frame");
        envelope::from_bytes(&raw.frame).unwrap()
    }

    #[tokio::test]
    async fn data_admitted_and_acked() {
        let mut fx = fixture();
        let env = sealed_data(&fx, r#"{"content":"hi"}"#, 1);
        let id = env.id().to_string();

        fx.processor.handle_frame(raw(&fx, &env)).await;

        let reply = next_reply(&mut fx).await;
        match reply {
            Envelope::Ack {
                original_message_id,
                ..
            } => assert_eq!(original_message_id, id),
            other => panic!("expected ack, got {other:?}"),
        }
        assert!(fx.store.is_processed(&id).unwrap());
        assert_eq!(fx.store.peer_sequence(fx.sender.peer_id()).unwrap(), 1);
        let inbox = fx.store.list_inbox(10).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].payload["content"], "hi");
        assert!(matches!(
            fx.events.try_recv().unwrap(),
            NodeEvent::MessageReceived { .. }
        ));
    }

    #[tokio::test]
    async fn duplicate_still_acked_but_emitted_once() {
        let mut fx = fixture();
        let env = sealed_data(&fx, r#"{"content":"once"}"#, 1);

        fx.processor.handle_frame(raw(&fx, &env)).await;
        fx.processor.handle_frame(raw(&fx, &env)).await;

        assert!(matches!(next_reply(&mut fx).await, Envelope::Ack { .. }));
        assert!(matches!(next_reply(&mut fx).await, Envelope::Ack { .. }));
        assert_eq!(fx.store.list_inbox(10).unwrap().len(), 1);

        let mut received = 0;
        while let Ok(event) = fx.events.try_recv() {
            if matches!(event, NodeEvent::MessageReceived { .. }) {
                received += 1;
            }
        }
        assert_eq!(received, 1);
    }

    #[tokio::test]
    async fn undecryptable_payload_nakked_not_admitted() {
        let mut fx = fixture();
        let mut env = sealed_data(&fx, "ignored", 1);
        if let Envelope::Data { payload, .. } = &mut env {
            // Seal for someone else entirely.
            let other_store = Store::open_memory().unwrap();
            let other = NodeIdentity::load_or_create(&other_store).unwrap();
            let vk = crate::identity::verifying_key_for(other.peer_id()).unwrap();
            *payload = sealed::seal(&vk, b"for someone else").unwrap();
        }
        let id = env.id().to_string();

        fx.processor.handle_frame(raw(&fx, &env)).await;

        match next_reply(&mut fx).await {
            Envelope::Nak {
                original_message_id,
                reason,
                ..
            } => {
                assert_eq!(original_message_id, id);
                assert_eq!(reason, "decrypt-failed");
            }
            other => panic!("expected nak, got {other:?}"),
        }
        assert!(!fx.store.is_processed(&id).unwrap());
    }

    #[tokio::test]
    async fn misaddressed_data_nakked() {
        let mut fx = fixture();
        let mut env = sealed_data(&fx, "x", 1);
        if let Envelope::Data { to, .. } = &mut env {
            *to = fx.sender.peer_id().to_string();
        }
        fx.processor.handle_frame(raw(&fx, &env)).await;
        match next_reply(&mut fx).await {
            Envelope::Nak { reason, .. } => assert_eq!(reason, "unknown-recipient"),
            other => panic!("expected nak, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ack_resolves_registered_waiter() {
        let fx = fixture();
        let rx = fx.acks.register("m1");
        let ack = Envelope::new_ack(fx.sender.peer_id(), fx.identity.peer_id(), "m1");
        fx.processor.handle_frame(raw(&fx, &ack)).await;
        assert_eq!(rx.await.unwrap(), AckOutcome::Ack);
    }

    #[tokio::test]
    async fn nak_reason_reaches_waiter() {
        let fx = fixture();
        let rx = fx.acks.register("m2");
        let nak = Envelope::new_nak(
            fx.sender.peer_id(),
            fx.identity.peer_id(),
            "m2",
            &NakReason::Busy,
        );
        fx.processor.handle_frame(raw(&fx, &nak)).await;
        assert_eq!(rx.await.unwrap(), AckOutcome::Nak(NakReason::Busy));
    }

    #[tokio::test]
    async fn uncorrelated_ack_marks_delivered_and_replicas() {
        let fx = fixture();
        fx.store
            .enqueue_outbound("m3", "peer-x", b"blob", 0, now_ms() + 60_000)
            .unwrap();
        fx.store.assign_replica("m3", "relay-1").unwrap();
        fx.store.mark_replica_stored("m3", "relay-1").unwrap();

        let ack = Envelope::new_ack(fx.sender.peer_id(), fx.identity.peer_id(), "m3");
        fx.processor.handle_frame(raw(&fx, &ack)).await;

        let entry = fx.store.outbox_entry("m3").unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Delivered);
        let replicas = fx.store.list_replicas("m3").unwrap();
        assert!(
            replicas
                .iter()
                .all(|r| r.state == crate::store::ReplicaState::Delivered)
        );
    }

    #[tokio::test]
    async fn relay_stores_carried_message() {
        let mut fx = fixture();
        // A third party is the final recipient.
        let final_store = Store::open_memory().unwrap();
        let final_recipient = NodeIdentity::load_or_create(&final_store).unwrap();
        let vk = crate::identity::verifying_key_for(final_recipient.peer_id()).unwrap();
        let sealed_payload = sealed::seal(&vk, br#"{"content":"carried"}"#).unwrap();
        let data = Envelope::new_data(
            fx.sender.peer_id(),
            final_recipient.peer_id(),
            sealed_payload,
            1,
            BTreeMap::new(),
        );
        let carried_id = data.id().to_string();
        let saf =
            Envelope::new_store_and_forward(fx.sender.peer_id(), fx.identity.peer_id(), data);
        let saf_id = saf.id().to_string();

        fx.processor.handle_frame(raw(&fx, &saf)).await;

        match next_reply(&mut fx).await {
            Envelope::Ack {
                original_message_id,
                ..
            } => assert_eq!(original_message_id, saf_id),
            other => panic!("expected ack, got {other:?}"),
        }
        let entry = fx.store.outbox_entry(&carried_id).unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Pending);
        assert_eq!(entry.target_peer_id, final_recipient.peer_id());
        // The carried blob decodes back to the original data envelope with
        // the origin sender preserved.
        let carried = envelope::from_bytes(&entry.message_blob).unwrap();
        assert_eq!(carried.from_peer(), fx.sender.peer_id());
        // Nothing landed in the relay's own inbox.
        assert!(fx.store.list_inbox(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn storage_conflict_on_admission_sends_no_ack() {
        let mut fx = fixture();
        // Pre-occupy the inbox row so the admission transaction collides
        // and rolls back (marker insert succeeds, inbox insert fails).
        let env = sealed_data(&fx, r#"{"content":"x"}"#, 1);
        let id = env.id().to_string();
        fx.store
            .persist_incoming_atomically(
                &id,
                "someone",
                1,
                &BTreeMap::new(),
                AdmissionEffect::Inbox {
                    payload: "{}".to_string(),
                    timestamp: 0,
                },
            )
            .unwrap();
        fx.store.prune_processed(now_ms() + 1).unwrap();

        fx.processor.handle_frame(raw(&fx, &env)).await;

        // The inbox PK collision forced a rollback: no marker, no ACK.
        assert!(!fx.store.is_processed(&id).unwrap());
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), fx.sender_rx.recv())
                .await
                .is_err()
        );
    }
}
