//! Node supervisor.
//!
//! Owns startup and shutdown ordering and the admin surface. Startup:
//! storage → identity → transport + inbound handler → dispatch workers →
//! periodic loops. Shutdown: refuse new enqueues → signal cancellation →
//! bounded wait for in-flight work → return claims to pending → close
//! transport.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::envelope::{self, Envelope};
use crate::error::DeliveryError;
use crate::events::{EventBus, NodeEvent};
use crate::identity::{self, NodeIdentity};
use crate::inbound::{AckRegistry, InboundProcessor};
use crate::now_ms;
use crate::outbox::Dispatcher;
use crate::router::SafRouter;
use crate::sealed;
use crate::store::{
    Contact, InboxMessage, OutboxEntry, OutboxStatus, ReplicaAssignment, Store,
};
use crate::transport::{IrohTransport, MemNetwork, MemTransport, RawInbound, Transport};

/// Aggregate counters for the admin surface.
#[derive(Debug, Clone, Copy)]
pub struct NodeStats {
    pub connected_peers: usize,
    pub outbox_pending: u64,
    pub outbox_delivered: u64,
    pub outbox_failed: u64,
    pub processed_count: u64,
}

/// A running YapYap node.
pub struct Node {
    config: Arc<NodeConfig>,
    store: Store,
    identity: NodeIdentity,
    transport: Arc<Transport>,
    events: Arc<EventBus>,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl Node {
    /// Start a node over the iroh transport.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let config = Arc::new(config);
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("create data dir {}", config.data_dir))?;
        let store = Store::open(Path::new(&config.data_dir).join("yapyap.db"))
            .context("open storage")?;
        let identity = NodeIdentity::load_or_create(&store).context("load identity")?;
        let events = Arc::new(EventBus::new());

        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let transport = IrohTransport::start(
            &identity,
            config.listen_port(),
            inbound_tx,
            Arc::clone(&events),
            Duration::from_millis(config.dial_timeout_ms),
            Duration::from_millis(config.write_timeout_ms),
        )
        .await
        .context("start transport")?;

        Self::finish_start(
            config,
            store,
            identity,
            Arc::new(Transport::Iroh(transport)),
            events,
            inbound_rx,
        )
    }

    /// Start a node wired to an in-process network (integration tests).
    pub async fn start_mem(config: NodeConfig, network: &MemNetwork) -> Result<Self> {
        let config = Arc::new(config);
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("create data dir {}", config.data_dir))?;
        let store = Store::open(Path::new(&config.data_dir).join("yapyap.db"))
            .context("open storage")?;
        let identity = NodeIdentity::load_or_create(&store).context("load identity")?;
        let events = Arc::new(EventBus::new());

        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let transport = Arc::new(Transport::Mem(MemTransport::new(
            network.clone(),
            identity.peer_id(),
            inbound_tx,
        )));

        Self::finish_start(config, store, identity, transport, events, inbound_rx)
    }

    fn finish_start(
        config: Arc<NodeConfig>,
        store: Store,
        identity: NodeIdentity,
        transport: Arc<Transport>,
        events: Arc<EventBus>,
        inbound_rx: mpsc::Receiver<RawInbound>,
    ) -> Result<Self> {
        // Entries claimed by a previous process that died mid-flight go
        // straight back to pending.
        let recovered = store.release_all_processing(now_ms()).context("recover outbox")?;
        if recovered > 0 {
            tracing::info!(recovered, "returned stale in-flight entries to pending");
        }

        let acks = Arc::new(AckRegistry::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let router = SafRouter::new(
            store.clone(),
            Arc::clone(&transport),
            Arc::clone(&acks),
            Arc::clone(&events),
            Arc::clone(&config),
            identity.peer_id().to_string(),
        );
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::clone(&transport),
            Arc::clone(&acks),
            Arc::clone(&events),
            router,
            Arc::clone(&config),
            identity.peer_id().to_string(),
        );
        let mut tasks = dispatcher.spawn(shutdown_rx.clone());

        let processor = InboundProcessor::new(
            store.clone(),
            identity.clone(),
            Arc::clone(&transport),
            Arc::clone(&acks),
            Arc::clone(&events),
            Arc::clone(&config),
        );
        let processor_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            processor.run(inbound_rx, processor_shutdown).await;
        }));

        let bootstrap = config.bootstrap_peers();
        if !bootstrap.is_empty() {
            let transport = Arc::clone(&transport);
            let interval = Duration::from_millis(config.bootstrap_interval_ms.max(1));
            let mut shutdown = shutdown_rx;
            tasks.push(tokio::spawn(async move {
                loop {
                    for peer in &bootstrap {
                        let connected =
                            transport.connected_peers().iter().any(|p| p == peer);
                        if connected {
                            continue;
                        }
                        if let Err(e) = transport.ensure_connected(peer).await {
                            tracing::debug!(%peer, "bootstrap dial failed: {e}");
                        }
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                tracing::debug!("bootstrap dialer stopped");
            }));
        }

        tracing::info!(peer = %identity.peer_id(), "node started");
        Ok(Self {
            config,
            store,
            identity,
            transport,
            events,
            dispatcher,
            shutdown_tx,
            tasks: parking_lot::Mutex::new(tasks),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn peer_id(&self) -> &str {
        self.identity.peer_id()
    }

    /// Direct access to the storage engine (admin/introspection surface).
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Subscribe to pipeline events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Queue a payload for delivery to `target`. Returns the message id as
    /// soon as the entry is committed; delivery progress is observable via
    /// events and `list_outbox`.
    pub async fn enqueue_outbound(
        &self,
        target: &str,
        payload: &Value,
    ) -> Result<String, DeliveryError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(DeliveryError::ShuttingDown);
        }
        let recipient = identity::verifying_key_for(target)?;

        let active = self.store.active_outbox_count()?;
        if active >= self.config.max_outbox_entries {
            return Err(DeliveryError::OutboxFull(self.config.max_outbox_entries as usize));
        }

        let sequence = self.store.next_sequence(self.identity.peer_id())?;
        let vector_clock = self.store.vector_clock()?;
        let plaintext =
            serde_json::to_vec(payload).map_err(crate::error::CodecError::Decode)?;
        let sealed_payload = sealed::seal(&recipient, &plaintext)?;

        let data = Envelope::new_data(
            self.identity.peer_id(),
            target,
            sealed_payload,
            sequence,
            vector_clock,
        );
        let blob = envelope::to_bytes(&data)?;
        let now = now_ms();
        self.store.enqueue_outbound(
            data.id(),
            target,
            &blob,
            now,
            now + self.config.default_ttl_ms,
        )?;
        tracing::info!(msg_id = %data.id(), %target, seq = sequence, "message enqueued");
        self.events.emit(NodeEvent::OutboxUpdated {
            message_id: data.id().to_string(),
            target: target.to_string(),
            status: OutboxStatus::Pending,
            attempts: 0,
        });
        self.dispatcher.wake();
        Ok(data.id().to_string())
    }

    pub fn list_inbox(&self, limit: usize) -> Result<Vec<InboxMessage>, DeliveryError> {
        Ok(self.store.list_inbox(limit)?)
    }

    pub fn list_outbox(
        &self,
        status: Option<OutboxStatus>,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, DeliveryError> {
        Ok(self.store.list_outbox(status, limit)?)
    }

    pub fn list_replicas(&self, message_id: &str) -> Result<Vec<ReplicaAssignment>, DeliveryError> {
        Ok(self.store.list_replicas(message_id)?)
    }

    pub fn upsert_contact(
        &self,
        peer_id: &str,
        metadata: Value,
        is_trusted: bool,
    ) -> Result<bool, DeliveryError> {
        Ok(self.store.upsert_contact(&Contact {
            peer_id: peer_id.to_string(),
            last_seen: now_ms(),
            metadata,
            is_trusted,
        })?)
    }

    pub fn remove_contact(&self, peer_id: &str) -> Result<bool, DeliveryError> {
        Ok(self.store.remove_contact(peer_id)?)
    }

    pub fn list_contacts(&self) -> Result<Vec<Contact>, DeliveryError> {
        Ok(self.store.list_contacts()?)
    }

    pub fn stats(&self) -> Result<NodeStats, DeliveryError> {
        let store = self.store.stats()?;
        Ok(NodeStats {
            connected_peers: self.transport.connected_peers().len(),
            outbox_pending: store.outbox_pending + store.outbox_processing,
            outbox_delivered: store.outbox_delivered,
            outbox_failed: store.outbox_failed,
            processed_count: store.processed_count,
        })
    }

    /// Graceful shutdown. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(peer = %self.identity.peer_id(), "node shutting down");
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.shutdown_timeout_ms);
        for mut task in tasks {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut task).await.is_err() {
                task.abort();
            }
        }

        // Anything still claimed goes back to pending for the next run.
        match self.store.release_all_processing(now_ms()) {
            Ok(0) => {}
            Ok(released) => tracing::info!(released, "in-flight entries returned to pending"),
            Err(e) => tracing::error!("outbox release on shutdown failed: {e}"),
        }

        self.transport.close().await;
        tracing::info!("shutdown complete");
    }
}
