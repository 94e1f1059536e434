//! Outbox dispatch and retry scheduling.
//!
//! A pool of workers drains claimed due entries: deliver the envelope,
//! wait for the correlated ACK/NAK, transition the entry. A single waker
//! task arms one timer at the earliest pending retry and returns orphaned
//! in-flight entries to `pending`; a sweeper loop expires TTLs and runs
//! the retention prunes. Failed direct delivery backs off exponentially
//! with jitter until the store-and-forward hand-off.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::envelope::{self, Envelope};
use crate::events::{EventBus, NodeEvent};
use crate::inbound::{AckOutcome, AckRegistry};
use crate::now_ms;
use crate::router::SafRouter;
use crate::store::{OutboxEntry, OutboxStatus, Store};
use crate::transport::Transport;

/// Jitter applied around the exponential backoff delay.
const BACKOFF_JITTER: f64 = 0.2;

/// `min(cap, base · 2^(n−1))` with ±20 % jitter. `attempts` is the attempt
/// number just made (1-based).
pub fn backoff_delay_ms(attempts: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let exponent = attempts.saturating_sub(1).min(32);
    let ideal = base_ms.saturating_mul(1u64 << exponent);
    let capped = ideal.min(cap_ms).max(1);
    let jitter = rand::thread_rng().gen_range(-BACKOFF_JITTER..=BACKOFF_JITTER);
    ((capped as f64) * (1.0 + jitter)) as u64
}

pub struct Dispatcher {
    store: Store,
    transport: Arc<Transport>,
    acks: Arc<AckRegistry>,
    events: Arc<EventBus>,
    router: SafRouter,
    config: Arc<NodeConfig>,
    local_peer_id: String,
    wake: Notify,
}

impl Dispatcher {
    pub fn new(
        store: Store,
        transport: Arc<Transport>,
        acks: Arc<AckRegistry>,
        events: Arc<EventBus>,
        router: SafRouter,
        config: Arc<NodeConfig>,
        local_peer_id: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            transport,
            acks,
            events,
            router,
            config,
            local_peer_id,
            wake: Notify::new(),
        })
    }

    /// Nudge the workers (called after enqueue).
    pub fn wake(&self) {
        self.wake.notify_waiters();
    }

    /// Spawn the worker pool, the retry waker, and the TTL sweeper.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for worker in 0..self.config.dispatch_workers.max(1) {
            let this = Arc::clone(self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                this.worker_loop(worker, shutdown).await;
            }));
        }
        let this = Arc::clone(self);
        let waker_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            this.waker_loop(waker_shutdown).await;
        }));
        let this = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            this.sweeper_loop(shutdown).await;
        }));
        handles
    }

    async fn worker_loop(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        let idle = Duration::from_millis(self.config.sweeper_interval_ms.max(1));
        loop {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(idle) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            self.drain(&mut shutdown).await;
        }
        tracing::debug!(worker, "dispatch worker stopped");
    }

    /// Claim and process due entries until the queue is dry or shutdown.
    async fn drain(&self, shutdown: &mut watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let claimed = match self.store.claim_due_entries(now_ms(), self.config.claim_batch) {
                Ok(claimed) => claimed,
                Err(e) => {
                    tracing::error!("outbox claim failed: {e}");
                    return;
                }
            };
            if claimed.is_empty() {
                return;
            }
            for entry in claimed {
                if *shutdown.borrow() {
                    // Remaining claims are returned to pending by the
                    // shutdown path or the orphan sweep.
                    return;
                }
                self.process_entry(entry, shutdown).await;
            }
        }
    }

    async fn process_entry(&self, entry: OutboxEntry, shutdown: &mut watch::Receiver<bool>) {
        let now = now_ms();
        if now >= entry.expires_at {
            self.fail(&entry, "ttl-expired");
            return;
        }

        let data = match envelope::from_bytes(&entry.message_blob) {
            Ok(env) => env,
            Err(e) => {
                tracing::error!(msg_id = %entry.message_id, "stored envelope unreadable: {e}");
                self.fail(&entry, "decode");
                return;
            }
        };
        // Carried messages keep the origin sender in `from`; a relay never
        // replicates further.
        let relayed = data.from_peer() != self.local_peer_id;

        if !relayed && self.should_replicate(&entry) {
            let stored = self.router.replicate(&entry, &data).await;
            if stored > 0 {
                // Replicas hold the message now; keep the entry alive for
                // the delivery receipt with occasional direct retries.
                tracing::info!(
                    msg_id = %entry.message_id,
                    replicas = stored,
                    "replicated; awaiting delivery receipt"
                );
                self.retry(&entry, now + self.config.backoff_cap_ms, "awaiting-receipt");
                return;
            }
            if entry.attempts >= self.config.max_direct_attempts {
                self.fail(&entry, "store-and-forward exhausted");
                return;
            }
            // Immediate replication found no relays; fall through to a
            // direct attempt.
        }

        // Register before the write so an ACK racing the send is not lost.
        let ack_rx = self.acks.register(&entry.message_id);
        if let Err(e) = self
            .transport
            .deliver(&entry.target_peer_id, &entry.message_blob)
            .await
        {
            self.acks.forget(&entry.message_id);
            let delay = backoff_delay_ms(
                entry.attempts + 1,
                self.config.backoff_base_ms,
                self.config.backoff_cap_ms,
            );
            tracing::debug!(
                msg_id = %entry.message_id,
                target = %entry.target_peer_id,
                attempts = entry.attempts + 1,
                "send failed, backing off: {e}"
            );
            self.retry(&entry, now_ms() + delay, &e.to_string());
            return;
        }

        let outcome = tokio::select! {
            res = ack_rx => res.ok(),
            _ = tokio::time::sleep(Duration::from_millis(self.config.ack_timeout_ms)) => None,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    // Cancelled mid-wait: the entry stays `processing` until
                    // the orphan sweep or the shutdown path returns it.
                    self.acks.forget(&entry.message_id);
                    return;
                }
                None
            }
        };

        match outcome {
            Some(AckOutcome::Ack) => {
                if let Err(e) = self.store.mark_delivered(&entry.message_id) {
                    tracing::error!(msg_id = %entry.message_id, "delivered transition failed: {e}");
                    return;
                }
                tracing::info!(
                    msg_id = %entry.message_id,
                    target = %entry.target_peer_id,
                    attempts = entry.attempts + 1,
                    "delivered"
                );
                self.events.emit(NodeEvent::OutboxUpdated {
                    message_id: entry.message_id.clone(),
                    target: entry.target_peer_id.clone(),
                    status: OutboxStatus::Delivered,
                    attempts: entry.attempts + 1,
                });
                // The recipient has the message; any replicas are settled.
                match self.store.mark_replicas_delivered(&entry.message_id) {
                    Ok(0) | Err(_) => {}
                    Ok(_) => {
                        if let Ok(replicas) = self.store.list_replicas(&entry.message_id) {
                            for replica in replicas {
                                self.events.emit(NodeEvent::ReplicaUpdated {
                                    message_id: replica.message_id,
                                    replica: replica.replica_peer_id,
                                    state: replica.state,
                                });
                            }
                        }
                    }
                }
                if relayed {
                    self.forward_delivery_receipt(&entry, &data).await;
                }
            }
            Some(AckOutcome::Nak(reason)) => {
                if reason.is_terminal() {
                    self.fail(&entry, &format!("nak:{reason}"));
                } else {
                    let delay = backoff_delay_ms(
                        entry.attempts + 1,
                        self.config.backoff_base_ms,
                        self.config.backoff_cap_ms,
                    );
                    self.retry(&entry, now_ms() + delay, &format!("nak:{reason}"));
                }
            }
            None => {
                self.acks.forget(&entry.message_id);
                let delay = backoff_delay_ms(
                    entry.attempts + 1,
                    self.config.backoff_base_ms,
                    self.config.backoff_cap_ms,
                );
                self.retry(&entry, now_ms() + delay, "ack-timeout");
            }
        }
    }

    fn should_replicate(&self, entry: &OutboxEntry) -> bool {
        if entry.attempts >= self.config.max_direct_attempts {
            return true;
        }
        if !self.config.replicate_immediately {
            return false;
        }
        !self
            .transport
            .connected_peers()
            .iter()
            .any(|peer| peer == &entry.target_peer_id)
    }

    /// A relay delivered a carried message: forward an ACK correlated by
    /// the original message id so the origin can settle its entry and
    /// replica tracking.
    async fn forward_delivery_receipt(&self, entry: &OutboxEntry, data: &Envelope) {
        let origin = data.from_peer();
        if origin == self.local_peer_id {
            return;
        }
        let receipt = Envelope::new_ack(&self.local_peer_id, origin, &entry.message_id);
        match envelope::to_bytes(&receipt) {
            Ok(bytes) => {
                if let Err(e) = self.transport.deliver(origin, &bytes).await {
                    tracing::debug!(%origin, msg_id = %entry.message_id, "delivery receipt not sent: {e}");
                }
            }
            Err(e) => tracing::error!("receipt encode failed: {e}"),
        }
    }

    fn retry(&self, entry: &OutboxEntry, next_retry_at: u64, reason: &str) {
        if let Err(e) = self
            .store
            .schedule_retry(&entry.message_id, next_retry_at, reason)
        {
            tracing::error!(msg_id = %entry.message_id, "retry transition failed: {e}");
            return;
        }
        self.events.emit(NodeEvent::OutboxUpdated {
            message_id: entry.message_id.clone(),
            target: entry.target_peer_id.clone(),
            status: OutboxStatus::Pending,
            attempts: entry.attempts + 1,
        });
    }

    fn fail(&self, entry: &OutboxEntry, reason: &str) {
        match self.store.mark_failed(&entry.message_id, reason) {
            Ok(true) => {
                tracing::warn!(
                    msg_id = %entry.message_id,
                    target = %entry.target_peer_id,
                    %reason,
                    "delivery failed terminally"
                );
                self.events.emit(NodeEvent::OutboxUpdated {
                    message_id: entry.message_id.clone(),
                    target: entry.target_peer_id.clone(),
                    status: OutboxStatus::Failed,
                    attempts: entry.attempts,
                });
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(msg_id = %entry.message_id, "failed transition failed: {e}")
            }
        }
    }

    /// Single timer armed at the earliest pending retry; also returns
    /// orphaned `processing` entries older than twice the ack window.
    async fn waker_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let now = now_ms();
            let orphan_cutoff = now.saturating_sub(2 * self.config.ack_timeout_ms);
            match self.store.release_orphans(orphan_cutoff, now) {
                Ok(0) => {}
                Ok(released) => {
                    tracing::warn!(released, "returned orphaned in-flight entries to pending");
                    self.wake.notify_waiters();
                }
                Err(e) => tracing::error!("orphan release failed: {e}"),
            }

            let delay_ms = match self.store.min_next_retry_at(now) {
                Ok(Some(due)) => due.saturating_sub(now).max(1),
                Ok(None) => self.config.sweeper_interval_ms.max(1),
                Err(e) => {
                    tracing::error!("waker query failed: {e}");
                    self.config.sweeper_interval_ms.max(1)
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
                    self.wake.notify_waiters();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("retry waker stopped");
    }

    /// TTL expiry plus the retention prunes for processed markers and
    /// replica rows.
    async fn sweeper_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.config.sweeper_interval_ms.max(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let now = now_ms();
            match self.store.expire_ttl(now) {
                Ok(expired) => {
                    for (message_id, target) in expired {
                        let attempts = self
                            .store
                            .outbox_entry(&message_id)
                            .ok()
                            .flatten()
                            .map(|e| e.attempts)
                            .unwrap_or(0);
                        tracing::warn!(msg_id = %message_id, %target, "message ttl expired");
                        self.events.emit(NodeEvent::OutboxUpdated {
                            message_id,
                            target,
                            status: OutboxStatus::Failed,
                            attempts,
                        });
                    }
                }
                Err(e) => tracing::error!("ttl sweep failed: {e}"),
            }

            let retention_cutoff = now.saturating_sub(self.config.retention_ms);
            if let Err(e) = self
                .store
                .sweep_expired(retention_cutoff, self.config.max_direct_attempts)
            {
                tracing::error!("outbox sweep failed: {e}");
            }
            if let Err(e) = self.store.prune_processed(retention_cutoff) {
                tracing::error!("processed prune failed: {e}");
            }
            if let Err(e) = self.store.prune_replicas(retention_cutoff) {
                tracing::error!("replica prune failed: {e}");
            }
        }
        tracing::debug!("ttl sweeper stopped");
    }
}
