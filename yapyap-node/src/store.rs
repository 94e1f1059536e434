//! SQLite persistence layer.
//!
//! Holds everything the delivery pipeline needs to survive restarts: the
//! node identity, the processed-message dedup set, per-sender sequence
//! numbers, the vector clock, the outbox, replica assignments for
//! store-and-forward, the admitted inbox, and LWW contact/routing tables.
//! Uses WAL mode for concurrent reads during writes.
//!
//! Every multi-row state change runs inside one transaction; callers never
//! observe partial updates. A single connection behind a mutex serializes
//! writes, which also makes outbox claims race-free across workers.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::error::StoreError;
use crate::now_ms;

/// Status of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "processing" => Ok(OutboxStatus::Processing),
            "delivered" => Ok(OutboxStatus::Delivered),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(StoreError::Corrupt(format!("outbox status {other:?}"))),
        }
    }
}

/// Per-relay replication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Assigned,
    Stored,
    Failed,
    Delivered,
}

impl ReplicaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaState::Assigned => "assigned",
            ReplicaState::Stored => "stored",
            ReplicaState::Failed => "failed",
            ReplicaState::Delivered => "delivered",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "assigned" => Ok(ReplicaState::Assigned),
            "stored" => Ok(ReplicaState::Stored),
            "failed" => Ok(ReplicaState::Failed),
            "delivered" => Ok(ReplicaState::Delivered),
            other => Err(StoreError::Corrupt(format!("replica state {other:?}"))),
        }
    }
}

/// A queued outbound message.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub message_id: String,
    pub target_peer_id: String,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub next_retry_at: u64,
    pub expires_at: u64,
    pub last_error: Option<String>,
    pub message_blob: Vec<u8>,
}

/// An admitted inbound message, decrypted, for local consumption.
#[derive(Debug, Clone)]
pub struct InboxMessage {
    pub message_id: String,
    pub from_peer_id: String,
    pub payload: Value,
    pub timestamp: u64,
    pub sequence_number: u64,
    pub received_at: u64,
}

/// LWW contact record.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub peer_id: String,
    pub last_seen: u64,
    pub metadata: Value,
    pub is_trusted: bool,
}

/// LWW routing record.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingEntry {
    pub peer_id: String,
    pub last_seen: u64,
    pub multiaddrs: Vec<String>,
    pub is_available: bool,
    pub ttl: u64,
}

/// One row per (message, relay).
#[derive(Debug, Clone)]
pub struct ReplicaAssignment {
    pub message_id: String,
    pub replica_peer_id: String,
    pub state: ReplicaState,
    pub last_error: Option<String>,
    pub assigned_at: u64,
}

/// The persisted node identity.
#[derive(Debug, Clone)]
pub struct StoredIdentity {
    pub peer_id: String,
    pub secret_key: [u8; 32],
    pub public_key: [u8; 32],
    pub created_at: u64,
}

/// Outcome of atomic admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub applied: bool,
    pub duplicate: bool,
}

/// Extra rows committed in the same transaction as an admission.
#[derive(Debug, Clone)]
pub enum AdmissionEffect {
    /// Marker/sequence/vclock only (store-and-forward bookkeeping).
    None,
    /// The message is for this node: persist the decrypted payload.
    Inbox { payload: String, timestamp: u64 },
    /// This node is a relay: enqueue the carried message for the final
    /// recipient.
    RelayOutbox {
        message_id: String,
        target_peer_id: String,
        blob: Vec<u8>,
        next_retry_at: u64,
        expires_at: u64,
    },
}

/// Aggregate counters for the admin surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub outbox_pending: u64,
    pub outbox_processing: u64,
    pub outbox_delivered: u64,
    pub outbox_failed: u64,
    pub processed_count: u64,
    pub inbox_count: u64,
}

/// Database handle. Cheap to clone; all clones share one serialized
/// connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS identity (
                id          INTEGER PRIMARY KEY CHECK (id = 1),
                peer_id     TEXT NOT NULL,
                secret_key  BLOB NOT NULL,
                public_key  BLOB NOT NULL,
                created_at  INTEGER NOT NULL,
                is_active   INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS local_state (
                key    TEXT PRIMARY KEY,
                value  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS processed_messages (
                message_id       TEXT PRIMARY KEY,
                from_peer_id     TEXT NOT NULL,
                sequence_number  INTEGER NOT NULL,
                processed_at     INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_processed_at
                ON processed_messages(processed_at);

            CREATE TABLE IF NOT EXISTS peer_sequences (
                peer_id        TEXT PRIMARY KEY,
                last_sequence  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS vector_clock (
                peer_id  TEXT PRIMARY KEY,
                clock    INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS outbox (
                message_id      TEXT PRIMARY KEY,
                target_peer_id  TEXT NOT NULL,
                status          TEXT NOT NULL,
                attempts        INTEGER NOT NULL DEFAULT 0,
                next_retry_at   INTEGER NOT NULL,
                expires_at      INTEGER NOT NULL,
                last_error      TEXT,
                message_blob    BLOB NOT NULL,
                enqueued_at     INTEGER NOT NULL,
                updated_at      INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_outbox_due
                ON outbox(status, next_retry_at);

            CREATE TABLE IF NOT EXISTS inbox (
                message_id       TEXT PRIMARY KEY,
                from_peer_id     TEXT NOT NULL,
                payload          TEXT NOT NULL,
                timestamp        INTEGER NOT NULL,
                sequence_number  INTEGER NOT NULL,
                received_at      INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_inbox_received
                ON inbox(received_at);

            CREATE TABLE IF NOT EXISTS replicas (
                message_id       TEXT NOT NULL,
                replica_peer_id  TEXT NOT NULL,
                state            TEXT NOT NULL,
                last_error       TEXT,
                assigned_at      INTEGER NOT NULL,
                PRIMARY KEY (message_id, replica_peer_id)
            );

            CREATE TABLE IF NOT EXISTS contacts (
                peer_id    TEXT PRIMARY KEY,
                last_seen  INTEGER NOT NULL,
                value      TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS routing (
                peer_id    TEXT PRIMARY KEY,
                last_seen  INTEGER NOT NULL,
                value      TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── Identity ───────────────────────────────────────────────────────

    /// Load the active identity, if one exists.
    pub fn identity(&self) -> Result<Option<StoredIdentity>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT peer_id, secret_key, public_key, created_at
                 FROM identity WHERE id = 1 AND is_active = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((peer_id, secret, public, created_at)) => {
                let secret_key: [u8; 32] = secret
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("identity secret key length".into()))?;
                let public_key: [u8; 32] = public
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("identity public key length".into()))?;
                Ok(Some(StoredIdentity {
                    peer_id,
                    secret_key,
                    public_key,
                    created_at: created_at as u64,
                }))
            }
        }
    }

    /// Persist a freshly generated identity. The fixed primary key keeps at
    /// most one active row; a second insert is a no-op.
    pub fn create_identity(&self, identity: &StoredIdentity) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO identity (id, peer_id, secret_key, public_key, created_at, is_active)
             VALUES (1, ?1, ?2, ?3, ?4, 1)",
            params![
                identity.peer_id,
                identity.secret_key.as_slice(),
                identity.public_key.as_slice(),
                identity.created_at as i64,
            ],
        )?;
        Ok(())
    }

    /// Allocate the next outgoing sequence number and advance our own
    /// vector clock entry in the same transaction.
    pub fn next_sequence(&self, local_peer_id: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO local_state (key, value) VALUES ('send_sequence', 1)
             ON CONFLICT(key) DO UPDATE SET value = value + 1",
            [],
        )?;
        let seq: i64 = tx.query_row(
            "SELECT value FROM local_state WHERE key = 'send_sequence'",
            [],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO vector_clock (peer_id, clock) VALUES (?1, ?2)
             ON CONFLICT(peer_id) DO UPDATE SET clock = MAX(clock, excluded.clock)",
            params![local_peer_id, seq],
        )?;
        tx.commit()?;
        Ok(seq as u64)
    }

    // ── Atomic admission ───────────────────────────────────────────────

    /// Admit an inbound message in one transaction: dedup marker, sequence
    /// high-water mark, vector clock merge, plus the variant-specific side
    /// effect. Returns `{applied: false, duplicate: true}` without touching
    /// anything if the marker already exists.
    pub fn persist_incoming_atomically(
        &self,
        message_id: &str,
        from_peer_id: &str,
        sequence_number: u64,
        vector_clock: &BTreeMap<String, u64>,
        effect: AdmissionEffect,
    ) -> Result<Admission, StoreError> {
        let now = now_ms();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let duplicate: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM processed_messages WHERE message_id = ?1)",
            params![message_id],
            |row| row.get(0),
        )?;
        if duplicate {
            return Ok(Admission {
                applied: false,
                duplicate: true,
            });
        }

        tx.execute(
            "INSERT INTO processed_messages (message_id, from_peer_id, sequence_number, processed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![message_id, from_peer_id, sequence_number as i64, now as i64],
        )?;
        tx.execute(
            "INSERT INTO peer_sequences (peer_id, last_sequence) VALUES (?1, ?2)
             ON CONFLICT(peer_id) DO UPDATE SET last_sequence = MAX(last_sequence, excluded.last_sequence)",
            params![from_peer_id, sequence_number as i64],
        )?;
        for (peer, clock) in vector_clock {
            tx.execute(
                "INSERT INTO vector_clock (peer_id, clock) VALUES (?1, ?2)
                 ON CONFLICT(peer_id) DO UPDATE SET clock = MAX(clock, excluded.clock)",
                params![peer, *clock as i64],
            )?;
        }

        match effect {
            AdmissionEffect::None => {}
            AdmissionEffect::Inbox { payload, timestamp } => {
                tx.execute(
                    "INSERT INTO inbox (message_id, from_peer_id, payload, timestamp, sequence_number, received_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        message_id,
                        from_peer_id,
                        payload,
                        timestamp as i64,
                        sequence_number as i64,
                        now as i64
                    ],
                )?;
            }
            AdmissionEffect::RelayOutbox {
                message_id: carried_id,
                target_peer_id,
                blob,
                next_retry_at,
                expires_at,
            } => {
                tx.execute(
                    "INSERT INTO outbox (message_id, target_peer_id, status, attempts, next_retry_at,
                                         expires_at, message_blob, enqueued_at, updated_at)
                     VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?5, ?6, ?6)",
                    params![
                        carried_id,
                        target_peer_id,
                        next_retry_at as i64,
                        expires_at as i64,
                        blob,
                        now as i64
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(Admission {
            applied: true,
            duplicate: false,
        })
    }

    // ── Outbox ─────────────────────────────────────────────────────────

    /// Insert a new pending entry.
    pub fn enqueue_outbound(
        &self,
        message_id: &str,
        target_peer_id: &str,
        blob: &[u8],
        next_retry_at: u64,
        expires_at: u64,
    ) -> Result<(), StoreError> {
        let now = now_ms();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO outbox (message_id, target_peer_id, status, attempts, next_retry_at,
                                 expires_at, message_blob, enqueued_at, updated_at)
             VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?5, ?6, ?6)",
            params![
                message_id,
                target_peer_id,
                next_retry_at as i64,
                expires_at as i64,
                blob,
                now as i64
            ],
        )?;
        Ok(())
    }

    /// Entries not yet in a terminal state (used for enqueue backpressure).
    pub fn active_outbox_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM outbox WHERE status IN ('pending', 'processing')",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Atomically claim due pending entries by flipping them to
    /// `processing`. Two workers can never hold the same entry.
    pub fn claim_due_entries(&self, now: u64, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut entries = {
            let mut stmt = tx.prepare(
                "SELECT message_id, target_peer_id, status, attempts, next_retry_at,
                        expires_at, last_error, message_blob
                 FROM outbox
                 WHERE status = 'pending' AND next_retry_at <= ?1 AND expires_at > ?1
                 ORDER BY next_retry_at ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![now as i64, limit as i64], map_outbox_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        for entry in &mut entries {
            tx.execute(
                "UPDATE outbox SET status = 'processing', updated_at = ?2 WHERE message_id = ?1",
                params![entry.message_id, now as i64],
            )?;
            entry.status = OutboxStatus::Processing;
        }
        tx.commit()?;
        Ok(entries)
    }

    /// Transition to `delivered`. Returns false if the entry is unknown or
    /// already delivered.
    pub fn mark_delivered(&self, message_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE outbox SET status = 'delivered', last_error = NULL, updated_at = ?2
             WHERE message_id = ?1 AND status != 'delivered'",
            params![message_id, now_ms() as i64],
        )?;
        Ok(changed > 0)
    }

    /// Return a claimed entry to `pending` with an incremented attempt
    /// counter and the next retry time.
    pub fn schedule_retry(
        &self,
        message_id: &str,
        next_retry_at: u64,
        reason: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE outbox
             SET status = 'pending', attempts = attempts + 1, next_retry_at = ?2,
                 last_error = ?3, updated_at = ?4
             WHERE message_id = ?1 AND status NOT IN ('delivered', 'failed')",
            params![message_id, next_retry_at as i64, reason, now_ms() as i64],
        )?;
        Ok(())
    }

    /// Terminal failure.
    pub fn mark_failed(&self, message_id: &str, reason: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE outbox SET status = 'failed', last_error = ?2, updated_at = ?3
             WHERE message_id = ?1 AND status NOT IN ('delivered', 'failed')",
            params![message_id, reason, now_ms() as i64],
        )?;
        Ok(changed > 0)
    }

    /// Fail every non-terminal entry whose TTL has passed. Returns the
    /// affected `(message_id, target_peer_id)` pairs for event emission.
    pub fn expire_ttl(&self, now: u64) -> Result<Vec<(String, String)>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let expired = {
            let mut stmt = tx.prepare(
                "SELECT message_id, target_peer_id FROM outbox
                 WHERE expires_at <= ?1 AND status IN ('pending', 'processing')",
            )?;
            let rows = stmt.query_map(params![now as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        for (message_id, _) in &expired {
            tx.execute(
                "UPDATE outbox SET status = 'failed', last_error = 'ttl-expired', updated_at = ?2
                 WHERE message_id = ?1",
                params![message_id, now as i64],
            )?;
        }
        tx.commit()?;
        Ok(expired)
    }

    /// Delete terminal (or attempt-capped) entries whose TTL passed before
    /// the cutoff. Failed entries stay queryable until the retention window
    /// moves past them.
    pub fn sweep_expired(&self, cutoff: u64, attempts_cap: u32) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM outbox
             WHERE expires_at <= ?1
               AND (status IN ('delivered', 'failed') OR attempts > ?2)",
            params![cutoff as i64, attempts_cap as i64],
        )?;
        Ok(deleted)
    }

    /// Return `processing` entries that have not been touched since the
    /// cutoff back to `pending` (orphans from cancelled in-flight sends).
    pub fn release_orphans(&self, untouched_since: u64, now: u64) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE outbox SET status = 'pending', next_retry_at = ?2, updated_at = ?2
             WHERE status = 'processing' AND updated_at < ?1",
            params![untouched_since as i64, now as i64],
        )?;
        Ok(changed)
    }

    /// Shutdown path: return every in-flight entry to `pending`.
    pub fn release_all_processing(&self, now: u64) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE outbox SET status = 'pending', next_retry_at = ?1, updated_at = ?1
             WHERE status = 'processing'",
            params![now as i64],
        )?;
        Ok(changed)
    }

    /// Earliest retry time among pending, unexpired entries (for the waker).
    pub fn min_next_retry_at(&self, now: u64) -> Result<Option<u64>, StoreError> {
        let conn = self.conn.lock();
        let min: Option<i64> = conn.query_row(
            "SELECT MIN(next_retry_at) FROM outbox WHERE status = 'pending' AND expires_at > ?1",
            params![now as i64],
            |row| row.get(0),
        )?;
        Ok(min.map(|v| v as u64))
    }

    pub fn outbox_entry(&self, message_id: &str) -> Result<Option<OutboxEntry>, StoreError> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                "SELECT message_id, target_peer_id, status, attempts, next_retry_at,
                        expires_at, last_error, message_blob
                 FROM outbox WHERE message_id = ?1",
                params![message_id],
                map_outbox_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn list_outbox(
        &self,
        status: Option<OutboxStatus>,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let conn = self.conn.lock();
        let mut out = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT message_id, target_peer_id, status, attempts, next_retry_at,
                            expires_at, last_error, message_blob
                     FROM outbox WHERE status = ?1 ORDER BY enqueued_at ASC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![status.as_str(), limit as i64], map_outbox_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT message_id, target_peer_id, status, attempts, next_retry_at,
                            expires_at, last_error, message_blob
                     FROM outbox ORDER BY enqueued_at ASC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit as i64], map_outbox_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    // ── Inbox / processed markers ──────────────────────────────────────

    pub fn list_inbox(&self, limit: usize) -> Result<Vec<InboxMessage>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT message_id, from_peer_id, payload, timestamp, sequence_number, received_at
             FROM inbox ORDER BY received_at DESC, message_id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (message_id, from_peer_id, payload, timestamp, seq, received_at) = row?;
            let payload: Value = serde_json::from_str(&payload)
                .map_err(|e| StoreError::Corrupt(format!("inbox payload: {e}")))?;
            out.push(InboxMessage {
                message_id,
                from_peer_id,
                payload,
                timestamp: timestamp as u64,
                sequence_number: seq as u64,
                received_at: received_at as u64,
            });
        }
        out.reverse(); // oldest first
        Ok(out)
    }

    pub fn is_processed(&self, message_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM processed_messages WHERE message_id = ?1)",
            params![message_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn processed_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM processed_messages", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Retention sweep for dedup markers. Keeps everything newer than the
    /// cutoff to guard against delayed duplicates.
    pub fn prune_processed(&self, cutoff: u64) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM processed_messages WHERE processed_at <= ?1",
            params![cutoff as i64],
        )?;
        Ok(deleted)
    }

    pub fn peer_sequence(&self, peer_id: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let seq: Option<i64> = conn
            .query_row(
                "SELECT last_sequence FROM peer_sequences WHERE peer_id = ?1",
                params![peer_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq.unwrap_or(0) as u64)
    }

    pub fn vector_clock(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT peer_id, clock FROM vector_clock")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut clock = BTreeMap::new();
        for row in rows {
            let (peer, value) = row?;
            clock.insert(peer, value);
        }
        Ok(clock)
    }

    // ── Replicas ───────────────────────────────────────────────────────

    /// Record a replica assignment. Duplicate `(message, relay)` pairs are
    /// no-ops; returns whether the row was inserted.
    pub fn assign_replica(&self, message_id: &str, replica_peer_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO replicas (message_id, replica_peer_id, state, assigned_at)
             VALUES (?1, ?2, 'assigned', ?3)",
            params![message_id, replica_peer_id, now_ms() as i64],
        )?;
        Ok(inserted > 0)
    }

    pub fn mark_replica_stored(&self, message_id: &str, replica_peer_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE replicas SET state = 'stored', last_error = NULL
             WHERE message_id = ?1 AND replica_peer_id = ?2 AND state != 'delivered'",
            params![message_id, replica_peer_id],
        )?;
        Ok(())
    }

    pub fn mark_replica_failed(
        &self,
        message_id: &str,
        replica_peer_id: &str,
        reason: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE replicas SET state = 'failed', last_error = ?3
             WHERE message_id = ?1 AND replica_peer_id = ?2 AND state != 'delivered'",
            params![message_id, replica_peer_id, reason],
        )?;
        Ok(())
    }

    /// Delivery receipt arrived: every replica of the message is done.
    pub fn mark_replicas_delivered(&self, message_id: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE replicas SET state = 'delivered' WHERE message_id = ?1 AND state != 'delivered'",
            params![message_id],
        )?;
        Ok(changed)
    }

    pub fn list_replicas(&self, message_id: &str) -> Result<Vec<ReplicaAssignment>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT message_id, replica_peer_id, state, last_error, assigned_at
             FROM replicas WHERE message_id = ?1 ORDER BY assigned_at ASC",
        )?;
        let rows = stmt.query_map(params![message_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (message_id, replica_peer_id, state, last_error, assigned_at) = row?;
            out.push(ReplicaAssignment {
                message_id,
                replica_peer_id,
                state: ReplicaState::parse(&state)?,
                last_error,
                assigned_at: assigned_at as u64,
            });
        }
        Ok(out)
    }

    /// Replica tracking GC after TTL.
    pub fn prune_replicas(&self, cutoff: u64) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM replicas WHERE assigned_at <= ?1",
            params![cutoff as i64],
        )?;
        Ok(deleted)
    }

    // ── LWW contact / routing tables ───────────────────────────────────

    /// Last-writer-wins upsert: the new record applies iff its `last_seen`
    /// is newer, or equal with a lexicographically greater serialized
    /// value. Returns whether the write applied.
    pub fn upsert_contact(&self, contact: &Contact) -> Result<bool, StoreError> {
        let value = serde_json::to_string(&serde_json::json!({
            "metadata": contact.metadata,
            "isTrusted": contact.is_trusted,
        }))
        .map_err(|e| StoreError::Corrupt(format!("contact value: {e}")))?;
        self.lww_upsert("contacts", &contact.peer_id, contact.last_seen, &value)
    }

    pub fn get_contact(&self, peer_id: &str) -> Result<Option<Contact>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT peer_id, last_seen, value FROM contacts WHERE peer_id = ?1",
                params![peer_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(peer_id, last_seen, value)| parse_contact(peer_id, last_seen as u64, &value))
            .transpose()
    }

    pub fn list_contacts(&self) -> Result<Vec<Contact>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT peer_id, last_seen, value FROM contacts ORDER BY peer_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (peer_id, last_seen, value) = row?;
            out.push(parse_contact(peer_id, last_seen as u64, &value)?);
        }
        Ok(out)
    }

    pub fn remove_contact(&self, peer_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM contacts WHERE peer_id = ?1", params![peer_id])?;
        Ok(deleted > 0)
    }

    pub fn upsert_routing(&self, entry: &RoutingEntry) -> Result<bool, StoreError> {
        let value = serde_json::to_string(&serde_json::json!({
            "multiaddrs": entry.multiaddrs,
            "isAvailable": entry.is_available,
            "ttl": entry.ttl,
        }))
        .map_err(|e| StoreError::Corrupt(format!("routing value: {e}")))?;
        self.lww_upsert("routing", &entry.peer_id, entry.last_seen, &value)
    }

    pub fn get_routing(&self, peer_id: &str) -> Result<Option<RoutingEntry>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT peer_id, last_seen, value FROM routing WHERE peer_id = ?1",
                params![peer_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(peer_id, last_seen, value)| parse_routing(peer_id, last_seen as u64, &value))
            .transpose()
    }

    pub fn list_routing(&self) -> Result<Vec<RoutingEntry>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT peer_id, last_seen, value FROM routing ORDER BY peer_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (peer_id, last_seen, value) = row?;
            out.push(parse_routing(peer_id, last_seen as u64, &value)?);
        }
        Ok(out)
    }

    fn lww_upsert(
        &self,
        table: &str,
        peer_id: &str,
        last_seen: u64,
        value: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let existing: Option<(i64, String)> = tx
            .query_row(
                &format!("SELECT last_seen, value FROM {table} WHERE peer_id = ?1"),
                params![peer_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let applies = match &existing {
            None => true,
            Some((old_seen, old_value)) => {
                last_seen > *old_seen as u64
                    || (last_seen == *old_seen as u64 && value > old_value.as_str())
            }
        };
        if applies {
            tx.execute(
                &format!(
                    "INSERT INTO {table} (peer_id, last_seen, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(peer_id) DO UPDATE SET last_seen = excluded.last_seen, value = excluded.value"
                ),
                params![peer_id, last_seen as i64, value],
            )?;
        }
        tx.commit()?;
        Ok(applies)
    }

    // ── Stats ──────────────────────────────────────────────────────────

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn.lock();
        let mut stats = StoreStats::default();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM outbox GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        for row in rows {
            let (status, count) = row?;
            match OutboxStatus::parse(&status)? {
                OutboxStatus::Pending => stats.outbox_pending = count,
                OutboxStatus::Processing => stats.outbox_processing = count,
                OutboxStatus::Delivered => stats.outbox_delivered = count,
                OutboxStatus::Failed => stats.outbox_failed = count,
            }
        }
        stats.processed_count =
            conn.query_row("SELECT COUNT(*) FROM processed_messages", [], |row| {
                row.get::<_, i64>(0)
            })? as u64;
        stats.inbox_count =
            conn.query_row("SELECT COUNT(*) FROM inbox", [], |row| row.get::<_, i64>(0))? as u64;
        Ok(stats)
    }
}

fn map_outbox_row(row: &rusqlite::Row) -> rusqlite::Result<OutboxEntry> {
    let status: String = row.get(2)?;
    Ok(OutboxEntry {
        message_id: row.get(0)?,
        target_peer_id: row.get(1)?,
        // Corrupt status strings surface later through stats(); rows written
        // by this module always parse.
        status: OutboxStatus::parse(&status).unwrap_or(OutboxStatus::Failed),
        attempts: row.get::<_, i64>(3)? as u32,
        next_retry_at: row.get::<_, i64>(4)? as u64,
        expires_at: row.get::<_, i64>(5)? as u64,
        last_error: row.get(6)?,
        message_blob: row.get(7)?,
    })
}

fn parse_contact(peer_id: String, last_seen: u64, value: &str) -> Result<Contact, StoreError> {
    let value: Value = serde_json::from_str(value)
        .map_err(|e| StoreError::Corrupt(format!("contact value: {e}")))?;
    Ok(Contact {
        peer_id,
        last_seen,
        metadata: value.get("metadata").cloned().unwrap_or(Value::Null),
        is_trusted: value
            .get("isTrusted")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

fn parse_routing(peer_id: String, last_seen: u64, value: &str) -> Result<RoutingEntry, StoreError> {
    let value: Value = serde_json::from_str(value)
        .map_err(|e| StoreError::Corrupt(format!("routing value: {e}")))?;
    let multiaddrs = value
        .get("multiaddrs")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(RoutingEntry {
        peer_id,
        last_seen,
        multiaddrs,
        is_available: value
            .get("isAvailable")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        ttl: value.get("ttl").and_then(Value::as_u64).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(entries: &[(&str, u64)]) -> BTreeMap<String, u64> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn admission_dedup() {
        let store = Store::open_memory().unwrap();
        let first = store
            .persist_incoming_atomically("m1", "peer-a", 1, &clock(&[]), AdmissionEffect::None)
            .unwrap();
        assert!(first.applied && !first.duplicate);

        let second = store
            .persist_incoming_atomically("m1", "peer-a", 1, &clock(&[]), AdmissionEffect::None)
            .unwrap();
        assert!(!second.applied && second.duplicate);

        assert_eq!(store.processed_count().unwrap(), 1);
    }

    #[test]
    fn sequence_monotone_under_out_of_order_admission() {
        let store = Store::open_memory().unwrap();
        store
            .persist_incoming_atomically("m5", "peer-a", 5, &clock(&[]), AdmissionEffect::None)
            .unwrap();
        assert_eq!(store.peer_sequence("peer-a").unwrap(), 5);

        // A late, low-sequence message is still admitted (dedup is
        // authoritative) but never lowers the high-water mark.
        let late = store
            .persist_incoming_atomically("m2", "peer-a", 2, &clock(&[]), AdmissionEffect::None)
            .unwrap();
        assert!(late.applied);
        assert_eq!(store.peer_sequence("peer-a").unwrap(), 5);
    }

    #[test]
    fn vclock_elementwise_max_merge() {
        let store = Store::open_memory().unwrap();
        store
            .persist_incoming_atomically(
                "m1",
                "peer-a",
                1,
                &clock(&[("peer-a", 4), ("peer-b", 2)]),
                AdmissionEffect::None,
            )
            .unwrap();
        store
            .persist_incoming_atomically(
                "m2",
                "peer-b",
                1,
                &clock(&[("peer-a", 3), ("peer-b", 9), ("peer-c", 1)]),
                AdmissionEffect::None,
            )
            .unwrap();

        let merged = store.vector_clock().unwrap();
        assert_eq!(merged.get("peer-a"), Some(&4));
        assert_eq!(merged.get("peer-b"), Some(&9));
        assert_eq!(merged.get("peer-c"), Some(&1));
    }

    #[test]
    fn admission_is_all_or_nothing() {
        let store = Store::open_memory().unwrap();
        // Occupy the outbox slot the relay effect will collide with.
        store
            .enqueue_outbound("carried", "peer-b", b"blob", 0, u64::MAX >> 1)
            .unwrap();

        let result = store.persist_incoming_atomically(
            "sf1",
            "peer-a",
            7,
            &clock(&[("peer-a", 7)]),
            AdmissionEffect::RelayOutbox {
                message_id: "carried".to_string(),
                target_peer_id: "peer-b".to_string(),
                blob: b"blob".to_vec(),
                next_retry_at: 0,
                expires_at: u64::MAX >> 1,
            },
        );
        assert!(result.is_err());

        // The failed transaction left no trace: no marker, no sequence, no
        // clock entry.
        assert!(!store.is_processed("sf1").unwrap());
        assert_eq!(store.peer_sequence("peer-a").unwrap(), 0);
        assert!(store.vector_clock().unwrap().is_empty());
    }

    #[test]
    fn admission_inbox_effect() {
        let store = Store::open_memory().unwrap();
        store
            .persist_incoming_atomically(
                "m1",
                "peer-a",
                1,
                &clock(&[]),
                AdmissionEffect::Inbox {
                    payload: r#"{"content":"hi"}"#.to_string(),
                    timestamp: 1700000000000,
                },
            )
            .unwrap();

        let inbox = store.list_inbox(10).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].message_id, "m1");
        assert_eq!(inbox[0].payload["content"], "hi");
        assert_eq!(inbox[0].timestamp, 1700000000000);
    }

    #[test]
    fn claim_is_exclusive() {
        let store = Store::open_memory().unwrap();
        let far = now_ms() + 60_000;
        store.enqueue_outbound("m1", "peer-b", b"x", 0, far).unwrap();
        store.enqueue_outbound("m2", "peer-b", b"y", 0, far).unwrap();

        let first = store.claim_due_entries(now_ms(), 10).unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|e| e.status == OutboxStatus::Processing));

        // A second claim sees nothing: the entries are held.
        let second = store.claim_due_entries(now_ms(), 10).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn claim_skips_future_and_expired() {
        let store = Store::open_memory().unwrap();
        let now = now_ms();
        store
            .enqueue_outbound("future", "peer-b", b"x", now + 60_000, now + 120_000)
            .unwrap();
        store.enqueue_outbound("expired", "peer-b", b"y", 0, now - 1).unwrap();
        store.enqueue_outbound("due", "peer-b", b"z", 0, now + 60_000).unwrap();

        let claimed = store.claim_due_entries(now, 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].message_id, "due");
    }

    #[test]
    fn status_transitions() {
        let store = Store::open_memory().unwrap();
        let far = now_ms() + 60_000;
        store.enqueue_outbound("m1", "peer-b", b"x", 0, far).unwrap();
        store.claim_due_entries(now_ms(), 1).unwrap();

        store.schedule_retry("m1", now_ms() + 500, "ack-timeout").unwrap();
        let entry = store.outbox_entry("m1").unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Pending);
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.last_error.as_deref(), Some("ack-timeout"));

        assert!(store.mark_delivered("m1").unwrap());
        // Idempotent: a second delivery report changes nothing.
        assert!(!store.mark_delivered("m1").unwrap());
        // A late retry cannot resurrect a delivered entry.
        store.schedule_retry("m1", now_ms(), "late").unwrap();
        let entry = store.outbox_entry("m1").unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Delivered);
    }

    #[test]
    fn ttl_expiry_and_sweep() {
        let store = Store::open_memory().unwrap();
        let now = now_ms();
        store.enqueue_outbound("old", "peer-b", b"x", 0, now - 10).unwrap();
        store.enqueue_outbound("live", "peer-b", b"y", 0, now + 60_000).unwrap();

        let expired = store.expire_ttl(now).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, "old");
        let entry = store.outbox_entry("old").unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Failed);
        assert_eq!(entry.last_error.as_deref(), Some("ttl-expired"));

        // Failed entry stays queryable until the retention cutoff passes it.
        assert_eq!(store.sweep_expired(now - 60_000, 8).unwrap(), 0);
        assert_eq!(store.sweep_expired(now, 8).unwrap(), 1);
        assert!(store.outbox_entry("old").unwrap().is_none());
        assert!(store.outbox_entry("live").unwrap().is_some());
    }

    #[test]
    fn orphan_release() {
        let store = Store::open_memory().unwrap();
        let now = now_ms();
        store.enqueue_outbound("m1", "peer-b", b"x", 0, now + 60_000).unwrap();
        store.claim_due_entries(now, 1).unwrap();

        // Not yet stale.
        assert_eq!(store.release_orphans(now - 1_000, now).unwrap(), 0);
        // Stale once the cutoff moves past its updated_at.
        assert_eq!(store.release_orphans(now + 1, now).unwrap(), 1);
        let entry = store.outbox_entry("m1").unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Pending);
    }

    #[test]
    fn lww_newer_wins_regardless_of_arrival_order() {
        let store = Store::open_memory().unwrap();
        let newer = Contact {
            peer_id: "peer-a".to_string(),
            last_seen: 2000,
            metadata: serde_json::json!({"name": "new"}),
            is_trusted: true,
        };
        let older = Contact {
            peer_id: "peer-a".to_string(),
            last_seen: 1000,
            metadata: serde_json::json!({"name": "old"}),
            is_trusted: false,
        };

        assert!(store.upsert_contact(&newer).unwrap());
        assert!(!store.upsert_contact(&older).unwrap());
        let stored = store.get_contact("peer-a").unwrap().unwrap();
        assert_eq!(stored.metadata["name"], "new");
        assert!(stored.is_trusted);

        // Same outcome with reversed arrival order.
        let store = Store::open_memory().unwrap();
        assert!(store.upsert_contact(&older).unwrap());
        assert!(store.upsert_contact(&newer).unwrap());
        let stored = store.get_contact("peer-a").unwrap().unwrap();
        assert_eq!(stored.metadata["name"], "new");
    }

    #[test]
    fn lww_tie_breaks_on_serialized_value() {
        let store = Store::open_memory().unwrap();
        let a = Contact {
            peer_id: "peer-a".to_string(),
            last_seen: 1000,
            metadata: serde_json::json!({"name": "aaa"}),
            is_trusted: false,
        };
        let b = Contact {
            peer_id: "peer-a".to_string(),
            last_seen: 1000,
            metadata: serde_json::json!({"name": "zzz"}),
            is_trusted: false,
        };

        store.upsert_contact(&a).unwrap();
        assert!(store.upsert_contact(&b).unwrap()); // greater value wins the tie
        assert!(!store.upsert_contact(&a).unwrap()); // and the lesser one loses it
        let stored = store.get_contact("peer-a").unwrap().unwrap();
        assert_eq!(stored.metadata["name"], "zzz");
    }

    #[test]
    fn routing_roundtrip() {
        let store = Store::open_memory().unwrap();
        let entry = RoutingEntry {
            peer_id: "peer-r".to_string(),
            last_seen: 1234,
            multiaddrs: vec!["/ip4/1.2.3.4/tcp/4001".to_string()],
            is_available: true,
            ttl: 60_000,
        };
        assert!(store.upsert_routing(&entry).unwrap());
        let stored = store.get_routing("peer-r").unwrap().unwrap();
        assert_eq!(stored, entry);
        assert_eq!(store.list_routing().unwrap().len(), 1);
    }

    #[test]
    fn replica_lifecycle() {
        let store = Store::open_memory().unwrap();
        assert!(store.assign_replica("m1", "relay-1").unwrap());
        assert!(store.assign_replica("m1", "relay-2").unwrap());
        // Duplicate assignment is a no-op.
        assert!(!store.assign_replica("m1", "relay-1").unwrap());

        store.mark_replica_stored("m1", "relay-1").unwrap();
        store.mark_replica_failed("m1", "relay-2", "ack-timeout").unwrap();

        let replicas = store.list_replicas("m1").unwrap();
        assert_eq!(replicas.len(), 2);
        let r1 = replicas.iter().find(|r| r.replica_peer_id == "relay-1").unwrap();
        assert_eq!(r1.state, ReplicaState::Stored);
        let r2 = replicas.iter().find(|r| r.replica_peer_id == "relay-2").unwrap();
        assert_eq!(r2.state, ReplicaState::Failed);
        assert_eq!(r2.last_error.as_deref(), Some("ack-timeout"));

        assert_eq!(store.mark_replicas_delivered("m1").unwrap(), 2);
        assert!(
            store
                .list_replicas("m1")
                .unwrap()
                .iter()
                .all(|r| r.state == ReplicaState::Delivered)
        );

        assert_eq!(store.prune_replicas(now_ms() + 1).unwrap(), 2);
        assert!(store.list_replicas("m1").unwrap().is_empty());
    }

    #[test]
    fn identity_created_once() {
        let store = Store::open_memory().unwrap();
        assert!(store.identity().unwrap().is_none());

        let first = StoredIdentity {
            peer_id: "peer-one".to_string(),
            secret_key: [1u8; 32],
            public_key: [2u8; 32],
            created_at: 1000,
        };
        store.create_identity(&first).unwrap();

        let second = StoredIdentity {
            peer_id: "peer-two".to_string(),
            secret_key: [3u8; 32],
            public_key: [4u8; 32],
            created_at: 2000,
        };
        store.create_identity(&second).unwrap(); // ignored

        let loaded = store.identity().unwrap().unwrap();
        assert_eq!(loaded.peer_id, "peer-one");
        assert_eq!(loaded.secret_key, [1u8; 32]);
    }

    #[test]
    fn identity_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.db");
        let identity = StoredIdentity {
            peer_id: "peer-one".to_string(),
            secret_key: [7u8; 32],
            public_key: [8u8; 32],
            created_at: 1000,
        };
        {
            let store = Store::open(&path).unwrap();
            store.create_identity(&identity).unwrap();
        }
        let store = Store::open(&path).unwrap();
        let loaded = store.identity().unwrap().unwrap();
        assert_eq!(loaded.peer_id, "peer-one");
        assert_eq!(loaded.secret_key, [7u8; 32]);
    }

    #[test]
    fn send_sequence_counts_up_and_bumps_own_clock() {
        let store = Store::open_memory().unwrap();
        assert_eq!(store.next_sequence("me").unwrap(), 1);
        assert_eq!(store.next_sequence("me").unwrap(), 2);
        assert_eq!(store.next_sequence("me").unwrap(), 3);
        assert_eq!(store.vector_clock().unwrap().get("me"), Some(&3));
    }

    #[test]
    fn prune_processed_respects_cutoff() {
        let store = Store::open_memory().unwrap();
        store
            .persist_incoming_atomically("m1", "peer-a", 1, &clock(&[]), AdmissionEffect::None)
            .unwrap();
        assert_eq!(store.prune_processed(0).unwrap(), 0);
        assert_eq!(store.prune_processed(now_ms() + 1).unwrap(), 1);
        assert!(!store.is_processed("m1").unwrap());
    }

    #[test]
    fn stats_counts() {
        let store = Store::open_memory().unwrap();
        let far = now_ms() + 60_000;
        store.enqueue_outbound("m1", "peer-b", b"x", 0, far).unwrap();
        store.enqueue_outbound("m2", "peer-b", b"y", 0, far).unwrap();
        store.claim_due_entries(now_ms(), 1).unwrap();
        store.mark_delivered("m1").unwrap();
        store
            .persist_incoming_atomically(
                "in1",
                "peer-a",
                1,
                &clock(&[]),
                AdmissionEffect::Inbox {
                    payload: "{}".to_string(),
                    timestamp: 0,
                },
            )
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.outbox_pending, 1);
        assert_eq!(stats.outbox_delivered, 1);
        assert_eq!(stats.processed_count, 1);
        assert_eq!(stats.inbox_count, 1);
    }
}
