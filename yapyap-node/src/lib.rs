//! YapYap: a decentralized peer-to-peer messaging node.
//!
//! The core is the message delivery engine: a persistent outbox with retry
//! scheduling and TTL expiry, an inbound pipeline that deduplicates and
//! admits messages atomically (per-sender sequence high-water marks and a
//! merged vector clock), sealed-box payload encryption keyed by peer
//! identity, and store-and-forward replication through relay peers when
//! the recipient is offline.

pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod identity;
pub mod inbound;
pub mod msgid;
pub mod node;
pub mod outbox;
pub mod router;
pub mod sealed;
pub mod store;
pub mod transport;

pub use config::NodeConfig;
pub use node::{Node, NodeStats};

/// Wall-clock milliseconds since the Unix epoch. Advisory only; ordering
/// decisions use sequence numbers and the vector clock, never this.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
