//! Error types for the delivery pipeline.
//!
//! Each layer has its own error enum; `DeliveryError` is the umbrella the
//! dispatcher and the admin surface report. NAK reasons are modeled
//! separately because they travel on the wire and their terminal/transient
//! split drives the outbox state machine.

use std::fmt;

/// Reason carried in a NAK envelope.
///
/// Terminal reasons end the sender's retry loop; transient reasons schedule
/// another attempt with backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NakReason {
    DecryptFailed,
    UnknownRecipient,
    Oversize,
    Busy,
    Storage,
    /// A reason string this implementation does not know. Treated as
    /// transient so a newer peer cannot permanently fail our messages.
    Other(String),
}

impl NakReason {
    pub fn as_str(&self) -> &str {
        match self {
            NakReason::DecryptFailed => "decrypt-failed",
            NakReason::UnknownRecipient => "unknown-recipient",
            NakReason::Oversize => "oversize",
            NakReason::Busy => "busy",
            NakReason::Storage => "storage",
            NakReason::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "decrypt-failed" => NakReason::DecryptFailed,
            "unknown-recipient" => NakReason::UnknownRecipient,
            "oversize" => NakReason::Oversize,
            "busy" => NakReason::Busy,
            "storage" => NakReason::Storage,
            other => NakReason::Other(other.to_string()),
        }
    }

    /// Terminal reasons fail the outbox entry with no further retries.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NakReason::DecryptFailed | NakReason::UnknownRecipient | NakReason::Oversize
        )
    }
}

impl fmt::Display for NakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage engine faults. Callers never observe partial updates; a failed
/// transaction rolls back completely.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

/// Wire codec failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("envelope of {0} bytes exceeds the 1 MiB limit")]
    Oversize(usize),
    #[error("invalid envelope json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("truncated frame: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("frame io: {0}")]
    Io(#[from] std::io::Error),
}

/// Sealed-box encryption failures.
#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("payload encryption failed")]
    Encrypt,
    #[error("payload decryption failed")]
    Decrypt,
    #[error("malformed sealed payload")]
    Encoding,
}

/// Transport-level failures surfaced to the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport bind failed: {0}")]
    Bind(String),
    #[error("invalid peer id {0:?}")]
    InvalidPeerId(String),
    #[error("dial {peer} failed: {reason}")]
    Dial { peer: String, reason: String },
    #[error("stream write to {peer} failed: {reason}")]
    Write { peer: String, reason: String },
}

/// Umbrella error for the admin surface. Delivery-time outcomes
/// (ack-timeout, NAKs, TTL expiry) are recorded on the outbox entry as
/// `last_error` rather than surfaced as Rust errors; enqueue succeeds as
/// soon as the entry is committed.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Seal(#[from] SealError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("node is shutting down")]
    ShuttingDown,
    #[error("outbox is full ({0} entries)")]
    OutboxFull(usize),
}
