//! Wire envelope codec.
//!
//! Envelopes are JSON objects tagged by `type`, framed on the wire with a
//! u32 big-endian length prefix, one envelope per stream. Unknown fields
//! are captured into a flattened map and re-emitted verbatim so older nodes
//! can relay envelopes produced by newer ones.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CodecError, NakReason};
use crate::msgid;
use crate::now_ms;

/// Hard cap on a single encoded envelope.
pub const MAX_ENVELOPE_BYTES: usize = 1024 * 1024;

/// A message on the wire. `from`/`to` are peer ids; `timestamp` is advisory
/// wall-clock milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    #[serde(rename_all = "camelCase")]
    Data {
        id: String,
        from: String,
        to: String,
        timestamp: u64,
        /// Sealed-box ciphertext, base64.
        payload: String,
        #[serde(default)]
        sequence_number: u64,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        vector_clock: BTreeMap<String, u64>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    Ack {
        id: String,
        from: String,
        to: String,
        timestamp: u64,
        original_message_id: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    Nak {
        id: String,
        from: String,
        to: String,
        timestamp: u64,
        original_message_id: String,
        reason: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    StoreAndForward {
        id: String,
        from: String,
        to: String,
        timestamp: u64,
        /// The carried message; its `to` is the ultimate recipient.
        stored_message: Box<Envelope>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

impl Envelope {
    pub fn new_data(
        from: &str,
        to: &str,
        payload: String,
        sequence_number: u64,
        vector_clock: BTreeMap<String, u64>,
    ) -> Self {
        Envelope::Data {
            id: msgid::generate(),
            from: from.to_string(),
            to: to.to_string(),
            timestamp: now_ms(),
            payload,
            sequence_number,
            vector_clock,
            extra: Map::new(),
        }
    }

    pub fn new_ack(from: &str, to: &str, original_message_id: &str) -> Self {
        Envelope::Ack {
            id: msgid::generate(),
            from: from.to_string(),
            to: to.to_string(),
            timestamp: now_ms(),
            original_message_id: original_message_id.to_string(),
            extra: Map::new(),
        }
    }

    pub fn new_nak(from: &str, to: &str, original_message_id: &str, reason: &NakReason) -> Self {
        Envelope::Nak {
            id: msgid::generate(),
            from: from.to_string(),
            to: to.to_string(),
            timestamp: now_ms(),
            original_message_id: original_message_id.to_string(),
            reason: reason.as_str().to_string(),
            extra: Map::new(),
        }
    }

    pub fn new_store_and_forward(from: &str, relay: &str, stored: Envelope) -> Self {
        Envelope::StoreAndForward {
            id: msgid::generate(),
            from: from.to_string(),
            to: relay.to_string(),
            timestamp: now_ms(),
            stored_message: Box::new(stored),
            extra: Map::new(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Envelope::Data { id, .. }
            | Envelope::Ack { id, .. }
            | Envelope::Nak { id, .. }
            | Envelope::StoreAndForward { id, .. } => id,
        }
    }

    pub fn from_peer(&self) -> &str {
        match self {
            Envelope::Data { from, .. }
            | Envelope::Ack { from, .. }
            | Envelope::Nak { from, .. }
            | Envelope::StoreAndForward { from, .. } => from,
        }
    }

    pub fn to_peer(&self) -> &str {
        match self {
            Envelope::Data { to, .. }
            | Envelope::Ack { to, .. }
            | Envelope::Nak { to, .. }
            | Envelope::StoreAndForward { to, .. } => to,
        }
    }

    pub fn type_str(&self) -> &'static str {
        match self {
            Envelope::Data { .. } => "data",
            Envelope::Ack { .. } => "ack",
            Envelope::Nak { .. } => "nak",
            Envelope::StoreAndForward { .. } => "store-and-forward",
        }
    }

    /// Serde's internal tagging leaves the consumed `type` key visible to
    /// the flattened catch-all on deserialize; drop it so re-encoding does
    /// not emit the tag twice.
    fn strip_tag(&mut self) {
        match self {
            Envelope::Data { extra, .. }
            | Envelope::Ack { extra, .. }
            | Envelope::Nak { extra, .. } => {
                extra.remove("type");
            }
            Envelope::StoreAndForward {
                extra,
                stored_message,
                ..
            } => {
                extra.remove("type");
                stored_message.strip_tag();
            }
        }
    }
}

/// Encode an envelope to its JSON bytes (no length prefix).
pub fn to_bytes(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let bytes = serde_json::to_vec(envelope)?;
    if bytes.len() > MAX_ENVELOPE_BYTES {
        return Err(CodecError::Oversize(bytes.len()));
    }
    Ok(bytes)
}

/// Decode an envelope from JSON bytes (no length prefix).
pub fn from_bytes(bytes: &[u8]) -> Result<Envelope, CodecError> {
    if bytes.len() > MAX_ENVELOPE_BYTES {
        return Err(CodecError::Oversize(bytes.len()));
    }
    let mut envelope: Envelope = serde_json::from_slice(bytes)?;
    envelope.strip_tag();
    Ok(envelope)
}

/// Write one length-prefixed frame of already-encoded envelope bytes.
pub async fn write_frame_bytes<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> Result<(), CodecError> {
    if bytes.len() > MAX_ENVELOPE_BYTES {
        return Err(CodecError::Oversize(bytes.len()));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Write one length-prefixed envelope frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<(), CodecError> {
    let bytes = to_bytes(envelope)?;
    write_frame_bytes(writer, &bytes).await
}

/// Read one length-prefixed frame, returning the raw envelope bytes.
///
/// A declared length above the cap is an oversize error before any body
/// bytes are read; the caller resets the stream.
pub async fn read_frame_bytes<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>, CodecError> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_ENVELOPE_BYTES {
        return Err(CodecError::Oversize(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CodecError::Truncated {
                expected: len,
                got: 0,
            }
        } else {
            CodecError::Io(e)
        }
    })?;
    Ok(buf)
}

/// Read and decode one length-prefixed envelope frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Envelope, CodecError> {
    let buf = read_frame_bytes(reader).await?;
    from_bytes(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> Envelope {
        let mut clock = BTreeMap::new();
        clock.insert("peer-a".to_string(), 3u64);
        clock.insert("peer-b".to_string(), 7u64);
        Envelope::new_data("peer-a", "peer-b", "c2VhbGVk".to_string(), 4, clock)
    }

    #[test]
    fn roundtrip_all_variants() {
        let data = sample_data();
        let ack = Envelope::new_ack("peer-b", "peer-a", data.id());
        let nak = Envelope::new_nak("peer-b", "peer-a", data.id(), &NakReason::Busy);
        let saf = Envelope::new_store_and_forward("peer-a", "peer-r", data.clone());

        for env in [data, ack, nak, saf] {
            let bytes = to_bytes(&env).unwrap();
            let back = from_bytes(&bytes).unwrap();
            assert_eq!(back, env);
        }
    }

    #[test]
    fn wire_field_names() {
        let env = sample_data();
        let value: Value = serde_json::from_slice(&to_bytes(&env).unwrap()).unwrap();
        assert_eq!(value["type"], "data");
        assert!(value.get("sequenceNumber").is_some());
        assert!(value.get("vectorClock").is_some());

        let nak = Envelope::new_nak("b", "a", "m1", &NakReason::DecryptFailed);
        let value: Value = serde_json::from_slice(&to_bytes(&nak).unwrap()).unwrap();
        assert_eq!(value["type"], "nak");
        assert_eq!(value["originalMessageId"], "m1");
        assert_eq!(value["reason"], "decrypt-failed");

        let saf = Envelope::new_store_and_forward("a", "r", sample_data());
        let value: Value = serde_json::from_slice(&to_bytes(&saf).unwrap()).unwrap();
        assert_eq!(value["type"], "store-and-forward");
        assert_eq!(value["storedMessage"]["type"], "data");
    }

    #[test]
    fn unknown_fields_preserved() {
        let raw = serde_json::json!({
            "type": "ack",
            "id": "11111111-2222-4333-8444-555555555555",
            "from": "peer-b",
            "to": "peer-a",
            "timestamp": 1700000000000u64,
            "originalMessageId": "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee",
            "hopCount": 2,
            "viaRelay": "peer-r"
        });
        let bytes = serde_json::to_vec(&raw).unwrap();
        let env = from_bytes(&bytes).unwrap();

        let reencoded: Value = serde_json::from_slice(&to_bytes(&env).unwrap()).unwrap();
        assert_eq!(reencoded["hopCount"], 2);
        assert_eq!(reencoded["viaRelay"], "peer-r");
        // And the tag is emitted exactly once: a second decode still works
        // and compares equal.
        let again = from_bytes(&to_bytes(&env).unwrap()).unwrap();
        assert_eq!(again, env);
    }

    #[test]
    fn missing_required_field_rejected() {
        let raw = serde_json::json!({
            "type": "data",
            "id": "x",
            "from": "a",
            "timestamp": 0,
            "payload": "",
            "sequenceNumber": 1
        });
        let bytes = serde_json::to_vec(&raw).unwrap();
        assert!(from_bytes(&bytes).is_err());
    }

    #[test]
    fn oversize_rejected_on_encode() {
        let mut clock = BTreeMap::new();
        clock.insert("p".to_string(), 1);
        let env = Envelope::new_data("a", "b", "x".repeat(MAX_ENVELOPE_BYTES + 1), 1, clock);
        assert!(matches!(to_bytes(&env), Err(CodecError::Oversize(_))));
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let env = sample_data();
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        write_frame(&mut client, &env).await.unwrap();
        let back = read_frame(&mut server).await.unwrap();
        assert_eq!(back, env);
    }

    #[tokio::test]
    async fn frame_oversize_declared_length() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_u32((MAX_ENVELOPE_BYTES + 1) as u32)
            .await
            .unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, CodecError::Oversize(_)));
    }

    #[tokio::test]
    async fn frame_truncated_body() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(100).await.unwrap();
        client.write_all(b"short").await.unwrap();
        drop(client);
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }
}
