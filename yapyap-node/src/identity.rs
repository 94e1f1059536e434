//! Node identity.
//!
//! One Ed25519 keypair per data directory, created on first start and
//! immutable afterwards. The peer id is the public key in its endpoint-id
//! string form, so the transport identity, the envelope addressing, and
//! the sealed-box recipient key are all the same key.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;

use crate::error::{StoreError, TransportError};
use crate::now_ms;
use crate::store::{Store, StoredIdentity};

/// The running node's keypair in both transport and signature form.
#[derive(Clone)]
pub struct NodeIdentity {
    peer_id: String,
    signing: SigningKey,
    secret: iroh::SecretKey,
}

impl NodeIdentity {
    /// Load the identity from the store, creating and persisting a fresh
    /// one on first start.
    pub fn load_or_create(store: &Store) -> Result<Self, StoreError> {
        if let Some(stored) = store.identity()? {
            let identity = Self::from_secret_bytes(stored.secret_key);
            tracing::debug!(peer = %identity.peer_id, "loaded node identity");
            return Ok(identity);
        }

        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let identity = Self::from_secret_bytes(bytes);
        store.create_identity(&StoredIdentity {
            peer_id: identity.peer_id.clone(),
            secret_key: bytes,
            public_key: identity.signing.verifying_key().to_bytes(),
            created_at: now_ms(),
        })?;
        tracing::info!(peer = %identity.peer_id, "generated new node identity");
        Ok(identity)
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = iroh::SecretKey::from_bytes(&bytes);
        let signing = SigningKey::from_bytes(&bytes);
        let peer_id = secret.public().to_string();
        Self {
            peer_id,
            signing,
            secret,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Key for opening sealed payloads addressed to this node.
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    /// Key for the transport endpoint.
    pub fn secret_key(&self) -> &iroh::SecretKey {
        &self.secret
    }
}

/// Recover the Ed25519 verifying key encoded in a peer id string.
pub fn verifying_key_for(peer_id: &str) -> Result<VerifyingKey, TransportError> {
    let endpoint_id: iroh::EndpointId = peer_id
        .parse()
        .map_err(|_| TransportError::InvalidPeerId(peer_id.to_string()))?;
    VerifyingKey::from_bytes(endpoint_id.as_bytes())
        .map_err(|_| TransportError::InvalidPeerId(peer_id.to_string()))
}
