//! Sealed-box payload encryption.
//!
//! Payloads are encrypted to the recipient's Ed25519 identity: the
//! verifying key is mapped to its Curve25519 Montgomery form for X25519,
//! the sender generates an ephemeral X25519 keypair, and the DH shared
//! secret is expanded with HKDF-SHA256 into an AES-256-GCM key. The wire
//! form is `ephemeral_pub(32) || nonce(12) || ciphertext`, base64.
//!
//! Envelope routing fields stay in the clear; only the `payload` object is
//! sealed.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::SealError;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const HKDF_INFO: &[u8] = b"yapyap-seal-v1";

/// Map an Ed25519 verifying key onto its X25519 public key.
fn x25519_public(recipient: &VerifyingKey) -> PublicKey {
    PublicKey::from(recipient.to_montgomery().to_bytes())
}

/// Derive the X25519 static secret from an Ed25519 signing key.
///
/// Standard birational conversion: the clamped low half of SHA-512 over the
/// seed, the same scalar Ed25519 signing uses.
fn x25519_secret(identity: &SigningKey) -> StaticSecret {
    let hash = Sha512::digest(identity.to_bytes());
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&hash[..32]);
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
    StaticSecret::from(scalar)
}

/// Expand the DH output into an AES-256-GCM key, bound to both public keys.
fn derive_key(
    shared: &[u8],
    ephemeral_pub: &PublicKey,
    recipient_pub: &PublicKey,
) -> Result<[u8; KEY_LEN], SealError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_pub.as_bytes());
    salt[32..].copy_from_slice(recipient_pub.as_bytes());
    let hk = hkdf::Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = [0u8; KEY_LEN];
    hk.expand(HKDF_INFO, &mut key)
        .map_err(|_| SealError::Encrypt)?;
    Ok(key)
}

/// Seal `plaintext` for the holder of `recipient`.
pub fn seal(recipient: &VerifyingKey, plaintext: &[u8]) -> Result<String, SealError> {
    let recipient_pub = x25519_public(recipient);

    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_pub = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient_pub);

    let key = derive_key(shared.as_bytes(), &ephemeral_pub, &recipient_pub)?;
    let cipher = Aes256Gcm::new((&key).into());

    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| SealError::Encrypt)?;

    let mut wire = Vec::with_capacity(32 + NONCE_LEN + ciphertext.len());
    wire.extend_from_slice(ephemeral_pub.as_bytes());
    wire.extend_from_slice(&nonce_bytes);
    wire.extend_from_slice(&ciphertext);
    Ok(B64.encode(&wire))
}

/// Open a sealed payload with our identity key.
pub fn open(identity: &SigningKey, sealed: &str) -> Result<Vec<u8>, SealError> {
    let wire = B64.decode(sealed).map_err(|_| SealError::Encoding)?;
    if wire.len() < 32 + NONCE_LEN {
        return Err(SealError::Encoding);
    }

    let mut ephemeral_bytes = [0u8; 32];
    ephemeral_bytes.copy_from_slice(&wire[..32]);
    let ephemeral_pub = PublicKey::from(ephemeral_bytes);
    let nonce = Nonce::from_slice(&wire[32..32 + NONCE_LEN]);
    let ciphertext = &wire[32 + NONCE_LEN..];

    let secret = x25519_secret(identity);
    let our_pub = x25519_public(&identity.verifying_key());
    let shared = secret.diffie_hellman(&ephemeral_pub);

    let key = derive_key(shared.as_bytes(), &ephemeral_pub, &our_pub)?;
    let cipher = Aes256Gcm::new((&key).into());
    cipher.decrypt(nonce, ciphertext).map_err(|_| SealError::Decrypt)
}
