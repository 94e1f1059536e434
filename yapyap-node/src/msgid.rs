//! Message ID generation.
//!
//! Every envelope gets a globally unique opaque identifier in UUID v4
//! format: 122 random bits, hex-grouped 8-4-4-4-12, version and variant
//! nibbles fixed.

use rand::Rng;

/// Generate a new UUID v4 string.
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    let mut bytes: [u8; 16] = rng.r#gen();

    // Version 4, RFC 4122 variant.
    bytes[6] = (bytes[6] & 0x0F) | 0x40;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;

    let mut out = String::with_capacity(36);
    for (i, b) in bytes.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        out.push_str(&format!("{b:02x}"));
    }
    out
}
