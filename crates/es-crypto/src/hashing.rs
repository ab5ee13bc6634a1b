//! # SHA-256 Hashing
//!
//! Digest helpers used for trust-root fingerprints.

use sha2::{Digest, Sha256};

/// SHA-256 hash output (256-bit).
pub type Hash = [u8; 32];

/// Hash data with SHA-256 (one-shot).
pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// Format a digest the way `openssl x509 -fingerprint` does, in lowercase:
/// hex byte pairs joined by `:`.
pub fn colon_hex(hash: &[u8]) -> String {
    hash.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}
