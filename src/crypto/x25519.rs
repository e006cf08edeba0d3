//! Curve25519 key agreement
//!
//! Thin wrappers over x25519-dalek working on raw 32-byte keys, the form
//! the wire format and the Noise state machine deal in.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of X25519 private and public keys
pub const KEY_LEN: usize = 32;

/// Generate a fresh keypair, returned as (private, public)
pub fn generate_keypair() -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// Derive the public key for a private key
pub fn public_key(private: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private);
    PublicKey::from(&secret).to_bytes()
}

/// X25519 Diffie-Hellman: shared secret from our private and their public key
pub fn dh(private: &[u8; KEY_LEN], public: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private);
    secret.diffie_hellman(&PublicKey::from(*public)).to_bytes()
}

/// Reject the all-zero public key (identity point)
///
/// Low-order points are handled inside x25519-dalek during DH.
pub fn is_valid_public_key(key: &[u8; KEY_LEN]) -> bool {
    !key.iter().all(|&b| b == 0)
}
