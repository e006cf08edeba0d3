//! Cryptographic primitives for the WireGuard protocol
//!
//! Pure, stateless building blocks: Curve25519 key agreement, BLAKE2s
//! hashing/MAC/KDF and ChaCha20-Poly1305 AEAD, plus the Noise IKpsk2
//! symmetric state built on top of them.

pub mod aead;
pub mod blake2s;
pub mod noise;
pub mod x25519;
