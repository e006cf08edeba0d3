//! Noise IKpsk2 symmetric state
//!
//! Pattern: Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s. This module holds the
//! hash/chaining-key accumulator shared by both handshake roles; the message
//! flow lives in `protocol::handshake`.

use zeroize::Zeroize;

use super::{aead, blake2s};
use crate::error::CryptoError;

/// Noise construction string
pub const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";

/// WireGuard identifier string
pub const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";

/// Label for mac1 key derivation
pub const LABEL_MAC1: &[u8] = b"mac1----";

/// Label for cookie key derivation
pub const LABEL_COOKIE: &[u8] = b"cookie--";

/// Hash and chaining key length
pub const HASH_LEN: usize = 32;

/// Hash/chaining-key accumulator for an in-progress handshake
///
/// Both roles seed it with the responder's static public key, which is what
/// makes the two transcripts converge.
#[derive(Clone)]
pub struct SymmetricState {
    pub chaining_key: [u8; HASH_LEN],
    pub hash: [u8; HASH_LEN],
}

impl Drop for SymmetricState {
    fn drop(&mut self) {
        self.chaining_key.zeroize();
        self.hash.zeroize();
    }
}

impl SymmetricState {
    /// ck = HASH(CONSTRUCTION); h = HASH(HASH(ck || IDENTIFIER) || S_resp)
    pub fn new(responder_static: &[u8; 32]) -> Self {
        let chaining_key = blake2s::hash(CONSTRUCTION);
        let h = blake2s::hash_two(&chaining_key, IDENTIFIER);
        Self {
            chaining_key,
            hash: blake2s::hash_two(&h, responder_static),
        }
    }

    /// MixHash: h = HASH(h || data)
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.hash = blake2s::hash_two(&self.hash, data);
    }

    /// Absorb an ephemeral public key: MixHash plus ck = KDF1(ck, e)
    pub fn mix_ephemeral(&mut self, ephemeral_public: &[u8; 32]) {
        self.mix_hash(ephemeral_public);
        self.chaining_key = blake2s::kdf1(&self.chaining_key, ephemeral_public);
    }

    /// MixKey: (ck, k) = KDF2(ck, ikm); returns k
    pub fn mix_key(&mut self, input: &[u8]) -> [u8; 32] {
        let (ck, key) = blake2s::kdf2(&self.chaining_key, input);
        self.chaining_key = ck;
        key
    }

    /// MixKeyAndHash: (ck, t, k) = KDF3(ck, psk); mixes t into the hash,
    /// returns k. Used once per handshake for the pre-shared key.
    pub fn mix_key_and_hash(&mut self, psk: &[u8; 32]) -> [u8; 32] {
        let (ck, tau, key) = blake2s::kdf3(&self.chaining_key, psk);
        self.chaining_key = ck;
        self.mix_hash(&tau);
        key
    }

    /// c = AEAD(k, 0, plaintext, h); h = HASH(h || c)
    pub fn encrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = aead::seal(key, 0, plaintext, &self.hash)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    /// p = AEAD-open(k, 0, ciphertext, h); h = HASH(h || ciphertext)
    pub fn decrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let plaintext = aead::open(key, 0, ciphertext, &self.hash)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Final transport keys: (send, recv) = KDF2(ck, "")
    ///
    /// The initiator sends under the first output; the responder's keys are
    /// the mirror image.
    pub fn derive_transport_keys(&self, initiator: bool) -> ([u8; 32], [u8; 32]) {
        let (t1, t2) = blake2s::kdf2(&self.chaining_key, &[]);
        if initiator {
            (t1, t2)
        } else {
            (t2, t1)
        }
    }
}

/// mac1 key for messages addressed to `receiver_static`:
/// HASH(LABEL_MAC1 || S_receiver)
pub fn mac1_key(receiver_static: &[u8; 32]) -> [u8; 32] {
    blake2s::hash_two(LABEL_MAC1, receiver_static)
}

/// Cookie encryption key for cookies issued by `issuer_static`:
/// HASH(LABEL_COOKIE || S_issuer)
pub fn cookie_key(issuer_static: &[u8; 32]) -> [u8; 32] {
    blake2s::hash_two(LABEL_COOKIE, issuer_static)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_roles_share_initial_state() {
        let responder_static = [42u8; 32];
        let a = SymmetricState::new(&responder_static);
        let b = SymmetricState::new(&responder_static);

        assert_eq!(a.chaining_key, b.chaining_key);
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn test_encrypt_decrypt_keeps_transcripts_aligned() {
        let mut sender = SymmetricState::new(&[0u8; 32]);
        let mut receiver = sender.clone();
        let key = [9u8; 32];

        let c = sender.encrypt_and_hash(&key, b"static key").unwrap();
        let p = receiver.decrypt_and_hash(&key, &c).unwrap();

        assert_eq!(p, b"static key");
        assert_eq!(sender.hash, receiver.hash);
    }

    #[test]
    fn test_transport_keys_mirror() {
        let state = SymmetricState::new(&[1u8; 32]);
        let (i_send, i_recv) = state.derive_transport_keys(true);
        let (r_send, r_recv) = state.derive_transport_keys(false);

        assert_eq!(i_send, r_recv);
        assert_eq!(i_recv, r_send);
    }

    #[test]
    fn test_mac1_and_cookie_keys_differ() {
        let s = [7u8; 32];
        assert_ne!(mac1_key(&s), cookie_key(&s));
    }
}
