//! AEAD primitives
//!
//! ChaCha20-Poly1305 for handshake payloads and transport data,
//! XChaCha20-Poly1305 for cookie replies.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce,
};

use crate::error::CryptoError;

/// Poly1305 authentication tag length
pub const TAG_LEN: usize = 16;

/// AEAD key length
pub const KEY_LEN: usize = 32;

/// XChaCha20-Poly1305 nonce length (cookie replies)
pub const XNONCE_LEN: usize = 24;

/// WireGuard nonce: 32 zero bits then the 64-bit counter, little-endian
fn counter_nonce(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_le_bytes());
    bytes.into()
}

/// Seal with ChaCha20-Poly1305 under a counter nonce
pub fn seal(
    key: &[u8; KEY_LEN],
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(&counter_nonce(counter), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encryption)
}

/// Open with ChaCha20-Poly1305 under a counter nonce
pub fn open(
    key: &[u8; KEY_LEN],
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(&counter_nonce(counter), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Decryption)
}

/// Seal with XChaCha20-Poly1305 (cookie reply encryption)
pub fn xseal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encryption)
}

/// Open with XChaCha20-Poly1305 (cookie reply decryption)
pub fn xopen(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [3u8; 32];
        let sealed = seal(&key, 9, b"ip packet bytes", b"").unwrap();
        assert_eq!(sealed.len(), 15 + TAG_LEN);

        let opened = open(&key, 9, &sealed, b"").unwrap();
        assert_eq!(opened, b"ip packet bytes");
    }

    #[test]
    fn test_open_rejects_tampering() {
        let key = [3u8; 32];
        let mut sealed = seal(&key, 9, b"ip packet bytes", b"").unwrap();

        // Wrong counter, wrong aad, flipped bit: all must fail
        assert!(open(&key, 10, &sealed, b"").is_err());
        assert!(open(&key, 9, &sealed, b"aad").is_err());
        sealed[0] ^= 0x80;
        assert!(open(&key, 9, &sealed, b"").is_err());
    }

    #[test]
    fn test_empty_plaintext_is_just_tag() {
        // Handshake responses and keepalives seal empty payloads
        let key = [0u8; 32];
        let sealed = seal(&key, 0, &[], b"").unwrap();
        assert_eq!(sealed.len(), TAG_LEN);
        assert!(open(&key, 0, &sealed, b"").unwrap().is_empty());
    }

    #[test]
    fn test_xseal_roundtrip_with_mac_aad() {
        let key = [5u8; 32];
        let nonce = [6u8; 24];
        let sealed = xseal(&key, &nonce, &[0xAB; 16], &[1u8; 16]).unwrap();
        let opened = xopen(&key, &nonce, &sealed, &[1u8; 16]).unwrap();
        assert_eq!(opened, [0xAB; 16]);

        assert!(xopen(&key, &nonce, &sealed, &[2u8; 16]).is_err());
    }
}
