//! BLAKE2s hashing, keyed MAC and the HKDF-style KDF chain
//!
//! WireGuard's KDF is the RFC 2104 HMAC construction instantiated with
//! BLAKE2s-256, expanded HKDF-style with one-byte counters.

use blake2::{
    digest::{consts::U16, FixedOutput, Mac as MacTrait, Update},
    Blake2s256, Blake2sMac, Digest,
};
use hmac::SimpleHmac;

type HmacBlake2s = SimpleHmac<Blake2s256>;

/// BLAKE2s-256 output length
pub const HASH_LEN: usize = 32;

/// Keyed MAC output length (mac1/mac2 fields)
pub const MAC_LEN: usize = 16;

/// BLAKE2s-256 over a single input
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().into()
}

/// BLAKE2s-256 over the concatenation of two inputs: HASH(a || b)
pub fn hash_two(a: &[u8], b: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, a);
    Digest::update(&mut hasher, b);
    hasher.finalize().into()
}

/// 16-byte keyed BLAKE2s MAC
///
/// Key is 32 bytes for mac1, 16 bytes (the cookie) for mac2; BLAKE2s keyed
/// mode accepts both.
pub fn mac(key: &[u8], data: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = Blake2sMac::<U16>::new_from_slice(key).expect("mac key length");
    MacTrait::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// HMAC-BLAKE2s (RFC 2104 construction, as all interoperating
/// implementations use despite the whitepaper notation)
pub fn hmac(key: &[u8], data: &[u8]) -> [u8; HASH_LEN] {
    let mut mac = HmacBlake2s::new_from_slice(key).expect("HMAC accepts any key length");
    Update::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// HKDF expand step: T(n) = HMAC(prk, T(n-1) || n)
fn expand(prk: &[u8; HASH_LEN], prev: &[u8], counter: u8) -> [u8; HASH_LEN] {
    let mut input = [0u8; HASH_LEN + 1];
    input[..prev.len()].copy_from_slice(prev);
    input[prev.len()] = counter;
    hmac(prk, &input[..prev.len() + 1])
}

/// KDF1: derive one key
pub fn kdf1(key: &[u8; HASH_LEN], input: &[u8]) -> [u8; HASH_LEN] {
    let prk = hmac(key, input);
    expand(&prk, &[], 0x01)
}

/// KDF2: derive two keys
pub fn kdf2(key: &[u8; HASH_LEN], input: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let prk = hmac(key, input);
    let t1 = expand(&prk, &[], 0x01);
    let t2 = expand(&prk, &t1, 0x02);
    (t1, t2)
}

/// KDF3: derive three keys (PSK mixing)
pub fn kdf3(
    key: &[u8; HASH_LEN],
    input: &[u8],
) -> ([u8; HASH_LEN], [u8; HASH_LEN], [u8; HASH_LEN]) {
    let prk = hmac(key, input);
    let t1 = expand(&prk, &[], 0x01);
    let t2 = expand(&prk, &t1, 0x02);
    let t3 = expand(&prk, &t2, 0x03);
    (t1, t2, t3)
}
