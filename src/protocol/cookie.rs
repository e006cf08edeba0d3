//! Cookie-based DoS mitigation
//!
//! Under load a responder answers handshake initiations with a cookie reply
//! instead of doing the expensive Noise work. The cookie is a MAC over the
//! source address keyed with a rotating secret, so no per-source state is
//! retained. An initiator presents the cookie back via mac2, proving
//! return-path reachability.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::crypto::{aead, blake2s, noise};
use crate::error::{CryptoError, WirecoreError};
use crate::protocol::messages::CookieReply;

/// How long a received cookie stays usable
pub const COOKIE_VALIDITY: Duration = Duration::from_secs(120);

/// How often the issuer secret rotates
pub const COOKIE_SECRET_ROTATION: Duration = Duration::from_secs(120);

/// Cookie length
pub const COOKIE_LEN: usize = 16;

/// Initiator-side store for cookies received in cookie replies
#[derive(Debug, Clone, Default)]
pub struct CookieStore {
    cookie: Option<[u8; COOKIE_LEN]>,
    received_at: Option<Instant>,
}

impl CookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current cookie, if one is stored and unexpired
    pub fn valid_cookie(&self) -> Option<&[u8; COOKIE_LEN]> {
        match (&self.cookie, self.received_at) {
            (Some(cookie), Some(at)) if at.elapsed() < COOKIE_VALIDITY => Some(cookie),
            _ => None,
        }
    }

    /// Decrypt and store the cookie from a reply
    ///
    /// The reply is bound to the mac1 of the initiation we sent (AAD) and
    /// sealed under a key derived from the issuer's static public key.
    pub fn consume_reply(
        &mut self,
        reply: &CookieReply,
        sent_mac1: &[u8; 16],
        issuer_static: &[u8; 32],
    ) -> Result<(), WirecoreError> {
        let key = noise::cookie_key(issuer_static);
        let decrypted = aead::xopen(&key, &reply.nonce, &reply.encrypted_cookie, sent_mac1)?;

        let cookie: [u8; COOKIE_LEN] =
            decrypted.try_into().map_err(|_| CryptoError::Decryption)?;

        self.cookie = Some(cookie);
        self.received_at = Some(Instant::now());
        tracing::debug!("stored cookie, valid for {:?}", COOKIE_VALIDITY);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.cookie = None;
        self.received_at = None;
    }
}

/// Responder-side cookie issuer and handshake load tracker
///
/// Keeps a rotating secret and a one-second handshake bucket; no state per
/// source address.
pub struct CookieIssuer {
    secret: [u8; 32],
    secret_rotated_at: Instant,
    /// Handshake initiations seen in the current one-second bucket
    bucket_count: u64,
    bucket_started_at: Instant,
    /// Initiations per second above which cookies are demanded
    load_threshold: u64,
}

impl Drop for CookieIssuer {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl CookieIssuer {
    pub fn new(load_threshold: u64) -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let now = Instant::now();
        Self {
            secret,
            secret_rotated_at: now,
            bucket_count: 0,
            bucket_started_at: now,
            load_threshold,
        }
    }

    /// Rotate the secret if it is due; invoked from the engine timer task
    pub fn rotate_if_due(&mut self) {
        if self.secret_rotated_at.elapsed() >= COOKIE_SECRET_ROTATION {
            rand::thread_rng().fill_bytes(&mut self.secret);
            self.secret_rotated_at = Instant::now();
            tracing::debug!("rotated cookie secret");
        }
    }

    /// Count one handshake initiation and report whether we are under load
    pub fn register_initiation(&mut self) -> bool {
        if self.bucket_started_at.elapsed() >= Duration::from_secs(1) {
            self.bucket_count = 0;
            self.bucket_started_at = Instant::now();
        }
        self.bucket_count += 1;
        self.bucket_count > self.load_threshold
    }

    /// The cookie for a source address under the current secret
    pub fn cookie_for(&self, src: SocketAddr) -> [u8; COOKIE_LEN] {
        let mut addr_bytes = Vec::with_capacity(18);
        match src.ip() {
            std::net::IpAddr::V4(ip) => addr_bytes.extend_from_slice(&ip.octets()),
            std::net::IpAddr::V6(ip) => addr_bytes.extend_from_slice(&ip.octets()),
        }
        addr_bytes.extend_from_slice(&src.port().to_le_bytes());
        blake2s::mac(&self.secret, &addr_bytes)
    }

    /// Check the mac2 of a handshake message against the cookie for its
    /// source
    ///
    /// `mac2_off` is where mac2 starts; mac2 covers every byte before it,
    /// including mac1. Secret rotation means a cookie from the previous
    /// period fails and the initiator simply gets a fresh reply.
    pub fn verify_mac2(&self, message: &[u8], mac2_off: usize, src: SocketAddr) -> bool {
        if message.len() < mac2_off + 16 {
            return false;
        }
        let cookie = self.cookie_for(src);
        let expected = blake2s::mac(&cookie, &message[..mac2_off]);
        expected.ct_eq(&message[mac2_off..mac2_off + 16]).into()
    }

    /// Build a cookie reply for a rejected initiation
    ///
    /// Sealed under the key derived from our own static public key with the
    /// received mac1 as AAD, so only the real initiator can use it.
    pub fn create_reply(
        &self,
        receiver_index: u32,
        received_mac1: &[u8; 16],
        src: SocketAddr,
        our_static_public: &[u8; 32],
    ) -> Result<CookieReply, WirecoreError> {
        let cookie = self.cookie_for(src);

        let mut nonce = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut nonce);

        let key = noise::cookie_key(our_static_public);
        let encrypted_cookie: [u8; 32] = aead::xseal(&key, &nonce, &cookie, received_mac1)?
            .try_into()
            .map_err(|_| CryptoError::Encryption)?;

        Ok(CookieReply {
            receiver_index,
            nonce,
            encrypted_cookie,
        })
    }
}
