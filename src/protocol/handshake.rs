//! Noise IKpsk2 handshake state machines
//!
//! One initiator and one responder path. Either path starts idle, walks the
//! message flow, and ends idle again: success hands a [`HandshakeOutcome`]
//! to the session layer, any authentication failure discards the ephemeral
//! state with no side effects.

use subtle::ConstantTimeEq;
use tai64::Tai64N;
use zeroize::Zeroize;

use crate::crypto::{noise, noise::SymmetricState, x25519};
use crate::error::{CryptoError, ProtocolError, WirecoreError};
use crate::protocol::messages::{HandshakeInitiation, HandshakeResponse};

/// Session keys and indices produced by a completed handshake
#[derive(Clone)]
pub struct HandshakeOutcome {
    /// Our session index
    pub local_index: u32,
    /// Peer's session index
    pub remote_index: u32,
    /// Key for sealing outgoing packets
    pub sending_key: [u8; 32],
    /// Key for opening incoming packets
    pub receiving_key: [u8; 32],
    /// True if we initiated this handshake
    pub is_initiator: bool,
}

impl Drop for HandshakeOutcome {
    fn drop(&mut self) {
        self.sending_key.zeroize();
        self.receiving_key.zeroize();
    }
}

/// Constant-time MAC comparison; uniform failure behavior for all MAC checks
fn macs_equal(a: &[u8; 16], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Verify the mac1 field of a handshake message addressed to us
///
/// `mac1_off` is the offset where mac1 starts; it covers every byte before
/// it. The key is bound to the receiver's static public key.
pub fn verify_mac1(
    message: &[u8],
    mac1_off: usize,
    receiver_static: &[u8; 32],
) -> Result<(), ProtocolError> {
    if message.len() < mac1_off + 16 {
        return Err(ProtocolError::InvalidMessageLength {
            expected: mac1_off + 16,
            got: message.len(),
        });
    }

    let key = noise::mac1_key(receiver_static);
    let expected = crate::crypto::blake2s::mac(&key, &message[..mac1_off]);
    if !macs_equal(&expected, &message[mac1_off..mac1_off + 16]) {
        return Err(ProtocolError::MacVerificationFailed);
    }
    Ok(())
}

/// In-progress handshake, initiator side
pub struct InitiatorHandshake {
    static_private: [u8; 32],
    static_public: [u8; 32],
    peer_static: [u8; 32],
    psk: [u8; 32],
    local_index: u32,
    ephemeral_private: [u8; 32],
    state: SymmetricState,
    /// mac1 of the initiation we sent, the AAD for a cookie reply
    pub sent_mac1: [u8; 16],
}

impl Drop for InitiatorHandshake {
    fn drop(&mut self) {
        self.static_private.zeroize();
        self.psk.zeroize();
        self.ephemeral_private.zeroize();
    }
}

impl InitiatorHandshake {
    pub fn new(
        static_private: [u8; 32],
        peer_static: [u8; 32],
        psk: Option<[u8; 32]>,
        local_index: u32,
    ) -> Self {
        Self {
            static_private,
            static_public: x25519::public_key(&static_private),
            peer_static,
            psk: psk.unwrap_or([0u8; 32]),
            local_index,
            ephemeral_private: [0u8; 32],
            state: SymmetricState::new(&peer_static),
            sent_mac1: [0u8; 16],
        }
    }

    /// Build the initiation message, advancing to the waiting-for-response
    /// state
    pub fn create_initiation(
        &mut self,
        cookie: Option<&[u8; 16]>,
    ) -> Result<HandshakeInitiation, WirecoreError> {
        // Restart from the base transcript in case this is a retry
        self.state = SymmetricState::new(&self.peer_static);

        let (ephemeral_private, ephemeral_public) = x25519::generate_keypair();
        self.ephemeral_private = ephemeral_private;

        // e
        self.state.mix_ephemeral(&ephemeral_public);

        // es
        let key = self
            .state
            .mix_key(&x25519::dh(&ephemeral_private, &self.peer_static));

        // s
        let encrypted_static: [u8; 48] = self
            .state
            .encrypt_and_hash(&key, &self.static_public)?
            .try_into()
            .map_err(|_| CryptoError::Encryption)?;

        // ss
        let key = self
            .state
            .mix_key(&x25519::dh(&self.static_private, &self.peer_static));

        // TAI64N timestamp, replay-checked by the responder
        let encrypted_timestamp: [u8; 28] = self
            .state
            .encrypt_and_hash(&key, &Tai64N::now().to_bytes())?
            .try_into()
            .map_err(|_| CryptoError::Encryption)?;

        let mut msg = HandshakeInitiation {
            sender_index: self.local_index,
            ephemeral_public,
            encrypted_static,
            encrypted_timestamp,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };

        let bytes = msg.to_bytes();
        let mac1_key = noise::mac1_key(&self.peer_static);
        msg.mac1 = crate::crypto::blake2s::mac(&mac1_key, &bytes[..HandshakeInitiation::MAC1_OFF]);
        self.sent_mac1 = msg.mac1;

        if let Some(cookie) = cookie {
            // mac2 covers the message including mac1
            let bytes = msg.to_bytes();
            msg.mac2 =
                crate::crypto::blake2s::mac(cookie, &bytes[..HandshakeInitiation::MAC2_OFF]);
        }

        Ok(msg)
    }

    /// Consume the response, deriving the transport keys
    pub fn consume_response(
        &mut self,
        response: &HandshakeResponse,
    ) -> Result<HandshakeOutcome, WirecoreError> {
        if response.receiver_index != self.local_index {
            return Err(ProtocolError::UnknownReceiverIndex {
                index: response.receiver_index,
            }
            .into());
        }

        // Work on a copy so a forged response leaves our state untouched
        let mut state = self.state.clone();

        // e
        state.mix_ephemeral(&response.ephemeral_public);

        // ee
        state.mix_key(&x25519::dh(
            &self.ephemeral_private,
            &response.ephemeral_public,
        ));

        // se
        state.mix_key(&x25519::dh(&self.static_private, &response.ephemeral_public));

        // psk
        let key = state.mix_key_and_hash(&self.psk);

        // Authenticates the whole transcript
        state.decrypt_and_hash(&key, &response.encrypted_nothing)?;

        let (sending_key, receiving_key) = state.derive_transport_keys(true);

        Ok(HandshakeOutcome {
            local_index: self.local_index,
            remote_index: response.sender_index,
            sending_key,
            receiving_key,
            is_initiator: true,
        })
    }
}

/// A validated initiation whose sender is not yet confirmed as a known peer
///
/// The responder must decrypt the static key before it can look up the
/// peer's PSK, so consumption is split in two: [`consume_initiation`]
/// authenticates and yields the claimed identity, then
/// [`PendingInitiation::create_response`] completes the flow once the caller
/// has resolved the peer.
pub struct PendingInitiation {
    /// Decrypted initiator static public key
    pub peer_static: [u8; 32],
    /// Decrypted TAI64N timestamp, to be replay-checked against the last
    /// accepted one for this peer
    pub timestamp: Tai64N,
    /// Initiator's session index
    pub remote_index: u32,
    state: SymmetricState,
    initiator_ephemeral: [u8; 32],
}

/// Consume a handshake initiation as responder (mac1 must already be
/// verified)
pub fn consume_initiation(
    initiation: &HandshakeInitiation,
    our_static_private: &[u8; 32],
    our_static_public: &[u8; 32],
) -> Result<PendingInitiation, WirecoreError> {
    let mut state = SymmetricState::new(our_static_public);

    // e
    state.mix_ephemeral(&initiation.ephemeral_public);

    // es
    let key = state.mix_key(&x25519::dh(our_static_private, &initiation.ephemeral_public));

    // s
    let peer_static: [u8; 32] = state
        .decrypt_and_hash(&key, &initiation.encrypted_static)?
        .try_into()
        .map_err(|_| CryptoError::Decryption)?;

    if !x25519::is_valid_public_key(&peer_static) {
        return Err(CryptoError::InvalidPublicKey.into());
    }

    // ss
    let key = state.mix_key(&x25519::dh(our_static_private, &peer_static));

    let timestamp_bytes: [u8; 12] = state
        .decrypt_and_hash(&key, &initiation.encrypted_timestamp)?
        .try_into()
        .map_err(|_| CryptoError::Decryption)?;
    let timestamp = Tai64N::from_slice(&timestamp_bytes).map_err(|_| CryptoError::Decryption)?;

    Ok(PendingInitiation {
        peer_static,
        timestamp,
        remote_index: initiation.sender_index,
        state,
        initiator_ephemeral: initiation.ephemeral_public,
    })
}

impl PendingInitiation {
    /// Build the response and derive transport keys, completing the
    /// responder side
    pub fn create_response(
        mut self,
        psk: Option<[u8; 32]>,
        local_index: u32,
        cookie: Option<&[u8; 16]>,
    ) -> Result<(HandshakeResponse, HandshakeOutcome), WirecoreError> {
        let (ephemeral_private, ephemeral_public) = x25519::generate_keypair();

        // e
        self.state.mix_ephemeral(&ephemeral_public);

        // ee
        self.state
            .mix_key(&x25519::dh(&ephemeral_private, &self.initiator_ephemeral));

        // se
        self.state
            .mix_key(&x25519::dh(&ephemeral_private, &self.peer_static));

        // psk
        let mut psk = psk.unwrap_or([0u8; 32]);
        let key = self.state.mix_key_and_hash(&psk);
        psk.zeroize();

        let encrypted_nothing: [u8; 16] = self
            .state
            .encrypt_and_hash(&key, &[])?
            .try_into()
            .map_err(|_| CryptoError::Encryption)?;

        let mut msg = HandshakeResponse {
            sender_index: local_index,
            receiver_index: self.remote_index,
            ephemeral_public,
            encrypted_nothing,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };

        // mac1 is keyed with the initiator's static public key
        let bytes = msg.to_bytes();
        let mac1_key = noise::mac1_key(&self.peer_static);
        msg.mac1 = crate::crypto::blake2s::mac(&mac1_key, &bytes[..HandshakeResponse::MAC1_OFF]);

        if let Some(cookie) = cookie {
            let bytes = msg.to_bytes();
            msg.mac2 =
                crate::crypto::blake2s::mac(cookie, &bytes[..HandshakeResponse::MAC2_OFF]);
        }

        let (sending_key, receiving_key) = self.state.derive_transport_keys(false);

        Ok((
            msg,
            HandshakeOutcome {
                local_index,
                remote_index: self.remote_index,
                sending_key,
                receiving_key,
                is_initiator: false,
            },
        ))
    }
}
