//! Data-packet sealing and the anti-replay window
//!
//! ChaCha20-Poly1305 under the session keys, nonce taken from the 64-bit
//! packet counter. The replay window is an RFC 6479 style word-ring bitmap
//! sized to the protocol default of 2^13 entries.

use zeroize::Zeroize;

use crate::crypto::aead;
use crate::error::{CryptoError, ProtocolError, WirecoreError};
use crate::protocol::messages::TransportHeader;

/// Counter ceiling: sessions are hard-expired here.
/// REJECT_AFTER_MESSAGES = 2^64 - 2^13 - 1
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - 8192;

/// Send counter at which a rekey is initiated (2^60)
pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;

/// Replay window bitmap size in counters (2^13)
pub const REPLAY_WINDOW_SIZE: u64 = 8192;

const WORD_BITS: u64 = 64;
const WORDS: usize = (REPLAY_WINDOW_SIZE / WORD_BITS) as usize;

/// Sliding anti-replay window
///
/// Bits live in a ring of 64-bit words indexed by counter. Advancing the top
/// clears the words it crosses, so the usable depth is the bitmap minus the
/// word in progress. Each counter is accepted at most once; counters below
/// the window floor are rejected outright.
#[derive(Clone)]
pub struct ReplayWindow {
    /// One past the highest accepted counter
    next: u64,
    bitmap: [u64; WORDS],
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReplayWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayWindow").field("next", &self.next).finish()
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            next: 0,
            bitmap: [0u64; WORDS],
        }
    }

    fn bit(counter: u64) -> (usize, u64) {
        let word = ((counter / WORD_BITS) % WORDS as u64) as usize;
        (word, 1u64 << (counter % WORD_BITS))
    }

    /// Accept `counter` if it has not been seen and is inside the window,
    /// marking it as seen
    pub fn check_and_update(&mut self, counter: u64) -> Result<(), ProtocolError> {
        if counter >= self.next {
            // Advance the top, clearing every word the jump crosses
            let cur_word = if self.next == 0 { 0 } else { (self.next - 1) / WORD_BITS };
            let new_word = counter / WORD_BITS;
            let crossed = new_word - cur_word;
            if crossed >= WORDS as u64 {
                self.bitmap = [0u64; WORDS];
            } else {
                for i in 1..=crossed {
                    self.bitmap[((cur_word + i) % WORDS as u64) as usize] = 0;
                }
            }
            let (word, bit) = Self::bit(counter);
            self.bitmap[word] |= bit;
            self.next = counter + 1;
            return Ok(());
        }

        if self.next - counter > REPLAY_WINDOW_SIZE - WORD_BITS {
            return Err(ProtocolError::CounterOutOfWindow { counter });
        }

        let (word, bit) = Self::bit(counter);
        if self.bitmap[word] & bit != 0 {
            return Err(ProtocolError::ReplayDetected { counter });
        }
        self.bitmap[word] |= bit;
        Ok(())
    }

    /// Whether `counter` would currently be accepted, without marking it
    pub fn would_accept(&self, counter: u64) -> bool {
        if counter >= self.next {
            return true;
        }
        if self.next - counter > REPLAY_WINDOW_SIZE - WORD_BITS {
            return false;
        }
        let (word, bit) = Self::bit(counter);
        self.bitmap[word] & bit == 0
    }
}

/// Per-session transport state: keys, send counter, replay window
pub struct SessionTransport {
    sending_key: [u8; 32],
    receiving_key: [u8; 32],
    sending_counter: u64,
    replay_window: ReplayWindow,
}

impl Drop for SessionTransport {
    fn drop(&mut self) {
        self.sending_key.zeroize();
        self.receiving_key.zeroize();
    }
}

impl SessionTransport {
    pub fn new(sending_key: [u8; 32], receiving_key: [u8; 32]) -> Self {
        Self {
            sending_key,
            receiving_key,
            sending_counter: 0,
            replay_window: ReplayWindow::new(),
        }
    }

    /// Seal a plaintext packet into a complete transport message
    ///
    /// Fails with `SessionExpired` once the counter ceiling is reached; the
    /// session layer must then withhold traffic until a fresh handshake.
    pub fn seal(
        &mut self,
        receiver_index: u32,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, WirecoreError> {
        if self.sending_counter >= REJECT_AFTER_MESSAGES {
            return Err(ProtocolError::SessionExpired.into());
        }
        let counter = self.sending_counter;
        self.sending_counter += 1;

        let ciphertext = aead::seal(&self.sending_key, counter, plaintext, &[])?;
        Ok(TransportHeader::build_message(receiver_index, counter, &ciphertext))
    }

    /// Open a transport message, enforcing the replay window
    pub fn open(&mut self, packet: &[u8]) -> Result<Vec<u8>, WirecoreError> {
        let header = TransportHeader::from_bytes(packet)?;
        if header.counter >= REJECT_AFTER_MESSAGES {
            return Err(ProtocolError::SessionExpired.into());
        }

        let ciphertext = TransportHeader::payload(packet);
        if ciphertext.len() < aead::TAG_LEN {
            return Err(CryptoError::Decryption.into());
        }

        // Authenticate before the window is touched so forged counters
        // cannot disturb it
        let plaintext = aead::open(&self.receiving_key, header.counter, ciphertext, &[])?;
        self.replay_window.check_and_update(header.counter)?;

        Ok(plaintext)
    }

    /// Current send counter (for rekey-after-messages checks)
    pub fn sending_counter(&self) -> u64 {
        self.sending_counter
    }

    /// Whether the send counter calls for a proactive rekey
    pub fn needs_rekey_by_counter(&self) -> bool {
        self.sending_counter >= REKEY_AFTER_MESSAGES
    }
}
