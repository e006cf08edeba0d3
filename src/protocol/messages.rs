//! WireGuard wire formats
//!
//! - Type 1: handshake initiation (148 bytes)
//! - Type 2: handshake response (92 bytes)
//! - Type 3: cookie reply (64 bytes)
//! - Type 4: transport data (16-byte header + ciphertext)
//!
//! Every field size and byte order is fixed by the standard format; indices
//! and counters are little-endian, the three reserved bytes after the type
//! must be zero.

use crate::error::ProtocolError;

/// Message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    HandshakeInitiation = 1,
    HandshakeResponse = 2,
    CookieReply = 3,
    TransportData = 4,
}

/// Classify a datagram by its first four bytes
///
/// Checks the reserved bytes too, as interoperating implementations do.
pub fn message_type(data: &[u8]) -> Result<MessageType, ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::InvalidMessageLength {
            expected: 4,
            got: data.len(),
        });
    }
    if data[1..4] != [0, 0, 0] {
        return Err(ProtocolError::InvalidMessageType { msg_type: data[0] });
    }
    match data[0] {
        1 => Ok(MessageType::HandshakeInitiation),
        2 => Ok(MessageType::HandshakeResponse),
        3 => Ok(MessageType::CookieReply),
        4 => Ok(MessageType::TransportData),
        other => Err(ProtocolError::InvalidMessageType { msg_type: other }),
    }
}

fn check_len(data: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if data.len() != expected {
        return Err(ProtocolError::InvalidMessageLength {
            expected,
            got: data.len(),
        });
    }
    Ok(())
}

fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(data[off..off + 4].try_into().expect("length checked"))
}

fn read_array<const N: usize>(data: &[u8], off: usize) -> [u8; N] {
    data[off..off + N].try_into().expect("length checked")
}

/// Handshake initiation (148 bytes)
///
/// ```text
/// type(1) | reserved(3) | sender_index(4) | ephemeral(32) |
/// encrypted_static(48) | encrypted_timestamp(28) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeInitiation {
    pub sender_index: u32,
    pub ephemeral_public: [u8; 32],
    pub encrypted_static: [u8; 48],
    pub encrypted_timestamp: [u8; 28],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeInitiation {
    pub const SIZE: usize = 148;

    /// Offset where mac1 starts (mac1 covers everything before it)
    pub const MAC1_OFF: usize = 116;

    /// Offset where mac2 starts (mac2 covers everything before it)
    pub const MAC2_OFF: usize = 132;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = MessageType::HandshakeInitiation as u8;
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..40].copy_from_slice(&self.ephemeral_public);
        buf[40..88].copy_from_slice(&self.encrypted_static);
        buf[88..116].copy_from_slice(&self.encrypted_timestamp);
        buf[116..132].copy_from_slice(&self.mac1);
        buf[132..148].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_len(data, Self::SIZE)?;
        Ok(Self {
            sender_index: read_u32(data, 4),
            ephemeral_public: read_array(data, 8),
            encrypted_static: read_array(data, 40),
            encrypted_timestamp: read_array(data, 88),
            mac1: read_array(data, 116),
            mac2: read_array(data, 132),
        })
    }
}

/// Handshake response (92 bytes)
///
/// ```text
/// type(1) | reserved(3) | sender_index(4) | receiver_index(4) |
/// ephemeral(32) | encrypted_nothing(16) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub sender_index: u32,
    pub receiver_index: u32,
    pub ephemeral_public: [u8; 32],
    pub encrypted_nothing: [u8; 16],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeResponse {
    pub const SIZE: usize = 92;
    pub const MAC1_OFF: usize = 60;
    pub const MAC2_OFF: usize = 76;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = MessageType::HandshakeResponse as u8;
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[12..44].copy_from_slice(&self.ephemeral_public);
        buf[44..60].copy_from_slice(&self.encrypted_nothing);
        buf[60..76].copy_from_slice(&self.mac1);
        buf[76..92].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_len(data, Self::SIZE)?;
        Ok(Self {
            sender_index: read_u32(data, 4),
            receiver_index: read_u32(data, 8),
            ephemeral_public: read_array(data, 12),
            encrypted_nothing: read_array(data, 44),
            mac1: read_array(data, 60),
            mac2: read_array(data, 76),
        })
    }
}

/// Cookie reply (64 bytes)
///
/// ```text
/// type(1) | reserved(3) | receiver_index(4) | nonce(24) | encrypted_cookie(32)
/// ```
#[derive(Debug, Clone)]
pub struct CookieReply {
    pub receiver_index: u32,
    pub nonce: [u8; 24],
    pub encrypted_cookie: [u8; 32],
}

impl CookieReply {
    pub const SIZE: usize = 64;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = MessageType::CookieReply as u8;
        buf[4..8].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[8..32].copy_from_slice(&self.nonce);
        buf[32..64].copy_from_slice(&self.encrypted_cookie);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_len(data, Self::SIZE)?;
        Ok(Self {
            receiver_index: read_u32(data, 4),
            nonce: read_array(data, 8),
            encrypted_cookie: read_array(data, 32),
        })
    }
}

/// Transport data header (16 bytes, followed by the sealed payload)
///
/// ```text
/// type(1) | reserved(3) | receiver_index(4) | counter(8) | ciphertext(n+16)
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TransportHeader {
    pub receiver_index: u32,
    pub counter: u64,
}

impl TransportHeader {
    pub const SIZE: usize = 16;

    /// Shortest valid transport message: header plus the tag of an empty
    /// payload (a keepalive)
    pub const MIN_SIZE: usize = Self::SIZE + 16;

    /// Assemble a complete transport message around a sealed payload
    pub fn build_message(receiver_index: u32, counter: u64, ciphertext: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE + ciphertext.len());
        buf.push(MessageType::TransportData as u8);
        buf.extend_from_slice(&[0, 0, 0]);
        buf.extend_from_slice(&receiver_index.to_le_bytes());
        buf.extend_from_slice(&counter.to_le_bytes());
        buf.extend_from_slice(ciphertext);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::MIN_SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::MIN_SIZE,
                got: data.len(),
            });
        }
        Ok(Self {
            receiver_index: read_u32(data, 4),
            counter: u64::from_le_bytes(data[8..16].try_into().expect("length checked")),
        })
    }

    /// The sealed payload of a transport message
    pub fn payload(data: &[u8]) -> &[u8] {
        &data[Self::SIZE..]
    }
}
