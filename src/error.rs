//! Error types for the wirecore protocol engine

use thiserror::Error;

/// Main error type for wirecore
#[derive(Error, Debug)]
pub enum WirecoreError {
    /// Configuration errors (rejected at load time)
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid key length: expected 32 bytes, got {got}")]
    InvalidKeyLength { got: usize },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Duplicate peer public key: {key}")]
    DuplicatePeer { key: String },

    #[error("Peer {key} has no allowed IPs")]
    NoAllowedIps { key: String },

    #[error("Invalid MTU {mtu}: must be between 576 and 65435")]
    InvalidMtu { mtu: u16 },

    #[error("Invalid keepalive interval: {seconds}s")]
    InvalidKeepalive { seconds: u16 },
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or authentication tag")]
    Decryption,

    #[error("Invalid public key")]
    InvalidPublicKey,
}

/// Protocol-level errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Handshake timeout after {seconds}s")]
    HandshakeTimeout { seconds: u64 },

    #[error("Peer unreachable: {attempts} handshake attempts failed")]
    PeerUnreachable { attempts: u32 },

    #[error("Invalid message type: {msg_type}")]
    InvalidMessageType { msg_type: u8 },

    #[error("Invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("MAC verification failed")]
    MacVerificationFailed,

    #[error("Stale handshake timestamp")]
    StaleTimestamp,

    #[error("Replay detected: counter {counter} already seen")]
    ReplayDetected { counter: u64 },

    #[error("Counter {counter} outside replay window")]
    CounterOutOfWindow { counter: u64 },

    #[error("Session expired")]
    SessionExpired,

    #[error("No active session")]
    NoSession,

    #[error("Unknown receiver index: {index}")]
    UnknownReceiverIndex { index: u32 },

    #[error("Unknown peer")]
    UnknownPeer,

    #[error("Cookie required")]
    CookieRequired,
}

/// Datagram / virtual interface errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("No known endpoint for peer")]
    NoEndpoint,

    #[error("Transport closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WirecoreError {
    /// Check if this error is recoverable at runtime
    ///
    /// Transient errors (decrypt failures, replays, timeouts) are dropped or
    /// retried. Session-fatal errors allow a fresh handshake. Config errors
    /// are fatal before any session work begins.
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Fatal errors
            Self::Config(_) => false,
            Self::Transport(TransportError::BindFailed { .. }) => false,
            Self::Transport(TransportError::Closed) => false,

            // Transient and session-fatal errors
            Self::Protocol(ProtocolError::HandshakeTimeout { .. }) => true,
            Self::Protocol(ProtocolError::PeerUnreachable { .. }) => true,
            Self::Protocol(ProtocolError::SessionExpired) => true,
            Self::Protocol(ProtocolError::NoSession) => true,
            Self::Protocol(ProtocolError::MacVerificationFailed) => true,
            Self::Protocol(ProtocolError::ReplayDetected { .. }) => true,
            Self::Protocol(ProtocolError::CounterOutOfWindow { .. }) => true,
            Self::Crypto(CryptoError::Decryption) => true,
            Self::Transport(TransportError::SendFailed { .. }) => true,
            Self::Transport(TransportError::ReceiveFailed { .. }) => true,

            // Default to non-recoverable for safety
            _ => false,
        }
    }
}

/// Result type alias for wirecore operations
pub type Result<T> = std::result::Result<T, WirecoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_recoverable() {
        let err: WirecoreError = ProtocolError::ReplayDetected { counter: 7 }.into();
        assert!(err.is_recoverable());

        let err: WirecoreError = CryptoError::Decryption.into();
        assert!(err.is_recoverable());

        let err: WirecoreError = ProtocolError::SessionExpired.into();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_config_errors_fatal() {
        let err: WirecoreError = ConfigError::InvalidKeyLength { got: 16 }.into();
        assert!(!err.is_recoverable());
    }
}
