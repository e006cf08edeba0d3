//! WireGuard protocol core
//!
//! - Wire formats (types 1-4)
//! - Noise IKpsk2 handshake, both roles
//! - Cookie/DoS mitigation
//! - Session generations and key lifecycle
//! - Data-packet sealing and replay protection

pub mod cookie;
pub mod handshake;
pub mod messages;
pub mod session;
pub mod transport;

pub use cookie::{CookieIssuer, CookieStore};
pub use handshake::{
    consume_initiation, verify_mac1, HandshakeOutcome, InitiatorHandshake, PendingInitiation,
};
pub use messages::{
    message_type, CookieReply, HandshakeInitiation, HandshakeResponse, MessageType,
    TransportHeader,
};
pub use session::{Session, SessionSet};
pub use transport::{ReplayWindow, SessionTransport};
