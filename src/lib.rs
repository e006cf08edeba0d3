//! wirecore: an embeddable WireGuard protocol engine
//!
//! Implements the Noise IKpsk2 handshake, session and key lifecycle, cookie
//! DoS mitigation, and the transport multiplexer, with no socket or TUN
//! ownership of its own: the host supplies a [`DatagramTransport`] and a
//! [`VirtualInterface`] and the engine moves packets between them.
//!
//! ```no_run
//! use std::sync::Arc;
//! use wirecore::{ChannelInterface, Engine, EngineConfig, UdpTransport};
//!
//! # async fn run(config: EngineConfig) -> wirecore::Result<()> {
//! let transport = Arc::new(UdpTransport::bind(config.listen_port).await?);
//! let engine = Engine::new(config, transport).await?;
//!
//! let (interface, handle) = ChannelInterface::create();
//! let workers = engine.start(Arc::new(interface));
//!
//! handle.inject(vec![/* an IP packet */]).await?;
//! workers.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod interface;
pub mod peer;
pub mod protocol;
pub mod registry;

pub use config::{EngineConfig, PeerConfig, StaticKeyPair};
pub use engine::{Engine, EngineHandle, RecvOutcome, SendOutcome};
pub use error::{Result, WirecoreError};
pub use interface::{
    ChannelInterface, ChannelTransport, DatagramTransport, InterfaceHandle, UdpTransport,
    VirtualInterface,
};
pub use peer::Peer;
pub use registry::PeerRegistry;
