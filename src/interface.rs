//! External collaborator interfaces
//!
//! The engine never talks to the OS directly: the host hands it a datagram
//! transport and a virtual interface. A tokio UDP implementation is provided
//! for the common case, and in-memory channel implementations back the
//! loopback tests.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

use crate::error::TransportError;

/// Largest datagram the engine will receive
pub const MAX_DATAGRAM: usize = 65535;

/// Unreliable datagram transport carrying encrypted messages
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    async fn send_to(&self, endpoint: SocketAddr, bytes: &[u8]) -> Result<(), TransportError>;

    /// Receive one datagram and its source address
    async fn recv(&self) -> Result<(Vec<u8>, SocketAddr), TransportError>;
}

/// Virtual network interface carrying plaintext IP packets
#[async_trait]
pub trait VirtualInterface: Send + Sync {
    /// Next outbound plaintext packet from the host side
    async fn read(&self) -> Result<Vec<u8>, TransportError>;

    /// Deliver a decrypted inbound packet to the host side
    async fn write(&self, packet: &[u8]) -> Result<(), TransportError>;
}

/// [`DatagramTransport`] over a tokio UDP socket
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind to the configured listen port, or an ephemeral one
    pub async fn bind(listen_port: Option<u16>) -> Result<Self, TransportError> {
        let addr = format!("0.0.0.0:{}", listen_port.unwrap_or(0));
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|e| TransportError::BindFailed {
                addr,
                reason: e.to_string(),
            })?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send_to(&self, endpoint: SocketAddr, bytes: &[u8]) -> Result<(), TransportError> {
        self.socket
            .send_to(bytes, endpoint)
            .await
            .map_err(|e| TransportError::SendFailed {
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn recv(&self) -> Result<(Vec<u8>, SocketAddr), TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, src) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| TransportError::ReceiveFailed {
                reason: e.to_string(),
            })?;
        buf.truncate(len);
        Ok((buf, src))
    }
}

/// In-memory datagram link for loopback tests and embedding
pub struct ChannelTransport {
    local: SocketAddr,
    tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    rx: Mutex<mpsc::Receiver<(Vec<u8>, SocketAddr)>>,
}

impl ChannelTransport {
    /// Create a connected pair of endpoints with the given addresses
    pub fn pair(addr_a: SocketAddr, addr_b: SocketAddr) -> (Self, Self) {
        let (tx_ab, rx_ab) = mpsc::channel(1024);
        let (tx_ba, rx_ba) = mpsc::channel(1024);
        (
            Self {
                local: addr_a,
                tx: tx_ab,
                rx: Mutex::new(rx_ba),
            },
            Self {
                local: addr_b,
                tx: tx_ba,
                rx: Mutex::new(rx_ab),
            },
        )
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

#[async_trait]
impl DatagramTransport for ChannelTransport {
    async fn send_to(&self, _endpoint: SocketAddr, bytes: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send((bytes.to_vec(), self.local))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<(Vec<u8>, SocketAddr), TransportError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }
}

/// Host-side handle to a [`ChannelInterface`]
pub struct InterfaceHandle {
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl InterfaceHandle {
    /// Inject a plaintext packet as if the OS wrote it to the tunnel device
    pub async fn inject(&self, packet: Vec<u8>) -> Result<(), TransportError> {
        self.outbound
            .send(packet)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Next decrypted packet the engine delivered
    pub async fn next_delivered(&self) -> Result<Vec<u8>, TransportError> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }
}

/// In-memory [`VirtualInterface`] backed by channels
pub struct ChannelInterface {
    outbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    inbound: mpsc::Sender<Vec<u8>>,
}

impl ChannelInterface {
    /// Create an interface plus the host-side handle driving it
    pub fn create() -> (Self, InterfaceHandle) {
        let (out_tx, out_rx) = mpsc::channel(1024);
        let (in_tx, in_rx) = mpsc::channel(1024);
        (
            Self {
                outbound: Mutex::new(out_rx),
                inbound: in_tx,
            },
            InterfaceHandle {
                outbound: out_tx,
                inbound: Mutex::new(in_rx),
            },
        )
    }
}

#[async_trait]
impl VirtualInterface for ChannelInterface {
    async fn read(&self) -> Result<Vec<u8>, TransportError> {
        self.outbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    async fn write(&self, packet: &[u8]) -> Result<(), TransportError> {
        self.inbound
            .send(packet.to_vec())
            .await
            .map_err(|_| TransportError::Closed)
    }
}
