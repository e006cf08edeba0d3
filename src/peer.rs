//! Per-peer state
//!
//! Everything mutable about a peer lives in [`PeerState`] behind its own
//! `tokio::sync::Mutex`, so unrelated peers never contend. The immutable
//! configuration and the lock-free traffic counters sit beside the lock.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ipnet::IpNet;
use tai64::Tai64N;
use tokio::sync::Mutex;

use crate::config::PeerConfig;
use crate::protocol::cookie::CookieStore;
use crate::protocol::handshake::InitiatorHandshake;
use crate::protocol::session::SessionSet;

/// Plaintext packets parked while a session is being established
pub const MAX_QUEUE_DEPTH: usize = 256;

/// Lock-free per-peer traffic counters
#[derive(Default)]
pub struct PeerCounters {
    pub tx_bytes: AtomicU64,
    pub rx_bytes: AtomicU64,
    /// Inbound packets dropped (decrypt failure, replay, out of window)
    pub rx_dropped: AtomicU64,
    pub handshakes_completed: AtomicU64,
}

impl PeerCounters {
    pub fn add_tx(&self, bytes: usize) {
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_rx(&self, bytes: usize) {
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn count_drop(&self) {
        self.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_handshake(&self) {
        self.handshakes_completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// An in-flight handshake we initiated
pub struct PendingHandshake {
    pub handshake: InitiatorHandshake,
    /// Index reserved in the registry for the session this will produce
    pub local_index: u32,
    pub sent_at: Instant,
    pub attempts: u32,
}

impl PendingHandshake {
    pub fn timed_out(&self, timeout: Duration) -> bool {
        self.sent_at.elapsed() >= timeout
    }
}

/// Mutable per-peer state, guarded by the peer's own lock
#[derive(Default)]
pub struct PeerState {
    /// Routable endpoint; updated unconditionally on authenticated traffic
    /// from a new address, never on unauthenticated input
    pub endpoint: Option<SocketAddr>,
    /// Current + previous session generations
    pub sessions: SessionSet,
    /// At most one in-flight handshake; a second initiation attempt is
    /// ignored until this one resolves or times out
    pub pending: Option<PendingHandshake>,
    /// Cookies received from this peer
    pub cookies: CookieStore,
    /// Greatest TAI64N timestamp accepted in an initiation from this peer
    pub last_initiation_timestamp: Option<Tai64N>,
    /// Outbound plaintext parked until a session exists
    pub queue: VecDeque<Vec<u8>>,
    /// When the last handshake completed, for diagnostics
    pub last_handshake_at: Option<Instant>,
}

impl PeerState {
    /// Park a packet while the handshake runs; the oldest is dropped once
    /// the queue is full
    pub fn queue_packet(&mut self, packet: Vec<u8>) {
        if self.queue.len() >= MAX_QUEUE_DEPTH {
            self.queue.pop_front();
        }
        self.queue.push_back(packet);
    }

    /// Accept an initiation timestamp if strictly newer than the last one
    pub fn accept_initiation_timestamp(&mut self, timestamp: Tai64N) -> bool {
        match self.last_initiation_timestamp {
            Some(last) if timestamp <= last => false,
            _ => {
                self.last_initiation_timestamp = Some(timestamp);
                true
            }
        }
    }
}

/// One configured peer: immutable identity, counters, and locked state
pub struct Peer {
    pub public_key: [u8; 32],
    pub preshared_key: Option<[u8; 32]>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<Duration>,
    pub counters: PeerCounters,
    pub state: Mutex<PeerState>,
}

impl Peer {
    pub fn from_config(config: &PeerConfig) -> Self {
        let state = PeerState {
            endpoint: config.endpoint,
            ..Default::default()
        };
        Self {
            public_key: config.public_key,
            preshared_key: config.preshared_key,
            allowed_ips: config.allowed_ips.clone(),
            persistent_keepalive: config
                .persistent_keepalive
                .map(|secs| Duration::from_secs(u64::from(secs))),
            counters: PeerCounters::default(),
            state: Mutex::new(state),
        }
    }

    /// Short identifier for log lines
    pub fn short_key(&self) -> String {
        let encoded = crate::config::encode_key(&self.public_key);
        encoded.chars().take(8).collect()
    }
}
