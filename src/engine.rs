//! Transport multiplexer
//!
//! One engine owns one datagram socket and fans traffic out to any number of
//! peers. Outbound plaintext is routed by destination IP through the
//! allowed-IP table; inbound datagrams are classified by message type and
//! dispatched to the handshake, cookie, or data path. A small fixed task
//! pool drives the loops: one inbound worker, one outbound worker, and a
//! one-second timer owning every time-based protocol obligation.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::config::StaticKeyPair;
use crate::error::{TransportError, WirecoreError};
use crate::interface::{DatagramTransport, VirtualInterface};
use crate::peer::{Peer, PeerState, PendingHandshake};
use crate::protocol::cookie::CookieIssuer;
use crate::protocol::handshake::{consume_initiation, verify_mac1, InitiatorHandshake};
use crate::protocol::messages::{
    message_type, CookieReply, HandshakeInitiation, HandshakeResponse, MessageType,
    TransportHeader,
};
use crate::protocol::session::{Session, MAX_HANDSHAKE_ATTEMPTS, REKEY_TIMEOUT};
use crate::registry::PeerRegistry;

/// Result of handing the engine an outbound plaintext packet
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Sealed and handed to the datagram transport
    Sent,
    /// Parked until the in-flight handshake completes
    Queued,
    /// Not sent; the reason is for diagnostics only
    Dropped(&'static str),
}

/// Result of handing the engine an inbound datagram
#[derive(Debug, PartialEq, Eq)]
pub enum RecvOutcome {
    /// A decrypted plaintext packet for the virtual interface; empty for
    /// keepalives, which carry no payload
    Delivered(Vec<u8>),
    /// A handshake or cookie message was consumed and answered as needed
    HandshakeProgressed,
    /// Not accepted; the reason is for diagnostics only
    Dropped(&'static str),
}

/// Destination address of an outbound IP packet, read from its header
fn dst_address(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[16..20].try_into().ok()?;
            Some(IpAddr::V4(octets.into()))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[24..40].try_into().ok()?;
            Some(IpAddr::V6(octets.into()))
        }
        _ => None,
    }
}

/// Source address of a decrypted inbound IP packet
fn src_address(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[12..16].try_into().ok()?;
            Some(IpAddr::V4(octets.into()))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[8..24].try_into().ok()?;
            Some(IpAddr::V6(octets.into()))
        }
        _ => None,
    }
}

/// The protocol engine: one local identity, one socket, many peers
pub struct Engine {
    keypair: StaticKeyPair,
    registry: PeerRegistry,
    transport: Arc<dyn DatagramTransport>,
    cookie_issuer: Mutex<CookieIssuer>,
    listen_port: Option<u16>,
    mtu: u16,
}

impl Engine {
    /// Build an engine from a validated configuration
    pub async fn new(
        config: EngineConfig,
        transport: Arc<dyn DatagramTransport>,
    ) -> Result<Arc<Self>, WirecoreError> {
        let keypair = config.validate()?;

        let engine = Arc::new(Self {
            keypair,
            registry: PeerRegistry::new(),
            transport,
            cookie_issuer: Mutex::new(CookieIssuer::new(config.handshake_rate_limit)),
            listen_port: config.listen_port,
            mtu: config.mtu,
        });

        for peer_config in &config.peers {
            let peer = Arc::new(Peer::from_config(peer_config));
            tracing::debug!(peer = %peer.short_key(), "registered peer");
            engine.registry.add_peer(peer).await;
        }
        tracing::info!(
            peers = config.peers.len(),
            mtu = config.mtu,
            "engine initialized"
        );

        Ok(engine)
    }

    pub fn public_key(&self) -> &[u8; 32] {
        self.keypair.public()
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Route, seal, and transmit one outbound plaintext packet
    ///
    /// With no live session the packet is parked and a handshake begins;
    /// queued packets flush in order the moment the handshake completes.
    pub async fn send_plaintext(&self, packet: &[u8]) -> Result<SendOutcome, WirecoreError> {
        let Some(dst) = dst_address(packet) else {
            return Ok(SendOutcome::Dropped("not an IP packet"));
        };
        let Some(peer) = self.registry.resolve(dst).await else {
            tracing::trace!(%dst, "no route for destination");
            return Ok(SendOutcome::Dropped("no route for destination"));
        };

        let mut state = peer.state.lock().await;

        if state.sessions.has_current() {
            let Some(endpoint) = state.endpoint else {
                return Ok(SendOutcome::Dropped("no known endpoint"));
            };
            let sealed = {
                let Some(session) = state.sessions.current() else {
                    return Ok(SendOutcome::Dropped("no active session"));
                };
                match session.transport.seal(session.remote_index, packet) {
                    Ok(msg) => {
                        session.mark_sent();
                        Some(msg)
                    }
                    // Counter ceiling reached; withhold until a fresh
                    // handshake replaces the keys
                    Err(_) => None,
                }
            };
            if let Some(msg) = sealed {
                self.transport.send_to(endpoint, &msg).await?;
                peer.counters.add_tx(packet.len());
                return Ok(SendOutcome::Sent);
            }
            tracing::debug!(peer = %peer.short_key(), "send counter exhausted, rekeying");
            let freed = state.sessions.clear();
            self.registry.free_indices(freed).await;
        }

        state.queue_packet(packet.to_vec());
        if state.pending.is_none() {
            self.begin_handshake(&peer, &mut state).await?;
        }
        Ok(SendOutcome::Queued)
    }

    /// Classify and process one inbound datagram
    ///
    /// All authentication failures are absorbed as `Dropped`; only transport
    /// faults surface as errors.
    pub async fn receive_datagram(
        &self,
        data: &[u8],
        src: SocketAddr,
    ) -> Result<RecvOutcome, WirecoreError> {
        let msg_type = match message_type(data) {
            Ok(t) => t,
            Err(_) => return Ok(RecvOutcome::Dropped("unrecognized message")),
        };

        match msg_type {
            MessageType::HandshakeInitiation => self.handle_initiation(data, src).await,
            MessageType::HandshakeResponse => self.handle_response(data, src).await,
            MessageType::CookieReply => self.handle_cookie_reply(data).await,
            MessageType::TransportData => self.handle_transport(data, src).await,
        }
    }

    async fn handle_initiation(
        &self,
        data: &[u8],
        src: SocketAddr,
    ) -> Result<RecvOutcome, WirecoreError> {
        if verify_mac1(data, HandshakeInitiation::MAC1_OFF, self.keypair.public()).is_err() {
            return Ok(RecvOutcome::Dropped("initiation mac1 invalid"));
        }
        let initiation = match HandshakeInitiation::from_bytes(data) {
            Ok(msg) => msg,
            Err(_) => return Ok(RecvOutcome::Dropped("malformed initiation")),
        };

        // Under load, demand proof of return-path reachability before any
        // expensive public-key work
        {
            let mut issuer = self.cookie_issuer.lock().await;
            if issuer.register_initiation()
                && !issuer.verify_mac2(data, HandshakeInitiation::MAC2_OFF, src)
            {
                let reply = issuer.create_reply(
                    initiation.sender_index,
                    &initiation.mac1,
                    src,
                    self.keypair.public(),
                )?;
                drop(issuer);
                tracing::debug!(%src, "under load, answering initiation with cookie reply");
                self.transport.send_to(src, &reply.to_bytes()).await?;
                return Ok(RecvOutcome::HandshakeProgressed);
            }
        }

        let pending =
            match consume_initiation(&initiation, self.keypair.private(), self.keypair.public()) {
                Ok(pending) => pending,
                Err(_) => return Ok(RecvOutcome::Dropped("initiation failed to authenticate")),
            };

        let Some(peer) = self.registry.peer_by_key(&pending.peer_static).await else {
            return Ok(RecvOutcome::Dropped("initiation from unknown peer"));
        };

        let mut state = peer.state.lock().await;
        if !state.accept_initiation_timestamp(pending.timestamp) {
            peer.counters.count_drop();
            return Ok(RecvOutcome::Dropped("stale initiation timestamp"));
        }

        let local_index = self.registry.allocate_index(&peer).await;
        let cookie = state.cookies.valid_cookie().copied();
        let (response, outcome) =
            match pending.create_response(peer.preshared_key, local_index, cookie.as_ref()) {
                Ok(built) => built,
                Err(err) => {
                    // The reserved index never made it into a session
                    self.registry.free_indices([local_index]).await;
                    return Err(err);
                }
            };
        if let Err(err) = self.transport.send_to(src, &response.to_bytes()).await {
            self.registry.free_indices([local_index]).await;
            return Err(err.into());
        }

        if let Some(displaced) = state.sessions.install(Session::from_outcome(&outcome)) {
            self.registry.free_indices([displaced]).await;
        }
        state.endpoint = Some(src);
        state.last_handshake_at = Some(Instant::now());
        peer.counters.count_handshake();
        tracing::info!(peer = %peer.short_key(), %src, "handshake completed as responder");

        self.flush_queue(&peer, &mut state).await;
        Ok(RecvOutcome::HandshakeProgressed)
    }

    async fn handle_response(
        &self,
        data: &[u8],
        src: SocketAddr,
    ) -> Result<RecvOutcome, WirecoreError> {
        if verify_mac1(data, HandshakeResponse::MAC1_OFF, self.keypair.public()).is_err() {
            return Ok(RecvOutcome::Dropped("response mac1 invalid"));
        }
        let response = match HandshakeResponse::from_bytes(data) {
            Ok(msg) => msg,
            Err(_) => return Ok(RecvOutcome::Dropped("malformed response")),
        };

        let Some(peer) = self.registry.peer_by_index(response.receiver_index).await else {
            return Ok(RecvOutcome::Dropped("response for unknown index"));
        };

        let mut state = peer.state.lock().await;
        let Some(in_flight) = state.pending.as_mut() else {
            return Ok(RecvOutcome::Dropped("no handshake in flight"));
        };

        let outcome = match in_flight.handshake.consume_response(&response) {
            Ok(outcome) => outcome,
            Err(_) => {
                peer.counters.count_drop();
                return Ok(RecvOutcome::Dropped("response failed to authenticate"));
            }
        };

        state.pending = None;
        if let Some(displaced) = state.sessions.install(Session::from_outcome(&outcome)) {
            self.registry.free_indices([displaced]).await;
        }
        state.endpoint = Some(src);
        state.last_handshake_at = Some(Instant::now());
        peer.counters.count_handshake();
        tracing::info!(peer = %peer.short_key(), %src, "handshake completed as initiator");

        self.flush_queue(&peer, &mut state).await;
        Ok(RecvOutcome::HandshakeProgressed)
    }

    async fn handle_cookie_reply(&self, data: &[u8]) -> Result<RecvOutcome, WirecoreError> {
        let reply = match CookieReply::from_bytes(data) {
            Ok(msg) => msg,
            Err(_) => return Ok(RecvOutcome::Dropped("malformed cookie reply")),
        };

        let Some(peer) = self.registry.peer_by_index(reply.receiver_index).await else {
            return Ok(RecvOutcome::Dropped("cookie reply for unknown index"));
        };

        let mut state = peer.state.lock().await;
        let Some(in_flight) = state.pending.as_ref() else {
            return Ok(RecvOutcome::Dropped("no handshake in flight"));
        };
        let sent_mac1 = in_flight.handshake.sent_mac1;

        if state
            .cookies
            .consume_reply(&reply, &sent_mac1, &peer.public_key)
            .is_err()
        {
            peer.counters.count_drop();
            return Ok(RecvOutcome::Dropped("cookie reply failed to open"));
        }

        // Retry right away with mac2 populated instead of waiting out the
        // rekey timeout
        self.resend_initiation(&mut state).await?;
        tracing::debug!(peer = %peer.short_key(), "resent initiation with cookie");
        Ok(RecvOutcome::HandshakeProgressed)
    }

    async fn handle_transport(
        &self,
        data: &[u8],
        src: SocketAddr,
    ) -> Result<RecvOutcome, WirecoreError> {
        let header = match TransportHeader::from_bytes(data) {
            Ok(header) => header,
            Err(_) => return Ok(RecvOutcome::Dropped("malformed transport message")),
        };

        let Some(peer) = self.registry.peer_by_index(header.receiver_index).await else {
            return Ok(RecvOutcome::Dropped("transport message for unknown index"));
        };

        let mut state = peer.state.lock().await;
        let plaintext = {
            let Some(session) = state.sessions.find_by_index(header.receiver_index) else {
                peer.counters.count_drop();
                return Ok(RecvOutcome::Dropped("no session for index"));
            };
            match session.transport.open(data) {
                Ok(plaintext) => {
                    session.mark_received();
                    plaintext
                }
                Err(err) => {
                    peer.counters.count_drop();
                    tracing::trace!(peer = %peer.short_key(), error = %err, "dropped transport message");
                    return Ok(RecvOutcome::Dropped("failed to open transport message"));
                }
            }
        };

        // Authenticated traffic from a new address moves the endpoint
        if state.endpoint != Some(src) {
            tracing::info!(peer = %peer.short_key(), %src, "peer endpoint roamed");
            state.endpoint = Some(src);
        }
        peer.counters.add_rx(plaintext.len());

        if plaintext.is_empty() {
            // Keepalive; nothing for the interface
            return Ok(RecvOutcome::Delivered(plaintext));
        }

        // Cryptokey routing, inbound direction: the inner source address
        // must belong to this peer
        let allowed = src_address(&plaintext)
            .map(|ip| peer.allowed_ips.iter().any(|net| net.contains(&ip)))
            .unwrap_or(false);
        if !allowed {
            peer.counters.count_drop();
            return Ok(RecvOutcome::Dropped("inner source address not allowed"));
        }

        Ok(RecvOutcome::Delivered(plaintext))
    }

    /// Start a fresh handshake toward a peer
    ///
    /// Silently a no-op when the peer has no known endpoint; queued traffic
    /// waits until one is learned.
    async fn begin_handshake(
        &self,
        peer: &Arc<Peer>,
        state: &mut PeerState,
    ) -> Result<(), WirecoreError> {
        let Some(endpoint) = state.endpoint else {
            tracing::debug!(peer = %peer.short_key(), "cannot initiate, no endpoint");
            return Ok(());
        };

        let local_index = self.registry.allocate_index(peer).await;
        let mut handshake = InitiatorHandshake::new(
            *self.keypair.private(),
            peer.public_key,
            peer.preshared_key,
            local_index,
        );
        let cookie = state.cookies.valid_cookie().copied();
        let initiation = match handshake.create_initiation(cookie.as_ref()) {
            Ok(msg) => msg,
            Err(err) => {
                self.registry.free_indices([local_index]).await;
                return Err(err);
            }
        };

        // Until `pending` is set the index belongs to nothing; release it if
        // the send fails so retries cannot grow the index map
        if let Err(err) = self.transport.send_to(endpoint, &initiation.to_bytes()).await {
            self.registry.free_indices([local_index]).await;
            return Err(err.into());
        }
        tracing::debug!(peer = %peer.short_key(), "sent handshake initiation");

        state.pending = Some(PendingHandshake {
            handshake,
            local_index,
            sent_at: Instant::now(),
            attempts: 1,
        });
        Ok(())
    }

    /// Re-send the in-flight initiation, picking up any stored cookie
    async fn resend_initiation(&self, state: &mut PeerState) -> Result<(), WirecoreError> {
        let Some(endpoint) = state.endpoint else {
            return Ok(());
        };
        let cookie = state.cookies.valid_cookie().copied();
        let Some(in_flight) = state.pending.as_mut() else {
            return Ok(());
        };
        let initiation = in_flight.handshake.create_initiation(cookie.as_ref())?;
        in_flight.sent_at = Instant::now();
        self.transport.send_to(endpoint, &initiation.to_bytes()).await?;
        Ok(())
    }

    /// Drain a peer's parked packets through its current session, in order
    async fn flush_queue(&self, peer: &Peer, state: &mut PeerState) {
        let Some(endpoint) = state.endpoint else {
            return;
        };
        while let Some(packet) = state.queue.pop_front() {
            let sealed = {
                let Some(session) = state.sessions.current() else {
                    state.queue.push_front(packet);
                    return;
                };
                match session.transport.seal(session.remote_index, &packet) {
                    Ok(msg) => {
                        session.mark_sent();
                        msg
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "dropping queued packet");
                        peer.counters.count_drop();
                        continue;
                    }
                }
            };
            if self.transport.send_to(endpoint, &sealed).await.is_ok() {
                peer.counters.add_tx(packet.len());
            }
        }
    }

    /// Send a keepalive: a transport message with an empty payload
    async fn send_keepalive(&self, peer: &Peer, state: &mut PeerState) {
        let Some(endpoint) = state.endpoint else {
            return;
        };
        let sealed = {
            let Some(session) = state.sessions.current() else {
                return;
            };
            match session.transport.seal(session.remote_index, &[]) {
                Ok(msg) => {
                    session.mark_sent();
                    msg
                }
                Err(_) => return,
            }
        };
        if self.transport.send_to(endpoint, &sealed).await.is_ok() {
            tracing::trace!(peer = %peer.short_key(), "sent keepalive");
        }
    }

    /// One pass of the time-based protocol obligations; invoked every second
    /// by the timer task
    pub async fn tick(&self) {
        self.cookie_issuer.lock().await.rotate_if_due();

        for peer in self.registry.peers().await {
            let mut state = peer.state.lock().await;

            let freed = state.sessions.expire();
            if !freed.is_empty() {
                tracing::debug!(peer = %peer.short_key(), "expired stale session generations");
                self.registry.free_indices(freed).await;
            }

            // Handshake retry / give-up
            let mut resend = false;
            let mut give_up = false;
            if let Some(in_flight) = state.pending.as_ref() {
                if in_flight.timed_out(REKEY_TIMEOUT) {
                    if in_flight.attempts >= MAX_HANDSHAKE_ATTEMPTS {
                        give_up = true;
                    } else {
                        resend = true;
                    }
                }
            }
            if give_up {
                if let Some(abandoned) = state.pending.take() {
                    tracing::warn!(
                        peer = %peer.short_key(),
                        attempts = abandoned.attempts,
                        "peer unreachable, abandoning handshake"
                    );
                    self.registry.free_indices([abandoned.local_index]).await;
                }
                state.queue.clear();
            } else if resend {
                if let Some(in_flight) = state.pending.as_mut() {
                    in_flight.attempts += 1;
                }
                if let Err(err) = self.resend_initiation(&mut state).await {
                    tracing::debug!(peer = %peer.short_key(), error = %err, "initiation retry failed");
                }
            }

            // Proactive rekey
            if state.pending.is_none() {
                let wants_rekey = state
                    .sessions
                    .current()
                    .map(|s| s.wants_rekey())
                    .unwrap_or(false);
                if wants_rekey {
                    tracing::debug!(peer = %peer.short_key(), "rekeying current session");
                    if let Err(err) = self.begin_handshake(&peer, &mut state).await {
                        tracing::debug!(peer = %peer.short_key(), error = %err, "rekey initiation failed");
                    }
                }
            }

            // Keepalives
            let keepalive_due = match state.sessions.current() {
                Some(session) => {
                    session.wants_passive_keepalive()
                        || peer
                            .persistent_keepalive
                            .map(|interval| session.wants_persistent_keepalive(interval))
                            .unwrap_or(false)
                }
                None => false,
            };
            if keepalive_due {
                self.send_keepalive(&peer, &mut state).await;
            }
        }
    }

    /// Human-readable runtime state, one stanza per peer
    pub async fn report_runtime_state(&self) -> String {
        use std::fmt::Write as _;
        use std::sync::atomic::Ordering::Relaxed;

        let peers = self.registry.peers().await;
        let total_rx: u64 = peers.iter().map(|p| p.counters.rx_bytes.load(Relaxed)).sum();
        let total_tx: u64 = peers.iter().map(|p| p.counters.tx_bytes.load(Relaxed)).sum();

        let mut out = String::new();
        let _ = writeln!(out, "interface: wirecore");
        let _ = writeln!(
            out,
            "  public key: {}",
            crate::config::encode_key(self.keypair.public())
        );
        if let Some(port) = self.listen_port {
            let _ = writeln!(out, "  listening port: {port}");
        }
        let _ = writeln!(out, "  transfer: {total_rx} B received, {total_tx} B sent");

        for peer in peers {
            let state = peer.state.lock().await;
            let _ = writeln!(out);
            let _ = writeln!(out, "peer: {}", crate::config::encode_key(&peer.public_key));
            if let Some(endpoint) = state.endpoint {
                let _ = writeln!(out, "  endpoint: {endpoint}");
            }
            let allowed: Vec<String> = peer.allowed_ips.iter().map(|n| n.to_string()).collect();
            let _ = writeln!(out, "  allowed ips: {}", allowed.join(", "));
            if let Some(at) = state.last_handshake_at {
                let _ = writeln!(out, "  latest handshake: {}s ago", at.elapsed().as_secs());
            }
            let _ = writeln!(
                out,
                "  transfer: {} B received, {} B sent ({} dropped)",
                peer.counters.rx_bytes.load(std::sync::atomic::Ordering::Relaxed),
                peer.counters.tx_bytes.load(std::sync::atomic::Ordering::Relaxed),
                peer.counters.rx_dropped.load(std::sync::atomic::Ordering::Relaxed),
            );
            if let Some(interval) = peer.persistent_keepalive {
                let _ = writeln!(
                    out,
                    "  persistent keepalive: every {}s",
                    interval.as_secs()
                );
            }
        }
        out
    }

    /// Spawn the worker tasks and return the handle controlling them
    pub fn start(self: &Arc<Self>, interface: Arc<dyn VirtualInterface>) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(3);

        // Inbound: datagram socket toward the virtual interface
        {
            let engine = Arc::clone(self);
            let interface = Arc::clone(&interface);
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        received = engine.transport.recv() => match received {
                            Ok((data, src)) => match engine.receive_datagram(&data, src).await {
                                Ok(RecvOutcome::Delivered(plaintext)) if !plaintext.is_empty() => {
                                    if interface.write(&plaintext).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(_) => {}
                                Err(err) => {
                                    tracing::warn!(error = %err, "inbound processing error");
                                    if !err.is_recoverable() {
                                        break;
                                    }
                                }
                            },
                            Err(TransportError::Closed) => break,
                            Err(err) => tracing::warn!(error = %err, "datagram receive error"),
                        },
                    }
                }
                tracing::debug!("inbound worker stopped");
            }));
        }

        // Outbound: virtual interface toward the datagram socket
        {
            let engine = Arc::clone(self);
            let interface = Arc::clone(&interface);
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        packet = interface.read() => match packet {
                            Ok(packet) => {
                                if let Err(err) = engine.send_plaintext(&packet).await {
                                    tracing::warn!(error = %err, "outbound processing error");
                                    if !err.is_recoverable() {
                                        break;
                                    }
                                }
                            }
                            Err(TransportError::Closed) => break,
                            Err(err) => tracing::warn!(error = %err, "interface read error"),
                        },
                    }
                }
                tracing::debug!("outbound worker stopped");
            }));
        }

        // Timer: every time-based obligation lives on this one-second tick
        {
            let engine = Arc::clone(self);
            let mut shutdown = shutdown_rx;
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = interval.tick() => engine.tick().await,
                    }
                }
                tracing::debug!("timer task stopped");
            }));
        }

        EngineHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }

    /// Tear down all sessions, zeroizing their keys on drop
    pub async fn clear_sessions(&self) {
        for peer in self.registry.peers().await {
            let mut state = peer.state.lock().await;
            let freed = state.sessions.clear();
            self.registry.free_indices(freed).await;
            state.pending = None;
            state.queue.clear();
        }
    }
}

/// Control handle for a running engine's worker tasks
pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Signal shutdown and wait for the workers, bounded per task
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let abort = task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                tracing::warn!("worker did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PeerConfig, DEFAULT_HANDSHAKE_RATE_LIMIT, DEFAULT_MTU};
    use crate::crypto::x25519;
    use crate::interface::ChannelTransport;
    use std::net::Ipv4Addr;

    fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, total_len: usize) -> Vec<u8> {
        assert!(total_len >= 20);
        let mut packet = vec![0u8; total_len];
        packet[0] = 0x45;
        packet[12..16].copy_from_slice(&src.octets());
        packet[16..20].copy_from_slice(&dst.octets());
        for (i, byte) in packet[20..].iter_mut().enumerate() {
            *byte = i as u8;
        }
        packet
    }

    fn config_for(
        private: [u8; 32],
        peer_public: [u8; 32],
        peer_net: &str,
        endpoint: Option<SocketAddr>,
        rate_limit: u64,
    ) -> EngineConfig {
        EngineConfig {
            private_key: private,
            listen_port: None,
            mtu: DEFAULT_MTU,
            peers: vec![PeerConfig {
                public_key: peer_public,
                preshared_key: None,
                allowed_ips: vec![peer_net.parse().unwrap()],
                endpoint,
                persistent_keepalive: None,
            }],
            handshake_rate_limit: rate_limit,
        }
    }

    struct TestPair {
        a: Arc<Engine>,
        b: Arc<Engine>,
        transport_a: Arc<ChannelTransport>,
        transport_b: Arc<ChannelTransport>,
    }

    async fn engine_pair(rate_limit: u64) -> TestPair {
        let (a_priv, a_pub) = x25519::generate_keypair();
        let (b_priv, b_pub) = x25519::generate_keypair();

        let addr_a: SocketAddr = "10.99.0.1:51820".parse().unwrap();
        let addr_b: SocketAddr = "10.99.0.2:51820".parse().unwrap();
        let (ta, tb) = ChannelTransport::pair(addr_a, addr_b);
        let transport_a = Arc::new(ta);
        let transport_b = Arc::new(tb);

        let a = Engine::new(
            config_for(a_priv, b_pub, "10.0.0.2/32", Some(addr_b), rate_limit),
            Arc::clone(&transport_a) as Arc<dyn DatagramTransport>,
        )
        .await
        .unwrap();
        let b = Engine::new(
            config_for(b_priv, a_pub, "10.0.0.1/32", Some(addr_a), rate_limit),
            Arc::clone(&transport_b) as Arc<dyn DatagramTransport>,
        )
        .await
        .unwrap();

        TestPair {
            a,
            b,
            transport_a,
            transport_b,
        }
    }

    /// Deliver every datagram queued toward `to` into its engine, returning
    /// the outcomes
    async fn pump(
        from_transport: &ChannelTransport,
        to: &Engine,
    ) -> Vec<RecvOutcome> {
        let mut outcomes = Vec::new();
        // Each call drains exactly what is already in flight
        while let Ok(received) =
            tokio::time::timeout(Duration::from_millis(50), from_transport.recv()).await
        {
            let (data, src) = received.unwrap();
            outcomes.push(to.receive_datagram(&data, src).await.unwrap());
        }
        outcomes
    }

    #[test]
    fn test_dst_address_parsing() {
        let packet = ipv4_packet("1.2.3.4".parse().unwrap(), "5.6.7.8".parse().unwrap(), 40);
        assert_eq!(dst_address(&packet), Some("5.6.7.8".parse().unwrap()));
        assert_eq!(src_address(&packet), Some("1.2.3.4".parse().unwrap()));

        let mut v6 = vec![0u8; 40];
        v6[0] = 0x60;
        v6[39] = 1;
        assert_eq!(dst_address(&v6), Some("::1".parse().unwrap()));

        assert_eq!(dst_address(&[0x45]), None);
        assert_eq!(dst_address(&[]), None);
        // Version nibble neither 4 nor 6
        assert_eq!(dst_address(&[0x20; 40]), None);
    }

    #[tokio::test]
    async fn test_unrouted_destination_dropped() {
        let pair = engine_pair(DEFAULT_HANDSHAKE_RATE_LIMIT).await;
        let packet = ipv4_packet(
            "10.0.0.1".parse().unwrap(),
            "192.168.50.1".parse().unwrap(),
            64,
        );
        assert_eq!(
            pair.a.send_plaintext(&packet).await.unwrap(),
            SendOutcome::Dropped("no route for destination")
        );
    }

    #[tokio::test]
    async fn test_handshake_and_queued_delivery() {
        let pair = engine_pair(DEFAULT_HANDSHAKE_RATE_LIMIT).await;
        let packet = ipv4_packet("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap(), 100);

        // No session yet: parked while the handshake starts
        assert_eq!(
            pair.a.send_plaintext(&packet).await.unwrap(),
            SendOutcome::Queued
        );

        // Initiation reaches B, which responds and installs a session
        let outcomes = pump(&pair.transport_b, &pair.b).await;
        assert_eq!(outcomes, vec![RecvOutcome::HandshakeProgressed]);

        // Response reaches A, completing the handshake and flushing the
        // queue; the flushed packet then arrives at B
        let outcomes = pump(&pair.transport_a, &pair.a).await;
        assert_eq!(outcomes, vec![RecvOutcome::HandshakeProgressed]);

        let outcomes = pump(&pair.transport_b, &pair.b).await;
        assert_eq!(outcomes, vec![RecvOutcome::Delivered(packet.clone())]);

        // With the session live, traffic flows both ways immediately
        let reply = ipv4_packet("10.0.0.2".parse().unwrap(), "10.0.0.1".parse().unwrap(), 80);
        assert_eq!(
            pair.b.send_plaintext(&reply).await.unwrap(),
            SendOutcome::Sent
        );
        let outcomes = pump(&pair.transport_a, &pair.a).await;
        assert_eq!(outcomes, vec![RecvOutcome::Delivered(reply)]);
    }

    #[tokio::test]
    async fn test_replayed_datagram_dropped() {
        let pair = engine_pair(DEFAULT_HANDSHAKE_RATE_LIMIT).await;
        let packet = ipv4_packet("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap(), 60);

        pair.a.send_plaintext(&packet).await.unwrap();
        pump(&pair.transport_b, &pair.b).await;
        pump(&pair.transport_a, &pair.a).await;

        // Capture the flushed transport datagram and deliver it twice
        let (data, src) = pair.transport_b.recv().await.unwrap();
        assert_eq!(
            pair.b.receive_datagram(&data, src).await.unwrap(),
            RecvOutcome::Delivered(packet)
        );
        assert_eq!(
            pair.b.receive_datagram(&data, src).await.unwrap(),
            RecvOutcome::Dropped("failed to open transport message")
        );
    }

    #[tokio::test]
    async fn test_cookie_flow_under_load() {
        // Threshold zero means every initiation counts as load, so the full
        // cookie exchange runs on the first handshake
        let pair = engine_pair(0).await;
        let packet = ipv4_packet("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap(), 60);

        assert_eq!(
            pair.a.send_plaintext(&packet).await.unwrap(),
            SendOutcome::Queued
        );

        // B demands a cookie instead of handshaking
        pump(&pair.transport_b, &pair.b).await;

        // A consumes the cookie reply and retries with mac2; the retry
        // passes B's load check and completes the handshake
        pump(&pair.transport_a, &pair.a).await;
        pump(&pair.transport_b, &pair.b).await;
        pump(&pair.transport_a, &pair.a).await;

        let outcomes = pump(&pair.transport_b, &pair.b).await;
        assert_eq!(outcomes, vec![RecvOutcome::Delivered(packet)]);
    }

    #[tokio::test]
    async fn test_inner_source_outside_allowed_ips_dropped() {
        let pair = engine_pair(DEFAULT_HANDSHAKE_RATE_LIMIT).await;
        let packet = ipv4_packet("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap(), 60);

        pair.a.send_plaintext(&packet).await.unwrap();
        pump(&pair.transport_b, &pair.b).await;
        pump(&pair.transport_a, &pair.a).await;
        pump(&pair.transport_b, &pair.b).await;

        // A spoofed inner source is authenticated but not routable
        let spoofed = ipv4_packet(
            "172.16.0.9".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            60,
        );
        assert_eq!(
            pair.a.send_plaintext(&spoofed).await.unwrap(),
            SendOutcome::Sent
        );
        let outcomes = pump(&pair.transport_b, &pair.b).await;
        assert_eq!(
            outcomes,
            vec![RecvOutcome::Dropped("inner source address not allowed")]
        );
    }

    #[tokio::test]
    async fn test_garbage_datagram_dropped() {
        let pair = engine_pair(DEFAULT_HANDSHAKE_RATE_LIMIT).await;
        let src = pair.transport_a.local_addr();

        assert_eq!(
            pair.b.receive_datagram(&[0xFFu8; 64], src).await.unwrap(),
            RecvOutcome::Dropped("unrecognized message")
        );
        // Right type byte, wrong everything else
        let mut fake = vec![0u8; HandshakeInitiation::SIZE];
        fake[0] = 1;
        assert_eq!(
            pair.b.receive_datagram(&fake, src).await.unwrap(),
            RecvOutcome::Dropped("initiation mac1 invalid")
        );
    }

    struct FailingTransport;

    #[async_trait::async_trait]
    impl DatagramTransport for FailingTransport {
        async fn send_to(&self, _endpoint: SocketAddr, _bytes: &[u8]) -> Result<(), TransportError> {
            Err(TransportError::SendFailed {
                reason: "link down".to_string(),
            })
        }

        async fn recv(&self) -> Result<(Vec<u8>, SocketAddr), TransportError> {
            Err(TransportError::Closed)
        }
    }

    #[tokio::test]
    async fn test_failed_initiations_do_not_leak_indices() {
        let (a_priv, _) = x25519::generate_keypair();
        let (_, b_pub) = x25519::generate_keypair();
        let endpoint: SocketAddr = "10.99.0.2:51820".parse().unwrap();
        let engine = Engine::new(
            config_for(
                a_priv,
                b_pub,
                "10.0.0.2/32",
                Some(endpoint),
                DEFAULT_HANDSHAKE_RATE_LIMIT,
            ),
            Arc::new(FailingTransport),
        )
        .await
        .unwrap();

        let packet = ipv4_packet("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap(), 60);
        for _ in 0..5 {
            assert!(engine.send_plaintext(&packet).await.is_err());
        }
        // Every index reserved for a failed initiation was released
        assert_eq!(engine.registry.allocated_indices().await, 0);
    }

    #[tokio::test]
    async fn test_rekey_after_time_starts_new_handshake() {
        use crate::protocol::session::REKEY_AFTER_TIME;
        use std::sync::atomic::Ordering;

        let pair = engine_pair(DEFAULT_HANDSHAKE_RATE_LIMIT).await;
        let packet = ipv4_packet("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap(), 60);

        pair.a.send_plaintext(&packet).await.unwrap();
        pump(&pair.transport_b, &pair.b).await;
        pump(&pair.transport_a, &pair.a).await;
        pump(&pair.transport_b, &pair.b).await;

        // Age A's current session past the rekey point, traffic still active
        {
            let peers = pair.a.registry.peers().await;
            let mut state = peers[0].state.lock().await;
            let session = state.sessions.current().unwrap();
            session.age_artificially(REKEY_AFTER_TIME, Duration::from_secs(1));
        }
        pair.a.tick().await;

        // The tick initiated; completing the exchange installs a second
        // generation
        assert_eq!(
            pump(&pair.transport_b, &pair.b).await,
            vec![RecvOutcome::HandshakeProgressed]
        );
        assert_eq!(
            pump(&pair.transport_a, &pair.a).await,
            vec![RecvOutcome::HandshakeProgressed]
        );

        let peers = pair.a.registry.peers().await;
        assert_eq!(
            peers[0]
                .counters
                .handshakes_completed
                .load(Ordering::Relaxed),
            2
        );
    }

    #[tokio::test]
    async fn test_report_runtime_state() {
        let pair = engine_pair(DEFAULT_HANDSHAKE_RATE_LIMIT).await;
        let report = pair.a.report_runtime_state().await;

        assert!(report.contains("interface: wirecore"));
        assert!(report.contains("peer: "));
        assert!(report.contains("allowed ips: 10.0.0.2/32"));
    }
}
