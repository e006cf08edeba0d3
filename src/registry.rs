//! Peer registry and allowed-IP routing
//!
//! Read-mostly: lookups take a shared lock, peer add/remove takes the write
//! lock and briefly blocks them. Session indices are allocated here so they
//! stay unique across all peers for the lifetime of the engine.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tokio::sync::RwLock;

use crate::peer::Peer;
use crate::protocol::session::random_index;

/// Ordered allowed-IP table with longest-prefix-match resolution
///
/// Ties on prefix length go to the most recently added entry.
#[derive(Default)]
pub struct RoutingTable {
    routes: Vec<(IpNet, Arc<Peer>)>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, prefix: IpNet, peer: Arc<Peer>) {
        self.routes.push((prefix, peer));
    }

    pub fn remove_peer(&mut self, public_key: &[u8; 32]) {
        self.routes.retain(|(_, peer)| peer.public_key != *public_key);
    }

    /// Resolve a destination IP to at most one peer
    pub fn resolve(&self, ip: IpAddr) -> Option<Arc<Peer>> {
        let mut best: Option<(u8, &Arc<Peer>)> = None;
        for (prefix, peer) in &self.routes {
            if !prefix.contains(&ip) {
                continue;
            }
            // >= prefers later (more recently added) entries on ties
            if best.map_or(true, |(len, _)| prefix.prefix_len() >= len) {
                best = Some((prefix.prefix_len(), peer));
            }
        }
        best.map(|(_, peer)| Arc::clone(peer))
    }
}

#[derive(Default)]
struct RegistryInner {
    by_key: HashMap<[u8; 32], Arc<Peer>>,
    by_index: HashMap<u32, Arc<Peer>>,
    routes: RoutingTable,
}

/// Shared peer registry
pub struct PeerRegistry {
    inner: RwLock<RegistryInner>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Register a peer and its allowed-IP prefixes
    pub async fn add_peer(&self, peer: Arc<Peer>) {
        let mut inner = self.inner.write().await;
        for prefix in &peer.allowed_ips {
            inner.routes.insert(*prefix, Arc::clone(&peer));
        }
        inner.by_key.insert(peer.public_key, peer);
    }

    /// Remove a peer, its routes, and any session indices it holds
    pub async fn remove_peer(&self, public_key: &[u8; 32]) -> Option<Arc<Peer>> {
        let mut inner = self.inner.write().await;
        let peer = inner.by_key.remove(public_key)?;
        inner.routes.remove_peer(public_key);
        inner
            .by_index
            .retain(|_, indexed| indexed.public_key != *public_key);
        Some(peer)
    }

    pub async fn peer_by_key(&self, public_key: &[u8; 32]) -> Option<Arc<Peer>> {
        self.inner.read().await.by_key.get(public_key).cloned()
    }

    pub async fn peer_by_index(&self, index: u32) -> Option<Arc<Peer>> {
        self.inner.read().await.by_index.get(&index).cloned()
    }

    /// Longest-prefix route lookup for an outbound destination
    pub async fn resolve(&self, ip: IpAddr) -> Option<Arc<Peer>> {
        self.inner.read().await.routes.resolve(ip)
    }

    /// Allocate a fresh engine-unique session index for a peer
    ///
    /// Collisions regenerate; with 2^32 index space and a handful of live
    /// sessions the loop terminates immediately in practice.
    pub async fn allocate_index(&self, peer: &Arc<Peer>) -> u32 {
        let mut inner = self.inner.write().await;
        loop {
            let index = random_index();
            if !inner.by_index.contains_key(&index) {
                inner.by_index.insert(index, Arc::clone(peer));
                return index;
            }
        }
    }

    /// Number of live session indices, for diagnostics
    pub async fn allocated_indices(&self) -> usize {
        self.inner.read().await.by_index.len()
    }

    /// Release indices whose sessions are gone
    pub async fn free_indices(&self, indices: impl IntoIterator<Item = u32>) {
        let mut inner = self.inner.write().await;
        for index in indices {
            inner.by_index.remove(&index);
        }
    }

    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.inner.read().await.by_key.values().cloned().collect()
    }
}
