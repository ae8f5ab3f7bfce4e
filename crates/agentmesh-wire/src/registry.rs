//! Peer registry — the peers a transport has admitted.
//!
//! A peer is recorded only after a validated ENTER and removed on EXIT. Any
//! other event from a UUID missing here is a protocol violation.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// An admitted remote peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEntry {
    /// Overlay UUID of the peer.
    pub uuid: Uuid,
    /// Name the peer announced (its full address).
    pub name: String,
    /// IP taken from the peer's endpoint URL.
    pub ip: IpAddr,
    /// When the ENTER was accepted.
    pub entered_at: DateTime<Utc>,
}

/// Thread-safe registry of admitted peers.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<Uuid, PeerEntry>>>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer after a validated ENTER.
    pub fn add_peer(&self, entry: PeerEntry) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.insert(entry.uuid, entry);
    }

    /// Remove a peer entirely.
    pub fn remove_peer(&self, uuid: &Uuid) -> Option<PeerEntry> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.remove(uuid)
    }

    /// Whether `uuid` has been admitted.
    pub fn contains(&self, uuid: &Uuid) -> bool {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.contains_key(uuid)
    }

    /// IP of an admitted peer.
    pub fn ip_of(&self, uuid: &Uuid) -> Option<IpAddr> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(uuid).map(|p| p.ip)
    }

    /// Get a snapshot of a specific peer.
    pub fn get_peer(&self, uuid: &Uuid) -> Option<PeerEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(uuid).cloned()
    }

    /// Snapshot of all admitted peers.
    pub fn all_peers(&self) -> Vec<PeerEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().cloned().collect()
    }

    /// Number of admitted peers.
    pub fn len(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }

    /// Whether no peer has been admitted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
