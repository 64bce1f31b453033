//! # Peers and Collaborator Interfaces
//!
//! This module defines the core identity and peer-tracking types:
//!
//! - [`PeerId`]: opaque 128-bit identifier assigned by the rendezvous server
//! - [`Peer`]: a live remote peer with its direct link
//! - [`PeerManager`]: mutex-guarded peer collection with add/remove events
//! - [`ServerLink`] / [`RoomInfo`]: interfaces onto the rendezvous
//!   collaborator, injected where the overlay consumes them
//!
//! ## Identity Model
//!
//! A `PeerId` is opaque: it carries no addressing or cryptographic meaning
//! inside the overlay. The rendezvous server guarantees global uniqueness at
//! sign-in; the overlay only compares, hashes, and orders ids (ordering is
//! byte-lexicographic and is used for route tie-breaking).
//!
//! ## Ownership
//!
//! The `PeerManager` owns every live [`Peer`]. There is exactly one live
//! peer per id: re-adding an id removes the previous record first, emitting
//! its removal event.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::connection::Connection;

/// Capacity of the peer event channel. Slow subscribers lag, they do not
/// block peer management.
const PEER_EVENT_CAPACITY: usize = 64;

/// Opaque 128-bit peer identifier, globally unique per rendezvous sign-in.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 16]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form for logs: first four bytes are enough to tell peers apart.
        write!(f, "{}", &hex::encode(self.0)[..8])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}


// ============================================================================
// Rendezvous collaborator interfaces
// ============================================================================

/// View onto the rendezvous server link.
///
/// The overlay never talks to the rendezvous server directly; it only gates
/// on connection/sign-in state and reads its own assigned id.
#[async_trait]
pub trait ServerLink: Send + Sync + 'static {
    async fn is_connected(&self) -> bool;
    async fn is_signed_in(&self) -> bool;
    async fn user_id(&self) -> PeerId;
}

/// Current room membership, consumed by the relay dial handshake.
pub trait RoomInfo: Send + Sync + 'static {
    fn room_id(&self) -> String;
}


// ============================================================================
// Peer and PeerManager
// ============================================================================

/// A live remote peer: its id, the address the rendezvous server reported,
/// and the connection serving as its direct link.
pub struct Peer {
    pub id: PeerId,
    pub remote_addr: SocketAddr,
    pub link: Connection,
}

impl Peer {
    pub fn new(id: PeerId, remote_addr: SocketAddr, link: Connection) -> Self {
        Self { id, remote_addr, link }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub enum PeerEvent {
    Added(Arc<Peer>),
    Removed(Arc<Peer>),
}

/// Mutex-guarded collection of live peers.
///
/// A single lock guards the map; the router snapshots under it before
/// dispatching concurrent pings so a removal mid-sweep cannot tear the
/// iteration.
pub struct PeerManager {
    peers: Mutex<HashMap<PeerId, Arc<Peer>>>,
    events: broadcast::Sender<PeerEvent>,
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(PEER_EVENT_CAPACITY);
        Self {
            peers: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to add/remove events. Subscribers created after an event
    /// was sent do not see it; callers snapshot first, then subscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Insert a peer, replacing (and announcing removal of) any previous
    /// record under the same id.
    pub fn add(&self, peer: Peer) -> Arc<Peer> {
        let id = peer.id;
        let peer = Arc::new(peer);
        let replaced = {
            let mut peers = self.peers.lock().expect("peer map poisoned");
            peers.insert(id, peer.clone())
        };
        if let Some(old) = replaced {
            debug!(peer = ?id, "replacing existing peer record");
            let _ = self.events.send(PeerEvent::Removed(old));
        }
        let _ = self.events.send(PeerEvent::Added(peer.clone()));
        peer
    }

    pub fn remove(&self, id: PeerId) -> Option<Arc<Peer>> {
        let removed = {
            let mut peers = self.peers.lock().expect("peer map poisoned");
            peers.remove(&id)
        };
        if let Some(peer) = &removed {
            let _ = self.events.send(PeerEvent::Removed(peer.clone()));
        }
        removed
    }

    pub fn get(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.lock().expect("peer map poisoned").get(&id).cloned()
    }

    /// Whether a direct link to `id` exists.
    pub fn has_link(&self, id: PeerId) -> bool {
        self.peers.lock().expect("peer map poisoned").contains_key(&id)
    }

    /// Consistent copy of the current peer set, taken under the lock.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers
            .lock()
            .expect("peer map poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().expect("peer map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}


/// Fixed-state rendezvous link, for wiring tests and embedders that manage
/// sign-in elsewhere.
pub struct StaticServerLink {
    pub connected: bool,
    pub signed_in: bool,
    pub user_id: PeerId,
}

#[async_trait]
impl ServerLink for StaticServerLink {
    async fn is_connected(&self) -> bool {
        self.connected
    }

    async fn is_signed_in(&self) -> bool {
        self.signed_in
    }

    async fn user_id(&self) -> PeerId {
        self.user_id
    }
}

/// Fixed room membership.
pub struct StaticRoomInfo(pub String);

impl RoomInfo for StaticRoomInfo {
    fn room_id(&self) -> String {
        self.0.clone()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn peer_id(seed: u8) -> PeerId {
        let mut bytes = [0u8; 16];
        bytes[15] = seed;
        PeerId::from_bytes(bytes)
    }

    #[test]
    fn peer_id_round_trip() {
        let bytes = [7u8; 16];
        let id = PeerId::from_bytes(bytes);
        assert_eq!(*id.as_bytes(), bytes);
        assert_eq!(id.to_hex(), "07".repeat(16));
    }

    #[test]
    fn peer_id_ordering_is_lexicographic() {
        let low = peer_id(1);
        let high = peer_id(2);
        assert!(low < high);

        let mut bytes = [0u8; 16];
        bytes[0] = 1;
        let leading = PeerId::from_bytes(bytes);
        assert!(high < leading);
    }

    #[tokio::test]
    async fn manager_emits_add_and_remove_events() {
        let manager = PeerManager::new();
        let mut events = manager.subscribe();

        let conn = Connection::loopback_for_tests(peer_id(0), peer_id(1));
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        manager.add(Peer::new(peer_id(1), addr, conn));

        assert!(matches!(events.recv().await, Ok(PeerEvent::Added(p)) if p.id == peer_id(1)));
        assert!(manager.has_link(peer_id(1)));
        assert_eq!(manager.len(), 1);

        manager.remove(peer_id(1));
        assert!(matches!(events.recv().await, Ok(PeerEvent::Removed(p)) if p.id == peer_id(1)));
        assert!(!manager.has_link(peer_id(1)));
    }

    #[tokio::test]
    async fn duplicate_add_replaces_and_announces_removal() {
        let manager = PeerManager::new();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        let conn = Connection::loopback_for_tests(peer_id(0), peer_id(1));
        manager.add(Peer::new(peer_id(1), addr, conn));

        let mut events = manager.subscribe();
        let conn = Connection::loopback_for_tests(peer_id(0), peer_id(1));
        manager.add(Peer::new(peer_id(1), addr, conn));

        assert!(matches!(events.recv().await, Ok(PeerEvent::Removed(_))));
        assert!(matches!(events.recv().await, Ok(PeerEvent::Added(_))));
        assert_eq!(manager.len(), 1);
    }
}
