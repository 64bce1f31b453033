//! # Overlay Router
//!
//! A long-lived task that discovers the minimum-latency next hop to every
//! known peer and forwards datagrams hop-by-hop with a TTL.
//!
//! ## Duties
//!
//! - **Link probing**: every sweep (30 s, plus one on every peer add or
//!   remove) pings all direct peers concurrently, assembles the local
//!   [`LinkState`] from the measured round trips, applies it to the route
//!   table and broadcasts it to every direct peer.
//! - **Flooding**: received link states are re-flooded to every direct
//!   peer except the session they arrived on (split horizon), with TTL
//!   decrement and `(source, timestamp)` duplicate suppression.
//! - **Forwarding**: `P2PPacket`s for other peers are passed to the
//!   computed next hop; TTL exhaustion answers the origin with a single
//!   `TransmitExpired` error packet.
//!
//! The router starts only once the rendezvous link reports
//! connected-and-signed-in; cancellation during the wait exits cleanly.
//! Forwarding errors are logged and never propagated to callers.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use lru::LruCache;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::Inbound;
use crate::messages::{
    LinkStatePacket, MessageKind, OverlayMessage, P2PPacket, TransmitError, TransmitErrorPacket,
    INITIAL_TTL,
};
use crate::peer::{Peer, PeerEvent, PeerId, PeerManager, ServerLink};
use crate::ping::PingChecker;
use crate::routes::{monotonic_ms, LinkState, RouteTable, LINK_DOWN};

/// Period of the link-state sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Poll period while waiting for the rendezvous link at startup.
const STARTUP_POLL: Duration = Duration::from_secs(1);

/// Bound on the flooded-packet duplicate cache.
const DUPLICATE_CACHE_SIZE: usize = 4096;

/// Queue depths for the take-once consumer channels.
const DELIVERY_CAPACITY: usize = 256;
const ERROR_CAPACITY: usize = 64;

const HANDLED_KINDS: [MessageKind; 3] = [
    MessageKind::P2P,
    MessageKind::LinkState,
    MessageKind::TransmitError,
];

/// A packet that reached its destination, handed to the upper layer.
#[derive(Debug)]
pub struct Delivery {
    pub from: PeerId,
    pub ttl: u8,
    pub payload: Vec<u8>,
}

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = StdMutex<Option<mpsc::Receiver<T>>>;

struct RouterInner {
    self_id: PeerId,
    peers: Arc<PeerManager>,
    table: Arc<RouteTable>,
    server: Arc<dyn ServerLink>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: TakeOnce<Inbound>,
    delivery_tx: mpsc::Sender<Delivery>,
    delivery_rx: TakeOnce<Delivery>,
    errors_tx: mpsc::Sender<TransmitErrorPacket>,
    errors_rx: TakeOnce<TransmitErrorPacket>,
    kick_tx: mpsc::Sender<()>,
    kick_rx: TakeOnce<()>,
    /// The most recently assembled local link state.
    local_state: StdMutex<Option<LinkState>>,
    /// Flood duplicate suppression keyed by (source, timestamp).
    seen: StdMutex<LruCache<(PeerId, u64), ()>>,
    sweeping: AtomicBool,
    cancel: CancellationToken,
}

/// Handle to the overlay router. Cheap to clone.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("self_id", &self.inner.self_id)
            .finish_non_exhaustive()
    }
}

impl Router {
    pub fn new(
        self_id: PeerId,
        peers: Arc<PeerManager>,
        table: Arc<RouteTable>,
        server: Arc<dyn ServerLink>,
        cancel: CancellationToken,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(DELIVERY_CAPACITY);
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CAPACITY);
        let (kick_tx, kick_rx) = mpsc::channel(8);
        let cache_size = NonZeroUsize::new(DUPLICATE_CACHE_SIZE).expect("cache size is non-zero");

        Self {
            inner: Arc::new(RouterInner {
                self_id,
                peers,
                table,
                server,
                inbound_tx,
                inbound_rx: StdMutex::new(Some(inbound_rx)),
                delivery_tx,
                delivery_rx: StdMutex::new(Some(delivery_rx)),
                errors_tx,
                errors_rx: StdMutex::new(Some(errors_rx)),
                kick_tx,
                kick_rx: StdMutex::new(Some(kick_rx)),
                local_state: StdMutex::new(None),
                seen: StdMutex::new(LruCache::new(cache_size)),
                sweeping: AtomicBool::new(false),
                cancel,
            }),
        }
    }

    pub fn self_id(&self) -> PeerId {
        self.inner.self_id
    }

    pub fn table(&self) -> &Arc<RouteTable> {
        &self.inner.table
    }

    pub fn peers(&self) -> &Arc<PeerManager> {
        &self.inner.peers
    }

    /// Take the delivery receiver. Yields packets addressed to this host.
    pub fn deliveries(&self) -> Option<mpsc::Receiver<Delivery>> {
        self.inner.delivery_rx.lock().expect("receiver lock poisoned").take()
    }

    /// Take the transmit-error receiver (errors returned to this origin).
    pub fn transmit_errors(&self) -> Option<mpsc::Receiver<TransmitErrorPacket>> {
        self.inner.errors_rx.lock().expect("receiver lock poisoned").take()
    }

    /// Wrap `payload` for `to` and hand it to the forwarding path. Errors
    /// along the way are logged, never returned.
    pub async fn send(&self, to: PeerId, payload: Vec<u8>) {
        let packet = P2PPacket::new(self.inner.self_id, to, payload);
        self.route_packet(packet).await;
    }

    /// Start the router task.
    pub fn spawn(&self) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move { router.run().await })
    }

    async fn run(&self) {
        // Hold until the rendezvous side is usable; a shutdown during the
        // wait is a clean exit.
        loop {
            if self.inner.cancel.is_cancelled() {
                info!("router cancelled before rendezvous sign-in");
                return;
            }
            if self.inner.server.is_connected().await && self.inner.server.is_signed_in().await {
                break;
            }
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    info!("router cancelled before rendezvous sign-in");
                    return;
                }
                _ = tokio::time::sleep(STARTUP_POLL) => {}
            }
        }
        info!(self_id = ?self.inner.self_id, "router started");

        let mut events = self.inner.peers.subscribe();
        let mut inbound_rx = self
            .inner
            .inbound_rx
            .lock()
            .expect("receiver lock poisoned")
            .take()
            .expect("router already running");
        let mut kick_rx = self
            .inner
            .kick_rx
            .lock()
            .expect("receiver lock poisoned")
            .take()
            .expect("router already running");

        // Peers introduced before the router came up: install handlers and
        // probe them right away instead of waiting out a full interval.
        let existing = self.inner.peers.snapshot();
        for peer in &existing {
            self.install(peer);
        }
        if !existing.is_empty() {
            self.kick();
        }

        let mut sweep_tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = sweep_tick.tick() => self.start_sweep(),
                Some(()) = kick_rx.recv() => self.start_sweep(),
                event = events.recv() => match event {
                    Ok(PeerEvent::Added(peer)) => self.peer_added(peer),
                    Ok(PeerEvent::Removed(peer)) => self.peer_removed(peer),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "peer events lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                Some(inbound) = inbound_rx.recv() => self.handle_inbound(inbound).await,
            }
        }
        info!("router stopped");
    }

    // ------------------------------------------------------------------
    // Peer lifecycle
    // ------------------------------------------------------------------

    fn install(&self, peer: &Arc<Peer>) {
        // Installing twice is a no-op: the registry replaces per kind.
        for kind in HANDLED_KINDS {
            peer.link.register_handler(kind, self.inner.inbound_tx.clone());
        }
        if self.inner.table.forward_interface(peer.id).is_none() {
            self.inner.table.force_add(peer.id, peer.id);
        }
    }

    fn peer_added(&self, peer: Arc<Peer>) {
        debug!(peer = ?peer.id, "peer added, installing handlers");
        self.install(&peer);
        self.kick();
    }

    fn peer_removed(&self, peer: Arc<Peer>) {
        debug!(peer = ?peer.id, "peer removed");
        for kind in HANDLED_KINDS {
            peer.link.remove_handler(kind);
        }
        self.inner.table.clear_forced(peer.id);

        // Advertise the dead link so downstream peers reroute.
        let updated = {
            let mut guard = self.inner.local_state.lock().expect("state lock poisoned");
            guard.as_mut().and_then(|state| {
                let idx = state.interfaces.iter().position(|i| *i == peer.id)?;
                state.costs[idx] = LINK_DOWN;
                state.timestamp = monotonic_ms();
                Some(state.clone())
            })
        };
        if let Some(state) = updated {
            self.inner.table.update(state);
        }
        self.kick();
    }

    fn kick(&self) {
        let _ = self.inner.kick_tx.try_send(());
    }

    // ------------------------------------------------------------------
    // Link-state sweep
    // ------------------------------------------------------------------

    fn start_sweep(&self) {
        if self.inner.sweeping.swap(true, Ordering::AcqRel) {
            trace!("sweep already running");
            return;
        }
        let router = self.clone();
        tokio::spawn(async move {
            router.sweep().await;
            router.inner.sweeping.store(false, Ordering::Release);
        });
    }

    async fn sweep(&self) {
        let peers = self.inner.peers.snapshot();
        if peers.is_empty() {
            return;
        }

        let mut probes = JoinSet::new();
        for peer in &peers {
            let connection = peer.link.clone();
            let id = peer.id;
            probes.spawn(async move {
                let mut checker = PingChecker::new(connection);
                (id, checker.check_ping().await)
            });
        }

        let mut interfaces = Vec::with_capacity(peers.len());
        let mut costs = Vec::with_capacity(peers.len());
        while let Some(joined) = probes.join_next().await {
            if let Ok((id, cost)) = joined {
                interfaces.push(id);
                costs.push(cost);
            }
        }

        let state = LinkState::new(self.inner.self_id, interfaces, costs);
        debug!(
            peers = state.interfaces.len(),
            timestamp = state.timestamp,
            "sweep complete, broadcasting link state"
        );
        *self.inner.local_state.lock().expect("state lock poisoned") = Some(state.clone());

        let packet = state.clone().into_packet(INITIAL_TTL);
        for peer in &peers {
            let link = peer.link.clone();
            let packet = packet.clone();
            // Best effort: a peer disconnecting mid-broadcast must not
            // stall the sweep.
            tokio::spawn(async move {
                let _ = link.send(OverlayMessage::LinkState(packet)).await;
            });
        }

        self.inner.table.update(state);
    }

    // ------------------------------------------------------------------
    // Inbound handling
    // ------------------------------------------------------------------

    async fn handle_inbound(&self, inbound: Inbound) {
        match inbound.message {
            OverlayMessage::P2P(packet) => self.route_packet(packet).await,
            OverlayMessage::LinkState(packet) => {
                self.handle_link_state(packet, inbound.session).await
            }
            OverlayMessage::TransmitError(error) => self.route_error(error).await,
            other => trace!(?other, "router ignoring message"),
        }
    }

    async fn route_packet(&self, mut packet: P2PPacket) {
        if packet.to == self.inner.self_id {
            let delivery = Delivery {
                from: packet.from,
                ttl: packet.ttl,
                payload: packet.payload,
            };
            if self.inner.delivery_tx.try_send(delivery).is_err() {
                warn!("delivery queue full, dropping packet");
            }
            return;
        }

        packet.ttl = packet.ttl.saturating_sub(1);
        if packet.ttl == 0 {
            self.ttl_expired(packet).await;
            return;
        }

        let Some(target) = self.next_hop_peer(packet.to) else {
            debug!(to = ?packet.to, "no route, dropping packet");
            return;
        };
        trace!(to = ?packet.to, via = ?target.id, ttl = packet.ttl, "forwarding packet");
        if let Err(e) = target.link.send(OverlayMessage::P2P(packet)).await {
            debug!(via = ?target.id, error = %e, "forward failed");
        }
    }

    /// Next hop for `dest`: the computed route, or `dest` itself as a last
    /// resort when it is a direct peer.
    fn next_hop_peer(&self, dest: PeerId) -> Option<Arc<Peer>> {
        if let Some(hop) = self.inner.table.forward_interface(dest) {
            if let Some(peer) = self.inner.peers.get(hop) {
                return Some(peer);
            }
        }
        self.inner.peers.get(dest)
    }

    async fn ttl_expired(&self, packet: P2PPacket) {
        debug!(from = ?packet.from, to = ?packet.to, "packet TTL expired");
        let error = TransmitErrorPacket {
            error: TransmitError::Expired,
            from: self.inner.self_id,
            to: packet.from,
            original_to: packet.to,
            payload: Some(packet.payload),
            ttl: INITIAL_TTL,
        };
        self.route_error(error).await;
    }

    async fn route_error(&self, mut error: TransmitErrorPacket) {
        if error.to == self.inner.self_id {
            if self.inner.errors_tx.try_send(error).is_err() {
                warn!("transmit-error queue full, dropping");
            }
            return;
        }
        error.ttl = error.ttl.saturating_sub(1);
        if error.ttl == 0 {
            // Never answer an error with an error.
            debug!(to = ?error.to, "error packet TTL expired, dropping");
            return;
        }
        let Some(target) = self.next_hop_peer(error.to) else {
            debug!(to = ?error.to, "no route for error packet, dropping");
            return;
        };
        if let Err(e) = target.link.send(OverlayMessage::TransmitError(error)).await {
            debug!(via = ?target.id, error = %e, "error packet forward failed");
        }
    }

    async fn handle_link_state(&self, mut packet: LinkStatePacket, session: u64) {
        if packet.source == self.inner.self_id {
            return;
        }

        // TTL plus split horizon bounds the flood; the seen-cache kills
        // transient multi-path duplicates outright.
        {
            let mut seen = self.inner.seen.lock().expect("seen lock poisoned");
            if seen.put((packet.source, packet.timestamp), ()).is_some() {
                trace!(source = ?packet.source, "duplicate link state dropped");
                return;
            }
        }

        packet.ttl = packet.ttl.saturating_sub(1);
        if packet.ttl == 0 {
            debug!(source = ?packet.source, "link state TTL expired");
            let error = TransmitErrorPacket {
                error: TransmitError::Expired,
                from: self.inner.self_id,
                to: packet.source,
                original_to: packet.source,
                payload: None,
                ttl: INITIAL_TTL,
            };
            self.route_error(error).await;
            return;
        }

        self.inner.table.update(LinkState::from(packet.clone()));

        for peer in self.inner.peers.snapshot() {
            if peer.link.session_id() == Some(session) {
                continue;
            }
            let link = peer.link.clone();
            let packet = packet.clone();
            tokio::spawn(async move {
                let _ = link.send(OverlayMessage::LinkState(packet)).await;
            });
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::peer::StaticServerLink;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::time::timeout;

    fn peer_id(seed: u8) -> PeerId {
        let mut bytes = [0u8; 16];
        bytes[15] = seed;
        PeerId::from_bytes(bytes)
    }

    fn test_router(self_seed: u8, connected: bool, signed_in: bool) -> Router {
        let self_id = peer_id(self_seed);
        Router::new(
            self_id,
            Arc::new(PeerManager::new()),
            Arc::new(RouteTable::new(self_id)),
            Arc::new(StaticServerLink {
                connected,
                signed_in,
                user_id: self_id,
            }),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn cancelled_router_exits_cleanly_before_signin() {
        let router = test_router(1, false, false);
        let handle = router.spawn();
        router.inner.cancel.cancel();
        timeout(Duration::from_secs(2), handle)
            .await
            .expect("router did not exit")
            .expect("router task panicked");
    }

    #[tokio::test]
    async fn peer_removal_marks_cost_down() {
        let router = test_router(1, true, true);
        let a = peer_id(1);
        let b = peer_id(2);

        // Pretend a sweep measured B at 12 ms.
        let state = LinkState::new(a, vec![b], vec![12]);
        router.inner.table.update(state.clone());
        *router.inner.local_state.lock().unwrap() = Some(state);
        assert_eq!(router.table().forward_interface(b), Some(b));

        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let link = Connection::loopback_for_tests(a, b);
        let peer = Arc::new(Peer::new(b, addr, link));
        router.peer_removed(peer);

        assert_eq!(router.table().forward_interface(b), None);
        let local = router.inner.local_state.lock().unwrap().clone().unwrap();
        assert_eq!(local.costs, vec![LINK_DOWN]);
    }

    #[tokio::test]
    async fn local_delivery_bypasses_forwarding() {
        let router = test_router(1, true, true);
        let mut deliveries = router.deliveries().unwrap();

        let packet = P2PPacket::new(peer_id(9), peer_id(1), b"hi".to_vec());
        router.route_packet(packet).await;

        let delivery = timeout(Duration::from_secs(1), deliveries.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(delivery.from, peer_id(9));
        assert_eq!(delivery.ttl, INITIAL_TTL);
        assert_eq!(delivery.payload, b"hi");
    }

    #[tokio::test]
    async fn expiry_at_origin_reports_locally() {
        let router = test_router(1, true, true);
        let mut errors = router.transmit_errors().unwrap();

        // No route anywhere; a ttl-1 packet from us expires right here.
        let mut packet = P2PPacket::new(peer_id(1), peer_id(7), b"x".to_vec());
        packet.ttl = 1;
        router.route_packet(packet).await;

        let error = timeout(Duration::from_secs(1), errors.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(error.error, TransmitError::Expired);
        assert_eq!(error.original_to, peer_id(7));
        assert_eq!(error.payload.as_deref(), Some(&b"x"[..]));
    }

    #[tokio::test]
    async fn duplicate_link_state_not_reapplied() {
        let router = test_router(1, true, true);
        let b = peer_id(2);
        let c = peer_id(3);

        let packet = LinkStatePacket {
            source: b,
            timestamp: 10,
            ttl: INITIAL_TTL,
            interfaces: vec![c],
            costs: vec![5],
        };
        router.handle_link_state(packet.clone(), 1).await;
        let first = router.table().known_destinations();

        router.handle_link_state(packet, 2).await;
        assert_eq!(router.table().known_destinations(), first);
    }

    #[tokio::test]
    async fn no_route_drops_without_error_reply() {
        let router = test_router(1, true, true);
        let mut errors = router.transmit_errors().unwrap();

        let packet = P2PPacket::new(peer_id(9), peer_id(7), b"x".to_vec());
        router.route_packet(packet).await;

        assert!(
            timeout(Duration::from_millis(200), errors.recv()).await.is_err(),
            "no-route must not generate an error packet"
        );
    }
}
