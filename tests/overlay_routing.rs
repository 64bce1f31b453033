//! Integration tests for overlay routing.
//!
//! Assembles real multi-node overlays over localhost TCP sessions and
//! validates sweep-driven route discovery, multi-hop forwarding, and TTL
//! expiry reporting.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test overlay_routing -- --nocapture

use std::sync::Arc;
use std::sync::Once;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use overlan::{
    Connection, LinkState, OverlayMessage, P2PPacket, Peer, PeerId, PeerManager, RouteTable,
    Router, SessionHandle, StaticServerLink, TransmitError,
};

/// One-time tracing initialization.
static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("info")
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn progress(start: Instant, msg: &str) {
    eprintln!("[{:>6.2}s] {}", start.elapsed().as_secs_f64(), msg);
}

fn peer_id(seed: u8) -> PeerId {
    let mut bytes = [0u8; 16];
    bytes[15] = seed;
    PeerId::from_bytes(bytes)
}

struct TestNode {
    id: PeerId,
    peers: Arc<PeerManager>,
    table: Arc<RouteTable>,
    router: Router,
    cancel: CancellationToken,
}

fn spawn_node(seed: u8) -> TestNode {
    let id = peer_id(seed);
    let peers = Arc::new(PeerManager::new());
    let table = Arc::new(RouteTable::new(id));
    let cancel = CancellationToken::new();
    let router = Router::new(
        id,
        peers.clone(),
        table.clone(),
        Arc::new(StaticServerLink {
            connected: true,
            signed_in: true,
            user_id: id,
        }),
        cancel.clone(),
    );
    router.spawn();
    TestNode { id, peers, table, router, cancel }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Join two nodes with a direct TCP link, handshake it, and register the
/// peers on both sides the way the rendezvous collaborator would.
async fn link(a: &TestNode, b: &TestNode) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        SessionHandle::from_stream(stream)
    });
    let (a_session, a_rx) = SessionHandle::connect(addr).await.unwrap();
    let (b_session, b_rx) = accept.await.unwrap();
    let a_remote = a_session.remote_addr();
    let b_remote = b_session.remote_addr();

    let a_conn = Connection::direct(a.id, b.id, a_session, a_rx);
    let b_conn = Connection::direct(b.id, a.id, b_session, b_rx);
    assert!(a_conn.connect().await, "direct link handshake failed");

    a.peers.add(Peer::new(b.id, a_remote, a_conn));
    b.peers.add(Peer::new(a.id, b_remote, b_conn));
}

async fn wait_for_route(node: &TestNode, dest: PeerId, expect: PeerId, deadline: Duration) {
    timeout(deadline, async {
        loop {
            if node.table.forward_interface(dest) == Some(expect) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "no route {:?} -> {:?} via {:?} within {:?}",
            node.id, dest, expect, deadline
        )
    });
}

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Two-peer sweep
// ============================================================================

#[tokio::test]
async fn two_peer_sweep_builds_link_state() {
    init_tracing();
    let start = Instant::now();
    let a = spawn_node(1);
    let b = spawn_node(2);

    link(&a, &b).await;
    progress(start, "A and B linked");

    wait_for_route(&a, b.id, b.id, TEST_TIMEOUT).await;
    wait_for_route(&b, a.id, a.id, TEST_TIMEOUT).await;
    progress(start, "routes converged");

    // After one sweep, A advertises its measured link to B.
    let state = timeout(TEST_TIMEOUT, async {
        loop {
            if let Some(state) = a.table.self_link_state() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("A never assembled a link state");

    assert_eq!(state.source, a.id);
    assert_eq!(state.interfaces, vec![b.id]);
    assert_eq!(state.costs.len(), 1);
    assert!(
        state.costs[0] < 1_000,
        "localhost link cost should be small, got {}",
        state.costs[0]
    );
    progress(start, "link state verified");
}

// ============================================================================
// Three-peer line
// ============================================================================

#[tokio::test]
async fn three_peer_line_routes_and_delivers() {
    init_tracing();
    let start = Instant::now();
    let a = spawn_node(1);
    let b = spawn_node(2);
    let c = spawn_node(3);

    link(&a, &b).await;
    link(&b, &c).await;
    progress(start, "line A-B-C linked");

    // Flooding must teach the edge nodes about each other.
    wait_for_route(&a, c.id, b.id, TEST_TIMEOUT).await;
    wait_for_route(&c, a.id, b.id, TEST_TIMEOUT).await;
    progress(start, "A and C route through B");

    let mut deliveries = c.router.deliveries().expect("deliveries already taken");
    let payload = vec![0xAB; 100];
    a.router.send(c.id, payload.clone()).await;

    let delivery = timeout(TEST_TIMEOUT, deliveries.recv())
        .await
        .expect("delivery timed out")
        .expect("delivery channel closed");
    assert_eq!(delivery.from, a.id);
    assert_eq!(delivery.payload, payload);
    assert_eq!(delivery.ttl, 30, "one intermediate hop leaves ttl at 30");
    progress(start, "payload delivered end to end");
}

// ============================================================================
// TTL expiry
// ============================================================================

#[tokio::test]
async fn forwarding_cycle_reports_one_expiry() {
    init_tracing();
    let start = Instant::now();
    let a = spawn_node(1);
    let b = spawn_node(2);
    let z = peer_id(9);

    link(&a, &b).await;
    wait_for_route(&a, b.id, b.id, TEST_TIMEOUT).await;
    wait_for_route(&b, a.id, a.id, TEST_TIMEOUT).await;
    progress(start, "A and B linked");

    // Bogus link states claiming Z in both directions build an A<->B
    // forwarding cycle. The far-future timestamps outlive real sweeps.
    let bogus_ts = u64::MAX / 2;
    a.table.update(LinkState {
        source: b.id,
        timestamp: bogus_ts,
        interfaces: vec![z],
        costs: vec![1],
    });
    b.table.update(LinkState {
        source: a.id,
        timestamp: bogus_ts,
        interfaces: vec![z],
        costs: vec![1],
    });
    assert_eq!(a.table.forward_interface(z), Some(b.id));
    assert_eq!(b.table.forward_interface(z), Some(a.id));
    progress(start, "cycle constructed");

    let mut errors = a.router.transmit_errors().expect("errors already taken");

    // Inject a short-lived packet into the cycle through A's link to B.
    let link_to_b = a.peers.get(b.id).expect("peer B missing").link.clone();
    let mut packet = P2PPacket::new(a.id, z, b"doomed".to_vec());
    packet.ttl = 3;
    link_to_b
        .send(OverlayMessage::P2P(packet))
        .await
        .expect("injection failed");

    let error = timeout(Duration::from_secs(1), errors.recv())
        .await
        .expect("no expiry within 1s")
        .expect("error channel closed");
    assert_eq!(error.error, TransmitError::Expired);
    assert_eq!(error.original_to, z);
    assert_eq!(error.payload.as_deref(), Some(&b"doomed"[..]));
    progress(start, "expiry received");

    // Exactly one: the cycle must not keep generating errors.
    assert!(
        timeout(Duration::from_millis(500), errors.recv()).await.is_err(),
        "more than one TransmitExpired arrived"
    );
    progress(start, "no duplicate expiry");
}

// ============================================================================
// Peer removal
// ============================================================================

#[tokio::test]
async fn peer_removal_withdraws_routes() {
    init_tracing();
    let start = Instant::now();
    let a = spawn_node(1);
    let b = spawn_node(2);

    link(&a, &b).await;
    wait_for_route(&a, b.id, b.id, TEST_TIMEOUT).await;
    progress(start, "linked and routed");

    a.peers.remove(b.id);

    timeout(TEST_TIMEOUT, async {
        loop {
            if a.table.forward_interface(b.id).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("route to removed peer never withdrawn");
    progress(start, "route withdrawn");
}
