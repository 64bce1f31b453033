//! # Pooled Relay Sessions
//!
//! Relays are expensive: the process keeps exactly one TCP session per
//! relay endpoint and shares it across every connection whose peer is
//! reachable through that relay.
//!
//! ## Pool discipline
//!
//! Per endpoint the pool keeps one tuple — session, cancellation token,
//! reference count — behind a single async mutex. Keeping the tuple under
//! one lock (instead of four sibling maps) removes the ABA hazards of
//! observing a session from one map and a token from another.
//!
//! `connect()`:
//! 1. random jitter 100–1000 ms (spreads concurrent dial storms)
//! 2. take the per-endpoint lock
//! 3. reuse the live session, or dial and run the
//!    `CreateRelayLink → RelayLinkCreated` handshake, publishing the new
//!    session (closing any previous one)
//! 4. bump the reference count
//! 5. on a fresh session, start the heartbeat sender and liveness probe
//! 6. release the lock — on every exit path, including cancellation
//!
//! `disconnect()` decrements; the last holder cancels the endpoint token,
//! closes the session and evicts it.
//!
//! ## Fan-out
//!
//! One reader drains the shared session and broadcasts datagrams to all
//! holders; each holder filters by the `relay_from` stamp, so traffic
//! reaches the right logical connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use rand::Rng;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::messages::{TransDatagram, WireMessage};
use crate::peer::PeerId;
use crate::session::SessionHandle;

/// Period between outbound heartbeats on a live relay session.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Period between liveness checks.
pub const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// A session with no inbound heartbeat for longer than this is dead.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(15);

/// Bounds of the randomized dial delay.
const DIAL_JITTER_MIN_MS: u64 = 100;
const DIAL_JITTER_MAX_MS: u64 = 1000;

/// Deadline for the relay link-creation handshake.
const LINK_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fan-out queue depth per relay session.
const FANOUT_CAPACITY: usize = 1024;

/// Live shared session state for one endpoint.
struct SharedSession {
    session: SessionHandle,
    fanout: broadcast::Sender<TransDatagram>,
    last_heartbeat: Arc<StdMutex<Instant>>,
}

/// The per-endpoint tuple, guarded as a unit.
struct EndpointShared {
    session: Option<SharedSession>,
    cancel: CancellationToken,
    refcount: u32,
}

struct EndpointEntry {
    state: Mutex<EndpointShared>,
}

struct PoolInner {
    endpoints: StdMutex<HashMap<SocketAddr, Arc<EndpointEntry>>>,
    app_cancel: CancellationToken,
}

/// What a connection receives when it binds to a pooled session.
pub struct RelayAttachment {
    pub session: SessionHandle,
    pub datagrams: broadcast::Receiver<TransDatagram>,
}

/// Process-wide relay session pool. Cheap to clone.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool").finish_non_exhaustive()
    }
}

impl RelayPool {
    pub fn new(app_cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                endpoints: StdMutex::new(HashMap::new()),
                app_cancel,
            }),
        }
    }

    fn entry(&self, endpoint: SocketAddr) -> Arc<EndpointEntry> {
        let mut endpoints = self.inner.endpoints.lock().expect("pool map poisoned");
        endpoints
            .entry(endpoint)
            .or_insert_with(|| {
                Arc::new(EndpointEntry {
                    state: Mutex::new(EndpointShared {
                        session: None,
                        cancel: CancellationToken::new(),
                        refcount: 0,
                    }),
                })
            })
            .clone()
    }

    /// Bind one more holder to the endpoint's session, dialing it first if
    /// no live session exists.
    pub async fn connect(
        &self,
        endpoint: SocketAddr,
        user_id: PeerId,
        room_id: String,
    ) -> Result<RelayAttachment> {
        let jitter = {
            let mut rng = rand::thread_rng();
            Duration::from_millis(rng.gen_range(DIAL_JITTER_MIN_MS..=DIAL_JITTER_MAX_MS))
        };
        tokio::select! {
            _ = self.inner.app_cancel.cancelled() => bail!("shutting down"),
            _ = tokio::time::sleep(jitter) => {}
        }

        let entry = self.entry(endpoint);
        let mut state = entry.state.lock().await;
        if self.inner.app_cancel.is_cancelled() {
            bail!("shutting down");
        }

        let attachment = match &state.session {
            Some(shared) if !shared.session.is_closed() => {
                trace!(relay = %endpoint, "reusing pooled relay session");
                RelayAttachment {
                    session: shared.session.clone(),
                    datagrams: shared.fanout.subscribe(),
                }
            }
            _ => {
                self.dial(endpoint, user_id, room_id, &entry, &mut state)
                    .await?
            }
        };

        state.refcount += 1;
        trace!(relay = %endpoint, refcount = state.refcount, "relay holder bound");
        Ok(attachment)
    }

    /// Release one holder. The last one out cancels the endpoint token,
    /// closes the session and evicts it from the pool.
    pub async fn disconnect(&self, endpoint: SocketAddr) {
        let entry = {
            let endpoints = self.inner.endpoints.lock().expect("pool map poisoned");
            endpoints.get(&endpoint).cloned()
        };
        let Some(entry) = entry else { return };

        let mut state = entry.state.lock().await;
        state.refcount = state.refcount.saturating_sub(1);
        if state.refcount == 0 {
            state.cancel.cancel();
            if let Some(shared) = state.session.take() {
                shared.session.close();
                debug!(relay = %endpoint, "last holder gone, relay session closed");
            }
        } else {
            trace!(relay = %endpoint, refcount = state.refcount, "relay holder released");
        }
    }

    /// Current holder count for an endpoint.
    pub async fn refcount(&self, endpoint: SocketAddr) -> u32 {
        let entry = {
            let endpoints = self.inner.endpoints.lock().expect("pool map poisoned");
            endpoints.get(&endpoint).cloned()
        };
        match entry {
            Some(entry) => entry.state.lock().await.refcount,
            None => 0,
        }
    }

    /// Whether a live session is pooled for the endpoint.
    pub async fn has_session(&self, endpoint: SocketAddr) -> bool {
        let entry = {
            let endpoints = self.inner.endpoints.lock().expect("pool map poisoned");
            endpoints.get(&endpoint).cloned()
        };
        match entry {
            Some(entry) => {
                let state = entry.state.lock().await;
                state.session.as_ref().is_some_and(|s| !s.session.is_closed())
            }
            None => false,
        }
    }

    /// Dial, handshake and publish a fresh session. Runs with the
    /// per-endpoint lock held by the caller.
    async fn dial(
        &self,
        endpoint: SocketAddr,
        user_id: PeerId,
        room_id: String,
        entry: &Arc<EndpointEntry>,
        state: &mut EndpointShared,
    ) -> Result<RelayAttachment> {
        debug!(relay = %endpoint, "dialing relay");
        let (session, mut inbound) = tokio::select! {
            _ = self.inner.app_cancel.cancelled() => bail!("shutting down"),
            dialed = SessionHandle::connect(endpoint) => dialed?,
        };

        session
            .send(WireMessage::CreateRelayLink { user_id, room_id })
            .await?;
        let accepted = tokio::select! {
            _ = self.inner.app_cancel.cancelled() => bail!("shutting down"),
            created = timeout(LINK_HANDSHAKE_TIMEOUT, wait_link_created(&mut inbound)) => {
                created.context("relay link handshake timed out")??
            }
        };
        if !accepted {
            bail!("relay {endpoint} rejected link creation");
        }

        let token = self.inner.app_cancel.child_token();
        let (fanout_tx, fanout_rx) = broadcast::channel(FANOUT_CAPACITY);
        let last_heartbeat = Arc::new(StdMutex::new(Instant::now()));

        // Publish: any previous (dead) session is closed and replaced.
        if let Some(previous) = state.session.take() {
            previous.session.close();
        }
        state.cancel = token.clone();
        state.session = Some(SharedSession {
            session: session.clone(),
            fanout: fanout_tx.clone(),
            last_heartbeat: last_heartbeat.clone(),
        });

        spawn_session_reader(
            session.clone(),
            inbound,
            fanout_tx,
            last_heartbeat.clone(),
            token.clone(),
        );
        spawn_heartbeat_sender(session.clone(), token.clone());
        spawn_liveness_probe(endpoint, session.clone(), last_heartbeat, entry.clone(), token);

        debug!(relay = %endpoint, session = session.id(), "relay session established");
        Ok(RelayAttachment {
            session,
            datagrams: fanout_rx,
        })
    }
}

async fn wait_link_created(inbound: &mut mpsc::Receiver<WireMessage>) -> Result<bool> {
    while let Some(message) = inbound.recv().await {
        match message {
            WireMessage::RelayLinkCreated { accepted } => return Ok(accepted),
            other => trace!(?other, "ignoring pre-handshake relay message"),
        }
    }
    bail!("relay closed during link handshake")
}

fn spawn_session_reader(
    session: SessionHandle,
    mut inbound: mpsc::Receiver<WireMessage>,
    fanout: broadcast::Sender<TransDatagram>,
    last_heartbeat: Arc<StdMutex<Instant>>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(WireMessage::Datagram(datagram)) => {
                        // No receivers just means no holder cares right now.
                        let _ = fanout.send(datagram);
                    }
                    Some(WireMessage::HeartBeat) => {
                        *last_heartbeat.lock().expect("heartbeat lock poisoned") = Instant::now();
                    }
                    Some(other) => trace!(?other, "unexpected relay message"),
                    None => break,
                },
            }
        }
        session.close();
        debug!(session = session.id(), "relay session reader finished");
    });
}

fn spawn_heartbeat_sender(session: SessionHandle, token: CancellationToken) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {}
            }
            if session.send(WireMessage::HeartBeat).await.is_err() {
                break;
            }
        }
    });
}

fn spawn_liveness_probe(
    endpoint: SocketAddr,
    session: SessionHandle,
    last_heartbeat: Arc<StdMutex<Instant>>,
    entry: Arc<EndpointEntry>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(LIVENESS_CHECK_INTERVAL);
        // The immediate first tick would check a heartbeat that cannot have
        // arrived yet.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tick.tick() => {}
            }
            let stale = last_heartbeat
                .lock()
                .expect("heartbeat lock poisoned")
                .elapsed()
                > LIVENESS_TIMEOUT;
            if stale || session.is_closed() {
                if stale {
                    warn!(relay = %endpoint, "relay heartbeat timed out, tearing session down");
                }
                let mut state = entry.state.lock().await;
                let ours = state
                    .session
                    .as_ref()
                    .is_some_and(|s| s.session.id() == session.id());
                if ours {
                    state.session = None;
                    state.cancel.cancel();
                }
                session.close();
                return;
            }
        }
    });
}


// ============================================================================
// RelayLink — one logical connection's view of the shared session
// ============================================================================

/// Sender-side handle a relay-backed connection uses to reach its peer
/// through the shared session.
#[derive(Clone)]
pub struct RelayLink {
    endpoint: SocketAddr,
    session: SessionHandle,
}

impl RelayLink {
    pub(crate) fn new(endpoint: SocketAddr, session: SessionHandle) -> Self {
        Self { endpoint, session }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn session_id(&self) -> u64 {
        self.session.id()
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    pub async fn send(&self, message: WireMessage) -> Result<()> {
        self.session.send(message).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn peer(seed: u8) -> PeerId {
        let mut bytes = [0u8; 16];
        bytes[15] = seed;
        PeerId::from_bytes(bytes)
    }

    /// Minimal relay for pool tests: accepts links, counts dials, echoes
    /// heartbeats, forwards datagrams between registered users with the
    /// `relay_from` stamp.
    async fn spawn_test_relay(accept_links: bool) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dials = Arc::new(AtomicUsize::new(0));

        let clients: Arc<StdMutex<HashMap<PeerId, SessionHandle>>> =
            Arc::new(StdMutex::new(HashMap::new()));

        let dial_count = dials.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                dial_count.fetch_add(1, Ordering::SeqCst);
                let (session, mut rx) = SessionHandle::from_stream(stream);
                let clients = clients.clone();
                tokio::spawn(async move {
                    let mut user = None;
                    while let Some(message) = rx.recv().await {
                        match message {
                            WireMessage::CreateRelayLink { user_id, .. } => {
                                user = Some(user_id);
                                clients.lock().unwrap().insert(user_id, session.clone());
                                let _ = session
                                    .send(WireMessage::RelayLinkCreated { accepted: accept_links })
                                    .await;
                            }
                            WireMessage::HeartBeat => {
                                let _ = session.send(WireMessage::HeartBeat).await;
                            }
                            WireMessage::Datagram(mut d) => {
                                d.relay_from = user;
                                let target = clients.lock().unwrap().get(&d.destination).cloned();
                                if let Some(target) = target {
                                    let _ = target.send(WireMessage::Datagram(d)).await;
                                }
                            }
                            _ => {}
                        }
                    }
                });
            }
        });
        (addr, dials)
    }

    #[tokio::test]
    async fn two_holders_share_one_dial() {
        let (relay_addr, dials) = spawn_test_relay(true).await;
        let pool = RelayPool::new(CancellationToken::new());

        let a = pool
            .connect(relay_addr, peer(1), "room".into())
            .await
            .unwrap();
        let b = pool
            .connect(relay_addr, peer(1), "room".into())
            .await
            .unwrap();

        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(a.session.id(), b.session.id());
        assert_eq!(pool.refcount(relay_addr).await, 2);
    }

    #[tokio::test]
    async fn last_disconnect_closes_and_evicts() {
        let (relay_addr, _dials) = spawn_test_relay(true).await;
        let pool = RelayPool::new(CancellationToken::new());

        let first = pool
            .connect(relay_addr, peer(1), "room".into())
            .await
            .unwrap();
        let _second = pool
            .connect(relay_addr, peer(2), "room".into())
            .await
            .unwrap();

        pool.disconnect(relay_addr).await;
        assert_eq!(pool.refcount(relay_addr).await, 1);
        assert!(pool.has_session(relay_addr).await, "session must survive one holder");

        pool.disconnect(relay_addr).await;
        assert_eq!(pool.refcount(relay_addr).await, 0);
        assert!(!pool.has_session(relay_addr).await);
        assert!(first.session.is_closed());
    }

    #[tokio::test]
    async fn rejected_link_fails_connect() {
        let (relay_addr, _dials) = spawn_test_relay(false).await;
        let pool = RelayPool::new(CancellationToken::new());

        let result = pool.connect(relay_addr, peer(1), "room".into()).await;
        assert!(result.is_err());
        assert_eq!(pool.refcount(relay_addr).await, 0);
    }

    #[tokio::test]
    async fn redial_after_teardown_creates_fresh_session() {
        let (relay_addr, dials) = spawn_test_relay(true).await;
        let pool = RelayPool::new(CancellationToken::new());

        let first = pool
            .connect(relay_addr, peer(1), "room".into())
            .await
            .unwrap();
        pool.disconnect(relay_addr).await;
        assert!(first.session.is_closed());

        let second = pool
            .connect(relay_addr, peer(1), "room".into())
            .await
            .unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert_ne!(first.session.id(), second.session.id());
    }

    #[tokio::test]
    async fn cancelled_pool_refuses_connect() {
        let (relay_addr, _dials) = spawn_test_relay(true).await;
        let cancel = CancellationToken::new();
        let pool = RelayPool::new(cancel.clone());
        cancel.cancel();

        assert!(pool.connect(relay_addr, peer(1), "room".into()).await.is_err());
    }
}
