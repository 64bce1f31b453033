//! # Proxy Subsystem
//!
//! A bidirectional port forwarder over the overlay. A mapping such as
//! "local 25565 → peer B's 25565" binds a [`ProxyAcceptor`] on the local
//! port; every accepted socket negotiates a tunnel with the remote peer
//! and becomes a [`ProxyPair`] piping bytes through routed packets.
//!
//! ## Tunnel lifecycle
//!
//! ```text
//! app ──► acceptor ──► orphan socket ──► ProxyConnectReq ──► peer dials
//!                                             ▲                real port
//!            pair created ◄── isResponse ─────┘           pair created
//! ```
//!
//! Both sides key the tunnel by (partner, client ephemeral port, server
//! port), so frames route to the right pair without extra negotiation.
//! Either side of a pair closing sends a `Shutdown` frame and disposes the
//! pair; at most one pair exists per tunnel id — creating a second
//! disposes the first.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::messages::{decode_bounded, encode, AppPayload, ProxyConnectReq, TunnelFrame};
use crate::peer::PeerId;
use crate::router::{Delivery, Router};

/// Read chunk for tunneled sockets. Comfortably under the frame limit.
const READ_CHUNK: usize = 16 * 1024;

/// Queue depth from acceptors into the manager.
const ACCEPT_QUEUE: usize = 32;

/// Queue depth of inbound frames per pair.
const PAIR_QUEUE: usize = 64;

/// Uniquely names a proxy tunnel on this host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TunnelId {
    pub partner: PeerId,
    /// Ephemeral port of the originating client socket.
    pub client_port: u16,
    /// Real service port on the serving side.
    pub server_port: u16,
}

/// A socket accepted on a mapped port, waiting for tunnel negotiation.
struct AcceptedSocket {
    partner: PeerId,
    server_port: u16,
    socket: TcpStream,
}


// ============================================================================
// Acceptor
// ============================================================================

/// Listens on a mapped local port and emits accepted sockets upward.
pub struct ProxyAcceptor {
    partner: PeerId,
    local_map_port: u16,
    remote_server_port: u16,
    cancel: CancellationToken,
}

impl ProxyAcceptor {
    async fn bind(
        partner: PeerId,
        local_map_port: u16,
        remote_server_port: u16,
        accepted: mpsc::Sender<AcceptedSocket>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", local_map_port))
            .await
            .with_context(|| format!("cannot listen on mapped port {local_map_port}"))?;
        let local_map_port = listener.local_addr()?.port();
        debug!(port = local_map_port, ?partner, "proxy acceptor listening");

        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        incoming = listener.accept() => match incoming {
                            Ok((socket, from)) => {
                                trace!(%from, "mapped port accepted a client");
                                let item = AcceptedSocket {
                                    partner,
                                    server_port: remote_server_port,
                                    socket,
                                };
                                if accepted.send(item).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "accept failed on mapped port");
                            }
                        },
                    }
                }
                debug!(port = local_map_port, "proxy acceptor stopped");
            });
        }

        Ok(Self {
            partner,
            local_map_port,
            remote_server_port,
            cancel,
        })
    }

    pub fn partner(&self) -> PeerId {
        self.partner
    }

    pub fn local_map_port(&self) -> u16 {
        self.local_map_port
    }

    pub fn remote_server_port(&self) -> u16 {
        self.remote_server_port
    }
}

impl Drop for ProxyAcceptor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}


// ============================================================================
// Manager
// ============================================================================

struct PairHandle {
    id: u64,
    frames: mpsc::Sender<TunnelFrame>,
    cancel: CancellationToken,
}

struct ProxyInner {
    self_id: PeerId,
    router: Router,
    acceptors: StdMutex<HashMap<(PeerId, u16), ProxyAcceptor>>,
    /// Orphan sockets waiting for a tunnel-open reply.
    accepted: StdMutex<HashMap<TunnelId, TcpStream>>,
    proxies: StdMutex<HashMap<TunnelId, PairHandle>>,
    accepted_tx: mpsc::Sender<AcceptedSocket>,
    accepted_rx: StdMutex<Option<mpsc::Receiver<AcceptedSocket>>>,
    next_pair_id: AtomicU64,
    cancel: CancellationToken,
}

/// Owns acceptors, orphan sockets and live pairs; negotiates tunnels over
/// the overlay. Cheap to clone.
#[derive(Clone)]
pub struct ProxyManager {
    inner: Arc<ProxyInner>,
}

impl std::fmt::Debug for ProxyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyManager")
            .field("self_id", &self.inner.self_id)
            .finish_non_exhaustive()
    }
}

impl ProxyManager {
    pub fn new(router: Router, cancel: CancellationToken) -> Self {
        let (accepted_tx, accepted_rx) = mpsc::channel(ACCEPT_QUEUE);
        Self {
            inner: Arc::new(ProxyInner {
                self_id: router.self_id(),
                router,
                acceptors: StdMutex::new(HashMap::new()),
                accepted: StdMutex::new(HashMap::new()),
                proxies: StdMutex::new(HashMap::new()),
                accepted_tx,
                accepted_rx: StdMutex::new(Some(accepted_rx)),
                next_pair_id: AtomicU64::new(1),
                cancel,
            }),
        }
    }

    /// Map a local port onto `partner`'s real `remote_server_port`. Fails
    /// when the port cannot be bound or the mapping already exists.
    /// Returns the bound local port (useful when mapping port 0).
    pub async fn add_mapping(
        &self,
        partner: PeerId,
        local_map_port: u16,
        remote_server_port: u16,
    ) -> Result<u16> {
        let key = (partner, remote_server_port);
        if self
            .inner
            .acceptors
            .lock()
            .expect("acceptor lock poisoned")
            .contains_key(&key)
        {
            bail!("mapping for peer {partner} port {remote_server_port} already exists");
        }
        let acceptor = ProxyAcceptor::bind(
            partner,
            local_map_port,
            remote_server_port,
            self.inner.accepted_tx.clone(),
            self.inner.cancel.child_token(),
        )
        .await?;
        let bound = acceptor.local_map_port();
        self.inner
            .acceptors
            .lock()
            .expect("acceptor lock poisoned")
            .insert(key, acceptor);
        Ok(bound)
    }

    /// Tear one mapping down. Established tunnels keep running.
    pub fn remove_mapping(&self, partner: PeerId, remote_server_port: u16) -> bool {
        self.inner
            .acceptors
            .lock()
            .expect("acceptor lock poisoned")
            .remove(&(partner, remote_server_port))
            .is_some()
    }

    pub fn active_tunnels(&self) -> usize {
        self.inner.proxies.lock().expect("proxy lock poisoned").len()
    }

    pub fn orphan_sockets(&self) -> usize {
        self.inner.accepted.lock().expect("orphan lock poisoned").len()
    }

    pub fn has_tunnel(&self, tunnel: &TunnelId) -> bool {
        self.inner
            .proxies
            .lock()
            .expect("proxy lock poisoned")
            .contains_key(tunnel)
    }

    /// Run the manager: consume accepted sockets and overlay deliveries.
    pub fn spawn(&self, mut deliveries: mpsc::Receiver<Delivery>) -> JoinHandle<()> {
        let manager = self.clone();
        let mut accepted_rx = manager
            .inner
            .accepted_rx
            .lock()
            .expect("receiver lock poisoned")
            .take()
            .expect("proxy manager already running");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.inner.cancel.cancelled() => break,
                    Some(accepted) = accepted_rx.recv() => {
                        manager.outbound_open(accepted).await;
                    }
                    delivery = deliveries.recv() => match delivery {
                        Some(delivery) => manager.on_delivery(delivery).await,
                        None => break,
                    },
                }
            }
            debug!("proxy manager stopped");
        })
    }

    /// A local client connected to a mapped port: stash the socket and ask
    /// the partner to open its side of the tunnel.
    async fn outbound_open(&self, accepted: AcceptedSocket) {
        let client_port = match accepted.socket.peer_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                warn!(error = %e, "accepted socket has no peer address");
                return;
            }
        };
        let tunnel = TunnelId {
            partner: accepted.partner,
            client_port,
            server_port: accepted.server_port,
        };
        let previous = self
            .inner
            .accepted
            .lock()
            .expect("orphan lock poisoned")
            .insert(tunnel, accepted.socket);
        if previous.is_some() {
            warn!(?tunnel, "replacing stale orphan socket");
        }

        let request = ProxyConnectReq {
            is_response: false,
            client_id: accepted.partner,
            client_real_port: client_port,
            server_real_port: accepted.server_port,
        };
        debug!(?tunnel, "requesting tunnel open");
        self.send_app(accepted.partner, &AppPayload::ProxyConnect(request))
            .await;
    }

    async fn on_delivery(&self, delivery: Delivery) {
        let payload: AppPayload = match decode_bounded(&delivery.payload) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(from = ?delivery.from, error = %e, "undecodable proxy payload dropped");
                return;
            }
        };
        match payload {
            AppPayload::ProxyConnect(request) if !request.is_response => {
                self.inbound_open(delivery.from, request).await;
            }
            AppPayload::ProxyConnect(response) => {
                self.connect_response(delivery.from, response);
            }
            AppPayload::Tunnel { client_port, server_port, frame } => {
                self.tunnel_frame(delivery.from, client_port, server_port, frame)
                    .await;
            }
        }
    }

    /// The partner wants a tunnel: dial the real local service and answer.
    async fn inbound_open(&self, from: PeerId, request: ProxyConnectReq) {
        let target = SocketAddr::from(([127, 0, 0, 1], request.server_real_port));
        let socket = match TcpStream::connect(target).await {
            Ok(socket) => socket,
            Err(e) => {
                error!(%target, error = %e, "cannot reach real service for tunnel");
                return;
            }
        };
        let tunnel = TunnelId {
            partner: from,
            client_port: request.client_real_port,
            server_port: request.server_real_port,
        };
        debug!(?tunnel, "tunnel open, serving side up");
        self.create_pair(tunnel, socket);

        let reply = ProxyConnectReq {
            is_response: true,
            ..request
        };
        self.send_app(from, &AppPayload::ProxyConnect(reply)).await;
    }

    /// The partner confirmed: bind the stashed orphan socket into a pair.
    fn connect_response(&self, from: PeerId, response: ProxyConnectReq) {
        let acceptor_known = self
            .inner
            .acceptors
            .lock()
            .expect("acceptor lock poisoned")
            .contains_key(&(response.client_id, response.server_real_port));
        if !acceptor_known {
            error!(
                client = ?response.client_id,
                port = response.server_real_port,
                "connect response without matching acceptor"
            );
            return;
        }

        let tunnel = TunnelId {
            partner: from,
            client_port: response.client_real_port,
            server_port: response.server_real_port,
        };
        let socket = self
            .inner
            .accepted
            .lock()
            .expect("orphan lock poisoned")
            .remove(&tunnel);
        match socket {
            Some(socket) => {
                debug!(?tunnel, "tunnel open, client side up");
                self.create_pair(tunnel, socket);
            }
            None => {
                error!(?tunnel, "connect response without waiting socket");
            }
        }
    }

    async fn tunnel_frame(
        &self,
        from: PeerId,
        client_port: u16,
        server_port: u16,
        frame: TunnelFrame,
    ) {
        let tunnel = TunnelId { partner: from, client_port, server_port };
        let frames = self
            .inner
            .proxies
            .lock()
            .expect("proxy lock poisoned")
            .get(&tunnel)
            .map(|pair| pair.frames.clone());
        match frames {
            Some(frames) => {
                if frames.send(frame).await.is_err() {
                    debug!(?tunnel, "pair gone, frame dropped");
                }
            }
            None => debug!(?tunnel, "frame for unknown tunnel dropped"),
        }
    }

    // ------------------------------------------------------------------
    // Pairs
    // ------------------------------------------------------------------

    /// Bind a socket to a tunnel id. A pre-existing pair under the same id
    /// is disposed first.
    fn create_pair(&self, tunnel: TunnelId, socket: TcpStream) {
        let id = self.inner.next_pair_id.fetch_add(1, Ordering::Relaxed);
        let (frames_tx, frames_rx) = mpsc::channel(PAIR_QUEUE);
        let pair_cancel = self.inner.cancel.child_token();
        let handle = PairHandle {
            id,
            frames: frames_tx,
            cancel: pair_cancel.clone(),
        };

        let previous = self
            .inner
            .proxies
            .lock()
            .expect("proxy lock poisoned")
            .insert(tunnel, handle);
        if let Some(previous) = previous {
            error!(?tunnel, "duplicate tunnel, disposing previous pair");
            previous.cancel.cancel();
        }

        let (read_half, write_half) = socket.into_split();
        let closing = Arc::new(AtomicBool::new(false));
        self.spawn_pair_reader(tunnel, id, read_half, closing.clone(), pair_cancel.clone());
        self.spawn_pair_writer(tunnel, id, write_half, frames_rx, closing, pair_cancel);
    }

    fn dispose_pair(&self, tunnel: TunnelId, id: u64) {
        let mut proxies = self.inner.proxies.lock().expect("proxy lock poisoned");
        if proxies.get(&tunnel).is_some_and(|pair| pair.id == id) {
            let pair = proxies.remove(&tunnel).expect("entry checked above");
            pair.cancel.cancel();
            debug!(?tunnel, "tunnel disposed");
        }
    }

    fn spawn_pair_reader(
        &self,
        tunnel: TunnelId,
        id: u64,
        mut read_half: OwnedReadHalf,
        closing: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let n = tokio::select! {
                    _ = cancel.cancelled() => break,
                    read = read_half.read(&mut buf) => match read {
                        Ok(0) | Err(_) => {
                            if !closing.swap(true, Ordering::AcqRel) {
                                manager.send_tunnel(tunnel, TunnelFrame::Shutdown).await;
                            }
                            manager.dispose_pair(tunnel, id);
                            break;
                        }
                        Ok(n) => n,
                    },
                };
                let frame = TunnelFrame::Data(buf[..n].to_vec());
                manager.send_tunnel(tunnel, frame).await;
            }
        });
    }

    fn spawn_pair_writer(
        &self,
        tunnel: TunnelId,
        id: u64,
        mut write_half: OwnedWriteHalf,
        mut frames: mpsc::Receiver<TunnelFrame>,
        closing: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = frames.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                match frame {
                    TunnelFrame::Data(bytes) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            if !closing.swap(true, Ordering::AcqRel) {
                                manager.send_tunnel(tunnel, TunnelFrame::Shutdown).await;
                            }
                            manager.dispose_pair(tunnel, id);
                            break;
                        }
                    }
                    TunnelFrame::Shutdown => {
                        // Mark first so the reader's EOF does not echo a
                        // second Shutdown back.
                        closing.store(true, Ordering::Release);
                        let _ = write_half.shutdown().await;
                        manager.dispose_pair(tunnel, id);
                        break;
                    }
                }
            }
        });
    }

    async fn send_tunnel(&self, tunnel: TunnelId, frame: TunnelFrame) {
        let payload = AppPayload::Tunnel {
            client_port: tunnel.client_port,
            server_port: tunnel.server_port,
            frame,
        };
        self.send_app(tunnel.partner, &payload).await;
    }

    async fn send_app(&self, to: PeerId, payload: &AppPayload) {
        match encode(payload) {
            Ok(bytes) => self.inner.router.send(to, bytes).await,
            Err(e) => warn!(error = %e, "failed to encode proxy payload"),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerManager, StaticServerLink};
    use crate::routes::RouteTable;
    use std::time::Duration;
    use tokio::time::timeout;

    fn peer_id(seed: u8) -> PeerId {
        let mut bytes = [0u8; 16];
        bytes[15] = seed;
        PeerId::from_bytes(bytes)
    }

    fn test_manager() -> ProxyManager {
        let self_id = peer_id(1);
        let router = Router::new(
            self_id,
            Arc::new(PeerManager::new()),
            Arc::new(RouteTable::new(self_id)),
            Arc::new(StaticServerLink {
                connected: true,
                signed_in: true,
                user_id: self_id,
            }),
            CancellationToken::new(),
        );
        ProxyManager::new(router, CancellationToken::new())
    }

    #[tokio::test]
    async fn mapping_rejects_bound_port() {
        let manager = test_manager();
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = probe.local_addr().unwrap().port();

        let result = manager.add_mapping(peer_id(2), taken, 4000).await;
        assert!(result.is_err(), "binding an in-use port must fail");
    }

    #[tokio::test]
    async fn duplicate_mapping_rejected() {
        let manager = test_manager();
        manager.add_mapping(peer_id(2), 0, 4000).await.unwrap();
        let result = manager.add_mapping(peer_id(2), 0, 4000).await;
        assert!(result.is_err());
        assert!(manager.remove_mapping(peer_id(2), 4000));
    }

    async fn socket_pair() -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = TcpStream::connect(addr).await.unwrap();
        accept.await.unwrap();
        client
    }

    #[tokio::test]
    async fn duplicate_tunnel_disposes_previous_pair() {
        let manager = test_manager();
        let tunnel = TunnelId {
            partner: peer_id(2),
            client_port: 50000,
            server_port: 4000,
        };

        manager.create_pair(tunnel, socket_pair().await);
        assert_eq!(manager.active_tunnels(), 1);
        let first_id = manager
            .inner
            .proxies
            .lock()
            .unwrap()
            .get(&tunnel)
            .unwrap()
            .id;

        manager.create_pair(tunnel, socket_pair().await);
        assert_eq!(manager.active_tunnels(), 1);
        let second_id = manager
            .inner
            .proxies
            .lock()
            .unwrap()
            .get(&tunnel)
            .unwrap()
            .id;
        assert_ne!(first_id, second_id);
    }

    #[tokio::test]
    async fn inbound_shutdown_disposes_pair() {
        let manager = test_manager();
        let tunnel = TunnelId {
            partner: peer_id(2),
            client_port: 50001,
            server_port: 4000,
        };
        manager.create_pair(tunnel, socket_pair().await);
        assert!(manager.has_tunnel(&tunnel));

        manager
            .tunnel_frame(peer_id(2), 50001, 4000, TunnelFrame::Shutdown)
            .await;

        timeout(Duration::from_secs(2), async {
            while manager.has_tunnel(&tunnel) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pair was not disposed");
    }
}
