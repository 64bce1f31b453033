//! # Reliable Windowed Connections
//!
//! A [`Connection`] turns a link session (direct peer TCP, or a pooled
//! relay session) into one reliable, in-order stream of overlay messages
//! using a SYN/ACK sliding-window datagram protocol.
//!
//! ## Window
//!
//! Every connection owns a fixed ring of [`BUFFER_LENGTH`] send slots with
//! per-slot acknowledged bits, a send pointer (next seq to assign) and an
//! ack pointer (oldest unacknowledged seq). Sequence numbers are wrapping
//! `u16`; `BUFFER_LENGTH` is a power of two so slot lookup is a bitmask.
//! The ack pointer only advances over the contiguous acknowledged prefix;
//! a gap stalls the window until its ACK (or a retransmit's) arrives.
//!
//! ## Handshake
//!
//! ```text
//! initiator                responder
//!     │── FIRST_HANDSHAKE ────►│  state → Connected
//!     │◄─── SECOND_HANDSHAKE ──│
//! state → Connected
//! ```
//!
//! ## Retransmission
//!
//! Slots retain the encoded payload; a periodic tick resends unacked SYNs
//! older than an RTT-derived bound. Receivers remember the last seq
//! dispatched per ring slot and re-ACK duplicates without re-dispatching,
//! so upper layers observe each message exactly once, in receive order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::messages::{
    decode_bounded, encode, DatagramFlags, MessageKind, OverlayMessage, TransDatagram,
    WireMessage,
};
use crate::peer::{PeerId, RoomInfo};
use crate::relay::{RelayLink, RelayPool};
use crate::session::SessionHandle;

/// Send ring capacity. Power of two: seq-to-slot mapping is a bitmask.
pub const BUFFER_LENGTH: usize = 1024;

const RING_MASK: u16 = (BUFFER_LENGTH - 1) as u16;

/// Handshake completion deadline.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Retransmission scan period.
const RETRANSMIT_TICK: Duration = Duration::from_millis(500);

/// Bounds on the RTT-derived retransmission age.
const RETRANSMIT_MIN: Duration = Duration::from_millis(200);
const RETRANSMIT_MAX: Duration = Duration::from_secs(3);

/// EMA smoothing for RTT samples (higher = more smoothing of history).
const RTT_EMA_OLD: f32 = 0.8;
const RTT_EMA_NEW: f32 = 0.2;

/// Per-kind handler queue depth. Sized to the window so a full in-flight
/// burst cannot overflow a draining consumer.
const HANDLER_CAPACITY: usize = BUFFER_LENGTH;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Connected,
}

/// One decoded overlay message delivered to a registered handler.
#[derive(Debug)]
pub struct Inbound {
    pub from: PeerId,
    /// Session the datagram arrived on; the router's split horizon.
    pub session: u64,
    pub message: OverlayMessage,
}

struct Slot {
    seq: u16,
    acked: bool,
    payload: Option<Vec<u8>>,
    sent_at: Instant,
}

impl Slot {
    fn empty() -> Self {
        Self {
            seq: 0,
            acked: false,
            payload: None,
            sent_at: Instant::now(),
        }
    }
}

struct Ring {
    slots: Vec<Slot>,
    send_ptr: u16,
    ack_ptr: u16,
}

impl Ring {
    fn new() -> Self {
        Self {
            slots: (0..BUFFER_LENGTH).map(|_| Slot::empty()).collect(),
            send_ptr: 0,
            ack_ptr: 0,
        }
    }

    fn in_flight(&self) -> u16 {
        self.send_ptr.wrapping_sub(self.ack_ptr)
    }

    /// Allocate the next seq if the window has room.
    fn try_assign(&mut self, payload: Vec<u8>) -> Option<u16> {
        if usize::from(self.in_flight()) >= BUFFER_LENGTH {
            return None;
        }
        let seq = self.send_ptr;
        let slot = &mut self.slots[usize::from(seq & RING_MASK)];
        slot.seq = seq;
        slot.acked = false;
        slot.payload = Some(payload);
        slot.sent_at = Instant::now();
        self.send_ptr = self.send_ptr.wrapping_add(1);
        Some(seq)
    }

    /// Mark `seq` acknowledged if it is in flight. Returns the slot's age
    /// (an RTT sample) on the first acknowledgement, then advances the
    /// contiguous prefix. Second return is whether the pointer moved.
    fn acknowledge(&mut self, seq: u16) -> (Option<Duration>, bool) {
        let offset = seq.wrapping_sub(self.ack_ptr);
        if offset >= self.in_flight() {
            return (None, false);
        }
        let slot = &mut self.slots[usize::from(seq & RING_MASK)];
        let mut sample = None;
        if slot.seq == seq && !slot.acked {
            slot.acked = true;
            sample = Some(slot.sent_at.elapsed());
        }

        let mut advanced = false;
        while self.ack_ptr != self.send_ptr {
            let idx = usize::from(self.ack_ptr & RING_MASK);
            if !(self.slots[idx].acked && self.slots[idx].seq == self.ack_ptr) {
                break;
            }
            self.slots[idx].acked = false;
            self.slots[idx].payload = None;
            self.ack_ptr = self.ack_ptr.wrapping_add(1);
            advanced = true;
        }
        (sample, advanced)
    }

    /// Unacked in-flight datagrams older than `bound`, with send times reset.
    fn overdue(&mut self, bound: Duration) -> Vec<(u16, Vec<u8>)> {
        let now = Instant::now();
        let mut due = Vec::new();
        let mut seq = self.ack_ptr;
        while seq != self.send_ptr {
            let slot = &mut self.slots[usize::from(seq & RING_MASK)];
            if slot.seq == seq && !slot.acked {
                if let Some(payload) = &slot.payload {
                    if now.duration_since(slot.sent_at) > bound {
                        slot.sent_at = now;
                        due.push((seq, payload.clone()));
                    }
                }
            }
            seq = seq.wrapping_add(1);
        }
        due
    }
}

/// The transport currently under a connection.
#[derive(Clone)]
enum Link {
    Direct(SessionHandle),
    Relay(RelayLink),
}

impl Link {
    async fn send_datagram(&self, datagram: TransDatagram) -> Result<()> {
        match self {
            Link::Direct(session) => session.send(WireMessage::Datagram(datagram)).await,
            Link::Relay(link) => link.send(WireMessage::Datagram(datagram)).await,
        }
    }

    fn session_id(&self) -> u64 {
        match self {
            Link::Direct(session) => session.id(),
            Link::Relay(link) => link.session_id(),
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            Link::Direct(session) => session.is_closed(),
            Link::Relay(link) => link.is_closed(),
        }
    }
}

enum LinkConfig {
    Direct,
    Relay {
        pool: RelayPool,
        endpoint: SocketAddr,
        room: Arc<dyn RoomInfo>,
    },
}

struct ConnectionInner {
    local: PeerId,
    remote: PeerId,
    config: LinkConfig,
    state: Mutex<ConnectionState>,
    link: RwLock<Option<Link>>,
    ring: Mutex<Ring>,
    /// Signaled on every ack-pointer advance; senders waiting for window
    /// space park here.
    space: Notify,
    /// Last seq dispatched per receive slot, for duplicate suppression.
    recv_seen: Mutex<Vec<Option<u16>>>,
    handlers: RwLock<HashMap<MessageKind, mpsc::Sender<Inbound>>>,
    pong_waiters: Mutex<HashMap<u16, oneshot::Sender<()>>>,
    probe_seq: AtomicU16,
    /// Smoothed RTT in milliseconds; 0 until the first sample.
    srtt_ms: AtomicU32,
    last_ack: Mutex<Option<Instant>>,
    /// Whether this connection currently holds a relay pool refcount.
    relay_bound: AtomicBool,
    cancel: CancellationToken,
}

/// Reliable in-order message stream over one link. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.inner.local)
            .field("remote", &self.inner.remote)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Wrap a direct peer session produced by the NAT traversal
    /// collaborator.
    pub fn direct(
        local: PeerId,
        remote: PeerId,
        session: SessionHandle,
        inbound: mpsc::Receiver<WireMessage>,
    ) -> Self {
        let conn = Self::build(local, remote, LinkConfig::Direct);
        *conn.inner.link.write().expect("link lock poisoned") = Some(Link::Direct(session));
        conn.spawn_direct_pump(inbound);
        conn.spawn_retransmit();
        conn
    }

    /// A connection that reaches `remote` through a shared relay session.
    /// No I/O happens until [`Connection::connect`]; the room is read from
    /// the collaborator at dial time.
    pub fn relay(
        local: PeerId,
        remote: PeerId,
        pool: RelayPool,
        endpoint: SocketAddr,
        room: Arc<dyn RoomInfo>,
    ) -> Self {
        let conn = Self::build(local, remote, LinkConfig::Relay { pool, endpoint, room });
        conn.spawn_retransmit();
        conn
    }

    fn build(local: PeerId, remote: PeerId, config: LinkConfig) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                local,
                remote,
                config,
                state: Mutex::new(ConnectionState::Disconnected),
                link: RwLock::new(None),
                ring: Mutex::new(Ring::new()),
                space: Notify::new(),
                recv_seen: Mutex::new(vec![None; BUFFER_LENGTH]),
                handlers: RwLock::new(HashMap::new()),
                pong_waiters: Mutex::new(HashMap::new()),
                probe_seq: AtomicU16::new(0),
                srtt_ms: AtomicU32::new(0),
                last_ack: Mutex::new(None),
                relay_bound: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// A connection with no transport behind it, for assembling peers in
    /// unit tests.
    #[cfg(test)]
    pub(crate) fn loopback_for_tests(local: PeerId, remote: PeerId) -> Self {
        Self::build(local, remote, LinkConfig::Direct)
    }

    pub fn local_id(&self) -> PeerId {
        self.inner.local
    }

    pub fn remote_id(&self) -> PeerId {
        self.inner.remote
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().expect("state lock poisoned")
    }

    /// Identity of the session currently under this connection.
    pub fn session_id(&self) -> Option<u64> {
        self.inner
            .link
            .read()
            .expect("link lock poisoned")
            .as_ref()
            .map(Link::session_id)
    }

    pub fn srtt_ms(&self) -> u32 {
        self.inner.srtt_ms.load(Ordering::Relaxed)
    }

    pub fn last_ack_age(&self) -> Option<Duration> {
        self.inner
            .last_ack
            .lock()
            .expect("ack time lock poisoned")
            .map(|at| at.elapsed())
    }

    /// `(ack_ptr, send_ptr)`, for diagnostics.
    pub fn window_pointers(&self) -> (u16, u16) {
        let ring = self.inner.ring.lock().expect("ring lock poisoned");
        (ring.ack_ptr, ring.send_ptr)
    }

    pub fn in_flight(&self) -> u16 {
        self.inner.ring.lock().expect("ring lock poisoned").in_flight()
    }

    /// Route decoded messages of `kind` to `tx`. Installing twice for the
    /// same kind replaces the previous handler.
    pub fn register_handler(&self, kind: MessageKind, tx: mpsc::Sender<Inbound>) {
        self.inner
            .handlers
            .write()
            .expect("handler lock poisoned")
            .insert(kind, tx);
    }

    pub fn remove_handler(&self, kind: MessageKind) {
        self.inner
            .handlers
            .write()
            .expect("handler lock poisoned")
            .remove(&kind);
    }

    /// Standard per-kind handler channel.
    pub fn handler_channel() -> (mpsc::Sender<Inbound>, mpsc::Receiver<Inbound>) {
        mpsc::channel(HANDLER_CAPACITY)
    }

    // ------------------------------------------------------------------
    // Ping plumbing (used by PingChecker)
    // ------------------------------------------------------------------

    pub(crate) fn next_probe_seq(&self) -> u16 {
        self.inner.probe_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_pong(&self, seq: u16) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .pong_waiters
            .lock()
            .expect("pong lock poisoned")
            .insert(seq, tx);
        rx
    }

    pub(crate) fn cancel_pong(&self, seq: u16) {
        self.inner
            .pong_waiters
            .lock()
            .expect("pong lock poisoned")
            .remove(&seq);
    }

    pub fn record_rtt(&self, sample_ms: u32) {
        let prev = self.inner.srtt_ms.load(Ordering::Relaxed);
        let next = if prev == 0 {
            sample_ms
        } else {
            (prev as f32 * RTT_EMA_OLD + sample_ms as f32 * RTT_EMA_NEW) as u32
        };
        self.inner.srtt_ms.store(next.max(1), Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Bring the connection to `Connected`: for relay links, acquire (or
    /// reuse) the pooled session first; then run the datagram handshake.
    /// Returns false when the underlying link cannot be established.
    pub async fn connect(&self) -> bool {
        if self.state() == ConnectionState::Connected {
            return true;
        }

        match &self.inner.config {
            LinkConfig::Direct => {
                let alive = self
                    .inner
                    .link
                    .read()
                    .expect("link lock poisoned")
                    .as_ref()
                    .is_some_and(|l| !l.is_closed());
                if !alive {
                    debug!(peer = ?self.inner.remote, "direct session gone, cannot connect");
                    return false;
                }
            }
            LinkConfig::Relay { pool, endpoint, room } => {
                let alive = self
                    .inner
                    .link
                    .read()
                    .expect("link lock poisoned")
                    .as_ref()
                    .is_some_and(|l| !l.is_closed());
                if !alive {
                    if self.inner.relay_bound.swap(false, Ordering::AcqRel) {
                        pool.disconnect(*endpoint).await;
                    }
                    let attachment = match pool
                        .connect(*endpoint, self.inner.local, room.room_id())
                        .await
                    {
                        Ok(attachment) => attachment,
                        Err(e) => {
                            debug!(relay = %endpoint, error = %e, "relay dial failed");
                            return false;
                        }
                    };
                    self.inner.relay_bound.store(true, Ordering::Release);
                    let link = RelayLink::new(*endpoint, attachment.session);
                    *self.inner.link.write().expect("link lock poisoned") =
                        Some(Link::Relay(link));
                    self.spawn_relay_pump(attachment.datagrams);
                }
            }
        }

        self.handshake().await
    }

    async fn handshake(&self) -> bool {
        {
            let mut state = self.inner.state.lock().expect("state lock poisoned");
            if *state == ConnectionState::Connected {
                return true;
            }
            *state = ConnectionState::Handshaking;
        }

        let datagram = TransDatagram::handshake(
            DatagramFlags::FIRST_HANDSHAKE,
            self.inner.local,
            self.inner.remote,
        );
        if let Err(e) = self.send_raw(datagram).await {
            debug!(peer = ?self.inner.remote, error = %e, "handshake send failed");
            *self.inner.state.lock().expect("state lock poisoned") =
                ConnectionState::Disconnected;
            return false;
        }

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        while Instant::now() < deadline {
            if self.state() == ConnectionState::Connected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        debug!(peer = ?self.inner.remote, "handshake timed out");
        *self.inner.state.lock().expect("state lock poisoned") = ConnectionState::Disconnected;
        false
    }

    /// Drop to `Disconnected`. A relay-backed connection releases its pool
    /// reference; the shared session lives on for other holders.
    pub async fn disconnect(&self) {
        *self.inner.state.lock().expect("state lock poisoned") = ConnectionState::Disconnected;
        if let LinkConfig::Relay { pool, endpoint, .. } = &self.inner.config {
            if self.inner.relay_bound.swap(false, Ordering::AcqRel) {
                *self.inner.link.write().expect("link lock poisoned") = None;
                pool.disconnect(*endpoint).await;
            }
        }
    }

    /// Stop background tasks. Used on teardown paths in embedders/tests.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send one overlay message through the window. Waits for ring space
    /// when the window is full; drops (with a log) when the link is not
    /// ready, matching the contract that send errors never propagate.
    pub async fn send(&self, message: OverlayMessage) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            debug!(peer = ?self.inner.remote, "link not ready, dropping message");
            return Ok(());
        }
        let payload = encode(&message)?;

        let seq = loop {
            let notified = self.inner.space.notified();
            {
                let mut ring = self.inner.ring.lock().expect("ring lock poisoned");
                if let Some(seq) = ring.try_assign(payload.clone()) {
                    break seq;
                }
            }
            trace!(peer = ?self.inner.remote, "send window full, waiting");
            notified.await;
        };

        let datagram = TransDatagram::syn(seq, self.inner.local, self.inner.remote, payload);
        if let Err(e) = self.send_raw(datagram).await {
            // The slot stays in flight; the retransmit tick retries it.
            debug!(peer = ?self.inner.remote, seq, error = %e, "datagram send failed");
        }
        Ok(())
    }

    async fn send_raw(&self, datagram: TransDatagram) -> Result<()> {
        let link = self
            .inner
            .link
            .read()
            .expect("link lock poisoned")
            .clone();
        match link {
            Some(link) => link.send_datagram(datagram).await,
            None => anyhow::bail!("no link"),
        }
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    async fn handle_datagram(&self, datagram: TransDatagram) {
        if datagram.flags.contains(DatagramFlags::FIRST_HANDSHAKE) {
            let reply = TransDatagram::handshake(
                DatagramFlags::SECOND_HANDSHAKE,
                self.inner.local,
                self.inner.remote,
            );
            *self.inner.state.lock().expect("state lock poisoned") = ConnectionState::Connected;
            if let Err(e) = self.send_raw(reply).await {
                debug!(peer = ?self.inner.remote, error = %e, "handshake reply failed");
            }
            return;
        }
        if datagram.flags.contains(DatagramFlags::SECOND_HANDSHAKE) {
            *self.inner.state.lock().expect("state lock poisoned") = ConnectionState::Connected;
            return;
        }

        if datagram.flags.contains(DatagramFlags::ACK) {
            self.handle_ack(datagram.seq);
            return;
        }

        if datagram.flags.contains(DatagramFlags::SYN) {
            self.handle_syn(datagram).await;
        }
    }

    fn handle_ack(&self, seq: u16) {
        let (sample, advanced) = {
            let mut ring = self.inner.ring.lock().expect("ring lock poisoned");
            ring.acknowledge(seq)
        };
        if let Some(rtt) = sample {
            self.record_rtt((rtt.as_millis().max(1)) as u32);
        }
        if advanced {
            *self.inner.last_ack.lock().expect("ack time lock poisoned") = Some(Instant::now());
            self.inner.space.notify_waiters();
        }
    }

    async fn handle_syn(&self, datagram: TransDatagram) {
        let seq = datagram.seq;
        let Some(payload) = datagram.payload else {
            warn!(peer = ?self.inner.remote, seq, "SYN without payload dropped");
            return;
        };

        let duplicate = {
            let seen = self.inner.recv_seen.lock().expect("recv lock poisoned");
            seen[usize::from(seq & RING_MASK)] == Some(seq)
        };

        if !duplicate {
            let message: OverlayMessage = match decode_bounded(&payload) {
                Ok(message) => message,
                Err(e) => {
                    // Malformed payloads are not acknowledged, and the seq
                    // stays unseen so a clean retransmit can still land.
                    warn!(peer = ?self.inner.remote, seq, error = %e, "undecodable datagram dropped");
                    return;
                }
            };
            self.inner.recv_seen.lock().expect("recv lock poisoned")[usize::from(seq & RING_MASK)] =
                Some(seq);
            self.dispatch(message).await;
        }

        let ack = TransDatagram::ack(seq, self.inner.local, self.inner.remote);
        if let Err(e) = self.send_raw(ack).await {
            debug!(peer = ?self.inner.remote, seq, error = %e, "ack send failed");
        }
    }

    async fn dispatch(&self, message: OverlayMessage) {
        match message {
            OverlayMessage::Ping { seq } => {
                // Answer off the receive path; a full window must not stall
                // ACK processing.
                let conn = self.clone();
                tokio::spawn(async move {
                    let _ = conn.send(OverlayMessage::Pong { seq }).await;
                });
            }
            OverlayMessage::Pong { seq } => {
                let waiter = self
                    .inner
                    .pong_waiters
                    .lock()
                    .expect("pong lock poisoned")
                    .remove(&seq);
                if let Some(tx) = waiter {
                    let _ = tx.send(());
                }
            }
            other => {
                let kind = other.kind();
                let handler = self
                    .inner
                    .handlers
                    .read()
                    .expect("handler lock poisoned")
                    .get(&kind)
                    .cloned();
                let Some(tx) = handler else {
                    trace!(peer = ?self.inner.remote, ?kind, "no handler installed, dropping");
                    return;
                };
                let inbound = Inbound {
                    from: self.inner.remote,
                    session: self.session_id().unwrap_or(0),
                    message: other,
                };
                if tx.try_send(inbound).is_err() {
                    warn!(peer = ?self.inner.remote, ?kind, "handler queue full, dropping");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    fn spawn_direct_pump(&self, mut inbound: mpsc::Receiver<WireMessage>) {
        let conn = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = conn.inner.cancel.cancelled() => break,
                    message = inbound.recv() => match message {
                        Some(WireMessage::Datagram(d)) => conn.handle_datagram(d).await,
                        Some(other) => {
                            trace!(peer = ?conn.inner.remote, ?other, "non-datagram on direct link");
                        }
                        None => break,
                    },
                }
            }
            debug!(peer = ?conn.inner.remote, "direct link closed");
            *conn.inner.state.lock().expect("state lock poisoned") =
                ConnectionState::Disconnected;
        });
    }

    fn spawn_relay_pump(&self, mut datagrams: tokio::sync::broadcast::Receiver<TransDatagram>) {
        let conn = self.clone();
        let pump_session = self.session_id();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = conn.inner.cancel.cancelled() => break,
                    received = datagrams.recv() => match received {
                        Ok(d) => {
                            // The shared session fans out to every holder;
                            // keep only traffic from our logical peer.
                            if let Some(relay_from) = d.relay_from {
                                if relay_from != conn.inner.remote {
                                    continue;
                                }
                            }
                            if d.destination != conn.inner.local {
                                continue;
                            }
                            conn.handle_datagram(d).await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(peer = ?conn.inner.remote, skipped, "relay fan-out lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            // A reconnect may already have swapped a fresh session in; a
            // stale pump exiting must not mark that one down.
            if conn.session_id() == pump_session {
                debug!(peer = ?conn.inner.remote, "relay link closed");
                *conn.inner.state.lock().expect("state lock poisoned") =
                    ConnectionState::Disconnected;
            }
        });
    }

    fn spawn_retransmit(&self) {
        let conn = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RETRANSMIT_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = conn.inner.cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                if conn.state() != ConnectionState::Connected {
                    continue;
                }
                let srtt = conn.srtt_ms();
                let bound = Duration::from_millis(u64::from(srtt) * 2)
                    .clamp(RETRANSMIT_MIN, RETRANSMIT_MAX);
                let due = {
                    let mut ring = conn.inner.ring.lock().expect("ring lock poisoned");
                    ring.overdue(bound)
                };
                for (seq, payload) in due {
                    trace!(peer = ?conn.inner.remote, seq, "retransmitting");
                    let datagram =
                        TransDatagram::syn(seq, conn.inner.local, conn.inner.remote, payload);
                    if let Err(e) = conn.send_raw(datagram).await {
                        debug!(peer = ?conn.inner.remote, seq, error = %e, "retransmit failed");
                        break;
                    }
                }
            }
        });
    }
}
