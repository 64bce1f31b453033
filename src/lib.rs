//! # Overlan - Peer-to-Peer Overlay Client Core
//!
//! Overlan lets hosts behind NATs exchange application traffic as if they
//! shared a LAN. A rendezvous server (external to this crate) introduces
//! peers; from there the client keeps direct links where possible, falls
//! back to shared relays, discovers multi-hop paths through other peers,
//! and multiplexes TCP application connections over the overlay.
//!
//! ## Architecture
//!
//! Components communicate through cloneable handles and tokio channels;
//! each long-lived concern is a spawned task observing the process-wide
//! cancellation token:
//!
//! - The **router** probes every direct link, floods link states, and
//!   forwards packets hop-by-hop toward the minimum-latency next hop.
//! - A **connection** turns one link session into a reliable in-order
//!   stream using a SYN/ACK sliding window.
//! - The **relay pool** shares one TCP session per relay endpoint across
//!   all connections that need it, reference-counted with heartbeats.
//! - The **proxy manager** maps local TCP ports onto remote services and
//!   pipes accepted sockets through negotiated tunnels.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `peer` | Peer ids, the live peer collection, rendezvous interfaces |
//! | `messages` | Serialization types for all wire protocols |
//! | `session` | Length-prefixed framed TCP sessions |
//! | `connection` | Reliable windowed datagram stream over a session |
//! | `ping` | Round-trip probing on a connection |
//! | `routes` | Link-state storage and next-hop computation |
//! | `router` | Sweeps, flooding, hop-by-hop forwarding |
//! | `relay` | Pooled, reference-counted relay sessions |
//! | `supervisor` | Per-peer reconnection and latency tracking |
//! | `proxy` | Port mappings, tunnel negotiation, byte piping |

mod connection;
mod messages;
mod peer;
mod ping;
mod proxy;
mod relay;
mod router;
mod routes;
mod session;
mod supervisor;

pub use connection::{Connection, ConnectionState, Inbound, BUFFER_LENGTH};
pub use messages::{
    decode_bounded, encode, AppPayload, DatagramFlags, LinkStatePacket, MessageKind,
    OverlayMessage, P2PPacket, ProxyConnectReq, TransDatagram, TransmitError,
    TransmitErrorPacket, TunnelFrame, WireMessage, INITIAL_TTL, MAX_FRAME_SIZE,
};
pub use peer::{
    Peer, PeerEvent, PeerId, PeerManager, RoomInfo, ServerLink, StaticRoomInfo, StaticServerLink,
};
pub use ping::{PingChecker, PING_DEADLINE};
pub use proxy::{ProxyAcceptor, ProxyManager, TunnelId};
pub use relay::{RelayAttachment, RelayLink, RelayPool, HEARTBEAT_INTERVAL, LIVENESS_TIMEOUT};
pub use router::{Delivery, Router, SWEEP_INTERVAL};
pub use routes::{monotonic_ms, LinkState, RouteTable, LINK_DOWN};
pub use session::SessionHandle;
pub use supervisor::{PartnerEvent, PartnerSupervisor, RECONNECT_INTERVAL};
