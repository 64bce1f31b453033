//! # Wire Protocol Messages
//!
//! This module defines all serializable message types used on overlay links.
//! Messages are serialized using bincode with size limits to prevent memory
//! exhaustion from hostile peers.
//!
//! ## Message Layering
//!
//! | Layer | Type | Carried by |
//! |-------|------|-----------|
//! | Link | [`WireMessage`] | framed TCP session (direct or relay) |
//! | Overlay | [`OverlayMessage`] | `TransDatagram.payload` |
//! | Application | [`AppPayload`] | `P2PPacket.payload` |
//!
//! A link session carries `TransDatagram`s (the reliable windowed stream)
//! plus the relay-only control messages (`HeartBeat`, link creation). Each
//! SYN datagram embeds one `OverlayMessage`; routed `P2PPacket`s in turn
//! embed one `AppPayload` for the proxy subsystem.
//!
//! ## Security Limits
//!
//! - `MAX_FRAME_SIZE`: maximum frame read off a socket
//! - All deserialization uses `decode_bounded()` with size limits

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::peer::PeerId;

/// Maximum size of a single framed message on a link session.
/// Tunnel data is chunked well below this; anything larger is hostile.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Maximum buffer size for deserialization.
/// Slightly larger than MAX_FRAME_SIZE to allow for enum tag overhead.
pub const MAX_DECODE_SIZE: u64 = (MAX_FRAME_SIZE as u64) + 1024;

/// Initial hop budget for routed packets and flooded link states.
pub const INITIAL_TTL: u8 = 32;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DECODE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw bincode::deserialize.
pub fn decode_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}


// ============================================================================
// Datagram flags
// ============================================================================

/// Flag bitmask carried by every [`TransDatagram`].
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatagramFlags(pub u8);

impl DatagramFlags {
    pub const SYN: DatagramFlags = DatagramFlags(0x01);
    pub const ACK: DatagramFlags = DatagramFlags(0x02);
    pub const FIRST_HANDSHAKE: DatagramFlags = DatagramFlags(0x04);
    pub const SECOND_HANDSHAKE: DatagramFlags = DatagramFlags(0x08);

    pub fn contains(self, other: DatagramFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: DatagramFlags) -> DatagramFlags {
        DatagramFlags(self.0 | other.0)
    }
}

impl std::fmt::Debug for DatagramFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::SYN) {
            names.push("SYN");
        }
        if self.contains(Self::ACK) {
            names.push("ACK");
        }
        if self.contains(Self::FIRST_HANDSHAKE) {
            names.push("FIRST_HANDSHAKE");
        }
        if self.contains(Self::SECOND_HANDSHAKE) {
            names.push("SECOND_HANDSHAKE");
        }
        write!(f, "{}", names.join("|"))
    }
}


// ============================================================================
// Link-level messages
// ============================================================================

/// One datagram of the sliding-window stream on a link.
///
/// `seq` indexes the sender's ring buffer. `relay_from` is stamped by a
/// relay when it forwards the datagram, so holders of a shared relay
/// session can demultiplex by originating peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransDatagram {
    pub flags: DatagramFlags,
    pub seq: u16,
    pub source: PeerId,
    pub destination: PeerId,
    pub relay_from: Option<PeerId>,
    pub payload: Option<Vec<u8>>,
}

impl TransDatagram {
    pub fn syn(seq: u16, source: PeerId, destination: PeerId, payload: Vec<u8>) -> Self {
        Self {
            flags: DatagramFlags::SYN,
            seq,
            source,
            destination,
            relay_from: None,
            payload: Some(payload),
        }
    }

    pub fn ack(seq: u16, source: PeerId, destination: PeerId) -> Self {
        Self {
            flags: DatagramFlags::ACK,
            seq,
            source,
            destination,
            relay_from: None,
            payload: None,
        }
    }

    pub fn handshake(flags: DatagramFlags, source: PeerId, destination: PeerId) -> Self {
        Self {
            flags,
            seq: 0,
            source,
            destination,
            relay_from: None,
            payload: None,
        }
    }
}

/// Everything a framed link session can carry.
///
/// Direct peer sessions only ever exchange `Datagram`; the relay variants
/// are used on pooled relay sessions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WireMessage {
    Datagram(TransDatagram),
    HeartBeat,
    /// Relay dial handshake: identify ourselves and the room we belong to.
    CreateRelayLink { user_id: PeerId, room_id: String },
    RelayLinkCreated { accepted: bool },
}


// ============================================================================
// Overlay messages (datagram payloads)
// ============================================================================

/// Hop-by-hop envelope around application data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct P2PPacket {
    pub from: PeerId,
    pub to: PeerId,
    pub ttl: u8,
    pub payload: Vec<u8>,
}

impl P2PPacket {
    pub fn new(from: PeerId, to: PeerId, payload: Vec<u8>) -> Self {
        Self { from, to, ttl: INITIAL_TTL, payload }
    }
}

/// A flooded link-state advertisement.
///
/// Shaped like [`crate::routes::LinkState`] plus the flooding hop budget.
/// A cost of `u32::MAX` encodes "link is down".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkStatePacket {
    pub source: PeerId,
    pub timestamp: u64,
    pub ttl: u8,
    pub interfaces: Vec<PeerId>,
    pub costs: Vec<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransmitError {
    Expired,
    NoRoute,
}

/// Returned to a packet's origin when forwarding fails.
///
/// Carries the original payload only when the failed packet was a
/// `P2PPacket`; expired link-state floods report bare.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransmitErrorPacket {
    pub error: TransmitError,
    pub from: PeerId,
    pub to: PeerId,
    pub original_to: PeerId,
    pub payload: Option<Vec<u8>>,
    pub ttl: u8,
}

/// One application message carried inside a SYN datagram.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OverlayMessage {
    /// Round-trip probe; answered immediately with `Pong`.
    Ping { seq: u16 },
    Pong { seq: u16 },
    P2P(P2PPacket),
    LinkState(LinkStatePacket),
    TransmitError(TransmitErrorPacket),
}

/// Discriminant of [`OverlayMessage`], used as handler-registry key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Pong,
    P2P,
    LinkState,
    TransmitError,
}

impl OverlayMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            OverlayMessage::Ping { .. } => MessageKind::Ping,
            OverlayMessage::Pong { .. } => MessageKind::Pong,
            OverlayMessage::P2P(_) => MessageKind::P2P,
            OverlayMessage::LinkState(_) => MessageKind::LinkState,
            OverlayMessage::TransmitError(_) => MessageKind::TransmitError,
        }
    }
}


// ============================================================================
// Application messages (P2P packet payloads)
// ============================================================================

/// Tunnel negotiation request/response, echoed back with `is_response`
/// flipped by the serving side.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConnectReq {
    pub is_response: bool,
    pub client_id: PeerId,
    pub client_real_port: u16,
    pub server_real_port: u16,
}

/// One chunk of a proxy tunnel byte stream, or its end.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TunnelFrame {
    Data(Vec<u8>),
    Shutdown,
}

/// Payload routed through the overlay for the proxy subsystem.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AppPayload {
    ProxyConnect(ProxyConnectReq),
    /// Tunnel traffic, keyed on the receiving side by (from-peer,
    /// client_port, server_port).
    Tunnel {
        client_port: u16,
        server_port: u16,
        frame: TunnelFrame,
    },
}
