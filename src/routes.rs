//! # Route Table
//!
//! Link-state storage and next-hop computation for the overlay router.
//!
//! Every peer periodically floods a [`LinkState`]: the cost in milliseconds
//! to each of its direct interfaces. The table keeps the most recent state
//! per source (by the source's own monotonic timestamp) and eagerly
//! recomputes a single-source shortest-path tree rooted at the local peer
//! on every accepted update.
//!
//! ## Invariants
//!
//! - For a fixed source, the stored timestamp never decreases.
//! - `|interfaces| == |costs|` for every stored state.
//! - A direct interface of the local peer is always its own next hop.
//! - A cost of [`LINK_DOWN`] excludes the edge from the graph.
//!
//! Writers are serialized by an `RwLock`; readers observe a consistent
//! snapshot and never a torn graph.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{OnceLock, RwLock};
use std::time::Instant;

use tracing::{debug, trace};

use crate::messages::LinkStatePacket;
use crate::peer::PeerId;

/// Cost value encoding "link is down".
pub const LINK_DOWN: u32 = u32::MAX;

/// Milliseconds on the process-local monotonic clock.
///
/// Link-state timestamps are only ever compared against other timestamps
/// from the same source, so clocks never need to agree across hosts.
pub fn monotonic_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Most recent link-state advertisement from one source.
#[derive(Clone, Debug)]
pub struct LinkState {
    pub source: PeerId,
    pub timestamp: u64,
    pub interfaces: Vec<PeerId>,
    pub costs: Vec<u32>,
}

impl LinkState {
    pub fn new(source: PeerId, interfaces: Vec<PeerId>, costs: Vec<u32>) -> Self {
        debug_assert_eq!(interfaces.len(), costs.len());
        Self {
            source,
            timestamp: monotonic_ms(),
            interfaces,
            costs,
        }
    }

    pub fn into_packet(self, ttl: u8) -> LinkStatePacket {
        LinkStatePacket {
            source: self.source,
            timestamp: self.timestamp,
            ttl,
            interfaces: self.interfaces,
            costs: self.costs,
        }
    }
}

impl From<LinkStatePacket> for LinkState {
    fn from(packet: LinkStatePacket) -> Self {
        Self {
            source: packet.source,
            timestamp: packet.timestamp,
            interfaces: packet.interfaces,
            costs: packet.costs,
        }
    }
}

#[derive(Default)]
struct TableInner {
    /// Latest accepted state per source.
    states: HashMap<PeerId, LinkState>,
    /// Seeded routes for destinations no link state has described yet.
    forced: HashMap<PeerId, PeerId>,
    /// Computed next hop per destination.
    next_hop: HashMap<PeerId, PeerId>,
}

/// Link-state database plus the shortest-path tree derived from it.
pub struct RouteTable {
    local: PeerId,
    inner: RwLock<TableInner>,
}

impl RouteTable {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            inner: RwLock::new(TableInner::default()),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local
    }

    /// Apply a link state. Returns true when it was newer than what was
    /// stored (or the source was unknown) and the route tree was rebuilt.
    pub fn update(&self, state: LinkState) -> bool {
        if state.interfaces.len() != state.costs.len() {
            debug!(source = ?state.source, "rejecting malformed link state");
            return false;
        }
        let mut inner = self.inner.write().expect("route table poisoned");
        if let Some(existing) = inner.states.get(&state.source) {
            if state.timestamp <= existing.timestamp {
                trace!(
                    source = ?state.source,
                    stored = existing.timestamp,
                    received = state.timestamp,
                    "stale link state discarded"
                );
                return false;
            }
        }
        trace!(source = ?state.source, timestamp = state.timestamp, "link state accepted");
        inner.states.insert(state.source, state);
        Self::recompute(self.local, &mut inner);
        true
    }

    /// The local peer's own most recent link state, if one was applied.
    pub fn self_link_state(&self) -> Option<LinkState> {
        self.inner
            .read()
            .expect("route table poisoned")
            .states
            .get(&self.local)
            .cloned()
    }

    /// Next hop toward `dest`, or `None` when no path is known.
    pub fn forward_interface(&self, dest: PeerId) -> Option<PeerId> {
        self.inner
            .read()
            .expect("route table poisoned")
            .next_hop
            .get(&dest)
            .copied()
    }

    /// Seed `next_hop(dest) = via` ahead of any link state mentioning
    /// `dest`. Computed routes take precedence once they exist.
    pub fn force_add(&self, dest: PeerId, via: PeerId) {
        let mut inner = self.inner.write().expect("route table poisoned");
        inner.forced.insert(dest, via);
        Self::recompute(self.local, &mut inner);
    }

    /// Drop a seeded route (its peer is gone).
    pub fn clear_forced(&self, dest: PeerId) {
        let mut inner = self.inner.write().expect("route table poisoned");
        if inner.forced.remove(&dest).is_some() {
            Self::recompute(self.local, &mut inner);
        }
    }

    /// Number of known destinations, for diagnostics.
    pub fn known_destinations(&self) -> usize {
        self.inner.read().expect("route table poisoned").next_hop.len()
    }

    /// Dijkstra over the union of stored link states, rooted at the local
    /// peer. Edge weights are advertised costs; `LINK_DOWN` edges are
    /// excluded; equal-cost candidates resolve to the lower first-hop id.
    fn recompute(local: PeerId, inner: &mut TableInner) {
        let mut dist: HashMap<PeerId, u64> = HashMap::new();
        let mut first_hop: HashMap<PeerId, PeerId> = HashMap::new();
        let mut heap: BinaryHeap<Reverse<(u64, PeerId)>> = BinaryHeap::new();

        dist.insert(local, 0);
        heap.push(Reverse((0, local)));

        while let Some(Reverse((cost, node))) = heap.pop() {
            if dist.get(&node).copied().unwrap_or(u64::MAX) < cost {
                continue;
            }
            let Some(state) = inner.states.get(&node) else {
                continue;
            };
            for (interface, &edge_cost) in state.interfaces.iter().zip(&state.costs) {
                if edge_cost == LINK_DOWN {
                    continue;
                }
                let next_cost = cost + edge_cost as u64;
                let hop = if node == local {
                    *interface
                } else {
                    // Inherit the first hop that reached this node.
                    match first_hop.get(&node) {
                        Some(hop) => *hop,
                        None => continue,
                    }
                };
                let current = dist.get(interface).copied().unwrap_or(u64::MAX);
                if next_cost < current {
                    dist.insert(*interface, next_cost);
                    first_hop.insert(*interface, hop);
                    heap.push(Reverse((next_cost, *interface)));
                } else if next_cost == current
                    && first_hop.get(interface).is_some_and(|existing| hop < *existing)
                {
                    first_hop.insert(*interface, hop);
                }
            }
        }

        first_hop.remove(&local);
        let mut next_hop = first_hop;

        // A live direct interface is always its own next hop, whatever a
        // multi-hop path costs.
        if let Some(own) = inner.states.get(&local) {
            for (interface, &cost) in own.interfaces.iter().zip(&own.costs) {
                if cost != LINK_DOWN {
                    next_hop.insert(*interface, *interface);
                }
            }
        }

        // Seeds fill destinations the graph cannot reach yet.
        for (dest, via) in &inner.forced {
            next_hop.entry(*dest).or_insert(*via);
        }

        trace!(destinations = next_hop.len(), "route tree rebuilt");
        inner.next_hop = next_hop;
    }
}
