//! Link-state routing table and shortest path computation.

use mesh_wire::PeerId;
use std::collections::BTreeMap;

/// How a destination is currently reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteInfo {
    /// First peer after the local peer on the shortest path. For a direct
    /// neighbor this is the neighbor itself.
    pub next_hop: PeerId,
    /// Total path cost
    pub cost: u32,
}

impl RouteInfo {
    /// Create a new route
    pub fn new(next_hop: PeerId, cost: u32) -> Self {
        Self { next_hop, cost }
    }
}

/// A destination whose next hop or cost changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteChange {
    /// Destination peer
    pub destination: PeerId,
    /// Route before the mutation
    pub old: RouteInfo,
    /// Route after the mutation
    pub new: RouteInfo,
}

impl RouteChange {
    /// Whether the new route is cheaper than the old one
    pub fn is_improvement(&self) -> bool {
        self.new.cost < self.old.cost
    }
}

/// Differences produced by a single table mutation.
///
/// Every destination whose reachability, next hop or cost changed appears in
/// exactly one of the three lists. Lists are ordered by peer identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTableChange {
    /// Destinations that had no route before
    pub now_reachable: Vec<(PeerId, RouteInfo)>,
    /// Destinations that lost their route
    pub now_unreachable: Vec<PeerId>,
    /// Destinations whose next hop or cost changed
    pub route_changed: Vec<RouteChange>,
}

impl RoutingTableChange {
    /// Whether the mutation changed no route
    pub fn is_empty(&self) -> bool {
        self.now_reachable.is_empty()
            && self.now_unreachable.is_empty()
            && self.route_changed.is_empty()
    }

    /// Number of affected destinations
    pub fn len(&self) -> usize {
        self.now_reachable.len() + self.now_unreachable.len() + self.route_changed.len()
    }
}

/// Link-state routing table.
///
/// Holds a directed, edge-weighted graph of peers. Edges leaving the local
/// peer come from neighbor discovery; edges leaving any other peer come from
/// that peer's latest link-state advertisement and are replaced wholesale on
/// each update.
#[derive(Debug, Clone)]
pub struct LinkStateRoutingTable {
    /// Local peer, the root of every shortest path
    local_id: PeerId,
    /// Outgoing edges per peer
    graph: BTreeMap<PeerId, BTreeMap<PeerId, u32>>,
    /// Shortest routes from the local peer
    routes: BTreeMap<PeerId, RouteInfo>,
}

mod hop_tree;
mod paths;
