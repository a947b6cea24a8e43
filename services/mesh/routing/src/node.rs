//! Remote peers known to the router.

use crate::discovery::ModuleId;
use mesh_session::{Address, ConnectionHandle};
use mesh_topology::RouteInfo;
use mesh_wire::PeerId;
use serde::Serialize;
use std::sync::Arc;

/// An address together with the discovery module that reported it
#[derive(Debug, Clone)]
pub struct NodeAddress {
    /// Reporting module
    pub module: ModuleId,
    /// The endpoint
    pub address: Arc<dyn Address>,
}

/// A remote peer.
///
/// Nodes are owned by the router and are never removed; a peer that goes
/// away only becomes unreachable.
#[derive(Debug)]
pub struct Node {
    identifier: PeerId,
    name: Option<String>,
    addresses: Vec<NodeAddress>,
    reachable_via: Option<RouteInfo>,
    routing_connection: Option<ConnectionHandle>,
    link_cost: Option<u32>,
    connecting: bool,
}

impl Node {
    /// Create an unreachable node without addresses
    pub fn new(identifier: PeerId) -> Self {
        Self {
            identifier,
            name: None,
            addresses: Vec::new(),
            reachable_via: None,
            routing_connection: None,
            link_cost: None,
            connecting: false,
        }
    }

    /// Peer identifier
    pub fn identifier(&self) -> PeerId {
        self.identifier
    }

    /// Name from the peer's last link handshake
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn set_name(&mut self, name: String) {
        if !name.is_empty() {
            self.name = Some(name);
        }
    }

    /// Known direct addresses
    pub fn addresses(&self) -> &[NodeAddress] {
        &self.addresses
    }

    /// Cheapest known direct address
    pub fn best_address(&self) -> Option<Arc<dyn Address>> {
        self.addresses
            .iter()
            .min_by_key(|entry| entry.address.cost())
            .map(|entry| entry.address.clone())
    }

    /// Add an address, replacing one with the same key
    pub(crate) fn add_address(&mut self, module: ModuleId, address: Arc<dyn Address>) {
        let key = address.key();
        self.addresses.retain(|entry| entry.address.key() != key);
        self.addresses.push(NodeAddress { module, address });
    }

    /// Remove an address by key; returns whether it was known
    pub(crate) fn remove_address(&mut self, key: &str) -> bool {
        let before = self.addresses.len();
        self.addresses.retain(|entry| entry.address.key() != key);
        self.addresses.len() != before
    }

    /// Remove every address reported by a module
    pub(crate) fn remove_module_addresses(&mut self, module: ModuleId) -> bool {
        let before = self.addresses.len();
        self.addresses.retain(|entry| entry.module != module);
        self.addresses.len() != before
    }

    /// Current route, if reachable
    pub fn reachable_via(&self) -> Option<RouteInfo> {
        self.reachable_via
    }

    pub(crate) fn set_reachable_via(&mut self, route: Option<RouteInfo>) {
        self.reachable_via = route;
    }

    /// Whether the shortest route is the direct link
    pub fn is_neighbor(&self) -> bool {
        self.reachable_via
            .map_or(false, |route| route.next_hop == self.identifier)
    }

    /// Open control connection, present only for neighbors
    pub fn routing_connection(&self) -> Option<&ConnectionHandle> {
        self.routing_connection.as_ref()
    }

    pub(crate) fn set_routing_connection(&mut self, handle: Option<ConnectionHandle>) {
        self.routing_connection = handle;
    }

    /// Cost of the direct link, while a routing connection exists
    pub fn link_cost(&self) -> Option<u32> {
        self.link_cost
    }

    pub(crate) fn set_link_cost(&mut self, cost: Option<u32>) {
        self.link_cost = cost;
    }

    pub(crate) fn is_connecting(&self) -> bool {
        self.connecting
    }

    pub(crate) fn set_connecting(&mut self, connecting: bool) {
        self.connecting = connecting;
    }

    /// Snapshot for the application
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.identifier,
            name: self.name.clone(),
            next_hop: self.reachable_via.map(|route| route.next_hop),
            cost: self.reachable_via.map(|route| route.cost),
            address_count: self.addresses.len(),
            is_neighbor: self.is_neighbor(),
        }
    }
}

/// Application-facing snapshot of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    /// Peer identifier
    pub id: PeerId,
    /// Name from the peer's link handshake
    pub name: Option<String>,
    /// First hop of the current route
    pub next_hop: Option<PeerId>,
    /// Cost of the current route
    pub cost: Option<u32>,
    /// Number of known direct addresses
    pub address_count: usize,
    /// Whether the route is the direct link
    pub is_neighbor: bool,
}
