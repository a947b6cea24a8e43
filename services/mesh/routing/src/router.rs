//! The router actor.
//!
//! A [`Router`] owns the node registry, the link-state routing table and the
//! flooding state, and mutates them only from its own task. Discovery
//! backends, connection tasks and the application talk to it by sending
//! commands; the application receives [`RouterEvent`]s in return.

use crate::config::RouterConfig;
use crate::discovery::{AdvertiserDelegate, BrowserDelegate, DiscoveryModule, ModuleId, Role};
use crate::establish::{Establishment, Hop};
use crate::node::{Node, PeerInfo};
use crate::supervision::{Operation, Phase, Supervisor};
use crate::RouterError;
use bytes::{Bytes, BytesMut};
use mesh_session::{
    recv_link_handshake, recv_packet, send_link_handshake, Address, Connection, ConnectionId,
    StreamEvent,
};
use mesh_topology::{
    FloodingPacketManager, FloodingTransport, LinkStateRoutingTable, RoutingTableChange,
};
use mesh_wire::{
    FloodingEnvelope, LinkHandshake, LinkPurpose, MulticastHandshake, Packet, PacketDecoder,
    PeerId, Tree,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Notifications for the application
#[derive(Debug)]
pub enum RouterEvent {
    /// A peer became reachable
    PeerFound(PeerInfo),
    /// A peer is now reached over a cheaper route
    PeerImprovedRoute(PeerInfo),
    /// A peer is no longer reachable
    PeerLost(PeerInfo),
    /// A remote peer established a routed connection to us
    IncomingConnection {
        /// The connection's source
        from: PeerInfo,
        /// Confirmed connection, ready for application data
        connection: Connection,
    },
}

enum Command {
    Establish {
        destinations: BTreeSet<PeerId>,
        reply: oneshot::Sender<Result<Connection, RouterError>>,
    },
    AddModule {
        module: DiscoveryModule,
        reply: oneshot::Sender<ModuleId>,
    },
    RemoveModule {
        module: ModuleId,
        reply: oneshot::Sender<Result<(), RouterError>>,
    },
    Start {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    RoleStarted {
        module: ModuleId,
        role: Role,
    },
    RoleStopped {
        module: ModuleId,
        role: Role,
    },
    AddressDiscovered {
        module: ModuleId,
        peer: PeerId,
        address: Arc<dyn Address>,
    },
    AddressRemoved {
        module: ModuleId,
        peer: PeerId,
        key: String,
    },
    IncomingConnection(Connection),
    LinkEstablished {
        peer: PeerId,
        name: Option<String>,
        connection: Connection,
        cost: Option<u32>,
    },
    LinkFailed {
        peer: PeerId,
        error: RouterError,
    },
    LinkClosed {
        peer: PeerId,
        id: ConnectionId,
    },
    Flooded {
        from: PeerId,
        envelope: FloodingEnvelope,
    },
    RoutedHandshake {
        from: PeerId,
        plan: MulticastHandshake,
        connection: Connection,
    },
    RoutedIncoming {
        source: PeerId,
        connection: Connection,
    },
}

/// Cloneable interface to a running router
#[derive(Debug, Clone)]
pub struct RouterHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl RouterHandle {
    fn send(&self, command: Command) -> Result<(), RouterError> {
        self.commands.send(command).map_err(|_| RouterError::Stopped)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RouterError> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply))?;
        response.await.map_err(|_| RouterError::Stopped)
    }

    /// Open a routed connection to every peer in `destinations`.
    ///
    /// Resolves once every destination has confirmed. Writes on the returned
    /// connection reach all destinations; data from any of them is received.
    pub async fn establish_connection(
        &self,
        destinations: BTreeSet<PeerId>,
    ) -> Result<Connection, RouterError> {
        self.request(|reply| Command::Establish {
            destinations,
            reply,
        })
        .await?
    }

    /// Register a discovery module; it starts right away if the router runs
    pub async fn add_module(&self, module: DiscoveryModule) -> Result<ModuleId, RouterError> {
        self.request(|reply| Command::AddModule { module, reply }).await
    }

    /// Stop a module and withdraw every address it reported
    pub async fn remove_module(&self, module: ModuleId) -> Result<(), RouterError> {
        self.request(|reply| Command::RemoveModule { module, reply })
            .await?
    }

    /// Start advertising and browsing on every module
    pub async fn start(&self) -> Result<(), RouterError> {
        self.request(|reply| Command::Start { reply }).await
    }

    /// Stop advertising and browsing on every module
    pub async fn stop(&self) -> Result<(), RouterError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Stop the router and close every routing connection
    pub async fn shutdown(&self) -> Result<(), RouterError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Snapshot of every known peer, ordered by identifier
    pub async fn peers(&self) -> Result<Vec<PeerInfo>, RouterError> {
        self.request(|reply| Command::Peers { reply }).await
    }
}

/// Forwards backend notifications of one module to the router
struct ModuleEvents {
    module: ModuleId,
    commands: mpsc::UnboundedSender<Command>,
}

impl ModuleEvents {
    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            trace!("Router gone, dropping event from {}", self.module);
        }
    }
}

impl AdvertiserDelegate for ModuleEvents {
    fn did_start(&self) {
        self.send(Command::RoleStarted {
            module: self.module,
            role: Role::Advertiser,
        });
    }

    fn did_stop(&self) {
        self.send(Command::RoleStopped {
            module: self.module,
            role: Role::Advertiser,
        });
    }

    fn handle_incoming_connection(&self, connection: Connection) {
        self.send(Command::IncomingConnection(connection));
    }
}

impl BrowserDelegate for ModuleEvents {
    fn did_start(&self) {
        self.send(Command::RoleStarted {
            module: self.module,
            role: Role::Browser,
        });
    }

    fn did_stop(&self) {
        self.send(Command::RoleStopped {
            module: self.module,
            role: Role::Browser,
        });
    }

    fn did_discover_address(&self, peer: PeerId, address: Arc<dyn Address>) {
        self.send(Command::AddressDiscovered {
            module: self.module,
            peer,
            address,
        });
    }

    fn did_remove_address(&self, peer: PeerId, key: String) {
        self.send(Command::AddressRemoved {
            module: self.module,
            peer,
            key,
        });
    }
}

/// A registered module with its two supervised roles
struct ManagedModule {
    name: String,
    advertiser: Supervisor,
    browser: Supervisor,
}

impl ManagedModule {
    fn supervisor(&self, role: Role) -> &Supervisor {
        match role {
            Role::Advertiser => &self.advertiser,
            Role::Browser => &self.browser,
        }
    }

    fn start(&self) {
        self.advertiser.start();
        self.browser.start();
    }

    fn stop(&self) {
        self.advertiser.stop();
        self.browser.stop();
    }

    fn is_stopped(&self) -> bool {
        self.advertiser.phase() == Phase::Stopped && self.browser.phase() == Phase::Stopped
    }
}

/// Flooding transport over the routing connections of the registry
struct RoutingLinks<'a> {
    nodes: &'a HashMap<PeerId, Node>,
}

impl FloodingTransport for RoutingLinks<'_> {
    fn neighbors(&self) -> Vec<PeerId> {
        let mut neighbors: Vec<PeerId> = self
            .nodes
            .values()
            .filter(|node| node.routing_connection().is_some())
            .map(Node::identifier)
            .collect();
        neighbors.sort();
        neighbors
    }

    fn send(&mut self, neighbor: &PeerId, frame: Bytes) {
        let Some(link) = self.nodes.get(neighbor).and_then(|node| node.routing_connection()) else {
            return;
        };
        if let Err(e) = link.write(frame) {
            debug!("Flooding to {} over {} failed: {}", neighbor, link.id(), e);
        }
    }
}

/// The routing core of one peer
pub struct Router {
    config: RouterConfig,
    nodes: HashMap<PeerId, Node>,
    table: LinkStateRoutingTable,
    flooding: FloodingPacketManager,
    modules: BTreeMap<ModuleId, ManagedModule>,
    /// Removed modules whose roles have not confirmed the stop yet
    retired: BTreeMap<ModuleId, ManagedModule>,
    next_module: u64,
    running: bool,
    next_broadcast: Instant,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<RouterEvent>,
}

impl Router {
    /// Create a router, its handle and the application event stream.
    ///
    /// Nothing happens until [`Router::run`] is spawned.
    pub fn new(config: RouterConfig) -> (Router, RouterHandle, mpsc::UnboundedReceiver<RouterEvent>) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let router = Router {
            table: LinkStateRoutingTable::new(config.local_id),
            flooding: FloodingPacketManager::new(config.local_id),
            nodes: HashMap::new(),
            modules: BTreeMap::new(),
            retired: BTreeMap::new(),
            next_module: 0,
            running: false,
            next_broadcast: Instant::now() + config.broadcast_interval,
            commands_tx: commands_tx.clone(),
            commands,
            events,
            config,
        };
        let handle = RouterHandle {
            commands: commands_tx,
        };
        (router, handle, events_rx)
    }

    /// Process commands and broadcast link state until shut down
    pub async fn run(mut self) {
        info!(
            "Router {} ({}) running",
            self.config.local_id, self.config.local_name
        );

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = tokio::time::sleep_until(self.next_broadcast) => {
                    self.broadcast_link_state();
                }
            }
        }

        info!("Router {} stopped", self.config.local_id);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Establish {
                destinations,
                reply,
            } => self.establish(destinations, reply),
            Command::AddModule { module, reply } => {
                let id = self.add_module(module);
                let _ = reply.send(id);
            }
            Command::RemoveModule { module, reply } => {
                let _ = reply.send(self.remove_module(module));
            }
            Command::Start { reply } => {
                self.running = true;
                for module in self.modules.values() {
                    module.start();
                }
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                self.running = false;
                for module in self.modules.values() {
                    module.stop();
                }
                let _ = reply.send(());
            }
            // Handled by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
            Command::Peers { reply } => {
                let mut peers: Vec<PeerInfo> = self.nodes.values().map(Node::info).collect();
                peers.sort_by_key(|peer| peer.id);
                let _ = reply.send(peers);
            }
            Command::RoleStarted { module, role } => self.role_started(module, role),
            Command::RoleStopped { module, role } => self.role_stopped(module, role),
            Command::AddressDiscovered {
                module,
                peer,
                address,
            } => self.address_discovered(module, peer, address),
            Command::AddressRemoved { module, peer, key } => {
                self.address_removed(module, peer, &key)
            }
            Command::IncomingConnection(connection) => self.accept(connection),
            Command::LinkEstablished {
                peer,
                name,
                connection,
                cost,
            } => self.link_established(peer, name, connection, cost),
            Command::LinkFailed { peer, error } => {
                warn!("Routing connection to {} failed: {}", peer, error);
                if let Some(node) = self.nodes.get_mut(&peer) {
                    node.set_connecting(false);
                }
            }
            Command::LinkClosed { peer, id } => self.link_closed(peer, id),
            Command::Flooded { from, envelope } => self.flooded(from, envelope),
            Command::RoutedHandshake {
                from,
                plan,
                connection,
            } => self.continue_routed(from, plan, connection),
            Command::RoutedIncoming { source, connection } => {
                let from = self.node_mut(source).info();
                info!("Incoming routed connection {} from {}", connection.id(), source);
                self.emit(RouterEvent::IncomingConnection { from, connection });
            }
        }
    }

    fn node_mut(&mut self, peer: PeerId) -> &mut Node {
        self.nodes.entry(peer).or_insert_with(|| Node::new(peer))
    }

    fn emit(&self, event: RouterEvent) {
        if self.events.send(event).is_err() {
            trace!("No application listening for router events");
        }
    }

    fn add_module(&mut self, module: DiscoveryModule) -> ModuleId {
        self.next_module += 1;
        let id = ModuleId::new(self.next_module);
        let events = Arc::new(ModuleEvents {
            module: id,
            commands: self.commands_tx.clone(),
        });
        let local_id = self.config.local_id;

        let advertiser = module.advertiser();
        let advertiser_events: Arc<dyn AdvertiserDelegate> = events.clone();
        let start_advertising: Operation = {
            let advertiser = advertiser.clone();
            Arc::new(move |_attempt: u32| advertiser.start_advertising(local_id, advertiser_events.clone()))
        };
        let stop_advertising: Operation = Arc::new(move |_attempt: u32| advertiser.stop_advertising());

        let browser = module.browser();
        let browser_events: Arc<dyn BrowserDelegate> = events;
        let start_browsing: Operation = {
            let browser = browser.clone();
            Arc::new(move |_attempt: u32| browser.start_browsing(browser_events.clone()))
        };
        let stop_browsing: Operation = Arc::new(move |_attempt: u32| browser.stop_browsing());

        let managed = ManagedModule {
            name: module.name().to_string(),
            advertiser: Supervisor::new(
                format!("{} {}", module.name(), Role::Advertiser),
                self.config.supervision,
                start_advertising,
                stop_advertising,
            ),
            browser: Supervisor::new(
                format!("{} {}", module.name(), Role::Browser),
                self.config.supervision,
                start_browsing,
                stop_browsing,
            ),
        };
        if self.running {
            managed.start();
        }
        info!("Added discovery module {} as {}", managed.name, id);
        self.modules.insert(id, managed);
        id
    }

    fn remove_module(&mut self, id: ModuleId) -> Result<(), RouterError> {
        let module = self
            .modules
            .remove(&id)
            .ok_or(RouterError::UnknownModule(id))?;
        module.stop();
        info!("Removed discovery module {} ({})", module.name, id);
        if !module.is_stopped() {
            self.retired.insert(id, module);
        }

        let affected: Vec<PeerId> = self
            .nodes
            .values_mut()
            .filter_map(|node| {
                let identifier = node.identifier();
                node.remove_module_addresses(id).then_some(identifier)
            })
            .collect();
        for peer in affected {
            self.refresh_link_cost(peer);
        }
        Ok(())
    }

    fn role_started(&mut self, id: ModuleId, role: Role) {
        if let Some(module) = self.modules.get(&id).or_else(|| self.retired.get(&id)) {
            module.supervisor(role).confirm_started();
        }
    }

    fn role_stopped(&mut self, id: ModuleId, role: Role) {
        if let Some(module) = self.modules.get(&id) {
            let expected = module.supervisor(role).phase() == Phase::Stopping;
            module.supervisor(role).confirm_stopped();
            if !expected && self.running {
                warn!("{} {} stopped unexpectedly", module.name, role);
            }
        } else if let Some(module) = self.retired.get(&id) {
            module.supervisor(role).confirm_stopped();
            if module.is_stopped() {
                self.retired.remove(&id);
            }
        }
    }

    fn address_discovered(&mut self, module: ModuleId, peer: PeerId, address: Arc<dyn Address>) {
        if !self.modules.contains_key(&module) {
            debug!("Ignoring address from removed {}", module);
            return;
        }
        if peer == self.config.local_id {
            return;
        }
        debug!("{} discovered {} at {}", module, peer, address.key());
        let node = self.node_mut(peer);
        node.add_address(module, address);
        if node.routing_connection().is_some() {
            self.refresh_link_cost(peer);
        } else {
            self.maybe_connect(peer);
        }
    }

    fn address_removed(&mut self, module: ModuleId, peer: PeerId, key: &str) {
        let Some(node) = self.nodes.get_mut(&peer) else {
            return;
        };
        if node.remove_address(key) {
            debug!("{} withdrew {} for {}", module, key, peer);
            self.refresh_link_cost(peer);
        }
    }

    /// Follow the best address cost of a neighbor. Without any address the
    /// link keeps its current cost.
    fn refresh_link_cost(&mut self, peer: PeerId) {
        let Some(node) = self.nodes.get_mut(&peer) else {
            return;
        };
        if node.routing_connection().is_none() {
            return;
        }
        let Some(cost) = node.best_address().map(|address| address.cost()) else {
            return;
        };
        if node.link_cost() == Some(cost) {
            return;
        }
        node.set_link_cost(Some(cost));
        info!("Link cost to {} is now {}", peer, cost);
        let change = self.table.update_neighbor_cost(peer, cost);
        self.apply_change(change);
        self.schedule_short_broadcast();
    }

    /// Open a routing connection if this peer is the designated initiator
    fn maybe_connect(&mut self, peer: PeerId) {
        let local_id = self.config.local_id;
        let Some(node) = self.nodes.get_mut(&peer) else {
            return;
        };
        // The lower identifier initiates, so both sides never dial each other
        if local_id >= peer || node.routing_connection().is_some() || node.is_connecting() {
            return;
        }
        let Some(address) = node.best_address() else {
            return;
        };
        node.set_connecting(true);

        debug!("Connecting to {} via {}", peer, address.key());
        let handshake = LinkHandshake::new(local_id, LinkPurpose::Routing, self.config.local_name.clone());
        let timeout = self.config.handshake_timeout;
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let command = match open_routing_link(address.as_ref(), handshake, timeout).await {
                Ok(connection) => Command::LinkEstablished {
                    peer,
                    name: None,
                    connection,
                    cost: Some(address.cost()),
                },
                Err(error) => Command::LinkFailed { peer, error },
            };
            let _ = commands.send(command);
        });
    }

    fn accept(&self, connection: Connection) {
        debug!("Accepted connection {}", connection.id());
        tokio::spawn(accept_link(
            connection,
            self.commands_tx.clone(),
            self.config.handshake_timeout,
        ));
    }

    fn link_established(
        &mut self,
        peer: PeerId,
        name: Option<String>,
        connection: Connection,
        cost: Option<u32>,
    ) {
        if peer == self.config.local_id {
            warn!("Closing routing connection {} to ourselves", connection.id());
            connection.close();
            return;
        }
        let default_cost = self.config.default_link_cost;
        let node = self.node_mut(peer);
        node.set_connecting(false);
        if let Some(name) = name {
            node.set_name(name);
        }
        if node.routing_connection().map_or(false, |link| link.is_connected()) {
            debug!("Closing duplicate routing connection {} to {}", connection.id(), peer);
            connection.close();
            return;
        }

        let cost = cost
            .or_else(|| node.best_address().map(|address| address.cost()))
            .unwrap_or(default_cost);
        node.set_routing_connection(Some(connection.handle()));
        node.set_link_cost(Some(cost));
        info!(
            "Routing connection {} to {} established (cost {})",
            connection.id(),
            peer,
            cost
        );

        tokio::spawn(read_routing_link(peer, connection, self.commands_tx.clone()));
        let change = self.table.update_neighbor_cost(peer, cost);
        self.apply_change(change);
        self.schedule_short_broadcast();
    }

    fn link_closed(&mut self, peer: PeerId, id: ConnectionId) {
        let Some(node) = self.nodes.get_mut(&peer) else {
            return;
        };
        if node.routing_connection().map(|link| link.id()) != Some(id) {
            debug!("Ignoring close of stale routing connection {} to {}", id, peer);
            return;
        }
        node.set_routing_connection(None);
        node.set_link_cost(None);
        info!("Routing connection {} to {} closed", id, peer);

        let change = self.table.remove_neighbor(peer);
        self.apply_change(change);
        self.schedule_short_broadcast();
    }

    fn flooded(&mut self, from: PeerId, envelope: FloodingEnvelope) {
        let mut links = RoutingLinks { nodes: &self.nodes };
        match self.flooding.handle_incoming(&from, envelope, &mut links) {
            Some(Packet::LinkState(state)) => {
                trace!(
                    "Link state of {} lists {} neighbors",
                    state.peer,
                    state.neighbors.len()
                );
                let change = self.table.update_link_state(state.peer, &state.neighbors);
                self.apply_change(change);
            }
            Some(other) => debug!("No handler for flooded {:?} packet", other.packet_type()),
            None => {}
        }
    }

    fn broadcast_link_state(&mut self) {
        let state = self.table.link_state_information();
        let mut links = RoutingLinks { nodes: &self.nodes };
        self.flooding.flood(&Packet::LinkState(state), &mut links);
        self.next_broadcast = Instant::now() + self.config.broadcast_interval;
    }

    fn schedule_short_broadcast(&mut self) {
        let at = Instant::now() + self.config.broadcast_short_delay;
        if at < self.next_broadcast {
            self.next_broadcast = at;
        }
    }

    fn apply_change(&mut self, change: RoutingTableChange) {
        for (peer, route) in change.now_reachable {
            let node = self.node_mut(peer);
            node.set_reachable_via(Some(route));
            let info = node.info();
            info!("Peer {} reachable via {} (cost {})", peer, route.next_hop, route.cost);
            self.emit(RouterEvent::PeerFound(info));
        }
        for peer in change.now_unreachable {
            let node = self.node_mut(peer);
            node.set_reachable_via(None);
            let info = node.info();
            info!("Peer {} unreachable", peer);
            self.emit(RouterEvent::PeerLost(info));
        }
        for route in change.route_changed {
            let node = self.node_mut(route.destination);
            node.set_reachable_via(Some(route.new));
            let info = node.info();
            if route.is_improvement() {
                info!(
                    "Route to {} improved from {} to {} via {}",
                    route.destination, route.old.cost, route.new.cost, route.new.next_hop
                );
                self.emit(RouterEvent::PeerImprovedRoute(info));
            } else {
                debug!(
                    "Route to {} now costs {} via {}",
                    route.destination, route.new.cost, route.new.next_hop
                );
            }
        }
    }

    fn establishment(&self, source: PeerId, destinations: BTreeSet<PeerId>) -> Establishment {
        Establishment {
            local_id: self.config.local_id,
            local_name: self.config.local_name.clone(),
            source,
            destinations,
            handshake_timeout: self.config.handshake_timeout,
            confirmation_timeout: self.config.confirmation_timeout,
        }
    }

    /// Direct hops for the children of `tree`
    fn resolve_hops(&self, tree: &Tree<PeerId>) -> Result<Vec<Hop>, RouterError> {
        tree.subtrees
            .iter()
            .map(|subtree| {
                let child = subtree.value;
                let address = self
                    .nodes
                    .get(&child)
                    .and_then(|node| node.best_address())
                    .ok_or(RouterError::NoAddress(child))?;
                Ok(Hop {
                    subtree: subtree.clone(),
                    address,
                })
            })
            .collect()
    }

    fn establish(
        &mut self,
        mut destinations: BTreeSet<PeerId>,
        reply: oneshot::Sender<Result<Connection, RouterError>>,
    ) {
        let local_id = self.config.local_id;
        destinations.remove(&local_id);
        let planned = self
            .table
            .hop_tree(&destinations)
            .map_err(RouterError::from)
            .and_then(|tree| self.resolve_hops(&tree));
        let hops = match planned {
            Ok(hops) => hops,
            Err(e) => {
                warn!("Cannot route to {:?}: {}", destinations, e);
                let _ = reply.send(Err(e));
                return;
            }
        };

        debug!(
            "Establishing routed connection to {} destinations over {} hops",
            destinations.len(),
            hops.len()
        );
        let establishment = self.establishment(local_id, destinations);
        tokio::spawn(async move {
            let result = establishment.originate(hops).await;
            if let Err(e) = &result {
                warn!("Routed connection failed: {}", e);
            }
            if let Err(Ok(connection)) = reply.send(result) {
                connection.close();
            }
        });
    }

    fn continue_routed(&mut self, from: PeerId, plan: MulticastHandshake, connection: Connection) {
        let root = plan.next_hop_tree.value;
        if root != self.config.local_id {
            warn!("{}", RouterError::MisroutedHandshake(root));
            connection.close();
            return;
        }
        let hops = match self.resolve_hops(&plan.next_hop_tree) {
            Ok(hops) => hops,
            Err(e) => {
                warn!("Cannot continue routed connection from {}: {}", plan.source, e);
                connection.close();
                return;
            }
        };

        let source = plan.source;
        let establishment = self.establishment(source, plan.destinations.into_iter().collect());
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            match establishment.relay(connection, hops).await {
                Ok(Some(connection)) => {
                    let _ = commands.send(Command::RoutedIncoming { source, connection });
                }
                Ok(None) => {}
                Err(e) => warn!("Routed connection from {} via {} failed: {}", source, from, e),
            }
        });
    }

    fn shutdown(&mut self) {
        info!("Router {} shutting down", self.config.local_id);
        self.running = false;
        for module in self.modules.values() {
            module.stop();
        }
        for node in self.nodes.values_mut() {
            if let Some(link) = node.routing_connection() {
                link.close();
            }
            node.set_routing_connection(None);
        }
    }
}

async fn open_routing_link(
    address: &dyn Address,
    handshake: LinkHandshake,
    timeout: Duration,
) -> Result<Connection, RouterError> {
    let mut connection = address.open().await?;
    if let Err(e) = send_link_handshake(&mut connection, handshake, timeout).await {
        connection.close();
        return Err(e.into());
    }
    Ok(connection)
}

/// Read the link handshake of an accepted connection and hand it over
async fn accept_link(
    mut connection: Connection,
    commands: mpsc::UnboundedSender<Command>,
    timeout: Duration,
) {
    let handshake = match recv_link_handshake(&mut connection, timeout).await {
        Ok(handshake) => handshake,
        Err(e) => {
            warn!("Dropping connection {} without handshake: {}", connection.id(), e);
            connection.close();
            return;
        }
    };

    let command = match handshake.purpose {
        LinkPurpose::Routing => Command::LinkEstablished {
            peer: handshake.peer,
            name: Some(handshake.name),
            connection,
            cost: None,
        },
        LinkPurpose::Routed => match recv_packet(&mut connection, timeout).await {
            Ok(Packet::MulticastHandshake(plan)) => Command::RoutedHandshake {
                from: handshake.peer,
                plan,
                connection,
            },
            Ok(other) => {
                warn!(
                    "Expected a hop plan from {}, got {:?}",
                    handshake.peer,
                    other.packet_type()
                );
                connection.close();
                return;
            }
            Err(e) => {
                warn!("No hop plan from {}: {}", handshake.peer, e);
                connection.close();
                return;
            }
        },
    };
    let _ = commands.send(command);
}

/// Decode flooded packets from a neighbor until the link closes
async fn read_routing_link(
    peer: PeerId,
    mut connection: Connection,
    commands: mpsc::UnboundedSender<Command>,
) {
    let id = connection.id();
    let mut decoder = PacketDecoder::new();
    let mut buf = BytesMut::new();
    let mut failed = false;

    while let Some(event) = connection.next_event().await {
        match event {
            StreamEvent::Received(data) if !failed => {
                buf.extend_from_slice(&data);
                loop {
                    match decoder.decode(&mut buf) {
                        Ok(Some(Packet::Flooding(envelope))) => {
                            let _ = commands.send(Command::Flooded {
                                from: peer,
                                envelope,
                            });
                        }
                        Ok(Some(other)) => debug!(
                            "Ignoring {:?} packet on routing connection {}",
                            other.packet_type(),
                            id
                        ),
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Closing routing connection {} to {}: {}", id, peer, e);
                            failed = true;
                            buf.clear();
                            connection.close();
                            break;
                        }
                    }
                }
            }
            StreamEvent::Closed { error: Some(error) } => {
                debug!("Routing connection {} to {} failed: {}", id, peer, error);
            }
            _ => {}
        }
    }
    let _ = commands.send(Command::LinkClosed { peer, id });
}
