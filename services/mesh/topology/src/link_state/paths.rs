//! LinkStateRoutingTable mutation and shortest path methods.

use super::{LinkStateRoutingTable, RouteChange, RouteInfo, RoutingTableChange};
use mesh_wire::{LinkState, NeighborCost, PeerId};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use tracing::debug;

impl LinkStateRoutingTable {
    /// Create an empty table rooted at the local peer
    pub fn new(local_id: PeerId) -> Self {
        let mut graph = BTreeMap::new();
        graph.insert(local_id, BTreeMap::new());
        Self {
            local_id,
            graph,
            routes: BTreeMap::new(),
        }
    }

    /// Local peer identifier
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Add or replace the edge from the local peer to `neighbor`
    pub fn update_neighbor_cost(&mut self, neighbor: PeerId, cost: u32) -> RoutingTableChange {
        if neighbor == self.local_id {
            return RoutingTableChange::default();
        }
        let local_id = self.local_id;
        self.mutate(|graph| {
            graph.entry(local_id).or_default().insert(neighbor, cost);
        })
    }

    /// Delete the edge from the local peer to `neighbor`
    pub fn remove_neighbor(&mut self, neighbor: PeerId) -> RoutingTableChange {
        let local_id = self.local_id;
        self.mutate(|graph| {
            if let Some(edges) = graph.get_mut(&local_id) {
                edges.remove(&neighbor);
            }
        })
    }

    /// Replace the full outgoing edge set of a remote peer
    pub fn update_link_state(
        &mut self,
        peer: PeerId,
        neighbors: &[NeighborCost],
    ) -> RoutingTableChange {
        if peer == self.local_id {
            debug!("Ignoring link state claiming to describe the local peer");
            return RoutingTableChange::default();
        }
        // Later duplicates win; self-loops carry no routing information
        let edges: BTreeMap<PeerId, u32> = neighbors
            .iter()
            .filter(|neighbor| neighbor.peer != peer)
            .map(|neighbor| (neighbor.peer, neighbor.cost))
            .collect();
        self.mutate(|graph| {
            graph.insert(peer, edges);
        })
    }

    /// Current outgoing edges of the local peer, ready to be flooded
    pub fn link_state_information(&self) -> LinkState {
        let neighbors = self
            .graph
            .get(&self.local_id)
            .map(|edges| {
                edges
                    .iter()
                    .map(|(&peer, &cost)| NeighborCost::new(peer, cost))
                    .collect()
            })
            .unwrap_or_default();
        LinkState::new(self.local_id, neighbors)
    }

    /// Next hop towards a destination
    pub fn next_hop(&self, destination: &PeerId) -> Option<PeerId> {
        self.routes.get(destination).map(|route| route.next_hop)
    }

    /// Route towards a destination
    pub fn route(&self, destination: &PeerId) -> Option<RouteInfo> {
        self.routes.get(destination).copied()
    }

    /// All current routes
    pub fn routes(&self) -> &BTreeMap<PeerId, RouteInfo> {
        &self.routes
    }

    /// Direct neighbors of the local peer
    pub fn neighbors(&self) -> Vec<PeerId> {
        self.graph
            .get(&self.local_id)
            .map(|edges| edges.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Outgoing edges of any peer
    pub(crate) fn edges(&self, peer: &PeerId) -> Option<&BTreeMap<PeerId, u32>> {
        self.graph.get(peer)
    }

    /// Apply a graph mutation, recompute routes and report the difference
    fn mutate<F>(&mut self, apply: F) -> RoutingTableChange
    where
        F: FnOnce(&mut BTreeMap<PeerId, BTreeMap<PeerId, u32>>),
    {
        apply(&mut self.graph);
        let new_routes = self.compute_routes();
        let old_routes = std::mem::replace(&mut self.routes, new_routes);
        let change = diff_routes(&old_routes, &self.routes);
        if !change.is_empty() {
            debug!(
                "Routing table changed: {} reachable, {} unreachable, {} rerouted ({} routes)",
                change.now_reachable.len(),
                change.now_unreachable.len(),
                change.route_changed.len(),
                self.routes.len()
            );
        }
        change
    }

    /// Compute shortest paths from the local peer using Dijkstra's algorithm.
    ///
    /// The heap orders by (distance, peer), so equal-cost ties resolve the
    /// same way on every run.
    fn compute_routes(&self) -> BTreeMap<PeerId, RouteInfo> {
        let mut distances: BTreeMap<PeerId, u32> = BTreeMap::new();
        let mut first_hops: BTreeMap<PeerId, PeerId> = BTreeMap::new();
        let mut unvisited: BinaryHeap<Reverse<(u32, PeerId)>> = BinaryHeap::new();

        distances.insert(self.local_id, 0);
        unvisited.push(Reverse((0, self.local_id)));

        while let Some(Reverse((current_dist, current))) = unvisited.pop() {
            // Skip if we've already found a better path
            if current_dist > distances.get(&current).copied().unwrap_or(u32::MAX) {
                continue;
            }

            let Some(edges) = self.graph.get(&current) else {
                continue;
            };
            for (&neighbor, &cost) in edges {
                if neighbor == self.local_id {
                    continue;
                }
                let new_dist = current_dist.saturating_add(cost);
                let existing = distances.get(&neighbor).copied();
                if existing.map_or(true, |existing| new_dist < existing) {
                    distances.insert(neighbor, new_dist);
                    let first_hop = if current == self.local_id {
                        neighbor
                    } else {
                        first_hops[&current]
                    };
                    first_hops.insert(neighbor, first_hop);
                    unvisited.push(Reverse((new_dist, neighbor)));
                }
            }
        }

        first_hops
            .into_iter()
            .map(|(peer, next_hop)| (peer, RouteInfo::new(next_hop, distances[&peer])))
            .collect()
    }
}

fn diff_routes(
    old: &BTreeMap<PeerId, RouteInfo>,
    new: &BTreeMap<PeerId, RouteInfo>,
) -> RoutingTableChange {
    let mut change = RoutingTableChange::default();
    for (&destination, &new_route) in new {
        match old.get(&destination) {
            None => change.now_reachable.push((destination, new_route)),
            Some(&old_route) if old_route != new_route => change.route_changed.push(RouteChange {
                destination,
                old: old_route,
                new: new_route,
            }),
            Some(_) => {}
        }
    }
    change.now_unreachable = old
        .keys()
        .filter(|destination| !new.contains_key(destination))
        .copied()
        .collect();
    change
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;

    fn id(n: u128) -> PeerId {
        PeerId::from_u128(n)
    }

    /// Cost of the cheapest path between every ordered pair (Floyd-Warshall)
    fn all_pairs(size: u128, edges: &BTreeMap<(u128, u128), u32>) -> BTreeMap<(u128, u128), u64> {
        let mut dist = BTreeMap::new();
        for i in 0..size {
            dist.insert((i, i), 0u64);
        }
        for (&(from, to), &cost) in edges {
            dist.insert((from, to), cost as u64);
        }
        for k in 0..size {
            for i in 0..size {
                for j in 0..size {
                    if let (Some(&ik), Some(&kj)) = (dist.get(&(i, k)), dist.get(&(k, j))) {
                        let through = ik + kj;
                        if dist.get(&(i, j)).map_or(true, |&current| through < current) {
                            dist.insert((i, j), through);
                        }
                    }
                }
            }
        }
        dist
    }

    /// Build the table for a random graph where peer 0 is local
    fn random_table(rng: &mut StdRng, size: u128) -> (LinkStateRoutingTable, BTreeMap<(u128, u128), u32>) {
        let mut table = LinkStateRoutingTable::new(id(0));
        let mut edges = BTreeMap::new();
        for from in 0..size {
            let mut neighbors = Vec::new();
            for to in 0..size {
                if from != to && rng.gen_bool(0.3) {
                    let cost = rng.gen_range(1..20);
                    edges.insert((from, to), cost);
                    neighbors.push(NeighborCost::new(id(to), cost));
                }
            }
            if from == 0 {
                for neighbor in neighbors {
                    table.update_neighbor_cost(neighbor.peer, neighbor.cost);
                }
            } else {
                table.update_link_state(id(from), &neighbors);
            }
        }
        (table, edges)
    }

    fn assert_routes_are_shortest(table: &LinkStateRoutingTable, size: u128, edges: &BTreeMap<(u128, u128), u32>) {
        let dist = all_pairs(size, edges);
        for destination in 1..size {
            let best = dist.get(&(0, destination)).copied();
            match table.route(&id(destination)) {
                None => assert!(best.is_none(), "peer {} should be reachable", destination),
                Some(route) => {
                    assert_eq!(Some(route.cost as u64), best, "cost to {}", destination);
                    // The next hop must lie on some minimum-cost path
                    let hop = route.next_hop.uuid().as_u128();
                    let first_leg = edges[&(0, hop)] as u64;
                    let rest = dist[&(hop, destination)];
                    assert_eq!(first_leg + rest, route.cost as u64);
                }
            }
        }
    }

    #[test]
    fn test_direct_neighbor() {
        let mut table = LinkStateRoutingTable::new(id(1));
        let change = table.update_neighbor_cost(id(2), 1);
        assert_eq!(change.now_reachable, vec![(id(2), RouteInfo::new(id(2), 1))]);
        assert_eq!(table.next_hop(&id(2)), Some(id(2)));
        assert_eq!(table.neighbors(), vec![id(2)]);

        // Same cost again is not a change
        assert!(table.update_neighbor_cost(id(2), 1).is_empty());

        let change = table.remove_neighbor(id(2));
        assert_eq!(change.now_unreachable, vec![id(2)]);
        assert_eq!(table.next_hop(&id(2)), None);
    }

    #[test]
    fn test_route_improvement() {
        let (a, b, c) = (id(1), id(2), id(3));
        let mut table = LinkStateRoutingTable::new(a);
        table.update_neighbor_cost(b, 5);
        let change = table.update_link_state(b, &[NeighborCost::new(c, 5), NeighborCost::new(a, 5)]);
        assert_eq!(change.now_reachable, vec![(c, RouteInfo::new(b, 10))]);

        let change = table.update_neighbor_cost(c, 3);
        assert!(change.now_reachable.is_empty());
        assert!(change.now_unreachable.is_empty());
        assert_eq!(change.route_changed.len(), 1);
        let rerouted = change.route_changed[0];
        assert_eq!(rerouted.destination, c);
        assert_eq!(rerouted.old, RouteInfo::new(b, 10));
        assert_eq!(rerouted.new, RouteInfo::new(c, 3));
        assert!(rerouted.is_improvement());
    }

    #[test]
    fn test_link_state_replaces_edges() {
        let (a, b, c, d) = (id(1), id(2), id(3), id(4));
        let mut table = LinkStateRoutingTable::new(a);
        table.update_neighbor_cost(b, 1);
        table.update_link_state(b, &[NeighborCost::new(c, 1)]);
        assert_eq!(table.next_hop(&c), Some(b));

        let change = table.update_link_state(b, &[NeighborCost::new(d, 2)]);
        assert_eq!(change.now_reachable, vec![(d, RouteInfo::new(b, 3))]);
        assert_eq!(change.now_unreachable, vec![c]);
        assert!(change.route_changed.is_empty());
    }

    #[test]
    fn test_losing_neighbor_drops_dependents() {
        let (a, b, c, d) = (id(1), id(2), id(3), id(4));
        let mut table = LinkStateRoutingTable::new(a);
        table.update_neighbor_cost(b, 1);
        table.update_link_state(b, &[NeighborCost::new(c, 1)]);
        table.update_link_state(c, &[NeighborCost::new(d, 1)]);
        assert_eq!(table.route(&d), Some(RouteInfo::new(b, 3)));

        let change = table.remove_neighbor(b);
        assert_eq!(change.now_unreachable, vec![b, c, d]);
        assert!(table.routes().is_empty());
    }

    #[test]
    fn test_link_state_information() {
        let mut table = LinkStateRoutingTable::new(id(1));
        table.update_neighbor_cost(id(3), 7);
        table.update_neighbor_cost(id(2), 4);
        table.update_neighbor_cost(id(2), 2);
        let info = table.link_state_information();
        assert_eq!(info.peer, id(1));
        assert_eq!(
            info.neighbors,
            vec![NeighborCost::new(id(2), 2), NeighborCost::new(id(3), 7)]
        );
    }

    #[test]
    fn test_local_link_state_ignored() {
        let mut table = LinkStateRoutingTable::new(id(1));
        let change = table.update_link_state(id(1), &[NeighborCost::new(id(2), 1)]);
        assert!(change.is_empty());
        assert!(table.neighbors().is_empty());
    }

    #[test]
    fn test_random_graphs_match_brute_force() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let size = rng.gen_range(2..8);
            let (table, edges) = random_table(&mut rng, size);
            assert_routes_are_shortest(&table, size, &edges);
        }
    }

    #[test]
    fn test_change_sets_are_complete() {
        let mut rng = StdRng::seed_from_u64(42);
        let size = 7u128;
        let (mut table, mut edges) = random_table(&mut rng, size);

        for _ in 0..200 {
            let before = table.routes().clone();
            let change = match rng.gen_range(0..3) {
                0 => {
                    let neighbor = rng.gen_range(1..size);
                    let cost = rng.gen_range(1..20);
                    edges.insert((0, neighbor), cost);
                    table.update_neighbor_cost(id(neighbor), cost)
                }
                1 => {
                    let neighbor = rng.gen_range(1..size);
                    edges.remove(&(0, neighbor));
                    table.remove_neighbor(id(neighbor))
                }
                _ => {
                    let peer = rng.gen_range(1..size);
                    edges.retain(|&(from, _), _| from != peer);
                    let mut neighbors = Vec::new();
                    for to in 0..size {
                        if to != peer && rng.gen_bool(0.3) {
                            let cost = rng.gen_range(1..20);
                            edges.insert((peer, to), cost);
                            neighbors.push(NeighborCost::new(id(to), cost));
                        }
                    }
                    table.update_link_state(id(peer), &neighbors)
                }
            };
            assert_routes_are_shortest(&table, size, &edges);

            let after = table.routes();
            let mut reported = BTreeSet::new();
            for (peer, route) in &change.now_reachable {
                assert!(!before.contains_key(peer));
                assert_eq!(after.get(peer), Some(route));
                assert!(reported.insert(*peer));
            }
            for peer in &change.now_unreachable {
                assert!(before.contains_key(peer));
                assert!(!after.contains_key(peer));
                assert!(reported.insert(*peer));
            }
            for rerouted in &change.route_changed {
                assert_eq!(before.get(&rerouted.destination), Some(&rerouted.old));
                assert_eq!(after.get(&rerouted.destination), Some(&rerouted.new));
                assert_ne!(rerouted.old, rerouted.new);
                assert!(reported.insert(rerouted.destination));
            }
            for peer in (1..size).map(id) {
                if !reported.contains(&peer) {
                    assert_eq!(before.get(&peer), after.get(&peer));
                }
            }
        }
    }
}
