//! Steiner tree approximation for multicast hop planning.
//!
//! Uses the shortest-path heuristic of Takahashi and Matsuyama: starting from
//! the local peer, repeatedly attach the destination closest to the tree built
//! so far along its cheapest path. Paths may pass through relays that are not
//! destinations themselves, and a destination on the path to another one is
//! picked up for free.

use super::LinkStateRoutingTable;
use crate::TopologyError;
use mesh_wire::{PeerId, Tree};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use tracing::debug;

impl LinkStateRoutingTable {
    /// Plan the direct hops needed to reach every destination.
    ///
    /// The returned tree is rooted at the local peer and contains every
    /// destination; children are ordered by identifier. The local peer is
    /// ignored if it appears in `destinations`.
    pub fn hop_tree(&self, destinations: &BTreeSet<PeerId>) -> Result<Tree<PeerId>, TopologyError> {
        let mut remaining: BTreeSet<PeerId> = destinations
            .iter()
            .filter(|destination| **destination != self.local_id)
            .copied()
            .collect();
        if remaining.is_empty() {
            return Err(TopologyError::NoDestinations);
        }
        if let Some(unreachable) = remaining.iter().find(|d| !self.routes.contains_key(*d)) {
            return Err(TopologyError::Unreachable(*unreachable));
        }

        let mut in_tree = BTreeSet::from([self.local_id]);
        let mut parents: BTreeMap<PeerId, PeerId> = BTreeMap::new();

        while !remaining.is_empty() {
            let (distances, previous) = self.distances_from(&in_tree);
            let target = remaining
                .iter()
                .filter_map(|d| distances.get(d).map(|&cost| (cost, *d)))
                .min()
                .map(|(_, d)| d);
            let Some(target) = target else {
                let stuck = remaining.iter().next().copied().unwrap_or(self.local_id);
                return Err(TopologyError::Unreachable(stuck));
            };

            let mut vertex = target;
            while !in_tree.contains(&vertex) {
                let Some(&parent) = previous.get(&vertex) else {
                    return Err(TopologyError::Unreachable(target));
                };
                parents.insert(vertex, parent);
                in_tree.insert(vertex);
                vertex = parent;
            }
            remaining.retain(|d| !in_tree.contains(d));
        }

        let mut children: BTreeMap<PeerId, Vec<PeerId>> = BTreeMap::new();
        for (&child, &parent) in &parents {
            children.entry(parent).or_default().push(child);
        }
        let tree = build_tree(self.local_id, &children);
        debug!(
            "Planned hop tree with {} vertices for {} destinations",
            tree.vertex_count(),
            destinations.len()
        );
        Ok(tree)
    }

    /// Multi-source Dijkstra: distance to each peer from the nearest source,
    /// and the predecessor on that path.
    fn distances_from(
        &self,
        sources: &BTreeSet<PeerId>,
    ) -> (BTreeMap<PeerId, u32>, BTreeMap<PeerId, PeerId>) {
        let mut distances: BTreeMap<PeerId, u32> = BTreeMap::new();
        let mut previous: BTreeMap<PeerId, PeerId> = BTreeMap::new();
        let mut unvisited: BinaryHeap<Reverse<(u32, PeerId)>> = BinaryHeap::new();

        for &source in sources {
            distances.insert(source, 0);
            unvisited.push(Reverse((0, source)));
        }

        while let Some(Reverse((current_dist, current))) = unvisited.pop() {
            if current_dist > distances.get(&current).copied().unwrap_or(u32::MAX) {
                continue;
            }
            let Some(edges) = self.edges(&current) else {
                continue;
            };
            for (&neighbor, &cost) in edges {
                let new_dist = current_dist.saturating_add(cost);
                if distances.get(&neighbor).map_or(true, |&existing| new_dist < existing) {
                    distances.insert(neighbor, new_dist);
                    previous.insert(neighbor, current);
                    unvisited.push(Reverse((new_dist, neighbor)));
                }
            }
        }

        (distances, previous)
    }
}

fn build_tree(root: PeerId, children: &BTreeMap<PeerId, Vec<PeerId>>) -> Tree<PeerId> {
    let subtrees = children
        .get(&root)
        .map(|kids| kids.iter().map(|&kid| build_tree(kid, children)).collect())
        .unwrap_or_default();
    Tree::with_subtrees(root, subtrees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::NeighborCost;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn id(n: u128) -> PeerId {
        PeerId::from_u128(n)
    }

    fn set(ids: &[u128]) -> BTreeSet<PeerId> {
        ids.iter().map(|&n| id(n)).collect()
    }

    /// Undirected graph helper: installs both directions of every link
    fn table(local: u128, links: &[(u128, u128, u32)]) -> LinkStateRoutingTable {
        let mut adjacency: BTreeMap<u128, Vec<NeighborCost>> = BTreeMap::new();
        for &(a, b, cost) in links {
            adjacency.entry(a).or_default().push(NeighborCost::new(id(b), cost));
            adjacency.entry(b).or_default().push(NeighborCost::new(id(a), cost));
        }
        let mut table = LinkStateRoutingTable::new(id(local));
        for (peer, neighbors) in adjacency {
            if peer == local {
                for neighbor in neighbors {
                    table.update_neighbor_cost(neighbor.peer, neighbor.cost);
                }
            } else {
                table.update_link_state(id(peer), &neighbors);
            }
        }
        table
    }

    #[test]
    fn test_chain() {
        let table = table(1, &[(1, 2, 1), (2, 3, 1)]);
        let tree = table.hop_tree(&set(&[3])).unwrap();
        let expected = Tree::with_subtrees(
            id(1),
            vec![Tree::with_subtrees(id(2), vec![Tree::leaf(id(3))])],
        );
        assert_eq!(tree, expected);
    }

    #[test]
    fn test_direct_fan_out() {
        let table = table(1, &[(1, 3, 1), (1, 2, 1)]);
        let tree = table.hop_tree(&set(&[1, 2, 3])).unwrap();
        let expected = Tree::with_subtrees(id(1), vec![Tree::leaf(id(2)), Tree::leaf(id(3))]);
        assert_eq!(tree, expected);
    }

    #[test]
    fn test_shared_relay() {
        // Both destinations are cheaper through relay 2 than directly
        let table = table(1, &[(1, 2, 1), (2, 3, 1), (2, 4, 1), (1, 3, 3), (1, 4, 3)]);
        let tree = table.hop_tree(&set(&[3, 4])).unwrap();
        let expected = Tree::with_subtrees(
            id(1),
            vec![Tree::with_subtrees(
                id(2),
                vec![Tree::leaf(id(3)), Tree::leaf(id(4))],
            )],
        );
        assert_eq!(tree, expected);
    }

    #[test]
    fn test_destination_on_path() {
        let table = table(1, &[(1, 2, 1), (2, 3, 1)]);
        let tree = table.hop_tree(&set(&[2, 3])).unwrap();
        assert_eq!(tree.vertex_count(), 3);
        assert_eq!(tree.path_to(&id(3)), Some(vec![&id(1), &id(2), &id(3)]));
    }

    #[test]
    fn test_errors() {
        let table = table(1, &[(1, 2, 1)]);
        assert_eq!(table.hop_tree(&set(&[])), Err(TopologyError::NoDestinations));
        assert_eq!(table.hop_tree(&set(&[1])), Err(TopologyError::NoDestinations));
        assert_eq!(
            table.hop_tree(&set(&[2, 9])),
            Err(TopologyError::Unreachable(id(9)))
        );
    }

    fn assert_edges_exist(table: &LinkStateRoutingTable, tree: &Tree<PeerId>) {
        for subtree in &tree.subtrees {
            let edges = table.edges(&tree.value).expect("parent has edges");
            assert!(edges.contains_key(&subtree.value));
            assert_edges_exist(table, subtree);
        }
    }

    #[test]
    fn test_random_trees_span_destinations() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let size = rng.gen_range(3..10u128);
            let mut links = Vec::new();
            // A random spanning chain keeps the graph connected
            for peer in 1..size {
                links.push((rng.gen_range(0..peer), peer, rng.gen_range(1..10)));
            }
            for _ in 0..size {
                let a = rng.gen_range(0..size);
                let b = rng.gen_range(0..size);
                if a != b {
                    links.push((a, b, rng.gen_range(1..10)));
                }
            }
            let table = table(0, &links);
            let destinations: BTreeSet<PeerId> =
                (1..size).filter(|_| rng.gen_bool(0.5)).map(id).collect();
            if destinations.is_empty() {
                continue;
            }

            let tree = table.hop_tree(&destinations).unwrap();
            assert_eq!(tree.value, id(0));
            for destination in &destinations {
                assert!(tree.contains(destination));
            }
            // No vertex appears twice
            let values = tree.values();
            let unique: BTreeSet<_> = values.iter().collect();
            assert_eq!(unique.len(), values.len());
            assert_edges_exist(&table, &tree);
        }
    }
}
