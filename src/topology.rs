//! The master's live view of the mesh topology.
//!
//! An undirected graph over node identifiers, fed by the uplink phase with
//! the neighbor bitsets collected from the mesh: an edge is added when a
//! bitset advertises it and removed when a later bitset from the same node
//! no longer does. The scheduler watches the `modified` flag to know when to
//! recompute.

use crate::neighbor::NeighborBitset;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default)]
pub struct TopologyMap {
    /// Normalized (low, high) pairs.
    edges: BTreeSet<(u8, u8)>,
    modified: bool,
}

fn ordered(a: u8, b: u8) -> (u8, u8) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

impl TopologyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, a: u8, b: u8) {
        if a != b && self.edges.insert(ordered(a, b)) {
            self.modified = true;
        }
    }

    pub fn remove_edge(&mut self, a: u8, b: u8) {
        if self.edges.remove(&ordered(a, b)) {
            self.modified = true;
        }
    }

    pub fn has_edge(&self, a: u8, b: u8) -> bool {
        self.edges.contains(&ordered(a, b))
    }

    pub fn has_node(&self, a: u8) -> bool {
        self.edges.iter().any(|(x, y)| *x == a || *y == a)
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// All edges as (low, high) pairs.
    pub fn edges(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        self.edges.iter().copied()
    }

    /// Nodes adjacent to `a`.
    pub fn neighbors_of(&self, a: u8) -> Vec<u8> {
        self.edges
            .iter()
            .filter_map(|&(x, y)| {
                if x == a {
                    Some(y)
                } else if y == a {
                    Some(x)
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn remove_node(&mut self, a: u8) {
        let before = self.edges.len();
        self.edges.retain(|(x, y)| *x != a && *y != a);
        if self.edges.len() != before {
            self.modified = true;
        }
    }

    /// Reconcile the graph with a freshly received neighbor bitset of
    /// `node`: present bits add edges, absent bits remove them. Edges
    /// touching `skip` are left alone; the master manages its own edges
    /// from direct receptions, which the bitsets cannot see.
    pub fn apply_bitset(
        &mut self,
        node: u8,
        neighbors: &NeighborBitset,
        node_count: u8,
        skip: Option<u8>,
    ) {
        for other in 0..node_count {
            if other == node || Some(other) == skip {
                continue;
            }
            if neighbors.get(other) {
                self.add_edge(node, other);
            } else {
                self.remove_edge(node, other);
            }
        }
    }

    pub fn was_modified(&self) -> bool {
        self.modified
    }

    pub fn clear_modified(&mut self) {
        self.modified = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_are_undirected() {
        let mut map = TopologyMap::new();
        map.add_edge(2, 1);
        assert!(map.has_edge(1, 2));
        assert!(map.has_edge(2, 1));
        assert_eq!(map.neighbors_of(1), vec![2]);
        assert_eq!(map.neighbors_of(2), vec![1]);
    }

    #[test]
    fn modified_flag_tracks_changes() {
        let mut map = TopologyMap::new();
        map.add_edge(0, 1);
        assert!(map.was_modified());
        map.clear_modified();
        map.add_edge(0, 1);
        assert!(!map.was_modified());
        map.remove_edge(0, 1);
        assert!(map.was_modified());
    }

    #[test]
    fn bitset_application_adds_and_removes() {
        let mut map = TopologyMap::new();
        let mut bits = NeighborBitset::new(8);
        bits.set(0, true);
        bits.set(3, true);
        map.apply_bitset(2, &bits, 8, None);
        assert!(map.has_edge(2, 0));
        assert!(map.has_edge(2, 3));

        bits.set(3, false);
        map.apply_bitset(2, &bits, 8, None);
        assert!(map.has_edge(2, 0));
        assert!(!map.has_edge(2, 3));
    }

    #[test]
    fn bitset_application_skips_excluded_node() {
        let mut map = TopologyMap::new();
        map.add_edge(0, 2);
        let bits = NeighborBitset::new(8);
        // An all-zero bitset would remove the edge to the master, but the
        // master's own edges are excluded from reconciliation.
        map.apply_bitset(2, &bits, 8, Some(0));
        assert!(map.has_edge(0, 2));
    }

    #[test]
    fn remove_node_drops_all_edges() {
        let mut map = TopologyMap::new();
        map.add_edge(0, 1);
        map.add_edge(1, 2);
        map.add_edge(0, 2);
        map.remove_node(1);
        assert!(!map.has_node(1));
        assert!(map.has_edge(0, 2));
    }
}
