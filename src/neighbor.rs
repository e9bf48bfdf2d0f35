//! Neighbor tracking and the neighbor-table wire format.
//!
//! Every dynamic node advertises the set of nodes it can hear as a bitset of
//! `ceil(maxNodes / 8)` bytes. Alongside the bitset it keeps per-neighbor
//! freshness counters: a neighbor missed for too many uplink rounds is
//! purged, and the best fresh predecessor (lower hop, strongest RSSI) is the
//! assignee of the node's uplink messages.

use crate::packet::{Packet, PacketError};

/// Bitset over node identifiers, bit `i` set iff node `i` is a neighbor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborBitset {
    bits: Vec<u8>,
    node_count: u8,
}

impl NeighborBitset {
    pub fn new(node_count: u8) -> Self {
        NeighborBitset {
            bits: vec![0; Self::byte_size(node_count)],
            node_count,
        }
    }

    pub const fn byte_size(node_count: u8) -> usize {
        (node_count as usize + 7) / 8
    }

    pub fn set(&mut self, node: u8, present: bool) {
        assert!(node < self.node_count);
        let mask = 1u8 << (node % 8);
        if present {
            self.bits[node as usize / 8] |= mask;
        } else {
            self.bits[node as usize / 8] &= !mask;
        }
    }

    pub fn get(&self, node: u8) -> bool {
        node < self.node_count && self.bits[node as usize / 8] & (1 << (node % 8)) != 0
    }

    /// Node ids whose bit is set, ascending.
    pub fn ones(&self) -> impl Iterator<Item = u8> + '_ {
        (0..self.node_count).filter(|n| self.get(*n))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn serialize(&self, pkt: &mut Packet) -> Result<(), PacketError> {
        pkt.put(&self.bits)
    }

    pub fn deserialize(pkt: &mut Packet, node_count: u8) -> Result<Self, PacketError> {
        let mut bits = vec![0u8; Self::byte_size(node_count)];
        pkt.get(&mut bits)?;
        Ok(NeighborBitset { bits, node_count })
    }
}

/// A node's neighbor bitset together with its hop count, as collected and
/// forwarded in uplink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyElement {
    pub node: u8,
    pub neighbors: NeighborBitset,
}

impl TopologyElement {
    pub const fn size(node_count: u8) -> usize {
        1 + NeighborBitset::byte_size(node_count)
    }

    pub fn serialize(&self, pkt: &mut Packet) -> Result<(), PacketError> {
        pkt.put(&[self.node])?;
        self.neighbors.serialize(pkt)
    }

    pub fn deserialize(pkt: &mut Packet, node_count: u8) -> Result<Self, PacketError> {
        let [node] = pkt.get_array::<1>()?;
        let neighbors = NeighborBitset::deserialize(pkt, node_count)?;
        Ok(TopologyElement { node, neighbors })
    }
}

#[derive(Debug, Clone, Copy)]
struct NeighborEntry {
    /// Uplink rounds since this neighbor was last heard; 0 = fresh.
    unseen_since: u8,
    /// Hop count the neighbor last advertised.
    hop: u8,
    rssi: i8,
}

/// Per-node view of its radio neighborhood.
#[derive(Debug)]
pub struct NeighborTable {
    entries: Vec<Option<NeighborEntry>>,
    my_id: u8,
    my_hop: u8,
    min_rssi: i8,
    max_unseen: u8,
}

impl NeighborTable {
    pub fn new(node_count: u8, my_id: u8, min_rssi: i8, max_unseen: u8) -> Self {
        NeighborTable {
            entries: vec![None; node_count as usize],
            my_id,
            my_hop: 0,
            min_rssi,
            max_unseen,
        }
    }

    pub fn set_hop(&mut self, hop: u8) {
        self.my_hop = hop;
    }

    pub fn hop(&self) -> u8 {
        self.my_hop
    }

    /// Record a successful uplink reception from `node`.
    ///
    /// Nodes weaker than the configured RSSI floor are not admitted as
    /// neighbors; an already-known neighbor fading below the floor is kept
    /// until it ages out.
    pub fn received_message(&mut self, node: u8, hop: u8, rssi: i8) {
        let slot = &mut self.entries[node as usize];
        match slot {
            Some(entry) => {
                entry.unseen_since = 0;
                entry.hop = hop;
                entry.rssi = rssi;
            }
            None if rssi >= self.min_rssi => {
                *slot = Some(NeighborEntry {
                    unseen_since: 0,
                    hop,
                    rssi,
                });
            }
            None => {}
        }
    }

    /// Record a missed uplink reception from `node`; purges it once it has
    /// been unseen for the configured number of rounds.
    pub fn missed_message(&mut self, node: u8) {
        if let Some(entry) = &mut self.entries[node as usize] {
            entry.unseen_since += 1;
            if entry.unseen_since >= self.max_unseen {
                self.entries[node as usize] = None;
            }
        }
    }

    pub fn is_neighbor(&self, node: u8) -> bool {
        self.entries[node as usize].is_some()
    }

    /// The neighbor this node forwards its uplink data to: the strongest
    /// fresh neighbor with a hop count lower than ours.
    pub fn best_predecessor(&self) -> Option<u8> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(node, entry)| entry.map(|e| (node as u8, e)))
            .filter(|(_, e)| e.unseen_since == 0 && e.hop < self.my_hop)
            .max_by_key(|(_, e)| e.rssi)
            .map(|(node, _)| node)
    }

    /// The bitset advertised in this node's uplink messages.
    pub fn my_topology_element(&self, node_count: u8) -> TopologyElement {
        let mut neighbors = NeighborBitset::new(node_count);
        for (node, entry) in self.entries.iter().enumerate() {
            if entry.is_some() {
                neighbors.set(node as u8, true);
            }
        }
        TopologyElement {
            node: self.my_id,
            neighbors,
        }
    }
}
