//! Uplink phase: topology and stream-request collection.
//!
//! The schedule is deterministic: in uplink tile number `p`, node
//! `N - 1 - (p mod (N - 1))` transmits and everyone else listens (the
//! master never transmits here). The nominated node sends its neighbor
//! bitset plus as many queued forwarded topologies and SMEs as fit,
//! addressed to its best predecessor; data hops towards the master one
//! uplink round at a time.
//!
//! Uplink frame layout:
//! ```norust
//! short header (5) | hop:8 | assignee:8 | numTopology:8 | numSME:8 |
//! sender bitset (first packet only) | ForwardedNeighborMessage * | SME *
//! ```

use crate::frame::{check_short_header, put_short_header, SHORT_HEADER_SIZE};
use crate::mac::MacContext;
use crate::neighbor::{NeighborBitset, NeighborTable, TopologyElement};
use crate::packet::{Packet, PacketError, MAX_PACKET_SIZE};
use crate::parameters::{
    MAX_PROPAGATION_DELAY, PACKET_ARRIVAL_AND_PROCESSING_TIME, PACKET_PREAMBLE_TIME,
    RECEIVING_NODE_WAKEUP_ADVANCE, TRANSMISSION_INTERVAL,
};
use crate::queue::UpdatableQueue;
use crate::schedule_computation::ScheduleComputation;
use crate::stream::{StreamId, StreamManagementElement};
use crate::stream_manager::StreamManager;
use crate::time::{LocalTime, NetworkTime};
use log::{debug, trace};

const UPLINK_HEADER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UplinkHeader {
    hop: u8,
    assignee: u8,
    num_topology: u8,
    num_sme: u8,
}

impl UplinkHeader {
    fn serialize(&self, pkt: &mut Packet) -> Result<(), PacketError> {
        pkt.put(&[self.hop, self.assignee, self.num_topology, self.num_sme])
    }

    fn deserialize(pkt: &mut Packet) -> Result<Self, PacketError> {
        let [hop, assignee, num_topology, num_sme] = pkt.get_array::<4>()?;
        Ok(UplinkHeader {
            hop,
            assignee,
            num_topology,
            num_sme,
        })
    }
}

/// One parsed uplink packet.
struct ParsedUplink {
    header: UplinkHeader,
    /// Present in the first packet of a node's transmission only.
    sender_topology: Option<NeighborBitset>,
    topologies: Vec<TopologyElement>,
    smes: Vec<StreamManagementElement>,
}

fn parse_uplink(
    pkt: &mut Packet,
    pan_id: u16,
    node_count: u8,
    first: bool,
) -> Option<ParsedUplink> {
    check_short_header(pkt, pan_id).ok()?;
    let header = UplinkHeader::deserialize(pkt).ok()?;
    let sender_topology = if first {
        Some(NeighborBitset::deserialize(pkt, node_count).ok()?)
    } else {
        None
    };
    let mut topologies = Vec::with_capacity(header.num_topology as usize);
    for _ in 0..header.num_topology {
        topologies.push(TopologyElement::deserialize(pkt, node_count).ok()?);
    }
    let mut smes = Vec::with_capacity(header.num_sme as usize);
    for _ in 0..header.num_sme {
        smes.push(StreamManagementElement::deserialize(pkt).ok()?);
    }
    Some(ParsedUplink {
        header,
        sender_topology,
        topologies,
        smes,
    })
}

/// Role-specific half of the uplink phase.
pub enum UplinkRole {
    Master {
        computation: ScheduleComputation,
        /// Missed-round counters for direct neighbors of the master.
        unseen: Vec<u8>,
    },
    Dynamic,
}

pub struct UplinkPhase {
    role: UplinkRole,
    pub neighbors: NeighborTable,
    topology_queue: UpdatableQueue<u8, TopologyElement>,
    sme_queue: UpdatableQueue<StreamId, StreamManagementElement>,
    nodes_count: u8,
    next_node: u8,
}

impl UplinkPhase {
    pub fn new_dynamic(neighbors: NeighborTable, nodes_count: u8) -> Self {
        UplinkPhase {
            role: UplinkRole::Dynamic,
            neighbors,
            topology_queue: UpdatableQueue::new(),
            sme_queue: UpdatableQueue::new(),
            nodes_count,
            next_node: nodes_count - 1,
        }
    }

    pub fn new_master(
        computation: ScheduleComputation,
        neighbors: NeighborTable,
        nodes_count: u8,
    ) -> Self {
        UplinkPhase {
            role: UplinkRole::Master {
                computation,
                unseen: vec![0; nodes_count as usize],
            },
            neighbors,
            topology_queue: UpdatableQueue::new(),
            sme_queue: UpdatableQueue::new(),
            nodes_count,
            next_node: nodes_count - 1,
        }
    }

    /// The node transmitting in this uplink tile; advances the round-robin
    /// cursor.
    fn current_node(&mut self) -> u8 {
        let current = self.next_node;
        self.next_node = if self.next_node <= 1 {
            self.nodes_count - 1
        } else {
            self.next_node - 1
        };
        current
    }

    /// Re-seed the round-robin cursor after a (re)synchronization, from
    /// the number of uplink tiles elapsed since network time zero.
    pub fn align_to_network_time(&mut self, nt: NetworkTime, config: &crate::parameters::NetworkConfiguration) {
        let superframe = &config.control_superframe;
        let superframe_duration = config.superframe_duration();
        let uplinks = superframe.uplinks_per_superframe() as i64;

        let superframe_count = nt.get() / superframe_duration;
        let mut within = nt.get() % superframe_duration;
        let mut phase = superframe_count * uplinks;
        for i in 0..superframe.size() {
            if within < config.tile_duration {
                break;
            }
            within -= config.tile_duration;
            if superframe.is_control_uplink(i) {
                phase += 1;
            }
        }
        let n = self.nodes_count as i64;
        self.next_node = (n - 1 - (phase % (n - 1))) as u8;
    }

    pub fn execute(
        &mut self,
        ctx: &mut MacContext,
        stream_mgr: &StreamManager,
        slot_start: LocalTime,
    ) {
        let node = self.current_node();
        trace!("[U] N={} T={}", node, slot_start.get());

        match &self.role {
            UplinkRole::Dynamic if node == ctx.network_id() => {
                self.send_my_uplink(ctx, stream_mgr, slot_start)
            }
            UplinkRole::Dynamic => self.receive_uplink_dynamic(ctx, node, slot_start),
            UplinkRole::Master { .. } => {
                // The master's own stream requests enter the collection
                // directly, without going over the air.
                let own = stream_mgr.dequeue_smes(usize::MAX);
                if let UplinkRole::Master { computation, .. } = &self.role {
                    computation.add_smes(own);
                }
                self.receive_uplink_master(ctx, node, slot_start);
            }
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    fn send_my_uplink(
        &mut self,
        ctx: &mut MacContext,
        stream_mgr: &StreamManager,
        slot_start: LocalTime,
    ) {
        let config = ctx.config().clone();
        let my_hop = ctx.hop();
        let assignee = self.neighbors.best_predecessor().unwrap_or(0);
        let num_packets = config.num_uplink_packets.max(1);
        let topo_size = TopologyElement::size(config.max_nodes);
        let mut forwarded_left = config.max_forwarded_topologies as usize;

        debug!("[U] N={} -> assignee {}", ctx.network_id(), slot_start.get());
        ctx.configure_radio(false);
        let mut send_time = slot_start;
        for packet_idx in 0..num_packets {
            let first = packet_idx == 0;
            let mut pkt = Packet::new();
            if put_short_header(&mut pkt, config.pan_id, my_hop).is_err() {
                break;
            }
            let mut space = MAX_PACKET_SIZE - SHORT_HEADER_SIZE - UPLINK_HEADER_SIZE;
            if first {
                space -= NeighborBitset::byte_size(config.max_nodes);
            }

            let mut topologies = Vec::new();
            while forwarded_left > 0
                && space >= topo_size
                && !self.topology_queue.is_empty()
                && topologies.len() < u8::MAX as usize
            {
                if let Some(t) = self.topology_queue.dequeue() {
                    topologies.push(t);
                    space -= topo_size;
                    forwarded_left -= 1;
                }
            }

            let mut smes = stream_mgr.dequeue_smes(space / StreamManagementElement::SIZE);
            space -= smes.len() * StreamManagementElement::SIZE;
            while space >= StreamManagementElement::SIZE && !self.sme_queue.is_empty() {
                if let Some(sme) = self.sme_queue.dequeue() {
                    smes.push(sme);
                    space -= StreamManagementElement::SIZE;
                }
            }

            let header = UplinkHeader {
                hop: my_hop,
                assignee,
                num_topology: topologies.len() as u8,
                num_sme: smes.len() as u8,
            };
            let mut ok = header.serialize(&mut pkt).is_ok();
            if first && ok {
                ok = self
                    .neighbors
                    .my_topology_element(config.max_nodes)
                    .neighbors
                    .serialize(&mut pkt)
                    .is_ok();
            }
            for t in &topologies {
                ok = ok && t.serialize(&mut pkt).is_ok();
            }
            for sme in &smes {
                ok = ok && sme.serialize(&mut pkt).is_ok();
            }
            if !ok {
                debug!("[U] uplink packet overflow, dropping");
                break;
            }

            ctx.send_packet_at(&pkt, send_time);
            send_time =
                send_time.add_ns(PACKET_ARRIVAL_AND_PROCESSING_TIME + TRANSMISSION_INTERVAL);
        }
        ctx.radio_idle();
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    fn recv_one(
        &mut self,
        ctx: &mut MacContext,
        expected_arrival: LocalTime,
        first: bool,
    ) -> Option<(ParsedUplink, i8)> {
        let config = ctx.config();
        let deadline = expected_arrival.add_ns(
            config.max_admitted_rcv_window + PACKET_PREAMBLE_TIME + MAX_PROPAGATION_DELAY,
        );
        let wakeup = expected_arrival.sub_ns(RECEIVING_NODE_WAKEUP_ADVANCE);
        let node_count = config.max_nodes;
        let pan_id = config.pan_id;
        if ctx.now() < wakeup {
            ctx.sleep_until(wakeup);
        }
        let mut pkt = Packet::new();
        let rcv = ctx.recv_packet(&mut pkt, deadline).ok()?;
        let parsed = parse_uplink(&mut pkt, pan_id, node_count, first)?;
        Some((parsed, rcv.rssi))
    }

    /// Listen for the nominated node and integrate what it sends.
    fn receive_uplink_dynamic(&mut self, ctx: &mut MacContext, node: u8, slot_start: LocalTime) {
        ctx.configure_radio(true);
        let my_id = ctx.network_id();
        let num_packets = ctx.config().num_uplink_packets.max(1);

        match self.recv_one(ctx, slot_start, true) {
            Some((parsed, rssi)) => {
                self.neighbors
                    .received_message(node, parsed.header.hop, rssi);
                debug!("[U]<-N={} {}dBm", node, rssi);

                if parsed.header.assignee == my_id {
                    if let Some(bits) = parsed.sender_topology {
                        self.topology_queue
                            .enqueue(node, TopologyElement { node, neighbors: bits });
                    }
                    self.enqueue_forwarded(parsed.topologies, parsed.smes);

                    let mut arrival = slot_start;
                    for _ in 1..num_packets {
                        arrival = arrival
                            .add_ns(PACKET_ARRIVAL_AND_PROCESSING_TIME + TRANSMISSION_INTERVAL);
                        match self.recv_one(ctx, arrival, false) {
                            Some((more, _)) => {
                                self.enqueue_forwarded(more.topologies, more.smes)
                            }
                            None => break,
                        }
                    }
                }
            }
            None => {
                self.neighbors.missed_message(node);
                trace!("[U] miss N={node}");
            }
        }
        ctx.radio_idle();
    }

    fn enqueue_forwarded(
        &mut self,
        topologies: Vec<TopologyElement>,
        smes: Vec<StreamManagementElement>,
    ) {
        for t in topologies {
            self.topology_queue.enqueue(t.node, t);
        }
        for sme in smes {
            self.sme_queue.enqueue(sme.id, sme);
        }
    }

    /// Master reception: everything heard goes straight into the live
    /// topology graph and stream collection.
    fn receive_uplink_master(&mut self, ctx: &mut MacContext, node: u8, slot_start: LocalTime) {
        ctx.configure_radio(true);
        let num_packets = ctx.config().num_uplink_packets.max(1);
        let max_nodes = ctx.config().max_nodes;
        let min_rssi = ctx.config().min_neighbor_rssi;
        let max_unseen = ctx.config().max_rounds_unavailable_becomes_dead;

        let mut received = Vec::new();
        match self.recv_one(ctx, slot_start, true) {
            Some((parsed, rssi)) => {
                received.push(parsed);
                let mut arrival = slot_start;
                for _ in 1..num_packets {
                    arrival =
                        arrival.add_ns(PACKET_ARRIVAL_AND_PROCESSING_TIME + TRANSMISSION_INTERVAL);
                    match self.recv_one(ctx, arrival, false) {
                        Some((more, _)) => received.push(more),
                        None => break,
                    }
                }
                ctx.radio_idle();
                self.master_integrate(node, rssi, min_rssi, max_nodes, received);
            }
            None => {
                ctx.radio_idle();
                self.master_missed(node, max_unseen);
            }
        }
    }

    fn master_integrate(
        &mut self,
        node: u8,
        rssi: i8,
        min_rssi: i8,
        max_nodes: u8,
        packets: Vec<ParsedUplink>,
    ) {
        let UplinkRole::Master { computation, unseen } = &mut self.role else {
            return;
        };
        unseen[node as usize] = 0;
        computation.with_state(|state| {
            // A direct reception is the master's only source for its own
            // edges.
            if rssi >= min_rssi {
                state.topology.add_edge(0, node);
            }
            let mut smes = Vec::new();
            for parsed in packets {
                if let Some(bits) = parsed.sender_topology {
                    state.topology.apply_bitset(node, &bits, max_nodes, Some(0));
                }
                for t in parsed.topologies {
                    state.topology.apply_bitset(t.node, &t.neighbors, max_nodes, Some(0));
                }
                smes.extend(parsed.smes);
            }
            state.streams.receive(smes);
        });
        computation.begin_scheduling();
    }

    fn master_missed(&mut self, node: u8, max_unseen: u8) {
        let UplinkRole::Master { computation, unseen } = &mut self.role else {
            return;
        };
        unseen[node as usize] = unseen[node as usize].saturating_add(1);
        if unseen[node as usize] == max_unseen {
            debug!("[U] node {node} unseen for {max_unseen} rounds, purging");
            computation.with_state(|state| {
                state.topology.remove_node(node);
            });
            computation.begin_scheduling();
        }
    }
}
