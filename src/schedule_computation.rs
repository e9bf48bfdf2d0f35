//! Centralized schedule computation, master only.
//!
//! A worker thread owns nothing: it snapshots the topology graph and the
//! stream collection under their mutex, routes every stream over the graph
//! and assigns conflict-free slot offsets, then publishes the new implicit
//! schedule for the distribution phase to pick up. The uplink phase wakes
//! the worker through a condition variable whenever either input changes.

use crate::parameters::NetworkConfiguration;
use crate::queue::UpdatableQueue;
use crate::schedule::{InfoElement, InfoKind, ScheduleElement};
use crate::stream::{
    MasterStreamInfo, MasterStreamStatus, SmeKind, StreamId, StreamManagementElement,
};
use crate::topology::TopologyMap;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Master-side set of streams and servers, fed by uplink, snapshotted by
/// the scheduler.
#[derive(Debug, Default)]
pub struct StreamCollection {
    collection: HashMap<StreamId, MasterStreamInfo>,
    info_queue: UpdatableQueue<StreamId, InfoElement>,
    modified: bool,
    removed: bool,
    added: bool,
}

impl StreamCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a batch of SMEs collected from the mesh.
    pub fn receive(&mut self, smes: Vec<StreamManagementElement>) {
        for sme in smes {
            match sme.kind {
                SmeKind::Listen => self.open_server(sme),
                SmeKind::Connect => self.open_stream(sme),
                SmeKind::Closed => self.close(sme.id),
            }
        }
    }

    fn open_server(&mut self, sme: StreamManagementElement) {
        self.collection
            .entry(sme.id)
            .or_insert_with(|| MasterStreamInfo {
                id: sme.id,
                parameters: sme.parameters,
                status: MasterStreamStatus::Listen,
            });
        // Acknowledge every round until the server stops asking.
        self.queue_info(sme.id, InfoKind::ServerOpened);
    }

    fn open_stream(&mut self, sme: StreamManagementElement) {
        let server_present = self
            .collection
            .get(&sme.id.server_id())
            .map(|s| s.status == MasterStreamStatus::Listen)
            .unwrap_or(false);
        match self.collection.get_mut(&sme.id) {
            Some(existing) => {
                if existing.status == MasterStreamStatus::Rejected && server_present {
                    existing.status = MasterStreamStatus::Accepted;
                    self.modified = true;
                    self.added = true;
                }
            }
            None if server_present => {
                self.collection.insert(
                    sme.id,
                    MasterStreamInfo {
                        id: sme.id,
                        parameters: sme.parameters,
                        status: MasterStreamStatus::Accepted,
                    },
                );
                self.modified = true;
                self.added = true;
            }
            None => {
                debug!("stream {} rejected: no server", sme.id.key());
                self.collection.insert(
                    sme.id,
                    MasterStreamInfo {
                        id: sme.id,
                        parameters: sme.parameters,
                        status: MasterStreamStatus::Rejected,
                    },
                );
                self.queue_info(sme.id, InfoKind::StreamReject);
            }
        }
    }

    fn close(&mut self, id: StreamId) {
        if let Some(info) = self.collection.remove(&id) {
            if info.status == MasterStreamStatus::Listen {
                self.queue_info(id, InfoKind::ServerClosed);
            } else {
                self.modified = true;
                self.removed = true;
            }
        }
    }

    pub fn queue_info(&mut self, id: StreamId, kind: InfoKind) {
        self.info_queue.enqueue(id, InfoElement { id, kind });
    }

    pub fn dequeue_info(&mut self, count: usize) -> Vec<InfoElement> {
        self.info_queue.dequeue_up_to(count)
    }

    pub fn num_info(&self) -> usize {
        self.info_queue.len()
    }

    pub fn set_status(&mut self, id: StreamId, status: MasterStreamStatus) {
        if let Some(info) = self.collection.get_mut(&id) {
            info.status = status;
        }
    }

    pub fn stream_number(&self) -> usize {
        self.collection
            .values()
            .filter(|s| s.status != MasterStreamStatus::Listen)
            .count()
    }

    pub fn streams_with_status(&self, status: MasterStreamStatus) -> Vec<MasterStreamInfo> {
        let mut v: Vec<_> = self
            .collection
            .values()
            .filter(|s| s.status == status)
            .copied()
            .collect();
        v.sort_by_key(|s| s.id.key());
        v
    }

    pub fn was_modified(&self) -> bool {
        self.modified
    }

    pub fn was_removed(&self) -> bool {
        self.removed
    }

    pub fn was_added(&self) -> bool {
        self.added
    }

    pub fn clear_flags(&mut self) {
        self.modified = false;
        self.removed = false;
        self.added = false;
    }

    fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            established: self.streams_with_status(MasterStreamStatus::Established),
            new: self.streams_with_status(MasterStreamStatus::Accepted),
            removed: self.removed,
        }
    }
}

#[derive(Debug, Clone)]
struct StreamSnapshot {
    established: Vec<MasterStreamInfo>,
    new: Vec<MasterStreamInfo>,
    removed: bool,
}

/// State shared between the master uplink phase, the scheduler worker and
/// the distribution phase.
#[derive(Debug, Default)]
pub struct MasterState {
    pub topology: TopologyMap,
    pub streams: StreamCollection,
    schedule: Vec<ScheduleElement>,
    schedule_id: u32,
    schedule_tiles: u16,
    running: bool,
}

pub struct MasterShared {
    state: Mutex<MasterState>,
    wakeup: Condvar,
}

/// Handle to the master scheduling state; clones share the same state.
#[derive(Clone)]
pub struct ScheduleComputation {
    shared: Arc<MasterShared>,
    config: NetworkConfiguration,
}

impl ScheduleComputation {
    pub fn new(config: NetworkConfiguration) -> Self {
        ScheduleComputation {
            shared: Arc::new(MasterShared {
                state: Mutex::new(MasterState {
                    running: true,
                    ..Default::default()
                }),
                wakeup: Condvar::new(),
            }),
            config,
        }
    }

    pub fn config(&self) -> &NetworkConfiguration {
        &self.config
    }

    /// Run `f` with the master state locked; used by the uplink phase to
    /// feed topology and SMEs.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut MasterState) -> R) -> R {
        let mut state = self.shared.state.lock().unwrap();
        f(&mut state)
    }

    /// Enqueue SMEs and signal the worker.
    pub fn add_smes(&self, smes: Vec<StreamManagementElement>) {
        if smes.is_empty() {
            return;
        }
        let mut state = self.shared.state.lock().unwrap();
        state.streams.receive(smes);
        drop(state);
        self.begin_scheduling();
    }

    /// Wake the worker to re-examine its inputs.
    pub fn begin_scheduling(&self) {
        self.shared.wakeup.notify_one();
    }

    /// Current implicit schedule, its identifier and length in tiles.
    pub fn schedule(&self) -> (Vec<ScheduleElement>, u32, u16) {
        let state = self.shared.state.lock().unwrap();
        (state.schedule.clone(), state.schedule_id, state.schedule_tiles)
    }

    pub fn schedule_id(&self) -> u32 {
        self.shared.state.lock().unwrap().schedule_id
    }

    pub fn dequeue_info(&self, count: usize) -> Vec<InfoElement> {
        self.shared.state.lock().unwrap().streams.dequeue_info(count)
    }

    pub fn num_info(&self) -> usize {
        self.shared.state.lock().unwrap().streams.num_info()
    }

    pub fn start_thread(&self) -> JoinHandle<()> {
        let this = self.clone();
        std::thread::spawn(move || this.run())
    }

    pub fn stop(&self) {
        self.shared.state.lock().unwrap().running = false;
        self.shared.wakeup.notify_all();
    }

    fn run(&self) {
        loop {
            let (snapshot, topology) = {
                let mut state = self.shared.state.lock().unwrap();
                loop {
                    if !state.running {
                        return;
                    }
                    let inputs_changed = state.topology.was_modified()
                        || state.streams.was_modified();
                    if state.streams.stream_number() > 0
                        && !state.topology.is_empty()
                        && inputs_changed
                    {
                        break;
                    }
                    state = self.shared.wakeup.wait(state).unwrap();
                }
                (state.streams.snapshot(), state.topology.clone())
            };
            // From here on only the snapshots are used.
            self.compute_round(snapshot, topology);
        }
    }

    /// One full scheduling round over a consistent snapshot.
    fn compute_round(&self, snapshot: StreamSnapshot, topology: TopologyMap) {
        info!(
            "schedule computation: {} established, {} new",
            snapshot.established.len(),
            snapshot.new.len()
        );
        let topology_changed = topology.was_modified();

        let mut state = self.shared.state.lock().unwrap();
        let mut schedule = state.schedule.clone();
        let mut schedule_tiles = state.schedule_tiles;
        drop(state);

        let mut rejected = Vec::new();

        // Established streams keep their offsets unless the graph changed
        // or a stream disappeared; then everything is redone from scratch.
        if topology_changed || snapshot.removed {
            debug!("topology changed or stream removed: rescheduling established streams");
            let scheduler = SlotScheduler::new(&self.config, &topology);
            let (elements, tiles, rej) =
                scheduler.route_and_schedule(&snapshot.established, Vec::new(), 0);
            schedule = elements;
            schedule_tiles = tiles;
            rejected.extend(rej);
        } else {
            debug!("keeping established schedule");
        }

        // New streams are appended, longest period first.
        if !snapshot.new.is_empty() {
            let mut new_streams = snapshot.new.clone();
            new_streams.sort_by(|a, b| {
                b.parameters
                    .period
                    .tiles()
                    .cmp(&a.parameters.period.tiles())
            });
            let scheduler = SlotScheduler::new(&self.config, &topology);
            let (elements, tiles, rej) =
                scheduler.route_and_schedule(&new_streams, schedule.clone(), schedule_tiles);
            schedule = elements;
            schedule_tiles = tiles;
            rejected.extend(rej);
        }

        let scheduled_ids: HashSet<StreamId> = schedule.iter().map(|e| e.id).collect();

        let mut state = self.shared.state.lock().unwrap();
        for stream in snapshot.new.iter().chain(snapshot.established.iter()) {
            if scheduled_ids.contains(&stream.id) {
                state.streams.set_status(stream.id, MasterStreamStatus::Established);
            }
        }
        for id in rejected {
            warn!("stream {} rejected by scheduler", id.key());
            state.streams.set_status(id, MasterStreamStatus::Rejected);
            state.streams.queue_info(id, InfoKind::StreamReject);
        }
        state.schedule = schedule;
        // The schedule cycle must stay aligned with the control superframe,
        // so every cycle sees the control slots at the same positions.
        let superframe = self.config.control_superframe.size() as u64;
        state.schedule_tiles = lcm(schedule_tiles.max(1) as u64, superframe) as u16;
        state.schedule_id += 1;
        info!(
            "schedule {} ready: {} transmissions over {} tiles",
            state.schedule_id,
            state.schedule.len(),
            state.schedule_tiles
        );
        state.topology.clear_modified();
        state.streams.clear_flags();
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn lcm(a: u64, b: u64) -> u64 {
    if a == 0 {
        b
    } else if b == 0 {
        a
    } else {
        a / gcd(a, b) * b
    }
}

/// Routing plus slot assignment over one topology snapshot.
struct SlotScheduler<'a> {
    config: &'a NetworkConfiguration,
    topology: &'a TopologyMap,
}

impl<'a> SlotScheduler<'a> {
    fn new(config: &'a NetworkConfiguration, topology: &'a TopologyMap) -> Self {
        SlotScheduler { config, topology }
    }

    /// Route every stream and place its transmissions, starting from an
    /// existing partial schedule. Returns the grown schedule, its length in
    /// tiles and the rejected stream ids.
    fn route_and_schedule(
        &self,
        streams: &[MasterStreamInfo],
        mut placed: Vec<ScheduleElement>,
        mut schedule_tiles: u16,
    ) -> (Vec<ScheduleElement>, u16, Vec<StreamId>) {
        let mut rejected = Vec::new();
        for stream in streams {
            match self.route_stream(stream) {
                Some(block) => {
                    match self.schedule_block(&block, &mut placed, schedule_tiles) {
                        Some(tiles) => schedule_tiles = tiles,
                        None => rejected.push(stream.id),
                    }
                }
                None => {
                    debug!(
                        "no path from {} to {}, cannot schedule stream",
                        stream.id.src, stream.id.dst
                    );
                    rejected.push(stream.id);
                }
            }
        }
        (placed, schedule_tiles, rejected)
    }

    /// Build all transmissions of one stream: the routed path repeated once
    /// per redundancy copy. Spatial redundancy alternates with a
    /// node-disjoint path when the graph offers one.
    fn route_stream(&self, stream: &MasterStreamInfo) -> Option<Vec<ScheduleElement>> {
        let id = stream.id;
        let period = stream.parameters.period;
        let primary = self.find_path(id, period, &HashSet::new())?;

        let redundancy = stream.parameters.redundancy;
        let k = redundancy.count();
        let alternate = if redundancy.is_spatial() {
            let exclude: HashSet<u8> = primary
                .iter()
                .flat_map(|e| [e.tx, e.rx])
                .filter(|n| *n != id.src && *n != id.dst)
                .collect();
            self.find_path(id, period, &exclude)
        } else {
            None
        };

        let mut block = Vec::new();
        for copy in 0..k {
            // Odd copies take the alternate path when one exists.
            let path = if copy % 2 == 1 {
                alternate.as_ref().unwrap_or(&primary)
            } else {
                &primary
            };
            block.extend(path.iter().copied());
        }
        Some(block)
    }

    /// One-hop shortcut, then breadth-first search.
    fn find_path(
        &self,
        id: StreamId,
        period: crate::stream::Period,
        exclude: &HashSet<u8>,
    ) -> Option<Vec<ScheduleElement>> {
        if self.topology.has_edge(id.src, id.dst) {
            return Some(vec![ScheduleElement::single_hop(id, period)]);
        }
        if !self.topology.has_node(id.src) || !self.topology.has_node(id.dst) {
            return None;
        }

        let mut visited: HashSet<u8> = exclude.clone();
        visited.insert(id.src);
        let mut open: VecDeque<u8> = VecDeque::new();
        let mut parent_of: HashMap<u8, u8> = HashMap::new();
        open.push_back(id.src);
        parent_of.insert(id.src, id.src);

        while let Some(subtree_root) = open.pop_front() {
            if subtree_root == id.dst {
                return Some(Self::construct_path(id, period, subtree_root, &parent_of));
            }
            for child in self.topology.neighbors_of(subtree_root) {
                if visited.contains(&child) || parent_of.contains_key(&child) {
                    continue;
                }
                parent_of.insert(child, subtree_root);
                open.push_back(child);
            }
            visited.insert(subtree_root);
        }
        None
    }

    /// Follow the parent-of relation back to the source, emitting one
    /// element per hop in transmission order.
    fn construct_path(
        id: StreamId,
        period: crate::stream::Period,
        node: u8,
        parent_of: &HashMap<u8, u8>,
    ) -> Vec<ScheduleElement> {
        let mut path = Vec::new();
        let mut rx = node;
        let mut tx = parent_of[&rx];
        path.push(ScheduleElement {
            id,
            tx,
            rx,
            period,
            offset: 0,
        });
        while parent_of[&tx] != tx {
            rx = tx;
            tx = parent_of[&rx];
            path.push(ScheduleElement {
                id,
                tx,
                rx,
                period,
                offset: 0,
            });
        }
        path.reverse();
        path
    }

    /// Place every transmission of a block at the first conflict-free
    /// offset, keeping the block strictly sequential. On any failure the
    /// whole block is rolled back and the stream rejected for this round.
    fn schedule_block(
        &self,
        block: &[ScheduleElement],
        placed: &mut Vec<ScheduleElement>,
        schedule_tiles: u16,
    ) -> Option<u16> {
        let slots_per_tile = self.config.slots_per_tile as u32;
        let block_start = placed.len();
        let mut tiles = schedule_tiles;
        let mut last_offset: u32 = 0;

        for (index, transmission) in block.iter().enumerate() {
            if !self.topology.has_edge(transmission.tx, transmission.rx) {
                debug!(
                    "{},{} not connected, cannot schedule stream",
                    transmission.tx, transmission.rx
                );
                placed.truncate(block_start);
                return None;
            }
            let period_tiles = transmission.period.tiles();
            let max_offset = period_tiles * slots_per_tile - 1;
            let mut placed_at = None;
            for offset in last_offset..=max_offset {
                if !self.is_data_slot(offset) {
                    continue;
                }
                let conflict = placed.iter().any(|old| {
                    self.slots_collide(transmission, offset, old)
                        && (Self::unicity_conflict(transmission, old)
                            || self.interference_conflict(transmission, old))
                });
                if !conflict {
                    let mut scheduled = *transmission;
                    scheduled.offset = offset;
                    placed.push(scheduled);
                    tiles = lcm(tiles as u64, period_tiles as u64) as u16;
                    placed_at = Some(offset);
                    break;
                }
            }
            match placed_at {
                Some(offset) => {
                    // The next transmission of the stream must start later,
                    // so multi-hop forwarding stays causal.
                    last_offset = offset + 1;
                    if last_offset > max_offset && index + 1 < block.len() {
                        placed.truncate(block_start);
                        return None;
                    }
                }
                None => {
                    placed.truncate(block_start);
                    return None;
                }
            }
        }
        Some(tiles)
    }

    /// Control slots of downlink and uplink tiles cannot carry data.
    fn is_data_slot(&self, offset: u32) -> bool {
        let slots_per_tile = self.config.slots_per_tile as u32;
        let tile = (offset / slots_per_tile) as usize;
        let slot = offset % slots_per_tile;
        let superframe = &self.config.control_superframe;
        if superframe.is_control_downlink(tile) {
            slot >= self.config.downlink_phase_slots() as u32
        } else if superframe.is_control_uplink(tile) {
            slot >= self.config.uplink_phase_slots() as u32
        } else {
            true
        }
    }

    /// Whether two periodic transmissions ever land in the same slot.
    ///
    /// Both slot sequences are arithmetic progressions; they share a slot
    /// iff the offsets are congruent modulo the gcd of the periods.
    fn slots_collide(&self, a: &ScheduleElement, offset_a: u32, b: &ScheduleElement) -> bool {
        let slots_per_tile = self.config.slots_per_tile as u32;
        if offset_a % slots_per_tile != b.offset % slots_per_tile {
            return false;
        }
        let step_a = a.period.tiles() as u64 * slots_per_tile as u64;
        let step_b = b.period.tiles() as u64 * slots_per_tile as u64;
        let g = gcd(step_a, step_b);
        (offset_a as i64 - b.offset as i64).rem_euclid(g as i64) == 0
    }

    /// No node may be an endpoint of two transmissions in the same slot.
    fn unicity_conflict(a: &ScheduleElement, b: &ScheduleElement) -> bool {
        a.tx == b.tx || a.tx == b.rx || a.rx == b.tx || a.rx == b.rx
    }

    /// No transmission may happen next to a receiver (or reception next to
    /// a transmitter) one hop away.
    fn interference_conflict(&self, a: &ScheduleElement, b: &ScheduleElement) -> bool {
        self.topology.has_edge(a.tx, b.rx) || self.topology.has_edge(a.rx, b.tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Direction, Period, Redundancy, StreamParameters};

    fn config() -> NetworkConfiguration {
        NetworkConfiguration::default()
    }

    fn stream(src: u8, dst: u8, port: u8, params: StreamParameters) -> MasterStreamInfo {
        MasterStreamInfo {
            id: StreamId::new(src, dst, 0, port),
            parameters: params,
            status: MasterStreamStatus::Accepted,
        }
    }

    fn p(period: Period, redundancy: Redundancy) -> StreamParameters {
        StreamParameters::new(redundancy, period, 16, Direction::Tx).unwrap()
    }

    fn line_topology(n: u8) -> TopologyMap {
        let mut t = TopologyMap::new();
        for i in 1..n {
            t.add_edge(i - 1, i);
        }
        t
    }

    #[test]
    fn single_hop_stream_gets_one_element() {
        let cfg = config();
        let topo = line_topology(2);
        let scheduler = SlotScheduler::new(&cfg, &topo);
        let streams = [stream(1, 0, 1, p(Period::P1, Redundancy::None))];
        let (placed, tiles, rejected) = scheduler.route_and_schedule(&streams, Vec::new(), 0);
        assert!(rejected.is_empty());
        assert_eq!(placed.len(), 1);
        assert_eq!(tiles, 1);
        assert_eq!((placed[0].tx, placed[0].rx), (1, 0));
        // The offset must be a data slot of a control tile.
        assert!(placed[0].offset >= cfg.downlink_phase_slots() as u32);
    }

    #[test]
    fn two_hop_stream_routes_through_middle() {
        let cfg = config();
        let topo = line_topology(3);
        let scheduler = SlotScheduler::new(&cfg, &topo);
        let streams = [stream(2, 0, 1, p(Period::P1, Redundancy::None))];
        let (placed, _tiles, rejected) = scheduler.route_and_schedule(&streams, Vec::new(), 0);
        assert!(rejected.is_empty());
        assert_eq!(placed.len(), 2);
        assert_eq!((placed[0].tx, placed[0].rx), (2, 1));
        assert_eq!((placed[1].tx, placed[1].rx), (1, 0));
        // Strictly increasing offsets keep forwarding causal.
        assert!(placed[1].offset > placed[0].offset);
    }

    #[test]
    fn disconnected_stream_is_rejected() {
        let cfg = config();
        let mut topo = TopologyMap::new();
        topo.add_edge(0, 1);
        topo.add_edge(2, 3);
        let scheduler = SlotScheduler::new(&cfg, &topo);
        let streams = [stream(2, 0, 1, p(Period::P1, Redundancy::None))];
        let (placed, _tiles, rejected) = scheduler.route_and_schedule(&streams, Vec::new(), 0);
        assert!(placed.is_empty());
        assert_eq!(rejected, vec![streams[0].id]);
    }

    #[test]
    fn shared_receiver_forces_distinct_offsets() {
        // Three one-hop streams into the master must take three slots.
        let cfg = config();
        let mut topo = TopologyMap::new();
        topo.add_edge(1, 0);
        topo.add_edge(2, 0);
        topo.add_edge(3, 0);
        let scheduler = SlotScheduler::new(&cfg, &topo);
        let streams = [
            stream(1, 0, 1, p(Period::P1, Redundancy::None)),
            stream(2, 0, 1, p(Period::P1, Redundancy::None)),
            stream(3, 0, 1, p(Period::P1, Redundancy::None)),
        ];
        let (placed, tiles, rejected) = scheduler.route_and_schedule(&streams, Vec::new(), 0);
        assert!(rejected.is_empty());
        assert_eq!(tiles, 1);
        let mut offsets: Vec<u32> = placed.iter().map(|e| e.offset).collect();
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), 3);
    }

    #[test]
    fn triple_redundancy_places_three_transmissions() {
        let cfg = config();
        let topo = line_topology(2);
        let scheduler = SlotScheduler::new(&cfg, &topo);
        let streams = [stream(1, 0, 1, p(Period::P1, Redundancy::Triple))];
        let (placed, _tiles, rejected) = scheduler.route_and_schedule(&streams, Vec::new(), 0);
        assert!(rejected.is_empty());
        assert_eq!(placed.len(), 3);
        let mut offsets: Vec<u32> = placed.iter().map(|e| e.offset).collect();
        let sorted = {
            let mut s = offsets.clone();
            s.sort_unstable();
            s
        };
        assert_eq!(offsets, sorted, "copies must be sequential");
        offsets.dedup();
        assert_eq!(offsets.len(), 3);
    }

    #[test]
    fn spatial_redundancy_uses_disjoint_path() {
        // Diamond: 3-1-0 and 3-2-0.
        let cfg = config();
        let mut topo = TopologyMap::new();
        topo.add_edge(3, 1);
        topo.add_edge(3, 2);
        topo.add_edge(1, 0);
        topo.add_edge(2, 0);
        let scheduler = SlotScheduler::new(&cfg, &topo);
        let streams = [stream(3, 0, 1, p(Period::P2, Redundancy::DoubleSpatial))];
        let (placed, _tiles, rejected) = scheduler.route_and_schedule(&streams, Vec::new(), 0);
        assert!(rejected.is_empty());
        assert_eq!(placed.len(), 4);
        let relays: HashSet<u8> = placed.iter().map(|e| e.rx).filter(|n| *n != 0).collect();
        assert_eq!(relays.len(), 2, "copies must traverse both relays");
    }

    #[test]
    fn schedule_tiles_is_lcm_of_periods() {
        let cfg = config();
        let mut topo = TopologyMap::new();
        topo.add_edge(1, 0);
        topo.add_edge(2, 0);
        let scheduler = SlotScheduler::new(&cfg, &topo);
        let streams = [
            stream(1, 0, 1, p(Period::P2, Redundancy::None)),
            stream(2, 0, 1, p(Period::P5, Redundancy::None)),
        ];
        let (_placed, tiles, rejected) = scheduler.route_and_schedule(&streams, Vec::new(), 0);
        assert!(rejected.is_empty());
        assert_eq!(tiles, 10);
    }

    #[test]
    fn established_streams_keep_offsets_when_new_stream_arrives() {
        let cfg = config();
        let mut topo = TopologyMap::new();
        topo.add_edge(1, 0);
        topo.add_edge(2, 0);
        let scheduler = SlotScheduler::new(&cfg, &topo);
        let first = [stream(1, 0, 1, p(Period::P1, Redundancy::None))];
        let (placed, tiles, _) = scheduler.route_and_schedule(&first, Vec::new(), 0);
        let first_offset = placed[0].offset;

        let second = [stream(2, 0, 1, p(Period::P1, Redundancy::None))];
        let (grown, _tiles, rejected) = scheduler.route_and_schedule(&second, placed, tiles);
        assert!(rejected.is_empty());
        assert_eq!(grown[0].offset, first_offset);
        assert_ne!(grown[1].offset, first_offset);
    }

    #[test]
    fn collection_accepts_stream_only_with_server() {
        let mut c = StreamCollection::new();
        let params = p(Period::P1, Redundancy::None);
        let id = StreamId::new(1, 0, 0, 7);
        c.receive(vec![StreamManagementElement::new(id, SmeKind::Connect, params)]);
        assert_eq!(c.streams_with_status(MasterStreamStatus::Rejected).len(), 1);
        // The reject produced an info element.
        assert!(c.num_info() > 0);

        let server = StreamId::new(0, 0, 0, 7);
        c.receive(vec![StreamManagementElement::new(server, SmeKind::Listen, params)]);
        c.receive(vec![StreamManagementElement::new(id, SmeKind::Connect, params)]);
        assert_eq!(c.streams_with_status(MasterStreamStatus::Accepted).len(), 1);
        assert!(c.was_added());
    }

    #[test]
    fn collection_close_marks_removed() {
        let mut c = StreamCollection::new();
        let params = p(Period::P1, Redundancy::None);
        let server = StreamId::new(0, 0, 0, 7);
        let id = StreamId::new(1, 0, 0, 7);
        c.receive(vec![
            StreamManagementElement::new(server, SmeKind::Listen, params),
            StreamManagementElement::new(id, SmeKind::Connect, params),
        ]);
        c.clear_flags();
        c.receive(vec![StreamManagementElement::new(id, SmeKind::Closed, params)]);
        assert!(c.was_removed());
        assert_eq!(c.stream_number(), 0);
    }
}
