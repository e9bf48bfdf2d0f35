//! Schedule distribution downlink phase.
//!
//! The master chunks the implicit schedule into fixed-size packets and
//! floods the whole sequence three times; spare packet capacity carries info
//! elements. Every node reassembles the packets, and once the third
//! repetition is seen expands its own slice into the explicit per-slot
//! schedule, staging it for the activation tile. The master applies the
//! same path to its own copy without going through the radio.

use crate::frame::{check_short_header, put_short_header, SHORT_HEADER_SIZE};
use crate::mac::MacContext;
use crate::packet::{Packet, MAX_PACKET_SIZE};
use crate::parameters::{
    NetworkConfiguration, MAX_PROPAGATION_DELAY, PACKET_PREAMBLE_TIME, REBROADCAST_INTERVAL,
    RECEIVING_NODE_WAKEUP_ADVANCE, SENDING_NODE_WAKEUP_ADVANCE,
};
use crate::data_phase::DataPhase;
use crate::schedule::{
    Action, DownlinkElement, ExplicitScheduleElement, ScheduleElement, ScheduleHeader,
};
use crate::schedule_computation::ScheduleComputation;
use crate::stream::StreamId;
use crate::stream_manager::StreamManager;
use crate::time::LocalTime;
use crate::wakeup::{build_wakeup_queues, StreamWaitScheduler};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;

/// Schedule elements fitting one downlink packet after the two headers.
pub const fn packet_capacity() -> usize {
    (MAX_PACKET_SIZE - SHORT_HEADER_SIZE - ScheduleHeader::SIZE) / ScheduleElement::SIZE
}

/// A node's slice of the schedule, expanded slot by slot.
#[derive(Debug, Clone, Default)]
pub struct ExpandedSchedule {
    pub slots: Vec<ExplicitScheduleElement>,
    /// Number of forwarder buffers referenced by the slots.
    pub buffer_count: u16,
    /// Per forwarded stream, how many transmissions this node performs in
    /// one period (the redundancy share routed through it).
    pub forward_redundancy: HashMap<StreamId, u8>,
}

/// Expand the implicit schedule into the explicit action vector of `node`.
///
/// Every slot holds at most one action; slots not assigned to this node
/// stay `Sleep`.
pub fn expand_schedule(
    elements: &[ScheduleElement],
    header: &ScheduleHeader,
    node: u8,
    config: &NetworkConfiguration,
) -> ExpandedSchedule {
    let slots_per_tile = config.slots_per_tile as usize;
    let schedule_slots = header.schedule_tiles.max(1) as usize * slots_per_tile;
    let mut slots = vec![ExplicitScheduleElement::sleep(); schedule_slots];
    let mut buffer_of: HashMap<StreamId, u16> = HashMap::new();
    let mut forward_redundancy: HashMap<StreamId, u8> = HashMap::new();

    for element in elements {
        let (action, buffer) = if element.tx == node {
            if element.id.src == node {
                (Action::SendStream, None)
            } else {
                let next = buffer_of.len() as u16;
                let idx = *buffer_of.entry(element.id).or_insert(next);
                *forward_redundancy.entry(element.id).or_insert(0) += 1;
                (Action::SendBuffer, Some(idx))
            }
        } else if element.rx == node {
            if element.id.dst == node {
                (Action::RecvStream, None)
            } else {
                let next = buffer_of.len() as u16;
                let idx = *buffer_of.entry(element.id).or_insert(next);
                (Action::RecvBuffer, Some(idx))
            }
        } else {
            continue;
        };

        let period_slots = element.period.tiles() as usize * slots_per_tile;
        let mut slot = element.offset as usize;
        while slot < schedule_slots {
            debug_assert_eq!(slots[slot].action, Action::Sleep, "slot double booked");
            slots[slot] = ExplicitScheduleElement {
                action,
                id: element.id,
                buffer,
            };
            slot += period_slots;
        }
    }

    ExpandedSchedule {
        slots,
        buffer_count: buffer_of.len() as u16,
        forward_redundancy,
    }
}

/// Log one node's slice of the schedule as the packed per-slot bytes
/// (`action:3 | port:4`), one group per tile.
fn log_explicit_schedule(node: u8, expanded: &ExpandedSchedule, slots_per_tile: usize) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    let mut line = String::new();
    for (slot, element) in expanded.slots.iter().enumerate() {
        if slot != 0 && slot % slots_per_tile == 0 {
            line.push('|');
        }
        line.push_str(&format!("{:02x}", element.packed()));
    }
    debug!("[SD] N={node} explicit schedule: {line}");
}

/// A fully received schedule waiting for its activation tile.
#[derive(Debug, Clone)]
struct StagedSchedule {
    header: ScheduleHeader,
    elements: Vec<ScheduleElement>,
}

/// Common application path of both distribution roles.
struct Applier;

impl Applier {
    /// Stage the wake-up queues as soon as the schedule is complete, so the
    /// wake-up task can bridge the activation boundary.
    fn stage(
        staged: &StagedSchedule,
        ctx: &MacContext,
        stream_mgr: &StreamManager,
        wakeup: &Arc<StreamWaitScheduler>,
    ) {
        let expanded = expand_schedule(
            &staged.elements,
            &staged.header,
            ctx.network_id(),
            ctx.config(),
        );
        let (curr, next) = build_wakeup_queues(
            &expanded.slots,
            &staged.header,
            ctx.config(),
            stream_mgr,
            ctx.time_base(),
        );
        wakeup.set_schedule(curr, next, staged.header.activation_tile);
    }

    /// Apply a staged schedule at (or after) its activation tile and hold
    /// the node until just before the first data slot, leaving time for
    /// applications to observe the new streams and issue their first
    /// writes.
    #[allow(clippy::too_many_arguments)]
    fn apply(
        staged: &StagedSchedule,
        ctx: &mut MacContext,
        data_phase: &mut DataPhase,
        stream_mgr: &StreamManager,
        slot_start: LocalTime,
        current_tile: u32,
    ) {
        let header = &staged.header;
        info!(
            "[SD] activating schedule {} at tile {} (activation tile {})",
            header.schedule_id, current_tile, header.activation_tile
        );
        let expanded = expand_schedule(
            &staged.elements,
            header,
            ctx.network_id(),
            ctx.config(),
        );
        log_explicit_schedule(
            ctx.network_id(),
            &expanded,
            ctx.config().slots_per_tile as usize,
        );
        data_phase.apply_schedule(
            expanded,
            header.schedule_id,
            header.schedule_tiles,
            header.activation_tile,
            current_tile,
        );
        stream_mgr.apply_schedule(&staged.elements);

        let config = ctx.config();
        let rx_advance = RECEIVING_NODE_WAKEUP_ADVANCE + config.max_admitted_rcv_window;
        let end_advance = config.downlink_to_data_slack
            + rx_advance.max(SENDING_NODE_WAKEUP_ADVANCE)
            + config.callbacks_execution_time;
        let wait_until = slot_start
            .add_ns(config.downlink_phase_duration())
            .sub_ns(end_advance);
        if ctx.now() < wait_until {
            ctx.sleep_until(wait_until);
        }
    }
}

/// Master side of the downlink: source of the schedule flood.
pub struct MasterScheduleDistribution {
    computation: ScheduleComputation,
    header: ScheduleHeader,
    schedule: Vec<ScheduleElement>,
    position: usize,
    staged: Option<StagedSchedule>,
    applied_schedule_id: u32,
}

impl MasterScheduleDistribution {
    pub fn new(computation: ScheduleComputation) -> Self {
        MasterScheduleDistribution {
            computation,
            header: ScheduleHeader::default(),
            schedule: Vec::new(),
            position: 0,
            staged: None,
            applied_schedule_id: 0,
        }
    }

    pub fn execute(
        &mut self,
        ctx: &mut MacContext,
        data_phase: &mut DataPhase,
        stream_mgr: &StreamManager,
        wakeup: &Arc<StreamWaitScheduler>,
        slot_start: LocalTime,
    ) {
        let current_tile = ctx.current_tile(slot_start);

        if self.computation.schedule_id() != self.header.schedule_id {
            self.take_new_schedule(current_tile);
        }
        // Schedule id 0 means no schedule was ever computed.
        if self.header.schedule_id == 0 {
            self.maybe_send_info(ctx, stream_mgr, slot_start);
            return;
        }

        if self.header.repetition >= 3 {
            // Flood finished: stage our own copy once, then wait for the
            // activation tile.
            if self.applied_schedule_id != self.header.schedule_id {
                if self.staged.is_none() {
                    let staged = StagedSchedule {
                        header: self.header,
                        elements: self.schedule.clone(),
                    };
                    Applier::stage(&staged, ctx, stream_mgr, wakeup);
                    self.staged = Some(staged);
                }
                if current_tile >= self.header.activation_tile {
                    let staged = self.staged.take().unwrap();
                    Applier::apply(
                        &staged,
                        ctx,
                        data_phase,
                        stream_mgr,
                        slot_start,
                        current_tile,
                    );
                    self.applied_schedule_id = staged.header.schedule_id;
                    return;
                }
            }
            self.maybe_send_info(ctx, stream_mgr, slot_start);
            return;
        }

        if self.header.current_packet >= self.header.total_packet {
            self.position = 0;
            self.header.reset_packet_counter();
            self.header.increment_repetition();
        }
        self.send_schedule_packet(ctx, stream_mgr, slot_start);
        self.header.increment_packet_counter();
    }

    /// Pick up a freshly computed schedule and choose its activation tile.
    fn take_new_schedule(&mut self, current_tile: u32) {
        let (schedule, id, tiles) = self.computation.schedule();
        let num_packets = (schedule.len() / packet_capacity()) as u32 + 1;
        let distribution_tiles = self.tiles_to_distribute(num_packets);

        let activation_tile = if self.header.schedule_id == 0 {
            // First schedule: next superframe boundary, pushed out by the
            // distribution length.
            let superframe = self.superframe_size();
            let mut tile = current_tile;
            let align = tile % superframe;
            if align != 0 {
                tile += superframe - align;
            }
            tile + distribution_tiles
        } else {
            // Later schedules: end of the current schedule cycle, extended
            // in multiples of its length until distribution fits.
            let old_tiles = self.header.schedule_tiles.max(1) as u32;
            let cycle_pos = (current_tile - self.header.activation_tile) % old_tiles;
            let mut activation = current_tile + (old_tiles - cycle_pos);
            if activation - current_tile < distribution_tiles {
                let more = distribution_tiles - (activation - current_tile);
                let align = more % old_tiles;
                activation += more + if align != 0 { old_tiles - align } else { 0 };
            }
            activation
        };

        info!(
            "[SD] schedule {}: {} elements, {} packets, activation tile {}",
            id,
            schedule.len(),
            num_packets,
            activation_tile
        );
        self.schedule = schedule;
        self.header = ScheduleHeader::new(
            num_packets as u16,
            0,
            id,
            activation_tile,
            tiles,
        );
        self.position = 0;
        self.staged = None;
    }

    fn superframe_size(&self) -> u32 {
        // The computation handle carries the configuration used network-wide.
        self.computation_config().control_superframe.size() as u32
    }

    fn computation_config(&self) -> &NetworkConfiguration {
        self.computation.config()
    }

    /// Tiles needed to flood `num_packets` three times, rounded up to whole
    /// clock-sync periods. Downlink tiles on a sync boundary carry the
    /// beacon and are not available to the flood.
    fn tiles_to_distribute(&self, num_packets: u32) -> u32 {
        let config = self.computation_config();
        let superframe_tiles = config.control_superframe.size() as u32;
        let sync_superframes =
            (config.clock_sync_period / config.superframe_duration()).max(1) as u32;
        let sync_period_tiles = sync_superframes * superframe_tiles;
        let downlinks_per_sync =
            config.control_superframe.downlinks_per_superframe() as u32 * sync_superframes;
        let available = downlinks_per_sync.saturating_sub(1).max(1);
        let needed = num_packets * 3;
        let mut periods = needed / available;
        if needed % available != 0 {
            periods += 1;
        }
        periods * sync_period_tiles
    }

    fn send_schedule_packet(
        &mut self,
        ctx: &mut MacContext,
        stream_mgr: &StreamManager,
        slot_start: LocalTime,
    ) {
        let mut pkt = Packet::new();
        let built = put_short_header(&mut pkt, ctx.config().pan_id, 0)
            .and_then(|_| self.header.serialize(&mut pkt));
        if let Err(e) = built {
            warn!("[SD] header serialization failed: {e}");
            return;
        }
        let mut put = 0;
        while put < packet_capacity() && self.position < self.schedule.len() {
            if self.schedule[self.position].serialize(&mut pkt).is_err() {
                break;
            }
            self.position += 1;
            put += 1;
        }
        // Spare capacity confirms stream states; the master's own
        // endpoints learn the verdicts here, they never hear the flood.
        for info in self.computation.dequeue_info(packet_capacity() - put) {
            stream_mgr.apply_info(info);
            if info.serialize(&mut pkt).is_err() {
                break;
            }
        }
        self.transmit(ctx, &pkt, slot_start);
        debug!(
            "[SD] sent {}/{}/{} rep {}",
            self.header.current_packet,
            self.header.total_packet,
            self.header.schedule_id,
            self.header.repetition
        );
    }

    fn maybe_send_info(
        &mut self,
        ctx: &mut MacContext,
        stream_mgr: &StreamManager,
        slot_start: LocalTime,
    ) {
        if self.computation.num_info() == 0 {
            return;
        }
        let mut pkt = Packet::new();
        let header = ScheduleHeader::info_only(self.header.schedule_id);
        let built = put_short_header(&mut pkt, ctx.config().pan_id, 0)
            .and_then(|_| header.serialize(&mut pkt));
        if built.is_err() {
            return;
        }
        for info in self.computation.dequeue_info(packet_capacity()) {
            stream_mgr.apply_info(info);
            if info.serialize(&mut pkt).is_err() {
                break;
            }
        }
        self.transmit(ctx, &pkt, slot_start);
    }

    fn transmit(&self, ctx: &mut MacContext, pkt: &Packet, slot_start: LocalTime) {
        ctx.configure_radio(false);
        let wakeup = slot_start.sub_ns(SENDING_NODE_WAKEUP_ADVANCE);
        if ctx.now() < wakeup {
            ctx.sleep_until(wakeup);
        }
        ctx.send_packet_at(pkt, slot_start);
        ctx.radio_idle();
    }
}

/// Dynamic side of the downlink: reassembles the flood.
pub struct DynamicScheduleDistribution {
    /// Header of the schedule being collected.
    header: ScheduleHeader,
    /// One slot per packet index of the current schedule.
    packets: Vec<Option<Vec<ScheduleElement>>>,
    staged: Option<StagedSchedule>,
    applied_schedule_id: u32,
}

impl Default for DynamicScheduleDistribution {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicScheduleDistribution {
    pub fn new() -> Self {
        DynamicScheduleDistribution {
            header: ScheduleHeader::default(),
            packets: Vec::new(),
            staged: None,
            applied_schedule_id: 0,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn execute(
        &mut self,
        ctx: &mut MacContext,
        data_phase: &mut DataPhase,
        stream_mgr: &StreamManager,
        wakeup: &Arc<StreamWaitScheduler>,
        slot_start: LocalTime,
        receiver_window: i64,
    ) {
        let current_tile = ctx.current_tile(slot_start);
        self.receive_packet(ctx, stream_mgr, wakeup, slot_start, receiver_window);

        if let Some(staged) = &self.staged {
            if current_tile >= staged.header.activation_tile
                && self.applied_schedule_id != staged.header.schedule_id
            {
                let staged = self.staged.take().unwrap();
                Applier::apply(
                    &staged,
                    ctx,
                    data_phase,
                    stream_mgr,
                    slot_start,
                    current_tile,
                );
                self.applied_schedule_id = staged.header.schedule_id;
            }
        }
    }

    fn receive_packet(
        &mut self,
        ctx: &mut MacContext,
        stream_mgr: &StreamManager,
        wakeup_sched: &Arc<StreamWaitScheduler>,
        slot_start: LocalTime,
        receiver_window: i64,
    ) {
        let hop = ctx.hop();
        let arrival = slot_start.add_ns((hop.max(1) as i64 - 1) * REBROADCAST_INTERVAL);
        let wakeup = arrival.sub_ns(RECEIVING_NODE_WAKEUP_ADVANCE + receiver_window);
        let deadline =
            arrival.add_ns(receiver_window + PACKET_PREAMBLE_TIME + MAX_PROPAGATION_DELAY);

        ctx.configure_radio(false);
        if ctx.now() < wakeup {
            ctx.sleep_until(wakeup);
        }
        let mut pkt = Packet::new();
        let Ok(rcv) = ctx.recv_packet(&mut pkt, deadline) else {
            ctx.radio_idle();
            return;
        };
        // Flood the packet on before parsing it.
        if hop < ctx.config().max_hops {
            ctx.send_packet_at(&pkt, rcv.timestamp.add_ns(REBROADCAST_INTERVAL));
        }
        ctx.radio_idle();

        let Ok(_seq) = check_short_header(&mut pkt, ctx.config().pan_id) else {
            return;
        };
        let Ok(header) = ScheduleHeader::deserialize(&mut pkt) else {
            return;
        };

        let mut elements = Vec::new();
        while pkt.size() >= ScheduleElement::SIZE {
            match DownlinkElement::deserialize(&mut pkt) {
                Ok(DownlinkElement::Schedule(e)) => elements.push(e),
                Ok(DownlinkElement::Info(info)) => stream_mgr.apply_info(info),
                Err(e) => {
                    debug!("[SD] bad element: {e}");
                    return;
                }
            }
        }

        if header.schedule_id == 0 || header.total_packet == 0 {
            // Info-only packet.
            return;
        }
        if header.schedule_id == self.applied_schedule_id {
            return;
        }
        if header.schedule_id != self.header.schedule_id {
            // A new schedule started flooding: restart collection.
            self.header = header;
            self.packets = vec![None; header.total_packet as usize];
        }
        let index = header.current_packet as usize;
        if index < self.packets.len() && self.packets[index].is_none() {
            self.packets[index] = Some(elements);
        }

        let complete = self.packets.iter().all(|p| p.is_some());
        if complete && header.repetition >= 3 && self.staged.is_none() {
            let all: Vec<ScheduleElement> = self
                .packets
                .iter()
                .flat_map(|p| p.as_ref().unwrap().iter().copied())
                .collect();
            info!(
                "[SD] schedule {} complete: {} elements",
                header.schedule_id,
                all.len()
            );
            let staged = StagedSchedule {
                header: self.header,
                elements: all,
            };
            Applier::stage(&staged, ctx, stream_mgr, wakeup_sched);
            self.staged = Some(staged);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Period;

    #[test]
    fn capacity_fits_thirteen_elements() {
        assert_eq!(packet_capacity(), 13);
    }

    fn header(tiles: u16) -> ScheduleHeader {
        ScheduleHeader::new(1, 0, 1, 10, tiles)
    }

    #[test]
    fn expansion_places_sender_and_receiver() {
        let config = NetworkConfiguration::default();
        let id = StreamId::new(1, 0, 0, 1);
        let elements = [ScheduleElement {
            id,
            tx: 1,
            rx: 0,
            period: Period::P1,
            offset: 5,
        }];

        let sender = expand_schedule(&elements, &header(1), 1, &config);
        assert_eq!(sender.slots.len(), config.slots_per_tile as usize);
        assert_eq!(sender.slots[5].action, Action::SendStream);
        assert_eq!(sender.slots[5].id, id);
        assert_eq!(sender.buffer_count, 0);

        let receiver = expand_schedule(&elements, &header(1), 0, &config);
        assert_eq!(receiver.slots[5].action, Action::RecvStream);

        let bystander = expand_schedule(&elements, &header(1), 2, &config);
        assert!(bystander.slots.iter().all(|s| s.action == Action::Sleep));
    }

    #[test]
    fn expansion_repeats_every_period() {
        let config = NetworkConfiguration::default();
        let id = StreamId::new(1, 0, 0, 1);
        let elements = [ScheduleElement {
            id,
            tx: 1,
            rx: 0,
            period: Period::P2,
            offset: 3,
        }];
        // Schedule of 4 tiles, period 2 tiles: two occurrences.
        let expanded = expand_schedule(&elements, &header(4), 1, &config);
        let spt = config.slots_per_tile as usize;
        let send_slots: Vec<usize> = expanded
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.action == Action::SendStream)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(send_slots, vec![3, 3 + 2 * spt]);
    }

    #[test]
    fn expansion_pairs_forwarder_buffers() {
        let config = NetworkConfiguration::default();
        let id = StreamId::new(2, 0, 0, 1);
        let elements = [
            ScheduleElement {
                id,
                tx: 2,
                rx: 1,
                period: Period::P1,
                offset: 4,
            },
            ScheduleElement {
                id,
                tx: 1,
                rx: 0,
                period: Period::P1,
                offset: 6,
            },
        ];
        let forwarder = expand_schedule(&elements, &header(1), 1, &config);
        assert_eq!(forwarder.slots[4].action, Action::RecvBuffer);
        assert_eq!(forwarder.slots[6].action, Action::SendBuffer);
        // Same buffer on both sides of the forward.
        assert_eq!(forwarder.slots[4].buffer, forwarder.slots[6].buffer);
        assert_eq!(forwarder.buffer_count, 1);
        assert_eq!(forwarder.forward_redundancy.get(&id), Some(&1));
    }
}
