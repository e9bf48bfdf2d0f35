//! Data phase: schedule playback.
//!
//! Every data slot, the action recorded at `slotIndex` of the expanded
//! schedule is executed with bit-exact timing. Errors inside a slot never
//! stop the cursor: whatever happens, `slotIndex` advances so the node
//! stays aligned with the rest of the mesh.

use crate::crypto::{KeyManager, StreamAead, CRYPTO_EXECUTION_TIME, TAG_SIZE};
use crate::frame::{peek_short_header, SHORT_HEADER_SIZE};
use crate::mac::MacContext;
use crate::packet::{Packet, MAX_PACKET_SIZE};
use crate::parameters::{
    packet_on_air_time, MAX_PROPAGATION_DELAY, PACKET_PREAMBLE_TIME, SENDING_NODE_WAKEUP_ADVANCE,
};
use crate::schedule::{Action, ExplicitScheduleElement};
use crate::schedule_distribution::ExpandedSchedule;
use crate::stream::StreamId;
use crate::stream_manager::StreamManager;
use crate::time::{LocalTime, NetworkTime};
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("send wakeup time already past")]
    LateSend,
    #[error("receive deadline already past")]
    LateRecv,
}

/// On-air time of a maximum-size data frame; receive slots are padded to
/// this length so slot timing is identical for hits and misses.
fn radio_time() -> i64 {
    packet_on_air_time(MAX_PACKET_SIZE)
}

pub struct DataPhase {
    my_id: u8,
    slots_per_tile: usize,
    tile_duration: i64,
    stream_mgr: Arc<StreamManager>,
    key_manager: Option<KeyManager>,
    aead_cache: HashMap<StreamId, StreamAead>,

    schedule: Vec<ExplicitScheduleElement>,
    schedule_id: u32,
    schedule_tiles: u16,
    activation_tile: u32,
    /// Forwarder buffers, indexed by the explicit elements.
    buffers: Vec<Packet>,
    /// Per forwarded stream: transmissions done and transmissions assigned
    /// in one period.
    buffer_counters: HashMap<StreamId, (u8, u8)>,

    slot_index: usize,
    data_superframe_number: u32,
}

impl DataPhase {
    pub fn new(
        my_id: u8,
        slots_per_tile: u16,
        tile_duration: i64,
        stream_mgr: Arc<StreamManager>,
        key_manager: Option<KeyManager>,
    ) -> Self {
        DataPhase {
            my_id,
            slots_per_tile: slots_per_tile as usize,
            tile_duration,
            stream_mgr,
            key_manager,
            aead_cache: HashMap::new(),
            schedule: Vec::new(),
            schedule_id: 0,
            schedule_tiles: 0,
            activation_tile: 0,
            buffers: Vec::new(),
            buffer_counters: HashMap::new(),
            slot_index: 0,
            data_superframe_number: 0,
        }
    }

    pub fn schedule_slots(&self) -> usize {
        self.schedule.len()
    }

    /// The expanded schedule currently playing.
    pub fn schedule_view(&self) -> &[ExplicitScheduleElement] {
        &self.schedule
    }

    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    pub fn data_superframe_number(&self) -> u32 {
        self.data_superframe_number
    }

    pub fn schedule_id(&self) -> u32 {
        self.schedule_id
    }

    /// Install a newly expanded schedule. A late application replays the
    /// missed tiles by starting the cursor at the slot the mesh has already
    /// reached.
    pub fn apply_schedule(
        &mut self,
        expanded: ExpandedSchedule,
        schedule_id: u32,
        schedule_tiles: u16,
        activation_tile: u32,
        current_tile: u32,
    ) {
        let slots = expanded.slots.len();
        self.schedule = expanded.slots;
        self.schedule_id = schedule_id;
        self.schedule_tiles = schedule_tiles;
        self.activation_tile = activation_tile;
        self.buffers = vec![Packet::new(); expanded.buffer_count as usize];
        self.buffer_counters = expanded
            .forward_redundancy
            .iter()
            .map(|(id, k)| (*id, (0, *k)))
            .collect();
        let tile_delay = current_tile.saturating_sub(activation_tile) as usize;
        self.slot_index = if slots == 0 {
            0
        } else {
            (tile_delay * self.slots_per_tile) % slots
        };
        if tile_delay > 0 {
            debug!(
                "[D] stale schedule application, replaying cursor to {}",
                self.slot_index
            );
        }
        self.data_superframe_number = 0;
        self.stream_mgr.reset_sequence_numbers();
        self.aead_cache.clear();
    }

    /// Re-seed the cursor after a resynchronization.
    pub fn align_to_network_time(&mut self, nt: NetworkTime) {
        if self.schedule.is_empty() {
            return;
        }
        let slot_duration = self.tile_duration / self.slots_per_tile as i64;
        let tiles_elapsed = (nt.get() / self.tile_duration) - self.activation_tile as i64;
        if tiles_elapsed < 0 {
            self.slot_index = 0;
            self.data_superframe_number = 0;
            return;
        }
        let slot_in_tile = (nt.get() % self.tile_duration) / slot_duration;
        let total = tiles_elapsed * self.slots_per_tile as i64 + slot_in_tile;
        let slots = self.schedule.len() as i64;
        self.slot_index = (total % slots) as usize;
        self.data_superframe_number = (total / slots) as u32;
    }

    /// Execute the current slot and advance the cursor, in-sync path.
    pub fn execute(&mut self, ctx: &mut MacContext, slot_start: LocalTime) {
        if self.schedule.is_empty() {
            ctx.sleep_until(slot_start);
            return;
        }
        let result = self.run_slot(ctx, slot_start);
        self.increment_slot();
        if let Err(e) = result {
            warn!("[D] slot error: {e}");
        }
    }

    /// Cursor-and-bookkeeping-only path, used while desynchronized so
    /// sequence numbers stay aligned with the mesh.
    pub fn advance(&mut self, ctx: &mut MacContext, slot_start: LocalTime) {
        if self.schedule.is_empty() {
            ctx.sleep_until(slot_start);
            return;
        }
        let element = self.schedule[self.slot_index];
        match element.action {
            Action::SendStream => {
                let mut scratch = Packet::new();
                self.stream_mgr.send_packet(element.id, &mut scratch);
            }
            Action::RecvStream => {
                self.stream_mgr.miss_packet(element.id);
            }
            _ => {}
        }
        ctx.sleep_until(slot_start);
        self.increment_slot();
    }

    /// Advance the cursor over the control portion of a tile. Those slots
    /// are never scheduled, so there is no bookkeeping to run.
    pub fn skip_control_slots(&mut self, count: u16) {
        if self.schedule.is_empty() {
            return;
        }
        for _ in 0..count {
            debug_assert_eq!(self.schedule[self.slot_index].action, Action::Sleep);
            self.increment_slot();
        }
    }

    fn increment_slot(&mut self) {
        self.slot_index += 1;
        if self.slot_index >= self.schedule.len() {
            self.slot_index = 0;
            self.data_superframe_number = self.data_superframe_number.wrapping_add(1);
            self.stream_mgr.reset_sequence_numbers();
        }
    }

    fn run_slot(&mut self, ctx: &mut MacContext, slot_start: LocalTime) -> Result<(), SlotError> {
        let element = self.schedule[self.slot_index];
        match element.action {
            Action::Sleep => {
                ctx.sleep_until(slot_start);
                Ok(())
            }
            Action::SendStream => self.send_from_stream(ctx, slot_start, element.id),
            Action::RecvStream => self.receive_to_stream(ctx, slot_start, element.id),
            Action::SendBuffer => {
                self.send_from_buffer(ctx, slot_start, element.id, element.buffer)
            }
            Action::RecvBuffer => self.receive_to_buffer(ctx, slot_start, element.buffer),
        }
    }

    fn aead(&mut self, id: StreamId) -> Option<StreamAead> {
        let km = self.key_manager.as_ref()?;
        Some(
            self.aead_cache
                .entry(id)
                .or_insert_with(|| km.stream_aead(id))
                .clone(),
        )
    }

    fn send_from_stream(
        &mut self,
        ctx: &mut MacContext,
        slot_start: LocalTime,
        id: StreamId,
    ) -> Result<(), SlotError> {
        let authenticate = ctx.config().authenticate_data && self.key_manager.is_some();
        let encrypt = ctx.config().encrypt_data;
        let callbacks = ctx.config().callbacks_execution_time;
        let mut pkt = Packet::new();

        let pkt_ready = if authenticate {
            // The payload must be drawn before the crypto work, whose
            // budget is subtracted from the sleep deadline.
            let seq_no = self.stream_mgr.sequence_number(id);
            let wakeup = slot_start.sub_ns(CRYPTO_EXECUTION_TIME + callbacks);
            if ctx.now() > wakeup {
                return Err(SlotError::LateSend);
            }
            ctx.sleep_until(wakeup);
            let ready = self.stream_mgr.send_packet(id, &mut pkt);
            if ready {
                let aead = self.aead(id).unwrap();
                if encrypt {
                    let payload_start = SHORT_HEADER_SIZE + StreamId::SIZE;
                    let mut payload = pkt.as_bytes()[payload_start..].to_vec();
                    aead.apply_keystream(
                        self.data_superframe_number,
                        seq_no,
                        self.key_manager.as_ref().unwrap().master_index(),
                        &mut payload,
                    );
                    for (i, b) in payload.into_iter().enumerate() {
                        pkt.set_at(payload_start + i, b);
                    }
                }
                let tag = aead.tag(pkt.as_bytes());
                if pkt.put(&tag).is_err() {
                    warn!("[D] no room for tag, dropping frame");
                    false
                } else {
                    true
                }
            } else {
                ready
            }
        } else {
            let wakeup = slot_start.sub_ns(callbacks);
            if ctx.now() > wakeup {
                return Err(SlotError::LateSend);
            }
            ctx.sleep_until(wakeup);
            self.stream_mgr.send_packet(id, &mut pkt)
        };

        if pkt_ready {
            ctx.configure_radio(false);
            let wakeup = slot_start.sub_ns(SENDING_NODE_WAKEUP_ADVANCE);
            if ctx.now() < wakeup {
                ctx.sleep_until(wakeup);
            }
            ctx.send_packet_at(&pkt, slot_start);
            ctx.radio_idle();
            trace!("[D] s ({},{})", id.src, id.dst);
        } else {
            debug!("[D] x ({},{})", id.src, id.dst);
            ctx.sleep_until(slot_start);
        }
        Ok(())
    }

    fn receive_to_stream(
        &mut self,
        ctx: &mut MacContext,
        slot_start: LocalTime,
        id: StreamId,
    ) -> Result<(), SlotError> {
        let pan_id = ctx.config().pan_id;
        let authenticate = ctx.config().authenticate_data && self.key_manager.is_some();
        let encrypt = ctx.config().encrypt_data;
        let window = ctx.config().max_admitted_rcv_window;
        let deadline =
            slot_start.add_ns(MAX_PROPAGATION_DELAY + window + PACKET_PREAMBLE_TIME);
        if ctx.now() > deadline {
            return Err(SlotError::LateRecv);
        }

        ctx.configure_radio(true);
        let mut pkt = Packet::new();
        let received = ctx.recv_packet(&mut pkt, deadline).is_ok();
        ctx.radio_idle();

        let mut valid = received && peek_short_header(&pkt, pan_id).is_some();
        if valid && authenticate {
            valid = self.verify_and_strip(&mut pkt, id, encrypt);
        }
        valid = valid && check_stream_id(&pkt, id);

        // Align the slot end for hits and misses alike, so a trailing miss
        // in a redundancy group cannot shorten the reader's wait.
        ctx.sleep_until(slot_start.add_ns(radio_time()));

        let period_end = if valid {
            trace!("[D] r ({},{})", id.src, id.dst);
            self.stream_mgr.receive_packet(id, &pkt)
        } else {
            trace!("[D] m ({},{})", id.src, id.dst);
            self.stream_mgr.miss_packet(id)
        };
        if period_end {
            trace!("[D] - ({},{})", id.src, id.dst);
        }
        Ok(())
    }

    /// Check the tag, remove it, and decrypt in place when enabled.
    fn verify_and_strip(&mut self, pkt: &mut Packet, id: StreamId, encrypt: bool) -> bool {
        let Some(aead) = self.aead(id) else {
            return false;
        };
        let bytes = pkt.as_bytes();
        if bytes.len() < SHORT_HEADER_SIZE + StreamId::SIZE + TAG_SIZE {
            return false;
        }
        let split = bytes.len() - TAG_SIZE;
        let (frame, tag) = bytes.split_at(split);
        if !aead.verify(frame, tag) {
            return false;
        }
        let seq_no = self.stream_mgr.sequence_number(id);
        let mut rebuilt = Packet::new();
        let mut body = frame.to_vec();
        if encrypt {
            let payload_start = SHORT_HEADER_SIZE + StreamId::SIZE;
            aead.apply_keystream(
                self.data_superframe_number,
                seq_no,
                self.key_manager.as_ref().unwrap().master_index(),
                &mut body[payload_start..],
            );
        }
        if rebuilt.put(&body).is_err() {
            return false;
        }
        *pkt = rebuilt;
        true
    }

    fn send_from_buffer(
        &mut self,
        ctx: &mut MacContext,
        slot_start: LocalTime,
        id: StreamId,
        buffer: Option<u16>,
    ) -> Result<(), SlotError> {
        let Some(index) = buffer else {
            warn!("[D] send-buffer slot without a buffer");
            return Ok(());
        };
        let has_data = !self.buffers[index as usize].is_empty();
        if has_data {
            ctx.configure_radio(false);
            let wakeup = slot_start.sub_ns(SENDING_NODE_WAKEUP_ADVANCE);
            if ctx.now() < wakeup {
                ctx.sleep_until(wakeup);
            }
            let pkt = self.buffers[index as usize].clone();
            ctx.send_packet_at(&pkt, slot_start);
            ctx.radio_idle();
        } else {
            ctx.sleep_until(slot_start);
        }
        // The counter moves even for an empty buffer, the redundancy group
        // boundary is fixed by the schedule.
        if self.count_buffer_transmission(id) {
            self.buffers[index as usize].clear();
        }
        Ok(())
    }

    fn receive_to_buffer(
        &mut self,
        ctx: &mut MacContext,
        slot_start: LocalTime,
        buffer: Option<u16>,
    ) -> Result<(), SlotError> {
        let Some(index) = buffer else {
            warn!("[D] recv-buffer slot without a buffer");
            return Ok(());
        };
        let pan_id = ctx.config().pan_id;
        let window = ctx.config().max_admitted_rcv_window;
        let deadline =
            slot_start.add_ns(MAX_PROPAGATION_DELAY + window + PACKET_PREAMBLE_TIME);
        if ctx.now() > deadline {
            return Err(SlotError::LateRecv);
        }
        ctx.configure_radio(true);
        let buffer = &mut self.buffers[index as usize];
        let ok = ctx.recv_packet(buffer, deadline).is_ok();
        ctx.radio_idle();
        if !ok || peek_short_header(buffer, pan_id).is_none() {
            // A foreign or missing frame must not be forwarded.
            buffer.clear();
        }
        Ok(())
    }

    /// Returns true on the last assigned transmission of the period.
    fn count_buffer_transmission(&mut self, id: StreamId) -> bool {
        match self.buffer_counters.get_mut(&id) {
            Some((done, target)) => {
                *done += 1;
                if *done >= *target {
                    *done = 0;
                    true
                } else {
                    false
                }
            }
            None => {
                warn!("[D] buffer counters not initialized for stream {}", id.key());
                true
            }
        }
    }
}

/// The receiver checks the stream identity embedded in the frame without
/// consuming the packet.
fn check_stream_id(pkt: &Packet, id: StreamId) -> bool {
    if pkt.size() < SHORT_HEADER_SIZE + StreamId::SIZE {
        return false;
    }
    let bytes = [
        pkt.at(SHORT_HEADER_SIZE),
        pkt.at(SHORT_HEADER_SIZE + 1),
        pkt.at(SHORT_HEADER_SIZE + 2),
    ];
    StreamId::from_bytes(bytes) == id
}
