//! MAC context and top-level slot-frame loop.
//!
//! The context owns the configuration, the radio and the clock, and offers
//! the timing primitives every phase uses. The loop walks the control
//! superframe tile by tile: the first downlink tile of each clock-sync
//! period runs timesync, the other downlink tiles run schedule
//! distribution, uplink tiles run the collection phase, and the unused
//! portion of every tile plays back data slots.

use crate::crypto::KeyManager;
use crate::data_phase::DataPhase;
use crate::neighbor::NeighborTable;
use crate::packet::Packet;
use crate::parameters::NetworkConfiguration;
use crate::radio::{Radio, RecvError, RecvInfo};
use crate::schedule_computation::ScheduleComputation;
use crate::schedule_distribution::{DynamicScheduleDistribution, MasterScheduleDistribution};
use crate::stream_manager::StreamManager;
use crate::time::{Clock, LocalTime, NetworkTime, TimeBase};
use crate::timesync::{DynamicTimesync, MasterTimesync, TimesyncEvent, TimesyncStatus};
use crate::uplink::UplinkPhase;
use crate::wakeup::StreamWaitScheduler;
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Shared services of one node's MAC.
pub struct MacContext {
    config: NetworkConfiguration,
    clock: Arc<dyn Clock>,
    radio: Box<dyn Radio>,
    time_base: Arc<TimeBase>,
    hop: u8,
    network_id: u8,
    send_total: u32,
    rcv_total: u32,
    rcv_errors: u32,
}

impl MacContext {
    pub fn new(
        config: NetworkConfiguration,
        clock: Arc<dyn Clock>,
        radio: Box<dyn Radio>,
        network_id: u8,
    ) -> Self {
        MacContext {
            config,
            clock,
            radio,
            time_base: Arc::new(TimeBase::new()),
            hop: 0,
            network_id,
            send_total: 0,
            rcv_total: 0,
            rcv_errors: 0,
        }
    }

    pub fn config(&self) -> &NetworkConfiguration {
        &self.config
    }

    pub fn network_id(&self) -> u8 {
        self.network_id
    }

    pub fn hop(&self) -> u8 {
        self.hop
    }

    pub fn set_hop(&mut self, hop: u8) {
        self.hop = hop;
    }

    pub fn time_base(&self) -> &Arc<TimeBase> {
        &self.time_base
    }

    pub fn now(&self) -> LocalTime {
        self.clock.now()
    }

    pub fn sleep_until(&self, deadline: LocalTime) {
        self.clock.sleep_until(deadline);
    }

    /// Tile counter of the instant `t`, in the network time domain.
    pub fn current_tile(&self, t: LocalTime) -> u32 {
        let nt = self.time_base.to_network(t).get();
        (nt / self.config.tile_duration).max(0) as u32
    }

    pub fn configure_radio(&mut self, strict_timeout: bool) {
        self.radio
            .configure(self.config.radio_configuration().with_timeout(strict_timeout));
    }

    pub fn radio_on(&mut self) {
        self.radio.turn_on();
    }

    pub fn radio_off(&mut self) {
        self.radio.turn_off();
    }

    pub fn radio_idle(&mut self) {
        self.radio.idle();
    }

    pub fn send_frame_at(&mut self, frame: &[u8], when: LocalTime) {
        self.send_total += 1;
        self.radio.send_at(frame, when);
    }

    pub fn send_packet_at(&mut self, pkt: &Packet, when: LocalTime) {
        self.send_total += 1;
        self.radio.send_at(pkt.as_bytes(), when);
    }

    pub fn recv_frame(
        &mut self,
        buf: &mut [u8],
        deadline: LocalTime,
    ) -> Result<RecvInfo, RecvError> {
        self.rcv_total += 1;
        let r = self.radio.recv(buf, deadline);
        if r.is_err() {
            self.rcv_errors += 1;
        }
        r
    }

    pub fn recv_packet(
        &mut self,
        pkt: &mut Packet,
        deadline: LocalTime,
    ) -> Result<RecvInfo, RecvError> {
        self.rcv_total += 1;
        let r = pkt.recv(&mut *self.radio, deadline);
        if r.is_err() {
            self.rcv_errors += 1;
        }
        r
    }

    pub fn send_count(&self) -> u32 {
        self.send_total
    }

    pub fn recv_counts(&self) -> (u32, u32) {
        (self.rcv_total, self.rcv_errors)
    }
}

enum TimesyncRole {
    Master(MasterTimesync),
    Dynamic(DynamicTimesync),
}

enum DownlinkRole {
    Master(MasterScheduleDistribution),
    Dynamic(DynamicScheduleDistribution),
}

/// One node's complete MAC: context, phases and auxiliary tasks.
pub struct MediumAccessController {
    ctx: MacContext,
    timesync: TimesyncRole,
    uplink: UplinkPhase,
    downlink: DownlinkRole,
    data: DataPhase,
    stream_mgr: Arc<StreamManager>,
    wakeup: Arc<StreamWaitScheduler>,
    computation: Option<ScheduleComputation>,
    tile_counter: u32,
    running: Arc<AtomicBool>,
}

impl MediumAccessController {
    /// Build the master node (network id 0). Network time zero is placed
    /// one tile in the future so the first beacon has room to be prepared.
    pub fn new_master(
        config: NetworkConfiguration,
        clock: Arc<dyn Clock>,
        radio: Box<dyn Radio>,
        key_manager: Option<KeyManager>,
    ) -> Self {
        assert_eq!(
            config.clock_sync_period % config.superframe_duration(),
            0,
            "clock sync period must be a whole number of superframes"
        );
        let t0 = clock.now().add_ns(config.tile_duration);
        let mut ctx = MacContext::new(config.clone(), clock, radio, 0);
        ctx.time_base().set_offset(-t0.get());
        ctx.set_hop(0);

        let computation = ScheduleComputation::new(config.clone());
        let stream_mgr = StreamManager::new(0, config.pan_id);
        let wakeup = StreamWaitScheduler::new(
            config.clone(),
            ctx.clock.clone(),
            ctx.time_base.clone(),
            stream_mgr.clone(),
        );
        let neighbors = NeighborTable::new(
            config.max_nodes,
            0,
            config.min_neighbor_rssi,
            config.max_rounds_unavailable_becomes_dead,
        );
        // The master's first execute advances the slotframe before sending.
        let first = t0.sub_ns(config.clock_sync_period);
        MediumAccessController {
            timesync: TimesyncRole::Master(MasterTimesync::new(config.pan_id, first)),
            uplink: UplinkPhase::new_master(computation.clone(), neighbors, config.max_nodes),
            downlink: DownlinkRole::Master(MasterScheduleDistribution::new(computation.clone())),
            data: DataPhase::new(
                0,
                config.slots_per_tile,
                config.tile_duration,
                stream_mgr.clone(),
                key_manager,
            ),
            stream_mgr,
            wakeup,
            computation: Some(computation),
            tile_counter: 0,
            running: Arc::new(AtomicBool::new(true)),
            ctx,
        }
    }

    /// Build a dynamic node with a static network id.
    pub fn new_dynamic(
        config: NetworkConfiguration,
        clock: Arc<dyn Clock>,
        radio: Box<dyn Radio>,
        key_manager: Option<KeyManager>,
    ) -> Self {
        assert_eq!(
            config.clock_sync_period % config.superframe_duration(),
            0,
            "clock sync period must be a whole number of superframes"
        );
        let network_id = config.static_network_id;
        assert!(network_id != 0, "network id 0 is the master");
        let ctx = MacContext::new(config.clone(), clock, radio, network_id);

        let stream_mgr = StreamManager::new(network_id, config.pan_id);
        let wakeup = StreamWaitScheduler::new(
            config.clone(),
            ctx.clock.clone(),
            ctx.time_base.clone(),
            stream_mgr.clone(),
        );
        let neighbors = NeighborTable::new(
            config.max_nodes,
            network_id,
            config.min_neighbor_rssi,
            config.max_rounds_unavailable_becomes_dead,
        );
        MediumAccessController {
            timesync: TimesyncRole::Dynamic(DynamicTimesync::new(
                config.max_admitted_rcv_window,
                config.clock_sync_period,
                config.max_missed_timesyncs,
            )),
            uplink: UplinkPhase::new_dynamic(neighbors, config.max_nodes),
            downlink: DownlinkRole::Dynamic(DynamicScheduleDistribution::new()),
            data: DataPhase::new(
                network_id,
                config.slots_per_tile,
                config.tile_duration,
                stream_mgr.clone(),
                key_manager,
            ),
            stream_mgr,
            wakeup,
            computation: None,
            tile_counter: 0,
            running: Arc::new(AtomicBool::new(true)),
            ctx,
        }
    }

    /// The endpoint façade handed to application threads.
    pub fn stream_manager(&self) -> Arc<StreamManager> {
        self.stream_mgr.clone()
    }

    pub fn context(&self) -> &MacContext {
        &self.ctx
    }

    pub fn is_in_sync(&self) -> bool {
        match &self.timesync {
            TimesyncRole::Master(_) => true,
            TimesyncRole::Dynamic(ts) => ts.status() == TimesyncStatus::InSync,
        }
    }

    /// Spawn the auxiliary tasks: the wake-up scheduler and, on the
    /// master, the schedule computation worker.
    pub fn start_aux_tasks(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.wakeup.start()];
        if let Some(computation) = &self.computation {
            handles.push(computation.start_thread());
        }
        handles
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.wakeup.stop();
        if let Some(computation) = &self.computation {
            computation.stop();
        }
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Drive the MAC until `stop` is called.
    pub fn run(&mut self) {
        info!("MAC loop started, node {}", self.ctx.network_id());
        while self.running.load(Ordering::Relaxed) {
            self.run_tile();
        }
        info!("MAC loop stopped, node {}", self.ctx.network_id());
    }

    /// Execute exactly `count` tiles; test and embedder hook.
    pub fn run_tiles(&mut self, count: u32) {
        for _ in 0..count {
            self.run_tile();
        }
    }

    /// Map a network-time instant to the drift-corrected local deadline.
    fn local_deadline(&self, nt: i64) -> LocalTime {
        let raw = self.ctx.time_base.to_local(NetworkTime::new(nt));
        match &self.timesync {
            TimesyncRole::Master(_) => raw,
            TimesyncRole::Dynamic(ts) => ts.correct(raw),
        }
    }

    fn run_tile(&mut self) {
        // A desynchronized node has exactly one job: hear a beacon.
        if let TimesyncRole::Dynamic(ts) = &mut self.timesync {
            if ts.status() == TimesyncStatus::Desynchronized {
                let event = ts.execute(&mut self.ctx);
                if event == TimesyncEvent::Resynced {
                    self.after_resync();
                }
                return;
            }
        }

        let config = self.ctx.config().clone();
        let tile = self.tile_counter;
        self.tile_counter = self.tile_counter.wrapping_add(1);
        let tile_nt = tile as i64 * config.tile_duration;
        let superframe_pos = tile as usize % config.control_superframe.size();
        let slot_duration = config.data_slot_duration();

        let control_slots = if config.control_superframe.is_control_downlink(superframe_pos) {
            if tile_nt % config.clock_sync_period == 0 {
                self.execute_timesync();
            } else {
                self.execute_downlink(self.local_deadline(tile_nt));
            }
            config.downlink_phase_slots()
        } else if config.control_superframe.is_control_uplink(superframe_pos) {
            let slot_start = self.local_deadline(tile_nt);
            self.uplink
                .execute(&mut self.ctx, &self.stream_mgr, slot_start);
            config.uplink_phase_slots()
        } else {
            0
        };

        // The rest of the tile belongs to the data phase.
        let in_sync = self.is_in_sync();
        self.data.skip_control_slots(control_slots);
        for slot in control_slots..config.slots_per_tile {
            let slot_nt = tile_nt + slot as i64 * slot_duration;
            let slot_start = self.local_deadline(slot_nt);
            if in_sync {
                self.data.execute(&mut self.ctx, slot_start);
            } else {
                self.data.advance(&mut self.ctx, slot_start);
            }
        }
    }

    fn execute_timesync(&mut self) {
        let event = match &mut self.timesync {
            TimesyncRole::Master(ts) => ts.execute(&mut self.ctx),
            TimesyncRole::Dynamic(ts) => ts.execute(&mut self.ctx),
        };
        match event {
            TimesyncEvent::Resynced => self.after_resync(),
            TimesyncEvent::Desynchronized => {
                info!("node {} lost synchronization", self.ctx.network_id());
            }
            TimesyncEvent::None => {}
        }
    }

    fn execute_downlink(&mut self, slot_start: LocalTime) {
        match &mut self.downlink {
            DownlinkRole::Master(dl) => dl.execute(
                &mut self.ctx,
                &mut self.data,
                &self.stream_mgr,
                &self.wakeup,
                slot_start,
            ),
            DownlinkRole::Dynamic(dl) => {
                let window = match &self.timesync {
                    TimesyncRole::Dynamic(ts) => ts.receiver_window(),
                    TimesyncRole::Master(_) => unreachable!(),
                };
                dl.execute(
                    &mut self.ctx,
                    &mut self.data,
                    &self.stream_mgr,
                    &self.wakeup,
                    slot_start,
                    window,
                )
            }
        }
    }

    /// Re-seed every cursor that depends on network time after hooking to
    /// a beacon.
    fn after_resync(&mut self) {
        let now_nt = self.ctx.time_base.to_network(self.ctx.now());
        self.uplink
            .align_to_network_time(now_nt, self.ctx.config());
        // Resume the tile walk from where the mesh is, not where this node
        // left off; the data cursor is seeded to the same boundary.
        self.tile_counter = self.ctx.current_tile(self.ctx.now()).wrapping_add(1);
        self.data.align_to_network_time(NetworkTime::new(
            self.tile_counter as i64 * self.ctx.config().tile_duration,
        ));
        info!(
            "node {} resynchronized at tile {}",
            self.ctx.network_id(),
            self.tile_counter
        );
    }
}
