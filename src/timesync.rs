//! Timesync downlink phase.
//!
//! The master floods a sync beacon at the start of every slotframe; dynamic
//! nodes rebroadcast it Glossy-style, measure its arrival error against the
//! FLOPSYNC prediction and steer their virtual clock. A node that misses too
//! many consecutive beacons falls back to the desynchronized state and
//! listens with an infinite timeout until the mesh is heard again.

use crate::flopsync::{DelayCompensationFilter, Flopsync2, VirtualClock};
use crate::frame::{TimesyncFrame, TIMESYNC_FRAME_SIZE};
use crate::mac::MacContext;
use crate::parameters::{
    MAX_PROPAGATION_DELAY, PACKET_PREAMBLE_TIME, REBROADCAST_INTERVAL,
    RECEIVING_NODE_WAKEUP_ADVANCE, SENDING_NODE_WAKEUP_ADVANCE,
};
use crate::time::LocalTime;
use log::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimesyncStatus {
    Desynchronized,
    InSync,
}

/// What the slot-frame loop needs to know about a timesync execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimesyncEvent {
    None,
    /// First beacon after a desync: round-robin cursors must be re-seeded.
    Resynced,
    /// Too many missed beacons: all stream traffic pauses.
    Desynchronized,
}

/// Master role: origin of the beacon flood.
pub struct MasterTimesync {
    frame: TimesyncFrame,
    slotframe_time: i64,
}

impl MasterTimesync {
    pub fn new(pan_id: u16, first_timesync_time: LocalTime) -> Self {
        MasterTimesync {
            frame: TimesyncFrame::new(pan_id),
            slotframe_time: first_timesync_time.get(),
        }
    }

    pub fn slotframe_start(&self) -> LocalTime {
        LocalTime::new(self.slotframe_time)
    }

    pub fn execute(&mut self, ctx: &mut MacContext) -> TimesyncEvent {
        self.slotframe_time += ctx.config().clock_sync_period;
        ctx.configure_radio(false);
        let wakeup = LocalTime::new(self.slotframe_time - SENDING_NODE_WAKEUP_ADVANCE);
        if ctx.now() < wakeup {
            ctx.sleep_until(wakeup);
        }
        ctx.send_frame_at(self.frame.as_bytes(), LocalTime::new(self.slotframe_time));
        ctx.radio_idle();
        debug!("[T] ST={}", self.slotframe_time);
        self.frame.increment_counter();
        TimesyncEvent::None
    }
}

/// Dynamic role: beacon receiver, rebroadcaster and clock slave.
pub struct DynamicTimesync {
    status: TimesyncStatus,
    /// Arrival prediction on the ideal (uncorrected) timeline.
    theoretical_frame_start: i64,
    /// Arrival prediction including the running clock correction.
    computed_frame_start: i64,
    measured_frame_start: i64,
    clock_correction: i64,
    receiver_window: i64,
    missed_packets: u8,
    max_missed: u8,
    packet_counter: u32,
    synchronizer: Flopsync2,
    vt: VirtualClock,
    /// Smoothed estimate of the flood delay between the master's
    /// transmission and our arrival, one sample per received beacon.
    delay_filter: DelayCompensationFilter,
}

impl DynamicTimesync {
    pub fn new(max_window: i64, clock_sync_period: i64, max_missed: u8) -> Self {
        DynamicTimesync {
            status: TimesyncStatus::Desynchronized,
            theoretical_frame_start: 0,
            computed_frame_start: 0,
            measured_frame_start: 0,
            clock_correction: 0,
            receiver_window: max_window,
            missed_packets: 0,
            max_missed,
            packet_counter: 0,
            synchronizer: Flopsync2::new(max_window),
            vt: VirtualClock::new(clock_sync_period),
            delay_filter: DelayCompensationFilter::default(),
        }
    }

    pub fn status(&self) -> TimesyncStatus {
        self.status
    }

    pub fn receiver_window(&self) -> i64 {
        self.receiver_window
    }

    /// Map an ideal local deadline to the drift-corrected local timeline.
    pub fn correct(&self, t: LocalTime) -> LocalTime {
        LocalTime::new(self.vt.correct(t.get()))
    }

    pub fn execute(&mut self, ctx: &mut MacContext) -> TimesyncEvent {
        self.next(ctx);
        ctx.configure_radio(false);
        let event = match self.status {
            TimesyncStatus::Desynchronized => self.resync(ctx),
            TimesyncStatus::InSync => self.periodic_sync(ctx),
        };
        ctx.radio_idle();
        event
    }

    /// Advance the arrival predictions by one sync period.
    fn next(&mut self, ctx: &MacContext) {
        let period = ctx.config().clock_sync_period;
        // The theoretical timeline keeps the first hook as its only ground
        // reference, otherwise a second uncontrolled integrator would build
        // up.
        self.theoretical_frame_start += period;
        self.computed_frame_start += period + self.clock_correction;
    }

    /// Listen with no deadline until any valid beacon is heard, then hook
    /// the whole time base to it.
    fn resync(&mut self, ctx: &mut MacContext) -> TimesyncEvent {
        info!("[T] resync");
        let max_hops = ctx.config().max_hops;
        let pan_id = ctx.config().pan_id;
        let (mut frame, arrival) = loop {
            let mut buf = [0u8; TIMESYNC_FRAME_SIZE];
            let Ok(rcv) = ctx.recv_frame(&mut buf, LocalTime::FAR_FUTURE) else {
                continue;
            };
            if rcv.size == TIMESYNC_FRAME_SIZE && TimesyncFrame::check(&buf, pan_id) {
                let frame = TimesyncFrame::from_bytes(buf);
                if frame.hop() < max_hops {
                    break (frame, rcv.timestamp);
                }
            }
        };

        // The flood delay accumulated so far brings the arrival back to the
        // master's transmission time; the smoothed estimate absorbs the
        // per-beacon jitter of the rebroadcast chain.
        self.delay_filter
            .add_value(frame.hop() as i64 * REBROADCAST_INTERVAL);
        let start = arrival.get() - self.delay_filter.filtered_value();
        frame.increment_hop();
        let hop = frame.hop();
        ctx.set_hop(hop);
        self.reset(arrival.get());
        if hop < max_hops {
            ctx.send_frame_at(frame.as_bytes(), arrival.add_ns(REBROADCAST_INTERVAL));
        }
        ctx.radio_idle();

        self.packet_counter = frame.counter();
        let offset =
            self.packet_counter as i64 * ctx.config().clock_sync_period - start;
        ctx.time_base().set_offset(offset);
        info!("[T] hop={hop} ats={} cnt={}", arrival.get(), self.packet_counter);
        TimesyncEvent::Resynced
    }

    /// One in-sync beacon round: receive in the FLOPSYNC window, feed the
    /// controller, rebroadcast.
    fn periodic_sync(&mut self, ctx: &mut MacContext) -> TimesyncEvent {
        let pan_id = ctx.config().pan_id;
        let max_hops = ctx.config().max_hops;
        let corrected_start = self.vt.correct(self.computed_frame_start);
        let wakeup = LocalTime::new(
            corrected_start - (RECEIVING_NODE_WAKEUP_ADVANCE + self.receiver_window),
        );
        let deadline = LocalTime::new(
            corrected_start
                + self.receiver_window
                + PACKET_PREAMBLE_TIME
                + MAX_PROPAGATION_DELAY,
        );
        if ctx.now() < wakeup {
            ctx.sleep_until(wakeup);
        }

        let received = loop {
            let mut buf = [0u8; TIMESYNC_FRAME_SIZE];
            match ctx.recv_frame(&mut buf, deadline) {
                Ok(rcv) => {
                    if rcv.size == TIMESYNC_FRAME_SIZE && TimesyncFrame::check(&buf, pan_id) {
                        break Some((TimesyncFrame::from_bytes(buf), rcv.timestamp));
                    }
                }
                Err(_) => break None,
            }
        };

        match received {
            Some((mut frame, arrival)) => {
                // Keep the flood-delay estimate fresh for the next rehook.
                self.delay_filter
                    .add_value(frame.hop() as i64 * REBROADCAST_INTERVAL);
                frame.increment_hop();
                self.measured_frame_start = arrival.get();
                if frame.hop() < max_hops {
                    ctx.send_frame_at(frame.as_bytes(), arrival.add_ns(REBROADCAST_INTERVAL));
                }
                ctx.radio_idle();
                self.packet_counter = frame.counter();

                let error = arrival.get() - self.computed_frame_start;
                let (correction, window) = self.synchronizer.compute_correction(error);
                self.missed_packets = 0;
                self.clock_correction = correction;
                self.receiver_window = window;
                self.update_vt();
                debug!(
                    "[T] hop={} e={} u={} w={}",
                    frame.hop(),
                    error,
                    correction,
                    window
                );
                TimesyncEvent::None
            }
            None => {
                let n = self.missed_packet();
                debug!("[T] miss u={} w={}", self.clock_correction, self.receiver_window);
                if n >= ctx.config().max_missed_timesyncs {
                    warn!("[T] lost sync");
                    TimesyncEvent::Desynchronized
                } else {
                    TimesyncEvent::None
                }
            }
        }
    }

    fn missed_packet(&mut self) -> u8 {
        self.missed_packets += 1;
        if self.missed_packets >= self.max_missed {
            self.status = TimesyncStatus::Desynchronized;
            self.synchronizer.reset();
        } else {
            self.measured_frame_start = self.computed_frame_start;
            let (correction, window) = self.synchronizer.lost_packet();
            self.clock_correction = correction;
            self.receiver_window = window;
            self.update_vt();
        }
        self.missed_packets
    }

    fn update_vt(&mut self) {
        self.vt.update(
            self.theoretical_frame_start,
            self.computed_frame_start,
            self.clock_correction,
        );
    }

    /// Hook every timeline to the first beacon heard after a desync. All
    /// timestamps start from here, so nothing needs correcting yet.
    fn reset(&mut self, hook_time: i64) {
        self.synchronizer.reset();
        self.measured_frame_start = hook_time;
        self.computed_frame_start = hook_time;
        self.theoretical_frame_start = hook_time;
        self.receiver_window = self.synchronizer.receiver_window();
        self.clock_correction = 0;
        self.missed_packets = 0;
        self.status = TimesyncStatus::InSync;
    }
}
