//! Stream wake-up scheduling.
//!
//! Application threads that feed periodic streams must be running before the
//! MAC reaches the stream's send slot. A dedicated task walks two ordered
//! queues of wake-up entries (the current schedule cycle and the entries of
//! the following cycle whose advance reaches back into this one), sleeps to
//! the earliest entry and signals the stream's condition variable.

use crate::parameters::NetworkConfiguration;
use crate::schedule::{Action, ExplicitScheduleElement, ScheduleHeader};
use crate::stream::StreamId;
use crate::stream_manager::StreamManager;
use crate::time::{Clock, TimeBase};
use log::{debug, info};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupKind {
    Stream,
    Downlink,
    Empty,
}

/// One wake-up entry: when to wake whom, and how often it recurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamWakeupInfo {
    pub kind: WakeupKind,
    pub id: StreamId,
    /// Absolute local time of the wake-up.
    pub wakeup_time: i64,
    /// Recurrence period in tiles.
    pub period_tiles: u32,
}

impl StreamWakeupInfo {
    pub fn empty() -> Self {
        StreamWakeupInfo {
            kind: WakeupKind::Empty,
            id: StreamId::default(),
            wakeup_time: i64::MAX,
            period_tiles: 0,
        }
    }

    /// Ascending wakeup time; ties broken by shorter period, then streams
    /// before downlinks.
    fn sort_key(&self) -> (i64, u32, u8) {
        let kind_rank = match self.kind {
            WakeupKind::Stream => 0,
            WakeupKind::Downlink => 1,
            WakeupKind::Empty => 2,
        };
        (self.wakeup_time, self.period_tiles, kind_rank)
    }
}

/// A queue of wake-up entries kept in ascending order.
#[derive(Debug, Clone, Default)]
pub struct WakeupQueue {
    items: Vec<StreamWakeupInfo>,
}

impl WakeupQueue {
    pub fn new(mut items: Vec<StreamWakeupInfo>) -> Self {
        items.sort_by_key(|i| i.sort_key());
        WakeupQueue { items }
    }

    pub fn head(&self) -> StreamWakeupInfo {
        self.items.first().copied().unwrap_or_else(StreamWakeupInfo::empty)
    }

    pub fn pop_head(&mut self) -> StreamWakeupInfo {
        if self.items.is_empty() {
            StreamWakeupInfo::empty()
        } else {
            self.items.remove(0)
        }
    }

    pub fn push(&mut self, info: StreamWakeupInfo) {
        let at = self
            .items
            .partition_point(|i| i.sort_key() <= info.sort_key());
        self.items.insert(at, info);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Wake-up queues of one schedule plus its activation point.
#[derive(Debug, Clone, Default)]
struct ScheduleWakeupData {
    curr: WakeupQueue,
    next: WakeupQueue,
    activation_tile: u32,
    /// Activation instant converted to local time.
    activation_time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedulerState {
    /// No schedule received yet.
    Idle,
    /// A schedule is staged but its activation tile is in the future.
    AwaitingActivation,
    /// The staged schedule is the running one.
    Active,
}

struct Inner {
    state: SchedulerState,
    data: ScheduleWakeupData,
    staged: ScheduleWakeupData,
    staged_available: bool,
    running: bool,
}

/// The wake-up scheduler task of one node.
pub struct StreamWaitScheduler {
    config: NetworkConfiguration,
    clock: Arc<dyn Clock>,
    time_base: Arc<TimeBase>,
    stream_mgr: Arc<StreamManager>,
    inner: Mutex<Inner>,
    staged_cv: Condvar,
}

impl StreamWaitScheduler {
    pub fn new(
        config: NetworkConfiguration,
        clock: Arc<dyn Clock>,
        time_base: Arc<TimeBase>,
        stream_mgr: Arc<StreamManager>,
    ) -> Arc<Self> {
        Arc::new(StreamWaitScheduler {
            config,
            clock,
            time_base,
            stream_mgr,
            inner: Mutex::new(Inner {
                state: SchedulerState::Idle,
                data: ScheduleWakeupData::default(),
                staged: ScheduleWakeupData::default(),
                staged_available: false,
                running: true,
            }),
            staged_cv: Condvar::new(),
        })
    }

    /// Stage the wake-up queues of a newly received schedule; they replace
    /// the running ones atomically at the activation tile.
    pub fn set_schedule(
        &self,
        curr: Vec<StreamWakeupInfo>,
        next: Vec<StreamWakeupInfo>,
        activation_tile: u32,
    ) {
        let activation_network = activation_tile as i64 * self.config.tile_duration;
        let mut inner = self.inner.lock().unwrap();
        inner.staged = ScheduleWakeupData {
            curr: WakeupQueue::new(curr),
            next: WakeupQueue::new(next),
            activation_tile,
            activation_time: self
                .time_base
                .to_local(crate::time::NetworkTime::new(activation_network))
                .get(),
        };
        inner.staged_available = true;
        debug!("wakeup scheduler: staged schedule, activation tile {activation_tile}");
        self.staged_cv.notify_all();
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        std::thread::spawn(move || this.run())
    }

    pub fn stop(&self) {
        self.inner.lock().unwrap().running = false;
        self.staged_cv.notify_all();
    }

    fn current_tile(&self) -> u32 {
        let nt = self.time_base.to_network(self.clock.now()).get();
        (nt / self.config.tile_duration).max(0) as u32
    }

    fn next_tile_start(&self) -> i64 {
        let nt = self.time_base.to_network(self.clock.now()).get();
        let tile = nt.div_euclid(self.config.tile_duration) + 1;
        self.time_base
            .to_local(crate::time::NetworkTime::new(tile * self.config.tile_duration))
            .get()
    }

    fn run(&self) {
        info!("wakeup scheduler started");
        loop {
            let state = {
                let inner = self.inner.lock().unwrap();
                if !inner.running {
                    break;
                }
                inner.state
            };
            match state {
                SchedulerState::Idle => self.idle(),
                SchedulerState::AwaitingActivation => self.awaiting_activation(),
                SchedulerState::Active => self.active(),
            }
        }
        info!("wakeup scheduler stopped");
    }

    fn idle(&self) {
        let mut inner = self.inner.lock().unwrap();
        while inner.running && !inner.staged_available {
            inner = self.staged_cv.wait(inner).unwrap();
        }
        if inner.staged_available {
            inner.staged_available = false;
            inner.state = SchedulerState::AwaitingActivation;
        }
    }

    fn awaiting_activation(&self) {
        let (activation_tile, activation_time) = {
            let inner = self.inner.lock().unwrap();
            (inner.staged.activation_tile, inner.staged.activation_time)
        };
        let tile = self.current_tile();
        if tile >= activation_tile {
            let mut inner = self.inner.lock().unwrap();
            inner.data = std::mem::take(&mut inner.staged);
            inner.state = SchedulerState::Active;
            debug!("wakeup scheduler: schedule active at tile {tile}");
            return;
        }

        // While the old schedule still runs, serve its entries; in the last
        // tile before activation the following-cycle queue is the staged one.
        let last_tile_before = tile + 1 == activation_tile;
        let info = self.pop_and_requeue(last_tile_before);
        if info.wakeup_time > activation_time {
            self.clock
                .sleep_until(crate::time::LocalTime::new(activation_time));
            return;
        }
        match info.kind {
            WakeupKind::Stream => {
                self.clock
                    .sleep_until(crate::time::LocalTime::new(info.wakeup_time));
                self.stream_mgr.wakeup(info.id);
            }
            WakeupKind::Downlink => {
                // Still awaiting: no newer schedule can arrive before the
                // staged one activates.
            }
            WakeupKind::Empty => {
                let next = self.next_tile_start();
                self.clock.sleep_until(crate::time::LocalTime::new(next));
            }
        }
    }

    fn active(&self) {
        let info = self.pop_and_requeue(false);
        match info.kind {
            WakeupKind::Stream => {
                self.clock
                    .sleep_until(crate::time::LocalTime::new(info.wakeup_time));
                self.stream_mgr.wakeup(info.id);
            }
            WakeupKind::Downlink => {
                self.clock
                    .sleep_until(crate::time::LocalTime::new(info.wakeup_time));
                let mut inner = self.inner.lock().unwrap();
                if inner.staged_available {
                    inner.staged_available = false;
                    inner.state = SchedulerState::AwaitingActivation;
                }
            }
            WakeupKind::Empty => {
                let next = self.next_tile_start();
                self.clock.sleep_until(crate::time::LocalTime::new(next));
            }
        }
    }

    /// Pop the earlier head of the two queues and re-insert it advanced by
    /// its period, preserving queue order.
    fn pop_and_requeue(&self, use_staged_next: bool) -> StreamWakeupInfo {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let other_head = if use_staged_next {
            inner.staged.next.head()
        } else {
            inner.data.next.head()
        };
        let use_curr = inner.data.curr.head().sort_key() <= other_head.sort_key();

        let queue = if use_curr {
            &mut inner.data.curr
        } else if use_staged_next {
            &mut inner.staged.next
        } else {
            &mut inner.data.next
        };
        let info = queue.pop_head();
        if info.kind != WakeupKind::Empty {
            let mut updated = info;
            updated.wakeup_time += updated.period_tiles as i64 * self.config.tile_duration;
            queue.push(updated);
        }
        info
    }
}

/// Build the two wake-up queues of an expanded schedule.
///
/// Entries cover every send slot of streams originating at this node plus
/// one entry per downlink tile (used by the task to notice staged
/// schedules). An entry whose advance reaches before the cycle start
/// belongs to the following cycle's queue.
pub fn build_wakeup_queues(
    explicit: &[ExplicitScheduleElement],
    header: &ScheduleHeader,
    config: &NetworkConfiguration,
    stream_mgr: &StreamManager,
    time_base: &TimeBase,
) -> (Vec<StreamWakeupInfo>, Vec<StreamWakeupInfo>) {
    let mut curr = Vec::new();
    let mut next = Vec::new();
    let slot_duration = config.data_slot_duration();
    let cycle_tiles = header.schedule_tiles.max(1) as u32;
    let cycle_ns = cycle_tiles as i64 * config.tile_duration;
    let activation_local = time_base
        .to_local(crate::time::NetworkTime::new(
            header.activation_tile as i64 * config.tile_duration,
        ))
        .get();

    for (slot, element) in explicit.iter().enumerate() {
        if element.action != Action::SendStream {
            continue;
        }
        let tile = slot / config.slots_per_tile as usize;
        let slot_in_tile = slot % config.slots_per_tile as usize;
        let slot_offset =
            tile as i64 * config.tile_duration + slot_in_tile as i64 * slot_duration;
        let advance =
            stream_mgr.wakeup_advance(element.id) + config.callbacks_execution_time;
        let rel = slot_offset - advance;
        let info = StreamWakeupInfo {
            kind: WakeupKind::Stream,
            id: element.id,
            wakeup_time: activation_local + rel.rem_euclid(cycle_ns),
            period_tiles: cycle_tiles,
        };
        if rel < 0 {
            next.push(info);
        } else {
            curr.push(info);
        }
    }

    let superframe_tiles = config.control_superframe.size() as u32;
    for tile in 0..config.control_superframe.size() {
        if config.control_superframe.is_control_downlink(tile) {
            curr.push(StreamWakeupInfo {
                kind: WakeupKind::Downlink,
                id: StreamId::default(),
                wakeup_time: activation_local
                    + tile as i64 * config.tile_duration
                    + config.downlink_phase_duration(),
                period_tiles: superframe_tiles,
            });
        }
    }

    (curr, next)
}
