//! FLOPSYNC-2 clock synchronization controller and virtual clock.
//!
//! The controller consumes the measured arrival error of each sync beacon
//! and produces the clock correction to apply over the next sync period plus
//! the receiver window to open around the next expected beacon. The virtual
//! clock turns the correction into a linear mapping from ideal (uncorrected)
//! local time to predicted local time, applied to every deadline the node
//! schedules between two beacons.

/// Narrowest receiver window the controller will request.
pub const MIN_RECEIVER_WINDOW: i64 = 50_000;

/// Second-order deadbeat controller over the beacon arrival error.
#[derive(Debug, Clone)]
pub struct Flopsync2 {
    /// Correction over one sync period.
    u: i64,
    /// Previous error sample.
    e_old: i64,
    /// IIR-filtered absolute error, tracks the synchronization jitter.
    deviation: i64,
    max_window: i64,
    window: i64,
}

impl Flopsync2 {
    pub fn new(max_window: i64) -> Self {
        Flopsync2 {
            u: 0,
            e_old: 0,
            deviation: 0,
            max_window,
            window: max_window,
        }
    }

    /// Feed the arrival error of a received beacon.
    /// Returns `(clock_correction, receiver_window)`.
    pub fn compute_correction(&mut self, e: i64) -> (i64, i64) {
        // u(k) = u(k-1) + (3 e(k) - e(k-1)) / 2: deadbeat placement for the
        // double-integrator clock model.
        self.u += (3 * e - self.e_old) / 2;
        self.e_old = e;

        self.deviation = (3 * self.deviation + e.abs()) / 4;
        self.window = (3 * self.deviation).clamp(MIN_RECEIVER_WINDOW, self.max_window);
        (self.u, self.window)
    }

    /// A beacon was missed: hold the correction and widen the window so the
    /// next beacon is not lost to accumulated drift.
    pub fn lost_packet(&mut self) -> (i64, i64) {
        self.window = (self.window * 2).min(self.max_window);
        (self.u, self.window)
    }

    pub fn reset(&mut self) {
        self.u = 0;
        self.e_old = 0;
        self.deviation = 0;
        self.window = self.max_window;
    }

    pub fn receiver_window(&self) -> i64 {
        self.window
    }
}

/// Linear map from the ideal beacon timeline to the predicted local one.
///
/// After each beacon the map is re-anchored: `theoretical` is where the
/// beacon would land on an ideal clock, `computed` is where the corrected
/// prediction puts it, and the slope spreads `correction` over one sync
/// period.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    base_theoretical: i64,
    base_computed: i64,
    correction: i64,
    sync_period: i64,
}

impl VirtualClock {
    pub fn new(sync_period: i64) -> Self {
        assert!(sync_period > 0);
        VirtualClock {
            base_theoretical: 0,
            base_computed: 0,
            correction: 0,
            sync_period,
        }
    }

    pub fn update(&mut self, theoretical: i64, computed: i64, correction: i64) {
        self.base_theoretical = theoretical;
        self.base_computed = computed;
        self.correction = correction;
    }

    /// Map an uncorrected time to the corrected local timeline.
    pub fn correct(&self, uncorrected: i64) -> i64 {
        let delta = uncorrected - self.base_theoretical;
        let scaled = (delta as i128 * (self.sync_period + self.correction) as i128
            / self.sync_period as i128) as i64;
        self.base_computed + scaled
    }
}

/// First-order IIR smoothing of the per-hop rebroadcast delay estimate.
#[derive(Debug, Clone, Default)]
pub struct DelayCompensationFilter {
    value: i64,
    primed: bool,
}

impl DelayCompensationFilter {
    pub fn add_value(&mut self, sample: i64) {
        if self.primed {
            self.value = (3 * self.value + sample) / 4;
        } else {
            self.value = sample;
            self.primed = true;
        }
    }

    pub fn filtered_value(&self) -> i64 {
        self.value
    }

    pub fn has_value(&self) -> bool {
        self.primed
    }
}
