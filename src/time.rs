//! Local and network time domains.
//!
//! Every node has a free-running monotonic clock ([`LocalTime`]). The master's
//! clock defines the network-wide time ([`NetworkTime`]); a slave maps between
//! the two with a single signed offset, set once per (re)synchronization from
//! the sync-packet counter carried by the timesync beacon.
//!
//! The two domains are deliberately separate newtypes: only [`NetworkTime`]
//! may be compared across nodes, raw local time may not.

use std::sync::atomic::{AtomicI64, Ordering};

/// A point in time on this node's monotonic clock, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct LocalTime(i64);

impl LocalTime {
    /// Sentinel deadline meaning "wait forever" for receive operations.
    pub const FAR_FUTURE: LocalTime = LocalTime(i64::MAX);

    pub const fn new(ns: i64) -> Self {
        LocalTime(ns)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    pub const fn add_ns(self, ns: i64) -> Self {
        LocalTime(self.0 + ns)
    }

    pub const fn sub_ns(self, ns: i64) -> Self {
        LocalTime(self.0 - ns)
    }
}

/// A point in time shared by the whole mesh, in nanoseconds since the
/// master's first beacon.
///
/// Constructors are explicit to prevent accidental mixing with the other
/// times present in a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct NetworkTime(i64);

impl NetworkTime {
    pub const fn new(ns: i64) -> Self {
        NetworkTime(ns)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    pub const fn add_ns(self, ns: i64) -> Self {
        NetworkTime(self.0 + ns)
    }
}

/// The local-to-network clock offset of one MAC context.
///
/// `network = local + offset`. The offset is written by the timesync phase on
/// resync and read by every other phase, possibly from other threads, hence
/// the atomic.
#[derive(Debug, Default)]
pub struct TimeBase {
    local_to_network_offset: AtomicI64,
}

impl TimeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the offset between the local node clock and the network time.
    ///
    /// The local clock rate is already steered to the master's rate while
    /// sync packets keep arriving; only the network time carries the offset
    /// jump, so sleeping tasks on the local clock are unaffected.
    pub fn set_offset(&self, offset: i64) {
        self.local_to_network_offset.store(offset, Ordering::Relaxed);
    }

    pub fn offset(&self) -> i64 {
        self.local_to_network_offset.load(Ordering::Relaxed)
    }

    pub fn to_network(&self, t: LocalTime) -> NetworkTime {
        NetworkTime(t.get() + self.offset())
    }

    pub fn to_local(&self, t: NetworkTime) -> LocalTime {
        LocalTime(t.get() - self.offset())
    }
}

/// The node's monotonic clock and low-power sleep primitive.
///
/// The MAC task only ever yields through `sleep_until` and the radio's
/// receive deadline, so implementations are expected to provide an absolute,
/// non-drifting sleep.
pub trait Clock: Send + Sync {
    fn now(&self) -> LocalTime;

    /// Sleep until the given absolute local time. Returns immediately if the
    /// deadline already passed.
    fn sleep_until(&self, deadline: LocalTime);
}
