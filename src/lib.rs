//! TDMA medium-access control engine for multi-hop low-power wireless
//! mesh networks.
//!
//! One *master* node (network id 0) synchronizes up to N *dynamic* nodes,
//! collects the mesh topology and per-stream bandwidth requests over the
//! uplink, computes a conflict-free transmission schedule, floods it back
//! down, and from then on the whole mesh wakes and transmits in lock-step.

// Time is divided into tiles; a fixed cycle of tiles forms the control
// superframe:
//  - downlink tiles carry the timesync beacon (FLOPSYNC clock slaving,
//    Glossy-style flooding) or schedule distribution packets
//  - uplink tiles carry one node's neighbor table and forwarded stream
//    requests, round-robin over the mesh
//  - every tile's unused portion plays back data slots from the expanded
//    schedule
//
// The physical radio, the monotonic clock and the low-power sleep are
// external collaborators behind the `Radio` and `Clock` traits.

pub mod bits;
pub mod crypto;
pub mod data_phase;
pub mod flopsync;
pub mod frame;
pub mod mac;
pub mod neighbor;
pub mod packet;
pub mod parameters;
pub mod queue;
pub mod radio;
pub mod schedule;
pub mod schedule_computation;
pub mod schedule_distribution;
pub mod stream;
pub mod stream_manager;
pub mod time;
pub mod timesync;
pub mod topology;
pub mod uplink;
pub mod wakeup;

pub use mac::{MacContext, MediumAccessController};
pub use packet::{Packet, PacketError};
pub use parameters::{ControlSuperframeStructure, NetworkConfiguration, TileKind};
pub use radio::{Radio, RadioConfiguration, RecvError, RecvInfo};
pub use stream::{
    Direction, Period, Redundancy, StreamId, StreamParameters, StreamStatus,
};
pub use stream_manager::{StreamError, StreamManager};
pub use time::{Clock, LocalTime, NetworkTime};
