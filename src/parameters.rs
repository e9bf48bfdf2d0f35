//! Network configuration and MAC timing parameters.
//!
//! The configuration is provided read-only by the embedder; the engine never
//! mutates it. Time quantities are nanoseconds throughout.

use serde::{Deserialize, Serialize};

/// Maximum frame payload, see [`crate::packet::MAX_PACKET_SIZE`].
pub const MAX_PKT_SIZE: usize = 125;

/// On-air time per byte at 250 kbit/s.
pub const BYTE_ON_AIR_TIME: i64 = 32_000;

/// Preamble + start-of-frame delimiter on-air time (5 bytes).
pub const PACKET_PREAMBLE_TIME: i64 = 160_000;

/// Upper bound on signal propagation plus timestamping jitter.
pub const MAX_PROPAGATION_DELAY: i64 = 100_000;

/// Advance needed by a sending node between wakeup and the first preamble
/// bit going on air.
pub const SENDING_NODE_WAKEUP_ADVANCE: i64 = 500_000;

/// Advance needed by a receiving node between wakeup and a stable listening
/// radio.
pub const RECEIVING_NODE_WAKEUP_ADVANCE: i64 = 450_000;

/// Widest receive window accepted while waiting for the first beacon after
/// losing synchronization.
pub const MAX_ADMITTABLE_RESYNC_WINDOW: i64 = 5_000_000;

/// Delay between a flooded packet's arrival and its rebroadcast.
pub const REBROADCAST_INTERVAL: i64 = 1_000_000;

/// Gap between consecutive packets of one uplink transmission.
pub const TRANSMISSION_INTERVAL: i64 = 1_000_000;

/// Worst-case arrival plus processing time of one full-size packet.
pub const PACKET_ARRIVAL_AND_PROCESSING_TIME: i64 = 5_000_000;

/// On-air time of a frame of `bytes` payload bytes, preamble included.
pub const fn packet_on_air_time(bytes: usize) -> i64 {
    PACKET_PREAMBLE_TIME + (bytes as i64) * BYTE_ON_AIR_TIME
}

/// Role of one tile in the control superframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TileKind {
    /// Timesync or schedule distribution, master to mesh.
    Downlink,
    /// Topology and stream-management collection, mesh to master.
    Uplink,
    /// Data slots only.
    Data,
}

/// The periodic sequence of tile roles, fixed at network design time.
///
/// Tile 0 of every superframe is the timesync downlink; remaining downlink
/// tiles carry schedule distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSuperframeStructure {
    tiles: Vec<TileKind>,
}

impl ControlSuperframeStructure {
    /// Panics if the structure has no leading downlink tile or no uplink
    /// tile; such a network cannot synchronize or collect topology.
    pub fn new(tiles: Vec<TileKind>) -> Self {
        assert!(
            tiles.first() == Some(&TileKind::Downlink),
            "superframe must start with a downlink tile"
        );
        assert!(
            tiles.iter().any(|t| *t == TileKind::Uplink),
            "superframe must contain an uplink tile"
        );
        ControlSuperframeStructure { tiles }
    }

    /// The classic two-tile structure: one downlink, one uplink.
    pub fn default_structure() -> Self {
        Self::new(vec![TileKind::Downlink, TileKind::Uplink])
    }

    pub fn size(&self) -> usize {
        self.tiles.len()
    }

    /// Role of tile `index` counted from the start of the superframe.
    pub fn tile(&self, index: usize) -> TileKind {
        self.tiles[index % self.tiles.len()]
    }

    pub fn is_control_downlink(&self, index: usize) -> bool {
        self.tile(index) == TileKind::Downlink
    }

    pub fn is_control_uplink(&self, index: usize) -> bool {
        self.tile(index) == TileKind::Uplink
    }

    pub fn downlinks_per_superframe(&self) -> usize {
        self.tiles
            .iter()
            .filter(|t| **t == TileKind::Downlink)
            .count()
    }

    pub fn uplinks_per_superframe(&self) -> usize {
        self.tiles.iter().filter(|t| **t == TileKind::Uplink).count()
    }
}

/// Read-only configuration consumed by the whole engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfiguration {
    pub pan_id: u16,
    pub max_nodes: u8,
    pub max_hops: u8,
    /// Duration of one tile.
    pub tile_duration: i64,
    /// Data slots per tile; also fixes the data slot duration.
    pub slots_per_tile: u16,
    pub control_superframe: ControlSuperframeStructure,
    /// Interval between sync beacons; a multiple of the superframe
    /// duration. Downlink tiles falling on a sync boundary carry the
    /// beacon, the others carry schedule distribution.
    pub clock_sync_period: i64,
    /// Consecutive missed beacons before a node declares itself
    /// desynchronized.
    pub max_missed_timesyncs: u8,
    /// Consecutive missed uplink rounds before a neighbor is purged.
    pub max_rounds_unavailable_becomes_dead: u8,
    /// Weakest RSSI at which a node is still accepted as neighbor.
    pub min_neighbor_rssi: i8,
    /// Cap on forwarded topology records per uplink message.
    pub max_forwarded_topologies: u8,
    /// Packets a node may send in its uplink tile.
    pub num_uplink_packets: u8,
    /// Execution budget of stream wakeup callbacks.
    pub callbacks_execution_time: i64,
    /// Widest receiver window the clock synchronizer may request.
    pub max_admitted_rcv_window: i64,
    /// Margin between the end of schedule application and the first data
    /// slot of the activation tile.
    pub downlink_to_data_slack: i64,
    pub is_dynamic_network_id: bool,
    pub static_network_id: u8,
    pub authenticate_data: bool,
    pub encrypt_data: bool,
    pub radio_frequency_khz: u32,
    pub radio_tx_power_dbm: i8,
}

impl NetworkConfiguration {
    pub fn data_slot_duration(&self) -> i64 {
        self.tile_duration / self.slots_per_tile as i64
    }

    pub fn superframe_duration(&self) -> i64 {
        self.tile_duration * self.control_superframe.size() as i64
    }

    /// Portion of a downlink tile taken by the control phase (flooding over
    /// `max_hops` plus the frame itself), rounded up to whole data slots.
    pub fn downlink_phase_slots(&self) -> u16 {
        let duration = self.max_hops as i64 * REBROADCAST_INTERVAL
            + packet_on_air_time(MAX_PKT_SIZE)
            + RECEIVING_NODE_WAKEUP_ADVANCE
            + self.max_admitted_rcv_window;
        self.duration_to_slots(duration)
    }

    /// Portion of an uplink tile taken by the control phase.
    pub fn uplink_phase_slots(&self) -> u16 {
        let duration = self.num_uplink_packets as i64
            * (PACKET_ARRIVAL_AND_PROCESSING_TIME + TRANSMISSION_INTERVAL);
        self.duration_to_slots(duration)
    }

    pub fn downlink_phase_duration(&self) -> i64 {
        self.downlink_phase_slots() as i64 * self.data_slot_duration()
    }

    pub fn uplink_phase_duration(&self) -> i64 {
        self.uplink_phase_slots() as i64 * self.data_slot_duration()
    }

    fn duration_to_slots(&self, duration: i64) -> u16 {
        let slot = self.data_slot_duration();
        let slots = (duration + slot - 1) / slot;
        (slots as u16).min(self.slots_per_tile)
    }

    pub fn radio_configuration(&self) -> crate::radio::RadioConfiguration {
        crate::radio::RadioConfiguration {
            frequency_khz: self.radio_frequency_khz,
            tx_power_dbm: self.radio_tx_power_dbm,
            crc: true,
            strict_timeout: false,
        }
    }
}

impl Default for NetworkConfiguration {
    fn default() -> Self {
        NetworkConfiguration {
            pan_id: 0xCAFE,
            max_nodes: 16,
            max_hops: 6,
            tile_duration: 100_000_000,
            slots_per_tile: 20,
            control_superframe: ControlSuperframeStructure::default_structure(),
            clock_sync_period: 400_000_000,
            max_missed_timesyncs: 3,
            max_rounds_unavailable_becomes_dead: 3,
            min_neighbor_rssi: -75,
            max_forwarded_topologies: 4,
            num_uplink_packets: 1,
            callbacks_execution_time: 400_000,
            max_admitted_rcv_window: 1_000_000,
            downlink_to_data_slack: 1_000_000,
            is_dynamic_network_id: false,
            static_network_id: 0,
            authenticate_data: false,
            encrypt_data: false,
            radio_frequency_khz: 2_450_000,
            radio_tx_power_dbm: 0,
        }
    }
}
