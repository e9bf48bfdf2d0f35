//! Schedule data model and wire formats.
//!
//! The master distributes the *implicit* schedule: one record per scheduled
//! transmission, stream-level. Each node expands its own slice into the
//! *explicit* schedule: one action per data slot. Only the implicit form
//! travels on the air.

use crate::packet::{Packet, PacketError};
use crate::stream::{Period, PeriodOutOfRange, StreamId};
use modular_bitfield::prelude::*;
use thiserror::Error;

/// What a node does in one data slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Sleep to save energy.
    #[default]
    Sleep = 0,
    /// Send a packet of a stream opened from this node.
    SendStream = 1,
    /// Receive a packet of a stream terminating at this node.
    RecvStream = 2,
    /// Re-emit a saved packet of a multi-hop stream.
    SendBuffer = 3,
    /// Receive and save a packet of a multi-hop stream.
    RecvBuffer = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("action code out of range")]
pub struct ActionOutOfRange;

impl TryFrom<u8> for Action {
    type Error = ActionOutOfRange;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Action::*;
        Ok(match value {
            0 => Sleep,
            1 => SendStream,
            2 => RecvStream,
            3 => SendBuffer,
            4 => RecvBuffer,
            _ => return Err(ActionOutOfRange),
        })
    }
}

/// Schedule distribution header, 15 bytes on the wire.
///
/// ```norust
/// totalPacket:16 | currentPacket:16 | scheduleID:32 | activationTile:32 |
/// scheduleTiles:16 | repetition:2 | pad:6
/// ```
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleHeaderPkt {
    pub total_packet: B16,
    pub current_packet: B16,
    pub schedule_id: B32,
    pub activation_tile: B32,
    pub schedule_tiles: B16,
    pub repetition: B2,
    #[skip]
    __: B6,
}

/// Header carried by every schedule distribution packet.
///
/// `schedule_id` 0 is the sentinel "no schedule yet"; such headers are only
/// used for packets carrying info elements alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScheduleHeader {
    pub total_packet: u16,
    pub current_packet: u16,
    pub schedule_id: u32,
    pub activation_tile: u32,
    pub schedule_tiles: u16,
    pub repetition: u8,
}

impl ScheduleHeader {
    pub const SIZE: usize = 15;

    pub fn new(
        total_packet: u16,
        current_packet: u16,
        schedule_id: u32,
        activation_tile: u32,
        schedule_tiles: u16,
    ) -> Self {
        ScheduleHeader {
            total_packet,
            current_packet,
            schedule_id,
            activation_tile,
            schedule_tiles,
            repetition: 1,
        }
    }

    /// Header of an info-only packet.
    pub fn info_only(schedule_id: u32) -> Self {
        ScheduleHeader {
            schedule_id,
            repetition: 1,
            ..Default::default()
        }
    }

    pub fn increment_packet_counter(&mut self) {
        self.current_packet += 1;
    }

    pub fn reset_packet_counter(&mut self) {
        self.current_packet = 0;
    }

    /// Repetition cycles 1 -> 2 -> 3 -> 1; the 2-bit field cannot hold 4.
    pub fn increment_repetition(&mut self) {
        if self.repetition == 3 {
            self.repetition = 1;
        } else {
            self.repetition += 1;
        }
    }

    pub fn serialize(&self, pkt: &mut Packet) -> Result<(), PacketError> {
        let wire = ScheduleHeaderPkt::new()
            .with_total_packet(self.total_packet)
            .with_current_packet(self.current_packet)
            .with_schedule_id(self.schedule_id)
            .with_activation_tile(self.activation_tile)
            .with_schedule_tiles(self.schedule_tiles)
            .with_repetition(self.repetition);
        pkt.put(&wire.into_bytes())
    }

    pub fn deserialize(pkt: &mut Packet) -> Result<Self, PacketError> {
        let wire = ScheduleHeaderPkt::from_bytes(pkt.get_array::<15>()?);
        Ok(ScheduleHeader {
            total_packet: wire.total_packet(),
            current_packet: wire.current_packet(),
            schedule_id: wire.schedule_id(),
            activation_tile: wire.activation_tile(),
            schedule_tiles: wire.schedule_tiles(),
            repetition: wire.repetition(),
        })
    }
}

/// Implicit schedule element, 8 bytes on the wire.
///
/// ```norust
/// src:8 | dst:8 | srcPort:4 | dstPort:4 | tx:8 | rx:8 | period:4 | offset:20
/// ```
///
/// `tx`/`rx` differ from `src`/`dst` on the intermediate hops of a
/// multi-hop stream. `offset` is a slot index within the schedule.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleElementPkt {
    pub src: B8,
    pub dst: B8,
    pub src_port: B4,
    pub dst_port: B4,
    pub tx: B8,
    pub rx: B8,
    pub period: B4,
    pub offset: B20,
}

/// Marker value of `tx`/`rx` distinguishing info elements from schedule
/// elements inside a downlink packet.
const INFO_MARKER: u8 = 0xFF;

/// One scheduled transmission of the implicit schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleElement {
    pub id: StreamId,
    pub tx: u8,
    pub rx: u8,
    pub period: Period,
    pub offset: u32,
}

impl ScheduleElement {
    pub const SIZE: usize = 8;

    /// Single-hop element of a stream: tx = src, rx = dst.
    pub fn single_hop(id: StreamId, period: Period) -> Self {
        ScheduleElement {
            id,
            tx: id.src,
            rx: id.dst,
            period,
            offset: 0,
        }
    }

    pub fn serialize(&self, pkt: &mut Packet) -> Result<(), PacketError> {
        let wire = ScheduleElementPkt::new()
            .with_src(self.id.src)
            .with_dst(self.id.dst)
            .with_src_port(self.id.src_port)
            .with_dst_port(self.id.dst_port)
            .with_tx(self.tx)
            .with_rx(self.rx)
            .with_period(self.period.into())
            .with_offset(self.offset);
        pkt.put(&wire.into_bytes())
    }
}

/// Out-of-schedule notification about one stream, filling spare capacity of
/// schedule distribution packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoKind {
    /// The master could not route or schedule the stream.
    StreamReject = 1,
    /// A listen registration was accepted.
    ServerOpened = 2,
    /// A listen registration was rejected or removed.
    ServerClosed = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoElement {
    pub id: StreamId,
    pub kind: InfoKind,
}

impl InfoElement {
    /// Info elements reuse the schedule element wire size; `tx == rx ==
    /// 0xFF` marks them, the period field carries the kind.
    pub fn serialize(&self, pkt: &mut Packet) -> Result<(), PacketError> {
        let wire = ScheduleElementPkt::new()
            .with_src(self.id.src)
            .with_dst(self.id.dst)
            .with_src_port(self.id.src_port)
            .with_dst_port(self.id.dst_port)
            .with_tx(INFO_MARKER)
            .with_rx(INFO_MARKER)
            .with_period(self.kind as u8)
            .with_offset(0);
        pkt.put(&wire.into_bytes())
    }
}

/// Either kind of 8-byte record carried after the header of a schedule
/// distribution packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkElement {
    Schedule(ScheduleElement),
    Info(InfoElement),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleParseError {
    #[error(transparent)]
    Period(#[from] PeriodOutOfRange),
    #[error("unknown info element kind {0}")]
    InfoKind(u8),
    #[error(transparent)]
    Packet(#[from] PacketError),
}

impl DownlinkElement {
    pub fn deserialize(pkt: &mut Packet) -> Result<Self, ScheduleParseError> {
        let wire = ScheduleElementPkt::from_bytes(pkt.get_array::<8>()?);
        let id = StreamId::new(wire.src(), wire.dst(), wire.src_port(), wire.dst_port());
        if wire.tx() == INFO_MARKER && wire.rx() == INFO_MARKER {
            let kind = match wire.period() {
                1 => InfoKind::StreamReject,
                2 => InfoKind::ServerOpened,
                3 => InfoKind::ServerClosed,
                other => return Err(ScheduleParseError::InfoKind(other)),
            };
            Ok(DownlinkElement::Info(InfoElement { id, kind }))
        } else {
            Ok(DownlinkElement::Schedule(ScheduleElement {
                id,
                tx: wire.tx(),
                rx: wire.rx(),
                period: Period::try_from(wire.period())?,
                offset: wire.offset(),
            }))
        }
    }
}

/// One slot of the expanded per-node schedule.
///
/// `buffer` indexes the forwarder buffer table of the data phase for
/// SendBuffer/RecvBuffer pairs; stream actions do not use it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExplicitScheduleElement {
    pub action: Action,
    pub id: StreamId,
    pub buffer: Option<u16>,
}

impl ExplicitScheduleElement {
    pub fn sleep() -> Self {
        Self::default()
    }

    /// Compact form: `action:3 | port:4`, the port being the destination
    /// port of the stream the slot serves.
    pub fn packed(&self) -> u8 {
        (self.action as u8) | (self.id.dst_port << 3)
    }
}
