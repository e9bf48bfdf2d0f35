//! Stream identifiers, parameters and management elements.
//!
//! A stream is a periodic unidirectional (or bidirectional) data flow
//! between two nodes, identified by `(src, dst, srcPort, dstPort)`. Stream
//! management elements (SMEs) are the compact records that travel in uplink
//! to request, advertise and close streams.

use crate::packet::{Packet, PacketError};
use modular_bitfield::prelude::*;
use thiserror::Error;

/// Transmission period, in tiles.
///
/// Only these values can be encoded in the 4-bit wire field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Period {
    P1 = 1,
    P2 = 2,
    P5 = 3,
    P10 = 4,
    P20 = 5,
    P50 = 6,
    P100 = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("period code out of range")]
pub struct PeriodOutOfRange;

impl TryFrom<u8> for Period {
    type Error = PeriodOutOfRange;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Period::*;
        Ok(match value {
            1 => P1,
            2 => P2,
            3 => P5,
            4 => P10,
            5 => P20,
            6 => P50,
            7 => P100,
            _ => return Err(PeriodOutOfRange),
        })
    }
}

impl From<Period> for u8 {
    fn from(v: Period) -> Self {
        v as u8
    }
}

impl Period {
    /// The period as a tile count.
    pub fn tiles(self) -> u32 {
        use Period::*;
        match self {
            P1 => 1,
            P2 => 2,
            P5 => 5,
            P10 => 10,
            P20 => 20,
            P50 => 50,
            P100 => 100,
        }
    }
}

/// How many times each payload is transmitted, and whether the copies
/// should take distinct paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Redundancy {
    #[default]
    None = 0,
    Double = 1,
    DoubleSpatial = 2,
    Triple = 3,
    TripleSpatial = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("redundancy code out of range")]
pub struct RedundancyOutOfRange;

impl TryFrom<u8> for Redundancy {
    type Error = RedundancyOutOfRange;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Redundancy::*;
        Ok(match value {
            0 => None,
            1 => Double,
            2 => DoubleSpatial,
            3 => Triple,
            4 => TripleSpatial,
            _ => return Err(RedundancyOutOfRange),
        })
    }
}

impl From<Redundancy> for u8 {
    fn from(v: Redundancy) -> Self {
        v as u8
    }
}

impl Redundancy {
    /// Transmissions per period.
    pub fn count(self) -> u8 {
        use Redundancy::*;
        match self {
            None => 1,
            Double | DoubleSpatial => 2,
            Triple | TripleSpatial => 3,
        }
    }

    pub fn is_spatial(self) -> bool {
        matches!(self, Redundancy::DoubleSpatial | Redundancy::TripleSpatial)
    }
}

/// Who transmits application data on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx = 0,
    Rx = 1,
    TxRx = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("direction code out of range")]
pub struct DirectionOutOfRange;

impl TryFrom<u8> for Direction {
    type Error = DirectionOutOfRange;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Direction::*;
        Ok(match value {
            0 => Tx,
            1 => Rx,
            2 => TxRx,
            _ => return Err(DirectionOutOfRange),
        })
    }
}

impl From<Direction> for u8 {
    fn from(v: Direction) -> Self {
        v as u8
    }
}

/// Stream parameters, 16 bits on the wire.
///
/// ```norust
/// redundancy:3 | period:4 | payloadSize:7 | direction:2
/// ```
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParametersPkt {
    pub redundancy: B3,
    pub period: B4,
    pub payload_size: B7,
    pub direction: B2,
}

/// Validated stream parameters as used everywhere in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParameters {
    pub redundancy: Redundancy,
    pub period: Period,
    pub payload_size: u8,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamParameterError {
    #[error(transparent)]
    Period(#[from] PeriodOutOfRange),
    #[error(transparent)]
    Redundancy(#[from] RedundancyOutOfRange),
    #[error(transparent)]
    Direction(#[from] DirectionOutOfRange),
    #[error("payload size {0} exceeds 127")]
    PayloadTooBig(u16),
}

impl StreamParameters {
    pub fn new(
        redundancy: Redundancy,
        period: Period,
        payload_size: u8,
        direction: Direction,
    ) -> Result<Self, StreamParameterError> {
        if payload_size > 127 {
            return Err(StreamParameterError::PayloadTooBig(payload_size as u16));
        }
        Ok(StreamParameters {
            redundancy,
            period,
            payload_size,
            direction,
        })
    }

    pub fn to_pkt(self) -> StreamParametersPkt {
        StreamParametersPkt::new()
            .with_redundancy(self.redundancy.into())
            .with_period(self.period.into())
            .with_payload_size(self.payload_size)
            .with_direction(self.direction.into())
    }

    pub fn from_pkt(pkt: StreamParametersPkt) -> Result<Self, StreamParameterError> {
        Ok(StreamParameters {
            redundancy: pkt.redundancy().try_into()?,
            period: pkt.period().try_into()?,
            payload_size: pkt.payload_size(),
            direction: pkt.direction().try_into()?,
        })
    }
}

/// Stream identifier: `(src, dst, srcPort, dstPort)`, 3 bytes on the wire.
///
/// ```norust
/// src:8 | dst:8 | srcPort:4 | dstPort:4
/// ```
///
/// A *server* identifier is `(dst, dst, 0, dstPort)`: it is what `listen`
/// registers and what connect requests are matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    pub src: u8,
    pub dst: u8,
    pub src_port: u8,
    pub dst_port: u8,
}

impl StreamId {
    pub const SIZE: usize = 3;

    pub fn new(src: u8, dst: u8, src_port: u8, dst_port: u8) -> Self {
        debug_assert!(src_port < 16 && dst_port < 16);
        StreamId {
            src,
            dst,
            src_port,
            dst_port,
        }
    }

    /// A key unique per stream, usable for compact logging.
    pub fn key(self) -> u32 {
        self.src as u32
            | (self.dst as u32) << 8
            | (self.src_port as u32) << 16
            | (self.dst_port as u32) << 20
    }

    /// The identifier of the server this stream connects to.
    pub fn server_id(self) -> StreamId {
        StreamId::new(self.dst, self.dst, 0, self.dst_port)
    }

    pub fn is_server(self) -> bool {
        self.src == self.dst && self.src_port == 0
    }

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        [self.src, self.dst, self.src_port | (self.dst_port << 4)]
    }

    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        StreamId {
            src: bytes[0],
            dst: bytes[1],
            src_port: bytes[2] & 0x0F,
            dst_port: bytes[2] >> 4,
        }
    }
}

/// Stream state as seen by the node that owns the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamStatus {
    #[default]
    Uninitialized,
    /// Connect request sent, waiting for a schedule or a reject.
    Connecting,
    /// Connect request rejected by the master.
    ConnectFailed,
    /// Server-side stream opened after receiving a schedule.
    AcceptWait,
    /// Stream accepted, routed and scheduled.
    Established,
    /// Stream disappeared from the schedule without a local close.
    RemotelyClosed,
    /// A schedule re-listed a stream previously remotely closed.
    Reopened,
    /// Closed by the user, waiting for a schedule without the stream.
    CloseWait,
    /// Listen request sent, waiting for the master's answer.
    ListenWait,
    /// Listen request rejected.
    ListenFailed,
    /// Listen acknowledged, server accepting streams.
    Listen,
}

/// Stream state as tracked by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterStreamStatus {
    /// Received and its server is present; scheduling pending.
    Accepted,
    /// Scheduled in the current schedule.
    Established,
    /// No matching server, or unroutable/unschedulable.
    Rejected,
    /// A listen registration.
    Listen,
}

/// Everything a node keeps about one of its streams.
#[derive(Debug, Clone, Copy)]
pub struct StreamInfo {
    pub id: StreamId,
    pub parameters: StreamParameters,
    pub status: StreamStatus,
}

impl StreamInfo {
    pub fn new(id: StreamId, parameters: StreamParameters, status: StreamStatus) -> Self {
        StreamInfo {
            id,
            parameters,
            status,
        }
    }
}

/// Master-side record of one stream or server.
#[derive(Debug, Clone, Copy)]
pub struct MasterStreamInfo {
    pub id: StreamId,
    pub parameters: StreamParameters,
    pub status: MasterStreamStatus,
}

/// What a stream management element asks of the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmeKind {
    Connect = 0,
    Listen = 1,
    Closed = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("SME kind code out of range")]
pub struct SmeKindOutOfRange;

impl TryFrom<u8> for SmeKind {
    type Error = SmeKindOutOfRange;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use SmeKind::*;
        Ok(match value {
            0 => Connect,
            1 => Listen,
            2 => Closed,
            _ => return Err(SmeKindOutOfRange),
        })
    }
}

/// SME wire form, 6 bytes.
///
/// ```norust
/// StreamId (24) | kind:3 | parameters (16) | pad:5
/// ```
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmePkt {
    pub src: B8,
    pub dst: B8,
    pub src_port: B4,
    pub dst_port: B4,
    pub kind: B3,
    pub redundancy: B3,
    pub period: B4,
    pub payload_size: B7,
    pub direction: B2,
    #[skip]
    __: B5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SmeParseError {
    #[error(transparent)]
    Kind(#[from] SmeKindOutOfRange),
    #[error(transparent)]
    Parameters(#[from] StreamParameterError),
    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// A request or notification about one stream, exchanged in uplink.
///
/// Uniqueness key is the [`StreamId`]: a newer SME for the same stream
/// replaces an older one in the forwarding queues.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamManagementElement {
    pub id: StreamId,
    pub kind: SmeKind,
    pub parameters: StreamParameters,
}

impl StreamManagementElement {
    pub const SIZE: usize = StreamId::SIZE + 3;

    pub fn new(id: StreamId, kind: SmeKind, parameters: StreamParameters) -> Self {
        StreamManagementElement {
            id,
            kind,
            parameters,
        }
    }

    pub fn serialize(&self, pkt: &mut Packet) -> Result<(), PacketError> {
        let wire = SmePkt::new()
            .with_src(self.id.src)
            .with_dst(self.id.dst)
            .with_src_port(self.id.src_port)
            .with_dst_port(self.id.dst_port)
            .with_kind(self.kind as u8)
            .with_redundancy(self.parameters.redundancy.into())
            .with_period(self.parameters.period.into())
            .with_payload_size(self.parameters.payload_size)
            .with_direction(self.parameters.direction.into());
        pkt.put(&wire.into_bytes())
    }

    pub fn deserialize(pkt: &mut Packet) -> Result<Self, SmeParseError> {
        let bytes = pkt.get_array::<6>()?;
        let wire = SmePkt::from_bytes(bytes);
        let parameters = StreamParameters {
            redundancy: wire.redundancy().try_into().map_err(StreamParameterError::from)?,
            period: wire.period().try_into().map_err(StreamParameterError::from)?,
            payload_size: wire.payload_size(),
            direction: wire.direction().try_into().map_err(StreamParameterError::from)?,
        };
        Ok(StreamManagementElement {
            id: StreamId::new(wire.src(), wire.dst(), wire.src_port(), wire.dst_port()),
            kind: wire.kind().try_into()?,
            parameters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> StreamParameters {
        StreamParameters::new(Redundancy::Triple, Period::P10, 16, Direction::Tx).unwrap()
    }

    #[test]
    fn stream_id_wire_round_trip() {
        let id = StreamId::new(3, 0, 5, 12);
        assert_eq!(StreamId::from_bytes(id.to_bytes()), id);
        assert_eq!(id.to_bytes(), [3, 0, 5 | (12 << 4)]);
    }

    #[test]
    fn server_id_matches_listen() {
        let id = StreamId::new(7, 2, 1, 9);
        let server = id.server_id();
        assert_eq!(server, StreamId::new(2, 2, 0, 9));
        assert!(server.is_server());
        assert!(!id.is_server());
    }

    #[test]
    fn parameters_pack_into_16_bits() {
        let p = params();
        let pkt = p.to_pkt();
        assert_eq!(pkt.into_bytes().len(), 2);
        assert_eq!(StreamParameters::from_pkt(pkt).unwrap(), p);
    }

    #[test]
    fn parameters_reject_invalid_codes() {
        let pkt = StreamParametersPkt::new()
            .with_redundancy(7)
            .with_period(1)
            .with_payload_size(1)
            .with_direction(0);
        assert!(StreamParameters::from_pkt(pkt).is_err());
    }

    #[test]
    fn sme_serializes_to_exactly_six_bytes() {
        let sme = StreamManagementElement::new(
            StreamId::new(4, 0, 2, 3),
            SmeKind::Connect,
            params(),
        );
        let mut pkt = Packet::new();
        sme.serialize(&mut pkt).unwrap();
        assert_eq!(pkt.size(), StreamManagementElement::SIZE);
        let back = StreamManagementElement::deserialize(&mut pkt).unwrap();
        assert_eq!(back, sme);
    }

    #[test]
    fn period_conversions() {
        for code in 1..=7u8 {
            let p = Period::try_from(code).unwrap();
            assert_eq!(u8::from(p), code);
        }
        assert!(Period::try_from(0).is_err());
        assert!(Period::try_from(8).is_err());
        assert_eq!(Period::P50.tiles(), 50);
    }

    #[test]
    fn redundancy_counts() {
        assert_eq!(Redundancy::None.count(), 1);
        assert_eq!(Redundancy::DoubleSpatial.count(), 2);
        assert_eq!(Redundancy::Triple.count(), 3);
        assert!(Redundancy::TripleSpatial.is_spatial());
        assert!(!Redundancy::Triple.is_spatial());
    }
}
