//! Wire-format checks against fixed byte images.

use tdmesh::frame::{check_short_header, put_short_header, TimesyncFrame};
use tdmesh::packet::Packet;
use tdmesh::schedule::{
    DownlinkElement, InfoElement, InfoKind, ScheduleElement, ScheduleHeader,
};
use tdmesh::stream::{
    Direction, Period, Redundancy, SmeKind, StreamId, StreamManagementElement, StreamParameters,
};

/// Timesync beacon for PAN 0xCAFE, counter 7:
///
/// 46 08 | 00 | CA FE | FF FF | 07 00 00 00
#[test]
fn timesync_beacon_bytes() {
    let mut frame = TimesyncFrame::new(0xCAFE);
    frame.set_counter(7);
    let expected = hex::decode("460800cafeffff07000000").unwrap();
    assert_eq!(frame.as_bytes().as_slice(), expected.as_slice());
}

#[test]
fn timesync_beacon_hop_increments_in_place() {
    let mut frame = TimesyncFrame::new(0x0102);
    frame.increment_hop();
    frame.increment_hop();
    let expected = hex::decode("4608020102ffff00000000").unwrap();
    assert_eq!(frame.as_bytes().as_slice(), expected.as_slice());
    assert!(TimesyncFrame::check(frame.as_bytes(), 0x0102));
}

#[test]
fn short_header_bytes() {
    let mut pkt = Packet::new();
    put_short_header(&mut pkt, 0xCAFE, 3).unwrap();
    assert_eq!(pkt.as_bytes(), hex::decode("460803cafe").unwrap().as_slice());
    assert_eq!(check_short_header(&mut pkt, 0xCAFE).unwrap(), 3);
}

#[test]
fn schedule_packet_round_trips_mixed_elements() {
    let header = ScheduleHeader::new(2, 1, 9, 1000, 10);
    let elements = [
        ScheduleElement {
            id: StreamId::new(2, 0, 0, 1),
            tx: 2,
            rx: 1,
            period: Period::P2,
            offset: 7,
        },
        ScheduleElement {
            id: StreamId::new(2, 0, 0, 1),
            tx: 1,
            rx: 0,
            period: Period::P2,
            offset: 8,
        },
    ];
    let info = InfoElement {
        id: StreamId::new(3, 0, 0, 4),
        kind: InfoKind::StreamReject,
    };

    let mut pkt = Packet::new();
    put_short_header(&mut pkt, 0xCAFE, 0).unwrap();
    header.serialize(&mut pkt).unwrap();
    for e in &elements {
        e.serialize(&mut pkt).unwrap();
    }
    info.serialize(&mut pkt).unwrap();
    // 5 + 15 + 3 * 8
    assert_eq!(pkt.size(), 44);

    check_short_header(&mut pkt, 0xCAFE).unwrap();
    assert_eq!(ScheduleHeader::deserialize(&mut pkt).unwrap(), header);
    match DownlinkElement::deserialize(&mut pkt).unwrap() {
        DownlinkElement::Schedule(e) => assert_eq!(e, elements[0]),
        other => panic!("parsed {other:?}"),
    }
    match DownlinkElement::deserialize(&mut pkt).unwrap() {
        DownlinkElement::Schedule(e) => assert_eq!(e, elements[1]),
        other => panic!("parsed {other:?}"),
    }
    match DownlinkElement::deserialize(&mut pkt).unwrap() {
        DownlinkElement::Info(i) => assert_eq!(i, info),
        other => panic!("parsed {other:?}"),
    }
    assert_eq!(pkt.size(), 0);
}

#[test]
fn sme_is_six_bytes_on_the_wire() {
    let params =
        StreamParameters::new(Redundancy::None, Period::P1, 127, Direction::TxRx).unwrap();
    let sme = StreamManagementElement::new(StreamId::new(9, 0, 3, 15), SmeKind::Listen, params);
    let mut pkt = Packet::new();
    sme.serialize(&mut pkt).unwrap();
    assert_eq!(pkt.size(), 6);
    assert_eq!(StreamManagementElement::deserialize(&mut pkt).unwrap(), sme);
}
