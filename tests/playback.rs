//! Data-phase playback driven by a scripted radio and clock.

mod common;

use common::{FakeClock, FakeRadio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tdmesh::data_phase::DataPhase;
use tdmesh::frame::put_short_header;
use tdmesh::mac::MacContext;
use tdmesh::packet::Packet;
use tdmesh::parameters::NetworkConfiguration;
use tdmesh::schedule::{Action, ScheduleElement, ScheduleHeader};
use tdmesh::schedule_distribution::expand_schedule;
use tdmesh::stream::{
    Direction, Period, Redundancy, StreamId, StreamParameters, StreamStatus,
};
use tdmesh::stream_manager::StreamManager;
use tdmesh::time::LocalTime;

fn params(redundancy: Redundancy) -> StreamParameters {
    StreamParameters::new(redundancy, Period::P1, 16, Direction::Tx).unwrap()
}

/// Open a client stream and drive it to Established with a schedule.
fn establish(mgr: &Arc<StreamManager>, dst: u8, port: u8, redundancy: Redundancy) -> StreamId {
    let mgr2 = mgr.clone();
    let handle = thread::spawn(move || mgr2.connect(dst, port, params(redundancy), 0).unwrap());
    thread::sleep(Duration::from_millis(20));
    let id = StreamId::new(mgr.my_id(), dst, 0, port);
    mgr.apply_schedule(&[ScheduleElement::single_hop(id, Period::P1)]);
    handle.join().unwrap()
}

type RadioHandle = Arc<Mutex<common::FakeRadioState>>;

fn setup(node: u8) -> (MacContext, Arc<StreamManager>, RadioHandle) {
    let config = NetworkConfiguration::default();
    let clock = FakeClock::new(0);
    let (radio, radio_state) = FakeRadio::new();
    let pan_id = config.pan_id;
    let ctx = MacContext::new(config, clock, Box::new(radio), node);
    let mgr = StreamManager::new(node, pan_id);
    (ctx, mgr, radio_state)
}

/// P3: the cursor is `T mod scheduleSlots` after `T` slots, and the data
/// superframe counter advances on each wrap.
#[test]
fn cursor_wraps_modulo_schedule_slots() {
    let config = NetworkConfiguration::default();
    let (mut ctx, mgr, _radio) = setup(4);
    let mut data = DataPhase::new(4, config.slots_per_tile, config.tile_duration, mgr, None);

    // A bystander node: every slot of the 2-tile schedule is Sleep.
    let header = ScheduleHeader::new(1, 0, 1, 0, 2);
    let expanded = expand_schedule(&[], &header, 4, &config);
    data.apply_schedule(expanded, 1, 2, 0, 0);
    assert_eq!(data.schedule_slots(), 40);

    let slot = config.data_slot_duration();
    for t in 0..100u32 {
        data.execute(&mut ctx, LocalTime::new(1_000_000_000 + t as i64 * slot));
    }
    assert_eq!(data.slot_index(), 100 % 40);
    assert_eq!(data.data_superframe_number(), 2);
}

#[test]
fn send_stream_transmits_written_payload() {
    let config = NetworkConfiguration::default();
    let (mut ctx, mgr, radio) = setup(1);
    let id = establish(&mgr, 0, 1, Redundancy::None);
    let mut data = DataPhase::new(
        1,
        config.slots_per_tile,
        config.tile_duration,
        mgr.clone(),
        None,
    );

    let header = ScheduleHeader::new(1, 0, 1, 0, 2);
    let elements = [ScheduleElement {
        id,
        tx: 1,
        rx: 0,
        period: Period::P1,
        offset: 5,
    }];
    let expanded = expand_schedule(&elements, &header, 1, &config);
    assert_eq!(expanded.slots[5].action, Action::SendStream);
    data.apply_schedule(expanded, 1, 2, 0, 0);

    assert_eq!(mgr.write(id, &[0xA5; 8]).unwrap(), 8);

    let base = 1_000_000_000i64;
    let slot = config.data_slot_duration();
    for s in 0..config.slots_per_tile {
        data.execute(&mut ctx, LocalTime::new(base + s as i64 * slot));
    }

    let sent = &radio.lock().unwrap().sent;
    // One send slot per tile, one payload written: exactly one frame.
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].when, base + 5 * slot);
    // Frame: short header, stream id, payload.
    assert_eq!(&sent[0].bytes[5..8], &id.to_bytes());
    assert_eq!(&sent[0].bytes[8..], &[0xA5; 8]);
}

#[test]
fn recv_stream_delivers_payload_to_reader() {
    let config = NetworkConfiguration::default();
    let (mut ctx, mgr, radio) = setup(0);

    // Server side: node 1 connects to us on port 1.
    let id = StreamId::new(1, 0, 0, 1);
    let mgr2 = mgr.clone();
    let listener = thread::spawn(move || mgr2.listen(1, params(Redundancy::None)).unwrap());
    thread::sleep(Duration::from_millis(20));
    mgr.apply_info(tdmesh::schedule::InfoElement {
        id: StreamId::new(0, 0, 0, 1),
        kind: tdmesh::schedule::InfoKind::ServerOpened,
    });
    let server = listener.join().unwrap();
    mgr.apply_schedule(&[ScheduleElement::single_hop(id, Period::P1)]);
    let accepted = mgr.accept(server).unwrap();
    assert_eq!(accepted, id);

    let mut data = DataPhase::new(
        0,
        config.slots_per_tile,
        config.tile_duration,
        mgr.clone(),
        None,
    );
    let header = ScheduleHeader::new(1, 0, 1, 0, 2);
    let elements = [ScheduleElement {
        id,
        tx: 1,
        rx: 0,
        period: Period::P1,
        offset: 5,
    }];
    let expanded = expand_schedule(&elements, &header, 0, &config);
    assert_eq!(expanded.slots[5].action, Action::RecvStream);
    data.apply_schedule(expanded, 1, 2, 0, 0);

    // Script the arriving frame for the receive slot.
    let base = 1_000_000_000i64;
    let slot = config.data_slot_duration();
    let mut frame = Packet::new();
    put_short_header(&mut frame, config.pan_id, 1).unwrap();
    frame.put(&id.to_bytes()).unwrap();
    frame.put(&[0xEE; 6]).unwrap();
    radio
        .lock()
        .unwrap()
        .incoming
        .push_back((frame.as_bytes().to_vec(), base + 5 * slot));

    for s in 0..config.slots_per_tile {
        data.execute(&mut ctx, LocalTime::new(base + s as i64 * slot));
    }

    let mut buf = [0u8; 32];
    assert_eq!(mgr.read(id, &mut buf).unwrap(), 6);
    assert_eq!(&buf[..6], &[0xEE; 6]);
}

/// A frame carrying the wrong stream id counts as a miss and must not be
/// delivered.
#[test]
fn recv_stream_rejects_foreign_stream_id() {
    let config = NetworkConfiguration::default();
    let (mut ctx, mgr, radio) = setup(0);
    let id = StreamId::new(1, 0, 0, 1);
    let mgr2 = mgr.clone();
    let listener = thread::spawn(move || mgr2.listen(1, params(Redundancy::None)).unwrap());
    thread::sleep(Duration::from_millis(20));
    mgr.apply_info(tdmesh::schedule::InfoElement {
        id: StreamId::new(0, 0, 0, 1),
        kind: tdmesh::schedule::InfoKind::ServerOpened,
    });
    let server = listener.join().unwrap();
    mgr.apply_schedule(&[ScheduleElement::single_hop(id, Period::P1)]);
    mgr.accept(server).unwrap();

    let mut data = DataPhase::new(
        0,
        config.slots_per_tile,
        config.tile_duration,
        mgr.clone(),
        None,
    );
    let header = ScheduleHeader::new(1, 0, 1, 0, 2);
    let elements = [ScheduleElement {
        id,
        tx: 1,
        rx: 0,
        period: Period::P1,
        offset: 5,
    }];
    data.apply_schedule(expand_schedule(&elements, &header, 0, &config), 1, 2, 0, 0);

    let base = 1_000_000_000i64;
    let slot = config.data_slot_duration();
    let mut frame = Packet::new();
    put_short_header(&mut frame, config.pan_id, 1).unwrap();
    frame.put(&StreamId::new(2, 0, 0, 1).to_bytes()).unwrap();
    frame.put(&[0xEE; 6]).unwrap();
    radio
        .lock()
        .unwrap()
        .incoming
        .push_back((frame.as_bytes().to_vec(), base + 5 * slot));

    for s in 0..config.slots_per_tile {
        data.execute(&mut ctx, LocalTime::new(base + s as i64 * slot));
    }
    // The redundancy group ended with a miss only; nothing readable.
    let info = mgr.info(id).unwrap();
    assert_eq!(info.status, StreamStatus::Established);
    // The miss still advanced the sequence number for its slot.
    assert_eq!(mgr.sequence_number(id), 1);
}

/// While desynchronized, advance() keeps sequence numbers marching without
/// touching the radio.
#[test]
fn advance_keeps_sequence_numbers_aligned() {
    let config = NetworkConfiguration::default();
    let (mut ctx, mgr, radio) = setup(1);
    let id = establish(&mgr, 0, 1, Redundancy::None);
    let mut data = DataPhase::new(
        1,
        config.slots_per_tile,
        config.tile_duration,
        mgr.clone(),
        None,
    );
    let header = ScheduleHeader::new(1, 0, 1, 0, 2);
    let elements = [ScheduleElement {
        id,
        tx: 1,
        rx: 0,
        period: Period::P1,
        offset: 5,
    }];
    data.apply_schedule(expand_schedule(&elements, &header, 1, &config), 1, 2, 0, 0);

    let base = 1_000_000_000i64;
    let slot = config.data_slot_duration();
    // One full tile of advance: the send slot is accounted, nothing sent.
    for s in 0..config.slots_per_tile {
        data.advance(&mut ctx, LocalTime::new(base + s as i64 * slot));
    }
    assert!(radio.lock().unwrap().sent.is_empty());
    assert_eq!(mgr.sequence_number(id), 1);
    assert_eq!(data.slot_index(), config.slots_per_tile as usize);
}
