//! End-to-end checks of the schedule computation worker.

use std::thread;
use std::time::Duration;
use tdmesh::parameters::NetworkConfiguration;
use tdmesh::schedule_computation::ScheduleComputation;
use tdmesh::stream::{
    Direction, Period, Redundancy, SmeKind, StreamId, StreamManagementElement, StreamParameters,
};

fn params(period: Period) -> StreamParameters {
    StreamParameters::new(Redundancy::None, period, 16, Direction::Tx).unwrap()
}

fn wait_for_schedule_id(computation: &ScheduleComputation, id: u32) {
    for _ in 0..500 {
        if computation.schedule_id() >= id {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("schedule {id} never computed");
}

fn listen_sme(node: u8, port: u8, period: Period) -> StreamManagementElement {
    StreamManagementElement::new(
        StreamId::new(node, node, 0, port),
        SmeKind::Listen,
        params(period),
    )
}

fn connect_sme(src: u8, dst: u8, port: u8, period: Period) -> StreamManagementElement {
    StreamManagementElement::new(
        StreamId::new(src, dst, 0, port),
        SmeKind::Connect,
        params(period),
    )
}

#[test]
fn worker_schedules_streams_into_distinct_slots() {
    let computation = ScheduleComputation::new(NetworkConfiguration::default());
    let worker = computation.start_thread();

    computation.with_state(|state| {
        state.topology.add_edge(0, 1);
        state.topology.add_edge(0, 2);
        state.topology.add_edge(0, 3);
    });
    computation.add_smes(vec![
        listen_sme(0, 1, Period::P1),
        connect_sme(1, 0, 1, Period::P1),
        connect_sme(2, 0, 1, Period::P1),
        connect_sme(3, 0, 1, Period::P1),
    ]);

    wait_for_schedule_id(&computation, 1);
    let (schedule, id, tiles) = computation.schedule();
    assert_eq!(id, 1);
    // All periods are one tile; the cycle still covers a whole superframe.
    assert_eq!(tiles, 2);
    assert_eq!(schedule.len(), 3);
    let mut offsets: Vec<u32> = schedule.iter().map(|e| e.offset).collect();
    offsets.sort_unstable();
    offsets.dedup();
    assert_eq!(offsets.len(), 3, "conflicting offsets for a shared receiver");

    computation.stop();
    worker.join().unwrap();
}

#[test]
fn new_stream_does_not_move_established_one() {
    let computation = ScheduleComputation::new(NetworkConfiguration::default());
    let worker = computation.start_thread();

    computation.with_state(|state| {
        state.topology.add_edge(0, 1);
        state.topology.add_edge(0, 2);
    });
    computation.add_smes(vec![
        listen_sme(0, 1, Period::P1),
        connect_sme(1, 0, 1, Period::P1),
    ]);
    wait_for_schedule_id(&computation, 1);
    let (first, first_id, _) = computation.schedule();
    assert_eq!(first.len(), 1);
    let established_offset = first[0].offset;

    computation.add_smes(vec![connect_sme(2, 0, 1, Period::P1)]);
    wait_for_schedule_id(&computation, first_id + 1);
    let (second, second_id, _) = computation.schedule();
    assert_eq!(second_id, first_id + 1);
    assert_eq!(second.len(), 2);
    let kept = second
        .iter()
        .find(|e| e.id == first[0].id)
        .expect("established stream vanished");
    assert_eq!(kept.offset, established_offset);

    computation.stop();
    worker.join().unwrap();
}

#[test]
fn unroutable_stream_is_rejected_with_info() {
    let computation = ScheduleComputation::new(NetworkConfiguration::default());
    let worker = computation.start_thread();

    computation.with_state(|state| {
        state.topology.add_edge(0, 1);
        // Node 5 exists nowhere in the graph.
    });
    computation.add_smes(vec![
        listen_sme(0, 1, Period::P1),
        connect_sme(5, 0, 1, Period::P1),
    ]);

    wait_for_schedule_id(&computation, 1);
    let (schedule, _, _) = computation.schedule();
    assert!(schedule.is_empty());
    // ServerOpened for the listen plus StreamReject for the stream.
    assert!(computation.num_info() >= 2);

    computation.stop();
    worker.join().unwrap();
}

#[test]
fn two_hop_chain_gets_causal_offsets() {
    let computation = ScheduleComputation::new(NetworkConfiguration::default());
    let worker = computation.start_thread();

    computation.with_state(|state| {
        state.topology.add_edge(0, 1);
        state.topology.add_edge(1, 2);
    });
    computation.add_smes(vec![
        listen_sme(0, 1, Period::P2),
        connect_sme(2, 0, 1, Period::P2),
    ]);

    wait_for_schedule_id(&computation, 1);
    let (schedule, _, _) = computation.schedule();
    assert_eq!(schedule.len(), 2);
    assert_eq!((schedule[0].tx, schedule[0].rx), (2, 1));
    assert_eq!((schedule[1].tx, schedule[1].rx), (1, 0));
    assert!(schedule[1].offset > schedule[0].offset);

    computation.stop();
    worker.join().unwrap();
}
