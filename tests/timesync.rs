//! Timesync behavior: resync hooking, counter increments, desync threshold.

mod common;

use common::{FakeClock, FakeRadio};
use std::sync::Arc;
use tdmesh::frame::TimesyncFrame;
use tdmesh::mac::MacContext;
use tdmesh::parameters::NetworkConfiguration;
use tdmesh::time::LocalTime;
use tdmesh::timesync::{DynamicTimesync, MasterTimesync, TimesyncEvent, TimesyncStatus};

fn context(node: u8) -> (MacContext, Arc<std::sync::Mutex<common::FakeRadioState>>) {
    let config = NetworkConfiguration::default();
    let clock = FakeClock::new(0);
    let (radio, state) = FakeRadio::new();
    (MacContext::new(config, clock, Box::new(radio), node), state)
}

#[test]
fn master_increments_counter_every_beacon() {
    let config = NetworkConfiguration::default();
    let (mut ctx, radio) = context(0);
    let t0 = 1_000_000_000i64;
    let mut ts = MasterTimesync::new(
        config.pan_id,
        LocalTime::new(t0 - config.clock_sync_period),
    );

    ts.execute(&mut ctx);
    ts.execute(&mut ctx);

    let sent = &radio.lock().unwrap().sent;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].when, t0);
    assert_eq!(sent[1].when, t0 + config.clock_sync_period);
    let first = TimesyncFrame::from_bytes(sent[0].bytes.clone().try_into().unwrap());
    let second = TimesyncFrame::from_bytes(sent[1].bytes.clone().try_into().unwrap());
    assert_eq!(first.counter(), 0);
    assert_eq!(second.counter(), 1);
    assert_eq!(first.hop(), 0);
}

/// After hooking to a beacon, the node's network time equals
/// `counter * clockSyncPeriod` at the beacon arrival: both clock domains
/// agree within the flood-delay compensation.
#[test]
fn resync_hooks_network_time_to_counter() {
    let config = NetworkConfiguration::default();
    let (mut ctx, radio) = context(3);
    let mut ts = DynamicTimesync::new(
        config.max_admitted_rcv_window,
        config.clock_sync_period,
        config.max_missed_timesyncs,
    );
    assert_eq!(ts.status(), TimesyncStatus::Desynchronized);

    let mut beacon = TimesyncFrame::new(config.pan_id);
    beacon.set_counter(5);
    let arrival = 123_456_789i64;
    radio
        .lock()
        .unwrap()
        .incoming
        .push_back((beacon.as_bytes().to_vec(), arrival));

    let event = ts.execute(&mut ctx);
    assert_eq!(event, TimesyncEvent::Resynced);
    assert_eq!(ts.status(), TimesyncStatus::InSync);
    // Received hop 0 directly from the master, so we are hop 1.
    assert_eq!(ctx.hop(), 1);
    assert_eq!(
        ctx.time_base()
            .to_network(LocalTime::new(arrival))
            .get(),
        5 * config.clock_sync_period
    );
    // The beacon was rebroadcast with the hop bumped.
    let sent = &radio.lock().unwrap().sent;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].bytes[2], 1);
}

#[test]
fn beacons_of_another_pan_do_not_hook() {
    let config = NetworkConfiguration::default();
    let (mut ctx, radio) = context(3);
    let mut ts = DynamicTimesync::new(
        config.max_admitted_rcv_window,
        config.clock_sync_period,
        config.max_missed_timesyncs,
    );

    let foreign = TimesyncFrame::new(0xBEEF);
    let mut ours = TimesyncFrame::new(config.pan_id);
    ours.set_counter(2);
    {
        let mut state = radio.lock().unwrap();
        state
            .incoming
            .push_back((foreign.as_bytes().to_vec(), 1_000));
        state.incoming.push_back((ours.as_bytes().to_vec(), 2_000));
    }
    assert_eq!(ts.execute(&mut ctx), TimesyncEvent::Resynced);
    // The foreign beacon was skipped; the hook is on the second frame.
    assert_eq!(
        ctx.time_base().to_network(LocalTime::new(2_000)).get(),
        2 * config.clock_sync_period
    );
}

#[test]
fn consecutive_misses_cause_desync() {
    let config = NetworkConfiguration::default();
    let (mut ctx, radio) = context(3);
    let mut ts = DynamicTimesync::new(
        config.max_admitted_rcv_window,
        config.clock_sync_period,
        config.max_missed_timesyncs,
    );

    let beacon = TimesyncFrame::new(config.pan_id);
    radio
        .lock()
        .unwrap()
        .incoming
        .push_back((beacon.as_bytes().to_vec(), 50_000_000));
    assert_eq!(ts.execute(&mut ctx), TimesyncEvent::Resynced);

    // The radio stays silent from now on.
    let mut last = TimesyncEvent::None;
    for _ in 0..config.max_missed_timesyncs {
        last = ts.execute(&mut ctx);
    }
    assert_eq!(last, TimesyncEvent::Desynchronized);
    assert_eq!(ts.status(), TimesyncStatus::Desynchronized);
}
