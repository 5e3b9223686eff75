//! Concurrent update traffic against one device.
//!
//! One thread flips a plane on the first stream as fast as it can while a
//! second thread alternates MEDIUM and FULL updates on the other stream and
//! a third keeps sampling the LIVE container.

use display_txn::classify::SurfaceUpdate;
use display_txn::hw::HeadlessBackend;
use display_txn::model::{
    CrtcTiming, FlipAddress, LinkId, LinkInfo, PixelFormat, Plane, PlaneId, PlaneProps, Stream,
    StreamConfig, StreamId,
};
use display_txn::state::{State, StatePhase};
use display_txn::{Config, Device, UpdateType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Weak};
use std::thread;
use test_log::test;

const DESKTOP: StreamId = StreamId(1);
const SIDE: StreamId = StreamId(2);
const FLIPS: u64 = 300;
const SLOW_UPDATES: u32 = 60;

fn stream(id: StreamId) -> Arc<Stream> {
    let config = StreamConfig::new(CrtcTiming::fhd_60(), LinkInfo::hbr3(LinkId(id.0)));
    Arc::new(Stream::new(id, config))
}

fn plane(id: u32) -> Arc<Plane> {
    Arc::new(Plane::new(
        PlaneId(id),
        PlaneProps::simple(1920, 1080),
        0x1000_0000,
    ))
}

fn two_stream_device() -> (Arc<Device>, Arc<HeadlessBackend>) {
    let backend = Arc::new(HeadlessBackend::new());
    let device =
        Device::power_on(Config::default(), backend.clone(), None).expect("power on");
    let mut txn = device.begin_transaction().expect("begin");
    txn.add_stream(stream(DESKTOP)).expect("desktop");
    txn.add_plane(DESKTOP, plane(10)).expect("desktop plane");
    txn.add_stream(stream(SIDE)).expect("side");
    txn.add_plane(SIDE, plane(20)).expect("side plane");
    device.commit_transaction(txn).expect("commit");
    (Arc::new(device), backend)
}

fn flip_address(frame: u64) -> u64 {
    0x2000_0000 + frame * 0x1_0000
}

#[test]
fn fast_flips_survive_concurrent_full_and_medium_commits() {
    let (device, _backend) = two_stream_device();
    let first: Weak<State> = Arc::downgrade(&device.current_state().expect("current"));
    let start = Arc::new(Barrier::new(3));
    let done = Arc::new(AtomicBool::new(false));

    let flipper = {
        let device = Arc::clone(&device);
        let start = Arc::clone(&start);
        thread::spawn(move || {
            start.wait();
            for frame in 0..FLIPS {
                let report = device
                    .propose_update(
                        DESKTOP,
                        &[SurfaceUpdate::flip(PlaneId(10), flip_address(frame))],
                        None,
                    )
                    .expect("flip");
                assert_eq!(report.tier, UpdateType::Fast);
                assert!(!report.state_replaced);
            }
        })
    };

    let updater = {
        let device = Arc::clone(&device);
        let start = Arc::clone(&start);
        thread::spawn(move || {
            start.wait();
            let mut tiers = Vec::new();
            for round in 0..SLOW_UPDATES {
                let current = device.current_state().expect("current");
                let mut info = current.plane(SIDE, PlaneId(20)).expect("plane").props().info;
                drop(current);
                if round % 2 == 0 {
                    info.global_alpha_value = match info.global_alpha_value {
                        0xff => 0x80,
                        _ => 0xff,
                    };
                } else {
                    info.format = if info.format == PixelFormat::Argb8888 {
                        PixelFormat::Abgr8888
                    } else {
                        PixelFormat::Argb8888
                    };
                }
                let update = SurfaceUpdate {
                    plane_info: Some(info),
                    ..SurfaceUpdate::new(PlaneId(20))
                };
                let report = device.propose_update(SIDE, &[update], None).expect("update");
                assert!(report.state_replaced);
                assert!(report.failed_streams.is_empty());
                tiers.push(report.tier);
            }
            tiers
        })
    };

    let checker = {
        let device = Arc::clone(&device);
        let start = Arc::clone(&start);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            start.wait();
            let mut seen: Vec<Arc<State>> = Vec::new();
            while !done.load(Ordering::Acquire) {
                let (id, phase) = device
                    .with_current(|state| (state.id(), state.phase()))
                    .expect("powered");
                assert_eq!(phase, StatePhase::Live, "LIVE pointer held state {id}");
                if seen.last().map(|s| s.id()) != Some(id) {
                    let state = device.current_state().expect("current");
                    if let Some(last) = seen.last() {
                        assert!(state.id() > last.id(), "LIVE pointer went backwards");
                    }
                    seen.push(state);
                }
                thread::yield_now();
            }
            seen
        })
    };

    flipper.join().expect("flipper panicked");
    let tiers = updater.join().expect("updater panicked");
    done.store(true, Ordering::Release);
    let seen = checker.join().expect("checker panicked");

    assert!(tiers.contains(&UpdateType::Medium));
    assert!(tiers.contains(&UpdateType::Full));

    let current = device.current_state().expect("current");
    assert_eq!(current.phase(), StatePhase::Live);
    let live: Vec<u64> = seen
        .iter()
        .filter(|s| s.phase() == StatePhase::Live)
        .map(|s| s.id())
        .collect();
    assert!(live.len() <= 1, "more than one LIVE state: {live:?}");
    if let Some(&id) = live.first() {
        assert_eq!(id, current.id());
    }

    // The last flip landed in whichever container is LIVE now.
    let flipped = current.plane(DESKTOP, PlaneId(10)).expect("plane").address();
    assert_eq!(flipped.address, flip_address(FLIPS - 1));

    drop(seen);
    assert!(first.upgrade().is_none(), "retired state still referenced");
}

#[test]
fn concurrent_flips_on_separate_streams_all_land() {
    let (device, backend) = two_stream_device();
    backend.take_calls();

    let handles: Vec<_> = [(DESKTOP, 10), (SIDE, 20)]
        .into_iter()
        .map(|(stream, plane)| {
            let device = Arc::clone(&device);
            thread::spawn(move || {
                for frame in 0..FLIPS {
                    let address = FlipAddress {
                        address: flip_address(frame),
                        ..FlipAddress::default()
                    };
                    device
                        .flip_plane_addrs(stream, &[(PlaneId(plane), address)])
                        .expect("flip");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("flip thread panicked");
    }

    let current = device.current_state().expect("current");
    for (stream, plane) in [(DESKTOP, 10), (SIDE, 20)] {
        let address = current.plane(stream, PlaneId(plane)).expect("plane").address();
        assert_eq!(address.address, flip_address(FLIPS - 1));
    }
    assert!(backend.calls().len() as u64 >= 2 * FLIPS);
}
