// In src/main.rs

//! Demo: boots a headless device, lights two outputs and walks them through
//! every update tier, variable-refresh interrupts and power-off.

use display_txn::classify::{StreamUpdate, SurfaceUpdate};
use display_txn::config::CONFIG;
use display_txn::device::{Device, IrqClock};
use display_txn::firmware::{
    AuxRequest, FirmwareChannel, LoopbackCoprocessor, Notification, NotificationKind,
};
use display_txn::hw::HeadlessBackend;
use display_txn::model::{
    ColorSpace, CrtcTiming, LinkId, LinkInfo, Plane, PlaneId, PlaneProps, StreamConfig, StreamId,
    VrrRange,
};

use anyhow::Context;
use log::{info, warn};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const DESKTOP: StreamId = StreamId(1);
const GAMING: StreamId = StreamId(2);
const FRAME_US: u64 = 41_667;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    info!("Starting display-txn demo...");
    let config = CONFIG.clone();

    // --- Bring-up ---
    let backend = Arc::new(HeadlessBackend::new());
    let firmware = FirmwareChannel::new(LoopbackCoprocessor::new(), &config.workers)
        .context("Failed to start firmware channel")?;
    firmware.register_handler(NotificationKind::HotPlug, true, |n| {
        info!("Demo: hot-plug on {}", n.link);
    });
    let device = Arc::new(
        Device::power_on(config, backend.clone(), Some(firmware))
            .context("Failed to power on device")?,
    );

    // --- Topology ---
    let (desktop, _) = device.create_stream(
        DESKTOP,
        StreamConfig::new(CrtcTiming::fhd_60(), LinkInfo::hbr3(LinkId(1))),
    )?;
    let (gaming, depth) = device.create_stream(
        GAMING,
        StreamConfig::new(CrtcTiming::qhd_144(), LinkInfo::hbr3(LinkId(2))).with_vrr(VrrRange {
            min_refresh_mhz: 48_000,
            max_refresh_mhz: 144_000,
        }),
    )?;
    info!("Demo: {} runs at {:?}", GAMING, depth);

    let mut txn = device.begin_transaction()?;
    txn.add_stream(desktop)?;
    txn.add_plane(DESKTOP, demo_plane(10, 1920, 1080))?;
    txn.add_plane(DESKTOP, demo_plane(11, 640, 480))?;
    txn.add_stream(gaming)?;
    txn.add_plane(GAMING, demo_plane(20, 2560, 1440))?;
    let report = device.commit_transaction(txn)?;
    info!("Demo: topology committed: {:?}", report);

    // --- Update tiers ---
    let report =
        device.propose_update(DESKTOP, &[SurfaceUpdate::flip(PlaneId(10), 0x2000_0000)], None)?;
    info!("Demo: flip -> {:?}, new state: {}", report.tier, report.state_replaced);

    let mut overlay = SurfaceUpdate::new(PlaneId(11));
    let mut info = demo_plane(11, 640, 480).props().info;
    info.global_alpha_value = 0x80;
    overlay.plane_info = Some(info);
    let report = device.propose_update(DESKTOP, &[overlay], None)?;
    info!("Demo: overlay alpha -> {:?}", report.tier);

    let hdr = StreamUpdate {
        output_color_space: Some(ColorSpace::Bt2020Pq),
        ..StreamUpdate::default()
    };
    let report = device.propose_update(DESKTOP, &[], Some(&hdr))?;
    info!("Demo: output color space -> {:?}", report.tier);

    // --- Variable refresh ---
    let flips = device.subscribe_flip_events();
    let clock = IrqClock::spawn(&device, Duration::from_millis(7))?;
    let mut timestamp = 0;
    for frame in 0..12u64 {
        let address = 0x3000_0000 + frame * 0x100_0000;
        device.propose_update(GAMING, &[SurfaceUpdate::flip(PlaneId(20), address)], None)?;
        device.on_pflip(GAMING, timestamp);
        timestamp += FRAME_US;
        thread::sleep(Duration::from_millis(2));
    }
    drop(clock);
    info!("Demo: {} flip completions delivered", flips.try_iter().count());
    if let Some(status) = device.vrr_status(GAMING) {
        info!(
            "Demo: {} fixed rate {:?} mHz, last adjustment {:?}",
            GAMING, status.fixed_rate_mhz, status.last_applied
        );
    }
    let timing = device.query_current_timing(GAMING)?;
    info!("Demo: {} timing {:?}", GAMING, timing.adjust);

    // --- Side channel ---
    let dpcd_rev = device.submit_aux(AuxRequest {
        link: LinkId(1),
        address: 0x0000,
        write: false,
        data: Vec::new(),
        length: 1,
    })?;
    info!("Demo: DPCD revision {:02x?}", dpcd_rev);
    if let Some(firmware) = device.firmware() {
        firmware.inject_notification(Notification {
            kind: NotificationKind::HotPlug,
            link: LinkId(2),
            payload: Vec::new(),
        })?;
        if !firmware.wait_deferred_idle(Duration::from_millis(100)) {
            warn!("Demo: hot-plug handler still running");
        }
    }

    // --- Teardown ---
    device.set_stream_blanked(DESKTOP, true)?;
    device.power_off()?;
    info!("Demo: {} back-end calls recorded", backend.calls().len());
    if device.current_state().is_ok() {
        warn!("Demo: device still reports a LIVE state after power-off");
    }
    info!("display-txn demo finished.");
    Ok(())
}

fn demo_plane(id: u32, width: u32, height: u32) -> Arc<Plane> {
    Arc::new(Plane::new(
        PlaneId(id),
        PlaneProps::simple(width, height),
        0x1000_0000 + id as u64 * 0x100_0000,
    ))
}
