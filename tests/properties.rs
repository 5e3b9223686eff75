//! Property tests for update classification, variable-refresh adjustment
//! and container lifetimes.

use display_txn::classify::{surface_update_flags, SurfaceUpdate, UpdateType};
use display_txn::hw::HeadlessBackend;
use display_txn::model::{
    CrtcTiming, DccParams, LinkId, LinkInfo, PixelFormat, Plane, PlaneId, PlaneProps, Stream,
    StreamConfig, StreamId, SurfaceUpdateFlags, Swizzle, TilingInfo, VrrRange,
};
use display_txn::state::State;
use display_txn::vrr::compute_adjust;
use display_txn::{Config, Device};
use proptest::prelude::*;
use std::sync::{Arc, Weak};

const FORMATS: [PixelFormat; 8] = [
    PixelFormat::Argb8888,
    PixelFormat::Abgr8888,
    PixelFormat::Argb2101010,
    PixelFormat::Abgr2101010,
    PixelFormat::Rgb565,
    PixelFormat::Argb16161616F,
    PixelFormat::Nv12,
    PixelFormat::P010,
];

const SWIZZLES: [Swizzle; 5] = [
    Swizzle::Linear,
    Swizzle::Standard4K,
    Swizzle::Standard64K,
    Swizzle::Display64K,
    Swizzle::Render64KX,
];

fn any_flags() -> impl Strategy<Value = SurfaceUpdateFlags> {
    any::<u32>().prop_map(SurfaceUpdateFlags::from_bits_truncate)
}

proptest! {
    #[test]
    fn tier_of_a_union_is_at_least_the_tier_of_each_part(a in any_flags(), b in any_flags()) {
        let union = UpdateType::of_surface_flags(a | b);
        prop_assert!(union >= UpdateType::of_surface_flags(a));
        prop_assert!(union >= UpdateType::of_surface_flags(b));
    }

    #[test]
    fn only_address_changes_are_fast(flags in any_flags()) {
        let fast = UpdateType::of_surface_flags(flags) == UpdateType::Fast;
        prop_assert_eq!(fast, SurfaceUpdateFlags::ADDR.contains(flags));
    }

    #[test]
    fn layout_changes_are_never_under_classified(
        format in 0..FORMATS.len(),
        swizzle in 0..SWIZZLES.len(),
        dcc in any::<bool>(),
        alpha in any::<u8>(),
        flip in any::<bool>(),
    ) {
        let old = PlaneProps::simple(1920, 1080);
        let mut info = old.info;
        info.format = FORMATS[format];
        info.tiling = TilingInfo { swizzle: SWIZZLES[swizzle], ..info.tiling };
        info.dcc = DccParams { enable: dcc, ..info.dcc };
        info.global_alpha_value = alpha as u16;
        let layout_changed = info.format != old.info.format
            || info.tiling != old.info.tiling
            || info.dcc != old.info.dcc;

        let mut update = SurfaceUpdate::flip(PlaneId(1), 0x4000);
        if !flip {
            update.flip_addr = None;
        }
        update.plane_info = Some(info);
        let tier = UpdateType::of_surface_flags(surface_update_flags(&old, &update));

        if layout_changed {
            prop_assert_eq!(tier, UpdateType::Full);
        } else {
            prop_assert!(tier <= UpdateType::Medium);
        }
    }

    #[test]
    fn adjustments_stay_within_the_vertical_total_bounds(
        min_hz in 30u32..=72,
        span_hz in 0u32..=114,
        interval_us in 1_000u64..=250_000,
    ) {
        let range = VrrRange {
            min_refresh_mhz: min_hz * 1000,
            max_refresh_mhz: (min_hz + span_hz).min(144) * 1000,
        };
        prop_assume!(range.is_valid());
        let config = StreamConfig::new(CrtcTiming::qhd_144(), LinkInfo::hbr3(LinkId(1)))
            .with_vrr(range);
        let bounds = config.vrr_bounds().expect("bounds");
        prop_assert!(bounds.v_total_min <= bounds.v_total_max);

        let adjust = compute_adjust(&config.timing, bounds, range, interval_us);

        prop_assert_eq!(adjust.v_total_min, bounds.v_total_min);
        prop_assert_eq!(adjust.v_total_max, bounds.v_total_max);
        if adjust.v_total_mid_frame_num > 0 {
            prop_assert!(bounds.contains(adjust.v_total_mid));
        }
    }
}

// --- Container lifetimes ---

const S1: StreamId = StreamId(1);
const S2: StreamId = StreamId(2);

#[derive(Debug, Clone, Copy)]
enum Op {
    Flip(u64),
    Alpha(u8),
    ToggleFormat,
    ToggleOverlay,
}

fn any_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<u64>().prop_map(Op::Flip),
        any::<u8>().prop_map(Op::Alpha),
        Just(Op::ToggleFormat),
        Just(Op::ToggleOverlay),
    ]
}

fn plane(id: u32, width: u32, height: u32) -> Arc<Plane> {
    Arc::new(Plane::new(PlaneId(id), PlaneProps::simple(width, height), 0x1000_0000))
}

fn device() -> Device {
    let backend = Arc::new(HeadlessBackend::new());
    let device = Device::power_on(Config::default(), backend, None).expect("power on");
    let mut txn = device.begin_transaction().expect("begin");
    for id in [S1, S2] {
        let config = StreamConfig::new(CrtcTiming::fhd_60(), LinkInfo::hbr3(LinkId(id.0)));
        txn.add_stream(Arc::new(Stream::new(id, config))).expect("stream");
    }
    txn.add_plane(S1, plane(10, 1920, 1080)).expect("plane");
    txn.add_plane(S2, plane(20, 1920, 1080)).expect("plane");
    device.commit_transaction(txn).expect("commit");
    device
}

/// Applies `op` and returns whether it replaced the LIVE container.
fn apply(device: &Device, op: Op) -> bool {
    let current = device.current_state().expect("current");
    let props = *current.plane(S2, PlaneId(20)).expect("plane").props();
    let overlay_bound = current.plane(S1, PlaneId(21)).is_some();
    drop(current);

    let mut info = props.info;
    let report = match op {
        Op::Flip(address) => device
            .propose_update(S1, &[SurfaceUpdate::flip(PlaneId(10), address)], None)
            .expect("flip"),
        Op::Alpha(alpha) => {
            info.global_alpha_value = alpha as u16;
            let update = SurfaceUpdate {
                plane_info: Some(info),
                ..SurfaceUpdate::new(PlaneId(20))
            };
            device.propose_update(S2, &[update], None).expect("alpha")
        }
        Op::ToggleFormat => {
            info.format = match info.format {
                PixelFormat::Argb8888 => PixelFormat::Abgr8888,
                _ => PixelFormat::Argb8888,
            };
            let update = SurfaceUpdate {
                plane_info: Some(info),
                ..SurfaceUpdate::new(PlaneId(20))
            };
            device.propose_update(S2, &[update], None).expect("format")
        }
        Op::ToggleOverlay => {
            let mut txn = device.begin_transaction().expect("begin");
            if overlay_bound {
                txn.remove_plane(S1, PlaneId(21)).expect("remove overlay");
            } else {
                txn.add_plane(S1, plane(21, 640, 480)).expect("add overlay");
            }
            device.commit_transaction(txn).expect("overlay")
        }
    };
    report.state_replaced
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn replaced_containers_and_their_planes_are_released(
        ops in proptest::collection::vec(any_op(), 1..24),
    ) {
        let device = device();
        for op in ops {
            let before = device.current_state().expect("current");
            let old_state: Weak<State> = Arc::downgrade(&before);
            let old_side_plane: Weak<Plane> =
                Arc::downgrade(before.plane(S2, PlaneId(20)).expect("plane"));
            let old_overlay: Option<Weak<Plane>> =
                before.plane(S1, PlaneId(21)).map(Arc::downgrade);
            let before_id = before.id();
            drop(before);

            let replaced = apply(&device, op);
            let after = device.current_state().expect("current");

            if replaced {
                prop_assert!(after.id() > before_id);
                prop_assert!(old_state.upgrade().is_none(), "{:?} leaked state {}", op, before_id);
                let side_plane_kept = match (after.plane(S2, PlaneId(20)), old_side_plane.upgrade()) {
                    (Some(live), Some(old)) => Arc::ptr_eq(live, &old),
                    _ => false,
                };
                if !side_plane_kept {
                    prop_assert!(old_side_plane.upgrade().is_none(), "{:?} leaked plane 20", op);
                }
                if let Some(overlay) = old_overlay {
                    if after.plane(S1, PlaneId(21)).is_none() {
                        prop_assert!(overlay.upgrade().is_none(), "removed overlay still referenced");
                    }
                }
            } else {
                prop_assert_eq!(after.id(), before_id);
                prop_assert!(old_state.upgrade().is_some());
            }
        }
    }
}
