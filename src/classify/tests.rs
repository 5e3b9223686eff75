use super::*;
use crate::model::{DccParams, PixelFormat, TilingInfo};
use crate::test_support::{plane, pool, stream};
use std::sync::Arc;
use test_log::test;

fn state_with_two_planes() -> State {
    let pool = pool();
    let mut state = State::new(pool.pipe_count);
    state.add_stream(stream(1), &pool).expect("stream");
    state.add_plane(StreamId(1), plane(10), &pool).expect("plane 10");
    state.add_plane(StreamId(1), plane(11), &pool).expect("plane 11");
    state
}

fn info_update(state: &State, edit: impl FnOnce(&mut PlaneInfo)) -> SurfaceUpdate {
    let current = state.plane(StreamId(1), PlaneId(10)).expect("plane");
    let mut info = current.props().info;
    edit(&mut info);
    SurfaceUpdate {
        plane_info: Some(info),
        ..SurfaceUpdate::new(PlaneId(10))
    }
}

#[test]
fn address_only_update_is_fast_and_leaves_the_plane_untouched() {
    let state = state_with_two_planes();

    let result = classify(
        &state,
        StreamId(1),
        &[SurfaceUpdate::flip(PlaneId(10), 0xdead_0000)],
        None,
    )
    .expect("classify");

    assert_eq!(result.tier, UpdateType::Fast);
    assert_eq!(result.surface_flags(PlaneId(10)), SurfaceUpdateFlags::ADDR);
    let plane = state.plane(StreamId(1), PlaneId(10)).expect("plane");
    assert!(plane.update_flags().is_empty());
    assert_eq!(plane.address().address, 0x1a00_0000, "classifier must not flip");
}

#[test]
fn resubmitting_committed_values_stays_fast() {
    let state = state_with_two_planes();
    let update = info_update(&state, |_| {});

    let result = classify(&state, StreamId(1), &[update], None).expect("classify");

    assert_eq!(result.tier, UpdateType::Fast);
    assert!(result.surface_flags(PlaneId(10)).is_empty());
}

#[test]
fn global_alpha_change_is_medium() {
    let state = state_with_two_planes();
    let update = info_update(&state, |info| info.global_alpha_value = 0x40);

    let result = classify(&state, StreamId(1), &[update], None).expect("classify");

    assert_eq!(result.tier, UpdateType::Medium);
    assert!(result
        .surface_flags(PlaneId(10))
        .contains(SurfaceUpdateFlags::GLOBAL_ALPHA));
}

#[test]
fn same_size_format_change_is_still_full() {
    let state = state_with_two_planes();
    let update = info_update(&state, |info| info.format = PixelFormat::Abgr8888);

    let result = classify(&state, StreamId(1), &[update], None).expect("classify");

    assert_eq!(result.tier, UpdateType::Full);
}

#[test]
fn tiling_and_compression_changes_are_full() {
    let state = state_with_two_planes();
    let tiled = info_update(&state, |info| {
        info.tiling = TilingInfo {
            swizzle: Swizzle::Display64K,
            num_pipes: 4,
            num_banks: 8,
        }
    });
    let compressed = info_update(&state, |info| {
        info.dcc = DccParams {
            enable: true,
            independent_64b_blks: true,
            meta_pitch: 1920,
        }
    });

    let flags = surface_update_flags(
        state.plane(StreamId(1), PlaneId(10)).expect("plane").props(),
        &tiled,
    );
    assert!(flags.contains(SurfaceUpdateFlags::SWIZZLE | SurfaceUpdateFlags::BANDWIDTH));
    assert_eq!(
        classify(&state, StreamId(1), &[tiled], None).expect("tiled").tier,
        UpdateType::Full
    );
    assert_eq!(
        classify(&state, StreamId(1), &[compressed], None)
            .expect("compressed")
            .tier,
        UpdateType::Full
    );
}

#[test]
fn moving_a_surface_is_medium_but_shrinking_it_is_full() {
    let old = ScalingInfo::identity(1920, 1080);
    let mut moved = old;
    moved.dst_rect.x = 100;
    moved.clip_rect.x = 100;
    let mut shrunk = old;
    shrunk.dst_rect.width = 960;
    shrunk.clip_rect.width = 960;
    let mut upscaled_source = old;
    upscaled_source.src_rect.width = 3840;

    assert_eq!(
        scaling_info_update_flags(&old, &moved),
        SurfaceUpdateFlags::POSITION
    );
    let shrink_flags = scaling_info_update_flags(&old, &shrunk);
    assert!(shrink_flags.contains(SurfaceUpdateFlags::SCALING | SurfaceUpdateFlags::BANDWIDTH));
    assert!(scaling_info_update_flags(&old, &upscaled_source).contains(SurfaceUpdateFlags::CLOCK));
}

#[test]
fn color_pipeline_stages_map_to_their_severity() {
    let old = ColorPipeline::default();
    let tf = ColorUpdate {
        in_transfer_func: Some(TransferFunction::Pq),
        ..ColorUpdate::default()
    };
    let gamma = ColorUpdate {
        gamma: Some(Some(3)),
        ..ColorUpdate::default()
    };

    assert_eq!(
        UpdateType::of_surface_flags(color_update_flags(&old, &tf)),
        UpdateType::Medium
    );
    assert_eq!(
        UpdateType::of_surface_flags(color_update_flags(&old, &gamma)),
        UpdateType::Full
    );
}

#[test]
fn forced_full_update_sets_every_flag() {
    let state = state_with_two_planes();
    state
        .plane(StreamId(1), PlaneId(11))
        .expect("plane")
        .request_full_update();

    let result = classify(
        &state,
        StreamId(1),
        &[SurfaceUpdate::flip(PlaneId(11), 0x42)],
        None,
    )
    .expect("classify");

    assert_eq!(result.tier, UpdateType::Full);
    assert_eq!(result.surface_flags(PlaneId(11)), SurfaceUpdateFlags::all());
}

#[test]
fn full_tier_floods_flags_but_keeps_computed_dsc_bit() {
    let state = state_with_two_planes();
    let update = info_update(&state, |info| info.format = PixelFormat::Argb16161616F);
    let flip = SurfaceUpdate::flip(PlaneId(11), 0x42);

    let result = classify(&state, StreamId(1), &[update, flip], None).expect("classify");

    assert_eq!(result.tier, UpdateType::Full);
    assert_eq!(result.surface_flags(PlaneId(11)), SurfaceUpdateFlags::all());
    assert!(!result.stream.contains(StreamUpdateFlags::DSC_CHANGED));
    assert!(result.stream.contains(StreamUpdateFlags::MODE_CHANGED));
    let stream = state.stream(StreamId(1)).expect("stream");
    assert!(stream.update_flags().is_empty());
}

#[test]
fn mark_writes_flags_only_into_the_given_container() {
    let pool = pool();
    let live = state_with_two_planes();
    let update = info_update(&live, |info| info.global_alpha_value = 0x40);
    let result = classify(&live, StreamId(1), &[update], None).expect("classify");

    let mut candidate = live.copy_construct();
    let old = Arc::clone(live.plane(StreamId(1), PlaneId(10)).expect("plane"));
    candidate
        .replace_plane(StreamId(1), Arc::new(old.derive(update.apply_to(old.props()), None)))
        .expect("replace plane");
    let stream = live.stream(StreamId(1)).expect("stream");
    candidate
        .replace_stream(Arc::new(stream.derive(*stream.config())), &pool)
        .expect("replace stream");

    result.mark(&candidate, StreamId(1));

    let marked = candidate.plane(StreamId(1), PlaneId(10)).expect("plane");
    assert_eq!(marked.update_flags(), SurfaceUpdateFlags::GLOBAL_ALPHA);
    assert!(old.update_flags().is_empty());
    assert!(live
        .stream(StreamId(1))
        .expect("stream")
        .update_flags()
        .is_empty());
    assert!(candidate
        .plane(StreamId(1), PlaneId(11))
        .expect("plane")
        .update_flags()
        .is_empty());
}

#[test]
fn stream_output_csc_is_medium_and_timing_is_full() {
    let state = state_with_two_planes();
    let csc = StreamUpdate {
        output_csc: Some(Some([1; 12])),
        ..StreamUpdate::default()
    };
    let timing = StreamUpdate {
        timing: Some(CrtcTiming::qhd_144()),
        ..StreamUpdate::default()
    };

    assert_eq!(
        classify(&state, StreamId(1), &[], Some(&csc)).expect("csc").tier,
        UpdateType::Medium
    );
    assert_eq!(
        classify(&state, StreamId(1), &[], Some(&timing))
            .expect("timing")
            .tier,
        UpdateType::Full
    );
}

#[test]
fn unknown_targets_are_rejected() {
    let state = state_with_two_planes();

    assert_eq!(
        classify(&state, StreamId(7), &[], None).unwrap_err(),
        TxnError::UnknownStream(StreamId(7))
    );
    assert_eq!(
        classify(&state, StreamId(1), &[SurfaceUpdate::flip(PlaneId(99), 0)], None).unwrap_err(),
        TxnError::UnknownPlane {
            stream: StreamId(1),
            plane: PlaneId(99)
        }
    );
}
