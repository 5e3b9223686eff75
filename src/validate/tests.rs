use super::*;
use crate::error::{HwBlock, ValidationCategory};
use crate::model::{
    ColorDepth, CrtcTiming, DscConfig, LinkId, LinkInfo, PixelFormat, Plane, PlaneId, PlaneProps,
    Rect, Stream, VrrRange,
};
use crate::state::StatePhase;
use crate::test_support::{plane, stream, stream_config};
use std::sync::Arc;
use test_log::test;

fn config_with_dram(dram_bandwidth_kbps: u64) -> Config {
    let mut config = Config::default();
    config.bandwidth.dram_bandwidth_kbps = dram_bandwidth_kbps;
    config
}

fn single_stream_state(validator: &Validator, props: PlaneProps) -> State {
    let pool = validator.pool();
    let mut state = State::new(pool.pipe_count);
    state.add_stream(stream(1), pool).expect("stream");
    state
        .add_plane(StreamId(1), Arc::new(Plane::new(PlaneId(10), props, 0x1000)), pool)
        .expect("plane");
    state
}

fn fp16_props() -> PlaneProps {
    let mut props = PlaneProps::simple(1920, 1080);
    props.info.format = PixelFormat::Argb16161616F;
    props
}

#[test]
fn accepts_a_single_1080p_stream_at_the_lowest_clock_level() {
    let validator = Validator::new(&Config::default());
    let state = single_stream_state(&validator, PlaneProps::simple(1920, 1080));

    let clocks = validator
        .validate(&state, ValidationMode::Full, ClockState::default())
        .expect("valid");

    assert_eq!(clocks.dispclk_khz, 300_000);
    assert_eq!(clocks.fetch_kbps, 497_664);
}

#[test]
fn rejects_fetch_bandwidth_above_the_memory_ceiling() {
    let validator = Validator::new(&config_with_dram(900_000));
    let state = single_stream_state(&validator, fp16_props());
    let before = state.res_ctx().fingerprint();

    let err = validator
        .validate(&state, ValidationMode::Full, ClockState::default())
        .unwrap_err();

    assert_eq!(err.category(), ValidationCategory::Bandwidth);
    assert!(matches!(
        err,
        ValidationError::Bandwidth {
            kind: BandwidthKind::Memory,
            required: 995_328,
            available: 900_000
        }
    ));
    assert_eq!(state.res_ctx().fingerprint(), before);
    assert_eq!(state.phase(), StatePhase::Fresh);
}

#[test]
fn fetch_bandwidth_saturates_on_absurd_surface_sizes() {
    let validator = Validator::new(&Config::default());
    let mut props = fp16_props();
    props.scaling.src_rect = Rect::new(0, 0, u32::MAX, u32::MAX);
    props.scaling.dst_rect = Rect::new(0, 0, 1, 1);
    assert_eq!(validator.plane_fetch_kbps(&props, 144_000), u64::MAX);

    let mut state = single_stream_state(&validator, props);
    state
        .add_plane(
            StreamId(1),
            Arc::new(Plane::new(PlaneId(11), props, 0x2000)),
            validator.pool(),
        )
        .expect("plane");
    assert_eq!(validator.fetch_bandwidth_kbps(&state), u64::MAX);
}

#[test]
fn fast_pass_skips_the_bandwidth_model_and_keeps_baseline_clocks() {
    let validator = Validator::new(&config_with_dram(900_000));
    let state = single_stream_state(&validator, fp16_props());
    let baseline = ClockState {
        dispclk_khz: 600_000,
        fetch_kbps: 1,
    };

    let clocks = validator
        .validate(&state, ValidationMode::FastPass, baseline)
        .expect("fast pass");

    assert_eq!(clocks, baseline);
}

#[test]
fn rejects_pixel_clock_beyond_the_highest_level_even_when_split() {
    let validator = Validator::new(&Config::default());
    let pool = validator.pool();
    let mut timing = CrtcTiming::qhd_144();
    timing.pix_clk_100hz = 30_000_000;
    let config = StreamConfig::new(timing, LinkInfo::hbr3(LinkId(1)));
    let mut state = State::new(pool.pipe_count);
    state
        .add_stream(Arc::new(Stream::new(StreamId(1), config)), pool)
        .expect("stream");

    let err = validator
        .validate(&state, ValidationMode::Full, ClockState::default())
        .unwrap_err();

    assert!(matches!(
        err,
        ValidationError::Bandwidth {
            kind: BandwidthKind::DisplayClock,
            required: 1_500_000,
            ..
        }
    ));
}

#[test]
fn resource_check_runs_before_bandwidth() {
    let validator = Validator::new(&config_with_dram(1));
    let pool = *validator.pool();
    let mut state = single_stream_state(&validator, PlaneProps::simple(1920, 1080));
    state.add_stream(stream(2), &pool).expect("stream 2");
    state.add_plane(StreamId(2), plane(20), &pool).expect("plane 20");
    let second = state.res_ctx().head_pipe(StreamId(2)).expect("head");
    if let Some(pipe) = state.res_ctx_mut().pipe_mut(second) {
        pipe.hw.tg = Some(0);
    }

    let err = validator
        .validate(&state, ValidationMode::Full, ClockState::default())
        .unwrap_err();

    assert_eq!(err.category(), ValidationCategory::Resource);
    assert!(matches!(
        err,
        ValidationError::Resource(ResourceError::DoubleBooked {
            block: HwBlock::TimingGenerator,
            ..
        })
    ));
}

#[test]
fn compression_and_variable_refresh_preconditions() {
    let validator = Validator::new(&Config::default());
    let dsc = DscConfig {
        num_slices_h: 4,
        num_slices_v: 1,
        bits_per_pixel_x16: 8 * 16,
    };
    let range = VrrRange {
        min_refresh_mhz: 48_000,
        max_refresh_mhz: 60_000,
    };

    let mut no_dsc_link = stream_config(1);
    no_dsc_link.link.supports_dsc = false;
    no_dsc_link.dsc = Some(dsc);
    assert!(matches!(
        validator.validate_stream_config(StreamId(1), &no_dsc_link),
        Err(ValidationError::Feature {
            reason: FeatureReason::DscUnsupported,
            ..
        })
    ));

    let mut combined = stream_config(1).with_vrr(range);
    combined.link.dsc_with_vrr = false;
    combined.dsc = Some(dsc);
    assert!(matches!(
        validator.validate_stream_config(StreamId(1), &combined),
        Err(ValidationError::Feature {
            reason: FeatureReason::DscWithVrr,
            ..
        })
    ));

    let inverted = stream_config(1).with_vrr(VrrRange {
        min_refresh_mhz: 60_000,
        max_refresh_mhz: 48_000,
    });
    assert!(matches!(
        validator.validate_stream_config(StreamId(1), &inverted),
        Err(ValidationError::Feature {
            reason: FeatureReason::InvalidVrrRange,
            ..
        })
    ));
}

fn narrow_link_config(depth: ColorDepth) -> StreamConfig {
    let mut link = LinkInfo::hbr3(LinkId(1));
    link.max_link_rate_kbps = 15_000_000;
    StreamConfig::new(CrtcTiming::qhd_144(), link).with_color_depth(depth)
}

#[test]
fn color_depth_fallback_lowers_until_the_link_fits() {
    let validator = Validator::new(&Config::default());

    let fitted = validator
        .fit_color_depth(StreamId(1), narrow_link_config(ColorDepth::Bpc12))
        .expect("fits at lower depth");

    assert_eq!(fitted.color_depth, ColorDepth::Bpc8);
}

#[test]
fn color_depth_fallback_respects_policy() {
    let mut config = Config::default();
    config.validation.color_depth_fallback = false;
    let disabled = Validator::new(&config);
    assert!(matches!(
        disabled.fit_color_depth(StreamId(1), narrow_link_config(ColorDepth::Bpc10)),
        Err(ValidationError::Bandwidth {
            kind: BandwidthKind::Link,
            ..
        })
    ));

    let mut config = Config::default();
    config.validation.min_color_depth = ColorDepth::Bpc10;
    let floored = Validator::new(&config);
    assert!(floored
        .fit_color_depth(StreamId(1), narrow_link_config(ColorDepth::Bpc12))
        .is_err());
}
