use super::*;
use crate::model::{LinkId, LinkInfo, StreamConfig};
use crate::test_support::vrr_stream;
use test_log::test;

const RANGE_48_144: VrrRange = VrrRange {
    min_refresh_mhz: 48_000,
    max_refresh_mhz: 144_000,
};

fn qhd_bounds() -> (CrtcTiming, VrrBounds) {
    let config = StreamConfig::new(CrtcTiming::qhd_144(), LinkInfo::hbr3(LinkId(1)))
        .with_vrr(RANGE_48_144);
    let bounds = config.vrr_bounds().expect("bounds");
    (config.timing, bounds)
}

#[test]
fn bounds_follow_the_refresh_range() {
    let (_, bounds) = qhd_bounds();
    assert_eq!(
        bounds,
        VrrBounds {
            v_total_min: 1525,
            v_total_max: 4575
        }
    );
}

#[test]
fn in_range_interval_programs_the_full_window() {
    let (timing, bounds) = qhd_bounds();

    let adjust = compute_adjust(&timing, bounds, RANGE_48_144, 10_000);

    assert_eq!(
        adjust,
        VrrAdjust {
            v_total_min: 1525,
            v_total_max: 4575,
            v_total_mid: 0,
            v_total_mid_frame_num: 0
        }
    );
}

#[test]
fn long_interval_inserts_mid_point_frames() {
    let (timing, bounds) = qhd_bounds();

    // 20 Hz content on a 48-144 Hz panel: four frames of 12.5 ms.
    let adjust = compute_adjust(&timing, bounds, RANGE_48_144, 50_000);

    assert_eq!(adjust.v_total_mid_frame_num, 4);
    assert_eq!(adjust.v_total_mid, 2745);
    assert!(bounds.contains(adjust.v_total_mid));
}

#[test]
fn narrow_range_has_no_compensation() {
    let timing = CrtcTiming::fhd_60();
    let range = VrrRange {
        min_refresh_mhz: 48_000,
        max_refresh_mhz: 60_000,
    };
    let config = StreamConfig::new(timing, LinkInfo::hbr3(LinkId(1))).with_vrr(range);
    let bounds = config.vrr_bounds().expect("bounds");

    let adjust = compute_adjust(&timing, bounds, range, 50_000);

    assert_eq!(adjust.v_total_mid_frame_num, 0);
    assert_eq!((adjust.v_total_min, adjust.v_total_max), (1125, 1406));
}

#[test]
fn video_rates_match_their_closest_period() {
    assert_eq!(match_video_rate(41_667, 200), Some(24_000));
    assert_eq!(match_video_rate(41_708, 200), Some(23_976));
    assert_eq!(match_video_rate(16_683, 200), Some(59_940));
    assert_eq!(match_video_rate(30_000, 200), None);
}

#[test]
fn fixed_refresh_uses_the_smallest_multiple_inside_the_range() {
    let (timing, bounds) = qhd_bounds();

    assert_eq!(
        fixed_refresh_v_total(&timing, bounds, RANGE_48_144, 24_000),
        Some(4575)
    );
    assert_eq!(
        fixed_refresh_v_total(&timing, bounds, RANGE_48_144, 23_976),
        Some(3053)
    );
    assert_eq!(
        fixed_refresh_v_total(&timing, bounds, RANGE_48_144, 60_000),
        Some(3660)
    );
}

#[test]
fn steady_film_cadence_locks_and_exits_with_hysteresis() {
    let stream = vrr_stream(1);
    let mut tracker = VrrTracker::new(StreamId(1), VrrTuning::default());
    let mut t = 0;
    for _ in 0..9 {
        tracker.record_flip(t);
        t += 41_667;
    }

    assert_eq!(tracker.fixed_rate_mhz(), Some(24_000));
    let locked = tracker.next_adjust(&stream).expect("fixed adjustment");
    assert_eq!(locked, VrrAdjust::fixed(4575));
    assert_eq!(tracker.next_adjust(&stream), Some(locked), "not applied yet");
    tracker.mark_applied(locked);
    assert_eq!(tracker.next_adjust(&stream), None, "unchanged adjustment");

    tracker.record_flip(t);
    tracker.record_flip(t + 10_000);
    assert_eq!(tracker.fixed_rate_mhz(), Some(24_000), "one mismatch is tolerated");
    tracker.record_flip(t + 20_000);
    assert_eq!(tracker.fixed_rate_mhz(), None);
    assert_eq!(
        tracker.next_adjust(&stream).map(|a| a.v_total_max),
        Some(4575)
    );
}

#[test]
fn deferred_completion_is_released_once() {
    let mut tracker = VrrTracker::new(StreamId(1), VrrTuning::default());
    let completion = FlipCompletion {
        stream_id: StreamId(1),
        frame_count: 3,
        timestamp_us: 100,
        deferred: false,
    };

    tracker.defer_completion(completion);

    assert!(tracker.status().completion_pending);
    let released = tracker.take_deferred().expect("deferred");
    assert!(released.deferred);
    assert_eq!(released.frame_count, 3);
    assert!(tracker.take_deferred().is_none());
}

#[test]
fn range_and_porch_checks_hold_at_the_top_of_the_counter_range() {
    let wide = VrrRange {
        min_refresh_mhz: u32::MAX / 2 + 1,
        max_refresh_mhz: u32::MAX,
    };
    assert!(!wide.supports_btr());
    let doubled = VrrRange {
        min_refresh_mhz: u32::MAX / 2,
        max_refresh_mhz: u32::MAX,
    };
    assert!(doubled.supports_btr());

    let timing = CrtcTiming {
        v_addressable: u32::MAX - 4,
        v_front_porch: 10,
        ..CrtcTiming::fhd_60()
    };
    assert!(!timing.is_in_front_porch(u32::MAX - 5));
    assert!(timing.is_in_front_porch(u32::MAX - 4));
    assert!(timing.is_in_front_porch(u32::MAX));
}
