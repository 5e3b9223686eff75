use super::*;
use crate::test_support::{plane, pool, stream, vrr_stream};
use test_log::test;

#[test]
fn add_stream_binds_head_with_timing_generator_and_encoder() {
    let pool = pool();
    let mut ctx = ResourceContext::new(pool.pipe_count);
    let s = stream(1);

    ctx.add_stream(&s, &pool).expect("add stream");

    let head = ctx.head_pipe(StreamId(1)).expect("head pipe");
    let pipe = ctx.pipe(head).expect("pipe");
    assert_eq!(pipe.hw.tg, Some(0));
    assert_eq!(pipe.hw.link_enc, Some(0));
    assert!(pipe.plane.is_none());
    assert_eq!(ctx.stream_pipes(StreamId(1)), vec![head]);
    ctx.verify(&pool).expect("consistent");
}

#[test]
fn second_plane_gets_a_blending_pipe_below_the_first() {
    let pool = pool();
    let mut ctx = ResourceContext::new(pool.pipe_count);
    ctx.add_stream(&stream(1), &pool).expect("add stream");

    ctx.add_plane(StreamId(1), &plane(10), &pool).expect("plane 10");
    ctx.add_plane(StreamId(1), &plane(11), &pool).expect("plane 11");

    let pipes = ctx.stream_pipes(StreamId(1));
    assert_eq!(pipes.len(), 2);
    let (head, bottom) = (pipes[0], pipes[1]);
    assert_eq!(ctx.pipe(head).and_then(|p| p.plane_id()), Some(PlaneId(10)));
    assert_eq!(ctx.pipe(bottom).and_then(|p| p.plane_id()), Some(PlaneId(11)));
    assert_eq!(ctx.pipe(head).and_then(|p| p.bottom_pipe), Some(bottom));
    assert_eq!(ctx.pipe(bottom).and_then(|p| p.top_pipe), Some(head));
    assert!(ctx.pipe(bottom).map(|p| p.hw.tg.is_none()).unwrap_or(false));
    ctx.verify(&pool).expect("consistent");
}

#[test]
fn stream_above_max_display_clock_is_split_into_two_segments() {
    let mut pool = pool();
    pool.max_dispclk_khz = 300_000;
    let mut ctx = ResourceContext::new(pool.pipe_count);
    let s = vrr_stream(1);

    ctx.add_stream(&s, &pool).expect("add stream");
    ctx.add_plane(StreamId(1), &plane(10), &pool).expect("add plane");

    let heads = ctx.segment_heads(StreamId(1));
    assert_eq!(heads.len(), 2);
    assert_eq!(ctx.pipe(heads[0]).and_then(|p| p.next_odm_pipe), Some(heads[1]));
    assert_eq!(ctx.pipes_with_plane(PlaneId(10)).len(), 2);
    assert!(ctx.pipe(heads[1]).map(|p| p.hw.tg.is_none()).unwrap_or(false));
    ctx.verify(&pool).expect("consistent");
}

#[test]
fn exhausting_pipes_fails_without_touching_the_context() {
    let mut pool = pool();
    pool.pipe_count = 2;
    let mut ctx = ResourceContext::new(pool.pipe_count);
    ctx.add_stream(&stream(1), &pool).expect("add stream");
    ctx.add_plane(StreamId(1), &plane(10), &pool).expect("plane 10");
    ctx.add_plane(StreamId(1), &plane(11), &pool).expect("plane 11");
    let before = ctx.fingerprint();

    let err = ctx.add_plane(StreamId(1), &plane(12), &pool).unwrap_err();

    assert_eq!(err, ResourceError::NoFreePipe);
    assert_eq!(ctx.fingerprint(), before);
}

#[test]
fn duplicate_stream_and_plane_are_rejected() {
    let pool = pool();
    let mut ctx = ResourceContext::new(pool.pipe_count);
    let s = stream(1);
    ctx.add_stream(&s, &pool).expect("add stream");
    ctx.add_plane(StreamId(1), &plane(10), &pool).expect("add plane");

    assert_eq!(
        ctx.add_stream(&s, &pool),
        Err(ResourceError::DuplicateStream(StreamId(1)))
    );
    assert!(matches!(
        ctx.add_plane(StreamId(1), &plane(10), &pool),
        Err(ResourceError::DuplicatePlane { .. })
    ));
    assert_eq!(
        ctx.add_plane(StreamId(9), &plane(11), &pool),
        Err(ResourceError::UnknownStream(StreamId(9)))
    );
}

#[test]
fn strip_and_remove_leave_idle_pipes() {
    let pool = pool();
    let mut ctx = ResourceContext::new(pool.pipe_count);
    ctx.add_stream(&stream(1), &pool).expect("add stream");
    ctx.add_plane(StreamId(1), &plane(10), &pool).expect("plane 10");
    ctx.add_plane(StreamId(1), &plane(11), &pool).expect("plane 11");

    ctx.strip_planes(StreamId(1));
    assert_eq!(ctx.stream_pipes(StreamId(1)).len(), 1);
    assert!(!ctx.contains_plane(PlaneId(10)));
    ctx.verify(&pool).expect("consistent after strip");

    ctx.remove_stream(StreamId(1));
    assert!(ctx.pipes().all(|(_, p)| p.is_idle() && p.hw == HwBlocks::default()));
}

#[test]
fn clone_keeps_links_and_shares_objects() {
    let pool = pool();
    let mut ctx = ResourceContext::new(pool.pipe_count);
    let s = stream(1);
    let p = plane(10);
    ctx.add_stream(&s, &pool).expect("add stream");
    ctx.add_plane(StreamId(1), &p, &pool).expect("plane 10");
    ctx.add_plane(StreamId(1), &plane(11), &pool).expect("plane 11");

    let copy = ctx.clone();

    assert_eq!(copy.fingerprint(), ctx.fingerprint());
    // Original handle, two contexts.
    assert_eq!(Arc::strong_count(&p), 3);
    assert_eq!(Arc::strong_count(&s), 1 + 2 * 2);
}

#[test]
fn verify_reports_double_booked_scaler() {
    let pool = pool();
    let mut ctx = ResourceContext::new(pool.pipe_count);
    ctx.add_stream(&stream(1), &pool).expect("stream 1");
    ctx.add_stream(&stream(2), &pool).expect("stream 2");
    ctx.add_plane(StreamId(1), &plane(10), &pool).expect("plane 10");
    ctx.add_plane(StreamId(2), &plane(20), &pool).expect("plane 20");
    let second = ctx.head_pipe(StreamId(2)).expect("head");

    if let Some(pipe) = ctx.pipe_mut(second) {
        pipe.hw.scaler = Some(0);
    }

    assert!(matches!(
        ctx.verify(&pool),
        Err(ResourceError::DoubleBooked {
            block: HwBlock::Scaler,
            index: 0,
            ..
        })
    ));
}

#[test]
fn verify_reports_one_sided_link_as_broken_chain() {
    let pool = pool();
    let mut ctx = ResourceContext::new(pool.pipe_count);
    ctx.add_stream(&stream(1), &pool).expect("add stream");
    ctx.add_plane(StreamId(1), &plane(10), &pool).expect("plane 10");
    ctx.add_plane(StreamId(1), &plane(11), &pool).expect("plane 11");
    let head = ctx.head_pipe(StreamId(1)).expect("head");

    if let Some(pipe) = ctx.pipe_mut(head) {
        pipe.bottom_pipe = None;
    }

    let err = ctx.verify_links().unwrap_err();
    assert!(err.is_invariant_violation(), "{err}");
}
