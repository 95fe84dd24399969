//! Whole-plan checks of the sequence planner: axis ordering, skip rules,
//! wait placement, shutter merging, and burst detection.

use mda_engine::settings::{
    AcquisitionSettings, ChannelSpec, NamedPosition, SliceChannelOrder, TimePositionOrder,
};
use mda_engine::{ImageRequest, SequencePlanner};

/// A plan covering all four axes with no skip rules in play.
fn full_grid() -> AcquisitionSettings {
    let mut settings = AcquisitionSettings::default();
    settings.positions = vec![
        NamedPosition::new("site-a").with_single_axis("Z", 10.0),
        NamedPosition::new("site-b").with_single_axis("Z", 20.0),
    ];
    settings.num_frames = 3;
    settings.channels = vec![
        ChannelSpec::new("DAPI", 20.0),
        ChannelSpec::new("FITC", 40.0),
    ];
    settings.slices_um = vec![-1.0, 0.0, 1.0];
    settings
}

fn expand(settings: AcquisitionSettings) -> Vec<ImageRequest> {
    SequencePlanner::new(settings, 10.0).requests().collect()
}

fn index_tuples(requests: &[ImageRequest]) -> Vec<(usize, usize, usize, usize)> {
    requests
        .iter()
        .map(|r| (r.position_index, r.frame_index, r.channel_index, r.slice_index))
        .collect()
}

/// Reference expansion by explicit nested loops, for comparison against the
/// planner's arithmetic decomposition.
fn nested_expansion(
    positions: usize,
    frames: usize,
    channels: usize,
    slices: usize,
    time_position_order: TimePositionOrder,
    slice_channel_order: SliceChannelOrder,
) -> Vec<(usize, usize, usize, usize)> {
    let mut expected = Vec::new();
    let outer: Vec<(usize, usize)> = match time_position_order {
        TimePositionOrder::TimeFirst => (0..positions)
            .flat_map(|p| (0..frames).map(move |f| (p, f)))
            .collect(),
        TimePositionOrder::PositionFirst => (0..frames)
            .flat_map(|f| (0..positions).map(move |p| (p, f)))
            .collect(),
    };
    for (p, f) in outer {
        match slice_channel_order {
            SliceChannelOrder::SlicesFirst => {
                for c in 0..channels {
                    for s in 0..slices {
                        expected.push((p, f, c, s));
                    }
                }
            }
            SliceChannelOrder::ChannelsFirst => {
                for s in 0..slices {
                    for c in 0..channels {
                        expected.push((p, f, c, s));
                    }
                }
            }
        }
    }
    expected
}

#[test]
fn test_every_grid_cell_is_emitted_exactly_once() {
    let planner = SequencePlanner::new(full_grid(), 10.0);
    assert_eq!(planner.total_images(), 2 * 3 * 2 * 3);

    let requests: Vec<ImageRequest> = planner.requests().collect();
    assert_eq!(requests.len(), 36);

    let mut seen = index_tuples(&requests);
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 36, "every (position, frame, channel, slice) cell once");
}

#[test]
fn test_axis_nesting_matches_the_configured_orders() {
    let orders = [
        (TimePositionOrder::TimeFirst, SliceChannelOrder::SlicesFirst),
        (TimePositionOrder::TimeFirst, SliceChannelOrder::ChannelsFirst),
        (TimePositionOrder::PositionFirst, SliceChannelOrder::SlicesFirst),
        (TimePositionOrder::PositionFirst, SliceChannelOrder::ChannelsFirst),
    ];
    for (time_position_order, slice_channel_order) in orders {
        let mut settings = full_grid();
        settings.time_position_order = time_position_order;
        settings.slice_channel_order = slice_channel_order;

        let requests = expand(settings);
        let expected =
            nested_expansion(2, 3, 2, 3, time_position_order, slice_channel_order);
        assert_eq!(
            index_tuples(&requests),
            expected,
            "order {time_position_order:?}/{slice_channel_order:?}"
        );
    }
}

#[test]
fn test_frame_skipping_channels_appear_on_their_frames_only() {
    let mut settings = AcquisitionSettings::default();
    settings.num_frames = 6;
    let mut sparse = ChannelSpec::new("sparse", 10.0);
    sparse.skip_frames = 2;
    settings.channels = vec![sparse, ChannelSpec::new("dense", 10.0)];

    let requests = expand(settings);
    let sparse_frames: Vec<usize> = requests
        .iter()
        .filter(|r| r.channel_index == 0)
        .map(|r| r.frame_index)
        .collect();
    let dense_frames: Vec<usize> = requests
        .iter()
        .filter(|r| r.channel_index == 1)
        .map(|r| r.frame_index)
        .collect();

    assert_eq!(sparse_frames, vec![0, 3]);
    assert_eq!(dense_frames, vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn test_static_channels_image_the_middle_slice_only() {
    let mut settings = AcquisitionSettings::default();
    settings.num_frames = 1;
    settings.slices_um = vec![-2.0, -1.0, 1.0, 2.0];
    let mut flat = ChannelSpec::new("brightfield", 5.0);
    flat.do_z_stack = false;
    settings.channels = vec![flat, ChannelSpec::new("stack", 5.0)];

    let requests = expand(settings);
    let flat_slices: Vec<usize> = requests
        .iter()
        .filter(|r| r.channel_index == 0)
        .map(|r| r.slice_index)
        .collect();
    let stack_slices: Vec<usize> = requests
        .iter()
        .filter(|r| r.channel_index == 1)
        .map(|r| r.slice_index)
        .collect();

    // (4 - 1) / 2 = 1 in integer arithmetic.
    assert_eq!(flat_slices, vec![1]);
    assert_eq!(stack_slices, vec![0, 1, 2, 3]);
}

#[test]
fn test_wait_belongs_to_the_first_image_of_each_frame() {
    let mut settings = full_grid();
    settings.interval_ms = 1000.0;
    let requests = expand(settings);

    let mut waits = 0;
    for request in &requests {
        let frame_start = request.frame_index > 0
            && request.position_index == 0
            && request.channel_index == 0
            && request.slice_index == 0;
        if frame_start {
            assert_eq!(request.wait_ms, 1000.0);
            waits += 1;
        } else {
            assert_eq!(request.wait_ms, 0.0);
        }
    }
    assert_eq!(waits, 2, "one wait per frame after the first");
}

#[test]
fn test_shutter_closes_only_on_the_last_slice_when_held_open() {
    let mut settings = AcquisitionSettings::default();
    settings.num_frames = 2;
    settings.channels = vec![ChannelSpec::new("GFP", 15.0)];
    settings.slices_um = vec![0.0, 0.5, 1.0];
    settings.keep_shutter_open_slices = true;

    let requests = expand(settings);
    for request in &requests {
        let last_slice = request.slice_index == 2;
        assert_eq!(
            request.close_shutter, last_slice,
            "frame {} slice {}",
            request.frame_index, request.slice_index
        );
    }
}

#[test]
fn test_shutter_closes_after_every_image_by_default() {
    let requests = expand(full_grid());
    assert!(requests.iter().all(|r| r.close_shutter));
}

#[test]
fn test_timed_z_stack_scenario() {
    let mut settings = AcquisitionSettings::default();
    settings.num_frames = 2;
    settings.channels = vec![ChannelSpec::new("Cy5", 30.0)];
    settings.slices_um = vec![-0.5, 0.0, 0.5];
    settings.keep_shutter_open_slices = true;
    settings.interval_ms = 500.0;

    let requests = expand(settings);
    let observed: Vec<(usize, usize, f64, bool, f64)> = requests
        .iter()
        .map(|r| {
            (
                r.frame_index,
                r.slice_index,
                r.wait_ms,
                r.close_shutter,
                r.next_wait_ms,
            )
        })
        .collect();

    // The frame-1 wait is hinted on the image published just before it.
    let expected = vec![
        (0, 0, 0.0, false, 0.0),
        (0, 1, 0.0, false, 0.0),
        (0, 2, 0.0, true, 500.0),
        (1, 0, 500.0, false, 0.0),
        (1, 1, 0.0, false, 0.0),
        (1, 2, 0.0, true, 0.0),
    ];
    assert_eq!(observed, expected);
}

#[test]
fn test_expansion_is_deterministic() {
    let first = expand(full_grid());
    let second = expand(full_grid());

    let snapshot = |requests: &[ImageRequest]| -> Vec<(usize, usize, usize, usize, u64, u64, bool)> {
        requests
            .iter()
            .map(|r| {
                (
                    r.position_index,
                    r.frame_index,
                    r.channel_index,
                    r.slice_index,
                    r.wait_ms.to_bits(),
                    r.exposure_ms.to_bits(),
                    r.close_shutter,
                )
            })
            .collect()
    };
    assert_eq!(snapshot(&first), snapshot(&second));
}

#[test]
fn test_burst_detection() {
    let mut settings = AcquisitionSettings::default();
    settings.num_frames = 5;
    settings.channels = vec![ChannelSpec::new("GFP", 20.0)];
    settings.interval_ms = 10.0;

    let planner = SequencePlanner::new(settings.clone(), 10.0);
    assert!(planner.is_burst(), "interval within exposure qualifies");

    let requests: Vec<ImageRequest> = planner.requests().collect();
    assert_eq!(requests[0].start_burst, 5);
    assert!(requests.iter().all(|r| r.collect_burst));
    assert!(requests[1..].iter().all(|r| r.start_burst == 0));

    // An interval longer than the exposure forces timed single frames.
    settings.interval_ms = 100.0;
    let timed = SequencePlanner::new(settings, 10.0);
    assert!(!timed.is_burst());
    assert!(timed.requests().all(|r| !r.collect_burst));
}

#[test]
fn test_empty_plan_still_takes_one_image() {
    let requests = expand(AcquisitionSettings::default());
    assert_eq!(requests.len(), 1);
    let only = &requests[0];
    assert!(!only.use_position && !only.use_frame && !only.use_channel && !only.use_slice);
    assert_eq!(only.wait_ms, 0.0);
}
