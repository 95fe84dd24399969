//! Image requests: the work items flowing from planner to executor.

use std::sync::Arc;

use crate::settings::{ChannelSpec, SharedPosition};

/// One fully resolved unit of work describing a single image to capture.
///
/// Produced by the planner, consumed exactly once by the executor. The
/// planner may still edit a request's shutter-close flag and next-wait hint
/// while it is held back (one-slot lookahead); once enqueued a request is
/// immutable. The executor keeps its own scratch for values that evolve
/// during the pipeline (resolved exposure, running z).
#[derive(Clone, Debug)]
pub struct ImageRequest {
    /// Index into the position list.
    pub position_index: usize,
    /// Time frame index.
    pub frame_index: usize,
    /// Index into the channel list.
    pub channel_index: usize,
    /// Index into the slice list.
    pub slice_index: usize,

    /// Whether the position axis is configured.
    pub use_position: bool,
    /// Whether the time axis is configured.
    pub use_frame: bool,
    /// Whether the channel axis is configured.
    pub use_channel: bool,
    /// Whether the slice axis is configured.
    pub use_slice: bool,

    /// Resolved channel, shared with every request of the same channel.
    pub channel: Option<Arc<ChannelSpec>>,
    /// Resolved stage position, shared with every request at the same site.
    pub position: Option<SharedPosition>,

    /// Requested slice z in micrometers (offset or absolute per
    /// [`relative_z`](Self::relative_z)); 0 when slices are not in use.
    pub slice_um: f64,
    /// Whether [`slice_um`](Self::slice_um) is relative to the z reference.
    pub relative_z: bool,
    /// Baseline focus position for relative slices.
    pub z_reference_um: f64,

    /// Baseline exposure in milliseconds; stage 1 overrides it with the
    /// channel exposure when a channel is in use.
    pub exposure_ms: f64,
    /// Wait before this image in milliseconds; nonzero only on the first
    /// image of a new time frame.
    pub wait_ms: f64,
    /// Scheduling hint: the wait carried by the first image of the next
    /// frame, written retroactively by the planner. 0 when unknown.
    pub next_wait_ms: f64,

    /// Close the shutter after this image. Cleared by the planner when the
    /// shutter-hold-open economy keeps it open for the next image.
    pub close_shutter: bool,
    /// Run autofocus before this image.
    pub auto_focus: bool,

    /// This image is drained from a hardware-buffered burst.
    pub collect_burst: bool,
    /// Nonzero on the first image of a burst: the burst length to start.
    pub start_burst: u32,
}

impl Default for ImageRequest {
    fn default() -> Self {
        Self {
            position_index: 0,
            frame_index: 0,
            channel_index: 0,
            slice_index: 0,
            use_position: false,
            use_frame: false,
            use_channel: false,
            use_slice: false,
            channel: None,
            position: None,
            slice_um: 0.0,
            relative_z: true,
            z_reference_um: 0.0,
            exposure_ms: 0.0,
            wait_ms: 0.0,
            next_wait_ms: 0.0,
            close_shutter: true,
            auto_focus: false,
            collect_burst: false,
            start_burst: 0,
        }
    }
}

/// One slot of the planner→executor queue.
#[derive(Clone, Debug)]
pub enum SequenceItem {
    /// A real image to capture.
    Image(ImageRequest),
    /// Terminal marker: the planner is done, the executor loop may stop.
    Sentinel,
}
