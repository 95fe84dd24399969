//! Sequence planning: expanding acquisition settings into image requests.
//!
//! The planner turns one [`AcquisitionSettings`] into the total-ordered
//! stream of [`ImageRequest`]s the executor must perform. Expansion is pure:
//! no hardware access, fully deterministic, so the same settings always
//! yield the same stream.
//!
//! # Expansion
//!
//! The four axes flatten into a single linear index. The channel/slice pair
//! and the time/position pair each decompose independently according to their
//! configured nesting order, so `slices_first × position_first` walks
//! `position { frame { channel { slice } } }` while other flag combinations
//! rotate the pairs. An axis with zero configured entries still occupies one
//! step of the decomposition but is marked "not in use".
//!
//! # One-slot lookahead
//!
//! Two decisions about a request depend on its successor: whether the shutter
//! may stay open after it, and the "time until next frame" hint. The planner
//! therefore holds the most recent accepted request un-enqueued for exactly
//! one iteration; the next index finalizes and flushes it. Once flushed, a
//! request is immutable.
//!
//! # Skip rules
//!
//! A channel with frame-skip stride N is imaged only when
//! `frame_index % (N+1) == 0`. A channel that opts out of z-stacking is
//! imaged only at the middle slice. Skipped combinations produce no request.

use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, warn};

use super::request::{ImageRequest, SequenceItem};
use crate::settings::{
    AcquisitionSettings, AxisSizes, ChannelSpec, SharedPosition, SliceChannelOrder,
    TimePositionOrder,
};

/// Deterministic expander of one set of acquisition settings.
pub struct SequencePlanner {
    settings: AcquisitionSettings,
    sizes: AxisSizes,
    channels: Vec<Arc<ChannelSpec>>,
    positions: Vec<SharedPosition>,
    baseline_exposure_ms: f64,
    burst_length: u32,
}

impl SequencePlanner {
    /// Builds a planner over validated settings. `baseline_exposure_ms`
    /// is the camera exposure requests fall back to when no channel is in
    /// use.
    pub fn new(settings: AcquisitionSettings, baseline_exposure_ms: f64) -> Self {
        let sizes = settings.axis_sizes();
        let channels = settings.channels.iter().cloned().map(Arc::new).collect();
        let positions = settings
            .positions
            .iter()
            .cloned()
            .map(|p| Arc::new(RwLock::new(p)))
            .collect();
        let burst_length = plan_burst(&settings, baseline_exposure_ms);
        Self {
            settings,
            sizes,
            channels,
            positions,
            baseline_exposure_ms,
            burst_length,
        }
    }

    /// Flattened image count before skip rules.
    pub fn total_images(&self) -> usize {
        self.sizes.total()
    }

    /// Whether the run streams as one hardware-buffered burst.
    pub fn is_burst(&self) -> bool {
        self.burst_length > 0
    }

    /// The shared position table requests resolve into.
    pub fn positions(&self) -> &[SharedPosition] {
        &self.positions
    }

    /// Iterates the finalized request stream in enqueue order.
    pub fn requests(&self) -> Requests<'_> {
        Requests {
            planner: self,
            next_index: 0,
            held: None,
            done: false,
        }
    }

    /// Producer half of the run: drains the request stream into the bounded
    /// queue and terminates it with the sentinel. Ends early when stop is
    /// signalled or the consumer goes away; the sentinel is attempted on
    /// every exit path.
    pub(crate) async fn produce(
        self,
        tx: mpsc::Sender<SequenceItem>,
        stop_rx: watch::Receiver<bool>,
    ) {
        let mut sent = 0usize;
        for request in self.requests() {
            if *stop_rx.borrow() {
                debug!(sent, "sequence planning interrupted by stop request");
                break;
            }
            if tx.send(SequenceItem::Image(request)).await.is_err() {
                warn!(sent, "request queue closed before planning finished");
                break;
            }
            sent += 1;
        }
        if tx.send(SequenceItem::Sentinel).await.is_err() && !*stop_rx.borrow() {
            warn!("could not deliver end-of-sequence marker");
        }
        debug!(requests = sent, "sequence planning finished");
    }

    /// Builds the raw request at one linear index, plus its skip decision.
    fn request_at(&self, index: usize) -> (ImageRequest, bool) {
        let sizes = &self.sizes;
        let (channel_index, slice_index) = match self.settings.slice_channel_order {
            SliceChannelOrder::SlicesFirst => {
                ((index / sizes.slices) % sizes.channels, index % sizes.slices)
            }
            SliceChannelOrder::ChannelsFirst => (
                index % sizes.channels,
                (index / sizes.channels) % sizes.slices,
            ),
        };
        let per_frame = sizes.channels * sizes.slices;
        let (frame_index, position_index) = match self.settings.time_position_order {
            TimePositionOrder::TimeFirst => (
                (index / per_frame) % sizes.frames,
                (index / (per_frame * sizes.frames)) % sizes.positions,
            ),
            TimePositionOrder::PositionFirst => (
                (index / (per_frame * sizes.positions)) % sizes.frames,
                (index / per_frame) % sizes.positions,
            ),
        };

        let use_position = !self.settings.positions.is_empty();
        let use_frame = self.settings.num_frames > 0;
        let use_channel = !self.settings.channels.is_empty();
        let use_slice = !self.settings.slices_um.is_empty();

        let channel = use_channel.then(|| Arc::clone(&self.channels[channel_index]));
        let position = use_position.then(|| Arc::clone(&self.positions[position_index]));

        // One wall-clock interval per time point, attached to the frame's
        // first image only.
        let wait_ms =
            if frame_index > 0 && position_index == 0 && channel_index == 0 && slice_index == 0 {
                self.settings.interval_ms
            } else {
                0.0
            };

        let mut skip = false;
        if let Some(ch) = channel.as_deref() {
            if frame_index % (ch.skip_frames as usize + 1) != 0 {
                skip = true;
            }
            if use_slice && !ch.do_z_stack && slice_index != (self.settings.slices_um.len() - 1) / 2
            {
                skip = true;
            }
        }

        let mut auto_focus = self.settings.use_autofocus;
        if use_frame {
            auto_focus =
                auto_focus && frame_index % (self.settings.autofocus_skip_frames as usize + 1) == 0;
        }

        let request = ImageRequest {
            position_index,
            frame_index,
            channel_index,
            slice_index,
            use_position,
            use_frame,
            use_channel,
            use_slice,
            channel,
            position,
            slice_um: if use_slice {
                self.settings.slices_um[slice_index]
            } else {
                0.0
            },
            relative_z: self.settings.relative_z_slices,
            z_reference_um: self.settings.z_reference_um,
            exposure_ms: self.baseline_exposure_ms,
            wait_ms,
            next_wait_ms: 0.0,
            close_shutter: true,
            auto_focus,
            collect_burst: self.burst_length > 0,
            start_burst: if index == 0 { self.burst_length } else { 0 },
        };
        (request, skip)
    }
}

/// A run qualifies for hardware-buffered streaming when nothing needs
/// per-image hardware work: a pure time series (no positions, no slices, no
/// autofocus, at most one channel without frame skipping) whose interval does
/// not exceed the effective exposure.
fn plan_burst(settings: &AcquisitionSettings, baseline_exposure_ms: f64) -> u32 {
    if settings.num_frames <= 1 {
        return 0;
    }
    if !settings.positions.is_empty() || !settings.slices_um.is_empty() {
        return 0;
    }
    if settings.use_autofocus || settings.channels.len() > 1 {
        return 0;
    }
    if settings
        .channels
        .first()
        .is_some_and(|ch| ch.skip_frames > 0)
    {
        return 0;
    }
    let exposure_ms = settings
        .channels
        .first()
        .map_or(baseline_exposure_ms, |ch| ch.exposure_ms);
    if settings.interval_ms > exposure_ms {
        return 0;
    }
    settings.num_frames
}

/// Iterator over the finalized request stream.
///
/// Drives the raw index 0..=total: each turn may finalize (shutter flag,
/// next-wait hint) and flush the held request; the final turn flushes the
/// last held one.
pub struct Requests<'a> {
    planner: &'a SequencePlanner,
    next_index: usize,
    held: Option<Held>,
    done: bool,
}

struct Held {
    request: ImageRequest,
    skip: bool,
}

impl Iterator for Requests<'_> {
    type Item = ImageRequest;

    fn next(&mut self) -> Option<ImageRequest> {
        let total = self.planner.sizes.total();
        while !self.done {
            if self.next_index == total {
                self.done = true;
                let last = self.held.take()?;
                if !last.skip {
                    return Some(last.request);
                }
                return None;
            }
            let index = self.next_index;
            self.next_index += 1;

            let (request, skip) = self.planner.request_at(index);

            if let Some(held) = self.held.as_mut() {
                // Shutter economy: only a kept successor in the same frame
                // and position may keep the shutter open after the held
                // request.
                if !skip
                    && !held.skip
                    && request.frame_index == held.request.frame_index
                    && request.position_index == held.request.position_index
                {
                    let across_channels = self.planner.settings.keep_shutter_open_channels;
                    let across_slices = self.planner.settings.keep_shutter_open_slices;
                    if across_channels
                        && !across_slices
                        && request.slice_index == held.request.slice_index
                    {
                        held.request.close_shutter = false;
                    }
                    if across_slices
                        && !across_channels
                        && request.channel_index == held.request.channel_index
                    {
                        held.request.close_shutter = false;
                    }
                    if across_slices && across_channels {
                        held.request.close_shutter = false;
                    }
                }
                // The next frame's wait becomes the held request's schedule
                // hint, known only now.
                if request.wait_ms > 0.0 {
                    held.request.next_wait_ms = request.wait_ms;
                }
            }

            let flushed = if index > 0 {
                match self.held.take() {
                    Some(held) if !held.skip => Some(held.request),
                    _ => None,
                }
            } else {
                None
            };

            if index == 0 || !skip {
                self.held = Some(Held { request, skip });
            }

            if flushed.is_some() {
                return flushed;
            }
        }
        None
    }
}
