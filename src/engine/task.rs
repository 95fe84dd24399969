//! Image task execution: one request through the six-stage hardware pipeline.
//!
//! Each [`ImageRequest`] popped from the queue becomes one [`ImageTask`]. The
//! task walks a fixed stage order against the device facade:
//!
//! 1. channel configuration and exposure
//! 2. stage positioning
//! 3. interruptible frame-interval wait
//! 4. autofocus pass
//! 5. slice (z) positioning
//! 6. capture, metadata assembly and publication
//!
//! The stop flag is re-checked between stages; stage 3's timed wait and the
//! stage-6 pause gate additionally wake on it. A hardware failure inside a
//! stage is logged and the pipeline moves on, so a sick device degrades the
//! image rather than ending the run. Only stage-6 capture failures yield no
//! image at all.
//!
//! Requests are never mutated: per-image scratch (resolved exposure, running
//! z target) lives on the task itself.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use super::pacing::{PacingClock, WaitPlan};
use super::request::ImageRequest;
use super::EngineConfig;
use crate::core::{Autofocus, DeviceControl, ImageSink, PixelBuffer, TaggedImage};
use crate::metadata::{self, keys, ImageTags};
use crate::settings::StageTarget;
use crate::sink::{publish_guarded, MemoryProbe};

// =============================================================================
// Shared Run State
// =============================================================================

/// State shared by every image task of one run.
///
/// Built by the engine at start and handed to tasks behind an `Arc`. The
/// facade handle is exclusive to the executor; tasks run strictly one at a
/// time, so no additional locking is needed beyond the pacing clock's own
/// mutex.
pub struct ExecContext {
    /// Microscope facade all hardware calls go through.
    pub core: Arc<dyn DeviceControl>,
    /// Focus service; present whenever the plan may request autofocus.
    pub autofocus: Option<Arc<dyn Autofocus>>,
    /// Destination for finished images.
    pub sink: Arc<dyn ImageSink>,
    /// Memory headroom probe consulted before publishing.
    pub memory: Arc<dyn MemoryProbe>,
    /// Engine tuning (poll intervals, publish guard).
    pub config: EngineConfig,
    /// Shared frame-pacing state, reset at run start.
    pub pacing: PacingClock,
    /// Run start; zero point for elapsed-time and schedule metadata.
    pub started_at: Instant,
    /// Whether auto-shutter was selected when the run began. The engine
    /// manages the shutter manually during the run and restores this
    /// selection afterwards.
    pub auto_shutter_selected: bool,
}

/// How one image task ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The image was captured and handed to the sink.
    Published,
    /// A stop request ended the task before it produced an image.
    Stopped,
    /// Capture failed; the run continues with the next request.
    Failed,
}

/// Resolves when a stop is actually requested. A detached controller (all
/// senders dropped without stopping) parks the future instead of waking it.
async fn stop_signalled(mut stop_rx: watch::Receiver<bool>) {
    if stop_rx.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

// =============================================================================
// Image Task
// =============================================================================

/// Executes one image request against the hardware.
pub struct ImageTask {
    request: ImageRequest,
    ctx: Arc<ExecContext>,
    stop_rx: watch::Receiver<bool>,
    pause_rx: watch::Receiver<bool>,
    /// Metadata assembled as stages progress.
    tags: ImageTags,
    /// Exposure actually applied, for the `Exposure-ms` tag.
    exposure_ms: f64,
    /// Running z target, refined by stages 2, 4 and 5.
    z_position: f64,
    /// Whether a z move is pending for stage 5.
    set_z: bool,
}

impl ImageTask {
    /// Binds a request to the run context it will execute in.
    pub fn new(
        request: ImageRequest,
        ctx: Arc<ExecContext>,
        stop_rx: watch::Receiver<bool>,
        pause_rx: watch::Receiver<bool>,
    ) -> Self {
        let exposure_ms = request.exposure_ms;
        let z_position = request.z_reference_um;
        Self {
            request,
            ctx,
            stop_rx,
            pause_rx,
            tags: ImageTags::new(),
            exposure_ms,
            z_position,
            set_z: false,
        }
    }

    fn stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Runs the six stages in order, re-checking the stop flag between them.
    pub async fn run(mut self) -> TaskOutcome {
        trace!(
            frame = self.request.frame_index,
            position = self.request.position_index,
            channel = self.request.channel_index,
            slice = self.request.slice_index,
            "starting image task"
        );
        if self.stopped() {
            return TaskOutcome::Stopped;
        }
        if let Err(err) = self.update_channel().await {
            warn!(error = %err, "could not apply channel settings");
        }
        if self.stopped() {
            return TaskOutcome::Stopped;
        }
        if let Err(err) = self.update_position().await {
            warn!(error = %err, "could not move to the requested position");
        }
        if self.stopped() {
            return TaskOutcome::Stopped;
        }
        self.wait_for_schedule().await;
        if self.stopped() {
            return TaskOutcome::Stopped;
        }
        if self.request.auto_focus {
            if let Err(err) = self.run_autofocus().await {
                warn!(error = %err, "autofocus pass failed");
                self.tags.put(keys::AUTOFOCUS_RESULT, "Failure");
            }
        }
        if self.stopped() {
            return TaskOutcome::Stopped;
        }
        if let Err(err) = self.update_slice().await {
            warn!(error = %err, "could not reach the requested focus position");
        }
        if self.wait_while_paused().await {
            debug!("stop requested; abandoning capture");
            return TaskOutcome::Stopped;
        }
        match self.acquire_and_publish().await {
            Ok(()) => TaskOutcome::Published,
            Err(err) if self.stopped() => {
                debug!(error = %err, "capture abandoned by stop request");
                TaskOutcome::Stopped
            }
            Err(err) => {
                warn!(error = %err, "image capture failed");
                TaskOutcome::Failed
            }
        }
    }

    /// Stage 1: apply the channel exposure, then select the channel preset.
    /// The exposure goes first so a preset carrying its own exposure property
    /// wins over the channel value.
    async fn update_channel(&mut self) -> Result<()> {
        let Some(channel) = self.request.channel.clone() else {
            return Ok(());
        };
        let core = &self.ctx.core;
        core.set_exposure(channel.exposure_ms).await?;
        self.exposure_ms = channel.exposure_ms;
        let group = match &channel.group {
            Some(group) => group.clone(),
            None => core.channel_group().await?,
        };
        core.set_config(&group, &channel.preset)
            .await
            .with_context(|| format!("selecting preset {} in group {}", channel.preset, group))?;
        core.wait_for_config(&group, &channel.preset).await?;
        Ok(())
    }

    /// Stage 2: move every device of the request's position and wait until
    /// the moves settle. A single-axis target on the focus device is not
    /// commanded here; it seeds the running z so stage 5 folds it into one
    /// focus move.
    async fn update_position(&mut self) -> Result<()> {
        let Some(position) = self.request.position.clone() else {
            return Ok(());
        };
        let core = &self.ctx.core;
        let focus = core.focus_device().await?;
        let position = position.read().await;
        for target in &position.targets {
            match target {
                StageTarget::SingleAxis { device, position } => {
                    if *device == focus {
                        self.z_position = *position;
                        self.set_z = true;
                    } else {
                        core.set_position(device, *position).await?;
                        core.wait_for_device(device).await?;
                        self.tags.put(metadata::requested_z_key(device), position);
                    }
                }
                StageTarget::TwoAxis { device, x, y } => {
                    core.set_xy_position(device, *x, *y).await?;
                    core.wait_for_device(device).await?;
                    self.tags.put(metadata::requested_x_key(device), x);
                    self.tags.put(metadata::requested_y_key(device), y);
                }
            }
        }
        core.wait_for_device(&focus).await?;
        Ok(())
    }

    /// Stage 3: pace the time axis. Sleeps until one interval past the
    /// previous frame's wake, wakes early on stop, and records this frame's
    /// wake for the next one. A deadline already in the past is annotated
    /// rather than slept on.
    async fn wait_for_schedule(&mut self) {
        if !self.request.use_frame {
            return;
        }
        match self.ctx.pacing.plan_wait(self.request.wait_ms).await {
            WaitPlan::NoBaseline => {}
            WaitPlan::Ready { lagging } => {
                if lagging {
                    debug!(
                        frame = self.request.frame_index,
                        "frame interval already elapsed; acquisition is lagging"
                    );
                    self.tags.put(keys::TIMING_STATE, metadata::LAGGING);
                }
            }
            WaitPlan::SleepUntil(deadline) => {
                trace!(
                    frame = self.request.frame_index,
                    "waiting for the next frame window"
                );
                tokio::select! {
                    () = time::sleep_until(deadline) => {}
                    () = stop_signalled(self.stop_rx.clone()) => {
                        debug!("frame wait interrupted by stop request");
                    }
                }
            }
        }
        self.ctx.pacing.mark_wake().await;
    }

    /// Stage 4: focus at the running z, then adopt the measured position as
    /// the new z and store it back into the shared position entry so later
    /// visits start from the focused plane.
    async fn run_autofocus(&mut self) -> Result<()> {
        let Some(autofocus) = self.ctx.autofocus.clone() else {
            bail!("no autofocus service attached");
        };
        let core = &self.ctx.core;
        let focus = core.focus_device().await?;
        core.set_position(&focus, self.z_position).await?;
        core.wait_for_device(&focus).await?;
        autofocus.full_focus().await?;
        self.tags.put(keys::AUTOFOCUS_RESULT, "Success");
        let measured = core.position(&focus).await?;
        if let Some(position) = &self.request.position {
            let mut position = position.write().await;
            if position.set_single_axis(&focus, measured) {
                trace!(
                    position = %position.label,
                    z = measured,
                    "stored focused z on the position entry"
                );
            }
        }
        self.z_position = measured;
        Ok(())
    }

    /// Stage 5: resolve the final z from the running z, slice and channel
    /// offset, and command the focus device if anything asked for a move.
    async fn update_slice(&mut self) -> Result<()> {
        let core = &self.ctx.core;
        if self.request.use_slice {
            if self.request.relative_z {
                self.z_position += self.request.slice_um;
            } else {
                self.z_position = self.request.slice_um;
            }
            self.set_z = true;
        } else if !self.set_z {
            let focus = core.focus_device().await?;
            self.z_position = core.position(&focus).await?;
        }
        if let Some(channel) = self.request.channel.as_deref() {
            if channel.z_offset_um != 0.0 {
                self.z_position += channel.z_offset_um;
                self.set_z = true;
            }
        }
        if self.set_z {
            let focus = core.focus_device().await?;
            core.set_position(&focus, self.z_position).await?;
            core.wait_for_device(&focus).await?;
        }
        Ok(())
    }

    /// Blocks while the run is paused. Returns true when a stop request
    /// should abandon the capture.
    async fn wait_while_paused(&mut self) -> bool {
        if *self.pause_rx.borrow() {
            debug!("capture paused");
            let mut pause_rx = self.pause_rx.clone();
            tokio::select! {
                resumed = pause_rx.wait_for(|paused| !*paused) => {
                    if resumed.is_ok() {
                        debug!("capture resumed");
                    }
                }
                () = stop_signalled(self.stop_rx.clone()) => {}
            }
        }
        self.stopped()
    }

    /// Stage 6 body: metadata, capture, publication.
    async fn acquire_and_publish(&mut self) -> Result<()> {
        self.assemble_metadata().await;

        let pixels = if self.request.collect_burst {
            self.collect_burst_frame().await?
        } else {
            self.snap_frame().await?
        };

        let core = &self.ctx.core;
        let mut tags = std::mem::take(&mut self.tags);
        match core.camera_device().await {
            Ok(camera) => tags.put(keys::SOURCE, camera),
            Err(err) => debug!(error = %err, "camera name unavailable"),
        }
        match core.system_state().await {
            Ok(state) => tags.merge_pairs(state),
            Err(err) => debug!(error = %err, "device state snapshot unavailable"),
        }
        if self.request.next_wait_ms > 0.0 {
            if let Some(last_wake_ms) = self.ctx.pacing.wake_offset_ms(self.ctx.started_at).await {
                tags.put(
                    keys::NEXT_FRAME_TIME_MS,
                    last_wake_ms + self.request.next_wait_ms,
                );
            }
        }
        tags.put(keys::UUID, metadata::new_image_uid());
        tags.put(keys::TIME, metadata::capture_timestamp());

        let image = TaggedImage::new(pixels, tags);
        publish_guarded(
            self.ctx.sink.as_ref(),
            self.ctx.memory.as_ref(),
            &self.ctx.config.publish_guard(),
            image,
        )
        .await
    }

    /// Fills in the per-image tags known before the exposure. All reads here
    /// are best-effort: the image is still worth publishing without them.
    async fn assemble_metadata(&mut self) {
        let core = &self.ctx.core;
        self.tags.put(keys::FRAME, self.request.frame_index);
        self.tags.put(keys::SLICE, self.request.slice_index);
        self.tags.put(keys::CHANNEL_INDEX, self.request.channel_index);
        self.tags
            .put(keys::POSITION_INDEX, self.request.position_index);
        if let Some(channel) = self.request.channel.as_deref() {
            self.tags.put(keys::CHANNEL, &channel.preset);
        }
        if let Some(position) = &self.request.position {
            self.tags
                .put(keys::POSITION_NAME, &position.read().await.label);
        }
        // Always written; zero when slices are not in use.
        self.tags.put(keys::SLICE_POSITION, self.request.slice_um);
        self.tags.put(keys::EXPOSURE_MS, self.exposure_ms);
        if let Ok(size) = core.pixel_size_um().await {
            self.tags.put(keys::PIXEL_SIZE_UM, size);
        }
        match async {
            let focus = core.focus_device().await?;
            core.position(&focus).await
        }
        .await
        {
            Ok(z) => self.tags.put(keys::Z_POSITION_UM, z),
            Err(_) => self.tags.put(keys::Z_POSITION_UM, ""),
        }
        if let (Ok(components), Ok(bytes)) = (
            core.number_of_components().await,
            core.bytes_per_pixel().await,
        ) {
            self.tags.put(
                keys::PIXEL_TYPE,
                metadata::pixel_type_label(components, bytes.saturating_mul(8)),
            );
        }
        if let Ok(width) = core.image_width().await {
            self.tags.put(keys::WIDTH, width);
        }
        if let Ok(height) = core.image_height().await {
            self.tags.put(keys::HEIGHT, height);
        }
        self.tags.put(
            keys::ELAPSED_TIME_MS,
            self.ctx.started_at.elapsed().as_millis(),
        );
    }

    /// Single-shot capture with manual shutter economy. Auto-shutter is
    /// disabled for the run's duration; the engine opens the shutter when the
    /// selected policy wants it open and closes it again only when the
    /// request's shutter-close flag is set.
    async fn snap_frame(&mut self) -> Result<PixelBuffer> {
        let core = &self.ctx.core;
        let shutter = core.shutter_device().await?;
        core.wait_for_device(&shutter).await?;
        if core.auto_shutter().await? {
            core.set_auto_shutter(false).await?;
        }
        if self.ctx.auto_shutter_selected && !core.shutter_open().await? {
            core.set_shutter_open(true).await?;
        }
        core.snap_image().await?;
        if self.request.close_shutter && self.ctx.auto_shutter_selected {
            core.wait_for_device(&shutter).await?;
            core.set_shutter_open(false).await?;
        }
        core.image().await
    }

    /// Burst capture: the first request arms the hardware-buffered sequence,
    /// then every burst request polls the buffer until its frame arrives.
    async fn collect_burst_frame(&mut self) -> Result<PixelBuffer> {
        let core = &self.ctx.core;
        if self.request.start_burst > 0 {
            if self.ctx.auto_shutter_selected {
                core.set_auto_shutter(true).await?;
            }
            core.start_sequence_acquisition(self.request.start_burst)
                .await?;
            debug!(
                frames = self.request.start_burst,
                "started hardware-buffered acquisition"
            );
        }
        loop {
            if core.remaining_image_count().await? > 0 {
                return core.pop_next_image().await;
            }
            if self.stopped() {
                bail!("stop requested while waiting for a buffered frame");
            }
            time::sleep(self.ctx.config.burst_poll_interval).await;
        }
    }
}
