//! Core traits and data types for the acquisition engine.
//!
//! This module defines the boundary between the sequencing engine and the
//! outside world: the device-control facade it drives, the autofocus service
//! it may invoke, and the sink that receives finished images.
//!
//! # Architecture Overview
//!
//! The engine is hardware-agnostic. All hardware access goes through three
//! capability traits:
//!
//! - [`DeviceControl`]: the microscope facade (exposure, configuration
//!   presets, stage motion, shutter, camera). One implementation drives the
//!   real hardware; [`crate::hardware::mock::SimulatedCore`] backs tests.
//! - [`Autofocus`]: a single blocking full-focus cycle on the current focus
//!   device.
//! - [`ImageSink`]: accepts one captured image plus its flat metadata map.
//!
//! # Data Flow
//!
//! ```text
//! SequencePlanner --[ImageRequest]--> mpsc::channel --> ImageTask --> ImageSink
//!                                                          |
//!                                                    DeviceControl
//! ```
//!
//! # Thread Safety
//!
//! All traits require `Send + Sync` and are consumed as `Arc<dyn _>`. The
//! engine serializes hardware access itself: only the executor task ever
//! calls [`DeviceControl`], one operation at a time, so implementations do
//! not need to tolerate concurrent device commands.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::metadata::ImageTags;

// =============================================================================
// Pixel Data
// =============================================================================

/// Pixel buffer in the camera's native bit depth.
///
/// Frames are kept in the format the sensor produced them; bit depth and
/// component count are reported separately by the facade
/// ([`DeviceControl::bytes_per_pixel`], [`DeviceControl::number_of_components`]).
///
/// # Variants
///
/// * `U8` - 8-bit pixels, also used for packed multi-component (RGB) frames
/// * `U16` - 16-bit pixels, the common scientific-camera format
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelBuffer {
    /// 8-bit unsigned pixels (1 byte/pixel, or 4 bytes/pixel packed RGB)
    U8(Vec<u8>),
    /// 16-bit unsigned pixels (2 bytes/pixel)
    U16(Vec<u16>),
}

impl PixelBuffer {
    /// Returns the number of stored elements.
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len(),
        }
    }

    /// Returns true if the buffer contains no pixels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the buffer size in bytes.
    pub fn memory_bytes(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len() * 2,
        }
    }

    /// Returns the per-element bit depth (8 or 16).
    pub fn bit_depth(&self) -> u32 {
        match self {
            PixelBuffer::U8(_) => 8,
            PixelBuffer::U16(_) => 16,
        }
    }
}

/// One captured image: pixels plus the flat metadata map assembled by the
/// acquisition pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaggedImage {
    /// Raw frame in the camera's native format.
    pub pixels: PixelBuffer,
    /// Flat string-keyed metadata (see [`crate::metadata::keys`]).
    pub tags: ImageTags,
}

impl TaggedImage {
    /// Bundles pixels with their metadata.
    pub fn new(pixels: PixelBuffer, tags: ImageTags) -> Self {
        Self { pixels, tags }
    }
}

// =============================================================================
// Device Control Facade
// =============================================================================

/// The microscope control facade consumed by the acquisition pipeline.
///
/// Mirrors the operations a microscope core exposes to an acquisition engine,
/// grouped into exposure, configuration, motion and imaging capabilities.
/// Every call completes the hardware operation before returning (moves and
/// waits included); the engine relies on that for its ordering guarantees.
///
/// Devices are addressed by name. The facade knows which named device is the
/// current focus drive, XY stage, shutter and camera.
///
/// # Errors
///
/// All operations return `anyhow::Result`: a hardware fault is reported as an
/// error and the pipeline stage that issued the call recovers locally (logs
/// and annotates metadata) rather than aborting the run.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    // --- exposure ---

    /// Set camera exposure in milliseconds.
    async fn set_exposure(&self, ms: f64) -> Result<()>;

    /// Current camera exposure in milliseconds.
    async fn exposure(&self) -> Result<f64>;

    // --- configuration ---

    /// Apply a named preset of a configuration group.
    async fn set_config(&self, group: &str, preset: &str) -> Result<()>;

    /// Block until the given group/preset is fully applied.
    async fn wait_for_config(&self, group: &str, preset: &str) -> Result<()>;

    /// Name of the default channel configuration group.
    async fn channel_group(&self) -> Result<String>;

    /// Whether the facade opens/closes the shutter around each exposure.
    async fn auto_shutter(&self) -> Result<bool>;

    /// Enable or disable automatic shutter handling.
    async fn set_auto_shutter(&self, enabled: bool) -> Result<()>;

    /// Current shutter state.
    async fn shutter_open(&self) -> Result<bool>;

    /// Open or close the shutter.
    async fn set_shutter_open(&self, open: bool) -> Result<()>;

    /// Block until the named device reports idle.
    async fn wait_for_device(&self, device: &str) -> Result<()>;

    // --- motion ---

    /// Command a single-axis device to an absolute position.
    async fn set_position(&self, device: &str, position: f64) -> Result<()>;

    /// Command a two-axis device to an absolute (x, y).
    async fn set_xy_position(&self, device: &str, x: f64, y: f64) -> Result<()>;

    /// Read a single-axis device's current position.
    async fn position(&self, device: &str) -> Result<f64>;

    /// Name of the current focus (z) device.
    async fn focus_device(&self) -> Result<String>;

    /// Name of the current XY stage device.
    async fn xy_stage_device(&self) -> Result<String>;

    /// Name of the current shutter device.
    async fn shutter_device(&self) -> Result<String>;

    /// Name of the active camera device.
    async fn camera_device(&self) -> Result<String>;

    // --- imaging ---

    /// Trigger one exposure and block until readout completes.
    async fn snap_image(&self) -> Result<()>;

    /// Fetch the frame produced by the last [`snap_image`](Self::snap_image).
    async fn image(&self) -> Result<PixelBuffer>;

    /// Start a hardware-buffered acquisition of `count` frames.
    async fn start_sequence_acquisition(&self, count: u32) -> Result<()>;

    /// Stop a running hardware-buffered acquisition.
    async fn stop_sequence_acquisition(&self) -> Result<()>;

    /// Number of buffered frames ready to pop.
    async fn remaining_image_count(&self) -> Result<usize>;

    /// Pop the oldest buffered frame.
    async fn pop_next_image(&self) -> Result<PixelBuffer>;

    /// Frame width in pixels.
    async fn image_width(&self) -> Result<u32>;

    /// Frame height in pixels.
    async fn image_height(&self) -> Result<u32>;

    /// Bytes per pixel of the current camera mode.
    async fn bytes_per_pixel(&self) -> Result<u32>;

    /// Color components per pixel (1 = grayscale, 4 = packed RGB).
    async fn number_of_components(&self) -> Result<u32>;

    /// Calibrated pixel size in micrometers.
    async fn pixel_size_um(&self) -> Result<f64>;

    /// Flat key/value snapshot of the full device configuration state.
    async fn system_state(&self) -> Result<Vec<(String, String)>>;
}

// =============================================================================
// Autofocus Service
// =============================================================================

/// One-shot autofocus capability.
///
/// The engine moves the focus device to the request's resolved z before
/// invoking this, and reads the post-focus position back afterwards.
#[async_trait]
pub trait Autofocus: Send + Sync {
    /// Run one full focus cycle on the current focus device, blocking until
    /// the device settles on a focal plane.
    async fn full_focus(&self) -> Result<()>;
}

// =============================================================================
// Image Sink
// =============================================================================

/// Consumer of finished images.
///
/// The executor publishes exactly one [`TaggedImage`] per non-skipped request
/// that reaches the end of the pipeline. Publishing is memory-pressure
/// guarded upstream (see [`crate::sink`]); implementations may additionally
/// reject or stall on their own capacity limits.
#[async_trait]
pub trait ImageSink: Send + Sync {
    /// Short identifier used in log output.
    fn name(&self) -> &str;

    /// Accept one captured image with its metadata.
    async fn publish(&self, image: TaggedImage) -> Result<()>;
}
