//! Acquisition settings: the declarative description of a run.
//!
//! An [`AcquisitionSettings`] value describes one multidimensional run: which
//! stage positions to visit, how many time points to collect, which optical
//! channels to image, and which focus slices to step through, plus the
//! ordering, timing, shutter and autofocus policies that shape the generated
//! sequence.
//!
//! The settings are immutable input: the planner reads them, the executor
//! never sees them directly. All types serialize with `serde` so a run
//! description can be stored alongside its data.
//!
//! # Axis-in-use semantics
//!
//! An axis with zero configured entries (no positions, `num_frames == 0`, no
//! channels, no slices) is still iterated once during expansion but is marked
//! "not in use": its index 0 triggers no hardware action. This distinguishes
//! "one configured value" from "axis absent".

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

// =============================================================================
// Nesting Order
// =============================================================================

/// Which of channel/slice cycles fastest during expansion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceChannelOrder {
    /// Slices cycle fastest: all slices of a channel, then the next channel.
    SlicesFirst,
    /// Channels cycle fastest: all channels at a slice, then the next slice.
    ChannelsFirst,
}

/// Which of time/position cycles fastest during expansion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimePositionOrder {
    /// Time cycles fastest: the full time series at a position, then move.
    TimeFirst,
    /// Positions cycle fastest: visit every position, then the next frame.
    PositionFirst,
}

// =============================================================================
// Channels
// =============================================================================

/// One optical channel of the acquisition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Configuration group holding the preset; `None` uses the facade's
    /// default channel group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Configuration preset applied for this channel. Also the channel's
    /// display name in image metadata.
    pub preset: String,
    /// Exposure in milliseconds for images of this channel.
    pub exposure_ms: f64,
    /// Focus offset in micrometers added on top of the slice target.
    pub z_offset_um: f64,
    /// Whether this channel is imaged at every slice of a z-stack. A channel
    /// that opts out is imaged only at the middle slice.
    pub do_z_stack: bool,
    /// Frame-skip stride: image this channel only every `skip_frames + 1`-th
    /// time frame.
    pub skip_frames: u32,
}

impl ChannelSpec {
    /// A channel applying `preset` with the given exposure and otherwise
    /// default behavior (default group, no z offset, full z-stack, no skip).
    pub fn new(preset: impl Into<String>, exposure_ms: f64) -> Self {
        Self {
            group: None,
            preset: preset.into(),
            exposure_ms,
            z_offset_um: 0.0,
            do_z_stack: true,
            skip_frames: 0,
        }
    }
}

impl Default for ChannelSpec {
    fn default() -> Self {
        Self::new("", 10.0)
    }
}

// =============================================================================
// Stage Positions
// =============================================================================

/// One device target inside a named position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageTarget {
    /// Absolute target for a single-axis device (focus drives, filter
    /// sliders, rotation stages).
    SingleAxis {
        /// Device name as known to the facade.
        device: String,
        /// Absolute target position.
        position: f64,
    },
    /// Absolute target for a two-axis device (XY stages).
    TwoAxis {
        /// Device name as known to the facade.
        device: String,
        /// Absolute x target.
        x: f64,
        /// Absolute y target.
        y: f64,
    },
}

impl StageTarget {
    /// The device this target addresses.
    pub fn device(&self) -> &str {
        match self {
            StageTarget::SingleAxis { device, .. } => device,
            StageTarget::TwoAxis { device, .. } => device,
        }
    }
}

/// A named set of stage targets visited together ("site A", "well B3").
///
/// A position may command several devices: typically one XY stage plus a
/// focus drive, but any combination of single- and two-axis devices works.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedPosition {
    /// Human-readable label, recorded in image metadata.
    pub label: String,
    /// Device targets applied when this position is visited.
    pub targets: Vec<StageTarget>,
}

impl NamedPosition {
    /// A position with the given label and no targets yet.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            targets: Vec::new(),
        }
    }

    /// Adds a single-axis target.
    pub fn with_single_axis(mut self, device: impl Into<String>, position: f64) -> Self {
        self.targets.push(StageTarget::SingleAxis {
            device: device.into(),
            position,
        });
        self
    }

    /// Adds a two-axis target.
    pub fn with_two_axis(mut self, device: impl Into<String>, x: f64, y: f64) -> Self {
        self.targets.push(StageTarget::TwoAxis {
            device: device.into(),
            x,
            y,
        });
        self
    }

    /// Looks up the target for a device, if this position addresses it.
    pub fn target_for(&self, device: &str) -> Option<&StageTarget> {
        self.targets.iter().find(|t| t.device() == device)
    }

    /// Overwrites the recorded coordinate of a single-axis target. Returns
    /// false when no single-axis target for `device` exists.
    pub fn set_single_axis(&mut self, device: &str, new_position: f64) -> bool {
        for target in &mut self.targets {
            if let StageTarget::SingleAxis {
                device: d,
                position,
            } = target
            {
                if d == device {
                    *position = new_position;
                    return true;
                }
            }
        }
        false
    }
}

/// Shared handle to a position entry, visible to every request that visits
/// it. Autofocus writes the measured focus coordinate back through this
/// handle so later visits to the same position start from the focused plane.
pub type SharedPosition = Arc<RwLock<NamedPosition>>;

// =============================================================================
// Acquisition Settings
// =============================================================================

/// Complete description of one multidimensional acquisition.
///
/// Empty axis lists (and `num_frames == 0`) mean the axis is not in use; see
/// the module docs. Validation happens once at run start via
/// [`validate`](AcquisitionSettings::validate).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Stage positions to visit, in order.
    pub positions: Vec<NamedPosition>,
    /// Number of time frames; 0 means no time series.
    pub num_frames: u32,
    /// Channels to image, in order.
    pub channels: Vec<ChannelSpec>,
    /// Focus slice targets in micrometers, in order. Interpreted relative to
    /// [`z_reference_um`](Self::z_reference_um) when
    /// [`relative_z_slices`](Self::relative_z_slices) is set, absolute
    /// otherwise.
    pub slices_um: Vec<f64>,
    /// Nesting of the channel/slice axis pair.
    pub slice_channel_order: SliceChannelOrder,
    /// Nesting of the time/position axis pair.
    pub time_position_order: TimePositionOrder,
    /// Time-lapse interval in milliseconds between frame starts.
    pub interval_ms: f64,
    /// Run the autofocus service during the acquisition.
    pub use_autofocus: bool,
    /// Autofocus only every `autofocus_skip_frames + 1`-th frame.
    pub autofocus_skip_frames: u32,
    /// Hold the shutter open across channel transitions within one frame and
    /// position.
    pub keep_shutter_open_channels: bool,
    /// Hold the shutter open across slice transitions within one frame and
    /// position.
    pub keep_shutter_open_slices: bool,
    /// Interpret slice targets relative to the z reference instead of as
    /// absolute focus positions.
    pub relative_z_slices: bool,
    /// Baseline focus position in micrometers for relative slices.
    pub z_reference_um: f64,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            positions: Vec::new(),
            num_frames: 0,
            channels: Vec::new(),
            slices_um: Vec::new(),
            slice_channel_order: SliceChannelOrder::SlicesFirst,
            time_position_order: TimePositionOrder::PositionFirst,
            interval_ms: 0.0,
            use_autofocus: false,
            autofocus_skip_frames: 0,
            keep_shutter_open_channels: false,
            keep_shutter_open_slices: false,
            relative_z_slices: true,
            z_reference_um: 0.0,
        }
    }
}

impl AcquisitionSettings {
    /// Checks the settings for values that cannot be executed. Called
    /// once before a run starts; a failure here aborts the run before any
    /// hardware access.
    pub fn validate(&self) -> Result<(), String> {
        if !self.interval_ms.is_finite() || self.interval_ms < 0.0 {
            return Err(format!(
                "time-lapse interval must be finite and non-negative, got {}",
                self.interval_ms
            ));
        }
        if !self.z_reference_um.is_finite() {
            return Err("z reference must be finite".to_string());
        }
        for (i, z) in self.slices_um.iter().enumerate() {
            if !z.is_finite() {
                return Err(format!("slice {i} has a non-finite z target"));
            }
        }
        for (i, ch) in self.channels.iter().enumerate() {
            if ch.preset.is_empty() {
                return Err(format!("channel {i} has an empty preset name"));
            }
            if !ch.exposure_ms.is_finite() || ch.exposure_ms <= 0.0 {
                return Err(format!(
                    "channel '{}' has invalid exposure {} ms",
                    ch.preset, ch.exposure_ms
                ));
            }
            if !ch.z_offset_um.is_finite() {
                return Err(format!("channel '{}' has a non-finite z offset", ch.preset));
            }
        }
        for (i, pos) in self.positions.iter().enumerate() {
            for target in &pos.targets {
                if target.device().is_empty() {
                    return Err(format!(
                        "position {i} ('{}') has a target with an empty device name",
                        pos.label
                    ));
                }
                let finite = match target {
                    StageTarget::SingleAxis { position, .. } => position.is_finite(),
                    StageTarget::TwoAxis { x, y, .. } => x.is_finite() && y.is_finite(),
                };
                if !finite {
                    return Err(format!(
                        "position {i} ('{}') has a non-finite target for device '{}'",
                        pos.label,
                        target.device()
                    ));
                }
            }
        }
        Ok(())
    }

    /// Number of iterations per axis during expansion: `max(1, configured)`.
    pub(crate) fn axis_sizes(&self) -> AxisSizes {
        AxisSizes {
            positions: self.positions.len().max(1),
            frames: (self.num_frames as usize).max(1),
            channels: self.channels.len().max(1),
            slices: self.slices_um.len().max(1),
        }
    }
}

/// Expansion sizes of the four axes, each at least 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AxisSizes {
    pub positions: usize,
    pub frames: usize,
    pub channels: usize,
    pub slices: usize,
}

impl AxisSizes {
    /// Total flattened image count.
    pub fn total(&self) -> usize {
        self.positions * self.frames * self.channels * self.slices
    }
}
