//! Image metadata tags and handling.
//!
//! Every captured image leaves the pipeline with a flat string-keyed tag map,
//! [`ImageTags`]. A flat map (rather than a typed struct) keeps the sink
//! boundary forward-compatible: downstream storage and display consumers can
//! carry arbitrary additional tags without schema changes, and a full device
//! state snapshot can be merged in alongside the well-known keys.
//!
//! ## Well-known keys
//!
//! The pipeline writes the keys in [`keys`]: dimension indices (`Frame`,
//! `Slice`, `ChannelIndex`, `PositionIndex`), resolved hardware values
//! (`Exposure-ms`, `PixelSizeUm`, `ZPositionUm`, `Image-PixelType`, `Width`,
//! `Height`), run bookkeeping (`ElapsedTime-ms`, `NextFrameTimeMs`, `UUID`,
//! `Time`, `Source`), and status annotations written by individual pipeline
//! stages (`AutofocusResult`, `Acquisition-TimingState`). Stage 2 records
//! each commanded stage move under a per-device key built by
//! [`requested_z_key`], [`requested_x_key`] and [`requested_y_key`].
//!
//! Values are stored as display strings; numeric tags use Rust's default
//! formatting.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Well-known tag keys written by the acquisition pipeline.
pub mod keys {
    /// Time frame index.
    pub const FRAME: &str = "Frame";
    /// Slice index within the z-stack.
    pub const SLICE: &str = "Slice";
    /// Channel index within the channel list.
    pub const CHANNEL_INDEX: &str = "ChannelIndex";
    /// Position index within the position list.
    pub const POSITION_INDEX: &str = "PositionIndex";
    /// Channel preset name.
    pub const CHANNEL: &str = "Channel";
    /// Label of the visited stage position.
    pub const POSITION_NAME: &str = "PositionName";
    /// Requested slice z from the slice list (offset or absolute).
    pub const SLICE_POSITION: &str = "SlicePosition";
    /// Resolved exposure in milliseconds.
    pub const EXPOSURE_MS: &str = "Exposure-ms";
    /// Calibrated pixel size in micrometers.
    pub const PIXEL_SIZE_UM: &str = "PixelSizeUm";
    /// Measured focus position at capture time; empty if the read failed.
    pub const Z_POSITION_UM: &str = "ZPositionUm";
    /// Pixel format label, e.g. `GRAY16` or `RGB32`.
    pub const PIXEL_TYPE: &str = "Image-PixelType";
    /// Frame width in pixels.
    pub const WIDTH: &str = "Width";
    /// Frame height in pixels.
    pub const HEIGHT: &str = "Height";
    /// Milliseconds since the acquisition started.
    pub const ELAPSED_TIME_MS: &str = "ElapsedTime-ms";
    /// Timing annotation; set to [`LAGGING`](super::LAGGING) when the
    /// interval deadline had already passed.
    pub const TIMING_STATE: &str = "Acquisition-TimingState";
    /// Autofocus outcome: `Success` or `Failure`.
    pub const AUTOFOCUS_RESULT: &str = "AutofocusResult";
    /// Camera device that produced the frame.
    pub const SOURCE: &str = "Source";
    /// Scheduled start of the next frame, milliseconds since acquisition
    /// start.
    pub const NEXT_FRAME_TIME_MS: &str = "NextFrameTimeMs";
    /// Fresh unique id of this image.
    pub const UUID: &str = "UUID";
    /// Wall-clock capture time.
    pub const TIME: &str = "Time";
}

/// Timing-state value written when an interval deadline was missed.
pub const LAGGING: &str = "Lagging";

/// Wall-clock format of the [`keys::TIME`] tag.
pub const TIME_FORMAT: &str = "%Y-%m-%d %a %H:%M:%S %z";

/// Flat string-keyed metadata attached to one image.
///
/// Keys iterate in sorted order, so serialized tag maps are stable across
/// runs with identical content.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageTags {
    tags: BTreeMap<String, String>,
}

impl ImageTags {
    /// An empty tag map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a tag, overwriting any previous value. Numeric values use their
    /// display formatting.
    pub fn put(&mut self, key: impl Into<String>, value: impl ToString) {
        self.tags.insert(key.into(), value.to_string());
    }

    /// Reads a tag value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Whether a tag is present.
    pub fn contains(&self, key: &str) -> bool {
        self.tags.contains_key(key)
    }

    /// Number of tags.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Iterates tags in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merges a batch of key/value pairs, such as a device state snapshot.
    /// Existing keys are overwritten.
    pub fn merge_pairs<I, K, V>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in pairs {
            self.tags.insert(k.into(), v.into());
        }
    }
}

/// Key recording the commanded single-axis move of `device` (stage 2).
pub fn requested_z_key(device: &str) -> String {
    format!("Acquisition-{device}RequestedZPosition")
}

/// Key recording the commanded x coordinate of `device` (stage 2).
pub fn requested_x_key(device: &str) -> String {
    format!("Acquisition-{device}RequestedXPosition")
}

/// Key recording the commanded y coordinate of `device` (stage 2).
pub fn requested_y_key(device: &str) -> String {
    format!("Acquisition-{device}RequestedYPosition")
}

/// Builds the `Image-PixelType` label from component count and bit depth:
/// one component is grayscale (`GRAY8`, `GRAY16`), four is packed color
/// (`RGB32`). Unknown component counts yield the bare bit depth.
pub fn pixel_type_label(components: u32, bits: u32) -> String {
    let base = match components {
        1 => "GRAY",
        4 => "RGB",
        _ => "",
    };
    format!("{base}{bits}")
}

/// Fresh unique id for one captured image.
pub fn new_image_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Wall-clock capture timestamp in [`TIME_FORMAT`].
pub fn capture_timestamp() -> String {
    Local::now().format(TIME_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let mut tags = ImageTags::new();
        tags.put(keys::FRAME, 3usize);
        tags.put(keys::CHANNEL, "DAPI");
        tags.put(keys::EXPOSURE_MS, 12.5f64);
        assert_eq!(tags.get(keys::FRAME), Some("3"));
        assert_eq!(tags.get(keys::CHANNEL), Some("DAPI"));
        assert_eq!(tags.get(keys::EXPOSURE_MS), Some("12.5"));
        assert!(tags.get(keys::SLICE).is_none());
        assert_eq!(tags.len(), 3);
    }

    #[test]
    fn test_merge_pairs_overwrites() {
        let mut tags = ImageTags::new();
        tags.put("Core-Shutter", "closed");
        tags.merge_pairs(vec![
            ("Core-Shutter".to_string(), "open".to_string()),
            ("Camera-Gain".to_string(), "2".to_string()),
        ]);
        assert_eq!(tags.get("Core-Shutter"), Some("open"));
        assert_eq!(tags.get("Camera-Gain"), Some("2"));
    }

    #[test]
    fn test_pixel_type_labels() {
        assert_eq!(pixel_type_label(1, 8), "GRAY8");
        assert_eq!(pixel_type_label(1, 16), "GRAY16");
        assert_eq!(pixel_type_label(4, 32), "RGB32");
        assert_eq!(pixel_type_label(3, 24), "24");
    }

    #[test]
    fn test_requested_move_keys() {
        assert_eq!(requested_z_key("Z"), "Acquisition-ZRequestedZPosition");
        assert_eq!(requested_x_key("XY"), "Acquisition-XYRequestedXPosition");
        assert_eq!(requested_y_key("XY"), "Acquisition-XYRequestedYPosition");
    }

    #[test]
    fn test_capture_timestamp_parses_back() {
        let stamp = capture_timestamp();
        assert!(chrono::DateTime::parse_from_str(&stamp, TIME_FORMAT).is_ok());
    }

    #[test]
    fn test_serde_is_flat_map() {
        let mut tags = ImageTags::new();
        tags.put(keys::WIDTH, 512u32);
        let json = serde_json::to_string(&tags).unwrap();
        assert_eq!(json, r#"{"Width":"512"}"#);
        let back: ImageTags = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tags);
    }

    #[test]
    fn test_image_uid_unique() {
        assert_ne!(new_image_uid(), new_image_uid());
    }
}
