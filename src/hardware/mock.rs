//! Simulated microscope hardware for tests and demos.
//!
//! All simulated devices use async-safe operations (tokio::time::sleep, not
//! std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `SimulatedCore` - full device facade over in-memory state
//! - `SimulatedAutofocus` - focus service applying a configurable correction
//!
//! # Behavior
//!
//! - commands take a small simulated latency (1 ms by default) and are
//!   recorded in a call journal; pure reads are instant and unrecorded
//! - any facade method can be primed to fail exactly once by name, which is
//!   how the test suites exercise per-stage error recovery
//! - sequence acquisition makes all frames available immediately

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;
use tokio::time;

use crate::core::{Autofocus, DeviceControl, PixelBuffer};

/// Device names the simulated microscope registers.
pub mod devices {
    /// Single-axis focus drive.
    pub const FOCUS: &str = "Z";
    /// Two-axis stage.
    pub const XY_STAGE: &str = "XY";
    /// The shutter.
    pub const SHUTTER: &str = "Shutter";
    /// The camera.
    pub const CAMERA: &str = "Cam";
}

const FRAME_WIDTH: u32 = 32;
const FRAME_HEIGHT: u32 = 24;
const BYTES_PER_PIXEL: u32 = 2;
const COMPONENTS: u32 = 1;
const PIXEL_SIZE_UM: f64 = 0.16;

fn simulated_frame() -> PixelBuffer {
    let mut rng = rand::thread_rng();
    let pixels = (0..(FRAME_WIDTH * FRAME_HEIGHT) as usize)
        .map(|_| rng.gen_range(0..4096u16))
        .collect();
    PixelBuffer::U16(pixels)
}

#[derive(Debug)]
struct CoreState {
    exposure_ms: f64,
    /// Active preset per configuration group.
    config: HashMap<String, String>,
    auto_shutter: bool,
    shutter_open: bool,
    positions: HashMap<String, f64>,
    xy_positions: HashMap<String, (f64, f64)>,
    /// Frames sitting in the sequence buffer.
    buffered: u32,
    sequence_running: bool,
    snapped: Option<PixelBuffer>,
}

impl Default for CoreState {
    fn default() -> Self {
        Self {
            exposure_ms: 10.0,
            config: HashMap::new(),
            auto_shutter: true,
            shutter_open: false,
            positions: HashMap::new(),
            xy_positions: HashMap::new(),
            buffered: 0,
            sequence_running: false,
            snapped: None,
        }
    }
}

// =============================================================================
// SimulatedCore - Device Facade
// =============================================================================

/// In-memory [`DeviceControl`] implementation.
///
/// # Example
///
/// ```rust,ignore
/// let core = Arc::new(SimulatedCore::new());
/// core.set_position("Z", 5.0).await?;
/// assert_eq!(core.position("Z").await?, 5.0);
/// assert_eq!(core.recorded_calls().await, vec!["set_position(Z, 5)"]);
/// ```
pub struct SimulatedCore {
    state: RwLock<CoreState>,
    journal: RwLock<Vec<String>>,
    /// Method names primed to fail exactly once.
    failures: RwLock<HashSet<String>>,
    latency: Duration,
}

impl Default for SimulatedCore {
    fn default() -> Self {
        Self::with_latency(Duration::from_millis(1))
    }
}

impl SimulatedCore {
    /// A core with the default 1 ms command latency.
    pub fn new() -> Self {
        Self::default()
    }

    /// A core with a custom per-command latency.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            state: RwLock::new(CoreState::default()),
            journal: RwLock::new(Vec::new()),
            failures: RwLock::new(HashSet::new()),
            latency,
        }
    }

    /// Every mutating command and wait issued so far, in order. Pure reads
    /// are not recorded.
    pub async fn recorded_calls(&self) -> Vec<String> {
        self.journal.read().await.clone()
    }

    /// Primes `method` (the facade method name, e.g. `"snap_image"`) to fail
    /// on its next invocation.
    pub async fn fail_next(&self, method: &str) {
        self.failures.write().await.insert(method.to_string());
    }

    /// Presets a single-axis device position without journaling.
    pub async fn set_current_position(&self, device: &str, value: f64) {
        self.state
            .write()
            .await
            .positions
            .insert(device.to_string(), value);
    }

    /// Active preset of a configuration group, if one was applied.
    pub async fn active_preset(&self, group: &str) -> Option<String> {
        self.state.read().await.config.get(group).cloned()
    }

    /// Whether a sequence acquisition is active.
    pub async fn sequence_running(&self) -> bool {
        self.state.read().await.sequence_running
    }

    async fn check_failure(&self, method: &str) -> Result<()> {
        if self.failures.write().await.remove(method) {
            bail!("simulated {method} failure");
        }
        Ok(())
    }

    async fn command(&self, method: &str, entry: String) -> Result<()> {
        self.check_failure(method).await?;
        time::sleep(self.latency).await;
        self.journal.write().await.push(entry);
        Ok(())
    }
}

#[async_trait]
impl DeviceControl for SimulatedCore {
    async fn set_exposure(&self, ms: f64) -> Result<()> {
        self.command("set_exposure", format!("set_exposure({ms})"))
            .await?;
        self.state.write().await.exposure_ms = ms;
        Ok(())
    }

    async fn exposure(&self) -> Result<f64> {
        self.check_failure("exposure").await?;
        Ok(self.state.read().await.exposure_ms)
    }

    async fn set_config(&self, group: &str, preset: &str) -> Result<()> {
        self.command("set_config", format!("set_config({group}, {preset})"))
            .await?;
        self.state
            .write()
            .await
            .config
            .insert(group.to_string(), preset.to_string());
        Ok(())
    }

    async fn wait_for_config(&self, group: &str, preset: &str) -> Result<()> {
        self.command(
            "wait_for_config",
            format!("wait_for_config({group}, {preset})"),
        )
        .await
    }

    async fn channel_group(&self) -> Result<String> {
        self.check_failure("channel_group").await?;
        Ok("Channel".to_string())
    }

    async fn auto_shutter(&self) -> Result<bool> {
        self.check_failure("auto_shutter").await?;
        Ok(self.state.read().await.auto_shutter)
    }

    async fn set_auto_shutter(&self, enabled: bool) -> Result<()> {
        self.command("set_auto_shutter", format!("set_auto_shutter({enabled})"))
            .await?;
        self.state.write().await.auto_shutter = enabled;
        Ok(())
    }

    async fn shutter_open(&self) -> Result<bool> {
        self.check_failure("shutter_open").await?;
        Ok(self.state.read().await.shutter_open)
    }

    async fn set_shutter_open(&self, open: bool) -> Result<()> {
        self.command("set_shutter_open", format!("set_shutter_open({open})"))
            .await?;
        self.state.write().await.shutter_open = open;
        Ok(())
    }

    async fn wait_for_device(&self, device: &str) -> Result<()> {
        self.command("wait_for_device", format!("wait_for_device({device})"))
            .await
    }

    async fn set_position(&self, device: &str, position: f64) -> Result<()> {
        self.command(
            "set_position",
            format!("set_position({device}, {position})"),
        )
        .await?;
        self.state
            .write()
            .await
            .positions
            .insert(device.to_string(), position);
        Ok(())
    }

    async fn set_xy_position(&self, device: &str, x: f64, y: f64) -> Result<()> {
        self.command(
            "set_xy_position",
            format!("set_xy_position({device}, {x}, {y})"),
        )
        .await?;
        self.state
            .write()
            .await
            .xy_positions
            .insert(device.to_string(), (x, y));
        Ok(())
    }

    async fn position(&self, device: &str) -> Result<f64> {
        self.check_failure("position").await?;
        Ok(*self.state.read().await.positions.get(device).unwrap_or(&0.0))
    }

    async fn focus_device(&self) -> Result<String> {
        self.check_failure("focus_device").await?;
        Ok(devices::FOCUS.to_string())
    }

    async fn xy_stage_device(&self) -> Result<String> {
        self.check_failure("xy_stage_device").await?;
        Ok(devices::XY_STAGE.to_string())
    }

    async fn shutter_device(&self) -> Result<String> {
        self.check_failure("shutter_device").await?;
        Ok(devices::SHUTTER.to_string())
    }

    async fn camera_device(&self) -> Result<String> {
        self.check_failure("camera_device").await?;
        Ok(devices::CAMERA.to_string())
    }

    async fn snap_image(&self) -> Result<()> {
        self.command("snap_image", "snap_image".to_string()).await?;
        let frame = simulated_frame();
        self.state.write().await.snapped = Some(frame);
        Ok(())
    }

    async fn image(&self) -> Result<PixelBuffer> {
        self.check_failure("image").await?;
        match self.state.read().await.snapped.clone() {
            Some(frame) => Ok(frame),
            None => bail!("no image has been snapped"),
        }
    }

    async fn start_sequence_acquisition(&self, count: u32) -> Result<()> {
        self.command(
            "start_sequence_acquisition",
            format!("start_sequence_acquisition({count})"),
        )
        .await?;
        let mut state = self.state.write().await;
        state.buffered = count;
        state.sequence_running = true;
        Ok(())
    }

    async fn stop_sequence_acquisition(&self) -> Result<()> {
        self.command(
            "stop_sequence_acquisition",
            "stop_sequence_acquisition".to_string(),
        )
        .await?;
        self.state.write().await.sequence_running = false;
        Ok(())
    }

    async fn remaining_image_count(&self) -> Result<usize> {
        self.check_failure("remaining_image_count").await?;
        Ok(self.state.read().await.buffered as usize)
    }

    async fn pop_next_image(&self) -> Result<PixelBuffer> {
        self.command("pop_next_image", "pop_next_image".to_string())
            .await?;
        let mut state = self.state.write().await;
        if state.buffered == 0 {
            bail!("sequence buffer is empty");
        }
        state.buffered -= 1;
        if state.buffered == 0 {
            state.sequence_running = false;
        }
        Ok(simulated_frame())
    }

    async fn image_width(&self) -> Result<u32> {
        self.check_failure("image_width").await?;
        Ok(FRAME_WIDTH)
    }

    async fn image_height(&self) -> Result<u32> {
        self.check_failure("image_height").await?;
        Ok(FRAME_HEIGHT)
    }

    async fn bytes_per_pixel(&self) -> Result<u32> {
        self.check_failure("bytes_per_pixel").await?;
        Ok(BYTES_PER_PIXEL)
    }

    async fn number_of_components(&self) -> Result<u32> {
        self.check_failure("number_of_components").await?;
        Ok(COMPONENTS)
    }

    async fn pixel_size_um(&self) -> Result<f64> {
        self.check_failure("pixel_size_um").await?;
        Ok(PIXEL_SIZE_UM)
    }

    async fn system_state(&self) -> Result<Vec<(String, String)>> {
        self.check_failure("system_state").await?;
        let state = self.state.read().await;
        Ok(vec![
            (
                "Core-AutoShutter".to_string(),
                if state.auto_shutter { "1" } else { "0" }.to_string(),
            ),
            ("Core-Focus".to_string(), devices::FOCUS.to_string()),
            ("Cam-Binning".to_string(), "1".to_string()),
        ])
    }
}

// =============================================================================
// SimulatedAutofocus - Focus Service
// =============================================================================

/// Autofocus that nudges the simulated focus drive by a fixed offset,
/// standing in for a measured correction.
///
/// # Example
///
/// ```rust,ignore
/// let core = Arc::new(SimulatedCore::new());
/// let af = SimulatedAutofocus::with_shift(Arc::clone(&core), 2.5);
/// af.full_focus().await?; // focus drive moves by +2.5 um
/// ```
pub struct SimulatedAutofocus {
    core: Arc<SimulatedCore>,
    shift_um: f64,
    fail_next: RwLock<bool>,
    calls: RwLock<u32>,
}

impl SimulatedAutofocus {
    /// A focus service that finds the current position already in focus.
    pub fn new(core: Arc<SimulatedCore>) -> Self {
        Self::with_shift(core, 0.0)
    }

    /// A focus service that corrects the focus drive by `shift_um` each run.
    pub fn with_shift(core: Arc<SimulatedCore>, shift_um: f64) -> Self {
        Self {
            core,
            shift_um,
            fail_next: RwLock::new(false),
            calls: RwLock::new(0),
        }
    }

    /// Primes the next focus run to fail.
    pub async fn fail_next(&self) {
        *self.fail_next.write().await = true;
    }

    /// Number of focus runs performed.
    pub async fn call_count(&self) -> u32 {
        *self.calls.read().await
    }
}

#[async_trait]
impl Autofocus for SimulatedAutofocus {
    async fn full_focus(&self) -> Result<()> {
        *self.calls.write().await += 1;
        if std::mem::take(&mut *self.fail_next.write().await) {
            bail!("simulated autofocus failure");
        }
        let focus = self.core.focus_device().await?;
        let current = self.core.position(&focus).await?;
        self.core
            .set_position(&focus, current + self.shift_um)
            .await?;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exposure_roundtrip() {
        let core = SimulatedCore::new();
        assert_eq!(core.exposure().await.unwrap(), 10.0);

        core.set_exposure(25.0).await.unwrap();
        assert_eq!(core.exposure().await.unwrap(), 25.0);
    }

    #[tokio::test]
    async fn test_commands_are_journaled_reads_are_not() {
        let core = SimulatedCore::new();
        let _ = core.exposure().await;
        let _ = core.focus_device().await;
        assert!(core.recorded_calls().await.is_empty());

        core.set_position("Z", 5.0).await.unwrap();
        core.wait_for_device("Z").await.unwrap();
        assert_eq!(
            core.recorded_calls().await,
            vec!["set_position(Z, 5)", "wait_for_device(Z)"]
        );
    }

    #[tokio::test]
    async fn test_config_presets_are_tracked() {
        let core = SimulatedCore::new();
        core.set_config("Channel", "DAPI").await.unwrap();
        core.wait_for_config("Channel", "DAPI").await.unwrap();

        assert_eq!(core.active_preset("Channel").await.as_deref(), Some("DAPI"));
        assert_eq!(core.active_preset("Objective").await, None);
    }

    #[tokio::test]
    async fn test_fail_next_fires_exactly_once() {
        let core = SimulatedCore::new();
        core.fail_next("snap_image").await;
        assert!(core.snap_image().await.is_err());

        // The next call succeeds again.
        core.snap_image().await.unwrap();
        assert!(core.image().await.is_ok());
    }

    #[tokio::test]
    async fn test_image_requires_a_snap() {
        let core = SimulatedCore::new();
        assert!(core.image().await.is_err());

        core.snap_image().await.unwrap();
        let frame = core.image().await.unwrap();
        assert_eq!(frame.len(), (FRAME_WIDTH * FRAME_HEIGHT) as usize);
        assert_eq!(frame.bit_depth(), 16);
    }

    #[tokio::test]
    async fn test_sequence_buffer_lifecycle() {
        let core = SimulatedCore::new();
        core.start_sequence_acquisition(3).await.unwrap();
        assert!(core.sequence_running().await);
        assert_eq!(core.remaining_image_count().await.unwrap(), 3);

        for _ in 0..3 {
            core.pop_next_image().await.unwrap();
        }
        assert_eq!(core.remaining_image_count().await.unwrap(), 0);
        assert!(!core.sequence_running().await);
        assert!(core.pop_next_image().await.is_err());
    }

    #[tokio::test]
    async fn test_autofocus_applies_shift() {
        let core = Arc::new(SimulatedCore::new());
        core.set_current_position(devices::FOCUS, 10.0).await;
        let autofocus = SimulatedAutofocus::with_shift(Arc::clone(&core), 2.5);

        autofocus.full_focus().await.unwrap();
        assert_eq!(core.position(devices::FOCUS).await.unwrap(), 12.5);
        assert_eq!(autofocus.call_count().await, 1);
    }

    #[tokio::test]
    async fn test_autofocus_failure_injection() {
        let core = Arc::new(SimulatedCore::new());
        let autofocus = SimulatedAutofocus::new(Arc::clone(&core));
        autofocus.fail_next().await;
        assert!(autofocus.full_focus().await.is_err());
        assert!(autofocus.full_focus().await.is_ok());
        assert_eq!(autofocus.call_count().await, 2);
    }
}
