//! The acquisition engine: planning, execution and run control.
//!
//! # Architecture Overview
//!
//! A run is two cooperating tasks joined by a bounded queue:
//!
//! - the **planner** ([`SequencePlanner`]) expands the acquisition settings
//!   into a deterministic stream of [`ImageRequest`]s and terminates it with
//!   a sentinel;
//! - the **executor** pops requests one at a time and drives each through the
//!   six-stage hardware pipeline ([`ImageTask`]), publishing finished images
//!   to the sink.
//!
//! # Data Flow
//!
//! ```text
//!                    bounded mpsc
//! SequencePlanner --[SequenceItem]--> executor loop --> ImageTask --> ImageSink
//!      |                                                   |
//!   settings                                         DeviceControl
//! ```
//!
//! # Thread Safety
//!
//! The hardware facade is only ever called from the executor task, one
//! operation at a time. Stop and pause travel on `watch` channels owned by
//! the [`RunHandle`]; the planner observes stop between sends, the executor
//! between stages. One engine accepts one run at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::{Autofocus, DeviceControl, ImageSink};
use crate::error::{EngineError, EngineResult};
use crate::settings::AcquisitionSettings;
use crate::sink::{MemoryProbe, PublishGuard, SystemMemoryProbe};

pub mod pacing;
pub mod planner;
pub mod request;
pub mod task;

pub use pacing::{PacingClock, WaitPlan};
pub use planner::SequencePlanner;
pub use request::{ImageRequest, SequenceItem};
pub use task::{ExecContext, ImageTask, TaskOutcome};

// =============================================================================
// Engine Configuration
// =============================================================================

/// Tuning knobs of the acquisition engine.
///
/// All fields have working defaults; deserialization fills missing fields
/// from them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of the request queue between planner and executor.
    pub queue_capacity: usize,
    /// Poll period while waiting for a hardware-buffered frame.
    #[serde(with = "humantime_serde")]
    pub burst_poll_interval: Duration,
    /// Available-memory floor below which publication stalls.
    pub low_memory_floor_bytes: u64,
    /// Number of stalls tolerated before publishing regardless.
    pub publish_max_stalls: u32,
    /// Delay between publication stall checks.
    #[serde(with = "humantime_serde")]
    pub publish_stall_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            burst_poll_interval: Duration::from_millis(5),
            low_memory_floor_bytes: 32 * 1024 * 1024,
            publish_max_stalls: 50,
            publish_stall_backoff: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    pub(crate) fn publish_guard(&self) -> PublishGuard {
        PublishGuard {
            low_memory_floor_bytes: self.low_memory_floor_bytes,
            max_stalls: self.publish_max_stalls,
            stall_backoff: self.publish_stall_backoff,
        }
    }
}

// =============================================================================
// Run Results
// =============================================================================

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// The full planned sequence was executed.
    Completed,
    /// A stop request ended the run before the sequence finished.
    Stopped,
}

/// Final accounting of one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Images actually handed to the sink.
    pub images_published: u64,
    /// Whether the sequence ran to completion.
    pub status: RunStatus,
}

// =============================================================================
// Run Handle
// =============================================================================

/// Control surface of a running acquisition.
///
/// Stop is one-way and takes effect at the next stage boundary (or wakes the
/// frame wait / pause gate). Pause gates image capture only: motion,
/// configuration and the frame wait still run, the exposure does not start.
/// Dropping the handle detaches the run; it finishes on its own.
pub struct RunHandle {
    stop_tx: watch::Sender<bool>,
    pause_tx: watch::Sender<bool>,
    producer: JoinHandle<()>,
    executor: JoinHandle<RunSummary>,
}

impl RunHandle {
    /// Requests the run to stop at the next opportunity.
    pub fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Whether a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Holds the next image capture until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.pause_tx.send_replace(true);
    }

    /// Releases a pause.
    pub fn resume(&self) {
        self.pause_tx.send_replace(false);
    }

    /// Whether capture is currently gated.
    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Waits for the run to finish and returns its summary.
    ///
    /// # Errors
    ///
    /// [`EngineError::TaskFailed`] when the planner or executor task panicked
    /// or was cancelled by the runtime.
    pub async fn wait(self) -> EngineResult<RunSummary> {
        let summary = self
            .executor
            .await
            .map_err(|err| EngineError::TaskFailed(err.to_string()))?;
        self.producer
            .await
            .map_err(|err| EngineError::TaskFailed(err.to_string()))?;
        Ok(summary)
    }
}

// =============================================================================
// Acquisition Engine
// =============================================================================

/// Entry point: owns the hardware facade, sink and optional autofocus, and
/// launches runs.
pub struct AcquisitionEngine {
    core: Arc<dyn DeviceControl>,
    autofocus: Option<Arc<dyn Autofocus>>,
    sink: Arc<dyn ImageSink>,
    memory: Arc<dyn MemoryProbe>,
    config: EngineConfig,
    running: Arc<AtomicBool>,
}

impl AcquisitionEngine {
    /// An engine over the given facade, publishing to `sink`, with default
    /// configuration and the system memory probe.
    pub fn new(core: Arc<dyn DeviceControl>, sink: Arc<dyn ImageSink>) -> Self {
        Self {
            core,
            autofocus: None,
            sink,
            memory: Arc::new(SystemMemoryProbe::new()),
            config: EngineConfig::default(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attaches an autofocus service; required for plans with autofocus.
    #[must_use]
    pub fn with_autofocus(mut self, autofocus: Arc<dyn Autofocus>) -> Self {
        self.autofocus = Some(autofocus);
        self
    }

    /// Replaces the default configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the memory probe guarding publication.
    #[must_use]
    pub fn with_memory_probe(mut self, memory: Arc<dyn MemoryProbe>) -> Self {
        self.memory = memory;
        self
    }

    /// Whether a run is currently active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Validates the settings and launches a run.
    ///
    /// Captures the auto-shutter selection and the baseline exposure, then
    /// spawns the planner and executor tasks. The returned [`RunHandle`]
    /// controls and joins the run.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Settings`] when validation rejects the settings
    /// - [`EngineError::AutofocusUnavailable`] when the plan wants autofocus
    ///   but none is attached
    /// - [`EngineError::AlreadyRunning`] while a previous run is active
    /// - [`EngineError::Hardware`] when reading the pre-run state fails
    pub async fn start(&self, settings: AcquisitionSettings) -> EngineResult<RunHandle> {
        settings.validate().map_err(EngineError::Settings)?;
        if settings.use_autofocus && self.autofocus.is_none() {
            return Err(EngineError::AutofocusUnavailable);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }
        match self.launch(settings).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    async fn launch(&self, settings: AcquisitionSettings) -> EngineResult<RunHandle> {
        let baseline_exposure_ms = self.core.exposure().await?;
        let auto_shutter_selected = self.core.auto_shutter().await?;

        let planner = SequencePlanner::new(settings, baseline_exposure_ms);
        info!(
            images = planner.total_images(),
            burst = planner.is_burst(),
            sink = self.sink.name(),
            "starting acquisition"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let (pause_tx, pause_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity.max(1));

        // Fresh pacing state per run: the first timed request establishes the
        // schedule baseline.
        let ctx = Arc::new(ExecContext {
            core: Arc::clone(&self.core),
            autofocus: self.autofocus.clone(),
            sink: Arc::clone(&self.sink),
            memory: Arc::clone(&self.memory),
            config: self.config.clone(),
            pacing: PacingClock::new(),
            started_at: Instant::now(),
            auto_shutter_selected,
        });

        let producer = tokio::spawn(planner.produce(queue_tx, stop_rx.clone()));
        let executor = tokio::spawn(run_tasks(
            ctx,
            queue_rx,
            stop_rx,
            pause_rx,
            Arc::clone(&self.running),
        ));

        Ok(RunHandle {
            stop_tx,
            pause_tx,
            producer,
            executor,
        })
    }
}

/// Executor loop: one request at a time until the sentinel, a stop, or a
/// closed queue; then best-effort hardware cleanup.
async fn run_tasks(
    ctx: Arc<ExecContext>,
    mut queue_rx: mpsc::Receiver<SequenceItem>,
    stop_rx: watch::Receiver<bool>,
    pause_rx: watch::Receiver<bool>,
    running: Arc<AtomicBool>,
) -> RunSummary {
    let mut published = 0u64;
    let mut stopped = false;
    let mut burst_started = false;
    loop {
        let Some(item) = queue_rx.recv().await else {
            warn!("request queue closed without a sentinel");
            break;
        };
        let request = match item {
            SequenceItem::Sentinel => {
                debug!("sequence complete");
                break;
            }
            SequenceItem::Image(request) => request,
        };
        if *stop_rx.borrow() {
            stopped = true;
            break;
        }
        burst_started |= request.start_burst > 0;
        let task = ImageTask::new(request, Arc::clone(&ctx), stop_rx.clone(), pause_rx.clone());
        match task.run().await {
            TaskOutcome::Published => published += 1,
            TaskOutcome::Failed => {}
            TaskOutcome::Stopped => {
                stopped = true;
                break;
            }
        }
    }
    stopped |= *stop_rx.borrow();
    // Unblock the planner if it is still waiting on a full queue.
    drop(queue_rx);
    finish_run(ctx.as_ref(), burst_started).await;
    running.store(false, Ordering::SeqCst);
    let status = if stopped {
        RunStatus::Stopped
    } else {
        RunStatus::Completed
    };
    info!(published, ?status, "acquisition finished");
    RunSummary {
        images_published: published,
        status,
    }
}

/// Leaves the hardware the way interactive use expects it: no buffered
/// acquisition running, shutter closed, auto-shutter selection restored.
/// Failures here are logged, never returned.
async fn finish_run(ctx: &ExecContext, burst_started: bool) {
    let core = ctx.core.as_ref();
    if burst_started {
        if let Err(err) = core.stop_sequence_acquisition().await {
            warn!(error = %err, "could not stop the buffered acquisition");
        }
    }
    if ctx.auto_shutter_selected {
        match core.shutter_open().await {
            Ok(true) => {
                if let Err(err) = core.set_shutter_open(false).await {
                    warn!(error = %err, "could not close the shutter");
                }
            }
            Ok(false) => {}
            Err(err) => warn!(error = %err, "could not read the shutter state"),
        }
        if let Err(err) = core.set_auto_shutter(true).await {
            warn!(error = %err, "could not restore auto-shutter");
        }
    }
}
