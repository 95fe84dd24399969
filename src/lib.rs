//! Multidimensional acquisition sequencing engine for automated microscopy.
//!
//! This library expands a declarative acquisition plan (positions, time
//! points, channels, focal slices) into an ordered stream of image requests
//! and executes each request against the microscope hardware through an
//! async task pipeline.
//!
//! # Architecture
//!
//! - [`settings`] - the acquisition plan types and axis-ordering enums
//! - [`engine`] - the sequence planner, the per-image task pipeline, and the
//!   [`AcquisitionEngine`] that wires them together over a bounded queue
//! - [`core`] - hardware abstraction traits ([`DeviceControl`], [`Autofocus`],
//!   [`ImageSink`]) and the image types that cross them
//! - [`metadata`] - tag maps attached to every published image
//! - [`sink`] - in-memory and channel-backed image sinks plus memory probes
//! - [`hardware`] - simulated devices for tests and demos
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mda_engine::hardware::{SimulatedAutofocus, SimulatedCore};
//! use mda_engine::sink::BufferSink;
//! use mda_engine::{AcquisitionEngine, AcquisitionSettings, ChannelSpec};
//!
//! let core = Arc::new(SimulatedCore::new());
//! let sink = BufferSink::new();
//!
//! let mut settings = AcquisitionSettings::default();
//! settings.num_frames = 3;
//! settings.channels.push(ChannelSpec::new("DAPI", 20.0));
//!
//! let engine = AcquisitionEngine::new(core, Arc::new(sink.clone()));
//! let handle = engine.start(settings).await?;
//! let summary = handle.wait().await?;
//! println!("published {} images", summary.images_published);
//! ```

pub mod core;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod metadata;
pub mod settings;
pub mod sink;

pub use crate::core::{Autofocus, DeviceControl, ImageSink, PixelBuffer, TaggedImage};
pub use engine::{
    AcquisitionEngine, EngineConfig, ImageRequest, RunHandle, RunStatus, RunSummary, SequenceItem,
    SequencePlanner,
};
pub use error::{EngineError, EngineResult};
pub use metadata::ImageTags;
pub use settings::{
    AcquisitionSettings, ChannelSpec, NamedPosition, SliceChannelOrder, StageTarget,
    TimePositionOrder,
};
