//! Custom error types for the acquisition engine.
//!
//! This module defines the primary error type, `EngineError`, for the public
//! engine surface. Using the `thiserror` crate, it gives callers a single
//! typed error for everything that can reject a run before or after it
//! executes.
//!
//! ## Error Hierarchy
//!
//! `EngineError` consolidates the fatal conditions of the engine:
//!
//! - **`Settings`**: Semantic errors in the acquisition settings, caught
//!   by validation before any hardware is touched. A run never starts with
//!   malformed settings.
//! - **`AutofocusUnavailable`**: The settings enable autofocus but no
//!   autofocus service was attached to the engine.
//! - **`AlreadyRunning`**: A second run was requested while one is active;
//!   the hardware facade is a single exclusive resource.
//! - **`Hardware`**: The facade failed while the engine captured the pre-run
//!   state a plan depends on (baseline exposure, auto-shutter selection).
//! - **`TaskFailed`**: A planner or executor task ended abnormally (panic or
//!   runtime cancellation) while waiting for the run to finish.
//!
//! Hardware faults *inside* a run are deliberately not represented here:
//! individual pipeline stages recover from them locally (logging and
//! annotating image metadata), so they never surface as a run-level error.
//! The device facade traits return `anyhow::Result` for that reason.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Fatal conditions of the engine's public surface.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid acquisition settings: {0}")]
    Settings(String),

    #[error("Autofocus is enabled in the settings but no autofocus service is attached")]
    AutofocusUnavailable,

    #[error("An acquisition is already running")]
    AlreadyRunning,

    #[error("Hardware control failed while preparing the run: {0}")]
    Hardware(#[from] anyhow::Error),

    #[error("Acquisition task ended abnormally: {0}")]
    TaskFailed(String),
}
