//! Hardware backends.
//!
//! Production facades live out of tree (bindings to a real microscope
//! control core implement [`crate::core::DeviceControl`] directly). This
//! crate ships the simulated backend that powers the test suites and the
//! demo.

pub mod mock;

pub use mock::{devices, SimulatedAutofocus, SimulatedCore};
