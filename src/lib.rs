//! # AO Loop Camera Input
//!
//! Frame acquisition and pre-processing for an adaptive-optics control loop.
//! Raw wavefront-sensor frames arrive in a shared ring stream; this crate turns
//! each one into a dark-subtracted frame (`imWFS0`), a total-flux scalar
//! (`imWFS0tot`) and a flux-normalized frame (`imWFS1`) for the reconstructor.
//!
//! ## Crate Structure
//!
//! - **`camin`**: The read-frame stage. `CameraInput` owns the per-loop state:
//!   wait strategy, scratch frame, dark-subtract worker pool, background flux
//!   totalizer, normalization and loop timing telemetry.
//! - **`extract`**: `CropExtractLoop`, a single-threaded crop/dark/mask
//!   republisher driven by a source counter.
//! - **`config`**: Figment-based configuration (`config/aoloop.toml` plus
//!   `AOLOOP_` environment overrides).
//! - **`error`**: The `CaminError` enum and fatal-error classification.
//! - **`logging`**: Tracing subscriber setup.
//! - **`sim`**: Simulated camera writing synthetic frames into a ring stream.
//!
//! Streams themselves (data, counters, semaphores) come from the `aol-stream`
//! crate.

pub mod camin;
pub mod config;
pub mod error;
pub mod extract;
pub mod logging;
pub mod sim;

pub use camin::{CameraInput, FrameOutcome, FrameRequest};
pub use error::{AppResult, CaminError};
pub use extract::CropExtractLoop;
