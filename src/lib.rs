// SPDX-License-Identifier: GPL-3.0-only

//! multicam - synchronized multi-camera acquisition
//!
//! Pulls frames from one or more cameras at full rate, streams them into
//! time-chunked video files and records a timestamp ledger per chunk.
//!
//! # Architecture
//!
//! - [`backends`]: Camera backends and the hardware trigger
//! - [`pipelines`]: Capture loop, preview, encoder sink and ledger writer
//! - [`orchestrator`]: Per-camera sessions and the multi-camera recorder
//! - [`config`]: JSON configuration and per-camera resolution
//! - [`constants`]: Defaults and timing
//! - [`errors`]: Error taxonomy

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;
pub mod orchestrator;
pub mod pipelines;

pub use config::{CameraConfig, Config};
pub use errors::{AppError, AppResult};
pub use orchestrator::{CameraOutcome, CameraReport, Recorder, RecordingReport};
