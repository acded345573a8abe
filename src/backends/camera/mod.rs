// SPDX-License-Identifier: GPL-3.0-only

//! Camera backend abstraction
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │    Capture Loop     │
//! └──────────┬──────────┘
//!            │  Box<dyn CameraBackend>, chosen once from `cameraMake`
//!            ▼
//! ┌─────────────────────┐
//! │  CameraBackend Trait│  ← open / start / grab / close
//! └──────────┬──────────┘
//!            │
//!     ┌──────┼───────────┐
//!     ▼      ▼           ▼
//!   V4L2  GStreamer   Emulator
//! ```

pub mod emulator;
pub mod gst;
pub mod types;
pub mod v4l2;

pub use types::*;

use crate::config::CameraConfig;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Uniform capability set over every camera backend
///
/// A backend is owned by exactly one capture thread; it never needs to be
/// shared, only moved.
pub trait CameraBackend: Send {
    /// Open the device selected in `config` and resolve its geometry
    ///
    /// # Returns
    /// * `Ok(CameraMetadata)` - Device opened; width, height and serial are final
    /// * `Err(BackendError::DeviceNotFound)` - No device at that index
    fn open(&mut self, config: &CameraConfig) -> BackendResult<CameraMetadata>;

    /// Begin the backend's internal buffering
    ///
    /// Returns false instead of failing so the caller can abort cleanly.
    fn start_grabbing(&mut self) -> bool;

    /// Fetch one frame, waiting at most `timeout`
    ///
    /// `GrabOutcome::Timeout` is the normal "nothing yet" answer, not an error.
    fn grab_frame(&mut self, timeout: Duration) -> BackendResult<GrabOutcome>;

    /// Stop streaming and release the device
    ///
    /// Idempotent: closing a closed backend returns `Ok(())` and touches nothing.
    fn close(&mut self) -> BackendResult<()>;

    /// Drop every native resource without waiting on the device
    ///
    /// Called after `close` has failed repeatedly.
    fn force_teardown(&mut self) {}

    /// Whether the device is currently open
    fn is_open(&self) -> bool;

    /// Get the backend type identifier
    fn backend_type(&self) -> CameraBackendType;
}

/// Get a concrete backend instance for the configured camera make
pub fn get_backend(backend_type: CameraBackendType) -> Box<dyn CameraBackend> {
    match backend_type {
        CameraBackendType::V4l2 => Box::new(v4l2::V4l2Backend::new()),
        CameraBackendType::GStreamer => Box::new(gst::GStreamerBackend::new()),
        CameraBackendType::Emulator => Box::new(emulator::EmulatorBackend::new()),
    }
}

/// Close a backend, retrying with doubling backoff, then force teardown
///
/// Always returns; a hung device must not block the other cameras. Returns
/// true when a regular close succeeded.
pub fn close_with_retry(
    backend: &mut dyn CameraBackend,
    camera: &str,
    attempts: u32,
    backoff: Duration,
) -> bool {
    let mut delay = backoff;
    for attempt in 1..=attempts.max(1) {
        match backend.close() {
            Ok(()) => {
                debug!(camera = %camera, attempt, "Camera closed");
                return true;
            }
            Err(e) => {
                warn!(camera = %camera, attempt, error = %e, "Camera close failed");
                if attempt < attempts {
                    std::thread::sleep(delay);
                    delay *= 2;
                }
            }
        }
    }
    info!(camera = %camera, "Forcing camera teardown");
    backend.force_teardown();
    false
}
