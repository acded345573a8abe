// SPDX-License-Identifier: GPL-3.0-only

//! `record` command
//!
//! Loads and validates the configuration before any camera is touched, runs
//! the recorder with Ctrl+C relayed as a stop request, and prints one line
//! per camera with frames written and dropped.

use multicam::config::{Config, parse_override};
use multicam::errors::AppError;
use multicam::orchestrator::{CameraOutcome, Recorder};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

/// Record with the config at `path`; returns the process exit code
pub fn record(path: &Path, overrides: Vec<(String, Value)>, set: &[String]) -> u8 {
    match run_record(path, overrides, set) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Recording not started");
            eprintln!("{}", e);
            e.exit_code()
        }
    }
}

fn run_record(path: &Path, mut overrides: Vec<(String, Value)>, set: &[String]) -> Result<u8, AppError> {
    for arg in set {
        overrides.push(parse_override(arg)?);
    }
    let config = Config::load(path, &overrides)?;
    let cameras = config.resolve_cameras()?;
    let trigger = config.trigger()?;

    for camera in &cameras {
        info!(
            camera = %camera.name,
            backend = %camera.make,
            frame_rate = camera.frame_rate,
            seconds = camera.rec_time_secs,
            folder = %camera.camera_dir().display(),
            "Configured camera"
        );
    }

    let recorder = Recorder::new(cameras, trigger);
    let interrupt = recorder.interrupt_handle();
    let interrupted = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler(move || {
        // Shutdown is cooperative; a second Ctrl+C changes nothing
        if !interrupted.swap(true, Ordering::SeqCst) {
            eprintln!("\nStopping, waiting for encoders to finish...");
            interrupt.interrupt();
        }
    })
    .map_err(|e| AppError::Other(format!("installing Ctrl+C handler: {}", e)))?;

    println!("Recording session {} (press Ctrl+C to stop early)", recorder.session());
    let report = recorder.run();

    for camera in &report.cameras {
        match camera.outcome {
            CameraOutcome::OpenFailed => println!(
                "{}: not recorded ({})",
                camera.camera,
                camera
                    .error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default()
            ),
            outcome => println!(
                "{}: {} frames written, {} dropped ({:?})",
                camera.camera,
                camera.frames_written(),
                camera.frames_dropped(),
                outcome
            ),
        }
    }
    Ok(report.exit_code())
}
