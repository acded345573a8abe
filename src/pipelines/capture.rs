// SPDX-License-Identifier: GPL-3.0-only

//! Capture loop (producer)
//!
//! Polls the camera backend, numbers every frame at grab time, hands a
//! downsampled copy of every `frameRatio`-th frame to the preview channel and
//! every frame to the frame channel. The loop alone decides when grabbing
//! ends; consumers learn about it from the stop sentinels it sends.

use crate::backends::camera::{BufferMode, CameraBackend, GrabOutcome, PixelFormat, RawFrame};
use crate::config::CameraConfig;
use crate::constants::timing;
use crate::pipelines::channels::{
    CaptureReport, FrameMessage, FrameRecord, FrameSender, PreviewFrame, PreviewSender,
    StopReason, StopReceiver,
};
use chrono::Local;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle of one camera's pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Capture loop is pulling frames
    Grabbing,
    /// Capture stopped; consumers are flushing
    Draining,
    /// Every consumer has seen its stop sentinel
    Closed,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Grabbing => write!(f, "Grabbing"),
            PipelineState::Draining => write!(f, "Draining"),
            PipelineState::Closed => write!(f, "Closed"),
        }
    }
}

/// Action returned by one loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    Continue,
    Stop(StopReason),
}

/// Per-camera knobs of the capture loop
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    pub total_frames: u64,
    /// Preview every n-th frame; `None` disables the preview
    pub frame_ratio: Option<u64>,
    pub downsample: u32,
    pub buffer_mode: BufferMode,
    pub poll_timeout: Duration,
    pub retry_sleep: Duration,
    pub progress_interval_secs: f64,
}

impl CaptureSettings {
    pub fn from_config(config: &CameraConfig) -> Self {
        Self {
            total_frames: config.total_frames(),
            frame_ratio: config.frame_ratio(),
            downsample: config.display_downsample,
            buffer_mode: config.buffer_mode,
            poll_timeout: timing::GRAB_POLL_TIMEOUT,
            retry_sleep: timing::POLL_RETRY_SLEEP,
            progress_interval_secs: timing::PROGRESS_INTERVAL_SECS,
        }
    }
}

/// What the loop hands back once it has stopped
pub struct CaptureOutcome {
    /// Still open; closed by the caller after the sink has finished
    pub backend: Box<dyn CameraBackend>,
    pub report: CaptureReport,
}

type StateObserver = Box<dyn FnMut(PipelineState) + Send>;

/// Producer side of one camera pipeline
pub struct CaptureLoop {
    camera: String,
    backend: Box<dyn CameraBackend>,
    settings: CaptureSettings,
    frame_tx: FrameSender,
    preview_tx: Option<PreviewSender>,
    stop_rx: StopReceiver,
    observer: Option<StateObserver>,
    state: PipelineState,
    frames_grabbed: u64,
    grab_errors: u64,
    first_timestamp: Option<f64>,
    last_timestamp: f64,
    next_progress: f64,
}

impl CaptureLoop {
    pub fn new(
        camera: &str,
        backend: Box<dyn CameraBackend>,
        settings: CaptureSettings,
        frame_tx: FrameSender,
        preview_tx: Option<PreviewSender>,
        stop_rx: StopReceiver,
    ) -> Self {
        let next_progress = settings.progress_interval_secs;
        Self {
            camera: camera.to_string(),
            backend,
            settings,
            frame_tx,
            preview_tx,
            stop_rx,
            observer: None,
            state: PipelineState::Grabbing,
            frames_grabbed: 0,
            grab_errors: 0,
            first_timestamp: None,
            last_timestamp: 0.0,
            next_progress,
        }
    }

    /// Called on every state change of this loop
    pub fn with_state_observer(mut self, observer: impl FnMut(PipelineState) + Send + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn set_state(&mut self, state: PipelineState) {
        debug!(camera = %self.camera, from = %self.state, to = %state, "Pipeline state");
        self.state = state;
        if let Some(observer) = self.observer.as_mut() {
            observer(state);
        }
    }

    /// Grab until the stop condition, then send both stop sentinels
    pub fn run(mut self) -> CaptureOutcome {
        let started_at = Local::now();
        self.set_state(PipelineState::Grabbing);
        info!(camera = %self.camera, frames = self.settings.total_frames, "Capture started");

        let reason = if self.settings.total_frames == 0 {
            StopReason::TimeLimit
        } else {
            loop {
                match self.step() {
                    LoopAction::Continue => {}
                    LoopAction::Stop(reason) => break reason,
                }
            }
        };

        self.set_state(PipelineState::Draining);
        let report = CaptureReport {
            frames_grabbed: self.frames_grabbed,
            grab_errors: self.grab_errors,
            last_timestamp: self.last_timestamp,
            stop_reason: reason,
            started_at,
            ended_at: Local::now(),
        };
        info!(
            camera = %self.camera,
            frames = report.frames_grabbed,
            errors = report.grab_errors,
            reason = %reason,
            "Capture stopped"
        );

        if let Some(preview_tx) = self.preview_tx.take() {
            preview_tx.close();
        }
        if self.frame_tx.send(FrameMessage::Stop(report.clone())).is_err() {
            warn!(camera = %self.camera, "Encoder sink is gone, stop sentinel not delivered");
        }

        CaptureOutcome {
            backend: self.backend,
            report,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<CaptureOutcome>> {
        thread::Builder::new()
            .name(format!("{}-capture", self.camera))
            .spawn(move || self.run())
    }

    /// One poll of the backend
    fn step(&mut self) -> LoopAction {
        if let Some(reason) = self.pending_stop() {
            return LoopAction::Stop(reason);
        }

        match self.backend.grab_frame(self.settings.poll_timeout) {
            Ok(GrabOutcome::Timeout) => {
                thread::sleep(self.settings.retry_sleep);
                LoopAction::Continue
            }
            Ok(GrabOutcome::Frame(raw)) => self.on_frame(raw),
            Err(e) if e.is_fatal() => {
                error!(camera = %self.camera, error = %e, "Camera failed, draining");
                LoopAction::Stop(StopReason::DeviceLost)
            }
            Err(e) => {
                self.grab_errors += 1;
                warn!(camera = %self.camera, error = %e, errors = self.grab_errors, "Grab failed");
                LoopAction::Continue
            }
        }
    }

    fn pending_stop(&mut self) -> Option<StopReason> {
        self.stop_rx.try_recv().ok()
    }

    fn on_frame(&mut self, raw: RawFrame) -> LoopAction {
        let sequence = self.frames_grabbed;
        let raw_timestamp = raw.timestamp();
        let first = *self.first_timestamp.get_or_insert(raw_timestamp);
        let timestamp = raw_timestamp - first;

        if let (Some(ratio), Some(preview_tx)) = (self.settings.frame_ratio, &self.preview_tx) {
            if sequence % ratio == 0 {
                let preview = downsample(
                    raw.pixels(),
                    raw.width,
                    raw.height,
                    raw.format,
                    self.settings.downsample,
                );
                preview_tx.push(PreviewFrame {
                    sequence,
                    timestamp,
                    ..preview
                });
            }
        }

        let (width, height) = (raw.width, raw.height);
        let pixels = raw.image_array(self.settings.buffer_mode);
        let record = FrameRecord {
            sequence,
            timestamp,
            width,
            height,
            pixels,
        };
        self.frames_grabbed += 1;
        self.last_timestamp = timestamp;

        if self.frame_tx.send(FrameMessage::Frame(record)).is_err() {
            error!(camera = %self.camera, frame = sequence, "Encoder sink is gone");
            return LoopAction::Stop(StopReason::EncoderFailure);
        }

        if timestamp >= self.next_progress {
            info!(
                camera = %self.camera,
                "Collected {} frames at {:.1} fps for {:.1} sec",
                self.frames_grabbed,
                self.frames_grabbed as f64 / timestamp.max(f64::EPSILON),
                timestamp
            );
            self.next_progress += self.settings.progress_interval_secs;
        }

        if let Some(reason) = self.pending_stop() {
            return LoopAction::Stop(reason);
        }
        if sequence + 1 >= self.settings.total_frames {
            return LoopAction::Stop(StopReason::TimeLimit);
        }
        LoopAction::Continue
    }
}

/// Keep every `factor`-th pixel of every `factor`-th row
///
/// Layouts that cannot be sampled pixel by pixel are copied whole.
pub fn downsample(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
    factor: u32,
) -> PreviewFrame {
    let factor = factor.max(1) as usize;
    let whole = |pixels: &[u8]| PreviewFrame {
        sequence: 0,
        timestamp: 0.0,
        width,
        height,
        format,
        pixels: pixels.to_vec(),
    };

    if width == 0 || height == 0 {
        return whole(pixels);
    }
    let channels = match format.packed_channels() {
        Some(c) if factor > 1 => c,
        _ => return whole(pixels),
    };
    let (w, h) = (width as usize, height as usize);
    let stride = w * channels;
    if pixels.len() < stride * h {
        return whole(pixels);
    }

    let out_w = w.div_ceil(factor);
    let out_h = h.div_ceil(factor);
    let mut out = Vec::with_capacity(out_w * out_h * channels);
    for row in pixels.chunks_exact(stride).take(h).step_by(factor) {
        for px in row.chunks_exact(channels).step_by(factor) {
            out.extend_from_slice(px);
        }
    }

    PreviewFrame {
        sequence: 0,
        timestamp: 0.0,
        width: out_w as u32,
        height: out_h as u32,
        format,
        pixels: out,
    }
}
