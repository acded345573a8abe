// SPDX-License-Identifier: GPL-3.0-only

//! Preview consumer
//!
//! Drains the preview channel until its stop sentinel and hands each frame
//! to a [`PreviewSink`] picked by the `display` setting.

use crate::backends::camera::PixelFormat;
use crate::constants::{DisplayMode, timing};
use crate::errors::AppError;
use crate::pipelines::channels::{PreviewFrame, PreviewMessage, PreviewReceiver};
use image::{DynamicImage, ImageBuffer, Luma, Rgb, Rgba};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Where preview frames end up
pub trait PreviewSink: Send {
    fn show(&mut self, frame: PreviewFrame) -> Result<(), AppError>;

    /// Called once after the stop sentinel
    fn finish(&mut self) -> Result<(), AppError> {
        Ok(())
    }
}

/// Discards everything
pub struct NullSink;

impl PreviewSink for NullSink {
    fn show(&mut self, _frame: PreviewFrame) -> Result<(), AppError> {
        Ok(())
    }
}

/// Logs one debug line per preview frame
pub struct LogSink {
    camera: String,
}

impl PreviewSink for LogSink {
    fn show(&mut self, frame: PreviewFrame) -> Result<(), AppError> {
        let mean = if frame.pixels.is_empty() {
            0.0
        } else {
            frame.pixels.iter().map(|&b| b as u64).sum::<u64>() as f64 / frame.pixels.len() as f64
        };
        debug!(
            camera = %self.camera,
            frame = frame.sequence,
            timestamp = frame.timestamp,
            width = frame.width,
            height = frame.height,
            mean,
            "Preview"
        );
        Ok(())
    }
}

/// Keeps the latest preview as a PNG, rewritten at most once per interval
pub struct SnapshotSink {
    path: PathBuf,
    interval: Duration,
    last_write: Option<Instant>,
    pending: Option<PreviewFrame>,
}

impl SnapshotSink {
    pub fn new(path: PathBuf, interval: Duration) -> Self {
        Self {
            path,
            interval,
            last_write: None,
            pending: None,
        }
    }

    fn write(&mut self, frame: &PreviewFrame) -> Result<(), AppError> {
        let image = preview_image(frame)
            .ok_or_else(|| AppError::Other(format!("{} preview cannot be rendered", frame.format)))?;
        image
            .save_with_format(&self.path, image::ImageFormat::Png)
            .map_err(|e| AppError::Storage(format!("{}: {}", self.path.display(), e)))?;
        self.last_write = Some(Instant::now());
        Ok(())
    }
}

impl PreviewSink for SnapshotSink {
    fn show(&mut self, frame: PreviewFrame) -> Result<(), AppError> {
        let due = self
            .last_write
            .map(|t| t.elapsed() >= self.interval)
            .unwrap_or(true);
        if due {
            self.pending = None;
            self.write(&frame)
        } else {
            self.pending = Some(frame);
            Ok(())
        }
    }

    fn finish(&mut self) -> Result<(), AppError> {
        match self.pending.take() {
            Some(frame) => self.write(&frame),
            None => Ok(()),
        }
    }
}

/// Sink for the configured display mode
pub fn preview_sink(mode: DisplayMode, camera: &str, snapshot_path: &Path) -> Box<dyn PreviewSink> {
    match mode {
        DisplayMode::None => Box::new(NullSink),
        DisplayMode::Log => Box::new(LogSink {
            camera: camera.to_string(),
        }),
        DisplayMode::Snapshot => Box::new(SnapshotSink::new(
            snapshot_path.to_path_buf(),
            timing::SNAPSHOT_INTERVAL,
        )),
    }
}

fn swap_red_blue(pixels: &[u8], channels: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(pixels.len() / channels * 3);
    for px in pixels.chunks_exact(channels) {
        out.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    out
}

fn drop_padding(pixels: &[u8]) -> Vec<u8> {
    pixels.chunks_exact(4).flat_map(|px| [px[0], px[1], px[2]]).collect()
}

/// Render a preview frame; YUV layouts show their luma only
pub fn preview_image(frame: &PreviewFrame) -> Option<DynamicImage> {
    let (w, h) = (frame.width, frame.height);
    let luma_len = w as usize * h as usize;
    let gray = |bytes: Vec<u8>| ImageBuffer::<Luma<u8>, _>::from_raw(w, h, bytes).map(DynamicImage::ImageLuma8);
    let rgb = |bytes: Vec<u8>| ImageBuffer::<Rgb<u8>, _>::from_raw(w, h, bytes).map(DynamicImage::ImageRgb8);

    match frame.format {
        PixelFormat::Gray8
        | PixelFormat::BayerRGGB
        | PixelFormat::BayerBGGR
        | PixelFormat::BayerGRBG
        | PixelFormat::BayerGBRG => gray(frame.pixels.clone()),
        PixelFormat::NV12 | PixelFormat::I420 => gray(frame.pixels.get(..luma_len)?.to_vec()),
        PixelFormat::YUYV => gray(frame.pixels.iter().step_by(2).copied().take(luma_len).collect()),
        PixelFormat::RGB24 => rgb(frame.pixels.clone()),
        PixelFormat::BGR24 => rgb(swap_red_blue(&frame.pixels, 3)),
        PixelFormat::RGB0 => rgb(drop_padding(&frame.pixels)),
        PixelFormat::BGR0 | PixelFormat::BGRA => rgb(swap_red_blue(&frame.pixels, 4)),
        PixelFormat::RGBA => ImageBuffer::<Rgba<u8>, _>::from_raw(w, h, frame.pixels.clone())
            .map(DynamicImage::ImageRgba8),
    }
}

/// Counts from one display consumer run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayReport {
    pub shown: u64,
    pub failed: u64,
    /// Frames evicted from the preview channel before being shown
    pub evicted: u64,
}

/// Consumer end of the preview channel
pub struct DisplayConsumer {
    camera: String,
    sink: Box<dyn PreviewSink>,
}

impl DisplayConsumer {
    pub fn new(camera: &str, sink: Box<dyn PreviewSink>) -> Self {
        Self {
            camera: camera.to_string(),
            sink,
        }
    }

    pub fn run(mut self, rx: PreviewReceiver) -> DisplayReport {
        let mut report = DisplayReport::default();
        while let PreviewMessage::Frame(frame) = rx.recv() {
            match self.sink.show(frame) {
                Ok(()) => report.shown += 1,
                Err(e) => {
                    report.failed += 1;
                    if report.failed == 1 {
                        warn!(camera = %self.camera, error = %e, "Preview failed");
                    }
                }
            }
        }
        if let Err(e) = self.sink.finish() {
            warn!(camera = %self.camera, error = %e, "Final preview failed");
        }
        report.evicted = rx.dropped();
        info!(camera = %self.camera, shown = report.shown, evicted = report.evicted, "Display closed");
        report
    }

    pub fn spawn(self, rx: PreviewReceiver) -> std::io::Result<JoinHandle<DisplayReport>> {
        thread::Builder::new()
            .name(format!("{}-display", self.camera))
            .spawn(move || self.run(rx))
    }
}
