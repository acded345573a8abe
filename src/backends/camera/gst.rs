// SPDX-License-Identifier: GPL-3.0-only

//! GStreamer camera backend
//!
//! Any source that can be written as a launch fragment, terminated by a
//! caps filter and an appsink that the capture loop polls. In zero-copy mode
//! the sample buffer stays mapped inside the frame; dropping the frame unmaps
//! it and returns it to the upstream buffer pool.

use super::types::*;
use super::CameraBackend;
use crate::config::CameraConfig;
use crate::constants::timing;
use gstreamer::prelude::*;
use gstreamer_app::AppSink;
use gstreamer_video::VideoInfo;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct GStreamerBackend {
    pipeline: Option<gstreamer::Pipeline>,
    appsink: Option<AppSink>,
    format: PixelFormat,
    /// Fallback clock for buffers without a PTS
    opened_at: Instant,
}

impl GStreamerBackend {
    pub fn new() -> Self {
        Self {
            pipeline: None,
            appsink: None,
            format: PixelFormat::RGB24,
            opened_at: Instant::now(),
        }
    }

    /// First error message waiting on the pipeline bus, if any
    fn pending_error(&self) -> Option<String> {
        let bus = self.pipeline.as_ref()?.bus()?;
        let msg = bus.pop_filtered(&[gstreamer::MessageType::Error])?;
        match msg.view() {
            gstreamer::MessageView::Error(err) => Some(err.error().to_string()),
            _ => None,
        }
    }
}

impl Default for GStreamerBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the launch description for one camera
///
/// The source is the content of the settings file when one is configured,
/// otherwise the V4L2 device selected by index.
pub fn pipeline_description(config: &CameraConfig) -> BackendResult<String> {
    let source = match &config.settings {
        Some(path) => std::fs::read_to_string(path)?.trim().to_string(),
        None => format!("v4l2src device=/dev/video{}", config.selection),
    };
    let format = config.pixel_format_input;
    let caps = if format.is_bayer() {
        format!(
            "video/x-bayer,format={},width={},height={}",
            format.to_gst_format_string(),
            config.width,
            config.height
        )
    } else {
        format!(
            "videoconvert ! video/x-raw,format={},width={},height={}",
            format.to_gst_format_string(),
            config.width,
            config.height
        )
    };
    Ok(format!("{} ! {} ! appsink name=sink", source, caps))
}

/// Copy `height` rows of `row_bytes` out of a buffer whose rows start
/// `stride` bytes apart
///
/// `None` when the buffer is too short for that layout.
pub(crate) fn strip_row_padding(
    data: &[u8],
    row_bytes: usize,
    stride: usize,
    height: usize,
) -> Option<Vec<u8>> {
    if height == 0 || stride < row_bytes {
        return None;
    }
    let needed = stride.checked_mul(height - 1)?.checked_add(row_bytes)?;
    if data.len() < needed {
        return None;
    }
    let mut packed = Vec::with_capacity(row_bytes * height);
    for row in data.chunks(stride).take(height) {
        packed.extend_from_slice(&row[..row_bytes]);
    }
    Some(packed)
}

impl CameraBackend for GStreamerBackend {
    fn open(&mut self, config: &CameraConfig) -> BackendResult<CameraMetadata> {
        gstreamer::init().map_err(|e| BackendError::NotAvailable(e.to_string()))?;

        let description = pipeline_description(config)?;
        info!(camera = %config.name, pipeline = %description, "Creating GStreamer pipeline");

        let pipeline = gstreamer::parse::launch(&description)
            .map_err(|e| BackendError::DeviceNotFound(e.to_string()))?
            .dynamic_cast::<gstreamer::Pipeline>()
            .map_err(|_| {
                BackendError::InitializationFailed("Launch result is not a pipeline".to_string())
            })?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| BackendError::InitializationFailed("Failed to get appsink".to_string()))?
            .dynamic_cast::<AppSink>()
            .map_err(|_| BackendError::InitializationFailed("Failed to cast appsink".to_string()))?;

        appsink.set_property("emit-signals", false);
        appsink.set_property("sync", false);
        appsink.set_property("max-buffers", config.buffer_size as u32);
        appsink.set_property("drop", false);
        appsink.set_property("enable-last-sample", false);

        // Preroll so negotiation errors surface here instead of mid-recording
        pipeline
            .set_state(gstreamer::State::Paused)
            .map_err(|e| BackendError::DeviceNotFound(format!("Failed to pause pipeline: {}", e)))?;

        self.format = config.pixel_format_input;
        self.opened_at = Instant::now();
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);

        Ok(CameraMetadata {
            width: config.width,
            height: config.height,
            pixel_format: config.pixel_format_input,
            serial: format!("gstreamer:{}", config.selection),
            model: description,
        })
    }

    fn start_grabbing(&mut self) -> bool {
        let Some(pipeline) = self.pipeline.as_ref() else {
            warn!("start_grabbing called before open");
            return false;
        };
        if let Err(e) = pipeline.set_state(gstreamer::State::Playing) {
            warn!(error = %e, "Failed to start pipeline");
            return false;
        }
        let (result, state, pending) = pipeline.state(gstreamer::ClockTime::from_seconds(
            timing::STATE_CHANGE_TIMEOUT_SECS,
        ));
        debug!(result = ?result, state = ?state, pending = ?pending, "Pipeline state");
        result.is_ok()
    }

    fn grab_frame(&mut self, timeout: Duration) -> BackendResult<GrabOutcome> {
        let appsink = self
            .appsink
            .as_ref()
            .ok_or_else(|| BackendError::DeviceLost("pipeline not open".to_string()))?;

        let Some(sample) =
            appsink.try_pull_sample(gstreamer::ClockTime::from_nseconds(timeout.as_nanos() as u64))
        else {
            if appsink.is_eos() {
                return Err(BackendError::SourceExhausted("end of stream".to_string()));
            }
            if let Some(err) = self.pending_error() {
                return Err(BackendError::DeviceLost(err));
            }
            return Ok(GrabOutcome::Timeout);
        };

        let caps = sample
            .caps()
            .ok_or_else(|| BackendError::GrabFailed("No caps in sample".to_string()))?;
        let (width, height, stride) = match VideoInfo::from_caps(caps) {
            Ok(info) => (info.width(), info.height(), Some(info.stride()[0].max(0) as usize)),
            // Bayer caps are not video/x-raw; read the structure directly
            Err(_) => {
                let s = caps
                    .structure(0)
                    .ok_or_else(|| BackendError::GrabFailed("Empty caps".to_string()))?;
                let dimension = |field: &str| {
                    s.get::<i32>(field)
                        .map(|v| v.max(0) as u32)
                        .map_err(|_| BackendError::GrabFailed(format!("Caps without {}", field)))
                };
                (dimension("width")?, dimension("height")?, None)
            }
        };
        if width == 0 || height == 0 {
            return Err(BackendError::GrabFailed(format!(
                "Invalid frame size {}x{}",
                width, height
            )));
        }

        let buffer = sample
            .buffer_owned()
            .ok_or_else(|| BackendError::GrabFailed("No buffer in sample".to_string()))?;
        if buffer.flags().contains(gstreamer::BufferFlags::CORRUPTED) {
            return Err(BackendError::GrabFailed("Buffer marked as corrupted".to_string()));
        }

        let timestamp = match buffer.pts() {
            Some(pts) => pts.nseconds() as f64 / 1e9,
            None => self.opened_at.elapsed().as_secs_f64(),
        };

        // Packed formats only; planar layouts are passed through as mapped
        let row_bytes = width as usize * self.format.bytes_per_pixel() as usize;
        let stride = stride.unwrap_or(buffer.size() / height as usize);
        let padded = !matches!(self.format, PixelFormat::NV12 | PixelFormat::I420)
            && stride > row_bytes;

        let data = if padded {
            let map = buffer
                .map_readable()
                .map_err(|_| BackendError::GrabFailed("Failed to map buffer".to_string()))?;
            let rows = strip_row_padding(map.as_slice(), row_bytes, stride, height as usize)
                .ok_or_else(|| {
                    BackendError::GrabFailed(format!(
                        "Buffer of {} bytes too short for {} rows of stride {}",
                        map.len(),
                        height,
                        stride
                    ))
                })?;
            FrameData::Copied(Arc::from(rows))
        } else {
            let mapped = buffer
                .into_mapped_buffer_readable()
                .map_err(|_| BackendError::GrabFailed("Failed to map buffer".to_string()))?;
            FrameData::from_mapped_buffer(mapped)
        };

        Ok(GrabOutcome::Frame(RawFrame {
            width,
            height,
            format: self.format,
            timestamp,
            data,
        }))
    }

    fn close(&mut self) -> BackendResult<()> {
        let Some(pipeline) = self.pipeline.as_ref() else {
            return Ok(());
        };
        pipeline
            .set_state(gstreamer::State::Null)
            .map_err(|e| BackendError::CloseFailed(format!("Failed to stop pipeline: {}", e)))?;
        self.appsink = None;
        self.pipeline = None;
        debug!("GStreamer pipeline closed");
        Ok(())
    }

    fn force_teardown(&mut self) {
        self.appsink = None;
        self.pipeline = None;
    }

    fn is_open(&self) -> bool {
        self.pipeline.is_some()
    }

    fn backend_type(&self) -> CameraBackendType {
        CameraBackendType::GStreamer
    }
}
