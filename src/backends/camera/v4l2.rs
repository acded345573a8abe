// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 camera backend
//!
//! Memory-mapped capture from `/dev/video<N>` through the `v4l` crate.
//! Mmap buffers are only valid until the next dequeue, so frames are always
//! copied out; a zero-copy request is downgraded at open.

use super::types::*;
use super::CameraBackend;
use crate::config::CameraConfig;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

/// ENODEV: device node vanished
const ERRNO_NO_DEVICE: i32 = 19;

pub struct V4l2Backend {
    device: Option<Device>,
    stream: Option<MmapStream<'static>>,
    device_path: String,
    buffer_count: u32,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl V4l2Backend {
    pub fn new() -> Self {
        Self {
            device: None,
            stream: None,
            device_path: String::new(),
            buffer_count: 4,
            width: 0,
            height: 0,
            format: PixelFormat::YUYV,
        }
    }
}

impl Default for V4l2Backend {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `name=value` lines from a settings file to matching device controls
///
/// Unknown names and unparsable values are logged and skipped.
fn apply_settings_file(dev: &Device, path: &Path) -> BackendResult<()> {
    let text = std::fs::read_to_string(path)?;
    let controls = dev
        .query_controls()
        .map_err(|e| BackendError::Other(format!("Failed to query controls: {}", e)))?;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, raw)) = line.split_once('=') else {
            warn!(line, "Ignoring malformed settings line");
            continue;
        };
        let name = name.trim();
        let raw = raw.trim();
        let Some(desc) = controls
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
        else {
            warn!(control = name, "Device has no such control");
            continue;
        };
        let value = match raw {
            "true" => Value::Boolean(true),
            "false" => Value::Boolean(false),
            _ => match raw.parse::<i64>() {
                Ok(v) => Value::Integer(v),
                Err(_) => {
                    warn!(control = name, value = raw, "Control value is not a number");
                    continue;
                }
            },
        };
        match dev.set_control(Control { id: desc.id, value }) {
            Ok(()) => debug!(control = name, value = raw, "Applied control"),
            Err(e) => warn!(control = name, error = %e, "Failed to set control"),
        }
    }
    Ok(())
}

fn classify_grab_error(err: io::Error) -> BackendError {
    if err.raw_os_error() == Some(ERRNO_NO_DEVICE) {
        BackendError::DeviceLost(err.to_string())
    } else {
        BackendError::GrabFailed(err.to_string())
    }
}

impl CameraBackend for V4l2Backend {
    fn open(&mut self, config: &CameraConfig) -> BackendResult<CameraMetadata> {
        let device_path = format!("/dev/video{}", config.selection);
        info!(camera = %config.name, device_path = %device_path, "Opening V4L2 device");

        let dev = Device::with_path(&device_path)
            .map_err(|e| BackendError::DeviceNotFound(format!("{}: {}", device_path, e)))?;

        let caps = dev
            .query_caps()
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

        let wanted = v4l::FourCC::new(&config.pixel_format_input.to_fourcc());
        let mut format = dev
            .format()
            .map_err(|e| BackendError::InitializationFailed(format!("Failed to get format: {}", e)))?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = wanted;

        let actual = dev
            .set_format(&format)
            .map_err(|e| BackendError::FormatNotSupported(e.to_string()))?;
        if actual.fourcc != wanted {
            return Err(BackendError::FormatNotSupported(format!(
                "{} does not deliver {}",
                device_path, config.pixel_format_input
            )));
        }
        if actual.width != config.width || actual.height != config.height {
            warn!(
                requested_width = config.width,
                requested_height = config.height,
                width = actual.width,
                height = actual.height,
                "Device adjusted frame size"
            );
        }

        if let Some(settings) = &config.settings {
            apply_settings_file(&dev, settings)?;
        }

        if config.buffer_mode == BufferMode::ZeroCopy {
            warn!(camera = %config.name, "V4L2 mmap buffers are always copied");
        }

        self.width = actual.width;
        self.height = actual.height;
        self.format = config.pixel_format_input;
        self.buffer_count = config.buffer_size.clamp(2, 32) as u32;
        self.device_path = device_path.clone();
        self.device = Some(dev);

        Ok(CameraMetadata {
            width: actual.width,
            height: actual.height,
            pixel_format: config.pixel_format_input,
            serial: if caps.bus.is_empty() {
                device_path
            } else {
                caps.bus
            },
            model: caps.card,
        })
    }

    fn start_grabbing(&mut self) -> bool {
        let Some(dev) = self.device.as_ref() else {
            warn!("start_grabbing called before open");
            return false;
        };
        match MmapStream::with_buffers(dev, Type::VideoCapture, self.buffer_count) {
            Ok(stream) => {
                debug!(device_path = %self.device_path, buffers = self.buffer_count, "V4L2 stream ready");
                self.stream = Some(stream);
                true
            }
            Err(e) => {
                warn!(device_path = %self.device_path, error = %e, "Failed to create buffer stream");
                false
            }
        }
    }

    fn grab_frame(&mut self, timeout: Duration) -> BackendResult<GrabOutcome> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| BackendError::DeviceLost("stream not started".to_string()))?;
        stream.set_timeout(timeout);

        match stream.next() {
            Ok((buf, meta)) => {
                let timestamp = meta.timestamp.sec as f64 + meta.timestamp.usec as f64 * 1e-6;
                let used = buf.get(..meta.bytesused as usize).unwrap_or(buf);
                Ok(GrabOutcome::Frame(RawFrame {
                    width: self.width,
                    height: self.height,
                    format: self.format,
                    timestamp,
                    data: FrameData::Copied(Arc::from(used)),
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(GrabOutcome::Timeout),
            Err(e) => Err(classify_grab_error(e)),
        }
    }

    fn close(&mut self) -> BackendResult<()> {
        if self.device.is_none() {
            return Ok(());
        }
        // Dropping the stream issues STREAMOFF and unmaps the buffers
        self.stream = None;
        self.device = None;
        debug!(device_path = %self.device_path, "V4L2 device closed");
        Ok(())
    }

    fn force_teardown(&mut self) {
        self.stream = None;
        self.device = None;
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn backend_type(&self) -> CameraBackendType {
        CameraBackendType::V4l2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_before_open_is_noop() {
        let mut backend = V4l2Backend::new();
        assert!(!backend.is_open());
        assert!(backend.close().is_ok());
        assert!(backend.close().is_ok());
    }

    #[test]
    fn test_missing_device_error_is_fatal() {
        let err = classify_grab_error(io::Error::from_raw_os_error(ERRNO_NO_DEVICE));
        assert!(err.is_fatal());
        let err = classify_grab_error(io::Error::other("EIO"));
        assert!(!err.is_fatal());
    }
}
