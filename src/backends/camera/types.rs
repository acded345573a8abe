// SPDX-License-Identifier: GPL-3.0-only
// Shared types for camera backend abstraction

//! Shared types for camera backends

use gstreamer::buffer::{MappedBuffer, Readable};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A backend-owned buffer lent out to the pipeline
///
/// Dropping the lease hands the memory back to the backend. Ownership makes
/// the release happen exactly once: a lease cannot be cloned, and every exit
/// path (including unwinding) drops it.
pub trait BufferLease: Send {
    /// Borrowed view of the pixel bytes
    fn as_slice(&self) -> &[u8];
}

impl BufferLease for MappedBuffer<Readable> {
    fn as_slice(&self) -> &[u8] {
        MappedBuffer::as_slice(self)
    }
}

/// Frame data storage - either copied bytes or a leased backend buffer
///
/// `Copied` frames own their memory outright and the native grab result has
/// already been released. `Borrowed` frames keep the backend buffer alive
/// until the last consumer drops them.
pub enum FrameData {
    /// Copied out of the backend buffer (default, safe)
    Copied(Arc<[u8]>),
    /// Zero-copy lease on a backend buffer
    Borrowed(Box<dyn BufferLease>),
}

impl FrameData {
    /// Create FrameData from a mapped GStreamer buffer (zero-copy)
    pub fn from_mapped_buffer(buffer: MappedBuffer<Readable>) -> Self {
        FrameData::Borrowed(Box::new(buffer))
    }

    /// Get the length of the frame data in bytes
    pub fn len(&self) -> usize {
        self.as_ref().len()
    }

    /// Check if the frame data is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this frame still pins a backend buffer
    pub fn is_borrowed(&self) -> bool {
        matches!(self, FrameData::Borrowed(_))
    }

    /// Copy the bytes out and release any backend lease immediately
    pub fn into_copied(self) -> Self {
        match self {
            FrameData::Copied(data) => FrameData::Copied(data),
            FrameData::Borrowed(lease) => {
                let bytes: Arc<[u8]> = Arc::from(lease.as_slice());
                drop(lease);
                FrameData::Copied(bytes)
            }
        }
    }
}

impl std::fmt::Debug for FrameData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameData::Copied(data) => write!(f, "FrameData::Copied({} bytes)", data.len()),
            FrameData::Borrowed(lease) => {
                write!(f, "FrameData::Borrowed({} bytes)", lease.as_slice().len())
            }
        }
    }
}

impl AsRef<[u8]> for FrameData {
    fn as_ref(&self) -> &[u8] {
        match self {
            FrameData::Copied(data) => data.as_ref(),
            FrameData::Borrowed(lease) => lease.as_slice(),
        }
    }
}

impl std::ops::Deref for FrameData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_ref()
    }
}

/// How frame pixels leave the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferMode {
    /// Copy into owned memory and release the native frame right away
    #[default]
    Copy,
    /// Hold the native buffer until the encoder sink has consumed it
    ZeroCopy,
}

impl BufferMode {
    pub fn from_zero_copy(zero_copy: bool) -> Self {
        if zero_copy {
            BufferMode::ZeroCopy
        } else {
            BufferMode::Copy
        }
    }
}

/// Camera backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CameraBackendType {
    /// Video4Linux2 devices via the `v4l` crate
    #[default]
    #[serde(rename = "v4l2")]
    V4l2,
    /// Any GStreamer source ending in an appsink
    #[serde(rename = "gstreamer")]
    GStreamer,
    /// File replay or synthetic pattern, no hardware
    #[serde(rename = "emu")]
    Emulator,
}

impl CameraBackendType {
    /// Config spelling of this backend
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraBackendType::V4l2 => "v4l2",
            CameraBackendType::GStreamer => "gstreamer",
            CameraBackendType::Emulator => "emu",
        }
    }
}

impl std::fmt::Display for CameraBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraBackendType::V4l2 => write!(f, "V4L2"),
            CameraBackendType::GStreamer => write!(f, "GStreamer"),
            CameraBackendType::Emulator => write!(f, "Emulator"),
        }
    }
}

/// Pixel layout of the frames a camera delivers
///
/// Names follow ffmpeg's `pix_fmt` spelling since the value is handed to the
/// encoder unexamined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit single channel
    #[serde(rename = "gray")]
    Gray8,
    /// Packed 24-bit RGB
    #[serde(rename = "rgb24")]
    RGB24,
    /// Packed 24-bit BGR
    #[serde(rename = "bgr24")]
    BGR24,
    /// 32-bit RGB with alpha
    #[serde(rename = "rgba")]
    RGBA,
    /// 32-bit BGR with alpha
    #[serde(rename = "bgra")]
    BGRA,
    /// 32-bit RGB with a padding byte
    #[serde(rename = "rgb0")]
    RGB0,
    /// 32-bit BGR with a padding byte
    #[serde(rename = "bgr0")]
    BGR0,
    /// Packed 4:2:2 (Y0 U Y1 V)
    #[serde(rename = "yuyv422")]
    YUYV,
    /// Semi-planar 4:2:0
    #[serde(rename = "nv12")]
    NV12,
    /// Planar 4:2:0
    #[serde(rename = "yuv420p")]
    I420,
    /// Raw sensor data, RGGB mosaic
    #[serde(rename = "bayer_rggb8")]
    BayerRGGB,
    /// Raw sensor data, BGGR mosaic
    #[serde(rename = "bayer_bggr8")]
    BayerBGGR,
    /// Raw sensor data, GRBG mosaic
    #[serde(rename = "bayer_grbg8")]
    BayerGRBG,
    /// Raw sensor data, GBRG mosaic
    #[serde(rename = "bayer_gbrg8")]
    BayerGBRG,
}

impl PixelFormat {
    /// ffmpeg `-pix_fmt` name
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            Self::Gray8 => "gray",
            Self::RGB24 => "rgb24",
            Self::BGR24 => "bgr24",
            Self::RGBA => "rgba",
            Self::BGRA => "bgra",
            Self::RGB0 => "rgb0",
            Self::BGR0 => "bgr0",
            Self::YUYV => "yuyv422",
            Self::NV12 => "nv12",
            Self::I420 => "yuv420p",
            Self::BayerRGGB => "bayer_rggb8",
            Self::BayerBGGR => "bayer_bggr8",
            Self::BayerGRBG => "bayer_grbg8",
            Self::BayerGBRG => "bayer_gbrg8",
        }
    }

    /// Check if this format is a raw Bayer pattern
    pub fn is_bayer(&self) -> bool {
        matches!(
            self,
            Self::BayerRGGB | Self::BayerBGGR | Self::BayerGRBG | Self::BayerGBRG
        )
    }

    /// Check if this format stores luma and chroma in separate planes
    pub fn is_planar(&self) -> bool {
        matches!(self, Self::NV12 | Self::I420)
    }

    /// Average bytes per pixel (accounting for chroma subsampling)
    pub fn bytes_per_pixel(&self) -> f32 {
        match self {
            Self::RGBA | Self::BGRA | Self::RGB0 | Self::BGR0 => 4.0,
            Self::RGB24 | Self::BGR24 => 3.0,
            Self::YUYV => 2.0,
            Self::NV12 | Self::I420 => 1.5,
            Self::Gray8 => 1.0,
            Self::BayerRGGB | Self::BayerBGGR | Self::BayerGRBG | Self::BayerGBRG => 1.0,
        }
    }

    /// Exact size in bytes of one tightly packed frame
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            Self::NV12 | Self::I420 => pixels + 2 * (pixels.div_ceil(4)),
            _ => (pixels as f32 * self.bytes_per_pixel()) as usize,
        }
    }

    /// Interleaved channel count for packed formats
    ///
    /// `None` for planar and packed-YUV layouts, which cannot be sampled
    /// pixel by pixel.
    pub fn packed_channels(&self) -> Option<usize> {
        match self {
            Self::Gray8 => Some(1),
            Self::BayerRGGB | Self::BayerBGGR | Self::BayerGRBG | Self::BayerGBRG => Some(1),
            Self::RGB24 | Self::BGR24 => Some(3),
            Self::RGBA | Self::BGRA | Self::RGB0 | Self::BGR0 => Some(4),
            Self::YUYV | Self::NV12 | Self::I420 => None,
        }
    }

    /// V4L2 FourCC for this layout
    pub fn to_fourcc(&self) -> [u8; 4] {
        match self {
            Self::Gray8 => *b"GREY",
            Self::RGB24 => *b"RGB3",
            Self::BGR24 => *b"BGR3",
            Self::RGBA => *b"AB24",
            Self::BGRA => *b"AR24",
            Self::RGB0 => *b"XB24",
            Self::BGR0 => *b"XR24",
            Self::YUYV => *b"YUYV",
            Self::NV12 => *b"NV12",
            Self::I420 => *b"YU12",
            Self::BayerRGGB => *b"RGGB",
            Self::BayerBGGR => *b"BA81",
            Self::BayerGRBG => *b"GRBG",
            Self::BayerGBRG => *b"GBRG",
        }
    }

    /// Convert to a GStreamer video/x-raw format string
    pub fn to_gst_format_string(&self) -> &'static str {
        match self {
            Self::Gray8 => "GRAY8",
            Self::RGB24 => "RGB",
            Self::BGR24 => "BGR",
            Self::RGBA => "RGBA",
            Self::BGRA => "BGRA",
            Self::RGB0 => "RGBx",
            Self::BGR0 => "BGRx",
            Self::YUYV => "YUY2",
            Self::NV12 => "NV12",
            Self::I420 => "I420",
            // video/x-bayer formats, lower case
            Self::BayerRGGB => "rggb",
            Self::BayerBGGR => "bggr",
            Self::BayerGRBG => "grbg",
            Self::BayerGBRG => "gbrg",
        }
    }

    /// Parse format from GStreamer format string
    pub fn from_gst_format(format: &str) -> Option<Self> {
        match format {
            "GRAY8" | "GREY" | "Y8" => Some(Self::Gray8),
            "RGB" => Some(Self::RGB24),
            "BGR" => Some(Self::BGR24),
            "RGBA" => Some(Self::RGBA),
            "BGRA" => Some(Self::BGRA),
            "RGBx" => Some(Self::RGB0),
            "BGRx" => Some(Self::BGR0),
            "YUY2" | "YUYV" => Some(Self::YUYV),
            "NV12" => Some(Self::NV12),
            "I420" => Some(Self::I420),
            "rggb" | "RGGB" => Some(Self::BayerRGGB),
            "bggr" | "BGGR" => Some(Self::BayerBGGR),
            "grbg" | "GRBG" => Some(Self::BayerGRBG),
            "gbrg" | "GBRG" => Some(Self::BayerGBRG),
            _ => None,
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.ffmpeg_name())
    }
}

/// Values resolved from the device when it is opened
#[derive(Debug, Clone, PartialEq)]
pub struct CameraMetadata {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Serial number or device path
    pub serial: String,
    /// Model / card name as reported by the driver
    pub model: String,
}

/// One grab result straight from the backend
///
/// The native buffer is released when the frame (or the `FrameData` taken
/// out of it) is dropped.
#[derive(Debug)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Backend timestamp in seconds on the backend's monotonic clock
    pub timestamp: f64,
    pub data: FrameData,
}

impl RawFrame {
    /// Backend timestamp in seconds
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Borrowed view of the pixels
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Take the pixel buffer out of the grab result
    ///
    /// In `Copy` mode the bytes are copied and the native buffer goes back to
    /// the backend before this returns. In `ZeroCopy` mode the lease moves
    /// into the returned value.
    pub fn image_array(self, mode: BufferMode) -> FrameData {
        match mode {
            BufferMode::Copy => self.data.into_copied(),
            BufferMode::ZeroCopy => self.data,
        }
    }

    /// Release the native buffer without extracting anything
    pub fn release(self) {
        drop(self);
    }
}

/// Outcome of one poll of the backend
#[derive(Debug)]
pub enum GrabOutcome {
    Frame(RawFrame),
    /// No frame ready yet; retry without tearing anything down
    Timeout,
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Error types for backend operations
#[derive(Debug, Clone)]
pub enum BackendError {
    /// Backend is not available on this system
    NotAvailable(String),
    /// Camera device not found
    DeviceNotFound(String),
    /// Failed to initialize backend
    InitializationFailed(String),
    /// Format not supported
    FormatNotSupported(String),
    /// A single grab failed; the device is still usable
    GrabFailed(String),
    /// Device is gone (unplugged, stream torn down)
    DeviceLost(String),
    /// Replay source has no more frames
    SourceExhausted(String),
    /// Close did not complete
    CloseFailed(String),
    /// General I/O error
    IoError(String),
    /// Other errors
    Other(String),
}

impl BackendError {
    /// Whether the capture loop must stop grabbing from this device
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BackendError::DeviceLost(_)
                | BackendError::SourceExhausted(_)
                | BackendError::NotAvailable(_)
                | BackendError::DeviceNotFound(_)
        )
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::NotAvailable(msg) => write!(f, "Backend not available: {}", msg),
            BackendError::DeviceNotFound(msg) => write!(f, "Device not found: {}", msg),
            BackendError::InitializationFailed(msg) => write!(f, "Initialization failed: {}", msg),
            BackendError::FormatNotSupported(msg) => write!(f, "Format not supported: {}", msg),
            BackendError::GrabFailed(msg) => write!(f, "Grab failed: {}", msg),
            BackendError::DeviceLost(msg) => write!(f, "Device lost: {}", msg),
            BackendError::SourceExhausted(msg) => write!(f, "Source exhausted: {}", msg),
            BackendError::CloseFailed(msg) => write!(f, "Close failed: {}", msg),
            BackendError::IoError(msg) => write!(f, "I/O error: {}", msg),
            BackendError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::IoError(err.to_string())
    }
}
