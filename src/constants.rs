// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// GPU vendor used for hardware encoding
///
/// Only consulted when `gpuID` is non-negative; `-1` always encodes on CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuMake {
    /// NVENC (`h264_nvenc` / `hevc_nvenc`)
    #[default]
    Nvidia,
    /// AMF (`h264_amf` / `hevc_amf`)
    Amd,
    /// Quick Sync (`h264_qsv` / `hevc_qsv`)
    Intel,
}

impl GpuMake {
    /// Get all variants for iteration
    pub const ALL: [GpuMake; 3] = [GpuMake::Nvidia, GpuMake::Amd, GpuMake::Intel];

    /// Get display name for the vendor
    pub fn display_name(&self) -> &'static str {
        match self {
            GpuMake::Nvidia => "nvidia",
            GpuMake::Amd => "amd",
            GpuMake::Intel => "intel",
        }
    }
}

/// Where preview frames end up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    /// Preview frames are drained and discarded
    None,
    /// Each preview frame is logged at debug level
    #[default]
    Log,
    /// The latest preview is written as a PNG next to the recording
    Snapshot,
}

impl DisplayMode {
    /// Get all display variants for iteration
    pub const ALL: [DisplayMode; 3] = [DisplayMode::None, DisplayMode::Log, DisplayMode::Snapshot];

    /// Get display name for the mode
    pub fn display_name(&self) -> &'static str {
        match self {
            DisplayMode::None => "none",
            DisplayMode::Log => "log",
            DisplayMode::Snapshot => "snapshot",
        }
    }
}

/// Values used when a config key is omitted
pub mod defaults {
    /// Number of cameras
    pub const NUM_CAMS: usize = 1;

    /// Acquisition rate in frames per second
    pub const FRAME_RATE: f64 = 100.0;

    /// Recording length in seconds
    pub const REC_TIME_SECS: f64 = 10.0;

    /// Length of one output video file in seconds
    pub const CHUNK_LENGTH_SECS: f64 = 5.0;

    /// Preview rate in frames per second (<= 0 disables preview)
    pub const DISPLAY_FRAME_RATE: f64 = 10.0;

    /// Spatial decimation of preview frames
    pub const DISPLAY_DOWNSAMPLE: u32 = 2;

    /// Frame geometry when the backend cannot report it
    pub const FRAME_WIDTH: u32 = 1152;
    pub const FRAME_HEIGHT: u32 = 1024;

    /// Encoder settings
    pub const CODEC: &str = "h264";
    pub const QUALITY: u32 = 21;
    pub const CPU_PRESET: &str = "fast";
    pub const PIXEL_FORMAT_OUTPUT: &str = "rgb0";
    pub const GPU_ID: i32 = -1;
    pub const FFMPEG_PATH: &str = "ffmpeg";
    pub const FFMPEG_LOG_LEVEL: &str = "quiet";

    /// Backend buffer pool depth
    pub const BUFFER_SIZE: usize = 100;

    /// Trigger controller
    pub const TRIGGER_CONTROLLER: &str = "arduino";
    pub const SERIAL_PORT: &str = "/dev/ttyACM0";
    pub const DIGITAL_PINS: &[u8] = &[0, 1, 2, 3, 4, 5, 6];

    /// Subfolder of the user's video directory used when `videoFolder` is omitted
    pub const VIDEO_SUBFOLDER: &str = "multicam";
}

/// Timing constants
pub mod timing {
    use super::Duration;

    /// Timeout handed to each backend grab call
    pub const GRAB_POLL_TIMEOUT: Duration = Duration::from_millis(1);

    /// Sleep between polls when no frame is ready
    pub const POLL_RETRY_SLEEP: Duration = Duration::from_micros(100);

    /// Seconds of capture time between progress log lines
    pub const PROGRESS_INTERVAL_SECS: f64 = 5.0;

    /// Camera close attempts before forced teardown
    pub const CLOSE_RETRY_ATTEMPTS: u32 = 3;

    /// First backoff between close attempts (doubles each time)
    pub const CLOSE_RETRY_BACKOFF: Duration = Duration::from_millis(100);

    /// How long an encoder may take to finalize its file after stdin closes
    pub const ENCODER_CLOSE_GRACE: Duration = Duration::from_secs(30);

    /// Poll interval while waiting for an encoder process to exit
    pub const ENCODER_EXIT_POLL: Duration = Duration::from_millis(20);

    /// Minimum time between preview snapshots
    pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

    /// Arduino resets when the port opens; wait for the bootloader
    pub const ARDUINO_INIT_DELAY: Duration = Duration::from_secs(3);

    /// GStreamer pipeline state change timeout on start / stop
    pub const STATE_CHANGE_TIMEOUT_SECS: u64 = 5;
}

/// Pipeline sizing
pub mod pipeline {
    /// Capacity of the drop-oldest preview channel
    pub const PREVIEW_CAPACITY: usize = 2;

    /// Frame channel backlog that triggers a warning
    pub const BACKLOG_WARN_FRAMES: usize = 500;

    /// Fresh encoders opened per planned chunk after a process failure
    pub const ENCODER_REOPEN_LIMIT: u32 = 1;
}

/// Serial trigger link
pub mod trigger {
    pub const BAUD_RATE: u32 = 115_200;

    /// Write timeout on the serial port
    pub const SERIAL_TIMEOUT_MS: u64 = 1000;
}

/// Output file naming
pub mod files {
    /// Session timestamp embedded in every file name
    pub const SESSION_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

    pub const TIMESTAMPS_SUFFIX: &str = "_timestamps.csv";
    pub const METADATA_SUFFIX: &str = "_metadata.csv";
    pub const PREVIEW_SUFFIX: &str = "_preview.png";

    /// Container written by the ffmpeg encoder
    pub const VIDEO_EXTENSION: &str = "mp4";

    /// Extension of unencoded frame dumps
    pub const RAW_EXTENSION: &str = "raw";

    /// Codec value that selects the raw-file encoder
    pub const RAW_CODEC: &str = "raw";

    /// Extensions the emulator decodes from an image directory
    pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

    /// Check if a file extension is a supported image format
    pub fn is_image_extension(ext: &str) -> bool {
        IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str())
    }
}

/// Application information utilities
pub mod app_info {
    /// Get the application version from build-time environment
    pub fn version() -> &'static str {
        env!("GIT_VERSION")
    }
}
