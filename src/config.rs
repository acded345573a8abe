// SPDX-License-Identifier: GPL-3.0-only

//! Recording configuration
//!
//! A JSON file with camelCase keys, optionally patched by `KEY=VALUE`
//! overrides, is validated in full and resolved into one immutable
//! [`CameraConfig`] per camera before anything touches hardware.

use crate::backends::camera::{BufferMode, CameraBackendType, PixelFormat};
use crate::constants::{DisplayMode, GpuMake, defaults, files};
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// A value given once for all cameras or once per camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PerCamera<T> {
    Each(Vec<T>),
    All(T),
}

impl<T: Clone> PerCamera<T> {
    fn resolve(&self, key: &'static str, num_cams: usize) -> Result<Vec<T>, ConfigError> {
        match self {
            PerCamera::All(value) => Ok(vec![value.clone(); num_cams]),
            PerCamera::Each(values) if values.len() == num_cams => Ok(values.clone()),
            PerCamera::Each(values) => Err(ConfigError::ListLength {
                key,
                expected: num_cams,
                found: values.len(),
            }),
        }
    }
}

fn resolve_or<T: Clone>(
    value: &Option<PerCamera<T>>,
    key: &'static str,
    num_cams: usize,
    default: T,
) -> Result<Vec<T>, ConfigError> {
    match value {
        Some(v) => v.resolve(key, num_cams),
        None => Ok(vec![default; num_cams]),
    }
}

/// Config file contents
///
/// Every key is optional; omitted keys take the values in
/// [`crate::constants::defaults`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    pub num_cams: Option<usize>,
    pub video_folder: Option<PathBuf>,
    pub frame_rate: Option<f64>,
    pub rec_time_in_sec: Option<f64>,
    pub chunk_length_in_sec: Option<f64>,

    pub camera_names: Option<Vec<String>>,
    pub camera_selection: Option<Vec<u32>>,
    pub camera_make: Option<PerCamera<CameraBackendType>>,
    /// Backend-specific settings file; "None" or empty means no file
    pub camera_settings: Option<PerCamera<String>>,
    pub camera_debug: Option<bool>,
    pub frame_width: Option<PerCamera<u32>>,
    pub frame_height: Option<PerCamera<u32>>,
    pub buffer_size: Option<usize>,
    pub zero_copy: Option<PerCamera<bool>>,

    pub pixel_format_input: Option<PerCamera<PixelFormat>>,
    pub pixel_format_output: Option<PerCamera<String>>,
    pub codec: Option<PerCamera<String>>,
    pub quality: Option<PerCamera<u32>>,
    pub preset: Option<PerCamera<String>>,
    #[serde(rename = "gpuID")]
    pub gpu_id: Option<PerCamera<i32>>,
    pub gpu_make: Option<PerCamera<GpuMake>>,
    pub ffmpeg_path: Option<String>,
    pub ffmpeg_log_level: Option<String>,

    pub display: Option<PerCamera<DisplayMode>>,
    pub display_frame_rate: Option<f64>,
    pub display_downsample: Option<u32>,

    pub trigger_controller: Option<String>,
    pub start_trigger: Option<bool>,
    pub serial_port: Option<String>,
    pub digital_pins: Option<Vec<u8>>,

    pub emulator_source: Option<PerCamera<String>>,
    pub emulator_realtime: Option<bool>,
    pub emulator_loop: Option<bool>,
}

/// Settings for one camera, fixed for the whole session
#[derive(Debug, Clone, PartialEq)]
pub struct CameraConfig {
    /// Position in the camera list (camera 0 leads the trigger handshake)
    pub index: usize,
    pub name: String,
    pub make: CameraBackendType,
    /// Device index handed to the backend
    pub selection: u32,
    pub settings: Option<PathBuf>,
    pub debug: bool,

    pub frame_rate: f64,
    pub rec_time_secs: f64,
    pub chunk_length_secs: f64,
    pub width: u32,
    pub height: u32,
    pub pixel_format_input: PixelFormat,
    pub buffer_mode: BufferMode,
    pub buffer_size: usize,

    pub encoder: EncoderSettings,

    pub display: DisplayMode,
    pub display_frame_rate: f64,
    pub display_downsample: u32,

    pub emulator_source: Option<PathBuf>,
    pub emulator_realtime: bool,
    pub emulator_loop: bool,

    /// Session folder; this camera writes into `<video_folder>/<name>/`
    pub video_folder: PathBuf,
}

/// Encoder parameters passed through to the external encoder
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    pub codec: String,
    pub quality: u32,
    pub preset: Option<String>,
    pub pixel_format_output: String,
    pub gpu_id: i32,
    pub gpu_make: GpuMake,
    pub ffmpeg_path: PathBuf,
    pub ffmpeg_log_level: String,
}

impl EncoderSettings {
    /// Whether frames bypass ffmpeg and go straight to disk
    pub fn is_raw(&self) -> bool {
        self.codec.eq_ignore_ascii_case(files::RAW_CODEC)
    }
}

/// Hardware trigger settings
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerConfig {
    pub controller: String,
    pub serial_port: String,
    pub digital_pins: Vec<u8>,
    pub frame_rate: f64,
}

impl CameraConfig {
    /// Number of frames the capture loop grabs before stopping
    pub fn total_frames(&self) -> u64 {
        (self.rec_time_secs * self.frame_rate).round() as u64
    }

    /// Frames per output file
    ///
    /// Partial frames round up, but a product that is a whole number up to
    /// float error (0.07 s at 100 fps) is taken as that whole number.
    pub fn chunk_length_frames(&self) -> u64 {
        let exact = self.chunk_length_secs * self.frame_rate;
        let nearest = exact.round();
        let frames = if (exact - nearest).abs() < 1e-9 {
            nearest
        } else {
            exact.ceil()
        };
        (frames as u64).max(1)
    }

    /// Every n-th frame goes to the preview; `None` disables the preview
    pub fn frame_ratio(&self) -> Option<u64> {
        if self.display_frame_rate <= 0.0 {
            return None;
        }
        Some(((self.frame_rate / self.display_frame_rate).round() as u64).max(1))
    }

    /// Directory holding this camera's files
    pub fn camera_dir(&self) -> PathBuf {
        self.video_folder.join(&self.name)
    }

    /// Key/value rows written to the session metadata file
    pub fn metadata_rows(&self) -> Vec<(&'static str, String)> {
        let optional = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "None".to_string())
        };
        vec![
            ("cameraName", self.name.clone()),
            ("cameraMake", self.make.as_str().to_string()),
            ("cameraSelection", self.selection.to_string()),
            ("cameraSettings", optional(&self.settings)),
            ("frameRate", self.frame_rate.to_string()),
            ("recTimeInSec", self.rec_time_secs.to_string()),
            ("chunkLengthInSec", self.chunk_length_secs.to_string()),
            ("frameWidth", self.width.to_string()),
            ("frameHeight", self.height.to_string()),
            ("pixelFormatInput", self.pixel_format_input.to_string()),
            (
                "pixelFormatOutput",
                self.encoder.pixel_format_output.clone(),
            ),
            ("codec", self.encoder.codec.clone()),
            ("quality", self.encoder.quality.to_string()),
            (
                "preset",
                self.encoder
                    .preset
                    .clone()
                    .unwrap_or_else(|| "None".to_string()),
            ),
            ("gpuID", self.encoder.gpu_id.to_string()),
            ("gpuMake", self.encoder.gpu_make.display_name().to_string()),
            ("zeroCopy", (self.buffer_mode == BufferMode::ZeroCopy).to_string()),
            ("bufferSize", self.buffer_size.to_string()),
            ("displayFrameRate", self.display_frame_rate.to_string()),
            ("displayDownsample", self.display_downsample.to_string()),
            ("emulatorSource", optional(&self.emulator_source)),
            ("videoFolder", self.video_folder.display().to_string()),
        ]
    }
}

fn none_string(value: &str) -> bool {
    value.is_empty() || value.eq_ignore_ascii_case("none")
}

fn positive_f64(key: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange {
            key,
            value: value.to_string(),
        })
    }
}

fn positive<T: PartialOrd + Default + ToString + Copy>(
    key: &'static str,
    values: &[T],
) -> Result<(), ConfigError> {
    match values.iter().find(|v| **v <= T::default()) {
        Some(v) => Err(ConfigError::OutOfRange {
            key,
            value: v.to_string(),
        }),
        None => Ok(()),
    }
}

/// Default session folder under the user's video directory
pub fn default_video_folder() -> PathBuf {
    dirs::video_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(defaults::VIDEO_SUBFOLDER)
}

/// Parse a `KEY=VALUE` override
///
/// The value is read as JSON when it parses, otherwise as a plain string, so
/// `frameRate=200`, `cameraNames=["a","b"]` and `codec=h265` all work.
pub fn parse_override(arg: &str) -> Result<(String, Value), ConfigError> {
    let (key, raw) = arg
        .split_once('=')
        .ok_or_else(|| ConfigError::Override(format!("expected KEY=VALUE, got '{}'", arg)))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ConfigError::Override(format!("empty key in '{}'", arg)));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

impl Config {
    /// Read a config file and apply overrides on top of it
    pub fn load(path: &Path, overrides: &[(String, Value)]) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;
        Self::from_value(value, overrides)
    }

    /// Build from an already-parsed JSON object
    pub fn from_value(mut value: Value, overrides: &[(String, Value)]) -> Result<Self, ConfigError> {
        let object = value
            .as_object_mut()
            .ok_or_else(|| ConfigError::Parse("top level must be a JSON object".to_string()))?;
        for (key, v) in overrides {
            object.insert(key.clone(), v.clone());
        }
        serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn num_cams(&self) -> usize {
        self.num_cams.unwrap_or(defaults::NUM_CAMS)
    }

    /// Validate everything and produce one config per camera
    pub fn resolve_cameras(&self) -> Result<Vec<CameraConfig>, ConfigError> {
        let n = self.num_cams();
        if n == 0 {
            return Err(ConfigError::OutOfRange {
                key: "numCams",
                value: "0".to_string(),
            });
        }

        let frame_rate = positive_f64("frameRate", self.frame_rate.unwrap_or(defaults::FRAME_RATE))?;
        let rec_time = positive_f64(
            "recTimeInSec",
            self.rec_time_in_sec.unwrap_or(defaults::REC_TIME_SECS),
        )?;
        let chunk_length = positive_f64(
            "chunkLengthInSec",
            self.chunk_length_in_sec
                .unwrap_or(defaults::CHUNK_LENGTH_SECS),
        )?;
        let display_frame_rate = self
            .display_frame_rate
            .unwrap_or(defaults::DISPLAY_FRAME_RATE);
        if !display_frame_rate.is_finite() {
            return Err(ConfigError::OutOfRange {
                key: "displayFrameRate",
                value: display_frame_rate.to_string(),
            });
        }
        let display_downsample = self
            .display_downsample
            .unwrap_or(defaults::DISPLAY_DOWNSAMPLE);
        positive("displayDownsample", &[display_downsample])?;
        let buffer_size = self.buffer_size.unwrap_or(defaults::BUFFER_SIZE);
        positive("bufferSize", &[buffer_size])?;

        let names = match &self.camera_names {
            Some(names) if names.len() != n => {
                return Err(ConfigError::ListLength {
                    key: "cameraNames",
                    expected: n,
                    found: names.len(),
                });
            }
            Some(names) => names.clone(),
            None => (0..n).map(|i| format!("Camera{}", i)).collect(),
        };
        let mut seen = HashSet::new();
        for name in &names {
            if name.trim().is_empty() || name.contains(['/', '\\']) {
                return Err(ConfigError::Invalid(format!(
                    "camera name '{}' cannot be used as a folder name",
                    name
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "camera name '{}' is used twice",
                    name
                )));
            }
        }

        let selection = match &self.camera_selection {
            Some(sel) if sel.len() != n => {
                return Err(ConfigError::ListLength {
                    key: "cameraSelection",
                    expected: n,
                    found: sel.len(),
                });
            }
            Some(sel) => sel.clone(),
            None => (0..n as u32).collect(),
        };

        let makes = resolve_or(&self.camera_make, "cameraMake", n, CameraBackendType::default())?;
        let settings = resolve_or(&self.camera_settings, "cameraSettings", n, String::new())?;
        let widths = resolve_or(&self.frame_width, "frameWidth", n, defaults::FRAME_WIDTH)?;
        positive("frameWidth", &widths)?;
        let heights = resolve_or(&self.frame_height, "frameHeight", n, defaults::FRAME_HEIGHT)?;
        positive("frameHeight", &heights)?;
        let zero_copy = resolve_or(&self.zero_copy, "zeroCopy", n, false)?;
        let pix_in = resolve_or(
            &self.pixel_format_input,
            "pixelFormatInput",
            n,
            PixelFormat::RGB24,
        )?;
        let pix_out = resolve_or(
            &self.pixel_format_output,
            "pixelFormatOutput",
            n,
            defaults::PIXEL_FORMAT_OUTPUT.to_string(),
        )?;
        let codecs = resolve_or(&self.codec, "codec", n, defaults::CODEC.to_string())?;
        let quality = resolve_or(&self.quality, "quality", n, defaults::QUALITY)?;
        let presets = resolve_or(&self.preset, "preset", n, String::new())?;
        let gpu_ids = resolve_or(&self.gpu_id, "gpuID", n, defaults::GPU_ID)?;
        let gpu_makes = resolve_or(&self.gpu_make, "gpuMake", n, GpuMake::default())?;
        let displays = resolve_or(&self.display, "display", n, DisplayMode::default())?;
        let emu_sources = resolve_or(&self.emulator_source, "emulatorSource", n, String::new())?;

        let ffmpeg_path = match self.ffmpeg_path.as_deref() {
            Some(p) if !none_string(p) => PathBuf::from(p),
            _ => PathBuf::from(defaults::FFMPEG_PATH),
        };
        let ffmpeg_log_level = self
            .ffmpeg_log_level
            .clone()
            .unwrap_or_else(|| defaults::FFMPEG_LOG_LEVEL.to_string());
        let video_folder = self
            .video_folder
            .clone()
            .unwrap_or_else(default_video_folder);

        let optional_path = |s: &String| (!none_string(s)).then(|| PathBuf::from(s));

        let cameras = (0..n)
            .map(|i| CameraConfig {
                index: i,
                name: names[i].clone(),
                make: makes[i],
                selection: selection[i],
                settings: optional_path(&settings[i]),
                debug: self.camera_debug.unwrap_or(false),
                frame_rate,
                rec_time_secs: rec_time,
                chunk_length_secs: chunk_length,
                width: widths[i],
                height: heights[i],
                pixel_format_input: pix_in[i],
                buffer_mode: BufferMode::from_zero_copy(zero_copy[i]),
                buffer_size,
                encoder: EncoderSettings {
                    codec: codecs[i].clone(),
                    quality: quality[i],
                    preset: (!none_string(&presets[i])).then(|| presets[i].clone()),
                    pixel_format_output: pix_out[i].clone(),
                    gpu_id: gpu_ids[i],
                    gpu_make: gpu_makes[i],
                    ffmpeg_path: ffmpeg_path.clone(),
                    ffmpeg_log_level: ffmpeg_log_level.clone(),
                },
                display: displays[i],
                display_frame_rate,
                display_downsample,
                emulator_source: optional_path(&emu_sources[i]),
                emulator_realtime: self.emulator_realtime.unwrap_or(true),
                emulator_loop: self.emulator_loop.unwrap_or(false),
                video_folder: video_folder.clone(),
            })
            .collect();

        // Surface trigger problems here too so nothing is found mid-recording
        self.trigger()?;

        Ok(cameras)
    }

    /// Trigger settings, if hardware triggering is enabled
    pub fn trigger(&self) -> Result<Option<TriggerConfig>, ConfigError> {
        if !self.start_trigger.unwrap_or(false) {
            return Ok(None);
        }
        let controller = self
            .trigger_controller
            .clone()
            .unwrap_or_else(|| defaults::TRIGGER_CONTROLLER.to_string());
        if !controller.eq_ignore_ascii_case("arduino") {
            return Err(ConfigError::Invalid(format!(
                "unsupported triggerController '{}'",
                controller
            )));
        }
        let digital_pins = self
            .digital_pins
            .clone()
            .unwrap_or_else(|| defaults::DIGITAL_PINS.to_vec());
        if digital_pins.is_empty() {
            return Err(ConfigError::Invalid(
                "digitalPins must list at least one pin".to_string(),
            ));
        }
        Ok(Some(TriggerConfig {
            controller,
            serial_port: self
                .serial_port
                .clone()
                .unwrap_or_else(|| defaults::SERIAL_PORT.to_string()),
            digital_pins,
            frame_rate: positive_f64("frameRate", self.frame_rate.unwrap_or(defaults::FRAME_RATE))?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cameras(value: Value) -> Result<Vec<CameraConfig>, ConfigError> {
        Config::from_value(value, &[])?.resolve_cameras()
    }

    #[test]
    fn test_derived_frame_counts() {
        let cams = cameras(json!({
            "frameRate": 100, "recTimeInSec": 1, "chunkLengthInSec": 0.3,
            "displayFrameRate": 30, "videoFolder": "/tmp/x"
        }))
        .unwrap();
        let cam = &cams[0];
        assert_eq!(cam.total_frames(), 100);
        assert_eq!(cam.chunk_length_frames(), 30);
        assert_eq!(cam.frame_ratio(), Some(3));

        let cams = cameras(json!({
            "frameRate": 100, "chunkLengthInSec": 0.07, "videoFolder": "/tmp/x"
        }))
        .unwrap();
        assert_eq!(cams[0].chunk_length_frames(), 7);

        let cams = cameras(json!({
            "frameRate": 10, "chunkLengthInSec": 0.25, "videoFolder": "/tmp/x"
        }))
        .unwrap();
        assert_eq!(cams[0].chunk_length_frames(), 3);
    }

    #[test]
    fn test_display_disabled() {
        let cams = cameras(json!({"displayFrameRate": 0, "videoFolder": "/tmp/x"})).unwrap();
        assert_eq!(cams[0].frame_ratio(), None);
    }

    #[test]
    fn test_display_faster_than_capture() {
        let cams = cameras(json!({
            "frameRate": 10, "displayFrameRate": 100, "videoFolder": "/tmp/x"
        }))
        .unwrap();
        assert_eq!(cams[0].frame_ratio(), Some(1));
    }

    #[test]
    fn test_parse_override() {
        assert_eq!(
            parse_override("frameRate=200").unwrap(),
            ("frameRate".to_string(), json!(200))
        );
        assert_eq!(
            parse_override("codec=h265").unwrap(),
            ("codec".to_string(), json!("h265"))
        );
        assert!(parse_override("frameRate").is_err());
        assert!(parse_override("=3").is_err());
    }

    #[test]
    fn test_none_strings() {
        let cams = cameras(json!({
            "cameraSettings": "None", "preset": "None", "videoFolder": "/tmp/x"
        }))
        .unwrap();
        assert_eq!(cams[0].settings, None);
        assert_eq!(cams[0].encoder.preset, None);
    }
}
