// SPDX-License-Identifier: GPL-3.0-only

//! Encoder boundary
//!
//! An encoder accepts fixed-size raw frames and writes one file. The ffmpeg
//! encoder is an external process fed through its stdin; the raw encoder
//! dumps frames straight to disk.

use crate::backends::camera::PixelFormat;
use crate::config::EncoderSettings;
use crate::constants::{GpuMake, defaults, files, timing};
use crate::errors::RecordingError;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Everything needed to open one encoder
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderParams {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub pixel_format_input: PixelFormat,
    pub settings: EncoderSettings,
}

impl EncoderParams {
    /// Bytes per input frame
    pub fn frame_size(&self) -> usize {
        self.pixel_format_input.frame_size(self.width, self.height)
    }

    /// File extension of the encoder's output
    pub fn extension(&self) -> &'static str {
        if self.settings.is_raw() {
            files::RAW_EXTENSION
        } else {
            files::VIDEO_EXTENSION
        }
    }
}

/// An open encoder bound to one output file
pub trait EncoderPipe: Send {
    /// Encode one frame
    ///
    /// `FrameCorruptOrDropped` means this frame was skipped and the encoder is
    /// still usable; `EncoderProcessFailure` means it is not.
    fn send(&mut self, frame: &[u8]) -> Result<(), RecordingError>;

    /// Finalize the file, waiting at most `grace`
    fn close(self: Box<Self>, grace: Duration) -> Result<(), RecordingError>;
}

/// Opens encoders; shared by every chunk of every camera
pub trait EncoderFactory: Send + Sync {
    fn open(&self, path: &Path, params: &EncoderParams)
    -> Result<Box<dyn EncoderPipe>, RecordingError>;
}

/// ffmpeg for compressed codecs, a plain file for `codec = "raw"`
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEncoderFactory;

impl EncoderFactory for DefaultEncoderFactory {
    fn open(
        &self,
        path: &Path,
        params: &EncoderParams,
    ) -> Result<Box<dyn EncoderPipe>, RecordingError> {
        if params.settings.is_raw() {
            Ok(Box::new(RawFileEncoder::create(path, params)?))
        } else {
            Ok(Box::new(FfmpegEncoder::spawn(path, params)?))
        }
    }
}

fn check_frame_len(frame: &[u8], expected: usize) -> Result<(), RecordingError> {
    if frame.len() != expected {
        return Err(RecordingError::FrameCorruptOrDropped(format!(
            "buffer is {} bytes, expected {}",
            frame.len(),
            expected
        )));
    }
    Ok(())
}

/// Codec name, output pixel format and extra output arguments for ffmpeg
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedCodec {
    pub codec: String,
    pub pixel_format_output: String,
    pub output_args: Vec<String>,
}

/// Map the configured codec onto a CPU or GPU encoder
///
/// `gpuID = -1` encodes on CPU with x264/x265; otherwise `gpuMake` picks
/// NVENC, AMF or Quick Sync. Padded RGB output formats are replaced by a
/// YUV layout the chosen encoder accepts.
pub fn select_codec(settings: &EncoderSettings) -> SelectedCodec {
    let quality = settings.quality.to_string();
    let gpu = settings.gpu_id.to_string();
    let padded_rgb = matches!(settings.pixel_format_output.as_str(), "rgb0" | "bgr0");
    let hevc = settings.codec == "h265";
    let mut pixel_format_output = settings.pixel_format_output.clone();
    let args = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    let (codec, output_args) = if settings.gpu_id < 0 {
        let preset = settings
            .preset
            .clone()
            .unwrap_or_else(|| defaults::CPU_PRESET.to_string());
        let mut output_args = args(&[
            "-preset", &preset, "-tune", "fastdecode", "-crf", &quality, "-bufsize", "20M",
            "-maxrate", "10M", "-bf:v", "4",
        ]);
        if padded_rgb {
            pixel_format_output = "yuv420p".to_string();
        }
        let codec = match settings.codec.as_str() {
            "h264" => {
                output_args.extend(args(&["-x264-params", "nal-hrd=cbr"]));
                "libx264".to_string()
            }
            "h265" => "libx265".to_string(),
            other => other.to_string(),
        };
        (codec, output_args)
    } else {
        match settings.gpu_make {
            GpuMake::Nvidia => {
                let preset = settings.preset.clone().unwrap_or_else(|| "fast".to_string());
                let codec = if hevc { "hevc_nvenc" } else { "h264_nvenc" };
                (
                    codec.to_string(),
                    args(&["-preset", &preset, "-qp", &quality, "-bf:v", "0", "-gpu", &gpu]),
                )
            }
            GpuMake::Amd => {
                if padded_rgb {
                    pixel_format_output = "yuv420p".to_string();
                }
                let codec = if hevc { "hevc_amf" } else { "h264_amf" };
                (
                    codec.to_string(),
                    args(&[
                        "-usage", "lowlatency", "-rc", "cqp", "-qp_i", &quality, "-qp_p",
                        &quality, "-qp_b", &quality, "-bf:v", "0", "-hwaccel_device", &gpu,
                    ]),
                )
            }
            GpuMake::Intel => {
                if padded_rgb {
                    pixel_format_output = "nv12".to_string();
                }
                let preset = settings
                    .preset
                    .clone()
                    .unwrap_or_else(|| "faster".to_string());
                let q = (settings.quality + 1).to_string();
                let codec = if hevc { "hevc_qsv" } else { "h264_qsv" };
                (
                    codec.to_string(),
                    args(&["-bf:v", "0", "-preset", &preset, "-q", &q]),
                )
            }
        }
    };

    SelectedCodec {
        codec,
        pixel_format_output,
        output_args,
    }
}

/// Full ffmpeg argument list for one chunk file
pub fn ffmpeg_args(path: &Path, params: &EncoderParams) -> Vec<String> {
    let selected = select_codec(&params.settings);
    let mut args: Vec<String> = [
        "-y",
        "-f",
        "rawvideo",
        "-vcodec",
        "rawvideo",
        "-s",
        &format!("{}x{}", params.width, params.height),
        "-pix_fmt",
        params.pixel_format_input.ffmpeg_name(),
        "-r",
        &params.frame_rate.to_string(),
        "-an",
        "-i",
        "-",
        "-vcodec",
        &selected.codec,
        "-pix_fmt",
        &selected.pixel_format_output,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.extend(selected.output_args);
    args.extend([
        "-v".to_string(),
        params.settings.ffmpeg_log_level.clone(),
        path.display().to_string(),
    ]);
    args
}

/// ffmpeg child process reading raw frames on stdin
pub struct FfmpegEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    frame_size: usize,
    path: PathBuf,
}

impl FfmpegEncoder {
    pub fn spawn(path: &Path, params: &EncoderParams) -> Result<Self, RecordingError> {
        let args = ffmpeg_args(path, params);
        debug!(ffmpeg = %params.settings.ffmpeg_path.display(), args = ?args, "Spawning encoder");

        let mut child = Command::new(&params.settings.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| {
                RecordingError::EncoderProcessFailure(format!(
                    "failed to start {}: {}",
                    params.settings.ffmpeg_path.display(),
                    e
                ))
            })?;
        let stdin = child.stdin.take();

        info!(path = %path.display(), "Opened encoder");
        Ok(Self {
            child,
            stdin,
            frame_size: params.frame_size(),
            path: path.to_path_buf(),
        })
    }

    fn exit_description(&mut self) -> String {
        match self.child.try_wait() {
            Ok(Some(status)) => format!("encoder exited with {}", status),
            Ok(None) => "encoder stopped reading".to_string(),
            Err(e) => e.to_string(),
        }
    }
}

impl EncoderPipe for FfmpegEncoder {
    fn send(&mut self, frame: &[u8]) -> Result<(), RecordingError> {
        check_frame_len(frame, self.frame_size)?;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| RecordingError::EncoderProcessFailure("stdin closed".to_string()))?;
        match stdin.write_all(frame) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => Err(
                RecordingError::EncoderProcessFailure(self.exit_description()),
            ),
            Err(e) => Err(RecordingError::EncoderProcessFailure(e.to_string())),
        }
    }

    fn close(mut self: Box<Self>, grace: Duration) -> Result<(), RecordingError> {
        // EOF on stdin tells ffmpeg to finalize the container
        drop(self.stdin.take());

        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) if status.success() => {
                    debug!(path = %self.path.display(), "Encoder finished");
                    return Ok(());
                }
                Ok(Some(status)) => {
                    return Err(RecordingError::EncoderProcessFailure(format!(
                        "encoder for {} exited with {}",
                        self.path.display(),
                        status
                    )));
                }
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(timing::ENCODER_EXIT_POLL);
                }
                Ok(None) => break,
                Err(e) => return Err(RecordingError::EncoderProcessFailure(e.to_string())),
            }
        }

        warn!(path = %self.path.display(), "Encoder did not finish in time, killing it");
        let _ = self.child.kill();
        let _ = self.child.wait();
        Err(RecordingError::EncoderProcessFailure(format!(
            "encoder for {} did not finish within {:?}",
            self.path.display(),
            grace
        )))
    }
}

/// Frames written back to back without compression
pub struct RawFileEncoder {
    writer: BufWriter<File>,
    frame_size: usize,
}

impl RawFileEncoder {
    pub fn create(path: &Path, params: &EncoderParams) -> Result<Self, RecordingError> {
        let file = File::create(path).map_err(|e| {
            RecordingError::EncoderProcessFailure(format!("{}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Opened raw frame file");
        Ok(Self {
            writer: BufWriter::new(file),
            frame_size: params.frame_size(),
        })
    }
}

impl EncoderPipe for RawFileEncoder {
    fn send(&mut self, frame: &[u8]) -> Result<(), RecordingError> {
        check_frame_len(frame, self.frame_size)?;
        self.writer
            .write_all(frame)
            .map_err(|e| RecordingError::EncoderProcessFailure(e.to_string()))
    }

    fn close(mut self: Box<Self>, _grace: Duration) -> Result<(), RecordingError> {
        self.writer
            .flush()
            .map_err(|e| RecordingError::EncoderProcessFailure(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(codec: &str, gpu_id: i32, gpu_make: GpuMake) -> EncoderSettings {
        EncoderSettings {
            codec: codec.to_string(),
            quality: 21,
            preset: None,
            pixel_format_output: "rgb0".to_string(),
            gpu_id,
            gpu_make,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffmpeg_log_level: "quiet".to_string(),
        }
    }

    #[test]
    fn test_cpu_h264() {
        let selected = select_codec(&settings("h264", -1, GpuMake::Nvidia));
        assert_eq!(selected.codec, "libx264");
        assert_eq!(selected.pixel_format_output, "yuv420p");
        assert!(selected.output_args.windows(2).any(|w| w == ["-crf", "21"]));
        assert!(selected.output_args.windows(2).any(|w| w == ["-preset", "fast"]));
    }

    #[test]
    fn test_gpu_codecs() {
        let nv = select_codec(&settings("h265", 0, GpuMake::Nvidia));
        assert_eq!(nv.codec, "hevc_nvenc");
        assert_eq!(nv.pixel_format_output, "rgb0");
        assert!(nv.output_args.windows(2).any(|w| w == ["-gpu", "0"]));

        let amd = select_codec(&settings("h264", 1, GpuMake::Amd));
        assert_eq!(amd.codec, "h264_amf");
        assert_eq!(amd.pixel_format_output, "yuv420p");

        let intel = select_codec(&settings("h264", 0, GpuMake::Intel));
        assert_eq!(intel.codec, "h264_qsv");
        assert_eq!(intel.pixel_format_output, "nv12");
        assert!(intel.output_args.windows(2).any(|w| w == ["-q", "22"]));
    }

    #[test]
    fn test_ffmpeg_reads_stdin() {
        let params = EncoderParams {
            width: 640,
            height: 480,
            frame_rate: 100.0,
            pixel_format_input: PixelFormat::RGB24,
            settings: settings("h264", -1, GpuMake::Nvidia),
        };
        let args = ffmpeg_args(Path::new("/tmp/out.mp4"), &params);
        assert!(args.windows(2).any(|w| w == ["-s", "640x480"]));
        assert!(args.windows(2).any(|w| w == ["-pix_fmt", "rgb24"]));
        assert!(args.windows(2).any(|w| w == ["-i", "-"]));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));
    }

    #[test]
    fn test_raw_encoder_rejects_wrong_size() {
        let path = std::env::temp_dir().join(format!("raw-enc-{}.raw", std::process::id()));
        let params = EncoderParams {
            width: 2,
            height: 2,
            frame_rate: 10.0,
            pixel_format_input: PixelFormat::Gray8,
            settings: settings("raw", -1, GpuMake::Nvidia),
        };
        let mut enc: Box<dyn EncoderPipe> = Box::new(RawFileEncoder::create(&path, &params).unwrap());
        assert!(enc.send(&[1, 2, 3, 4]).is_ok());
        assert!(matches!(
            enc.send(&[1, 2, 3]),
            Err(RecordingError::FrameCorruptOrDropped(_))
        ));
        enc.close(Duration::from_secs(1)).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3, 4]);
        std::fs::remove_file(&path).ok();
    }
}
