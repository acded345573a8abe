// SPDX-License-Identifier: GPL-3.0-only

//! Emulated camera
//!
//! Replays frames without hardware, for dry runs and tests. Three sources:
//!
//! - a raw file of concatenated `width × height × bpp` frames
//! - a directory of images, decoded in name order
//! - a synthetic moving gradient when no source is configured
//!
//! Frames are written into a fixed pool of `bufferSize` slots, like a
//! vendor driver's ring buffer. A zero-copy frame keeps its slot until it is
//! dropped; when every slot is out, grabs time out.

use super::types::*;
use super::CameraBackend;
use crate::config::CameraConfig;
use crate::constants::files;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Buffer accounting shared between the backend and its outstanding frames
#[derive(Debug, Default)]
pub struct EmulatorStats {
    leased: AtomicU64,
    released: AtomicU64,
}

impl EmulatorStats {
    /// Buffers handed out so far
    pub fn leased(&self) -> u64 {
        self.leased.load(Ordering::SeqCst)
    }

    /// Buffers returned so far
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    /// Buffers currently held by the pipeline
    pub fn outstanding(&self) -> u64 {
        self.leased().saturating_sub(self.released())
    }
}

struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    stats: Arc<EmulatorStats>,
}

impl BufferPool {
    fn new(slots: usize, frame_size: usize, stats: Arc<EmulatorStats>) -> Self {
        Self {
            free: Mutex::new((0..slots).map(|_| vec![0u8; frame_size]).collect()),
            stats,
        }
    }

    fn take(&self) -> Option<Vec<u8>> {
        let slot = self
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop()?;
        self.stats.leased.fetch_add(1, Ordering::SeqCst);
        Some(slot)
    }

    fn put(&self, slot: Vec<u8>) {
        self.free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(slot);
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// One pool slot lent to a frame
struct PoolLease {
    bytes: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl BufferLease for PoolLease {
    fn as_slice(&self) -> &[u8] {
        self.bytes.as_deref().unwrap_or(&[])
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        if let Some(bytes) = self.bytes.take() {
            self.pool.put(bytes);
        }
    }
}

enum FrameSource {
    RawFile { file: File, frames: u64 },
    Images { paths: Vec<PathBuf> },
    Synthetic,
}

impl FrameSource {
    fn open(path: Option<&Path>, frame_size: usize) -> BackendResult<Self> {
        let Some(path) = path else {
            return Ok(FrameSource::Synthetic);
        };
        if path.is_dir() {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(files::is_image_extension)
                })
                .collect();
            paths.sort();
            if paths.is_empty() {
                return Err(BackendError::DeviceNotFound(format!(
                    "{} contains no images",
                    path.display()
                )));
            }
            return Ok(FrameSource::Images { paths });
        }
        let file = File::open(path)
            .map_err(|e| BackendError::DeviceNotFound(format!("{}: {}", path.display(), e)))?;
        let frames = file.metadata()?.len() / frame_size.max(1) as u64;
        if frames == 0 {
            return Err(BackendError::DeviceNotFound(format!(
                "{} holds less than one frame",
                path.display()
            )));
        }
        Ok(FrameSource::RawFile { file, frames })
    }

    /// Number of frames before the source runs out
    fn len(&self) -> Option<u64> {
        match self {
            FrameSource::RawFile { frames, .. } => Some(*frames),
            FrameSource::Images { paths } => Some(paths.len() as u64),
            FrameSource::Synthetic => None,
        }
    }

    fn fill(
        &mut self,
        index: u64,
        buf: &mut [u8],
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> BackendResult<()> {
        match self {
            FrameSource::RawFile { file, .. } => {
                file.seek(SeekFrom::Start(index * buf.len() as u64))?;
                file.read_exact(buf)?;
            }
            FrameSource::Images { paths } => {
                let path = &paths[index as usize];
                let img = image::open(path)
                    .map_err(|e| BackendError::GrabFailed(format!("{}: {}", path.display(), e)))?;
                let img = if img.width() != width || img.height() != height {
                    img.resize_exact(width, height, image::imageops::FilterType::Triangle)
                } else {
                    img
                };
                let pixels = match format.packed_channels() {
                    Some(1) => img.to_luma8().into_raw(),
                    Some(3) => {
                        let mut rgb = img.to_rgb8().into_raw();
                        if format == PixelFormat::BGR24 {
                            rgb.chunks_exact_mut(3).for_each(|p| p.swap(0, 2));
                        }
                        rgb
                    }
                    Some(4) => {
                        let mut rgba = img.to_rgba8().into_raw();
                        if matches!(format, PixelFormat::BGRA | PixelFormat::BGR0) {
                            rgba.chunks_exact_mut(4).for_each(|p| p.swap(0, 2));
                        }
                        rgba
                    }
                    _ => {
                        return Err(BackendError::FormatNotSupported(format!(
                            "images cannot be replayed as {}",
                            format
                        )));
                    }
                };
                let n = pixels.len().min(buf.len());
                buf[..n].copy_from_slice(&pixels[..n]);
            }
            FrameSource::Synthetic => {
                let row = buf.len() / height.max(1) as usize;
                let shift = (index as usize).wrapping_mul(4);
                for (y, line) in buf.chunks_mut(row.max(1)).enumerate() {
                    for (x, px) in line.iter_mut().enumerate() {
                        *px = (x + y + shift) as u8;
                    }
                }
            }
        }
        Ok(())
    }
}

pub struct EmulatorBackend {
    source: Option<FrameSource>,
    pool: Option<Arc<BufferPool>>,
    stats: Arc<EmulatorStats>,
    width: u32,
    height: u32,
    format: PixelFormat,
    frame_size: usize,
    frame_rate: f64,
    realtime: bool,
    looping: bool,
    next_index: u64,
    started_at: Option<Instant>,
}

impl EmulatorBackend {
    pub fn new() -> Self {
        Self {
            source: None,
            pool: None,
            stats: Arc::new(EmulatorStats::default()),
            width: 0,
            height: 0,
            format: PixelFormat::RGB24,
            frame_size: 0,
            frame_rate: 1.0,
            realtime: false,
            looping: false,
            next_index: 0,
            started_at: None,
        }
    }

    /// Handle on the buffer counters, valid after the backend moves away
    pub fn stats(&self) -> Arc<EmulatorStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for EmulatorBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraBackend for EmulatorBackend {
    fn open(&mut self, config: &CameraConfig) -> BackendResult<CameraMetadata> {
        let format = config.pixel_format_input;
        let frame_size = format.frame_size(config.width, config.height);
        let source = FrameSource::open(config.emulator_source.as_deref(), frame_size)?;

        info!(
            camera = %config.name,
            width = config.width,
            height = config.height,
            format = %format,
            frames = ?source.len(),
            "Opened camera emulation"
        );

        self.pool = Some(Arc::new(BufferPool::new(
            config.buffer_size,
            frame_size,
            Arc::clone(&self.stats),
        )));
        self.source = Some(source);
        self.width = config.width;
        self.height = config.height;
        self.format = format;
        self.frame_size = frame_size;
        self.frame_rate = config.frame_rate;
        self.realtime = config.emulator_realtime;
        self.looping = config.emulator_loop;
        self.next_index = 0;

        Ok(CameraMetadata {
            width: config.width,
            height: config.height,
            pixel_format: format,
            serial: format!("emu-{}", config.selection),
            model: config
                .emulator_source
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "synthetic".to_string()),
        })
    }

    fn start_grabbing(&mut self) -> bool {
        if self.source.is_none() {
            warn!("start_grabbing called before open");
            return false;
        }
        self.started_at = Some(Instant::now());
        true
    }

    fn grab_frame(&mut self, timeout: Duration) -> BackendResult<GrabOutcome> {
        let (Some(source), Some(pool), Some(started_at)) =
            (self.source.as_mut(), self.pool.as_ref(), self.started_at)
        else {
            return Err(BackendError::DeviceLost("emulator not started".to_string()));
        };

        let mut index = self.next_index;
        if let Some(len) = source.len()
            && index >= len
        {
            if !self.looping {
                return Err(BackendError::SourceExhausted(format!(
                    "replayed all {} frames",
                    len
                )));
            }
            index %= len;
        }

        let due = Duration::from_secs_f64(self.next_index as f64 / self.frame_rate);
        if self.realtime {
            let elapsed = started_at.elapsed();
            if elapsed < due {
                let wait = due - elapsed;
                if wait > timeout {
                    std::thread::sleep(timeout);
                    return Ok(GrabOutcome::Timeout);
                }
                std::thread::sleep(wait);
            }
        }

        let Some(mut slot) = pool.take() else {
            return Ok(GrabOutcome::Timeout);
        };
        if let Err(e) = source.fill(index, &mut slot, self.width, self.height, self.format) {
            pool.put(slot);
            return Err(e);
        }

        let timestamp = if self.realtime {
            started_at.elapsed().as_secs_f64()
        } else {
            due.as_secs_f64()
        };
        self.next_index += 1;

        Ok(GrabOutcome::Frame(RawFrame {
            width: self.width,
            height: self.height,
            format: self.format,
            timestamp,
            data: FrameData::Borrowed(Box::new(PoolLease {
                bytes: Some(slot),
                pool: Arc::clone(pool),
            })),
        }))
    }

    fn close(&mut self) -> BackendResult<()> {
        if self.source.is_none() {
            return Ok(());
        }
        self.source = None;
        // Outstanding leases keep the pool alive until they come back
        self.pool = None;
        self.started_at = None;
        debug!(
            leased = self.stats.leased(),
            released = self.stats.released(),
            "Emulator closed"
        );
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.source.is_some()
    }

    fn backend_type(&self) -> CameraBackendType {
        CameraBackendType::Emulator
    }
}
