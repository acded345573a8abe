// SPDX-License-Identifier: GPL-3.0-only

//! Chunk windows and output file names
//!
//! A recording of `total` frames is cut into windows of `chunk_length`
//! frames. Windows are half-open, contiguous, and the last one is clipped:
//! 100 frames in chunks of 30 gives `[0,30) [30,60) [60,90) [90,100)`.

use crate::constants::files;
use std::path::{Path, PathBuf};

/// Half-open frame range `[start, end)` written to one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkWindow {
    pub index: u64,
    pub start: u64,
    pub end: u64,
}

impl ChunkWindow {
    pub fn contains(&self, sequence: u64) -> bool {
        (self.start..self.end).contains(&sequence)
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Last frame number in the window
    pub fn last(&self) -> u64 {
        self.end.saturating_sub(1)
    }

    /// Same window starting at `start`, used when an encoder is reopened mid-chunk
    pub fn remainder_from(&self, start: u64) -> Self {
        Self {
            index: self.index,
            start: start.clamp(self.start, self.end),
            end: self.end,
        }
    }
}

/// Partition of `[0, total_frames)` into chunk windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total_frames: u64,
    chunk_length: u64,
}

impl ChunkPlan {
    pub fn new(total_frames: u64, chunk_length: u64) -> Self {
        Self {
            total_frames,
            chunk_length: chunk_length.max(1),
        }
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn chunk_length(&self) -> u64 {
        self.chunk_length
    }

    /// Number of windows in the plan
    pub fn count(&self) -> u64 {
        self.total_frames.div_ceil(self.chunk_length)
    }

    /// Window `n`, or `None` past the end of the recording
    pub fn window(&self, index: u64) -> Option<ChunkWindow> {
        let start = index.checked_mul(self.chunk_length)?;
        if start >= self.total_frames {
            return None;
        }
        Some(ChunkWindow {
            index,
            start,
            end: (start + self.chunk_length).min(self.total_frames),
        })
    }

    /// Window holding frame `sequence`
    pub fn window_for(&self, sequence: u64) -> Option<ChunkWindow> {
        self.window(sequence / self.chunk_length)
    }

    pub fn windows(&self) -> impl Iterator<Item = ChunkWindow> + '_ {
        (0..self.count()).filter_map(|n| self.window(n))
    }
}

/// File names for one camera in one session
///
/// `<dir>/<camera>_<session>_<start>-<last>.<ext>` and friends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkNaming {
    dir: PathBuf,
    camera: String,
    session: String,
}

impl ChunkNaming {
    pub fn new(dir: &Path, camera: &str, session: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            camera: camera.to_string(),
            session: session.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stem(&self, window: &ChunkWindow) -> String {
        format!(
            "{}_{}_{}-{}",
            self.camera,
            self.session,
            window.start,
            window.last()
        )
    }

    pub fn video_path(&self, window: &ChunkWindow, extension: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", self.stem(window), extension))
    }

    pub fn timestamps_path(&self, window: &ChunkWindow) -> PathBuf {
        self.dir
            .join(format!("{}{}", self.stem(window), files::TIMESTAMPS_SUFFIX))
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(format!(
            "{}_{}{}",
            self.camera,
            self.session,
            files::METADATA_SUFFIX
        ))
    }

    pub fn preview_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}{}", self.camera, files::PREVIEW_SUFFIX))
    }
}
