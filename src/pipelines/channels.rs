// SPDX-License-Identifier: GPL-3.0-only

//! Channels between the capture loop and its consumers
//!
//! ```text
//!                 ┌──── Preview Channel (drop-oldest, cap 2) ───▶ Display
//! Capture Loop ───┤
//!                 └──── Frame Channel (FIFO) ───▶ Encoder Sink ──── Ledger Channel ───▶ Ledger Writer
//! ```
//!
//! Shutdown travels through the same channels as data: every channel ends
//! with a stop sentinel, so a consumer only sees "stop" after it has seen
//! every item sent before it.

use crate::backends::camera::{FrameData, PixelFormat};
use crate::pipelines::ledger::{ChunkLedger, SinkReport};
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// One captured image on its way to the encoder
#[derive(Debug)]
pub struct FrameRecord {
    /// 0-based, assigned at grab time
    pub sequence: u64,
    /// Seconds since the session's first frame
    pub timestamp: f64,
    pub width: u32,
    pub height: u32,
    pub pixels: FrameData,
}

/// Why a capture loop stopped grabbing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Planned frame count reached
    TimeLimit,
    /// Operator interrupt
    Interrupted,
    /// Camera gone or replay source exhausted
    DeviceLost,
    /// Encoder failed twice within one chunk
    EncoderFailure,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::TimeLimit => "timeLimit",
            StopReason::Interrupted => "interrupted",
            StopReason::DeviceLost => "deviceLost",
            StopReason::EncoderFailure => "encoderFailure",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the capture loop saw, carried by the frame channel's stop sentinel
#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub frames_grabbed: u64,
    pub grab_errors: u64,
    /// Timestamp of the last grabbed frame, seconds since the first
    pub last_timestamp: f64,
    pub stop_reason: StopReason,
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
}

/// Frame channel item
#[derive(Debug)]
pub enum FrameMessage {
    Frame(FrameRecord),
    Stop(CaptureReport),
}

/// Ledger channel item
#[derive(Debug)]
pub enum LedgerMessage {
    /// A chunk was closed; persist its timestamps now
    Chunk(ChunkLedger),
    /// The sink has finished; write the session summary and exit
    Stop(SinkReport),
}

pub type FrameSender = mpsc::UnboundedSender<FrameMessage>;
pub type FrameReceiver = mpsc::UnboundedReceiver<FrameMessage>;
pub type LedgerSender = mpsc::UnboundedSender<LedgerMessage>;
pub type LedgerReceiver = mpsc::UnboundedReceiver<LedgerMessage>;
pub type StopSender = mpsc::UnboundedSender<StopReason>;
pub type StopReceiver = mpsc::UnboundedReceiver<StopReason>;

pub fn frame_channel() -> (FrameSender, FrameReceiver) {
    mpsc::unbounded_channel()
}

pub fn ledger_channel() -> (LedgerSender, LedgerReceiver) {
    mpsc::unbounded_channel()
}

pub fn stop_channel() -> (StopSender, StopReceiver) {
    mpsc::unbounded_channel()
}

/// A downsampled copy of a frame for display
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    pub sequence: u64,
    pub timestamp: f64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pixels: Vec<u8>,
}

/// Preview channel item
#[derive(Debug)]
pub enum PreviewMessage {
    Frame(PreviewFrame),
    Stop,
}

struct PreviewState {
    frames: VecDeque<PreviewFrame>,
    capacity: usize,
    stopped: bool,
    dropped: u64,
}

struct PreviewShared {
    state: Mutex<PreviewState>,
    ready: Condvar,
}

impl PreviewShared {
    fn lock(&self) -> MutexGuard<'_, PreviewState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Producer half of the preview channel; never blocks
pub struct PreviewSender {
    shared: Arc<PreviewShared>,
}

/// Consumer half of the preview channel
pub struct PreviewReceiver {
    shared: Arc<PreviewShared>,
}

/// Bounded drop-oldest channel for preview frames
pub fn preview_channel(capacity: usize) -> (PreviewSender, PreviewReceiver) {
    let shared = Arc::new(PreviewShared {
        state: Mutex::new(PreviewState {
            frames: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            stopped: false,
            dropped: 0,
        }),
        ready: Condvar::new(),
    });
    (
        PreviewSender {
            shared: Arc::clone(&shared),
        },
        PreviewReceiver { shared },
    )
}

impl PreviewSender {
    /// Queue a frame, evicting the oldest unread one when full
    ///
    /// Returns true if a frame was evicted.
    pub fn push(&self, frame: PreviewFrame) -> bool {
        let mut state = self.shared.lock();
        let evicted = if state.frames.len() >= state.capacity {
            state.frames.pop_front();
            state.dropped += 1;
            true
        } else {
            false
        };
        state.frames.push_back(frame);
        drop(state);
        self.shared.ready.notify_one();
        evicted
    }

    /// Send the stop sentinel
    ///
    /// Frames already queued are still delivered before it.
    pub fn close(&self) {
        self.shared.lock().stopped = true;
        self.shared.ready.notify_all();
    }

    /// Frames evicted so far
    pub fn dropped(&self) -> u64 {
        self.shared.lock().dropped
    }
}

impl Drop for PreviewSender {
    fn drop(&mut self) {
        self.close();
    }
}

impl PreviewReceiver {
    /// Wait for the next frame or the stop sentinel
    pub fn recv(&self) -> PreviewMessage {
        let mut state = self.shared.lock();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                return PreviewMessage::Frame(frame);
            }
            if state.stopped {
                return PreviewMessage::Stop;
            }
            state = self
                .shared
                .ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Next message if one is ready
    pub fn try_recv(&self) -> Option<PreviewMessage> {
        let mut state = self.shared.lock();
        match state.frames.pop_front() {
            Some(frame) => Some(PreviewMessage::Frame(frame)),
            None if state.stopped => Some(PreviewMessage::Stop),
            None => None,
        }
    }

    /// Frames evicted so far
    pub fn dropped(&self) -> u64 {
        self.shared.lock().dropped
    }
}
