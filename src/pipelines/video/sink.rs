// SPDX-License-Identifier: GPL-3.0-only

//! Chunked encoder sink
//!
//! ```text
//! OpeningChunk(n) ──▶ Streaming(n) ──▶ ClosingChunk(n) ──┬──▶ OpeningChunk(n+1)
//!        ▲                                               ├──▶ OpeningChunk(n) remainder, after encoder failure
//!        │                                               ├──▶ Discarding, after a second failure
//!        └───────────────────────────────────────────────┴──▶ SessionClosed
//! ```
//!
//! The sink is the only consumer of the frame channel and the only place a
//! frame's pixel buffer is dropped, so a borrowed buffer is released exactly
//! once whichever way the frame leaves the sink.

use super::chunk::{ChunkNaming, ChunkPlan, ChunkWindow};
use super::encoder::{EncoderFactory, EncoderParams, EncoderPipe};
use crate::constants::pipeline;
use crate::errors::RecordingError;
use crate::pipelines::channels::{
    CaptureReport, FrameMessage, FrameReceiver, FrameRecord, LedgerMessage, LedgerSender,
    StopReason, StopSender,
};
use crate::pipelines::ledger::{ChunkLedger, SinkReport};
use chrono::Local;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Chunk with an open encoder
struct ActiveChunk {
    encoder: Box<dyn EncoderPipe>,
    ledger: ChunkLedger,
    /// Encoder failures so far within this planned window
    failures: u32,
}

impl ActiveChunk {
    fn window(&self) -> ChunkWindow {
        self.ledger.window
    }
}

/// What follows the chunk being closed
enum AfterClose {
    Rollover(FrameRecord),
    Reopen {
        window: ChunkWindow,
        frame: FrameRecord,
        failures: u32,
    },
    GiveUp(FrameRecord),
    Final(CaptureReport),
}

enum SinkState {
    OpeningChunk {
        window: ChunkWindow,
        carry: Option<FrameRecord>,
        failures: u32,
    },
    Streaming(ActiveChunk),
    ClosingChunk {
        chunk: ActiveChunk,
        then: AfterClose,
    },
    /// Encoder unusable; throw frames away until the stop sentinel
    Discarding,
    SessionClosed(CaptureReport),
}

impl SinkState {
    fn name(&self) -> &'static str {
        match self {
            SinkState::OpeningChunk { .. } => "OpeningChunk",
            SinkState::Streaming(_) => "Streaming",
            SinkState::ClosingChunk { .. } => "ClosingChunk",
            SinkState::Discarding => "Discarding",
            SinkState::SessionClosed(_) => "SessionClosed",
        }
    }
}

#[derive(Debug, Default)]
struct SinkCounters {
    frames_seen: u64,
    last_timestamp: f64,
    frames_written: u64,
    encoder_drops: u64,
    overflow_drops: u64,
    discarded: u64,
    chunks: usize,
    open_failures: usize,
    max_backlog: usize,
    encoder_failed: bool,
}

/// Streams frames into one encoder per chunk window
pub struct EncoderSink {
    camera: String,
    plan: ChunkPlan,
    naming: ChunkNaming,
    params: EncoderParams,
    factory: Arc<dyn EncoderFactory>,
    ledger_tx: LedgerSender,
    stop_tx: Option<StopSender>,
    close_grace: Duration,
    counters: SinkCounters,
}

impl EncoderSink {
    pub fn new(
        camera: &str,
        plan: ChunkPlan,
        naming: ChunkNaming,
        params: EncoderParams,
        factory: Arc<dyn EncoderFactory>,
        ledger_tx: LedgerSender,
    ) -> Self {
        Self {
            camera: camera.to_string(),
            plan,
            naming,
            params,
            factory,
            ledger_tx,
            stop_tx: None,
            close_grace: crate::constants::timing::ENCODER_CLOSE_GRACE,
            counters: SinkCounters::default(),
        }
    }

    /// Where to ask the capture loop to stop when the encoder fails for good
    pub fn with_stop_sender(mut self, stop_tx: StopSender) -> Self {
        self.stop_tx = Some(stop_tx);
        self
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    /// Consume the frame channel until its stop sentinel
    pub fn run(mut self, mut rx: FrameReceiver) -> SinkReport {
        let started_at = Local::now();
        let mut state = match self.plan.window(0) {
            Some(window) => SinkState::OpeningChunk {
                window,
                carry: None,
                failures: 0,
            },
            None => {
                warn!(camera = %self.camera, "Nothing to record, waiting for stop");
                SinkState::Discarding
            }
        };

        let capture = loop {
            debug!(camera = %self.camera, state = state.name(), "Sink state");
            state = match state {
                SinkState::OpeningChunk {
                    window,
                    carry,
                    failures,
                } => self.open_chunk(window, carry, failures),
                SinkState::Streaming(chunk) => {
                    let message = self.next_message(&mut rx, started_at);
                    self.on_message(chunk, message)
                }
                SinkState::ClosingChunk { chunk, then } => self.close_chunk(chunk, then),
                SinkState::Discarding => match self.next_message(&mut rx, started_at) {
                    FrameMessage::Frame(frame) => {
                        self.counters.discarded += 1;
                        drop(frame);
                        SinkState::Discarding
                    }
                    FrameMessage::Stop(report) => SinkState::SessionClosed(report),
                },
                SinkState::SessionClosed(report) => break report,
            };
        };

        let c = &self.counters;
        let report = SinkReport {
            capture,
            frames_written: c.frames_written,
            encoder_drops: c.encoder_drops,
            overflow_drops: c.overflow_drops,
            discarded: c.discarded,
            chunks: c.chunks,
            open_failures: c.open_failures,
            max_backlog: c.max_backlog,
            encoder_failed: c.encoder_failed,
        };
        info!(
            camera = %self.camera,
            written = report.frames_written,
            chunks = report.chunks,
            max_backlog = report.max_backlog,
            "Encoder sink closed"
        );
        if self.ledger_tx.send(LedgerMessage::Stop(report.clone())).is_err() {
            warn!(camera = %self.camera, "Ledger writer is gone");
        }
        report
    }

    pub fn spawn(self, rx: FrameReceiver) -> std::io::Result<JoinHandle<SinkReport>> {
        thread::Builder::new()
            .name(format!("{}-sink", self.camera))
            .spawn(move || self.run(rx))
    }

    /// Blocking pop; a vanished producer counts as a lost device
    fn next_message(&mut self, rx: &mut FrameReceiver, started_at: chrono::DateTime<Local>) -> FrameMessage {
        let message = rx.blocking_recv();
        let backlog = rx.len();
        if backlog > self.counters.max_backlog {
            if backlog > pipeline::BACKLOG_WARN_FRAMES
                && self.counters.max_backlog <= pipeline::BACKLOG_WARN_FRAMES
            {
                warn!(camera = %self.camera, backlog, "Encoder is falling behind capture");
            }
            self.counters.max_backlog = backlog;
        }

        match message {
            Some(FrameMessage::Frame(frame)) => {
                self.counters.frames_seen += 1;
                self.counters.last_timestamp = frame.timestamp;
                FrameMessage::Frame(frame)
            }
            Some(stop) => stop,
            None => {
                error!(camera = %self.camera, "Frame channel closed without a stop sentinel");
                FrameMessage::Stop(CaptureReport {
                    frames_grabbed: self.counters.frames_seen,
                    grab_errors: 0,
                    last_timestamp: self.counters.last_timestamp,
                    stop_reason: StopReason::DeviceLost,
                    started_at,
                    ended_at: Local::now(),
                })
            }
        }
    }

    fn open_chunk(
        &mut self,
        window: ChunkWindow,
        carry: Option<FrameRecord>,
        failures: u32,
    ) -> SinkState {
        let video_path = self.naming.video_path(&window, self.params.extension());
        let timestamps_path = self.naming.timestamps_path(&window);

        match self.factory.open(&video_path, &self.params) {
            Ok(encoder) => {
                info!(
                    camera = %self.camera,
                    chunk = window.index,
                    start = window.start,
                    end = window.end,
                    path = %video_path.display(),
                    "Opened chunk"
                );
                let chunk = ActiveChunk {
                    encoder,
                    ledger: ChunkLedger::new(window, video_path, timestamps_path),
                    failures,
                };
                match carry {
                    Some(frame) => self.deliver(chunk, frame),
                    None => SinkState::Streaming(chunk),
                }
            }
            Err(e) => {
                error!(camera = %self.camera, chunk = window.index, error = %e, "Could not open encoder");
                self.counters.open_failures += 1;
                let failures = failures + 1;
                if failures > pipeline::ENCODER_REOPEN_LIMIT {
                    if let Some(frame) = carry {
                        self.counters.discarded += 1;
                        drop(frame);
                    }
                    self.give_up()
                } else {
                    SinkState::OpeningChunk {
                        window,
                        carry,
                        failures,
                    }
                }
            }
        }
    }

    fn on_message(&mut self, chunk: ActiveChunk, message: FrameMessage) -> SinkState {
        match message {
            FrameMessage::Stop(report) => SinkState::ClosingChunk {
                chunk,
                then: AfterClose::Final(report),
            },
            FrameMessage::Frame(frame) => self.deliver(chunk, frame),
        }
    }

    fn deliver(&mut self, mut chunk: ActiveChunk, frame: FrameRecord) -> SinkState {
        let sequence = frame.sequence;
        let window = chunk.window();

        if sequence >= self.plan.total_frames() {
            warn!(
                camera = %self.camera,
                frame = sequence,
                planned = self.plan.total_frames(),
                "Frame past the planned total, clipping"
            );
            self.counters.overflow_drops += 1;
            return SinkState::Streaming(chunk);
        }
        if sequence >= window.end {
            return SinkState::ClosingChunk {
                chunk,
                then: AfterClose::Rollover(frame),
            };
        }
        if sequence < window.start {
            warn!(camera = %self.camera, frame = sequence, "Frame arrived out of order, dropping");
            self.counters.encoder_drops += 1;
            return SinkState::Streaming(chunk);
        }

        match chunk.encoder.send(&frame.pixels) {
            Ok(()) => {
                chunk.ledger.push(sequence, frame.timestamp);
                self.counters.frames_written += 1;
                SinkState::Streaming(chunk)
            }
            Err(RecordingError::EncoderProcessFailure(reason)) => {
                error!(camera = %self.camera, chunk = window.index, frame = sequence, %reason, "Encoder failed");
                chunk.ledger.failed = true;
                let failures = chunk.failures + 1;
                let then = if failures > pipeline::ENCODER_REOPEN_LIMIT {
                    AfterClose::GiveUp(frame)
                } else {
                    AfterClose::Reopen {
                        window: window.remainder_from(sequence),
                        frame,
                        failures,
                    }
                };
                SinkState::ClosingChunk { chunk, then }
            }
            Err(e) => {
                warn!(camera = %self.camera, frame = sequence, error = %e, "Dropped frame");
                self.counters.encoder_drops += 1;
                SinkState::Streaming(chunk)
            }
        }
    }

    fn close_chunk(&mut self, chunk: ActiveChunk, then: AfterClose) -> SinkState {
        let ActiveChunk {
            encoder,
            mut ledger,
            ..
        } = chunk;

        if let Err(e) = encoder.close(self.close_grace) {
            if !ledger.failed {
                error!(camera = %self.camera, chunk = ledger.window.index, error = %e, "Encoder did not finalize");
                ledger.failed = true;
            }
        }
        ledger.finish();
        self.counters.chunks += 1;
        info!(
            camera = %self.camera,
            chunk = ledger.window.index,
            frames = ledger.len(),
            failed = ledger.failed,
            "Closed chunk"
        );
        if self.ledger_tx.send(LedgerMessage::Chunk(ledger)).is_err() {
            warn!(camera = %self.camera, "Ledger writer is gone");
        }

        match then {
            AfterClose::Rollover(frame) => match self.plan.window_for(frame.sequence) {
                Some(window) => SinkState::OpeningChunk {
                    window,
                    carry: Some(frame),
                    failures: 0,
                },
                None => {
                    self.counters.overflow_drops += 1;
                    SinkState::Discarding
                }
            },
            AfterClose::Reopen {
                window,
                frame,
                failures,
            } => {
                info!(camera = %self.camera, chunk = window.index, from = window.start, "Reopening encoder");
                SinkState::OpeningChunk {
                    window,
                    carry: Some(frame),
                    failures,
                }
            }
            AfterClose::GiveUp(frame) => {
                self.counters.discarded += 1;
                drop(frame);
                self.give_up()
            }
            AfterClose::Final(report) => SinkState::SessionClosed(report),
        }
    }

    fn give_up(&mut self) -> SinkState {
        error!(camera = %self.camera, "Encoder failed repeatedly, stopping the session");
        self.counters.encoder_failed = true;
        if let Some(stop_tx) = &self.stop_tx {
            if stop_tx.send(StopReason::EncoderFailure).is_err() {
                debug!(camera = %self.camera, "Capture loop already stopped");
            }
        }
        SinkState::Discarding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::{FrameData, PixelFormat};
    use crate::config::EncoderSettings;
    use crate::constants::GpuMake;
    use crate::pipelines::channels::{frame_channel, ledger_channel, stop_channel};
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    /// Records what each opened encoder received
    #[derive(Default)]
    struct RecordingFactory {
        opened: Mutex<Vec<PathBuf>>,
        fail_at: Mutex<Vec<u64>>,
        /// Opens to refuse before succeeding
        refuse_opens: Mutex<u32>,
    }

    struct RecordingPipe {
        fail_at: Vec<u64>,
        sent: u64,
        first: Option<u64>,
    }

    impl EncoderPipe for RecordingPipe {
        fn send(&mut self, frame: &[u8]) -> Result<(), RecordingError> {
            let sequence = frame[0] as u64;
            self.first.get_or_insert(sequence);
            if self.fail_at.contains(&sequence) && self.sent > 0 {
                return Err(RecordingError::EncoderProcessFailure("pipe broke".into()));
            }
            self.sent += 1;
            Ok(())
        }

        fn close(self: Box<Self>, _grace: Duration) -> Result<(), RecordingError> {
            Ok(())
        }
    }

    impl EncoderFactory for RecordingFactory {
        fn open(
            &self,
            path: &Path,
            _params: &EncoderParams,
        ) -> Result<Box<dyn EncoderPipe>, RecordingError> {
            let mut refuse = self.refuse_opens.lock().unwrap();
            if *refuse > 0 {
                *refuse -= 1;
                return Err(RecordingError::EncoderProcessFailure("spawn failed".into()));
            }
            self.opened.lock().unwrap().push(path.to_path_buf());
            Ok(Box::new(RecordingPipe {
                fail_at: self.fail_at.lock().unwrap().clone(),
                sent: 0,
                first: None,
            }))
        }
    }

    fn params() -> EncoderParams {
        EncoderParams {
            width: 1,
            height: 1,
            frame_rate: 10.0,
            pixel_format_input: PixelFormat::Gray8,
            settings: EncoderSettings {
                codec: "raw".into(),
                quality: 21,
                preset: None,
                pixel_format_output: "gray".into(),
                gpu_id: -1,
                gpu_make: GpuMake::Nvidia,
                ffmpeg_path: PathBuf::from("ffmpeg"),
                ffmpeg_log_level: "quiet".into(),
            },
        }
    }

    fn frame(sequence: u64) -> FrameMessage {
        FrameMessage::Frame(FrameRecord {
            sequence,
            timestamp: sequence as f64 / 10.0,
            width: 1,
            height: 1,
            pixels: FrameData::Copied(Arc::from(vec![sequence as u8])),
        })
    }

    fn stop(frames: u64, reason: StopReason) -> FrameMessage {
        FrameMessage::Stop(CaptureReport {
            frames_grabbed: frames,
            grab_errors: 0,
            last_timestamp: frames.saturating_sub(1) as f64 / 10.0,
            stop_reason: reason,
            started_at: Local::now(),
            ended_at: Local::now(),
        })
    }

    fn drain_ledgers(mut rx: crate::pipelines::channels::LedgerReceiver) -> Vec<ChunkLedger> {
        let mut out = Vec::new();
        while let Some(LedgerMessage::Chunk(l)) = rx.blocking_recv() {
            out.push(l);
        }
        out
    }

    fn sink(factory: Arc<RecordingFactory>, total: u64, chunk: u64) -> (EncoderSink, crate::pipelines::channels::LedgerReceiver) {
        let (ledger_tx, ledger_rx) = ledger_channel();
        let naming = ChunkNaming::new(Path::new("/tmp"), "cam", "sess");
        (
            EncoderSink::new("cam", ChunkPlan::new(total, chunk), naming, params(), factory, ledger_tx),
            ledger_rx,
        )
    }

    #[test]
    fn test_rollover_delivers_frame_to_next_chunk() {
        let factory = Arc::new(RecordingFactory::default());
        let (sink, ledger_rx) = sink(Arc::clone(&factory), 25, 10);
        let (tx, rx) = frame_channel();
        for n in 0..25 {
            tx.send(frame(n)).unwrap();
        }
        tx.send(stop(25, StopReason::TimeLimit)).unwrap();

        let report = sink.run(rx);
        let ledgers = drain_ledgers(ledger_rx);

        assert_eq!(report.frames_written, 25);
        assert_eq!(report.chunks, 3);
        let ranges: Vec<_> = ledgers
            .iter()
            .map(|l| (l.first_sequence(), l.last_sequence()))
            .collect();
        assert_eq!(ranges, vec![(Some(0), Some(9)), (Some(10), Some(19)), (Some(20), Some(24))]);
        assert!(ledgers.iter().all(ChunkLedger::is_contiguous));
        assert_eq!(factory.opened.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_overflow_is_clipped() {
        let factory = Arc::new(RecordingFactory::default());
        let (sink, _ledger_rx) = sink(factory, 5, 10);
        let (tx, rx) = frame_channel();
        for n in 0..7 {
            tx.send(frame(n)).unwrap();
        }
        tx.send(stop(7, StopReason::TimeLimit)).unwrap();
        let report = sink.run(rx);
        assert_eq!(report.frames_written, 5);
        assert_eq!(report.overflow_drops, 2);
    }

    #[test]
    fn test_encoder_failure_reopens_once() {
        let factory = Arc::new(RecordingFactory::default());
        factory.fail_at.lock().unwrap().push(4);
        let (sink, ledger_rx) = sink(Arc::clone(&factory), 10, 10);
        let (tx, rx) = frame_channel();
        for n in 0..10 {
            tx.send(frame(n)).unwrap();
        }
        tx.send(stop(10, StopReason::TimeLimit)).unwrap();

        let report = sink.run(rx);
        let ledgers = drain_ledgers(ledger_rx);

        assert_eq!(report.frames_written, 10);
        assert!(!report.encoder_failed);
        assert_eq!(ledgers.len(), 2);
        assert!(ledgers[0].failed);
        assert_eq!(ledgers[0].last_sequence(), Some(3));
        assert_eq!(ledgers[1].window.start, 4);
        assert_eq!(ledgers[1].first_sequence(), Some(4));
        let opened = factory.opened.lock().unwrap();
        assert_eq!(opened[1], Path::new("/tmp/cam_sess_4-9.raw"));
    }

    #[test]
    fn test_second_failure_stops_capture() {
        let factory = Arc::new(RecordingFactory::default());
        factory.fail_at.lock().unwrap().extend([3, 6]);
        let (sink, ledger_rx) = sink(Arc::clone(&factory), 20, 20);
        let (stop_tx, mut stop_rx) = stop_channel();
        let sink = sink.with_stop_sender(stop_tx);
        let (tx, rx) = frame_channel();
        for n in 0..10 {
            tx.send(frame(n)).unwrap();
        }
        tx.send(stop(10, StopReason::EncoderFailure)).unwrap();

        let report = sink.run(rx);
        let ledgers = drain_ledgers(ledger_rx);

        assert!(report.encoder_failed);
        assert_eq!(stop_rx.try_recv().ok(), Some(StopReason::EncoderFailure));
        assert_eq!(report.frames_written, 6);
        assert_eq!(report.discarded, 4);
        assert_eq!(ledgers.len(), 2);
        assert!(ledgers.iter().all(|l| l.failed));
    }

    #[test]
    fn test_second_failure_after_capture_stopped() {
        let factory = Arc::new(RecordingFactory::default());
        factory.fail_at.lock().unwrap().extend([3, 6]);
        let (sink, _ledger_rx) = sink(Arc::clone(&factory), 20, 20);
        let (stop_tx, stop_rx) = stop_channel();
        drop(stop_rx);
        let sink = sink.with_stop_sender(stop_tx);
        let (tx, rx) = frame_channel();
        for n in 0..10 {
            tx.send(frame(n)).unwrap();
        }
        tx.send(stop(10, StopReason::TimeLimit)).unwrap();

        let report = sink.run(rx);
        assert!(report.encoder_failed);
        assert_eq!(report.frames_written, 6);
        assert_eq!(report.discarded, 4);
    }

    #[test]
    fn test_open_failure_counted_apart_from_ledgers() {
        let factory = Arc::new(RecordingFactory::default());
        *factory.refuse_opens.lock().unwrap() = 1;
        let (sink, ledger_rx) = sink(Arc::clone(&factory), 10, 10);
        let (tx, rx) = frame_channel();
        for n in 0..10 {
            tx.send(frame(n)).unwrap();
        }
        tx.send(stop(10, StopReason::TimeLimit)).unwrap();

        let report = sink.run(rx);
        let ledgers = drain_ledgers(ledger_rx);

        assert_eq!(report.open_failures, 1);
        assert_eq!(report.chunks, 1);
        assert_eq!(report.frames_written, 10);
        assert_eq!(ledgers.len(), 1);
        assert!(!ledgers[0].failed);
        assert!(!report.encoder_failed);
    }

    #[test]
    fn test_missing_sentinel_counts_as_device_lost() {
        let factory = Arc::new(RecordingFactory::default());
        let (sink, _ledger_rx) = sink(factory, 10, 10);
        let (tx, rx) = frame_channel();
        tx.send(frame(0)).unwrap();
        drop(tx);
        let report = sink.run(rx);
        assert_eq!(report.capture.stop_reason, StopReason::DeviceLost);
        assert_eq!(report.frames_written, 1);
    }
}
