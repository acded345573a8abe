// SPDX-License-Identifier: GPL-3.0-only

//! Timestamp ledgers and the session summary
//!
//! The encoder sink hands every closed chunk's ledger to the writer, which
//! persists it at once. When the sink's stop sentinel arrives the writer
//! derives the [`SessionSummary`] from all ledgers, writes the session
//! metadata file and exits.

use crate::constants::app_info;
use crate::errors::RecordingError;
use crate::pipelines::channels::{CaptureReport, LedgerMessage, LedgerReceiver, StopReason};
use crate::pipelines::video::ChunkWindow;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// One row of a `_timestamps.csv` file
#[derive(Debug, Serialize)]
struct LedgerRow {
    #[serde(rename = "frameNumber")]
    frame_number: u64,
    /// Fixed six decimals
    timestamp: String,
}

fn csv_error(path: &Path, err: csv::Error) -> RecordingError {
    RecordingError::LedgerWrite(format!("{}: {}", path.display(), err))
}

/// Frame numbers and timestamps observed while one chunk was open
#[derive(Debug, Clone)]
pub struct ChunkLedger {
    pub window: ChunkWindow,
    /// `(sequence, timestamp)` in arrival order
    pub entries: Vec<(u64, f64)>,
    pub started_at: DateTime<Local>,
    pub ended_at: Option<DateTime<Local>>,
    /// The encoder died while this chunk was open
    pub failed: bool,
    pub video_path: PathBuf,
    pub timestamps_path: PathBuf,
}

impl ChunkLedger {
    pub fn new(window: ChunkWindow, video_path: PathBuf, timestamps_path: PathBuf) -> Self {
        Self {
            window,
            entries: Vec::with_capacity(window.len() as usize),
            started_at: Local::now(),
            ended_at: None,
            failed: false,
            video_path,
            timestamps_path,
        }
    }

    pub fn push(&mut self, sequence: u64, timestamp: f64) {
        self.entries.push((sequence, timestamp));
    }

    pub fn finish(&mut self) {
        self.ended_at = Some(Local::now());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first_sequence(&self) -> Option<u64> {
        self.entries.first().map(|(n, _)| *n)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.entries.last().map(|(n, _)| *n)
    }

    /// Frames missing between the window start and the last recorded frame
    pub fn gaps(&self) -> u64 {
        match self.last_sequence() {
            Some(last) => (last + 1)
                .saturating_sub(self.window.start)
                .saturating_sub(self.entries.len() as u64),
            None => 0,
        }
    }

    /// Entries are strictly ascending, inside the window, and without holes
    pub fn is_contiguous(&self) -> bool {
        self.entries
            .iter()
            .enumerate()
            .all(|(i, (n, _))| *n == self.window.start + i as u64)
    }

    /// Write `frameNumber,timestamp` rows
    pub fn write_csv(&self) -> Result<(), RecordingError> {
        let path = &self.timestamps_path;
        let mut wtr = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
        if self.entries.is_empty() {
            wtr.write_record(["frameNumber", "timestamp"])
                .map_err(|e| csv_error(path, e))?;
        }
        for (sequence, timestamp) in &self.entries {
            wtr.serialize(LedgerRow {
                frame_number: *sequence,
                timestamp: format!("{:.6}", timestamp),
            })
            .map_err(|e| csv_error(path, e))?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// What the encoder sink did, carried by the ledger channel's stop sentinel
#[derive(Debug, Clone)]
pub struct SinkReport {
    pub capture: CaptureReport,
    pub frames_written: u64,
    /// Frames the encoder rejected one at a time
    pub encoder_drops: u64,
    /// Frames numbered past the planned total
    pub overflow_drops: u64,
    /// Frames thrown away after the encoder failed for good
    pub discarded: u64,
    /// Chunks closed and handed to the ledger writer
    pub chunks: usize,
    /// Encoder opens that failed
    ///
    /// No ledger exists for a failed open, so these are never part of the
    /// ledger-based [`SessionSummary::failed_chunks`]. A chunk whose encoder
    /// died after opening is flagged on its ledger instead.
    pub open_failures: usize,
    pub max_backlog: usize,
    pub encoder_failed: bool,
}

/// Aggregate over all ledgers of one camera session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    /// Last sequence number + 1
    pub total_frames: u64,
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub grab_errors: u64,
    pub encoder_drops: u64,
    /// Seconds between the first and last grabbed frame
    pub total_time: f64,
    pub effective_fps: f64,
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub stop_reason: StopReason,
    /// Ledgers received, one per closed chunk
    pub chunks: usize,
    /// Ledgers whose encoder died while the chunk was open
    pub failed_chunks: usize,
    /// Encoder opens that failed, taken from the sink
    pub open_failures: usize,
}

impl SessionSummary {
    pub fn compute(report: &SinkReport, ledgers: &[ChunkLedger]) -> Self {
        let written: u64 = ledgers.iter().map(|l| l.len() as u64).sum();
        let last = ledgers.iter().filter_map(ChunkLedger::last_sequence).max();
        let grabbed = report.capture.frames_grabbed;
        let total_frames = last.map(|n| n + 1).unwrap_or(0).max(grabbed);
        let total_time = report.capture.last_timestamp;
        let effective_fps = if total_time > 0.0 {
            total_frames as f64 / total_time
        } else {
            0.0
        };

        Self {
            total_frames,
            frames_written: written,
            frames_dropped: total_frames.saturating_sub(written) + report.capture.grab_errors,
            grab_errors: report.capture.grab_errors,
            encoder_drops: report.encoder_drops,
            total_time,
            effective_fps,
            started_at: report.capture.started_at,
            ended_at: report.capture.ended_at,
            stop_reason: report.capture.stop_reason,
            chunks: ledgers.len(),
            failed_chunks: ledgers.iter().filter(|l| l.failed).count(),
            open_failures: report.open_failures,
        }
    }

    /// Key/value rows appended to the metadata file
    pub fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("totalFrames", self.total_frames.to_string()),
            ("framesWritten", self.frames_written.to_string()),
            ("framesDropped", self.frames_dropped.to_string()),
            ("grabErrors", self.grab_errors.to_string()),
            ("encoderDrops", self.encoder_drops.to_string()),
            ("totalTime", format!("{:.6}", self.total_time)),
            ("effectiveFps", format!("{:.3}", self.effective_fps)),
            ("dateStart", self.started_at.format("%Y-%m-%d").to_string()),
            ("timeStart", self.started_at.format("%H:%M:%S%.3f").to_string()),
            ("dateEnd", self.ended_at.format("%Y-%m-%d").to_string()),
            ("timeEnd", self.ended_at.format("%H:%M:%S%.3f").to_string()),
            ("stopReason", self.stop_reason.to_string()),
            ("chunks", self.chunks.to_string()),
            ("failedChunks", self.failed_chunks.to_string()),
            ("encoderOpenFailures", self.open_failures.to_string()),
            ("version", app_info::version().to_string()),
        ]
    }
}

/// Write a `key,value` metadata file
pub fn write_metadata(path: &Path, rows: &[(&str, String)]) -> Result<(), RecordingError> {
    let mut wtr = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
    wtr.write_record(["key", "value"])
        .map_err(|e| csv_error(path, e))?;
    for (key, value) in rows {
        wtr.write_record([*key, value.as_str()])
            .map_err(|e| csv_error(path, e))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Everything the ledger writer produced
#[derive(Debug, Clone)]
pub struct LedgerOutcome {
    pub ledgers: Vec<ChunkLedger>,
    /// `None` if the sink went away without its stop sentinel
    pub summary: Option<SessionSummary>,
    pub sink: Option<SinkReport>,
    pub metadata_path: PathBuf,
    pub write_errors: u64,
}

/// Persists ledgers for one camera
pub struct LedgerWriter {
    camera: String,
    metadata_path: PathBuf,
    config_rows: Vec<(&'static str, String)>,
}

impl LedgerWriter {
    pub fn new(camera: &str, metadata_path: PathBuf, config_rows: Vec<(&'static str, String)>) -> Self {
        Self {
            camera: camera.to_string(),
            metadata_path,
            config_rows,
        }
    }

    /// Drain the ledger channel until the stop sentinel
    pub fn run(self, mut rx: LedgerReceiver) -> LedgerOutcome {
        let mut ledgers = Vec::new();
        let mut write_errors = 0;
        let mut sink = None;

        while let Some(message) = rx.blocking_recv() {
            match message {
                LedgerMessage::Chunk(ledger) => {
                    if let Err(e) = ledger.write_csv() {
                        error!(camera = %self.camera, error = %e, "Chunk ledger not saved");
                        write_errors += 1;
                    } else {
                        debug!(
                            camera = %self.camera,
                            chunk = ledger.window.index,
                            frames = ledger.len(),
                            path = %ledger.timestamps_path.display(),
                            "Saved chunk ledger"
                        );
                    }
                    if ledger.gaps() > 0 {
                        warn!(
                            camera = %self.camera,
                            chunk = ledger.window.index,
                            missing = ledger.gaps(),
                            "Chunk ledger has gaps"
                        );
                    }
                    ledgers.push(ledger);
                }
                LedgerMessage::Stop(report) => {
                    sink = Some(report);
                    break;
                }
            }
        }

        let summary = sink.as_ref().map(|report| {
            let summary = SessionSummary::compute(report, &ledgers);
            let mut rows = self.config_rows.clone();
            rows.extend(summary.rows());
            match write_metadata(&self.metadata_path, &rows) {
                Ok(()) => info!(
                    camera = %self.camera,
                    path = %self.metadata_path.display(),
                    "Saved session metadata"
                ),
                Err(e) => {
                    error!(camera = %self.camera, error = %e, "Session metadata not saved");
                    write_errors += 1;
                }
            }
            summary
        });
        if summary.is_none() {
            warn!(camera = %self.camera, "Ledger channel closed without a stop sentinel");
        }

        LedgerOutcome {
            ledgers,
            summary,
            sink,
            metadata_path: self.metadata_path,
            write_errors,
        }
    }

    pub fn spawn(self, rx: LedgerReceiver) -> std::io::Result<JoinHandle<LedgerOutcome>> {
        thread::Builder::new()
            .name(format!("{}-ledger", self.camera))
            .spawn(move || self.run(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines::channels::ledger_channel;

    fn window(index: u64, start: u64, end: u64) -> ChunkWindow {
        ChunkWindow { index, start, end }
    }

    fn ledger(w: ChunkWindow, frames: impl Iterator<Item = u64>) -> ChunkLedger {
        let mut l = ChunkLedger::new(w, PathBuf::new(), PathBuf::new());
        for n in frames {
            l.push(n, n as f64 / 10.0);
        }
        l.finish();
        l
    }

    fn sink_report(grabbed: u64, last_timestamp: f64) -> SinkReport {
        SinkReport {
            capture: CaptureReport {
                frames_grabbed: grabbed,
                grab_errors: 0,
                last_timestamp,
                stop_reason: StopReason::TimeLimit,
                started_at: Local::now(),
                ended_at: Local::now(),
            },
            frames_written: grabbed,
            encoder_drops: 0,
            overflow_drops: 0,
            discarded: 0,
            chunks: 0,
            open_failures: 0,
            max_backlog: 0,
            encoder_failed: false,
        }
    }

    #[test]
    fn test_gap_detection() {
        let full = ledger(window(0, 10, 20), 10..20);
        assert!(full.is_contiguous());
        assert_eq!(full.gaps(), 0);

        let holed = ledger(window(0, 10, 20), [10, 11, 14, 15].into_iter());
        assert!(!holed.is_contiguous());
        assert_eq!(holed.gaps(), 2);

        let partial = ledger(window(0, 0, 100), 0..16);
        assert!(partial.is_contiguous());
        assert_eq!(partial.gaps(), 0);
    }

    #[test]
    fn test_summary_from_ledgers() {
        let ledgers = vec![
            ledger(window(0, 0, 10), 0..10),
            ledger(window(1, 10, 20), 10..20),
            ledger(window(2, 20, 30), (20..30).filter(|n| *n != 25)),
        ];
        let summary = SessionSummary::compute(&sink_report(30, 2.9), &ledgers);
        assert_eq!(summary.total_frames, 30);
        assert_eq!(summary.frames_written, 29);
        assert_eq!(summary.frames_dropped, 1);
        assert_eq!(summary.chunks, 3);
        assert!((summary.effective_fps - 30.0 / 2.9).abs() < 1e-9);
    }

    #[test]
    fn test_open_failures_not_counted_as_failed_chunks() {
        let mut died = ledger(window(1, 10, 20), 10..14);
        died.failed = true;
        let ledgers = vec![ledger(window(0, 0, 10), 0..10), died];
        let mut report = sink_report(14, 1.3);
        report.open_failures = 2;
        report.chunks = ledgers.len();

        let summary = SessionSummary::compute(&report, &ledgers);
        assert_eq!(summary.chunks, 2);
        assert_eq!(summary.failed_chunks, 1);
        assert_eq!(summary.open_failures, 2);
        let rows = summary.rows();
        assert!(rows.contains(&("failedChunks", "1".to_string())));
        assert!(rows.contains(&("encoderOpenFailures", "2".to_string())));
    }

    #[test]
    fn test_metadata_values_are_quoted_when_needed() {
        let dir = std::env::temp_dir().join(format!("ledger-quote-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cam_metadata.csv");
        let rows = vec![
            ("cameraName", "front".to_string()),
            ("notes", "a\"b".to_string()),
            ("pins", "2,3".to_string()),
            ("comment", "first\nsecond".to_string()),
        ];
        write_metadata(&path, &rows).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.iter().collect::<Vec<_>>(), vec!["key", "value"]);
        let parsed: Vec<(String, String)> = reader
            .records()
            .map(|r| {
                let r = r.unwrap();
                assert_eq!(r.len(), 2);
                (r[0].to_string(), r[1].to_string())
            })
            .collect();
        let expected: Vec<(String, String)> =
            rows.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        assert_eq!(parsed, expected);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_empty_ledger_still_has_header() {
        let dir = std::env::temp_dir().join(format!("ledger-empty-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut empty = ledger(window(0, 0, 10), 0..0);
        empty.timestamps_path = dir.join("cam_timestamps.csv");
        empty.write_csv().unwrap();
        let csv = std::fs::read_to_string(&empty.timestamps_path).unwrap();
        assert_eq!(csv, "frameNumber,timestamp\n");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_writer_persists_chunks_and_metadata() {
        let dir = std::env::temp_dir().join(format!("ledger-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let mut chunk = ledger(window(0, 0, 3), 0..3);
        chunk.timestamps_path = dir.join("cam_0-2_timestamps.csv");
        let (tx, rx) = ledger_channel();
        tx.send(LedgerMessage::Chunk(chunk)).unwrap();
        tx.send(LedgerMessage::Stop(sink_report(3, 0.2))).unwrap();

        let writer = LedgerWriter::new("cam", dir.join("cam_metadata.csv"), vec![("frameRate", "10".into())]);
        let outcome = writer.run(rx);

        let csv = std::fs::read_to_string(dir.join("cam_0-2_timestamps.csv")).unwrap();
        assert_eq!(csv, "frameNumber,timestamp\n0,0.000000\n1,0.100000\n2,0.200000\n");
        let meta = std::fs::read_to_string(dir.join("cam_metadata.csv")).unwrap();
        assert!(meta.starts_with("key,value\nframeRate,10\n"));
        assert!(meta.contains("totalFrames,3\n"));
        assert!(meta.contains("stopReason,timeLimit\n"));
        assert_eq!(outcome.summary.map(|s| s.total_frames), Some(3));
        assert_eq!(outcome.write_errors, 0);

        std::fs::remove_dir_all(&dir).ok();
    }
}
