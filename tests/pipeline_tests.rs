// SPDX-License-Identifier: GPL-3.0-only

//! End-to-end recording tests against the emulated camera and the raw encoder

use multicam::backends::camera::emulator::{EmulatorBackend, EmulatorStats};
use multicam::backends::camera::{
    BackendError, BackendResult, BufferLease, CameraBackend, CameraBackendType, CameraMetadata,
    FrameData, GrabOutcome,
};
use multicam::backends::trigger::TriggerController;
use multicam::config::{CameraConfig, Config, TriggerConfig};
use multicam::errors::{AppError, RecordingError};
use multicam::orchestrator::{CameraOutcome, InterruptHandle, Recorder};
use multicam::pipelines::PipelineState;
use multicam::pipelines::channels::{
    CaptureReport, FrameMessage, FrameRecord, LedgerMessage, StopReason, frame_channel,
    ledger_channel, stop_channel,
};
use multicam::pipelines::video::{
    ChunkNaming, ChunkPlan, EncoderFactory, EncoderParams, EncoderPipe, EncoderSink,
};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WIDTH: u32 = 8;
const HEIGHT: u32 = 4;

struct TempDir(PathBuf);

impl TempDir {
    fn new() -> Self {
        let path = std::env::temp_dir().join(format!("multicam-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path).unwrap();
        Self(path)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn cameras(dir: &Path, extra: Value) -> Vec<CameraConfig> {
    let mut value = json!({
        "numCams": 1,
        "cameraMake": "emu",
        "frameWidth": WIDTH,
        "frameHeight": HEIGHT,
        "pixelFormatInput": "gray",
        "codec": "raw",
        "display": "none",
        "emulatorRealtime": false,
        "bufferSize": 8,
        "videoFolder": dir.display().to_string(),
    });
    if let (Some(obj), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
        obj.extend(extra.clone());
    }
    Config::from_value(value, &[])
        .unwrap()
        .resolve_cameras()
        .unwrap()
}

/// Raw replay file holding `frames` gray frames, frame n filled with n
fn raw_source(dir: &Path, frames: u8) -> PathBuf {
    let path = dir.join("source.raw");
    let bytes: Vec<u8> = (0..frames)
        .flat_map(|n| std::iter::repeat_n(n, (WIDTH * HEIGHT) as usize))
        .collect();
    std::fs::write(&path, bytes).unwrap();
    path
}

fn read_ledger(path: &Path) -> Vec<u64> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(1)
        .map(|line| line.split(',').next().unwrap().parse().unwrap())
        .collect()
}

#[test]
fn test_end_to_end_three_chunks() {
    let dir = TempDir::new();
    let source = raw_source(&dir.0, 30);
    let cams = cameras(
        &dir.0,
        json!({
            "frameRate": 10, "recTimeInSec": 3, "chunkLengthInSec": 1,
            "emulatorSource": source.display().to_string()
        }),
    );

    let report = Recorder::new(cams, None).with_session_name("e2e").run();
    assert_eq!(report.exit_code(), 0);
    let cam = &report.cameras[0];
    assert_eq!(cam.outcome, CameraOutcome::Completed);
    assert_eq!(
        cam.states,
        vec![
            PipelineState::Grabbing,
            PipelineState::Draining,
            PipelineState::Closed
        ]
    );

    let camera_dir = dir.0.join("Camera0");
    let expected = ["0-9", "10-19", "20-29"];
    assert_eq!(cam.chunk_paths.len(), 3);
    for (i, range) in expected.iter().enumerate() {
        let video = camera_dir.join(format!("Camera0_e2e_{}.raw", range));
        assert_eq!(cam.chunk_paths[i], video);
        let bytes = std::fs::read(&video).unwrap();
        assert_eq!(bytes.len(), 10 * (WIDTH * HEIGHT) as usize);
        // Frames arrive in order: first byte of chunk i is frame 10 * i
        assert_eq!(bytes[0] as usize, 10 * i);

        let ledger = read_ledger(&camera_dir.join(format!("Camera0_e2e_{}_timestamps.csv", range)));
        let start = 10 * i as u64;
        assert_eq!(ledger, (start..start + 10).collect::<Vec<_>>());
    }

    let summary = cam.summary.as_ref().unwrap();
    assert_eq!(summary.total_frames, 30);
    assert_eq!(summary.frames_written, 30);
    assert_eq!(summary.frames_dropped, 0);
    assert_eq!(summary.stop_reason, StopReason::TimeLimit);

    let metadata = std::fs::read_to_string(camera_dir.join("Camera0_e2e_metadata.csv")).unwrap();
    assert!(metadata.contains("totalFrames,30\n"));
    assert!(metadata.contains("cameraMake,emu\n"));
    assert!(metadata.contains("chunks,3\n"));
}

/// Emulator that fires an interrupt once it has produced a given frame
struct InterruptAt {
    inner: EmulatorBackend,
    at: u64,
    grabbed: u64,
    handle: InterruptHandle,
}

impl CameraBackend for InterruptAt {
    fn open(&mut self, config: &CameraConfig) -> BackendResult<CameraMetadata> {
        self.inner.open(config)
    }
    fn start_grabbing(&mut self) -> bool {
        self.inner.start_grabbing()
    }
    fn grab_frame(&mut self, timeout: Duration) -> BackendResult<GrabOutcome> {
        let outcome = self.inner.grab_frame(timeout)?;
        if let GrabOutcome::Frame(_) = &outcome {
            if self.grabbed == self.at {
                self.handle.interrupt();
            }
            self.grabbed += 1;
        }
        Ok(outcome)
    }
    fn close(&mut self) -> BackendResult<()> {
        self.inner.close()
    }
    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
    fn backend_type(&self) -> CameraBackendType {
        CameraBackendType::Emulator
    }
}

#[test]
fn test_interrupt_mid_session() {
    let dir = TempDir::new();
    let cams = cameras(
        &dir.0,
        json!({ "frameRate": 10, "recTimeInSec": 10, "chunkLengthInSec": 10 }),
    );

    let recorder = Recorder::new(cams, None).with_session_name("stop");
    let handle = recorder.interrupt_handle();
    let recorder = recorder.with_backend_factory(Arc::new(move |_config: &CameraConfig| {
        Box::new(InterruptAt {
            inner: EmulatorBackend::new(),
            at: 15,
            grabbed: 0,
            handle: handle.clone(),
        }) as Box<dyn CameraBackend>
    }));

    let report = recorder.run();
    assert_eq!(report.exit_code(), 0);
    let cam = &report.cameras[0];
    assert_eq!(cam.outcome, CameraOutcome::Interrupted);
    assert_eq!(cam.ledger_paths.len(), 1);
    assert_eq!(read_ledger(&cam.ledger_paths[0]), (0..16).collect::<Vec<_>>());

    let summary = cam.summary.as_ref().unwrap();
    assert_eq!(summary.stop_reason, StopReason::Interrupted);
    assert_eq!(summary.total_frames, 16);
    assert_eq!(summary.frames_written, 16);
}

/// Encoder whose process "dies" after a fixed number of frames
struct DyingEncoder {
    after: usize,
    sent: Arc<AtomicUsize>,
}

struct DyingPipe {
    left: usize,
    sent: Arc<AtomicUsize>,
}

impl EncoderPipe for DyingPipe {
    fn send(&mut self, _frame: &[u8]) -> Result<(), RecordingError> {
        if self.left == 0 {
            return Err(RecordingError::EncoderProcessFailure("broken pipe".into()));
        }
        self.left -= 1;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(self: Box<Self>, _grace: Duration) -> Result<(), RecordingError> {
        Ok(())
    }
}

impl EncoderFactory for DyingEncoder {
    fn open(&self, _path: &Path, _params: &EncoderParams) -> Result<Box<dyn EncoderPipe>, RecordingError> {
        Ok(Box::new(DyingPipe {
            left: self.after,
            sent: Arc::clone(&self.sent),
        }))
    }
}

#[test]
fn test_zero_copy_buffers_return_to_pool_after_encoder_failure() {
    let dir = TempDir::new();
    let cams = cameras(
        &dir.0,
        json!({ "frameRate": 10, "recTimeInSec": 10, "chunkLengthInSec": 10, "zeroCopy": true, "bufferSize": 4 }),
    );

    let stats: Arc<Mutex<Option<Arc<EmulatorStats>>>> = Arc::default();
    let seen = Arc::clone(&stats);
    let sent = Arc::new(AtomicUsize::new(0));
    let report = Recorder::new(cams, None)
        .with_session_name("zc")
        .with_backend_factory(Arc::new(move |_config: &CameraConfig| {
            let backend = EmulatorBackend::new();
            *seen.lock().unwrap() = Some(backend.stats());
            Box::new(backend) as Box<dyn CameraBackend>
        }))
        .with_encoder_factory(Arc::new(DyingEncoder {
            after: 5,
            sent: Arc::clone(&sent),
        }))
        .run();

    assert_eq!(report.exit_code(), 1);
    let cam = &report.cameras[0];
    assert_eq!(cam.outcome, CameraOutcome::EncoderFailed);
    // Five frames, then one reopen that also writes five
    assert_eq!(sent.load(Ordering::SeqCst), 10);

    let stats = stats.lock().unwrap().clone().unwrap();
    assert!(stats.leased() >= 11);
    assert_eq!(stats.leased(), stats.released());
    assert_eq!(stats.outstanding(), 0);
}

/// Lease counting how many times it is released
struct CountingLease {
    bytes: Vec<u8>,
    releases: Arc<AtomicUsize>,
}

impl BufferLease for CountingLease {
    fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for CountingLease {
    fn drop(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_each_borrowed_frame_released_exactly_once() {
    let dir = TempDir::new();
    let cam = cameras(&dir.0, json!({ "frameRate": 10, "recTimeInSec": 2 })).remove(0);
    let params = EncoderParams {
        width: WIDTH,
        height: HEIGHT,
        frame_rate: 10.0,
        pixel_format_input: cam.pixel_format_input,
        settings: cam.encoder.clone(),
    };
    let (ledger_tx, mut ledger_rx) = ledger_channel();
    let (stop_tx, mut stop_rx) = stop_channel();
    let sink = EncoderSink::new(
        "Camera0",
        ChunkPlan::new(20, 10),
        ChunkNaming::new(&dir.0, "Camera0", "rel"),
        params,
        Arc::new(DyingEncoder {
            after: 3,
            sent: Arc::new(AtomicUsize::new(0)),
        }),
        ledger_tx,
    )
    .with_stop_sender(stop_tx);

    let counters: Vec<Arc<AtomicUsize>> = (0..20).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let (tx, rx) = frame_channel();
    for (n, releases) in counters.iter().enumerate() {
        tx.send(FrameMessage::Frame(FrameRecord {
            sequence: n as u64,
            timestamp: n as f64 / 10.0,
            width: WIDTH,
            height: HEIGHT,
            pixels: FrameData::Borrowed(Box::new(CountingLease {
                bytes: vec![0; (WIDTH * HEIGHT) as usize],
                releases: Arc::clone(releases),
            })),
        }))
        .unwrap();
    }
    tx.send(FrameMessage::Stop(CaptureReport {
        frames_grabbed: 20,
        grab_errors: 0,
        last_timestamp: 1.9,
        stop_reason: StopReason::TimeLimit,
        started_at: chrono::Local::now(),
        ended_at: chrono::Local::now(),
    }))
    .unwrap();

    let report = sink.run(rx);
    assert!(report.encoder_failed);
    assert_eq!(stop_rx.try_recv().ok(), Some(StopReason::EncoderFailure));
    for (n, releases) in counters.iter().enumerate() {
        assert_eq!(releases.load(Ordering::SeqCst), 1, "frame {} released", n);
    }

    let mut chunks = 0;
    while let Some(message) = ledger_rx.blocking_recv() {
        match message {
            LedgerMessage::Chunk(ledger) => {
                assert!(ledger.failed);
                chunks += 1;
            }
            LedgerMessage::Stop(sink) => {
                assert_eq!(sink.frames_written, 6);
                break;
            }
        }
    }
    assert_eq!(chunks, 2);
}

/// Backend that never finds its device
struct Missing;

impl CameraBackend for Missing {
    fn open(&mut self, config: &CameraConfig) -> BackendResult<CameraMetadata> {
        Err(BackendError::DeviceNotFound(format!("/dev/video{}", config.selection)))
    }
    fn start_grabbing(&mut self) -> bool {
        false
    }
    fn grab_frame(&mut self, _timeout: Duration) -> BackendResult<GrabOutcome> {
        Err(BackendError::DeviceLost("not open".into()))
    }
    fn close(&mut self) -> BackendResult<()> {
        Ok(())
    }
    fn is_open(&self) -> bool {
        false
    }
    fn backend_type(&self) -> CameraBackendType {
        CameraBackendType::V4l2
    }
}

/// Trigger recording the order of handshake calls
struct FakeTrigger {
    calls: Arc<Mutex<Vec<String>>>,
}

impl TriggerController for FakeTrigger {
    fn start(&mut self, frame_rate: f64, pins: &[u8]) -> Result<(), AppError> {
        self.calls.lock().unwrap().push(format!("start {} {:?}", frame_rate, pins));
        Ok(())
    }
    fn stop(&mut self) -> Result<(), AppError> {
        self.calls.lock().unwrap().push("stop".into());
        Ok(())
    }
}

#[test]
fn test_failed_camera_does_not_block_others() {
    let dir = TempDir::new();
    let cams = cameras(
        &dir.0,
        json!({
            "numCams": 2, "cameraNames": ["good", "gone"],
            "frameRate": 20, "recTimeInSec": 1, "chunkLengthInSec": 0.5
        }),
    );
    let calls = Arc::new(Mutex::new(Vec::new()));
    let trigger_config = TriggerConfig {
        controller: "arduino".into(),
        serial_port: "/dev/null".into(),
        digital_pins: vec![0, 1],
        frame_rate: 20.0,
    };

    let report = Recorder::new(cams, Some(trigger_config))
        .with_session_name("multi")
        .with_trigger(Box::new(FakeTrigger {
            calls: Arc::clone(&calls),
        }))
        .with_backend_factory(Arc::new(|config: &CameraConfig| {
            if config.name == "gone" {
                Box::new(Missing) as Box<dyn CameraBackend>
            } else {
                Box::new(EmulatorBackend::new()) as Box<dyn CameraBackend>
            }
        }))
        .run();

    assert_eq!(report.exit_code(), 3);
    let good = report.cameras.iter().find(|c| c.camera == "good").unwrap();
    let gone = report.cameras.iter().find(|c| c.camera == "gone").unwrap();
    assert_eq!(good.outcome, CameraOutcome::Completed);
    assert_eq!(good.frames_written(), 20);
    assert_eq!(good.chunk_paths.len(), 2);
    assert_eq!(gone.outcome, CameraOutcome::OpenFailed);
    assert!(matches!(
        gone.error,
        Some(AppError::Camera(multicam::errors::CameraError::DeviceUnavailable { .. }))
    ));

    assert_eq!(*calls.lock().unwrap(), vec!["start 20 [0, 1]".to_string(), "stop".to_string()]);
}

/// Emulator that waits before every grab and notes its final planned frame
struct Paced {
    inner: EmulatorBackend,
    name: String,
    delay: Duration,
    total: u64,
    grabbed: u64,
    events: Arc<Mutex<Vec<String>>>,
}

impl CameraBackend for Paced {
    fn open(&mut self, config: &CameraConfig) -> BackendResult<CameraMetadata> {
        self.inner.open(config)
    }
    fn start_grabbing(&mut self) -> bool {
        self.inner.start_grabbing()
    }
    fn grab_frame(&mut self, timeout: Duration) -> BackendResult<GrabOutcome> {
        std::thread::sleep(self.delay);
        let outcome = self.inner.grab_frame(timeout)?;
        if let GrabOutcome::Frame(_) = &outcome {
            self.grabbed += 1;
            if self.grabbed == self.total {
                self.events.lock().unwrap().push(format!("{} last frame", self.name));
            }
        }
        Ok(outcome)
    }
    fn close(&mut self) -> BackendResult<()> {
        self.inner.close()
    }
    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
    fn backend_type(&self) -> CameraBackendType {
        CameraBackendType::Emulator
    }
}

#[test]
fn test_trigger_stops_after_slowest_camera_drains() {
    let dir = TempDir::new();
    let cams = cameras(
        &dir.0,
        json!({
            "numCams": 2, "cameraNames": ["fast", "slow"],
            "frameRate": 20, "recTimeInSec": 1, "chunkLengthInSec": 1
        }),
    );
    let total = cams[0].total_frames();
    let events = Arc::new(Mutex::new(Vec::new()));
    let trigger_config = TriggerConfig {
        controller: "arduino".into(),
        serial_port: "/dev/null".into(),
        digital_pins: vec![0, 1],
        frame_rate: 20.0,
    };

    let seen = Arc::clone(&events);
    let report = Recorder::new(cams, Some(trigger_config))
        .with_session_name("pace")
        .with_trigger(Box::new(FakeTrigger {
            calls: Arc::clone(&events),
        }))
        .with_backend_factory(Arc::new(move |config: &CameraConfig| {
            let delay = if config.name == "slow" { 10 } else { 0 };
            Box::new(Paced {
                inner: EmulatorBackend::new(),
                name: config.name.clone(),
                delay: Duration::from_millis(delay),
                total,
                grabbed: 0,
                events: Arc::clone(&seen),
            }) as Box<dyn CameraBackend>
        }))
        .run();

    assert_eq!(report.exit_code(), 0);
    for cam in &report.cameras {
        assert_eq!(cam.outcome, CameraOutcome::Completed);
        assert_eq!(cam.frames_written(), total);
        assert!(cam.states.contains(&PipelineState::Draining));
    }

    let events = events.lock().unwrap();
    let at = |event: &str| events.iter().position(|e| e == event).unwrap();
    assert_eq!(events.first().map(String::as_str), Some("start 20 [0, 1]"));
    assert!(at("fast last frame") < at("slow last frame"));
    assert!(at("slow last frame") < at("stop"));
    assert_eq!(events.last().map(String::as_str), Some("stop"));
}
