// SPDX-License-Identifier: GPL-3.0-only

//! Multi-camera recording session
//!
//! Every camera runs on its own thread and owns its backend, channels and
//! consumers; nothing mutable is shared between cameras. The coordinator
//! only exchanges events with the camera threads:
//!
//! ```text
//! camera threads ── Ready / OpenFailed ──▶ coordinator ── start trigger
//!                ◀──────── go ──────────                │
//!                ── Draining (every camera) ──▶         └─ stop trigger
//! ```

use crate::backends::camera::{self, CameraBackend, close_with_retry};
use crate::backends::trigger::{TriggerController, get_trigger};
use crate::config::{CameraConfig, TriggerConfig};
use crate::constants::{DisplayMode, files, pipeline, timing};
use crate::errors::{AppError, CameraError};
use crate::pipelines::capture::{CaptureLoop, CaptureSettings, PipelineState};
use crate::pipelines::channels::{
    StopReason, StopSender, frame_channel, ledger_channel, preview_channel, stop_channel,
};
use crate::pipelines::display::{DisplayConsumer, preview_sink};
use crate::pipelines::ledger::{LedgerWriter, SessionSummary};
use crate::pipelines::video::{
    ChunkNaming, ChunkPlan, DefaultEncoderFactory, EncoderFactory, EncoderParams, EncoderSink,
};
use chrono::Local;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Builds the backend for one camera
pub type BackendFactory = Arc<dyn Fn(&CameraConfig) -> Box<dyn CameraBackend> + Send + Sync>;

/// How one camera's session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraOutcome {
    Completed,
    Interrupted,
    DeviceLost,
    EncoderFailed,
    OpenFailed,
}

impl CameraOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, CameraOutcome::Completed | CameraOutcome::Interrupted)
    }
}

/// Result of one camera's session
#[derive(Debug, Clone)]
pub struct CameraReport {
    pub camera: String,
    pub outcome: CameraOutcome,
    pub summary: Option<SessionSummary>,
    pub chunk_paths: Vec<PathBuf>,
    pub ledger_paths: Vec<PathBuf>,
    pub metadata_path: Option<PathBuf>,
    /// Every pipeline state the camera went through, in order
    pub states: Vec<PipelineState>,
    pub error: Option<AppError>,
}

impl CameraReport {
    fn failed(camera: &str, error: AppError) -> Self {
        Self {
            camera: camera.to_string(),
            outcome: CameraOutcome::OpenFailed,
            summary: None,
            chunk_paths: Vec::new(),
            ledger_paths: Vec::new(),
            metadata_path: None,
            states: Vec::new(),
            error: Some(error),
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.summary.as_ref().map(|s| s.frames_written).unwrap_or(0)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.summary.as_ref().map(|s| s.frames_dropped).unwrap_or(0)
    }
}

/// Result of the whole recording
#[derive(Debug, Clone)]
pub struct RecordingReport {
    pub session: String,
    pub cameras: Vec<CameraReport>,
}

impl RecordingReport {
    /// 0 when every camera ended cleanly, 3 when a camera could not be
    /// opened, 1 for any other abnormal end
    pub fn exit_code(&self) -> u8 {
        if self
            .cameras
            .iter()
            .any(|c| c.outcome == CameraOutcome::OpenFailed)
        {
            3
        } else if self.cameras.iter().all(|c| c.outcome.is_clean()) {
            0
        } else {
            1
        }
    }
}

/// Stops every camera's capture loop from outside the session
#[derive(Clone)]
pub struct InterruptHandle {
    senders: Vec<StopSender>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        info!("Interrupt requested, stopping capture");
        for (index, tx) in self.senders.iter().enumerate() {
            if tx.send(StopReason::Interrupted).is_err() {
                debug!(camera = index, "Capture loop already stopped");
            }
        }
    }
}

#[derive(Debug)]
enum SessionEvent {
    Ready(usize),
    OpenFailed(usize),
    State(usize, PipelineState),
}

type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// Everything one camera thread needs
struct CameraSession {
    config: CameraConfig,
    session: String,
    backend: Box<dyn CameraBackend>,
    encoder_factory: Arc<dyn EncoderFactory>,
    stop_tx: StopSender,
    stop_rx: crate::pipelines::channels::StopReceiver,
    events: EventSender,
    go: oneshot::Receiver<()>,
}

impl CameraSession {
    fn run(mut self) -> CameraReport {
        let index = self.config.index;
        let name = self.config.name.clone();

        let metadata = match self.open() {
            Ok(metadata) => metadata,
            Err(e) => {
                error!(camera = %name, error = %e, "Camera not started");
                let _ = self.events.send(SessionEvent::OpenFailed(index));
                return CameraReport::failed(&name, e);
            }
        };
        let _ = self.events.send(SessionEvent::Ready(index));

        // Released when every camera is ready and the trigger is running
        if self.go.blocking_recv().is_err() {
            debug!(camera = %name, "Coordinator gone, starting anyway");
        }

        let config = &self.config;
        let camera_dir = config.camera_dir();
        let naming = ChunkNaming::new(&camera_dir, &name, &self.session);
        let plan = ChunkPlan::new(config.total_frames(), config.chunk_length_frames());
        let params = EncoderParams {
            width: metadata.width,
            height: metadata.height,
            frame_rate: config.frame_rate,
            pixel_format_input: metadata.pixel_format,
            settings: config.encoder.clone(),
        };
        info!(
            camera = %name,
            frames = plan.total_frames(),
            chunks = plan.count(),
            width = params.width,
            height = params.height,
            "Recording"
        );

        let (frame_tx, frame_rx) = frame_channel();
        let (ledger_tx, ledger_rx) = ledger_channel();
        let mut metadata_rows = config.metadata_rows();
        metadata_rows.push(("serial", metadata.serial.clone()));
        metadata_rows.push(("model", metadata.model.clone()));

        let ledger = LedgerWriter::new(&name, naming.metadata_path(), metadata_rows).spawn(ledger_rx);
        let sink = EncoderSink::new(
            &name,
            plan,
            naming.clone(),
            params,
            Arc::clone(&self.encoder_factory),
            ledger_tx,
        )
        .with_stop_sender(self.stop_tx.clone())
        .spawn(frame_rx);

        let (preview_tx, display) = match (config.display, config.frame_ratio()) {
            (DisplayMode::None, _) | (_, None) => (None, None),
            (mode, Some(_)) => {
                let (tx, rx) = preview_channel(pipeline::PREVIEW_CAPACITY);
                let consumer =
                    DisplayConsumer::new(&name, preview_sink(mode, &name, &naming.preview_path()));
                match consumer.spawn(rx) {
                    Ok(handle) => (Some(tx), Some(handle)),
                    Err(e) => {
                        warn!(camera = %name, error = %e, "Preview disabled");
                        (None, None)
                    }
                }
            }
        };

        let (sink, ledger) = match (sink, ledger) {
            (Ok(sink), Ok(ledger)) => (sink, ledger),
            (sink, ledger) => {
                let e = sink.err().or(ledger.err()).map(|e| e.to_string()).unwrap_or_default();
                error!(camera = %name, error = %e, "Could not start pipeline threads");
                let _ = self.events.send(SessionEvent::State(index, PipelineState::Draining));
                let _ = close_with_retry(
                    self.backend.as_mut(),
                    &name,
                    timing::CLOSE_RETRY_ATTEMPTS,
                    timing::CLOSE_RETRY_BACKOFF,
                );
                let mut report = CameraReport::failed(&name, AppError::Other(e));
                report.outcome = CameraOutcome::DeviceLost;
                return report;
            }
        };

        let events = self.events.clone();
        let states = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&states);
        let capture = CaptureLoop::new(
            &name,
            self.backend,
            CaptureSettings::from_config(config),
            frame_tx,
            preview_tx,
            self.stop_rx,
        )
        .with_state_observer(move |state| {
            seen.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(state);
            let _ = events.send(SessionEvent::State(index, state));
        });

        // Capture runs on this thread; the consumers drain behind it
        let outcome = capture.run();
        let sink_report = join(&name, "sink", sink);
        if let Some(display) = display {
            join(&name, "display", display);
        }
        let ledger = join(&name, "ledger", ledger);

        let mut backend = outcome.backend;
        close_with_retry(
            backend.as_mut(),
            &name,
            timing::CLOSE_RETRY_ATTEMPTS,
            timing::CLOSE_RETRY_BACKOFF,
        );

        let mut states = std::mem::take(
            &mut *states
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        states.push(PipelineState::Closed);
        let _ = self.events.send(SessionEvent::State(index, PipelineState::Closed));

        let encoder_failed = sink_report.as_ref().map(|r| r.encoder_failed).unwrap_or(true);
        let outcome = match outcome.report.stop_reason {
            _ if encoder_failed => CameraOutcome::EncoderFailed,
            StopReason::TimeLimit => CameraOutcome::Completed,
            StopReason::Interrupted => CameraOutcome::Interrupted,
            StopReason::DeviceLost => CameraOutcome::DeviceLost,
            StopReason::EncoderFailure => CameraOutcome::EncoderFailed,
        };

        let (summary, chunk_paths, ledger_paths, metadata_path) = match ledger {
            Some(l) => (
                l.summary,
                l.ledgers.iter().map(|c| c.video_path.clone()).collect(),
                l.ledgers.iter().map(|c| c.timestamps_path.clone()).collect(),
                Some(l.metadata_path),
            ),
            None => (None, Vec::new(), Vec::new(), None),
        };

        CameraReport {
            camera: name,
            outcome,
            summary,
            chunk_paths,
            ledger_paths,
            metadata_path,
            states,
            error: match outcome {
                CameraOutcome::DeviceLost => Some(AppError::Camera(CameraError::DeviceLost {
                    camera: self.config.name.clone(),
                    reason: "capture ended early".to_string(),
                })),
                _ => None,
            },
        }
    }

    fn open(&mut self) -> Result<crate::backends::camera::CameraMetadata, AppError> {
        let name = self.config.name.clone();
        let unavailable = |reason: String| {
            AppError::Camera(CameraError::DeviceUnavailable {
                camera: name.clone(),
                reason,
            })
        };

        std::fs::create_dir_all(self.config.camera_dir()).map_err(|e| {
            AppError::Storage(format!("{}: {}", self.config.camera_dir().display(), e))
        })?;

        let metadata = self
            .backend
            .open(&self.config)
            .map_err(|e| unavailable(e.to_string()))?;
        info!(
            camera = %name,
            backend = %self.backend.backend_type(),
            serial = %metadata.serial,
            model = %metadata.model,
            width = metadata.width,
            height = metadata.height,
            "Camera opened"
        );

        if !self.backend.start_grabbing() {
            close_with_retry(
                self.backend.as_mut(),
                &name,
                timing::CLOSE_RETRY_ATTEMPTS,
                timing::CLOSE_RETRY_BACKOFF,
            );
            return Err(unavailable("could not start grabbing".to_string()));
        }
        Ok(metadata)
    }
}

fn join<T>(camera: &str, role: &str, handle: JoinHandle<T>) -> Option<T> {
    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            error!(camera = %camera, role, "Pipeline thread panicked");
            None
        }
    }
}

/// Records every configured camera in parallel
pub struct Recorder {
    cameras: Vec<CameraConfig>,
    trigger_config: Option<TriggerConfig>,
    trigger: Option<Box<dyn TriggerController>>,
    backend_factory: BackendFactory,
    encoder_factory: Arc<dyn EncoderFactory>,
    session: String,
    stop_senders: Vec<StopSender>,
    stop_receivers: Vec<crate::pipelines::channels::StopReceiver>,
}

impl Recorder {
    pub fn new(cameras: Vec<CameraConfig>, trigger_config: Option<TriggerConfig>) -> Self {
        let (stop_senders, stop_receivers): (Vec<_>, Vec<_>) =
            cameras.iter().map(|_| stop_channel()).unzip();
        Self {
            trigger: trigger_config.as_ref().map(get_trigger),
            trigger_config,
            cameras,
            backend_factory: Arc::new(|config: &CameraConfig| camera::get_backend(config.make)),
            encoder_factory: Arc::new(DefaultEncoderFactory),
            session: Local::now().format(files::SESSION_TIME_FORMAT).to_string(),
            stop_senders,
            stop_receivers,
        }
    }

    pub fn with_backend_factory(mut self, factory: BackendFactory) -> Self {
        self.backend_factory = factory;
        self
    }

    pub fn with_encoder_factory(mut self, factory: Arc<dyn EncoderFactory>) -> Self {
        self.encoder_factory = factory;
        self
    }

    pub fn with_trigger(mut self, trigger: Box<dyn TriggerController>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_session_name(mut self, session: &str) -> Self {
        self.session = session.to_string();
        self
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            senders: self.stop_senders.clone(),
        }
    }

    /// Run every camera to completion
    pub fn run(mut self) -> RecordingReport {
        info!(session = %self.session, cameras = self.cameras.len(), "Starting recording");
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut go_senders = Vec::new();
        let mut handles = Vec::new();

        let receivers = std::mem::take(&mut self.stop_receivers);
        for ((config, stop_rx), stop_tx) in self
            .cameras
            .iter()
            .cloned()
            .zip(receivers)
            .zip(self.stop_senders.iter().cloned())
        {
            let (go_tx, go_rx) = oneshot::channel();
            let name = config.name.clone();
            let session = CameraSession {
                backend: (self.backend_factory)(&config),
                config,
                session: self.session.clone(),
                encoder_factory: Arc::clone(&self.encoder_factory),
                stop_tx,
                stop_rx,
                events: events_tx.clone(),
                go: go_rx,
            };
            match thread::Builder::new()
                .name(format!("camera-{}", name))
                .spawn(move || session.run())
            {
                Ok(handle) => {
                    go_senders.push(Some(go_tx));
                    handles.push((name, Ok(handle)));
                }
                Err(e) => {
                    go_senders.push(None);
                    handles.push((name, Err(e)));
                }
            }
        }
        drop(events_tx);

        self.coordinate(&mut events_rx, go_senders);

        let cameras = handles
            .into_iter()
            .map(|(name, handle)| match handle {
                Ok(handle) => handle.join().unwrap_or_else(|_| {
                    CameraReport::failed(&name, AppError::Other("camera thread panicked".into()))
                }),
                Err(e) => CameraReport::failed(&name, AppError::Other(e.to_string())),
            })
            .collect::<Vec<_>>();

        for report in &cameras {
            info!(
                camera = %report.camera,
                outcome = ?report.outcome,
                written = report.frames_written(),
                dropped = report.frames_dropped(),
                "Camera finished"
            );
        }

        RecordingReport {
            session: self.session,
            cameras,
        }
    }

    /// Gate the capture loops behind the trigger and stop it once every
    /// started camera is draining
    fn coordinate(
        &mut self,
        events_rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
        mut go_senders: Vec<Option<oneshot::Sender<()>>>,
    ) {
        let expected = go_senders.iter().filter(|g| g.is_some()).count();
        let mut ready = Vec::new();
        let mut answered = 0;

        while answered < expected {
            match events_rx.blocking_recv() {
                Some(SessionEvent::Ready(i)) => {
                    ready.push(i);
                    answered += 1;
                }
                Some(SessionEvent::OpenFailed(_)) => answered += 1,
                Some(SessionEvent::State(..)) => {}
                None => break,
            }
        }

        let mut trigger = if ready.is_empty() {
            None
        } else {
            self.trigger.take()
        };
        if let (Some(trigger), Some(config)) = (trigger.as_mut(), self.trigger_config.as_ref()) {
            if let Err(e) = trigger.start(config.frame_rate, &config.digital_pins) {
                warn!(error = %e, "Trigger did not start, cameras will free-run");
            }
        }

        for go in go_senders.iter_mut().filter_map(Option::take) {
            let _ = go.send(());
        }

        let mut draining = 0;
        while draining < ready.len() {
            match events_rx.blocking_recv() {
                Some(SessionEvent::State(i, PipelineState::Draining)) => {
                    debug!(camera = i, "Camera draining");
                    draining += 1;
                }
                Some(_) => {}
                None => break,
            }
        }

        if let Some(mut trigger) = trigger {
            if let Err(e) = trigger.stop() {
                warn!(error = %e, "Trigger did not stop cleanly");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcome: CameraOutcome) -> CameraReport {
        let mut r = CameraReport::failed("cam", AppError::Other(String::new()));
        r.outcome = outcome;
        r
    }

    #[test]
    fn test_exit_codes() {
        let of = |outcomes: &[CameraOutcome]| RecordingReport {
            session: String::new(),
            cameras: outcomes.iter().copied().map(report).collect(),
        }
        .exit_code();

        assert_eq!(of(&[CameraOutcome::Completed, CameraOutcome::Interrupted]), 0);
        assert_eq!(of(&[CameraOutcome::Completed, CameraOutcome::DeviceLost]), 1);
        assert_eq!(of(&[CameraOutcome::EncoderFailed]), 1);
        assert_eq!(of(&[CameraOutcome::DeviceLost, CameraOutcome::OpenFailed]), 3);
    }

    #[test]
    fn test_interrupt_reaches_live_loops_after_one_stopped() {
        let (gone_tx, gone_rx) = stop_channel();
        let (live_tx, mut live_rx) = stop_channel();
        drop(gone_rx);

        let handle = InterruptHandle {
            senders: vec![gone_tx, live_tx],
        };
        handle.interrupt();
        assert_eq!(live_rx.try_recv().ok(), Some(StopReason::Interrupted));
    }
}
