// SPDX-License-Identifier: GPL-3.0-only

//! Per-camera acquisition-to-disk pipeline
//!
//! ```text
//! ┌──────────────┐  preview   ┌───────────────────┐
//! │ Capture Loop │ ─────────▶ │      Display      │
//! │  (producer)  │            └───────────────────┘
//! │              │  frames    ┌───────────────────┐  ledgers  ┌───────────────┐
//! │              │ ─────────▶ │   Encoder Sink    │ ────────▶ │ Ledger Writer │
//! └──────────────┘            │ (one file/chunk)  │           └───────────────┘
//!        ▲                    └───────────────────┘
//!        └──── stop channel (interrupt, encoder failure)
//! ```
//!
//! Each box runs on its own thread and owns its state; the boxes talk only
//! through the channels in [`channels`].
//!
//! - [`capture`]: Grab loop and `PipelineState`
//! - [`display`]: Preview consumer
//! - [`ledger`]: Timestamp ledgers and session summary
//! - [`video`]: Chunked encoder sink

pub mod capture;
pub mod channels;
pub mod display;
pub mod ledger;
pub mod video;

pub use capture::{CaptureLoop, PipelineState};
pub use channels::{CaptureReport, FrameRecord, StopReason};
pub use ledger::{ChunkLedger, SessionSummary};
