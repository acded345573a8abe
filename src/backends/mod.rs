// SPDX-License-Identifier: GPL-3.0-only

//! Hardware access layer
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               Orchestrator                   │
//! └────────────────────┬────────────────────────┘
//!                      │
//! ┌────────────────────┴────────────────────────┐
//! │              Backend Layer                   │
//! │  ┌──────────────────┐  ┌────────────────┐   │
//! │  │      Camera      │  │    Trigger     │   │
//! │  │ V4L2 / GStreamer │  │ (serial link)  │   │
//! │  │    / Emulator    │  │                │   │
//! │  └──────────────────┘  └────────────────┘   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! - [`camera`]: Camera backends behind one capability-set trait
//! - [`trigger`]: Synchronized exposure pulse generator

pub mod camera;
pub mod trigger;
