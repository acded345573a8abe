// SPDX-License-Identifier: GPL-3.0-only

//! Chunked video writing
//!
//! - [`chunk`]: Window arithmetic and file naming
//! - [`encoder`]: ffmpeg process and raw-file encoders
//! - [`sink`]: State machine feeding one encoder per chunk

pub mod chunk;
pub mod encoder;
pub mod sink;

pub use chunk::{ChunkNaming, ChunkPlan, ChunkWindow};
pub use encoder::{DefaultEncoderFactory, EncoderFactory, EncoderParams, EncoderPipe};
pub use sink::EncoderSink;
