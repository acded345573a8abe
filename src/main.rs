// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;

mod cli;

#[derive(Parser)]
#[command(name = "multicam")]
#[command(about = "Record synchronized cameras into chunked video files")]
#[command(version = multicam::constants::app_info::version())]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record every configured camera
    Record {
        /// JSON configuration file
        config: PathBuf,

        /// Number of cameras
        #[arg(long)]
        num_cams: Option<usize>,

        /// Root folder for the session's files
        #[arg(long)]
        video_folder: Option<PathBuf>,

        /// Capture rate in Hz
        #[arg(long)]
        frame_rate: Option<f64>,

        /// Recording length in seconds
        #[arg(long)]
        rec_time: Option<f64>,

        /// Seconds of video per output file
        #[arg(long)]
        chunk_length: Option<f64>,

        /// Camera backend for every camera (v4l2, gstreamer, emu)
        #[arg(long)]
        camera_make: Option<String>,

        /// Encoder codec (h264, h265, raw)
        #[arg(long)]
        codec: Option<String>,

        /// Preview mode (none, log, snapshot)
        #[arg(long)]
        display: Option<String>,

        /// Start the hardware trigger
        #[arg(long)]
        start_trigger: Option<bool>,

        /// Override any config key, value parsed as JSON (repeatable)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
}

fn main() -> ExitCode {
    // Set RUST_LOG to control log level, e.g. RUST_LOG=multicam=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn,multicam=info")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Record {
            config,
            num_cams,
            video_folder,
            frame_rate,
            rec_time,
            chunk_length,
            camera_make,
            codec,
            display,
            start_trigger,
            set,
        } => {
            let mut overrides: Vec<(String, Value)> = Vec::new();
            let mut put = |key: &str, value: Option<Value>| {
                if let Some(value) = value {
                    overrides.push((key.to_string(), value));
                }
            };
            put("numCams", num_cams.map(Value::from));
            put(
                "videoFolder",
                video_folder.map(|p| Value::from(p.display().to_string())),
            );
            put("frameRate", frame_rate.map(Value::from));
            put("recTimeInSec", rec_time.map(Value::from));
            put("chunkLengthInSec", chunk_length.map(Value::from));
            put("cameraMake", camera_make.map(Value::from));
            put("codec", codec.map(Value::from));
            put("display", display.map(Value::from));
            put("startTrigger", start_trigger.map(Value::from));

            ExitCode::from(cli::record(&config, overrides, &set))
        }
    }
}
