// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for constants module

use multicam::constants::{DisplayMode, defaults, files, pipeline, timing};

#[test]
fn test_display_modes_round_trip_names() {
    assert_eq!(DisplayMode::ALL.len(), 3);
    for mode in DisplayMode::ALL {
        let parsed: DisplayMode =
            serde_json::from_str(&format!("\"{}\"", mode.display_name())).unwrap();
        assert_eq!(parsed, mode);
    }
}

#[test]
fn test_poll_is_short_and_close_is_bounded() {
    // Capture must poll, never block long on the backend
    assert!(timing::GRAB_POLL_TIMEOUT.as_millis() <= 10);
    assert!(timing::POLL_RETRY_SLEEP < timing::GRAB_POLL_TIMEOUT);

    // Worst-case close time stays finite
    let worst: u32 = (0..timing::CLOSE_RETRY_ATTEMPTS).map(|n| 1 << n).sum();
    assert!(timing::CLOSE_RETRY_BACKOFF * worst < std::time::Duration::from_secs(10));
}

#[test]
fn test_preview_channel_is_small() {
    assert_eq!(pipeline::PREVIEW_CAPACITY, 2);
    assert_eq!(pipeline::ENCODER_REOPEN_LIMIT, 1);
}

#[test]
fn test_default_chunks_fit_recording() {
    assert!(defaults::CHUNK_LENGTH_SECS <= defaults::REC_TIME_SECS);
    assert!(defaults::DISPLAY_FRAME_RATE < defaults::FRAME_RATE);
}

#[test]
fn test_session_stamp_format() {
    let stamp = chrono::NaiveDate::from_ymd_opt(2024, 3, 9)
        .and_then(|d| d.and_hms_opt(7, 5, 1))
        .unwrap()
        .format(files::SESSION_TIME_FORMAT)
        .to_string();
    assert_eq!(stamp, "20240309_070501");
}
