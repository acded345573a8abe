// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the recorder
//!
//! Errors local to one frame or one chunk are absorbed and counted by the
//! pipeline; only the kinds below ever cross a component boundary.

use std::fmt;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Main application error type
#[derive(Debug, Clone)]
pub enum AppError {
    /// Camera-related errors
    Camera(CameraError),
    /// Recording/encoding errors
    Recording(RecordingError),
    /// Configuration errors, always raised before any camera starts
    Config(ConfigError),
    /// Hardware trigger controller errors
    Trigger(String),
    /// Storage/filesystem errors
    Storage(String),
    /// Generic error with message
    Other(String),
}

/// Camera-specific errors
#[derive(Debug, Clone)]
pub enum CameraError {
    /// Camera could not be opened or started; fatal for that camera only
    DeviceUnavailable { camera: String, reason: String },
    /// Camera disappeared while grabbing
    DeviceLost { camera: String, reason: String },
}

/// Recording-specific errors
#[derive(Debug, Clone)]
pub enum RecordingError {
    /// Encoder process unusable (pipe broken, process exited, spawn failed)
    EncoderProcessFailure(String),
    /// A single frame could not be encoded; counted and skipped
    FrameCorruptOrDropped(String),
    /// Ledger or metadata file could not be written
    LedgerWrite(String),
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// Config file could not be read
    Read { path: String, reason: String },
    /// Config file is not valid JSON or has unknown keys
    Parse(String),
    /// A per-camera list does not match the camera count
    ListLength {
        key: &'static str,
        expected: usize,
        found: usize,
    },
    /// A numeric value is outside its valid range
    OutOfRange { key: &'static str, value: String },
    /// A command-line override could not be applied
    Override(String),
    /// Any other semantic problem
    Invalid(String),
}

impl AppError {
    /// Process exit code for this error
    ///
    /// 2 for configuration problems, 3 when a camera could not be opened,
    /// 1 for everything else.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Config(_) => 2,
            AppError::Camera(CameraError::DeviceUnavailable { .. }) => 3,
            _ => 1,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Camera(e) => write!(f, "Camera error: {}", e),
            AppError::Recording(e) => write!(f, "Recording error: {}", e),
            AppError::Config(e) => write!(f, "Configuration error: {}", e),
            AppError::Trigger(msg) => write!(f, "Trigger error: {}", msg),
            AppError::Storage(msg) => write!(f, "Storage error: {}", msg),
            AppError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for CameraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraError::DeviceUnavailable { camera, reason } => {
                write!(f, "{} unavailable: {}", camera, reason)
            }
            CameraError::DeviceLost { camera, reason } => {
                write!(f, "{} lost during capture: {}", camera, reason)
            }
        }
    }
}

impl fmt::Display for RecordingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordingError::EncoderProcessFailure(msg) => {
                write!(f, "Encoder process failure: {}", msg)
            }
            RecordingError::FrameCorruptOrDropped(msg) => write!(f, "Frame dropped: {}", msg),
            RecordingError::LedgerWrite(msg) => write!(f, "Failed to write ledger: {}", msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, reason } => write!(f, "cannot read {}: {}", path, reason),
            ConfigError::Parse(msg) => write!(f, "{}", msg),
            ConfigError::ListLength {
                key,
                expected,
                found,
            } => write!(
                f,
                "'{}' has {} entries but numCams is {}",
                key, found, expected
            ),
            ConfigError::OutOfRange { key, value } => {
                write!(f, "'{}' is out of range: {}", key, value)
            }
            ConfigError::Override(msg) => write!(f, "invalid override: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for AppError {}
impl std::error::Error for CameraError {}
impl std::error::Error for RecordingError {}
impl std::error::Error for ConfigError {}

impl From<CameraError> for AppError {
    fn from(err: CameraError) -> Self {
        AppError::Camera(err)
    }
}

impl From<RecordingError> for AppError {
    fn from(err: RecordingError) -> Self {
        AppError::Recording(err)
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Config(err)
    }
}

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError::Other(msg)
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError::Other(msg.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for RecordingError {
    fn from(err: std::io::Error) -> Self {
        RecordingError::LedgerWrite(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let config: AppError = ConfigError::Invalid("bad".into()).into();
        assert_eq!(config.exit_code(), 2);

        let open: AppError = CameraError::DeviceUnavailable {
            camera: "Camera0".into(),
            reason: "no device".into(),
        }
        .into();
        assert_eq!(open.exit_code(), 3);

        let lost: AppError = CameraError::DeviceLost {
            camera: "Camera0".into(),
            reason: "unplugged".into(),
        }
        .into();
        assert_eq!(lost.exit_code(), 1);
    }

    #[test]
    fn test_list_length_message() {
        let err = ConfigError::ListLength {
            key: "cameraNames",
            expected: 3,
            found: 2,
        };
        assert_eq!(
            err.to_string(),
            "'cameraNames' has 2 entries but numCams is 3"
        );
    }
}
