//! Custom error types for the device core.
//!
//! This module defines the primary error type, `DaqError`, shared by both
//! engines. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle everything from configuration and I/O issues to
//! device arbitration, acquisition and motion failures.
//!
//! ## Error Hierarchy
//!
//! - **Configuration**: `Config` wraps figment extraction errors; `Configuration`
//!   carries semantic validation failures for values that parsed fine.
//! - **Session**: `DeviceNotFound`, `AccessDenied` and `SessionClosed` come from
//!   opening or using a [`crate::session::DeviceSession`].
//! - **Acquisition**: `NoCompatibleFormat`, `CaptureTimeout`, `CaptureIncomplete`,
//!   `StreamActive` and `StreamFault`.
//! - **Features**: `UnknownFeature`, `FeatureTypeMismatch`, `FeatureNotWritable`,
//!   `FeatureNotReadable`. A value the firmware silently clamped is *not* an
//!   error; it is reported as a [`crate::camera::FeatureWarning`].
//! - **Motion**: `InvalidStep`, `InvalidProgram`, `ProgramBusy`, `StepFailed`,
//!   `TickInProgress`.
//! - **Transport**: `Hardware`, `Timeout`, `Io`, `Json`, `TomlDe`, `TomlSer`.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types
//! with the `?` operator.

use std::time::Duration;

use thiserror::Error;

use crate::session::AccessMode;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors produced by the device core.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration sources could not be merged or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A configuration value parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem or transport I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Program document (de)serialization failure.
    #[error("Program document error: {0}")]
    Json(#[from] serde_json::Error),

    /// Settings document could not be parsed.
    #[error("Settings document parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// Settings document could not be written.
    #[error("Settings document write error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// No enumerated device matched the requested identifier.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The requested access mode cannot be granted or does not permit the operation.
    #[error("Access denied on device '{device_id}' ({requested}): {reason}")]
    AccessDenied {
        /// Device the request targeted.
        device_id: String,
        /// Access mode requested or held.
        requested: AccessMode,
        /// Human-readable reason.
        reason: String,
    },

    /// An operation was attempted on a closed session.
    #[error("Session for device '{0}' is closed")]
    SessionClosed(String),

    /// The device advertises no display-compatible pixel format.
    #[error("Device '{0}' advertises no display-compatible pixel format")]
    NoCompatibleFormat(String),

    /// Single-frame capture did not complete in time.
    #[error("Single-frame capture timed out after {0:?}")]
    CaptureTimeout(Duration),

    /// Single-frame capture completed without a fully filled buffer.
    #[error("Single-frame capture incomplete: {0}")]
    CaptureIncomplete(String),

    /// Single-frame capture is not allowed while the stream owns the buffers.
    #[error("Cannot capture a single frame while streaming is active")]
    StreamActive,

    /// Driver-level or buffer-requeue failure while streaming.
    #[error("Stream fault: {0}")]
    StreamFault(String),

    /// Operation not valid in the engine's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The device does not expose the named feature.
    #[error("Unknown feature '{0}'")]
    UnknownFeature(String),

    /// The supplied value does not fit the feature's type.
    #[error("Feature '{name}' expects a {expected} value, got {actual}")]
    FeatureTypeMismatch {
        /// Feature name.
        name: String,
        /// Kind the device declares.
        expected: &'static str,
        /// Kind that was supplied.
        actual: &'static str,
    },

    /// The feature is read-only.
    #[error("Feature '{0}' is not writable")]
    FeatureNotWritable(String),

    /// The feature is write-only.
    #[error("Feature '{0}' is not readable")]
    FeatureNotReadable(String),

    /// A motion step carries invalid parameters.
    #[error("Invalid motion step: {0}")]
    InvalidStep(String),

    /// A motion program or program document is invalid.
    #[error("Invalid motion program: {0}")]
    InvalidProgram(String),

    /// The program cannot be edited or replaced while a run is active.
    #[error("Motion program is running")]
    ProgramBusy,

    /// A motion step failed; the run was halted.
    #[error("Motion step {index} failed: {cause}")]
    StepFailed {
        /// Index of the failing step.
        index: usize,
        /// Failure description.
        cause: String,
    },

    /// `advance_tick` was re-entered while a tick was executing.
    #[error("A motion tick is already executing")]
    TickInProgress,

    /// Driver or firmware reported a failure.
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// A device command did not complete in time.
    #[error("Operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Limit that elapsed.
        timeout: Duration,
    },

    /// The binary was built without the named cargo feature.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// Reported frame dimensions exceed supported limits.
    #[error("Frame dimensions {width}x{height} exceed maximum {max_dimension}")]
    FrameDimensionsTooLarge {
        /// Reported width.
        width: u32,
        /// Reported height.
        height: u32,
        /// Largest allowed dimension.
        max_dimension: u32,
    },

    /// Computed frame payload exceeds the allocation limit.
    #[error("Frame size {bytes} bytes exceeds maximum {max_bytes}")]
    FrameTooLarge {
        /// Computed size.
        bytes: usize,
        /// Allowed maximum.
        max_bytes: usize,
    },

    /// Arithmetic overflow while sizing a frame.
    #[error("Size overflow while computing {context}")]
    SizeOverflow {
        /// What was being computed.
        context: &'static str,
    },
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Hardware("axis not responding".to_string());
        assert_eq!(err.to_string(), "Hardware error: axis not responding");
    }

    #[test]
    fn test_access_denied_display() {
        let err = DaqError::AccessDenied {
            device_id: "cam0".into(),
            requested: AccessMode::Full,
            reason: "held exclusively by another session".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("cam0"));
        assert!(msg.contains("full"));
        assert!(msg.contains("exclusively"));
    }

    #[test]
    fn test_step_failed_display() {
        let err = DaqError::StepFailed {
            index: 2,
            cause: "encoder error".into(),
        };
        assert_eq!(err.to_string(), "Motion step 2 failed: encoder error");
    }

    #[test]
    fn test_io_conversion() {
        fn open_missing() -> AppResult<String> {
            Ok(std::fs::read_to_string("/definitely/not/here.toml")?)
        }
        assert!(matches!(open_missing(), Err(DaqError::Io(_))));
    }
}
