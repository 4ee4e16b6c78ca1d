//! Error types for the capture module.

use thiserror::Error;
use wallcap_ipc::ConfigError;

/// Error reported by the native capture layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (code {code})")]
pub struct NativeError {
    /// Native status code.
    pub code: i64,

    /// Native description.
    pub message: String,
}

impl NativeError {
    /// Create a new native error.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Errors that can occur during capture operations.
///
/// Only [`CaptureError::Creation`] and [`CaptureError::StreamFailed`] ever reach
/// a frame consumer, as the terminal error of its sequence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// The native stream could not be constructed or started.
    #[error("failed to create capture stream: {0}")]
    Creation(String),

    /// The native stream stopped with a fatal error.
    #[error("capture stream failed: {0}")]
    StreamFailed(String),

    /// A configuration change was rejected in whole or in part.
    #[error("configuration update rejected: {0}")]
    UpdateFailed(String),

    /// The native layer did not acknowledge a stop.
    #[error("stop not acknowledged: {0}")]
    StopFailed(String),

    /// Parameters or filter failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),

    /// The sample handler queue could not be started.
    #[error("sample queue unavailable: {0}")]
    QueueUnavailable(String),
}
