//! Centralized error types for the Prismcast core library.
//!
//! Operational failures (GPU, encoder) are handled locally by the owning
//! object: the session is torn down, the object goes idle with its error flag
//! set, and the failure is visible to the host through the notification
//! stream. The types here cover the remaining API-surface errors plus the
//! structured payloads those local handlers log.

use thiserror::Error;

/// Errors returned by the public pipeline API.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The operation requires the object to be idle (install, remove, clock swap).
    #[error("object is not idle: {0}")]
    NotIdle(&'static str),

    /// The object is not registered with this context.
    #[error("object is not part of this context")]
    UnknownObject,

    /// The pipeline is already running.
    #[error("pipeline is already started")]
    AlreadyStarted,

    /// The control thread could not be spawned.
    #[error("failed to spawn control thread: {0}")]
    ControlThread(String),
}

impl PipelineError {
    /// Returns a machine-readable error code for host UIs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotIdle(_) => "not_idle",
            Self::UnknownObject => "unknown_object",
            Self::AlreadyStarted => "already_started",
            Self::ControlThread(_) => "control_thread",
        }
    }
}

/// Convenient Result alias for pipeline API operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// GPU session failures. Fatal to the video mixer's current session.
#[derive(Debug, Error)]
pub enum GpuError {
    /// No usable adapter on this machine.
    #[error("no compatible GPU adapter found")]
    NoAdapter,

    /// The adapter refused to hand out a device.
    #[error("failed to acquire GPU device: {0}")]
    Device(String),

    /// A validation error surfaced from an error scope.
    #[error("GPU validation failure: {0}")]
    Validation(String),

    /// Buffer readback failed or the device was lost mid-map.
    #[error("GPU readback failed: {0}")]
    Readback(String),
}

/// AAC encoder failures. Fatal to the audio mixer's current session.
#[derive(Debug, Error)]
pub enum AudioCodecError {
    /// Encoder creation or parameter setup failed.
    #[error("failed to open AAC encoder: {0}")]
    Open(String),

    /// An encode call returned an error status.
    #[error("AAC encode failed: {0}")]
    Encode(String),
}

/// Returned by a video source's `frame` hook when it cannot produce a frame.
///
/// Any frame error aborts the tick and halts the video mixer; no partial
/// output image is ever delivered downstream.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct FrameError(pub String);

impl FrameError {
    /// Builds a frame error from any displayable cause.
    pub fn new(cause: impl std::fmt::Display) -> Self {
        Self(cause.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_expose_stable_codes() {
        assert_eq!(PipelineError::NotIdle("connection").code(), "not_idle");
        assert_eq!(PipelineError::UnknownObject.code(), "unknown_object");
    }

    #[test]
    fn frame_error_preserves_cause() {
        let err = FrameError::new("capture stream stalled");
        assert_eq!(err.to_string(), "capture stream stalled");
    }
}
