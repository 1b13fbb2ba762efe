//! Error taxonomy for the capture pipeline

use thiserror::Error;

use crate::capture::frame::PixelFormat;
use crate::pipeline::session::SessionState;

/// Session-level failures surfaced to the host.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no video source available")]
    DeviceUnavailable,
    #[error("video source did not become ready within {0} ms")]
    NotReady(u64),
    #[error("no Tokio runtime available")]
    NoRuntime,
    #[error("camera manager is not active")]
    NotActive,
    #[error("capture session is busy ({0})")]
    SessionBusy(SessionState),
    #[error("video source error: {0}")]
    Source(String),
}

/// Failure of a single readback request. Never fatal to a session.
#[derive(Debug, Clone, Error)]
pub enum ReadbackError {
    #[error("readback driver error: {0}")]
    Driver(String),
    #[error("failed to decode {format:?} frame: {reason}")]
    Decode { format: PixelFormat, reason: String },
    #[error("readback request was dropped before completion")]
    Cancelled,
}

/// A delivered pixel buffer that cannot become a `FrameImage`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("pixel buffer holds {actual} bytes, expected {expected}")]
    InvariantViolation { expected: usize, actual: usize },
    #[error("pixel format {0:?} is not a raw pixel layout")]
    UnsupportedFormat(PixelFormat),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("session.target_frames must be at least 1")]
    ZeroTarget,
}
