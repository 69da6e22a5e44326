use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the frame pipeline.
///
/// `SourceExhausted` ends a stream session. `TrackingDegraded` is produced by
/// a single failed flow update and is absorbed by the tracking engine, so
/// callers of [`crate::tracker::TrackingEngine::advance`] never observe it.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("frame source exhausted")]
    SourceExhausted,

    #[error("frame source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("tracking degraded: {0}")]
    TrackingDegraded(String),

    #[error("recorder misuse: {0}")]
    RecorderMisuse(String),

    #[error("could not open video sink at {}", .0.display())]
    SinkUnavailable(PathBuf),

    #[error("unsupported stream mode: {0}")]
    UnsupportedMode(String),

    #[error("failed to encode frame as {0}")]
    Encode(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    OpenCv(#[from] opencv::Error),
}

impl FlowError {
    pub fn degraded(reason: impl ToString) -> Self {
        FlowError::TrackingDegraded(reason.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
