//! Error taxonomy for the frame pipeline.
//!
//! Setup failures abort the pipeline, invalidated render targets are skipped
//! for one tick, and protocol violations (muxer writes before start, double
//! buffer releases) are fatal to the encode session.

use thiserror::Error;

use crate::pipeline::encode::BufferIndex;
use crate::pipeline::session::SessionState;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

/// Errors raised by a frame source
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Capture device access failed: {0}")]
    Access(String),

    #[error("Frame source {0} is already open")]
    AlreadyOpen(String),
}

/// Errors raised while drawing into a render target
#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("Render target {0} has been invalidated")]
    Invalidated(&'static str),

    #[error("Draw into {target} failed: {reason}")]
    Draw { target: &'static str, reason: String },
}

/// Errors raised by the encode session, its encoder or its muxer
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Encoder setup failed: {0}")]
    Codec(String),

    #[error("Invalid encode format: {0}")]
    InvalidFormat(String),

    #[error("Cannot {op} while session is {state:?}")]
    InvalidState { op: &'static str, state: SessionState },

    #[error("Sample written before the muxer was started")]
    MuxerNotStarted,

    #[error("Muxer track already added")]
    TrackAlreadyAdded,

    #[error("Output buffer {0} released twice")]
    BufferAlreadyReleased(BufferIndex),

    #[error("Output buffer {0} was never dequeued")]
    UnknownBuffer(BufferIndex),

    #[error("Muxer failed: {0}")]
    Muxer(String),

    #[error("Drain worker panicked")]
    WorkerPanicked,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level pipeline errors, reported once by the orchestrator
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_display() {
        let err = EncodeError::InvalidState {
            op: "start",
            state: SessionState::Idle,
        };
        let msg = err.to_string();
        assert!(msg.contains("start"));
        assert!(msg.contains("Idle"));
    }

    #[test]
    fn double_release_names_buffer() {
        let err = EncodeError::BufferAlreadyReleased(BufferIndex(7));
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn pipeline_error_wraps_source_error() {
        let err: PipelineError = SourceError::Access("/dev/video0 busy".into()).into();
        assert!(err.to_string().contains("/dev/video0 busy"));
    }
}
