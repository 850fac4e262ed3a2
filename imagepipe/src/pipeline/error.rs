//! Error types for the pipeline.
//!
//! Every terminal failure of a work unit is a [`PipelineError`]. It is
//! `Clone` because one failure is delivered to every subscriber of the unit.

use crate::pipeline::context::{DecodeError, FetchError};
use thiserror::Error;

/// Terminal outcome of a failed or abandoned request.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// The data loader failed
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// The fetched bytes could not be decoded
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// A processing step reported an error
    #[error("processor {processor} failed: {message}")]
    Processing { processor: String, message: String },

    /// The request was cancelled before it produced a result
    #[error("request cancelled")]
    Cancelled,

    /// The pipeline was invalidated or dropped while the request was pending
    #[error("pipeline shut down")]
    Shutdown,

    /// The pipeline was created outside of a tokio runtime
    #[error("no tokio runtime available")]
    RuntimeUnavailable,

    /// Internal error (e.g., a blocking task panicked)
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Returns true for outcomes that are not real failures.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::Processing {
            processor: "resize(width=1,height=1)".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "processor resize(width=1,height=1) failed: boom"
        );
        assert_eq!(PipelineError::Cancelled.to_string(), "request cancelled");
    }

    #[test]
    fn test_fetch_error_converts() {
        let err: PipelineError = FetchError::new("connection refused").into();
        assert_eq!(err.to_string(), "fetch failed: connection refused");
        assert!(!err.is_cancellation());
        assert!(PipelineError::Shutdown.is_cancellation());
    }
}
