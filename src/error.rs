use std::fmt;

use thiserror::Error;

/// Why a road-matching call produced no usable path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchFailure {
    /// Transport failure, timeout or a 5xx from the matching service
    ServiceUnavailable,
    /// The service answered, but not with a complete matched trace
    DecodeFailed,
}

impl MatchFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchFailure::ServiceUnavailable => "service_unavailable",
            MatchFailure::DecodeFailed => "decode_failed",
        }
    }
}

impl fmt::Display for MatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("{reason}: {detail}")]
pub struct MatchError {
    pub reason: MatchFailure,
    pub detail: String,
}

impl MatchError {
    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self {
            reason: MatchFailure::ServiceUnavailable,
            detail: detail.into(),
        }
    }

    pub fn decode(detail: impl Into<String>) -> Self {
        Self {
            reason: MatchFailure::DecodeFailed,
            detail: detail.into(),
        }
    }
}

/// Failure taxonomy of a pipeline stage.
///
/// `Decode` and `Upstream` abandon a single message and the stage keeps
/// consuming; `Fatal` ends the process.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed payload on {topic}: {source}")]
    Decode {
        topic: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{service} failed: {reason}")]
    Upstream {
        service: &'static str,
        reason: String,
    },

    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl PipelineError {
    pub fn upstream(service: &'static str, reason: impl fmt::Display) -> Self {
        PipelineError::Upstream {
            service,
            reason: reason.to_string(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Fatal(_))
    }
}

impl From<MatchError> for PipelineError {
    fn from(err: MatchError) -> Self {
        PipelineError::upstream("road matcher", err)
    }
}
