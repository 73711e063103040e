//! Error types for stage runners.

use std::time::Duration;

/// Errors produced by a runner adapter.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The isolation backend could not be reached or could not start the
    /// command (missing binary, container daemon down). Transient.
    #[error("runner unavailable for stage {stage}: {reason}")]
    Unavailable { stage: String, reason: String },

    #[error("stage {stage} timed out after {}s", after.as_secs())]
    TimedOut { stage: String, after: Duration },

    #[error("stage {stage} was cancelled")]
    Cancelled { stage: String },

    /// The invocation itself cannot be executed as specified.
    #[error("invalid invocation for stage {stage}: {reason}")]
    InvalidInvocation { stage: String, reason: String },

    #[error("io error in stage {stage}: {source}")]
    Io {
        stage: String,
        #[source]
        source: std::io::Error,
    },
}

impl RunnerError {
    /// Whether the failure is infrastructure-level and worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, RunnerError::Unavailable { .. })
    }

    pub fn stage(&self) -> &str {
        match self {
            RunnerError::Unavailable { stage, .. }
            | RunnerError::TimedOut { stage, .. }
            | RunnerError::Cancelled { stage }
            | RunnerError::InvalidInvocation { stage, .. }
            | RunnerError::Io { stage, .. } => stage,
        }
    }
}

/// Result type for runner operations.
pub type RunnerResult<T> = std::result::Result<T, RunnerError>;
