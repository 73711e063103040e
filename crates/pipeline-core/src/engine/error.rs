//! Engine error taxonomy and process exit codes.

use pipeline_state::StorageError;

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::definition::DefinitionError;

use super::state::IllegalTransition;

/// Process exit codes of the `pipeline` binary.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const UNKNOWN_STAGE: i32 = 1;
    pub const DEFINITION: i32 = 2;
    pub const STAGE_FAILED: i32 = 3;
    pub const CACHE: i32 = 4;
    pub const CONFIG: i32 = 5;
    pub const CANCELLED: i32 = 130;
}

/// Errors that stop a pipeline before or outside stage execution.
///
/// Failures of individual stages are not errors; they are reported in the
/// [`PipelineReport`](super::report::PipelineReport).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown stage: {id}")]
    UnknownStage { id: String },

    #[error(transparent)]
    Definition(DefinitionError),

    #[error("cannot fingerprint stage {stage}: {source}")]
    Fingerprint {
        stage: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("run log error: {0}")]
    RunLog(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),
}

impl From<DefinitionError> for EngineError {
    fn from(err: DefinitionError) -> Self {
        match err {
            DefinitionError::UnknownStage { id } => EngineError::UnknownStage { id },
            other => EngineError::Definition(other),
        }
    }
}

impl EngineError {
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::UnknownStage { .. } => exit_code::UNKNOWN_STAGE,
            EngineError::Definition(_) => exit_code::DEFINITION,
            EngineError::Fingerprint { .. } | EngineError::IllegalTransition(_) => {
                exit_code::STAGE_FAILED
            }
            EngineError::Cache(_) => exit_code::CACHE,
            EngineError::RunLog(_) | EngineError::Config(_) => exit_code::CONFIG,
        }
    }

    /// Stage the error originates from, when there is one.
    pub fn stage(&self) -> Option<&str> {
        match self {
            EngineError::UnknownStage { id } => Some(id),
            EngineError::Definition(e) => e.stage(),
            EngineError::Fingerprint { stage, .. } => Some(stage),
            EngineError::IllegalTransition(t) => Some(&t.stage),
            EngineError::Cache(_) | EngineError::RunLog(_) | EngineError::Config(_) => None,
        }
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
