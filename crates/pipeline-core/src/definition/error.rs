//! Errors raised while loading and validating a stage document.

use std::path::PathBuf;

/// Problems with the pipeline definition. All are fatal before execution.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("cannot read pipeline definition {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported definition format {extension:?} (expected .toml, .yaml, .yml or .json)")]
    UnsupportedFormat { extension: String },

    #[error("invalid {format} pipeline definition: {message}")]
    Parse { format: &'static str, message: String },

    #[error("pipeline defines no stages")]
    Empty,

    #[error("invalid stage id {id:?}: ids must be non-empty and use only [A-Za-z0-9_.-]")]
    InvalidStageId { id: String },

    #[error("duplicate stage id: {id}")]
    DuplicateStage { id: String },

    #[error("stage {stage} depends on unknown stage {dependency}")]
    UnresolvedDependency { stage: String, dependency: String },

    #[error("stage {stage} depends on itself")]
    SelfDependency { stage: String },

    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("stage {stage} has an empty command")]
    EmptyCommand { stage: String },

    #[error("stage {stage} uses unknown placeholder {{{{{placeholder}}}}}")]
    UnknownPlaceholder { stage: String, placeholder: String },

    #[error("stage {stage} references upstream {upstream} which is not one of its dependencies")]
    UpstreamNotDependency { stage: String, upstream: String },

    #[error("stage {stage} declares invalid output {output:?}: outputs must be relative paths inside the output directory")]
    InvalidOutput { stage: String, output: String },

    #[error("stage {stage} declares invalid input {input:?}")]
    InvalidInput { stage: String, input: String },

    #[error("stage ids {first} and {second} map to the same mount variable")]
    MountCollision { first: String, second: String },

    #[error("unknown stage: {id}")]
    UnknownStage { id: String },
}

impl DefinitionError {
    /// Stage the error originates from, when there is one.
    pub fn stage(&self) -> Option<&str> {
        match self {
            DefinitionError::InvalidStageId { id }
            | DefinitionError::DuplicateStage { id }
            | DefinitionError::UnknownStage { id } => Some(id),
            DefinitionError::UnresolvedDependency { stage, .. }
            | DefinitionError::SelfDependency { stage }
            | DefinitionError::EmptyCommand { stage }
            | DefinitionError::UnknownPlaceholder { stage, .. }
            | DefinitionError::UpstreamNotDependency { stage, .. }
            | DefinitionError::InvalidOutput { stage, .. }
            | DefinitionError::InvalidInput { stage, .. } => Some(stage),
            DefinitionError::MountCollision { first, .. } => Some(first),
            DefinitionError::Cycle { path } => path.first().map(String::as_str),
            DefinitionError::Io { .. }
            | DefinitionError::UnsupportedFormat { .. }
            | DefinitionError::Parse { .. }
            | DefinitionError::Empty => None,
        }
    }
}

/// Result type for definition operations.
pub type DefinitionResult<T> = std::result::Result<T, DefinitionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_displays_path() {
        let err = DefinitionError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
        assert_eq!(err.stage(), Some("a"));
    }

    #[test]
    fn test_unknown_placeholder_displays_braces() {
        let err = DefinitionError::UnknownPlaceholder {
            stage: "build".into(),
            placeholder: "outdir".into(),
        };
        assert!(err.to_string().contains("{{outdir}}"));
    }
}
