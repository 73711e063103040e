//! Pipeline Core
//!
//! Stage graphs, fingerprints, the artifact cache and the execution engine
//! of the build pipeline. The binary in `pipeline-cli` is a thin shell over
//! [`Engine`].

pub mod backends;
pub mod cache;
pub mod config;
pub mod definition;
pub mod engine;
pub mod fingerprint;
pub mod obs;
pub mod telemetry;

pub use cache::{Artifact, ArtifactCache, CacheError, CacheKey, CacheLimits, CacheStats};
pub use config::{ConfigError, PipelineConfig, RunnerKind};
pub use definition::{DefinitionError, DocumentFormat, Stage, StageGraph};
pub use engine::{
    exit_code, Engine, EngineError, EngineResult, EngineSettings, FailureKind, PipelineReport,
    PlannedStage, RetryPolicy, RunOptions, StageReport, StageState,
};
pub use fingerprint::Fingerprint;
pub use telemetry::init_tracing;

/// Crate version, reported by `pipeline --version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
