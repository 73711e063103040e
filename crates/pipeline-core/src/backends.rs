//! Construct the cache, run log and runner a configuration asks for.

use std::sync::Arc;

use pipeline_runner::{ContainerRunner, ProcessRunner, RunnerAdapter};
use pipeline_state::{FileRunLog, RunLog, StorageResult, SurrealRunLog};
use tracing::debug;

use crate::cache::{ArtifactCache, CacheResult};
use crate::config::{PipelineConfig, RunnerKind};

/// Filesystem cache under `<state_dir>/cache`.
pub fn open_cache(config: &PipelineConfig) -> CacheResult<Arc<ArtifactCache>> {
    let cache = ArtifactCache::open(config.cache_dir(), config.cache_limits())?;
    Ok(Arc::new(cache))
}

/// SurrealDB when `runlog_url` is set, `<state_dir>/runs.jsonl` otherwise.
pub async fn open_run_log(config: &PipelineConfig) -> StorageResult<Arc<dyn RunLog>> {
    match &config.runlog_url {
        Some(url) => {
            debug!(url = %url, "using SurrealDB run log");
            let log = SurrealRunLog::connect(url).await?;
            Ok(Arc::new(log))
        }
        None => {
            let path = config.run_log_path();
            debug!(path = %path.display(), "using file run log");
            let log = FileRunLog::load(path)?;
            Ok(Arc::new(log))
        }
    }
}

pub fn build_runner(config: &PipelineConfig) -> Arc<dyn RunnerAdapter> {
    match config.runner {
        RunnerKind::Process => Arc::new(ProcessRunner::new()),
        RunnerKind::Container => {
            let mut runner = ContainerRunner::new(config.container_cli.clone());
            if let Some(image) = &config.default_image {
                runner = runner.with_default_image(image.clone());
            }
            Arc::new(runner)
        }
    }
}
