//! Runtime configuration: defaults, then `PIPELINE_*` environment overrides.
//! Command-line flags are applied on top by the binary.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::CacheLimits;
use crate::engine::retry::RetryPolicy;

pub const DEFAULT_STATE_DIR: &str = ".pipeline";
pub const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Which isolation backend runs stage commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunnerKind {
    #[default]
    Process,
    Container,
}

impl FromStr for RunnerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" | "local" => Ok(RunnerKind::Process),
            "container" | "docker" | "podman" => Ok(RunnerKind::Container),
            other => Err(format!("unknown runner {other:?} (expected process or container)")),
        }
    }
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunnerKind::Process => "process",
            RunnerKind::Container => "container",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Root for the cache, run log and scratch space
    pub state_dir: PathBuf,
    /// Maximum stages running at once
    pub workers: usize,
    pub cache_max_entries: Option<usize>,
    pub cache_max_bytes: Option<u64>,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Bytes of captured output kept per run record
    pub output_limit: usize,
    pub runner: RunnerKind,
    pub container_cli: String,
    pub default_image: Option<String>,
    /// SurrealDB endpoint for the run log; `runs.jsonl` when unset
    pub runlog_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            workers: default_workers(),
            cache_max_entries: None,
            cache_max_bytes: None,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            output_limit: DEFAULT_OUTPUT_LIMIT,
            runner: RunnerKind::default(),
            container_cli: "docker".to_string(),
            default_image: None,
            runlog_url: None,
        }
    }
}

/// Available parallelism, at least 1.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(1)
}

fn parse_num<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(key, raw, e.to_string()))
}

impl PipelineConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `PIPELINE_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("PIPELINE_STATE_DIR") {
            config.state_dir = PathBuf::from(v);
        }
        if let Some(v) = get("PIPELINE_WORKERS") {
            config.workers = parse_num("PIPELINE_WORKERS", &v)?;
        }
        if let Some(v) = get("PIPELINE_CACHE_MAX_ENTRIES") {
            config.cache_max_entries = Some(parse_num("PIPELINE_CACHE_MAX_ENTRIES", &v)?);
        }
        if let Some(v) = get("PIPELINE_CACHE_MAX_BYTES") {
            config.cache_max_bytes = Some(parse_num("PIPELINE_CACHE_MAX_BYTES", &v)?);
        }
        if let Some(v) = get("PIPELINE_BACKOFF_BASE_MS") {
            config.backoff_base = Duration::from_millis(parse_num("PIPELINE_BACKOFF_BASE_MS", &v)?);
        }
        if let Some(v) = get("PIPELINE_BACKOFF_MAX_MS") {
            config.backoff_max = Duration::from_millis(parse_num("PIPELINE_BACKOFF_MAX_MS", &v)?);
        }
        if let Some(v) = get("PIPELINE_OUTPUT_LIMIT") {
            config.output_limit = parse_num("PIPELINE_OUTPUT_LIMIT", &v)?;
        }
        if let Some(v) = get("PIPELINE_RUNNER") {
            config.runner = v
                .parse()
                .map_err(|reason: String| ConfigError::invalid("PIPELINE_RUNNER", v.clone(), reason))?;
        }
        if let Some(v) = get("PIPELINE_CONTAINER_CLI") {
            config.container_cli = v;
        }
        if let Some(v) = get("PIPELINE_DEFAULT_IMAGE") {
            config.default_image = Some(v);
        }
        if let Some(v) = get("PIPELINE_RUNLOG_URL") {
            config.runlog_url = Some(v);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "0", "must be at least 1"));
        }
        if self.backoff_base > self.backoff_max {
            return Err(ConfigError::invalid(
                "PIPELINE_BACKOFF_BASE_MS",
                self.backoff_base.as_millis().to_string(),
                "must not exceed PIPELINE_BACKOFF_MAX_MS",
            ));
        }
        if self.container_cli.trim().is_empty() {
            return Err(ConfigError::invalid("PIPELINE_CONTAINER_CLI", "", "must not be empty"));
        }
        Ok(())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir.join("cache")
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.state_dir.join("runs.jsonl")
    }

    /// Per-run scratch space for output and upstream directories.
    pub fn scratch_dir(&self) -> PathBuf {
        self.state_dir.join("scratch")
    }

    pub fn cache_limits(&self) -> CacheLimits {
        CacheLimits {
            max_entries: self.cache_max_entries,
            max_bytes: self.cache_max_bytes,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: self.backoff_base,
            max: self.backoff_max,
        }
    }
}
