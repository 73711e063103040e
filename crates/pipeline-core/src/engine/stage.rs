//! Execution of a single stage: fingerprint, cache check, run, record, cache.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pipeline_runner::artifact::materialize;
use pipeline_runner::{
    CancellationToken, Environment, Mount, RunInvocation, RunnerAdapter, RunnerError,
};
use pipeline_state::{NewRunRecord, RecordCompletion, RecordId, RecordOutcome, RunLog, StorageError};
use tracing::{debug, warn};

use super::report::{FailureKind, StageReport};
use super::retry::RetryPolicy;
use super::state::{IllegalTransition, StageState, StageTracker};
use crate::cache::{Artifact, ArtifactCache, CacheKey, Lease};
use crate::definition::template;
use crate::definition::{Stage, StageGraph};
use crate::fingerprint::{self, Fingerprint};
use crate::obs;

/// Container path under which upstream artifacts are mounted.
pub const CONTAINER_INPUT_ROOT: &str = "/pipeline/in";

/// A finished upstream stage, as seen by its dependents.
#[derive(Debug, Clone)]
pub(crate) struct Completed {
    pub fingerprint: Fingerprint,
    pub artifact: Arc<Artifact>,
}

/// Everything shared by the stages of one run.
pub(crate) struct RunContext {
    pub run_id: String,
    pub graph: Arc<StageGraph>,
    pub cache: Arc<ArtifactCache>,
    pub runner: Arc<dyn RunnerAdapter>,
    pub run_log: Arc<dyn RunLog>,
    pub cancel: CancellationToken,
    pub retry: RetryPolicy,
    pub output_limit: usize,
    /// Scratch root for this run
    pub scratch: PathBuf,
    pub no_cache: bool,
    /// Artifacts used by this run stay pinned until it ends
    pub leases: Mutex<Vec<Lease>>,
}

pub(crate) struct StageOutcome {
    pub report: StageReport,
    pub completed: Option<Completed>,
}

pub(crate) struct StageJob {
    ctx: Arc<RunContext>,
    stage: Stage,
    upstream: BTreeMap<String, Completed>,
    tracker: StageTracker,
    report: StageReport,
}

/// Turn a possibly relative path into an absolute one against the current directory.
pub(crate) fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Fingerprint off the async runtime; input trees may be large.
pub(crate) async fn fingerprint_stage(
    stage: &Stage,
    base_dir: &Path,
    upstream: BTreeMap<String, Fingerprint>,
) -> io::Result<Fingerprint> {
    let stage = stage.clone();
    let base_dir = base_dir.to_path_buf();
    tokio::task::spawn_blocking(move || fingerprint::compute(&stage, &base_dir, &upstream))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
}

impl StageJob {
    pub fn new(ctx: Arc<RunContext>, stage: Stage, upstream: BTreeMap<String, Completed>) -> Self {
        let tracker = StageTracker::new(&stage.id);
        let report = StageReport::pending(&stage.id);
        Self {
            ctx,
            stage,
            upstream,
            tracker,
            report,
        }
    }

    pub async fn run(mut self) -> StageOutcome {
        let started = Instant::now();
        let completed = match self.execute().await {
            Ok(completed) => completed,
            Err(illegal) => {
                warn!(error = %illegal, "stage state machine violated");
                self.report.failure = Some(FailureKind::Runner {
                    error: illegal.to_string(),
                });
                None
            }
        };
        self.report.state = self.tracker.state();
        self.report.duration_ms = started.elapsed().as_millis() as u64;
        StageOutcome {
            report: self.report,
            completed,
        }
    }

    fn advance(&mut self, next: StageState) -> Result<(), IllegalTransition> {
        self.tracker.advance(next)
    }

    fn abort(&mut self, failure: FailureKind) -> Result<Option<Completed>, IllegalTransition> {
        self.advance(StageState::Aborted)?;
        self.report.failure = Some(failure);
        Ok(None)
    }

    fn pin(&self, key: &CacheKey) {
        let lease = self.ctx.cache.lease(key);
        if let Ok(mut leases) = self.ctx.leases.lock() {
            leases.push(lease);
        }
    }

    fn hit(
        &mut self,
        key: &CacheKey,
        artifact: Artifact,
    ) -> Result<Option<Completed>, IllegalTransition> {
        self.advance(StageState::CacheHit)?;
        self.advance(StageState::Done)?;
        self.report.cache_hit = true;
        obs::emit_stage_cache_hit(&self.stage.id, key.fingerprint.short());
        self.pin(key);
        Ok(Some(Completed {
            fingerprint: key.fingerprint.clone(),
            artifact: Arc::new(artifact),
        }))
    }

    /// Counted cache lookup; read errors fall back to execution.
    async fn lookup(&self, key: &CacheKey) -> Option<Artifact> {
        match self.ctx.cache.get(key).await {
            Ok(found) => found,
            Err(e) => {
                obs::emit_cache_fallback(&self.stage.id, &e);
                None
            }
        }
    }

    async fn execute(&mut self) -> Result<Option<Completed>, IllegalTransition> {
        let ctx = Arc::clone(&self.ctx);

        self.advance(StageState::Fingerprinting)?;
        let upstream_fps: BTreeMap<String, Fingerprint> = self
            .upstream
            .iter()
            .map(|(id, c)| (id.clone(), c.fingerprint.clone()))
            .collect();
        let fingerprint =
            match fingerprint_stage(&self.stage, ctx.graph.base_dir(), upstream_fps).await {
                Ok(fp) => fp,
                Err(e) => return self.abort(FailureKind::Inputs { error: e.to_string() }),
            };
        self.report.fingerprint = Some(fingerprint.clone());
        let key = CacheKey::new(&self.stage.id, fingerprint.clone());

        self.advance(StageState::CacheCheck)?;
        if !ctx.no_cache {
            if let Some(artifact) = self.lookup(&key).await {
                return self.hit(&key, artifact);
            }
        }

        let _guard = ctx.cache.lock(&key).await;
        if !ctx.no_cache && ctx.cache.contains(&key).await.unwrap_or(false) {
            if let Some(artifact) = self.lookup(&key).await {
                debug!(key = %key, "artifact populated while waiting for key lock");
                return self.hit(&key, artifact);
            }
        }

        if ctx.cancel.is_cancelled() {
            return self.abort(FailureKind::Cancelled);
        }

        let invocation = match self.prepare(&fingerprint).await {
            Ok(invocation) => invocation,
            Err(e) => return self.abort(FailureKind::Inputs { error: e.to_string() }),
        };

        let max_attempts = self.stage.retries.saturating_add(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.report.attempts = attempt;
            self.advance(StageState::Running)?;

            if let Err(e) = reset_dir(&invocation.out_dir).await {
                self.advance(StageState::Failed)?;
                return self.abort(FailureKind::Inputs { error: e.to_string() });
            }

            let record_id = match ctx
                .run_log
                .open(NewRunRecord {
                    run_id: ctx.run_id.clone(),
                    stage_id: self.stage.id.clone(),
                    fingerprint: fingerprint.to_string(),
                    attempt,
                })
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    self.advance(StageState::Failed)?;
                    return self.abort(FailureKind::RunLog { error: e.to_string() });
                }
            };

            obs::emit_stage_started(&self.stage.id, fingerprint.short(), attempt);
            let started = Instant::now();
            let result = ctx.runner.run(&invocation, &ctx.cancel).await;
            let elapsed = started.elapsed().as_millis() as u64;

            match result {
                Ok(outcome) if outcome.passed() => {
                    self.advance(StageState::Succeeded)?;
                    self.report.exit_code = Some(outcome.exit_code);
                    let output = outcome.combined_output();
                    let stored = ctx
                        .cache
                        .put(&key, outcome.artifact, self.stage.archives_outputs())
                        .await;

                    let artifact = match stored {
                        Ok(artifact) => artifact,
                        Err(e) => {
                            self.finalize(&record_id, RecordOutcome::CacheWriteFailed, Some(0), &output)
                                .await
                                .ok();
                            obs::emit_stage_finished(&self.stage.id, fingerprint.short(), attempt, "cache_write_failed", elapsed);
                            return self.abort(FailureKind::CacheWrite { error: e.to_string() });
                        }
                    };

                    if let Err(e) = self
                        .finalize(&record_id, RecordOutcome::Succeeded, Some(0), &output)
                        .await
                    {
                        return self.abort(FailureKind::RunLog { error: e.to_string() });
                    }
                    obs::emit_stage_finished(&self.stage.id, fingerprint.short(), attempt, "succeeded", elapsed);
                    self.advance(StageState::Done)?;
                    self.pin(&key);
                    return Ok(Some(Completed {
                        fingerprint,
                        artifact: Arc::new(artifact),
                    }));
                }
                Ok(outcome) => {
                    self.advance(StageState::Failed)?;
                    let output = outcome.combined_output();
                    self.report.exit_code = Some(outcome.exit_code);
                    self.report.output = output.clone();
                    if let Err(e) = self
                        .finalize(&record_id, RecordOutcome::Failed, Some(outcome.exit_code), &output)
                        .await
                    {
                        warn!(error = %e, "failed to finalize run record");
                    }
                    obs::emit_stage_finished(&self.stage.id, fingerprint.short(), attempt, "failed", elapsed);
                    let failure = if outcome.exit_code != 0 {
                        FailureKind::Exit {
                            code: outcome.exit_code,
                        }
                    } else {
                        FailureKind::MissingOutputs {
                            outputs: outcome.missing_outputs,
                        }
                    };
                    return self.abort(failure);
                }
                Err(err) => {
                    self.advance(StageState::Failed)?;
                    let (outcome, retryable, failure) = classify(&err, self.stage.retry_on_timeout);
                    let message = err.to_string();
                    self.report.output = message.clone();
                    if let Err(e) = self.finalize(&record_id, outcome, None, &message).await {
                        warn!(error = %e, "failed to finalize run record");
                    }
                    obs::emit_stage_finished(&self.stage.id, fingerprint.short(), attempt, outcome.as_str(), elapsed);

                    if retryable && attempt < max_attempts && !ctx.cancel.is_cancelled() {
                        self.advance(StageState::Retrying)?;
                        let delay = ctx.retry.delay(attempt);
                        obs::emit_stage_retrying(&self.stage.id, attempt, delay.as_millis() as u64, &err);
                        if !backoff(delay, &ctx.cancel).await {
                            return self.abort(FailureKind::Cancelled);
                        }
                        continue;
                    }
                    return self.abort(failure);
                }
            }
        }
    }

    async fn finalize(
        &self,
        record_id: &RecordId,
        outcome: RecordOutcome,
        exit_code: Option<i32>,
        output: &str,
    ) -> Result<(), StorageError> {
        let completion = RecordCompletion::new(outcome, exit_code, output, self.ctx.output_limit);
        self.ctx.run_log.finalize(record_id, completion).await.map(|_| ())
    }

    /// Materialize upstream artifacts and build the runner invocation.
    async fn prepare(&self, fingerprint: &Fingerprint) -> io::Result<RunInvocation> {
        let stage = &self.stage;
        let stage_dir = self.ctx.scratch.join(&stage.id);

        let mut mounts = Vec::with_capacity(stage.depends_on.len());
        for dep in &stage.depends_on {
            let completed = self.upstream.get(dep).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("artifact of upstream stage {dep} is not available"),
                )
            })?;
            let host_path = stage_dir.join("in").join(dep);
            let artifact = Arc::clone(&completed.artifact);
            let dest = host_path.clone();
            tokio::task::spawn_blocking(move || {
                if dest.exists() {
                    std::fs::remove_dir_all(&dest)?;
                }
                materialize(&artifact.bytes, artifact.archive, &dest)
            })
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))??;

            mounts.push(Mount {
                name: dep.clone(),
                host_path,
                target: Path::new(CONTAINER_INPUT_ROOT).join(dep),
                read_only: true,
            });
        }

        let base_dir = absolutize(self.ctx.graph.base_dir());
        let work_dir = match &stage.workdir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => base_dir.join(dir),
            None => base_dir,
        };

        let mut env: Environment = stage
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for name in &stage.passthrough_env {
            match std::env::var(name) {
                Ok(value) => env.insert(name.clone(), value),
                Err(_) => debug!(variable = %name, "passthrough variable not set"),
            }
        }

        Ok(RunInvocation {
            stage_id: stage.id.clone(),
            command: template::render(&stage.command, &stage.id, fingerprint.as_str()),
            env,
            mounts,
            out_dir: stage_dir.join("out"),
            work_dir,
            outputs: stage.outputs.clone(),
            timeout: stage.timeout_seconds.map(Duration::from_secs),
            image: stage.image.clone(),
        })
    }
}

/// Record outcome, retry eligibility and reported failure for a runner error.
fn classify(err: &RunnerError, retry_on_timeout: bool) -> (RecordOutcome, bool, FailureKind) {
    match err {
        RunnerError::Unavailable { reason, .. } => (
            RecordOutcome::Unavailable,
            true,
            FailureKind::Unavailable {
                reason: reason.clone(),
            },
        ),
        RunnerError::TimedOut { after, .. } => (
            RecordOutcome::TimedOut,
            retry_on_timeout,
            FailureKind::TimedOut {
                after_secs: after.as_secs(),
            },
        ),
        RunnerError::Cancelled { .. } => (RecordOutcome::Cancelled, false, FailureKind::Cancelled),
        RunnerError::InvalidInvocation { .. } | RunnerError::Io { .. } => (
            RecordOutcome::Failed,
            false,
            FailureKind::Runner {
                error: err.to_string(),
            },
        ),
    }
}

/// Sleep for `delay` unless cancelled first. Returns false on cancellation.
async fn backoff(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

async fn reset_dir(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}
