//! Execution engine: resolve a target, schedule its stages over a bounded
//! worker pool and report what happened.
//!
//! Scheduling is dependency counting over the resolved order. A stage is
//! dispatched once every dependency reached `Done`; among eligible stages the
//! earliest in resolved order goes first. The first failure stops dispatch,
//! stages already running are allowed to finish.

pub mod error;
pub mod report;
pub mod retry;
mod stage;
pub mod state;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use pipeline_runner::{CancellationToken, RunnerAdapter};
use pipeline_state::RunLog;
use tracing::{debug, warn, Instrument};

pub use error::{exit_code, EngineError, EngineResult};
pub use report::{FailureKind, PipelineReport, StageReport};
pub use retry::RetryPolicy;
pub use stage::CONTAINER_INPUT_ROOT;
pub use state::{IllegalTransition, StageState, StageTracker};

use stage::{absolutize, fingerprint_stage, Completed, RunContext, StageJob};

use crate::cache::{ArtifactCache, CacheKey};
use crate::config::{default_workers, PipelineConfig, DEFAULT_OUTPUT_LIMIT, DEFAULT_STATE_DIR};
use crate::definition::{Stage, StageGraph};
use crate::fingerprint::Fingerprint;
use crate::obs;

/// Knobs that do not change between runs of one engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub workers: usize,
    pub retry: RetryPolicy,
    /// Bytes of captured output kept per run record
    pub output_limit: usize,
    /// Parent of the per-run scratch directories
    pub scratch_dir: PathBuf,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            retry: RetryPolicy::default(),
            output_limit: DEFAULT_OUTPUT_LIMIT,
            scratch_dir: PathBuf::from(DEFAULT_STATE_DIR).join("scratch"),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            workers: config.workers,
            retry: config.retry_policy(),
            output_limit: config.output_limit,
            scratch_dir: config.scratch_dir(),
        }
    }
}

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Skip cache lookups; results are still written
    pub no_cache: bool,
    /// Fingerprint and check the cache only
    pub dry_run: bool,
    /// Overrides [`EngineSettings::workers`]
    pub workers: Option<usize>,
}

/// One stage of a plan.
#[derive(Debug, Clone)]
pub struct PlannedStage {
    pub stage: Stage,
    pub fingerprint: Fingerprint,
    /// An artifact for this fingerprint is in the cache
    pub cached: bool,
}

pub struct Engine {
    graph: Arc<StageGraph>,
    cache: Arc<ArtifactCache>,
    runner: Arc<dyn RunnerAdapter>,
    run_log: Arc<dyn RunLog>,
    settings: EngineSettings,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(
        graph: StageGraph,
        cache: Arc<ArtifactCache>,
        runner: Arc<dyn RunnerAdapter>,
        run_log: Arc<dyn RunLog>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            graph: Arc::new(graph),
            cache,
            runner,
            run_log,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token (e.g. wired to Ctrl-C).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Resolve `target`, fingerprint every stage in order and check which
    /// ones the cache already holds. Nothing is executed or written.
    pub async fn plan(&self, target: &str, no_cache: bool) -> EngineResult<Vec<PlannedStage>> {
        let order = self.graph.resolve_order(target)?;
        let mut fingerprints: HashMap<String, Fingerprint> = HashMap::new();
        let mut planned = Vec::with_capacity(order.len());

        for stage in order {
            let upstream: BTreeMap<String, Fingerprint> = stage
                .depends_on
                .iter()
                .filter_map(|dep| fingerprints.get(dep).map(|fp| (dep.clone(), fp.clone())))
                .collect();
            let fingerprint = fingerprint_stage(stage, self.graph.base_dir(), upstream)
                .await
                .map_err(|source| EngineError::Fingerprint {
                    stage: stage.id.clone(),
                    source,
                })?;

            let cached = if no_cache {
                false
            } else {
                let key = CacheKey::new(&stage.id, fingerprint.clone());
                self.cache.contains(&key).await.unwrap_or_else(|e| {
                    warn!(stage = %stage.id, error = %e, "cache lookup failed during planning");
                    false
                })
            };

            fingerprints.insert(stage.id.clone(), fingerprint.clone());
            planned.push(PlannedStage {
                stage: stage.clone(),
                fingerprint,
                cached,
            });
        }
        Ok(planned)
    }

    /// Run `target` and everything it depends on.
    ///
    /// Stage failures are reported in the returned [`PipelineReport`]; `Err`
    /// means the pipeline could not start.
    pub async fn run(&self, target: &str, options: &RunOptions) -> EngineResult<PipelineReport> {
        let order: Vec<Stage> = self
            .graph
            .resolve_order(target)?
            .into_iter()
            .cloned()
            .collect();
        let run_id = uuid::Uuid::new_v4().to_string();
        let workers = options.workers.unwrap_or(self.settings.workers).max(1);
        let span = obs::run_span(&run_id, target);

        async move {
            let started = Instant::now();
            obs::emit_pipeline_started(&run_id, target, order.len(), workers);

            let mut report = if options.dry_run {
                self.dry_run(&run_id, target, options.no_cache).await?
            } else {
                self.execute(&run_id, target, order, workers, options.no_cache).await
            };

            report.duration_ms = started.elapsed().as_millis() as u64;
            obs::emit_pipeline_finished(&run_id, report.duration_ms, report.success());
            Ok::<_, EngineError>(report)
        }
        .instrument(span)
        .await
    }

    async fn dry_run(&self, run_id: &str, target: &str, no_cache: bool) -> EngineResult<PipelineReport> {
        let planned = self.plan(target, no_cache).await?;
        let stages = planned
            .into_iter()
            .map(|p| StageReport {
                fingerprint: Some(p.fingerprint),
                would_hit: Some(p.cached),
                ..StageReport::pending(p.stage.id)
            })
            .collect();
        Ok(PipelineReport {
            run_id: run_id.to_string(),
            target: target.to_string(),
            definition_digest: self.graph.digest(),
            dry_run: true,
            stages,
            first_failure: None,
            cancelled: None,
            duration_ms: 0,
        })
    }

    async fn execute(
        &self,
        run_id: &str,
        target: &str,
        order: Vec<Stage>,
        workers: usize,
        no_cache: bool,
    ) -> PipelineReport {
        let scratch = absolutize(&self.settings.scratch_dir.join(run_id));
        let ctx = Arc::new(RunContext {
            run_id: run_id.to_string(),
            graph: Arc::clone(&self.graph),
            cache: Arc::clone(&self.cache),
            runner: Arc::clone(&self.runner),
            run_log: Arc::clone(&self.run_log),
            cancel: self.cancel.clone(),
            retry: self.settings.retry,
            output_limit: self.settings.output_limit,
            scratch: scratch.clone(),
            no_cache,
            leases: Mutex::new(Vec::new()),
        });

        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();
        let mut waiting_on: Vec<usize> = order.iter().map(|s| s.depends_on.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); order.len()];
        for (i, stage) in order.iter().enumerate() {
            for dep in &stage.depends_on {
                if let Some(&d) = position.get(dep.as_str()) {
                    dependents[d].push(i);
                }
            }
        }

        let mut ready: BTreeSet<usize> = (0..order.len()).filter(|&i| waiting_on[i] == 0).collect();
        let mut reports: Vec<StageReport> = order.iter().map(|s| StageReport::pending(&s.id)).collect();
        let mut completed: HashMap<String, Completed> = HashMap::new();
        let mut first_failure: Option<String> = None;
        let mut in_flight = FuturesUnordered::new();

        loop {
            while first_failure.is_none() && !self.cancel.is_cancelled() && in_flight.len() < workers {
                let Some(pos) = ready.pop_first() else { break };
                let stage = order[pos].clone();
                let upstream: BTreeMap<String, Completed> = stage
                    .depends_on
                    .iter()
                    .filter_map(|dep| completed.get(dep).map(|c| (dep.clone(), c.clone())))
                    .collect();
                let span = obs::stage_span(&stage.id);
                let handle = tokio::spawn(StageJob::new(Arc::clone(&ctx), stage, upstream).run().instrument(span));
                in_flight.push(async move { (pos, handle.await) });
            }

            let Some((pos, joined)) = in_flight.next().await else { break };
            let id = order[pos].id.clone();
            match joined {
                Ok(outcome) => {
                    reports[pos] = outcome.report;
                    match outcome.completed {
                        Some(done) => {
                            completed.insert(id, done);
                            for &next in &dependents[pos] {
                                waiting_on[next] -= 1;
                                if waiting_on[next] == 0 {
                                    ready.insert(next);
                                }
                            }
                        }
                        None => {
                            first_failure.get_or_insert(id);
                        }
                    }
                }
                Err(join_error) => {
                    reports[pos].state = StageState::Aborted;
                    reports[pos].failure = Some(FailureKind::Runner {
                        error: join_error.to_string(),
                    });
                    first_failure.get_or_insert(id);
                }
            }
        }

        let report = PipelineReport {
            run_id: run_id.to_string(),
            target: target.to_string(),
            definition_digest: self.graph.digest(),
            dry_run: false,
            stages: reports,
            first_failure,
            cancelled: self.cancel.reason(),
            duration_ms: 0,
        };

        drop(ctx);
        if report.success() {
            if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %scratch.display(), error = %e, "could not remove run scratch");
                }
            }
        } else {
            debug!(path = %scratch.display(), "keeping run scratch for inspection");
        }
        report
    }
}
