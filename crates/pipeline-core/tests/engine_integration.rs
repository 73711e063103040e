//! Engine behaviour end to end: scheduling, caching, failure handling,
//! retries, cancellation and the worker cap.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pipeline_core::cache::{ArtifactCache, CacheKey, CacheLimits};
use pipeline_core::engine::{
    Engine, EngineSettings, FailureKind, RetryPolicy, RunOptions, StageState,
};
use pipeline_core::{Stage, StageGraph};
use pipeline_runner::{
    CancellationToken, ProcessRunner, RunnerAdapter, ScriptStep, ScriptedRunner,
};
use pipeline_state::fakes::MemoryRunLog;
use pipeline_state::{
    BlobStore, ContentDigest, RecordFilter, RecordOutcome, RunLog, StorageError, StorageResult,
};
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    runner: Arc<ScriptedRunner>,
    cache: Arc<ArtifactCache>,
    log: Arc<MemoryRunLog>,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            runner: Arc::new(ScriptedRunner::new()),
            cache: Arc::new(ArtifactCache::in_memory(CacheLimits::default())),
            log: Arc::new(MemoryRunLog::new()),
        }
    }

    fn settings(&self, workers: usize) -> EngineSettings {
        EngineSettings {
            workers,
            retry: RetryPolicy::immediate(),
            output_limit: 4096,
            scratch_dir: self.dir.path().join("scratch"),
        }
    }

    fn engine(&self, stages: Vec<Stage>) -> Engine {
        self.engine_with(stages, 4, self.runner.clone())
    }

    fn engine_with(&self, stages: Vec<Stage>, workers: usize, runner: Arc<dyn RunnerAdapter>) -> Engine {
        let graph = StageGraph::new(None, stages, self.dir.path().to_path_buf()).unwrap();
        Engine::new(
            graph,
            self.cache.clone(),
            runner,
            self.log.clone(),
            self.settings(workers),
        )
    }

    fn write(&self, name: &str, content: &str) {
        std::fs::write(self.dir.path().join(name), content).unwrap();
    }

    async fn records(&self, stage: &str) -> Vec<pipeline_state::RunRecord> {
        self.log
            .list(&RecordFilter {
                stage_id: Some(stage.into()),
                ..Default::default()
            })
            .await
            .unwrap()
    }
}

fn serverless() -> Vec<Stage> {
    vec![
        Stage::new("lock", "pip-compile requirements.in").inputs(["requirements.in"]),
        Stage::new("build", "pip install -r {{upstream.lock}}/stdout").depends_on(["lock"]),
        Stage::new("package", "zip -r fn.zip {{upstream.build}}").depends_on(["build"]),
        Stage::new("deploy", "aws lambda update-function-code").depends_on(["package"]),
    ]
}

fn run() -> RunOptions {
    RunOptions::default()
}

#[tokio::test]
async fn stages_run_in_dependency_order() {
    let h = Harness::new();
    h.write("requirements.in", "requests\n");
    let engine = h.engine(serverless());

    let report = engine.run("deploy", &run()).await.unwrap();
    assert!(report.success());
    assert_eq!(report.exit_code(), 0);
    assert_eq!(h.runner.calls(), vec!["lock", "build", "package", "deploy"]);
    assert!(report.stages.iter().all(|s| s.state == StageState::Done));
    assert_eq!(report.definition_digest, engine.graph().digest());

    let lock = h.records("lock").await;
    assert_eq!(lock.len(), 1);
    assert_eq!(lock[0].outcome, Some(RecordOutcome::Succeeded));
    assert_eq!(lock[0].run_id, report.run_id);
}

#[tokio::test]
async fn target_runs_only_its_dependencies() {
    let h = Harness::new();
    h.write("requirements.in", "requests\n");
    let engine = h.engine(serverless());

    let report = engine.run("build", &run()).await.unwrap();
    assert!(report.success());
    assert_eq!(h.runner.calls(), vec!["lock", "build"]);
    assert_eq!(report.stages.len(), 2);
}

#[tokio::test]
async fn unknown_target_is_an_error() {
    let h = Harness::new();
    let engine = h.engine(serverless());
    let err = engine.run("publish", &run()).await.unwrap_err();
    assert_eq!(err.exit_code(), 1);
    assert_eq!(h.runner.call_count(), 0);
}

#[tokio::test]
async fn second_run_is_served_from_cache() {
    let h = Harness::new();
    h.write("requirements.in", "requests\n");
    let engine = h.engine(serverless());

    engine.run("deploy", &run()).await.unwrap();
    let second = engine.run("deploy", &run()).await.unwrap();

    assert!(second.success());
    assert_eq!(h.runner.call_count(), 4);
    assert_eq!(second.cache_hits(), 4);
    assert!(second.stages.iter().all(|s| s.attempts == 0));
    assert_eq!(h.log.list(&RecordFilter::default()).await.unwrap().len(), 4);
}

#[tokio::test]
async fn no_cache_reexecutes_but_still_writes() {
    let h = Harness::new();
    h.write("requirements.in", "requests\n");
    let engine = h.engine(serverless());

    let options = RunOptions {
        no_cache: true,
        ..RunOptions::default()
    };
    engine.run("deploy", &options).await.unwrap();
    engine.run("deploy", &options).await.unwrap();
    assert_eq!(h.runner.call_count(), 8);

    let cached = engine.run("deploy", &run()).await.unwrap();
    assert_eq!(cached.cache_hits(), 4);
    assert_eq!(h.runner.call_count(), 8);
}

#[tokio::test]
async fn input_change_invalidates_stage_and_downstream_only() {
    let h = Harness::new();
    h.write("requirements.in", "requests\n");
    h.write("handler.py", "def handler(e, c): pass\n");
    let stages = vec![
        Stage::new("lock", "pip-compile").inputs(["requirements.in"]),
        Stage::new("lint", "ruff handler.py").inputs(["handler.py"]),
        Stage::new("build", "pip install").depends_on(["lock"]),
        Stage::new("deploy", "sam deploy").depends_on(["build", "lint"]),
    ];
    let engine = h.engine(stages);

    engine.run("deploy", &run()).await.unwrap();
    h.write("requirements.in", "requests==2.31\n");
    let report = engine.run("deploy", &run()).await.unwrap();

    assert!(report.success());
    assert_eq!(h.runner.calls_for("lock"), 2);
    assert_eq!(h.runner.calls_for("build"), 2);
    assert_eq!(h.runner.calls_for("deploy"), 2);
    assert_eq!(h.runner.calls_for("lint"), 1);
    assert!(report.stage("lint").unwrap().cache_hit);
}

#[tokio::test]
async fn failure_halts_downstream() {
    let h = Harness::new();
    h.write("requirements.in", "requests\n");
    h.runner.push(
        "build",
        ScriptStep::Fail {
            exit_code: 2,
            stderr: "error: could not find a version\n".into(),
        },
    );
    let engine = h.engine(serverless());

    let report = engine.run("deploy", &run()).await.unwrap();
    assert!(!report.success());
    assert_eq!(report.exit_code(), 3);
    assert_eq!(report.first_failure.as_deref(), Some("build"));

    let failed = report.failure().unwrap();
    assert_eq!(failed.state, StageState::Aborted);
    assert_eq!(failed.exit_code, Some(2));
    assert_eq!(failed.failure, Some(FailureKind::Exit { code: 2 }));
    assert!(failed.output.contains("could not find a version"));

    assert_eq!(report.stage("lock").unwrap().state, StageState::Done);
    assert_eq!(report.stage("package").unwrap().state, StageState::Pending);
    assert_eq!(report.not_attempted().count(), 2);
    assert_eq!(h.runner.calls(), vec!["lock", "build"]);

    let records = h.records("build").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, Some(RecordOutcome::Failed));
    assert_eq!(records[0].exit_code, Some(2));
}

#[tokio::test]
async fn failed_stage_is_not_cached() {
    let h = Harness::new();
    h.write("requirements.in", "requests\n");
    h.runner.push(
        "lock",
        ScriptStep::Fail {
            exit_code: 1,
            stderr: String::new(),
        },
    );
    let engine = h.engine(serverless());

    engine.run("lock", &run()).await.unwrap();
    let retry = engine.run("lock", &run()).await.unwrap();
    assert!(retry.success());
    assert_eq!(retry.cache_hits(), 0);
    assert_eq!(h.runner.calls_for("lock"), 2);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let h = Harness::new();
    h.write("requirements.in", "requests\n");
    h.runner.push("build", ScriptStep::Unavailable);
    h.runner.push("build", ScriptStep::Unavailable);
    let mut stages = serverless();
    stages[1].retries = 2;
    let engine = h.engine(stages);

    let report = engine.run("deploy", &run()).await.unwrap();
    assert!(report.success());
    assert_eq!(h.runner.calls_for("build"), 3);
    assert_eq!(report.stage("build").unwrap().attempts, 3);

    let outcomes: Vec<_> = h.records("build").await.iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            Some(RecordOutcome::Unavailable),
            Some(RecordOutcome::Unavailable),
            Some(RecordOutcome::Succeeded)
        ]
    );
}

#[tokio::test]
async fn retries_are_bounded() {
    let h = Harness::new();
    h.write("requirements.in", "requests\n");
    for _ in 0..3 {
        h.runner.push("lock", ScriptStep::Unavailable);
    }
    let mut stages = serverless();
    stages[0].retries = 1;
    let engine = h.engine(stages);

    let report = engine.run("deploy", &run()).await.unwrap();
    assert_eq!(report.exit_code(), 3);
    assert_eq!(h.runner.calls_for("lock"), 2);
    assert!(matches!(
        report.stage("lock").unwrap().failure,
        Some(FailureKind::Unavailable { .. })
    ));
}

#[tokio::test]
async fn exit_failures_are_never_retried() {
    let h = Harness::new();
    h.write("requirements.in", "requests\n");
    h.runner.push(
        "lock",
        ScriptStep::Fail {
            exit_code: 1,
            stderr: String::new(),
        },
    );
    let mut stages = serverless();
    stages[0].retries = 3;
    let engine = h.engine(stages);

    let report = engine.run("deploy", &run()).await.unwrap();
    assert_eq!(report.exit_code(), 3);
    assert_eq!(h.runner.calls_for("lock"), 1);
}

#[tokio::test]
async fn timeouts_retry_only_when_enabled() {
    let h = Harness::new();
    h.write("requirements.in", "requests\n");
    h.runner.push("lock", ScriptStep::TimedOut);
    let mut stages = serverless();
    stages[0].retries = 1;
    stages[0].timeout_seconds = Some(30);
    let engine = h.engine(stages.clone());

    let report = engine.run("lock", &run()).await.unwrap();
    assert_eq!(report.exit_code(), 3);
    assert_eq!(
        report.stage("lock").unwrap().failure,
        Some(FailureKind::TimedOut { after_secs: 30 })
    );
    assert_eq!(h.runner.calls_for("lock"), 1);

    h.runner.push("lock", ScriptStep::TimedOut);
    stages[0].retry_on_timeout = true;
    let engine = h.engine(stages);
    let report = engine.run("lock", &run()).await.unwrap();
    assert!(report.success());
    assert_eq!(h.runner.calls_for("lock"), 3);
}

#[tokio::test]
async fn cancellation_stops_pending_stages() {
    let h = Harness::new();
    h.write("requirements.in", "requests\n");
    h.runner.push("lock", ScriptStep::Delay(Duration::from_secs(30)));
    let engine = h.engine(serverless());
    let token = engine.cancellation_token();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel("interrupted");
    });

    let started = std::time::Instant::now();
    let report = engine.run("deploy", &run()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.exit_code(), 130);
    assert_eq!(report.cancelled.as_deref(), Some("interrupted"));
    assert_eq!(report.stage("lock").unwrap().failure, Some(FailureKind::Cancelled));
    assert_eq!(report.stage("build").unwrap().state, StageState::Pending);
    assert_eq!(h.runner.calls(), vec!["lock"]);

    let records = h.records("lock").await;
    assert_eq!(records[0].outcome, Some(RecordOutcome::Cancelled));
}

#[tokio::test]
async fn cancelled_before_start_runs_nothing() {
    let h = Harness::new();
    h.write("requirements.in", "requests\n");
    let token = CancellationToken::new();
    token.cancel("shutdown");
    let engine = h.engine(serverless()).with_cancellation(token);

    let report = engine.run("deploy", &run()).await.unwrap();
    assert_eq!(report.exit_code(), 130);
    assert_eq!(h.runner.call_count(), 0);
    assert_eq!(report.not_attempted().count(), 4);
}

#[tokio::test]
async fn worker_cap_bounds_parallelism() {
    let h = Harness::new();
    let mut stages: Vec<Stage> = (0..6)
        .map(|i| Stage::new(format!("fn{i}"), "sam build"))
        .collect();
    stages.push(Stage::new("deploy", "sam deploy").depends_on((0..6).map(|i| format!("fn{i}"))));
    for i in 0..6 {
        h.runner.delay_all(&format!("fn{i}"), Duration::from_millis(150), 1);
    }

    let engine = h.engine_with(stages, 2, h.runner.clone());
    let report = engine.run("deploy", &run()).await.unwrap();
    assert!(report.success());
    assert!(h.runner.peak_concurrency() <= 2);
    assert_eq!(h.runner.calls().last().map(String::as_str), Some("deploy"));
}

#[tokio::test]
async fn independent_stages_run_in_parallel() {
    let h = Harness::new();
    let stages: Vec<Stage> = (0..4)
        .map(|i| Stage::new(format!("fn{i}"), "sam build"))
        .chain(std::iter::once(
            Stage::new("deploy", "sam deploy").depends_on((0..4).map(|i| format!("fn{i}"))),
        ))
        .collect();
    for i in 0..4 {
        h.runner.delay_all(&format!("fn{i}"), Duration::from_millis(300), 1);
    }

    let options = RunOptions {
        workers: Some(4),
        ..RunOptions::default()
    };
    let engine = h.engine_with(stages, 1, h.runner.clone());
    let report = engine.run("deploy", &options).await.unwrap();
    assert!(report.success());
    assert!(h.runner.peak_concurrency() > 1);
}

#[tokio::test]
async fn dry_run_invokes_nothing() {
    let h = Harness::new();
    h.write("requirements.in", "requests\n");
    let engine = h.engine(serverless());
    let dry = RunOptions {
        dry_run: true,
        ..RunOptions::default()
    };

    let report = engine.run("deploy", &dry).await.unwrap();
    assert!(report.dry_run);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(h.runner.call_count(), 0);
    assert!(report.stages.iter().all(|s| s.would_hit == Some(false)));
    assert!(report.stages.iter().all(|s| s.fingerprint.is_some()));
    assert!(h.log.list(&RecordFilter::default()).await.unwrap().is_empty());

    engine.run("deploy", &run()).await.unwrap();
    let report = engine.run("deploy", &dry).await.unwrap();
    assert!(report.stages.iter().all(|s| s.would_hit == Some(true)));
    assert_eq!(h.runner.call_count(), 4);
}

#[tokio::test]
async fn plan_matches_executed_fingerprints() {
    let h = Harness::new();
    h.write("requirements.in", "requests\n");
    let engine = h.engine(serverless());

    let plan = engine.plan("deploy", false).await.unwrap();
    let report = engine.run("deploy", &run()).await.unwrap();
    for planned in &plan {
        let stage = report.stage(&planned.stage.id).unwrap();
        assert_eq!(stage.fingerprint.as_ref(), Some(&planned.fingerprint));
    }
}

#[tokio::test]
async fn concurrent_runs_populate_each_key_once() {
    let h = Harness::new();
    h.write("requirements.in", "requests\n");
    h.runner.delay_all("lock", Duration::from_millis(200), 1);
    let a = h.engine(serverless());
    let b = h.engine(serverless());

    let (run_a, run_b) = (run(), run());
    let (ra, rb) = tokio::join!(a.run("deploy", &run_a), b.run("deploy", &run_b));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert!(ra.success() && rb.success());
    for stage in ["lock", "build", "package", "deploy"] {
        assert_eq!(h.runner.calls_for(stage), 1, "{stage} ran more than once");
    }
    assert_eq!(ra.cache_hits() + rb.cache_hits(), 4);
}

#[tokio::test]
async fn upstream_artifacts_are_mounted_read_only() {
    let h = Harness::new();
    h.write("requirements.in", "requests\n");
    h.runner.push(
        "lock",
        ScriptStep::Succeed {
            stdout: "requests==2.31.0\n".into(),
        },
    );
    h.runner.push(
        "build",
        ScriptStep::Fail {
            exit_code: 1,
            stderr: String::new(),
        },
    );
    let engine = h.engine(serverless());
    engine.run("deploy", &run()).await.unwrap();

    let build = h
        .runner
        .invocations()
        .into_iter()
        .find(|inv| inv.stage_id == "build")
        .unwrap();
    assert_eq!(build.command, "pip install -r ${PIPELINE_MOUNT_LOCK}/stdout");
    assert_eq!(build.mounts.len(), 1);
    let mount = &build.mounts[0];
    assert!(mount.read_only);
    assert_eq!(mount.target, Path::new("/pipeline/in/lock"));
    let staged = std::fs::read_to_string(mount.host_path.join("stdout")).unwrap();
    assert_eq!(staged, "requests==2.31.0\n");
}

/// Blob store whose writes always fail.
struct ReadOnlyStore;

#[async_trait]
impl BlobStore for ReadOnlyStore {
    async fn put(&self, _data: &[u8]) -> StorageResult<ContentDigest> {
        Err(StorageError::Backend("read-only filesystem".into()))
    }

    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        Err(StorageError::NotFound {
            digest: digest.to_string(),
        })
    }

    async fn contains(&self, _digest: &ContentDigest) -> StorageResult<bool> {
        Ok(false)
    }

    async fn delete(&self, _digest: &ContentDigest) -> StorageResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn cache_write_failure_aborts_stage() {
    let mut h = Harness::new();
    h.write("requirements.in", "requests\n");
    h.cache = Arc::new(ArtifactCache::with_store(
        Arc::new(ReadOnlyStore),
        CacheLimits::default(),
    ));
    let engine = h.engine(serverless());

    let report = engine.run("deploy", &run()).await.unwrap();
    assert_eq!(report.exit_code(), 4);
    assert_eq!(report.first_failure.as_deref(), Some("lock"));
    assert!(matches!(
        report.stage("lock").unwrap().failure,
        Some(FailureKind::CacheWrite { .. })
    ));
    assert_eq!(report.stage("build").unwrap().state, StageState::Pending);

    let records = h.records("lock").await;
    assert_eq!(records[0].outcome, Some(RecordOutcome::CacheWriteFailed));
}

#[tokio::test]
async fn serverless_pipeline_end_to_end() {
    let h = Harness::new();
    h.write("requirements.in", "requests\n");
    h.write("handler.py", "def handler(event, context):\n    return 200\n");
    let stages = vec![
        Stage::new("lock", "cp requirements.in {{out_dir}}/requirements.txt")
            .inputs(["requirements.in"])
            .outputs(["requirements.txt"]),
        Stage::new(
            "build",
            "mkdir -p {{out_dir}}/build && cp {{upstream.lock}}/requirements.txt handler.py {{out_dir}}/build/",
        )
        .depends_on(["lock"])
        .inputs(["handler.py"])
        .outputs(["build"]),
        Stage::new("package", "cat {{upstream.build}}/build/handler.py {{upstream.build}}/build/requirements.txt > {{out_dir}}/bundle.txt")
            .depends_on(["build"])
            .outputs(["bundle.txt"]),
        Stage::new("deploy", "echo deployed {{stage}} && cat {{upstream.package}}/bundle.txt")
            .depends_on(["package"]),
    ];
    let runner: Arc<dyn RunnerAdapter> = Arc::new(ProcessRunner::new());
    let engine = h.engine_with(stages, 2, runner);

    let first = engine.run("deploy", &run()).await.unwrap();
    assert!(first.success(), "{:?}", first.failure());

    let deploy_fp = first.stage("deploy").unwrap().fingerprint.clone().unwrap();
    let artifact = h
        .cache
        .get(&CacheKey::new("deploy", deploy_fp))
        .await
        .unwrap()
        .unwrap();
    let text = String::from_utf8(artifact.bytes).unwrap();
    assert!(text.starts_with("deployed deploy\n"));
    assert!(text.contains("return 200"));
    assert!(text.contains("requests"));

    let second = engine.run("deploy", &run()).await.unwrap();
    assert_eq!(second.exit_code(), 0);
    assert_eq!(second.cache_hits(), 4);

    assert!(!h.dir.path().join("scratch").join(&first.run_id).exists());
}

#[tokio::test]
async fn missing_declared_output_fails_stage() {
    let h = Harness::new();
    let stages = vec![Stage::new("package", "true").outputs(["function.zip"])];
    let runner: Arc<dyn RunnerAdapter> = Arc::new(ProcessRunner::new());
    let engine = h.engine_with(stages, 1, runner);

    let report = engine.run("package", &run()).await.unwrap();
    assert_eq!(report.exit_code(), 3);
    assert_eq!(
        report.stage("package").unwrap().failure,
        Some(FailureKind::MissingOutputs {
            outputs: vec!["function.zip".into()]
        })
    );
}
