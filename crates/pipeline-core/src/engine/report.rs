//! What a pipeline run did, stage by stage.

use serde::Serialize;

use super::error::exit_code;
use super::state::StageState;
use crate::fingerprint::Fingerprint;

/// Why a stage did not reach `Done`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// Command exited non-zero
    Exit { code: i32 },
    /// Command exited zero but declared outputs were not produced
    MissingOutputs { outputs: Vec<String> },
    TimedOut { after_secs: u64 },
    /// Isolation backend unavailable after all retries
    Unavailable { reason: String },
    Cancelled,
    CacheWrite { error: String },
    RunLog { error: String },
    /// Inputs could not be read or scratch space prepared
    Inputs { error: String },
    /// Runner rejected the invocation or failed internally
    Runner { error: String },
}

impl FailureKind {
    pub fn exit_code(&self) -> i32 {
        match self {
            FailureKind::CacheWrite { .. } => exit_code::CACHE,
            FailureKind::RunLog { .. } => exit_code::CONFIG,
            FailureKind::Cancelled => exit_code::CANCELLED,
            _ => exit_code::STAGE_FAILED,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            FailureKind::Exit { code } => format!("exited with status {code}"),
            FailureKind::MissingOutputs { outputs } => {
                format!("missing declared outputs: {}", outputs.join(", "))
            }
            FailureKind::TimedOut { after_secs } => format!("timed out after {after_secs}s"),
            FailureKind::Unavailable { reason } => format!("runner unavailable: {reason}"),
            FailureKind::Cancelled => "cancelled".to_string(),
            FailureKind::CacheWrite { error } => format!("cache write failed: {error}"),
            FailureKind::RunLog { error } => format!("run log error: {error}"),
            FailureKind::Inputs { error } => format!("cannot prepare inputs: {error}"),
            FailureKind::Runner { error } => format!("runner error: {error}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub state: StageState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    /// Runner invocations made for this stage
    pub attempts: u32,
    pub cache_hit: bool,
    /// Dry runs only: whether the stage would be served from the cache
    #[serde(skip_serializing_if = "Option::is_none")]
    pub would_hit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Captured output of the last attempt (failures only)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl StageReport {
    pub fn pending(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            state: StageState::Pending,
            fingerprint: None,
            attempts: 0,
            cache_hit: false,
            would_hit: None,
            exit_code: None,
            duration_ms: 0,
            output: String::new(),
            failure: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == StageState::Done
    }

    pub fn not_attempted(&self) -> bool {
        self.state == StageState::Pending && self.would_hit.is_none()
    }

    /// Short status word for summaries.
    pub fn status(&self) -> &'static str {
        match (self.state, self.would_hit) {
            (StageState::Pending, Some(true)) => "would hit",
            (StageState::Pending, Some(false)) => "would run",
            (StageState::Pending, None) => "not attempted",
            (StageState::Done, _) if self.cache_hit => "hit",
            (StageState::Done, _) => "passed",
            (StageState::Aborted, _) => "failed",
            _ => "incomplete",
        }
    }

    /// One-line summary: `lock  hit  3f2a9c0d1e4b`.
    pub fn summary_line(&self) -> String {
        let mut line = format!("{:<16} {:<14}", self.stage, self.status());
        if let Some(fp) = &self.fingerprint {
            line.push(' ');
            line.push_str(fp.short());
        }
        if self.attempts > 1 {
            line.push_str(&format!(" ({} attempts)", self.attempts));
        }
        if let Some(failure) = &self.failure {
            line.push_str(&format!(" - {}", failure.describe()));
        }
        line
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub target: String,
    /// Digest of the stage graph the run executed
    pub definition_digest: String,
    pub dry_run: bool,
    /// In resolved execution order
    pub stages: Vec<StageReport>,
    /// Stage whose failure halted the pipeline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<String>,
    pub duration_ms: u64,
}

impl PipelineReport {
    pub fn success(&self) -> bool {
        self.first_failure.is_none()
            && self.cancelled.is_none()
            && (self.dry_run || self.stages.iter().all(StageReport::is_done))
    }

    pub fn stage(&self, id: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == id)
    }

    pub fn failure(&self) -> Option<&StageReport> {
        self.first_failure.as_deref().and_then(|id| self.stage(id))
    }

    pub fn done(&self) -> impl Iterator<Item = &StageReport> {
        self.stages.iter().filter(|s| s.is_done())
    }

    pub fn aborted(&self) -> impl Iterator<Item = &StageReport> {
        self.stages.iter().filter(|s| s.state == StageState::Aborted)
    }

    pub fn not_attempted(&self) -> impl Iterator<Item = &StageReport> {
        self.stages.iter().filter(|s| s.not_attempted())
    }

    pub fn cache_hits(&self) -> usize {
        self.stages.iter().filter(|s| s.cache_hit).count()
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() {
            return exit_code::SUCCESS;
        }
        if let Some(failure) = self.failure().and_then(|s| s.failure.as_ref()) {
            return failure.exit_code();
        }
        if self.cancelled.is_some() {
            return exit_code::CANCELLED;
        }
        exit_code::STAGE_FAILED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done(stage: &str, hit: bool) -> StageReport {
        StageReport {
            state: StageState::Done,
            cache_hit: hit,
            ..StageReport::pending(stage)
        }
    }

    fn report(stages: Vec<StageReport>) -> PipelineReport {
        PipelineReport {
            run_id: "r".into(),
            target: "deploy".into(),
            definition_digest: String::new(),
            dry_run: false,
            stages,
            first_failure: None,
            cancelled: None,
            duration_ms: 0,
        }
    }

    #[test]
    fn test_all_done_is_success() {
        let r = report(vec![done("lock", true), done("build", false)]);
        assert!(r.success());
        assert_eq!(r.exit_code(), 0);
        assert_eq!(r.cache_hits(), 1);
    }

    #[test]
    fn test_failure_exit_codes() {
        let failed = StageReport {
            state: StageState::Aborted,
            failure: Some(FailureKind::Exit { code: 2 }),
            ..StageReport::pending("build")
        };
        let mut r = report(vec![done("lock", false), failed, StageReport::pending("package")]);
        r.first_failure = Some("build".into());
        assert_eq!(r.exit_code(), 3);
        assert_eq!(r.not_attempted().count(), 1);
        assert_eq!(r.aborted().count(), 1);

        r.stages[1].failure = Some(FailureKind::CacheWrite { error: "disk full".into() });
        assert_eq!(r.exit_code(), 4);
    }

    #[test]
    fn test_cancelled_without_failure() {
        let mut r = report(vec![StageReport::pending("lock")]);
        r.cancelled = Some("ctrl-c".into());
        assert_eq!(r.exit_code(), 130);
    }

    #[test]
    fn test_summary_line_mentions_failure() {
        let failed = StageReport {
            state: StageState::Aborted,
            attempts: 3,
            failure: Some(FailureKind::Unavailable { reason: "docker down".into() }),
            ..StageReport::pending("lock")
        };
        let line = failed.summary_line();
        assert!(line.contains("failed"));
        assert!(line.contains("3 attempts"));
        assert!(line.contains("docker down"));
    }
}
