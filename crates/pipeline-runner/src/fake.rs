//! Scripted runner for tests.
//!
//! Each stage gets a queue of steps; once a stage's queue is empty it
//! succeeds with stdout `"<stage>\n"`. Every invocation is recorded so tests
//! can assert on order, counts and peak concurrency.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::cancel::CancellationToken;
use crate::error::{RunnerError, RunnerResult};
use crate::invocation::{RunInvocation, RunOutcome};
use crate::RunnerAdapter;

/// One scripted response.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Succeed { stdout: String },
    Fail { exit_code: i32, stderr: String },
    Unavailable,
    TimedOut,
    /// Sleep, then continue with the next step for the same call
    Delay(Duration),
}

#[derive(Debug, Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<ScriptStep>>>,
    calls: Mutex<Vec<RunInvocation>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a step for `stage`.
    pub fn push(&self, stage: &str, step: ScriptStep) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(stage.to_string())
            .or_default()
            .push_back(step);
        self
    }

    /// Make every call for `stage` sleep first.
    pub fn delay_all(&self, stage: &str, delay: Duration, calls: usize) -> &Self {
        for _ in 0..calls {
            self.push(stage, ScriptStep::Delay(delay));
            self.push(stage, ScriptStep::Succeed {
                stdout: format!("{stage}\n"),
            });
        }
        self
    }

    /// Stage ids in invocation order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|inv| inv.stage_id.clone())
            .collect()
    }

    /// Full invocations in order.
    pub fn invocations(&self) -> Vec<RunInvocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, stage: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|inv| inv.stage_id == stage)
            .count()
    }

    /// Highest number of invocations observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_step(&self, stage: &str) -> Option<ScriptStep> {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(stage)
            .and_then(VecDeque::pop_front)
    }

    async fn respond(
        &self,
        invocation: &RunInvocation,
        cancel: &CancellationToken,
    ) -> RunnerResult<RunOutcome> {
        let stage = invocation.stage_id.clone();
        loop {
            match self.next_step(&stage) {
                Some(ScriptStep::Delay(d)) => {
                    tokio::select! {
                        _ = tokio::time::sleep(d) => {}
                        _ = cancel.cancelled() => {
                            return Err(RunnerError::Cancelled { stage });
                        }
                    }
                }
                Some(ScriptStep::Succeed { stdout }) => return Ok(success(stdout)),
                Some(ScriptStep::Fail { exit_code, stderr }) => {
                    return Ok(RunOutcome {
                        exit_code,
                        stderr,
                        ..Default::default()
                    })
                }
                Some(ScriptStep::Unavailable) => {
                    return Err(RunnerError::Unavailable {
                        stage,
                        reason: "scripted unavailable".into(),
                    })
                }
                Some(ScriptStep::TimedOut) => {
                    return Err(RunnerError::TimedOut {
                        stage,
                        after: invocation.timeout.unwrap_or_default(),
                    })
                }
                None => return Ok(success(format!("{stage}\n"))),
            }
        }
    }
}

fn success(stdout: String) -> RunOutcome {
    RunOutcome {
        artifact: stdout.clone().into_bytes(),
        stdout,
        ..Default::default()
    }
}

#[async_trait]
impl RunnerAdapter for ScriptedRunner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(
        &self,
        invocation: &RunInvocation,
        cancel: &CancellationToken,
    ) -> RunnerResult<RunOutcome> {
        self.calls.lock().unwrap().push(invocation.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result = self.respond(invocation, cancel).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_default() {
        let runner = ScriptedRunner::new();
        runner.push("build", ScriptStep::Unavailable);

        let inv = RunInvocation::new("build", "make");
        let token = CancellationToken::new();
        assert!(runner.run(&inv, &token).await.is_err());
        let out = runner.run(&inv, &token).await.unwrap();
        assert_eq!(out.stdout, "build\n");
        assert_eq!(out.artifact, b"build\n");
        assert_eq!(runner.calls_for("build"), 2);
    }

    #[tokio::test]
    async fn test_delay_is_cancellable() {
        let runner = ScriptedRunner::new();
        runner.push("slow", ScriptStep::Delay(Duration::from_secs(30)));
        let token = CancellationToken::new();
        token.cancel("test");
        let err = runner
            .run(&RunInvocation::new("slow", "sleep"), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Cancelled { .. }));
    }
}
