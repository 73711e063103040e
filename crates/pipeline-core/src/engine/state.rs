//! Per-stage lifecycle state machine.
//!
//! ```text
//! Pending -> Fingerprinting -> CacheCheck -> CacheHit -> Done
//!                                         -> Running -> Succeeded -> Done
//!                                                    -> Failed -> Retrying -> Running
//!                                                              -> Aborted
//! ```
//!
//! `Done` and `Aborted` are terminal. A successful run whose artifact cannot
//! be cached, or a stage whose inputs cannot be read, also ends `Aborted`.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Fingerprinting,
    CacheCheck,
    CacheHit,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Done,
    Aborted,
}

impl StageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StageState::Done | StageState::Aborted)
    }

    pub fn can_transition_to(self, next: StageState) -> bool {
        use StageState::*;
        matches!(
            (self, next),
            (Pending, Fingerprinting)
                | (Fingerprinting, CacheCheck)
                | (Fingerprinting, Aborted)
                | (CacheCheck, CacheHit)
                | (CacheCheck, Running)
                | (CacheCheck, Aborted)
                | (CacheHit, Done)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Succeeded, Done)
                | (Succeeded, Aborted)
                | (Failed, Retrying)
                | (Failed, Aborted)
                | (Retrying, Running)
                | (Retrying, Aborted)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageState::Pending => "pending",
            StageState::Fingerprinting => "fingerprinting",
            StageState::CacheCheck => "cache_check",
            StageState::CacheHit => "cache_hit",
            StageState::Running => "running",
            StageState::Succeeded => "succeeded",
            StageState::Failed => "failed",
            StageState::Retrying => "retrying",
            StageState::Done => "done",
            StageState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition for stage {stage}: {from} -> {to}")]
pub struct IllegalTransition {
    pub stage: String,
    pub from: StageState,
    pub to: StageState,
}

/// Current state of one stage plus the path it took.
#[derive(Debug, Clone)]
pub struct StageTracker {
    stage: String,
    state: StageState,
    history: Vec<StageState>,
}

impl StageTracker {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            state: StageState::Pending,
            history: vec![StageState::Pending],
        }
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn history(&self) -> &[StageState] {
        &self.history
    }

    pub fn advance(&mut self, next: StageState) -> Result<(), IllegalTransition> {
        if !self.state.can_transition_to(next) {
            return Err(IllegalTransition {
                stage: self.stage.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}
