//! Structured lifecycle events for pipeline runs.
//!
//! Every event carries an `event` field so log aggregation can filter on it:
//! `pipeline.started`, `stage.cache_hit`, `stage.started`, `stage.retrying`,
//! `stage.finished`, `pipeline.finished`.
//!
//! Environment values never pass through here; only stage ids, short
//! fingerprints and outcomes.

use tracing::{info, warn, Span};

/// Span covering one pipeline invocation. Stage tasks are instrumented with
/// child spans of it.
pub fn run_span(run_id: &str, target: &str) -> Span {
    tracing::info_span!("pipeline.run", run_id = %run_id, target = %target)
}

/// Span covering one stage of a run.
pub fn stage_span(stage: &str) -> Span {
    tracing::info_span!("pipeline.stage", stage = %stage)
}

pub fn emit_pipeline_started(run_id: &str, target: &str, stages: usize, workers: usize) {
    info!(
        event = "pipeline.started",
        run_id = %run_id,
        target = %target,
        stages = stages,
        workers = workers,
    );
}

pub fn emit_stage_cache_hit(stage: &str, fingerprint: &str) {
    info!(event = "stage.cache_hit", stage = %stage, fingerprint = %fingerprint);
}

pub fn emit_stage_started(stage: &str, fingerprint: &str, attempt: u32) {
    info!(
        event = "stage.started",
        stage = %stage,
        fingerprint = %fingerprint,
        attempt = attempt,
    );
}

/// Emit event: a transient failure will be retried after `delay_ms`.
pub fn emit_stage_retrying(stage: &str, attempt: u32, delay_ms: u64, reason: &dyn std::fmt::Display) {
    warn!(
        event = "stage.retrying",
        stage = %stage,
        attempt = attempt,
        delay_ms = delay_ms,
        reason = %reason,
    );
}

pub fn emit_stage_finished(stage: &str, fingerprint: &str, attempt: u32, outcome: &str, duration_ms: u64) {
    info!(
        event = "stage.finished",
        stage = %stage,
        fingerprint = %fingerprint,
        attempt = attempt,
        outcome = %outcome,
        duration_ms = duration_ms,
    );
}

/// Emit event: cache read failed, stage falls back to execution.
pub fn emit_cache_fallback(stage: &str, error: &dyn std::fmt::Display) {
    warn!(event = "stage.cache_fallback", stage = %stage, error = %error);
}

pub fn emit_pipeline_finished(run_id: &str, duration_ms: u64, success: bool) {
    info!(
        event = "pipeline.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        success = success,
    );
}
