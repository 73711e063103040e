//! Child-process plumbing shared by the process and container runners.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, warn};

use crate::artifact::pack_outputs;
use crate::cancel::CancellationToken;
use crate::error::{RunnerError, RunnerResult};
use crate::invocation::{RunInvocation, RunOutcome};

/// Raw result of a finished child.
pub(crate) struct ChildOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Spawn `command` and wait for it, racing the timeout and cancellation.
///
/// The child leads its own process group. When the wait is abandoned the
/// whole group is killed, so commands it started in turn stop too.
pub(crate) async fn run_child(
    mut command: Command,
    stage: &str,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> RunnerResult<ChildOutput> {
    let start = Instant::now();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let child = command.spawn().map_err(|e| RunnerError::Unavailable {
        stage: stage.to_string(),
        reason: format!("failed to spawn: {e}"),
    })?;
    let pid = child.id();

    let wait = child.wait_with_output();
    tokio::pin!(wait);

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let output = tokio::select! {
        res = &mut wait => res.map_err(|source| RunnerError::Io {
            stage: stage.to_string(),
            source,
        })?,
        _ = deadline => {
            kill_group(stage, pid).await;
            return Err(RunnerError::TimedOut {
                stage: stage.to_string(),
                after: timeout.unwrap_or_default(),
            });
        }
        _ = cancel.cancelled() => {
            kill_group(stage, pid).await;
            return Err(RunnerError::Cancelled { stage: stage.to_string() });
        }
    };

    let duration_ms = start.elapsed().as_millis() as u64;
    let exit_code = output.status.code().unwrap_or(-1);
    debug!(stage = %stage, exit_code, duration_ms, "child exited");

    Ok(ChildOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms,
    })
}

/// SIGKILL every process in the group led by `pid`.
async fn kill_group(stage: &str, pid: Option<u32>) {
    let Some(pid) = pid else { return };
    if cfg!(not(unix)) {
        return;
    }
    let result = Command::new("sh")
        .arg("-c")
        .arg(format!("kill -9 -{pid}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) if status.success() => debug!(stage = %stage, pid, "killed stage process group"),
        Ok(status) => debug!(stage = %stage, pid, status = %status, "process group already gone"),
        Err(e) => warn!(stage = %stage, pid, error = %e, "failed to kill stage process group"),
    }
}

/// Turn a finished child into an outcome, packing declared outputs on success.
pub(crate) fn into_outcome(invocation: &RunInvocation, child: ChildOutput) -> RunnerResult<RunOutcome> {
    let mut outcome = RunOutcome {
        artifact: Vec::new(),
        exit_code: child.exit_code,
        stdout: child.stdout,
        stderr: child.stderr,
        duration_ms: child.duration_ms,
        missing_outputs: Vec::new(),
    };

    if outcome.exit_code != 0 {
        return Ok(outcome);
    }

    if invocation.outputs.is_empty() {
        outcome.artifact = outcome.stdout.clone().into_bytes();
    } else {
        let packed = pack_outputs(&invocation.out_dir, &invocation.outputs).map_err(|source| {
            RunnerError::Io {
                stage: invocation.stage_id.clone(),
                source,
            }
        })?;
        outcome.artifact = packed.archive;
        outcome.missing_outputs = packed.missing;
    }
    Ok(outcome)
}

/// Create the output and working directories before the child starts.
pub(crate) fn prepare_dirs(invocation: &RunInvocation) -> RunnerResult<()> {
    for dir in [&invocation.out_dir, &invocation.work_dir] {
        std::fs::create_dir_all(dir).map_err(|source| RunnerError::Io {
            stage: invocation.stage_id.clone(),
            source,
        })?;
    }
    Ok(())
}
