//! Host process runner.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::cancel::CancellationToken;
use crate::error::RunnerResult;
use crate::exec::{into_outcome, prepare_dirs, run_child};
use crate::invocation::{RunInvocation, RunOutcome};
use crate::RunnerAdapter;

/// Variables copied from the orchestrator's own environment by default.
pub const DEFAULT_INHERITED: &[&str] = &["PATH", "HOME", "TMPDIR", "LANG"];

/// Runs stage commands with `sh -c` on the host.
///
/// The child starts from an empty environment: only the inherited
/// allow-list, the invocation's variables and the `PIPELINE_*` locations
/// are visible.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    shell: String,
    inherit: Vec<String>,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            inherit: DEFAULT_INHERITED.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list of variables inherited from the parent process.
    pub fn with_inherited<I, S>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inherit = vars.into_iter().map(Into::into).collect();
        self
    }

    fn command(&self, invocation: &RunInvocation) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(&invocation.command);
        cmd.env_clear();
        for key in &self.inherit {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        for (key, value) in invocation.env.iter() {
            cmd.env(key, value);
        }
        cmd.env("PIPELINE_STAGE", &invocation.stage_id);
        cmd.env("PIPELINE_OUT_DIR", &invocation.out_dir);
        cmd.env("PIPELINE_WORK_DIR", &invocation.work_dir);
        for mount in &invocation.mounts {
            cmd.env(mount.env_var(), &mount.host_path);
        }
        cmd.current_dir(&invocation.work_dir);
        cmd
    }
}

#[async_trait]
impl RunnerAdapter for ProcessRunner {
    fn name(&self) -> &str {
        "process"
    }

    async fn run(
        &self,
        invocation: &RunInvocation,
        cancel: &CancellationToken,
    ) -> RunnerResult<RunOutcome> {
        prepare_dirs(invocation)?;
        info!(stage = %invocation.stage_id, runner = "process", "starting stage command");
        debug!(
            stage = %invocation.stage_id,
            env_keys = ?invocation.env,
            mounts = invocation.mounts.len(),
            "process invocation"
        );

        let child = run_child(
            self.command(invocation),
            &invocation.stage_id,
            invocation.timeout,
            cancel,
        )
        .await?;
        into_outcome(invocation, child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::Mount;

    fn invocation(dir: &std::path::Path, command: &str) -> RunInvocation {
        let mut inv = RunInvocation::new("unit", command);
        inv.out_dir = dir.join("out");
        inv.work_dir = dir.join("work");
        inv
    }

    #[tokio::test]
    async fn test_env_is_scrubbed() {
        std::env::set_var("PIPELINE_RUNNER_TEST_LEAK", "leaked");
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(dir.path(), "echo \"[${PIPELINE_RUNNER_TEST_LEAK}]\"");

        let out = ProcessRunner::new()
            .run(&inv, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "[]");
    }

    #[tokio::test]
    async fn test_locations_and_mounts_are_exported() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = invocation(
            dir.path(),
            "echo $PIPELINE_STAGE; echo $PIPELINE_MOUNT_LOCK",
        );
        inv.mounts.push(Mount {
            name: "lock".into(),
            host_path: dir.path().join("lock"),
            target: "/pipeline/in/lock".into(),
            read_only: true,
        });

        let out = ProcessRunner::new()
            .run(&inv, &CancellationToken::new())
            .await
            .unwrap();
        let lines: Vec<&str> = out.stdout.lines().collect();
        assert_eq!(lines[0], "unit");
        assert!(lines[1].ends_with("lock"));
    }

    #[tokio::test]
    async fn test_missing_shell_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(dir.path(), "true");
        let runner = ProcessRunner {
            shell: "/nonexistent/shell".into(),
            inherit: Vec::new(),
        };
        let err = runner
            .run(&inv, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
