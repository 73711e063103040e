//! Container runner: shells out to a docker-compatible CLI.
//!
//! The stage's working and output directories and every upstream mount are
//! bind-mounted at fixed container paths. Environment values travel through
//! the CLI's own environment (`-e KEY`), so they never appear on a command
//! line.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::error::{RunnerError, RunnerResult};
use crate::exec::{into_outcome, prepare_dirs, run_child};
use crate::invocation::{RunInvocation, RunOutcome};
use crate::RunnerAdapter;

pub const CONTAINER_WORK_DIR: &str = "/pipeline/work";
pub const CONTAINER_OUT_DIR: &str = "/pipeline/out";

/// Exit status docker and podman use when the container could not be started.
const CLI_START_FAILURE: i32 = 125;

static CONTAINER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Name for one attempt's container, unique within this process.
fn container_name(stage: &str) -> String {
    let seq = CONTAINER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("pipeline-{}-{}-{}", std::process::id(), stage, seq)
}

/// Whether a 125 exit came from the CLI itself rather than the stage command.
///
/// docker prefixes its own errors with `docker: ` and podman with `Error: `.
fn is_cli_start_failure(cli: &str, stderr: &str) -> bool {
    let program = Path::new(cli)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(cli);
    let own_prefix = format!("{program}: ");
    stderr.lines().any(|line| {
        line.starts_with(&own_prefix)
            || line.starts_with("Error: ")
            || line.starts_with("Error response from daemon")
    })
}

#[derive(Debug, Clone)]
pub struct ContainerRunner {
    cli: String,
    default_image: Option<String>,
    extra_args: Vec<String>,
}

impl Default for ContainerRunner {
    fn default() -> Self {
        Self {
            cli: "docker".to_string(),
            default_image: None,
            extra_args: Vec::new(),
        }
    }
}

impl ContainerRunner {
    pub fn new(cli: impl Into<String>) -> Self {
        Self {
            cli: cli.into(),
            ..Self::default()
        }
    }

    /// Image used by stages that do not name one.
    pub fn with_default_image(mut self, image: impl Into<String>) -> Self {
        self.default_image = Some(image.into());
        self
    }

    /// Extra arguments placed after `run` (e.g. `--network=host`).
    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn cli(&self) -> &str {
        &self.cli
    }

    fn image_for<'a>(&'a self, invocation: &'a RunInvocation) -> RunnerResult<&'a str> {
        invocation
            .image
            .as_deref()
            .or(self.default_image.as_deref())
            .ok_or_else(|| RunnerError::InvalidInvocation {
                stage: invocation.stage_id.clone(),
                reason: "no container image configured".to_string(),
            })
    }

    /// Arguments passed to the CLI, excluding the CLI itself.
    pub fn build_args(&self, invocation: &RunInvocation, name: &str) -> RunnerResult<Vec<String>> {
        let image = self.image_for(invocation)?;
        let work = absolute(&invocation.work_dir);
        let out = absolute(&invocation.out_dir);

        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args.push("-w".into());
        args.push(CONTAINER_WORK_DIR.into());
        args.push("-v".into());
        args.push(format!("{}:{}", work.display(), CONTAINER_WORK_DIR));
        args.push("-v".into());
        args.push(format!("{}:{}", out.display(), CONTAINER_OUT_DIR));
        for mount in &invocation.mounts {
            let mut spec = format!(
                "{}:{}",
                absolute(&mount.host_path).display(),
                mount.target.display()
            );
            if mount.read_only {
                spec.push_str(":ro");
            }
            args.push("-v".into());
            args.push(spec);
        }
        for key in container_env(invocation).into_iter().map(|(k, _)| k) {
            args.push("-e".into());
            args.push(key);
        }
        args.push(image.to_string());
        args.push("sh".into());
        args.push("-c".into());
        args.push(invocation.command.clone());
        Ok(args)
    }

    /// Force-remove a container whose client was abandoned. Killing the
    /// client alone leaves the container running.
    async fn remove_container(&self, stage: &str, name: &str) {
        let result = Command::new(&self.cli)
            .args(["rm", "-f", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            Ok(status) if status.success() => debug!(stage = %stage, container = %name, "removed abandoned container"),
            Ok(status) => debug!(stage = %stage, container = %name, status = %status, "container already gone"),
            Err(e) => warn!(stage = %stage, container = %name, error = %e, "failed to remove abandoned container"),
        }
    }
}

/// Variables visible inside the container, with container-side paths.
fn container_env(invocation: &RunInvocation) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = invocation
        .env
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    env.push(("PIPELINE_STAGE".into(), invocation.stage_id.clone()));
    env.push(("PIPELINE_OUT_DIR".into(), CONTAINER_OUT_DIR.into()));
    env.push(("PIPELINE_WORK_DIR".into(), CONTAINER_WORK_DIR.into()));
    for mount in &invocation.mounts {
        env.push((mount.env_var(), mount.target.display().to_string()));
    }
    env
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

#[async_trait]
impl RunnerAdapter for ContainerRunner {
    fn name(&self) -> &str {
        "container"
    }

    async fn run(
        &self,
        invocation: &RunInvocation,
        cancel: &CancellationToken,
    ) -> RunnerResult<RunOutcome> {
        let name = container_name(&invocation.stage_id);
        let args = self.build_args(invocation, &name)?;
        prepare_dirs(invocation)?;
        info!(
            stage = %invocation.stage_id,
            runner = "container",
            cli = %self.cli,
            container = %name,
            "starting stage container"
        );
        debug!(stage = %invocation.stage_id, args = args.len(), "container invocation");

        let mut cmd = Command::new(&self.cli);
        cmd.args(&args);
        for (key, value) in container_env(invocation) {
            cmd.env(key, value);
        }

        let child = match run_child(cmd, &invocation.stage_id, invocation.timeout, cancel).await {
            Ok(child) => child,
            Err(err @ (RunnerError::TimedOut { .. } | RunnerError::Cancelled { .. })) => {
                self.remove_container(&invocation.stage_id, &name).await;
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        if child.exit_code == CLI_START_FAILURE && is_cli_start_failure(&self.cli, &child.stderr) {
            return Err(RunnerError::Unavailable {
                stage: invocation.stage_id.clone(),
                reason: format!("{} could not start the container: {}", self.cli, child.stderr.trim()),
            });
        }
        into_outcome(invocation, child)
    }
}
