//! What a runner is asked to do, and what it hands back.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment mapping injected into a stage.
///
/// Values may carry credentials, so `Debug` prints keys only.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Environment {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

/// A host directory made visible to the stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Logical name; exposed as `PIPELINE_MOUNT_<NAME>`
    pub name: String,
    pub host_path: PathBuf,
    /// Path inside the container (ignored by the process runner)
    pub target: PathBuf,
    pub read_only: bool,
}

impl Mount {
    /// Environment variable under which the mount path is exposed.
    pub fn env_var(&self) -> String {
        mount_env_var(&self.name)
    }
}

/// `PIPELINE_MOUNT_` + name upper-cased with every non-alphanumeric replaced by `_`.
pub fn mount_env_var(name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("PIPELINE_MOUNT_{suffix}")
}

/// A fully rendered request to run one stage attempt.
#[derive(Debug, Clone)]
pub struct RunInvocation {
    pub stage_id: String,
    /// Rendered shell command (run via `sh -c`)
    pub command: String,
    pub env: Environment,
    pub mounts: Vec<Mount>,
    /// Scratch directory the stage writes declared outputs into
    pub out_dir: PathBuf,
    /// Working directory for the command
    pub work_dir: PathBuf,
    /// Declared output names, relative to `out_dir`
    pub outputs: Vec<String>,
    pub timeout: Option<Duration>,
    /// Container image, for runners that use one
    pub image: Option<String>,
}

impl RunInvocation {
    pub fn new(stage_id: impl Into<String>, command: impl Into<String>) -> Self {
        let stage_id = stage_id.into();
        let scratch = std::env::temp_dir().join("pipeline").join(&stage_id);
        Self {
            command: command.into(),
            env: Environment::new(),
            mounts: Vec::new(),
            out_dir: scratch.join("out"),
            work_dir: PathBuf::from("."),
            outputs: Vec::new(),
            timeout: None,
            image: None,
            stage_id,
        }
    }
}

/// Captured result of one invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// Declared outputs as a tar archive, or stdout when none are declared
    pub artifact: Vec<u8>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// Declared outputs the command did not produce
    pub missing_outputs: Vec<String>,
}

impl RunOutcome {
    /// Whether the stage passed (exit code 0 and every declared output present).
    pub fn passed(&self) -> bool {
        self.exit_code == 0 && self.missing_outputs.is_empty()
    }

    /// stdout followed by stderr, as shown to users.
    pub fn combined_output(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        if !self.missing_outputs.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&format!(
                "missing declared outputs: {}\n",
                self.missing_outputs.join(", ")
            ));
        }
        out
    }
}
