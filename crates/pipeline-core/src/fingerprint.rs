//! Stage fingerprints: what a stage's effective inputs hash to.
//!
//! The canonical encoding is a sequence of tagged, length-prefixed fields
//! fed to SHA-256. Field order is fixed; maps and directory listings are
//! sorted, so the same inputs always produce the same fingerprint. Upstream
//! fingerprints are folded in, which makes a change ripple to every
//! downstream stage.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::definition::{Stage, StageInput};

/// Bumped whenever the encoding below changes.
pub const FINGERPRINT_VERSION: &str = "pipeline-fingerprint/v1";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Full 64-character lower-case hex form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 12-character prefix used in logs.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("not a fingerprint: {s:?}"));
        }
        Ok(Fingerprint(s.to_ascii_lowercase()))
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

struct Encoder {
    hasher: Sha256,
}

impl Encoder {
    fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    fn field(&mut self, tag: &str, value: &[u8]) {
        self.hasher.update(tag.as_bytes());
        self.hasher.update([0u8]);
        self.hasher.update((value.len() as u64).to_be_bytes());
        self.hasher.update(value);
    }

    fn file(&mut self, rel: &str, path: &Path) -> io::Result<()> {
        let len = path.metadata()?.len();
        self.field("file", rel.as_bytes());
        self.hasher.update(len.to_be_bytes());
        let mut file = File::open(path)?;
        let copied = io::copy(&mut file, &mut self.hasher)?;
        if copied != len {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} changed while being fingerprinted", path.display()),
            ));
        }
        Ok(())
    }

    fn path(&mut self, rel: &str, path: &Path) -> io::Result<()> {
        if path.is_file() {
            self.file(rel, path)
        } else if path.is_dir() {
            self.field("dir", rel.as_bytes());
            let mut names: Vec<String> = std::fs::read_dir(path)?
                .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
                .collect::<io::Result<_>>()?;
            names.sort();
            for name in names {
                self.path(&format!("{rel}/{name}"), &path.join(&name))?;
            }
            Ok(())
        } else {
            self.field("missing", rel.as_bytes());
            Ok(())
        }
    }

    fn finish(self) -> Fingerprint {
        Fingerprint(hex::encode(self.hasher.finalize()))
    }
}

/// Fingerprint `stage`, reading inputs relative to `base_dir` and `env:`
/// inputs from the process environment.
pub fn compute(
    stage: &Stage,
    base_dir: &Path,
    upstream: &BTreeMap<String, Fingerprint>,
) -> io::Result<Fingerprint> {
    compute_with_env(stage, base_dir, upstream, |key| std::env::var(key).ok())
}

/// [`compute`] with an explicit environment lookup.
pub fn compute_with_env<F>(
    stage: &Stage,
    base_dir: &Path,
    upstream: &BTreeMap<String, Fingerprint>,
    env: F,
) -> io::Result<Fingerprint>
where
    F: Fn(&str) -> Option<String>,
{
    let mut enc = Encoder::new();
    enc.field("version", FINGERPRINT_VERSION.as_bytes());
    enc.field("stage", stage.id.as_bytes());
    enc.field("command", stage.command.as_bytes());

    let mut outputs: Vec<&String> = stage.outputs.iter().collect();
    outputs.sort();
    for output in outputs {
        enc.field("output", output.as_bytes());
    }

    for (key, value) in &stage.env {
        enc.field("env.key", key.as_bytes());
        enc.field("env.value", value.as_bytes());
    }

    for input in stage.parsed_inputs() {
        match input {
            StageInput::Path(rel) => {
                let rel = rel.trim_end_matches('/');
                enc.path(rel, &base_dir.join(rel))?;
            }
            StageInput::Env(key) => {
                enc.field("input.env", key.as_bytes());
                match env(key) {
                    Some(value) => enc.field("set", value.as_bytes()),
                    None => enc.field("unset", b""),
                }
            }
        }
    }

    for (id, fp) in upstream {
        enc.field("upstream", id.as_bytes());
        enc.field("upstream.fingerprint", fp.as_str().as_bytes());
    }

    Ok(enc.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn none(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_fingerprint_shape() {
        let dir = tempfile::tempdir().unwrap();
        let fp = compute_with_env(&Stage::new("lock", "true"), dir.path(), &BTreeMap::new(), none)
            .unwrap();
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(fp.short().len(), 12);
    }

    #[test]
    fn test_file_contents_change_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.in"), "requests==2.31").unwrap();
        let stage = Stage::new("lock", "pip-compile").inputs(["requirements.in"]);

        let before = compute_with_env(&stage, dir.path(), &BTreeMap::new(), none).unwrap();
        let again = compute_with_env(&stage, dir.path(), &BTreeMap::new(), none).unwrap();
        assert_eq!(before, again);

        std::fs::write(dir.path().join("requirements.in"), "requests==2.32").unwrap();
        let after = compute_with_env(&stage, dir.path(), &BTreeMap::new(), none).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_missing_input_differs_from_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let stage = Stage::new("build", "make").inputs(["src"]);
        let missing = compute_with_env(&stage, dir.path(), &BTreeMap::new(), none).unwrap();

        std::fs::write(dir.path().join("src"), "").unwrap();
        let empty = compute_with_env(&stage, dir.path(), &BTreeMap::new(), none).unwrap();
        assert_ne!(missing, empty);
    }

    #[test]
    fn test_directory_inputs_are_recursive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/pkg")).unwrap();
        std::fs::write(dir.path().join("src/pkg/handler.py"), "def handler(): pass").unwrap();
        let stage = Stage::new("build", "make").inputs(["src"]);

        let before = compute_with_env(&stage, dir.path(), &BTreeMap::new(), none).unwrap();
        std::fs::write(dir.path().join("src/pkg/handler.py"), "def handler(): return 1").unwrap();
        let after = compute_with_env(&stage, dir.path(), &BTreeMap::new(), none).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_env_inputs_and_unset_marker() {
        let dir = tempfile::tempdir().unwrap();
        let stage = Stage::new("test", "curl $URI").inputs(["env:URI"]);

        let unset = compute_with_env(&stage, dir.path(), &BTreeMap::new(), none).unwrap();
        let empty =
            compute_with_env(&stage, dir.path(), &BTreeMap::new(), |_| Some(String::new())).unwrap();
        let set = compute_with_env(&stage, dir.path(), &BTreeMap::new(), |_| {
            Some("https://example.com/data.json".into())
        })
        .unwrap();
        assert_ne!(unset, empty);
        assert_ne!(empty, set);
    }

    #[test]
    fn test_passthrough_env_is_not_fingerprinted() {
        let dir = tempfile::tempdir().unwrap();
        let mut stage = Stage::new("deploy", "aws lambda update-function-code");
        let base = compute_with_env(&stage, dir.path(), &BTreeMap::new(), none).unwrap();
        stage.passthrough_env = vec!["AWS_SECRET_ACCESS_KEY".into()];
        let with_secret = compute_with_env(&stage, dir.path(), &BTreeMap::new(), |_| {
            Some("hunter2".into())
        })
        .unwrap();
        assert_eq!(base, with_secret);
    }

    #[test]
    fn test_upstream_fingerprint_chains() {
        let dir = tempfile::tempdir().unwrap();
        let stage = Stage::new("package", "zip").depends_on(["build"]);
        let mut upstream = BTreeMap::new();
        upstream.insert("build".to_string(), Fingerprint("a".repeat(64)));
        let first = compute_with_env(&stage, dir.path(), &upstream, none).unwrap();
        upstream.insert("build".to_string(), Fingerprint("b".repeat(64)));
        let second = compute_with_env(&stage, dir.path(), &upstream, none).unwrap();
        assert_ne!(first, second);
    }
}
