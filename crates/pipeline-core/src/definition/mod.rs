//! Stage definitions: the declarative document and its validated graph.
//!
//! A pipeline is a list of `[[stage]]` tables (TOML), a `stage:` sequence
//! (YAML) or a `"stage"` array (JSON). Unknown keys are rejected so typos
//! surface at load time instead of silently changing behaviour.

pub mod error;
pub mod graph;
pub mod template;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use error::{DefinitionError, DefinitionResult};
pub use graph::StageGraph;

/// Prefix marking an environment-variable input (`env:URI`).
pub const ENV_INPUT_PREFIX: &str = "env:";

/// One unit of pipeline work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Stage {
    pub id: String,

    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Shell command template
    pub command: String,

    /// Paths (relative to the definition file) and `env:KEY` entries that
    /// feed the fingerprint
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Files or directories the command writes under `{{out_dir}}`
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Extra attempts after a transient failure
    #[serde(default)]
    pub retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    #[serde(default)]
    pub retry_on_timeout: bool,

    /// Literal environment values; part of the fingerprint
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Names of variables forwarded from the caller's environment as-is.
    /// Never fingerprinted and never logged.
    #[serde(default)]
    pub passthrough_env: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Working directory, relative to the definition file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A parsed `inputs` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageInput<'a> {
    Path(&'a str),
    Env(&'a str),
}

impl Stage {
    /// Minimal stage with the given id and command.
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            command: command.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            retries: 0,
            timeout_seconds: None,
            retry_on_timeout: false,
            env: BTreeMap::new(),
            passthrough_env: Vec::new(),
            image: None,
            workdir: None,
            description: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn parsed_inputs(&self) -> impl Iterator<Item = StageInput<'_>> {
        self.inputs.iter().map(|raw| match raw.strip_prefix(ENV_INPUT_PREFIX) {
            Some(key) => StageInput::Env(key),
            None => StageInput::Path(raw.as_str()),
        })
    }

    /// Declared outputs produce a tar archive; otherwise the artifact is stdout.
    pub fn archives_outputs(&self) -> bool {
        !self.outputs.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineDocument {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "stage", alias = "stages")]
    stages: Vec<Stage>,
}

/// Serialization format of a definition document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Toml,
    Yaml,
    Json,
}

impl DocumentFormat {
    /// Select the format from the file extension.
    pub fn from_path(path: &Path) -> DefinitionResult<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match extension.as_str() {
            "toml" => Ok(DocumentFormat::Toml),
            "yaml" | "yml" => Ok(DocumentFormat::Yaml),
            "json" => Ok(DocumentFormat::Json),
            _ => Err(DefinitionError::UnsupportedFormat { extension }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Toml => "TOML",
            DocumentFormat::Yaml => "YAML",
            DocumentFormat::Json => "JSON",
        }
    }
}

fn parse_document(text: &str, format: DocumentFormat) -> DefinitionResult<PipelineDocument> {
    let parse_err = |message: String| DefinitionError::Parse {
        format: format.as_str(),
        message,
    };
    match format {
        DocumentFormat::Toml => toml::from_str(text).map_err(|e| parse_err(e.to_string())),
        DocumentFormat::Yaml => serde_yaml::from_str(text).map_err(|e| parse_err(e.to_string())),
        DocumentFormat::Json => serde_json::from_str(text).map_err(|e| parse_err(e.to_string())),
    }
}

/// Load and validate the definition at `path`.
///
/// Relative input paths and work directories resolve against the file's
/// directory. Loading is all-or-nothing.
pub fn load(path: impl AsRef<Path>) -> DefinitionResult<StageGraph> {
    let path = path.as_ref();
    let format = DocumentFormat::from_path(path)?;
    let text = std::fs::read_to_string(path).map_err(|source| DefinitionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    from_str(&text, format, base_dir)
}

/// Parse and validate a definition held in memory.
pub fn from_str(
    text: &str,
    format: DocumentFormat,
    base_dir: impl Into<PathBuf>,
) -> DefinitionResult<StageGraph> {
    let document = parse_document(text, format)?;
    StageGraph::new(document.name, document.stages, base_dir.into())
}
