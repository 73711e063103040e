//! Command template placeholders.
//!
//! Supported: `{{stage}}`, `{{fingerprint}}`, `{{out_dir}}`, `{{work_dir}}`
//! and `{{upstream.<id>}}`. Location placeholders render to environment
//! variable references (`${PIPELINE_OUT_DIR}` and friends) that every runner
//! exports, so a rendered command is valid on the host and inside a
//! container alike.

use std::sync::OnceLock;

use pipeline_runner::invocation::mount_env_var;
use regex::Regex;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("placeholder regex is valid"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    Stage,
    Fingerprint,
    OutDir,
    WorkDir,
    Upstream(String),
}

impl Placeholder {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "stage" => Some(Placeholder::Stage),
            "fingerprint" => Some(Placeholder::Fingerprint),
            "out_dir" => Some(Placeholder::OutDir),
            "work_dir" => Some(Placeholder::WorkDir),
            other => other
                .strip_prefix("upstream.")
                .filter(|id| !id.is_empty())
                .map(|id| Placeholder::Upstream(id.to_string())),
        }
    }
}

/// Every placeholder in `template`, in order of appearance.
///
/// Returns the raw token of the first unknown placeholder as the error.
pub fn placeholders(template: &str) -> Result<Vec<Placeholder>, String> {
    placeholder_re()
        .captures_iter(template)
        .map(|caps| {
            let token = caps.get(1).map_or("", |m| m.as_str());
            Placeholder::parse(token).ok_or_else(|| token.to_string())
        })
        .collect()
}

/// Substitute placeholders. Unknown tokens are left as-is; they are
/// rejected when the graph is loaded.
pub fn render(template: &str, stage: &str, fingerprint: &str) -> String {
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let token = caps.get(1).map_or("", |m| m.as_str());
            match Placeholder::parse(token) {
                Some(Placeholder::Stage) => stage.to_string(),
                Some(Placeholder::Fingerprint) => fingerprint.to_string(),
                Some(Placeholder::OutDir) => "${PIPELINE_OUT_DIR}".to_string(),
                Some(Placeholder::WorkDir) => "${PIPELINE_WORK_DIR}".to_string(),
                Some(Placeholder::Upstream(id)) => format!("${{{}}}", mount_env_var(&id)),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
