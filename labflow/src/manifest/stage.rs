//! Stage declarations and command templates.

use crate::errors::ValidationError;
use crate::manifest::ResourceSpec;
use crate::params::ResolvedParams;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Placeholder syntax accepted in command templates:
/// `{params.name}`, `{inputs.alias}`, `{outputs.alias}`.
pub const TEMPLATE_PLACEHOLDER: &str = r"\{(params|inputs|outputs)\.([A-Za-z0-9_]+)\}";

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(TEMPLATE_PLACEHOLDER).unwrap_or_else(|_| unreachable!("static pattern"))
    })
}

/// Returns true when a path input is a glob pattern rather than a single
/// file.
#[must_use]
pub fn is_glob_pattern(path: &str) -> bool {
    path.contains(['*', '?', '['])
}

/// Expands a pre-supplied glob input against the work directory.
///
/// Matches are returned as sorted work-directory-relative paths; only
/// files match.
pub fn expand_pattern(
    workdir: &std::path::Path,
    pattern: &str,
) -> Result<Vec<String>, ValidationError> {
    let absolute = workdir.join(pattern);
    let entries = glob::glob(&absolute.to_string_lossy())
        .map_err(|err| ValidationError::new(format!("invalid glob pattern '{pattern}': {err}")))?;

    let mut matches = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|err| ValidationError::new(format!("glob '{pattern}' failed: {err}")))?;
        if path.is_file() {
            let relative = path
                .strip_prefix(workdir)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            matches.push(relative);
        }
    }
    matches.sort();
    Ok(matches)
}

/// Where a declared input comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// A path relative to the work directory, possibly produced by an
    /// upstream stage.
    Path(String),
    /// A remote artifact retrieved before the stage runs.
    Url(String),
}

impl InputSource {
    /// Classifies a raw manifest input value.
    #[must_use]
    pub fn classify(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Self::Url(raw.to_string())
        } else {
            Self::Path(raw.to_string())
        }
    }

    /// Returns true for remote inputs.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Url(_))
    }

    /// The raw manifest value.
    #[must_use]
    pub fn raw(&self) -> &str {
        match self {
            Self::Path(s) | Self::Url(s) => s,
        }
    }
}

/// A named unit of work: command template, declared inputs and outputs,
/// resource profile, and container image reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDecl {
    /// Unique stage name.
    pub name: String,
    /// Command template with `{params.*}`, `{inputs.*}`, `{outputs.*}`
    /// placeholders. Runs via `sh -c` in the stage's working directory.
    pub command: String,
    /// Declared inputs: alias to work-directory path or URL.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// Declared outputs: alias to path relative to the stage directory.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    /// Resource profile.
    #[serde(default)]
    pub resources: ResourceSpec,
    /// Container image reference; absent means run on the host.
    #[serde(default)]
    pub container: Option<String>,
    /// Per-stage override of the acquisition retry budget.
    #[serde(default)]
    pub retries: Option<u32>,
}

impl StageDecl {
    /// Creates a minimal declaration (used by tests and fixtures).
    #[must_use]
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            resources: ResourceSpec::default(),
            container: None,
            retries: None,
        }
    }

    /// Adds an input binding.
    #[must_use]
    pub fn with_input(mut self, alias: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(alias.into(), value.into());
        self
    }

    /// Adds an output binding.
    #[must_use]
    pub fn with_output(mut self, alias: impl Into<String>, path: impl Into<String>) -> Self {
        self.outputs.insert(alias.into(), path.into());
        self
    }

    /// Sets the container image.
    #[must_use]
    pub fn with_container(mut self, image: impl Into<String>) -> Self {
        self.container = Some(image.into());
        self
    }

    /// Sets the resource profile.
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceSpec) -> Self {
        self.resources = resources;
        self
    }

    /// Classified input sources, alias order.
    #[must_use]
    pub fn input_sources(&self) -> BTreeMap<String, InputSource> {
        self.inputs
            .iter()
            .map(|(alias, raw)| (alias.clone(), InputSource::classify(raw)))
            .collect()
    }

    /// The parameter names this stage's command references.
    ///
    /// Only these participate in the stage's fingerprint, so overriding an
    /// unrelated parameter does not invalidate this stage's cache entry.
    #[must_use]
    pub fn referenced_params(&self) -> Vec<String> {
        let mut names: Vec<String> = placeholder_regex()
            .captures_iter(&self.command)
            .filter(|caps| &caps[1] == "params")
            .map(|caps| caps[2].to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Renders the command template against resolved parameters and the
    /// stage's input/output aliases.
    ///
    /// Input aliases resolve to the paths their files are staged at inside
    /// the stage directory; output aliases resolve to the declared
    /// relative paths.
    ///
    /// # Errors
    ///
    /// Any placeholder that does not resolve is a validation error.
    pub fn render_command(
        &self,
        params: &ResolvedParams,
        staged_inputs: &BTreeMap<String, String>,
    ) -> Result<String, ValidationError> {
        let mut unresolved = Vec::new();
        let rendered = placeholder_regex().replace_all(&self.command, |caps: &regex::Captures<'_>| {
            let kind = &caps[1];
            let key = &caps[2];
            let substitution = match kind {
                "params" => params.get(key).map(|v| v.render()),
                "inputs" => staged_inputs.get(key).cloned(),
                "outputs" => self.outputs.get(key).cloned(),
                _ => None,
            };
            match substitution {
                Some(value) => value,
                None => {
                    unresolved.push(format!("{{{kind}.{key}}}"));
                    String::new()
                }
            }
        });

        if unresolved.is_empty() {
            Ok(rendered.into_owned())
        } else {
            Err(ValidationError::new(format!(
                "stage '{}' command references unresolved placeholders: {}",
                self.name,
                unresolved.join(", ")
            ))
            .with_stages(vec![self.name.clone()]))
        }
    }

    /// Structural validation for a single stage.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::new("stage name cannot be empty"));
        }
        if self.command.trim().is_empty() {
            return Err(ValidationError::new(format!(
                "stage '{}' has an empty command",
                self.name
            ))
            .with_stages(vec![self.name.clone()]));
        }
        for (alias, path) in &self.outputs {
            if path.trim().is_empty() {
                return Err(ValidationError::new(format!(
                    "stage '{}' output '{alias}' has an empty path",
                    self.name
                ))
                .with_stages(vec![self.name.clone()]));
            }
            if std::path::Path::new(path).is_absolute() {
                return Err(ValidationError::new(format!(
                    "stage '{}' output '{alias}' must be a relative path",
                    self.name
                ))
                .with_stages(vec![self.name.clone()]));
            }
        }
        // A stage consuming its own output would deadlock the graph.
        for (alias, input) in &self.inputs {
            if self.outputs.values().any(|out| out == input) {
                return Err(ValidationError::new(format!(
                    "stage '{}' input '{alias}' matches one of its own outputs",
                    self.name
                ))
                .with_stages(vec![self.name.clone()]));
            }
        }
        self.resources.validate(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{resolve_params, ParamDecl, ParamValue};
    use pretty_assertions::assert_eq;

    fn params() -> ResolvedParams {
        resolve_params(
            &[
                ParamDecl::new("training_steps", ParamValue::Int(250)),
                ParamDecl::new("seed", ParamValue::Int(7)),
            ],
            &BTreeMap::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_referenced_params_deduplicated() {
        let stage = StageDecl::new(
            "finetune",
            "train --steps {params.training_steps} --ckpt-every {params.training_steps} --seed {params.seed}",
        );
        assert_eq!(stage.referenced_params(), vec!["seed", "training_steps"]);
    }

    #[test]
    fn test_render_command() {
        let stage = StageDecl::new(
            "finetune",
            "train --steps {params.training_steps} --in {inputs.corpus} --out {outputs.ckpt}",
        )
        .with_input("corpus", "data/corpus.txt")
        .with_output("ckpt", "model/checkpoint.bin");

        let mut staged = BTreeMap::new();
        staged.insert("corpus".to_string(), "corpus.txt".to_string());

        let rendered = stage.render_command(&params(), &staged).unwrap();
        assert_eq!(
            rendered,
            "train --steps 250 --in corpus.txt --out model/checkpoint.bin"
        );
    }

    #[test]
    fn test_render_command_unresolved_placeholder() {
        let stage = StageDecl::new("finetune", "train --steps {params.nope}");
        let err = stage.render_command(&params(), &BTreeMap::new()).unwrap_err();
        assert!(err.message.contains("{params.nope}"));
    }

    #[test]
    fn test_input_source_classification() {
        assert!(InputSource::classify("https://example.org/x.npy").is_remote());
        assert!(!InputSource::classify("data/stimuli.txt").is_remote());
    }

    #[test]
    fn test_validate_rejects_absolute_output() {
        let stage = StageDecl::new("s", "true").with_output("out", "/etc/passwd");
        assert!(stage.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_self_consumption() {
        let stage = StageDecl::new("s", "true")
            .with_input("x", "a/b.txt")
            .with_output("y", "a/b.txt");
        assert!(stage.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let stage = StageDecl::new("s", "   ");
        assert!(stage.validate().is_err());
    }

    #[test]
    fn test_is_glob_pattern() {
        assert!(is_glob_pattern("data/*.txt"));
        assert!(is_glob_pattern("subjects/M0?.mat"));
        assert!(!is_glob_pattern("data/stimuli.txt"));
    }

    #[test]
    fn test_expand_pattern_sorted_relative() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("data/a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("data/ignored.csv"), "c").unwrap();

        let matches = expand_pattern(dir.path(), "data/*.txt").unwrap();
        assert_eq!(matches, vec!["data/a.txt", "data/b.txt"]);
    }

    #[test]
    fn test_expand_pattern_no_matches() {
        let dir = tempfile::tempdir().unwrap();
        let matches = expand_pattern(dir.path(), "data/*.txt").unwrap();
        assert!(matches.is_empty());
    }
}
