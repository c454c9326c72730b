//! Loading and structural validation of pipeline manifests.

use crate::errors::{LabflowError, ManifestError, ValidationError};
use crate::manifest::stage::StageDecl;
use crate::params::ParamDecl;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

/// The file name looked up when a pipeline reference is a directory.
pub const MANIFEST_FILE: &str = "pipeline.yaml";

/// A declarative pipeline: named parameters plus a set of stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineManifest {
    /// Pipeline name.
    pub name: String,
    /// Declared parameters with defaults.
    #[serde(default)]
    pub params: Vec<ParamDecl>,
    /// Stage declarations.
    pub stages: Vec<StageDecl>,
}

impl PipelineManifest {
    /// Loads a manifest from a YAML file, or from `pipeline.yaml` inside a
    /// directory.
    pub fn load(path: &Path) -> Result<Self, LabflowError> {
        let file = if path.is_dir() {
            path.join(MANIFEST_FILE)
        } else {
            path.to_path_buf()
        };

        let content = std::fs::read_to_string(&file).map_err(|err| {
            ManifestError::new(file.display().to_string(), format!("read failed: {err}"))
        })?;
        let manifest: Self = serde_yaml::from_str(&content).map_err(|err| {
            ManifestError::new(file.display().to_string(), format!("parse failed: {err}"))
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageDecl> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Stage names in declaration order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }

    /// Maps every output path to its producing stage.
    ///
    /// Duplicate producers for one path have already been rejected by
    /// [`PipelineManifest::validate`].
    #[must_use]
    pub fn producers(&self) -> BTreeMap<String, String> {
        let mut producers = BTreeMap::new();
        for stage in &self.stages {
            for path in stage.outputs.values() {
                producers.insert(path.clone(), stage.name.clone());
            }
        }
        producers
    }

    /// Structural validation: fails fast before any stage runs.
    pub fn validate(&self) -> Result<(), LabflowError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::new("pipeline name cannot be empty").into());
        }
        if self.stages.is_empty() {
            return Err(ValidationError::new(format!(
                "pipeline '{}' declares no stages",
                self.name
            ))
            .into());
        }

        let mut param_names = HashSet::new();
        for decl in &self.params {
            if !ident_regex().is_match(&decl.name) {
                return Err(ValidationError::new(format!(
                    "parameter name '{}' is not a valid identifier",
                    decl.name
                ))
                .into());
            }
            if !param_names.insert(decl.name.clone()) {
                return Err(ValidationError::new(format!(
                    "parameter '{}' is declared twice",
                    decl.name
                ))
                .into());
            }
        }

        let mut stage_names = HashSet::new();
        let mut output_owners: BTreeMap<&str, &str> = BTreeMap::new();
        for stage in &self.stages {
            stage.validate()?;
            if !stage_names.insert(stage.name.clone()) {
                return Err(ValidationError::new(format!(
                    "stage '{}' is declared twice",
                    stage.name
                ))
                .with_stages(vec![stage.name.clone()])
                .into());
            }
            for path in stage.outputs.values() {
                if let Some(owner) = output_owners.insert(path, &stage.name) {
                    return Err(ValidationError::new(format!(
                        "output '{path}' is produced by both '{owner}' and '{}'",
                        stage.name
                    ))
                    .with_stages(vec![owner.to_string(), stage.name.clone()])
                    .into());
                }
            }
            self.check_placeholders(stage)?;
        }

        Ok(())
    }

    /// Every placeholder in a stage command must resolve against the
    /// declared parameters and the stage's own aliases.
    fn check_placeholders(&self, stage: &StageDecl) -> Result<(), LabflowError> {
        let placeholder = placeholder_regex();
        for caps in placeholder.captures_iter(&stage.command) {
            let kind = &caps[1];
            let key = &caps[2];
            let known = match kind {
                "params" => self.params.iter().any(|p| p.name == key),
                "inputs" => stage.inputs.contains_key(key),
                "outputs" => stage.outputs.contains_key(key),
                _ => false,
            };
            if !known {
                return Err(ValidationError::new(format!(
                    "stage '{}' references undeclared {kind} entry '{key}'",
                    stage.name
                ))
                .with_stages(vec![stage.name.clone()])
                .into());
            }
        }
        Ok(())
    }
}

fn ident_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").unwrap_or_else(|_| unreachable!("static pattern"))
    })
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(crate::manifest::TEMPLATE_PLACEHOLDER)
            .unwrap_or_else(|_| unreachable!("static pattern"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamValue;
    use pretty_assertions::assert_eq;

    const EXAMPLE: &str = r#"
name: brain-decoding
params:
  - name: training_steps
    default: 250
    description: Fine-tuning steps per run
  - name: subject
    default: M02
stages:
  - name: finetune
    command: "run_train --steps {params.training_steps} --out {outputs.ckpt}"
    outputs:
      ckpt: model/checkpoint.bin
    resources:
      cpus: 4
      memory: 8 GB
      gpus: 1
    container: example/train:1.0
  - name: extract
    command: "extract --ckpt {inputs.ckpt} --out {outputs.reps}"
    inputs:
      ckpt: model/checkpoint.bin
    outputs:
      reps: representations/reps.npy
"#;

    #[test]
    fn test_parse_and_validate_example() {
        let manifest: PipelineManifest = serde_yaml::from_str(EXAMPLE).unwrap();
        manifest.validate().unwrap();

        assert_eq!(manifest.name, "brain-decoding");
        assert_eq!(manifest.params.len(), 2);
        assert_eq!(manifest.params[0].default, ParamValue::Int(250));
        assert_eq!(manifest.stage_names(), vec!["finetune", "extract"]);

        let producers = manifest.producers();
        assert_eq!(
            producers.get("model/checkpoint.bin"),
            Some(&"finetune".to_string())
        );
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let mut manifest: PipelineManifest = serde_yaml::from_str(EXAMPLE).unwrap();
        let duplicate = manifest.stages[0].clone();
        manifest.stages.push(duplicate);

        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn test_duplicate_output_rejected() {
        let mut manifest: PipelineManifest = serde_yaml::from_str(EXAMPLE).unwrap();
        manifest.stages[1]
            .outputs
            .insert("extra".to_string(), "model/checkpoint.bin".to_string());

        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("produced by both"));
    }

    #[test]
    fn test_undeclared_placeholder_rejected() {
        let mut manifest: PipelineManifest = serde_yaml::from_str(EXAMPLE).unwrap();
        manifest.stages[0].command = "run_train --steps {params.steps}".to_string();

        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("undeclared params entry 'steps'"));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let manifest = PipelineManifest {
            name: "empty".to_string(),
            params: Vec::new(),
            stages: Vec::new(),
        };
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), EXAMPLE).unwrap();

        let manifest = PipelineManifest::load(dir.path()).unwrap();
        assert_eq!(manifest.name, "brain-decoding");
    }

    #[test]
    fn test_load_malformed_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "stages: [").unwrap();

        let err = PipelineManifest::load(&path).unwrap_err();
        assert!(matches!(err, LabflowError::Manifest(_)));
    }
}
