//! Runner configuration: executor selection, resource ceilings, retry
//! policy.
//!
//! Consumed by the scheduler and executors only; stage commands never see
//! it.

use crate::errors::{LabflowError, ManifestError, ResourceError};
use crate::manifest::{parse_size_mb, PipelineManifest};
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which backend runs stage commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Run as a local child process.
    #[default]
    Local,
    /// Submit through Slurm (`sbatch --wait`).
    Slurm,
}

/// Upper bounds on concurrently admitted resources.
///
/// Absent fields are unbounded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceCeiling {
    /// Total CPU cores admitted at once.
    #[serde(default)]
    pub cpus: Option<u32>,
    /// Total memory admitted at once, e.g. `32 GB`.
    #[serde(default)]
    pub memory: Option<String>,
    /// Total GPU slots admitted at once.
    #[serde(default)]
    pub gpus: Option<u32>,
}

impl ResourceCeiling {
    /// The memory ceiling in megabytes, if bounded.
    pub fn memory_mb(&self) -> Result<Option<u64>, LabflowError> {
        self.memory
            .as_deref()
            .map(parse_size_mb)
            .transpose()
            .map_err(LabflowError::Validation)
    }
}

/// Executor and scheduling settings for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Backend that runs stage commands.
    pub executor: ExecutorKind,
    /// Cluster queue/partition for the Slurm executor.
    pub queue: Option<String>,
    /// Container runtime binary (`docker`, `podman`).
    pub container_runtime: String,
    /// Maximum stages in flight at once.
    pub max_parallel: usize,
    /// Resource ceilings for admission control.
    pub ceiling: ResourceCeiling,
    /// Retry policy for acquisition failures.
    pub retry: RetryConfig,
    /// Artifact store root; defaults to `.labflow` under the work
    /// directory when absent.
    pub store_root: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorKind::Local,
            queue: None,
            container_runtime: "docker".to_string(),
            max_parallel: default_parallelism(),
            ceiling: ResourceCeiling::default(),
            retry: RetryConfig::default(),
            store_root: None,
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
}

impl RunnerConfig {
    /// Loads a config from a YAML file.
    pub fn load(path: &Path) -> Result<Self, LabflowError> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            ManifestError::new(path.display().to_string(), format!("read failed: {err}"))
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|err| {
            ManifestError::new(path.display().to_string(), format!("parse failed: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Internal consistency checks.
    pub fn validate(&self) -> Result<(), LabflowError> {
        if self.max_parallel == 0 {
            return Err(crate::errors::ValidationError::new(
                "max_parallel must be at least 1",
            )
            .into());
        }
        self.ceiling.memory_mb().map(|_| ())
    }

    /// Rejects stages whose requests exceed the ceiling, so they could
    /// never be admitted.
    pub fn check_admissible(&self, manifest: &PipelineManifest) -> Result<(), LabflowError> {
        let memory_ceiling = self.ceiling.memory_mb()?;
        for stage in &manifest.stages {
            if let Some(ceiling) = self.ceiling.cpus {
                if stage.resources.cpus > ceiling {
                    return Err(ResourceError::new(
                        stage.name.clone(),
                        "cpus",
                        u64::from(stage.resources.cpus),
                        u64::from(ceiling),
                    )
                    .into());
                }
            }
            if let Some(ceiling) = memory_ceiling {
                let requested = stage
                    .resources
                    .memory_mb()
                    .map_err(LabflowError::Validation)?;
                if requested > ceiling {
                    return Err(ResourceError::new(
                        stage.name.clone(),
                        "memory (MB)",
                        requested,
                        ceiling,
                    )
                    .into());
                }
            }
            if let Some(ceiling) = self.ceiling.gpus {
                if stage.resources.gpus > ceiling {
                    return Err(ResourceError::new(
                        stage.name.clone(),
                        "gpus",
                        u64::from(stage.resources.gpus),
                        u64::from(ceiling),
                    )
                    .into());
                }
            }
        }
        Ok(())
    }

    /// The store root for a given work directory.
    #[must_use]
    pub fn store_root_for(&self, workdir: &Path) -> PathBuf {
        self.store_root
            .clone()
            .unwrap_or_else(|| workdir.join(".labflow"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ResourceSpec, StageDecl};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.executor, ExecutorKind::Local);
        assert_eq!(config.container_runtime, "docker");
        assert!(config.max_parallel >= 1);
        assert!(config.ceiling.cpus.is_none());
    }

    #[test]
    fn test_load_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labflow.yaml");
        std::fs::write(
            &path,
            "executor: slurm\nqueue: gpu-long\nmax_parallel: 2\nceiling:\n  cpus: 16\n  memory: 64 GB\n  gpus: 2\n",
        )
        .unwrap();

        let config = RunnerConfig::load(&path).unwrap();
        assert_eq!(config.executor, ExecutorKind::Slurm);
        assert_eq!(config.queue.as_deref(), Some("gpu-long"));
        assert_eq!(config.max_parallel, 2);
        assert_eq!(config.ceiling.memory_mb().unwrap(), Some(64 * 1024));
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let config = RunnerConfig {
            max_parallel: 0,
            ..RunnerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_request_rejected() {
        let manifest = PipelineManifest {
            name: "test".to_string(),
            params: Vec::new(),
            stages: vec![StageDecl::new("big", "true").with_resources(ResourceSpec {
                cpus: 32,
                ..ResourceSpec::default()
            })],
        };
        let config = RunnerConfig {
            ceiling: ResourceCeiling {
                cpus: Some(8),
                ..ResourceCeiling::default()
            },
            ..RunnerConfig::default()
        };

        let err = config.check_admissible(&manifest).unwrap_err();
        assert!(matches!(err, LabflowError::Resource(_)));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_admissible_within_ceiling() {
        let manifest = PipelineManifest {
            name: "test".to_string(),
            params: Vec::new(),
            stages: vec![StageDecl::new("small", "true")],
        };
        let config = RunnerConfig {
            ceiling: ResourceCeiling {
                cpus: Some(8),
                memory: Some("4 GB".to_string()),
                gpus: Some(0),
            },
            ..RunnerConfig::default()
        };
        config.check_admissible(&manifest).unwrap();
    }

    #[test]
    fn test_store_root_default() {
        let config = RunnerConfig::default();
        let root = config.store_root_for(Path::new("/tmp/work"));
        assert_eq!(root, PathBuf::from("/tmp/work/.labflow"));
    }
}
