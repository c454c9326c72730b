//! Error types for the labflow runner.
//!
//! Configuration errors (unknown parameter, missing producer, cycle,
//! malformed manifest) are raised before any stage runs. Acquisition errors
//! are retryable; environment errors abort the whole run.

use std::collections::BTreeMap;
use thiserror::Error;

/// The main error type for labflow operations.
#[derive(Debug, Error)]
pub enum LabflowError {
    /// A manifest could not be loaded or is malformed.
    #[error("{0}")]
    Manifest(#[from] ManifestError),

    /// Pipeline validation failed before execution.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// An override referenced a parameter the pipeline does not declare.
    #[error("{0}")]
    UnknownParameter(#[from] UnknownParameterError),

    /// A stage input has no producing stage and is not pre-supplied.
    #[error("{0}")]
    MissingProducer(#[from] MissingProducerError),

    /// The stage graph contains a dependency cycle.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A stage requested more of a resource than the configured ceiling.
    #[error("{0}")]
    Resource(#[from] ResourceError),

    /// A contained command exited with a non-zero status.
    #[error("stage '{stage}' failed: {message}")]
    StageExecution {
        /// The failing stage.
        stage: String,
        /// Description of the failure, including the exit status.
        message: String,
    },

    /// An input, image, or pipeline source could not be retrieved.
    ///
    /// Acquisition failures are retried with backoff before surfacing.
    #[error("failed to acquire {subject}: {message}")]
    Acquisition {
        /// What was being retrieved (URL, image reference, repository).
        subject: String,
        /// The underlying failure.
        message: String,
    },

    /// The execution environment is unusable (e.g. container runtime
    /// missing). Fatal to the whole run.
    #[error("environment error: {0}")]
    Environment(String),

    /// The run was cancelled.
    #[error("run cancelled: {0}")]
    Cancelled(String),

    /// A generic internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LabflowError {
    /// Creates a stage execution error.
    #[must_use]
    pub fn stage_execution(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StageExecution {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Creates an acquisition error.
    #[must_use]
    pub fn acquisition(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Acquisition {
            subject: subject.into(),
            message: message.into(),
        }
    }

    /// Returns true if the error is a configuration error that must fail
    /// the run before any stage executes.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Manifest(_)
                | Self::Validation(_)
                | Self::UnknownParameter(_)
                | Self::MissingProducer(_)
                | Self::CycleDetected(_)
                | Self::Resource(_)
        )
    }

    /// Returns true if the error class is worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Acquisition { .. })
    }
}

/// Error raised when a manifest cannot be read or parsed.
#[derive(Debug, Error)]
#[error("manifest '{path}': {message}")]
pub struct ManifestError {
    /// The manifest path.
    pub path: String,
    /// What went wrong.
    pub message: String,
}

impl ManifestError {
    /// Creates a new manifest error.
    #[must_use]
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Error raised when pipeline validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
}

impl ValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }
}

/// Error raised when an override names an undeclared parameter.
#[derive(Debug, Clone, Error)]
#[error("unknown parameter '--{name}'; declared parameters: {}", known.join(", "))]
pub struct UnknownParameterError {
    /// The unrecognized parameter name.
    pub name: String,
    /// The parameters the pipeline declares, sorted.
    pub known: Vec<String>,
}

impl UnknownParameterError {
    /// Creates a new unknown parameter error.
    #[must_use]
    pub fn new(name: impl Into<String>, mut known: Vec<String>) -> Self {
        known.sort();
        Self {
            name: name.into(),
            known,
        }
    }
}

/// Error raised when a declared input has no producing stage and is not
/// pre-supplied on disk.
#[derive(Debug, Clone, Error)]
#[error("stage '{stage}' input '{input}' has no producing stage and does not exist under the work directory")]
pub struct MissingProducerError {
    /// The consuming stage.
    pub stage: String,
    /// The unmatched input path.
    pub input: String,
}

impl MissingProducerError {
    /// Creates a new missing producer error.
    #[must_use]
    pub fn new(stage: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            input: input.into(),
        }
    }
}

/// Error raised when a cycle is detected in the stage graph.
#[derive(Debug, Clone, Error)]
#[error("cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle, first stage repeated last.
    pub cycle_path: Vec<String>,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        Self { cycle_path }
    }
}

impl From<CycleDetectedError> for ValidationError {
    fn from(err: CycleDetectedError) -> Self {
        ValidationError {
            message: err.to_string(),
            stages: err.cycle_path.clone(),
        }
    }
}

/// Error raised when a stage's resource request exceeds the configured
/// ceiling, so it could never be admitted.
#[derive(Debug, Clone, Error)]
#[error("stage '{stage}' requests {requested} {resource} but the ceiling is {ceiling}")]
pub struct ResourceError {
    /// The offending stage.
    pub stage: String,
    /// Which resource was over-requested.
    pub resource: String,
    /// The amount requested.
    pub requested: u64,
    /// The configured ceiling.
    pub ceiling: u64,
}

impl ResourceError {
    /// Creates a new resource error.
    #[must_use]
    pub fn new(
        stage: impl Into<String>,
        resource: impl Into<String>,
        requested: u64,
        ceiling: u64,
    ) -> Self {
        Self {
            stage: stage.into(),
            resource: resource.into(),
            requested,
            ceiling,
        }
    }
}

/// Summary of stage failures for the run report and exit status.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct FailureSummary {
    /// Failed stage names mapped to their error messages, sorted by name.
    pub failures: BTreeMap<String, String>,
}

impl FailureSummary {
    /// Creates an empty summary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a stage failure.
    pub fn record(&mut self, stage: impl Into<String>, error: impl Into<String>) {
        self.failures.insert(stage.into(), error.into());
    }

    /// Returns true if any failures occurred.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// The failed stage names, sorted.
    #[must_use]
    pub fn failed_stages(&self) -> Vec<String> {
        self.failures.keys().cloned().collect()
    }
}
