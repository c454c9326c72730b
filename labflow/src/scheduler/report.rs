//! Run reports: the stable summary downstream consumers read.

use crate::errors::FailureSummary;
use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Terminal state of one stage within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    /// Executed and published.
    Completed {
        /// Wall time in milliseconds.
        duration_ms: u64,
    },
    /// Skipped: a published artifact already matched the fingerprint.
    Cached,
    /// Executed and failed, or failed to prepare.
    Failed {
        /// Error description.
        error: String,
    },
    /// Never dispatched because an upstream stage failed.
    Skipped {
        /// The failed upstream stage.
        cause: String,
    },
    /// Terminated or never dispatched because the run was cancelled.
    Cancelled,
}

impl StageOutcome {
    /// True for outcomes that satisfy downstream dependencies.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Cached)
    }
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Run identity.
    pub run_id: Uuid,
    /// Pipeline name.
    pub pipeline: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Outcome per stage.
    pub stages: BTreeMap<String, StageOutcome>,
    /// Fingerprint per stage, for resume diagnostics.
    pub fingerprints: BTreeMap<String, Fingerprint>,
    /// Failed stages and their errors.
    pub failures: FailureSummary,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

impl RunReport {
    /// True when every stage completed or was a cache hit.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.stages.values().all(StageOutcome::is_success)
    }

    /// The process exit code for this run.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.is_success())
    }

    /// Stages that executed (not cache hits), sorted by name.
    #[must_use]
    pub fn executed_stages(&self) -> Vec<String> {
        self.stages
            .iter()
            .filter(|(_, outcome)| matches!(outcome, StageOutcome::Completed { .. }))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Stages satisfied from the artifact store, sorted by name.
    #[must_use]
    pub fn cached_stages(&self) -> Vec<String> {
        self.stages
            .iter()
            .filter(|(_, outcome)| matches!(outcome, StageOutcome::Cached))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn report(stages: Vec<(&str, StageOutcome)>) -> RunReport {
        let mut failures = FailureSummary::new();
        for (name, outcome) in &stages {
            if let StageOutcome::Failed { error } = outcome {
                failures.record((*name).to_string(), error.clone());
            }
        }
        RunReport {
            run_id: Uuid::new_v4(),
            pipeline: "test".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            stages: stages
                .into_iter()
                .map(|(n, o)| (n.to_string(), o))
                .collect(),
            fingerprints: BTreeMap::new(),
            failures,
            cancelled: false,
        }
    }

    #[test]
    fn test_all_success() {
        let report = report(vec![
            ("finetune", StageOutcome::Completed { duration_ms: 10 }),
            ("extract", StageOutcome::Cached),
        ]);
        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.executed_stages(), vec!["finetune"]);
        assert_eq!(report.cached_stages(), vec!["extract"]);
    }

    #[test]
    fn test_failure_nonzero_exit() {
        let report = report(vec![
            (
                "finetune",
                StageOutcome::Failed {
                    error: "exit status 1".to_string(),
                },
            ),
            (
                "extract",
                StageOutcome::Skipped {
                    cause: "finetune".to_string(),
                },
            ),
        ]);
        assert!(!report.is_success());
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.failures.failed_stages(), vec!["finetune"]);
    }

    #[test]
    fn test_report_serializes() {
        let report = report(vec![("finetune", StageOutcome::Cached)]);
        let json = serde_json::to_string_pretty(&report).unwrap();
        assert!(json.contains("\"cached\""));
    }
}
