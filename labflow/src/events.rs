//! Run events for observability.
//!
//! The scheduler emits structured events as stages move through their
//! lifecycle; sinks decide what to do with them.

use crate::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// A structured event emitted during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// A stage was dispatched to an executor.
    StageStarted {
        /// Stage name.
        stage: String,
        /// Stage fingerprint.
        fingerprint: Fingerprint,
    },
    /// A stage finished successfully and its artifact was published.
    StageCompleted {
        /// Stage name.
        stage: String,
        /// Wall time in milliseconds.
        duration_ms: u64,
    },
    /// A stage was skipped because a published artifact already matched
    /// its fingerprint.
    StageCacheHit {
        /// Stage name.
        stage: String,
        /// Matching fingerprint.
        fingerprint: Fingerprint,
    },
    /// A stage failed.
    StageFailed {
        /// Stage name.
        stage: String,
        /// Error description.
        error: String,
    },
    /// A stage was skipped because an upstream dependency failed.
    StageSkipped {
        /// Stage name.
        stage: String,
        /// The failed upstream stage.
        cause: String,
    },
    /// The run was cancelled.
    RunCancelled {
        /// Cancellation reason.
        reason: String,
    },
}

impl RunEvent {
    /// The stage this event concerns, if any.
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::StageStarted { stage, .. }
            | Self::StageCompleted { stage, .. }
            | Self::StageCacheHit { stage, .. }
            | Self::StageFailed { stage, .. }
            | Self::StageSkipped { stage, .. } => Some(stage),
            Self::RunCancelled { .. } => None,
        }
    }
}

/// Receives run events.
///
/// Sinks must never fail; reporting problems is their own concern.
pub trait EventSink: Send + Sync {
    /// Handles one event.
    fn emit(&self, event: &RunEvent);
}

/// Discards all events. The default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event: &RunEvent) {}
}

/// Logs events through the tracing framework.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, event: &RunEvent) {
        match event {
            RunEvent::StageStarted { stage, fingerprint } => {
                info!(stage = %stage, fingerprint = %fingerprint, "Stage started");
            }
            RunEvent::StageCompleted { stage, duration_ms } => {
                info!(stage = %stage, duration_ms = duration_ms, "Stage completed");
            }
            RunEvent::StageCacheHit { stage, fingerprint } => {
                info!(stage = %stage, fingerprint = %fingerprint, "Stage up to date, skipping");
            }
            RunEvent::StageFailed { stage, error } => {
                error!(stage = %stage, error = %error, "Stage failed");
            }
            RunEvent::StageSkipped { stage, cause } => {
                info!(stage = %stage, cause = %cause, "Stage skipped: upstream failure");
            }
            RunEvent::RunCancelled { reason } => {
                info!(reason = %reason, "Run cancelled");
            }
        }
    }
}

/// Collects events in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<RunEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected events, in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<RunEvent> {
        self.events.read().clone()
    }

    /// Events concerning one stage.
    #[must_use]
    pub fn events_for(&self, stage: &str) -> Vec<RunEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.stage() == Some(stage))
            .cloned()
            .collect()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event: &RunEvent) {
        self.events.write().push(event.clone());
    }
}
