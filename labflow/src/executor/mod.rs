//! Compute backends that run stage commands.
//!
//! An executor receives a fully prepared stage (rendered command, staged
//! working directory, resource profile) and runs it to completion or
//! failure; it never interprets stage semantics. Stage stdout/stderr are
//! captured to files in the working directory so they publish with the
//! artifact.

mod local;
mod slurm;

pub use local::LocalExecutor;
pub use slurm::SlurmExecutor;

use crate::cancellation::CancellationToken;
use crate::config::{ExecutorKind, RunnerConfig};
use crate::container::ContainerRuntime;
use crate::errors::LabflowError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

/// Captured stdout of a stage, relative to its working directory.
pub const STDOUT_FILE: &str = ".labflow.out";
/// Captured stderr of a stage, relative to its working directory.
pub const STDERR_FILE: &str = ".labflow.err";

/// A stage ready for dispatch: command rendered, inputs staged.
#[derive(Debug, Clone)]
pub struct PreparedStage {
    /// Stage name.
    pub name: String,
    /// Rendered command, run via `sh -c`.
    pub command: String,
    /// Private working directory with inputs materialized.
    pub workdir: PathBuf,
    /// Container image, if the stage is containerized.
    pub container: Option<String>,
    /// CPU cores requested.
    pub cpus: u32,
    /// Memory requested in megabytes.
    pub memory_mb: u64,
    /// GPU slots requested.
    pub gpus: u32,
    /// Wall time limit, if declared.
    pub wall_time: Option<Duration>,
}

/// A compute backend.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs the stage to completion.
    ///
    /// Returns `Ok(())` only for a zero exit status. Cancellation
    /// terminates the underlying process and surfaces as
    /// [`LabflowError::Cancelled`].
    async fn execute(
        &self,
        stage: &PreparedStage,
        cancel: &CancellationToken,
    ) -> Result<(), LabflowError>;
}

/// Builds the executor selected by the runner configuration.
#[must_use]
pub fn build_executor(config: &RunnerConfig) -> Arc<dyn Executor> {
    let runtime = ContainerRuntime::new(config.container_runtime.clone(), config.retry.clone());
    match config.executor {
        ExecutorKind::Local => Arc::new(LocalExecutor::new(runtime)),
        ExecutorKind::Slurm => Arc::new(SlurmExecutor::new(runtime, config.queue.clone())),
    }
}

/// Spawns a process in `workdir`, captures its output, and waits for
/// completion, cancellation, or the wall-time limit.
pub(crate) async fn run_process(
    stage: &str,
    program: &str,
    args: &[String],
    workdir: &Path,
    wall_time: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<(), LabflowError> {
    let stdout = std::fs::File::create(workdir.join(STDOUT_FILE))?;
    let stderr = std::fs::File::create(workdir.join(STDERR_FILE))?;

    let mut child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| {
            LabflowError::stage_execution(stage, format!("failed to spawn '{program}': {err}"))
        })?;

    let deadline = async {
        match wall_time {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        status = child.wait() => {
            let status = status?;
            if status.success() {
                Ok(())
            } else {
                let detail = status
                    .code()
                    .map_or_else(|| "terminated by signal".to_string(), |code| format!("exit status {code}"));
                Err(LabflowError::stage_execution(stage, detail))
            }
        }
        () = cancel.cancelled() => {
            let _ = child.kill().await;
            Err(LabflowError::Cancelled(
                cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
            ))
        }
        () = deadline => {
            let _ = child.kill().await;
            Err(LabflowError::stage_execution(stage, "wall time limit exceeded"))
        }
    }
}
