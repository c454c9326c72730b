//! Slurm cluster executor.
//!
//! Stages are submitted with `sbatch --wait`, which blocks until the job
//! finishes and carries its exit code. Resource flags derive from the
//! stage's resource profile and the configured partition.

use super::{run_process, Executor, PreparedStage};
use crate::cancellation::CancellationToken;
use crate::container::ContainerRuntime;
use crate::errors::LabflowError;
use async_trait::async_trait;
use tracing::debug;

/// Submits stages to a Slurm cluster.
#[derive(Debug)]
pub struct SlurmExecutor {
    runtime: ContainerRuntime,
    queue: Option<String>,
}

impl SlurmExecutor {
    /// Creates a Slurm executor for the given partition.
    #[must_use]
    pub fn new(runtime: ContainerRuntime, queue: Option<String>) -> Self {
        Self { runtime, queue }
    }

    /// Builds the sbatch argument vector for a prepared stage.
    #[must_use]
    pub fn sbatch_args(&self, stage: &PreparedStage) -> Vec<String> {
        let mut args = vec![
            "--wait".to_string(),
            "--quiet".to_string(),
            format!("--job-name={}", stage.name),
            format!("--cpus-per-task={}", stage.cpus),
            format!("--mem={}M", stage.memory_mb),
            format!("--chdir={}", stage.workdir.display()),
        ];
        if stage.gpus > 0 {
            args.push(format!("--gres=gpu:{}", stage.gpus));
        }
        if let Some(queue) = &self.queue {
            args.push(format!("--partition={queue}"));
        }
        if let Some(limit) = stage.wall_time {
            let minutes = limit.as_secs().div_ceil(60).max(1);
            args.push(format!("--time={minutes}"));
        }

        let command = match &stage.container {
            Some(image) => {
                let mut invocation = vec![self.runtime.binary().to_string()];
                invocation.extend(self.runtime.run_args(
                    image,
                    &stage.command,
                    &stage.workdir,
                    stage.gpus,
                ));
                shell_join(&invocation)
            }
            None => stage.command.clone(),
        };
        args.push(format!("--wrap={command}"));
        args
    }
}

#[async_trait]
impl Executor for SlurmExecutor {
    async fn execute(
        &self,
        stage: &PreparedStage,
        cancel: &CancellationToken,
    ) -> Result<(), LabflowError> {
        // The image must exist on the submission host's runtime cache
        // before the job lands on a node that shares it.
        if let Some(image) = &stage.container {
            self.runtime.ensure_image(image).await?;
        }
        let args = self.sbatch_args(stage);
        debug!(stage = %stage.name, "Submitting stage via sbatch");
        // Wall time is enforced by Slurm through --time, not locally: queue
        // wait does not count against the stage's limit.
        run_process(&stage.name, "sbatch", &args, &stage.workdir, None, cancel).await
    }
}

/// Joins an argument vector into a single shell command, single-quoting
/// each argument.
fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|arg| format!("'{}'", arg.replace('\'', r"'\''")))
        .collect::<Vec<_>>()
        .join(" ")
}
