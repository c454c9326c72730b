//! Local process executor.

use super::{run_process, Executor, PreparedStage};
use crate::cancellation::CancellationToken;
use crate::container::ContainerRuntime;
use crate::errors::LabflowError;
use async_trait::async_trait;
use tracing::debug;

/// Runs stages as local child processes, containerized when the stage
/// declares an image.
#[derive(Debug)]
pub struct LocalExecutor {
    runtime: ContainerRuntime,
}

impl LocalExecutor {
    /// Creates a local executor using the given container runtime.
    #[must_use]
    pub fn new(runtime: ContainerRuntime) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn execute(
        &self,
        stage: &PreparedStage,
        cancel: &CancellationToken,
    ) -> Result<(), LabflowError> {
        match &stage.container {
            Some(image) => {
                self.runtime.ensure_image(image).await?;
                let args =
                    self.runtime
                        .run_args(image, &stage.command, &stage.workdir, stage.gpus);
                debug!(stage = %stage.name, image = %image, "Dispatching containerized stage");
                run_process(
                    &stage.name,
                    self.runtime.binary(),
                    &args,
                    &stage.workdir,
                    stage.wall_time,
                    cancel,
                )
                .await
            }
            None => {
                debug!(stage = %stage.name, "Dispatching host stage");
                let args = vec!["-c".to_string(), stage.command.clone()];
                run_process(
                    &stage.name,
                    "sh",
                    &args,
                    &stage.workdir,
                    stage.wall_time,
                    cancel,
                )
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use std::path::Path;
    use std::time::Duration;

    fn executor() -> LocalExecutor {
        LocalExecutor::new(ContainerRuntime::new("docker", RetryConfig::default()))
    }

    fn prepared(command: &str, workdir: &Path) -> PreparedStage {
        PreparedStage {
            name: "extract".to_string(),
            command: command.to_string(),
            workdir: workdir.to_path_buf(),
            container: None,
            cpus: 1,
            memory_mb: 64,
            gpus: 0,
            wall_time: None,
        }
    }

    #[tokio::test]
    async fn test_host_stage_runs_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();

        executor()
            .execute(&prepared("pwd > where.txt", dir.path()), &cancel)
            .await
            .unwrap();

        let recorded = std::fs::read_to_string(dir.path().join("where.txt")).unwrap();
        let recorded = Path::new(recorded.trim());
        assert_eq!(
            recorded.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_host_stage_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();

        let err = executor()
            .execute(&prepared("exit 7", dir.path()), &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exit status 7"));
    }

    #[tokio::test]
    async fn test_wall_time_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();

        let mut stage = prepared("sleep 5", dir.path());
        stage.wall_time = Some(Duration::from_millis(100));

        let err = executor().execute(&stage, &cancel).await.unwrap_err();
        assert!(err.to_string().contains("wall time"));
    }
}
