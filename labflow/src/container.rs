//! Container runtime management.
//!
//! Stages with an image reference run inside an isolated container with the
//! staging directory bind-mounted as the working directory. The runtime
//! binary is configurable (`docker`, `podman`); its absence is fatal to the
//! run, while a failing image pull is an acquisition error retried with
//! backoff and then failing only the stage.

use crate::errors::LabflowError;
use crate::retry::{with_retry, RetryConfig};
use std::path::Path;
use tracing::{debug, info};

/// Mount point of the staging directory inside stage containers.
pub const CONTAINER_WORKDIR: &str = "/work";

/// Handle to the configured container runtime.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    binary: String,
    retry: RetryConfig,
}

impl ContainerRuntime {
    /// Creates a runtime handle around the configured binary.
    #[must_use]
    pub fn new(binary: impl Into<String>, retry: RetryConfig) -> Self {
        Self {
            binary: binary.into(),
            retry,
        }
    }

    /// The runtime binary name.
    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Probes the runtime once per run; failure aborts the run.
    pub async fn check_available(&self) -> Result<(), LabflowError> {
        let probe = tokio::process::Command::new(&self.binary)
            .arg("version")
            .output()
            .await;
        match probe {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => Err(LabflowError::Environment(format!(
                "container runtime '{}' is not usable: {}",
                self.binary,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
            Err(err) => Err(LabflowError::Environment(format!(
                "container runtime '{}' not found: {err}",
                self.binary
            ))),
        }
    }

    /// Ensures an image is present locally, pulling it if absent.
    pub async fn ensure_image(&self, image: &str) -> Result<(), LabflowError> {
        let inspect = tokio::process::Command::new(&self.binary)
            .args(["image", "inspect", image])
            .output()
            .await
            .map_err(|err| {
                LabflowError::Environment(format!(
                    "container runtime '{}' not found: {err}",
                    self.binary
                ))
            })?;
        if inspect.status.success() {
            debug!(image = image, "Image already present");
            return Ok(());
        }

        with_retry(&self.retry, image, || self.pull_once(image)).await?;
        info!(image = image, "Image pulled");
        Ok(())
    }

    async fn pull_once(&self, image: &str) -> Result<(), LabflowError> {
        let output = tokio::process::Command::new(&self.binary)
            .args(["pull", image])
            .output()
            .await
            .map_err(|err| {
                LabflowError::Environment(format!(
                    "container runtime '{}' not found: {err}",
                    self.binary
                ))
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(LabflowError::acquisition(
                image,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    /// Builds the argument vector that runs `command` inside `image` with
    /// `workdir` bind-mounted at [`CONTAINER_WORKDIR`].
    #[must_use]
    pub fn run_args(
        &self,
        image: &str,
        command: &str,
        workdir: &Path,
        gpus: u32,
    ) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:{CONTAINER_WORKDIR}", workdir.display()),
            "-w".to_string(),
            CONTAINER_WORKDIR.to_string(),
        ];
        if gpus > 0 {
            args.push("--gpus".to_string());
            args.push("all".to_string());
        }
        args.push(image.to_string());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(command.to_string());
        args
    }
}
