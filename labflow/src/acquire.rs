//! Automatic retrieval of run inputs: remote datasets and checkpoints, and
//! pipeline sources referenced by repository URL.
//!
//! All retrieval goes through the bounded-retry policy; a download that
//! keeps failing fails the stage (or the run, for pipeline sources), never
//! the whole process on the first transient error.

use crate::errors::LabflowError;
use crate::fingerprint::url_fingerprint;
use crate::retry::{with_retry, RetryConfig};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Retrieves remote artifacts into a content-addressed download cache.
#[derive(Debug)]
pub struct Acquirer {
    retry: RetryConfig,
    downloads_dir: PathBuf,
}

impl Acquirer {
    /// Creates an acquirer writing into `downloads_dir`.
    #[must_use]
    pub fn new(retry: RetryConfig, downloads_dir: PathBuf) -> Self {
        Self {
            retry,
            downloads_dir,
        }
    }

    /// The cache location for a URL: `<downloads>/<url-fingerprint>/<name>`.
    #[must_use]
    pub fn cache_path(&self, url: &str) -> PathBuf {
        self.downloads_dir
            .join(url_fingerprint(url).as_str())
            .join(url_file_name(url))
    }

    /// Downloads a remote input unless it is already cached.
    ///
    /// Returns the cached file path. Downloads write to a temporary
    /// sibling and rename on completion, so a torn download is never
    /// mistaken for a cached artifact.
    pub async fn fetch_url(&self, url: &str) -> Result<PathBuf, LabflowError> {
        let target = self.cache_path(url);
        if target.is_file() {
            debug!(url = url, path = %target.display(), "Remote input already cached");
            return Ok(target);
        }

        with_retry(&self.retry, url, || self.download_once(url, &target)).await?;
        info!(url = url, path = %target.display(), "Remote input downloaded");
        Ok(target)
    }

    #[cfg(feature = "remote-inputs")]
    async fn download_once(&self, url: &str, target: &Path) -> Result<(), LabflowError> {
        let parent = target
            .parent()
            .ok_or_else(|| LabflowError::Internal("download path has no parent".to_string()))?;
        std::fs::create_dir_all(parent)?;

        let response = reqwest::get(url)
            .await
            .map_err(|err| LabflowError::acquisition(url, err.to_string()))?;
        let response = response
            .error_for_status()
            .map_err(|err| LabflowError::acquisition(url, err.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| LabflowError::acquisition(url, err.to_string()))?;

        let partial = parent.join(format!(
            ".partial-{}",
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::write(&partial, &bytes).await?;
        tokio::fs::rename(&partial, target).await?;
        Ok(())
    }

    #[cfg(not(feature = "remote-inputs"))]
    async fn download_once(&self, url: &str, _target: &Path) -> Result<(), LabflowError> {
        Err(LabflowError::Environment(format!(
            "remote input '{url}' requested but labflow was built without the remote-inputs feature"
        )))
    }
}

/// A pipeline reference from the invocation surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineSource {
    /// A manifest file or directory on the local filesystem.
    Local(PathBuf),
    /// A git repository, pinned to a revision when given.
    Git {
        /// Clone URL.
        url: String,
        /// Branch, tag, or commit to check out.
        revision: Option<String>,
    },
}

impl PipelineSource {
    /// Classifies a raw pipeline reference.
    #[must_use]
    pub fn classify(reference: &str, revision: Option<String>) -> Self {
        let looks_like_git = reference.ends_with(".git")
            || reference.starts_with("git@")
            || reference.starts_with("ssh://");
        if looks_like_git
            || (revision.is_some()
                && (reference.starts_with("http://") || reference.starts_with("https://")))
        {
            Self::Git {
                url: reference.to_string(),
                revision,
            }
        } else {
            Self::Local(PathBuf::from(reference))
        }
    }

    /// Materializes the source as a local directory/file the manifest can
    /// be loaded from.
    ///
    /// Git sources are cloned into `cache_root` keyed by URL + revision
    /// and reused on later runs; a pinned revision is assumed immutable.
    pub async fn materialize(
        &self,
        cache_root: &Path,
        retry: &RetryConfig,
    ) -> Result<PathBuf, LabflowError> {
        match self {
            Self::Local(path) => Ok(path.clone()),
            Self::Git { url, revision } => {
                let key = match revision {
                    Some(rev) => format!("{url}@{rev}"),
                    None => url.clone(),
                };
                let checkout = cache_root.join(url_fingerprint(&key).as_str());
                if checkout.join(".git").is_dir() {
                    debug!(url = %url, path = %checkout.display(), "Pipeline already fetched");
                    return Ok(checkout);
                }
                std::fs::create_dir_all(cache_root)?;

                with_retry(retry, url, || clone_once(url, revision.as_deref(), &checkout))
                    .await?;
                info!(url = %url, path = %checkout.display(), "Pipeline fetched");
                Ok(checkout)
            }
        }
    }
}

async fn clone_once(
    url: &str,
    revision: Option<&str>,
    checkout: &Path,
) -> Result<(), LabflowError> {
    // A half-finished clone from a previous attempt must not shadow this one.
    if checkout.exists() {
        tokio::fs::remove_dir_all(checkout).await?;
    }

    run_git(&["clone", "--quiet", url, &checkout.display().to_string()], None, url).await?;
    if let Some(rev) = revision {
        run_git(&["checkout", "--quiet", rev], Some(checkout), url).await?;
    }
    Ok(())
}

async fn run_git(args: &[&str], cwd: Option<&Path>, subject: &str) -> Result<(), LabflowError> {
    let mut command = tokio::process::Command::new("git");
    command.args(args);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    let output = command
        .output()
        .await
        .map_err(|err| LabflowError::Environment(format!("git unavailable: {err}")))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(LabflowError::acquisition(
            subject,
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

pub(crate) fn url_file_name(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && !name.contains('?'))
        .map_or_else(|| "download".to_string(), ToString::to_string)
}
