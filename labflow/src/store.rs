//! Filesystem-backed artifact store.
//!
//! Artifacts are addressed by stage name + fingerprint. A stage executes in
//! a private staging directory; on success its declared outputs are
//! verified, a receipt is written, and the directory is renamed into place.
//! Nothing under a staging directory is ever visible to dependents.

use crate::errors::LabflowError;
use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Receipt written into every published artifact directory.
pub const RECEIPT_FILE: &str = ".labflow-receipt.json";

/// Metadata recorded when an artifact is published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactReceipt {
    /// Producing stage.
    pub stage: String,
    /// Stage fingerprint at publication time.
    pub fingerprint: Fingerprint,
    /// Run that produced the artifact.
    pub run_id: Uuid,
    /// Publication timestamp.
    pub created_at: DateTime<Utc>,
    /// Declared outputs: alias to path relative to the artifact directory.
    pub outputs: BTreeMap<String, String>,
}

/// The filesystem store for published artifacts and staging directories.
#[derive(Debug)]
pub struct ArtifactStore {
    artifacts_dir: PathBuf,
    staging_root: PathBuf,
    downloads_dir: PathBuf,
    /// Artifact directory names currently claimed by a staging writer.
    claims: DashMap<String, ()>,
}

impl ArtifactStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Arc<Self>, LabflowError> {
        let artifacts_dir = root.join("artifacts");
        let staging_root = root.join("staging");
        let downloads_dir = root.join("downloads");
        std::fs::create_dir_all(&artifacts_dir)?;
        std::fs::create_dir_all(&staging_root)?;
        std::fs::create_dir_all(&downloads_dir)?;
        Ok(Arc::new(Self {
            artifacts_dir,
            staging_root,
            downloads_dir,
            claims: DashMap::new(),
        }))
    }

    fn artifact_name(stage: &str, fingerprint: &Fingerprint) -> String {
        format!("{stage}-{fingerprint}")
    }

    /// The published directory for a stage + fingerprint.
    #[must_use]
    pub fn published_dir(&self, stage: &str, fingerprint: &Fingerprint) -> PathBuf {
        self.artifacts_dir.join(Self::artifact_name(stage, fingerprint))
    }

    /// The download cache directory (remote input acquisition).
    #[must_use]
    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    /// Looks up a published artifact, verifying its receipt and that every
    /// declared output still exists.
    ///
    /// A directory with a missing or mismatched receipt is treated as
    /// absent; it will be replaced on the next publish.
    pub fn lookup(
        &self,
        stage: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<ArtifactReceipt>, LabflowError> {
        let dir = self.published_dir(stage, fingerprint);
        let receipt_path = dir.join(RECEIPT_FILE);
        if !receipt_path.is_file() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&receipt_path)?;
        let Ok(receipt) = serde_json::from_str::<ArtifactReceipt>(&content) else {
            debug!(stage = stage, "Unreadable receipt, treating artifact as absent");
            return Ok(None);
        };
        if &receipt.fingerprint != fingerprint || receipt.stage != stage {
            return Ok(None);
        }
        for path in receipt.outputs.values() {
            if !dir.join(path).exists() {
                debug!(
                    stage = stage,
                    output = %path,
                    "Published artifact lost an output, treating as absent"
                );
                return Ok(None);
            }
        }
        Ok(Some(receipt))
    }

    /// Claims a staging directory for one execution of a stage.
    ///
    /// # Errors
    ///
    /// Fails if another writer currently holds the same stage +
    /// fingerprint; each artifact path has exactly one producer.
    pub fn begin_stage(
        self: &Arc<Self>,
        stage: &str,
        fingerprint: &Fingerprint,
    ) -> Result<StagingDir, LabflowError> {
        let name = Self::artifact_name(stage, fingerprint);
        match self.claims.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(LabflowError::Internal(format!(
                    "artifact '{name}' already has a concurrent writer"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(());
            }
        }

        let path = self
            .staging_root
            .join(format!("{name}-{}", Uuid::new_v4().simple()));
        if let Err(err) = std::fs::create_dir_all(&path) {
            self.claims.remove(&name);
            return Err(err.into());
        }

        Ok(StagingDir {
            store: Arc::clone(self),
            claim: name,
            path,
            stage: stage.to_string(),
            fingerprint: fingerprint.clone(),
            finished: false,
        })
    }
}

/// A claimed, private working directory for one stage execution.
///
/// Dropping without publishing discards the directory and leaves no
/// artifact visible.
#[derive(Debug)]
pub struct StagingDir {
    store: Arc<ArtifactStore>,
    claim: String,
    path: PathBuf,
    stage: String,
    fingerprint: Fingerprint,
    finished: bool,
}

impl StagingDir {
    /// The staging directory path; the stage command runs with this as its
    /// working directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Materializes an input file at `relative` inside the staging
    /// directory, hard-linking when possible and copying otherwise.
    pub fn stage_input(&self, source: &Path, relative: &str) -> Result<(), LabflowError> {
        let target = self.path.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if std::fs::hard_link(source, &target).is_err() {
            std::fs::copy(source, &target)?;
        }
        Ok(())
    }

    /// Verifies outputs, writes the receipt, and atomically renames the
    /// staging directory into the published location.
    ///
    /// With `replace`, an existing published artifact is removed first
    /// (forced re-execution); otherwise a valid artifact published by a
    /// racing run wins and this directory is discarded.
    pub fn publish(
        mut self,
        run_id: Uuid,
        outputs: &BTreeMap<String, String>,
        replace: bool,
    ) -> Result<ArtifactReceipt, LabflowError> {
        for (alias, relative) in outputs {
            if !self.path.join(relative).exists() {
                return Err(LabflowError::stage_execution(
                    self.stage.clone(),
                    format!("declared output '{alias}' ({relative}) was not produced"),
                ));
            }
        }

        let receipt = ArtifactReceipt {
            stage: self.stage.clone(),
            fingerprint: self.fingerprint.clone(),
            run_id,
            created_at: Utc::now(),
            outputs: outputs.clone(),
        };
        let receipt_json = serde_json::to_string_pretty(&receipt)
            .map_err(|err| LabflowError::Serialization(err.to_string()))?;
        std::fs::write(self.path.join(RECEIPT_FILE), receipt_json)?;

        let target = self.store.published_dir(&self.stage, &self.fingerprint);
        if target.exists() {
            // A stale directory without a valid receipt can always be
            // replaced; a valid one means a racing run already published
            // this artifact and wins unless a replacement was forced.
            if !replace && self.store.lookup(&self.stage, &self.fingerprint)?.is_some() {
                self.discard_dir();
                self.release();
                return Ok(receipt);
            }
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(&self.path, &target)?;
        self.release();
        Ok(receipt)
    }

    /// Discards the staging directory without publishing.
    pub fn discard(mut self) {
        self.discard_dir();
        self.release();
    }

    fn discard_dir(&self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }

    fn release(&mut self) {
        if !self.finished {
            self.store.claims.remove(&self.claim);
            self.finished = true;
        }
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if !self.finished {
            self.discard_dir();
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fp(byte: &str) -> Fingerprint {
        Fingerprint::from_hex(byte.repeat(16))
    }

    fn outputs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(a, p)| ((*a).to_string(), (*p).to_string()))
            .collect()
    }

    #[test]
    fn test_publish_and_lookup() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(root.path()).unwrap();

        let staging = store.begin_stage("finetune", &fp("aa")).unwrap();
        std::fs::create_dir_all(staging.path().join("model")).unwrap();
        std::fs::write(staging.path().join("model/ckpt.bin"), b"weights").unwrap();

        let receipt = staging
            .publish(Uuid::new_v4(), &outputs(&[("ckpt", "model/ckpt.bin")]), false)
            .unwrap();
        assert_eq!(receipt.stage, "finetune");

        let found = store.lookup("finetune", &fp("aa")).unwrap().unwrap();
        assert_eq!(found.fingerprint, fp("aa"));
        assert!(store
            .published_dir("finetune", &fp("aa"))
            .join("model/ckpt.bin")
            .is_file());
    }

    #[test]
    fn test_lookup_absent() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(root.path()).unwrap();
        assert!(store.lookup("finetune", &fp("aa")).unwrap().is_none());
    }

    #[test]
    fn test_missing_output_fails_publish() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(root.path()).unwrap();

        let staging = store.begin_stage("finetune", &fp("aa")).unwrap();
        let err = staging
            .publish(Uuid::new_v4(), &outputs(&[("ckpt", "model/ckpt.bin")]), false)
            .unwrap_err();

        assert!(err.to_string().contains("was not produced"));
        // Nothing was published.
        assert!(store.lookup("finetune", &fp("aa")).unwrap().is_none());
    }

    #[test]
    fn test_discard_leaves_nothing_visible() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(root.path()).unwrap();

        let staging = store.begin_stage("finetune", &fp("aa")).unwrap();
        std::fs::write(staging.path().join("partial"), b"half").unwrap();
        let staging_path = staging.path().to_path_buf();
        staging.discard();

        assert!(!staging_path.exists());
        assert!(store.lookup("finetune", &fp("aa")).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_writer_rejected() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(root.path()).unwrap();

        let first = store.begin_stage("finetune", &fp("aa")).unwrap();
        let second = store.begin_stage("finetune", &fp("aa"));
        assert!(second.is_err());

        // Releasing the claim allows a new writer.
        first.discard();
        assert!(store.begin_stage("finetune", &fp("aa")).is_ok());
    }

    #[test]
    fn test_different_fingerprints_coexist() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(root.path()).unwrap();

        let a = store.begin_stage("finetune", &fp("aa")).unwrap();
        std::fs::write(a.path().join("out.txt"), b"250").unwrap();
        a.publish(Uuid::new_v4(), &outputs(&[("out", "out.txt")]), false)
            .unwrap();

        let b = store.begin_stage("finetune", &fp("bb")).unwrap();
        std::fs::write(b.path().join("out.txt"), b"500").unwrap();
        b.publish(Uuid::new_v4(), &outputs(&[("out", "out.txt")]), false)
            .unwrap();

        assert!(store.lookup("finetune", &fp("aa")).unwrap().is_some());
        assert!(store.lookup("finetune", &fp("bb")).unwrap().is_some());
    }

    #[test]
    fn test_stage_input_materialization() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(root.path()).unwrap();

        let source_dir = tempfile::tempdir().unwrap();
        let source = source_dir.path().join("stimuli.txt");
        std::fs::write(&source, b"a sentence").unwrap();

        let staging = store.begin_stage("extract", &fp("cc")).unwrap();
        staging.stage_input(&source, "data/stimuli.txt").unwrap();

        let staged = staging.path().join("data/stimuli.txt");
        assert_eq!(std::fs::read(staged).unwrap(), b"a sentence");
    }

    #[test]
    fn test_drop_without_publish_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(root.path()).unwrap();

        let staging_path = {
            let staging = store.begin_stage("finetune", &fp("aa")).unwrap();
            staging.path().to_path_buf()
        };

        assert!(!staging_path.exists());
        assert!(store.begin_stage("finetune", &fp("aa")).is_ok());
    }
}
