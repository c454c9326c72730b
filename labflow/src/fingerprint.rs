//! Content fingerprints for caching and resume.
//!
//! A stage's fingerprint covers its name, command template, container image,
//! the subset of parameters its command references, its declared outputs,
//! and the fingerprints of its inputs. Fingerprints chain: a parameter
//! change re-fingerprints every stage that references it, transitively,
//! while unrelated stages keep their cache entries.

use crate::manifest::StageDecl;
use crate::params::ResolvedParams;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::Path;

/// Number of digest bytes kept in a rendered fingerprint.
const FINGERPRINT_BYTES: usize = 16;

/// A hex-rendered, truncated SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps an already-rendered digest (receipt loading).
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// The hex form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn finish(hasher: Sha256) -> Fingerprint {
    let digest = hasher.finalize();
    Fingerprint(hex::encode(&digest[..FINGERPRINT_BYTES]))
}

/// Fingerprints a stage given the fingerprints of its inputs.
///
/// `input_fingerprints` maps input alias to the fingerprint of whatever
/// satisfies it: an upstream artifact, a pre-supplied file, or a URL.
#[must_use]
pub fn stage_fingerprint(
    stage: &StageDecl,
    params: &ResolvedParams,
    input_fingerprints: &BTreeMap<String, Fingerprint>,
) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(b"stage:");
    hasher.update(stage.name.as_bytes());
    hasher.update(b"\ncommand:");
    hasher.update(stage.command.as_bytes());
    if let Some(image) = &stage.container {
        hasher.update(b"\ncontainer:");
        hasher.update(image.as_bytes());
    }
    for (name, value) in params.subset(&stage.referenced_params()) {
        hasher.update(b"\nparam:");
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.render().as_bytes());
    }
    for (alias, fingerprint) in input_fingerprints {
        hasher.update(b"\ninput:");
        hasher.update(alias.as_bytes());
        hasher.update(b"=");
        hasher.update(fingerprint.as_str().as_bytes());
    }
    for (alias, path) in &stage.outputs {
        hasher.update(b"\noutput:");
        hasher.update(alias.as_bytes());
        hasher.update(b"=");
        hasher.update(path.as_bytes());
    }
    finish(hasher)
}

/// Fingerprints a pre-supplied input file by content.
pub fn file_fingerprint(path: &Path) -> std::io::Result<Fingerprint> {
    let mut hasher = Sha256::new();
    let mut file = std::fs::File::open(path)?;
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(finish(hasher))
}

/// Fingerprints a set of pre-supplied files as one input (glob patterns).
///
/// Paths are taken in the given (sorted) order; both the relative path and
/// the content of each file participate, so renames invalidate consumers
/// the same way edits do.
pub fn files_fingerprint(workdir: &Path, relative: &[String]) -> std::io::Result<Fingerprint> {
    let mut hasher = Sha256::new();
    for path in relative {
        hasher.update(b"file:");
        hasher.update(path.as_bytes());
        hasher.update(b"=");
        hasher.update(file_fingerprint(&workdir.join(path))?.as_str().as_bytes());
    }
    Ok(finish(hasher))
}

/// Fingerprints a remote input by its URL.
///
/// Remote artifacts are assumed immutable at a given URL; re-downloading to
/// hash contents on every planning pass would defeat resume.
#[must_use]
pub fn url_fingerprint(url: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(b"url:");
    hasher.update(url.as_bytes());
    finish(hasher)
}
