//! Environment resolution
//!
//! An [`EnvironmentResolver`] maps a pinned [`EnvironmentRef`] to exactly one
//! [`Environment`]. [`LocalRegistry`] reads manifests from disk:
//!
//! ```text
//! <root>/<name>/<tag>.toml
//! ```

use crate::error::EnvError;
use crate::manifest::{EnvironmentManifest, ManifestDigest};
use crate::reference::EnvironmentRef;
use crate::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const MANIFEST_EXT: &str = "toml";

/// A resolved environment image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    /// Fully pinned reference (name, tag and digest).
    pub reference: EnvironmentRef,
    pub digest: ManifestDigest,
    pub manifest: EnvironmentManifest,
}

/// Resolves pinned references to environments.
pub trait EnvironmentResolver: Send + Sync {
    /// Resolve `reference` to exactly one environment. Never falls back.
    fn resolve(&self, reference: &EnvironmentRef) -> Result<Environment>;
}

/// Pick the single environment a reference selects out of the tagged
/// manifests registered under its name.
///
/// `candidates` must be sorted by tag so digest-only lookups are stable.
pub(crate) fn select(
    reference: &EnvironmentRef,
    candidates: Vec<(String, EnvironmentManifest)>,
) -> Result<Environment> {
    let not_found = || EnvError::NotFound(reference.to_string());

    let (tag, manifest, digest) = match reference.tag() {
        Some(tag) => {
            let (tag, manifest) = candidates
                .into_iter()
                .find(|(t, _)| t == tag)
                .ok_or_else(not_found)?;
            let digest = manifest.digest()?;
            if let Some(expected) = reference.digest() {
                if expected != digest.as_str() {
                    return Err(EnvError::DigestMismatch {
                        reference: reference.to_string(),
                        expected: expected.to_string(),
                        actual: digest.to_string(),
                    });
                }
            }
            (tag, manifest, digest)
        }
        None => {
            let expected = reference.digest().ok_or_else(not_found)?;
            let mut found = None;
            for (tag, manifest) in candidates {
                let digest = manifest.digest()?;
                if digest.as_str() == expected {
                    found = Some((tag, manifest, digest));
                    break;
                }
            }
            found.ok_or_else(not_found)?
        }
    };

    let pinned = reference.with_tag(&tag)?.with_digest(digest.as_str())?;
    debug!(reference = %pinned, "Environment selected");

    Ok(Environment {
        reference: pinned,
        digest,
        manifest,
    })
}

/// Filesystem-backed registry of environment manifests.
#[derive(Debug, Clone)]
pub struct LocalRegistry {
    root: PathBuf,
}

impl LocalRegistry {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn name_dir(&self, name: &str) -> PathBuf {
        name.split('/')
            .fold(self.root.clone(), |dir, segment| dir.join(segment))
    }

    /// Register a manifest under `name:tag`, returning the pinned reference.
    pub fn register(
        &self,
        name: &str,
        tag: &str,
        manifest: &EnvironmentManifest,
    ) -> Result<EnvironmentRef> {
        let reference = EnvironmentRef::new(name, Some(tag), None)?;
        let content = toml::to_string(manifest).map_err(|e| EnvError::InvalidManifest {
            path: reference.to_string(),
            reason: e.to_string(),
        })?;

        let dir = self.name_dir(name);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(format!("{tag}.{MANIFEST_EXT}")), content)?;

        let digest = manifest.digest()?;
        reference.with_digest(digest.as_str())
    }

    /// List `(tag, manifest)` pairs registered under `name`, sorted by tag.
    pub fn tags(&self, name: &str) -> Result<Vec<(String, EnvironmentManifest)>> {
        let dir = self.name_dir(name);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut entries: Vec<_> = std::fs::read_dir(&dir)?.filter_map(|e| e.ok()).collect();
        entries.sort_by_key(|e| e.path());

        let mut tags = Vec::new();
        for entry in entries {
            let path = entry.path();
            if !path.is_file() || path.extension().map(|e| e != MANIFEST_EXT).unwrap_or(true) {
                continue;
            }
            let Some(tag) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            tags.push((tag, EnvironmentManifest::load(&path)?));
        }

        Ok(tags)
    }
}

impl EnvironmentResolver for LocalRegistry {
    fn resolve(&self, reference: &EnvironmentRef) -> Result<Environment> {
        info!(reference = %reference, root = %self.root.display(), "Resolving environment");

        let candidates = match reference.tag() {
            // Only the tagged manifest is read so unrelated broken tags don't
            // block resolution.
            Some(tag) => {
                let path = self.name_dir(reference.name()).join(format!("{tag}.{MANIFEST_EXT}"));
                if !path.is_file() {
                    return Err(EnvError::NotFound(reference.to_string()));
                }
                vec![(tag.to_string(), EnvironmentManifest::load(&path)?)]
            }
            None => self.tags(reference.name())?,
        };

        select(reference, candidates)
    }
}
