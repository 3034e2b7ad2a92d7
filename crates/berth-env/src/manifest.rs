//! Environment manifests and their content digests
//!
//! A manifest describes the toolchain snapshot an image is built with:
//!
//! ```toml
//! description = "Rust 1.75 release toolchain"
//!
//! [toolchain]
//! build = ["cargo", "build", "--release"]
//! output_dir = "target/release"
//!
//! [env]
//! CARGO_TERM_COLOR = "never"
//! ```

use crate::error::EnvError;
use crate::toolchain::has_separator;
use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Content digest of a normalized manifest (SHA-256 hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestDigest(String);

impl ManifestDigest {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for ManifestDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Release-mode build toolchain of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Toolchain {
    /// Build command (first element is the executable).
    pub build: Vec<String>,

    /// Directory the toolchain writes artifacts to, relative to the working location.
    pub output_dir: PathBuf,
}

/// Immutable description of an environment image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentManifest {
    #[serde(default)]
    pub description: Option<String>,

    pub toolchain: Toolchain,

    /// Variables applied to both the build and the launched artifact.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl EnvironmentManifest {
    /// Parse and validate a TOML manifest. `origin` is only used in errors.
    pub fn from_toml(content: &str, origin: &str) -> Result<Self> {
        let manifest: EnvironmentManifest =
            toml::from_str(content).map_err(|e| EnvError::InvalidManifest {
                path: origin.to_string(),
                reason: e.to_string(),
            })?;
        manifest.validate(origin)?;
        Ok(manifest)
    }

    /// Read and parse a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content, &path.display().to_string())
    }

    fn validate(&self, origin: &str) -> Result<()> {
        let invalid = |reason: &str| EnvError::InvalidManifest {
            path: origin.to_string(),
            reason: reason.to_string(),
        };

        match self.toolchain.build.first() {
            None => return Err(invalid("toolchain.build must not be empty")),
            Some(exe) if exe.trim().is_empty() => {
                return Err(invalid("toolchain.build executable must not be blank"))
            }
            Some(exe) if has_separator(exe) && !Path::new(exe).is_absolute() => {
                return Err(invalid(
                    "toolchain.build executable must be a bare name or an absolute path",
                ))
            }
            Some(_) => {}
        }

        let output_dir = &self.toolchain.output_dir;
        if output_dir.as_os_str().is_empty() {
            return Err(invalid("toolchain.output_dir must not be empty"));
        }
        if !output_dir
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(invalid(
                "toolchain.output_dir must be a relative path without '..'",
            ));
        }

        Ok(())
    }

    /// Digest of the normalized manifest.
    ///
    /// The manifest is re-serialized before hashing so comments, key order
    /// and whitespace in the source file do not affect identity.
    pub fn digest(&self) -> Result<ManifestDigest> {
        let normalized = serde_json::to_vec(self)?;

        let mut hasher = Sha256::new();
        hasher.update(&normalized);
        let hash = hex::encode(hasher.finalize());

        debug!("Manifest digest: {}", &hash[..12]);
        Ok(ManifestDigest(hash))
    }
}
