//! Build specification and image identity.

use crate::error::{PipelineError, Result};
use berth_env::EnvironmentRef;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Default in-image working location.
pub const DEFAULT_WORKDIR: &str = "/app";

/// Inputs of one pipeline run.
///
/// The environment reference is injected here rather than baked into the
/// pipeline so the same source can be built against several environments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildSpec {
    /// Pinned environment image to build in.
    pub environment: EnvironmentRef,

    /// Source tree on the host.
    pub source: PathBuf,

    /// Absolute working location inside the image.
    pub workdir: PathBuf,

    /// File name of the binary the toolchain produces.
    pub artifact: String,

    /// Compile timeout in seconds (0 = no timeout).
    pub compile_timeout_secs: u64,
}

impl BuildSpec {
    /// Create a spec with the default working location and no timeout.
    pub fn new(environment: EnvironmentRef, source: PathBuf, artifact: impl Into<String>) -> Self {
        Self {
            environment,
            source,
            workdir: PathBuf::from(DEFAULT_WORKDIR),
            artifact: artifact.into(),
            compile_timeout_secs: 0,
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn with_compile_timeout(mut self, secs: u64) -> Self {
        self.compile_timeout_secs = secs;
        self
    }

    /// Check the spec before any stage runs.
    pub fn validate(&self) -> Result<()> {
        validate_workdir(&self.workdir)?;
        validate_artifact_name(&self.artifact)
    }
}

fn validate_workdir(workdir: &Path) -> Result<()> {
    if !workdir.is_absolute() {
        return Err(PipelineError::InvalidSpec(format!(
            "workdir must be absolute: {}",
            workdir.display()
        )));
    }
    if workdir
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(PipelineError::InvalidSpec(format!(
            "workdir must not contain '..': {}",
            workdir.display()
        )));
    }
    Ok(())
}

fn validate_artifact_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(PipelineError::InvalidSpec(format!(
            "invalid artifact name '{name}'"
        )));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(PipelineError::InvalidSpec(format!(
            "artifact name must be a file name, got '{name}'"
        )));
    }
    Ok(())
}

/// Content-derived identifier of a committed image (SHA-256 hex).
///
/// Identical inputs produce the identical id, so rebuilding an unchanged
/// source tree against an unchanged environment lands on the same image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageId(String);

impl ImageId {
    pub fn compute(
        environment_digest: &str,
        source_digest: &str,
        build_command: &[String],
        workdir: &Path,
        artifact: &str,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(environment_digest.as_bytes());
        hasher.update(b"\0");
        hasher.update(source_digest.as_bytes());
        hasher.update(b"\0");
        for arg in build_command {
            hasher.update(arg.as_bytes());
            hasher.update(b"\x1f");
        }
        hasher.update(b"\0");
        hasher.update(workdir.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        hasher.update(artifact.as_bytes());
        ImageId(hex::encode(hasher.finalize()))
    }

    /// Parse a full 64-char hex id.
    pub fn parse(s: &str) -> Option<Self> {
        (s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()))
            .then(|| ImageId(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> BuildSpec {
        BuildSpec::new(
            "rust:1.75".parse().unwrap(),
            PathBuf::from("."),
            "kprint",
        )
    }

    #[test]
    fn test_build_spec_defaults() {
        let s = spec();
        assert_eq!(s.workdir, PathBuf::from("/app"));
        assert_eq!(s.compile_timeout_secs, 0);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_relative_workdir_rejected() {
        let s = spec().with_workdir("app");
        assert!(matches!(s.validate(), Err(PipelineError::InvalidSpec(_))));
    }

    #[test]
    fn test_parent_dir_workdir_rejected() {
        let s = spec().with_workdir("/app/../etc");
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_artifact_must_be_file_name() {
        let mut s = spec();
        s.artifact = "target/release/kprint".to_string();
        assert!(s.validate().is_err());
        s.artifact = String::new();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_image_id_deterministic() {
        let cmd = vec!["cargo".to_string(), "build".to_string()];
        let a = ImageId::compute("env", "src", &cmd, Path::new("/app"), "kprint");
        let b = ImageId::compute("env", "src", &cmd, Path::new("/app"), "kprint");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_image_id_sensitive_to_inputs() {
        let cmd = vec!["cargo".to_string(), "build".to_string()];
        let base = ImageId::compute("env", "src", &cmd, Path::new("/app"), "kprint");
        assert_ne!(
            base,
            ImageId::compute("env2", "src", &cmd, Path::new("/app"), "kprint")
        );
        assert_ne!(
            base,
            ImageId::compute("env", "src2", &cmd, Path::new("/app"), "kprint")
        );
        assert_ne!(
            base,
            ImageId::compute("env", "src", &cmd, Path::new("/srv"), "kprint")
        );

        // Argument boundaries matter.
        let joined = vec!["cargo build".to_string()];
        assert_ne!(
            base,
            ImageId::compute("env", "src", &joined, Path::new("/app"), "kprint")
        );
    }

    #[test]
    fn test_image_id_parse() {
        let id = ImageId::compute("a", "b", &[], Path::new("/app"), "c");
        assert_eq!(ImageId::parse(id.as_str()), Some(id.clone()));
        assert_eq!(ImageId::parse(id.short()), None);
    }
}
