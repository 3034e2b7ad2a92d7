//! `berth.toml` loading and layering.
//!
//! Precedence, highest first: command-line flags (and their `BERTH_*`
//! environment variables), the config file, built-in defaults. Relative
//! paths in the file are resolved against the file's directory.

use crate::artifact::infer_artifact_name;
use crate::error::{PipelineError, Result};
use crate::spec::{BuildSpec, DEFAULT_WORKDIR};
use berth_env::EnvironmentRef;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name looked up in the current directory when no `--config` is given.
pub const CONFIG_FILE_NAME: &str = "berth.toml";

/// Fallback data directory when the platform has none.
const FALLBACK_DATA_DIR: &str = ".berth";

/// Contents of a `berth.toml`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BerthConfig {
    /// Pinned environment reference, e.g. `rust:1.75@sha256:...`.
    pub environment: Option<String>,

    pub source: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
    pub artifact: Option<String>,
    pub compile_timeout_secs: Option<u64>,

    /// Local environment registry directory.
    pub registry: Option<PathBuf>,

    /// Image store directory.
    pub store: Option<PathBuf>,
}

impl BerthConfig {
    /// Parse a config document. Paths are left as written.
    pub fn from_toml(content: &str, origin: &Path) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| PipelineError::Config(format!("{}: {}", origin.display(), e)))
    }

    /// Load a config file, resolving relative paths against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        let mut config = Self::from_toml(&content, path)?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for field in [&mut config.source, &mut config.registry, &mut config.store] {
            if let Some(p) = field.as_mut() {
                if p.is_relative() {
                    *p = base.join(&*p);
                }
            }
        }

        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Load `path` if given, else `<dir>/berth.toml` if it exists, else
    /// defaults. An explicitly named file must exist.
    pub fn discover(path: Option<&Path>, dir: &Path) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let candidate = dir.join(CONFIG_FILE_NAME);
                if candidate.is_file() {
                    Self::load(&candidate)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Layer `overrides` on top of this config.
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        macro_rules! layer {
            ($($field:ident),*) => {
                $(if overrides.$field.is_some() {
                    self.$field = overrides.$field;
                })*
            };
        }
        layer!(
            environment,
            source,
            workdir,
            artifact,
            compile_timeout_secs,
            registry,
            store
        );
        self
    }

    /// Registry directory, defaulting to `<data dir>/berth/registry`.
    pub fn registry_dir(&self) -> PathBuf {
        self.registry
            .clone()
            .unwrap_or_else(|| default_data_dir().join("registry"))
    }

    /// Store directory, defaulting to `<data dir>/berth/store`.
    pub fn store_dir(&self) -> PathBuf {
        self.store
            .clone()
            .unwrap_or_else(|| default_data_dir().join("store"))
    }

    /// Build the spec for one pipeline run.
    ///
    /// The environment must be configured somewhere; there is no default.
    /// The artifact name falls back to the source's `Cargo.toml`.
    pub fn build_spec(&self) -> Result<BuildSpec> {
        let reference = self.environment.as_deref().ok_or_else(|| {
            PipelineError::Config(
                "no environment configured (set `environment` in berth.toml, --env or BERTH_ENVIRONMENT)"
                    .to_string(),
            )
        })?;
        let environment: EnvironmentRef = reference.parse()?;

        let source = self.source.clone().unwrap_or_else(|| PathBuf::from("."));
        let artifact = match &self.artifact {
            Some(name) => name.clone(),
            None => infer_artifact_name(&source)?,
        };

        let spec = BuildSpec::new(environment, source, artifact)
            .with_workdir(
                self.workdir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKDIR)),
            )
            .with_compile_timeout(self.compile_timeout_secs.unwrap_or(0));
        spec.validate()?;
        Ok(spec)
    }
}

/// Values supplied on the command line.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub environment: Option<String>,
    pub source: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
    pub artifact: Option<String>,
    pub compile_timeout_secs: Option<u64>,
    pub registry: Option<PathBuf>,
    pub store: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("berth"))
        .unwrap_or_else(|| PathBuf::from(FALLBACK_DATA_DIR))
}
