//! Error taxonomy for the build-and-launch pipeline.
//!
//! Every error is terminal: the pipeline fails closed and never retries.

use crate::stage::Stage;
use berth_env::EnvError;
use std::path::PathBuf;

/// Exit code used when the launched program does not exist.
pub const EXIT_NOT_FOUND: i32 = 127;

/// Exit code used when the launched program cannot be executed.
pub const EXIT_NOT_EXECUTABLE: i32 = 126;

/// Errors produced while building an image.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("provisioning failed: {0}")]
    Provision(#[from] EnvError),

    #[error("source tree not found: {0}")]
    SourceNotFound(PathBuf),

    #[error("failed to ingest {path}: {source}")]
    Ingest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported file type in source tree: {0}")]
    UnsupportedFileType(PathBuf),

    #[error("working location {workspace} lies inside source tree {source_tree}")]
    WorkspaceInsideSource {
        workspace: PathBuf,
        source_tree: PathBuf,
    },

    #[error("compilation failed with exit code {exit_code}")]
    Compile { exit_code: i32, diagnostics: String },

    #[error("compilation timed out after {0} seconds")]
    CompileTimeout(u64),

    #[error("failed to start toolchain '{program}': {source}")]
    ToolchainSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("toolchain succeeded but produced no artifact at {0}")]
    ArtifactNotProduced(PathBuf),

    #[error("artifact missing at bind time: {0}")]
    MissingArtifact(PathBuf),

    #[error("artifact is not executable: {0}")]
    NotExecutable(PathBuf),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("image reference '{reference}' is ambiguous ({count} matches)")]
    AmbiguousImage { reference: String, count: usize },

    #[error("build not found: {0}")]
    BuildNotFound(String),

    #[error("invalid build spec: {0}")]
    InvalidSpec(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Build stage this error is attributed to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Provision(_) => Some(Stage::Provision),
            PipelineError::SourceNotFound(_)
            | PipelineError::Ingest { .. }
            | PipelineError::UnsupportedFileType(_)
            | PipelineError::WorkspaceInsideSource { .. } => Some(Stage::Ingest),
            PipelineError::Compile { .. }
            | PipelineError::CompileTimeout(_)
            | PipelineError::ToolchainSpawn { .. }
            | PipelineError::ArtifactNotProduced(_) => Some(Stage::Compile),
            PipelineError::MissingArtifact(_) | PipelineError::NotExecutable(_) => {
                Some(Stage::Bind)
            }
            _ => None,
        }
    }

    /// Process exit code to report for this error.
    ///
    /// Compile failures propagate the toolchain's own exit code, or
    /// `128 + signal` when the toolchain was killed.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Compile { exit_code, .. } if *exit_code > 0 => *exit_code,
            _ => 1,
        }
    }
}

/// Errors produced when starting an image's default command.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("executable not found: {0}")]
    MissingArtifact(PathBuf),

    #[error("permission denied: {0} is not executable")]
    NotExecutable(PathBuf),

    #[error("empty command")]
    EmptyCommand,

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LaunchError {
    /// Exit code a container runtime would report for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchError::MissingArtifact(_) | LaunchError::EmptyCommand => EXIT_NOT_FOUND,
            LaunchError::NotExecutable(_) => EXIT_NOT_EXECUTABLE,
            LaunchError::Spawn { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => EXIT_NOT_FOUND,
                _ => EXIT_NOT_EXECUTABLE,
            },
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
