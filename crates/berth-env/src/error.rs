//! Error types for berth-env

use thiserror::Error;

/// Errors that can occur while provisioning an environment
#[derive(Error, Debug)]
pub enum EnvError {
    /// Reference string could not be parsed
    #[error("invalid environment reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Reference names neither a tag nor a digest
    #[error("environment reference '{0}' is not pinned (add a :tag or @sha256:digest)")]
    Unpinned(String),

    /// No manifest matches the reference
    #[error("environment not found: {0}")]
    NotFound(String),

    /// Manifest exists but its content digest differs from the pinned one
    #[error("environment digest mismatch for {reference}: expected {expected}, got {actual}")]
    DigestMismatch {
        reference: String,
        expected: String,
        actual: String,
    },

    /// Manifest file is malformed or fails validation
    #[error("invalid environment manifest {path}: {reason}")]
    InvalidManifest { path: String, reason: String },

    /// Build toolchain executable is not available
    #[error("toolchain executable not found: {0}")]
    ToolchainNotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
