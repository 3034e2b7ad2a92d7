//! berth-env: pinned toolchain environments
//!
//! This crate provides the environment layer of berth. An environment image
//! is an immutable toolchain snapshot described by a manifest and selected by
//! a pinned reference (`name:tag`, `name@sha256:<digest>` or both).
//!
//! Resolution never falls back: a reference either selects exactly one
//! manifest whose content digest matches, or it fails.

pub mod error;
pub mod fakes;
pub mod manifest;
pub mod reference;
pub mod registry;
pub mod toolchain;

pub use error::EnvError;
pub use manifest::{EnvironmentManifest, ManifestDigest, Toolchain};
pub use reference::EnvironmentRef;
pub use registry::{Environment, EnvironmentResolver, LocalRegistry};
pub use toolchain::{is_executable, locate_build_executable};

/// Result type for environment operations
pub type Result<T> = std::result::Result<T, EnvError>;
