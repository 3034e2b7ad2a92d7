//! Artifact name inference from a Cargo source tree.

use crate::error::{PipelineError, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Deserialize)]
struct CargoManifest {
    package: Option<Package>,
    #[serde(default)]
    bin: Vec<BinTarget>,
}

#[derive(Deserialize)]
struct Package {
    name: String,
}

#[derive(Deserialize)]
struct BinTarget {
    name: Option<String>,
}

/// Name of the binary `cargo build --release` produces for `source`.
///
/// A single named `[[bin]]` target wins; otherwise the package name is used.
/// Several binaries are ambiguous and must be configured explicitly.
pub fn infer_artifact_name(source: &Path) -> Result<String> {
    let path = source.join("Cargo.toml");
    let content = std::fs::read_to_string(&path).map_err(|e| {
        PipelineError::Config(format!(
            "cannot infer artifact name from {}: {} (set `artifact` explicitly)",
            path.display(),
            e
        ))
    })?;
    let manifest: CargoManifest = toml::from_str(&content)
        .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;

    let named: Vec<&str> = manifest
        .bin
        .iter()
        .filter_map(|b| b.name.as_deref())
        .collect();
    match named.as_slice() {
        [single] => return Ok(single.to_string()),
        [] => {}
        _ => {
            return Err(PipelineError::Config(format!(
                "{} declares {} binaries; set `artifact` explicitly",
                path.display(),
                named.len()
            )))
        }
    }

    manifest.package.map(|p| p.name).ok_or_else(|| {
        PipelineError::Config(format!(
            "{} has no [package] name; set `artifact` explicitly",
            path.display()
        ))
    })
}
