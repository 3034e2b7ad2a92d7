//! Toolchain availability checks

use crate::error::EnvError;
use crate::manifest::EnvironmentManifest;
use crate::Result;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Locate the build executable of `manifest`'s toolchain the way the build
/// will start it.
///
/// Absolute programs are checked as-is. Bare names are looked up on the
/// manifest's `PATH` when it sets one, else on the host `PATH`. Relative
/// paths with a separator cannot be checked before the working location
/// exists and are rejected.
pub fn locate_build_executable(manifest: &EnvironmentManifest) -> Result<PathBuf> {
    let program = manifest
        .toolchain
        .build
        .first()
        .ok_or_else(|| EnvError::ToolchainNotFound("<empty build command>".to_string()))?;

    let found = if has_separator(program) {
        let path = PathBuf::from(program);
        (path.is_absolute() && is_executable(&path)).then_some(path)
    } else {
        let search = manifest
            .env
            .get("PATH")
            .map(OsString::from)
            .or_else(|| std::env::var_os("PATH"));
        search.and_then(|paths| find_on_path(program, &paths))
    };

    match found {
        Some(path) => {
            debug!(program = %program, path = %path.display(), "Toolchain executable found");
            Ok(path)
        }
        None => Err(EnvError::ToolchainNotFound(program.clone())),
    }
}

/// Whether `program` names a path rather than a bare command.
pub(crate) fn has_separator(program: &str) -> bool {
    program.contains(std::path::MAIN_SEPARATOR) || program.contains('/')
}

fn find_on_path(program: &str, paths: &OsString) -> Option<PathBuf> {
    std::env::split_paths(paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

/// Whether `path` is a regular file with an executable bit set.
pub fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
