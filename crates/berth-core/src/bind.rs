//! Bind stage: record the artifact path as the image's default command.

use crate::compile::CompiledArtifact;
use crate::error::{PipelineError, Result};
use crate::image::{DefaultCommand, Workspace};
use berth_env::is_executable;
use tracing::info;

/// Verify the compiled artifact is still in place and bind it.
///
/// The artifact is re-checked here rather than trusted from the compile
/// stage, so a binary that disappeared in between is never bound.
pub fn bind(workspace: &Workspace, compiled: &CompiledArtifact) -> Result<DefaultCommand> {
    let host = workspace.host_path(&compiled.in_image);

    if !host.exists() {
        return Err(PipelineError::MissingArtifact(compiled.in_image.clone()));
    }
    if !is_executable(&host) {
        return Err(PipelineError::NotExecutable(compiled.in_image.clone()));
    }

    info!(program = %compiled.in_image.display(), "Default command bound");
    Ok(DefaultCommand::new(compiled.in_image.clone()))
}
