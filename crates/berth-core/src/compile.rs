//! Compile stage: run the environment's release build over the working location.

use crate::error::{PipelineError, Result};
use crate::image::Workspace;
use crate::runner::{CommandOutput, CommandRunner, CommandSpec, RunError};
use berth_env::Environment;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// The artifact a successful compile produced.
#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    /// Absolute path inside the image.
    pub in_image: PathBuf,

    /// Path on the host, inside the staging workspace.
    pub host: PathBuf,

    /// Captured toolchain output.
    pub output: CommandOutput,
}

/// In-image path where `environment` places `artifact`.
pub fn artifact_path(environment: &Environment, workdir: &Path, artifact: &str) -> PathBuf {
    workdir
        .join(&environment.manifest.toolchain.output_dir)
        .join(artifact)
}

/// Build the working location and return the produced artifact.
///
/// Fails if the toolchain exits non-zero, or exits zero without producing
/// the artifact at its output path.
pub async fn compile(
    environment: &Environment,
    workspace: &Workspace,
    artifact: &str,
    timeout_secs: u64,
) -> Result<CompiledArtifact> {
    let argv = environment.manifest.toolchain.build.clone();
    let program = argv.first().cloned().unwrap_or_default();

    info!(command = ?argv, cwd = %workspace.working_dir().display(), "Compiling");

    let spec = CommandSpec {
        argv,
        cwd: workspace.working_dir(),
        env: environment.manifest.env.clone(),
        timeout_secs,
    };

    let output = CommandRunner::run(&spec).await.map_err(|e| match e {
        RunError::Timeout(secs) => PipelineError::CompileTimeout(secs),
        RunError::Spawn(source) => PipelineError::ToolchainSpawn {
            program: program.clone(),
            source,
        },
        RunError::EmptyCommand => PipelineError::ToolchainSpawn {
            program: program.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty build command"),
        },
    })?;

    if !output.passed() {
        warn!(exit_code = output.exit_code, signal = ?output.signal, "Toolchain reported failure");
        return Err(PipelineError::Compile {
            exit_code: output.exit_code,
            diagnostics: output.diagnostics().to_string(),
        });
    }

    let in_image = artifact_path(environment, workspace.workdir(), artifact);
    let host = workspace.host_path(&in_image);
    if !host.is_file() {
        return Err(PipelineError::ArtifactNotProduced(in_image));
    }

    info!(artifact = %in_image.display(), duration_ms = output.duration_ms, "Compile finished");
    Ok(CompiledArtifact {
        in_image,
        host,
        output,
    })
}
