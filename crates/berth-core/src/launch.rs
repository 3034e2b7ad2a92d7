//! Start: run an image's default command.
//!
//! The program runs with the image's working location as its current
//! directory, stdio inherited from the caller and the environment variables
//! recorded in the image manifest. Its exit status becomes the launch's exit
//! code unchanged.

use crate::error::LaunchError;
use crate::image::Image;
use crate::obs;
use crate::runner::exit_code_of;
use berth_env::is_executable;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::debug;

/// How a launched program ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutcome {
    /// Exit code to report (128 + signal number for signalled processes).
    pub exit_code: i32,

    /// Terminating signal, if any.
    pub signal: Option<i32>,

    pub duration_ms: u64,
}

/// Resolve the argv to run: the image's default command, or `override_argv`
/// when given and non-empty. Absolute programs are mapped into the image.
pub fn resolve_command(
    image: &Image,
    override_argv: Option<&[String]>,
) -> Result<(PathBuf, Vec<String>), LaunchError> {
    let argv = match override_argv {
        Some(argv) if !argv.is_empty() => argv.to_vec(),
        _ => image.manifest.default_command.argv(),
    };
    let (program, args) = argv.split_first().ok_or(LaunchError::EmptyCommand)?;
    if program.is_empty() {
        return Err(LaunchError::EmptyCommand);
    }

    let program = Path::new(program);
    let host = if program.is_absolute() {
        image.host_path(program)
    } else if program.components().count() > 1 {
        image.working_dir().join(program)
    } else {
        // Bare names are looked up on PATH by the OS.
        program.to_path_buf()
    };
    Ok((host, args.to_vec()))
}

/// Run the image's default command (or an override) to completion.
pub async fn launch(
    image: &Image,
    override_argv: Option<&[String]>,
) -> Result<LaunchOutcome, LaunchError> {
    let (program, args) = resolve_command(image, override_argv)?;

    if program.is_absolute() {
        if !program.exists() {
            return Err(LaunchError::MissingArtifact(program));
        }
        if !is_executable(&program) {
            return Err(LaunchError::NotExecutable(program));
        }
    }

    obs::emit_launch_started(image.id().as_str(), &program.display().to_string());
    debug!(cwd = %image.working_dir().display(), args = ?args, "Spawning program");

    let start = Instant::now();
    let status = Command::new(&program)
        .args(&args)
        .current_dir(image.working_dir())
        .envs(&image.manifest.env)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|source| LaunchError::Spawn {
            program: program.clone(),
            source,
        })?;

    let (exit_code, signal) = exit_code_of(status);
    let duration_ms = start.elapsed().as_millis() as u64;
    obs::emit_launch_exited(image.id().as_str(), exit_code, duration_ms);

    Ok(LaunchOutcome {
        exit_code,
        signal,
        duration_ms,
    })
}
