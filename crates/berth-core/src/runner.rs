//! Toolchain command execution.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::Command;

/// A command to run inside a working directory.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Argv (first element is the executable).
    pub argv: Vec<String>,

    pub cwd: PathBuf,

    /// Variables set on top of the inherited environment.
    pub env: BTreeMap<String, String>,

    /// Timeout in seconds (0 = none).
    pub timeout_secs: u64,
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code (128 + signal number if the process was killed by a signal).
    pub exit_code: i32,

    /// Terminating signal, if any.
    pub signal: Option<i32>,

    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub success: bool,
}

impl CommandOutput {
    /// Whether the command exited with code 0.
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// Toolchain diagnostics: stderr, or stdout when stderr is empty.
    pub fn diagnostics(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// Why a command could not produce an output.
#[derive(Debug)]
pub enum RunError {
    EmptyCommand,
    Spawn(std::io::Error),
    Timeout(u64),
}

/// Runs toolchain commands and captures their output.
pub struct CommandRunner;

impl CommandRunner {
    pub async fn run(spec: &CommandSpec) -> Result<CommandOutput, RunError> {
        let start = Instant::now();

        let (exe, args) = spec.argv.split_first().ok_or(RunError::EmptyCommand)?;

        let child = Command::new(exe)
            .args(args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(RunError::Spawn)?;

        let output = if spec.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(spec.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| RunError::Timeout(spec.timeout_secs))?
            .map_err(RunError::Spawn)?
        } else {
            child.wait_with_output().await.map_err(RunError::Spawn)?
        };

        let (exit_code, signal) = exit_code_of(output.status);
        Ok(CommandOutput {
            exit_code,
            signal,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
            success: output.status.success(),
        })
    }
}

/// Exit code and terminating signal of a finished process.
///
/// Signalled processes report `128 + signal`, the way shells do.
#[cfg(unix)]
pub(crate) fn exit_code_of(status: ExitStatus) -> (i32, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => (code, None),
        (None, Some(signal)) => (128 + signal, Some(signal)),
        (None, None) => (1, None),
    }
}

#[cfg(not(unix))]
pub(crate) fn exit_code_of(status: ExitStatus) -> (i32, Option<i32>) {
    (status.code().unwrap_or(1), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout_secs: u64) -> CommandSpec {
        CommandSpec {
            argv: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
            env: BTreeMap::new(),
            timeout_secs,
        }
    }

    #[tokio::test]
    async fn test_run_simple_command() {
        let out = CommandRunner::run(&sh("echo hello", 60)).await.unwrap();
        assert!(out.passed());
        assert!(out.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_run_failing_command_keeps_exit_code() {
        let out = CommandRunner::run(&sh("echo 'error: boom' >&2; exit 101", 0))
            .await
            .unwrap();
        assert!(!out.passed());
        assert_eq!(out.exit_code, 101);
        assert!(out.diagnostics().contains("boom"));
    }

    #[tokio::test]
    async fn test_diagnostics_fall_back_to_stdout() {
        let out = CommandRunner::run(&sh("echo 'error on stdout'; exit 2", 0))
            .await
            .unwrap();
        assert!(out.diagnostics().contains("stdout"));
    }

    #[tokio::test]
    async fn test_env_and_cwd_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = sh("echo \"$BERTH_TEST_VAR\" > marker", 0);
        spec.cwd = dir.path().to_path_buf();
        spec.env
            .insert("BERTH_TEST_VAR".to_string(), "release".to_string());

        let out = CommandRunner::run(&spec).await.unwrap();
        assert!(out.passed());
        let marker = std::fs::read_to_string(dir.path().join("marker")).unwrap();
        assert_eq!(marker.trim(), "release");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_signal_killed_command_reports_128_plus_signal() {
        let out = CommandRunner::run(&sh("kill -KILL $$", 0)).await.unwrap();
        assert!(!out.passed());
        assert_eq!(out.exit_code, 137);
        assert_eq!(out.signal, Some(9));
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = CommandRunner::run(&sh("sleep 5", 1)).await.unwrap_err();
        assert!(matches!(err, RunError::Timeout(1)));
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let spec = CommandSpec {
            argv: vec!["/nonexistent-binary-that-does-not-exist".to_string()],
            cwd: std::env::temp_dir(),
            env: BTreeMap::new(),
            timeout_secs: 0,
        };
        assert!(matches!(
            CommandRunner::run(&spec).await,
            Err(RunError::Spawn(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_command() {
        let spec = CommandSpec {
            argv: vec![],
            cwd: std::env::temp_dir(),
            env: BTreeMap::new(),
            timeout_secs: 0,
        };
        assert!(matches!(
            CommandRunner::run(&spec).await,
            Err(RunError::EmptyCommand)
        ));
    }
}
