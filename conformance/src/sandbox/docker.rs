//! Bounded wrapper around the Docker-compatible CLI.
//!
//! Every invocation honors a timeout; a missing CLI is a non-recoverable
//! configuration error surfaced as [`PipelineError::SandboxUnavailable`].

use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};

/// Captured output of one CLI invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Stderr, falling back to stdout, for error reporting.
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        self.stdout.trim().to_string()
    }
}

/// Docker CLI runner with a per-command timeout.
#[derive(Debug, Clone)]
pub struct DockerCli {
    timeout: Duration,
}

impl DockerCli {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run `docker <args>`. Non-zero exit codes are returned as output, not
    /// errors; only a missing binary, spawn failure, or timeout errors out.
    pub async fn run(&self, args: &[&str]) -> PipelineResult<CommandOutput> {
        debug!(args = ?args, "docker command");
        let result = tokio::time::timeout(
            self.timeout,
            Command::new("docker").args(args).kill_on_drop(true).output(),
        )
        .await;

        let output = match result {
            Err(_) => {
                return Err(PipelineError::sandbox(format!(
                    "docker {} timed out after {:?}",
                    args.first().copied().unwrap_or(""),
                    self.timeout
                )))
            }
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::sandbox(
                    "docker CLI is not installed or not on PATH",
                ))
            }
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(output)) => output,
        };

        Ok(CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// `docker rm -f <name>`, ignoring failures (the container may not exist).
    pub async fn force_remove(&self, container_name: &str) {
        let _ = self.run(&["rm", "-f", container_name]).await;
    }

    /// `(exists, running)` for a container name.
    pub async fn container_state(&self, container_name: &str) -> (bool, bool) {
        match self
            .run(&["inspect", "-f", "{{.State.Running}}", container_name])
            .await
        {
            Ok(output) if output.success => {
                (true, output.stdout.trim().eq_ignore_ascii_case("true"))
            }
            _ => (false, false),
        }
    }

    /// Last `tail` lines of a container's logs (stdout + stderr combined).
    pub async fn logs_tail(&self, container_name: &str, tail: usize) -> String {
        match self
            .run(&["logs", "--tail", &tail.to_string(), container_name])
            .await
        {
            Ok(output) => {
                let mut text = output.stdout;
                if !output.stderr.is_empty() {
                    text.push('\n');
                    text.push_str(&output.stderr);
                }
                text
            }
            Err(_) => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_text_prefers_stderr() {
        let output = CommandOutput {
            success: false,
            exit_code: Some(1),
            stdout: "out".into(),
            stderr: "boom".into(),
        };
        assert_eq!(output.error_text(), "boom");

        let quiet = CommandOutput {
            success: false,
            exit_code: Some(1),
            stdout: "only stdout".into(),
            stderr: "  ".into(),
        };
        assert_eq!(quiet.error_text(), "only stdout");
    }
}
