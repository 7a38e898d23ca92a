//! Process-execution seam for the bridge and fastboot command-line tools.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    Failed,
    /// The process could not be started or waited on
    Exception,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn new(status: CommandStatus) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }
}

/// Runs external tools with a deadline.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run_timed_command(&self, timeout: Duration, argv: &[&str]) -> CommandResult;
}

/// Runs commands as child processes; the child is killed if the deadline passes.
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run_timed_command(&self, timeout: Duration, argv: &[&str]) -> CommandResult {
        let Some((program, args)) = argv.split_first() else {
            return CommandResult::new(CommandStatus::Exception).with_stderr("empty command line");
        };

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                tracing::debug!(program = %program, error = %e, "Failed to spawn command");
                return CommandResult::new(CommandStatus::Exception).with_stderr(e.to_string());
            }
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let status = if output.status.success() {
                    CommandStatus::Success
                } else {
                    CommandStatus::Failed
                };
                CommandResult::new(status)
                    .with_stdout(String::from_utf8_lossy(&output.stdout))
                    .with_stderr(String::from_utf8_lossy(&output.stderr))
            }
            Ok(Err(e)) => CommandResult::new(CommandStatus::Exception).with_stderr(e.to_string()),
            Err(_) => {
                tracing::warn!(program = %program, ?timeout, "Command timed out");
                CommandResult::new(CommandStatus::TimedOut)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_on_success() {
        let result = ProcessRunner
            .run_timed_command(Duration::from_secs(5), &["echo", "hello"])
            .await;
        assert_eq!(result.status, CommandStatus::Success);
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed() {
        let result = ProcessRunner
            .run_timed_command(Duration::from_secs(5), &["sh", "-c", "echo oops >&2; exit 3"])
            .await;
        assert_eq!(result.status, CommandStatus::Failed);
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn missing_program_is_exception() {
        let result = ProcessRunner
            .run_timed_command(Duration::from_secs(5), &["definitely-not-a-real-tool-xyz"])
            .await;
        assert_eq!(result.status, CommandStatus::Exception);
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let result = ProcessRunner
            .run_timed_command(Duration::from_millis(50), &["sleep", "5"])
            .await;
        assert_eq!(result.status, CommandStatus::TimedOut);
    }

    #[tokio::test]
    async fn empty_argv_is_exception() {
        let result = ProcessRunner
            .run_timed_command(Duration::from_secs(1), &[])
            .await;
        assert_eq!(result.status, CommandStatus::Exception);
    }
}
