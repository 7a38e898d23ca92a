//! Discovery of devices sitting in the bootloader.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::command::{CommandRunner, CommandStatus};

pub struct FastbootHelper {
    runner: Arc<dyn CommandRunner>,
    path: PathBuf,
    timeout: Duration,
}

impl FastbootHelper {
    pub fn new(runner: Arc<dyn CommandRunner>, path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            runner,
            path: path.into(),
            timeout,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Whether the fastboot tool can be run at all.
    pub async fn is_available(&self) -> bool {
        let path = self.path.to_string_lossy();
        let result = self
            .runner
            .run_timed_command(self.timeout, &[path.as_ref(), "help"])
            .await;
        match result.status {
            CommandStatus::Success => true,
            // older versions exit non-zero after printing usage
            CommandStatus::Failed => {
                result.stderr.contains("usage: fastboot") || result.stdout.contains("usage: fastboot")
            }
            CommandStatus::Exception | CommandStatus::TimedOut => {
                tracing::debug!(path = %path, status = ?result.status, "fastboot not runnable");
                false
            }
        }
    }

    /// Serials currently listed by `fastboot devices`, or `None` if the scan failed.
    pub async fn get_devices(&self) -> Option<HashSet<String>> {
        let path = self.path.to_string_lossy();
        let result = self
            .runner
            .run_timed_command(self.timeout, &[path.as_ref(), "devices"])
            .await;
        if !result.is_success() {
            tracing::warn!(status = ?result.status, stderr = %result.stderr.trim(), "fastboot devices failed");
            return None;
        }
        Some(parse_devices(&result.stdout))
    }
}

/// Parse `serial<whitespace>fastboot` rows; anything else is skipped.
pub fn parse_devices(output: &str) -> HashSet<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next(), fields.next()) {
                (Some(serial), Some("fastboot"), None) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandResult;
    use crate::testing::FakeRunner;

    #[test]
    fn parses_fastboot_rows() {
        let output = "04035EEB0B01F01C\tfastboot\nHT99PP800024    fastboot\n\n???????????? fastboot extra\nemulator-5554 device\n";
        let serials = parse_devices(output);
        assert_eq!(serials.len(), 2);
        assert!(serials.contains("04035EEB0B01F01C"));
        assert!(serials.contains("HT99PP800024"));
    }

    #[test]
    fn empty_output_has_no_devices() {
        assert!(parse_devices("").is_empty());
    }

    #[tokio::test]
    async fn availability_accepts_usage_on_failure() {
        let runner = Arc::new(FakeRunner::new());
        runner.on_run(|_| CommandResult::new(CommandStatus::Failed).with_stderr("usage: fastboot [ <option> ]"));
        let helper = FastbootHelper::new(runner.clone(), "fastboot", Duration::from_secs(1));
        assert!(helper.is_available().await);

        runner.on_run(|_| CommandResult::new(CommandStatus::Exception));
        assert!(!helper.is_available().await);
    }

    #[tokio::test]
    async fn get_devices_runs_devices_subcommand() {
        let runner = Arc::new(FakeRunner::new());
        runner.on_run(|_| CommandResult::new(CommandStatus::Success).with_stdout("S1\tfastboot\n"));
        let helper = FastbootHelper::new(runner.clone(), "/opt/fastboot", Duration::from_secs(1));
        let devices = helper.get_devices().await.unwrap();
        assert!(devices.contains("S1"));
        assert_eq!(runner.calls(), vec![vec!["/opt/fastboot".to_string(), "devices".to_string()]]);

        runner.on_run(|_| CommandResult::new(CommandStatus::TimedOut));
        assert!(helper.get_devices().await.is_none());
    }
}
