//! In-memory probe and process runner for unit tests.

use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::command::{CommandResult, CommandRunner, CommandStatus};
use crate::config::{FleetConfig, MonitorConfig, RecoveryConfig};
use crate::error::ProbeError;
use crate::probe::{ConnectivityProbe, OutputSink, ProbeDevice, ProbeEvent};
use crate::state::ConnectivityState;

pub(crate) enum ShellReply {
    Output(String),
    Error(ProbeError),
    /// Emit the text once, then keep running until the sink is cancelled
    Stream(String),
    /// Never answer; fails with a timeout when one is given
    Hang,
    /// Answer after a delay, or time out first if the timeout is shorter
    Delayed(Duration, String),
}

type ShellHandler = Box<dyn FnMut(&str, &str) -> ShellReply + Send>;
type RunHandler = Box<dyn FnMut(&[&str]) -> CommandResult + Send>;

pub(crate) struct FakeProbe {
    devices: StdMutex<Vec<ProbeDevice>>,
    shell: StdMutex<ShellHandler>,
    shell_calls: AtomicUsize,
    events: StdMutex<Option<mpsc::Sender<ProbeEvent>>>,
    list_error: StdMutex<Option<ProbeError>>,
}

impl FakeProbe {
    /// Every shell command answers `1`, which satisfies the responsiveness
    /// and readiness checks.
    pub fn new() -> Self {
        Self {
            devices: StdMutex::new(Vec::new()),
            shell: StdMutex::new(Box::new(|_, cmd| ShellReply::Output(default_reply(cmd)))),
            shell_calls: AtomicUsize::new(0),
            events: StdMutex::new(None),
            list_error: StdMutex::new(None),
        }
    }

    /// Make `list_devices` fail with `error` until cleared with `None`.
    pub fn fail_listing(&self, error: Option<ProbeError>) {
        *self.list_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    pub fn with_device(self, serial: &str, state: ConnectivityState) -> Self {
        self.set_device(serial, state);
        self
    }

    pub fn set_device(&self, serial: &str, state: ConnectivityState) {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        devices.retain(|d| d.serial != serial);
        devices.push(ProbeDevice::new(serial, state));
    }

    pub fn remove_device(&self, serial: &str) {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|d| d.serial != serial);
    }

    pub fn on_shell(&self, handler: impl FnMut(&str, &str) -> ShellReply + Send + 'static) {
        *self.shell.lock().unwrap_or_else(PoisonError::into_inner) = Box::new(handler);
    }

    pub fn shell_calls(&self) -> usize {
        self.shell_calls.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: ProbeEvent) {
        if let Some(tx) = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = tx.try_send(event);
        }
    }
}

pub(crate) fn default_reply(command: &str) -> String {
    if command.starts_with("pm ") {
        "package:/system/framework/framework-res.apk\n".to_string()
    } else if command.contains("EXTERNAL_STORAGE") {
        "/sdcard\n".to_string()
    } else if command.starts_with("ls ") {
        "Android\nDCIM\n".to_string()
    } else {
        "1\n".to_string()
    }
}

#[async_trait]
impl ConnectivityProbe for FakeProbe {
    async fn list_devices(&self) -> Result<Vec<ProbeDevice>, ProbeError> {
        if let Some(error) = self
            .list_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(error);
        }
        Ok(self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn execute_shell_command(
        &self,
        serial: &str,
        command: &str,
        sink: &dyn OutputSink,
        timeout: Option<Duration>,
    ) -> Result<(), ProbeError> {
        self.shell_calls.fetch_add(1, Ordering::SeqCst);
        let reply = {
            let mut handler = self.shell.lock().unwrap_or_else(PoisonError::into_inner);
            handler(serial, command)
        };
        tokio::task::yield_now().await;
        match reply {
            ShellReply::Output(text) => {
                sink.add_output(text.as_bytes());
                Ok(())
            }
            ShellReply::Error(e) => Err(e),
            ShellReply::Stream(text) => {
                sink.add_output(text.as_bytes());
                while !sink.is_cancelled() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Ok(())
            }
            ShellReply::Delayed(delay, text) => match timeout {
                Some(t) if t < delay => {
                    tokio::time::sleep(t).await;
                    Err(ProbeError::Timeout(t))
                }
                _ => {
                    tokio::time::sleep(delay).await;
                    sink.add_output(text.as_bytes());
                    Ok(())
                }
            },
            ShellReply::Hang => match timeout {
                Some(t) => {
                    tokio::time::sleep(t).await;
                    Err(ProbeError::Timeout(t))
                }
                None => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            },
        }
    }

    fn subscribe(&self) -> mpsc::Receiver<ProbeEvent> {
        let (tx, rx) = mpsc::channel(64);
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    async fn terminate(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

pub(crate) struct FakeRunner {
    handler: StdMutex<RunHandler>,
    calls: StdMutex<Vec<Vec<String>>>,
    timeouts: StdMutex<Vec<Duration>>,
}

impl FakeRunner {
    /// Every command fails until a handler is installed.
    pub fn new() -> Self {
        Self {
            handler: StdMutex::new(Box::new(|_| CommandResult::new(CommandStatus::Failed))),
            calls: StdMutex::new(Vec::new()),
            timeouts: StdMutex::new(Vec::new()),
        }
    }

    pub fn on_run(&self, handler: impl FnMut(&[&str]) -> CommandResult + Send + 'static) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Box::new(handler);
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deadline passed with each recorded invocation.
    pub fn timeouts(&self) -> Vec<Duration> {
        self.timeouts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded invocations whose argv contains `word`.
    pub fn count_with(&self, word: &str) -> usize {
        self.calls()
            .iter()
            .filter(|argv| argv.iter().any(|a| a == word))
            .count()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run_timed_command(&self, timeout: Duration, argv: &[&str]) -> CommandResult {
        self.timeouts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(timeout);
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(argv.iter().map(|a| a.to_string()).collect());
        let result = {
            let mut handler = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
            handler(argv)
        };
        tokio::task::yield_now().await;
        result
    }
}

/// Fleet configuration with short deadlines and no placeholders.
pub(crate) fn test_config() -> FleetConfig {
    FleetConfig::bare()
        .with_monitor(
            MonitorConfig::default()
                .with_poll(Duration::from_millis(100), Duration::from_secs(1))
                .with_online_timeout(Duration::from_secs(2))
                .with_available_timeout(Duration::from_secs(5))
                .with_command_timeout(Duration::from_secs(1)),
        )
        .with_recovery(
            RecoveryConfig::default()
                .with_waits(
                    Duration::from_secs(1),
                    Duration::from_secs(1),
                    Duration::from_secs(2),
                )
                .with_reconnect(2, Duration::from_secs(1))
                .with_max_iterations(1)
                .with_retry_delay(Duration::ZERO),
        )
        .with_availability_check_timeout(Duration::from_secs(2))
        .with_fastboot_poll_interval(Duration::from_secs(1))
        .with_tcp_connect(2, Duration::from_secs(1))
}
