//! Connectivity probe backed by the `adb` command-line tool.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandRunner, CommandStatus};
use crate::error::ProbeError;
use crate::probe::{ConnectivityProbe, OutputSink, ProbeDevice, ProbeEvent};
use crate::state::ConnectivityState;

const CANCEL_POLL: Duration = Duration::from_millis(200);
const EVENT_BUFFER: usize = 64;

pub struct AdbBridge {
    adb_path: String,
    runner: Arc<dyn CommandRunner>,
    list_timeout: Duration,
    poll_interval: Duration,
    watcher: StdMutex<Option<CancellationToken>>,
}

impl AdbBridge {
    pub fn new(adb_path: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            adb_path: adb_path.into(),
            runner,
            list_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            watcher: StdMutex::new(None),
        }
    }

    /// How often `adb devices` is polled to produce presence events.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_list_timeout(mut self, timeout: Duration) -> Self {
        self.list_timeout = timeout;
        self
    }
}

async fn list_with(
    runner: &dyn CommandRunner,
    adb_path: &str,
    timeout: Duration,
) -> Result<Vec<ProbeDevice>, ProbeError> {
    let result = runner.run_timed_command(timeout, &[adb_path, "devices"]).await;
    match result.status {
        CommandStatus::Success => Ok(parse_device_list(&result.stdout)),
        CommandStatus::TimedOut => Err(ProbeError::Timeout(timeout)),
        CommandStatus::Failed | CommandStatus::Exception => Err(ProbeError::Io(format!(
            "adb devices failed: {}",
            result.stderr.trim()
        ))),
    }
}

/// Parse `adb devices` output; header and daemon chatter are skipped.
pub fn parse_device_list(output: &str) -> Vec<ProbeDevice> {
    output
        .lines()
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            let state = match fields.next()? {
                "device" => ConnectivityState::Online,
                "recovery" => ConnectivityState::Recovery,
                "bootloader" => ConnectivityState::Fastboot,
                _ => ConnectivityState::NotAvailable,
            };
            Some(ProbeDevice::new(serial, state))
        })
        .collect()
}

/// Events that turn `previous` into `current`.
pub fn diff_devices(
    previous: &HashMap<String, ConnectivityState>,
    current: &[ProbeDevice],
) -> Vec<ProbeEvent> {
    let mut events = Vec::new();
    for device in current {
        match previous.get(&device.serial) {
            None => events.push(ProbeEvent::Connected(device.clone())),
            Some(state) if *state != device.state => {
                events.push(ProbeEvent::StateChanged(device.clone()))
            }
            Some(_) => {}
        }
    }
    for serial in previous.keys() {
        if !current.iter().any(|d| &d.serial == serial) {
            events.push(ProbeEvent::Disconnected(serial.clone()));
        }
    }
    events
}

fn transport_rejection(stderr: &str) -> Option<String> {
    let stderr = stderr.trim();
    let rejected = stderr.contains("device offline")
        || stderr.contains("not found")
        || stderr.contains("unauthorized")
        || stderr.contains("no devices/emulators found");
    rejected.then(|| stderr.to_string())
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl ConnectivityProbe for AdbBridge {
    async fn list_devices(&self) -> Result<Vec<ProbeDevice>, ProbeError> {
        list_with(self.runner.as_ref(), &self.adb_path, self.list_timeout).await
    }

    async fn execute_shell_command(
        &self,
        serial: &str,
        command: &str,
        sink: &dyn OutputSink,
        timeout: Option<Duration>,
    ) -> Result<(), ProbeError> {
        let mut child = Command::new(&self.adb_path)
            .args(["-s", serial, "shell", command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProbeError::Io("stdout not captured".to_string()))?;
        let stderr_task = child.stderr.take().map(|mut err| {
            tokio::spawn(async move {
                let mut text = String::new();
                let _ = err.read_to_string(&mut text).await;
                text
            })
        });

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut buf = vec![0u8; 8192];
        loop {
            if sink.is_cancelled() {
                tracing::debug!(serial = %serial, command = %command, "Shell command cancelled");
                let _ = child.kill().await;
                sink.flush();
                return Ok(());
            }
            let read = tokio::select! {
                r = stdout.read(&mut buf) => r?,
                _ = tokio::time::sleep(CANCEL_POLL) => continue,
                _ = deadline_reached(deadline) => {
                    let _ = child.kill().await;
                    return Err(ProbeError::Timeout(timeout.unwrap_or_default()));
                }
            };
            if read == 0 {
                break;
            }
            sink.add_output(&buf[..read]);
        }
        sink.flush();

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if let Some(reason) = transport_rejection(&stderr) {
            return Err(ProbeError::TransportRejected(reason));
        }
        if !status.success() {
            tracing::debug!(serial = %serial, command = %command, ?status, "Shell command exited non-zero");
        }
        Ok(())
    }

    fn subscribe(&self) -> mpsc::Receiver<ProbeEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        if let Some(previous) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(cancel.clone())
        {
            previous.cancel();
        }

        let runner = Arc::clone(&self.runner);
        let adb_path = self.adb_path.clone();
        let timeout = self.list_timeout;
        let interval = self.poll_interval;
        tokio::spawn(async move {
            let mut known: HashMap<String, ConnectivityState> = HashMap::new();
            loop {
                match list_with(runner.as_ref(), &adb_path, timeout).await {
                    Ok(devices) => {
                        for event in diff_devices(&known, &devices) {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        known = devices.into_iter().map(|d| (d.serial, d.state)).collect();
                    }
                    Err(e) => tracing::warn!(error = %e, "Device listing failed"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => break,
                }
            }
            tracing::debug!("Device watcher stopped");
        });
        rx
    }

    async fn terminate(&self) {
        if let Some(cancel) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            cancel.cancel();
        }
    }
}
