//! Recovery strategies.
//!
//! A strategy restores a device to a [`RecoveryLevel`] using its
//! [`DeviceStateMonitor`]. Strategies compose by wrapping: [`RetryingRecovery`]
//! repeats any inner strategy.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::command::CommandRunner;
use crate::config::RecoveryConfig;
use crate::error::DeviceError;
use crate::monitor::DeviceStateMonitor;
use crate::state::ConnectivityState;

const TOOL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryLevel {
    /// Visible and answering shell commands
    Online,
    /// Fully booted and usable
    Available,
}

#[async_trait]
pub trait DeviceRecovery: Send + Sync {
    async fn recover_device(
        &self,
        monitor: &DeviceStateMonitor,
        level: RecoveryLevel,
    ) -> Result<(), DeviceError>;

    async fn recover_bootloader(&self, monitor: &DeviceStateMonitor) -> Result<(), DeviceError> {
        if monitor
            .wait_for_device_bootloader(monitor.config().online_timeout)
            .await?
        {
            return Ok(());
        }
        Err(DeviceError::not_available(
            monitor.serial(),
            "device not found in bootloader",
        ))
    }
}

/// Waits for the device to come back on its own, rebooting out of the
/// bootloader if it is stuck there.
pub struct WaitDeviceRecovery {
    runner: Arc<dyn CommandRunner>,
    fastboot_path: PathBuf,
    config: RecoveryConfig,
}

impl WaitDeviceRecovery {
    pub fn new(runner: Arc<dyn CommandRunner>, fastboot_path: impl Into<PathBuf>, config: RecoveryConfig) -> Self {
        Self {
            runner,
            fastboot_path: fastboot_path.into(),
            config,
        }
    }
}

#[async_trait]
impl DeviceRecovery for WaitDeviceRecovery {
    async fn recover_device(
        &self,
        monitor: &DeviceStateMonitor,
        level: RecoveryLevel,
    ) -> Result<(), DeviceError> {
        let serial = monitor.serial();

        if monitor.state() == ConnectivityState::Fastboot && monitor.is_fastboot_enabled() {
            tracing::info!(serial = %serial, "Device in fastboot, rebooting");
            let fastboot = self.fastboot_path.to_string_lossy();
            let result = self
                .runner
                .run_timed_command(TOOL_TIMEOUT, &[fastboot.as_ref(), "-s", serial, "reboot"])
                .await;
            if !result.is_success() {
                tracing::warn!(serial = %serial, stderr = %result.stderr.trim(), "fastboot reboot failed");
            }
        }

        if !monitor.wait_for_device_online(self.config.online_wait).await? {
            return Err(DeviceError::not_available(serial, "could not find device online"));
        }
        if !monitor.wait_for_device_shell(self.config.shell_wait).await? {
            return Err(DeviceError::unresponsive(serial, "device online but not responsive"));
        }
        if level == RecoveryLevel::Available
            && !monitor
                .wait_for_device_available(self.config.available_wait)
                .await?
        {
            return Err(DeviceError::unresponsive(serial, "device did not become available"));
        }
        tracing::info!(serial = %serial, ?level, "Device recovered");
        Ok(())
    }
}

/// Drops and re-establishes a network bridge connection.
pub struct ReconnectRecovery {
    runner: Arc<dyn CommandRunner>,
    adb_path: String,
    config: RecoveryConfig,
}

impl ReconnectRecovery {
    pub fn new(runner: Arc<dyn CommandRunner>, adb_path: impl Into<String>, config: RecoveryConfig) -> Self {
        Self {
            runner,
            adb_path: adb_path.into(),
            config,
        }
    }

    async fn try_connect(&self, monitor: &DeviceStateMonitor) -> Result<bool, DeviceError> {
        let serial = monitor.serial();
        let result = self
            .runner
            .run_timed_command(TOOL_TIMEOUT, &[&self.adb_path, "connect", serial])
            .await;
        if !is_connected(&result.stdout, serial) {
            tracing::debug!(serial = %serial, stdout = %result.stdout.trim(), "Connect attempt rejected");
            return Ok(false);
        }
        if !monitor.wait_for_device_online(self.config.online_wait).await? {
            return Ok(false);
        }
        monitor.wait_for_device_shell(self.config.shell_wait).await
    }
}

/// True when `adb connect` output reports a live connection to `serial`.
pub(crate) fn is_connected(stdout: &str, serial: &str) -> bool {
    let stdout = stdout.trim_start();
    stdout.starts_with(&format!("connected to {serial}"))
        || stdout.starts_with(&format!("already connected to {serial}"))
}

#[async_trait]
impl DeviceRecovery for ReconnectRecovery {
    async fn recover_device(
        &self,
        monitor: &DeviceStateMonitor,
        level: RecoveryLevel,
    ) -> Result<(), DeviceError> {
        let serial = monitor.serial();
        let disconnect = self
            .runner
            .run_timed_command(TOOL_TIMEOUT, &[&self.adb_path, "disconnect", serial])
            .await;
        tracing::debug!(serial = %serial, status = ?disconnect.status, "Disconnected before reconnect");

        let attempts = self.config.reconnect_attempts.max(1);
        let mut connected = false;
        for attempt in 1..=attempts {
            if self.try_connect(monitor).await? {
                connected = true;
                break;
            }
            tracing::warn!(serial = %serial, attempt, attempts, "Reconnect attempt failed");
            if attempt < attempts {
                tokio::time::sleep(self.config.reconnect_backoff.saturating_mul(attempt)).await;
            }
        }

        if !connected {
            return Err(DeviceError::unresponsive(
                serial,
                format!("failed to reconnect after {attempts} attempts"),
            ));
        }

        if level == RecoveryLevel::Available
            && !monitor
                .wait_for_device_available(self.config.available_wait)
                .await?
        {
            return Err(DeviceError::unresponsive(
                serial,
                "reconnected but device did not become available",
            ));
        }
        tracing::info!(serial = %serial, ?level, "Device reconnected");
        Ok(())
    }
}

/// Repeats an inner strategy; `max_iterations == 0` retries forever.
pub struct RetryingRecovery {
    inner: Arc<dyn DeviceRecovery>,
    max_iterations: u32,
    delay: Duration,
}

impl RetryingRecovery {
    pub fn new(inner: Arc<dyn DeviceRecovery>, max_iterations: u32) -> Self {
        Self {
            inner,
            max_iterations,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl DeviceRecovery for RetryingRecovery {
    async fn recover_device(
        &self,
        monitor: &DeviceStateMonitor,
        level: RecoveryLevel,
    ) -> Result<(), DeviceError> {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match self.inner.recover_device(monitor, level).await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_device_unavailable() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        serial = %monitor.serial(),
                        attempt,
                        max_iterations = self.max_iterations,
                        error = %e,
                        "Recovery attempt failed"
                    );
                    if self.max_iterations != 0 && attempt >= self.max_iterations {
                        return Err(e);
                    }
                }
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
    }
}

/// Fails every request; installed when the fleet is shutting down hard.
pub struct AbortRecovery;

#[async_trait]
impl DeviceRecovery for AbortRecovery {
    async fn recover_device(
        &self,
        monitor: &DeviceStateMonitor,
        _level: RecoveryLevel,
    ) -> Result<(), DeviceError> {
        Err(DeviceError::not_available(monitor.serial(), "aborted test session"))
    }

    async fn recover_bootloader(&self, monitor: &DeviceStateMonitor) -> Result<(), DeviceError> {
        Err(DeviceError::not_available(monitor.serial(), "aborted test session"))
    }
}
