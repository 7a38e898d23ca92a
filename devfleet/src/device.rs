//! Managed device handles and the factory that builds them.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::CommandRunner;
use crate::config::{FleetConfig, NetworkCheck};
use crate::error::{DeviceError, ProbeError};
use crate::monitor::DeviceStateMonitor;
use crate::probe::{CollectingSink, ConnectivityProbe, OutputSink};
use crate::recovery::{
    DeviceRecovery, ReconnectRecovery, RecoveryLevel, RetryingRecovery, WaitDeviceRecovery,
};
use crate::state::{AllocationState, ConnectivityState, DeviceEvent, Transition};

pub const NULL_DEVICE_PREFIX: &str = "null-device";
pub const EMULATOR_PREFIX: &str = "emulator";
pub const TCP_DEVICE_PREFIX: &str = "tcp-device";

/// Retries of a shell command after the first failure.
const MAX_RETRY_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Physical,
    /// Placeholder with no hardware behind it
    Stub,
    Emulator,
    /// Reached over a network bridge connection
    RemoteTcp,
}

impl DeviceKind {
    pub fn from_serial(serial: &str) -> Self {
        if serial.starts_with(NULL_DEVICE_PREFIX) {
            DeviceKind::Stub
        } else if serial.starts_with(EMULATOR_PREFIX) {
            DeviceKind::Emulator
        } else if serial.starts_with(TCP_DEVICE_PREFIX) || is_host_port(serial) {
            DeviceKind::RemoteTcp
        } else {
            DeviceKind::Physical
        }
    }
}

fn is_host_port(serial: &str) -> bool {
    match serial.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub fastboot_enabled: bool,
    pub fastboot_path: PathBuf,
}

#[derive(Debug, Default)]
struct AllocationRecord {
    state: AllocationState,
    disconnects: u32,
}

/// One managed device.
///
/// Allocation state changes only through the registry; connectivity lives in
/// the attached [`DeviceStateMonitor`].
pub struct ManagedDevice {
    serial: String,
    kind: DeviceKind,
    capabilities: DeviceCapabilities,
    monitor: DeviceStateMonitor,
    allocation: StdMutex<AllocationRecord>,
    disconnect_threshold: u32,
    recovery: StdRwLock<Arc<dyn DeviceRecovery>>,
    network_check: Option<NetworkCheck>,
}

impl std::fmt::Debug for ManagedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedDevice")
            .field("serial", &self.serial)
            .field("kind", &self.kind)
            .field("connectivity", &self.connectivity())
            .field("allocation", &self.allocation_state())
            .finish()
    }
}

impl ManagedDevice {
    pub fn new(
        kind: DeviceKind,
        capabilities: DeviceCapabilities,
        monitor: DeviceStateMonitor,
        recovery: Arc<dyn DeviceRecovery>,
        disconnect_threshold: u32,
    ) -> Self {
        Self {
            serial: monitor.serial().to_string(),
            kind,
            capabilities,
            monitor,
            allocation: StdMutex::new(AllocationRecord::default()),
            disconnect_threshold,
            recovery: StdRwLock::new(recovery),
            network_check: None,
        }
    }

    pub fn with_network_check(mut self, check: Option<NetworkCheck>) -> Self {
        self.network_check = check;
        self
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn monitor(&self) -> &DeviceStateMonitor {
        &self.monitor
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.monitor.state()
    }

    pub(crate) fn set_connectivity(&self, state: ConnectivityState) {
        self.monitor.set_state(state);
    }

    pub fn allocation_state(&self) -> AllocationState {
        self.record().state
    }

    pub fn disconnect_count(&self) -> u32 {
        self.record().disconnects
    }

    /// Carry the disconnect history of a handle this one replaces.
    pub(crate) fn inherit_disconnects(&self, count: u32) {
        self.record().disconnects = count;
    }

    /// Not backed by a reachable device right now.
    pub fn is_placeholder(&self) -> bool {
        match self.kind {
            DeviceKind::Stub => true,
            DeviceKind::Physical => false,
            DeviceKind::Emulator => self.connectivity() == ConnectivityState::NotAvailable,
            DeviceKind::RemoteTcp => self.serial.starts_with(TCP_DEVICE_PREFIX),
        }
    }

    fn record(&self) -> std::sync::MutexGuard<'_, AllocationRecord> {
        self.allocation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn handle_allocation_event(&self, event: DeviceEvent) -> Transition {
        let mut record = self.record();
        if event == DeviceEvent::Disconnected {
            record.disconnects = record.disconnects.saturating_add(1);
        }
        let exhausted = record.disconnects > self.disconnect_threshold;
        let transition = record.state.transition(event, exhausted);
        if transition.changed {
            tracing::debug!(
                serial = %self.serial,
                from = %record.state,
                to = %transition.state,
                ?event,
                "Allocation state changed"
            );
        }
        record.state = transition.state;
        if transition.state == AllocationState::Available {
            record.disconnects = 0;
        }
        transition
    }

    pub fn recovery(&self) -> Arc<dyn DeviceRecovery> {
        Arc::clone(&self.recovery.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn set_recovery(&self, recovery: Arc<dyn DeviceRecovery>) {
        *self.recovery.write().unwrap_or_else(PoisonError::into_inner) = recovery;
    }

    /// Run the attached recovery strategy.
    pub async fn recover(&self, level: RecoveryLevel) -> Result<(), DeviceError> {
        tracing::info!(serial = %self.serial, ?level, "Attempting recovery");
        self.recovery().recover_device(&self.monitor, level).await?;
        if level == RecoveryLevel::Available {
            self.check_network().await?;
        }
        Ok(())
    }

    async fn check_network(&self) -> Result<(), DeviceError> {
        let Some(check) = &self.network_check else {
            return Ok(());
        };
        let sink = CollectingSink::new();
        let result = self
            .monitor
            .probe()
            .execute_shell_command(
                &self.serial,
                &check.command,
                &sink,
                Some(self.monitor.config().command_timeout),
            )
            .await;
        match result {
            Ok(()) if sink.output().contains(&check.expect) => Ok(()),
            Ok(()) => Err(DeviceError::NetworkUnavailable {
                serial: self.serial.clone(),
                message: format!("'{}' did not report '{}'", check.command, check.expect),
            }),
            Err(e) => Err(DeviceError::NetworkUnavailable {
                serial: self.serial.clone(),
                message: e.to_string(),
            }),
        }
    }

    /// Wait for the device online, recovering it if the wait times out.
    pub async fn wait_for_device_online(&self, timeout: Duration) -> Result<(), DeviceError> {
        if self.monitor.wait_for_device_online(timeout).await? {
            return Ok(());
        }
        self.recover(RecoveryLevel::Online).await
    }

    /// Wait for the device to be fully usable, recovering it if needed.
    pub async fn wait_for_device_available(&self, timeout: Duration) -> Result<(), DeviceError> {
        if self.monitor.wait_for_device_available(timeout).await? {
            return Ok(());
        }
        self.recover(RecoveryLevel::Available).await
    }

    /// Run a shell command, recovering and retrying on transport faults.
    pub async fn execute_shell_command(
        &self,
        command: &str,
        sink: &dyn OutputSink,
        timeout: Option<Duration>,
    ) -> Result<(), DeviceError> {
        let probe = self.monitor.probe();
        let mut last_error: Option<ProbeError> = None;
        for attempt in 0..=MAX_RETRY_ATTEMPTS {
            match probe
                .execute_shell_command(&self.serial, command, sink, timeout)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_recoverable() => return Err(e.into_device_error(&self.serial)),
                Err(e) => {
                    tracing::warn!(
                        serial = %self.serial,
                        command = %command,
                        attempt,
                        error = %e,
                        "Shell command failed"
                    );
                    last_error = Some(e);
                    if attempt < MAX_RETRY_ATTEMPTS {
                        self.recover(RecoveryLevel::Online).await?;
                    }
                }
            }
        }
        let detail = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(DeviceError::unresponsive(
            &self.serial,
            format!(
                "attempted '{command}' {} times without success: {detail}",
                MAX_RETRY_ATTEMPTS + 1
            ),
        ))
    }

    /// Run a shell command and return its output.
    pub async fn execute_shell(&self, command: &str) -> Result<String, DeviceError> {
        let sink = CollectingSink::new();
        self.execute_shell_command(command, &sink, Some(self.monitor.config().command_timeout))
            .await?;
        Ok(sink.output())
    }
}

/// Builds device handles; chooses the recovery variant by kind.
pub trait DeviceFactory: Send + Sync {
    fn create_device(&self, serial: &str, kind: DeviceKind) -> Arc<ManagedDevice>;
}

pub struct ManagedDeviceFactory {
    probe: Arc<dyn ConnectivityProbe>,
    runner: Arc<dyn CommandRunner>,
    config: FleetConfig,
    fastboot_enabled: AtomicBool,
}

impl ManagedDeviceFactory {
    pub fn new(probe: Arc<dyn ConnectivityProbe>, runner: Arc<dyn CommandRunner>, config: FleetConfig) -> Self {
        Self {
            probe,
            runner,
            config,
            fastboot_enabled: AtomicBool::new(false),
        }
    }

    pub fn set_fastboot_enabled(&self, enabled: bool) {
        self.fastboot_enabled.store(enabled, Ordering::Release);
    }

    fn recovery_for(&self, kind: DeviceKind) -> Arc<dyn DeviceRecovery> {
        let recovery = &self.config.recovery;
        let base: Arc<dyn DeviceRecovery> = match kind {
            DeviceKind::RemoteTcp => Arc::new(ReconnectRecovery::new(
                Arc::clone(&self.runner),
                self.config.adb_path.clone(),
                recovery.clone(),
            )),
            DeviceKind::Physical | DeviceKind::Emulator | DeviceKind::Stub => {
                Arc::new(WaitDeviceRecovery::new(
                    Arc::clone(&self.runner),
                    self.config.fastboot_path.clone(),
                    recovery.clone(),
                ))
            }
        };
        Arc::new(RetryingRecovery::new(base, recovery.max_iterations).with_delay(recovery.retry_delay))
    }
}

impl DeviceFactory for ManagedDeviceFactory {
    fn create_device(&self, serial: &str, kind: DeviceKind) -> Arc<ManagedDevice> {
        let fastboot_enabled = self.fastboot_enabled.load(Ordering::Acquire) && kind != DeviceKind::Stub;
        let monitor = DeviceStateMonitor::new(
            serial,
            Arc::clone(&self.probe),
            ConnectivityState::NotAvailable,
            self.config.monitor.clone(),
            fastboot_enabled,
        );
        let capabilities = DeviceCapabilities {
            fastboot_enabled,
            fastboot_path: self.config.fastboot_path.clone(),
        };
        Arc::new(
            ManagedDevice::new(
                kind,
                capabilities,
                monitor,
                self.recovery_for(kind),
                self.config.disconnect_threshold,
            )
            .with_network_check(self.config.recovery.network_check.clone()),
        )
    }
}
