//! Fleet lifecycle and the allocation API.
//!
//! The manager owns the registry, listens to probe events, scans for fastboot
//! devices, runs availability checks on newly connected devices and hands
//! devices out to callers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::command::CommandRunner;
use crate::config::FleetConfig;
use crate::device::{
    DeviceKind, EMULATOR_PREFIX, ManagedDevice, ManagedDeviceFactory, NULL_DEVICE_PREFIX,
    TCP_DEVICE_PREFIX,
};
use crate::error::{DeviceError, ProbeError};
use crate::fastboot::FastbootHelper;
use crate::flashing::{FlashingPermit, FlashingPermits};
use crate::probe::{ConnectivityProbe, ProbeDevice, ProbeEvent};
use crate::recovery::{AbortRecovery, RecoveryLevel, is_connected};
use crate::registry::DeviceRegistry;
use crate::selection::DeviceSelection;
use crate::state::{AllocationState, ConnectivityState, DeviceEvent, FreeDeviceState};

const FIRST_EMULATOR_PORT: usize = 5554;
const ADB_TCP_PORT: u16 = 5555;
/// Upper bound on how long an allocation waiter sleeps between attempts.
const ALLOCATION_RECHECK: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("device manager already initialized")]
    AlreadyInitialized,

    #[error("device manager has not been initialized")]
    NotInitialized,

    #[error("device manager has been terminated")]
    Terminated,

    #[error("device scan failed: {0}")]
    Scan(#[from] ProbeError),
}

/// One row of the fleet listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub serial: String,
    pub kind: DeviceKind,
    pub placeholder: bool,
    pub connectivity: ConnectivityState,
    pub allocation: AllocationState,
}

impl DeviceDescriptor {
    fn of(device: &ManagedDevice) -> Self {
        Self {
            serial: device.serial().to_string(),
            kind: device.kind(),
            placeholder: device.is_placeholder(),
            connectivity: device.connectivity(),
            allocation: device.allocation_state(),
        }
    }
}

struct BackgroundTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Fleet task panicked");
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    initialized: bool,
    terminated: bool,
    fastboot_enabled: bool,
    listener: Option<BackgroundTask>,
    fastboot_monitor: Option<BackgroundTask>,
    recovery_sweep: Option<BackgroundTask>,
}

pub struct DeviceManager {
    config: FleetConfig,
    probe: Arc<dyn ConnectivityProbe>,
    runner: Arc<dyn CommandRunner>,
    factory: Arc<ManagedDeviceFactory>,
    registry: Arc<DeviceRegistry>,
    flashing: FlashingPermits,
    fastboot: FastbootHelper,
    global_filter: Option<Arc<dyn DeviceSelection>>,
    lifecycle: StdMutex<Lifecycle>,
    first_device: watch::Sender<bool>,
    fastboot_devices: watch::Sender<HashSet<String>>,
}

impl DeviceManager {
    pub fn new(
        config: FleetConfig,
        probe: Arc<dyn ConnectivityProbe>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let factory = Arc::new(ManagedDeviceFactory::new(
            Arc::clone(&probe),
            Arc::clone(&runner),
            config.clone(),
        ));
        let registry = Arc::new(DeviceRegistry::new(factory.clone()));
        let fastboot = FastbootHelper::new(
            Arc::clone(&runner),
            config.fastboot_path.clone(),
            config.fastboot_command_timeout,
        );
        let (first_device, _) = watch::channel(false);
        let (fastboot_devices, _) = watch::channel(HashSet::new());
        Self {
            flashing: FlashingPermits::new(config.concurrent_flash_limit),
            config,
            probe,
            runner,
            factory,
            registry,
            fastboot,
            global_filter: None,
            lifecycle: StdMutex::new(Lifecycle::default()),
            first_device,
            fastboot_devices,
        }
    }

    /// Devices failing `filter` are ignored instead of made available.
    pub fn with_global_filter(mut self, filter: Arc<dyn DeviceSelection>) -> Self {
        self.global_filter = Some(filter);
        self
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        let lifecycle = self.lifecycle();
        lifecycle.initialized && !lifecycle.terminated
    }

    pub fn is_fastboot_enabled(&self) -> bool {
        self.lifecycle().fastboot_enabled
    }

    /// Start tracking devices: placeholders, probe events, the initial scan
    /// and (when the tool is usable) the fastboot monitor.
    pub async fn init(self: &Arc<Self>) -> Result<(), ManagerError> {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.terminated {
                return Err(ManagerError::Terminated);
            }
            if lifecycle.initialized {
                return Err(ManagerError::AlreadyInitialized);
            }
            lifecycle.initialized = true;
        }

        let fastboot_enabled = self.fastboot.is_available().await;
        if fastboot_enabled {
            self.factory.set_fastboot_enabled(true);
        } else {
            tracing::warn!(
                path = %self.fastboot.path().display(),
                "Fastboot is not available, bootloader devices will not be tracked"
            );
        }
        self.lifecycle().fastboot_enabled = fastboot_enabled;

        self.add_placeholders();
        if let Err(e) = self.start_transport().await {
            let listener = {
                let mut lifecycle = self.lifecycle();
                lifecycle.initialized = false;
                lifecycle.listener.take()
            };
            if let Some(task) = listener {
                task.stop().await;
            }
            self.registry.clear();
            tracing::error!(error = %e, "Device manager failed to start");
            return Err(e);
        }
        if fastboot_enabled {
            self.start_fastboot_monitor();
        }
        if let Some(interval) = self.config.recovery_sweep_interval {
            self.start_recovery_sweep(interval);
        }
        tracing::info!(
            devices = self.registry.len(),
            fastboot = fastboot_enabled,
            flash_limit = ?self.flashing.limit(),
            "Device manager initialized"
        );
        Ok(())
    }

    fn add_placeholders(&self) {
        for i in 0..self.config.max_null_devices {
            self.add_available_device(
                &format!("{NULL_DEVICE_PREFIX}-{i}"),
                DeviceKind::Stub,
                ConnectivityState::NotAvailable,
            );
        }
        for i in 0..self.config.max_emulators {
            let port = FIRST_EMULATOR_PORT + 2 * i;
            self.add_available_device(
                &format!("{EMULATOR_PREFIX}-{port}"),
                DeviceKind::Emulator,
                ConnectivityState::NotAvailable,
            );
        }
        for i in 0..self.config.max_tcp_devices {
            self.add_available_device(
                &format!("{TCP_DEVICE_PREFIX}-{i}"),
                DeviceKind::RemoteTcp,
                ConnectivityState::NotAvailable,
            );
        }
    }

    fn add_available_device(
        &self,
        serial: &str,
        kind: DeviceKind,
        connectivity: ConnectivityState,
    ) -> Option<Arc<ManagedDevice>> {
        let device = self.registry.find_or_create(serial, kind)?;
        device.set_connectivity(connectivity);
        if let Some(filter) = &self.global_filter
            && !filter.matches(&device)
        {
            self.registry
                .handle_device_event(&device, DeviceEvent::AvailableCheckIgnored);
            return Some(device);
        }
        self.registry
            .handle_device_event(&device, DeviceEvent::ForceAvailable);
        Some(device)
    }

    async fn start_transport(self: &Arc<Self>) -> Result<(), ManagerError> {
        let events = self.probe.subscribe();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(listen(Arc::downgrade(self), events, cancel.clone()));
        let previous = self
            .lifecycle()
            .listener
            .replace(BackgroundTask { cancel, handle });
        if let Some(task) = previous {
            task.stop().await;
        }

        for device in self.probe.list_devices().await? {
            self.handle_connected(device).await;
        }
        Ok(())
    }

    fn start_fastboot_monitor(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Some(manager) = weak.upgrade() else { break };
                manager.poll_fastboot().await;
                let interval = manager.config.fastboot_poll_interval;
                drop(manager);
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = token.cancelled() => break,
                }
            }
            tracing::debug!("Fastboot monitor stopped");
        });
        self.lifecycle().fastboot_monitor = Some(BackgroundTask { cancel, handle });
    }

    async fn poll_fastboot(&self) {
        let Some(serials) = self.fastboot.get_devices().await else {
            return;
        };
        self.registry.update_fastboot_states(&serials);
        for serial in &serials {
            if self.registry.find(serial).is_none() {
                tracing::info!(serial = %serial, "Found new fastboot device");
                self.add_available_device(serial, DeviceKind::Physical, ConnectivityState::Fastboot);
            }
        }
        self.fastboot_devices.send_replace(serials);
    }

    /// Notified after every fastboot scan with the serials it found.
    pub fn subscribe_fastboot(&self) -> watch::Receiver<HashSet<String>> {
        self.fastboot_devices.subscribe()
    }

    fn start_recovery_sweep(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = token.cancelled() => break,
                }
                let Some(manager) = weak.upgrade() else { break };
                tokio::select! {
                    _ = manager.recover_unavailable_devices() => {}
                    _ = token.cancelled() => break,
                }
            }
            tracing::debug!("Recovery sweep stopped");
        });
        self.lifecycle().recovery_sweep = Some(BackgroundTask { cancel, handle });
    }

    /// Recover every unavailable device that is still visible and re-run its
    /// availability check.
    pub async fn recover_unavailable_devices(&self) {
        let candidates: Vec<_> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|d| {
                d.allocation_state() == AllocationState::Unavailable
                    && d.connectivity() != ConnectivityState::NotAvailable
                    && !d.is_placeholder()
            })
            .collect();
        for device in candidates {
            if let Err(e) = device.recover(RecoveryLevel::Online).await {
                tracing::warn!(serial = %device.serial(), error = %e, "Sweep could not recover device");
                continue;
            }
            let transition = self
                .registry
                .handle_device_event(&device, DeviceEvent::StateChangeOnline);
            if transition.changed && transition.state == AllocationState::CheckingAvailability {
                self.run_availability_check(device).await;
            }
        }
    }

    async fn handle_probe_event(self: &Arc<Self>, event: ProbeEvent) {
        match event {
            ProbeEvent::Connected(device) => self.handle_connected(device).await,
            ProbeEvent::StateChanged(device) => self.handle_state_changed(device).await,
            ProbeEvent::Disconnected(serial) => self.handle_disconnected(&serial),
        }
    }

    async fn handle_connected(self: &Arc<Self>, seen: ProbeDevice) {
        let Some(device) = self
            .registry
            .find_or_create(&seen.serial, DeviceKind::from_serial(&seen.serial))
        else {
            return;
        };
        device.set_connectivity(seen.state);
        self.first_device.send_replace(true);

        let event = if seen.state == ConnectivityState::Online {
            DeviceEvent::ConnectedOnline
        } else {
            DeviceEvent::ConnectedOffline
        };
        let transition = self.registry.handle_device_event(&device, event);
        tracing::info!(serial = %seen.serial, state = %seen.state, allocation = %transition.state, "Detected device");
        if transition.changed && transition.state == AllocationState::CheckingAvailability {
            self.check_and_add_available(device).await;
        }
    }

    async fn handle_state_changed(self: &Arc<Self>, seen: ProbeDevice) {
        let Some(device) = self.registry.find(&seen.serial) else {
            tracing::debug!(serial = %seen.serial, "State change for untracked device");
            return;
        };
        device.set_connectivity(seen.state);
        let event = match seen.state {
            ConnectivityState::Online => DeviceEvent::StateChangeOnline,
            ConnectivityState::NotAvailable => DeviceEvent::StateChangeOffline,
            ConnectivityState::Fastboot | ConnectivityState::Recovery => return,
        };
        let transition = self.registry.handle_device_event(&device, event);
        if transition.changed && transition.state == AllocationState::CheckingAvailability {
            self.check_and_add_available(device).await;
        }
    }

    fn handle_disconnected(&self, serial: &str) {
        let Some(device) = self.registry.find(serial) else {
            return;
        };
        device.set_connectivity(ConnectivityState::NotAvailable);
        let transition = self
            .registry
            .handle_device_event(&device, DeviceEvent::Disconnected);
        tracing::info!(serial = %serial, allocation = %transition.state, "Device disconnected");

        // Emulator slots return to the placeholder pool once forgotten.
        if transition.state == AllocationState::Unknown && device.kind() == DeviceKind::Emulator {
            self.add_available_device(serial, DeviceKind::Emulator, ConnectivityState::NotAvailable);
        }
    }

    async fn check_and_add_available(self: &Arc<Self>, device: Arc<ManagedDevice>) {
        if let Some(filter) = &self.global_filter
            && !filter.matches(&device)
        {
            tracing::info!(serial = %device.serial(), "Device ignored by global filter");
            self.registry
                .handle_device_event(&device, DeviceEvent::AvailableCheckIgnored);
            return;
        }
        if self.config.synchronous_checks {
            self.run_availability_check(device).await;
        } else {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_availability_check(device).await });
        }
    }

    async fn run_availability_check(&self, device: Arc<ManagedDevice>) {
        let passed = match device
            .monitor()
            .wait_for_device_shell(self.config.availability_check_timeout)
            .await
        {
            Ok(passed) => passed,
            Err(e) => {
                tracing::warn!(serial = %device.serial(), error = %e, "Availability check failed");
                false
            }
        };
        let event = if passed {
            DeviceEvent::AvailableCheckPassed
        } else {
            DeviceEvent::AvailableCheckFailed
        };
        let transition = self.registry.handle_device_event(&device, event);
        if passed {
            tracing::info!(serial = %device.serial(), "Device available");
        } else {
            tracing::warn!(serial = %device.serial(), allocation = %transition.state, "Device is unresponsive, not available");
        }
    }

    /// Allocate a device matching `criteria`, waiting up to `timeout`.
    pub async fn allocate(
        &self,
        criteria: &dyn DeviceSelection,
        timeout: Duration,
    ) -> Result<Arc<ManagedDevice>, DeviceError> {
        if !self.is_running() {
            tracing::warn!("Allocation requested while device manager is not running");
            return Err(DeviceError::NoDevice);
        }
        let deadline = Instant::now() + timeout;
        let mut changes = self.registry.subscribe();
        loop {
            if let Some(device) = self.registry.allocate(criteria) {
                return Ok(device);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DeviceError::NoDevice);
            }
            tokio::select! {
                _ = changes.recv() => {}
                _ = tokio::time::sleep(remaining.min(ALLOCATION_RECHECK)) => {}
            }
        }
    }

    /// Allocate `serial` regardless of its state. `None` if it is already
    /// allocated or the serial is invalid.
    pub fn force_allocate(&self, serial: &str) -> Option<Arc<ManagedDevice>> {
        let device = self
            .registry
            .find_or_create(serial, DeviceKind::from_serial(serial))?;
        let transition = self
            .registry
            .handle_device_event(&device, DeviceEvent::ForceAllocateRequest);
        if transition.changed && transition.state == AllocationState::Allocated {
            tracing::info!(serial = %serial, "Force allocated device");
            Some(device)
        } else {
            tracing::info!(serial = %serial, state = %transition.state, "Device could not be force allocated");
            None
        }
    }

    /// Return an allocated device.
    pub async fn free(&self, device: &Arc<ManagedDevice>, state: FreeDeviceState) {
        let event = if device.is_placeholder() {
            // placeholders would vanish otherwise
            DeviceEvent::FreeAvailable
        } else if state == FreeDeviceState::Unavailable && !self.probe.is_visible(device.serial()).await {
            tracing::info!(serial = %device.serial(), "Freed device is gone, forgetting it");
            DeviceEvent::FreeUnknown
        } else {
            state.event()
        };
        if self.registry.free(device, event).is_none() {
            tracing::warn!(serial = %device.serial(), "Free called on a device that is not allocated");
        }
    }

    /// Snapshot of the fleet, sorted by allocation state then serial.
    pub fn list_all_devices(&self) -> Vec<DeviceDescriptor> {
        let mut rows: Vec<DeviceDescriptor> = self
            .registry
            .snapshot()
            .iter()
            .map(|d| DeviceDescriptor::of(d))
            .collect();
        rows.sort_by(|a, b| {
            a.allocation
                .cmp(&b.allocation)
                .then_with(|| a.serial.cmp(&b.serial))
        });
        rows
    }

    pub async fn wait_for_first_device_added(&self, timeout: Duration) -> bool {
        let mut added = self.first_device.subscribe();
        matches!(
            tokio::time::timeout(timeout, added.wait_for(|seen| *seen)).await,
            Ok(Ok(_))
        )
    }

    /// Connect to a device over the network bridge and allocate it.
    pub async fn connect_to_tcp_device(&self, ip_and_port: &str) -> Option<Arc<ManagedDevice>> {
        let device = self.force_allocate(ip_and_port)?;
        if self.adb_connect(ip_and_port).await {
            match device
                .wait_for_device_online(self.config.monitor.online_timeout)
                .await
            {
                Ok(()) => return Some(device),
                Err(e) => {
                    tracing::warn!(serial = %ip_and_port, error = %e, "Connected device never came online");
                }
            }
        }
        self.free(&device, FreeDeviceState::Ignore).await;
        None
    }

    async fn adb_connect(&self, ip_and_port: &str) -> bool {
        let attempts = self.config.tcp_connect_attempts.max(1);
        for attempt in 1..=attempts {
            let result = self
                .runner
                .run_timed_command(
                    self.config.adb_command_timeout,
                    &[self.config.adb_path.as_str(), "connect", ip_and_port],
                )
                .await;
            if is_connected(&result.stdout, ip_and_port) {
                tracing::info!(serial = %ip_and_port, "Connected to network device");
                return true;
            }
            tracing::warn!(serial = %ip_and_port, attempt, stdout = %result.stdout.trim(), "Failed to connect");
            if attempt < attempts {
                tokio::time::sleep(self.config.tcp_connect_retry_delay).await;
            }
        }
        false
    }

    /// Drop a network bridge connection and stop tracking the device.
    pub async fn disconnect_from_tcp_device(&self, device: &Arc<ManagedDevice>) -> bool {
        if device.kind() != DeviceKind::RemoteTcp {
            tracing::warn!(serial = %device.serial(), "Not a network device");
            return false;
        }
        let result = self
            .runner
            .run_timed_command(
                self.config.adb_command_timeout,
                &[self.config.adb_path.as_str(), "disconnect", device.serial()],
            )
            .await;
        self.free(device, FreeDeviceState::Ignore).await;
        result.is_success()
    }

    /// Move a USB device onto the network bridge. Falls back to recovering the
    /// USB connection when the network connection cannot be made.
    pub async fn reconnect_device_to_tcp(
        &self,
        device: &Arc<ManagedDevice>,
    ) -> Option<Arc<ManagedDevice>> {
        let ip_and_port = self.switch_to_adb_tcp(device).await?;
        if let Some(tcp) = self.connect_to_tcp_device(&ip_and_port).await {
            return Some(tcp);
        }
        tracing::warn!(serial = %device.serial(), target = %ip_and_port, "Falling back to USB connection");
        if let Err(e) = device.recover(RecoveryLevel::Online).await {
            tracing::error!(serial = %device.serial(), error = %e, "USB connection did not come back");
        }
        None
    }

    async fn switch_to_adb_tcp(&self, device: &ManagedDevice) -> Option<String> {
        let output = match device.execute_shell("ip -f inet addr show wlan0").await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(serial = %device.serial(), error = %e, "Could not read device address");
                return None;
            }
        };
        let Some(ip) = parse_inet_address(&output) else {
            tracing::warn!(serial = %device.serial(), "Device has no network address");
            return None;
        };
        let port = ADB_TCP_PORT.to_string();
        let result = self
            .runner
            .run_timed_command(
                self.config.adb_command_timeout,
                &[self.config.adb_path.as_str(), "-s", device.serial(), "tcpip", port.as_str()],
            )
            .await;
        if !result.stdout.contains(&port) {
            tracing::warn!(serial = %device.serial(), stdout = %result.stdout.trim(), "Failed to switch to adb over tcp");
            return None;
        }
        Some(format!("{ip}:{port}"))
    }

    /// Run a bridge command that is not tied to a device.
    pub async fn execute_global_adb_command(&self, args: &[&str]) -> Option<String> {
        let mut argv = vec![self.config.adb_path.as_str()];
        argv.extend_from_slice(args);
        let result = self
            .runner
            .run_timed_command(self.config.adb_command_timeout, &argv)
            .await;
        if result.is_success() {
            Some(result.stdout)
        } else {
            tracing::warn!(?args, status = ?result.status, stderr = %result.stderr.trim(), "Global adb command failed");
            None
        }
    }

    pub async fn take_flashing_permit(&self) -> FlashingPermit {
        self.flashing.acquire().await
    }

    pub fn try_take_flashing_permit(&self) -> Option<FlashingPermit> {
        self.flashing.try_acquire()
    }

    pub fn available_flashing_permits(&self) -> usize {
        self.flashing.available_permits()
    }

    /// Stop listening to probe events; device state is kept.
    pub async fn stop_transport(&self) {
        let listener = self.lifecycle().listener.take();
        if let Some(task) = listener {
            task.stop().await;
        }
        self.probe.terminate().await;
        tracing::info!("Transport stopped");
    }

    /// Resume listening and rescan devices after [`stop_transport`](Self::stop_transport).
    pub async fn restart_transport(self: &Arc<Self>) -> Result<(), ManagerError> {
        {
            let lifecycle = self.lifecycle();
            if !lifecycle.initialized {
                return Err(ManagerError::NotInitialized);
            }
            if lifecycle.terminated {
                return Err(ManagerError::Terminated);
            }
            if lifecycle.listener.is_some() {
                return Ok(());
            }
        }
        self.start_transport().await?;
        tracing::info!("Transport restarted");
        Ok(())
    }

    pub async fn terminate(&self) {
        let (listener, fastboot_monitor, recovery_sweep) = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.terminated {
                return;
            }
            lifecycle.terminated = true;
            (
                lifecycle.listener.take(),
                lifecycle.fastboot_monitor.take(),
                lifecycle.recovery_sweep.take(),
            )
        };
        futures::future::join_all(
            [listener, fastboot_monitor, recovery_sweep]
                .into_iter()
                .flatten()
                .map(BackgroundTask::stop),
        )
        .await;
        self.probe.terminate().await;
        tracing::info!("Device manager terminated");
    }

    /// Terminate and make any in-flight recovery fail fast.
    pub async fn terminate_hard(&self) {
        for device in self.registry.snapshot() {
            device.set_recovery(Arc::new(AbortRecovery));
        }
        self.terminate().await;
    }
}

/// First IPv4 address in `ip addr` output.
fn parse_inet_address(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        if fields.next()? != "inet" {
            return None;
        }
        let address = fields.next()?.split('/').next()?;
        (!address.is_empty()).then(|| address.to_string())
    })
}

async fn listen(
    manager: Weak<DeviceManager>,
    mut events: mpsc::Receiver<ProbeEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = cancel.cancelled() => break,
        };
        let Some(event) = event else { break };
        let Some(manager) = manager.upgrade() else { break };
        manager.handle_probe_event(event).await;
    }
    tracing::debug!("Probe listener stopped");
}
