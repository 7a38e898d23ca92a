//! Per-device wait engine.
//!
//! Every wait is built on [`DeviceStateMonitor::poll_until`]: evaluate a check,
//! sleep `min(base * attempt, cap)` clipped to the remaining budget, repeat.
//! A connectivity change wakes the sleeper early. Timeouts are reported as
//! `Ok(false)`; only a non-recoverable probe fault becomes an error.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::MonitorConfig;
use crate::error::{DeviceError, ProbeError};
use crate::probe::{CollectingSink, ConnectivityProbe};
use crate::state::ConnectivityState;

pub struct DeviceStateMonitor {
    serial: String,
    probe: Arc<dyn ConnectivityProbe>,
    state_tx: watch::Sender<ConnectivityState>,
    config: MonitorConfig,
    fastboot_enabled: bool,
}

impl DeviceStateMonitor {
    pub fn new(
        serial: impl Into<String>,
        probe: Arc<dyn ConnectivityProbe>,
        initial: ConnectivityState,
        config: MonitorConfig,
        fastboot_enabled: bool,
    ) -> Self {
        let (state_tx, _) = watch::channel(initial);
        Self {
            serial: serial.into(),
            probe,
            state_tx,
            config,
            fastboot_enabled,
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn probe(&self) -> &Arc<dyn ConnectivityProbe> {
        &self.probe
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn is_fastboot_enabled(&self) -> bool {
        self.fastboot_enabled
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state_tx.borrow()
    }

    pub(crate) fn set_state(&self, state: ConnectivityState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(serial = %self.serial, from = %previous, to = %state, "Connectivity changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state_tx.subscribe()
    }

    /// Interval to sleep after poll number `attempt` (1-based).
    pub fn poll_interval(&self, attempt: u32) -> Duration {
        self.config
            .poll_base
            .saturating_mul(attempt.max(1))
            .min(self.config.poll_cap)
    }

    /// Evaluate `check` until it returns `Ok(true)` or `timeout` elapses.
    ///
    /// Recoverable probe faults count as a failed poll.
    pub async fn poll_until<F, Fut>(&self, timeout: Duration, mut check: F) -> Result<bool, DeviceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, ProbeError>>,
    {
        let start = Instant::now();
        let mut changes = self.state_tx.subscribe();
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);
            match check().await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) if e.is_recoverable() => {
                    tracing::debug!(serial = %self.serial, attempt, error = %e, "Poll failed");
                }
                Err(e) => return Err(e.into_device_error(&self.serial)),
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                tracing::debug!(serial = %self.serial, attempts = attempt, ?timeout, "Wait timed out");
                return Ok(false);
            }

            let interval = self.poll_interval(attempt).min(timeout - elapsed);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = changes.changed() => {}
            }
        }
    }

    async fn wait_for_connectivity(&self, expected: ConnectivityState, timeout: Duration) -> Result<bool, DeviceError> {
        let this = self;
        self.poll_until(timeout, move || this.check_connectivity(expected))
            .await
    }

    pub async fn wait_for_device_online(&self, timeout: Duration) -> Result<bool, DeviceError> {
        tracing::debug!(serial = %self.serial, ?timeout, "Waiting for device online");
        self.wait_for_connectivity(ConnectivityState::Online, timeout).await
    }

    pub async fn wait_for_device_not_available(&self, timeout: Duration) -> Result<bool, DeviceError> {
        self.wait_for_connectivity(ConnectivityState::NotAvailable, timeout)
            .await
    }

    pub async fn wait_for_device_in_recovery(&self, timeout: Duration) -> Result<bool, DeviceError> {
        self.wait_for_connectivity(ConnectivityState::Recovery, timeout).await
    }

    pub async fn wait_for_device_bootloader(&self, timeout: Duration) -> Result<bool, DeviceError> {
        if !self.fastboot_enabled {
            tracing::warn!(serial = %self.serial, "Fastboot is disabled, cannot wait for bootloader");
            return Ok(false);
        }
        self.wait_for_connectivity(ConnectivityState::Fastboot, timeout).await
    }

    /// Online and answering a trivial shell command.
    pub async fn wait_for_device_shell(&self, timeout: Duration) -> Result<bool, DeviceError> {
        let deadline = Instant::now() + timeout;
        let this = self;
        self.poll_until(timeout, move || this.check_shell(deadline))
            .await
    }

    pub async fn wait_for_boot_complete(&self, timeout: Duration) -> Result<bool, DeviceError> {
        let deadline = Instant::now() + timeout;
        let this = self;
        self.poll_until(timeout, move || this.check_boot_complete(deadline))
            .await
    }

    pub async fn wait_for_package_manager(&self, timeout: Duration) -> Result<bool, DeviceError> {
        let deadline = Instant::now() + timeout;
        let this = self;
        self.poll_until(timeout, move || this.check_package_manager(deadline))
            .await
    }

    pub async fn wait_for_storage_mount(&self, timeout: Duration) -> Result<bool, DeviceError> {
        let deadline = Instant::now() + timeout;
        let this = self;
        self.poll_until(timeout, move || this.check_storage_mount(deadline))
            .await
    }

    /// Online, package manager responsive, external storage mounted.
    ///
    /// Each stage spends from the same budget.
    pub async fn wait_for_device_available(&self, timeout: Duration) -> Result<bool, DeviceError> {
        let start = Instant::now();
        if !self.wait_for_device_online(timeout).await? {
            return Ok(false);
        }
        if !self
            .wait_for_package_manager(timeout.saturating_sub(start.elapsed()))
            .await?
        {
            tracing::debug!(serial = %self.serial, "Package manager not responsive");
            return Ok(false);
        }
        let ready = self
            .wait_for_storage_mount(timeout.saturating_sub(start.elapsed()))
            .await?;
        if ready {
            tracing::debug!(serial = %self.serial, elapsed = ?start.elapsed(), "Device available");
        }
        Ok(ready)
    }

    async fn check_connectivity(&self, expected: ConnectivityState) -> Result<bool, ProbeError> {
        Ok(self.state() == expected)
    }

    async fn check_shell(&self, deadline: Instant) -> Result<bool, ProbeError> {
        if self.state() != ConnectivityState::Online {
            return Ok(false);
        }
        let output = self.shell_output("echo 1", deadline).await?;
        Ok(output.trim() == "1")
    }

    async fn check_boot_complete(&self, deadline: Instant) -> Result<bool, ProbeError> {
        let output = self
            .shell_output("getprop sys.boot_completed", deadline)
            .await?;
        Ok(output.trim() == "1")
    }

    async fn check_package_manager(&self, deadline: Instant) -> Result<bool, ProbeError> {
        let output = self
            .shell_output("pm path android", deadline)
            .await?;
        Ok(output.contains("package:"))
    }

    async fn check_storage_mount(&self, deadline: Instant) -> Result<bool, ProbeError> {
        let mount = self
            .shell_output("echo $EXTERNAL_STORAGE", deadline)
            .await?;
        let mount = mount.trim();
        if mount.is_empty() {
            return Ok(false);
        }
        let listing = self
            .shell_output(&format!("ls {mount}"), deadline)
            .await?;
        Ok(!listing.contains("No such file"))
    }

    /// Per-command timeout clipped to `deadline`; `None` once it has passed.
    fn command_budget(&self, deadline: Instant) -> Option<Duration> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then(|| self.config.command_timeout.min(remaining))
    }

    async fn shell_output(&self, command: &str, deadline: Instant) -> Result<String, ProbeError> {
        let Some(timeout) = self.command_budget(deadline) else {
            return Err(ProbeError::Timeout(Duration::ZERO));
        };
        let sink = CollectingSink::new();
        self.probe
            .execute_shell_command(&self.serial, command, &sink, Some(timeout))
            .await?;
        Ok(sink.output())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::testing::{FakeProbe, ShellReply};

    fn monitor_with(probe: Arc<FakeProbe>, state: ConnectivityState) -> DeviceStateMonitor {
        let config = MonitorConfig::default().with_poll(Duration::from_millis(500), Duration::from_secs(2));
        DeviceStateMonitor::new("serial-1", probe, state, config, true)
    }

    #[tokio::test(start_paused = true)]
    async fn satisfied_zero_timeout_returns_immediately() {
        let monitor = monitor_with(Arc::new(FakeProbe::new()), ConnectivityState::Online);
        let start = Instant::now();
        assert!(monitor.wait_for_device_online(Duration::ZERO).await.unwrap());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn short_timeout_fails_within_one_interval() {
        let monitor = monitor_with(Arc::new(FakeProbe::new()), ConnectivityState::NotAvailable);
        let start = Instant::now();
        let ok = monitor
            .wait_for_device_online(Duration::from_millis(100))
            .await
            .unwrap();
        assert!(!ok);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed <= Duration::from_millis(100) + monitor.poll_interval(1));
    }

    #[tokio::test(start_paused = true)]
    async fn connectivity_change_wakes_waiter() {
        let monitor = Arc::new(monitor_with(
            Arc::new(FakeProbe::new()),
            ConnectivityState::NotAvailable,
        ));
        let setter = Arc::clone(&monitor);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            setter.set_state(ConnectivityState::Online);
        });

        let start = Instant::now();
        assert!(monitor.wait_for_device_online(Duration::from_secs(30)).await.unwrap());
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn poll_interval_grows_to_cap() {
        let monitor = monitor_with(Arc::new(FakeProbe::new()), ConnectivityState::Online);
        assert_eq!(monitor.poll_interval(1), Duration::from_millis(500));
        assert_eq!(monitor.poll_interval(3), Duration::from_millis(1500));
        assert_eq!(monitor.poll_interval(10), Duration::from_secs(2));
        assert_eq!(monitor.poll_interval(u32::MAX), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn shell_wait_requires_echo_reply() {
        let probe = Arc::new(FakeProbe::new());
        let monitor = monitor_with(Arc::clone(&probe), ConnectivityState::Online);
        assert!(monitor.wait_for_device_shell(Duration::from_secs(1)).await.unwrap());

        probe.on_shell(|_, _| ShellReply::Error(ProbeError::Io("broken pipe".into())));
        assert!(!monitor.wait_for_device_shell(Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn shell_wait_skips_probe_while_offline() {
        let probe = Arc::new(FakeProbe::new());
        let monitor = monitor_with(Arc::clone(&probe), ConnectivityState::NotAvailable);
        assert!(!monitor.wait_for_device_shell(Duration::from_secs(1)).await.unwrap());
        assert_eq!(probe.shell_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_probe_fault_is_an_error() {
        let probe = Arc::new(FakeProbe::new());
        probe.on_shell(|_, _| ShellReply::Error(ProbeError::Fatal("bootloop".into())));
        let monitor = monitor_with(Arc::clone(&probe), ConnectivityState::Online);
        let err = monitor
            .wait_for_device_shell(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Fatal { ref serial, .. } if serial == "serial-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn available_retries_package_manager() {
        let probe = Arc::new(FakeProbe::new());
        let pm_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pm_calls);
        probe.on_shell(move |_, cmd| {
            if cmd.starts_with("pm ") {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return ShellReply::Output("Error: Could not access the Package Manager".into());
                }
                return ShellReply::Output("package:/system/framework/framework-res.apk".into());
            }
            if cmd.contains("EXTERNAL_STORAGE") {
                return ShellReply::Output("/sdcard".into());
            }
            ShellReply::Output("Android".into())
        });
        let monitor = monitor_with(Arc::clone(&probe), ConnectivityState::Online);
        assert!(monitor.wait_for_device_available(Duration::from_secs(30)).await.unwrap());
        assert_eq!(pm_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn available_budget_is_shared_between_stages() {
        let probe = Arc::new(FakeProbe::new());
        probe.on_shell(|_, cmd| {
            if cmd.contains("EXTERNAL_STORAGE") {
                ShellReply::Output(String::new())
            } else {
                ShellReply::Output("package:/x".into())
            }
        });
        let monitor = monitor_with(Arc::clone(&probe), ConnectivityState::Online);
        let start = Instant::now();
        assert!(!monitor.wait_for_device_available(Duration::from_secs(3)).await.unwrap());
        assert!(start.elapsed() <= Duration::from_secs(3) + monitor.poll_interval(1));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_shell_counts_as_failed_poll() {
        let probe = Arc::new(FakeProbe::new());
        probe.on_shell(|_, _| ShellReply::Hang);
        let monitor = monitor_with(Arc::clone(&probe), ConnectivityState::Online);
        let timeout = Duration::from_secs(2);
        let start = Instant::now();
        assert!(!monitor.wait_for_device_shell(timeout).await.unwrap());
        assert!(start.elapsed() <= timeout + monitor.poll_interval(1));
        assert_eq!(probe.shell_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_command_runs_past_the_deadline() {
        let probe = Arc::new(FakeProbe::new());
        probe.on_shell(|_, cmd| {
            if cmd.contains("EXTERNAL_STORAGE") {
                ShellReply::Delayed(Duration::from_secs(1), "/sdcard".into())
            } else {
                ShellReply::Output("Android".into())
            }
        });
        let monitor = monitor_with(Arc::clone(&probe), ConnectivityState::Online);
        let start = Instant::now();
        assert!(!monitor.wait_for_storage_mount(Duration::from_secs(1)).await.unwrap());
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(probe.shell_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bootloader_wait_needs_fastboot() {
        let config = MonitorConfig::default();
        let monitor = DeviceStateMonitor::new(
            "serial-1",
            Arc::new(FakeProbe::new()),
            ConnectivityState::Fastboot,
            config,
            false,
        );
        assert!(!monitor.wait_for_device_bootloader(Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn not_available_wait_observes_disconnect() {
        let monitor = monitor_with(Arc::new(FakeProbe::new()), ConnectivityState::Online);
        assert!(!monitor
            .wait_for_device_not_available(Duration::from_millis(600))
            .await
            .unwrap());
        monitor.set_state(ConnectivityState::NotAvailable);
        assert!(monitor
            .wait_for_device_not_available(Duration::ZERO)
            .await
            .unwrap());
    }
}
