//! Fleet configuration.
//!
//! Defaults read `DEVFLEET_*` environment variables; the `with_*` builders
//! override individual fields.

use std::path::PathBuf;
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Polling and default deadlines for the state monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// First poll interval; grows linearly with each attempt
    pub poll_base: Duration,
    /// Upper bound on the poll interval
    pub poll_cap: Duration,
    pub online_timeout: Duration,
    pub available_timeout: Duration,
    /// Per-command deadline used by readiness checks
    pub command_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_base: Duration::from_millis(500),
            poll_cap: Duration::from_secs(5),
            online_timeout: Duration::from_secs(60),
            available_timeout: Duration::from_secs(360),
            command_timeout: Duration::from_secs(10),
        }
    }
}

impl MonitorConfig {
    pub fn with_poll(mut self, base: Duration, cap: Duration) -> Self {
        self.poll_base = base;
        self.poll_cap = cap;
        self
    }

    pub fn with_online_timeout(mut self, timeout: Duration) -> Self {
        self.online_timeout = timeout;
        self
    }

    pub fn with_available_timeout(mut self, timeout: Duration) -> Self {
        self.available_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// Shell command run after recovery to confirm the device's network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkCheck {
    pub command: String,
    /// Output must contain this text for the check to pass
    pub expect: String,
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub online_wait: Duration,
    pub shell_wait: Duration,
    pub available_wait: Duration,
    pub reconnect_attempts: u32,
    /// Sleep before connect attempt `n` is `reconnect_backoff * n`
    pub reconnect_backoff: Duration,
    /// Rounds of the inner strategy; 0 retries forever
    pub max_iterations: u32,
    pub retry_delay: Duration,
    pub network_check: Option<NetworkCheck>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            online_wait: Duration::from_secs(30),
            shell_wait: Duration::from_secs(30),
            available_wait: Duration::from_secs(180),
            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_secs(5),
            max_iterations: env_parse("DEVFLEET_RECOVERY_ITERATIONS").unwrap_or(1),
            retry_delay: Duration::from_secs(1),
            network_check: None,
        }
    }
}

impl RecoveryConfig {
    pub fn with_waits(mut self, online: Duration, shell: Duration, available: Duration) -> Self {
        self.online_wait = online;
        self.shell_wait = shell;
        self.available_wait = available;
        self
    }

    pub fn with_reconnect(mut self, attempts: u32, backoff: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_network_check(mut self, command: impl Into<String>, expect: impl Into<String>) -> Self {
        self.network_check = Some(NetworkCheck {
            command: command.into(),
            expect: expect.into(),
        });
        self
    }
}

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub adb_path: String,
    pub fastboot_path: PathBuf,
    pub max_emulators: usize,
    pub max_null_devices: usize,
    pub max_tcp_devices: usize,
    /// `None` leaves flashing unbounded
    pub concurrent_flash_limit: Option<usize>,
    /// Disconnects tolerated before an idle handle is forgotten
    pub disconnect_threshold: u32,
    pub fastboot_poll_interval: Duration,
    pub fastboot_command_timeout: Duration,
    /// Deadline for `adb connect`, `adb disconnect` and other bridge commands
    pub adb_command_timeout: Duration,
    /// Period of the sweep that recovers unavailable devices; `None` disables it
    pub recovery_sweep_interval: Option<Duration>,
    pub availability_check_timeout: Duration,
    pub tcp_connect_attempts: u32,
    pub tcp_connect_retry_delay: Duration,
    /// Run availability checks inline in the event listener
    pub synchronous_checks: bool,
    pub monitor: MonitorConfig,
    pub recovery: RecoveryConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            adb_path: env_string("DEVFLEET_ADB_PATH", "adb"),
            fastboot_path: PathBuf::from(env_string("DEVFLEET_FASTBOOT_PATH", "fastboot")),
            max_emulators: env_parse("DEVFLEET_MAX_EMULATORS").unwrap_or(1),
            max_null_devices: env_parse("DEVFLEET_MAX_NULL_DEVICES").unwrap_or(1),
            max_tcp_devices: env_parse("DEVFLEET_MAX_TCP_DEVICES").unwrap_or(1),
            concurrent_flash_limit: env_parse("DEVFLEET_CONCURRENT_FLASH_LIMIT"),
            disconnect_threshold: env_parse("DEVFLEET_DISCONNECT_THRESHOLD").unwrap_or(0),
            fastboot_poll_interval: Duration::from_secs(5),
            fastboot_command_timeout: Duration::from_secs(60),
            adb_command_timeout: Duration::from_secs(30),
            recovery_sweep_interval: env_parse("DEVFLEET_RECOVERY_SWEEP_SECS").map(Duration::from_secs),
            availability_check_timeout: Duration::from_secs(30),
            tcp_connect_attempts: 3,
            tcp_connect_retry_delay: Duration::from_secs(5),
            synchronous_checks: false,
            monitor: MonitorConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Configuration with no placeholder devices and env-independent values.
    pub fn bare() -> Self {
        Self {
            adb_path: "adb".to_string(),
            fastboot_path: PathBuf::from("fastboot"),
            max_emulators: 0,
            max_null_devices: 0,
            max_tcp_devices: 0,
            concurrent_flash_limit: None,
            disconnect_threshold: 0,
            recovery_sweep_interval: None,
            ..Self::default()
        }
    }

    pub fn with_adb_path(mut self, path: impl Into<String>) -> Self {
        self.adb_path = path.into();
        self
    }

    pub fn with_fastboot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.fastboot_path = path.into();
        self
    }

    pub fn with_placeholders(mut self, null_devices: usize, emulators: usize, tcp: usize) -> Self {
        self.max_null_devices = null_devices;
        self.max_emulators = emulators;
        self.max_tcp_devices = tcp;
        self
    }

    pub fn with_flash_limit(mut self, limit: Option<usize>) -> Self {
        self.concurrent_flash_limit = limit;
        self
    }

    pub fn with_disconnect_threshold(mut self, threshold: u32) -> Self {
        self.disconnect_threshold = threshold;
        self
    }

    pub fn with_fastboot_poll_interval(mut self, interval: Duration) -> Self {
        self.fastboot_poll_interval = interval;
        self
    }

    pub fn with_adb_command_timeout(mut self, timeout: Duration) -> Self {
        self.adb_command_timeout = timeout;
        self
    }

    pub fn with_recovery_sweep(mut self, interval: Option<Duration>) -> Self {
        self.recovery_sweep_interval = interval;
        self
    }

    pub fn with_availability_check_timeout(mut self, timeout: Duration) -> Self {
        self.availability_check_timeout = timeout;
        self
    }

    pub fn with_tcp_connect(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.tcp_connect_attempts = attempts;
        self.tcp_connect_retry_delay = retry_delay;
        self
    }

    pub fn with_synchronous_checks(mut self, synchronous: bool) -> Self {
        self.synchronous_checks = synchronous;
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_has_no_placeholders() {
        let config = FleetConfig::bare();
        assert_eq!(config.max_null_devices, 0);
        assert_eq!(config.max_emulators, 0);
        assert_eq!(config.max_tcp_devices, 0);
        assert_eq!(config.concurrent_flash_limit, None);
        assert_eq!(config.disconnect_threshold, 0);
    }

    #[test]
    fn builders_override_fields() {
        let config = FleetConfig::bare()
            .with_placeholders(2, 3, 1)
            .with_flash_limit(Some(4))
            .with_disconnect_threshold(2)
            .with_recovery(RecoveryConfig::default().with_network_check("ping -c 1 host", " 0% packet loss"));
        assert_eq!(config.max_null_devices, 2);
        assert_eq!(config.max_emulators, 3);
        assert_eq!(config.max_tcp_devices, 1);
        assert_eq!(config.concurrent_flash_limit, Some(4));
        assert_eq!(config.disconnect_threshold, 2);
        assert_eq!(
            config.recovery.network_check.as_ref().map(|c| c.expect.as_str()),
            Some(" 0% packet loss")
        );
    }
}
