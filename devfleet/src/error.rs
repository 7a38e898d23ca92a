use std::time::Duration;

use thiserror::Error;

/// Failures surfaced to callers operating on a device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device {serial} is not available: {message}")]
    NotAvailable { serial: String, message: String },

    #[error("device {serial} is unresponsive: {message}")]
    Unresponsive { serial: String, message: String },

    #[error("device {serial} disconnected: {message}")]
    Disconnected { serial: String, message: String },

    #[error("device {serial} needs manual intervention: {message}")]
    Fatal { serial: String, message: String },

    #[error("no device matched the selection criteria")]
    NoDevice,

    #[error("network unavailable on device {serial}: {message}")]
    NetworkUnavailable { serial: String, message: String },
}

impl DeviceError {
    pub fn not_available(serial: impl Into<String>, message: impl Into<String>) -> Self {
        DeviceError::NotAvailable {
            serial: serial.into(),
            message: message.into(),
        }
    }

    pub fn unresponsive(serial: impl Into<String>, message: impl Into<String>) -> Self {
        DeviceError::Unresponsive {
            serial: serial.into(),
            message: message.into(),
        }
    }

    pub fn disconnected(serial: impl Into<String>, message: impl Into<String>) -> Self {
        DeviceError::Disconnected {
            serial: serial.into(),
            message: message.into(),
        }
    }

    pub fn fatal(serial: impl Into<String>, message: impl Into<String>) -> Self {
        DeviceError::Fatal {
            serial: serial.into(),
            message: message.into(),
        }
    }

    pub fn serial(&self) -> Option<&str> {
        match self {
            DeviceError::NotAvailable { serial, .. }
            | DeviceError::Unresponsive { serial, .. }
            | DeviceError::Disconnected { serial, .. }
            | DeviceError::Fatal { serial, .. }
            | DeviceError::NetworkUnavailable { serial, .. } => Some(serial),
            DeviceError::NoDevice => None,
        }
    }

    /// True for the family of errors a caller may retry after recovery.
    pub fn is_device_unavailable(&self) -> bool {
        matches!(
            self,
            DeviceError::NotAvailable { .. }
                | DeviceError::Unresponsive { .. }
                | DeviceError::Disconnected { .. }
        )
    }
}

/// Faults reported by the connectivity probe or the process runner.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("command rejected by transport: {0}")]
    TransportRejected(String),

    #[error("I/O failure: {0}")]
    Io(String),

    #[error("device stopped responding: {0}")]
    Unresponsive(String),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("unrecoverable device condition: {0}")]
    Fatal(String),
}

impl ProbeError {
    /// Recoverable faults turn into a failed poll; the rest abort the wait.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ProbeError::Fatal(_))
    }

    /// Lift a probe fault into a device error for `serial`.
    pub fn into_device_error(self, serial: &str) -> DeviceError {
        match self {
            ProbeError::TransportRejected(msg) => DeviceError::disconnected(serial, msg),
            ProbeError::Io(msg) => DeviceError::not_available(serial, msg),
            ProbeError::Unresponsive(msg) => DeviceError::unresponsive(serial, msg),
            ProbeError::Timeout(after) => {
                DeviceError::unresponsive(serial, format!("command timed out after {after:?}"))
            }
            ProbeError::Fatal(msg) => DeviceError::fatal(serial, msg),
        }
    }
}

impl From<std::io::Error> for ProbeError {
    fn from(err: std::io::Error) -> Self {
        ProbeError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_family() {
        assert!(DeviceError::unresponsive("abc", "x").is_device_unavailable());
        assert!(DeviceError::disconnected("abc", "x").is_device_unavailable());
        assert!(DeviceError::not_available("abc", "x").is_device_unavailable());
        assert!(!DeviceError::fatal("abc", "x").is_device_unavailable());
        assert!(!DeviceError::NoDevice.is_device_unavailable());
    }

    #[test]
    fn errors_carry_serial() {
        let err = DeviceError::unresponsive("emulator-5554", "no reply");
        assert_eq!(err.serial(), Some("emulator-5554"));
        assert_eq!(
            err.to_string(),
            "device emulator-5554 is unresponsive: no reply"
        );
        assert_eq!(DeviceError::NoDevice.serial(), None);
    }

    #[test]
    fn probe_errors_map_to_device_errors() {
        let err = ProbeError::Timeout(Duration::from_secs(2)).into_device_error("abc");
        assert!(matches!(err, DeviceError::Unresponsive { .. }));

        let err = ProbeError::TransportRejected("device offline".into()).into_device_error("abc");
        assert!(matches!(err, DeviceError::Disconnected { .. }));

        let err = ProbeError::Fatal("bricked".into()).into_device_error("abc");
        assert!(matches!(err, DeviceError::Fatal { .. }));
        assert!(!ProbeError::Fatal("bricked".into()).is_recoverable());
        assert!(ProbeError::Io("pipe".into()).is_recoverable());
    }
}
