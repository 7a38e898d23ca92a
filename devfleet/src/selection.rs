//! Device selection criteria.
//!
//! Criteria are evaluated under the registry lock and may run against the same
//! device many times; implementations must be side-effect free.

use std::collections::HashSet;

use crate::device::{DeviceKind, ManagedDevice};
use crate::state::ConnectivityState;

pub trait DeviceSelection: Send + Sync {
    fn matches(&self, device: &ManagedDevice) -> bool;
}

impl<F> DeviceSelection for F
where
    F: Fn(&ManagedDevice) -> bool + Send + Sync,
{
    fn matches(&self, device: &ManagedDevice) -> bool {
        self(device)
    }
}

/// Declarative criteria. The default selects any physical device.
#[derive(Debug, Clone)]
pub struct DeviceSelectionOptions {
    serials: HashSet<String>,
    exclude_serials: HashSet<String>,
    kind: DeviceKind,
    connectivity: Option<ConnectivityState>,
    require_fastboot: bool,
}

impl Default for DeviceSelectionOptions {
    fn default() -> Self {
        Self {
            serials: HashSet::new(),
            exclude_serials: HashSet::new(),
            kind: DeviceKind::Physical,
            connectivity: None,
            require_fastboot: false,
        }
    }
}

impl DeviceSelectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serials.insert(serial.into());
        self
    }

    pub fn excluding(mut self, serial: impl Into<String>) -> Self {
        self.exclude_serials.insert(serial.into());
        self
    }

    pub fn with_kind(mut self, kind: DeviceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_connectivity(mut self, state: ConnectivityState) -> Self {
        self.connectivity = Some(state);
        self
    }

    pub fn require_fastboot(mut self) -> Self {
        self.require_fastboot = true;
        self
    }
}

impl DeviceSelection for DeviceSelectionOptions {
    fn matches(&self, device: &ManagedDevice) -> bool {
        if !self.serials.is_empty() && !self.serials.contains(device.serial()) {
            return false;
        }
        if self.exclude_serials.contains(device.serial()) {
            return false;
        }
        if device.kind() != self.kind {
            return false;
        }
        if let Some(state) = self.connectivity
            && device.connectivity() != state
        {
            return false;
        }
        !(self.require_fastboot && !device.capabilities().fastboot_enabled)
    }
}

/// Matches every device.
pub struct AnyDevice;

impl DeviceSelection for AnyDevice {
    fn matches(&self, _device: &ManagedDevice) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::{DeviceFactory, ManagedDeviceFactory};
    use crate::testing::{FakeProbe, FakeRunner, test_config};

    fn factory() -> ManagedDeviceFactory {
        ManagedDeviceFactory::new(Arc::new(FakeProbe::new()), Arc::new(FakeRunner::new()), test_config())
    }

    #[test]
    fn default_selects_physical_only() {
        let f = factory();
        let options = DeviceSelectionOptions::new();
        assert!(options.matches(&f.create_device("HT123", DeviceKind::Physical)));
        assert!(!options.matches(&f.create_device("null-device-0", DeviceKind::Stub)));
        assert!(!options.matches(&f.create_device("emulator-5554", DeviceKind::Emulator)));
    }

    #[test]
    fn serial_filters() {
        let f = factory();
        let a = f.create_device("A1", DeviceKind::Physical);
        let b = f.create_device("B2", DeviceKind::Physical);

        let only_a = DeviceSelectionOptions::new().with_serial("A1");
        assert!(only_a.matches(&a));
        assert!(!only_a.matches(&b));

        let not_a = DeviceSelectionOptions::new().excluding("A1");
        assert!(!not_a.matches(&a));
        assert!(not_a.matches(&b));
    }

    #[test]
    fn connectivity_and_fastboot_filters() {
        let f = factory();
        let device = f.create_device("A1", DeviceKind::Physical);
        let fastboot = DeviceSelectionOptions::new().with_connectivity(ConnectivityState::Fastboot);
        assert!(!fastboot.matches(&device));
        device.set_connectivity(ConnectivityState::Fastboot);
        assert!(fastboot.matches(&device));
        assert!(!DeviceSelectionOptions::new().require_fastboot().matches(&device));
    }

    #[test]
    fn closures_are_criteria() {
        let f = factory();
        let device = f.create_device("A1", DeviceKind::Physical);
        let starts_with_a = |d: &ManagedDevice| d.serial().starts_with('A');
        assert!(starts_with_a.matches(&device));
        assert!(AnyDevice.matches(&device));
    }
}
