//! Live registry of managed devices.
//!
//! All mutation happens under one lock: find-or-create, allocation, release,
//! bulk fastboot updates and removal. Readers take a snapshot, which copies
//! the `Arc`s and may already be stale when inspected.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use crate::device::{DeviceFactory, DeviceKind, ManagedDevice};
use crate::selection::DeviceSelection;
use crate::state::{AllocationState, ConnectivityState, DeviceEvent, Transition};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Published whenever a handle's allocation state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationChange {
    pub serial: String,
    pub previous: AllocationState,
    pub current: AllocationState,
}

pub struct DeviceRegistry {
    devices: StdMutex<Vec<Arc<ManagedDevice>>>,
    factory: Arc<dyn DeviceFactory>,
    changes: broadcast::Sender<AllocationChange>,
}

/// A serial the registry will track: at least two characters, no `?`.
pub fn is_valid_serial(serial: &str) -> bool {
    serial.len() > 1 && !serial.contains('?')
}

impl DeviceRegistry {
    pub fn new(factory: Arc<dyn DeviceFactory>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            devices: StdMutex::new(Vec::new()),
            factory,
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<ManagedDevice>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AllocationChange> {
        self.changes.subscribe()
    }

    fn apply(&self, device: &ManagedDevice, event: DeviceEvent) -> Transition {
        let previous = device.allocation_state();
        let transition = device.handle_allocation_event(event);
        if transition.changed {
            let _ = self.changes.send(AllocationChange {
                serial: device.serial().to_string(),
                previous,
                current: transition.state,
            });
        }
        transition
    }

    pub fn find(&self, serial: &str) -> Option<Arc<ManagedDevice>> {
        self.lock().iter().find(|d| d.serial() == serial).cloned()
    }

    /// Return the live handle for `serial`, creating one if there is none or
    /// the existing one is unavailable.
    pub fn find_or_create(&self, serial: &str, kind: DeviceKind) -> Option<Arc<ManagedDevice>> {
        if !is_valid_serial(serial) {
            tracing::debug!(serial = %serial, "Ignoring invalid serial");
            return None;
        }
        let mut devices = self.lock();
        let position = devices.iter().position(|d| d.serial() == serial);
        if let Some(index) = position
            && devices[index].allocation_state() != AllocationState::Unavailable
        {
            return Some(Arc::clone(&devices[index]));
        }

        let device = self.factory.create_device(serial, kind);
        match position {
            Some(index) => {
                let stale = devices.remove(index);
                device.inherit_disconnects(stale.disconnect_count());
                tracing::debug!(
                    serial = %serial,
                    disconnects = stale.disconnect_count(),
                    "Replacing unavailable device handle"
                );
            }
            None => tracing::debug!(serial = %serial, ?kind, "Tracking new device"),
        }
        devices.push(Arc::clone(&device));
        Some(device)
    }

    /// Allocate the first device matching `criteria`, moving it to the back
    /// so repeated requests rotate through idle devices.
    pub fn allocate(&self, criteria: &dyn DeviceSelection) -> Option<Arc<ManagedDevice>> {
        let mut devices = self.lock();
        let mut allocated = None;
        for (index, device) in devices.iter().enumerate() {
            if !criteria.matches(device) {
                continue;
            }
            let transition = self.apply(device, DeviceEvent::AllocateRequest);
            if transition.changed && transition.state == AllocationState::Allocated {
                allocated = Some(index);
                break;
            }
        }
        let index = allocated?;
        let device = devices.remove(index);
        devices.push(Arc::clone(&device));
        tracing::info!(serial = %device.serial(), "Allocated device");
        Some(device)
    }

    /// Apply `event` to `device`, dropping it from the registry if it
    /// becomes unknown.
    pub fn handle_device_event(&self, device: &Arc<ManagedDevice>, event: DeviceEvent) -> Transition {
        let mut devices = self.lock();
        let transition = self.apply(device, event);
        if transition.changed && transition.state == AllocationState::Unknown {
            devices.retain(|d| !Arc::ptr_eq(d, device));
            tracing::info!(serial = %device.serial(), "Removed device from registry");
        }
        transition
    }

    /// Release an allocated device. Returns `None` when `device` is not an
    /// allocated member of this registry.
    pub fn free(&self, device: &Arc<ManagedDevice>, event: DeviceEvent) -> Option<Transition> {
        let mut devices = self.lock();
        let member = devices.iter().any(|d| Arc::ptr_eq(d, device));
        if !member || device.allocation_state() != AllocationState::Allocated {
            tracing::debug!(serial = %device.serial(), member, "Ignoring free of unallocated device");
            return None;
        }
        let transition = self.apply(device, event);
        if transition.state == AllocationState::Unknown {
            devices.retain(|d| !Arc::ptr_eq(d, device));
        }
        tracing::info!(serial = %device.serial(), state = %transition.state, "Freed device");
        Some(transition)
    }

    /// Mark devices listed by the fastboot tool; devices that left fastboot
    /// are treated as disconnected.
    pub fn update_fastboot_states(&self, serials: &HashSet<String>) {
        let mut devices = self.lock();
        let mut removed = Vec::new();
        for device in devices.iter() {
            if serials.contains(device.serial()) {
                device.set_connectivity(ConnectivityState::Fastboot);
            } else if device.connectivity() == ConnectivityState::Fastboot {
                device.set_connectivity(ConnectivityState::NotAvailable);
                let transition = self.apply(device, DeviceEvent::Disconnected);
                if transition.state == AllocationState::Unknown {
                    removed.push(Arc::clone(device));
                }
            }
        }
        if !removed.is_empty() {
            devices.retain(|d| !removed.iter().any(|r| Arc::ptr_eq(d, r)));
            for device in &removed {
                tracing::info!(serial = %device.serial(), "Device left fastboot, removed");
            }
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<ManagedDevice>> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
