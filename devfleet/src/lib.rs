//! devfleet: allocation and recovery engine for fleets of attached test devices.

mod background;
mod fastboot;
mod flashing;
mod recovery;
mod selection;
mod state;

pub mod adb;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod manager;
pub mod monitor;
pub mod probe;
pub mod registry;

#[cfg(test)]
mod testing;

pub use adb::AdbBridge;
pub use background::BackgroundDeviceAction;
pub use command::{CommandResult, CommandRunner, CommandStatus, ProcessRunner};
pub use config::{FleetConfig, MonitorConfig, NetworkCheck, RecoveryConfig};
pub use device::{DeviceCapabilities, DeviceFactory, DeviceKind, ManagedDevice, ManagedDeviceFactory};
pub use error::{DeviceError, ProbeError};
pub use fastboot::FastbootHelper;
pub use flashing::{FlashingPermit, FlashingPermits};
pub use manager::{DeviceDescriptor, DeviceManager, ManagerError};
pub use monitor::DeviceStateMonitor;
pub use probe::{
    CancellableSink, CollectingSink, ConnectivityProbe, OutputSink, ProbeDevice, ProbeEvent,
};
pub use recovery::{
    AbortRecovery, DeviceRecovery, ReconnectRecovery, RecoveryLevel, RetryingRecovery,
    WaitDeviceRecovery,
};
pub use registry::{AllocationChange, DeviceRegistry};
pub use selection::{AnyDevice, DeviceSelection, DeviceSelectionOptions};
pub use state::{AllocationState, ConnectivityState, DeviceEvent, FreeDeviceState, Transition};
