//! Connectivity and allocation states for managed devices.
//!
//! Allocation is driven by a pure transition function over
//! `(AllocationState, DeviceEvent)`. Pairs with no defined transition leave the
//! state untouched and report `changed == false`.

use serde::{Deserialize, Serialize};

/// Transport-level reachability of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectivityState {
    /// In the bootloader, reachable through the fastboot tool only
    Fastboot,
    /// Visible on the bridge and accepting shell commands
    Online,
    /// Booted into the recovery image
    Recovery,
    /// Not visible at all
    #[default]
    NotAvailable,
}

impl ConnectivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityState::Fastboot => "FASTBOOT",
            ConnectivityState::Online => "ONLINE",
            ConnectivityState::Recovery => "RECOVERY",
            ConnectivityState::NotAvailable => "NOT_AVAILABLE",
        }
    }
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling state of a device handle.
///
/// The declaration order is the order used when listing devices.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationState {
    /// Idle and ready to hand out
    Available,
    /// Held by exactly one caller
    Allocated,
    /// Connected; readiness check in flight
    CheckingAvailability,
    /// Known but not usable right now
    Unavailable,
    /// Excluded by the global device filter
    Ignored,
    /// Forgotten; the registry drops handles that reach this state
    #[default]
    Unknown,
}

impl AllocationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationState::Available => "AVAILABLE",
            AllocationState::Allocated => "ALLOCATED",
            AllocationState::CheckingAvailability => "CHECKING_AVAILABILITY",
            AllocationState::Unavailable => "UNAVAILABLE",
            AllocationState::Ignored => "IGNORED",
            AllocationState::Unknown => "UNKNOWN",
        }
    }

    /// Compute the successor state for `event`.
    ///
    /// `disconnects_exhausted` is true once the handle has seen more disconnects
    /// than the configured threshold allows.
    pub fn transition(self, event: DeviceEvent, disconnects_exhausted: bool) -> Transition {
        use AllocationState::*;
        use DeviceEvent::*;

        let lost = if disconnects_exhausted {
            Unknown
        } else {
            Unavailable
        };

        let next = match (self, event) {
            (current, ForceAllocateRequest) if current != Allocated => Some(Allocated),

            (Unknown, ConnectedOnline | StateChangeOnline) => Some(CheckingAvailability),
            (Unknown, ConnectedOffline | StateChangeOffline) => Some(Unavailable),
            (Unknown, ForceAvailable) => Some(Available),
            (Unknown, AvailableCheckIgnored) => Some(Ignored),

            (CheckingAvailability, AvailableCheckPassed) => Some(Available),
            (CheckingAvailability, AvailableCheckFailed) => Some(Unavailable),
            (CheckingAvailability, AvailableCheckIgnored) => Some(Ignored),
            (CheckingAvailability, ConnectedOffline | StateChangeOffline) => Some(Unavailable),
            (CheckingAvailability, Disconnected) => Some(lost),

            (Available, AllocateRequest) => Some(Allocated),
            (Available, ConnectedOffline | StateChangeOffline) => Some(Unavailable),
            (Available, Disconnected) => Some(lost),

            (Allocated, FreeAvailable | FreeUnresponsive) => Some(Available),
            (Allocated, FreeUnavailable) => Some(Unavailable),
            (Allocated, FreeUnknown) => Some(Unknown),
            (Allocated, Disconnected) => Some(Unavailable),

            (Unavailable, ConnectedOnline | StateChangeOnline) => Some(CheckingAvailability),
            (Unavailable, ForceAvailable) => Some(Available),
            (Unavailable, Disconnected) => Some(lost),

            (Ignored, Disconnected) => Some(Unknown),

            _ => None,
        };

        match next {
            Some(state) => Transition {
                state,
                changed: state != self,
            },
            None => Transition {
                state: self,
                changed: false,
            },
        }
    }
}

impl std::fmt::Display for AllocationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input symbols for the allocation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEvent {
    ConnectedOnline,
    ConnectedOffline,
    StateChangeOnline,
    StateChangeOffline,
    Disconnected,
    ForceAvailable,
    AvailableCheckPassed,
    AvailableCheckFailed,
    AvailableCheckIgnored,
    AllocateRequest,
    ForceAllocateRequest,
    FreeAvailable,
    FreeUnavailable,
    FreeUnresponsive,
    FreeUnknown,
}

impl DeviceEvent {
    pub const ALL: [DeviceEvent; 15] = [
        DeviceEvent::ConnectedOnline,
        DeviceEvent::ConnectedOffline,
        DeviceEvent::StateChangeOnline,
        DeviceEvent::StateChangeOffline,
        DeviceEvent::Disconnected,
        DeviceEvent::ForceAvailable,
        DeviceEvent::AvailableCheckPassed,
        DeviceEvent::AvailableCheckFailed,
        DeviceEvent::AvailableCheckIgnored,
        DeviceEvent::AllocateRequest,
        DeviceEvent::ForceAllocateRequest,
        DeviceEvent::FreeAvailable,
        DeviceEvent::FreeUnavailable,
        DeviceEvent::FreeUnresponsive,
        DeviceEvent::FreeUnknown,
    ];
}

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: AllocationState,
    pub changed: bool,
}

/// Condition reported by the caller when returning a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreeDeviceState {
    /// Device is healthy and can be handed out again
    Available,
    /// Device could not be reached at the end of use
    Unavailable,
    /// Device is reachable but stopped answering commands
    Unresponsive,
    /// Device should no longer be tracked
    Ignore,
}

impl FreeDeviceState {
    pub fn event(&self) -> DeviceEvent {
        match self {
            FreeDeviceState::Available => DeviceEvent::FreeAvailable,
            FreeDeviceState::Unavailable => DeviceEvent::FreeUnavailable,
            FreeDeviceState::Unresponsive => DeviceEvent::FreeUnresponsive,
            FreeDeviceState::Ignore => DeviceEvent::FreeUnknown,
        }
    }
}
