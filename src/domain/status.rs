//! Per-instance status snapshot published by each sync module.

use serde::Serialize;

use super::grandmaster::GrandmasterInfo;
use super::state::{Alarms, Constraints, ControlFlags, SyncState};
use super::timespec::Timespec;

/// Identity of one configured sync instance. Instance numbers are assigned
/// in configuration order; the lower-numbered instance always initiates
/// synchronous exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct InstanceId(pub u32);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "instance{}", self.0)
    }
}

/// Opaque handle addressing a local clock. Handle 0 is the system clock,
/// higher handles are PTP hardware clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ClockHandle(pub u32);

impl ClockHandle {
    pub const SYSTEM: ClockHandle = ClockHandle(0);

    pub fn phc(index: u32) -> Self {
        ClockHandle(index + 1)
    }

    pub fn is_system(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ClockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_system() {
            f.write_str("system")
        } else {
            write!(f, "phc{}", self.0 - 1)
        }
    }
}

/// Snapshot consumed by the engine and the selector.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub state: SyncState,
    pub alarms: Alarms,
    pub constraints: Constraints,
    pub control_flags: ControlFlags,
    pub clock: ClockHandle,
    pub offset_from_master: Timespec,
    pub user_priority: u8,
    pub grandmaster: GrandmasterInfo,
    /// Accuracy of the local measurement chain, nanoseconds.
    pub local_accuracy_ns: f64,
    /// Engine-defined agreement score, larger is better.
    pub clustering_score: i64,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        InstanceStatus {
            state: SyncState::Listening,
            alarms: Alarms::empty(),
            constraints: Constraints::empty(),
            control_flags: ControlFlags::initial(),
            clock: ClockHandle::SYSTEM,
            offset_from_master: Timespec::ZERO,
            user_priority: 128,
            grandmaster: GrandmasterInfo::default(),
            local_accuracy_ns: f64::INFINITY,
            clustering_score: 0,
        }
    }
}

impl InstanceStatus {
    /// Whether a freshly derived snapshot warrants a state-changed event to
    /// the engine.
    pub fn significant_change(&self, previous: &InstanceStatus) -> bool {
        self.state != previous.state
            || self.alarms != previous.alarms
            || self.grandmaster.differs_from(&previous.grandmaster)
            || self.clustering_score != previous.clustering_score
            || self.offset_from_master != previous.offset_from_master
    }
}
