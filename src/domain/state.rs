//! Sync-instance states, alarms and control bookkeeping.

use bitflags::bitflags;
use serde::Serialize;

/// Protocol state of a sync instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Listening,
    Slave,
    Master,
    Passive,
    Disabled,
    Faulty,
    Selection,
}

impl SyncState {
    /// Ranking used by the selector: lower is better.
    pub fn selection_priority(self) -> u8 {
        match self {
            SyncState::Slave => 0,
            SyncState::Listening | SyncState::Selection => 1,
            SyncState::Master | SyncState::Passive => 2,
            SyncState::Disabled | SyncState::Faulty => 3,
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncState::Listening => "listening",
            SyncState::Slave => "slave",
            SyncState::Master => "master",
            SyncState::Passive => "passive",
            SyncState::Disabled => "disabled",
            SyncState::Faulty => "faulty",
            SyncState::Selection => "selection",
        };
        f.write_str(s)
    }
}

bitflags! {
    /// Alarm conditions raised and cleared by a sync module. Any set bit
    /// disqualifies the instance from the selector's no-alarms rule.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
    pub struct Alarms: u32 {
        const NO_SYNC_PKTS = 1 << 0;
        const NO_FOLLOW_UPS = 1 << 1;
        const NO_DELAY_RESPS = 1 << 2;
        const PPS_NO_SIGNAL = 1 << 3;
        const PPS_SEQ_NUM_ERROR = 1 << 4;
        const NO_TIME_OF_DAY = 1 << 5;
        const PPS_BAD_SIGNAL = 1 << 6;
        const NO_INTERFACE = 1 << 7;
        const CLOCK_CTRL_FAILURE = 1 << 8;
        const CLOCK_NEAR_EPOCH = 1 << 9;
        const CAPS_MISMATCH = 1 << 10;
        const CLUSTERING_THRESHOLD_EXCEEDED = 1 << 11;
        const SUSTAINED_SYNC_FAILURE = 1 << 12;
    }
}

impl Alarms {
    /// Stable text for one alarm bit. Multi-bit input is a caller bug and
    /// renders as "?".
    pub fn name(self) -> &'static str {
        match self {
            Alarms::NO_SYNC_PKTS => "no-sync-pkts",
            Alarms::NO_FOLLOW_UPS => "no-follow-ups",
            Alarms::NO_DELAY_RESPS => "no-delay-resps",
            Alarms::PPS_NO_SIGNAL => "pps-no-signal",
            Alarms::PPS_SEQ_NUM_ERROR => "pps-seq-num-error",
            Alarms::NO_TIME_OF_DAY => "no-time-of-day",
            Alarms::PPS_BAD_SIGNAL => "pps-bad-signal",
            Alarms::NO_INTERFACE => "no-interface",
            Alarms::CLOCK_CTRL_FAILURE => "clock-ctrl-failure",
            Alarms::CLOCK_NEAR_EPOCH => "clock-near-epoch",
            Alarms::CAPS_MISMATCH => "caps-mismatch",
            Alarms::CLUSTERING_THRESHOLD_EXCEEDED => "clustering-threshold-exceeded",
            Alarms::SUSTAINED_SYNC_FAILURE => "sustained-sync-failure",
            _ => "?",
        }
    }

    /// Space-separated names of every set alarm, or "none".
    pub fn render(self) -> String {
        if self.is_empty() {
            return "none".into();
        }
        self.iter()
            .map(Alarms::name)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

bitflags! {
    /// Control flags set by the engine and observed by the module.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
    pub struct ControlFlags: u32 {
        const SELECTED = 1 << 0;
        const TIMESTAMP_PROCESSING = 1 << 1;
        const CLOCK_CTRL = 1 << 2;
        const LEAP_SECOND_GUARD = 1 << 3;
        const CLUSTERING_DETERMINANT = 1 << 4;
    }
}

impl ControlFlags {
    /// Flags a freshly created instance starts with.
    pub fn initial() -> Self {
        ControlFlags::TIMESTAMP_PROCESSING
    }

    /// Masked update: `(current & !mask) | (flags & mask)`.
    pub fn apply(self, flags: ControlFlags, mask: ControlFlags) -> Self {
        (self & !mask) | (flags & mask)
    }
}

bitflags! {
    /// Constraints a module places on its own selectability.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
    pub struct Constraints: u32 {
        const MUST_BE_SELECTED = 1 << 0;
        const CANNOT_BE_SELECTED = 1 << 1;
    }
}

impl Constraints {
    /// Selector scalar: must-select ranks ahead of unconstrained, which
    /// ranks ahead of cannot-select. Contradictory bits on one instance
    /// fall back to unconstrained so the ordering stays deterministic.
    pub fn selection_score(self) -> i8 {
        let must = self.contains(Constraints::MUST_BE_SELECTED);
        let cannot = self.contains(Constraints::CANNOT_BE_SELECTED);
        match (must, cannot) {
            (true, false) => -1,
            (false, true) => 1,
            _ => 0,
        }
    }
}

/// Leap-second announcement carried by broadcast updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeapType {
    #[default]
    None,
    /// Last minute of the day has 59 seconds.
    Leap59,
    /// Last minute of the day has 61 seconds.
    Leap61,
}

impl std::fmt::Display for LeapType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LeapType::None => "none",
            LeapType::Leap59 => "leap59",
            LeapType::Leap61 => "leap61",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_priorities() {
        assert!(SyncState::Slave.selection_priority() < SyncState::Listening.selection_priority());
        assert_eq!(
            SyncState::Listening.selection_priority(),
            SyncState::Selection.selection_priority()
        );
        assert_eq!(
            SyncState::Master.selection_priority(),
            SyncState::Passive.selection_priority()
        );
        assert!(SyncState::Passive.selection_priority() < SyncState::Faulty.selection_priority());
    }

    #[test]
    fn test_alarm_names_are_stable() {
        assert_eq!(Alarms::NO_SYNC_PKTS.name(), "no-sync-pkts");
        assert_eq!(Alarms::SUSTAINED_SYNC_FAILURE.name(), "sustained-sync-failure");
        let set = Alarms::PPS_NO_SIGNAL | Alarms::NO_INTERFACE;
        assert_eq!(set.render(), "pps-no-signal no-interface");
        assert_eq!(Alarms::empty().render(), "none");
    }

    #[test]
    fn test_control_flag_masked_apply() {
        let current = ControlFlags::initial();
        let next = current.apply(
            ControlFlags::SELECTED | ControlFlags::CLOCK_CTRL,
            ControlFlags::SELECTED | ControlFlags::CLOCK_CTRL,
        );
        assert!(next.contains(ControlFlags::SELECTED));
        assert!(next.contains(ControlFlags::TIMESTAMP_PROCESSING));
        let cleared = next.apply(ControlFlags::empty(), ControlFlags::SELECTED);
        assert!(!cleared.contains(ControlFlags::SELECTED));
        assert!(cleared.contains(ControlFlags::CLOCK_CTRL));
    }

    #[test]
    fn test_constraint_scores() {
        assert_eq!(Constraints::MUST_BE_SELECTED.selection_score(), -1);
        assert_eq!(Constraints::empty().selection_score(), 0);
        assert_eq!(Constraints::CANNOT_BE_SELECTED.selection_score(), 1);
        let both = Constraints::MUST_BE_SELECTED | Constraints::CANNOT_BE_SELECTED;
        assert_eq!(both.selection_score(), 0);
    }
}
