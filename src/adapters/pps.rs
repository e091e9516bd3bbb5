//! Pulse-per-second input sources.
//!
//! A PPS-capable NIC (or a GPS receiver) raises one timestamped pulse per
//! second; the module pairs each pulse with a time-of-day reading to turn
//! the sub-second phase into an absolute offset.

use crate::domain::timespec::Timespec;

/// One captured pulse.
#[derive(Debug, Clone, Copy)]
pub struct PpsPulse {
    /// Monotonically increasing capture sequence number.
    pub seq: u64,
    /// System-time capture of the pulse edge.
    pub timestamp: Timespec,
}

/// Source of PPS pulses. `fetch` is non-blocking and returns the next
/// captured pulse, if one is pending.
pub trait PpsSource: Send {
    fn fetch(&mut self) -> std::io::Result<Option<PpsPulse>>;
}

/// Scripted source for tests.
#[derive(Debug, Default)]
pub struct ScriptedPps {
    pulses: std::collections::VecDeque<PpsPulse>,
}

impl ScriptedPps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, seq: u64, timestamp: Timespec) {
        self.pulses.push_back(PpsPulse { seq, timestamp });
    }
}

impl PpsSource for ScriptedPps {
    fn fetch(&mut self) -> std::io::Result<Option<PpsPulse>> {
        Ok(self.pulses.pop_front())
    }
}
