//! Grandmaster characterization shared by every sync-module kind.

use serde::Serialize;

/// 64-bit identity of a clock, EUI-64 style. Renders as colon-separated
/// hex pairs in logs, state dumps and topology output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct ClockIdentity(pub [u8; 8]);

impl ClockIdentity {
    pub fn from_u64(id: u64) -> Self {
        Self(id.to_be_bytes())
    }

    pub fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl std::fmt::Display for ClockIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// Coarse clock class of a reference, ordered best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockClass {
    /// Locked to its primary reference.
    Locked,
    /// Reference lost, running on trusted local stability.
    Holdover,
    /// Never had a reference.
    Freerunning,
    #[default]
    Unknown,
}

impl ClockClass {
    /// PTP numeric clock class. Smaller is better for the selector.
    pub fn as_ptp(self) -> u8 {
        match self {
            ClockClass::Locked => 6,
            ClockClass::Holdover => 7,
            ClockClass::Freerunning => 248,
            ClockClass::Unknown => 255,
        }
    }

    pub fn from_ptp(class: u8) -> Self {
        match class {
            6 | 13 => ClockClass::Locked,
            7 | 14 | 52 | 58 => ClockClass::Holdover,
            187 | 193 | 248 => ClockClass::Freerunning,
            _ => ClockClass::Unknown,
        }
    }
}

impl std::fmt::Display for ClockClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClockClass::Locked => "locked",
            ClockClass::Holdover => "holdover",
            ClockClass::Freerunning => "freerunning",
            ClockClass::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Where the grandmaster ultimately gets its time from. Remote instances
/// learn this from the reference (PTP announce); local ones report their
/// own source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeSource {
    AtomicClock,
    Gps,
    TerrestrialRadio,
    Ptp,
    Ntp,
    HandSet,
    Other,
    #[default]
    InternalOscillator,
}

impl TimeSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeSource::AtomicClock => "atomic-clock",
            TimeSource::Gps => "gps",
            TimeSource::TerrestrialRadio => "terrestrial-radio",
            TimeSource::Ptp => "ptp",
            TimeSource::Ntp => "ntp",
            TimeSource::HandSet => "hand-set",
            TimeSource::Other => "other",
            TimeSource::InternalOscillator => "internal-oscillator",
        }
    }
}

impl std::fmt::Display for TimeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Characteristics of the ultimate time source behind an instance.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GrandmasterInfo {
    pub clock_id: ClockIdentity,
    /// False when the grandmaster is this host itself.
    pub remote: bool,
    pub clock_class: ClockClass,
    pub time_source: TimeSource,
    /// Accuracy in nanoseconds, `f64::INFINITY` when unknown.
    pub accuracy_ns: f64,
    pub allan_variance: f64,
    pub steps_removed: u16,
    pub time_traceable: bool,
    pub freq_traceable: bool,
}

impl Default for GrandmasterInfo {
    fn default() -> Self {
        GrandmasterInfo {
            clock_id: ClockIdentity::default(),
            remote: false,
            clock_class: ClockClass::Unknown,
            time_source: TimeSource::InternalOscillator,
            accuracy_ns: f64::INFINITY,
            allan_variance: f64::INFINITY,
            steps_removed: 0,
            time_traceable: false,
            freq_traceable: false,
        }
    }
}

impl GrandmasterInfo {
    /// True when the fields the selector and engine react to differ.
    pub fn differs_from(&self, other: &GrandmasterInfo) -> bool {
        self.clock_id != other.clock_id
            || self.clock_class != other.clock_class
            || self.accuracy_ns != other.accuracy_ns
            || self.allan_variance != other.allan_variance
            || self.steps_removed != other.steps_removed
    }
}
