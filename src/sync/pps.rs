//! PPS sync module: pairs one-per-second pulses from a timestamping NIC or
//! GPS receiver with a time-of-day source. The pulse fixes the sub-second
//! phase; without time-of-day the module still measures phase but cannot
//! discipline absolute time. The same servicer backs the `pps` and `gps`
//! kinds.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tracing::warn;

use crate::adapters::pps::{PpsPulse, PpsSource};
use crate::domain::grandmaster::{ClockClass, ClockIdentity, TimeSource};
use crate::domain::state::{Alarms, SyncState};
use crate::domain::timespec::NS_PER_SEC;
use crate::runtime::ThreadCtx;

use super::{ModuleCore, ModuleKind, SyncError, SyncServicer};

#[derive(Debug, Clone)]
pub struct PpsConfig {
    /// Whether an aligned time-of-day source is available. GPS-fed modules
    /// have one by construction.
    pub tod_available: bool,
    /// Ticks without a pulse before the no-signal alarm raises.
    pub signal_timeout_ticks: u32,
    /// Phase offsets beyond this magnitude mean the pulse is nowhere near
    /// a second boundary.
    pub bad_signal_threshold_ns: f64,
}

impl Default for PpsConfig {
    fn default() -> Self {
        PpsConfig {
            tod_available: false,
            signal_timeout_ticks: 3,
            bad_signal_threshold_ns: 400_000_000.0,
        }
    }
}

pub struct PpsServicer {
    config: PpsConfig,
    source: Box<dyn PpsSource>,
    last_seq: Option<u64>,
    ticks_since_pulse: u32,
    had_signal: bool,
}

impl PpsServicer {
    pub fn new(config: PpsConfig, source: Box<dyn PpsSource>) -> Self {
        PpsServicer {
            config,
            source,
            last_seq: None,
            ticks_since_pulse: 0,
            had_signal: false,
        }
    }

    /// Phase of the pulse timestamp relative to the nearest second edge,
    /// in nanoseconds. A capture just before the edge reads as a small
    /// negative offset.
    fn phase_offset_ns(pulse: &PpsPulse) -> f64 {
        let phase =
            pulse.timestamp.nsec as f64 + pulse.timestamp.nsec_frac as f64 / 4_294_967_296.0;
        if phase >= NS_PER_SEC as f64 / 2.0 {
            phase - NS_PER_SEC as f64
        } else {
            phase
        }
    }

    fn ingest_pulse(&mut self, core: &mut ModuleCore, pulse: PpsPulse) {
        if let Some(last) = self.last_seq
            && pulse.seq != last.wrapping_add(1)
        {
            core.set_alarm(Alarms::PPS_SEQ_NUM_ERROR);
        } else {
            core.clear_alarm(Alarms::PPS_SEQ_NUM_ERROR);
        }
        self.last_seq = Some(pulse.seq);

        let offset_ns = Self::phase_offset_ns(&pulse);
        if offset_ns.abs() > self.config.bad_signal_threshold_ns {
            core.set_alarm(Alarms::PPS_BAD_SIGNAL);
            return;
        }
        core.clear_alarm(Alarms::PPS_BAD_SIGNAL);
        core.record_sample(offset_ns, None);
        if self.config.tod_available {
            core.discipline(offset_ns);
        }
    }
}

/// Stable identity for the pulse source.
fn pps_clock_identity(name: &str) -> ClockIdentity {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    ClockIdentity::from_u64(hasher.finish())
}

impl SyncServicer for PpsServicer {
    fn startup(&mut self, core: &mut ModuleCore, _ctx: &mut ThreadCtx) -> Result<(), SyncError> {
        let gm = &mut core.status.grandmaster;
        gm.clock_id = pps_clock_identity(&core.name);
        gm.remote = true;
        gm.clock_class = ClockClass::Unknown;
        gm.time_source = if core.kind == ModuleKind::Gps {
            TimeSource::Gps
        } else {
            TimeSource::Other
        };
        gm.accuracy_ns = 100.0;
        gm.allan_variance = 1e-20;
        gm.steps_removed = 1;
        core.status.state = SyncState::Listening;
        if !self.config.tod_available {
            core.set_alarm(Alarms::NO_TIME_OF_DAY);
        }
        Ok(())
    }

    fn tick(&mut self, core: &mut ModuleCore, _ctx: &mut ThreadCtx) {
        let mut latest: Option<PpsPulse> = None;
        loop {
            match self.source.fetch() {
                Ok(Some(pulse)) => latest = Some(pulse),
                Ok(None) => break,
                Err(e) => {
                    warn!(instance = %core.name, error = %e, "pps fetch failed");
                    break;
                }
            }
        }

        match latest {
            Some(pulse) => {
                self.ticks_since_pulse = 0;
                self.had_signal = true;
                core.clear_alarm(Alarms::PPS_NO_SIGNAL);
                core.note_tick_success();
                self.ingest_pulse(core, pulse);
                core.status.grandmaster.clock_class = ClockClass::Locked;
                core.status.state = if self.config.tod_available {
                    SyncState::Slave
                } else {
                    SyncState::Listening
                };
            }
            None => {
                self.ticks_since_pulse = self.ticks_since_pulse.saturating_add(1);
                if self.ticks_since_pulse > self.config.signal_timeout_ticks {
                    core.note_tick_failure(Alarms::PPS_NO_SIGNAL);
                    core.status.state = SyncState::Listening;
                    if self.had_signal {
                        core.status.grandmaster.clock_class = ClockClass::Holdover;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::pps::ScriptedPps;
    use crate::domain::timespec::Timespec;
    use crate::sync::test_support::{core_fixture, ctx_fixture};

    fn servicer(config: PpsConfig, pulses: Vec<(u64, Timespec)>) -> PpsServicer {
        let mut source = ScriptedPps::new();
        for (seq, ts) in pulses {
            source.push(seq, ts);
        }
        PpsServicer::new(config, Box::new(source))
    }

    fn gps_config() -> PpsConfig {
        PpsConfig {
            tod_available: true,
            ..PpsConfig::default()
        }
    }

    #[test]
    fn test_pulse_just_after_edge() {
        let mut s = servicer(gps_config(), vec![(1, Timespec::new(100, 28_893, 0))]);
        let mut core = core_fixture("gps1", ModuleKind::Gps);
        let mut ctx = ctx_fixture("gps1");
        s.startup(&mut core, &mut ctx).unwrap();
        s.tick(&mut core, &mut ctx);
        assert_eq!(core.status.state, SyncState::Slave);
        assert_eq!(core.status.offset_from_master, Timespec::from_ns(28_893));
        assert!(core.status.alarms.is_empty());
    }

    #[test]
    fn test_pulse_just_before_edge_is_negative() {
        // Capture 28893 ns before the second boundary.
        let mut s = servicer(gps_config(), vec![(1, Timespec::new(99, 999_971_107, 0))]);
        let mut core = core_fixture("gps1", ModuleKind::Gps);
        let mut ctx = ctx_fixture("gps1");
        s.startup(&mut core, &mut ctx).unwrap();
        s.tick(&mut core, &mut ctx);
        assert_eq!(core.status.offset_from_master, Timespec::from_ns(-28_893));
    }

    #[test]
    fn test_sequence_gap_raises_alarm() {
        let mut s = servicer(
            gps_config(),
            vec![(1, Timespec::new(10, 100, 0))],
        );
        let mut core = core_fixture("gps1", ModuleKind::Gps);
        let mut ctx = ctx_fixture("gps1");
        s.startup(&mut core, &mut ctx).unwrap();
        s.tick(&mut core, &mut ctx);
        assert!(!core.status.alarms.contains(Alarms::PPS_SEQ_NUM_ERROR));

        // Pulse 3 arrives next: pulse 2 was lost.
        s.source = Box::new({
            let mut src = ScriptedPps::new();
            src.push(3, Timespec::new(12, 100, 0));
            src
        });
        s.tick(&mut core, &mut ctx);
        assert!(core.status.alarms.contains(Alarms::PPS_SEQ_NUM_ERROR));
    }

    #[test]
    fn test_no_signal_escalates() {
        let mut s = servicer(
            PpsConfig {
                tod_available: true,
                signal_timeout_ticks: 2,
                ..PpsConfig::default()
            },
            vec![(1, Timespec::new(10, 100, 0))],
        );
        let mut core = core_fixture("pps1", ModuleKind::Pps);
        let mut ctx = ctx_fixture("pps1");
        s.startup(&mut core, &mut ctx).unwrap();
        s.tick(&mut core, &mut ctx);
        assert_eq!(core.status.grandmaster.clock_class, ClockClass::Locked);
        for _ in 0..4 {
            s.tick(&mut core, &mut ctx);
        }
        assert!(core.status.alarms.contains(Alarms::PPS_NO_SIGNAL));
        assert_eq!(core.status.grandmaster.clock_class, ClockClass::Holdover);
        assert_eq!(core.status.state, SyncState::Listening);
    }

    #[test]
    fn test_bad_signal_rejected() {
        // A pulse landing mid-second is not a usable PPS edge.
        let mut s = servicer(gps_config(), vec![(1, Timespec::new(10, 450_000_000, 0))]);
        let mut core = core_fixture("gps1", ModuleKind::Gps);
        let mut ctx = ctx_fixture("gps1");
        s.startup(&mut core, &mut ctx).unwrap();
        s.tick(&mut core, &mut ctx);
        assert!(core.status.alarms.contains(Alarms::PPS_BAD_SIGNAL));
        assert_eq!(core.status.offset_from_master, Timespec::ZERO);
    }

    #[test]
    fn test_missing_tod_marks_alarm_and_listens() {
        let mut s = servicer(PpsConfig::default(), vec![(1, Timespec::new(10, 500, 0))]);
        let mut core = core_fixture("pps1", ModuleKind::Pps);
        let mut ctx = ctx_fixture("pps1");
        s.startup(&mut core, &mut ctx).unwrap();
        s.tick(&mut core, &mut ctx);
        assert!(core.status.alarms.contains(Alarms::NO_TIME_OF_DAY));
        assert_eq!(core.status.state, SyncState::Listening);
    }
}
