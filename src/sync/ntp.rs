//! NTP sync module: tracks an external NTP daemon (ntpd or chronyd)
//! through the semantic control client and arbitrates who disciplines the
//! system clock. The same servicer backs the `ntp` and `crny` kinds; only
//! the transport differs.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tracing::{debug, warn};

use crate::adapters::ntp_client::{NtpClient, NtpSysInfo, NtpTransport};
use crate::domain::grandmaster::{ClockClass, ClockIdentity, TimeSource};
use crate::domain::state::{Alarms, ControlFlags, SyncState};
use crate::runtime::ThreadCtx;

use super::{ModuleCore, SyncError, SyncServicer};

pub struct NtpServicer {
    client: NtpClient<Box<dyn NtpTransport>>,
    /// Clock-control hand-off that still needs to reach the daemon.
    pending_clock_control: Option<bool>,
}

impl NtpServicer {
    pub fn new(client: NtpClient<Box<dyn NtpTransport>>) -> Self {
        NtpServicer {
            client,
            pending_clock_control: None,
        }
    }

    fn apply_clock_control(&mut self, core: &mut ModuleCore) {
        let Some(enable) = self.pending_clock_control else {
            return;
        };
        match self.client.clock_control(enable) {
            Ok(()) => {
                debug!(instance = %core.name, enable, "daemon clock control updated");
                self.pending_clock_control = None;
                core.clear_alarm(Alarms::CLOCK_CTRL_FAILURE);
            }
            Err(e) => {
                warn!(
                    instance = %core.name,
                    errno = e.errno(),
                    error = %e,
                    "daemon clock control failed"
                );
                core.set_alarm(Alarms::CLOCK_CTRL_FAILURE);
            }
        }
    }

    fn ingest_sys_info(&mut self, core: &mut ModuleCore, info: &NtpSysInfo) {
        core.note_tick_success();
        core.clear_alarm(Alarms::NO_TIME_OF_DAY);
        core.leap = info.leap;

        let synced = info.peer_selected && info.stratum >= 1 && info.stratum < 16;
        core.status.state = if synced {
            SyncState::Slave
        } else {
            SyncState::Listening
        };

        let gm = &mut core.status.grandmaster;
        gm.clock_id = ref_id_identity(&info.ref_id);
        gm.remote = true;
        gm.clock_class = if synced {
            ClockClass::Locked
        } else {
            ClockClass::Freerunning
        };
        gm.time_source = TimeSource::Ntp;
        gm.accuracy_ns = if synced {
            info.root_dispersion_ns + info.root_delay_ns / 2.0
        } else {
            f64::INFINITY
        };
        gm.allan_variance = f64::INFINITY;
        gm.steps_removed = info.stratum as u16;

        if synced {
            core.record_sample(info.offset.to_f64_ns(), None);
        }
    }
}

/// Stable clock identity derived from the daemon's reference id.
fn ref_id_identity(ref_id: &str) -> ClockIdentity {
    let mut hasher = DefaultHasher::new();
    ref_id.hash(&mut hasher);
    ClockIdentity::from_u64(hasher.finish())
}

impl SyncServicer for NtpServicer {
    fn startup(&mut self, core: &mut ModuleCore, _ctx: &mut ThreadCtx) -> Result<(), SyncError> {
        if let Err(e) = self.client.test_connection() {
            // The daemon may simply not be up yet; report and keep polling.
            warn!(instance = %core.name, error = %e, "ntp daemon unreachable at startup");
            core.set_alarm(Alarms::NO_TIME_OF_DAY);
        }
        core.status.state = SyncState::Listening;
        Ok(())
    }

    fn tick(&mut self, core: &mut ModuleCore, _ctx: &mut ThreadCtx) {
        self.apply_clock_control(core);
        match self.client.get_sys_info() {
            Ok(info) => self.ingest_sys_info(core, &info),
            Err(e) => {
                debug!(instance = %core.name, errno = e.errno(), "sys info query failed");
                core.note_tick_failure(Alarms::NO_TIME_OF_DAY);
                core.status.state = if core.status.alarms.contains(Alarms::SUSTAINED_SYNC_FAILURE)
                {
                    SyncState::Faulty
                } else {
                    SyncState::Listening
                };
            }
        }
    }

    fn control_changed(&mut self, core: &mut ModuleCore, previous: ControlFlags) {
        let had = previous.contains(ControlFlags::CLOCK_CTRL);
        let has = core.has_clock_ctrl();
        if had != has {
            self.pending_clock_control = Some(has);
            self.apply_clock_control(core);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ntp_client::{
        NtpClientError, NtpRequest, NtpResponse, WireMode,
    };
    use crate::domain::timespec::Timespec;
    use crate::sync::ModuleKind;
    use crate::sync::test_support::{core_fixture, ctx_fixture};

    struct FakeDaemon {
        reachable: bool,
        synced: bool,
        control_calls: Vec<bool>,
        deny_control: bool,
    }

    impl FakeDaemon {
        fn new() -> Self {
            FakeDaemon {
                reachable: true,
                synced: true,
                control_calls: Vec::new(),
                deny_control: false,
            }
        }
    }

    impl NtpTransport for FakeDaemon {
        fn exchange(
            &mut self,
            _mode: WireMode,
            request: &NtpRequest,
        ) -> Result<NtpResponse, NtpClientError> {
            if !self.reachable {
                return Err(NtpClientError::Timeout);
            }
            match request {
                NtpRequest::SysInfo => Ok(NtpResponse::SysInfo(NtpSysInfo {
                    stratum: if self.synced { 2 } else { 16 },
                    offset: Timespec::from_ns(1500),
                    root_delay_ns: 2000.0,
                    root_dispersion_ns: 500.0,
                    ref_id: "192.0.2.10".into(),
                    peer_selected: self.synced,
                    ..NtpSysInfo::default()
                })),
                NtpRequest::ClockControl { enable, .. } => {
                    if self.deny_control {
                        return Err(NtpClientError::AuthFailed);
                    }
                    self.control_calls.push(*enable);
                    Ok(NtpResponse::Ack)
                }
                _ => Ok(NtpResponse::Ack),
            }
        }
    }

    fn servicer(daemon: FakeDaemon) -> NtpServicer {
        let transport: Box<dyn NtpTransport> = Box::new(daemon);
        NtpServicer::new(NtpClient::new(transport, WireMode::Control, None))
    }

    #[test]
    fn test_synced_daemon_reports_slave() {
        let mut s = servicer(FakeDaemon::new());
        let mut core = core_fixture("ntp1", ModuleKind::Ntp);
        let mut ctx = ctx_fixture("ntp1");
        s.tick(&mut core, &mut ctx);
        assert_eq!(core.status.state, SyncState::Slave);
        assert_eq!(core.status.offset_from_master, Timespec::from_ns(1500));
        assert_eq!(core.status.grandmaster.clock_class, ClockClass::Locked);
        assert_eq!(core.status.grandmaster.steps_removed, 2);
        assert_eq!(core.status.grandmaster.accuracy_ns, 1500.0);
        assert!(core.status.alarms.is_empty());
    }

    #[test]
    fn test_unsynced_daemon_listens() {
        let mut daemon = FakeDaemon::new();
        daemon.synced = false;
        let mut s = servicer(daemon);
        let mut core = core_fixture("ntp1", ModuleKind::Ntp);
        let mut ctx = ctx_fixture("ntp1");
        s.tick(&mut core, &mut ctx);
        assert_eq!(core.status.state, SyncState::Listening);
        assert_eq!(
            core.status.grandmaster.clock_class,
            ClockClass::Freerunning
        );
    }

    #[test]
    fn test_unreachable_daemon_escalates_to_faulty() {
        let mut daemon = FakeDaemon::new();
        daemon.reachable = false;
        let mut s = servicer(daemon);
        let mut core = core_fixture("ntp1", ModuleKind::Ntp);
        let mut ctx = ctx_fixture("ntp1");
        s.tick(&mut core, &mut ctx);
        assert!(core.status.alarms.contains(Alarms::NO_TIME_OF_DAY));
        assert_eq!(core.status.state, SyncState::Listening);
        for _ in 0..super::super::SUSTAINED_FAILURE_TICKS {
            s.tick(&mut core, &mut ctx);
        }
        assert!(core.status.alarms.contains(Alarms::SUSTAINED_SYNC_FAILURE));
        assert_eq!(core.status.state, SyncState::Faulty);
    }

    #[test]
    fn test_clock_control_handoff() {
        let mut s = servicer(FakeDaemon::new());
        let mut core = core_fixture("ntp1", ModuleKind::Ntp);
        let previous = core.status.control_flags;
        core.status.control_flags |= ControlFlags::CLOCK_CTRL | ControlFlags::SELECTED;
        s.control_changed(&mut core, previous);
        assert!(s.pending_clock_control.is_none());

        let previous = core.status.control_flags;
        core.status.control_flags &= !ControlFlags::CLOCK_CTRL;
        s.control_changed(&mut core, previous);
        assert!(s.pending_clock_control.is_none());
        assert!(!core.status.alarms.contains(Alarms::CLOCK_CTRL_FAILURE));
    }

    #[test]
    fn test_clock_control_denied_raises_alarm_and_retries() {
        let mut daemon = FakeDaemon::new();
        daemon.deny_control = true;
        let mut s = servicer(daemon);
        let mut core = core_fixture("ntp1", ModuleKind::Ntp);
        let mut ctx = ctx_fixture("ntp1");
        let previous = core.status.control_flags;
        core.status.control_flags |= ControlFlags::CLOCK_CTRL;
        s.control_changed(&mut core, previous);
        assert!(core.status.alarms.contains(Alarms::CLOCK_CTRL_FAILURE));
        assert!(s.pending_clock_control.is_some());
        // Still pending on the next tick; the daemon keeps refusing.
        s.tick(&mut core, &mut ctx);
        assert!(core.status.alarms.contains(Alarms::CLOCK_CTRL_FAILURE));
    }
}
