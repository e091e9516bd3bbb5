//! PTP sync module: consumes codec events, feeds the timestamp dataset and
//! disciplines the clock while acting as slave. Master, passive and
//! monitor roles publish status without touching the clock.

use tracing::{debug, trace};

use crate::adapters::ptp_codec::{PtpCodec, PtpEvent};
use crate::domain::state::{Alarms, Constraints, ControlFlags, LeapType, SyncState};
use crate::runtime::ThreadCtx;

use super::dataset::TimestampSet;
use super::{ModuleCore, SyncError, SyncServicer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtpMode {
    Slave,
    Master,
    Passive,
    /// Observe and report, never eligible for clock control.
    Monitor,
}

#[derive(Debug, Clone)]
pub struct PtpConfig {
    pub mode: PtpMode,
    pub domain: u8,
    /// Ticks without a Sync before the no-sync alarm raises.
    pub sync_timeout_ticks: u32,
    /// Ticks without a Delay_Resp before the no-delay-resp alarm raises.
    pub delay_resp_timeout_ticks: u32,
}

impl Default for PtpConfig {
    fn default() -> Self {
        PtpConfig {
            mode: PtpMode::Slave,
            domain: 0,
            sync_timeout_ticks: 8,
            delay_resp_timeout_ticks: 8,
        }
    }
}

pub struct PtpServicer {
    config: PtpConfig,
    codec: Box<dyn PtpCodec>,
    dataset: TimestampSet,
    ticks_since_sync: u32,
    ticks_since_delay_resp: u32,
    announce_seen: bool,
    // Test-mode fault injection.
    drop_sync: bool,
    drop_delay_resp: bool,
}

impl PtpServicer {
    pub fn new(config: PtpConfig, codec: Box<dyn PtpCodec>) -> Self {
        PtpServicer {
            config,
            codec,
            dataset: TimestampSet::new(),
            ticks_since_sync: 0,
            ticks_since_delay_resp: 0,
            announce_seen: false,
            drop_sync: false,
            drop_delay_resp: false,
        }
    }

    pub fn dataset(&self) -> &TimestampSet {
        &self.dataset
    }

    fn drain_events(&mut self, core: &mut ModuleCore) -> (bool, bool) {
        let mut saw_sync = false;
        let mut saw_delay = false;
        let processing = core.processing_timestamps();
        while let Some(event) = self.codec.pull() {
            trace!(instance = %core.name, ?event, "codec event");
            match event {
                PtpEvent::Sync {
                    tx, rx, correction, ..
                } => {
                    if self.drop_sync {
                        continue;
                    }
                    saw_sync = true;
                    core.clear_alarm(Alarms::NO_FOLLOW_UPS);
                    if processing {
                        self.dataset.set_m2s(tx, rx, correction);
                    }
                }
                PtpEvent::DelayResp {
                    tx, rx, correction, ..
                } => {
                    if self.drop_delay_resp {
                        continue;
                    }
                    saw_delay = true;
                    if processing {
                        self.dataset.set_s2m(tx, rx, correction);
                    }
                }
                PtpEvent::PeerDelay {
                    s2p_tx,
                    s2p_rx,
                    p2s_tx,
                    p2s_rx,
                    correction,
                    ..
                } => {
                    saw_delay = true;
                    if processing {
                        self.dataset
                            .set_p2p(s2p_tx, s2p_rx, p2s_tx, p2s_rx, correction);
                    }
                }
                PtpEvent::FollowUpMissed { seq } => {
                    debug!(instance = %core.name, seq, "follow-up missed");
                    core.set_alarm(Alarms::NO_FOLLOW_UPS);
                }
                PtpEvent::Announce {
                    gm,
                    utc_offset,
                    leap59,
                    leap61,
                    ..
                } => {
                    self.announce_seen = true;
                    let mut gm = gm;
                    gm.remote = true;
                    core.status.grandmaster = gm;
                    core.utc_offset = utc_offset;
                    core.leap = if leap61 {
                        LeapType::Leap61
                    } else if leap59 {
                        LeapType::Leap59
                    } else {
                        LeapType::None
                    };
                }
            }
        }
        (saw_sync, saw_delay)
    }

    fn update_timeouts(&mut self, core: &mut ModuleCore, saw_sync: bool, saw_delay: bool) {
        if saw_sync {
            self.ticks_since_sync = 0;
            core.clear_alarm(Alarms::NO_SYNC_PKTS);
        } else {
            self.ticks_since_sync = self.ticks_since_sync.saturating_add(1);
        }
        if saw_delay {
            self.ticks_since_delay_resp = 0;
            core.clear_alarm(Alarms::NO_DELAY_RESPS);
        }
        if self.config.mode != PtpMode::Slave {
            return;
        }
        if !saw_delay {
            self.ticks_since_delay_resp = self.ticks_since_delay_resp.saturating_add(1);
        }
        if self.ticks_since_sync > self.config.sync_timeout_ticks {
            core.note_tick_failure(Alarms::NO_SYNC_PKTS);
        } else if self.ticks_since_delay_resp > self.config.delay_resp_timeout_ticks {
            core.note_tick_failure(Alarms::NO_DELAY_RESPS);
        } else {
            core.note_tick_success();
        }
    }

    /// A master clock still near the PTP epoch has no real time of day;
    /// steering a clock toward it would be destructive.
    fn update_epoch_alarm(&self, core: &mut ModuleCore) {
        const NEAR_EPOCH_SECS: i64 = 86_400 * 365;
        let protocol_time = self.dataset.protocol_time();
        if self.dataset.complete() && protocol_time.sec < NEAR_EPOCH_SECS {
            core.set_alarm(Alarms::CLOCK_NEAR_EPOCH);
        } else {
            core.clear_alarm(Alarms::CLOCK_NEAR_EPOCH);
        }
    }

    fn update_state(&mut self, core: &mut ModuleCore) {
        core.status.state = match self.config.mode {
            PtpMode::Master => SyncState::Master,
            PtpMode::Passive => SyncState::Passive,
            PtpMode::Monitor => SyncState::Listening,
            PtpMode::Slave => {
                if !self.codec.port_usable() {
                    SyncState::Faulty
                } else if self.announce_seen
                    && self.ticks_since_sync <= self.config.sync_timeout_ticks
                {
                    SyncState::Slave
                } else {
                    SyncState::Listening
                }
            }
        };
    }
}

impl SyncServicer for PtpServicer {
    fn startup(&mut self, core: &mut ModuleCore, _ctx: &mut ThreadCtx) -> Result<(), SyncError> {
        if self.config.mode == PtpMode::Monitor {
            core.status.constraints |= Constraints::CANNOT_BE_SELECTED;
        }
        core.status.state = SyncState::Listening;
        Ok(())
    }

    fn tick(&mut self, core: &mut ModuleCore, _ctx: &mut ThreadCtx) {
        let (saw_sync, saw_delay) = self.drain_events(core);
        self.update_timeouts(core, saw_sync, saw_delay);
        self.update_epoch_alarm(core);
        self.update_state(core);
        if self.config.mode == PtpMode::Slave
            && let (Some(offset), Some(path_delay)) = (
                self.dataset.offset_from_master_ns(),
                self.dataset.path_delay_ns(),
            )
            && saw_sync
        {
            core.record_sample(offset, Some(path_delay));
            if !core.status.alarms.contains(Alarms::CLOCK_NEAR_EPOCH) {
                core.discipline(offset);
            }
        }
    }

    fn control_changed(&mut self, core: &mut ModuleCore, previous: ControlFlags) {
        let now = core.status.control_flags;
        if previous.contains(ControlFlags::TIMESTAMP_PROCESSING)
            && !now.contains(ControlFlags::TIMESTAMP_PROCESSING)
        {
            // Stale timestamps must not complete a dataset later.
            self.dataset.clear();
        }
    }

    fn test_mode(&mut self, core: &mut ModuleCore, id: u32, _params: [i64; 3]) {
        match id {
            0 => {
                self.drop_sync = false;
                self.drop_delay_resp = false;
            }
            1 => self.drop_sync = true,
            2 => core.set_alarm(Alarms::NO_FOLLOW_UPS),
            3 => self.drop_delay_resp = true,
            _ => debug!(instance = %core.name, id, "unknown test mode"),
        }
    }
}
