//! Sync-module framework: the contract every time-source kind implements
//! and the generic thread servicer that speaks the engine's message set.

pub mod dataset;
pub mod freerun;
pub mod ntp;
pub mod pps;
pub mod ptp;

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::adapters::clock::{ClockControl, ClockError};
use crate::domain::grandmaster::GrandmasterInfo;
use crate::domain::link::{LinkTable, TsCaps};
use crate::domain::state::{Alarms, ControlFlags, LeapType};
use crate::domain::status::{InstanceId, InstanceStatus};
use crate::domain::timespec::Timespec;
use crate::fmt::report::StateRecord;
use crate::runtime::{Message, Payload, RuntimeError, ThreadCtx, ThreadHandle, ThreadServicer, TimerId};
use crate::stats::SyncStats;

/// Closed set of sync-module kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Freerun,
    Ptp,
    Pps,
    Ntp,
    /// NTP via a chronyd endpoint.
    Crny,
    /// PPS fed by a GPS time-of-day source.
    Gps,
}

impl ModuleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleKind::Freerun => "freerun",
            ModuleKind::Ptp => "ptp",
            ModuleKind::Pps => "pps",
            ModuleKind::Ntp => "ntp",
            ModuleKind::Crny => "crny",
            ModuleKind::Gps => "gps",
        }
    }
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consecutive failed ticks before a timeout alarm escalates to
/// sustained-sync-failure.
pub const SUSTAINED_FAILURE_TICKS: u32 = 16;

/// Offset magnitude below which a disciplined clock counts as in sync.
pub const IN_SYNC_THRESHOLD_NS: f64 = 1_000_000.0;

/// Offset magnitude above which discipline steps instead of slewing.
const STEP_THRESHOLD_NS: f64 = 500_000_000.0;

/// Proportional servo gain applied to the offset each tick.
const SERVO_GAIN: f64 = 0.1;

pub(crate) const TICK_TIMER: TimerId = TimerId(0);

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("clock: {0}")]
    Clock(#[from] ClockError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("configuration: {0}")]
    Config(String),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsMode {
    Software,
    Hardware,
}

impl std::fmt::Display for TsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TsMode::Software => "software",
            TsMode::Hardware => "hardware",
        })
    }
}

/// Construction parameters common to every module kind.
#[derive(Clone)]
pub struct SyncModuleConfig {
    pub instance: InstanceId,
    pub name: String,
    pub kind: ModuleKind,
    pub engine: ThreadHandle,
    pub clock: Arc<dyn ClockControl>,
    pub tick_interval: Timespec,
    pub user_priority: u8,
    pub interface: Option<String>,
    pub prefer_hw_timestamps: bool,
    pub state_path: Option<PathBuf>,
}

/// Shared per-instance state the framework and the kind both mutate.
pub struct ModuleCore {
    pub instance: InstanceId,
    pub name: String,
    pub kind: ModuleKind,
    pub status: InstanceStatus,
    pub stats: SyncStats,
    pub clock: Arc<dyn ClockControl>,
    pub engine: ThreadHandle,
    pub interface: Option<String>,
    pub active_interface: Option<String>,
    pub prefer_hw_timestamps: bool,
    pub ts_mode: TsMode,
    pub freq_adj_ppb: f64,
    pub utc_offset: i16,
    pub leap: LeapType,
    state_path: Option<PathBuf>,
    consecutive_failures: u32,
    offset_fresh: bool,
}

impl ModuleCore {
    fn new(config: &SyncModuleConfig) -> Self {
        let mut status = InstanceStatus::default();
        status.user_priority = config.user_priority;
        ModuleCore {
            instance: config.instance,
            name: config.name.clone(),
            kind: config.kind,
            status,
            stats: SyncStats::new(),
            clock: Arc::clone(&config.clock),
            engine: config.engine.clone(),
            interface: config.interface.clone(),
            active_interface: None,
            prefer_hw_timestamps: config.prefer_hw_timestamps,
            ts_mode: TsMode::Software,
            freq_adj_ppb: 0.0,
            utc_offset: 0,
            leap: LeapType::None,
            state_path: config.state_path.clone(),
            consecutive_failures: 0,
            offset_fresh: false,
        }
    }

    /// Idempotent alarm set.
    pub fn set_alarm(&mut self, alarm: Alarms) {
        self.status.alarms |= alarm;
    }

    /// Idempotent alarm clear.
    pub fn clear_alarm(&mut self, alarm: Alarms) {
        self.status.alarms &= !alarm;
    }

    pub fn control_flags(&self) -> ControlFlags {
        self.status.control_flags
    }

    pub fn is_selected(&self) -> bool {
        self.status
            .control_flags
            .contains(ControlFlags::SELECTED)
    }

    pub fn has_clock_ctrl(&self) -> bool {
        self.status.control_flags.contains(ControlFlags::CLOCK_CTRL)
    }

    pub fn processing_timestamps(&self) -> bool {
        self.status
            .control_flags
            .contains(ControlFlags::TIMESTAMP_PROCESSING)
    }

    /// Record a fresh offset measurement.
    pub fn record_sample(&mut self, offset_ns: f64, path_delay_ns: Option<f64>) {
        self.stats.record(offset_ns, path_delay_ns);
        self.status.offset_from_master = Timespec::from_ns_f64(offset_ns);
        self.offset_fresh = true;
    }

    /// A tick produced the expected protocol traffic: clear the timeout
    /// escalation.
    pub fn note_tick_success(&mut self) {
        self.consecutive_failures = 0;
        self.clear_alarm(Alarms::SUSTAINED_SYNC_FAILURE);
    }

    /// A tick failed to produce protocol traffic; sets `alarm` now and the
    /// sustained alarm after the escalation threshold.
    pub fn note_tick_failure(&mut self, alarm: Alarms) {
        self.set_alarm(alarm);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= SUSTAINED_FAILURE_TICKS {
            self.set_alarm(Alarms::SUSTAINED_SYNC_FAILURE);
        }
    }

    /// Discipline the local clock toward zero offset. Steps on large
    /// offsets, slews proportionally otherwise. Failures raise the clock
    /// control alarm and are retried on the next tick.
    pub fn discipline(&mut self, offset_ns: f64) {
        if !self.has_clock_ctrl() {
            return;
        }
        let result = if offset_ns.abs() >= STEP_THRESHOLD_NS {
            self.clock
                .step(self.status.clock, Timespec::from_ns_f64(-offset_ns))
        } else {
            let ppb = -offset_ns * SERVO_GAIN;
            self.freq_adj_ppb = ppb;
            self.clock.adjfreq(self.status.clock, ppb)
        };
        match result {
            Ok(()) => self.clear_alarm(Alarms::CLOCK_CTRL_FAILURE),
            Err(e) => {
                warn!(instance = %self.name, error = %e, "clock control failed");
                self.set_alarm(Alarms::CLOCK_CTRL_FAILURE);
            }
        }
    }

    /// Apply an immediate step with servo reset semantics.
    pub fn apply_step(&mut self, offset: Timespec) -> Result<(), SyncError> {
        self.clock.step(self.status.clock, offset)?;
        self.freq_adj_ppb = 0.0;
        self.clear_alarm(Alarms::CLOCK_CTRL_FAILURE);
        Ok(())
    }

    /// Re-evaluate the configured interface against a new link table:
    /// resolve bonds to their active slave, pick the timestamping mode, and
    /// maintain the no-interface alarm.
    pub fn apply_link_table(&mut self, table: &LinkTable) {
        let Some(name) = self.interface.clone() else {
            return;
        };
        match table.physical_for(&name) {
            Some(row) if row.is_up() => {
                self.clear_alarm(Alarms::NO_INTERFACE);
                if self.active_interface.as_deref() != Some(row.if_name.as_str()) {
                    debug!(
                        instance = %self.name,
                        interface = %row.if_name,
                        "active interface changed"
                    );
                    self.active_interface = Some(row.if_name.clone());
                }
                let hw_capable = row.ts_caps.contains(TsCaps::HARDWARE);
                if self.prefer_hw_timestamps && !hw_capable {
                    self.set_alarm(Alarms::CAPS_MISMATCH);
                } else {
                    self.clear_alarm(Alarms::CAPS_MISMATCH);
                }
                let hw = hw_capable && self.prefer_hw_timestamps;
                let mode = if hw { TsMode::Hardware } else { TsMode::Software };
                if mode != self.ts_mode {
                    debug!(instance = %self.name, %mode, "timestamping mode changed");
                    self.ts_mode = mode;
                }
            }
            _ => {
                self.active_interface = None;
                self.set_alarm(Alarms::NO_INTERFACE);
            }
        }
    }

    /// State dump record with the framework-level fields filled in.
    pub fn state_record(&self) -> StateRecord {
        let mut record = StateRecord::from_status(&self.name, &self.status);
        record.interface = self
            .active_interface
            .clone()
            .or_else(|| self.interface.clone())
            .unwrap_or_else(|| "-".into());
        record.transport = self.kind.to_string();
        record.timestamping = self.ts_mode.to_string();
        record.freq_adj_ppb = self.freq_adj_ppb;
        record.in_sync = self.status.offset_from_master.to_f64_ns().abs() < IN_SYNC_THRESHOLD_NS
            && !self.status.offset_from_master.is_zero();
        record.utc_offset = self.utc_offset;
        record.leap = self.leap.to_string();
        record
    }

    fn save_state(&self) {
        let Some(dir) = &self.state_path else {
            return;
        };
        let path = dir.join(format!("state-{}.txt", self.name));
        if let Err(e) = std::fs::write(&path, self.state_record().render()) {
            warn!(instance = %self.name, error = %e, "state save failed");
        }
        // Persist the frequency correction only once the clock is
        // disciplined to within the in-sync window, so a restart does not
        // resume from a junk value.
        if self.has_clock_ctrl()
            && self.status.offset_from_master.to_f64_ns().abs() < IN_SYNC_THRESHOLD_NS
            && !self.status.offset_from_master.is_zero()
        {
            let freq_path = dir.join(format!("freq-{}.ppb", self.status.clock));
            if let Err(e) = std::fs::write(&freq_path, format!("{:.3}\n", self.freq_adj_ppb)) {
                warn!(instance = %self.name, error = %e, "freq correction save failed");
            }
        }
    }

    /// Restore the saved frequency correction for this clock, if any.
    fn load_freq_correction(&mut self) {
        let Some(dir) = &self.state_path else {
            return;
        };
        let path = dir.join(format!("freq-{}.ppb", self.status.clock));
        let Ok(text) = std::fs::read_to_string(&path) else {
            return;
        };
        if let Ok(ppb) = text.trim().parse::<f64>() {
            debug!(instance = %self.name, ppb, "restored frequency correction");
            self.freq_adj_ppb = ppb;
            if let Err(e) = self.clock.adjfreq(self.status.clock, ppb) {
                warn!(instance = %self.name, error = %e, "freq correction restore failed");
            }
        }
    }
}

/// Behavior one module kind plugs into the framework.
pub trait SyncServicer: Send + 'static {
    fn startup(&mut self, _core: &mut ModuleCore, _ctx: &mut ThreadCtx) -> Result<(), SyncError> {
        Ok(())
    }

    fn shutdown(&mut self, _core: &mut ModuleCore, _ctx: &mut ThreadCtx) {}

    /// Advance the protocol one tick and refresh `core.status`.
    fn tick(&mut self, core: &mut ModuleCore, ctx: &mut ThreadCtx);

    /// Control flags were updated by the engine; `previous` is the old set.
    fn control_changed(&mut self, _core: &mut ModuleCore, _previous: ControlFlags) {}

    /// Atomic clock step with servo reset.
    fn step_clock(&mut self, core: &mut ModuleCore, offset: Timespec) -> Result<(), SyncError> {
        core.apply_step(offset)
    }

    /// Grandmaster info from another instance.
    fn gm_update(&mut self, _core: &mut ModuleCore, _info: &GrandmasterInfo) {}

    fn leap_update(&mut self, core: &mut ModuleCore, kind: LeapType) {
        core.leap = kind;
    }

    /// Kind-specific reaction to a new link table. The framework has
    /// already run [`ModuleCore::apply_link_table`].
    fn link_table(&mut self, _core: &mut ModuleCore, _table: &LinkTable) {}

    fn test_mode(&mut self, _core: &mut ModuleCore, _id: u32, _params: [i64; 3]) {}

    fn topology(&self, core: &ModuleCore) -> String {
        crate::fmt::render_topology(
            &core.name,
            core.status.grandmaster.clock_id,
            core.status.grandmaster.steps_removed,
        )
    }
}


/// Generic thread servicer wrapping one kind-specific [`SyncServicer`].
pub struct SyncModule<S: SyncServicer> {
    core: ModuleCore,
    servicer: S,
    published: InstanceStatus,
    tick_interval: Timespec,
    pending_releases: Vec<u64>,
}

impl<S: SyncServicer> SyncModule<S> {
    pub fn new(config: SyncModuleConfig, servicer: S) -> Self {
        let core = ModuleCore::new(&config);
        let published = core.status.clone();
        SyncModule {
            core,
            servicer,
            published,
            tick_interval: config.tick_interval,
            pending_releases: Vec::new(),
        }
    }

    fn publish_if_changed(&mut self, ctx: &ThreadCtx) {
        if !self.core.status.significant_change(&self.published) {
            return;
        }
        let payload = Payload::StateChanged {
            instance: self.core.instance,
            status: Box::new(self.core.status.clone()),
        };
        match ctx.send(&self.core.engine, payload, false) {
            Ok(()) => self.published = self.core.status.clone(),
            // Pool pressure: drop and re-publish on a later change or tick.
            Err(RuntimeError::OutOfResources) => {
                debug!(instance = %self.core.name, "state change dropped, pool empty")
            }
            Err(e) => warn!(instance = %self.core.name, error = %e, "state change send failed"),
        }
    }

    fn flush_releases(&mut self, ctx: &ThreadCtx) {
        while let Some(&version) = self.pending_releases.first() {
            let payload = Payload::LinkTableRelease {
                instance: self.core.instance,
                version,
            };
            match ctx.send(&self.core.engine, payload, false) {
                Ok(()) => {
                    self.pending_releases.remove(0);
                }
                Err(_) => break,
            }
        }
    }

    fn post_clustering_input(&mut self, ctx: &ThreadCtx) {
        if !self.core.offset_fresh {
            return;
        }
        self.core.offset_fresh = false;
        let payload = Payload::ClusteringInput {
            instance: self.core.instance,
            offset_ns: self.core.status.offset_from_master.to_f64_ns(),
        };
        if let Err(e) = ctx.send(&self.core.engine, payload, false) {
            debug!(instance = %self.core.name, error = %e, "clustering input dropped");
        }
    }
}

impl<S: SyncServicer> ThreadServicer for SyncModule<S> {
    fn on_startup(&mut self, ctx: &mut ThreadCtx) -> Result<(), RuntimeError> {
        ctx.timer_create(TICK_TIMER)?;
        ctx.timer_start(TICK_TIMER, self.tick_interval, true, true)?;
        self.core.load_freq_correction();
        if let Err(e) = self.servicer.startup(&mut self.core, ctx) {
            tracing::error!(instance = %self.core.name, error = %e, "module startup failed");
            return Err(RuntimeError::StartupFailed {
                name: self.core.name.clone(),
                code: 1,
            });
        }
        Ok(())
    }

    fn on_shutdown(&mut self, ctx: &mut ThreadCtx) {
        self.servicer.shutdown(&mut self.core, ctx);
    }

    fn on_timer(&mut self, ctx: &mut ThreadCtx, id: TimerId) {
        if id != TICK_TIMER {
            return;
        }
        self.servicer.tick(&mut self.core, ctx);
        self.post_clustering_input(ctx);
        self.flush_releases(ctx);
        self.publish_if_changed(ctx);
    }

    fn on_message(&mut self, ctx: &mut ThreadCtx, mut msg: Box<Message>) {
        match msg.take_payload() {
            Payload::GetStatus => {
                msg.set_payload(Payload::Status(Box::new(self.core.status.clone())));
                ctx.reply(msg);
            }
            Payload::Control { flags, mask } => {
                let previous = self.core.status.control_flags;
                self.core.status.control_flags = previous.apply(flags, mask);
                self.servicer.control_changed(&mut self.core, previous);
                msg.set_payload(Payload::Ack);
                ctx.reply(msg);
            }
            Payload::StepClock { offset } => {
                match self.servicer.step_clock(&mut self.core, offset) {
                    Ok(()) => msg.set_payload(Payload::Ack),
                    Err(e) => {
                        self.core.set_alarm(Alarms::CLOCK_CTRL_FAILURE);
                        msg.set_payload(Payload::Failed {
                            reason: e.to_string(),
                        });
                    }
                }
                ctx.reply(msg);
            }
            Payload::WriteTopology => {
                msg.set_payload(Payload::Topology(self.servicer.topology(&self.core)));
                ctx.reply(msg);
            }
            Payload::LogStats { time } => {
                self.core.stats.log(&self.core.name, time);
                ctx.free(msg);
            }
            Payload::SaveState => {
                self.core.save_state();
                ctx.free(msg);
            }
            Payload::StatsEndPeriod { time } => {
                self.core.stats.end_period(time);
                ctx.free(msg);
            }
            Payload::TestMode { id, params } => {
                self.servicer.test_mode(&mut self.core, id, params);
                ctx.free(msg);
            }
            Payload::UpdateGmInfo { originator, info } => {
                if originator != self.core.instance {
                    self.servicer.gm_update(&mut self.core, &info);
                }
                ctx.free(msg);
            }
            Payload::UpdateLeapSecond { kind } => {
                self.servicer.leap_update(&mut self.core, kind);
                ctx.free(msg);
            }
            Payload::LinkTable { table } => {
                self.core.apply_link_table(&table);
                self.servicer.link_table(&mut self.core, &table);
                self.pending_releases.push(table.version);
                ctx.free(msg);
                self.flush_releases(ctx);
            }
            other => {
                debug!(instance = %self.core.name, id = other.id(), "unexpected message");
                ctx.free(msg);
            }
        }
        self.publish_if_changed(ctx);
    }
}
