//! Engine glue: owns the sync-module threads, forwards link tables, runs
//! the selector on a hysteresis cadence, applies control flags and fans out
//! grandmaster/leap broadcasts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::adapters::clock::ClockControl;
use crate::adapters::ntp_client::{NtpAuth, NtpClient, NtpTransport, WireMode};
use crate::adapters::pps::PpsSource;
use crate::adapters::ptp_codec::PtpCodec;
use crate::bic::{self, Candidate, Rule};
use crate::domain::grandmaster::GrandmasterInfo;
use crate::domain::link::{LinkRegistry, LinkRow};
use crate::domain::state::{ControlFlags, LeapType};
use crate::domain::status::{InstanceId, InstanceStatus};
use crate::domain::timespec::Timespec;
use crate::error::{Result, RksdError};
use crate::runtime::lowlevel::monotonic_now;
use crate::runtime::{
    Message, Payload, Runtime, RuntimeError, ThreadCtx, ThreadHandle, ThreadRunner,
    ThreadServicer, TimerId,
};
use crate::sync::freerun::FreerunServicer;
use crate::sync::ntp::NtpServicer;
use crate::sync::pps::{PpsConfig, PpsServicer};
use crate::sync::ptp::{PtpConfig, PtpServicer};
use crate::sync::{ModuleKind, SyncModule, SyncModuleConfig};

const SELECT_TIMER: TimerId = TimerId(1);
const STATS_TIMER: TimerId = TimerId(2);
const SAVE_TIMER: TimerId = TimerId(3);

/// Offset agreement window for the clustering score, nanoseconds.
const CLUSTERING_WINDOW_NS: f64 = 100_000.0;

/// Engine-level knobs; per-instance settings live in [`ModuleSpec`].
#[derive(Clone)]
pub struct EngineConfig {
    pub selection_interval: Timespec,
    /// A new winner must stay the winner this long before it is committed.
    pub selection_holdoff: Timespec,
    pub stats_interval: Timespec,
    pub save_interval: Timespec,
    pub policy: Vec<Rule>,
    pub state_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            selection_interval: Timespec::from_secs(1),
            selection_holdoff: Timespec::from_secs(2),
            stats_interval: Timespec::from_secs(60),
            save_interval: Timespec::from_secs(60),
            policy: bic::DEFAULT_POLICY.to_vec(),
            state_path: None,
        }
    }
}

/// Kind-specific pieces a module is built from.
pub enum ModuleBuilder {
    Freerun,
    Ptp(PtpConfig, Box<dyn PtpCodec>),
    Ntp {
        transport: Box<dyn NtpTransport>,
        wire_mode: WireMode,
        auth: Option<NtpAuth>,
    },
    Pps(PpsConfig, Box<dyn PpsSource>),
}

/// Blueprint for one sync instance.
pub struct ModuleSpec {
    pub name: String,
    pub kind: ModuleKind,
    pub tick_interval: Timespec,
    pub user_priority: u8,
    pub interface: Option<String>,
    pub prefer_hw_timestamps: bool,
    pub builder: ModuleBuilder,
}

struct ModuleSlot {
    instance: InstanceId,
    name: String,
    runner: ThreadRunner,
    status: InstanceStatus,
    /// Latest offset sample reported for clustering.
    clustering_offset_ns: Option<f64>,
}

struct EngineServicer {
    config: EngineConfig,
    clock: Arc<dyn ClockControl>,
    specs: Vec<ModuleSpec>,
    slots: Vec<ModuleSlot>,
    links: LinkRegistry,
    selected: Option<InstanceId>,
    manual: Option<InstanceId>,
    /// Candidate winner and the monotonic time it first won.
    pending_winner: Option<(InstanceId, Timespec)>,
    leap_pending: LeapType,
}

impl EngineServicer {
    fn slot(&self, instance: InstanceId) -> Option<&ModuleSlot> {
        self.slots.iter().find(|s| s.instance == instance)
    }

    fn slot_mut(&mut self, instance: InstanceId) -> Option<&mut ModuleSlot> {
        self.slots.iter_mut().find(|s| s.instance == instance)
    }

    fn spawn_modules(&mut self, ctx: &mut ThreadCtx) -> std::result::Result<(), RuntimeError> {
        let engine = ctx.handle();
        let runtime = ctx.runtime().clone();
        for (index, spec) in self.specs.drain(..).enumerate() {
            let instance = InstanceId(index as u32);
            let config = SyncModuleConfig {
                instance,
                name: spec.name.clone(),
                kind: spec.kind,
                engine: engine.clone(),
                clock: Arc::clone(&self.clock),
                tick_interval: spec.tick_interval,
                user_priority: spec.user_priority,
                interface: spec.interface.clone(),
                prefer_hw_timestamps: spec.prefer_hw_timestamps,
                state_path: self.config.state_path.clone(),
            };
            let runner = match spec.builder {
                ModuleBuilder::Freerun => {
                    runtime.spawn(&spec.name, SyncModule::new(config, FreerunServicer::new()))?
                }
                ModuleBuilder::Ptp(ptp_config, codec) => runtime.spawn(
                    &spec.name,
                    SyncModule::new(config, PtpServicer::new(ptp_config, codec)),
                )?,
                ModuleBuilder::Ntp {
                    transport,
                    wire_mode,
                    auth,
                } => runtime.spawn(
                    &spec.name,
                    SyncModule::new(
                        config,
                        NtpServicer::new(NtpClient::new(transport, wire_mode, auth)),
                    ),
                )?,
                ModuleBuilder::Pps(pps_config, source) => runtime.spawn(
                    &spec.name,
                    SyncModule::new(config, PpsServicer::new(pps_config, source)),
                )?,
            };
            info!(instance = %instance, name = %spec.name, kind = %spec.kind, "module started");
            self.slots.push(ModuleSlot {
                instance,
                name: spec.name,
                runner,
                status: InstanceStatus::default(),
                clustering_offset_ns: None,
            });
        }
        Ok(())
    }

    /// Score per instance: how many peers agree with its latest offset.
    fn clustering_scores(&self) -> HashMap<InstanceId, i64> {
        let mut scores = HashMap::new();
        for slot in &self.slots {
            let Some(own) = slot.clustering_offset_ns else {
                scores.insert(slot.instance, 0);
                continue;
            };
            let agreeing = self
                .slots
                .iter()
                .filter(|other| {
                    other.instance != slot.instance
                        && other
                            .clustering_offset_ns
                            .is_some_and(|o| (o - own).abs() < CLUSTERING_WINDOW_NS)
                })
                .count();
            scores.insert(slot.instance, agreeing as i64);
        }
        scores
    }

    fn candidates(&self) -> Vec<Candidate> {
        let scores = self.clustering_scores();
        let reporting = self
            .slots
            .iter()
            .filter(|s| s.clustering_offset_ns.is_some())
            .count();
        self.slots
            .iter()
            .map(|slot| {
                let mut status = slot.status.clone();
                status.clustering_score = scores.get(&slot.instance).copied().unwrap_or(0);
                // An instance that disagrees with every other reporting
                // instance is an outlier.
                if reporting >= 3
                    && slot.clustering_offset_ns.is_some()
                    && status.clustering_score == 0
                {
                    status.alarms |= crate::domain::state::Alarms::CLUSTERING_THRESHOLD_EXCEEDED;
                }
                let mut cand = Candidate::new(slot.instance, &slot.name, status);
                cand.selected = self.manual == Some(slot.instance);
                cand
            })
            .collect()
    }

    #[instrument(skip(self, ctx))]
    fn evaluate_selection(&mut self, ctx: &mut ThreadCtx) {
        let candidates = self.candidates();
        let contradictory = candidates.iter().any(|c| {
            c.status.constraints.contains(
                crate::domain::state::Constraints::MUST_BE_SELECTED
                    | crate::domain::state::Constraints::CANNOT_BE_SELECTED,
            )
        });
        if contradictory {
            warn!("contradictory selection constraints configured");
        }
        let Some(ranking) = bic::choose(&candidates, &self.config.policy) else {
            return;
        };
        let winner = candidates[ranking.winner()].id;
        if self.selected == Some(winner) {
            self.pending_winner = None;
            return;
        }

        let now = monotonic_now();
        let commit = match self.pending_winner {
            // First selection has no incumbent to hold off against.
            None if self.selected.is_none() => true,
            Some((pending, since)) if pending == winner => {
                now - since >= self.config.selection_holdoff
            }
            _ => {
                self.pending_winner = Some((winner, now));
                false
            }
        };
        if !commit {
            if self.pending_winner.is_none() {
                self.pending_winner = Some((winner, now));
            }
            return;
        }

        self.pending_winner = None;
        for line in ranking.describe(&candidates) {
            debug!("{line}");
        }
        self.commit_selection(ctx, winner);
    }

    fn commit_selection(&mut self, ctx: &mut ThreadCtx, winner: InstanceId) {
        let previous = self.selected;
        info!(winner = %winner, ?previous, "sync instance elected");
        let mask = ControlFlags::SELECTED | ControlFlags::CLOCK_CTRL;
        let handles: Vec<(InstanceId, ThreadHandle)> = self
            .slots
            .iter()
            .map(|s| (s.instance, s.runner.handle().clone()))
            .collect();
        for (instance, handle) in handles {
            let flags = if instance == winner {
                mask
            } else {
                ControlFlags::empty()
            };
            match ctx.send_wait(&handle, Payload::Control { flags, mask }) {
                Ok(reply) => ctx.free(reply),
                Err(e) => warn!(instance = %instance, error = %e, "control update failed"),
            }
        }
        self.selected = Some(winner);

        // The freshly selected reference's grandmaster becomes the one the
        // other modules relay.
        if let Some(slot) = self.slot(winner) {
            let info = slot.status.grandmaster;
            self.broadcast_gm(ctx, winner, info);
        }
    }

    fn broadcast_gm(&self, ctx: &ThreadCtx, originator: InstanceId, info: GrandmasterInfo) {
        for slot in &self.slots {
            if slot.instance == originator {
                continue;
            }
            let payload = Payload::UpdateGmInfo { originator, info };
            if let Err(e) = ctx.send(slot.runner.handle(), payload, false) {
                debug!(instance = %slot.instance, error = %e, "gm broadcast dropped");
            }
        }
    }

    fn broadcast_leap(&mut self, ctx: &ThreadCtx, originator: InstanceId, kind: LeapType) {
        if self.leap_pending == kind {
            return;
        }
        self.leap_pending = kind;
        for slot in &self.slots {
            if slot.instance == originator {
                continue;
            }
            let payload = Payload::UpdateLeapSecond { kind };
            if let Err(e) = ctx.send(slot.runner.handle(), payload, false) {
                debug!(instance = %slot.instance, error = %e, "leap broadcast dropped");
            }
        }
    }

    /// Publish the staged link table if every consumer released the last.
    fn publish_links(&mut self, ctx: &ThreadCtx) {
        let consumers = self.slots.len();
        if let Some(table) = self.links.take_next(consumers) {
            debug!(version = table.version, rows = table.rows.len(), "link table published");
            let mut failed = 0;
            for slot in &self.slots {
                let payload = Payload::LinkTable {
                    table: Arc::clone(&table),
                };
                if let Err(e) = ctx.send(slot.runner.handle(), payload, false) {
                    warn!(instance = %slot.instance, error = %e, "link table send failed");
                    failed += 1;
                }
            }
            // A module that never saw the table will never release it;
            // account for the misses so the version can still retire.
            for _ in 0..failed {
                self.links.release(table.version);
            }
        }
    }

    fn fan_out(&self, ctx: &ThreadCtx, payload_for: impl Fn() -> Payload) {
        for slot in &self.slots {
            if let Err(e) = ctx.send(slot.runner.handle(), payload_for(), false) {
                debug!(instance = %slot.instance, error = %e, "fan-out dropped");
            }
        }
    }

    fn handle_state_change(
        &mut self,
        ctx: &mut ThreadCtx,
        instance: InstanceId,
        status: InstanceStatus,
    ) {
        let selected = self.selected;
        let Some(slot) = self.slot_mut(instance) else {
            warn!(instance = %instance, "state change from unknown instance");
            return;
        };
        let gm_changed = status.grandmaster.differs_from(&slot.status.grandmaster);
        slot.status = status;
        debug!(
            instance = %instance,
            state = %slot.status.state,
            alarms = %slot.status.alarms.render(),
            "status updated"
        );
        if gm_changed && selected == Some(instance) {
            let info = self.slot(instance).map(|s| s.status.grandmaster);
            if let Some(info) = info {
                self.broadcast_gm(ctx, instance, info);
            }
        }
        self.evaluate_selection(ctx);
    }
}

impl ThreadServicer for EngineServicer {
    fn on_startup(&mut self, ctx: &mut ThreadCtx) -> std::result::Result<(), RuntimeError> {
        self.spawn_modules(ctx)?;
        ctx.timer_create(SELECT_TIMER)?;
        ctx.timer_start(SELECT_TIMER, self.config.selection_interval, true, false)?;
        ctx.timer_create(STATS_TIMER)?;
        ctx.timer_start(STATS_TIMER, self.config.stats_interval, true, false)?;
        ctx.timer_create(SAVE_TIMER)?;
        ctx.timer_start(SAVE_TIMER, self.config.save_interval, true, false)?;
        Ok(())
    }

    fn on_shutdown(&mut self, _ctx: &mut ThreadCtx) {
        info!("engine shutting down, stopping modules");
        for slot in self.slots.drain(..) {
            let code = slot.runner.stop();
            if code != 0 {
                warn!(instance = %slot.instance, code, "module exited non-zero");
            }
        }
    }

    fn on_timer(&mut self, ctx: &mut ThreadCtx, id: TimerId) {
        match id {
            SELECT_TIMER => {
                self.evaluate_selection(ctx);
                self.publish_links(ctx);
            }
            STATS_TIMER => {
                let time = Utc::now();
                self.fan_out(ctx, || Payload::LogStats { time });
                self.fan_out(ctx, || Payload::StatsEndPeriod { time });
            }
            SAVE_TIMER => {
                self.fan_out(ctx, || Payload::SaveState);
            }
            _ => {}
        }
    }

    fn on_message(&mut self, ctx: &mut ThreadCtx, mut msg: Box<Message>) {
        match msg.take_payload() {
            Payload::StateChanged { instance, status } => {
                self.handle_state_change(ctx, instance, *status);
                ctx.free(msg);
            }
            Payload::LinkTableUpdate { rows } => {
                self.links.offer(rows);
                ctx.free(msg);
                self.publish_links(ctx);
            }
            Payload::LinkTableRelease { version, .. } => {
                if self.links.release(version) {
                    self.publish_links(ctx);
                }
                ctx.free(msg);
            }
            Payload::ClusteringInput {
                instance,
                offset_ns,
            } => {
                if let Some(slot) = self.slot_mut(instance) {
                    slot.clustering_offset_ns = Some(offset_ns);
                }
                ctx.free(msg);
            }
            Payload::ScheduleLeapSecond { instance, kind } => {
                self.broadcast_leap(ctx, instance, kind);
                ctx.free(msg);
            }
            Payload::CancelLeapSecond { instance } => {
                self.broadcast_leap(ctx, instance, LeapType::None);
                ctx.free(msg);
            }
            Payload::GetInstanceStatusByName { name } => {
                match self.slots.iter().find(|s| s.name == name) {
                    Some(slot) => {
                        msg.set_payload(Payload::Status(Box::new(slot.status.clone())))
                    }
                    None => msg.set_payload(Payload::Failed {
                        reason: format!("no instance named '{name}'"),
                    }),
                }
                ctx.reply(msg);
            }
            Payload::GetInstanceHandleByName { name } => {
                match self.slots.iter().find(|s| s.name == name) {
                    Some(slot) => {
                        msg.set_payload(Payload::InstanceHandle(slot.runner.handle().clone()))
                    }
                    None => msg.set_payload(Payload::Failed {
                        reason: format!("no instance named '{name}'"),
                    }),
                }
                ctx.reply(msg);
            }
            other => {
                debug!(id = other.id(), "unexpected engine message");
                ctx.free(msg);
            }
        }
    }

    fn on_signal(&mut self, ctx: &mut ThreadCtx, signo: i32) {
        match signo {
            libc::SIGINT | libc::SIGTERM => {
                info!(signo, "shutdown signal received");
                ctx.request_exit(0);
            }
            _ => debug!(signo, "unhandled signal"),
        }
    }
}

/// Running engine owned by the daemon binary.
pub struct Engine {
    runtime: Runtime,
    runner: ThreadRunner,
}

impl Engine {
    /// Spawn the engine thread and all configured module threads. A module
    /// that fails startup fails the whole engine.
    pub fn start(
        runtime: &Runtime,
        config: EngineConfig,
        clock: Arc<dyn ClockControl>,
        specs: Vec<ModuleSpec>,
    ) -> Result<Engine> {
        let servicer = EngineServicer {
            config,
            clock,
            specs,
            slots: Vec::new(),
            links: LinkRegistry::new(),
            selected: None,
            manual: None,
            pending_winner: None,
            leap_pending: LeapType::None,
        };
        let runner = runtime.spawn("engine", servicer)?;
        Ok(Engine {
            runtime: runtime.clone(),
            runner,
        })
    }

    pub fn handle(&self) -> &ThreadHandle {
        self.runner.handle()
    }

    /// Push a fresh interface snapshot from the link-table provider.
    pub fn push_link_table(&self, rows: Vec<LinkRow>) -> Result<()> {
        self.runtime
            .post(self.handle(), Payload::LinkTableUpdate { rows })
            .map_err(RksdError::from)
    }

    /// Blocking status read of one instance, for tooling and tests.
    pub fn instance_status(&self, name: &str) -> Result<InstanceStatus> {
        let msg = self.runtime.pool().alloc(Payload::GetInstanceStatusByName {
            name: name.to_string(),
        })?;
        let mut reply = self.runtime.send_wait(self.handle(), msg)?;
        let payload = reply.take_payload();
        self.runtime.free(reply);
        match payload {
            Payload::Status(status) => Ok(*status),
            Payload::Failed { reason } => Err(RksdError::Other(reason)),
            _ => Err(RksdError::Other("unexpected reply".into())),
        }
    }

    /// Look up the thread handle of one instance for direct requests.
    pub fn module_handle(&self, name: &str) -> Result<ThreadHandle> {
        let msg = self.runtime.pool().alloc(Payload::GetInstanceHandleByName {
            name: name.to_string(),
        })?;
        let mut reply = self.runtime.send_wait(self.handle(), msg)?;
        let payload = reply.take_payload();
        self.runtime.free(reply);
        match payload {
            Payload::InstanceHandle(handle) => Ok(handle),
            Payload::Failed { reason } => Err(RksdError::Other(reason)),
            _ => Err(RksdError::Other("unexpected reply".into())),
        }
    }

    /// Step one instance's clock immediately, resetting its servo.
    pub fn step_clock(&self, name: &str, offset: Timespec) -> Result<()> {
        let handle = self.module_handle(name)?;
        let msg = self.runtime.pool().alloc(Payload::StepClock { offset })?;
        let mut reply = self.runtime.send_wait(&handle, msg)?;
        let payload = reply.take_payload();
        self.runtime.free(reply);
        match payload {
            Payload::Ack => Ok(()),
            Payload::Failed { reason } => Err(RksdError::Other(reason)),
            _ => Err(RksdError::Other("unexpected reply".into())),
        }
    }

    /// Render the topology seen by one instance.
    pub fn write_topology(&self, name: &str) -> Result<String> {
        let handle = self.module_handle(name)?;
        let msg = self.runtime.pool().alloc(Payload::WriteTopology)?;
        let mut reply = self.runtime.send_wait(&handle, msg)?;
        let payload = reply.take_payload();
        self.runtime.free(reply);
        match payload {
            Payload::Topology(text) => Ok(text),
            Payload::Failed { reason } => Err(RksdError::Other(reason)),
            _ => Err(RksdError::Other("unexpected reply".into())),
        }
    }

    /// Inject a test behavior into one instance.
    pub fn test_mode(&self, name: &str, id: u32, params: [i64; 3]) -> Result<()> {
        let handle = self.module_handle(name)?;
        self.runtime
            .post(&handle, Payload::TestMode { id, params })
            .map_err(RksdError::from)
    }

    /// Ask the engine to stop and wait for it; returns the exit code.
    pub fn stop(self) -> i32 {
        self.runner.stop()
    }

    /// Wait for the engine to exit on its own (e.g. on SIGTERM).
    pub fn wait(self) -> i32 {
        self.runner.join()
    }
}
