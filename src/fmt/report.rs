//! Text rendering of instance state dumps and topology.

use crate::domain::grandmaster::ClockIdentity;
use crate::domain::status::InstanceStatus;
use crate::domain::timespec::Timespec;

/// Everything a periodic state dump records about one instance. Modules
/// fill in what applies; unused fields render as their defaults.
#[derive(Debug, Clone, Default)]
pub struct StateRecord {
    pub instance: String,
    pub clock_name: String,
    pub clock_id: ClockIdentity,
    pub state: String,
    pub alarms: String,
    pub control_flags: String,
    pub interface: String,
    pub transport: String,
    pub timestamping: String,
    pub offset: Timespec,
    pub path_delay: Timespec,
    pub freq_adj_ppb: f64,
    pub in_sync: bool,
    pub parent_id: ClockIdentity,
    pub gm_id: ClockIdentity,
    pub clock_class: String,
    pub time_source: String,
    pub accuracy: String,
    pub utc_offset: i16,
    pub leap: String,
    pub clustering_score: i64,
}

impl StateRecord {
    /// Populate the status-derived fields.
    pub fn from_status(instance: &str, status: &InstanceStatus) -> Self {
        StateRecord {
            instance: instance.to_string(),
            clock_name: status.clock.to_string(),
            clock_id: status.grandmaster.clock_id,
            state: status.state.to_string(),
            alarms: status.alarms.render(),
            control_flags: format!("{:?}", status.control_flags),
            offset: status.offset_from_master,
            gm_id: status.grandmaster.clock_id,
            parent_id: status.grandmaster.clock_id,
            clock_class: status.grandmaster.clock_class.to_string(),
            time_source: status.grandmaster.time_source.to_string(),
            accuracy: if status.grandmaster.accuracy_ns.is_finite() {
                format!("{:.0}ns", status.grandmaster.accuracy_ns)
            } else {
                "unknown".into()
            },
            clustering_score: status.clustering_score,
            ..StateRecord::default()
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut line = |label: &str, value: String| {
            out.push_str(label);
            out.push_str(": ");
            out.push_str(&value);
            out.push('\n');
        };
        line("instance", self.instance.clone());
        line("clock-name", self.clock_name.clone());
        line("clock-id", self.clock_id.to_string());
        line("state", self.state.clone());
        line("alarms", self.alarms.clone());
        line("control-flags", self.control_flags.clone());
        line("interface", self.interface.clone());
        line("transport", self.transport.clone());
        line("timestamping", self.timestamping.clone());
        line("offset", self.offset.to_string());
        line("path-delay", self.path_delay.to_string());
        line("freq-adjustment-ppb", format!("{:.3}", self.freq_adj_ppb));
        line("in-sync", self.in_sync.to_string());
        line("parent-id", self.parent_id.to_string());
        line("grandmaster-id", self.gm_id.to_string());
        line("clock-class", self.clock_class.clone());
        line("time-source", self.time_source.clone());
        line("accuracy", self.accuracy.clone());
        line("utc-offset", self.utc_offset.to_string());
        line("leap", self.leap.clone());
        line("clustering-score", self.clustering_score.to_string());
        out
    }
}

/// Topology rendering for the selected instance: local clock at the bottom,
/// grandmaster at the top.
pub fn render_topology(instance: &str, gm_id: ClockIdentity, steps_removed: u16) -> String {
    let mut out = String::new();
    out.push_str(&format!("grandmaster {gm_id}\n"));
    for _ in 0..steps_removed {
        out.push_str("   |\n");
    }
    out.push_str(&format!("{instance} (this host)\n"));
    out
}
