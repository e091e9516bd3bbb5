//! Remote monitoring sink: one JSON object per line per event.

use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

use crate::domain::state::{Alarms, SyncState};
use crate::domain::timespec::Timespec;

/// Per-event record pushed to the monitor stream.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorRecord {
    pub port_id: String,
    pub ref_port_id: String,
    pub seq: u16,
    pub sync_rx: Timespec,
    pub offset_ns: f64,
    pub mean_path_delay_ns: f64,
    pub state: SyncState,
    pub alarms: Alarms,
}

pub trait MonitorSink: Send + Sync {
    fn publish(&self, record: &MonitorRecord);
}

/// Line-delimited JSON over any writer.
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        JsonLinesSink {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap()
    }
}

impl<W: Write + Send> MonitorSink for JsonLinesSink<W> {
    fn publish(&self, record: &MonitorRecord) {
        let mut writer = self.writer.lock().unwrap();
        match serde_json::to_string(record) {
            Ok(line) => {
                if writeln!(writer, "{line}").is_err() {
                    warn!("monitor sink write failed");
                }
            }
            Err(e) => warn!(error = %e, "monitor record serialization failed"),
        }
    }
}

/// Discards every record; used when monitoring is not configured.
pub struct NullSink;

impl MonitorSink for NullSink {
    fn publish(&self, _record: &MonitorRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_lines_output() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.publish(&MonitorRecord {
            port_id: "00:11:22:33:44:55:66:77.1".into(),
            ref_port_id: "88:99:AA:BB:CC:DD:EE:FF.1".into(),
            seq: 42,
            sync_rx: Timespec::from_ns(123),
            offset_ns: -17.5,
            mean_path_delay_ns: 840.0,
            state: SyncState::Slave,
            alarms: Alarms::empty(),
        });
        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(out.lines().count(), 1);
        let parsed: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(parsed["seq"], 42);
        assert_eq!(parsed["offset_ns"], -17.5);
        assert_eq!(parsed["state"], "slave");
    }
}
