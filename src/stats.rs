//! Per-instance measurement statistics.
//!
//! Each sync module accumulates offset and path-delay samples thread-local;
//! the engine triggers periodic log flushes and period rotation by message,
//! so no locking is involved.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Default)]
struct Accumulator {
    offsets_ns: Vec<f64>,
    path_delays_ns: Vec<f64>,
}

impl Accumulator {
    fn record(&mut self, offset_ns: f64, path_delay_ns: Option<f64>) {
        self.offsets_ns.push(offset_ns);
        if let Some(pd) = path_delay_ns {
            self.path_delays_ns.push(pd);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub count: usize,
    pub offset_avg_ns: f64,
    pub offset_min_ns: f64,
    pub offset_max_ns: f64,
    pub path_delay_avg_ns: f64,
}

fn compute_snapshot(acc: &Accumulator) -> StatsSnapshot {
    if acc.offsets_ns.is_empty() {
        return StatsSnapshot {
            count: 0,
            offset_avg_ns: 0.0,
            offset_min_ns: 0.0,
            offset_max_ns: 0.0,
            path_delay_avg_ns: 0.0,
        };
    }
    let count = acc.offsets_ns.len();
    let offset_avg_ns = acc.offsets_ns.iter().sum::<f64>() / count as f64;
    let offset_min_ns = acc.offsets_ns.iter().copied().fold(f64::INFINITY, f64::min);
    let offset_max_ns = acc
        .offsets_ns
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let path_delay_avg_ns = if acc.path_delays_ns.is_empty() {
        0.0
    } else {
        acc.path_delays_ns.iter().sum::<f64>() / acc.path_delays_ns.len() as f64
    };
    StatsSnapshot {
        count,
        offset_avg_ns,
        offset_min_ns,
        offset_max_ns,
        path_delay_avg_ns,
    }
}

/// A closed statistics period.
#[derive(Debug, Clone, Serialize)]
pub struct ClosedPeriod {
    pub ended_at: DateTime<Utc>,
    pub snapshot: StatsSnapshot,
}

/// Rolling statistics for one sync instance.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    current: Accumulator,
    last_period: Option<ClosedPeriod>,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, offset_ns: f64, path_delay_ns: Option<f64>) {
        self.current.record(offset_ns, path_delay_ns);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        compute_snapshot(&self.current)
    }

    pub fn last_period(&self) -> Option<&ClosedPeriod> {
        self.last_period.as_ref()
    }

    /// Close the running period and start a fresh one.
    pub fn end_period(&mut self, time: DateTime<Utc>) -> ClosedPeriod {
        let closed = ClosedPeriod {
            ended_at: time,
            snapshot: compute_snapshot(&self.current),
        };
        self.current = Accumulator::default();
        self.last_period = Some(closed.clone());
        closed
    }

    /// Emit the running stats for the given wall time.
    pub fn log(&self, instance: &str, time: DateTime<Utc>) {
        let snap = self.snapshot();
        info!(
            target: "rksd::stats",
            instance,
            time = %time.to_rfc3339(),
            count = snap.count,
            offset_avg_ns = snap.offset_avg_ns,
            offset_min_ns = snap.offset_min_ns,
            offset_max_ns = snap.offset_max_ns,
            path_delay_avg_ns = snap.path_delay_avg_ns,
            "periodic stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_math() {
        let mut stats = SyncStats::new();
        stats.record(100.0, Some(50.0));
        stats.record(-50.0, Some(150.0));
        stats.record(10.0, None);
        let snap = stats.snapshot();
        assert_eq!(snap.count, 3);
        assert!((snap.offset_avg_ns - 20.0).abs() < 1e-12);
        assert_eq!(snap.offset_min_ns, -50.0);
        assert_eq!(snap.offset_max_ns, 100.0);
        assert_eq!(snap.path_delay_avg_ns, 100.0);
    }

    #[test]
    fn test_empty_snapshot_is_zeroed() {
        let stats = SyncStats::new();
        let snap = stats.snapshot();
        assert_eq!(snap.count, 0);
        assert_eq!(snap.offset_min_ns, 0.0);
    }

    #[test]
    fn test_end_period_rotates() {
        let mut stats = SyncStats::new();
        stats.record(42.0, None);
        let t = Utc::now();
        let closed = stats.end_period(t);
        assert_eq!(closed.snapshot.count, 1);
        assert_eq!(stats.snapshot().count, 0);
        assert_eq!(stats.last_period().unwrap().ended_at, t);
    }
}
