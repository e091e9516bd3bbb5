//! Collation of the four PTP event timestamps into offset-from-master and
//! mean path delay.
//!
//! A slave collects `m2s` (Sync/Follow_Up), and either `s2m`
//! (Delay_Req/Delay_Resp, end-to-end) or the `s2p`/`p2s` pair
//! (Pdelay_Req/Pdelay_Resp, peer delay). The two delay mechanisms are
//! mutually exclusive: recording one invalidates the other. Subtractions
//! run in float nanoseconds so correction-field sub-ns fractions survive.

use crate::domain::timespec::Timespec;
use crate::runtime::lowlevel::monotonic_now;

#[derive(Debug, Clone, Copy, Default)]
struct EventRecord {
    tx: Timespec,
    rx: Timespec,
    correction: Timespec,
    valid: bool,
}

impl EventRecord {
    fn set(&mut self, tx: Timespec, rx: Timespec, correction: Timespec) {
        self.tx = tx;
        self.rx = rx;
        self.correction = correction;
        self.valid = true;
    }

    fn clear(&mut self) {
        *self = EventRecord::default();
    }

    /// rx - tx in float nanoseconds.
    fn flight_ns(&self) -> f64 {
        self.rx.to_f64_ns() - self.tx.to_f64_ns()
    }
}

/// Per-port timestamp dataset. Lives for the lifetime of the PTP port.
#[derive(Debug, Clone, Default)]
pub struct TimestampSet {
    m2s: EventRecord,
    s2m: EventRecord,
    s2p: EventRecord,
    p2s: EventRecord,
    complete: bool,
    path_delay_ns: f64,
    offset_ns: f64,
    /// Monotonic time of the last setter call.
    captured_at: Timespec,
    /// Protocol time of the most recent receive timestamp.
    protocol_time: Timespec,
}

impl TimestampSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a master-to-slave event (Sync rx).
    pub fn set_m2s(&mut self, tx: Timespec, rx: Timespec, correction: Timespec) {
        self.m2s.set(tx, rx, correction);
        self.stamp(rx);
        self.recompute();
    }

    /// Record a slave-to-master event (Delay_Resp). Switches the dataset to
    /// end-to-end mode, discarding any peer-delay measurements.
    pub fn set_s2m(&mut self, tx: Timespec, rx: Timespec, correction: Timespec) {
        self.s2p.clear();
        self.p2s.clear();
        self.s2m.set(tx, rx, correction);
        self.stamp(rx);
        self.recompute();
    }

    /// Record a peer-delay exchange. Switches the dataset to peer-delay
    /// mode, discarding any end-to-end measurement. The requester-side
    /// correction is zero by construction; `correction` belongs to the
    /// responder-to-requester leg.
    pub fn set_p2p(
        &mut self,
        s2p_tx: Timespec,
        s2p_rx: Timespec,
        p2s_tx: Timespec,
        p2s_rx: Timespec,
        correction: Timespec,
    ) {
        self.s2m.clear();
        self.s2p.set(s2p_tx, s2p_rx, Timespec::ZERO);
        self.p2s.set(p2s_tx, p2s_rx, correction);
        self.stamp(p2s_rx);
        self.recompute();
    }

    pub fn clear_m2s(&mut self) {
        self.m2s.clear();
        self.recompute();
    }

    pub fn clear_s2m(&mut self) {
        self.s2m.clear();
        self.recompute();
    }

    pub fn clear_p2p(&mut self) {
        self.s2p.clear();
        self.p2s.clear();
        self.recompute();
    }

    pub fn clear(&mut self) {
        self.m2s.clear();
        self.s2m.clear();
        self.s2p.clear();
        self.p2s.clear();
        self.complete = false;
    }

    pub fn complete(&self) -> bool {
        self.complete
    }

    pub fn has_e2e(&self) -> bool {
        self.s2m.valid
    }

    pub fn has_peer_delay(&self) -> bool {
        self.s2p.valid && self.p2s.valid
    }

    /// Offset of the local clock from the master. Defined only when the
    /// dataset is complete.
    pub fn offset_from_master(&self) -> Option<Timespec> {
        self.complete.then(|| Timespec::from_ns_f64(self.offset_ns))
    }

    /// Mean path delay. Defined only when the dataset is complete.
    pub fn path_delay(&self) -> Option<Timespec> {
        self.complete.then(|| Timespec::from_ns_f64(self.path_delay_ns))
    }

    pub fn offset_from_master_ns(&self) -> Option<f64> {
        self.complete.then_some(self.offset_ns)
    }

    pub fn path_delay_ns(&self) -> Option<f64> {
        self.complete.then_some(self.path_delay_ns)
    }

    /// Monotonic time at which the dataset last changed.
    pub fn captured_at(&self) -> Timespec {
        self.captured_at
    }

    /// Protocol time derived from the most recent receive timestamp.
    pub fn protocol_time(&self) -> Timespec {
        self.protocol_time
    }

    fn stamp(&mut self, rx: Timespec) {
        self.captured_at = monotonic_now();
        self.protocol_time = rx;
    }

    fn recompute(&mut self) {
        self.complete = false;
        if !self.m2s.valid {
            return;
        }
        let path_delay = if self.s2m.valid {
            let round_trip = self.s2m.flight_ns() + self.m2s.flight_ns();
            (round_trip - self.s2m.correction.to_f64_ns() - self.m2s.correction.to_f64_ns()) / 2.0
        } else if self.s2p.valid && self.p2s.valid {
            let round_trip = self.s2p.flight_ns() + self.p2s.flight_ns();
            (round_trip - self.p2s.correction.to_f64_ns()) / 2.0
        } else {
            return;
        };
        self.path_delay_ns = path_delay;
        self.offset_ns = self.m2s.flight_ns() - self.m2s.correction.to_f64_ns() - path_delay;
        self.complete = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(sec: i64, nsec: u32) -> Timespec {
        Timespec::new(sec, nsec, 0)
    }

    #[test]
    fn test_e2e_symmetric_path() {
        let mut set = TimestampSet::new();
        set.set_m2s(ts(10, 0), ts(10, 100), Timespec::ZERO);
        assert!(!set.complete());
        assert!(set.offset_from_master().is_none());

        set.set_s2m(ts(20, 0), ts(20, 100), Timespec::ZERO);
        assert!(set.complete());
        assert_eq!(set.path_delay_ns().unwrap(), 100.0);
        assert_eq!(set.offset_from_master_ns().unwrap(), 0.0);
    }

    #[test]
    fn test_e2e_asymmetric_flight_times() {
        let mut set = TimestampSet::new();
        set.set_m2s(ts(10, 0), ts(10, 200), Timespec::ZERO);
        set.set_s2m(ts(20, 0), ts(20, 100), Timespec::ZERO);
        assert_eq!(set.path_delay_ns().unwrap(), 150.0);
        assert_eq!(set.offset_from_master_ns().unwrap(), 50.0);
    }

    #[test]
    fn test_e2e_corrections_subtracted() {
        let mut set = TimestampSet::new();
        // 10 ns of correction on each leg; true delay 100 ns each way.
        set.set_m2s(ts(0, 0), ts(0, 110), Timespec::from_ns(10));
        set.set_s2m(ts(1, 0), ts(1, 110), Timespec::from_ns(10));
        assert_eq!(set.path_delay_ns().unwrap(), 100.0);
        assert_eq!(set.offset_from_master_ns().unwrap(), 0.0);
    }

    #[test]
    fn test_peer_delay_derivation() {
        let mut set = TimestampSet::new();
        set.set_m2s(ts(5, 0), ts(5, 150), Timespec::ZERO);
        set.set_p2p(
            ts(6, 0),
            ts(6, 120),
            ts(7, 0),
            ts(7, 80),
            Timespec::ZERO,
        );
        assert!(set.complete());
        assert_eq!(set.path_delay_ns().unwrap(), 100.0);
        assert_eq!(set.offset_from_master_ns().unwrap(), 50.0);
    }

    #[test]
    fn test_mode_exclusivity() {
        let mut set = TimestampSet::new();
        set.set_m2s(ts(0, 0), ts(0, 100), Timespec::ZERO);
        set.set_p2p(ts(1, 0), ts(1, 100), ts(2, 0), ts(2, 100), Timespec::ZERO);
        assert!(set.has_peer_delay());

        set.set_s2m(ts(3, 0), ts(3, 100), Timespec::ZERO);
        assert!(set.has_e2e());
        assert!(!set.has_peer_delay());

        set.set_p2p(ts(4, 0), ts(4, 100), ts(5, 0), ts(5, 100), Timespec::ZERO);
        assert!(!set.has_e2e());
        assert!(set.has_peer_delay());
    }

    #[test]
    fn test_completeness_definition() {
        let mut set = TimestampSet::new();
        set.set_s2m(ts(1, 0), ts(1, 100), Timespec::ZERO);
        // No m2s yet: incomplete in either mode.
        assert!(!set.complete());
        set.set_m2s(ts(0, 0), ts(0, 100), Timespec::ZERO);
        assert!(set.complete());

        set.clear_s2m();
        assert!(!set.complete());
        assert!(set.path_delay().is_none());
    }

    #[test]
    fn test_clear_m2s_invalidates() {
        let mut set = TimestampSet::new();
        set.set_m2s(ts(0, 0), ts(0, 100), Timespec::ZERO);
        set.set_s2m(ts(1, 0), ts(1, 100), Timespec::ZERO);
        assert!(set.complete());
        set.clear_m2s();
        assert!(!set.complete());
        // The e2e record survives; a fresh m2s completes the set again.
        set.set_m2s(ts(2, 0), ts(2, 100), Timespec::ZERO);
        assert!(set.complete());
    }

    #[test]
    fn test_sub_ns_corrections_preserved() {
        let mut set = TimestampSet::new();
        // Correction of 0.5 ns in Q16.16.
        let half_ns = Timespec::from_scaled_ns(0x8000);
        set.set_m2s(ts(0, 0), ts(0, 100), half_ns);
        set.set_s2m(ts(1, 0), ts(1, 100), Timespec::ZERO);
        let pd = set.path_delay_ns().unwrap();
        assert!((pd - 99.75).abs() < 1e-9);
        let offset = set.offset_from_master_ns().unwrap();
        assert!((offset - (100.0 - 0.5 - 99.75)).abs() < 1e-9);
    }

    #[test]
    fn test_protocol_time_tracks_latest_rx() {
        let mut set = TimestampSet::new();
        set.set_m2s(ts(100, 0), ts(100, 50), Timespec::ZERO);
        assert_eq!(set.protocol_time(), ts(100, 50));
        set.set_s2m(ts(200, 0), ts(200, 60), Timespec::ZERO);
        assert_eq!(set.protocol_time(), ts(200, 60));
    }
}
