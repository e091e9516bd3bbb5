//! Per-thread timer bookkeeping.
//!
//! Timers run against CLOCK_MONOTONIC. The owning thread arms its timerfd
//! to the earliest deadline; on expiry, due timers fire once each and
//! periodic timers schedule their next tick from *now* — a loop that fell
//! behind drops the missed ticks instead of bursting.

use serde::Serialize;

use crate::domain::timespec::Timespec;

use super::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TimerId(pub u32);

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timer{}", self.0)
    }
}

#[derive(Debug)]
struct TimerRec {
    id: TimerId,
    interval: Timespec,
    periodic: bool,
    next: Option<Timespec>,
}

#[derive(Debug, Default)]
pub(crate) struct TimerSet {
    timers: Vec<TimerRec>,
}

impl TimerSet {
    pub fn create(&mut self, id: TimerId) -> Result<(), RuntimeError> {
        if self.timers.iter().any(|t| t.id == id) {
            return Err(RuntimeError::TimerExists(id));
        }
        self.timers.push(TimerRec {
            id,
            interval: Timespec::ZERO,
            periodic: false,
            next: None,
        });
        Ok(())
    }

    /// Arm a timer. `immediate_first` fires the first tick right away,
    /// otherwise the first tick lands one interval from now.
    pub fn start(
        &mut self,
        id: TimerId,
        now: Timespec,
        interval: Timespec,
        periodic: bool,
        immediate_first: bool,
    ) -> Result<(), RuntimeError> {
        let rec = self
            .timers
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(RuntimeError::NoSuchTimer(id))?;
        rec.interval = interval;
        rec.periodic = periodic;
        rec.next = Some(if immediate_first { now } else { now + interval });
        Ok(())
    }

    /// Cancel pending fires. Stopping an idle timer is not an error.
    pub fn stop(&mut self, id: TimerId) -> Result<(), RuntimeError> {
        let rec = self
            .timers
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(RuntimeError::NoSuchTimer(id))?;
        rec.next = None;
        Ok(())
    }

    pub fn stop_all(&mut self) {
        for rec in &mut self.timers {
            rec.next = None;
        }
    }

    /// Earliest armed deadline, for timerfd arming.
    pub fn next_deadline(&self) -> Option<Timespec> {
        self.timers.iter().filter_map(|t| t.next).min()
    }

    /// Collect timers due at `now`, rescheduling periodic ones from `now`.
    pub fn expire(&mut self, now: Timespec) -> Vec<TimerId> {
        let mut due = Vec::new();
        for rec in &mut self.timers {
            let Some(next) = rec.next else { continue };
            if next > now {
                continue;
            }
            due.push(rec.id);
            rec.next = if rec.periodic {
                Some(now + rec.interval)
            } else {
                None
            };
        }
        due
    }
}
