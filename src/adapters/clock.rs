//! Local clock control.
//!
//! Clocks are addressed by handle so the engine can enforce that exactly
//! one instance at a time holds clock control for each of them. The system
//! clock is driven through `clock_adjtime`/`clock_settime`; a deterministic
//! in-memory clock backs the tests.

use std::io;
use std::sync::Mutex;

use bitflags::bitflags;
use thiserror::Error;
use tracing::debug;

use crate::domain::status::ClockHandle;
use crate::domain::timespec::Timespec;

#[derive(Error, Debug)]
pub enum ClockError {
    /// Adjustment denied, typically missing CAP_SYS_TIME.
    #[error("permission denied: {0}")]
    Permission(io::Error),
    #[error("unknown clock handle {0}")]
    UnknownClock(ClockHandle),
    #[error("clock syscall failed: {0}")]
    Sys(io::Error),
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ClockCaps: u32 {
        const ADJ_FREQ = 1 << 0;
        const ADJ_TIME = 1 << 1;
        const STEP = 1 << 2;
        /// Hardware timestamping on the associated interface.
        const HW_TIMESTAMPS = 1 << 3;
    }
}

/// Handle-addressed clock operations used by sync modules and the engine.
pub trait ClockControl: Send + Sync {
    /// Difference `a - b` between two clocks.
    fn compare(&self, a: ClockHandle, b: ClockHandle) -> Result<Timespec, ClockError>;
    /// Slew the clock by `offset` (gradual adjustment).
    fn adjtime(&self, handle: ClockHandle, offset: Timespec) -> Result<(), ClockError>;
    /// Set the frequency correction in parts per billion.
    fn adjfreq(&self, handle: ClockHandle, ppb: f64) -> Result<(), ClockError>;
    /// Jump the clock by `offset` in one step.
    fn step(&self, handle: ClockHandle, offset: Timespec) -> Result<(), ClockError>;
    fn caps(&self, handle: ClockHandle) -> Result<ClockCaps, ClockError>;
}

/// The real system clock (CLOCK_REALTIME). PHC handles are not exposed by
/// this implementation; modules with hardware clocks supply their own.
pub struct SystemClock;

impl SystemClock {
    fn check_handle(handle: ClockHandle) -> Result<(), ClockError> {
        if handle.is_system() {
            Ok(())
        } else {
            Err(ClockError::UnknownClock(handle))
        }
    }

    fn adjtimex(modes: u32, apply: impl FnOnce(&mut libc::timex)) -> Result<(), ClockError> {
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        tx.modes = modes;
        apply(&mut tx);
        let rc = unsafe { libc::clock_adjtime(libc::CLOCK_REALTIME, &mut tx) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.kind() {
                io::ErrorKind::PermissionDenied => ClockError::Permission(err),
                _ => ClockError::Sys(err),
            });
        }
        Ok(())
    }
}

impl ClockControl for SystemClock {
    fn compare(&self, a: ClockHandle, b: ClockHandle) -> Result<Timespec, ClockError> {
        Self::check_handle(a)?;
        Self::check_handle(b)?;
        // Only the system clock exists here, so the difference is zero.
        Ok(Timespec::ZERO)
    }

    fn adjtime(&self, handle: ClockHandle, offset: Timespec) -> Result<(), ClockError> {
        Self::check_handle(handle)?;
        debug!(%offset, "slewing system clock");
        Self::adjtimex(libc::ADJ_SETOFFSET | libc::ADJ_NANO, |tx| {
            tx.time.tv_sec = offset.sec as libc::time_t;
            tx.time.tv_usec = offset.nsec as libc::suseconds_t;
        })
    }

    fn adjfreq(&self, handle: ClockHandle, ppb: f64) -> Result<(), ClockError> {
        Self::check_handle(handle)?;
        // The kernel freq field is in ppm with a 16-bit binary fraction.
        let freq = (ppb / 1000.0 * 65536.0) as libc::c_long;
        Self::adjtimex(libc::ADJ_FREQUENCY, |tx| {
            tx.freq = freq;
        })
    }

    fn step(&self, handle: ClockHandle, offset: Timespec) -> Result<(), ClockError> {
        Self::check_handle(handle)?;
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
        }
        let target = Timespec::new(now.tv_sec as i64, now.tv_nsec as u32, 0) + offset;
        let ts = libc::timespec {
            tv_sec: target.sec as libc::time_t,
            tv_nsec: target.nsec as libc::c_long,
        };
        let rc = unsafe { libc::clock_settime(libc::CLOCK_REALTIME, &ts) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return Err(match err.kind() {
                io::ErrorKind::PermissionDenied => ClockError::Permission(err),
                _ => ClockError::Sys(err),
            });
        }
        Ok(())
    }

    fn caps(&self, handle: ClockHandle) -> Result<ClockCaps, ClockError> {
        Self::check_handle(handle)?;
        Ok(ClockCaps::ADJ_FREQ | ClockCaps::ADJ_TIME | ClockCaps::STEP)
    }
}

/// Deterministic clock for tests: records every adjustment.
#[derive(Default)]
pub struct FakeClock {
    state: Mutex<FakeClockState>,
}

#[derive(Debug, Default)]
pub struct FakeClockState {
    pub offset: Timespec,
    pub freq_ppb: f64,
    pub steps: Vec<Timespec>,
    pub slews: Vec<Timespec>,
    /// When set, every adjustment fails with this errno-style kind.
    pub fail_permission: bool,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_adjustments(&self) {
        self.state.lock().unwrap().fail_permission = true;
    }

    pub fn snapshot(&self) -> FakeClockState {
        let state = self.state.lock().unwrap();
        FakeClockState {
            offset: state.offset,
            freq_ppb: state.freq_ppb,
            steps: state.steps.clone(),
            slews: state.slews.clone(),
            fail_permission: state.fail_permission,
        }
    }

    fn check(&self) -> Result<(), ClockError> {
        if self.state.lock().unwrap().fail_permission {
            Err(ClockError::Permission(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "adjustment denied",
            )))
        } else {
            Ok(())
        }
    }
}

impl ClockControl for FakeClock {
    fn compare(&self, _a: ClockHandle, _b: ClockHandle) -> Result<Timespec, ClockError> {
        Ok(self.state.lock().unwrap().offset)
    }

    fn adjtime(&self, _handle: ClockHandle, offset: Timespec) -> Result<(), ClockError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.offset = state.offset + offset;
        state.slews.push(offset);
        Ok(())
    }

    fn adjfreq(&self, _handle: ClockHandle, ppb: f64) -> Result<(), ClockError> {
        self.check()?;
        self.state.lock().unwrap().freq_ppb = ppb;
        Ok(())
    }

    fn step(&self, _handle: ClockHandle, offset: Timespec) -> Result<(), ClockError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.offset = state.offset + offset;
        state.steps.push(offset);
        Ok(())
    }

    fn caps(&self, _handle: ClockHandle) -> Result<ClockCaps, ClockError> {
        Ok(ClockCaps::ADJ_FREQ | ClockCaps::ADJ_TIME | ClockCaps::STEP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_clock_records_adjustments() {
        let clock = FakeClock::new();
        clock
            .step(ClockHandle::SYSTEM, Timespec::from_ns(500))
            .unwrap();
        clock
            .adjtime(ClockHandle::SYSTEM, Timespec::from_ns(-200))
            .unwrap();
        clock.adjfreq(ClockHandle::SYSTEM, 12.5).unwrap();
        let state = clock.snapshot();
        assert_eq!(state.steps, vec![Timespec::from_ns(500)]);
        assert_eq!(state.slews, vec![Timespec::from_ns(-200)]);
        assert_eq!(state.freq_ppb, 12.5);
        assert_eq!(state.offset, Timespec::from_ns(300));
    }

    #[test]
    fn test_fake_clock_permission_failure() {
        let clock = FakeClock::new();
        clock.deny_adjustments();
        let err = clock
            .step(ClockHandle::SYSTEM, Timespec::from_ns(1))
            .unwrap_err();
        assert!(matches!(err, ClockError::Permission(_)));
    }

    #[test]
    fn test_system_clock_rejects_unknown_handle() {
        let clock = SystemClock;
        let err = clock.caps(ClockHandle::phc(0)).unwrap_err();
        assert!(matches!(err, ClockError::UnknownClock(_)));
    }
}
