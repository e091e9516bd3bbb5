//! Thin wrappers over the Linux primitives the event loop is built on:
//! eventfd for queue wakeups, timerfd for deadlines, signalfd for the root
//! thread, and poll(2) to multiplex them.

use std::io;
use std::mem;
use std::os::fd::RawFd;

use crate::domain::timespec::{NS_PER_SEC, Timespec};

/// Close-on-drop file descriptor.
#[derive(Debug)]
pub struct OwnedFd(RawFd);

impl OwnedFd {
    pub fn as_raw(&self) -> RawFd {
        self.0
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

fn last_err(op: &'static str) -> io::Error {
    let err = io::Error::last_os_error();
    io::Error::new(err.kind(), format!("{op}: {err}"))
}

pub fn eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(last_err("eventfd"));
    }
    Ok(OwnedFd(fd))
}

pub fn eventfd_signal(fd: &OwnedFd) -> io::Result<()> {
    let value: u64 = 1;
    let rc = unsafe {
        libc::write(
            fd.as_raw(),
            (&raw const value).cast(),
            mem::size_of::<u64>(),
        )
    };
    // A full counter still leaves the fd readable, which is all we need.
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            return Err(last_err("eventfd write"));
        }
    }
    Ok(())
}

pub fn eventfd_drain(fd: &OwnedFd) -> io::Result<u64> {
    let mut value: u64 = 0;
    let rc = unsafe {
        libc::read(
            fd.as_raw(),
            (&raw mut value).cast(),
            mem::size_of::<u64>(),
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(0);
        }
        return Err(last_err("eventfd read"));
    }
    Ok(value)
}

pub fn timerfd_create() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(last_err("timerfd_create"));
    }
    Ok(OwnedFd(fd))
}

/// Arm to an absolute monotonic deadline, or disarm with `None`.
pub fn timerfd_arm(fd: &OwnedFd, deadline: Option<Timespec>) -> io::Result<()> {
    let mut spec: libc::itimerspec = unsafe { mem::zeroed() };
    if let Some(t) = deadline {
        // A deadline already in the past must still fire: clamp to 1 ns
        // because an all-zero itimerspec disarms.
        spec.it_value.tv_sec = t.sec.max(0) as libc::time_t;
        spec.it_value.tv_nsec = if t.sec < 0 { 1 } else { t.nsec.max(1) as libc::c_long };
    }
    let rc = unsafe {
        libc::timerfd_settime(fd.as_raw(), libc::TFD_TIMER_ABSTIME, &spec, std::ptr::null_mut())
    };
    if rc < 0 {
        return Err(last_err("timerfd_settime"));
    }
    Ok(())
}

pub fn timerfd_drain(fd: &OwnedFd) -> io::Result<()> {
    let mut expirations: u64 = 0;
    let rc = unsafe {
        libc::read(
            fd.as_raw(),
            (&raw mut expirations).cast(),
            mem::size_of::<u64>(),
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            return Err(last_err("timerfd read"));
        }
    }
    Ok(())
}

/// Block `signos` for the whole process. Must run before worker threads are
/// spawned so the mask is inherited.
pub fn block_signals(signos: &[i32]) -> io::Result<()> {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        for &signo in signos {
            libc::sigaddset(&mut set, signo);
        }
        if libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) != 0 {
            return Err(last_err("pthread_sigmask"));
        }
    }
    Ok(())
}

pub fn signalfd_create(signos: &[i32]) -> io::Result<OwnedFd> {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        for &signo in signos {
            libc::sigaddset(&mut set, signo);
        }
        let fd = libc::signalfd(-1, &set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC);
        if fd < 0 {
            return Err(last_err("signalfd"));
        }
        Ok(OwnedFd(fd))
    }
}

/// Read every queued signal number from a signalfd.
pub fn signalfd_read(fd: &OwnedFd) -> io::Result<Vec<i32>> {
    let mut out = Vec::new();
    loop {
        let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };
        let rc = unsafe {
            libc::read(
                fd.as_raw(),
                (&raw mut info).cast(),
                mem::size_of::<libc::signalfd_siginfo>(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(out);
            }
            return Err(last_err("signalfd read"));
        }
        if rc as usize != mem::size_of::<libc::signalfd_siginfo>() {
            return Ok(out);
        }
        out.push(info.ssi_signo as i32);
    }
}

pub fn poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(last_err("poll"));
        }
        return Ok(rc as usize);
    }
}

/// Current CLOCK_MONOTONIC reading.
pub fn monotonic_now() -> Timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Cannot fail for CLOCK_MONOTONIC on any supported kernel.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    Timespec {
        sec: ts.tv_sec as i64,
        nsec: (ts.tv_nsec as u32).min(NS_PER_SEC - 1),
        nsec_frac: 0,
    }
}

/// First signal of the real-time range used for per-thread user delivery.
pub fn rt_signal_base() -> i32 {
    libc::SIGRTMIN()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eventfd_signal_and_drain() {
        let fd = eventfd().unwrap();
        assert_eq!(eventfd_drain(&fd).unwrap(), 0);
        eventfd_signal(&fd).unwrap();
        eventfd_signal(&fd).unwrap();
        assert_eq!(eventfd_drain(&fd).unwrap(), 2);
        assert_eq!(eventfd_drain(&fd).unwrap(), 0);
    }

    #[test]
    fn test_timerfd_fires_on_past_deadline() {
        let fd = timerfd_create().unwrap();
        timerfd_arm(&fd, Some(monotonic_now())).unwrap();
        let mut fds = [libc::pollfd {
            fd: fd.as_raw(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let n = poll(&mut fds, 1000).unwrap();
        assert_eq!(n, 1);
        timerfd_drain(&fd).unwrap();
    }

    #[test]
    fn test_monotonic_now_advances() {
        let a = monotonic_now();
        let b = monotonic_now();
        assert!(b >= a);
    }
}
