//! Cooperative thread substrate: each participant is an OS thread running a
//! poll(2) loop over its message queue, timers, pending signals and user
//! file descriptors. Within one wake-up events dispatch in that order.
//! Cross-thread communication is message passing only.

pub mod lowlevel;
pub mod message;
pub mod signal;
pub mod thread;
pub mod timer;

use thiserror::Error;

pub use message::{Message, MessagePool, Payload};
pub use thread::{Runtime, RuntimeConfig, ThreadCtx, ThreadHandle, ThreadRunner, ThreadServicer};
pub use timer::TimerId;

/// Errors raised by the thread/message/timer substrate.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The message pool is empty; callers drop and retry later.
    #[error("out of message pool resources")]
    OutOfResources,
    #[error("timer {0} already exists")]
    TimerExists(TimerId),
    #[error("no such timer {0}")]
    NoSuchTimer(TimerId),
    /// Target thread has exited; the message was returned to the pool.
    #[error("thread '{0}' is gone")]
    ThreadGone(String),
    /// A blocking send was aborted because the target shut down first.
    #[error("send-wait aborted by '{0}' shutdown")]
    SendAborted(String),
    #[error("{op}: {source}")]
    Syscall {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    /// `on_startup` returned an error; the thread exited with this code.
    #[error("thread '{name}' startup failed (exit code {code})")]
    StartupFailed { name: String, code: i32 },
}

impl RuntimeError {
    pub(crate) fn syscall(op: &'static str, source: std::io::Error) -> Self {
        RuntimeError::Syscall { op, source }
    }
}
