//! Pooled, reply-capable messages.
//!
//! Every message is allocated from a fixed-size pool and has exactly one
//! owner at a time: the allocating sender until it is sent, the recipient
//! until it frees or replies, and the original sender again once a reply
//! arrives. The pool bounds outstanding messages; exhaustion is a
//! recoverable error (drop and retry).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use chrono::{DateTime, Utc};

use crate::domain::grandmaster::GrandmasterInfo;
use crate::domain::link::LinkTable;
use crate::domain::state::{ControlFlags, LeapType};
use crate::domain::status::{InstanceId, InstanceStatus};
use crate::domain::timespec::Timespec;

use super::RuntimeError;
use super::thread::ThreadHandle;

/// Closed set of message payloads exchanged between threads.
#[derive(Debug)]
pub enum Payload {
    /// Pool slot at rest.
    Empty,

    // Engine -> module requests (blocking unless noted).
    GetStatus,
    Control {
        flags: ControlFlags,
        mask: ControlFlags,
    },
    StepClock {
        offset: Timespec,
    },
    WriteTopology,
    /// Async: flush periodic stats for the given wall time.
    LogStats {
        time: DateTime<Utc>,
    },
    /// Async: persist current state.
    SaveState,
    /// Async: close the stats period and rotate histograms.
    StatsEndPeriod {
        time: DateTime<Utc>,
    },
    /// Async: inject a fault or behavior for tests.
    TestMode {
        id: u32,
        params: [i64; 3],
    },
    /// Async broadcast; modules ignore their own updates.
    UpdateGmInfo {
        originator: InstanceId,
        info: GrandmasterInfo,
    },
    /// Async broadcast of a pending leap second.
    UpdateLeapSecond {
        kind: LeapType,
    },
    /// Async: a new interface snapshot. The module must release it.
    LinkTable {
        table: Arc<LinkTable>,
    },

    // Replies.
    Status(Box<InstanceStatus>),
    Topology(String),
    Ack,
    Failed {
        reason: String,
    },

    // Module -> engine notifications (async).
    StateChanged {
        instance: InstanceId,
        status: Box<InstanceStatus>,
    },
    LinkTableRelease {
        instance: InstanceId,
        version: u64,
    },
    /// Offset sample for the clustering determinant.
    ClusteringInput {
        instance: InstanceId,
        offset_ns: f64,
    },
    /// Ask the engine to announce a pending leap second.
    ScheduleLeapSecond {
        instance: InstanceId,
        kind: LeapType,
    },
    CancelLeapSecond {
        instance: InstanceId,
    },
    /// Status lookup by instance name; replied with `Status` or `Failed`.
    GetInstanceStatusByName {
        name: String,
    },
    /// Thread-handle lookup by instance name; replied with
    /// `InstanceHandle` or `Failed`.
    GetInstanceHandleByName {
        name: String,
    },
    InstanceHandle(ThreadHandle),

    // Provider -> engine: a fresh interface snapshot to version and fan out.
    LinkTableUpdate {
        rows: Vec<crate::domain::link::LinkRow>,
    },

    // Loopback payloads used by the substrate's own tests.
    TestRequest {
        token: u64,
    },
    TestResponse {
        token: u64,
    },
}

impl Payload {
    /// Numeric id for logs and diagnostics.
    pub fn id(&self) -> u32 {
        match self {
            Payload::Empty => 0,
            Payload::GetStatus => 1,
            Payload::Control { .. } => 2,
            Payload::StepClock { .. } => 3,
            Payload::WriteTopology => 4,
            Payload::LogStats { .. } => 5,
            Payload::SaveState => 6,
            Payload::StatsEndPeriod { .. } => 7,
            Payload::TestMode { .. } => 8,
            Payload::UpdateGmInfo { .. } => 9,
            Payload::UpdateLeapSecond { .. } => 10,
            Payload::LinkTable { .. } => 11,
            Payload::Status(_) => 12,
            Payload::Topology(_) => 13,
            Payload::Ack => 14,
            Payload::Failed { .. } => 15,
            Payload::StateChanged { .. } => 16,
            Payload::LinkTableRelease { .. } => 17,
            Payload::ClusteringInput { .. } => 18,
            Payload::ScheduleLeapSecond { .. } => 19,
            Payload::CancelLeapSecond { .. } => 20,
            Payload::GetInstanceStatusByName { .. } => 21,
            Payload::GetInstanceHandleByName { .. } => 22,
            Payload::InstanceHandle(_) => 23,
            Payload::LinkTableUpdate { .. } => 24,
            Payload::TestRequest { .. } => 25,
            Payload::TestResponse { .. } => 26,
        }
    }
}

/// Reply rendezvous for blocking sends.
#[derive(Debug, Default)]
pub(crate) struct ReplySlot {
    inner: Mutex<ReplyState>,
    cv: Condvar,
}

#[derive(Debug, Default)]
struct ReplyState {
    msg: Option<Box<Message>>,
    aborted: bool,
}

impl ReplySlot {
    pub(crate) fn fulfill(&self, msg: Box<Message>) {
        let mut state = self.inner.lock().unwrap();
        state.msg = Some(msg);
        self.cv.notify_one();
    }

    pub(crate) fn abort(&self) {
        let mut state = self.inner.lock().unwrap();
        state.aborted = true;
        self.cv.notify_one();
    }

    pub(crate) fn wait(&self) -> Option<Box<Message>> {
        let mut state = self.inner.lock().unwrap();
        loop {
            if let Some(msg) = state.msg.take() {
                return Some(msg);
            }
            if state.aborted {
                return None;
            }
            state = self.cv.wait(state).unwrap();
        }
    }
}

/// Pooled message envelope.
#[derive(Debug)]
pub struct Message {
    payload: Payload,
    pub(crate) sender: Option<ThreadHandle>,
    pub(crate) needs_reply: bool,
    pub(crate) reply_slot: Option<Arc<ReplySlot>>,
    pub(crate) is_reply: bool,
}

impl Message {
    fn empty() -> Self {
        Message {
            payload: Payload::Empty,
            sender: None,
            needs_reply: false,
            reply_slot: None,
            is_reply: false,
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub fn take_payload(&mut self) -> Payload {
        std::mem::replace(&mut self.payload, Payload::Empty)
    }

    pub fn set_payload(&mut self, payload: Payload) {
        self.payload = payload;
    }

    /// True for a reply routed back to the original sender.
    pub fn is_reply(&self) -> bool {
        self.is_reply
    }

    pub fn sender(&self) -> Option<&ThreadHandle> {
        self.sender.as_ref()
    }

    pub fn needs_reply(&self) -> bool {
        self.needs_reply
    }
}

/// Fixed-size message pool shared by all threads of one runtime.
#[derive(Debug, Clone)]
pub struct MessagePool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    free: Mutex<Vec<Box<Message>>>,
    capacity: usize,
    outstanding: AtomicUsize,
}

impl MessagePool {
    pub fn new(capacity: usize) -> Self {
        let free = (0..capacity).map(|_| Box::new(Message::empty())).collect();
        MessagePool {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                capacity,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Take a message from the pool. Fails when the pool is exhausted.
    pub fn alloc(&self, payload: Payload) -> Result<Box<Message>, RuntimeError> {
        let mut free = self.inner.free.lock().unwrap();
        let Some(mut msg) = free.pop() else {
            return Err(RuntimeError::OutOfResources);
        };
        drop(free);
        self.inner.outstanding.fetch_add(1, Ordering::Relaxed);
        msg.payload = payload;
        msg.sender = None;
        msg.needs_reply = false;
        msg.reply_slot = None;
        msg.is_reply = false;
        Ok(msg)
    }

    /// Return a message to the pool. A message with a pending reply slot is
    /// being dropped without a reply; the waiter is woken with an abort.
    pub fn free(&self, mut msg: Box<Message>) {
        if let Some(slot) = msg.reply_slot.take() {
            slot.abort();
        }
        msg.payload = Payload::Empty;
        msg.sender = None;
        msg.needs_reply = false;
        msg.is_reply = false;
        self.inner.free.lock().unwrap().push(msg);
        self.inner.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Messages currently alive outside the pool.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_bounds_allocations() {
        let pool = MessagePool::new(2);
        let a = pool.alloc(Payload::Ack).unwrap();
        let b = pool.alloc(Payload::Ack).unwrap();
        assert!(matches!(
            pool.alloc(Payload::Ack),
            Err(RuntimeError::OutOfResources)
        ));
        assert_eq!(pool.outstanding(), 2);
        pool.free(a);
        pool.free(b);
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.alloc(Payload::Ack).is_ok());
    }

    #[test]
    fn test_free_clears_payload() {
        let pool = MessagePool::new(1);
        let mut msg = pool.alloc(Payload::TestRequest { token: 7 }).unwrap();
        msg.is_reply = true;
        pool.free(msg);
        let msg = pool.alloc(Payload::Empty).unwrap();
        assert!(matches!(msg.payload(), Payload::Empty));
        assert!(!msg.is_reply());
    }
}
