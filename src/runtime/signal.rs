//! Process-wide signal dispatch.
//!
//! The root thread owns a signalfd covering SIGINT, SIGTERM and the
//! real-time range. Received signal numbers fan out to subscribed threads
//! through their pending-signal sets. Delivery coalesces: a signal number
//! already pending for a thread is not queued twice, so a burst of the same
//! signal yields at least one callback but possibly fewer than the burst.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use super::thread::ThreadHandle;

#[derive(Default)]
pub struct SignalDispatch {
    table: Mutex<HashMap<i32, Vec<ThreadHandle>>>,
}

impl SignalDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, signo: i32, handle: &ThreadHandle) {
        let mut table = self.table.lock().unwrap();
        let subs = table.entry(signo).or_default();
        if !subs.iter().any(|h| h == handle) {
            subs.push(handle.clone());
        }
    }

    pub fn unsubscribe(&self, signo: i32, handle: &ThreadHandle) {
        let mut table = self.table.lock().unwrap();
        if let Some(subs) = table.get_mut(&signo) {
            subs.retain(|h| h != handle);
        }
    }

    /// Deliver `signo` to every subscriber. Also serves as the injection
    /// hook for tests, which cannot portably raise real-time signals at a
    /// precise moment.
    pub fn dispatch(&self, signo: i32) -> usize {
        let table = self.table.lock().unwrap();
        let Some(subs) = table.get(&signo) else {
            debug!(signo, "signal with no subscribers");
            return 0;
        };
        let mut delivered = 0;
        for handle in subs {
            if handle.push_signal(signo) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Drop dead threads from every subscription list.
    pub fn prune(&self) {
        let mut table = self.table.lock().unwrap();
        for subs in table.values_mut() {
            subs.retain(|h| h.is_alive());
        }
    }
}
