//! Cooperative per-thread event loop and cross-thread send primitives.

use std::collections::{BTreeSet, VecDeque};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;

use tracing::{debug, error, warn};

use crate::domain::timespec::Timespec;

use super::RuntimeError;
use super::lowlevel::{
    self, OwnedFd, eventfd, eventfd_drain, eventfd_signal, monotonic_now, signalfd_create,
    signalfd_read, timerfd_arm, timerfd_create, timerfd_drain,
};
use super::message::{Message, MessagePool, Payload, ReplySlot};
use super::signal::SignalDispatch;
use super::timer::{TimerId, TimerSet};

/// Exit code reported when a loop hits a fatal syscall error.
const EXIT_FATAL: i32 = 1;

pub(crate) struct ThreadShared {
    name: String,
    queue: Mutex<VecDeque<Box<Message>>>,
    wake: OwnedFd,
    pending_signals: Mutex<BTreeSet<i32>>,
    signalfd: Mutex<Option<OwnedFd>>,
    alive: AtomicBool,
    shutdown: AtomicBool,
}

/// Cheap, cloneable address of a runtime thread.
#[derive(Clone)]
pub struct ThreadHandle {
    shared: Arc<ThreadShared>,
}

impl std::fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ThreadHandle({})", self.shared.name)
    }
}

impl PartialEq for ThreadHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for ThreadHandle {}

impl ThreadHandle {
    fn new(name: &str) -> Result<Self, RuntimeError> {
        let wake = eventfd().map_err(|e| RuntimeError::syscall("eventfd", e))?;
        Ok(ThreadHandle {
            shared: Arc::new(ThreadShared {
                name: name.to_string(),
                queue: Mutex::new(VecDeque::new()),
                wake,
                pending_signals: Mutex::new(BTreeSet::new()),
                signalfd: Mutex::new(None),
                alive: AtomicBool::new(true),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Hand a message to this thread's queue. Returns the message when the
    /// thread is no longer accepting.
    pub(crate) fn enqueue(&self, msg: Box<Message>) -> Result<(), Box<Message>> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(msg);
        }
        {
            // Liveness is re-checked under the queue lock: the exit path
            // clears `alive` before draining, so a push that saw the thread
            // alive here is guaranteed to be collected by that drain.
            let mut queue = self.shared.queue.lock().unwrap();
            if !self.is_alive() {
                return Err(msg);
            }
            queue.push_back(msg);
        }
        let _ = eventfd_signal(&self.shared.wake);
        Ok(())
    }

    /// Mark a signal pending. Coalesces: returns false when the same signal
    /// number was already pending for this thread.
    pub(crate) fn push_signal(&self, signo: i32) -> bool {
        if !self.is_alive() {
            return false;
        }
        let inserted = self.shared.pending_signals.lock().unwrap().insert(signo);
        if inserted {
            let _ = eventfd_signal(&self.shared.wake);
        }
        inserted
    }

    fn take_pending_signals(&self) -> Vec<i32> {
        let mut pending = self.shared.pending_signals.lock().unwrap();
        let out: Vec<i32> = pending.iter().copied().collect();
        pending.clear();
        out
    }

    /// A handle with a queue but no loop behind it, for unit tests.
    #[cfg(test)]
    pub(crate) fn detached(name: &str) -> Self {
        ThreadHandle::new(name).unwrap()
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of message slots shared by all threads.
    pub pool_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig { pool_size: 256 }
    }
}

struct RuntimeInner {
    pool: MessagePool,
    signals: SignalDispatch,
}

/// The process-wide substrate: message pool plus signal dispatch table,
/// created once at startup and passed around by cheap clone.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Runtime {
            inner: Arc::new(RuntimeInner {
                pool: MessagePool::new(config.pool_size),
                signals: SignalDispatch::new(),
            }),
        }
    }

    pub fn pool(&self) -> &MessagePool {
        &self.inner.pool
    }

    pub fn signals(&self) -> &SignalDispatch {
        &self.inner.signals
    }

    /// Fire-and-forget send of a fresh message. The recipient frees it.
    pub fn post(&self, target: &ThreadHandle, payload: Payload) -> Result<(), RuntimeError> {
        let msg = self.inner.pool.alloc(payload)?;
        self.send(target, msg)
    }

    /// Non-blocking send; ownership moves to the target thread.
    pub fn send(&self, target: &ThreadHandle, msg: Box<Message>) -> Result<(), RuntimeError> {
        match target.enqueue(msg) {
            Ok(()) => Ok(()),
            Err(msg) => {
                self.inner.pool.free(msg);
                Err(RuntimeError::ThreadGone(target.name().to_string()))
            }
        }
    }

    /// Blocking send: parks the calling thread until the target replies.
    /// The caller's loop is NOT pumping events during the wait, so cyclic
    /// send-waits between two threads deadlock; contract is that only the
    /// lower-numbered party initiates.
    pub fn send_wait(
        &self,
        target: &ThreadHandle,
        mut msg: Box<Message>,
    ) -> Result<Box<Message>, RuntimeError> {
        let slot = Arc::new(ReplySlot::default());
        msg.needs_reply = true;
        msg.reply_slot = Some(Arc::clone(&slot));
        match target.enqueue(msg) {
            Ok(()) => {}
            Err(msg) => {
                self.inner.pool.free(msg);
                return Err(RuntimeError::ThreadGone(target.name().to_string()));
            }
        }
        match slot.wait() {
            Some(reply) => Ok(reply),
            None => Err(RuntimeError::SendAborted(target.name().to_string())),
        }
    }

    /// Route a reply back to the sender: a parked sender is woken directly,
    /// an asynchronous reply-requested message goes back through the
    /// sender's queue, anything else returns to the pool.
    pub fn reply(&self, mut msg: Box<Message>) {
        msg.is_reply = true;
        if let Some(slot) = msg.reply_slot.take() {
            slot.fulfill(msg);
            return;
        }
        if msg.needs_reply {
            if let Some(sender) = msg.sender.take() {
                msg.needs_reply = false;
                match sender.enqueue(msg) {
                    Ok(()) => return,
                    Err(msg) => {
                        debug!(thread = sender.name(), "reply to dead thread dropped");
                        self.inner.pool.free(msg);
                        return;
                    }
                }
            }
        }
        self.inner.pool.free(msg);
    }

    pub fn free(&self, msg: Box<Message>) {
        self.inner.pool.free(msg);
    }

    /// Attach a signalfd for `signos` to a thread (normally the root
    /// thread) and block those signals process-wide. Call before spawning
    /// worker threads so every thread inherits the mask.
    pub fn enable_signalfd(
        &self,
        handle: &ThreadHandle,
        signos: &[i32],
    ) -> Result<(), RuntimeError> {
        lowlevel::block_signals(signos).map_err(|e| RuntimeError::syscall("sigmask", e))?;
        let fd = signalfd_create(signos).map_err(|e| RuntimeError::syscall("signalfd", e))?;
        *handle.shared.signalfd.lock().unwrap() = Some(fd);
        let _ = eventfd_signal(&handle.shared.wake);
        Ok(())
    }

    /// Spawn a servicer thread. Blocks until `on_startup` has run; a
    /// startup failure surfaces here and the thread is already joined.
    pub fn spawn<S: ThreadServicer>(
        &self,
        name: &str,
        servicer: S,
    ) -> Result<ThreadRunner, RuntimeError> {
        let handle = ThreadHandle::new(name)?;
        let thread_handle = handle.clone();
        let runtime = self.clone();
        let (ready_tx, ready_rx) = mpsc::channel::<i32>();
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || thread_main(runtime, thread_handle, servicer, ready_tx))
            .map_err(|e| RuntimeError::syscall("thread spawn", e))?;
        match ready_rx.recv() {
            Ok(0) => Ok(ThreadRunner {
                handle,
                join: Some(join),
            }),
            Ok(code) => {
                let _ = join.join();
                Err(RuntimeError::StartupFailed {
                    name: name.to_string(),
                    code,
                })
            }
            Err(_) => {
                let _ = join.join();
                Err(RuntimeError::StartupFailed {
                    name: name.to_string(),
                    code: EXIT_FATAL,
                })
            }
        }
    }
}

/// Callbacks a thread services. All run serially on the owning thread; they
/// must return promptly or they starve the thread's other event sources.
pub trait ThreadServicer: Send + 'static {
    fn on_startup(&mut self, _ctx: &mut ThreadCtx) -> Result<(), RuntimeError> {
        Ok(())
    }
    fn on_shutdown(&mut self, _ctx: &mut ThreadCtx) {}
    /// The recipient owns `msg` and must free or reply.
    fn on_message(&mut self, ctx: &mut ThreadCtx, msg: Box<Message>);
    fn on_timer(&mut self, _ctx: &mut ThreadCtx, _id: TimerId) {}
    fn on_user_fds(&mut self, _ctx: &mut ThreadCtx, _ready: &[RawFd]) {}
    fn on_signal(&mut self, _ctx: &mut ThreadCtx, _signo: i32) {}
}

/// Per-thread state handed to every callback.
pub struct ThreadCtx {
    runtime: Runtime,
    handle: ThreadHandle,
    timers: TimerSet,
    timerfd: OwnedFd,
    user_fds: Vec<RawFd>,
    exit_code: Option<i32>,
}

impl ThreadCtx {
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn handle(&self) -> ThreadHandle {
        self.handle.clone()
    }

    pub fn alloc(&self, payload: Payload) -> Result<Box<Message>, RuntimeError> {
        self.runtime.pool().alloc(payload)
    }

    /// Asynchronous send with this thread recorded as the sender. With
    /// `needs_reply` the target's eventual reply arrives via `on_message`.
    pub fn send(
        &self,
        target: &ThreadHandle,
        payload: Payload,
        needs_reply: bool,
    ) -> Result<(), RuntimeError> {
        let mut msg = self.alloc(payload)?;
        msg.sender = Some(self.handle.clone());
        msg.needs_reply = needs_reply;
        self.runtime.send(target, msg)
    }

    /// Blocking request/reply exchange.
    pub fn send_wait(
        &self,
        target: &ThreadHandle,
        payload: Payload,
    ) -> Result<Box<Message>, RuntimeError> {
        let mut msg = self.alloc(payload)?;
        msg.sender = Some(self.handle.clone());
        self.runtime.send_wait(target, msg)
    }

    pub fn reply(&self, msg: Box<Message>) {
        self.runtime.reply(msg);
    }

    pub fn free(&self, msg: Box<Message>) {
        self.runtime.free(msg);
    }

    pub fn timer_create(&mut self, id: TimerId) -> Result<(), RuntimeError> {
        self.timers.create(id)
    }

    pub fn timer_start(
        &mut self,
        id: TimerId,
        interval: Timespec,
        periodic: bool,
        immediate_first: bool,
    ) -> Result<(), RuntimeError> {
        self.timers
            .start(id, monotonic_now(), interval, periodic, immediate_first)
    }

    pub fn timer_stop(&mut self, id: TimerId) -> Result<(), RuntimeError> {
        self.timers.stop(id)
    }

    /// Watch `fd` for read readiness.
    pub fn add_user_fd(&mut self, fd: RawFd) {
        if !self.user_fds.contains(&fd) {
            self.user_fds.push(fd);
        }
    }

    /// Idempotent: removing an fd that was never added (or whose resource
    /// is already closed) is a no-op.
    pub fn remove_user_fd(&mut self, fd: RawFd) {
        self.user_fds.retain(|&f| f != fd);
    }

    /// Leave the loop after the current dispatch round.
    pub fn request_exit(&mut self, code: i32) {
        self.exit_code = Some(code);
    }

    /// A context with no loop behind it, for unit-testing servicers.
    #[cfg(test)]
    pub(crate) fn detached(runtime: &Runtime, name: &str) -> Self {
        ThreadCtx {
            runtime: runtime.clone(),
            handle: ThreadHandle::detached(name),
            timers: TimerSet::default(),
            timerfd: timerfd_create().unwrap(),
            user_fds: Vec::new(),
            exit_code: None,
        }
    }
}

/// Handle kept by the owner of a spawned thread.
pub struct ThreadRunner {
    handle: ThreadHandle,
    join: Option<JoinHandle<i32>>,
}

impl std::fmt::Debug for ThreadRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRunner")
            .field("handle", &self.handle)
            .finish()
    }
}

impl ThreadRunner {
    pub fn handle(&self) -> &ThreadHandle {
        &self.handle
    }

    /// Ask the thread to stop after its current dispatch round.
    pub fn shutdown(&self) {
        self.handle.shared.shutdown.store(true, Ordering::Release);
        let _ = eventfd_signal(&self.handle.shared.wake);
    }

    /// Wait for the thread to exit and return its exit code.
    pub fn join(mut self) -> i32 {
        match self.join.take() {
            Some(join) => join.join().unwrap_or(EXIT_FATAL),
            None => EXIT_FATAL,
        }
    }

    pub fn stop(self) -> i32 {
        self.shutdown();
        self.join()
    }
}

fn thread_main<S: ThreadServicer>(
    runtime: Runtime,
    handle: ThreadHandle,
    mut servicer: S,
    ready_tx: mpsc::Sender<i32>,
) -> i32 {
    let timerfd = match timerfd_create() {
        Ok(fd) => fd,
        Err(e) => {
            error!(thread = handle.name(), error = %e, "timerfd creation failed");
            handle.shared.alive.store(false, Ordering::Release);
            let _ = ready_tx.send(EXIT_FATAL);
            return EXIT_FATAL;
        }
    };
    let mut ctx = ThreadCtx {
        runtime: runtime.clone(),
        handle: handle.clone(),
        timers: TimerSet::default(),
        timerfd,
        user_fds: Vec::new(),
        exit_code: None,
    };

    match servicer.on_startup(&mut ctx) {
        Ok(()) => {
            let _ = ready_tx.send(0);
        }
        Err(e) => {
            error!(thread = handle.name(), error = %e, "startup failed");
            handle.shared.alive.store(false, Ordering::Release);
            let _ = ready_tx.send(EXIT_FATAL);
            return EXIT_FATAL;
        }
    }

    run_loop(&mut servicer, &mut ctx);

    // Orderly teardown: timers first, then the servicer, then refuse new
    // messages and flush whatever is still queued.
    ctx.timers.stop_all();
    servicer.on_shutdown(&mut ctx);
    handle.shared.alive.store(false, Ordering::Release);
    runtime.signals().prune();
    let leftover: Vec<Box<Message>> = {
        let mut queue = handle.shared.queue.lock().unwrap();
        queue.drain(..).collect()
    };
    for msg in leftover {
        runtime.free(msg);
    }
    let code = ctx.exit_code.unwrap_or(0);
    debug!(thread = handle.name(), code, "thread exited");
    code
}

fn run_loop<S: ThreadServicer>(servicer: &mut S, ctx: &mut ThreadCtx) {
    loop {
        if ctx.handle.shared.shutdown.load(Ordering::Acquire) || ctx.exit_code.is_some() {
            return;
        }
        if let Err(e) = timerfd_arm(&ctx.timerfd, ctx.timers.next_deadline()) {
            error!(thread = ctx.handle.name(), error = %e, "timer arm failed");
            ctx.request_exit(EXIT_FATAL);
            return;
        }

        let signalfd_raw = ctx
            .handle
            .shared
            .signalfd
            .lock()
            .unwrap()
            .as_ref()
            .map(|fd| fd.as_raw());

        let mut fds = Vec::with_capacity(3 + ctx.user_fds.len());
        let pollin = |fd: RawFd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        fds.push(pollin(ctx.handle.shared.wake.as_raw()));
        fds.push(pollin(ctx.timerfd.as_raw()));
        if let Some(fd) = signalfd_raw {
            fds.push(pollin(fd));
        }
        let user_start = fds.len();
        for &fd in &ctx.user_fds {
            fds.push(pollin(fd));
        }

        if let Err(e) = lowlevel::poll(&mut fds, -1) {
            error!(thread = ctx.handle.name(), error = %e, "poll failed");
            ctx.request_exit(EXIT_FATAL);
            return;
        }

        let ready = |revents: libc::c_short| {
            revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0
        };

        // Dispatch order within one wake-up: messages, timers, signals,
        // user fds.
        let _ = eventfd_drain(&ctx.handle.shared.wake);
        loop {
            let msg = ctx.handle.shared.queue.lock().unwrap().pop_front();
            match msg {
                Some(msg) => servicer.on_message(ctx, msg),
                None => break,
            }
            if ctx.handle.shared.shutdown.load(Ordering::Acquire) || ctx.exit_code.is_some() {
                return;
            }
        }

        if ready(fds[1].revents) {
            if timerfd_drain(&ctx.timerfd).is_ok() {
                let now = monotonic_now();
                for id in ctx.timers.expire(now) {
                    servicer.on_timer(ctx, id);
                }
            } else {
                warn!(thread = ctx.handle.name(), "timerfd drain failed");
            }
        }

        if signalfd_raw.is_some() && ready(fds[2].revents) {
            let read = {
                let guard = ctx.handle.shared.signalfd.lock().unwrap();
                guard.as_ref().map(signalfd_read)
            };
            match read {
                Some(Ok(signos)) => {
                    for signo in signos {
                        ctx.runtime.signals().dispatch(signo);
                    }
                }
                Some(Err(e)) => {
                    warn!(thread = ctx.handle.name(), error = %e, "signalfd read failed")
                }
                None => {}
            }
        }
        for signo in ctx.handle.take_pending_signals() {
            servicer.on_signal(ctx, signo);
        }

        let ready_fds: Vec<RawFd> = fds[user_start..]
            .iter()
            .filter(|p| ready(p.revents))
            .map(|p| p.fd)
            .collect();
        if !ready_fds.is_empty() {
            servicer.on_user_fds(ctx, &ready_fds);
        }
    }
}
