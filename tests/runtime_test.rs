//! Substrate behavior: message round-trips, ordering, pool conservation,
//! timer cadence and signal coalescing.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rksd::Timespec;
use rksd::runtime::{
    Message, Payload, Runtime, RuntimeConfig, RuntimeError, ThreadCtx, ThreadServicer, TimerId,
};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig { pool_size: 64 })
}

/// Replies to every TestRequest with a TestResponse carrying the token.
struct Echo;

impl ThreadServicer for Echo {
    fn on_message(&mut self, ctx: &mut ThreadCtx, mut msg: Box<Message>) {
        match msg.take_payload() {
            Payload::TestRequest { token } => {
                msg.set_payload(Payload::TestResponse { token });
                ctx.reply(msg);
            }
            _ => ctx.free(msg),
        }
    }
}

#[test]
fn test_send_wait_round_trip() {
    let runtime = runtime();
    let echo = runtime.spawn("echo", Echo).unwrap();

    for token in 0..10u64 {
        let msg = runtime
            .pool()
            .alloc(Payload::TestRequest { token })
            .unwrap();
        let mut reply = runtime.send_wait(echo.handle(), msg).unwrap();
        match reply.take_payload() {
            Payload::TestResponse { token: got } => assert_eq!(got, token),
            other => panic!("unexpected reply {:?}", other),
        }
        assert!(reply.is_reply());
        runtime.free(reply);
    }

    // Conservation: every alloc was balanced by exactly one free.
    assert_eq!(runtime.pool().outstanding(), 0);
    assert_eq!(echo.stop(), 0);
}

/// Records request tokens in arrival order.
struct Collector {
    seen: Arc<Mutex<Vec<u64>>>,
}

impl ThreadServicer for Collector {
    fn on_message(&mut self, ctx: &mut ThreadCtx, mut msg: Box<Message>) {
        match msg.take_payload() {
            Payload::TestRequest { token } => {
                self.seen.lock().unwrap().push(token);
                if msg.needs_reply() {
                    msg.set_payload(Payload::TestResponse { token });
                    ctx.reply(msg);
                    return;
                }
                ctx.free(msg);
            }
            _ => ctx.free(msg),
        }
    }
}

#[test]
fn test_send_order_is_preserved() {
    let runtime = runtime();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let collector = runtime
        .spawn("collector", Collector { seen: Arc::clone(&seen) })
        .unwrap();

    for token in 1..=50u64 {
        runtime
            .post(collector.handle(), Payload::TestRequest { token })
            .unwrap();
    }
    // Barrier: the queue is FIFO, so a reply to this request means all
    // previous posts have been dispatched.
    let msg = runtime
        .pool()
        .alloc(Payload::TestRequest { token: 99 })
        .unwrap();
    let reply = runtime.send_wait(collector.handle(), msg).unwrap();
    runtime.free(reply);

    let order = seen.lock().unwrap().clone();
    let expected: Vec<u64> = (1..=50).chain([99]).collect();
    assert_eq!(order, expected);
    assert_eq!(runtime.pool().outstanding(), 0);
    assert_eq!(collector.stop(), 0);
}

#[test]
fn test_send_to_stopped_thread_fails_and_frees() {
    let runtime = runtime();
    let echo = runtime.spawn("echo", Echo).unwrap();
    let handle = echo.handle().clone();
    assert_eq!(echo.stop(), 0);

    let err = runtime
        .post(&handle, Payload::TestRequest { token: 1 })
        .unwrap_err();
    assert!(matches!(err, RuntimeError::ThreadGone(_)));
    assert_eq!(runtime.pool().outstanding(), 0);
}

#[test]
fn test_pool_exhaustion_is_recoverable() {
    let runtime = Runtime::new(RuntimeConfig { pool_size: 2 });
    let a = runtime.pool().alloc(Payload::Ack).unwrap();
    let b = runtime.pool().alloc(Payload::Ack).unwrap();
    assert!(matches!(
        runtime.pool().alloc(Payload::Ack),
        Err(RuntimeError::OutOfResources)
    ));
    runtime.free(a);
    runtime.free(b);
    assert!(runtime.pool().alloc(Payload::Ack).is_ok());
}

const CADENCE_TIMER: TimerId = TimerId(7);

/// Counts periodic fires; request token 0 stops the timer.
struct Cadence {
    fires: Arc<AtomicU32>,
}

impl ThreadServicer for Cadence {
    fn on_startup(&mut self, ctx: &mut ThreadCtx) -> Result<(), RuntimeError> {
        ctx.timer_create(CADENCE_TIMER)?;
        // Duplicate creation must be refused.
        assert!(matches!(
            ctx.timer_create(CADENCE_TIMER),
            Err(RuntimeError::TimerExists(CADENCE_TIMER))
        ));
        ctx.timer_start(CADENCE_TIMER, Timespec::from_ns(20_000_000), true, false)
    }

    fn on_timer(&mut self, _ctx: &mut ThreadCtx, id: TimerId) {
        if id == CADENCE_TIMER {
            self.fires.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_message(&mut self, ctx: &mut ThreadCtx, mut msg: Box<Message>) {
        if let Payload::TestRequest { token: 0 } = msg.take_payload() {
            ctx.timer_stop(CADENCE_TIMER).unwrap();
        }
        msg.set_payload(Payload::Ack);
        ctx.reply(msg);
    }
}

#[test]
fn test_timer_cadence_and_stop() {
    let runtime = runtime();
    let fires = Arc::new(AtomicU32::new(0));
    let cadence = runtime
        .spawn("cadence", Cadence { fires: Arc::clone(&fires) })
        .unwrap();

    // 20 ms period over one second: expect ~50 fires, generous slack for
    // loaded test machines.
    std::thread::sleep(Duration::from_millis(1000));
    let msg = runtime
        .pool()
        .alloc(Payload::TestRequest { token: 0 })
        .unwrap();
    let reply = runtime.send_wait(cadence.handle(), msg).unwrap();
    runtime.free(reply);
    let at_stop = fires.load(Ordering::SeqCst);
    assert!(
        (20..=60).contains(&at_stop),
        "unexpected fire count {at_stop}"
    );

    // Zero fires beyond stop.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(fires.load(Ordering::SeqCst), at_stop);
    assert_eq!(cadence.stop(), 0);
}

/// Counts on_signal callbacks per signal number.
struct SignalCounter {
    received: Arc<Mutex<Vec<i32>>>,
}

impl ThreadServicer for SignalCounter {
    fn on_message(&mut self, ctx: &mut ThreadCtx, msg: Box<Message>) {
        ctx.free(msg);
    }

    fn on_signal(&mut self, _ctx: &mut ThreadCtx, signo: i32) {
        self.received.lock().unwrap().push(signo);
        // Simulate a slow handler so pending signals pile up and coalesce.
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_signal_delivery_coalesces() {
    let runtime = runtime();
    let received = Arc::new(Mutex::new(Vec::new()));
    let counter = runtime
        .spawn(
            "signals",
            SignalCounter {
                received: Arc::clone(&received),
            },
        )
        .unwrap();
    let signo = 40;
    runtime.signals().subscribe(signo, counter.handle());

    let sent = 50;
    for _ in 0..sent {
        runtime.signals().dispatch(signo);
    }
    std::thread::sleep(Duration::from_millis(300));

    let got = received.lock().unwrap().clone();
    assert!(!got.is_empty(), "at least one delivery is guaranteed");
    assert!(
        got.len() <= sent,
        "received {} deliveries for {} sends",
        got.len(),
        sent
    );
    assert!(got.iter().all(|&s| s == signo));
    assert_eq!(counter.stop(), 0);
}

/// Echoes bytes that arrive on a watched pipe.
struct PipeWatcher {
    read_fd: RawFd,
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl ThreadServicer for PipeWatcher {
    fn on_startup(&mut self, ctx: &mut ThreadCtx) -> Result<(), RuntimeError> {
        ctx.add_user_fd(self.read_fd);
        Ok(())
    }

    fn on_shutdown(&mut self, ctx: &mut ThreadCtx) {
        ctx.remove_user_fd(self.read_fd);
        unsafe {
            libc::close(self.read_fd);
        }
    }

    fn on_message(&mut self, ctx: &mut ThreadCtx, msg: Box<Message>) {
        ctx.free(msg);
    }

    fn on_user_fds(&mut self, _ctx: &mut ThreadCtx, ready: &[RawFd]) {
        for &fd in ready {
            let mut buf = [0u8; 16];
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n > 0 {
                self.bytes
                    .lock()
                    .unwrap()
                    .extend_from_slice(&buf[..n as usize]);
            }
        }
    }
}

#[test]
fn test_user_fd_readiness() {
    let runtime = runtime();
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let bytes = Arc::new(Mutex::new(Vec::new()));
    let watcher = runtime
        .spawn(
            "pipe",
            PipeWatcher {
                read_fd: fds[0],
                bytes: Arc::clone(&bytes),
            },
        )
        .unwrap();

    let payload = b"tick";
    let n = unsafe { libc::write(fds[1], payload.as_ptr().cast(), payload.len()) };
    assert_eq!(n, payload.len() as isize);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(bytes.lock().unwrap().as_slice(), payload);

    assert_eq!(watcher.stop(), 0);
    unsafe {
        libc::close(fds[1]);
    }
}

/// Fails startup on purpose.
struct BrokenStartup;

impl ThreadServicer for BrokenStartup {
    fn on_startup(&mut self, _ctx: &mut ThreadCtx) -> Result<(), RuntimeError> {
        Err(RuntimeError::ThreadGone("self".into()))
    }

    fn on_message(&mut self, ctx: &mut ThreadCtx, msg: Box<Message>) {
        ctx.free(msg);
    }
}

#[test]
fn test_startup_failure_surfaces_at_spawn() {
    let runtime = runtime();
    let err = runtime.spawn("broken", BrokenStartup).unwrap_err();
    assert!(matches!(err, RuntimeError::StartupFailed { .. }));
}

/// Messages still queued at shutdown are returned to the pool.
#[test]
fn test_shutdown_drains_queue() {
    let runtime = runtime();

    struct Slow;
    impl ThreadServicer for Slow {
        fn on_message(&mut self, ctx: &mut ThreadCtx, msg: Box<Message>) {
            std::thread::sleep(Duration::from_millis(20));
            ctx.free(msg);
        }
    }

    let slow = runtime.spawn("slow", Slow).unwrap();
    for token in 0..10 {
        runtime
            .post(slow.handle(), Payload::TestRequest { token })
            .unwrap();
    }
    // Whether each message was dispatched or drained, it must come back.
    assert_eq!(slow.stop(), 0);
    assert_eq!(runtime.pool().outstanding(), 0);
}
