//! The reactor: one epoll instance, a pool of worker threads, a command
//! pipe, and a timer fd.
//!
//! ## Architecture
//!
//! ```text
//! Reactor::start(n, use_calling_thread)
//!     |
//!     +-- epoll fd (shared by all workers)
//!     +-- command socketpair (send side for control, recv side registered
//!     |   EPOLLIN | EPOLLONESHOT so exactly one worker reads each command)
//!     +-- timer fd (CLOCK_MONOTONIC, armed for the earliest scheduled task)
//!     +-- n worker threads, each running worker_loop():
//!             drain wake list -> epoll_wait -> dispatch handler -> repeat
//! ```
//!
//! Command bytes on the control pipe:
//!
//! - `WAKE`: re-arm, forward to the next worker (self-chaining shutdown nudge)
//! - `PAUSE`: re-arm, acknowledge the pause barrier, block until released
//! - `ON_EACH`: re-arm, run the broadcast closure, hand the command to the
//!   next worker, block until all have run
//! - `ON_ONE`: re-arm, pop one queued closure and run it
//!
//! Re-arming the one-shot registration *before* blocking is what lets a
//! broadcast reach the remaining workers: the next byte in the pipe raises a
//! fresh readiness edge on another thread.
//!
//! `while_paused` is the only window in which the process is globally
//! quiescent; the pipe sweeper runs inside it. At most one barrier operation
//! (`while_paused` / `on_each`) runs at a time, and a barrier must not be
//! started from two workers concurrently.

pub(crate) mod sys;
mod timer;

pub use timer::TimerToken;

use std::cell::Cell;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::error::{Result, RtError};
use crate::time::MonoTime;

// ---------------------------------------------------------------------------
// Command bytes
// ---------------------------------------------------------------------------

const CMD_WAKE: u8 = 0;
const CMD_PAUSE: u8 = 1;
const CMD_ON_EACH: u8 = 2;
const CMD_ON_ONE: u8 = 3;

thread_local! {
    /// Whether this OS thread is one of the reactor's workers.
    static IS_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is a reactor worker.
pub fn on_worker_thread() -> bool {
    IS_WORKER.with(|c| c.get())
}

// ---------------------------------------------------------------------------
// IoHandler
// ---------------------------------------------------------------------------

/// Action taken when readiness is delivered for a watched fd.
///
/// Handlers run on whichever worker the kernel woke; they must be brief and
/// must not block the thread. A panic escaping a handler is logged and kills
/// the process.
pub trait IoHandler: Send + Sync {
    fn io_avail(&self, events: u32);
}

// ---------------------------------------------------------------------------
// Pause barrier state
// ---------------------------------------------------------------------------

struct PauseState {
    /// Workers currently acknowledged at the barrier (the barrier caller
    /// counts itself when it is a worker).
    paused: usize,
    /// Incremented on every release; a worker waits for the generation to
    /// move past the one it acknowledged, so a late riser from round G can
    /// never be mistaken for an acknowledgement of round G+1.
    generation: u64,
}

type OnEachFn = Arc<dyn Fn() + Send + Sync>;

// ---------------------------------------------------------------------------
// Reactor
// ---------------------------------------------------------------------------

/// Shared reactor handle. Cheap to clone; all clones drive the same epoll
/// instance and worker pool.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

struct Inner {
    running: AtomicBool,
    num_threads: usize,
    ep_fd: RawFd,
    send_ctl_fd: RawFd,
    recv_ctl_fd: RawFd,
    timer_fd: RawFd,
    timer: timer::TimerQueue,
    handlers: Mutex<FxHashMap<RawFd, Arc<dyn IoHandler>>>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,

    /// Serializes barrier operations (while_paused / on_each).
    barrier_lock: Mutex<()>,
    pause: Mutex<PauseState>,
    pause_cond: Condvar,
    resume_cond: Condvar,

    on_one_queue: Mutex<VecDeque<Box<dyn FnOnce() + Send>>>,
    on_each_slot: Mutex<Option<OnEachFn>>,
    at_rest: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl Reactor {
    /// Create the reactor and start its worker threads.
    ///
    /// `num_threads` is the total pool size (0 means the hardware
    /// concurrency). If `use_calling_thread` is true, one slot is reserved
    /// for the caller, which must subsequently invoke
    /// [`Reactor::start_this_thread`] to join the pool; this leaves room for
    /// further initialization before the calling thread starts dispatching.
    pub fn start(num_threads: usize, use_calling_thread: bool) -> Result<Reactor> {
        let num_threads = if num_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            num_threads
        };

        sys::block_sigpipe();

        let ep_fd = sys::epoll_create().map_err(|e| RtError::Setup(format!("epoll_create1: {}", e)))?;
        let (send_ctl_fd, recv_ctl_fd) =
            sys::command_socketpair().map_err(|e| RtError::Setup(format!("socketpair: {}", e)))?;
        sys::set_nonblocking(recv_ctl_fd).map_err(|e| RtError::Setup(format!("fcntl: {}", e)))?;
        let timer_fd =
            sys::timerfd_create().map_err(|e| RtError::Setup(format!("timerfd_create: {}", e)))?;

        let inner = Arc::new(Inner {
            running: AtomicBool::new(true),
            num_threads,
            ep_fd,
            send_ctl_fd,
            recv_ctl_fd,
            timer_fd,
            timer: timer::TimerQueue::new(timer_fd),
            handlers: Mutex::new(FxHashMap::default()),
            threads: Mutex::new(Vec::new()),
            barrier_lock: Mutex::new(()),
            pause: Mutex::new(PauseState {
                paused: 0,
                generation: 0,
            }),
            pause_cond: Condvar::new(),
            resume_cond: Condvar::new(),
            on_one_queue: Mutex::new(VecDeque::new()),
            on_each_slot: Mutex::new(None),
            at_rest: Mutex::new(Vec::new()),
        });

        let reactor = Reactor { inner };
        reactor.install(timer_fd, libc::EPOLLIN as u32, Arc::new(TimerHandler {
            inner: Arc::downgrade(&reactor.inner),
        }))?;
        reactor.install(
            recv_ctl_fd,
            (libc::EPOLLIN | libc::EPOLLONESHOT) as u32,
            Arc::new(CtlHandler {
                inner: Arc::downgrade(&reactor.inner),
            }),
        )?;

        log::info!(
            "reactor started: {} worker thread(s), epoll fd {}, timer fd {}",
            num_threads,
            ep_fd,
            timer_fd
        );

        let to_spawn = num_threads - usize::from(use_calling_thread);
        let mut threads = reactor.inner.threads.lock();
        for _ in 0..to_spawn {
            let inner = Arc::clone(&reactor.inner);
            threads.push(std::thread::spawn(move || worker_loop(&inner)));
        }
        drop(threads);

        Ok(reactor)
    }

    /// Join the worker pool on the calling thread; returns when the reactor
    /// stops. Only valid after `start(n, true)`.
    pub fn start_this_thread(&self) {
        worker_loop(&self.inner);
    }

    /// Register a handler for `fd`. Registration failures carry errno and
    /// are not recoverable.
    pub fn install(&self, fd: RawFd, events: u32, handler: Arc<dyn IoHandler>) -> Result<()> {
        self.inner.handlers.lock().insert(fd, handler);
        sys::epoll_ctl(self.inner.ep_fd, libc::EPOLL_CTL_ADD, fd, events).map_err(|e| {
            RtError::Setup(format!("epoll_ctl({}, {}): {}", sys::op_string(libc::EPOLL_CTL_ADD), fd, e))
        })
    }

    /// Modify the interest set for an already-registered fd (one-shot
    /// re-arm). The handler registered by [`Reactor::install`] is kept.
    pub fn modify(&self, fd: RawFd, events: u32) -> Result<()> {
        sys::epoll_ctl(self.inner.ep_fd, libc::EPOLL_CTL_MOD, fd, events).map_err(|e| {
            RtError::Setup(format!("epoll_ctl({}, {}): {}", sys::op_string(libc::EPOLL_CTL_MOD), fd, e))
        })
    }

    /// Remove `fd` from the interest set and drop its handler. The final
    /// registration state of an fd is a function only of the last call.
    pub fn deregister(&self, fd: RawFd) -> Result<()> {
        let res = sys::epoll_ctl(self.inner.ep_fd, libc::EPOLL_CTL_DEL, fd, 0);
        self.inner.handlers.lock().remove(&fd);
        res.map_err(|e| {
            RtError::Setup(format!("epoll_ctl({}, {}): {}", sys::op_string(libc::EPOLL_CTL_DEL), fd, e))
        })
    }

    /// Schedule `f` to run on a worker thread at the absolute time `when`.
    pub fn schedule_at(&self, when: MonoTime, f: impl FnOnce() + Send + 'static) -> TimerToken {
        self.inner.timer.schedule(when, Box::new(f))
    }

    /// Schedule `f` after a relative delay.
    pub fn schedule_after(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> TimerToken {
        self.schedule_at(MonoTime::now() + delay, f)
    }

    /// Best-effort cancel; returns false if the callback already fired (or
    /// is concurrently firing).
    pub fn cancel(&self, token: TimerToken) -> bool {
        self.inner.timer.cancel(token)
    }

    /// Pause every worker thread, run `f` while the process is quiescent,
    /// then release all workers. If the calling thread is a worker it counts
    /// toward the barrier without consuming a command byte. After release,
    /// queued at-rest callbacks run before any worker returns to polling.
    ///
    /// From a worker thread, prefer [`Reactor::try_while_paused`]: a worker
    /// that blocks here while another barrier is forming can never
    /// acknowledge that barrier, and the two callers deadlock.
    pub fn while_paused(&self, f: impl FnOnce()) {
        let barrier = self.inner.barrier_lock.lock();
        self.paused_section(barrier, f);
    }

    /// Barrier variant that gives up instead of waiting when another
    /// barrier operation is already in progress. Returns whether `f` ran.
    /// This is the form worker-side callers (the pipe sweeper) must use.
    pub fn try_while_paused(&self, f: impl FnOnce()) -> bool {
        match self.inner.barrier_lock.try_lock() {
            Some(barrier) => {
                self.paused_section(barrier, f);
                true
            }
            None => false,
        }
    }

    fn paused_section(&self, _barrier: parking_lot::MutexGuard<'_, ()>, f: impl FnOnce()) {
        let inner = &*self.inner;
        let on_worker = on_worker_thread();

        let mut st = inner.pause.lock();
        st.paused = usize::from(on_worker);
        for _ in st.paused..inner.num_threads {
            inner.send_command(CMD_PAUSE);
        }
        while st.paused != inner.num_threads {
            inner.pause_cond.wait(&mut st);
        }

        f();

        st.paused = 0;
        st.generation += 1;
        inner.resume_cond.notify_all();
        drop(st);

        if on_worker {
            inner.run_at_rest();
        }
    }

    /// Run `f` once on every worker thread. The command chains from worker
    /// to worker; all workers (and the caller, if a worker) block until the
    /// last one has run `f`.
    pub fn on_each(&self, f: impl Fn() + Send + Sync + 'static) {
        let inner = &*self.inner;
        let _barrier = inner.barrier_lock.lock();
        let on_worker = on_worker_thread();
        let f: OnEachFn = Arc::new(f);

        let mut st = inner.pause.lock();
        st.paused = usize::from(on_worker);
        if st.paused < inner.num_threads {
            *inner.on_each_slot.lock() = Some(Arc::clone(&f));
            inner.send_command(CMD_ON_EACH);
        }
        while st.paused != inner.num_threads {
            inner.pause_cond.wait(&mut st);
        }

        if on_worker {
            f();
        }

        *inner.on_each_slot.lock() = None;
        st.paused = 0;
        st.generation += 1;
        inner.resume_cond.notify_all();
    }

    /// Run `f` on exactly one worker thread. If the caller is already a
    /// worker, `f` runs inline (in the current task context, if any).
    pub fn on_one(&self, f: impl FnOnce() + Send + 'static) {
        if on_worker_thread() {
            f();
        } else {
            self.inner.on_one_queue.lock().push_back(Box::new(f));
            self.inner.send_command(CMD_ON_ONE);
        }
    }

    /// Queue a callback to run once the next pause barrier fully releases.
    pub fn add_at_rest(&self, f: impl FnOnce() + Send + 'static) {
        self.inner.at_rest.lock().push(Box::new(f));
    }

    /// Begin shutdown: clear the running flag and nudge one worker awake.
    /// The wake command self-chains so every worker notices.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            self.inner.send_command(CMD_WAKE);
        }
    }

    /// Stop (if not already stopped) and block until every pool thread has
    /// exited. Must not be called from a worker thread.
    pub fn join(&self) {
        self.stop();
        let handles: Vec<_> = self.inner.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn num_threads(&self) -> usize {
        self.inner.num_threads
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("num_threads", &self.inner.num_threads)
            .field("running", &self.inner.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl Inner {
    fn send_command(&self, cmd: u8) {
        if let Err(e) = sys::write_fd(self.send_ctl_fd, &[cmd]) {
            log::error!("write of command {} to control pipe failed: {}", cmd, e);
        }
    }

    fn rearm_ctl(&self) {
        if let Err(e) = sys::epoll_ctl(
            self.ep_fd,
            libc::EPOLL_CTL_MOD,
            self.recv_ctl_fd,
            (libc::EPOLLIN | libc::EPOLLONESHOT) as u32,
        ) {
            log::error!("re-arming control pipe failed: {}", e);
        }
    }

    /// Acknowledge a pause-style barrier and block until released.
    fn wait_at_barrier(&self) {
        let mut st = self.pause.lock();
        st.paused += 1;
        let gen = st.generation;
        if st.paused == self.num_threads {
            self.pause_cond.notify_all();
        }
        while st.generation == gen {
            self.resume_cond.wait(&mut st);
        }
    }

    /// Drain queued at-rest callbacks. Racing workers pop from the same
    /// queue, so each callback runs exactly once, after the barrier released
    /// and before any popper returns to polling.
    fn run_at_rest(&self) {
        loop {
            let f = self.at_rest.lock().pop();
            match f {
                Some(f) => f(),
                None => break,
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        sys::close_fd(self.send_ctl_fd);
        sys::close_fd(self.recv_ctl_fd);
        sys::close_fd(self.timer_fd);
        sys::close_fd(self.ep_fd);
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

fn worker_loop(inner: &Arc<Inner>) {
    IS_WORKER.with(|c| c.set(true));
    log::debug!("reactor worker starting");

    while inner.running.load(Ordering::SeqCst) {
        // Run tasks made ready by the previous dispatch before sleeping.
        crate::task::scheduler::drain_ready();

        match sys::epoll_wait_one(inner.ep_fd) {
            Ok(Some(event)) => {
                let fd = event.u64 as RawFd;
                let handler = inner.handlers.lock().get(&fd).cloned();
                if let Some(handler) = handler {
                    // A panic escaping a handler leaves the reactor in an
                    // unknown state; log and kill the process.
                    if catch_unwind(AssertUnwindSafe(|| handler.io_avail(event.events))).is_err() {
                        log::error!("panic in io handler for fd {}; aborting", fd);
                        std::process::abort();
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("epoll_wait failed: {}", e);
            }
        }
    }

    // Let tasks woken by the final dispatch run to completion.
    crate::task::scheduler::drain_ready();
    IS_WORKER.with(|c| c.set(false));
    log::debug!("reactor worker exiting");
}

// ---------------------------------------------------------------------------
// Control-pipe handler
// ---------------------------------------------------------------------------

struct CtlHandler {
    inner: Weak<Inner>,
}

impl IoHandler for CtlHandler {
    fn io_avail(&self, events: u32) {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        if events & libc::EPOLLIN as u32 == 0 {
            log::error!("control pipe delivered event without EPOLLIN");
            return;
        }

        let mut cmd = [0u8; 1];
        match sys::read_fd(inner.recv_ctl_fd, &mut cmd) {
            Ok(1) => {}
            Ok(_) => {
                inner.rearm_ctl();
                return;
            }
            Err(e) if sys::is_again(&e) => {
                // Another thread raced us to the byte.
                inner.rearm_ctl();
                return;
            }
            Err(e) => {
                log::error!("read from control pipe failed: {}", e);
                return;
            }
        }

        match cmd[0] {
            CMD_WAKE => {
                inner.rearm_ctl();
                // Forward so the next worker also wakes and re-checks the
                // running flag.
                if !inner.running.load(Ordering::SeqCst) {
                    inner.send_command(CMD_WAKE);
                }
            }
            CMD_PAUSE => {
                // Re-arm first: the remaining pause bytes must be able to
                // reach the other workers while this one blocks.
                inner.rearm_ctl();
                inner.wait_at_barrier();
                inner.run_at_rest();
            }
            CMD_ON_EACH => {
                inner.rearm_ctl();
                let f = inner.on_each_slot.lock().clone();
                if let Some(f) = f {
                    f();
                }
                // The hand-off to the next worker happens under the pause
                // lock, after this worker's acknowledgement: the successor
                // must observe the incremented count, and blocked workers
                // cannot re-read the byte.
                let mut st = inner.pause.lock();
                st.paused += 1;
                let gen = st.generation;
                if st.paused == inner.num_threads {
                    inner.pause_cond.notify_all();
                } else {
                    inner.send_command(CMD_ON_EACH);
                }
                while st.generation == gen {
                    inner.resume_cond.wait(&mut st);
                }
            }
            CMD_ON_ONE => {
                inner.rearm_ctl();
                let f = inner.on_one_queue.lock().pop_front();
                if let Some(f) = f {
                    f();
                }
            }
            other => {
                inner.rearm_ctl();
                log::error!("unknown command ({}) on control pipe - ignored", other);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Timer handler
// ---------------------------------------------------------------------------

struct TimerHandler {
    inner: Weak<Inner>,
}

impl IoHandler for TimerHandler {
    fn io_avail(&self, events: u32) {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        if events & libc::EPOLLIN as u32 == 0 {
            return;
        }
        match sys::timerfd_read(inner.timer_fd) {
            // EAGAIN: the kernel woke several epoll waiters; another thread
            // consumed the expiration.
            Ok(false) => return,
            Ok(true) => {}
            Err(e) => {
                log::error!("read from timer fd failed: {}", e);
                return;
            }
        }
        for f in inner.timer.take_due(MonoTime::now()) {
            // A scheduled callback's panic aborts only that callback.
            if catch_unwind(AssertUnwindSafe(f)).is_err() {
                log::error!("panic in scheduled callback (ignored)");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    // Reactor tests get their own small pools; the runtime-wide tests in
    // task/ and pipe/ share the global runtime instead.

    #[test]
    fn test_schedule_fires_once() {
        let r = Reactor::start(1, false).unwrap();
        let (tx, rx) = mpsc::channel();
        r.schedule_after(Duration::from_millis(20), move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // No second invocation.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        r.join();
    }

    #[test]
    fn test_cancel_before_fire_suppresses() {
        let r = Reactor::start(1, false).unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        let token = r.schedule_after(Duration::from_millis(200), move || {
            tx.send(()).unwrap();
        });
        assert!(r.cancel(token));
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
        r.join();
    }

    #[test]
    fn test_schedule_order() {
        let r = Reactor::start(1, false).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        for (i, delay) in [(0u32, 60u64), (1, 20), (2, 40)] {
            let order = Arc::clone(&order);
            let tx = tx.clone();
            r.schedule_after(Duration::from_millis(delay), move || {
                order.lock().push(i);
                tx.send(()).unwrap();
            });
        }
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(*order.lock(), vec![1, 2, 0]);
        r.join();
    }

    #[test]
    fn test_on_each_runs_on_every_worker() {
        let n = 4;
        let r = Reactor::start(n, false).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        r.on_each(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), n);
        r.join();
    }

    #[test]
    fn test_on_one_runs_once() {
        let r = Reactor::start(3, false).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let c = Arc::clone(&count);
        r.on_one(move || {
            c.fetch_add(1, Ordering::SeqCst);
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        r.join();
    }

    #[test]
    fn test_while_paused_is_quiescent_and_resumes() {
        let n = 4;
        let r = Reactor::start(n, false).unwrap();
        // While paused, no scheduled callback may run even when due.
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        r.while_paused(|| {
            r.schedule_at(MonoTime::now(), move || {
                f.fetch_add(1, Ordering::SeqCst);
            });
            std::thread::sleep(Duration::from_millis(100));
            assert_eq!(fired.load(Ordering::SeqCst), 0);
        });
        // After release the callback is delivered normally.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while fired.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "callback never ran");
            std::thread::sleep(Duration::from_millis(5));
        }
        // The barrier is reusable.
        r.while_paused(|| {});
        r.join();
    }

    #[test]
    fn test_stop_join_terminates_all_workers() {
        let r = Reactor::start(4, false).unwrap();
        r.stop();
        r.join();
        assert!(!r.is_running());
    }
}
