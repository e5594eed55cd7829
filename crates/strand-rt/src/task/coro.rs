//! Stackful task representation over corosensei coroutines.
//!
//! A task owns a coroutine plus a dedicated stack. It parks by yielding a
//! [`Park`] value to the worker's scheduler loop and is woken by being
//! resumed with a [`Resume`] value -- possibly on a different worker thread
//! than the one it parked on. Tasks never switch directly to other tasks;
//! every park crosses through the scheduler loop.
//!
//! ## Thread-local yielder
//!
//! The active coroutine's `Yielder` is stored in a thread-local as an erased
//! pointer, installed by the coroutine body on entry and re-installed by
//! [`park`] after every resume: a task that migrated parks again through the
//! *new* thread's slot. The pointer is only valid while its coroutine is
//! running, and the scheduler clears the slot after every resume returns.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use super::sync::{CondCore, Condvar, Mutex, MutexCore};
use crate::error::{Result, RtError};
use crate::pipe::PipeShared;

/// Default task stack size. Matches the runtime's historical 96 KiB less a
/// small reserve; corosensei adds its own guard page below this.
pub const DEFAULT_STACK_SIZE: usize = 96 * 1024 - 256;

// ---------------------------------------------------------------------------
// Park / Resume
// ---------------------------------------------------------------------------

/// Why a task suspended. The scheduler performs the matching action *after*
/// the context switch, when the task's stack is no longer running.
pub(crate) enum Park {
    /// Park until the pipe's fd is readable (`want_read`) or writable.
    Io {
        pipe: Arc<PipeShared>,
        want_read: bool,
    },
    /// Enqueue on the mutex waiter list, then release the list reservation.
    MutexSuspend(Arc<MutexCore>),
    /// Enqueue on the condvar waiter list, then unlock the mutex.
    CondWait {
        cond: Arc<CondCore>,
        mutex: Arc<MutexCore>,
    },
    /// Re-wake via a scheduled reactor callback after the duration.
    Sleep(Duration),
}

/// Value a task is resumed with.
#[derive(Clone, Copy, Default)]
pub(crate) struct Resume {
    /// Set by the sweeper: the park outlived the pipe's I/O deadline.
    pub timeout_expired: bool,
}

// ---------------------------------------------------------------------------
// Yielder thread-local and park()
// ---------------------------------------------------------------------------

thread_local! {
    /// Erased pointer to the running coroutine's `Yielder<Resume, Park>`.
    static CURRENT_YIELDER: Cell<Option<*const ()>> = const { Cell::new(None) };
}

/// Whether the calling thread is currently executing a task body.
pub fn in_task() -> bool {
    CURRENT_YIELDER.with(|c| c.get().is_some())
}

/// Suspend the current task for `reason`; returns the resume value.
///
/// Panics when called outside of a task body.
pub(crate) fn park(reason: Park) -> Resume {
    // Park points must sit on a worker thread; kernel locks must not be
    // held here (the scheduler side takes its own).
    debug_assert!(crate::reactor::on_worker_thread());
    CURRENT_YIELDER.with(|c| {
        let ptr = c.get().expect("parked outside of task context");
        // Safety: the pointer was installed by the coroutine body running on
        // this thread and stays valid for the duration of this resume.
        let yielder = unsafe { &*(ptr as *const Yielder<Resume, Park>) };
        let resume = yielder.suspend(reason);
        // Re-install: the task may have been resumed on a different worker,
        // whose slot was cleared or overwritten by another task.
        c.set(Some(ptr));
        resume
    })
}

pub(crate) fn clear_yielder() {
    CURRENT_YIELDER.with(|c| c.set(None));
}

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

/// Shared join/identity state, kept alive by `JoinHandle`s after the task
/// itself is gone.
pub struct TaskState {
    pub(crate) id: u64,
    pub(crate) name: parking_lot::Mutex<Option<String>>,
    /// True while the body has not finished. Guarded by a task mutex so
    /// joiners park as tasks.
    pub(crate) running: Mutex<bool>,
    pub(crate) stopped: Condvar,
}

impl TaskState {
    pub(crate) fn new(name: Option<String>) -> Arc<TaskState> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Arc::new(TaskState {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: parking_lot::Mutex::new(name),
            running: Mutex::new(true),
            stopped: Condvar::new(),
        })
    }

    pub(crate) fn display_name(&self) -> String {
        self.name.lock().clone().unwrap_or_else(|| "unnamed".to_string())
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A spawned task: coroutine + stack + pending resume argument.
///
/// Owned by exactly one place at a time -- a worker's wake list, a pipe's
/// parked slot, a mutex/condvar waiter queue, or a scheduled wakeup
/// callback -- which is what makes cross-thread resume safe.
pub(crate) struct Task {
    coro: Coroutine<Resume, Park, ()>,
    resume_arg: Resume,
    state: Arc<TaskState>,
}

// Safety: the entry closure is `Send` (enforced by the spawn signature), the
// coroutine's stack is only referenced from the coroutine itself, and the
// ownership discipline above guarantees exactly one thread resumes a
// suspended task at a time.
unsafe impl Send for Task {}

impl Task {
    /// Allocate a stack and build the coroutine around `body`.
    ///
    /// The body is wrapped so that a panic is caught at the task boundary
    /// and logged with the task's name, and so that joiners are notified
    /// before the coroutine returns to the scheduler.
    pub(crate) fn new(
        body: impl FnOnce() + Send + 'static,
        stack_size: usize,
        state: Arc<TaskState>,
    ) -> Result<Task> {
        let stack = DefaultStack::new(stack_size.max(4096))
            .map_err(|e| RtError::Setup(format!("task stack allocation failed: {}", e)))?;
        let st = Arc::clone(&state);

        let coro = Coroutine::with_stack(stack, move |yielder: &Yielder<Resume, Park>, _: Resume| {
            CURRENT_YIELDER.with(|c| {
                c.set(Some(yielder as *const Yielder<Resume, Park> as *const ()));
            });

            if let Err(payload) = catch_unwind(AssertUnwindSafe(body)) {
                let what: &str = if let Some(s) = payload.downcast_ref::<&str>() {
                    s
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s
                } else {
                    "non-string panic payload"
                };
                log::error!("task \"{}\" panicked: {}", st.display_name(), what);
            }

            // Join handshake. This locks a task mutex and so may itself
            // park; a joiner woken here can resume on another worker.
            let mut running = st.running.lock();
            *running = false;
            st.stopped.notify_all();
        });

        Ok(Task {
            coro,
            resume_arg: Resume::default(),
            state,
        })
    }

    pub(crate) fn state(&self) -> &Arc<TaskState> {
        &self.state
    }

    pub(crate) fn set_timeout_expired(&mut self) {
        self.resume_arg.timeout_expired = true;
    }

    /// Resume until the next park. Returns the park reason, or `None` when
    /// the body has returned.
    pub(crate) fn run(&mut self) -> Option<Park> {
        let arg = std::mem::take(&mut self.resume_arg);
        match self.coro.resume(arg) {
            CoroutineResult::Yield(park) => Some(park),
            CoroutineResult::Return(()) => None,
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.state.id)
            .field("done", &self.coro.done())
            .finish()
    }
}
