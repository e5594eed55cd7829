//! Per-worker scheduling: the wake list and the park-action dispatch.
//!
//! Each worker thread owns a FIFO wake list of ready tasks. The reactor's
//! worker loop calls [`drain_ready`] between epoll waits; event handlers,
//! mutex unlocks, condvar notifies, and timer wakeups all append to the
//! *current* worker's list, so a batch of tasks woken by one event runs in
//! the order the event handling observed them.
//!
//! A task that parked on one worker can be woken from another: whoever holds
//! the `Box<Task>` (pipe slot, waiter queue, sleep callback) pushes it onto
//! the wake list of the thread that happens to be running, and the task's
//! stack continues there.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::Arc;

use super::coro::{clear_yielder, Park, Task, TaskState};
use crate::runtime::Runtime;

thread_local! {
    /// Tasks ready to run on this worker, drained FIFO.
    static WAKE_LIST: RefCell<VecDeque<Box<Task>>> = RefCell::new(VecDeque::new());

    /// State of the task currently executing on this thread.
    static CURRENT_TASK: RefCell<Option<Arc<TaskState>>> = const { RefCell::new(None) };

    /// Depth guard: drain_ready must not re-enter (a task running inside
    /// `on_one` from another task would otherwise nest scheduler frames).
    static DRAINING: Cell<bool> = const { Cell::new(false) };
}

/// The task state of the currently running task, if any.
pub(crate) fn current_task_state() -> Option<Arc<TaskState>> {
    CURRENT_TASK.with(|c| c.borrow().clone())
}

/// Make `task` ready. On a worker thread it joins the local wake list; from
/// any other thread it is handed to one worker via the reactor's command
/// pipe.
pub(crate) fn wake(task: Box<Task>) {
    if crate::reactor::on_worker_thread() {
        WAKE_LIST.with(|l| l.borrow_mut().push_back(task));
    } else {
        Runtime::global()
            .reactor()
            .on_one(move || WAKE_LIST.with(|l| l.borrow_mut().push_back(task)));
    }
}

/// Run every ready task on this worker until the list is empty. Tasks woken
/// while draining (including tasks waking tasks) run in the same pass.
pub(crate) fn drain_ready() {
    if DRAINING.with(|d| d.get()) {
        return;
    }
    DRAINING.with(|d| d.set(true));
    loop {
        let task = WAKE_LIST.with(|l| l.borrow_mut().pop_front());
        match task {
            Some(task) => run_one(task),
            None => break,
        }
    }
    DRAINING.with(|d| d.set(false));
}

fn run_one(mut task: Box<Task>) {
    CURRENT_TASK.with(|c| *c.borrow_mut() = Some(Arc::clone(task.state())));
    let parked = task.run();
    CURRENT_TASK.with(|c| *c.borrow_mut() = None);
    clear_yielder();

    match parked {
        Some(park) => perform_park(task, park),
        None => finish(task),
    }
}

/// Carry out the action the task requested when it yielded. This runs on
/// the scheduler side, after the switch, so the task's stack is quiescent.
fn perform_park(task: Box<Task>, park: Park) {
    match park {
        Park::Io { pipe, want_read } => {
            crate::pipe::complete_io_park(&pipe, task, want_read);
        }
        Park::MutexSuspend(core) => {
            core.complete_suspend(task);
        }
        Park::CondWait { cond, mutex } => {
            cond.complete_wait(task);
            mutex.unlock();
        }
        Park::Sleep(dur) => {
            Runtime::global()
                .reactor()
                .schedule_after(dur, move || wake(task));
        }
    }
}

fn finish(task: Box<Task>) {
    // Join notification already happened inside the coroutine; dropping the
    // task frees its stack.
    drop(task);
    Runtime::global().task_finished();
}
