//! Task-aware mutex and condition variable.
//!
//! These suspend only the calling *task*, never the worker thread. The
//! uncontended lock/unlock paths are a single atomic operation each and are
//! not suspension points.
//!
//! ## Mutex state protocol
//!
//! `state` is an atomic counter: 0 = unlocked, 1 = locked, >= 2 = locked
//! with the waiter list reserved.
//!
//! - `lock`: fetch_add(1). Prior 0: acquired. Prior 1: the state now reads
//!   2, which reserves the waiter list for this task; it parks, and the
//!   scheduler (after the context switch) enqueues it and decrements the
//!   state, releasing the reservation. Prior >= 2: someone else holds the
//!   reservation; undo the increment, spin with exponential backoff, retry.
//! - `unlock`: CAS 1 -> 2 (retrying while the observed value is above 1)
//!   reserves the list even against concurrent lockers; splice every waiter
//!   onto the current worker's wake list; CAS 2 -> 0 releases both the lock
//!   and the reservation. Decrementing blindly instead of the second CAS
//!   could leave a concurrent locker seeing 1 while nobody holds the lock.
//!
//! The waiter queues sit behind a short kernel critical section; the state
//! protocol guarantees it is uncontended in practice.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use super::coro::{park, Park, Task};
use super::scheduler;

// ---------------------------------------------------------------------------
// MutexCore
// ---------------------------------------------------------------------------

pub(crate) struct MutexCore {
    state: AtomicI32,
    waiters: parking_lot::Mutex<VecDeque<Box<Task>>>,
}

impl MutexCore {
    fn new() -> Self {
        MutexCore {
            state: AtomicI32::new(0),
            waiters: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    /// Scheduler-side completion of a `MutexSuspend` park: enqueue the task,
    /// then release the list reservation taken by its `lock` call.
    pub(crate) fn complete_suspend(&self, task: Box<Task>) {
        self.waiters.lock().push_back(task);
        self.state.fetch_sub(1, Ordering::AcqRel);
    }

    /// The unlock protocol. Also used by the scheduler to release a mutex on
    /// behalf of a task entering a condvar wait.
    pub(crate) fn unlock(&self) {
        while self
            .state
            .compare_exchange_weak(1, 2, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        let woken: Vec<Box<Task>> = self.waiters.lock().drain(..).collect();
        for task in woken {
            scheduler::wake(task);
        }
        while self
            .state
            .compare_exchange_weak(2, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn lock(this: &Arc<MutexCore>) {
        let mut spins: u32 = 1;
        loop {
            match this.state.fetch_add(1, Ordering::AcqRel) {
                0 => return,
                1 => {
                    // State is now 2: the list is reserved for us until the
                    // scheduler enqueues this task and decrements.
                    park(Park::MutexSuspend(Arc::clone(this)));
                }
                _ => {
                    this.state.fetch_sub(1, Ordering::AcqRel);
                    spins = (spins * 2).min(100_000);
                    for _ in 0..spins {
                        std::hint::spin_loop();
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

/// A mutex whose waiters are tasks.
///
/// Contended `lock` parks the calling task, so it may only block inside a
/// task; the uncontended path works from any thread. Unlike the kernel
/// mutex, a task may resume on a different worker thread after a contended
/// lock.
pub struct Mutex<T> {
    core: Arc<MutexCore>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Mutex {
            core: Arc::new(MutexCore::new()),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        MutexCore::lock(&self.core);
        MutexGuard { mutex: self }
    }
}

impl<T> Drop for Mutex<T> {
    fn drop(&mut self) {
        let state = self.core.state.load(Ordering::Acquire);
        if state != 0 {
            log::error!("dropping task mutex while locked (state = {})", state);
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("state", &self.core.state.load(Ordering::Relaxed))
            .finish()
    }
}

/// RAII guard; unlocks on drop, waking any parked lockers.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: the state protocol grants exclusive access while locked.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.core.unlock();
    }
}

// ---------------------------------------------------------------------------
// Condvar
// ---------------------------------------------------------------------------

pub(crate) struct CondCore {
    waiters: parking_lot::Mutex<VecDeque<Box<Task>>>,
}

impl CondCore {
    /// Scheduler-side completion of a `CondWait` park: enqueue the task in
    /// wait order. The associated mutex is released afterwards, so a
    /// notifier holding that mutex cannot miss this waiter.
    pub(crate) fn complete_wait(&self, task: Box<Task>) {
        self.waiters.lock().push_back(task);
    }
}

/// A condition variable whose waiters are tasks.
///
/// `wait` must be called with the associated mutex locked, and notifiers
/// must hold that same mutex; `notify_all` transfers waiters in the order
/// they called `wait`.
pub struct Condvar {
    core: Arc<CondCore>,
}

impl Condvar {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Condvar {
            core: Arc::new(CondCore {
                waiters: parking_lot::Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Atomically release the guard's mutex and park; on wake, re-acquire
    /// the mutex before returning. The task may resume on a different
    /// worker thread.
    pub fn wait<T>(&self, guard: &mut MutexGuard<'_, T>) {
        let mutex_core = Arc::clone(&guard.mutex.core);
        park(Park::CondWait {
            cond: Arc::clone(&self.core),
            mutex: mutex_core,
        });
        MutexCore::lock(&guard.mutex.core);
    }

    /// Wait until `pred` holds, re-checking on every wakeup.
    pub fn wait_while<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        mut pred: impl FnMut(&T) -> bool,
    ) {
        while pred(&**guard) {
            self.wait(guard);
        }
    }

    /// Move the oldest waiter to the current worker's wake list.
    pub fn notify_one(&self) {
        let task = self.core.waiters.lock().pop_front();
        if let Some(task) = task {
            scheduler::wake(task);
        }
    }

    /// Move every waiter, in wait order, to the current worker's wake list.
    pub fn notify_all(&self) {
        let woken: Vec<Box<Task>> = self.core.waiters.lock().drain(..).collect();
        for task in woken {
            scheduler::wake(task);
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Condvar::new()
    }
}

impl std::fmt::Debug for Condvar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Condvar")
    }
}

// ---------------------------------------------------------------------------
// Tests (runtime-driven tests live in task/mod.rs; these cover the
// uncontended paths that work on any thread)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncontended_lock_unlock() {
        let m = Mutex::new(41);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 42);
        assert_eq!(m.core.state.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let m = Mutex::new(());
        drop(m.lock());
        drop(m.lock());
        assert_eq!(m.core.state.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_state_never_negative_after_pairs() {
        let m = Mutex::new(0u32);
        for _ in 0..1000 {
            *m.lock() += 1;
        }
        assert_eq!(*m.lock(), 1000);
        assert_eq!(m.core.state.load(Ordering::SeqCst), 0);
    }
}
