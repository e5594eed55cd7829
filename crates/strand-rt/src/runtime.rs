//! Process runtime: the reactor plus the services that hang off it.
//!
//! There is conventionally one runtime per process, reached through
//! [`Runtime::global`] after a single [`Runtime::init`] call: an explicit
//! init, then a process-wide accessor. All constructors in this crate --
//! pipes, servers, clusters -- go through the global accessor.

use std::sync::OnceLock;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, RtError};
use crate::reactor::Reactor;

// ---------------------------------------------------------------------------
// RuntimeConfig
// ---------------------------------------------------------------------------

/// Runtime construction parameters.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Worker thread count; 0 means the hardware concurrency.
    pub workers: usize,
    /// Reserve one pool slot for the calling thread, which must then call
    /// [`Runtime::start_this_thread`] after finishing its own setup.
    pub use_calling_thread: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            workers: 0,
            use_calling_thread: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub struct Runtime {
    reactor: Reactor,
    /// Count of live tasks; the zero transition is announced on a kernel
    /// condvar because the waiter must not itself be a task (a task waiting
    /// for zero tasks could never see it).
    task_count: Mutex<usize>,
    zero_tasks: Condvar,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();
static INIT_LOCK: Mutex<()> = Mutex::new(());

impl Runtime {
    /// Start the runtime: reactor worker pool, DNS services, sweepers.
    /// Calling this twice is a setup error.
    pub fn init(config: RuntimeConfig) -> Result<&'static Runtime> {
        let _guard = INIT_LOCK.lock();
        if RUNTIME.get().is_some() {
            return Err(RtError::Setup("runtime already initialized".into()));
        }
        let reactor = Reactor::start(config.workers, config.use_calling_thread)?;
        let runtime = Runtime {
            reactor,
            task_count: Mutex::new(0),
            zero_tasks: Condvar::new(),
        };
        let rt = RUNTIME.get_or_init(|| runtime);
        crate::dns::cache::start_sweep(rt);
        Ok(rt)
    }

    /// The process runtime. Panics before [`Runtime::init`].
    pub fn global() -> &'static Runtime {
        RUNTIME
            .get()
            .expect("runtime not initialized -- call Runtime::init first")
    }

    pub fn try_global() -> Option<&'static Runtime> {
        RUNTIME.get()
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Join the reactor pool on the calling thread (pairs with
    /// `use_calling_thread`); returns when the runtime stops.
    pub fn start_this_thread(&self) {
        self.reactor.start_this_thread();
    }

    pub fn stop(&self) {
        self.reactor.stop();
    }

    pub fn join(&self) {
        self.reactor.join();
    }

    /// Spawn `f` as a task and block the calling OS thread until it
    /// finishes, returning its result. The bridge from non-worker threads
    /// (binaries, tests) into the task world; must not be called from a
    /// task.
    pub fn block_on<T, F>(&self, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        assert!(
            !crate::task::in_task(),
            "block_on called from inside a task"
        );
        let (tx, rx) = std::sync::mpsc::channel();
        crate::task::Builder::new()
            .name("block_on")
            .spawn(move || {
                let _ = tx.send(f());
            })
            .expect("failed to spawn block_on task");
        rx.recv().expect("block_on task ended without a result")
    }

    /// Kernel-blocking wait for the running-task count to reach zero. Must
    /// not be called from a task.
    pub fn wait_for_zero_tasks(&self) {
        assert!(
            !crate::task::in_task(),
            "wait_for_zero_tasks called from inside a task"
        );
        let mut count = self.task_count.lock();
        while *count != 0 {
            self.zero_tasks.wait(&mut count);
        }
    }

    pub fn running_tasks(&self) -> usize {
        *self.task_count.lock()
    }

    pub(crate) fn task_started(&self) {
        *self.task_count.lock() += 1;
    }

    pub(crate) fn task_finished(&self) {
        let mut count = self.task_count.lock();
        *count -= 1;
        if *count == 0 {
            self.zero_tasks.notify_all();
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("reactor", &self.reactor)
            .field("running_tasks", &self.running_tasks())
            .finish()
    }
}

/// Shared runtime for the crate's tests: initialized once with a small
/// pool, reused by every test that needs tasks or pipes.
#[cfg(test)]
pub(crate) fn test_runtime() -> &'static Runtime {
    match Runtime::init(RuntimeConfig {
        workers: 2,
        use_calling_thread: false,
    }) {
        Ok(rt) => rt,
        Err(_) => Runtime::global(),
    }
}
