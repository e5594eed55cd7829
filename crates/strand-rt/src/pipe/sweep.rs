//! The idle sweeper: enforces per-pipe I/O deadlines and reclaims
//! hibernating pipes under fd pressure.
//!
//! A recurring reactor callback pauses every worker (`while_paused`), walks
//! the live-pipe registry, and wakes the parked task of every pipe whose
//! deadline has passed with `timeout_expired` set; that task's read or write
//! call then raises the timeout error kind. Running inside the pause barrier
//! guarantees no readiness event can race the forced wake.
//!
//! The sweep re-arms itself only while network pipes exist; the next network
//! pipe construction arms it again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::runtime::Runtime;

#[cfg(not(test))]
const SWEEP_PERIOD: Duration = Duration::from_secs(10);
// Shortened so the deadline tests finish quickly.
#[cfg(test)]
const SWEEP_PERIOD: Duration = Duration::from_secs(1);

static ARMED: AtomicBool = AtomicBool::new(false);

/// Arm the sweeper if it is not already scheduled. Called whenever a
/// network pipe is created.
pub(crate) fn ensure_armed() {
    if ARMED.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Some(rt) = Runtime::try_global() {
        rt.reactor().schedule_after(SWEEP_PERIOD, sweep_tick);
    } else {
        ARMED.store(false, Ordering::SeqCst);
    }
}

fn sweep_tick() {
    let rt = Runtime::global();
    // Runs on a worker (timer context): use the non-blocking barrier form.
    // On contention, retry shortly instead of skipping a whole period.
    let swept = rt.reactor().try_while_paused(|| run_sweep(false));

    if super::net_pipe_count() > 0 {
        let delay = if swept {
            SWEEP_PERIOD
        } else {
            Duration::from_millis(250)
        };
        rt.reactor().schedule_after(delay, sweep_tick);
    } else {
        ARMED.store(false, Ordering::SeqCst);
    }
}

/// Wake hibernating pipes eagerly; invoked when accept hits the process fd
/// limit. Best-effort: skipped if a barrier is already forming.
pub(crate) fn sweep_hibernating() {
    let rt = Runtime::global();
    if !rt.reactor().try_while_paused(|| run_sweep(true)) {
        log::debug!("hibernating sweep skipped: barrier busy");
    }
}

fn run_sweep(include_hibernating: bool) {
    let now = crate::time::MonoTime::now();
    let mut woken = 0usize;
    for shared in super::live_pipes() {
        if shared.deadline_before(now) || (include_hibernating && shared.is_hibernating_flag()) {
            shared.wake_with_timeout();
            woken += 1;
        }
    }
    if woken > 0 {
        log::debug!(
            "pipe sweep woke {} task(s){}",
            woken,
            if include_hibernating { " (incl. hibernating)" } else { "" }
        );
    }
}
