//! Scheduled-callback queue backing the reactor's single timer fd.
//!
//! Callbacks are keyed by (absolute monotonic time, unique id) in an ordered
//! map. The timer fd is armed for the head entry and re-armed whenever the
//! head changes. Removal is best-effort: a concurrent expiry may win.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::sys;
use crate::time::MonoTime;

/// An erased scheduled callback. Runs at most once, on a worker thread.
pub(crate) type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

// ---------------------------------------------------------------------------
// TimerToken
// ---------------------------------------------------------------------------

/// Opaque handle to a scheduled callback, usable with [`super::Reactor::cancel`].
///
/// The default token never matches anything; cancelling it is a no-op.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimerToken {
    when: Option<MonoTime>,
    id: u64,
}

// ---------------------------------------------------------------------------
// TimerQueue
// ---------------------------------------------------------------------------

pub(crate) struct TimerQueue {
    timer_fd: RawFd,
    entries: Mutex<BTreeMap<(MonoTime, u64), TimerCallback>>,
    next_id: AtomicU64,
}

impl TimerQueue {
    pub(crate) fn new(timer_fd: RawFd) -> Self {
        TimerQueue {
            timer_fd,
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Insert a callback; re-arm the timer fd if it became the new head.
    pub(crate) fn schedule(&self, when: MonoTime, f: TimerCallback) -> TimerToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();
        entries.insert((when, id), f);
        if entries.keys().next() == Some(&(when, id)) {
            if let Err(e) = sys::timerfd_arm(self.timer_fd, when.to_timespec()) {
                log::error!("timerfd_settime failed: {}", e);
            }
        }
        TimerToken {
            when: Some(when),
            id,
        }
    }

    /// Best-effort removal. Returns whether the callback was still pending.
    pub(crate) fn cancel(&self, token: TimerToken) -> bool {
        let when = match token.when {
            Some(w) => w,
            None => return false,
        };
        self.entries.lock().remove(&(when, token.id)).is_some()
    }

    /// Pop every entry due at `now` and re-arm the fd for the next head.
    /// Callbacks are returned rather than run so the caller can invoke them
    /// outside the queue lock.
    pub(crate) fn take_due(&self, now: MonoTime) -> Vec<TimerCallback> {
        let mut ready = Vec::new();
        let mut entries = self.entries.lock();
        while let Some((&(when, id), _)) = entries.iter().next() {
            if when > now {
                break;
            }
            ready.push(entries.remove(&(when, id)).expect("head entry vanished"));
        }
        if let Some((&(when, _), _)) = entries.iter().next() {
            if let Err(e) = sys::timerfd_arm(self.timer_fd, when.to_timespec()) {
                log::error!("timerfd_settime failed: {}", e);
            }
        }
        ready
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.entries.lock().len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue() -> TimerQueue {
        TimerQueue::new(sys::timerfd_create().unwrap())
    }

    #[test]
    fn test_schedule_then_cancel() {
        let q = queue();
        let tok = q.schedule(MonoTime::now() + Duration::from_secs(60), Box::new(|| {}));
        assert_eq!(q.pending_len(), 1);
        assert!(q.cancel(tok));
        assert_eq!(q.pending_len(), 0);
        // Second cancel is a no-op, as is cancelling a default token.
        assert!(!q.cancel(tok));
        assert!(!q.cancel(TimerToken::default()));
    }

    #[test]
    fn test_take_due_splits_on_time() {
        let q = queue();
        let now = MonoTime::now();
        q.schedule(now - Duration::from_millis(5), Box::new(|| {}));
        q.schedule(now - Duration::from_millis(1), Box::new(|| {}));
        q.schedule(now + Duration::from_secs(60), Box::new(|| {}));
        let due = q.take_due(now);
        assert_eq!(due.len(), 2);
        assert_eq!(q.pending_len(), 1);
    }

    #[test]
    fn test_due_order_is_time_then_id() {
        let q = queue();
        let now = MonoTime::now();
        let order = std::sync::Arc::new(Mutex::new(Vec::new()));
        for i in 0..3u32 {
            let order = order.clone();
            q.schedule(
                now - Duration::from_millis(1),
                Box::new(move || order.lock().push(i)),
            );
        }
        for f in q.take_due(now) {
            f();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
