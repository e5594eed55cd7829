//! The DNS cache: per-(host, port) resolver state with pending-caller
//! queues, per-address cooldowns, round-robin rotation, and a periodic
//! sweep.
//!
//! ## Entry states
//!
//! - **InFlight**: a lookup is running; new callers queue behind it and are
//!   each delivered on their own task when it completes.
//! - **Resolved**: records plus a snapshot time. Callers are served
//!   synchronously with the next address in rotation whose cooldown has
//!   passed; if every address is cooling down, the call is re-scheduled for
//!   the earliest cooldown expiry.
//! - **Failed**: the error is delivered immediately until the sweep (or a
//!   fresh lookup after expiry) clears it.
//!
//! A reactor task sweeps the map every `CACHE_LIFE / 2` and drops entries
//! whose snapshot is older than [`CACHE_LIFE`].

use std::net::SocketAddrV6;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::lookup;
use crate::error::{Result, RtError};
use crate::runtime::Runtime;
use crate::task;
use crate::time::MonoTime;

/// Entries older than this are re-looked-up (and swept).
pub const CACHE_LIFE: Duration = Duration::from_secs(120);

type Callback = Box<dyn FnOnce(Result<SocketAddrV6>) + Send>;

struct AddrRecord {
    addr: SocketAddrV6,
    /// Earliest time this address may be handed out again.
    next_avail: MonoTime,
}

enum Entry {
    InFlight(Vec<Callback>),
    Resolved {
        records: Vec<AddrRecord>,
        snapshot: MonoTime,
        rotation: usize,
    },
    Failed {
        error: String,
        snapshot: MonoTime,
    },
}

static CACHE: Mutex<Option<FxHashMap<(String, u16), Entry>>> = Mutex::new(None);

fn with_cache<T>(f: impl FnOnce(&mut FxHashMap<(String, u16), Entry>) -> T) -> T {
    let mut guard = CACHE.lock();
    f(guard.get_or_insert_with(FxHashMap::default))
}

// ---------------------------------------------------------------------------
// lookup_and_run
// ---------------------------------------------------------------------------

/// Deliver one usable address for (host, port) to `f`.
///
/// Cache hits run `f` synchronously in the caller's context; everything
/// else delivers on a task later. See the module docs for the state
/// machine.
pub fn lookup_and_run(host: &str, port: u16, f: impl FnOnce(Result<SocketAddrV6>) + Send + 'static) {
    enum Action {
        Deliver(Result<SocketAddrV6>),
        RetryAt(MonoTime),
        StartLookup,
        Queued,
    }

    let key = (host.to_string(), port);
    let now = MonoTime::now();
    let mut f = Some(Box::new(f) as Callback);

    let action = with_cache(|map| {
        match map.get_mut(&key) {
            Some(Entry::InFlight(callers)) => {
                callers.push(f.take().expect("callback reused"));
                Action::Queued
            }
            Some(Entry::Resolved {
                records,
                snapshot,
                rotation,
            }) if now.since(*snapshot) <= CACHE_LIFE => {
                // Next address in rotation that is out of cooldown.
                let len = records.len();
                for i in 0..len {
                    let idx = (*rotation + i) % len;
                    if records[idx].next_avail <= now {
                        *rotation = idx + 1;
                        return Action::Deliver(Ok(records[idx].addr));
                    }
                }
                let earliest = records
                    .iter()
                    .map(|r| r.next_avail)
                    .min()
                    .expect("resolved entry with no records");
                Action::RetryAt(earliest)
            }
            Some(Entry::Failed { error, snapshot }) if now.since(*snapshot) <= CACHE_LIFE => {
                Action::Deliver(Err(RtError::Resolve(error.clone())))
            }
            _ => {
                // Absent or expired: become the first pending caller.
                map.insert(
                    key.clone(),
                    Entry::InFlight(vec![f.take().expect("callback reused")]),
                );
                Action::StartLookup
            }
        }
    });

    match action {
        Action::Deliver(result) => {
            (f.take().expect("callback consumed twice"))(result);
        }
        Action::RetryAt(when) => {
            // All addresses cooling down: come back at the earliest expiry
            // and run the dispatch again.
            let host = key.0;
            let f = f.take().expect("callback consumed twice");
            Runtime::global().reactor().schedule_at(when, move || {
                let spawned = task::Builder::new()
                    .name(format!("dns retry {}", host))
                    .spawn(move || lookup_and_run(&host, port, f));
                if let Err(e) = spawned {
                    log::error!("spawning dns retry task failed: {}", e);
                }
            });
        }
        Action::StartLookup => {
            let host = key.0.clone();
            lookup::lookup_and_run(&key.0, port, move |result| {
                resolve_complete(&host, port, result);
            });
        }
        Action::Queued => {}
    }
}

/// Lookup completion: store the new entry state and deliver to every
/// pending caller on its own task, each with the next address in rotation.
fn resolve_complete(host: &str, port: u16, result: lookup::LookupResult) {
    let key = (host.to_string(), port);
    let now = MonoTime::now();

    let (callers, outcome) = with_cache(|map| {
        let callers = match map.remove(&key) {
            Some(Entry::InFlight(callers)) => callers,
            other => {
                // A sweep or competing update got here first.
                if let Some(entry) = other {
                    map.insert(key.clone(), entry);
                }
                Vec::new()
            }
        };

        let outcome: std::result::Result<Vec<SocketAddrV6>, String> = match &result {
            Ok(addrs) => {
                let records = addrs
                    .iter()
                    .map(|&addr| AddrRecord {
                        addr,
                        next_avail: now,
                    })
                    .collect();
                map.insert(
                    key.clone(),
                    Entry::Resolved {
                        records,
                        snapshot: now,
                        rotation: 0,
                    },
                );
                Ok(addrs.clone())
            }
            Err(e) => {
                map.insert(
                    key.clone(),
                    Entry::Failed {
                        error: e.to_string(),
                        snapshot: now,
                    },
                );
                Err(e.to_string())
            }
        };
        (callers, outcome)
    });

    for (i, caller) in callers.into_iter().enumerate() {
        let one = match &outcome {
            Ok(addrs) => Ok(addrs[i % addrs.len()]),
            Err(e) => Err(RtError::Resolve(e.clone())),
        };
        let spawned = task::Builder::new()
            .name(format!("dns deliver {}", host))
            .spawn(move || caller(one));
        if let Err(e) = spawned {
            log::error!("spawning dns delivery task failed: {}", e);
        }
    }
}

// ---------------------------------------------------------------------------
// Synchronous form
// ---------------------------------------------------------------------------

/// In-task form: suspends the caller until an address (or error) is
/// available.
pub fn get_addrinfo(host: &str, port: u16) -> Result<SocketAddrV6> {
    struct Slot {
        result: Option<Result<SocketAddrV6>>,
    }
    let slot = Arc::new((task::Mutex::new(Slot { result: None }), task::Condvar::new()));
    let signal = Arc::clone(&slot);

    lookup_and_run(host, port, move |result| {
        let (lock, cond) = &*signal;
        let mut s = lock.lock();
        s.result = Some(result);
        cond.notify_all();
    });

    let (lock, cond) = &*slot;
    let mut s = lock.lock();
    while s.result.is_none() {
        cond.wait(&mut s);
    }
    s.result.take().expect("dns result vanished")
}

// ---------------------------------------------------------------------------
// Cooldown control
// ---------------------------------------------------------------------------

/// Put `addr` on cooldown for (host, port): the rotation skips it until the
/// duration elapses. Called by clients that find an address unresponsive.
pub fn mark_unavailable(host: &str, port: u16, addr: SocketAddrV6, cooldown: Duration) {
    let until = MonoTime::now() + cooldown;
    with_cache(|map| {
        if let Some(Entry::Resolved { records, .. }) = map.get_mut(&(host.to_string(), port)) {
            for rec in records.iter_mut() {
                if rec.addr == addr {
                    rec.next_avail = until;
                }
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Sweep
// ---------------------------------------------------------------------------

/// Arm the recurring cache sweep (every `CACHE_LIFE / 2`); entries whose
/// snapshot age exceeds `CACHE_LIFE` are dropped. In-flight entries are
/// always retained.
pub(crate) fn start_sweep(rt: &'static Runtime) {
    rt.reactor().schedule_after(CACHE_LIFE / 2, sweep_tick);
}

fn sweep_tick() {
    let now = MonoTime::now();
    with_cache(|map| {
        map.retain(|_, entry| match entry {
            Entry::InFlight(_) => true,
            Entry::Resolved { snapshot, .. } | Entry::Failed { snapshot, .. } => {
                now.since(*snapshot) <= CACHE_LIFE
            }
        });
    });
    Runtime::global().reactor().schedule_after(CACHE_LIFE / 2, sweep_tick);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_runtime;
    use std::net::Ipv6Addr;

    fn seed_resolved(host: &str, port: u16, addrs: &[SocketAddrV6]) {
        let now = MonoTime::now();
        with_cache(|map| {
            map.insert(
                (host.to_string(), port),
                Entry::Resolved {
                    records: addrs
                        .iter()
                        .map(|&addr| AddrRecord {
                            addr,
                            next_avail: now,
                        })
                        .collect(),
                    snapshot: now,
                    rotation: 0,
                },
            );
        });
    }

    fn addr(last: u16, port: u16) -> SocketAddrV6 {
        SocketAddrV6::new(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, last), port, 0, 0)
    }

    #[test]
    fn test_rotation_round_robins() {
        let rt = test_runtime();
        rt.block_on(|| {
            let addrs = [addr(1, 80), addr(2, 80), addr(3, 80)];
            seed_resolved("rr.test", 80, &addrs);
            let picks: Vec<_> = (0..4).map(|_| get_addrinfo("rr.test", 80).unwrap()).collect();
            assert_eq!(picks, vec![addrs[0], addrs[1], addrs[2], addrs[0]]);
        });
    }

    #[test]
    fn test_cooldown_skips_address() {
        let rt = test_runtime();
        rt.block_on(|| {
            let addrs = [addr(1, 81), addr(2, 81)];
            seed_resolved("cool.test", 81, &addrs);
            mark_unavailable("cool.test", 81, addrs[0], Duration::from_secs(60));
            for _ in 0..3 {
                assert_eq!(get_addrinfo("cool.test", 81).unwrap(), addrs[1]);
            }
        });
    }

    #[test]
    fn test_all_cooling_down_reschedules() {
        let rt = test_runtime();
        rt.block_on(|| {
            let addrs = [addr(1, 82)];
            seed_resolved("wait.test", 82, &addrs);
            mark_unavailable("wait.test", 82, addrs[0], Duration::from_millis(200));
            let started = std::time::Instant::now();
            // Must stall until the cooldown expires rather than fail.
            let got = get_addrinfo("wait.test", 82).unwrap();
            assert_eq!(got, addrs[0]);
            assert!(started.elapsed() >= Duration::from_millis(150));
        });
    }

    #[test]
    fn test_failed_entry_delivers_cached_error() {
        let rt = test_runtime();
        rt.block_on(|| {
            with_cache(|map| {
                map.insert(
                    ("dead.test".to_string(), 83),
                    Entry::Failed {
                        error: "no such host".into(),
                        snapshot: MonoTime::now(),
                    },
                );
            });
            let err = get_addrinfo("dead.test", 83).unwrap_err();
            assert!(matches!(err, RtError::Resolve(_)));
        });
    }

    #[test]
    fn test_sweep_drops_stale_entries() {
        let _rt = test_runtime();
        let stale = MonoTime::now() - (CACHE_LIFE + Duration::from_secs(1));
        with_cache(|map| {
            map.insert(
                ("stale.test".to_string(), 84),
                Entry::Failed {
                    error: "old".into(),
                    snapshot: stale,
                },
            );
        });
        sweep_tick();
        let present = with_cache(|map| map.contains_key(&("stale.test".to_string(), 84)));
        assert!(!present);
    }
}
