//! The low-level lookup service: one OS thread, blocking resolution,
//! task-context delivery.

use std::net::{SocketAddr, SocketAddrV6, ToSocketAddrs};
use std::sync::{Arc, OnceLock};

use crossbeam_channel::{unbounded, Sender};

use crate::error::{Result, RtError};
use crate::task;

/// Addresses are always returned in canonical IPv6 form.
pub type LookupResult = Result<Vec<SocketAddrV6>>;

type Deliver = Box<dyn FnOnce(LookupResult) + Send>;

struct LookupRequest {
    host: String,
    port: u16,
    deliver: Deliver,
}

static SERVICE: OnceLock<Sender<LookupRequest>> = OnceLock::new();

fn service() -> &'static Sender<LookupRequest> {
    SERVICE.get_or_init(|| {
        let (tx, rx) = unbounded::<LookupRequest>();
        std::thread::Builder::new()
            .name("dns-lookup".into())
            .spawn(move || {
                for req in rx {
                    let result = resolve_blocking(&req.host, req.port);
                    // Deliver on a task so the callback may park. The spawn
                    // routes through the reactor because this thread is not
                    // a worker.
                    let deliver = req.deliver;
                    let spawned = task::Builder::new()
                        .name(format!("dns deliver {}", req.host))
                        .spawn(move || deliver(result));
                    if let Err(e) = spawned {
                        log::error!("spawning dns delivery task failed: {}", e);
                    }
                }
            })
            .expect("failed to start dns lookup thread");
        tx
    })
}

/// Run the blocking system resolver and canonicalize the results.
fn resolve_blocking(host: &str, port: u16) -> LookupResult {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| RtError::Resolve(format!("lookup of {} failed: {}", host, e)))?;
    let v6: Vec<SocketAddrV6> = addrs.map(canonical_v6).collect();
    if v6.is_empty() {
        return Err(RtError::Resolve(format!("no addresses for {}", host)));
    }
    Ok(v6)
}

/// IPv4 addresses become v4-mapped IPv6 (`::ffff:a.b.c.d`) so the rest of
/// the runtime compares addresses uniformly.
pub fn canonical_v6(addr: SocketAddr) -> SocketAddrV6 {
    match addr {
        SocketAddr::V4(v4) => SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0),
        SocketAddr::V6(v6) => v6,
    }
}

/// Kick off an async lookup; `f` runs later on a fresh task with the full
/// address list.
pub fn lookup_and_run(host: &str, port: u16, f: impl FnOnce(LookupResult) + Send + 'static) {
    let req = LookupRequest {
        host: host.to_string(),
        port,
        deliver: Box::new(f),
    };
    if service().send(req).is_err() {
        log::error!("dns lookup service is gone");
    }
}

/// Synchronous form for use inside a task: parks the caller until the
/// lookup completes and returns the full address list.
pub fn get_addrinfo(host: &str, port: u16) -> LookupResult {
    struct Slot {
        result: Option<LookupResult>,
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
    s.result.take().expect("lookup result vanished")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_runtime;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4};

    #[test]
    fn test_canonical_v6_maps_v4() {
        let v4 = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 80));
        let got = canonical_v6(v4);
        assert_eq!(got.ip().octets()[..12], [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
        assert_eq!(got.ip().octets()[12..], [10, 1, 2, 3]);
        assert_eq!(got.port(), 80);

        let v6 = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 443, 0, 0));
        assert_eq!(canonical_v6(v6), SocketAddrV6::new(Ipv6Addr::LOCALHOST, 443, 0, 0));
    }

    #[test]
    fn test_get_addrinfo_localhost() {
        let rt = test_runtime();
        let addrs = rt.block_on(|| get_addrinfo("localhost", 1234).unwrap());
        assert!(!addrs.is_empty());
        for a in addrs {
            assert_eq!(a.port(), 1234);
            let ip = *a.ip();
            assert!(
                ip == Ipv6Addr::LOCALHOST || ip == Ipv4Addr::LOCALHOST.to_ipv6_mapped(),
                "unexpected localhost address {}",
                ip
            );
        }
    }

    #[test]
    fn test_lookup_failure_is_resolve_kind() {
        let rt = test_runtime();
        let err = rt.block_on(|| {
            get_addrinfo("no-such-host.invalid", 80).unwrap_err()
        });
        assert!(matches!(err, RtError::Resolve(_)), "got {:?}", err);
        assert!(err.is_retryable());
    }
}
