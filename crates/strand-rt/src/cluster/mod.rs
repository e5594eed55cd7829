//! The endpoint cluster: a pooled set of connections to one logical host.
//!
//! A cluster holds one endpoint per resolved address. Requests round-robin
//! across endpoints, each bounded by a per-endpoint concurrency limit and
//! backed by an idle-socket queue with an age cap. A background task
//! refreshes DNS on an interval, merging new addresses with known ones and
//! aging out addresses the resolver has stopped returning.
//!
//! ## Failure policy
//!
//! - Connect failure removes the endpoint outright, forcing the next
//!   attempt back through resolution, and surfaces a retryable I/O error.
//! - A callback error flags the endpoint; if that was its last socket, the
//!   endpoint is removed. Flagged endpoints are removed (and the request
//!   retried) by the next task to acquire a slot on them.
//! - [`EndpointCluster::with_connected_pipe`] retries retryable errors with
//!   exponential backoff (50 ms doubling) and rethrows once the next delay
//!   would exceed the 30 s cap. Timeouts are never retried.

use std::collections::VecDeque;
use std::net::SocketAddrV6;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::dns;
use crate::error::{Result, RtError};
use crate::net;
use crate::pipe::Transport;
use crate::task;
use crate::time::MonoTime;
use crate::tls::{TlsContext, TlsPipe};

// ---------------------------------------------------------------------------
// ClusterConfig
// ---------------------------------------------------------------------------

/// Tunables for one cluster. The idle cap and lookup interval are design
/// constants surfaced as configuration.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Concurrent requests allowed per endpoint.
    pub max_per_endpoint: usize,
    /// How often the address list is refreshed.
    pub lookup_interval: Duration,
    /// An idle socket older than this is discarded instead of reused.
    pub max_idle_time: Duration,
    /// Per-pipe I/O deadline applied to cluster connections (seconds; 0
    /// disables).
    pub io_block_time: u32,
    /// First retry delay of the backoff wrapper.
    pub backoff_initial: Duration,
    /// Give up once the next delay would exceed this.
    pub backoff_cap: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            max_per_endpoint: 20,
            lookup_interval: Duration::from_secs(20),
            max_idle_time: Duration::from_secs(60),
            io_block_time: net::CONNECT_DEADLINE_SECS,
            backoff_initial: Duration::from_millis(50),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

struct IdleSock {
    transport: Box<dyn Transport>,
    since: MonoTime,
}

struct EndpointState {
    idle: VecDeque<IdleSock>,
    outstanding: usize,
    /// A request on this endpoint failed; the endpoint is condemned and the
    /// next slot acquirer removes it.
    error: bool,
}

/// One resolved address plus its connection pool.
struct Endpoint {
    addr: SocketAddrV6,
    state: task::Mutex<EndpointState>,
    cond: task::Condvar,
    /// Last time the resolver reported this address (MonoTime nanos).
    last_seen: AtomicU64,
}

impl Endpoint {
    fn new(addr: SocketAddrV6, now: MonoTime) -> Arc<Endpoint> {
        Arc::new(Endpoint {
            addr,
            state: task::Mutex::new(EndpointState {
                idle: VecDeque::new(),
                outstanding: 0,
                error: false,
            }),
            cond: task::Condvar::new(),
            last_seen: AtomicU64::new(now.as_nanos()),
        })
    }
}

// ---------------------------------------------------------------------------
// EndpointCluster
// ---------------------------------------------------------------------------

struct ClusterState {
    endpoints: Vec<Arc<Endpoint>>,
    rotation: usize,
    last_lookup: Option<MonoTime>,
    looking_up: bool,
    lookup_error: Option<String>,
}

/// Connection pool for a logical (host, port), optionally TLS-wrapped.
pub struct EndpointCluster {
    host: String,
    port: u16,
    tls: Option<Arc<TlsContext>>,
    config: ClusterConfig,
    state: task::Mutex<ClusterState>,
    cond: task::Condvar,
    weak_self: Weak<EndpointCluster>,
}

impl EndpointCluster {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        tls: Option<Arc<TlsContext>>,
        config: ClusterConfig,
    ) -> Arc<EndpointCluster> {
        Arc::new_cyclic(|weak| EndpointCluster {
            host: host.into(),
            port,
            tls,
            config,
            state: task::Mutex::new(ClusterState {
                endpoints: Vec::new(),
                rotation: 0,
                last_lookup: None,
                looking_up: false,
                lookup_error: None,
            }),
            cond: task::Condvar::new(),
            weak_self: weak.clone(),
        })
    }

    /// Run `f` with a connected transport to this host. `Ok(true)` from `f`
    /// returns the connection to the idle pool; `Ok(false)` discards it;
    /// `Err` condemns the endpoint. Retryable failures are retried here
    /// with exponential backoff until the cap.
    pub fn with_connected_pipe(
        &self,
        mut f: impl FnMut(&mut dyn Transport) -> Result<bool>,
    ) -> Result<()> {
        let mut delay = self.config.backoff_initial;
        loop {
            match self.do_with_connected_pipe(&mut f) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    log::debug!(
                        "{}:{} request failed ({}); backing off {:?}",
                        self.host,
                        self.port,
                        e,
                        delay
                    );
                    task::sleep(delay);
                    delay *= 2;
                    // Give up once the doubled delay passes the cap.
                    if delay > self.config.backoff_cap {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn do_with_connected_pipe(
        &self,
        f: &mut dyn FnMut(&mut dyn Transport) -> Result<bool>,
    ) -> Result<()> {
        loop {
            let ep = self.pick_endpoint()?;

            // Acquire a slot on this endpoint.
            {
                let mut st = ep.state.lock();
                while st.outstanding >= self.config.max_per_endpoint && !st.error {
                    ep.cond.wait(&mut st);
                }
                if st.error {
                    drop(st);
                    self.erase(&ep);
                    // Re-run the whole selection.
                    continue;
                }
                st.outstanding += 1;
            }

            return self.run_on_endpoint(&ep, f);
        }
    }

    /// Refresh DNS if stale, wait for endpoints if there are none, and pick
    /// the next endpoint in rotation.
    fn pick_endpoint(&self) -> Result<Arc<Endpoint>> {
        let mut st = self.state.lock();
        let stale = match st.last_lookup {
            None => true,
            Some(t) => MonoTime::now().since(t) > self.config.lookup_interval,
        };
        if st.endpoints.is_empty() || stale {
            if !st.looking_up {
                st.looking_up = true;
                st.lookup_error = None;
                let weak = self.weak_self.clone();
                let spawned = task::Builder::new()
                    .stack_size(64 * 1024)
                    .name(format!("epc refresh {}", self.host))
                    .spawn(move || {
                        if let Some(cluster) = weak.upgrade() {
                            cluster.update_endpoints();
                        }
                    });
                if let Err(e) = spawned {
                    st.looking_up = false;
                    return Err(e);
                }
            }
            // With no endpoints at all we must wait for the refresh; with a
            // stale-but-populated list we keep serving from what we have.
            while st.endpoints.is_empty() {
                if let Some(err) = &st.lookup_error {
                    return Err(RtError::Resolve(err.clone()));
                }
                self.cond.wait(&mut st);
            }
        }
        let idx = st.rotation % st.endpoints.len();
        st.rotation = st.rotation.wrapping_add(1);
        Ok(Arc::clone(&st.endpoints[idx]))
    }

    /// Slot already held: find or open a connection, run the callback,
    /// settle the slot.
    fn run_on_endpoint(
        &self,
        ep: &Arc<Endpoint>,
        f: &mut dyn FnMut(&mut dyn Transport) -> Result<bool>,
    ) -> Result<()> {
        let mut transport = match self.checkout_transport(ep) {
            Ok(t) => t,
            Err(e) => {
                let mut st = ep.state.lock();
                st.outstanding -= 1;
                ep.cond.notify_all();
                drop(st);
                // Connect failures condemn the endpoint unconditionally so
                // the next attempt re-resolves.
                self.erase(ep);
                return Err(e);
            }
        };

        let result = f(transport.as_mut());

        let mut st = ep.state.lock();
        st.outstanding -= 1;
        match result {
            Ok(cache) => {
                if cache {
                    st.idle.push_back(IdleSock {
                        transport,
                        since: MonoTime::now(),
                    });
                }
                ep.cond.notify_all();
                Ok(())
            }
            Err(e) => {
                st.error = true;
                let was_last = st.outstanding == 0 && st.idle.is_empty();
                ep.cond.notify_all();
                drop(st);
                if was_last {
                    self.erase(ep);
                }
                Err(e)
            }
        }
    }

    /// Reuse a young idle socket or open (and optionally TLS-wrap) a fresh
    /// connection.
    fn checkout_transport(&self, ep: &Arc<Endpoint>) -> Result<Box<dyn Transport>> {
        let now = MonoTime::now();
        {
            let mut st = ep.state.lock();
            while let Some(sock) = st.idle.pop_front() {
                if now.since(sock.since) < self.config.max_idle_time {
                    log::debug!(
                        "reusing idle connection (fd {}) to {}",
                        sock.transport.fd(),
                        ep.addr
                    );
                    return Ok(sock.transport);
                }
                log::debug!(
                    "discarding idle connection (fd {}) to {}: idle {:?}",
                    sock.transport.fd(),
                    ep.addr,
                    now.since(sock.since)
                );
            }
        }

        let pipe = net::connect_addr(&ep.addr)?;
        pipe.limit_io_block_time(self.config.io_block_time);
        match &self.tls {
            Some(ctx) => Ok(Box::new(TlsPipe::client(pipe, ctx, &self.host)?)),
            None => Ok(Box::new(pipe)),
        }
    }

    /// DNS refresh body, run on its own task: merge the fresh address list
    /// into the endpoint set, age out vanished addresses, publish the
    /// result (or the error, when nothing is known) and wake waiters.
    fn update_endpoints(&self) {
        let result = dns::lookup::get_addrinfo(&self.host, self.port);
        let now = MonoTime::now();

        let mut st = self.state.lock();
        match result {
            Err(e) => {
                log::warn!("dns refresh for {} failed: {}", self.host, e);
                st.lookup_error = Some(e.to_string());
            }
            Ok(addrs) => {
                for addr in &addrs {
                    match st.endpoints.iter().find(|ep| ep.addr == *addr) {
                        Some(ep) => ep.last_seen.store(now.as_nanos(), Ordering::Relaxed),
                        None => st.endpoints.push(Endpoint::new(*addr, now)),
                    }
                }
                // Keep using addresses for a grace period after the
                // resolver stops returning them.
                let horizon = self.config.lookup_interval * 10;
                st.endpoints.retain(|ep| {
                    let seen = now.since(MonoTime::from_nanos(ep.last_seen.load(Ordering::Relaxed)));
                    let keep = seen <= horizon;
                    if !keep {
                        log::debug!("aging out endpoint {} ({:?} since last seen)", ep.addr, seen);
                    }
                    keep
                });
                // Deterministic order so rotation is stable across merges.
                st.endpoints
                    .sort_by_key(|ep| (ep.addr.ip().octets(), ep.addr.port()));
            }
        }
        st.last_lookup = Some(now);
        st.looking_up = false;
        self.cond.notify_all();
    }

    /// Remove one endpoint from the cluster (by identity).
    fn erase(&self, ep: &Arc<Endpoint>) {
        let mut st = self.state.lock();
        st.endpoints.retain(|e| !Arc::ptr_eq(e, ep));
    }

    /// Current endpoint addresses, in rotation order.
    pub fn endpoint_addrs(&self) -> Vec<SocketAddrV6> {
        self.state.lock().endpoints.iter().map(|e| e.addr).collect()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Drop all cached endpoints, forcing resolution on the next request.
    pub fn flush_endpoints(&self) {
        let mut st = self.state.lock();
        st.endpoints.clear();
        st.last_lookup = None;
    }

    #[cfg(test)]
    pub(crate) fn seed_endpoints(&self, addrs: &[SocketAddrV6]) {
        let now = MonoTime::now();
        let mut st = self.state.lock();
        st.endpoints = addrs.iter().map(|&a| Endpoint::new(a, now)).collect();
        st.rotation = 0;
        st.last_lookup = Some(now);
    }
}

impl std::fmt::Debug for EndpointCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointCluster")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_runtime;
    use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// Counts accepted connections on a listener, keeping them open until
    /// the counter is dropped.
    struct AcceptCounter {
        count: Arc<AtomicUsize>,
        stop: Arc<AtomicBool>,
        handle: Option<std::thread::JoinHandle<()>>,
    }

    impl AcceptCounter {
        fn start(listener: TcpListener) -> AcceptCounter {
            listener.set_nonblocking(true).unwrap();
            let count = Arc::new(AtomicUsize::new(0));
            let stop = Arc::new(AtomicBool::new(false));
            let (c, s) = (Arc::clone(&count), Arc::clone(&stop));
            let handle = std::thread::spawn(move || {
                let mut held = Vec::new();
                while !s.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((sock, _)) => {
                            c.fetch_add(1, Ordering::SeqCst);
                            held.push(sock);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(5));
                        }
                        Err(_) => break,
                    }
                }
            });
            AcceptCounter {
                count,
                stop,
                handle: Some(handle),
            }
        }

        fn count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    impl Drop for AcceptCounter {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            if let Some(h) = self.handle.take() {
                let _ = h.join();
            }
        }
    }

    /// The kernel completes handshakes in the backlog before the counting
    /// thread accepts, so counts trail connects briefly.
    fn wait_for_count(counter: &AcceptCounter, expected: usize) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.count() < expected {
            assert!(
                std::time::Instant::now() < deadline,
                "accept count stuck at {} (wanted {})",
                counter.count(),
                expected
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn loopback(last_octet: u8, port: u16) -> SocketAddrV6 {
        SocketAddrV6::new(
            Ipv4Addr::new(127, 0, 0, last_octet).to_ipv6_mapped(),
            port,
            0,
            0,
        )
    }

    /// Bind listeners on 127.0.0.1..3, all on the same port.
    fn bind_three() -> (u16, [AcceptCounter; 3]) {
        let first = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = first.local_addr().unwrap().port();
        let second =
            TcpListener::bind(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 2), port)).unwrap();
        let third =
            TcpListener::bind(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 3), port)).unwrap();
        (
            port,
            [
                AcceptCounter::start(first),
                AcceptCounter::start(second),
                AcceptCounter::start(third),
            ],
        )
    }

    #[test]
    fn test_round_robin_across_endpoints() {
        let rt = test_runtime();
        let (port, counters) = bind_three();
        rt.block_on(move || {
            let cluster = EndpointCluster::new("rr.cluster.test", port, None, ClusterConfig::default());
            cluster.seed_endpoints(&[
                loopback(1, port),
                loopback(2, port),
                loopback(3, port),
            ]);
            let mut fds = Vec::new();
            for _ in 0..4 {
                cluster
                    .with_connected_pipe(|t| {
                        fds.push(t.fd());
                        Ok(true)
                    })
                    .unwrap();
            }
            // Dispatch order A1, A2, A3, A1 -- the fourth call reuses the
            // idle socket cached by the first, so each listener accepted
            // exactly once.
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while counters.iter().map(|c| c.count()).sum::<usize>() < 3 {
                assert!(std::time::Instant::now() < deadline);
                std::thread::sleep(Duration::from_millis(5));
            }
            assert_eq!(
                [counters[0].count(), counters[1].count(), counters[2].count()],
                [1, 1, 1]
            );
            assert_eq!(fds[3], fds[0], "fourth call must reuse the first socket");
        });
    }

    #[test]
    fn test_connect_failure_evicts_endpoint() {
        let rt = test_runtime();
        let live = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 2), 0)).unwrap();
        let port = live.local_addr().unwrap().port();
        let live = AcceptCounter::start(live);
        // 127.0.0.1:port has no listener -- connection refused.
        let dead_addr = loopback(1, port);
        let live_addr = loopback(2, port);
        rt.block_on(move || {
            let cluster = EndpointCluster::new("evict.cluster.test", port, None, ClusterConfig::default());
            cluster.seed_endpoints(&[dead_addr, live_addr]);
            let calls = Arc::new(AtomicUsize::new(0));
            let c = Arc::clone(&calls);
            cluster
                .with_connected_pipe(move |_t| {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                })
                .unwrap();
            // The callback ran once, via the live endpoint, after one retry.
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(cluster.endpoint_addrs(), vec![live_addr]);
            wait_for_count(&live, 1);
        });
    }

    #[test]
    fn test_idle_reuse_and_expiry() {
        let rt = test_runtime();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let counter = AcceptCounter::start(listener);
        rt.block_on(move || {
            let config = ClusterConfig {
                max_idle_time: Duration::from_secs(2),
                ..ClusterConfig::default()
            };
            let cluster = EndpointCluster::new("idle.cluster.test", port, None, config);
            cluster.seed_endpoints(&[loopback(1, port)]);

            let mut fds = Vec::new();
            let mut run = |cluster: &EndpointCluster, fds: &mut Vec<_>| {
                cluster
                    .with_connected_pipe(|t| {
                        fds.push(t.fd());
                        Ok(true)
                    })
                    .unwrap();
            };

            run(&cluster, &mut fds);
            task::sleep(Duration::from_millis(500));
            run(&cluster, &mut fds);
            assert_eq!(fds[1], fds[0], "young idle socket must be reused");

            task::sleep(Duration::from_millis(2500));
            run(&cluster, &mut fds);
            wait_for_count(&counter, 2);
            assert_eq!(counter.count(), 2, "expired idle socket must be replaced");
        });
    }

    #[test]
    fn test_callback_error_condemns_endpoint() {
        let rt = test_runtime();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let _counter = AcceptCounter::start(listener);
        rt.block_on(move || {
            let cluster = EndpointCluster::new("err.cluster.test", port, None, ClusterConfig::default());
            cluster.seed_endpoints(&[loopback(1, port)]);
            let err = cluster
                .do_with_connected_pipe(&mut |_t| Err(RtError::Io("request failed".into())))
                .unwrap_err();
            assert!(matches!(err, RtError::Io(_)));
            // Last socket on the endpoint: condemned and removed.
            assert!(cluster.endpoint_addrs().is_empty());
        });
    }

    #[test]
    fn test_timeout_is_not_retried() {
        let rt = test_runtime();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let _counter = AcceptCounter::start(listener);
        rt.block_on(move || {
            let cluster = EndpointCluster::new("to.cluster.test", port, None, ClusterConfig::default());
            cluster.seed_endpoints(&[loopback(1, port)]);
            let attempts = Arc::new(AtomicUsize::new(0));
            let a = Arc::clone(&attempts);
            let err = cluster
                .with_connected_pipe(move |_t| {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(RtError::Timeout("deadline".into()))
                })
                .unwrap_err();
            assert!(matches!(err, RtError::Timeout(_)));
            assert_eq!(attempts.load(Ordering::SeqCst), 1, "timeouts must not retry");
        });
    }

    #[test]
    fn test_max_per_endpoint_respected() {
        let rt = test_runtime();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let _counter = AcceptCounter::start(listener);
        rt.block_on(move || {
            let config = ClusterConfig {
                max_per_endpoint: 2,
                ..ClusterConfig::default()
            };
            let cluster = EndpointCluster::new("cap.cluster.test", port, None, config);
            cluster.seed_endpoints(&[loopback(1, port)]);

            let active = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..6)
                .map(|_| {
                    let cluster = Arc::clone(&cluster);
                    let active = Arc::clone(&active);
                    let peak = Arc::clone(&peak);
                    task::spawn(move || {
                        cluster
                            .with_connected_pipe(|_t| {
                                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                task::sleep(Duration::from_millis(50));
                                active.fetch_sub(1, Ordering::SeqCst);
                                Ok(true)
                            })
                            .unwrap();
                    })
                })
                .collect();
            for h in handles {
                h.join();
            }
            assert!(peak.load(Ordering::SeqCst) <= 2, "slot cap exceeded");
        });
    }
}

