//! The pipe: a non-blocking fd that looks blocking to tasks.
//!
//! `read`/`write` issue the syscall first; on EAGAIN the calling task parks
//! and the fd is registered (one-shot, edge-triggered, with remote-hangup
//! reporting) so that whichever worker receives the readiness edge revives
//! the task there. At most one task is ever parked on a pipe.
//!
//! Every live *network* pipe is registered in a process-wide table of weak
//! handles; a recurring sweeper walks it under `while_paused` and forcibly
//! wakes tasks whose per-pipe I/O deadline has passed (see [`sweep`]). The
//! woken read/write call raises [`RtError::Timeout`], a different kind than
//! transport failure.

pub(crate) mod sweep;

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{Result, RtError};
use crate::reactor::{sys, IoHandler};
use crate::runtime::Runtime;
use crate::task::coro::{park, Park, Task};
use crate::task::{self, scheduler};
use crate::time::MonoTime;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// The byte-stream interface shared by plain and TLS pipes. Everything
/// above the transport layer (clusters, HTTP) talks to this.
pub trait Transport: Send {
    /// Read at least one byte, parking the task until data arrives. A read
    /// of zero from the kernel (peer closed cleanly) is an I/O error, as is
    /// an observed remote hangup.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write at least one byte, parking until the fd accepts data.
    fn write_some(&mut self, buf: &[u8]) -> Result<usize>;

    /// Write the whole buffer, parking as needed.
    fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write_some(buf)?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Cap how long a single read/write may stay parked; 0 removes the cap.
    fn limit_io_block_time(&self, seconds: u32);

    /// Mark the pipe reclaimable by the sweeper under fd pressure.
    fn set_hibernating(&self, hibernating: bool);

    fn is_hibernating(&self) -> bool;

    fn fd(&self) -> RawFd;
}

// ---------------------------------------------------------------------------
// SocketKind
// ---------------------------------------------------------------------------

/// Unix-domain pipes are runtime plumbing and are exempt from the network
/// pipe count and the sweeper.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SocketKind {
    Unix,
    Network,
}

// ---------------------------------------------------------------------------
// PipeShared
// ---------------------------------------------------------------------------

/// State shared between the owning `Pipe`, the reactor handler, and the
/// sweeper.
pub(crate) struct PipeShared {
    fd: RawFd,
    kind: SocketKind,
    id: u64,
    /// Registered with epoll at least once (MOD instead of ADD thereafter).
    attached: AtomicBool,
    /// The single task parked on this pipe, if any.
    parked: Mutex<Option<Box<Task>>>,
    max_block_secs: AtomicU32,
    /// Absolute deadline for the current park; None when unbounded or idle.
    deadline: Mutex<Option<MonoTime>>,
    remote_hangup: AtomicBool,
    hibernating: AtomicBool,
    /// Reactor registration failed while parking; the woken I/O call turns
    /// this into an error.
    register_failed: AtomicBool,
}

impl PipeShared {
    pub(crate) fn deadline_before(&self, now: MonoTime) -> bool {
        matches!(*self.deadline.lock(), Some(d) if d <= now)
    }

    pub(crate) fn is_hibernating_flag(&self) -> bool {
        self.hibernating.load(Ordering::Relaxed)
    }

    /// Used by the sweeper: pull the parked task (if any) and wake it with
    /// the timeout flag set.
    pub(crate) fn wake_with_timeout(&self) {
        let task = self.parked.lock().take();
        if let Some(mut task) = task {
            *self.deadline.lock() = None;
            task.set_timeout_expired();
            scheduler::wake(task);
        }
    }
}

impl IoHandler for PipeShared {
    fn io_avail(&self, events: u32) {
        if events & (libc::EPOLLRDHUP | libc::EPOLLHUP) as u32 != 0 {
            self.remote_hangup.store(true, Ordering::SeqCst);
        }
        let task = self.parked.lock().take();
        if let Some(task) = task {
            scheduler::wake(task);
        }
    }
}

/// Scheduler-side completion of an I/O park: record the deadline, stash the
/// task in the pipe slot, then register interest. Ordering matters -- the
/// task must be findable before the readiness edge can fire on another
/// worker.
pub(crate) fn complete_io_park(shared: &Arc<PipeShared>, task: Box<Task>, want_read: bool) {
    let secs = shared.max_block_secs.load(Ordering::Relaxed);
    if secs > 0 {
        *shared.deadline.lock() = Some(MonoTime::now() + Duration::from_secs(secs as u64));
    }
    *shared.parked.lock() = Some(task);

    let interest = if want_read {
        libc::EPOLLIN
    } else {
        libc::EPOLLOUT
    };
    let events = (interest | libc::EPOLLONESHOT | libc::EPOLLET | libc::EPOLLRDHUP) as u32;

    let reactor = Runtime::global().reactor();
    let first_attach = !shared.attached.swap(true, Ordering::SeqCst);
    let res = if first_attach {
        reactor.install(
            shared.fd,
            events,
            Arc::clone(shared) as Arc<dyn IoHandler>,
        )
    } else {
        reactor.modify(shared.fd, events)
    };

    if let Err(e) = res {
        log::error!("registering pipe fd {} with reactor failed: {}", shared.fd, e);
        if first_attach {
            shared.attached.store(false, Ordering::SeqCst);
        }
        shared.register_failed.store(true, Ordering::SeqCst);
        let task = shared.parked.lock().take();
        if let Some(task) = task {
            scheduler::wake(task);
        }
    }
}

// ---------------------------------------------------------------------------
// Net-pipe accounting
// ---------------------------------------------------------------------------

struct NetPipeLatch {
    count: task::Mutex<usize>,
    zero: task::Condvar,
}

static LATCH: std::sync::OnceLock<NetPipeLatch> = std::sync::OnceLock::new();
static REGISTRY: Mutex<Option<FxHashMap<u64, Weak<PipeShared>>>> = Mutex::new(None);
static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

fn latch() -> &'static NetPipeLatch {
    LATCH.get_or_init(|| NetPipeLatch {
        count: task::Mutex::new(0),
        zero: task::Condvar::new(),
    })
}

/// Number of live network pipes.
pub fn net_pipe_count() -> usize {
    *latch().count.lock()
}

/// Park the calling task until every network pipe has been dropped. Used by
/// the quiesce path of the supervisor handshake.
pub fn wait_for_zero_net_pipes() {
    let latch = latch();
    let mut count = latch.count.lock();
    while *count != 0 {
        latch.zero.wait(&mut count);
    }
}

/// Snapshot the live-pipe registry for the sweeper.
pub(crate) fn live_pipes() -> Vec<Arc<PipeShared>> {
    REGISTRY
        .lock()
        .as_ref()
        .map(|m| m.values().filter_map(Weak::upgrade).collect())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Pipe
// ---------------------------------------------------------------------------

/// Owning wrapper for a non-blocking fd. See the module docs for the
/// blocking model.
pub struct Pipe {
    shared: Arc<PipeShared>,
    released: bool,
}

impl Pipe {
    /// Take ownership of `fd`. The fd is forced non-blocking and
    /// close-on-exec; network pipes join the sweeper registry and the
    /// net-pipe count.
    pub fn new(fd: RawFd, kind: SocketKind) -> Pipe {
        if let Err(e) = sys::set_nonblocking(fd).and_then(|_| sys::set_cloexec(fd)) {
            log::error!("fcntl on pipe fd {} failed: {}", fd, e);
        }
        let shared = Arc::new(PipeShared {
            fd,
            kind,
            id: NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed),
            attached: AtomicBool::new(false),
            parked: Mutex::new(None),
            max_block_secs: AtomicU32::new(0),
            deadline: Mutex::new(None),
            remote_hangup: AtomicBool::new(false),
            hibernating: AtomicBool::new(false),
            register_failed: AtomicBool::new(false),
        });
        if kind == SocketKind::Network {
            REGISTRY
                .lock()
                .get_or_insert_with(FxHashMap::default)
                .insert(shared.id, Arc::downgrade(&shared));
            *latch().count.lock() += 1;
            sweep::ensure_armed();
        }
        Pipe { shared, released: false }
    }

    /// Park until the fd is readable. Exposed for the connect path, which
    /// waits for writability without having bytes to write.
    pub(crate) fn wait_io(&self, want_read: bool) -> Result<()> {
        let resume = park(Park::Io {
            pipe: Arc::clone(&self.shared),
            want_read,
        });
        *self.shared.deadline.lock() = None;
        if self.shared.register_failed.swap(false, Ordering::SeqCst) {
            return Err(RtError::Io(format!(
                "registering fd {} with reactor failed",
                self.shared.fd
            )));
        }
        if resume.timeout_expired {
            return Err(RtError::Timeout(format!(
                "i/o deadline expired on fd {}",
                self.shared.fd
            )));
        }
        Ok(())
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match sys::read_fd(self.shared.fd, buf) {
                Ok(0) if !buf.is_empty() => {
                    return Err(RtError::Io(format!(
                        "read on fd {} returned 0, other end closed",
                        self.shared.fd
                    )));
                }
                Ok(n) => return Ok(n),
                Err(_) if self.shared.remote_hangup.load(Ordering::SeqCst) => {
                    return Err(RtError::Io(format!(
                        "read on fd {} after remote hangup",
                        self.shared.fd
                    )));
                }
                Err(e) if sys::is_again(&e) => {
                    self.wait_io(true)?;
                }
                Err(e) => {
                    return Err(RtError::Io(format!("read on fd {}: {}", self.shared.fd, e)));
                }
            }
        }
    }

    pub fn write_some(&self, buf: &[u8]) -> Result<usize> {
        loop {
            if self.shared.remote_hangup.load(Ordering::SeqCst) {
                return Err(RtError::Io(format!(
                    "write on fd {} after remote hangup",
                    self.shared.fd
                )));
            }
            match sys::write_fd(self.shared.fd, buf) {
                Ok(0) if !buf.is_empty() => {
                    return Err(RtError::Io(format!(
                        "write on fd {} returned 0, other end closed",
                        self.shared.fd
                    )));
                }
                Ok(n) => return Ok(n),
                Err(e) if sys::is_again(&e) => {
                    self.wait_io(false)?;
                }
                Err(e) => {
                    return Err(RtError::Io(format!("write on fd {}: {}", self.shared.fd, e)));
                }
            }
        }
    }

    pub fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write_some(buf)?;
            buf = &buf[n..];
        }
        Ok(())
    }

    pub fn limit_io_block_time(&self, seconds: u32) {
        self.shared.max_block_secs.store(seconds, Ordering::Relaxed);
    }

    pub fn set_hibernating(&self, hibernating: bool) {
        self.shared.hibernating.store(hibernating, Ordering::Relaxed);
    }

    pub fn is_hibernating(&self) -> bool {
        self.shared.hibernating.load(Ordering::Relaxed)
    }

    pub fn fd(&self) -> RawFd {
        self.shared.fd
    }

    pub fn kind(&self) -> SocketKind {
        self.shared.kind
    }

    /// Detach from the reactor and give the raw fd back to the caller; the
    /// pipe no longer owns or closes it.
    pub fn release(mut self) -> RawFd {
        if self.shared.attached.swap(false, Ordering::SeqCst) {
            let _ = Runtime::global().reactor().deregister(self.shared.fd);
        }
        self.released = true;
        self.unregister();
        self.shared.fd
    }

    fn unregister(&self) {
        if self.shared.kind == SocketKind::Network {
            if let Some(map) = REGISTRY.lock().as_mut() {
                map.remove(&self.shared.id);
            }
            let latch = latch();
            let mut count = latch.count.lock();
            *count -= 1;
            if *count == 0 {
                latch.zero.notify_all();
            }
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.shared.attached.swap(false, Ordering::SeqCst) {
            if let Some(rt) = Runtime::try_global() {
                let _ = rt.reactor().deregister(self.shared.fd);
            }
        }
        sys::close_fd(self.shared.fd);
        self.unregister();
    }
}

impl Transport for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Pipe::read(self, buf)
    }

    fn write_some(&mut self, buf: &[u8]) -> Result<usize> {
        Pipe::write_some(self, buf)
    }

    fn limit_io_block_time(&self, seconds: u32) {
        Pipe::limit_io_block_time(self, seconds)
    }

    fn set_hibernating(&self, hibernating: bool) {
        Pipe::set_hibernating(self, hibernating)
    }

    fn is_hibernating(&self) -> bool {
        Pipe::is_hibernating(self)
    }

    fn fd(&self) -> RawFd {
        Pipe::fd(self)
    }
}

// std::io adapters so the rustls machinery can drive a pipe directly. The
// Timeout kind survives the conversion in both directions.

impl io::Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Pipe::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Pipe::write_some(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("fd", &self.shared.fd)
            .field("kind", &self.shared.kind)
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
    use crate::task::spawn;

    fn socketpair_pipes() -> (Pipe, Pipe) {
        let (a, b) = sys::command_socketpair().unwrap();
        (Pipe::new(a, SocketKind::Network), Pipe::new(b, SocketKind::Network))
    }

    #[test]
    fn test_read_blocks_until_peer_writes() {
        let rt = test_runtime();
        rt.block_on(|| {
            let (a, b) = socketpair_pipes();
            let writer = spawn(move || {
                task::sleep(Duration::from_millis(50));
                b.write_all(b"hello").unwrap();
                // Keep b alive until the reader is done with the bytes.
                task::sleep(Duration::from_millis(100));
            });
            let mut buf = [0u8; 16];
            let n = a.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"hello");
            writer.join();
        });
    }

    #[test]
    fn test_read_after_peer_close_is_io_error() {
        let rt = test_runtime();
        rt.block_on(|| {
            let (a, b) = socketpair_pipes();
            drop(b);
            let mut buf = [0u8; 4];
            let err = a.read(&mut buf).unwrap_err();
            assert!(matches!(err, RtError::Io(_)), "got {:?}", err);
        });
    }

    #[test]
    fn test_large_write_roundtrip() {
        let rt = test_runtime();
        rt.block_on(|| {
            let (a, b) = socketpair_pipes();
            let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
            let expect = payload.clone();
            let writer = spawn(move || {
                a.write_all(&payload).unwrap();
                // Hold the write side open until the reader drains.
                task::sleep(Duration::from_millis(500));
            });
            let mut got = Vec::with_capacity(expect.len());
            let mut buf = [0u8; 4096];
            while got.len() < expect.len() {
                let n = b.read(&mut buf).unwrap();
                got.extend_from_slice(&buf[..n]);
            }
            assert_eq!(got, expect);
            writer.join();
        });
    }

    #[test]
    fn test_net_pipe_count_tracks_lifecycle() {
        let rt = test_runtime();
        rt.block_on(|| {
            let before = net_pipe_count();
            let (a, b) = socketpair_pipes();
            assert_eq!(net_pipe_count(), before + 2);
            drop(a);
            drop(b);
            assert_eq!(net_pipe_count(), before);
        });
    }

    #[test]
    fn test_sweeper_times_out_parked_read() {
        let rt = test_runtime();
        rt.block_on(|| {
            let (a, _b) = socketpair_pipes();
            a.limit_io_block_time(1);
            let started = std::time::Instant::now();
            let mut buf = [0u8; 8];
            // Peer sends nothing; the sweeper must wake us with the
            // distinct timeout kind.
            let err = a.read(&mut buf).unwrap_err();
            assert!(matches!(err, RtError::Timeout(_)), "got {:?}", err);
            // One deadline (1s) plus at most one sweep period (shortened in
            // tests via SWEEP_PERIOD) and scheduling slack.
            assert!(started.elapsed() < Duration::from_secs(30));
        });
    }
}
