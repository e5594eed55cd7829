//! Accepting TCP server: dual-stack listener, one-shot accept dispatch, a
//! task per connection.

use std::net::SocketAddrV6;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, RtError};
use crate::pipe::{sweep, Pipe, SocketKind};
use crate::reactor::{sys, IoHandler};
use crate::runtime::Runtime;
use crate::task;

/// Default listen(2) backlog; deliberately smaller than SOMAXCONN.
pub const DEFAULT_BACKLOG: i32 = 32;

type ConnFn = Box<dyn Fn(Pipe, SocketAddrV6) + Send + Sync>;

// ---------------------------------------------------------------------------
// TcpServer
// ---------------------------------------------------------------------------

/// Listens on a TCP port (or an inherited listener fd) and runs the
/// connection callback in a fresh task for every accepted socket.
///
/// The listener is registered `EPOLLIN | EPOLLONESHOT`; each readiness edge
/// is drained with `accept4` until EAGAIN and then re-armed, so exactly one
/// worker accepts at a time while connection tasks spread across the pool.
pub struct TcpServer {
    shared: Arc<ListenerShared>,
}

struct ListenerShared {
    listen_fd: RawFd,
    stopped: AtomicBool,
    on_conn: ConnFn,
    /// Lets the accept handler hand an owning clone to connection tasks.
    weak_self: std::sync::Weak<ListenerShared>,
}

impl TcpServer {
    /// Bind a dual-stack listener on `port` and start accepting.
    pub fn bind(
        port: u16,
        backlog: i32,
        on_conn: impl Fn(Pipe, SocketAddrV6) + Send + Sync + 'static,
    ) -> Result<TcpServer> {
        let fd = init_listen_socket(port, backlog)?;
        Self::attach(fd, on_conn)
    }

    /// Adopt an already-listening fd (the supervisor inheritance path) and
    /// start accepting. The fd is forced non-blocking and close-on-exec.
    pub fn from_fd(
        fd: RawFd,
        on_conn: impl Fn(Pipe, SocketAddrV6) + Send + Sync + 'static,
    ) -> Result<TcpServer> {
        sys::set_nonblocking(fd)
            .and_then(|_| sys::set_cloexec(fd))
            .map_err(|e| RtError::Setup(format!("fcntl on inherited fd {}: {}", fd, e)))?;
        Self::attach(fd, on_conn)
    }

    fn attach(
        fd: RawFd,
        on_conn: impl Fn(Pipe, SocketAddrV6) + Send + Sync + 'static,
    ) -> Result<TcpServer> {
        let shared = Arc::new_cyclic(|weak| ListenerShared {
            listen_fd: fd,
            stopped: AtomicBool::new(false),
            on_conn: Box::new(on_conn),
            weak_self: weak.clone(),
        });
        Runtime::global().reactor().install(
            fd,
            (libc::EPOLLIN | libc::EPOLLONESHOT) as u32,
            Arc::clone(&shared) as Arc<dyn IoHandler>,
        )?;
        log::info!("tcp server accepting on fd {}", fd);
        Ok(TcpServer { shared })
    }

    /// Stop accepting: set the stop flag, then detach the listener. An
    /// accept dispatch already in flight on another worker drains its
    /// backlog batch and, seeing the flag, does not re-arm. Idempotent,
    /// callable from any context including a task.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let fd = self.shared.listen_fd;
        if let Err(e) = Runtime::global().reactor().deregister(fd) {
            log::warn!("deregistering listener fd {}: {}", fd, e);
        }
        log::info!("tcp server on fd {} stopped", fd);
    }

    pub fn local_port(&self) -> Result<u16> {
        let mut raw: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        sys::cvt(unsafe {
            libc::getsockname(
                self.shared.listen_fd,
                &mut raw as *mut libc::sockaddr_in6 as *mut libc::sockaddr,
                &mut len,
            )
        })
        .map_err(|e| RtError::Setup(format!("getsockname: {}", e)))?;
        Ok(u16::from_be(raw.sin6_port))
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
        sys::close_fd(self.shared.listen_fd);
    }
}

impl IoHandler for ListenerShared {
    fn io_avail(&self, _events: u32) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        loop {
            let mut raw: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            let conn = unsafe {
                libc::accept4(
                    self.listen_fd,
                    &mut raw as *mut libc::sockaddr_in6 as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if conn < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => break,
                    Some(libc::EINTR) => continue,
                    Some(libc::EMFILE) | Some(libc::ENFILE) => {
                        // Out of fds: reclaim hibernating pipes and let the
                        // re-armed listener try again on the next edge.
                        log::error!("accept failed ({}); sweeping hibernating pipes", err);
                        sweep::sweep_hibernating();
                        break;
                    }
                    _ => {
                        log::error!("accept on fd {} failed: {}", self.listen_fd, err);
                        break;
                    }
                }
            }

            if let Err(e) = sys::set_tcp_nodelay(conn) {
                log::warn!("TCP_NODELAY on accepted fd {} failed: {}", conn, e);
            }
            let peer = sys::v6_from_sockaddr(&raw);
            let pipe = Pipe::new(conn, SocketKind::Network);
            // The callback runs in its own task so a slow connection never
            // blocks the accept path.
            let shared = match self.weak_self.upgrade() {
                Some(shared) => shared,
                None => return,
            };
            let spawned = task::Builder::new().name("tcp connection").spawn(move || {
                (shared.on_conn)(pipe, peer);
            });
            if let Err(e) = spawned {
                log::error!("spawning connection task failed: {}", e);
            }
        }

        if !self.stopped.load(Ordering::SeqCst) {
            if let Err(e) = Runtime::global()
                .reactor()
                .modify(self.listen_fd, (libc::EPOLLIN | libc::EPOLLONESHOT) as u32)
            {
                log::error!("re-arming listener fd {} failed: {}", self.listen_fd, e);
            }
        }
    }
}

fn init_listen_socket(port: u16, backlog: i32) -> Result<RawFd> {
    let fd = sys::cvt(unsafe {
        libc::socket(
            libc::AF_INET6,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    })
    .map_err(|e| RtError::Setup(format!("socket: {}", e)))?;

    let off: libc::c_int = 0;
    let on: libc::c_int = 1;
    unsafe {
        // Dual-stack: accept v4 connections as v4-mapped addresses.
        libc::setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_V6ONLY,
            &off as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let addr = std::net::SocketAddrV6::new(std::net::Ipv6Addr::UNSPECIFIED, port, 0, 0);
    let raw = sys::sockaddr_from_v6(&addr);
    sys::cvt(unsafe {
        libc::bind(
            fd,
            &raw as *const libc::sockaddr_in6 as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        )
    })
    .map_err(|e| {
        sys::close_fd(fd);
        RtError::Setup(format!("bind to port {}: {}", port, e))
    })?;
    sys::cvt(unsafe { libc::listen(fd, backlog) }).map_err(|e| {
        sys::close_fd(fd);
        RtError::Setup(format!("listen: {}", e))
    })?;

    Ok(fd)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
