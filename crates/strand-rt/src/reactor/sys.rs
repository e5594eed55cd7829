//! Thin wrappers over the epoll / timerfd / socket syscalls the reactor uses.
//!
//! Everything here is a direct libc call with errno turned into
//! `io::Result`; no policy lives at this layer.

use std::io;
use std::net::SocketAddrV6;
use std::os::unix::io::RawFd;

// ---------------------------------------------------------------------------
// errno helpers
// ---------------------------------------------------------------------------

/// Convert a -1-on-error syscall return into `io::Result`.
pub fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Convert a -1-on-error ssize_t syscall return into `io::Result`.
pub fn cvt_isize(ret: isize) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Whether the given error is EAGAIN / EWOULDBLOCK.
pub fn is_again(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EAGAIN) || err.kind() == io::ErrorKind::WouldBlock
}

// ---------------------------------------------------------------------------
// epoll
// ---------------------------------------------------------------------------

pub fn epoll_create() -> io::Result<RawFd> {
    cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })
}

/// Register / modify / remove interest for `fd`. The event payload carries
/// the fd itself; the reactor maps it back to a handler.
pub fn epoll_ctl(ep_fd: RawFd, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
    let mut evt = libc::epoll_event {
        events,
        u64: fd as u64,
    };
    let evt_ptr = if op == libc::EPOLL_CTL_DEL {
        std::ptr::null_mut()
    } else {
        &mut evt
    };
    cvt(unsafe { libc::epoll_ctl(ep_fd, op, fd, evt_ptr) }).map(|_| ())
}

/// Wait for a single event. Returns `None` on EINTR.
pub fn epoll_wait_one(ep_fd: RawFd) -> io::Result<Option<libc::epoll_event>> {
    let mut event = libc::epoll_event { events: 0, u64: 0 };
    let ret = unsafe { libc::epoll_wait(ep_fd, &mut event, 1, -1) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return Ok(None);
        }
        return Err(err);
    }
    if ret == 0 {
        return Ok(None);
    }
    Ok(Some(event))
}

pub fn op_string(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "EPOLL_CTL_ADD",
        libc::EPOLL_CTL_MOD => "EPOLL_CTL_MOD",
        libc::EPOLL_CTL_DEL => "EPOLL_CTL_DEL",
        _ => "EPOLL_CTL_?",
    }
}

// ---------------------------------------------------------------------------
// timerfd
// ---------------------------------------------------------------------------

pub fn timerfd_create() -> io::Result<RawFd> {
    cvt(unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    })
}

/// Arm the timer fd for an absolute CLOCK_MONOTONIC expiry.
pub fn timerfd_arm(fd: RawFd, when: libc::timespec) -> io::Result<()> {
    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: when,
    };
    cvt(unsafe { libc::timerfd_settime(fd, libc::TFD_TIMER_ABSTIME, &spec, std::ptr::null_mut()) })
        .map(|_| ())
}

/// Drain the expiration count. `Ok(false)` means EAGAIN: the kernel woke
/// several epoll waiters and another thread got the data first.
pub fn timerfd_read(fd: RawFd) -> io::Result<bool> {
    let mut count: u64 = 0;
    let ret = unsafe {
        libc::read(
            fd,
            &mut count as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if is_again(&err) {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// sockets
// ---------------------------------------------------------------------------

/// A unix-domain stream socketpair with small send/receive buffers, used as
/// the reactor command pipe. Small buffers keep callers from queueing up too
/// many commands ahead of dispatch.
pub fn command_socketpair() -> io::Result<(RawFd, RawFd)> {
    let mut sv = [0 as RawFd; 2];
    cvt(unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            sv.as_mut_ptr(),
        )
    })?;
    let buf_size: libc::c_int = 32768;
    for fd in sv {
        for opt in [libc::SO_RCVBUF, libc::SO_SNDBUF] {
            cvt(unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    opt,
                    &buf_size as *const libc::c_int as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            })?;
        }
    }
    Ok((sv[0], sv[1]))
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }).map(|_| ())
}

pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) }).map(|_| ())
}

pub fn set_tcp_nodelay(fd: RawFd) -> io::Result<()> {
    let flag: libc::c_int = 1;
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &flag as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })
    .map(|_| ())
}

pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    cvt_isize(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) })
}

pub fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    cvt_isize(unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) })
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Pending socket error, via SO_ERROR. Used after a non-blocking connect.
pub fn take_socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    })?;
    if err == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(err)))
    }
}

/// Block SIGPIPE process-wide so a write to a closed socket surfaces as
/// EPIPE instead of killing the process.
pub fn block_sigpipe() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGPIPE);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

// ---------------------------------------------------------------------------
// sockaddr conversion
// ---------------------------------------------------------------------------

/// Build a `sockaddr_in6` from a Rust address. All connections use the
/// IPv6 form; IPv4 peers appear as v4-mapped addresses.
pub fn sockaddr_from_v6(addr: &SocketAddrV6) -> libc::sockaddr_in6 {
    let mut out: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    out.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    out.sin6_port = addr.port().to_be();
    out.sin6_addr.s6_addr = addr.ip().octets();
    out.sin6_flowinfo = addr.flowinfo();
    out.sin6_scope_id = addr.scope_id();
    out
}

/// Parse an accepted peer address back into Rust form.
pub fn v6_from_sockaddr(raw: &libc::sockaddr_in6) -> SocketAddrV6 {
    SocketAddrV6::new(
        std::net::Ipv6Addr::from(raw.sin6_addr.s6_addr),
        u16::from_be(raw.sin6_port),
        raw.sin6_flowinfo,
        raw.sin6_scope_id,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_command_socketpair_roundtrip() {
        let (tx, rx) = command_socketpair().unwrap();
        write_fd(tx, b"x").unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(read_fd(rx, &mut buf).unwrap(), 1);
        assert_eq!(&buf, b"x");
        close_fd(tx);
        close_fd(rx);
    }

    #[test]
    fn test_sockaddr_roundtrip() {
        let addr = SocketAddrV6::new(Ipv6Addr::LOCALHOST, 8443, 0, 0);
        let raw = sockaddr_from_v6(&addr);
        assert_eq!(v6_from_sockaddr(&raw), addr);
    }

    #[test]
    fn test_timerfd_create_and_arm() {
        let fd = timerfd_create().unwrap();
        let when = crate::time::MonoTime::now() + std::time::Duration::from_millis(10);
        timerfd_arm(fd, when.to_timespec()).unwrap();
        // Non-blocking read before expiry reports EAGAIN as Ok(false).
        assert!(!timerfd_read(fd).unwrap());
        close_fd(fd);
    }
}
