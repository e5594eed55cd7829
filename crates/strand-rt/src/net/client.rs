//! Outbound TCP connect that parks the calling task instead of the thread.

use std::net::SocketAddrV6;
use std::os::unix::io::RawFd;

use crate::dns;
use crate::error::{Result, RtError};
use crate::pipe::{Pipe, SocketKind};
use crate::reactor::sys;

/// Default cap on how long a connect may stay in progress.
pub const CONNECT_DEADLINE_SECS: u32 = 16;

/// Connect to an explicit address. Issues a non-blocking `connect`; on
/// EINPROGRESS the task parks until the socket is writable, then SO_ERROR
/// decides the outcome. The returned pipe has `TCP_NODELAY` set and no
/// block-time limit.
pub fn connect_addr(addr: &SocketAddrV6) -> Result<Pipe> {
    let fd: RawFd = sys::cvt(unsafe {
        libc::socket(
            libc::AF_INET6,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    })
    .map_err(|e| RtError::Io(format!("socket: {}", e)))?;

    // The Pipe owns the fd from here on; failure paths close it via Drop.
    let pipe = Pipe::new(fd, SocketKind::Network);

    let raw = sys::sockaddr_from_v6(addr);
    let rc = unsafe {
        libc::connect(
            fd,
            &raw as *const libc::sockaddr_in6 as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        )
    };

    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(RtError::Io(format!("connect to {}: {}", addr, err)));
        }
        // Park until the connect resolves, bounded by the connect deadline.
        pipe.limit_io_block_time(CONNECT_DEADLINE_SECS);
        pipe.wait_io(false).map_err(|e| match e {
            RtError::Timeout(_) => RtError::Timeout(format!("connect to {} timed out", addr)),
            other => other,
        })?;
        pipe.limit_io_block_time(0);

        if let Some(err) =
            sys::take_socket_error(fd).map_err(|e| RtError::Io(format!("getsockopt: {}", e)))?
        {
            return Err(RtError::Io(format!("connect to {}: {}", addr, err)));
        }
    }

    if let Err(e) = sys::set_tcp_nodelay(fd) {
        log::warn!("TCP_NODELAY on fd {} failed: {}", fd, e);
    }
    Ok(pipe)
}

/// Resolve `host` through the DNS cache (suspending the task) and connect
/// to the next address in its rotation.
pub fn connect_host(host: &str, port: u16) -> Result<Pipe> {
    let addr = dns::cache::get_addrinfo(host, port)?;
    connect_addr(&addr)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_runtime;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, SocketAddrV6, TcpListener};

    fn mapped(listener: &TcpListener) -> SocketAddrV6 {
        let port = listener.local_addr().unwrap().port();
        SocketAddrV6::new(Ipv4Addr::LOCALHOST.to_ipv6_mapped(), port, 0, 0)
    }

    #[test]
    fn test_connect_and_exchange() {
        let rt = test_runtime();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = mapped(&listener);
        let echo = std::thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).unwrap();
            s.write_all(&buf).unwrap();
        });
        rt.block_on(move || {
            let pipe = connect_addr(&addr).unwrap();
            pipe.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            let mut got = 0;
            while got < 4 {
                got += pipe.read(&mut buf[got..]).unwrap();
            }
            assert_eq!(&buf, b"ping");
        });
        echo.join().unwrap();
    }

    #[test]
    fn test_connect_refused_is_io_error() {
        let rt = test_runtime();
        // Bind-then-drop guarantees an unused port.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = mapped(&listener);
        drop(listener);
        rt.block_on(move || {
            let err = connect_addr(&addr).unwrap_err();
            assert!(matches!(err, RtError::Io(_)), "got {:?}", err);
            assert!(err.is_retryable());
        });
    }
}
