//! The HTTP server loop: a task per connection, keep-alive, upgrades.

use std::net::SocketAddrV6;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::parse::{read_request, write_response, HttpConfig, Request, Response};
use crate::error::Result;
use crate::net::TcpServer;
use crate::pipe::{Pipe, Transport};
use crate::tls::{TlsContext, TlsPipe};

type RequestHandler = Arc<dyn Fn(&Request, &SocketAddrV6) -> Response + Send + Sync>;
type UpgradeHandler = Arc<dyn Fn(Request, Box<dyn Transport>) + Send + Sync>;

// ---------------------------------------------------------------------------
// HttpServer
// ---------------------------------------------------------------------------

/// HTTP/1.1 server over [`TcpServer`].
///
/// Every accepted connection runs in its own task: optional TLS handshake,
/// then a parse/dispatch/respond loop for as long as keep-alive holds.
/// Upgrade handshakes are routed by protocol name to a registered upgrade
/// handler, which takes ownership of the transport; unknown upgrade
/// protocols get `501` and a close.
pub struct HttpServer {
    tcp: TcpServer,
}

/// Configuration + handler registry for [`HttpServer::serve`].
pub struct Builder {
    config: HttpConfig,
    tls: Option<Arc<TlsContext>>,
    upgrades: FxHashMap<String, UpgradeHandler>,
    /// Per-request read deadline, in seconds (0 = unbounded).
    io_block_time: u32,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            config: HttpConfig::default(),
            tls: None,
            upgrades: FxHashMap::default(),
            io_block_time: 0,
        }
    }
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    pub fn config(mut self, config: HttpConfig) -> Builder {
        self.config = config;
        self
    }

    /// Terminate TLS on accepted connections with this context.
    pub fn tls(mut self, ctx: Arc<TlsContext>) -> Builder {
        self.tls = Some(ctx);
        self
    }

    /// Register a handler for `Upgrade: <protocol>` handshakes.
    pub fn upgrade(
        mut self,
        protocol: impl Into<String>,
        handler: impl Fn(Request, Box<dyn Transport>) + Send + Sync + 'static,
    ) -> Builder {
        self.upgrades
            .insert(protocol.into().to_ascii_lowercase(), Arc::new(handler));
        self
    }

    /// Cap how long a connection may sit idle between requests.
    pub fn io_block_time(mut self, seconds: u32) -> Builder {
        self.io_block_time = seconds;
        self
    }

    /// Bind a listener on `port` and serve.
    pub fn serve(
        self,
        port: u16,
        backlog: i32,
        handler: impl Fn(&Request, &SocketAddrV6) -> Response + Send + Sync + 'static,
    ) -> Result<HttpServer> {
        let conn = self.into_conn_handler(Arc::new(handler));
        Ok(HttpServer {
            tcp: TcpServer::bind(port, backlog, conn)?,
        })
    }

    /// Serve on an inherited, already-listening fd (supervisor path).
    pub fn serve_fd(
        self,
        fd: RawFd,
        handler: impl Fn(&Request, &SocketAddrV6) -> Response + Send + Sync + 'static,
    ) -> Result<HttpServer> {
        let conn = self.into_conn_handler(Arc::new(handler));
        Ok(HttpServer {
            tcp: TcpServer::from_fd(fd, conn)?,
        })
    }

    fn into_conn_handler(
        self,
        handler: RequestHandler,
    ) -> impl Fn(Pipe, SocketAddrV6) + Send + Sync + 'static {
        let Builder {
            config,
            tls,
            upgrades,
            io_block_time,
        } = self;
        let upgrades = Arc::new(upgrades);

        move |pipe: Pipe, peer: SocketAddrV6| {
            pipe.limit_io_block_time(io_block_time);
            let transport: Box<dyn Transport> = match &tls {
                Some(ctx) => match TlsPipe::server(pipe, ctx) {
                    Ok(t) => Box::new(t),
                    Err(e) => {
                        log::debug!("tls accept from {} failed: {}", peer, e);
                        return;
                    }
                },
                None => Box::new(pipe),
            };
            connection_loop(transport, peer, &config, &handler, &upgrades);
        }
    }
}

fn connection_loop(
    mut transport: Box<dyn Transport>,
    peer: SocketAddrV6,
    config: &HttpConfig,
    handler: &RequestHandler,
    upgrades: &FxHashMap<String, UpgradeHandler>,
) {
    let mut buf = Vec::new();
    loop {
        let req = match read_request(transport.as_mut(), &mut buf, config) {
            Ok(Some(req)) => req,
            Ok(None) => return,
            Err(e) => {
                // Peers closing mid-request are routine; log quietly.
                log::debug!("connection from {} ended: {}", peer, e);
                return;
            }
        };

        if let Some(protocol) = req.upgrade() {
            match upgrades.get(&protocol.to_ascii_lowercase()) {
                Some(upgrade) => {
                    let upgrade = Arc::clone(upgrade);
                    (upgrade.as_ref())(req, transport);
                }
                None => {
                    let resp = Response::text(501, "unsupported upgrade protocol");
                    let _ = write_response(transport.as_mut(), &resp, false);
                }
            }
            return;
        }

        let keep = req.keep_alive();
        let resp = (handler.as_ref())(&req, &peer);
        if let Err(e) = write_response(transport.as_mut(), &resp, keep) {
            log::debug!("writing response to {} failed: {}", peer, e);
            return;
        }
        if !keep {
            return;
        }
    }
}

impl HttpServer {
    pub fn stop(&self) {
        self.tcp.stop();
    }

    pub fn local_port(&self) -> Result<u16> {
        self.tcp.local_port()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::DEFAULT_BACKLOG;
    use crate::runtime::test_runtime;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    fn start_server() -> HttpServer {
        let rt = test_runtime();
        rt.block_on(|| {
            Builder::new()
                .upgrade("echo-bytes", |_req, mut transport| {
                    // Minimal upgrade: acknowledge, then echo one frame.
                    transport
                        .write_all(b"HTTP/1.1 101 Switching Protocols\r\n\r\n")
                        .unwrap();
                    let mut buf = [0u8; 64];
                    if let Ok(n) = transport.read(&mut buf) {
                        let _ = transport.write_all(&buf[..n]);
                    }
                })
                .serve(0, DEFAULT_BACKLOG, |req, _peer| match req.path() {
                    "/hello" => Response::text(200, "hello from strand"),
                    "/echo" => Response::text(200, String::from_utf8_lossy(&req.body).to_string()),
                    _ => Response::text(404, "not found"),
                })
                .unwrap()
        })
    }

    fn read_full_response(s: &mut TcpStream) -> String {
        let mut out = Vec::new();
        let mut chunk = [0u8; 1024];
        s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        loop {
            match s.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    out.extend_from_slice(&chunk[..n]);
                    // Stop once a framed body is fully present.
                    if let Some(pos) = out.windows(4).position(|w| w == b"\r\n\r\n") {
                        let head = String::from_utf8_lossy(&out[..pos]).to_string();
                        if let Some(line) = head
                            .lines()
                            .find(|l| l.to_ascii_lowercase().starts_with("content-length"))
                        {
                            let len: usize =
                                line.split(':').nth(1).unwrap().trim().parse().unwrap();
                            if out.len() >= pos + 4 + len {
                                break;
                            }
                        }
                    }
                }
            }
        }
        String::from_utf8_lossy(&out).to_string()
    }

    #[test]
    fn test_get_and_keep_alive() {
        let server = start_server();
        let port = server.local_port().unwrap();
        let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();

        s.write_all(b"GET /hello HTTP/1.1\r\nHost: t\r\n\r\n").unwrap();
        let first = read_full_response(&mut s);
        assert!(first.starts_with("HTTP/1.1 200 OK"));
        assert!(first.ends_with("hello from strand"));

        // Same socket again: keep-alive held.
        s.write_all(b"GET /missing HTTP/1.1\r\nHost: t\r\n\r\n").unwrap();
        let second = read_full_response(&mut s);
        assert!(second.starts_with("HTTP/1.1 404"));

        server.stop();
    }

    #[test]
    fn test_post_body_dispatch() {
        let server = start_server();
        let port = server.local_port().unwrap();
        let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();
        s.write_all(b"POST /echo HTTP/1.1\r\nHost: t\r\nContent-Length: 9\r\n\r\npayload-x")
            .unwrap();
        let resp = read_full_response(&mut s);
        assert!(resp.ends_with("payload-x"));
        server.stop();
    }

    #[test]
    fn test_connection_close_honored() {
        let server = start_server();
        let port = server.local_port().unwrap();
        let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();
        s.write_all(b"GET /hello HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n")
            .unwrap();
        let resp = read_full_response(&mut s);
        assert!(resp.contains("Connection: close"));
        // Server closes; the next read sees EOF.
        let mut probe = [0u8; 1];
        s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(s.read(&mut probe).unwrap_or(0), 0);
        server.stop();
    }

    #[test]
    fn test_upgrade_dispatch() {
        let server = start_server();
        let port = server.local_port().unwrap();
        let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();
        s.write_all(
            b"GET /sock HTTP/1.1\r\nHost: t\r\nConnection: Upgrade\r\nUpgrade: echo-bytes\r\n\r\n",
        )
        .unwrap();
        s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 256];
        let n = s.read(&mut buf).unwrap();
        assert!(std::str::from_utf8(&buf[..n]).unwrap().starts_with("HTTP/1.1 101"));
        s.write_all(b"raw-frame").unwrap();
        let mut echoed = [0u8; 9];
        s.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"raw-frame");
        server.stop();
    }

    #[test]
    fn test_unknown_upgrade_is_rejected() {
        let server = start_server();
        let port = server.local_port().unwrap();
        let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();
        s.write_all(
            b"GET / HTTP/1.1\r\nHost: t\r\nConnection: Upgrade\r\nUpgrade: nonsense\r\n\r\n",
        )
        .unwrap();
        let resp = read_full_response(&mut s);
        assert!(resp.starts_with("HTTP/1.1 501"));
        server.stop();
    }
}
