//! Streaming HTTP/1.1 message framing.
//!
//! The parser fills a connection-scoped buffer from the transport until a
//! complete header block (`\r\n\r\n`) is present, then splits the request
//! line and headers and reads the Content-Length body. Leftover bytes stay
//! in the buffer for the next (pipelined) message. Header block and body
//! sizes are bounded by [`HttpConfig`].

use crate::error::{Result, RtError};
use crate::pipe::Transport;

// ---------------------------------------------------------------------------
// HttpConfig
// ---------------------------------------------------------------------------

/// Parser bounds.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    /// Maximum size of the request/status line plus all headers.
    pub max_header_bytes: usize,
    /// Maximum accepted Content-Length.
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            max_header_bytes: 8 * 1024,
            max_body_bytes: 1024 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A parsed request: method, target, headers, whole body.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub target: String,
    /// Minor version of HTTP/1.x.
    pub version_minor: u8,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// First value of a header, case-insensitive name match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Keep-alive per HTTP/1.1 defaults: on unless `Connection: close`;
    /// HTTP/1.0 requires an explicit keep-alive token.
    pub fn keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version_minor >= 1,
        }
    }

    /// The requested upgrade protocol, when this is an upgrade handshake.
    pub fn upgrade(&self) -> Option<&str> {
        let wants = self
            .header("connection")
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false);
        if wants {
            self.header("upgrade")
        } else {
            None
        }
    }

    /// Path portion of the target (before any query string).
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or(&self.target)
    }

    /// Query string, if present.
    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, q)| q)
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A response to be framed and written, or a parsed client-side response.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Response {
        Response {
            status,
            reason: reason_phrase(status).to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Response {
        let mut r = Response::new(status);
        r.headers
            .push(("Content-Type".to_string(), "text/plain".to_string()));
        r.body = body.into().into_bytes();
        r
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Response {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        411 => "Length Required",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        _ => "",
    }
}

// ---------------------------------------------------------------------------
// Wire reading
// ---------------------------------------------------------------------------

/// Read one request from the transport. `buf` carries bytes across calls on
/// the same connection. `Ok(None)` means the peer closed cleanly at a
/// message boundary.
pub fn read_request(
    t: &mut dyn Transport,
    buf: &mut Vec<u8>,
    config: &HttpConfig,
) -> Result<Option<Request>> {
    let header_end = match fill_until_headers(t, buf, config)? {
        Some(end) => end,
        None => return Ok(None),
    };

    let head: Vec<u8> = buf.drain(..header_end + 4).collect();
    let head = std::str::from_utf8(&head[..header_end])
        .map_err(|_| RtError::Io("request header is not valid ascii".into()))?;

    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split(' ');
    let method = parts
        .next()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| bad("missing method"))?
        .to_string();
    let target = parts.next().ok_or_else(|| bad("missing request target"))?.to_string();
    let version = parts.next().ok_or_else(|| bad("missing http version"))?;
    let version_minor = parse_version(version)?;

    let headers = parse_headers(lines)?;

    let mut req = Request {
        method,
        target,
        version_minor,
        headers,
        body: Vec::new(),
    };

    if req.header("transfer-encoding").is_some() {
        return Err(bad("transfer encodings are not supported"));
    }
    if let Some(len) = req.header("content-length") {
        let len: usize = len
            .trim()
            .parse()
            .map_err(|_| bad("unparseable content-length"))?;
        if len > config.max_body_bytes {
            return Err(bad("request body exceeds the configured limit"));
        }
        read_exact_buffered(t, buf, len)?;
        req.body = buf.drain(..len).collect();
    }

    Ok(Some(req))
}

/// Serialize and send a response. Content-Length is always emitted;
/// `Connection: close` is added when keep-alive is off.
pub fn write_response(t: &mut dyn Transport, resp: &Response, keep_alive: bool) -> Result<()> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        resp.status,
        if resp.reason.is_empty() {
            reason_phrase(resp.status)
        } else {
            &resp.reason
        }
    );
    for (name, value) in &resp.headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if resp.header("content-length").is_none() {
        head.push_str(&format!("Content-Length: {}\r\n", resp.body.len()));
    }
    if !keep_alive {
        head.push_str("Connection: close\r\n");
    }
    head.push_str("\r\n");

    t.write_all(head.as_bytes())?;
    t.write_all(&resp.body)
}

/// Read one response from the transport (client side). The body is framed
/// by Content-Length, or by connection close when the peer says so.
pub fn read_response(t: &mut dyn Transport, config: &HttpConfig) -> Result<Response> {
    let mut buf = Vec::new();
    let header_end = fill_until_headers(t, &mut buf, config)?
        .ok_or_else(|| RtError::Io("connection closed before response".into()))?;

    let head: Vec<u8> = buf.drain(..header_end + 4).collect();
    let head = std::str::from_utf8(&head[..header_end])
        .map_err(|_| RtError::Io("response header is not valid ascii".into()))?;

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or("");
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next().ok_or_else(|| bad("missing http version"))?;
    let status: u16 = parts
        .next()
        .ok_or_else(|| bad("missing status code"))?
        .parse()
        .map_err(|_| bad("unparseable status code"))?;
    let reason = parts.next().unwrap_or("").to_string();

    let headers = parse_headers(lines)?;
    let mut resp = Response {
        status,
        reason,
        headers,
        body: Vec::new(),
    };

    if let Some(len) = resp.header("content-length") {
        let len: usize = len
            .trim()
            .parse()
            .map_err(|_| bad("unparseable content-length"))?;
        if len > config.max_body_bytes {
            return Err(bad("response body exceeds the configured limit"));
        }
        read_exact_buffered(t, &mut buf, len)?;
        resp.body = buf.drain(..len).collect();
    } else if resp
        .header("connection")
        .map(|v| v.eq_ignore_ascii_case("close"))
        .unwrap_or(false)
    {
        // Close-delimited body: read until the peer hangs up.
        resp.body = buf.clone();
        let mut chunk = [0u8; 4096];
        loop {
            match t.read(&mut chunk) {
                Ok(n) => {
                    resp.body.extend_from_slice(&chunk[..n]);
                    if resp.body.len() > config.max_body_bytes {
                        return Err(bad("response body exceeds the configured limit"));
                    }
                }
                Err(RtError::Io(_)) => break,
                Err(e) => return Err(e),
            }
        }
    }

    Ok(resp)
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

fn bad(msg: &str) -> RtError {
    RtError::Io(format!("http parse error: {}", msg))
}

fn parse_version(version: &str) -> Result<u8> {
    match version {
        "HTTP/1.1" => Ok(1),
        "HTTP/1.0" => Ok(0),
        _ => Err(bad("unsupported http version")),
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| bad("malformed header line"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

/// Grow `buf` from the transport until it contains a full header block;
/// returns the offset of the `\r\n\r\n`. `Ok(None)` only when the peer
/// closed before any byte of this message arrived.
fn fill_until_headers(
    t: &mut dyn Transport,
    buf: &mut Vec<u8>,
    config: &HttpConfig,
) -> Result<Option<usize>> {
    loop {
        if let Some(end) = find_header_end(buf) {
            return Ok(Some(end));
        }
        if buf.len() > config.max_header_bytes {
            return Err(bad("header block exceeds the configured limit"));
        }
        let mut chunk = [0u8; 4096];
        match t.read(&mut chunk) {
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(RtError::Io(_)) if buf.is_empty() => return Ok(None),
            Err(e) => return Err(e),
        }
    }
}

fn read_exact_buffered(t: &mut dyn Transport, buf: &mut Vec<u8>, len: usize) -> Result<()> {
    let mut chunk = [0u8; 4096];
    while buf.len() < len {
        let n = t.read(&mut chunk)?;
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(())
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
