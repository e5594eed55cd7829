//! Client-side request framing over any transport.
//!
//! Pairs with the endpoint cluster: `send_request` runs against whatever
//! pipe `with_connected_pipe` hands out, and the response's keep-alive
//! signal decides whether that pipe goes back into the idle pool.

use std::sync::Arc;

use super::parse::{read_response, HttpConfig, Response};
use crate::cluster::EndpointCluster;
use crate::error::Result;
use crate::pipe::Transport;

// ---------------------------------------------------------------------------
// ClientRequest
// ---------------------------------------------------------------------------

/// An outgoing request. `Host` and `Content-Length` are filled in at send
/// time; other headers ride along as given.
#[derive(Clone, Debug)]
pub struct ClientRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ClientRequest {
    pub fn get(path: impl Into<String>) -> ClientRequest {
        ClientRequest {
            method: "GET".to_string(),
            path: path.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn post(path: impl Into<String>, body: impl Into<Vec<u8>>) -> ClientRequest {
        ClientRequest {
            method: "POST".to_string(),
            path: path.into(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> ClientRequest {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Write `req` on the transport and read back one response.
pub fn send_request(
    t: &mut dyn Transport,
    req: &ClientRequest,
    host: &str,
    config: &HttpConfig,
) -> Result<Response> {
    let mut head = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", req.method, req.path, host);
    for (name, value) in &req.headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if !req.body.is_empty() || req.method == "POST" || req.method == "PUT" {
        head.push_str(&format!("Content-Length: {}\r\n", req.body.len()));
    }
    head.push_str("\r\n");

    t.write_all(head.as_bytes())?;
    t.write_all(&req.body)?;
    read_response(t, config)
}

/// Issue `req` through a cluster connection. The connection is returned to
/// the idle pool when the server kept the connection alive.
pub fn request_via(
    cluster: &Arc<EndpointCluster>,
    req: &ClientRequest,
    config: &HttpConfig,
) -> Result<Response> {
    let mut out = None;
    cluster.with_connected_pipe(|t| {
        let resp = send_request(t, req, cluster.host(), config)?;
        let reusable = resp
            .header("connection")
            .map(|v| !v.eq_ignore_ascii_case("close"))
            .unwrap_or(true);
        out = Some(resp);
        Ok(reusable)
    })?;
    out.ok_or_else(|| crate::error::RtError::Io("request produced no response".into()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
