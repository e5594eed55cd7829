//! HTTP/1.1 framing over the transport layer.
//!
//! Thin by design: enough parsing to dispatch requests and frame
//! responses, nothing more. The server runs a task per connection (the
//! accept path of [`crate::net::TcpServer`]), optionally TLS-wraps the
//! socket, and loops parse -> dispatch -> respond while keep-alive holds.
//! `Upgrade:` requests hand the connection to a named upgrade handler.
//! Bodies are read whole and bounded by [`parse::HttpConfig`]; there is no
//! body streaming.

pub mod client;
pub mod parse;
pub mod server;

pub use client::{send_request, ClientRequest};
pub use parse::{HttpConfig, Request, Response};
pub use server::HttpServer;
