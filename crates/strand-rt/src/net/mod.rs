//! TCP plumbing on top of the pipe layer: task-blocking connect and the
//! accepting server.
//!
//! All sockets are created `SOCK_NONBLOCK | SOCK_CLOEXEC`; listening
//! sockets are IPv6 dual-stack, and accepted/connected sockets get
//! `TCP_NODELAY`. IPv4 peers appear in v4-mapped IPv6 form throughout.

mod client;
mod server;

pub use client::{connect_addr, connect_host, CONNECT_DEADLINE_SECS};
pub use server::{TcpServer, DEFAULT_BACKLOG};
