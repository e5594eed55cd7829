//! strand: a fiber-based network service runtime.
//!
//! An M:N concurrency core -- cooperative stackful tasks multiplexed over a
//! pool of worker threads driven by one epoll instance -- plus the
//! wire-level building blocks that sit on top of it.
//!
//! ## Modules
//!
//! - [`reactor`]: the epoll owner -- worker threads, command pipe, timer
//!   fd, scheduled callbacks, pause/broadcast barriers
//! - [`task`]: stackful tasks (corosensei coroutines), spawn/join/sleep,
//!   task-aware Mutex/Condvar
//! - [`pipe`]: the non-blocking fd wrapper that looks blocking to tasks,
//!   plus the deadline sweeper
//! - [`tls`]: rustls sessions layered over pipes
//! - [`dns`]: non-blocking resolution -- lookup service thread + cache with
//!   cooldowns
//! - [`cluster`]: per-host connection pool with DNS refresh, round-robin,
//!   and retry/backoff
//! - [`net`]: task-blocking TCP connect and the accepting server
//! - [`http`]: HTTP/1.1 framing -- server loop, upgrades, client requests
//! - [`sup`]: the worker side of the hot-swap supervisor handshake
//!
//! ## A minimal server
//!
//! ```no_run
//! use strand_rt::http::{self, Response};
//! use strand_rt::runtime::{Runtime, RuntimeConfig};
//!
//! let rt = Runtime::init(RuntimeConfig::default()).unwrap();
//! let _server = rt.block_on(|| {
//!     http::server::Builder::new()
//!         .serve(8080, strand_rt::net::DEFAULT_BACKLOG, |req, _peer| {
//!             Response::text(200, format!("hello, {}", req.path()))
//!         })
//!         .unwrap()
//! });
//! rt.join();
//! ```

pub mod cluster;
pub mod dns;
pub mod error;
pub mod http;
pub mod net;
pub mod pipe;
pub mod reactor;
pub mod runtime;
pub mod sup;
pub mod task;
pub mod time;
pub mod tls;

pub use cluster::{ClusterConfig, EndpointCluster};
pub use error::{Result, RtError};
pub use pipe::{Pipe, SocketKind, Transport};
pub use reactor::{Reactor, TimerToken};
pub use runtime::{Runtime, RuntimeConfig};
pub use time::MonoTime;
pub use tls::{TlsContext, TlsPipe};
