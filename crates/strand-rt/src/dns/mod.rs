//! Asynchronous DNS: a blocking-resolver service thread plus a caching
//! layer with per-address cooldowns.
//!
//! Worker threads never block in the resolver. [`lookup`] owns a single OS
//! thread that drains a request channel and runs the system resolver;
//! results are delivered on freshly spawned tasks. [`cache`] sits on top
//! with a per-(host, port) state machine, round-robin address rotation, and
//! a periodic sweep of stale entries.
//!
//! All addresses are canonicalized to IPv6; IPv4 records come back in
//! v4-mapped form so comparisons are uniform.

pub mod cache;
pub mod lookup;
