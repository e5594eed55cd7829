//! Runtime error taxonomy.
//!
//! Errors are classified by kind rather than by source module:
//!
//! - [`RtError::Io`]: transport failure -- remote hangup, a failed
//!   read/write, a refused connect. Retryable by the endpoint cluster.
//! - [`RtError::Timeout`]: a per-pipe I/O deadline expired. Deliberately a
//!   distinct kind so callers can tell a dead peer from a slow one; not
//!   retried by the cluster.
//! - [`RtError::Resolve`]: DNS failure (no such host or transient resolver
//!   error). Retryable.
//! - [`RtError::Tls`]: TLS protocol failure under an otherwise healthy
//!   transport. Treated like an I/O error by the cluster.
//! - [`RtError::Setup`]: programmer or OS-resource error during
//!   configuration (bad fd, failed bind, duplicated init). Never retried.
//!
//! Errors cross the rustls boundary as `std::io::Error`; the conversions
//! below preserve the Io/Timeout distinction in both directions.

use std::io;

use thiserror::Error;

// ---------------------------------------------------------------------------
// RtError
// ---------------------------------------------------------------------------

/// Error type for all runtime operations.
#[derive(Debug, Error)]
pub enum RtError {
    /// Transport-level I/O failure (hangup, reset, refused connect).
    #[error("i/o error: {0}")]
    Io(String),

    /// A per-pipe max-block deadline expired while parked on I/O.
    #[error("i/o timeout: {0}")]
    Timeout(String),

    /// DNS resolution failed.
    #[error("dns resolution failed: {0}")]
    Resolve(String),

    /// TLS handshake or record-layer failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// Configuration or OS-resource failure; fatal to the operation.
    #[error("setup error: {0}")]
    Setup(String),
}

impl RtError {
    /// Build an I/O error from the current `errno`, prefixed with context.
    pub fn last_os(context: &str) -> Self {
        RtError::Io(format!("{}: {}", context, io::Error::last_os_error()))
    }

    /// Build a setup error from the current `errno`, prefixed with context.
    pub fn last_os_setup(context: &str) -> Self {
        RtError::Setup(format!("{}: {}", context, io::Error::last_os_error()))
    }

    /// Whether the endpoint-cluster retry wrapper should retry after this
    /// error. Timeouts are surfaced directly: the peer is reachable but
    /// slow, and hammering it again will not help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RtError::Io(_) | RtError::Resolve(_) | RtError::Tls(_)
        )
    }
}

impl From<io::Error> for RtError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => RtError::Timeout(e.to_string()),
            _ => RtError::Io(e.to_string()),
        }
    }
}

impl From<RtError> for io::Error {
    fn from(e: RtError) -> Self {
        let kind = match e {
            RtError::Timeout(_) => io::ErrorKind::TimedOut,
            RtError::Io(_) => io::ErrorKind::Other,
            RtError::Resolve(_) => io::ErrorKind::NotFound,
            RtError::Tls(_) => io::ErrorKind::InvalidData,
            RtError::Setup(_) => io::ErrorKind::InvalidInput,
        };
        io::Error::new(kind, e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RtError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        assert!(RtError::Io("x".into()).is_retryable());
        assert!(RtError::Resolve("x".into()).is_retryable());
        assert!(RtError::Tls("x".into()).is_retryable());
        assert!(!RtError::Timeout("x".into()).is_retryable());
        assert!(!RtError::Setup("x".into()).is_retryable());
    }

    #[test]
    fn test_io_roundtrip_preserves_timeout_kind() {
        let rt = RtError::Timeout("deadline".into());
        let io: io::Error = rt.into();
        assert_eq!(io.kind(), io::ErrorKind::TimedOut);
        let back: RtError = io.into();
        assert!(matches!(back, RtError::Timeout(_)));
    }

    #[test]
    fn test_generic_io_error_maps_to_io_kind() {
        let io = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        let rt: RtError = io.into();
        assert!(matches!(rt, RtError::Io(_)));
        assert!(rt.is_retryable());
    }
}
