//! TLS over a pipe, with the handshake driven inline on the calling task.
//!
//! The rustls record machinery performs its transport I/O through the
//! pipe's `std::io` adapters, so every TLS read, write, handshake step, and
//! shutdown may park the task exactly like plain pipe I/O. Error categories
//! survive the layering: a pipe timeout resurfaces as [`RtError::Timeout`],
//! a transport failure as [`RtError::Io`], and a protocol failure as
//! [`RtError::Tls`].
//!
//! Certificate and hostname verification (SubjectAlternativeName first,
//! then Common Name, with leftmost-`*` wildcards) is rustls' built-in
//! verifier over the webpki-roots trust store; `TlsContext::client_no_verify`
//! disables it for development endpoints.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};

use crate::error::{Result, RtError};
use crate::pipe::{Pipe, Transport};

// ---------------------------------------------------------------------------
// TlsContext
// ---------------------------------------------------------------------------

/// Shared TLS configuration, reused across every connection of a cluster or
/// server.
pub struct TlsContext {
    client: Option<Arc<ClientConfig>>,
    server: Option<Arc<ServerConfig>>,
}

impl TlsContext {
    /// Client context verifying peers against the bundled webpki roots.
    pub fn client() -> Result<TlsContext> {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| RtError::Setup(format!("tls protocol versions: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(TlsContext {
            client: Some(Arc::new(config)),
            server: None,
        })
    }

    /// Client context that accepts any certificate. For talking to
    /// development endpoints with self-signed certs; never use against
    /// production peers.
    pub fn client_no_verify() -> Result<TlsContext> {
        let provider = rustls::crypto::ring::default_provider();
        let schemes = provider.signature_verification_algorithms;
        let config = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| RtError::Setup(format!("tls protocol versions: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(schemes)))
            .with_no_client_auth();
        Ok(TlsContext {
            client: Some(Arc::new(config)),
            server: None,
        })
    }

    /// Server context from PEM-encoded certificate chain and private key
    /// files.
    pub fn server(cert_pem: &std::path::Path, key_pem: &std::path::Path) -> Result<TlsContext> {
        let mut cert_reader = BufReader::new(
            File::open(cert_pem)
                .map_err(|e| RtError::Setup(format!("reading {}: {}", cert_pem.display(), e)))?,
        );
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| RtError::Setup(format!("parsing {}: {}", cert_pem.display(), e)))?;
        let mut key_reader = BufReader::new(
            File::open(key_pem)
                .map_err(|e| RtError::Setup(format!("reading {}: {}", key_pem.display(), e)))?,
        );
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| RtError::Setup(format!("parsing {}: {}", key_pem.display(), e)))?
            .ok_or_else(|| {
                RtError::Setup(format!("no private key found in {}", key_pem.display()))
            })?;
        let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| RtError::Setup(format!("tls protocol versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| RtError::Setup(format!("tls certificate: {}", e)))?;
        Ok(TlsContext {
            client: None,
            server: Some(Arc::new(config)),
        })
    }

    pub fn supports_client(&self) -> bool {
        self.client.is_some()
    }

    pub fn supports_server(&self) -> bool {
        self.server.is_some()
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("client", &self.client.is_some())
            .field("server", &self.server.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct AcceptAnyCert(WebPkiSupportedAlgorithms);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.supported_schemes()
    }
}

// ---------------------------------------------------------------------------
// TlsPipe
// ---------------------------------------------------------------------------

enum Session {
    Client(ClientConnection),
    Server(ServerConnection),
}

/// A TLS session layered over an owned [`Pipe`], presenting the same
/// [`Transport`] interface as the pipe itself.
pub struct TlsPipe {
    session: Session,
    pipe: Pipe,
}

impl TlsPipe {
    /// Client side: take ownership of a connected pipe and complete the
    /// handshake before returning. `host` drives SNI and peer verification.
    pub fn client(pipe: Pipe, ctx: &TlsContext, host: &str) -> Result<TlsPipe> {
        let config = ctx
            .client
            .as_ref()
            .ok_or_else(|| RtError::Setup("tls context has no client configuration".into()))?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| RtError::Setup(format!("invalid tls host name {}: {}", host, e)))?;
        let conn = ClientConnection::new(Arc::clone(config), server_name)
            .map_err(|e| RtError::Tls(format!("tls client setup: {}", e)))?;
        let mut tls = TlsPipe {
            session: Session::Client(conn),
            pipe,
        };
        tls.handshake()?;
        Ok(tls)
    }

    /// Server side: wrap an accepted pipe and complete the handshake.
    pub fn server(pipe: Pipe, ctx: &TlsContext) -> Result<TlsPipe> {
        let config = ctx
            .server
            .as_ref()
            .ok_or_else(|| RtError::Setup("tls context has no server configuration".into()))?;
        let conn = ServerConnection::new(Arc::clone(config))
            .map_err(|e| RtError::Tls(format!("tls server setup: {}", e)))?;
        let mut tls = TlsPipe {
            session: Session::Server(conn),
            pipe,
        };
        tls.handshake()?;
        Ok(tls)
    }

    fn handshake(&mut self) -> Result<()> {
        loop {
            let handshaking = match &self.session {
                Session::Client(c) => c.is_handshaking(),
                Session::Server(s) => s.is_handshaking(),
            };
            if !handshaking {
                return Ok(());
            }
            match &mut self.session {
                Session::Client(c) => c.complete_io(&mut self.pipe),
                Session::Server(s) => s.complete_io(&mut self.pipe),
            }
            .map_err(convert_tls_err)?;
        }
    }

    /// Send close_notify and flush it; the orderly TLS shutdown. Dropping a
    /// `TlsPipe` without calling this is quiet -- no further protocol
    /// traffic is attempted, because the owning task's context may already
    /// be gone.
    pub fn shutdown(&mut self) -> Result<()> {
        match &mut self.session {
            Session::Client(c) => {
                c.send_close_notify();
                while c.wants_write() {
                    c.write_tls(&mut self.pipe).map_err(convert_tls_err)?;
                }
            }
            Session::Server(s) => {
                s.send_close_notify();
                while s.wants_write() {
                    s.write_tls(&mut self.pipe).map_err(convert_tls_err)?;
                }
            }
        }
        Ok(())
    }

    /// The underlying transport pipe.
    pub fn get_ref(&self) -> &Pipe {
        &self.pipe
    }
}

/// Keep the transport error category across the TLS layer; wrap anything
/// the record layer itself produced as the Tls kind.
fn convert_tls_err(e: std::io::Error) -> RtError {
    if e.kind() == std::io::ErrorKind::TimedOut {
        return RtError::Timeout(e.to_string());
    }
    if let Some(inner) = e.get_ref() {
        if inner.is::<rustls::Error>() {
            return RtError::Tls(e.to_string());
        }
    }
    RtError::Io(e.to_string())
}

impl Transport for TlsPipe {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match &mut self.session {
            Session::Client(c) => rustls::Stream::new(c, &mut self.pipe).read(buf),
            Session::Server(s) => rustls::Stream::new(s, &mut self.pipe).read(buf),
        }
        .map_err(convert_tls_err)?;
        if n == 0 && !buf.is_empty() {
            return Err(RtError::Io("tls peer closed the connection".into()));
        }
        Ok(n)
    }

    fn write_some(&mut self, buf: &[u8]) -> Result<usize> {
        let n = match &mut self.session {
            Session::Client(c) => rustls::Stream::new(c, &mut self.pipe).write(buf),
            Session::Server(s) => rustls::Stream::new(s, &mut self.pipe).write(buf),
        }
        .map_err(convert_tls_err)?;
        // The rustls stream buffers plaintext; force the records out so the
        // blocking-pipe illusion holds for the caller.
        match &mut self.session {
            Session::Client(c) => rustls::Stream::new(c, &mut self.pipe).flush(),
            Session::Server(s) => rustls::Stream::new(s, &mut self.pipe).flush(),
        }
        .map_err(convert_tls_err)?;
        Ok(n)
    }

    fn limit_io_block_time(&self, seconds: u32) {
        self.pipe.limit_io_block_time(seconds);
    }

    fn set_hibernating(&self, hibernating: bool) {
        self.pipe.set_hibernating(hibernating);
    }

    fn is_hibernating(&self) -> bool {
        self.pipe.is_hibernating()
    }

    fn fd(&self) -> std::os::unix::io::RawFd {
        self.pipe.fd()
    }
}

impl std::fmt::Debug for TlsPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let side = match self.session {
            Session::Client(_) => "client",
            Session::Server(_) => "server",
        };
        f.debug_struct("TlsPipe")
            .field("side", &side)
            .field("fd", &self.pipe.fd())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_context_builds() {
        let ctx = TlsContext::client().unwrap();
        assert!(ctx.supports_client());
        assert!(!ctx.supports_server());
    }

    #[test]
    fn test_no_verify_context_builds() {
        let ctx = TlsContext::client_no_verify().unwrap();
        assert!(ctx.supports_client());
    }

    #[test]
    fn test_server_context_requires_files() {
        let missing = std::path::Path::new("/nonexistent/cert.pem");
        let err = TlsContext::server(missing, missing).unwrap_err();
        assert!(matches!(err, RtError::Setup(_)));
    }

    #[test]
    fn test_error_category_preserved() {
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline");
        assert!(matches!(convert_tls_err(timeout), RtError::Timeout(_)));

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(convert_tls_err(io), RtError::Io(_)));

        let tls = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            rustls::Error::HandshakeNotComplete,
        );
        assert!(matches!(convert_tls_err(tls), RtError::Tls(_)));
    }
}
