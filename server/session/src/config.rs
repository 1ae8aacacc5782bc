//! Configuration consumed by sessions and the accepting server.
//!
//! A single [`EngineConfig`] is shared read-only by every session for its
//! lifetime; nothing here changes after the server starts.

use std::path::PathBuf;
use std::time::Duration;

/// Engine-wide session configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of the receive scratch buffer and the initial accumulation
    /// buffer, also applied to the socket as SO_RCVBUF
    pub recv_buffer_size: usize,
    /// Socket send buffer size (SO_SNDBUF)
    pub send_buffer_size: usize,
    /// Upper bound for the transport-security handshake during `start`
    pub connect_timeout: Duration,
    /// Close the session when no bytes arrive for this long
    pub recv_timeout: Option<Duration>,
    /// Upper bound for a single outbound write
    pub send_timeout: Option<Duration>,
    /// Disable Nagle's algorithm on accepted sockets
    pub no_delay: bool,
    /// SO_LINGER duration, if any
    pub linger: Option<Duration>,
    /// Buffers kept idle in the pool before excess slabs are dropped
    pub max_idle_buffers: usize,
    /// Transport security; `None` leaves the byte stream in the clear
    pub tls: Option<TlsSettings>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 8 * 1024,
            send_buffer_size: 8 * 1024,
            connect_timeout: Duration::from_secs(10),
            recv_timeout: None,
            send_timeout: Some(Duration::from_secs(30)),
            no_delay: true,
            linger: None,
            max_idle_buffers: 64,
            tls: None,
        }
    }
}

/// TLS protocol versions the server may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// The matching rustls protocol version.
    pub fn as_rustls(self) -> &'static rustls::SupportedProtocolVersion {
        match self {
            TlsVersion::Tls12 => &rustls::version::TLS12,
            TlsVersion::Tls13 => &rustls::version::TLS13,
        }
    }
}

/// Server-side TLS policy.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// Server certificate chain (PEM)
    pub cert_file: PathBuf,
    /// Server private key (PEM)
    pub key_file: PathBuf,
    /// CA bundle used to validate client certificates (PEM)
    pub ca_file: Option<PathBuf>,
    /// Certificate revocation list (PEM), honored with `check_revocation`
    pub crl_file: Option<PathBuf>,
    /// Refuse clients that present no certificate
    pub require_client_cert: bool,
    /// Protocol versions to enable; empty means all rustls supports
    pub protocols: Vec<TlsVersion>,
    /// Enforce the configured revocation list during client validation
    pub check_revocation: bool,
    /// Accept client certificates even when validation reports an error
    /// (the bypass is logged)
    pub allow_invalid_certs: bool,
}

impl TlsSettings {
    /// Settings for a server identity with no client-certificate policy.
    pub fn new(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            ca_file: None,
            crl_file: None,
            require_client_cert: false,
            protocols: Vec::new(),
            check_revocation: false,
            allow_invalid_certs: false,
        }
    }
}
