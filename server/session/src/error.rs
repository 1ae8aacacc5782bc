//! Session engine error types.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the session engine.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The security handshake did not finish within the connect timeout.
    /// The session is already closed when this is returned.
    #[error("transport negotiation with {peer} timed out after {timeout:?}")]
    NegotiationTimeout {
        /// Remote endpoint of the failed handshake
        peer: SocketAddr,
        /// The configured connect timeout
        timeout: Duration,
    },

    /// The security handshake was rejected. The session is already closed
    /// when this is returned.
    #[error("transport negotiation with {peer} failed: {source}")]
    Negotiation {
        /// Remote endpoint of the failed handshake
        peer: SocketAddr,
        /// Underlying handshake failure
        #[source]
        source: std::io::Error,
    },

    /// The TLS identity or policy could not be loaded.
    #[error("invalid TLS configuration: {0}")]
    TlsConfig(String),

    /// Operation attempted on a session that is no longer connected.
    #[error("session is closed")]
    Closed,

    /// The frame codec rejected inbound or outbound data.
    #[error(transparent)]
    Wire(#[from] keel_wire::WireError),

    /// An I/O failure not recognized as a transport condition.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
