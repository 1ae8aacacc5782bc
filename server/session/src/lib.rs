//! Session engine for framed TCP services.
//!
//! Each accepted connection becomes a [`Session`] that negotiates an
//! optional TLS layer, reassembles the inbound byte stream into frames with
//! a pluggable [`FrameCodec`](keel_wire::FrameCodec), and delivers them to a
//! [`SessionHandler`]. The [`Server`] runs the accept loop and tracks the
//! live sessions.
//!
//! Ordering guarantees: frames are delivered in stream order per session,
//! and the disconnect notification fires exactly once, after the session's
//! pooled buffers have been returned.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod handler;
pub mod server;
pub mod session;
pub mod transport;

mod deflector;

pub use config::{EngineConfig, TlsSettings, TlsVersion};
pub use error::SessionError;
pub use handler::SessionHandler;
pub use server::Server;
pub use session::{Session, SessionId};
pub use transport::IoStream;
