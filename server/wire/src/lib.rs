//! Pluggable frame codecs for the keel session engine.
//!
//! A codec turns the accumulated bytes of a TCP stream into discrete
//! application frames and encodes outbound payloads into wire bytes. The
//! session engine never interprets frame contents; everything protocol
//! specific lives behind the [`FrameCodec`] trait.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;

pub use codec::{DecodedFrame, DelimitedCodec, FrameCodec, LengthPrefixCodec};
pub use error::WireError;
