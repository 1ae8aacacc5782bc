//! Wire framing error types.

use thiserror::Error;

/// Errors surfaced by frame codecs.
#[derive(Error, Debug)]
pub enum WireError {
    /// Frame size limit exceeded
    #[error("frame size limit exceeded: {0}")]
    Size(usize),

    /// Payload cannot be represented by this codec
    #[error("payload not encodable: {0}")]
    Payload(&'static str),

    /// Malformed frame structure
    #[error("malformed frame")]
    Malformed,
}
