//! Frame codec trait and the built-in framing schemes.
//!
//! Codecs are stateless: given the same prefix of buffered bytes they always
//! report the same result, so the caller may retry a decode after appending
//! more data without any reset step.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// Default maximum frame size (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Location of one complete frame inside an accumulation buffer.
///
/// Offsets are relative to the start of the buffer the codec was shown and
/// are only valid until the consumed bytes are shifted out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Total number of wire bytes consumed by this frame
    pub wire_len: usize,
    /// Offset of the payload within the inspected buffer
    pub payload_offset: usize,
    /// Payload length in bytes
    pub payload_len: usize,
}

/// A wire framing scheme.
pub trait FrameCodec: Send + Sync {
    /// Try to locate one complete frame at the start of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, and an error only when
    /// the stream can never yield a valid frame again (the session treats
    /// that as fatal).
    fn try_decode(&self, buf: &[u8]) -> Result<Option<DecodedFrame>, WireError>;

    /// Encode an outbound payload into a complete wire frame.
    fn encode(&self, payload: &[u8]) -> Result<Bytes, WireError>;
}

/// Length-prefixed framing: a big-endian `u32` byte count followed by the
/// payload.
#[derive(Debug, Clone)]
pub struct LengthPrefixCodec {
    max_frame_size: usize,
}

impl LengthPrefixCodec {
    /// Create a codec with the given payload size limit.
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for LengthPrefixCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec for LengthPrefixCodec {
    fn try_decode(&self, buf: &[u8]) -> Result<Option<DecodedFrame>, WireError> {
        // Need at least the length prefix
        if buf.len() < 4 {
            return Ok(None);
        }

        let payload_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if payload_len > self.max_frame_size {
            return Err(WireError::Size(payload_len));
        }

        if buf.len() < 4 + payload_len {
            return Ok(None);
        }

        Ok(Some(DecodedFrame {
            wire_len: 4 + payload_len,
            payload_offset: 4,
            payload_len,
        }))
    }

    fn encode(&self, payload: &[u8]) -> Result<Bytes, WireError> {
        if payload.len() > self.max_frame_size {
            return Err(WireError::Size(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }
}

/// Delimiter framing: each frame is terminated by a single delimiter byte
/// that may not occur inside the payload.
#[derive(Debug, Clone)]
pub struct DelimitedCodec {
    delimiter: u8,
    max_frame_size: usize,
}

impl DelimitedCodec {
    /// Create a codec splitting frames on `delimiter`.
    pub fn new(delimiter: u8, max_frame_size: usize) -> Self {
        Self {
            delimiter,
            max_frame_size,
        }
    }

    /// Newline-delimited framing with the default size limit.
    pub fn lines() -> Self {
        Self::new(b'\n', DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec for DelimitedCodec {
    fn try_decode(&self, buf: &[u8]) -> Result<Option<DecodedFrame>, WireError> {
        match buf.iter().position(|&b| b == self.delimiter) {
            Some(pos) => {
                if pos > self.max_frame_size {
                    return Err(WireError::Size(pos));
                }
                Ok(Some(DecodedFrame {
                    wire_len: pos + 1,
                    payload_offset: 0,
                    payload_len: pos,
                }))
            }
            // A runaway line without a delimiter can never complete
            None if buf.len() > self.max_frame_size => Err(WireError::Size(buf.len())),
            None => Ok(None),
        }
    }

    fn encode(&self, payload: &[u8]) -> Result<Bytes, WireError> {
        if payload.len() > self.max_frame_size {
            return Err(WireError::Size(payload.len()));
        }
        if payload.contains(&self.delimiter) {
            return Err(WireError::Payload("payload contains the frame delimiter"));
        }

        let mut buf = BytesMut::with_capacity(payload.len() + 1);
        buf.put_slice(payload);
        buf.put_u8(self.delimiter);
        Ok(buf.freeze())
    }
}
