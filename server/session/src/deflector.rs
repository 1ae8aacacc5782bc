//! Sliding-window reassembly of the inbound byte stream.
//!
//! Raw reads arrive in arbitrary chunks that never have to line up with
//! frame boundaries. The deflector accumulates them in a pooled buffer,
//! lets the codec carve complete frames off the front, and compacts what
//! remains for the next read.

use keel_buffer::{BufferPool, PooledBuf};
use keel_wire::{FrameCodec, WireError};

/// Growable accumulation buffer with a `[0, valid)` data window.
pub(crate) struct Deflector {
    buf: PooledBuf,
    valid: usize,
}

impl Deflector {
    pub(crate) fn new(buf: PooledBuf) -> Self {
        Self { buf, valid: 0 }
    }

    /// Bytes received but not yet consumed into a frame.
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.buf[..self.valid]
    }

    #[cfg(test)]
    pub(crate) fn valid(&self) -> usize {
        self.valid
    }

    /// Append freshly received bytes, growing the buffer when the remaining
    /// capacity is insufficient.
    ///
    /// Growth swaps in a larger pooled buffer, preserves the unconsumed
    /// prefix byte-for-byte and returns the outgrown buffer to the pool.
    pub(crate) fn append(&mut self, incoming: &[u8], pool: &BufferPool) {
        let needed = self.valid + incoming.len();
        if needed > self.buf.capacity() {
            let mut bigger = pool.borrow_at_least(needed);
            bigger[..self.valid].copy_from_slice(&self.buf[..self.valid]);
            let outgrown = std::mem::replace(&mut self.buf, bigger);
            pool.give_back(outgrown);
        }
        self.buf[self.valid..needed].copy_from_slice(incoming);
        self.valid = needed;
    }

    /// Discard `consumed` bytes off the front, moving the tail down.
    /// Consuming more than is buffered empties the window.
    pub(crate) fn shift(&mut self, consumed: usize) {
        let consumed = consumed.min(self.valid);
        self.buf.as_mut_slice().copy_within(consumed..self.valid, 0);
        self.valid -= consumed;
    }

    /// Decode and hand off every complete frame currently buffered.
    ///
    /// The payload slice passed to `sink` is only valid for the duration of
    /// the call; the frame's wire bytes are shifted out right after.
    /// Returns the number of frames drained.
    ///
    /// A decoded frame must lie inside the buffered window: a codec
    /// reporting a zero-length frame, a frame beyond `valid`, or a payload
    /// outside its own wire bytes gets the stream treated as malformed
    /// rather than panicking on an out-of-range slice.
    pub(crate) fn drain(
        &mut self,
        codec: &dyn FrameCodec,
        mut sink: impl FnMut(&[u8]),
    ) -> Result<usize, WireError> {
        let mut drained = 0;
        while let Some(frame) = codec.try_decode(self.bytes())? {
            let payload_end = frame.payload_offset.saturating_add(frame.payload_len);
            if frame.wire_len == 0 || frame.wire_len > self.valid || payload_end > frame.wire_len {
                return Err(WireError::Malformed);
            }
            sink(&self.bytes()[frame.payload_offset..payload_end]);
            self.shift(frame.wire_len);
            drained += 1;
        }
        Ok(drained)
    }

    /// Return the accumulation buffer to the pool.
    pub(crate) fn release(self, pool: &BufferPool) {
        pool.give_back(self.buf);
    }
}
