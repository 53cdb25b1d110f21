//! Length prefix/suffix framer
//!
//! Every record travels as `[len:u32 LE][payload:len][len:u32 LE]`. The trailing
//! copy of the length lets a reader walk a chunk backwards and resynchronise.
//! Input can arrive in pieces of any size; complete frames are handed to the
//! caller in order as soon as their suffix is seen.

use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix (and of the suffix)
pub const LENGTH_SIZE: usize = 4;

/// Bytes added around every payload
pub const FRAME_OVERHEAD: usize = 2 * LENGTH_SIZE;

/// Incremental length-prefix-suffix framer
#[derive(Debug)]
pub struct LengthPrefixSuffixFramer {
    max_frame_size: usize,
    buffer: BytesMut,
}

impl LengthPrefixSuffixFramer {
    /// Create a framer rejecting payloads larger than `max_frame_size`
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            buffer: BytesMut::new(),
        }
    }

    /// Largest payload this framer accepts
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Frame a payload for the wire
    pub fn frame(payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(payload.len() + FRAME_OVERHEAD);
        Self::frame_into(payload, &mut buf);
        buf.freeze()
    }

    /// Append a framed payload to `buf`
    pub fn frame_into(payload: &[u8], buf: &mut BytesMut) {
        let len = payload.len() as u32;
        buf.reserve(payload.len() + FRAME_OVERHEAD);
        buf.put_u32_le(len);
        buf.put_slice(payload);
        buf.put_u32_le(len);
    }

    /// Feed bytes; `on_frame` runs once per completed payload.
    ///
    /// On error the partially buffered record is discarded.
    pub fn unframe_data<F>(&mut self, data: &[u8], mut on_frame: F) -> Result<()>
    where
        F: FnMut(Bytes) -> Result<()>,
    {
        self.buffer.extend_from_slice(data);

        loop {
            if self.buffer.len() < LENGTH_SIZE {
                return Ok(());
            }

            let len = u32::from_le_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;

            if len > self.max_frame_size {
                self.reset();
                return Err(Error::framing(format!(
                    "Frame size {} exceeds maximum {}",
                    len, self.max_frame_size
                )));
            }

            if self.buffer.len() < len + FRAME_OVERHEAD {
                return Ok(());
            }

            let suffix_at = LENGTH_SIZE + len;
            let suffix = u32::from_le_bytes([
                self.buffer[suffix_at],
                self.buffer[suffix_at + 1],
                self.buffer[suffix_at + 2],
                self.buffer[suffix_at + 3],
            ]) as usize;

            if suffix != len {
                self.reset();
                return Err(Error::framing(format!(
                    "Length suffix {} does not match prefix {}",
                    suffix, len
                )));
            }

            self.buffer.advance(LENGTH_SIZE);
            let payload = self.buffer.split_to(len).freeze();
            self.buffer.advance(LENGTH_SIZE);

            if let Err(e) = on_frame(payload) {
                self.reset();
                return Err(e);
            }
        }
    }

    /// Drop any partially received record
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Whether a partial record is buffered
    pub fn has_data(&self) -> bool {
        !self.buffer.is_empty()
    }
}
