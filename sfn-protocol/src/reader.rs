//! Frame re-assembly from a byte stream.
//!
//! Frames are length-delimited by their TLV header, so the reader buffers
//! until one complete packet is present, hands exactly those bytes to the
//! frame parser, and keeps any surplus for the next call. A frame may span
//! many transport reads and one read may carry many frames.

use crate::error::ProtocolError;
use crate::frame::{parse_frame, Frame};
use crate::MAX_FRAME_SIZE;
use bytes::BytesMut;
use sfn_codec::peek_packet_len;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read buffer reserve per transport read (3 KiB).
pub const READ_CHUNK_SIZE: usize = 3 * 1024;

/// Reads frames from an async byte stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Reads the next frame.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly between frames. An
    /// error for which [`ProtocolError::is_fatal`] is false has consumed only
    /// the offending frame; the caller may keep reading.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            if let Some(chunk) = self.take_packet()? {
                return parse_frame(&chunk).map(Some);
            }

            self.buffer.reserve(READ_CHUNK_SIZE);
            let n = self.inner.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::UnexpectedEof);
            }
        }
    }

    /// Splits off one complete packet if the buffer holds it.
    fn take_packet(&mut self) -> Result<Option<BytesMut>, ProtocolError> {
        let total = match peek_packet_len(&self.buffer) {
            Ok(Some(total)) => total,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.buffer.clear();
                return Err(ProtocolError::CorruptStream(e));
            }
        };
        if total > self.max_frame_size {
            self.buffer.clear();
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                max: self.max_frame_size,
            });
        }
        if self.buffer.len() < total {
            return Ok(None);
        }
        Ok(Some(self.buffer.split_to(total)))
    }
}
