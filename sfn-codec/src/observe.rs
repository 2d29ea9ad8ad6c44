//! Pull-based packet filter.
//!
//! Bytes are fed in as they arrive; iterating yields each complete top-level
//! packet whose sequence id is in the observed set. Everything else is
//! skipped without being decoded.

use crate::error::CodecError;
use crate::packet::{peek_packet_len, Packet};
use crate::tag::Tag;
use bytes::{Buf, BytesMut};
use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct ObserveDecoder {
    buffer: BytesMut,
    observed: HashSet<u8>,
}

impl ObserveDecoder {
    pub fn new(observed: impl IntoIterator<Item = u8>) -> Self {
        Self {
            buffer: BytesMut::new(),
            observed: observed
                .into_iter()
                .map(|id| id & Tag::SEQ_ID_MASK)
                .collect(),
        }
    }

    /// Appends received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes held but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn observes(&self, seq_id: u8) -> bool {
        self.observed.contains(&(seq_id & Tag::SEQ_ID_MASK))
    }

    /// Returns the next observed packet, or `Ok(None)` once the buffer holds
    /// no further complete packet.
    ///
    /// A corrupt length prefix clears the buffer, since packet boundaries
    /// can no longer be found.
    pub fn next_match(&mut self) -> Result<Option<(u8, Packet)>, CodecError> {
        loop {
            let total = match peek_packet_len(&self.buffer) {
                Ok(Some(total)) => total,
                Ok(None) => return Ok(None),
                Err(e) => {
                    self.buffer.clear();
                    return Err(e);
                }
            };
            if self.buffer.len() < total {
                return Ok(None);
            }

            let seq_id = Tag::from_raw(self.buffer[0]).seq_id();
            if !self.observed.contains(&seq_id) {
                self.buffer.advance(total);
                continue;
            }

            let chunk = self.buffer.split_to(total);
            let (packet, _) = Packet::decode(&chunk)?;
            return Ok(Some((seq_id, packet)));
        }
    }
}

impl Iterator for ObserveDecoder {
    type Item = Result<(u8, Packet), CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_match().transpose()
    }
}
