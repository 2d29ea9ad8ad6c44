//! TLV tag byte.
//!
//! ```text
//!   7      6      5..0
//! +------+-------+-------------+
//! | node | slice | sequence id |
//! +------+-------+-------------+
//! ```
//!
//! Bit 6 only carries the slice meaning on node tags. On primitive tags the
//! low seven bits are the caller's raw key (application data tags use all of
//! `0x00..=0x7F`).

/// One-byte packet tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u8);

impl Tag {
    /// Packet contains nested packets.
    pub const NODE_BIT: u8 = 0x80;
    /// Node packet is a homogeneous sequence.
    pub const SLICE_BIT: u8 = 0x40;
    /// Sequence id mask.
    pub const SEQ_ID_MASK: u8 = 0x3F;

    /// Primitive tag; the node bit is cleared.
    pub fn primitive(raw: u8) -> Self {
        Self(raw & !Self::NODE_BIT)
    }

    /// Node tag with the given sequence id.
    pub fn node(seq_id: u8, slice: bool) -> Self {
        let mut raw = Self::NODE_BIT | (seq_id & Self::SEQ_ID_MASK);
        if slice {
            raw |= Self::SLICE_BIT;
        }
        Self(raw)
    }

    pub fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u8 {
        self.0
    }

    pub fn is_node(&self) -> bool {
        self.0 & Self::NODE_BIT != 0
    }

    pub fn is_slice(&self) -> bool {
        self.is_node() && self.0 & Self::SLICE_BIT != 0
    }

    pub fn seq_id(&self) -> u8 {
        self.0 & Self::SEQ_ID_MASK
    }
}

impl From<u8> for Tag {
    fn from(raw: u8) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}
