//! TLV packets.
//!
//! Every packet is `tag | length | value`, with the length P-encoded:
//!
//! ```text
//! +-----+-----------------+-------------------------------+
//! | tag | length (pvar)   | value                         |
//! +-----+-----------------+-------------------------------+
//!         primitive: raw bytes
//!         node:      child packet | child packet | ...
//! ```
//!
//! A node's length is always the sum of its children's encoded sizes.

use crate::error::CodecError;
use crate::tag::Tag;
use crate::varint::{
    decode_nvarint_i64, decode_pvarint_i64, encode_nvarint_i64, encode_pvarint_i64,
    size_of_pvarint_i64,
};
use crate::MAX_NESTING_DEPTH;
use bytes::{BufMut, Bytes, BytesMut};

/// Minimum encoded packet: tag plus a one-byte zero length.
pub const MIN_PACKET_SIZE: usize = 2;

/// Packet carrying an opaque value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimitivePacket {
    tag: Tag,
    value: Bytes,
}

impl PrimitivePacket {
    pub fn new(tag: u8, value: impl Into<Bytes>) -> Self {
        Self {
            tag: Tag::primitive(tag),
            value: value.into(),
        }
    }

    /// Primitive holding an N-encoded integer.
    pub fn from_nvarint_i64(tag: u8, value: i64) -> Self {
        let mut buf = BytesMut::new();
        encode_nvarint_i64(&mut buf, value);
        Self::new(tag, buf.freeze())
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn into_value(self) -> Bytes {
        self.value
    }

    /// Reads the value as an N-encoded integer.
    pub fn nvarint_i64(&self) -> Result<i64, CodecError> {
        decode_nvarint_i64(&self.value)
    }

    /// Decodes one primitive packet from the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let header = read_header(buf)?;
        if header.tag.is_node() {
            return Err(CodecError::NotAPrimitive(header.tag.raw()));
        }
        let value = Bytes::copy_from_slice(&buf[header.header_len..header.total_len()]);
        Ok((
            Self {
                tag: header.tag,
                value,
            },
            header.total_len(),
        ))
    }

    fn encoded_len(&self) -> usize {
        let len = self.value.len();
        1 + size_of_pvarint_i64(len as i64) + len
    }

    fn encode_to(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.tag.raw());
        encode_pvarint_i64(buf, self.value.len() as i64);
        buf.put_slice(&self.value);
    }
}

/// Packet whose value is a sequence of child packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePacket {
    tag: Tag,
    children: Vec<Packet>,
}

impl NodePacket {
    pub fn new(seq_id: u8) -> Self {
        Self::with_tag(Tag::node(seq_id, false))
    }

    /// Node representing a homogeneous sequence.
    pub fn new_slice(seq_id: u8) -> Self {
        Self::with_tag(Tag::node(seq_id, true))
    }

    pub fn with_tag(tag: Tag) -> Self {
        Self {
            tag: Tag::from_raw(tag.raw() | Tag::NODE_BIT),
            children: Vec::new(),
        }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn is_slice(&self) -> bool {
        self.tag.is_slice()
    }

    /// Appends a child; children encode in insertion order.
    pub fn push(&mut self, child: impl Into<Packet>) {
        self.children.push(child.into());
    }

    /// Builder form of [`push`](Self::push).
    pub fn with(mut self, child: impl Into<Packet>) -> Self {
        self.push(child);
        self
    }

    /// All children in wire order.
    pub fn children(&self) -> &[Packet] {
        &self.children
    }

    pub fn into_children(self) -> Vec<Packet> {
        self.children
    }

    /// Nested node children in wire order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodePacket> {
        self.children.iter().filter_map(Packet::as_node)
    }

    /// Nested primitive children in wire order.
    pub fn primitives(&self) -> impl Iterator<Item = &PrimitivePacket> {
        self.children.iter().filter_map(Packet::as_primitive)
    }

    /// First nested node with the given sequence id.
    pub fn node(&self, seq_id: u8) -> Option<&NodePacket> {
        let seq_id = seq_id & Tag::SEQ_ID_MASK;
        self.nodes().find(|n| n.tag.seq_id() == seq_id)
    }

    /// First nested primitive whose tag equals `tag` (node bit ignored).
    pub fn primitive(&self, tag: u8) -> Option<&PrimitivePacket> {
        let tag = Tag::primitive(tag);
        self.primitives().find(|p| p.tag == tag)
    }

    /// Decodes one node packet from the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        Self::decode_at_depth(buf, 0)
    }

    fn decode_at_depth(buf: &[u8], depth: usize) -> Result<(Self, usize), CodecError> {
        if depth >= MAX_NESTING_DEPTH {
            return Err(CodecError::TooDeep(MAX_NESTING_DEPTH));
        }
        let header = read_header(buf)?;
        if !header.tag.is_node() {
            return Err(CodecError::NotANode(header.tag.raw()));
        }

        let body = &buf[header.header_len..header.total_len()];
        let mut children = Vec::new();
        let mut offset = 0;
        while offset < body.len() {
            let (child, used) = Packet::decode_at_depth(&body[offset..], depth + 1)?;
            children.push(child);
            offset += used;
        }

        Ok((
            Self {
                tag: header.tag,
                children,
            },
            header.total_len(),
        ))
    }

    fn value_len(&self) -> usize {
        self.children.iter().map(Packet::encoded_len).sum()
    }

    fn encoded_len(&self) -> usize {
        let len = self.value_len();
        1 + size_of_pvarint_i64(len as i64) + len
    }

    fn encode_to(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.tag.raw());
        encode_pvarint_i64(buf, self.value_len() as i64);
        for child in &self.children {
            child.encode_to(buf);
        }
    }
}

/// A decoded TLV packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Primitive(PrimitivePacket),
    Node(NodePacket),
}

impl Packet {
    pub fn tag(&self) -> Tag {
        match self {
            Packet::Primitive(p) => p.tag,
            Packet::Node(n) => n.tag,
        }
    }

    pub fn as_node(&self) -> Option<&NodePacket> {
        match self {
            Packet::Node(n) => Some(n),
            Packet::Primitive(_) => None,
        }
    }

    pub fn as_primitive(&self) -> Option<&PrimitivePacket> {
        match self {
            Packet::Primitive(p) => Some(p),
            Packet::Node(_) => None,
        }
    }

    pub fn into_node(self) -> Result<NodePacket, CodecError> {
        match self {
            Packet::Node(n) => Ok(n),
            Packet::Primitive(p) => Err(CodecError::NotANode(p.tag.raw())),
        }
    }

    pub fn into_primitive(self) -> Result<PrimitivePacket, CodecError> {
        match self {
            Packet::Primitive(p) => Ok(p),
            Packet::Node(n) => Err(CodecError::NotAPrimitive(n.tag.raw())),
        }
    }

    /// Total encoded size including tag and length.
    pub fn encoded_len(&self) -> usize {
        match self {
            Packet::Primitive(p) => p.encoded_len(),
            Packet::Node(n) => n.encoded_len(),
        }
    }

    pub fn encode_to(&self, buf: &mut impl BufMut) {
        match self {
            Packet::Primitive(p) => p.encode_to(buf),
            Packet::Node(n) => n.encode_to(buf),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_to(&mut buf);
        buf.freeze()
    }

    /// Decodes one packet from the front of `buf`, returning it with the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        Self::decode_at_depth(buf, 0)
    }

    fn decode_at_depth(buf: &[u8], depth: usize) -> Result<(Self, usize), CodecError> {
        match buf.first() {
            Some(&raw) if Tag::from_raw(raw).is_node() => {
                let (node, used) = NodePacket::decode_at_depth(buf, depth)?;
                Ok((Packet::Node(node), used))
            }
            _ => {
                let (primitive, used) = PrimitivePacket::decode(buf)?;
                Ok((Packet::Primitive(primitive), used))
            }
        }
    }
}

impl From<PrimitivePacket> for Packet {
    fn from(p: PrimitivePacket) -> Self {
        Packet::Primitive(p)
    }
}

impl From<NodePacket> for Packet {
    fn from(n: NodePacket) -> Self {
        Packet::Node(n)
    }
}

/// Streams a node's children straight into a buffer without building a tree.
#[derive(Debug)]
pub struct NodeEncoder {
    tag: Tag,
    body: BytesMut,
}

impl NodeEncoder {
    pub fn new(seq_id: u8) -> Self {
        Self {
            tag: Tag::node(seq_id, false),
            body: BytesMut::new(),
        }
    }

    pub fn new_slice(seq_id: u8) -> Self {
        Self {
            tag: Tag::node(seq_id, true),
            body: BytesMut::new(),
        }
    }

    pub fn primitive(mut self, tag: u8, value: &[u8]) -> Self {
        self.body.put_u8(Tag::primitive(tag).raw());
        encode_pvarint_i64(&mut self.body, value.len() as i64);
        self.body.put_slice(value);
        self
    }

    pub fn packet(mut self, packet: &Packet) -> Self {
        packet.encode_to(&mut self.body);
        self
    }

    /// Appends an already encoded child packet.
    pub fn raw(mut self, encoded: &[u8]) -> Self {
        self.body.put_slice(encoded);
        self
    }

    pub fn finish(self) -> Bytes {
        let len = self.body.len();
        let mut buf = BytesMut::with_capacity(1 + size_of_pvarint_i64(len as i64) + len);
        buf.put_u8(self.tag.raw());
        encode_pvarint_i64(&mut buf, len as i64);
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

struct Header {
    tag: Tag,
    header_len: usize,
    value_len: usize,
}

impl Header {
    fn total_len(&self) -> usize {
        self.header_len + self.value_len
    }
}

fn read_header(buf: &[u8]) -> Result<Header, CodecError> {
    if buf.len() < MIN_PACKET_SIZE {
        return Err(CodecError::BufferTooSmall {
            needed: MIN_PACKET_SIZE,
            available: buf.len(),
        });
    }
    let tag = Tag::from_raw(buf[0]);
    let (len, used) = decode_pvarint_i64(&buf[1..])?;
    if len < 0 {
        return Err(CodecError::InvalidLength(len));
    }
    let header_len = 1 + used;
    let remaining = buf.len() - header_len;
    if len as u64 > remaining as u64 {
        return Err(CodecError::LengthExceedsBuffer {
            declared: len as usize,
            remaining,
        });
    }
    Ok(Header {
        tag,
        header_len,
        value_len: len as usize,
    })
}

/// Size of the next complete packet in `buf`.
///
/// Returns `Ok(None)` while the tag or length prefix is still incomplete.
/// The value bytes need not be present yet.
pub fn peek_packet_len(buf: &[u8]) -> Result<Option<usize>, CodecError> {
    if buf.len() < MIN_PACKET_SIZE {
        return Ok(None);
    }
    match decode_pvarint_i64(&buf[1..]) {
        Ok((len, _)) if len < 0 => Err(CodecError::InvalidLength(len)),
        Ok((len, used)) => usize::try_from(len)
            .ok()
            .and_then(|len| len.checked_add(1 + used))
            .map(Some)
            .ok_or(CodecError::Overflow),
        Err(CodecError::BufferInsufficient) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BHOJPUR: [u8; 7] = [0x62, 0x68, 0x6F, 0x6A, 0x70, 0x75, 0x72];

    #[test]
    fn test_primitive_literal() {
        let packet = Packet::from(PrimitivePacket::new(0x01, &b"bhojpur"[..]));
        let encoded = packet.encode();
        let mut expected = vec![0x01, 0x07];
        expected.extend_from_slice(&BHOJPUR);
        assert_eq!(encoded.as_ref(), expected.as_slice());
        assert_eq!(packet.encoded_len(), expected.len());
    }

    #[test]
    fn test_node_literal() {
        let node = NodePacket::new(0x01).with(PrimitivePacket::new(0x02, &b"bhojpur"[..]));
        let encoded = Packet::from(node.clone()).encode();

        let mut expected = vec![0x81, 0x09, 0x02, 0x07];
        expected.extend_from_slice(&BHOJPUR);
        assert_eq!(encoded.as_ref(), expected.as_slice());

        let (decoded, used) = NodePacket::decode(&encoded).unwrap();
        assert_eq!(used, expected.len());
        assert_eq!(decoded, node);
        assert_eq!(decoded.primitive(0x02).unwrap().value().as_ref(), b"bhojpur");
    }

    #[test]
    fn test_node_encoder_matches_tree() {
        let tree = NodePacket::new(0x3D)
            .with(PrimitivePacket::new(0x01, &b"a"[..]))
            .with(NodePacket::new(0x2F).with(PrimitivePacket::new(0x01, &b"tx"[..])));
        let streamed = NodeEncoder::new(0x3D)
            .primitive(0x01, b"a")
            .packet(&Packet::from(
                NodePacket::new(0x2F).with(PrimitivePacket::new(0x01, &b"tx"[..])),
            ))
            .finish();
        assert_eq!(Packet::from(tree).encode(), streamed);
    }

    #[test]
    fn test_nested_roundtrip_preserves_order() {
        let inner = NodePacket::new(0x05)
            .with(PrimitivePacket::new(0x10, &b"x"[..]))
            .with(PrimitivePacket::new(0x11, Bytes::new()));
        let outer = NodePacket::new(0x01)
            .with(PrimitivePacket::new(0x03, &b"first"[..]))
            .with(inner)
            .with(PrimitivePacket::new(0x02, &b"last"[..]));

        let encoded = Packet::from(outer.clone()).encode();
        let (decoded, used) = Packet::decode(&encoded).unwrap();
        assert_eq!(used, encoded.len());
        let decoded = decoded.into_node().unwrap();
        assert_eq!(decoded, outer);

        let tags: Vec<u8> = decoded.children().iter().map(|c| c.tag().raw()).collect();
        assert_eq!(tags, vec![0x03, 0x85, 0x02]);
        assert_eq!(decoded.nodes().count(), 1);
        assert_eq!(decoded.primitives().count(), 2);
        assert!(decoded.node(0x05).unwrap().primitive(0x11).unwrap().value().is_empty());
    }

    #[test]
    fn test_decode_too_small() {
        assert_eq!(
            Packet::decode(&[0x01]),
            Err(CodecError::BufferTooSmall {
                needed: 2,
                available: 1
            })
        );
    }

    #[test]
    fn test_decode_length_exceeds_buffer() {
        let result = Packet::decode(&[0x01, 0x05, 0xAA]);
        assert_eq!(
            result,
            Err(CodecError::LengthExceedsBuffer {
                declared: 5,
                remaining: 1
            })
        );
    }

    #[test]
    fn test_decode_negative_length() {
        assert_eq!(
            Packet::decode(&[0x01, 0x7F]),
            Err(CodecError::InvalidLength(-1))
        );
    }

    #[test]
    fn test_child_overrunning_parent_fails() {
        // Node declares 3 bytes; the child inside claims 4.
        let buf = [0x81, 0x03, 0x02, 0x04, 0xAA, 0xBB, 0xCC];
        assert!(matches!(
            Packet::decode(&buf),
            Err(CodecError::LengthExceedsBuffer { .. })
        ));
    }

    #[test]
    fn test_primitive_rejects_node() {
        let encoded = Packet::from(NodePacket::new(0x01)).encode();
        assert_eq!(
            PrimitivePacket::decode(&encoded),
            Err(CodecError::NotAPrimitive(0x81))
        );
        let encoded = Packet::from(PrimitivePacket::new(0x01, Bytes::new())).encode();
        assert_eq!(NodePacket::decode(&encoded), Err(CodecError::NotANode(0x01)));
    }

    #[test]
    fn test_depth_limit() {
        let mut packet = Packet::from(PrimitivePacket::new(0x01, &b"leaf"[..]));
        for _ in 0..MAX_NESTING_DEPTH + 1 {
            packet = NodePacket::new(0x01).with(packet).into();
        }
        let encoded = packet.encode();
        assert_eq!(
            Packet::decode(&encoded),
            Err(CodecError::TooDeep(MAX_NESTING_DEPTH))
        );
    }

    #[test]
    fn test_empty_node() {
        let encoded = Packet::from(NodePacket::new(0x3A)).encode();
        assert_eq!(encoded.as_ref(), &[0xBA, 0x00]);
        let (node, _) = NodePacket::decode(&encoded).unwrap();
        assert!(node.children().is_empty());
    }

    #[test]
    fn test_nvarint_primitive() {
        let p = PrimitivePacket::from_nvarint_i64(0x01, 255);
        assert_eq!(p.value().as_ref(), &[0x00, 0xFF]);
        assert_eq!(p.nvarint_i64().unwrap(), 255);
    }

    #[test]
    fn test_peek_packet_len() {
        assert_eq!(peek_packet_len(&[]).unwrap(), None);
        assert_eq!(peek_packet_len(&[0x81]).unwrap(), None);
        // Length continuation byte without its terminator.
        assert_eq!(peek_packet_len(&[0x81, 0x81]).unwrap(), None);
        assert_eq!(peek_packet_len(&[0x81, 0x09]).unwrap(), Some(11));
        assert_eq!(peek_packet_len(&[0x81, 0x81, 0x00]).unwrap(), Some(131));
        assert!(peek_packet_len(&[0x81, 0x7F]).is_err());
    }

    #[test]
    fn test_large_primitive_length_prefix() {
        let value = vec![0xAB; 300];
        let encoded = Packet::from(PrimitivePacket::new(0x07, value.clone())).encode();
        assert_eq!(&encoded[..3], &[0x07, 0x82, 0x2C]);
        let (decoded, used) = PrimitivePacket::decode(&encoded).unwrap();
        assert_eq!(used, 303);
        assert_eq!(decoded.value().as_ref(), value.as_slice());
    }
}
