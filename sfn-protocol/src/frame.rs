//! Application frames.
//!
//! Every frame is one top-level TLV node whose sequence id names its kind:
//!
//! ```text
//! Data       0x3F { Meta 0x2F { TransactionID 0x01 }, Payload 0x2E { <data tag>: carriage } }
//! Handshake  0x3D { Name 0x01, Type 0x02, ObserveDataTags 0x06,
//!                   AppID 0x03, AuthType 0x04, AuthPayload 0x05 }
//! Accepted   0x3A { }
//! Rejected   0x39 { }
//! ```
//!
//! On the wire the first byte of a frame is `0x80 | id`.

use crate::error::ProtocolError;
use crate::types::{AuthType, ClientType};
use bytes::Bytes;
use sfn_codec::{NodeEncoder, NodePacket, PrimitivePacket, Tag};

pub const DATA_FRAME_TAG: u8 = 0x3F;
pub const META_FRAME_TAG: u8 = 0x2F;
pub const PAYLOAD_FRAME_TAG: u8 = 0x2E;
pub const HANDSHAKE_FRAME_TAG: u8 = 0x3D;
pub const ACCEPTED_FRAME_TAG: u8 = 0x3A;
pub const REJECTED_FRAME_TAG: u8 = 0x39;

const TRANSACTION_ID_TAG: u8 = 0x01;

const HANDSHAKE_NAME_TAG: u8 = 0x01;
const HANDSHAKE_TYPE_TAG: u8 = 0x02;
const HANDSHAKE_APP_ID_TAG: u8 = 0x03;
const HANDSHAKE_AUTH_TYPE_TAG: u8 = 0x04;
const HANDSHAKE_AUTH_PAYLOAD_TAG: u8 = 0x05;
const HANDSHAKE_OBSERVE_TAGS_TAG: u8 = 0x06;

/// Largest application data tag. Bit 7 would mark a nested packet.
pub const MAX_DATA_TAG: u8 = 0x7F;

/// Kind of a top-level frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Handshake,
    Data,
    Accepted,
    Rejected,
}

impl FrameType {
    /// Leading wire byte of frames of this kind.
    pub fn leading_byte(self) -> u8 {
        let id = match self {
            FrameType::Handshake => HANDSHAKE_FRAME_TAG,
            FrameType::Data => DATA_FRAME_TAG,
            FrameType::Accepted => ACCEPTED_FRAME_TAG,
            FrameType::Rejected => REJECTED_FRAME_TAG,
        };
        Tag::node(id, false).raw()
    }

    pub fn from_leading_byte(byte: u8) -> Option<Self> {
        [
            FrameType::Handshake,
            FrameType::Data,
            FrameType::Accepted,
            FrameType::Rejected,
        ]
        .into_iter()
        .find(|ty| ty.leading_byte() == byte)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FrameType::Handshake => "handshake",
            FrameType::Data => "data",
            FrameType::Accepted => "accepted",
            FrameType::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decodes `buf` as a node and checks its frame id.
fn decode_frame_node(buf: &[u8], id: u8) -> Result<NodePacket, ProtocolError> {
    let (node, _) = NodePacket::decode(buf)?;
    let expected = Tag::node(id, false);
    if node.tag() != expected {
        return Err(ProtocolError::UnknownFrameType(node.tag().raw()));
    }
    Ok(node)
}

fn utf8_field(packet: &PrimitivePacket, field: &'static str) -> Result<String, ProtocolError> {
    String::from_utf8(packet.value().to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
}

fn single_byte(packet: &PrimitivePacket, field: &'static str) -> Result<u8, ProtocolError> {
    match packet.value().as_ref() {
        [b] => Ok(*b),
        _ => Err(ProtocolError::MissingField(field)),
    }
}

/// Frame metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaFrame {
    transaction_id: String,
}

impl MetaFrame {
    /// Metadata with a timestamp-derived transaction id.
    pub fn new() -> Self {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Self {
            transaction_id: nanos.to_string(),
        }
    }

    pub fn with_transaction_id(transaction_id: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn set_transaction_id(&mut self, transaction_id: impl Into<String>) {
        self.transaction_id = transaction_id.into();
    }

    fn to_node(&self) -> NodePacket {
        NodePacket::new(META_FRAME_TAG).with(PrimitivePacket::new(
            TRANSACTION_ID_TAG,
            Bytes::copy_from_slice(self.transaction_id.as_bytes()),
        ))
    }

    fn from_node(node: &NodePacket) -> Result<Self, ProtocolError> {
        let tx = node
            .primitive(TRANSACTION_ID_TAG)
            .ok_or(ProtocolError::MissingField("transaction_id"))?;
        Ok(Self {
            transaction_id: utf8_field(tx, "transaction_id")?,
        })
    }

    pub fn encode(&self) -> Bytes {
        sfn_codec::Packet::from(self.to_node()).encode()
    }
}

impl Default for MetaFrame {
    fn default() -> Self {
        Self::new()
    }
}

pub fn decode_to_meta_frame(buf: &[u8]) -> Result<MetaFrame, ProtocolError> {
    MetaFrame::from_node(&decode_frame_node(buf, META_FRAME_TAG)?)
}

/// Application data keyed by its data tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadFrame {
    tag: u8,
    carriage: Bytes,
}

impl PayloadFrame {
    pub fn new(tag: u8, carriage: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        if tag > MAX_DATA_TAG {
            return Err(ProtocolError::InvalidDataTag(tag));
        }
        Ok(Self {
            tag,
            carriage: carriage.into(),
        })
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn carriage(&self) -> &Bytes {
        &self.carriage
    }

    fn to_node(&self) -> NodePacket {
        NodePacket::new(PAYLOAD_FRAME_TAG)
            .with(PrimitivePacket::new(self.tag, self.carriage.clone()))
    }

    fn from_node(node: &NodePacket) -> Result<Self, ProtocolError> {
        let data = node
            .primitives()
            .next()
            .ok_or(ProtocolError::MissingField("carriage"))?;
        Ok(Self {
            tag: data.tag().raw(),
            carriage: data.value().clone(),
        })
    }

    pub fn encode(&self) -> Bytes {
        sfn_codec::Packet::from(self.to_node()).encode()
    }
}

pub fn decode_to_payload_frame(buf: &[u8]) -> Result<PayloadFrame, ProtocolError> {
    PayloadFrame::from_node(&decode_frame_node(buf, PAYLOAD_FRAME_TAG)?)
}

/// Tagged application data with its metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataFrame {
    meta: MetaFrame,
    payload: PayloadFrame,
}

impl DataFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Data frame carrying `carriage` under `tag`.
    pub fn with_carriage(tag: u8, carriage: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        Ok(Self {
            meta: MetaFrame::new(),
            payload: PayloadFrame::new(tag, carriage)?,
        })
    }

    pub fn set_carriage(
        &mut self,
        tag: u8,
        carriage: impl Into<Bytes>,
    ) -> Result<(), ProtocolError> {
        self.payload = PayloadFrame::new(tag, carriage)?;
        Ok(())
    }

    pub fn tag(&self) -> u8 {
        self.payload.tag
    }

    pub fn carriage(&self) -> &Bytes {
        &self.payload.carriage
    }

    pub fn transaction_id(&self) -> &str {
        self.meta.transaction_id()
    }

    pub fn set_transaction_id(&mut self, transaction_id: impl Into<String>) {
        self.meta.set_transaction_id(transaction_id);
    }

    pub fn meta(&self) -> &MetaFrame {
        &self.meta
    }

    pub fn payload(&self) -> &PayloadFrame {
        &self.payload
    }

    pub fn encode(&self) -> Bytes {
        let node = NodePacket::new(DATA_FRAME_TAG)
            .with(self.meta.to_node())
            .with(self.payload.to_node());
        sfn_codec::Packet::from(node).encode()
    }
}

pub fn decode_to_data_frame(buf: &[u8]) -> Result<DataFrame, ProtocolError> {
    let node = decode_frame_node(buf, DATA_FRAME_TAG)?;
    let meta = node
        .node(META_FRAME_TAG)
        .ok_or(ProtocolError::MissingField("meta"))?;
    let payload = node
        .node(PAYLOAD_FRAME_TAG)
        .ok_or(ProtocolError::MissingField("payload"))?;
    Ok(DataFrame {
        meta: MetaFrame::from_node(meta)?,
        payload: PayloadFrame::from_node(payload)?,
    })
}

/// First frame a peer sends on a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeFrame {
    pub name: String,
    pub client_type: ClientType,
    /// Data tags the peer wants to receive. Empty means all.
    pub observe_data_tags: Vec<u8>,
    pub app_id: String,
    pub auth_type: AuthType,
    pub auth_payload: Bytes,
}

impl HandshakeFrame {
    pub fn new(name: impl Into<String>, client_type: ClientType) -> Self {
        Self {
            name: name.into(),
            client_type,
            observe_data_tags: Vec::new(),
            app_id: String::new(),
            auth_type: AuthType::None,
            auth_payload: Bytes::new(),
        }
    }

    /// Whether the peer wants frames carrying `tag`.
    pub fn observes(&self, tag: u8) -> bool {
        self.observe_data_tags.is_empty() || self.observe_data_tags.contains(&tag)
    }

    pub fn encode(&self) -> Bytes {
        NodeEncoder::new(HANDSHAKE_FRAME_TAG)
            .primitive(HANDSHAKE_NAME_TAG, self.name.as_bytes())
            .primitive(HANDSHAKE_TYPE_TAG, &[self.client_type.as_u8()])
            .primitive(HANDSHAKE_OBSERVE_TAGS_TAG, &self.observe_data_tags)
            .primitive(HANDSHAKE_APP_ID_TAG, self.app_id.as_bytes())
            .primitive(HANDSHAKE_AUTH_TYPE_TAG, &[self.auth_type.as_u8()])
            .primitive(HANDSHAKE_AUTH_PAYLOAD_TAG, &self.auth_payload)
            .finish()
    }
}

pub fn decode_to_handshake_frame(buf: &[u8]) -> Result<HandshakeFrame, ProtocolError> {
    let node = decode_frame_node(buf, HANDSHAKE_FRAME_TAG)?;

    let name = node
        .primitive(HANDSHAKE_NAME_TAG)
        .ok_or(ProtocolError::MissingField("name"))?;
    let client_type = node
        .primitive(HANDSHAKE_TYPE_TAG)
        .ok_or(ProtocolError::MissingField("type"))?;
    let auth_type = node
        .primitive(HANDSHAKE_AUTH_TYPE_TAG)
        .ok_or(ProtocolError::MissingField("auth_type"))?;

    Ok(HandshakeFrame {
        name: utf8_field(name, "name")?,
        client_type: ClientType::try_from(single_byte(client_type, "type")?)?,
        observe_data_tags: node
            .primitive(HANDSHAKE_OBSERVE_TAGS_TAG)
            .map(|p| p.value().to_vec())
            .unwrap_or_default(),
        app_id: match node.primitive(HANDSHAKE_APP_ID_TAG) {
            Some(p) => utf8_field(p, "app_id")?,
            None => String::new(),
        },
        auth_type: AuthType::try_from(single_byte(auth_type, "auth_type")?)?,
        auth_payload: node
            .primitive(HANDSHAKE_AUTH_PAYLOAD_TAG)
            .map(|p| p.value().clone())
            .unwrap_or_default(),
    })
}

/// Server acknowledgement of a successful handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptedFrame;

impl AcceptedFrame {
    pub fn encode(&self) -> Bytes {
        NodeEncoder::new(ACCEPTED_FRAME_TAG).finish()
    }
}

pub fn decode_to_accepted_frame(buf: &[u8]) -> Result<AcceptedFrame, ProtocolError> {
    decode_frame_node(buf, ACCEPTED_FRAME_TAG)?;
    Ok(AcceptedFrame)
}

/// Server refusal of a handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RejectedFrame;

impl RejectedFrame {
    pub fn encode(&self) -> Bytes {
        NodeEncoder::new(REJECTED_FRAME_TAG).finish()
    }
}

pub fn decode_to_rejected_frame(buf: &[u8]) -> Result<RejectedFrame, ProtocolError> {
    decode_frame_node(buf, REJECTED_FRAME_TAG)?;
    Ok(RejectedFrame)
}

/// Any top-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Handshake(HandshakeFrame),
    Data(DataFrame),
    Accepted(AcceptedFrame),
    Rejected(RejectedFrame),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Handshake(_) => FrameType::Handshake,
            Frame::Data(_) => FrameType::Data,
            Frame::Accepted(_) => FrameType::Accepted,
            Frame::Rejected(_) => FrameType::Rejected,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Handshake(f) => f.encode(),
            Frame::Data(f) => f.encode(),
            Frame::Accepted(f) => f.encode(),
            Frame::Rejected(f) => f.encode(),
        }
    }
}

impl From<HandshakeFrame> for Frame {
    fn from(f: HandshakeFrame) -> Self {
        Frame::Handshake(f)
    }
}

impl From<DataFrame> for Frame {
    fn from(f: DataFrame) -> Self {
        Frame::Data(f)
    }
}

impl From<AcceptedFrame> for Frame {
    fn from(f: AcceptedFrame) -> Self {
        Frame::Accepted(f)
    }
}

impl From<RejectedFrame> for Frame {
    fn from(f: RejectedFrame) -> Self {
        Frame::Rejected(f)
    }
}

/// Decodes one frame, dispatching on its leading byte.
pub fn parse_frame(buf: &[u8]) -> Result<Frame, ProtocolError> {
    let first = *buf
        .first()
        .ok_or(sfn_codec::CodecError::BufferTooSmall {
            needed: sfn_codec::packet::MIN_PACKET_SIZE,
            available: 0,
        })?;
    match FrameType::from_leading_byte(first) {
        Some(FrameType::Handshake) => Ok(Frame::Handshake(decode_to_handshake_frame(buf)?)),
        Some(FrameType::Data) => Ok(Frame::Data(decode_to_data_frame(buf)?)),
        Some(FrameType::Accepted) => Ok(Frame::Accepted(decode_to_accepted_frame(buf)?)),
        Some(FrameType::Rejected) => Ok(Frame::Rejected(decode_to_rejected_frame(buf)?)),
        None => Err(ProtocolError::UnknownFrameType(first)),
    }
}
