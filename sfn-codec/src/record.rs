//! Field-tagged records and signals.
//!
//! A record encodes as a node whose children are its fields, each keyed by
//! the field's declared sequence id. Field layouts are described once per
//! type by a [`RecordSchema`] and reused for every encode and decode.
//!
//! Sequence ids 1-15 and 64+ are reserved and cannot be used by fields.
//! Ids 2-15 carry [`Signal`]s: short annotations appended to an encoded
//! record that are not part of its typed payload.

use crate::error::CodecError;
use crate::packet::{NodePacket, Packet, PrimitivePacket};
use crate::tag::Tag;
use crate::value::TlvValue;
use bytes::Bytes;

type EncodeField<T> = Box<dyn Fn(&T) -> Packet + Send + Sync>;
type DecodeField<T> = Box<dyn Fn(&mut T, &Packet) -> Result<(), CodecError> + Send + Sync>;

/// First sequence id available to record fields after the reserved block.
pub const FIRST_FIELD_ID: u8 = 16;

/// Signal ids.
pub const SIGNAL_IDS: std::ops::RangeInclusive<u8> = 2..=15;

/// A type with a fixed, field-tagged wire layout.
///
/// ```ignore
/// impl Record for Reading {
///     fn schema() -> &'static RecordSchema<Self> {
///         static SCHEMA: OnceLock<RecordSchema<Reading>> = OnceLock::new();
///         SCHEMA.get_or_init(|| {
///             RecordSchemaBuilder::<Reading>::new("Reading")
///                 .field(16, "id", |r| &r.id, |r, v| r.id = v)
///                 .build()
///         })
///     }
/// }
/// ```
pub trait Record: Default + Send + Sync + 'static {
    fn schema() -> &'static RecordSchema<Self>;
}

struct FieldDescriptor<T> {
    seq_id: u8,
    name: &'static str,
    encode: EncodeField<T>,
    decode: DecodeField<T>,
}

/// Ordered field layout of a record type.
pub struct RecordSchema<T> {
    name: &'static str,
    fields: Vec<FieldDescriptor<T>>,
}

impl<T> RecordSchema<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// `(sequence id, field name)` pairs in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (u8, &'static str)> + '_ {
        self.fields.iter().map(|f| (f.seq_id, f.name))
    }

    fn encode(&self, record: &T, tag: u8) -> NodePacket {
        let mut node = NodePacket::new(tag);
        for field in &self.fields {
            node.push((field.encode)(record));
        }
        node
    }

    fn decode_into(&self, record: &mut T, node: &NodePacket) -> Result<(), CodecError> {
        for child in node.children() {
            let seq_id = child.tag().seq_id();
            // Unknown ids (signals included) are skipped.
            if let Some(field) = self.fields.iter().find(|f| f.seq_id == seq_id) {
                (field.decode)(record, child)?;
            }
        }
        Ok(())
    }
}

impl<T> std::fmt::Debug for RecordSchema<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSchema")
            .field("name", &self.name)
            .field("fields", &self.fields().collect::<Vec<_>>())
            .finish()
    }
}

/// Builds a [`RecordSchema`].
pub struct RecordSchemaBuilder<T> {
    schema: RecordSchema<T>,
}

impl<T: 'static> RecordSchemaBuilder<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            schema: RecordSchema {
                name,
                fields: Vec::new(),
            },
        }
    }

    /// Adds a field.
    ///
    /// # Panics
    ///
    /// Panics if `seq_id` is reserved (1-15 or 64 and above) or already used
    /// by another field of this record.
    pub fn field<V>(
        mut self,
        seq_id: u8,
        name: &'static str,
        get: fn(&T) -> &V,
        set: fn(&mut T, V),
    ) -> Self
    where
        V: TlvValue + 'static,
    {
        assert!(
            seq_id == 0 || (FIRST_FIELD_ID..=Tag::SEQ_ID_MASK).contains(&seq_id),
            "{}.{}: sequence id {} is reserved",
            self.schema.name,
            name,
            seq_id
        );
        assert!(
            !self.schema.fields.iter().any(|f| f.seq_id == seq_id),
            "{}.{}: sequence id {} already assigned",
            self.schema.name,
            name,
            seq_id
        );

        self.schema.fields.push(FieldDescriptor {
            seq_id,
            name,
            encode: Box::new(move |record| get(record).to_packet(seq_id)),
            decode: Box::new(move |record, packet| {
                set(record, V::from_packet(packet)?);
                Ok(())
            }),
        });
        self
    }

    pub fn build(self) -> RecordSchema<T> {
        self.schema
    }
}

impl<T: Record> TlvValue for T {
    fn to_packet(&self, tag: u8) -> Packet {
        T::schema().encode(self, tag).into()
    }

    fn from_packet(packet: &Packet) -> Result<Self, CodecError> {
        let node = match packet {
            Packet::Node(n) => n,
            Packet::Primitive(p) => return Err(CodecError::NotANode(p.tag().raw())),
        };
        let mut record = T::default();
        T::schema().decode_into(&mut record, node)?;
        Ok(record)
    }
}

/// Short annotation attached to an encoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    id: u8,
    value: Bytes,
}

impl Signal {
    pub fn new(id: u8, value: impl Into<Bytes>) -> Result<Self, CodecError> {
        if !SIGNAL_IDS.contains(&id) {
            return Err(CodecError::InvalidSignalId(id));
        }
        Ok(Self {
            id,
            value: value.into(),
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }
}

/// Encodes a record under `tag` with `signals` appended after its fields.
pub fn marshal_with_signals<T: Record>(
    tag: u8,
    record: &T,
    signals: &[Signal],
) -> Bytes {
    let mut node = T::schema().encode(record, tag);
    for signal in signals {
        node.push(PrimitivePacket::new(signal.id, signal.value.clone()));
    }
    Packet::from(node).encode()
}

/// Signals carried directly under `node`.
pub fn signals(node: &NodePacket) -> Vec<Signal> {
    node.primitives()
        .filter(|p| SIGNAL_IDS.contains(&p.tag().raw()))
        .map(|p| Signal {
            id: p.tag().raw(),
            value: p.value().clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{marshal, unmarshal};
    use std::sync::OnceLock;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    impl Record for Point {
        fn schema() -> &'static RecordSchema<Self> {
            static SCHEMA: OnceLock<RecordSchema<Point>> = OnceLock::new();
            SCHEMA.get_or_init(|| {
                RecordSchemaBuilder::<Point>::new("Point")
                    .field(16, "x", |p| &p.x, |p, v| p.x = v)
                    .field(17, "y", |p| &p.y, |p, v| p.y = v)
                    .build()
            })
        }
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Reading {
        sensor: String,
        value: f64,
        origin: Point,
        path: Vec<Point>,
        active: bool,
    }

    impl Record for Reading {
        fn schema() -> &'static RecordSchema<Self> {
            static SCHEMA: OnceLock<RecordSchema<Reading>> = OnceLock::new();
            SCHEMA.get_or_init(|| {
                RecordSchemaBuilder::<Reading>::new("Reading")
                    .field(16, "sensor", |r| &r.sensor, |r, v| r.sensor = v)
                    .field(17, "value", |r| &r.value, |r, v| r.value = v)
                    .field(18, "origin", |r| &r.origin, |r, v| r.origin = v)
                    .field(19, "path", |r| &r.path, |r, v| r.path = v)
                    .field(63, "active", |r| &r.active, |r, v| r.active = v)
                    .build()
            })
        }
    }

    fn sample() -> Reading {
        Reading {
            sensor: "t-1".to_string(),
            value: 21.5,
            origin: Point { x: -3, y: 4 },
            path: vec![Point { x: 1, y: 1 }, Point { x: 2, y: 3 }],
            active: true,
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let reading = sample();
        let encoded = marshal(0x01, &reading);
        assert_eq!(encoded[0], 0x81);
        assert_eq!(unmarshal::<Reading>(&encoded).unwrap(), reading);
    }

    #[test]
    fn test_field_ids_are_wire_keys() {
        let encoded = marshal(0x01, &Point { x: 5, y: -1 });
        // node(1) { 0x10: 5, 0x11: -1 }
        assert_eq!(
            encoded.as_ref(),
            &[0x81, 0x06, 0x10, 0x01, 0x05, 0x11, 0x01, 0x7F]
        );
    }

    #[test]
    fn test_sequence_of_records() {
        let points = vec![Point { x: 1, y: 2 }, Point::default()];
        let encoded = marshal(0x02, &points);
        assert_eq!(unmarshal::<Vec<Point>>(&encoded).unwrap(), points);
    }

    #[test]
    fn test_missing_fields_default() {
        let encoded = Packet::from(
            NodePacket::new(0x01).with(PrimitivePacket::new(17, vec![0x07])),
        )
        .encode();
        assert_eq!(unmarshal::<Point>(&encoded).unwrap(), Point { x: 0, y: 7 });
    }

    #[test]
    fn test_signals_roundtrip() {
        let reading = sample();
        let signals_in = vec![
            Signal::new(2, &b"trace-7"[..]).unwrap(),
            Signal::new(15, Bytes::new()).unwrap(),
        ];
        let encoded = marshal_with_signals(0x01, &reading, &signals_in);

        // Signals do not disturb the typed payload.
        assert_eq!(unmarshal::<Reading>(&encoded).unwrap(), reading);

        let (node, _) = NodePacket::decode(&encoded).unwrap();
        assert_eq!(signals(&node), signals_in);
    }

    #[test]
    fn test_invalid_signal_id() {
        assert_eq!(
            Signal::new(1, Bytes::new()),
            Err(CodecError::InvalidSignalId(1))
        );
        assert_eq!(
            Signal::new(16, Bytes::new()),
            Err(CodecError::InvalidSignalId(16))
        );
    }

    #[test]
    fn test_record_from_primitive_fails() {
        let encoded = marshal(0x01, &3i32);
        assert_eq!(unmarshal::<Point>(&encoded), Err(CodecError::NotANode(0x01)));
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn test_reserved_id_panics() {
        let _ = RecordSchemaBuilder::<Point>::new("Bad").field(5, "x", |p| &p.x, |p, v| p.x = v);
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn test_high_id_panics() {
        let _ = RecordSchemaBuilder::<Point>::new("Bad").field(64, "x", |p| &p.x, |p, v| p.x = v);
    }

    #[test]
    #[should_panic(expected = "already assigned")]
    fn test_duplicate_id_panics() {
        let _ = RecordSchemaBuilder::<Point>::new("Bad")
            .field(16, "x", |p| &p.x, |p, v| p.x = v)
            .field(16, "y", |p| &p.y, |p, v| p.y = v);
    }

    #[test]
    fn test_schema_describes_fields() {
        let fields: Vec<_> = Point::schema().fields().collect();
        assert_eq!(fields, vec![(16, "x"), (17, "y")]);
        assert_eq!(Point::schema().name(), "Point");
    }
}
