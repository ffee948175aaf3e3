//! Declarative header codec
//!
//! Every wire structure in the crate is described by a [`HeaderSchema`]: an
//! ordered list of `(name, primitive, default)` fields plus a byte order.
//! A single generic routine packs and unpacks any schema; typed structs are
//! declared with [`wire_header!`](crate::wire_header) which wires the struct
//! fields to the schema without any runtime name lookups.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::any::Any;
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

use crate::{Result, SnifferError};

/// Byte order of a schema's multi-byte fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Network order
    Big,
    Little,
}

/// Primitive field kinds a schema can be built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    U8,
    I8,
    U16,
    U32,
    U64,
    /// Fixed-size opaque byte block
    Block(usize),
}

impl Primitive {
    /// Encoded width in bytes
    pub const fn width(self) -> usize {
        match self {
            Primitive::U8 | Primitive::I8 => 1,
            Primitive::U16 => 2,
            Primitive::U32 => 4,
            Primitive::U64 => 8,
            Primitive::Block(n) => n,
        }
    }
}

/// Total encoded width of a field list, usable in constant context
pub const fn total_width(kinds: &[Primitive]) -> usize {
    let mut width = 0;
    let mut i = 0;
    while i < kinds.len() {
        width += kinds[i].width();
        i += 1;
    }
    width
}

/// A decoded field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    U8(u8),
    I8(i8),
    U16(u16),
    U32(u32),
    U64(u64),
    Block(Vec<u8>),
}

impl Value {
    /// Whether this value can be written as `kind`
    pub fn fits(&self, kind: Primitive) -> bool {
        match (self, kind) {
            (Value::U8(_), Primitive::U8)
            | (Value::I8(_), Primitive::I8)
            | (Value::U16(_), Primitive::U16)
            | (Value::U32(_), Primitive::U32)
            | (Value::U64(_), Primitive::U64) => true,
            (Value::Block(b), Primitive::Block(n)) => b.len() == n,
            _ => false,
        }
    }

    fn read(buf: &mut &[u8], kind: Primitive, order: ByteOrder) -> Value {
        match (kind, order) {
            (Primitive::U8, _) => Value::U8(buf.get_u8()),
            (Primitive::I8, _) => Value::I8(buf.get_i8()),
            (Primitive::U16, ByteOrder::Big) => Value::U16(buf.get_u16()),
            (Primitive::U16, ByteOrder::Little) => Value::U16(buf.get_u16_le()),
            (Primitive::U32, ByteOrder::Big) => Value::U32(buf.get_u32()),
            (Primitive::U32, ByteOrder::Little) => Value::U32(buf.get_u32_le()),
            (Primitive::U64, ByteOrder::Big) => Value::U64(buf.get_u64()),
            (Primitive::U64, ByteOrder::Little) => Value::U64(buf.get_u64_le()),
            (Primitive::Block(n), _) => {
                let mut block = vec![0u8; n];
                buf.copy_to_slice(&mut block);
                Value::Block(block)
            }
        }
    }

    fn write(&self, out: &mut BytesMut, order: ByteOrder) {
        match (self, order) {
            (Value::U8(v), _) => out.put_u8(*v),
            (Value::I8(v), _) => out.put_i8(*v),
            (Value::U16(v), ByteOrder::Big) => out.put_u16(*v),
            (Value::U16(v), ByteOrder::Little) => out.put_u16_le(*v),
            (Value::U32(v), ByteOrder::Big) => out.put_u32(*v),
            (Value::U32(v), ByteOrder::Little) => out.put_u32_le(*v),
            (Value::U64(v), ByteOrder::Big) => out.put_u64(*v),
            (Value::U64(v), ByteOrder::Little) => out.put_u64_le(*v),
            (Value::Block(b), _) => out.put_slice(b),
        }
    }
}

/// One field of a schema
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: Primitive,
    pub default: Value,
}

impl FieldSpec {
    pub fn new(name: &'static str, kind: Primitive, default: Value) -> Self {
        Self { name, kind, default }
    }
}

/// Ordered field list plus byte order. Built once per structure type; the
/// width of typed structures is also fixed at compile time as
/// [`Header::WIDTH`].
#[derive(Debug, Clone)]
pub struct HeaderSchema {
    name: &'static str,
    order: ByteOrder,
    fields: Vec<FieldSpec>,
    width: usize,
}

impl HeaderSchema {
    pub fn new(name: &'static str, order: ByteOrder, fields: Vec<FieldSpec>) -> Self {
        let kinds: Vec<Primitive> = fields.iter().map(|f| f.kind).collect();
        let width = total_width(&kinds);
        Self { name, order, fields, width }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Width of the fixed part in bytes
    pub fn width(&self) -> usize {
        self.width
    }

    /// Position of a field by name
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Default value of every field, in schema order
    pub fn defaults(&self) -> Vec<Value> {
        self.fields.iter().map(|f| f.default.clone()).collect()
    }

    /// Consume exactly the fixed prefix of `buf`, returning the field values
    /// and whatever follows.
    pub fn unpack<'a>(&self, buf: &'a [u8]) -> Result<(Vec<Value>, &'a [u8])> {
        if buf.len() < self.width {
            return Err(SnifferError::InsufficientData {
                needed: self.width,
                available: buf.len(),
            });
        }

        let (mut fixed, rest) = buf.split_at(self.width);
        let values = self
            .fields
            .iter()
            .map(|f| Value::read(&mut fixed, f.kind, self.order))
            .collect();

        Ok((values, rest))
    }

    /// Serialize `values` in schema order. Nothing is written unless every
    /// value fits its declared primitive.
    pub fn pack(&self, values: &[Value], out: &mut BytesMut) -> Result<()> {
        if values.len() != self.fields.len() {
            return Err(SnifferError::MalformedHeader(format!(
                "{}: expected {} fields, got {}",
                self.name,
                self.fields.len(),
                values.len()
            )));
        }

        if let Some((field, value)) = self
            .fields
            .iter()
            .zip(values)
            .find(|(f, v)| !v.fits(f.kind))
        {
            return Err(SnifferError::MalformedHeader(format!(
                "{}.{}: {:?} does not fit {:?}",
                self.name, field.name, value, field.kind
            )));
        }

        out.reserve(self.width);
        for value in values {
            value.write(out, self.order);
        }
        Ok(())
    }
}

/// Rust types usable as schema fields
pub trait Field: Sized {
    const KIND: Primitive;

    fn to_value(&self) -> Value;

    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! scalar_field {
    ($ty:ty, $variant:ident) => {
        impl Field for $ty {
            const KIND: Primitive = Primitive::$variant;

            fn to_value(&self) -> Value {
                Value::$variant(*self)
            }

            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(*v),
                    _ => None,
                }
            }
        }
    };
}

scalar_field!(u8, U8);
scalar_field!(i8, I8);
scalar_field!(u16, U16);
scalar_field!(u32, U32);
scalar_field!(u64, U64);

impl<const N: usize> Field for [u8; N] {
    const KIND: Primitive = Primitive::Block(N);

    fn to_value(&self) -> Value {
        Value::Block(self.to_vec())
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Block(b) => b.as_slice().try_into().ok(),
            _ => None,
        }
    }
}

/// A fixed-width structure with a static schema
pub trait Header: Sized {
    /// Encoded width of the fixed part
    const WIDTH: usize;

    fn schema() -> &'static HeaderSchema;

    fn from_values(values: &[Value]) -> Result<Self>;

    fn to_values(&self) -> Vec<Value>;

    /// Decode the fixed part, returning the remaining bytes
    fn unpack(buf: &[u8]) -> Result<(Self, &[u8])> {
        let (values, rest) = Self::schema().unpack(buf)?;
        Ok((Self::from_values(&values)?, rest))
    }

    fn pack_into(&self, out: &mut BytesMut) -> Result<()> {
        Self::schema().pack(&self.to_values(), out)
    }

    fn to_bytes(&self) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(Self::WIDTH);
        self.pack_into(&mut out)?;
        Ok(out.freeze())
    }

    fn encoded_len() -> usize {
        Self::WIDTH
    }
}

/// Anything that can sit in a packet's trailing payload
pub trait Encode: fmt::Debug {
    fn encode_into(&self, out: &mut BytesMut) -> Result<()>;

    fn encoded_len(&self) -> usize;

    /// Access to the concrete type behind a nested payload
    fn as_any(&self) -> &dyn Any;

    fn encode(&self) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out.freeze())
    }
}

/// Trailing payload of a packet
#[derive(Debug)]
pub enum Payload {
    Raw(Bytes),
    Nested(Box<dyn Encode>),
}

impl Payload {
    pub fn empty() -> Self {
        Payload::Raw(Bytes::new())
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Raw(b) => b.len(),
            Payload::Nested(p) => p.encoded_len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw bytes, if the payload has not been decoded further
    pub fn as_raw(&self) -> Option<&Bytes> {
        match self {
            Payload::Raw(b) => Some(b),
            Payload::Nested(_) => None,
        }
    }

    /// The nested structure, if it was decoded as a `T`
    pub fn nested<T: 'static>(&self) -> Option<&T> {
        match self {
            Payload::Raw(_) => None,
            Payload::Nested(p) => p.as_any().downcast_ref::<T>(),
        }
    }

    pub fn encode_into(&self, out: &mut BytesMut) -> Result<()> {
        match self {
            Payload::Raw(b) => {
                out.put_slice(b);
                Ok(())
            }
            Payload::Nested(p) => p.encode_into(out),
        }
    }

    fn to_bytes(&self) -> Option<Bytes> {
        match self {
            Payload::Raw(b) => Some(b.clone()),
            Payload::Nested(p) => p.encode().ok(),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        match (self.to_bytes(), other.to_bytes()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Raw(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Raw(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Payload {
    fn from(bytes: &'static [u8]) -> Self {
        Payload::Raw(Bytes::from_static(bytes))
    }
}

/// A structure instance: typed fixed fields plus trailing payload
#[derive(Debug, PartialEq)]
pub struct Packet<H> {
    pub header: H,
    pub payload: Payload,
}

impl<H: Header + fmt::Debug> Packet<H> {
    pub fn new(header: H) -> Self {
        Self {
            header,
            payload: Payload::empty(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Nest an already decoded structure as the payload
    pub fn with_nested<P: Encode + 'static>(mut self, inner: P) -> Self {
        self.payload = Payload::Nested(Box::new(inner));
        self
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (header, rest) = H::unpack(buf)?;
        Ok(Self {
            header,
            payload: Payload::Raw(Bytes::copy_from_slice(rest)),
        })
    }

    /// Fixed part plus payload length
    pub fn len(&self) -> usize {
        H::encoded_len() + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<H: Header + fmt::Debug + 'static> Encode for Packet<H> {
    fn encode_into(&self, out: &mut BytesMut) -> Result<()> {
        self.header.pack_into(out)?;
        self.payload.encode_into(out)
    }

    fn encoded_len(&self) -> usize {
        self.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Bit helpers for flag accessors over an owning integer field
pub mod bits {
    use super::*;

    pub fn get<T>(raw: T, mask: T) -> bool
    where
        T: Copy + BitAnd<Output = T> + PartialEq + Default,
    {
        raw & mask != T::default()
    }

    /// `raw` with the `mask` bits set or cleared, all other bits untouched
    pub fn with<T>(raw: T, mask: T, on: bool) -> T
    where
        T: Copy + BitAnd<Output = T> + BitOr<Output = T> + Not<Output = T>,
    {
        if on {
            raw | mask
        } else {
            raw & !mask
        }
    }
}

/// Declare a typed wire structure backed by a static [`HeaderSchema`].
///
/// ```ignore
/// wire_header! {
///     pub struct Channel(ByteOrder::Big) {
///         pub freq: u16 = 0,
///         pub flags: u16 = 0,
///     }
/// }
/// ```
#[macro_export]
macro_rules! wire_header {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident ($order:expr) {
            $(
                $(#[$fmeta:meta])*
                $fvis:vis $field:ident : $ty:ty = $default:expr
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        $vis struct $name {
            $(
                $(#[$fmeta])*
                $fvis $field: $ty,
            )*
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    $( $field: $default, )*
                }
            }
        }

        impl $crate::packet::Header for $name {
            const WIDTH: usize = $crate::packet::total_width(&[
                $( <$ty as $crate::packet::Field>::KIND, )*
            ]);

            fn schema() -> &'static $crate::packet::HeaderSchema {
                static SCHEMA: std::sync::OnceLock<$crate::packet::HeaderSchema> =
                    std::sync::OnceLock::new();
                SCHEMA.get_or_init(|| {
                    $crate::packet::HeaderSchema::new(
                        stringify!($name),
                        $order,
                        vec![
                            $(
                                $crate::packet::FieldSpec::new(
                                    stringify!($field),
                                    <$ty as $crate::packet::Field>::KIND,
                                    $crate::packet::Field::to_value(&{
                                        let default: $ty = $default;
                                        default
                                    }),
                                ),
                            )*
                        ],
                    )
                })
            }

            fn from_values(values: &[$crate::packet::Value]) -> $crate::Result<Self> {
                let expected = <Self as $crate::packet::Header>::schema().fields().len();
                if values.len() != expected {
                    return Err($crate::SnifferError::MalformedHeader(format!(
                        "{}: expected {} fields, got {}",
                        stringify!($name),
                        expected,
                        values.len()
                    )));
                }

                let mut values = values.iter();
                $(
                    let $field = values
                        .next()
                        .and_then(<$ty as $crate::packet::Field>::from_value)
                        .ok_or_else(|| {
                            $crate::SnifferError::MalformedHeader(format!(
                                "{}.{} does not fit {:?}",
                                stringify!($name),
                                stringify!($field),
                                <$ty as $crate::packet::Field>::KIND
                            ))
                        })?;
                )*

                Ok(Self { $( $field, )* })
            }

            fn to_values(&self) -> Vec<$crate::packet::Value> {
                vec![ $( $crate::packet::Field::to_value(&self.$field), )* ]
            }
        }
    };
}

/// Check that `value` survives a pack/unpack cycle and that one byte short
/// of its width is reported as incomplete
#[cfg(test)]
pub(crate) fn assert_codec_roundtrip<H: Header + PartialEq + fmt::Debug>(value: &H) {
    assert_eq!(H::schema().width(), H::WIDTH, "{}", H::schema().name());

    let bytes = value.to_bytes().unwrap();
    assert_eq!(bytes.len(), H::WIDTH);
    let (back, rest) = H::unpack(&bytes).unwrap();
    assert_eq!(&back, value);
    assert!(rest.is_empty());

    let err = H::unpack(&bytes[..bytes.len() - 1]).unwrap_err();
    assert!(err.is_incomplete(), "{}: {}", H::schema().name(), err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire_header;
    use proptest::prelude::*;

    wire_header! {
        /// Three-field structure exercising every primitive width
        struct Sample(ByteOrder::Big) {
            foo: u32 = 1,
            bar: u16 = 2,
            baz: [u8; 4] = *b"quux",
        }
    }

    wire_header! {
        struct LittleSample(ByteOrder::Little) {
            tag: u8 = 0,
            level: i8 = -1,
            stamp: u64 = 0,
        }
    }

    #[test]
    fn test_schema_width_precomputed() {
        let schema = Sample::schema();
        assert_eq!(schema.width(), 10);
        assert_eq!(schema.name(), "Sample");
        assert_eq!(schema.index_of("bar"), Some(1));
        assert_eq!(schema.index_of("nope"), None);
        assert_eq!(LittleSample::encoded_len(), 10);
        assert_eq!(Sample::WIDTH, 10);
        assert_eq!(total_width(&[]), 0);
        assert_eq!(total_width(&[Primitive::U16, Primitive::Block(6)]), 8);
    }

    #[test]
    fn test_defaults_encode() {
        let packet = Packet::new(Sample::default());
        let bytes = packet.encode().unwrap();
        assert_eq!(&bytes[..], b"\x00\x00\x00\x01\x00\x02quux");
        assert_eq!(Sample::schema().defaults()[1], Value::U16(2));
    }

    #[test]
    fn test_overrides() {
        let sample = Sample { bar: 3, ..Default::default() };
        let bytes = sample.to_bytes().unwrap();
        assert_eq!(&bytes[..], b"\x00\x00\x00\x01\x00\x03quux");
    }

    #[test]
    fn test_decode_with_payload() {
        let packet = Packet::<Sample>::decode(b"hello, world!").unwrap();
        assert_eq!(packet.header.foo, 0x6865_6c6c);
        assert_eq!(packet.header.bar, 0x6f2c);
        assert_eq!(&packet.header.baz, b" wor");
        assert_eq!(packet.payload.as_raw().unwrap().as_ref(), b"ld!");
        assert_eq!(packet.len(), 13);
    }

    #[test]
    fn test_little_endian_roundtrip() {
        let sample = LittleSample { tag: 0xab, level: -40, stamp: 0x0102_0304_0506_0708 };
        let bytes = sample.to_bytes().unwrap();
        assert_eq!(bytes[0], 0xab);
        assert_eq!(bytes[1], 0xd8);
        assert_eq!(bytes[2], 0x08);
        let (decoded, rest) = LittleSample::unpack(&bytes).unwrap();
        assert_eq!(decoded, sample);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_extreme_values_roundtrip() {
        for (foo, bar) in [(0u32, 0u16), (u32::MAX, u16::MAX), (0x8000_0000, 0x8000)] {
            let sample = Sample { foo, bar, baz: [0xff, 0, 0x7f, 0x80] };
            let (decoded, _) = Sample::unpack(&sample.to_bytes().unwrap()).unwrap();
            assert_eq!(decoded, sample);
        }
    }

    #[test]
    fn test_truncated_is_insufficient() {
        let bytes = Sample::default().to_bytes().unwrap();
        let err = Sample::unpack(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(
            err,
            SnifferError::InsufficientData { needed: 10, available: 9 }
        ));
    }

    #[test]
    fn test_mismatched_value_is_malformed() {
        let schema = Sample::schema();
        let mut out = BytesMut::new();
        let values = vec![Value::U32(1), Value::U32(2), Value::Block(b"quux".to_vec())];
        let err = schema.pack(&values, &mut out).unwrap_err();
        assert!(matches!(err, SnifferError::MalformedHeader(_)));
        assert!(out.is_empty());

        let short_block = vec![Value::U32(1), Value::U16(2), Value::Block(b"qu".to_vec())];
        assert!(matches!(
            schema.pack(&short_block, &mut out),
            Err(SnifferError::MalformedHeader(_))
        ));

        assert!(matches!(
            Sample::from_values(&[Value::U32(1)]),
            Err(SnifferError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_nested_payload_encodes_recursively() {
        let inner = Packet::new(LittleSample { tag: 7, ..Default::default() })
            .with_payload(&b"tail"[..]);
        let outer = Packet::new(Sample::default()).with_nested(inner);
        assert_eq!(outer.len(), 10 + 10 + 4);

        let bytes = outer.encode().unwrap();
        assert_eq!(bytes.len(), 24);
        assert_eq!(bytes[10], 7);
        assert_eq!(&bytes[20..], b"tail");

        let inner = outer.payload.nested::<Packet<LittleSample>>().unwrap();
        assert_eq!(inner.header.tag, 7);
        assert!(outer.payload.nested::<Packet<Sample>>().is_none());

        let flat = Packet::<Sample>::decode(&bytes).unwrap();
        assert_eq!(flat, outer);
        assert!(flat.payload.nested::<Packet<LittleSample>>().is_none());
    }

    #[test]
    fn test_bits_preserve_neighbours() {
        let raw: u8 = 0b1010_0101;
        assert!(bits::get(raw, 0x01));
        assert!(!bits::get(raw, 0x02));
        assert_eq!(bits::with(raw, 0x02, true), 0b1010_0111);
        assert_eq!(bits::with(raw, 0x01, false), 0b1010_0100);
        assert_eq!(bits::with(0xffffu16, 0x0100, false), 0xfeff);
    }

    proptest! {
        #[test]
        fn test_sample_codec(foo in any::<u32>(), bar in any::<u16>(), baz in any::<[u8; 4]>()) {
            assert_codec_roundtrip(&Sample { foo, bar, baz });
        }

        #[test]
        fn test_little_sample_codec(tag in any::<u8>(), level in any::<i8>(), stamp in any::<u64>()) {
            assert_codec_roundtrip(&LittleSample { tag, level, stamp });
        }
    }
}
