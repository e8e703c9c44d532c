//! Declarative field schemas.
//!
//! A schema is an ordered slice of [`FieldDef`]s decoded sequentially from a
//! [`BinaryReader`]. Fields may take their length from a previously decoded
//! field and may be conditional on earlier values: a field whose
//! [`Condition`] does not hold consumes no bytes and adds no record.
//!
//! Parsers turn the resulting [`FieldList`] into typed records right away;
//! the list itself is only kept around for diagnostic dumps.
//!
//! ```
//! use mnfkit_common::schema::{decode_fields, Condition, FieldDef, Len};
//! use mnfkit_common::BinaryReader;
//!
//! const SCHEMA: &[FieldDef] = &[
//!     FieldDef::u16("kind").be(),
//!     FieldDef::u32("size").when(Condition::Equals("kind", 0)),
//!     FieldDef::bytes("payload", Len::Field("size")).when(Condition::Equals("kind", 0)),
//! ];
//!
//! let data = [0x00, 0x01];
//! let fields = decode_fields(&mut BinaryReader::new(&data), SCHEMA).unwrap();
//! assert_eq!(fields.u16("kind"), Some(1));
//! assert!(fields.get("payload").is_none());
//! ```

use std::fmt;

use crate::reader::{BinaryReader, Endian};
use crate::{Error, Result};

/// Where a variable-length field takes its length from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Len {
    /// A literal length.
    Fixed(usize),
    /// The value of a previously decoded numeric field.
    Field(&'static str),
    /// Everything left in the buffer.
    ToEnd,
}

/// Primitive field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    U16,
    U32,
    /// Raw byte block.
    Bytes(Len),
    /// UTF-8 string of the given byte length.
    Str(Len),
    /// Array of u16 values; the length is an element count.
    U16Array(Len),
}

/// Presence condition evaluated against fields already decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// The named numeric field equals the value.
    Equals(&'static str, u64),
    /// The named numeric field is present and greater than zero.
    NonZero(&'static str),
}

impl Condition {
    fn holds(&self, fields: &FieldList<'_>) -> bool {
        match *self {
            Condition::Equals(name, value) => fields.numeric(name) == Some(value),
            Condition::NonZero(name) => fields.numeric(name).is_some_and(|v| v > 0),
        }
    }
}

/// One entry of a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub kind: FieldKind,
    pub name: Option<&'static str>,
    pub endian: Endian,
    pub condition: Option<Condition>,
}

impl FieldDef {
    const fn new(kind: FieldKind, name: Option<&'static str>) -> Self {
        Self {
            kind,
            name,
            endian: Endian::Little,
            condition: None,
        }
    }

    pub const fn u8(name: &'static str) -> Self {
        Self::new(FieldKind::U8, Some(name))
    }

    pub const fn u16(name: &'static str) -> Self {
        Self::new(FieldKind::U16, Some(name))
    }

    pub const fn u32(name: &'static str) -> Self {
        Self::new(FieldKind::U32, Some(name))
    }

    pub const fn bytes(name: &'static str, len: Len) -> Self {
        Self::new(FieldKind::Bytes(len), Some(name))
    }

    pub const fn string(name: &'static str, len: Len) -> Self {
        Self::new(FieldKind::Str(len), Some(name))
    }

    pub const fn u16_array(name: &'static str, len: Len) -> Self {
        Self::new(FieldKind::U16Array(len), Some(name))
    }

    /// An unnamed field of the given kind (decoded, but not looked up).
    pub const fn skip(kind: FieldKind) -> Self {
        Self::new(kind, None)
    }

    /// Decode multi-byte values as big-endian.
    pub const fn be(mut self) -> Self {
        self.endian = Endian::Big;
        self
    }

    /// Only decode this field when the condition holds.
    pub const fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    fn label(&self) -> String {
        self.name.unwrap_or("<unnamed>").to_string()
    }
}

/// A decoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue<'a> {
    U8(u8),
    U16(u16),
    U32(u32),
    Bytes(&'a [u8]),
    Str(&'a str),
    U16Array(Vec<u16>),
}

impl FieldValue<'_> {
    /// Numeric view of scalar values.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            FieldValue::U8(v) => Some(v as u64),
            FieldValue::U16(v) => Some(v as u64),
            FieldValue::U32(v) => Some(v as u64),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::U8(v) => write!(f, "{} ({:#04x})", v, v),
            FieldValue::U16(v) => write!(f, "{} ({:#06x})", v, v),
            FieldValue::U32(v) => write!(f, "{} ({:#010x})", v, v),
            FieldValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            FieldValue::Str(s) if s.len() > 64 => {
                let head: String = s.chars().take(64).collect();
                write!(f, "{:?}... ({} bytes)", head, s.len())
            }
            FieldValue::Str(s) => write!(f, "{:?}", s),
            FieldValue::U16Array(values) => write!(f, "{:?}", values),
        }
    }
}

/// A decoded field with the position it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field<'a> {
    pub name: Option<&'static str>,
    pub offset: usize,
    pub value: FieldValue<'a>,
}

/// Owned, printable summary of a decoded field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSummary {
    pub name: String,
    pub offset: usize,
    pub value: String,
}

impl fmt::Display for FieldSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}  {:<24} {}", self.offset, self.name, self.value)
    }
}

/// Ordered collection of decoded fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldList<'a> {
    fields: Vec<Field<'a>>,
}

impl<'a> FieldList<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field<'a>> {
        self.fields.iter()
    }

    /// The most recently decoded field with this name.
    pub fn get(&self, name: &str) -> Option<&Field<'a>> {
        self.fields.iter().rev().find(|f| f.name == Some(name))
    }

    pub fn numeric(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(|f| f.value.as_u64())
    }

    pub fn u8(&self, name: &str) -> Option<u8> {
        match self.get(name)?.value {
            FieldValue::U8(v) => Some(v),
            _ => None,
        }
    }

    pub fn u16(&self, name: &str) -> Option<u16> {
        match self.get(name)?.value {
            FieldValue::U16(v) => Some(v),
            _ => None,
        }
    }

    pub fn u32(&self, name: &str) -> Option<u32> {
        match self.get(name)?.value {
            FieldValue::U32(v) => Some(v),
            _ => None,
        }
    }

    pub fn bytes(&self, name: &str) -> Option<&'a [u8]> {
        match self.get(name)?.value {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn str(&self, name: &str) -> Option<&'a str> {
        match self.get(name)?.value {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn u16_array(&self, name: &str) -> Option<&[u16]> {
        match &self.get(name)?.value {
            FieldValue::U16Array(values) => Some(values),
            _ => None,
        }
    }

    /// Owned summaries for diagnostic output.
    pub fn summaries(&self) -> Vec<FieldSummary> {
        self.fields
            .iter()
            .map(|f| FieldSummary {
                name: f.name.unwrap_or("<unnamed>").to_string(),
                offset: f.offset,
                value: f.value.to_string(),
            })
            .collect()
    }

    fn push(&mut self, field: Field<'a>) {
        self.fields.push(field);
    }
}

/// Decode a schema from the reader's current position into a new list.
pub fn decode_fields<'a>(reader: &mut BinaryReader<'a>, schema: &[FieldDef]) -> Result<FieldList<'a>> {
    let mut fields = FieldList::new();
    decode_into(reader, schema, &mut fields)?;
    Ok(fields)
}

/// Decode a schema, appending to an existing list.
///
/// Conditions and length references see every field already in `fields`.
pub fn decode_into<'a>(
    reader: &mut BinaryReader<'a>,
    schema: &[FieldDef],
    fields: &mut FieldList<'a>,
) -> Result<()> {
    for def in schema {
        if let Some(condition) = &def.condition {
            if !condition.holds(fields) {
                continue;
            }
        }

        let offset = reader.position();
        let value = read_value(reader, def, fields).map_err(|e| Error::Field {
            field: def.label(),
            offset,
            source: Box::new(e),
        })?;

        fields.push(Field {
            name: def.name,
            offset,
            value,
        });
    }

    Ok(())
}

fn resolve_len(len: Len, reader: &BinaryReader<'_>, fields: &FieldList<'_>) -> Result<usize> {
    match len {
        Len::Fixed(n) => Ok(n),
        Len::Field(name) => fields
            .numeric(name)
            .map(|v| v as usize)
            .ok_or(Error::MissingLengthField(name)),
        Len::ToEnd => Ok(reader.remaining()),
    }
}

fn read_value<'a>(
    reader: &mut BinaryReader<'a>,
    def: &FieldDef,
    fields: &FieldList<'a>,
) -> Result<FieldValue<'a>> {
    Ok(match def.kind {
        FieldKind::U8 => FieldValue::U8(reader.read_u8()?),
        FieldKind::U16 => FieldValue::U16(reader.read_u16_with(def.endian)?),
        FieldKind::U32 => FieldValue::U32(reader.read_u32_with(def.endian)?),
        FieldKind::Bytes(len) => {
            let len = resolve_len(len, reader, fields)?;
            FieldValue::Bytes(reader.read_bytes(len)?)
        }
        FieldKind::Str(len) => {
            let len = resolve_len(len, reader, fields)?;
            FieldValue::Str(reader.read_string(len)?)
        }
        FieldKind::U16Array(len) => {
            let count = resolve_len(len, reader, fields)?;
            // bounds-check the whole array before allocating
            let bytes = reader.read_bytes(count.saturating_mul(2))?;
            let mut values = Vec::with_capacity(count);
            let mut sub = BinaryReader::new(bytes);
            for _ in 0..count {
                values.push(sub.read_u16_with(def.endian)?);
            }
            FieldValue::U16Array(values)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &[FieldDef] = &[
        FieldDef::u16("count"),
        FieldDef::u16_array("lookup", Len::Field("count")),
        FieldDef::u16("kind").be(),
        FieldDef::u32("extra_size").be().when(Condition::Equals("kind", 0)),
        FieldDef::bytes("extra", Len::Field("extra_size")).when(Condition::Equals("kind", 0)),
        FieldDef::u8("tail"),
    ];

    #[test]
    fn test_conditional_field_skipped() {
        let data = [
            0x01, 0x00, // count = 1
            0x07, 0x00, // lookup[0] = 7
            0x00, 0x05, // kind = 5 (big-endian)
            0xAA, // tail
        ];
        let mut reader = BinaryReader::new(&data);
        let fields = decode_fields(&mut reader, HEADER).unwrap();

        assert_eq!(fields.len(), 4);
        assert_eq!(fields.u16_array("lookup"), Some(&[7u16][..]));
        assert_eq!(fields.u16("kind"), Some(5));
        assert!(fields.get("extra_size").is_none());
        assert_eq!(fields.u8("tail"), Some(0xAA));
        assert!(reader.is_empty());
    }

    #[test]
    fn test_conditional_field_present() {
        let data = [
            0x00, 0x00, // count = 0
            0x00, 0x00, // kind = 0
            0x00, 0x00, 0x00, 0x02, // extra_size = 2
            0x10, 0x20, // extra
            0xBB, // tail
        ];
        let mut reader = BinaryReader::new(&data);
        let fields = decode_fields(&mut reader, HEADER).unwrap();

        assert_eq!(fields.u16_array("lookup"), Some(&[][..]));
        assert_eq!(fields.bytes("extra"), Some(&[0x10, 0x20][..]));
        assert_eq!(fields.u8("tail"), Some(0xBB));
        assert_eq!(fields.get("tail").unwrap().offset, 10);
    }

    #[test]
    fn test_bounds_error_names_field() {
        let data = [0x02, 0x00, 0x01, 0x00];
        let mut reader = BinaryReader::new(&data);

        match decode_fields(&mut reader, HEADER) {
            Err(Error::Field { field, offset, source }) => {
                assert_eq!(field, "lookup");
                assert_eq!(offset, 2);
                assert!(matches!(*source, Error::UnexpectedEof { .. }));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_non_zero_condition_and_remainder() {
        const SCHEMA: &[FieldDef] = &[
            FieldDef::u32("rows"),
            FieldDef::u32("size").when(Condition::NonZero("rows")),
            FieldDef::bytes("rest", Len::ToEnd),
        ];

        let data = [0, 0, 0, 0, 1, 2, 3];
        let fields = decode_fields(&mut BinaryReader::new(&data), SCHEMA).unwrap();
        assert!(fields.get("size").is_none());
        assert_eq!(fields.bytes("rest"), Some(&[1, 2, 3][..]));
    }

    #[test]
    fn test_fixed_string() {
        const SCHEMA: &[FieldDef] = &[FieldDef::string("tag", Len::Fixed(5))];
        let fields = decode_fields(&mut BinaryReader::new(b"ZOSFT"), SCHEMA).unwrap();
        assert_eq!(fields.str("tag"), Some("ZOSFT"));
    }

    #[test]
    fn test_unnamed_fields_in_summary() {
        const SCHEMA: &[FieldDef] = &[FieldDef::skip(FieldKind::U32).be(), FieldDef::u8("b")];
        let fields = decode_fields(&mut BinaryReader::new(&[0, 0, 0, 1, 2]), SCHEMA).unwrap();
        let summaries = fields.summaries();

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].name, "<unnamed>");
        assert_eq!(summaries[1].offset, 4);
    }

    #[test]
    fn test_missing_length_field() {
        const SCHEMA: &[FieldDef] = &[FieldDef::bytes("data", Len::Field("size"))];
        let result = decode_fields(&mut BinaryReader::new(&[1, 2]), SCHEMA);
        match result {
            Err(Error::Field { source, .. }) => {
                assert!(matches!(*source, Error::MissingLengthField("size")))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
