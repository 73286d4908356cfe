//! Typed messages on top of TLV structures.

use crate::element::{Element, Value};
use crate::schema::Schema;
use crate::{reader, writer, ValidationError};
use bytes::Bytes;

/// A message type with a fixed TLV schema
pub trait TlvObject: Sized {
    /// Schema the encoded structure must satisfy
    fn schema() -> Schema;

    /// Build the TLV value for this message
    fn to_tlv(&self) -> Value;

    /// Read a message from a value that already passed [`TlvObject::schema`]
    fn from_tlv(value: &Value) -> Result<Self, ValidationError>;

    /// Encode as an anonymous top-level element
    fn encode(&self) -> Bytes {
        writer::encode(&Element::anonymous(self.to_tlv()))
    }

    /// Length of [`TlvObject::encode`] output
    fn encoded_len(&self) -> usize {
        writer::encoded_len(&Element::anonymous(self.to_tlv()))
    }

    /// Decode, validate and convert
    fn decode(buf: &[u8]) -> Result<Self, ValidationError> {
        let element = reader::decode(buf)?;
        let value = Self::schema().validate(&element.value)?;
        Self::from_tlv(&value)
    }
}

/// Builder for context-tagged structures
#[derive(Debug, Default)]
pub struct StructBuilder {
    members: Vec<Element>,
}

impl StructBuilder {
    /// Start an empty structure
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member
    pub fn value(mut self, tag: u8, value: impl Into<Value>) -> Self {
        self.members.push(Element::context(tag, value));
        self
    }

    /// Add a byte string member
    pub fn bytes(self, tag: u8, bytes: &[u8]) -> Self {
        self.value(tag, Value::Bytes(bytes.to_vec()))
    }

    /// Add an unsigned member
    pub fn uint(self, tag: u8, v: u64) -> Self {
        self.value(tag, Value::Unsigned(v))
    }

    /// Add a boolean member
    pub fn bool(self, tag: u8, v: bool) -> Self {
        self.value(tag, Value::Bool(v))
    }

    /// Add a string member
    pub fn utf8(self, tag: u8, s: &str) -> Self {
        self.value(tag, Value::Utf8(s.to_string()))
    }

    /// Add a member only when present
    pub fn opt_value(self, tag: u8, value: Option<Value>) -> Self {
        match value {
            Some(v) => self.value(tag, v),
            None => self,
        }
    }

    /// Add a byte string member only when present
    pub fn opt_bytes(self, tag: u8, bytes: Option<&[u8]>) -> Self {
        match bytes {
            Some(b) => self.bytes(tag, b),
            None => self,
        }
    }

    /// Add an unsigned member only when present
    pub fn opt_uint(self, tag: u8, v: Option<u64>) -> Self {
        match v {
            Some(v) => self.uint(tag, v),
            None => self,
        }
    }

    /// Finish the structure
    pub fn build(self) -> Value {
        Value::Structure(self.members)
    }
}

/// Read accessors over a structure value
#[derive(Debug, Clone, Copy)]
pub struct StructView<'a> {
    value: &'a Value,
}

impl<'a> StructView<'a> {
    /// Wrap a structure value
    pub fn new(value: &'a Value) -> Result<Self, ValidationError> {
        match value {
            Value::Structure(_) => Ok(Self { value }),
            other => Err(ValidationError::TypeMismatch {
                expected: "object",
                actual: other.type_name(),
            }),
        }
    }

    /// Member value by context tag
    pub fn get(&self, tag: u8) -> Option<&'a Value> {
        self.value.member(tag).map(|e| &e.value)
    }

    fn require(&self, tag: u8, name: &'static str) -> Result<&'a Value, ValidationError> {
        self.get(tag)
            .ok_or(ValidationError::MissingField { name, tag })
    }

    /// Required byte string
    pub fn bytes(&self, tag: u8, name: &'static str) -> Result<&'a [u8], ValidationError> {
        as_bytes(self.require(tag, name)?).map_err(|e| e.in_field(name))
    }

    /// Required byte string of exactly `N` bytes
    pub fn byte_array<const N: usize>(
        &self,
        tag: u8,
        name: &'static str,
    ) -> Result<[u8; N], ValidationError> {
        let bytes = self.bytes(tag, name)?;
        bytes.try_into().map_err(|_| {
            ValidationError::Length {
                len: bytes.len(),
                min: N,
                max: N,
            }
            .in_field(name)
        })
    }

    /// Required unsigned integer
    pub fn uint(&self, tag: u8, name: &'static str) -> Result<u64, ValidationError> {
        as_uint(self.require(tag, name)?).map_err(|e| e.in_field(name))
    }

    /// Required unsigned integer narrowed to `T`
    pub fn uint_as<T: TryFrom<u64>>(
        &self,
        tag: u8,
        name: &'static str,
    ) -> Result<T, ValidationError> {
        narrow(self.uint(tag, name)?).map_err(|e| e.in_field(name))
    }

    /// Required boolean
    pub fn bool(&self, tag: u8, name: &'static str) -> Result<bool, ValidationError> {
        match self.require(tag, name)? {
            Value::Bool(b) => Ok(*b),
            other => Err(mismatch("boolean", other).in_field(name)),
        }
    }

    /// Required string
    pub fn utf8(&self, tag: u8, name: &'static str) -> Result<&'a str, ValidationError> {
        match self.require(tag, name)? {
            Value::Utf8(s) => Ok(s.as_str()),
            other => Err(mismatch("string", other).in_field(name)),
        }
    }

    /// Required nested structure
    pub fn structure(&self, tag: u8, name: &'static str) -> Result<StructView<'a>, ValidationError> {
        StructView::new(self.require(tag, name)?).map_err(|e| e.in_field(name))
    }

    /// Optional byte string
    pub fn opt_bytes(&self, tag: u8, name: &'static str) -> Result<Option<&'a [u8]>, ValidationError> {
        self.get(tag)
            .map(|v| as_bytes(v).map_err(|e| e.in_field(name)))
            .transpose()
    }

    /// Optional unsigned integer
    pub fn opt_uint(&self, tag: u8, name: &'static str) -> Result<Option<u64>, ValidationError> {
        self.get(tag)
            .map(|v| as_uint(v).map_err(|e| e.in_field(name)))
            .transpose()
    }

    /// Optional unsigned integer narrowed to `T`
    pub fn opt_uint_as<T: TryFrom<u64>>(
        &self,
        tag: u8,
        name: &'static str,
    ) -> Result<Option<T>, ValidationError> {
        self.opt_uint(tag, name)?
            .map(|v| narrow(v).map_err(|e| e.in_field(name)))
            .transpose()
    }

    /// Optional boolean
    pub fn opt_bool(&self, tag: u8, name: &'static str) -> Result<Option<bool>, ValidationError> {
        match self.get(tag) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(mismatch("boolean", other).in_field(name)),
        }
    }

    /// Optional nested structure
    pub fn opt_structure(
        &self,
        tag: u8,
        name: &'static str,
    ) -> Result<Option<StructView<'a>>, ValidationError> {
        self.get(tag)
            .map(|v| StructView::new(v).map_err(|e| e.in_field(name)))
            .transpose()
    }
}

fn as_bytes(value: &Value) -> Result<&[u8], ValidationError> {
    match value {
        Value::Bytes(b) => Ok(b),
        other => Err(mismatch("byte string", other)),
    }
}

fn as_uint(value: &Value) -> Result<u64, ValidationError> {
    match value {
        Value::Unsigned(v) => Ok(*v),
        Value::Signed(v) if *v >= 0 => Ok(*v as u64),
        other => Err(mismatch("unsigned integer", other)),
    }
}

fn narrow<T: TryFrom<u64>>(v: u64) -> Result<T, ValidationError> {
    T::try_from(v).map_err(|_| ValidationError::OutOfBounds {
        value: v as i128,
        min: 0,
        max: i128::MAX,
    })
}

fn mismatch(expected: &'static str, actual: &Value) -> ValidationError {
    ValidationError::TypeMismatch {
        expected,
        actual: actual.type_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;

    #[derive(Debug, PartialEq)]
    struct Probe {
        random: [u8; 4],
        session_id: u16,
        label: Option<u64>,
    }

    impl TlvObject for Probe {
        fn schema() -> Schema {
            Schema::object(vec![
                Field::required(1, "random", Schema::bytes(4)),
                Field::required(2, "sessionId", Schema::uint16()),
                Field::optional(3, "label", Schema::uint32()),
            ])
        }

        fn to_tlv(&self) -> Value {
            StructBuilder::new()
                .bytes(1, &self.random)
                .uint(2, self.session_id as u64)
                .opt_uint(3, self.label)
                .build()
        }

        fn from_tlv(value: &Value) -> Result<Self, ValidationError> {
            let view = StructView::new(value)?;
            Ok(Self {
                random: view.byte_array(1, "random")?,
                session_id: view.uint_as(2, "sessionId")?,
                label: view.opt_uint(3, "label")?,
            })
        }
    }

    #[test]
    fn test_object_encode_decode() {
        let probe = Probe {
            random: [1, 2, 3, 4],
            session_id: 0x1234,
            label: None,
        };
        let encoded = probe.encode();
        assert_eq!(encoded.len(), probe.encoded_len());
        assert_eq!(Probe::decode(&encoded).unwrap(), probe);
    }

    #[test]
    fn test_absent_optional_is_none() {
        let value = StructBuilder::new().bytes(1, &[0; 4]).uint(2, 1).build();
        let bytes = writer::encode(&Element::anonymous(value));
        assert_eq!(Probe::decode(&bytes).unwrap().label, None);
    }

    #[test]
    fn test_decode_applies_schema() {
        let value = StructBuilder::new().bytes(1, &[0; 3]).uint(2, 1).build();
        let bytes = writer::encode(&Element::anonymous(value));
        let err = Probe::decode(&bytes).unwrap_err();
        assert!(matches!(err.root_cause(), ValidationError::Length { len: 3, .. }));
    }

    #[test]
    fn test_view_reports_missing_field() {
        let value = StructBuilder::new().uint(2, 1).build();
        let view = StructView::new(&value).unwrap();
        assert_eq!(
            view.bytes(1, "random").unwrap_err(),
            ValidationError::MissingField {
                name: "random",
                tag: 1
            }
        );
        assert!(StructView::new(&Value::Null).is_err());
    }
}
