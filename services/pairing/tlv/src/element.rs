//! TLV element model.
//!
//! An [`Element`] is a tag plus a [`Value`]. Containers hold their children
//! in wire order; scalars carry their payload directly.

use crate::TlvError;

/// Element types (lower 5 bits of the control byte)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    /// Signed integer, 1 byte
    Int8 = 0x00,
    /// Signed integer, 2 bytes
    Int16 = 0x01,
    /// Signed integer, 4 bytes
    Int32 = 0x02,
    /// Signed integer, 8 bytes
    Int64 = 0x03,
    /// Unsigned integer, 1 byte
    UInt8 = 0x04,
    /// Unsigned integer, 2 bytes
    UInt16 = 0x05,
    /// Unsigned integer, 4 bytes
    UInt32 = 0x06,
    /// Unsigned integer, 8 bytes
    UInt64 = 0x07,
    /// Boolean false
    False = 0x08,
    /// Boolean true
    True = 0x09,
    /// Single precision float
    Float = 0x0A,
    /// Double precision float
    Double = 0x0B,
    /// UTF-8 string, 1 byte length
    Utf8L1 = 0x0C,
    /// UTF-8 string, 2 byte length
    Utf8L2 = 0x0D,
    /// UTF-8 string, 4 byte length
    Utf8L4 = 0x0E,
    /// UTF-8 string, 8 byte length
    Utf8L8 = 0x0F,
    /// Byte string, 1 byte length
    BytesL1 = 0x10,
    /// Byte string, 2 byte length
    BytesL2 = 0x11,
    /// Byte string, 4 byte length
    BytesL4 = 0x12,
    /// Byte string, 8 byte length
    BytesL8 = 0x13,
    /// Null
    Null = 0x14,
    /// Structure container
    Structure = 0x15,
    /// Array container
    Array = 0x16,
    /// List container
    List = 0x17,
    /// End of container marker
    EndOfContainer = 0x18,
}

impl TryFrom<u8> for ElementType {
    type Error = TlvError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ElementType::Int8),
            0x01 => Ok(ElementType::Int16),
            0x02 => Ok(ElementType::Int32),
            0x03 => Ok(ElementType::Int64),
            0x04 => Ok(ElementType::UInt8),
            0x05 => Ok(ElementType::UInt16),
            0x06 => Ok(ElementType::UInt32),
            0x07 => Ok(ElementType::UInt64),
            0x08 => Ok(ElementType::False),
            0x09 => Ok(ElementType::True),
            0x0A => Ok(ElementType::Float),
            0x0B => Ok(ElementType::Double),
            0x0C => Ok(ElementType::Utf8L1),
            0x0D => Ok(ElementType::Utf8L2),
            0x0E => Ok(ElementType::Utf8L4),
            0x0F => Ok(ElementType::Utf8L8),
            0x10 => Ok(ElementType::BytesL1),
            0x11 => Ok(ElementType::BytesL2),
            0x12 => Ok(ElementType::BytesL4),
            0x13 => Ok(ElementType::BytesL8),
            0x14 => Ok(ElementType::Null),
            0x15 => Ok(ElementType::Structure),
            0x16 => Ok(ElementType::Array),
            0x17 => Ok(ElementType::List),
            0x18 => Ok(ElementType::EndOfContainer),
            _ => Err(TlvError::ElementType(value)),
        }
    }
}

impl ElementType {
    /// Width in bytes of the fixed payload or length prefix selected by the
    /// two low bits of sized types; zero for types without one
    pub fn size_field_width(self) -> usize {
        match self {
            ElementType::Int8 | ElementType::UInt8 | ElementType::Utf8L1 | ElementType::BytesL1 => 1,
            ElementType::Int16
            | ElementType::UInt16
            | ElementType::Utf8L2
            | ElementType::BytesL2 => 2,
            ElementType::Int32
            | ElementType::UInt32
            | ElementType::Utf8L4
            | ElementType::BytesL4
            | ElementType::Float => 4,
            ElementType::Int64
            | ElementType::UInt64
            | ElementType::Utf8L8
            | ElementType::BytesL8
            | ElementType::Double => 8,
            _ => 0,
        }
    }
}

/// Tag forms (upper 3 bits of the control byte)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagControl {
    /// No tag bytes
    Anonymous = 0x00,
    /// 1 byte context-specific tag
    Context = 0x20,
    /// 2 byte common profile tag
    CommonProfile2 = 0x40,
    /// 4 byte common profile tag
    CommonProfile4 = 0x60,
    /// 2 byte implicit profile tag
    ImplicitProfile2 = 0x80,
    /// 4 byte implicit profile tag
    ImplicitProfile4 = 0xA0,
    /// 6 byte fully qualified tag (vendor, profile, 16-bit tag)
    FullyQualified6 = 0xC0,
    /// 8 byte fully qualified tag (vendor, profile, 32-bit tag)
    FullyQualified8 = 0xE0,
}

impl TagControl {
    /// Split a control byte into tag control and raw element type
    pub fn split(control: u8) -> (TagControl, u8) {
        let tag_control = match control & 0xE0 {
            0x00 => TagControl::Anonymous,
            0x20 => TagControl::Context,
            0x40 => TagControl::CommonProfile2,
            0x60 => TagControl::CommonProfile4,
            0x80 => TagControl::ImplicitProfile2,
            0xA0 => TagControl::ImplicitProfile4,
            0xC0 => TagControl::FullyQualified6,
            _ => TagControl::FullyQualified8,
        };
        (tag_control, control & 0x1F)
    }

    /// Number of tag bytes following the control byte
    pub fn tag_len(self) -> usize {
        match self {
            TagControl::Anonymous => 0,
            TagControl::Context => 1,
            TagControl::CommonProfile2 | TagControl::ImplicitProfile2 => 2,
            TagControl::CommonProfile4 | TagControl::ImplicitProfile4 => 4,
            TagControl::FullyQualified6 => 6,
            TagControl::FullyQualified8 => 8,
        }
    }
}

/// Element tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// No tag
    Anonymous,
    /// Context-specific tag (structure field number)
    Context(u8),
    /// Tag in the common profile
    CommonProfile(u32),
    /// Tag in the profile implied by the enclosing message
    ImplicitProfile(u32),
    /// Tag qualified with vendor and profile
    FullyQualified {
        /// Vendor id
        vendor: u16,
        /// Profile number
        profile: u16,
        /// Tag number
        tag: u32,
    },
}

impl Tag {
    /// Tag control needed to encode this tag in the fewest bytes
    pub fn control(&self) -> TagControl {
        match *self {
            Tag::Anonymous => TagControl::Anonymous,
            Tag::Context(_) => TagControl::Context,
            Tag::CommonProfile(t) if t <= u16::MAX as u32 => TagControl::CommonProfile2,
            Tag::CommonProfile(_) => TagControl::CommonProfile4,
            Tag::ImplicitProfile(t) if t <= u16::MAX as u32 => TagControl::ImplicitProfile2,
            Tag::ImplicitProfile(_) => TagControl::ImplicitProfile4,
            Tag::FullyQualified { tag, .. } if tag <= u16::MAX as u32 => {
                TagControl::FullyQualified6
            }
            Tag::FullyQualified { .. } => TagControl::FullyQualified8,
        }
    }
}

/// Element payload
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Signed integer
    Signed(i64),
    /// Unsigned integer
    Unsigned(u64),
    /// Boolean
    Bool(bool),
    /// Single precision float
    Float(f32),
    /// Double precision float
    Double(f64),
    /// UTF-8 string
    Utf8(String),
    /// Byte string
    Bytes(Vec<u8>),
    /// Null
    Null,
    /// Structure: tagged members, order preserved
    Structure(Vec<Element>),
    /// Array: anonymous members
    Array(Vec<Element>),
    /// List: members may be tagged or anonymous
    List(Vec<Element>),
}

impl Value {
    /// Human readable type name used in validation errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Signed(_) => "integer",
            Value::Unsigned(_) => "unsigned integer",
            Value::Bool(_) => "boolean",
            Value::Float(_) | Value::Double(_) => "number",
            Value::Utf8(_) => "string",
            Value::Bytes(_) => "byte string",
            Value::Null => "null",
            Value::Structure(_) => "object",
            Value::Array(_) => "array",
            Value::List(_) => "list",
        }
    }

    /// Children of a container value
    pub fn children(&self) -> Option<&[Element]> {
        match self {
            Value::Structure(c) | Value::Array(c) | Value::List(c) => Some(c),
            _ => None,
        }
    }

    /// Find a structure member by context tag
    pub fn member(&self, tag: u8) -> Option<&Element> {
        match self {
            Value::Structure(members) | Value::List(members) => {
                members.iter().find(|e| e.tag == Tag::Context(tag))
            }
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Unsigned(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Signed(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Utf8(value.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

/// A tagged TLV node
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    /// Element tag
    pub tag: Tag,
    /// Element payload
    pub value: Value,
}

impl Element {
    /// Create an element with the given tag
    pub fn new(tag: Tag, value: impl Into<Value>) -> Self {
        Self {
            tag,
            value: value.into(),
        }
    }

    /// Create an anonymous element
    pub fn anonymous(value: impl Into<Value>) -> Self {
        Self::new(Tag::Anonymous, value)
    }

    /// Create a context-tagged element
    pub fn context(tag: u8, value: impl Into<Value>) -> Self {
        Self::new(Tag::Context(tag), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_type_conversion() {
        assert_eq!(ElementType::try_from(0x09).unwrap(), ElementType::True);
        assert_eq!(ElementType::try_from(0x18).unwrap(), ElementType::EndOfContainer);
        assert!(ElementType::try_from(0x19).is_err());
        assert!(ElementType::try_from(0x1F).is_err());
    }

    #[test]
    fn test_tag_control_split() {
        assert_eq!(TagControl::split(0x35), (TagControl::Context, 0x15));
        assert_eq!(TagControl::split(0xD0), (TagControl::FullyQualified6, 0x10));
        assert_eq!(TagControl::FullyQualified8.tag_len(), 8);
    }

    #[test]
    fn test_tag_picks_smallest_form() {
        assert_eq!(Tag::CommonProfile(0xFFFF).control(), TagControl::CommonProfile2);
        assert_eq!(Tag::CommonProfile(0x10000).control(), TagControl::CommonProfile4);
        let fq = Tag::FullyQualified {
            vendor: 0xFFF1,
            profile: 0xDEED,
            tag: 1,
        };
        assert_eq!(fq.control(), TagControl::FullyQualified6);
    }

    #[test]
    fn test_member_lookup() {
        let value = Value::Structure(vec![
            Element::context(1, true),
            Element::context(2, 7u64),
        ]);
        assert_eq!(value.member(2).map(|e| &e.value), Some(&Value::Unsigned(7)));
        assert!(value.member(3).is_none());
    }
}
