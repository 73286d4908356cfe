//! TLV encoding.
//!
//! Integers and length prefixes are always written in the narrowest form
//! that holds the value, which makes [`encoded_len`] a pure function of the
//! element: outer messages can reserve or restate their length without a
//! second encoding pass.

use crate::element::{Element, ElementType, Tag, Value};
use bytes::{BufMut, Bytes, BytesMut};

/// Encode an element into a new buffer
pub fn encode(element: &Element) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len(element));
    encode_into(element, &mut buf);
    buf.freeze()
}

/// Encode an element at the end of `buf`
pub fn encode_into(element: &Element, buf: &mut BytesMut) {
    let element_type = element_type_of(&element.value);
    buf.put_u8(element.tag.control() as u8 | element_type as u8);
    put_tag(&element.tag, buf);

    match &element.value {
        Value::Signed(v) => match element_type {
            ElementType::Int8 => buf.put_i8(*v as i8),
            ElementType::Int16 => buf.put_i16_le(*v as i16),
            ElementType::Int32 => buf.put_i32_le(*v as i32),
            _ => buf.put_i64_le(*v),
        },
        Value::Unsigned(v) => match element_type {
            ElementType::UInt8 => buf.put_u8(*v as u8),
            ElementType::UInt16 => buf.put_u16_le(*v as u16),
            ElementType::UInt32 => buf.put_u32_le(*v as u32),
            _ => buf.put_u64_le(*v),
        },
        Value::Bool(_) | Value::Null => {}
        Value::Float(v) => buf.put_f32_le(*v),
        Value::Double(v) => buf.put_f64_le(*v),
        Value::Utf8(s) => {
            put_length(element_type, s.len(), buf);
            buf.put_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            put_length(element_type, b.len(), buf);
            buf.put_slice(b);
        }
        Value::Structure(children) | Value::Array(children) | Value::List(children) => {
            for child in children {
                encode_into(child, buf);
            }
            buf.put_u8(ElementType::EndOfContainer as u8);
        }
    }
}

/// Number of bytes [`encode`] will produce for `element`
pub fn encoded_len(element: &Element) -> usize {
    let element_type = element_type_of(&element.value);
    let header = 1 + element.tag.control().tag_len();

    let body = match &element.value {
        Value::Bool(_) | Value::Null => 0,
        Value::Signed(_) | Value::Unsigned(_) | Value::Float(_) | Value::Double(_) => {
            element_type.size_field_width()
        }
        Value::Utf8(s) => element_type.size_field_width() + s.len(),
        Value::Bytes(b) => element_type.size_field_width() + b.len(),
        Value::Structure(children) | Value::Array(children) | Value::List(children) => {
            children.iter().map(encoded_len).sum::<usize>() + 1
        }
    };

    header + body
}

/// Element type the encoder selects for a value
pub fn element_type_of(value: &Value) -> ElementType {
    match value {
        Value::Signed(v) => {
            if i8::try_from(*v).is_ok() {
                ElementType::Int8
            } else if i16::try_from(*v).is_ok() {
                ElementType::Int16
            } else if i32::try_from(*v).is_ok() {
                ElementType::Int32
            } else {
                ElementType::Int64
            }
        }
        Value::Unsigned(v) => {
            if *v <= u8::MAX as u64 {
                ElementType::UInt8
            } else if *v <= u16::MAX as u64 {
                ElementType::UInt16
            } else if *v <= u32::MAX as u64 {
                ElementType::UInt32
            } else {
                ElementType::UInt64
            }
        }
        Value::Bool(true) => ElementType::True,
        Value::Bool(false) => ElementType::False,
        Value::Float(_) => ElementType::Float,
        Value::Double(_) => ElementType::Double,
        Value::Utf8(s) => sized(ElementType::Utf8L1 as u8, s.len()),
        Value::Bytes(b) => sized(ElementType::BytesL1 as u8, b.len()),
        Value::Null => ElementType::Null,
        Value::Structure(_) => ElementType::Structure,
        Value::Array(_) => ElementType::Array,
        Value::List(_) => ElementType::List,
    }
}

fn sized(base: u8, len: usize) -> ElementType {
    let offset = if len <= u8::MAX as usize {
        0
    } else if len <= u16::MAX as usize {
        1
    } else if len <= u32::MAX as usize {
        2
    } else {
        3
    };
    // base + offset is always one of the sized string types
    ElementType::try_from(base + offset).unwrap_or(ElementType::BytesL8)
}

fn put_length(element_type: ElementType, len: usize, buf: &mut BytesMut) {
    match element_type.size_field_width() {
        1 => buf.put_u8(len as u8),
        2 => buf.put_u16_le(len as u16),
        4 => buf.put_u32_le(len as u32),
        _ => buf.put_u64_le(len as u64),
    }
}

fn put_tag(tag: &Tag, buf: &mut BytesMut) {
    match *tag {
        Tag::Anonymous => {}
        Tag::Context(t) => buf.put_u8(t),
        Tag::CommonProfile(t) | Tag::ImplicitProfile(t) => {
            if t <= u16::MAX as u32 {
                buf.put_u16_le(t as u16);
            } else {
                buf.put_u32_le(t);
            }
        }
        Tag::FullyQualified {
            vendor,
            profile,
            tag,
        } => {
            buf.put_u16_le(vendor);
            buf.put_u16_le(profile);
            if tag <= u16::MAX as u32 {
                buf.put_u16_le(tag as u16);
            } else {
                buf.put_u32_le(tag);
            }
        }
    }
}
