//! TLV decoding.

use crate::element::{Element, ElementType, Tag, TagControl, Value};
use crate::TlvError;
use bytes::Buf;
use tracing::trace;

/// Maximum container nesting accepted by the decoder
pub const MAX_DEPTH: usize = 16;

/// Decode exactly one element; trailing bytes are an error
pub fn decode(buf: &[u8]) -> Result<Element, TlvError> {
    let mut reader = TlvReader::new(buf);
    let element = reader.read_element()?.ok_or(TlvError::UnexpectedEnd)?;
    if reader.remaining() > 0 {
        return Err(TlvError::TrailingBytes(reader.remaining()));
    }
    Ok(element)
}

/// Streaming reader over a TLV byte buffer
#[derive(Debug)]
pub struct TlvReader<'a> {
    buf: &'a [u8],
}

impl<'a> TlvReader<'a> {
    /// Create a reader over `buf`
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Read the next element. Returns `Ok(None)` when an end-of-container
    /// marker is consumed instead.
    pub fn read_element(&mut self) -> Result<Option<Element>, TlvError> {
        self.read_at_depth(0)
    }

    fn read_at_depth(&mut self, depth: usize) -> Result<Option<Element>, TlvError> {
        self.need(1)?;
        let (tag_control, raw_type) = TagControl::split(self.buf.get_u8());
        let element_type = ElementType::try_from(raw_type)?;

        if element_type == ElementType::EndOfContainer {
            if tag_control != TagControl::Anonymous {
                return Err(TlvError::Tag("end of container must be anonymous"));
            }
            return Ok(None);
        }

        let tag = self.read_tag(tag_control)?;
        let value = match element_type {
            ElementType::Int8 => {
                self.need(1)?;
                Value::Signed(self.buf.get_i8() as i64)
            }
            ElementType::Int16 => {
                self.need(2)?;
                Value::Signed(self.buf.get_i16_le() as i64)
            }
            ElementType::Int32 => {
                self.need(4)?;
                Value::Signed(self.buf.get_i32_le() as i64)
            }
            ElementType::Int64 => {
                self.need(8)?;
                Value::Signed(self.buf.get_i64_le())
            }
            ElementType::UInt8 => {
                self.need(1)?;
                Value::Unsigned(self.buf.get_u8() as u64)
            }
            ElementType::UInt16 => {
                self.need(2)?;
                Value::Unsigned(self.buf.get_u16_le() as u64)
            }
            ElementType::UInt32 => {
                self.need(4)?;
                Value::Unsigned(self.buf.get_u32_le() as u64)
            }
            ElementType::UInt64 => {
                self.need(8)?;
                Value::Unsigned(self.buf.get_u64_le())
            }
            ElementType::False => Value::Bool(false),
            ElementType::True => Value::Bool(true),
            ElementType::Float => {
                self.need(4)?;
                Value::Float(self.buf.get_f32_le())
            }
            ElementType::Double => {
                self.need(8)?;
                Value::Double(self.buf.get_f64_le())
            }
            ElementType::Utf8L1
            | ElementType::Utf8L2
            | ElementType::Utf8L4
            | ElementType::Utf8L8 => {
                let bytes = self.read_sized(element_type)?;
                Value::Utf8(String::from_utf8(bytes).map_err(|_| TlvError::Utf8)?)
            }
            ElementType::BytesL1
            | ElementType::BytesL2
            | ElementType::BytesL4
            | ElementType::BytesL8 => Value::Bytes(self.read_sized(element_type)?),
            ElementType::Null => Value::Null,
            ElementType::Structure => Value::Structure(self.read_children(depth)?),
            ElementType::Array => Value::Array(self.read_children(depth)?),
            ElementType::List => Value::List(self.read_children(depth)?),
            ElementType::EndOfContainer => return Ok(None),
        };

        Ok(Some(Element { tag, value }))
    }

    fn read_children(&mut self, depth: usize) -> Result<Vec<Element>, TlvError> {
        if depth + 1 > MAX_DEPTH {
            return Err(TlvError::Depth(MAX_DEPTH));
        }

        let mut children = Vec::new();
        loop {
            if self.buf.is_empty() {
                return Err(TlvError::Unterminated);
            }
            match self.read_at_depth(depth + 1)? {
                Some(child) => children.push(child),
                None => break,
            }
        }
        trace!("decoded container with {} children at depth {}", children.len(), depth);
        Ok(children)
    }

    fn read_tag(&mut self, tag_control: TagControl) -> Result<Tag, TlvError> {
        self.need(tag_control.tag_len())?;
        let tag = match tag_control {
            TagControl::Anonymous => Tag::Anonymous,
            TagControl::Context => Tag::Context(self.buf.get_u8()),
            TagControl::CommonProfile2 => Tag::CommonProfile(self.buf.get_u16_le() as u32),
            TagControl::CommonProfile4 => Tag::CommonProfile(self.buf.get_u32_le()),
            TagControl::ImplicitProfile2 => Tag::ImplicitProfile(self.buf.get_u16_le() as u32),
            TagControl::ImplicitProfile4 => Tag::ImplicitProfile(self.buf.get_u32_le()),
            TagControl::FullyQualified6 => Tag::FullyQualified {
                vendor: self.buf.get_u16_le(),
                profile: self.buf.get_u16_le(),
                tag: self.buf.get_u16_le() as u32,
            },
            TagControl::FullyQualified8 => Tag::FullyQualified {
                vendor: self.buf.get_u16_le(),
                profile: self.buf.get_u16_le(),
                tag: self.buf.get_u32_le(),
            },
        };
        Ok(tag)
    }

    fn read_sized(&mut self, element_type: ElementType) -> Result<Vec<u8>, TlvError> {
        let width = element_type.size_field_width();
        self.need(width)?;
        let len = match width {
            1 => self.buf.get_u8() as u64,
            2 => self.buf.get_u16_le() as u64,
            4 => self.buf.get_u32_le() as u64,
            _ => self.buf.get_u64_le(),
        };
        let len = usize::try_from(len).map_err(|_| TlvError::Length(len))?;
        self.need(len)?;
        let bytes = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(bytes)
    }

    fn need(&self, n: usize) -> Result<(), TlvError> {
        if self.buf.remaining() < n {
            return Err(TlvError::Truncated {
                needed: n - self.buf.remaining(),
            });
        }
        Ok(())
    }
}
