//! Declarative schemas for TLV values.
//!
//! A [`Schema`] checks a decoded [`Value`] and returns a normalized copy:
//! integers are coerced to the declared signedness, structure members are
//! reduced to the declared fields in declaration order, and unknown context
//! tags are dropped. Errors carry the path of the failing field.

use crate::element::{Element, Tag, Value};
use crate::ValidationError;

/// A structure member declaration
#[derive(Debug, Clone)]
pub struct Field {
    /// Context tag on the wire
    pub tag: u8,
    /// Name used in error paths
    pub name: &'static str,
    /// Schema of the member value
    pub schema: Schema,
    /// Whether the member may be absent
    pub optional: bool,
}

impl Field {
    /// A field that must be present
    pub fn required(tag: u8, name: &'static str, schema: Schema) -> Self {
        Self {
            tag,
            name,
            schema,
            optional: false,
        }
    }

    /// A field that may be absent
    pub fn optional(tag: u8, name: &'static str, schema: Schema) -> Self {
        Self {
            tag,
            name,
            schema,
            optional: true,
        }
    }
}

/// Value schema
#[derive(Debug, Clone)]
pub enum Schema {
    /// Accept any value unchanged
    Any,
    /// Boolean
    Boolean,
    /// Unsigned integer within inclusive bounds
    UInt {
        /// Minimum
        min: u64,
        /// Maximum
        max: u64,
    },
    /// Signed integer within inclusive bounds
    Int {
        /// Minimum
        min: i64,
        /// Maximum
        max: i64,
    },
    /// Floating point number; integers are widened
    Float,
    /// UTF-8 string with byte length bounds
    Utf8 {
        /// Minimum length
        min_len: usize,
        /// Maximum length
        max_len: usize,
    },
    /// Byte string with length bounds
    Bytes {
        /// Minimum length
        min_len: usize,
        /// Maximum length
        max_len: usize,
    },
    /// Null
    Null,
    /// Null or the inner schema
    Nullable(Box<Schema>),
    /// Array of values of one schema
    Array {
        /// Item schema
        item: Box<Schema>,
        /// Minimum number of items
        min_len: usize,
        /// Maximum number of items
        max_len: usize,
    },
    /// Structure with context-tagged fields
    Object(Vec<Field>),
    /// Unsigned integer restricted to a set of values
    Enum(Vec<u64>),
}

impl Schema {
    /// `u8` range
    pub fn uint8() -> Self {
        Schema::UInt {
            min: 0,
            max: u8::MAX as u64,
        }
    }

    /// `u16` range
    pub fn uint16() -> Self {
        Schema::UInt {
            min: 0,
            max: u16::MAX as u64,
        }
    }

    /// `u32` range
    pub fn uint32() -> Self {
        Schema::UInt {
            min: 0,
            max: u32::MAX as u64,
        }
    }

    /// `u64` range
    pub fn uint64() -> Self {
        Schema::UInt { min: 0, max: u64::MAX }
    }

    /// Byte string of exactly `len` bytes
    pub fn bytes(len: usize) -> Self {
        Schema::Bytes {
            min_len: len,
            max_len: len,
        }
    }

    /// Byte string with inclusive length bounds
    pub fn bytes_between(min_len: usize, max_len: usize) -> Self {
        Schema::Bytes { min_len, max_len }
    }

    /// UTF-8 string of at most `max_len` bytes
    pub fn utf8(max_len: usize) -> Self {
        Schema::Utf8 { min_len: 0, max_len }
    }

    /// Array of up to `max_len` items
    pub fn array(item: Schema, max_len: usize) -> Self {
        Schema::Array {
            item: Box::new(item),
            min_len: 0,
            max_len,
        }
    }

    /// Structure schema
    pub fn object(fields: Vec<Field>) -> Self {
        Schema::Object(fields)
    }

    /// Name of the type this schema expects
    pub fn type_name(&self) -> &'static str {
        match self {
            Schema::Any => "any",
            Schema::Boolean => "boolean",
            Schema::UInt { .. } | Schema::Enum(_) => "unsigned integer",
            Schema::Int { .. } => "integer",
            Schema::Float => "number",
            Schema::Utf8 { .. } => "string",
            Schema::Bytes { .. } => "byte string",
            Schema::Null => "null",
            Schema::Nullable(inner) => inner.type_name(),
            Schema::Array { .. } => "array",
            Schema::Object(_) => "object",
        }
    }

    /// Check `value` and return its normalized form
    pub fn validate(&self, value: &Value) -> Result<Value, ValidationError> {
        match self {
            Schema::Any => Ok(value.clone()),
            Schema::Boolean => match value {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                other => Err(self.mismatch(other)),
            },
            Schema::UInt { min, max } => {
                let v = self.unsigned(value)?;
                if v < *min || v > *max {
                    return Err(ValidationError::OutOfBounds {
                        value: v as i128,
                        min: *min as i128,
                        max: *max as i128,
                    });
                }
                Ok(Value::Unsigned(v))
            }
            Schema::Int { min, max } => {
                let v: i128 = match value {
                    Value::Signed(v) => *v as i128,
                    Value::Unsigned(v) => *v as i128,
                    other => return Err(self.mismatch(other)),
                };
                if v < *min as i128 || v > *max as i128 {
                    return Err(ValidationError::OutOfBounds {
                        value: v,
                        min: *min as i128,
                        max: *max as i128,
                    });
                }
                Ok(Value::Signed(v as i64))
            }
            Schema::Float => match value {
                Value::Float(_) | Value::Double(_) => Ok(value.clone()),
                Value::Signed(v) => Ok(Value::Double(*v as f64)),
                Value::Unsigned(v) => Ok(Value::Double(*v as f64)),
                other => Err(self.mismatch(other)),
            },
            Schema::Utf8 { min_len, max_len } => match value {
                Value::Utf8(s) => {
                    check_len(s.len(), *min_len, *max_len)?;
                    Ok(value.clone())
                }
                other => Err(self.mismatch(other)),
            },
            Schema::Bytes { min_len, max_len } => match value {
                Value::Bytes(b) => {
                    check_len(b.len(), *min_len, *max_len)?;
                    Ok(value.clone())
                }
                other => Err(self.mismatch(other)),
            },
            Schema::Null => match value {
                Value::Null => Ok(Value::Null),
                other => Err(self.mismatch(other)),
            },
            Schema::Nullable(inner) => match value {
                Value::Null => Ok(Value::Null),
                other => inner.validate(other),
            },
            Schema::Array {
                item,
                min_len,
                max_len,
            } => match value {
                Value::Array(items) => {
                    check_len(items.len(), *min_len, *max_len)?;
                    let mut out = Vec::with_capacity(items.len());
                    for (index, element) in items.iter().enumerate() {
                        let v = item.validate(&element.value).map_err(|e| {
                            ValidationError::Item {
                                index,
                                source: Box::new(e),
                            }
                        })?;
                        out.push(Element::anonymous(v));
                    }
                    Ok(Value::Array(out))
                }
                other => Err(self.mismatch(other)),
            },
            Schema::Object(fields) => match value {
                Value::Structure(members) => validate_object(fields, members),
                other => Err(self.mismatch(other)),
            },
            Schema::Enum(allowed) => {
                let v = self.unsigned(value)?;
                if !allowed.contains(&v) {
                    return Err(ValidationError::Enum(v));
                }
                Ok(Value::Unsigned(v))
            }
        }
    }

    fn unsigned(&self, value: &Value) -> Result<u64, ValidationError> {
        match value {
            Value::Unsigned(v) => Ok(*v),
            Value::Signed(v) if *v >= 0 => Ok(*v as u64),
            Value::Signed(v) => Err(ValidationError::OutOfBounds {
                value: *v as i128,
                min: 0,
                max: u64::MAX as i128,
            }),
            other => Err(self.mismatch(other)),
        }
    }

    fn mismatch(&self, actual: &Value) -> ValidationError {
        ValidationError::TypeMismatch {
            expected: self.type_name(),
            actual: actual.type_name(),
        }
    }
}

fn check_len(len: usize, min: usize, max: usize) -> Result<(), ValidationError> {
    if len < min || len > max {
        return Err(ValidationError::Length { len, min, max });
    }
    Ok(())
}

fn validate_object(fields: &[Field], members: &[Element]) -> Result<Value, ValidationError> {
    let mut seen = [false; 256];
    for member in members {
        if let Tag::Context(tag) = member.tag {
            if seen[tag as usize] {
                return Err(ValidationError::DuplicateField(tag));
            }
            seen[tag as usize] = true;
        }
    }

    let mut out = Vec::with_capacity(fields.len());
    for field in fields {
        let member = members.iter().find(|m| m.tag == Tag::Context(field.tag));
        match member {
            Some(member) => {
                let v = field
                    .schema
                    .validate(&member.value)
                    .map_err(|e| e.in_field(field.name))?;
                out.push(Element::context(field.tag, v));
            }
            None if field.optional => {}
            None => {
                return Err(ValidationError::MissingField {
                    name: field.name,
                    tag: field.tag,
                })
            }
        }
    }
    Ok(Value::Structure(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boolean_type_mismatch_message() {
        let err = Schema::Boolean.validate(&Value::from("a")).unwrap_err();
        assert_eq!(err.to_string(), "Expected boolean, got string.");
        assert_eq!(Schema::Boolean.validate(&Value::Bool(true)).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_signed_coerces_to_unsigned() {
        let v = Schema::uint16().validate(&Value::Signed(300)).unwrap();
        assert_eq!(v, Value::Unsigned(300));
        assert!(matches!(
            Schema::uint8().validate(&Value::Signed(300)),
            Err(ValidationError::OutOfBounds { value: 300, .. })
        ));
        assert!(matches!(
            Schema::uint8().validate(&Value::Signed(-1)),
            Err(ValidationError::OutOfBounds { value: -1, .. })
        ));
    }

    #[test]
    fn test_bytes_length_bounds() {
        let schema = Schema::bytes_between(16, 32);
        assert!(schema.validate(&Value::Bytes(vec![0; 16])).is_ok());
        assert_eq!(
            schema.validate(&Value::Bytes(vec![0; 8])).unwrap_err(),
            ValidationError::Length {
                len: 8,
                min: 16,
                max: 32
            }
        );
    }

    #[test]
    fn test_object_missing_and_optional_fields() {
        let schema = Schema::object(vec![
            Field::required(1, "random", Schema::bytes(4)),
            Field::optional(2, "sessionId", Schema::uint16()),
        ]);

        let ok = Value::Structure(vec![Element::context(1, vec![1, 2, 3, 4])]);
        let out = schema.validate(&ok).unwrap();
        assert!(out.member(2).is_none());

        let missing = Value::Structure(vec![Element::context(2, 5u64)]);
        assert_eq!(
            schema.validate(&missing).unwrap_err(),
            ValidationError::MissingField {
                name: "random",
                tag: 1
            }
        );
    }

    #[test]
    fn test_object_error_carries_path() {
        let schema = Schema::object(vec![Field::required(
            1,
            "params",
            Schema::object(vec![Field::required(1, "iterations", Schema::uint32())]),
        )]);
        let value = Value::Structure(vec![Element::context(
            1,
            Value::Structure(vec![Element::context(1, "many")]),
        )]);
        let err = schema.validate(&value).unwrap_err();
        assert_eq!(
            err.to_string(),
            "params: iterations: Expected unsigned integer, got string."
        );
        assert!(matches!(err.root_cause(), ValidationError::TypeMismatch { .. }));
    }

    #[test]
    fn test_object_rejects_duplicate_and_drops_unknown() {
        let schema = Schema::object(vec![Field::required(1, "a", Schema::Boolean)]);
        let dup = Value::Structure(vec![Element::context(1, true), Element::context(1, false)]);
        assert_eq!(schema.validate(&dup).unwrap_err(), ValidationError::DuplicateField(1));

        let extra = Value::Structure(vec![Element::context(1, true), Element::context(7, 1u64)]);
        let out = schema.validate(&extra).unwrap();
        assert_eq!(out, Value::Structure(vec![Element::context(1, true)]));
    }

    #[test]
    fn test_array_and_enum() {
        let schema = Schema::array(Schema::Enum(vec![0, 1, 4]), 2);
        let ok = Value::Array(vec![Element::anonymous(4u64)]);
        assert!(schema.validate(&ok).is_ok());

        let bad = Value::Array(vec![Element::anonymous(1u64), Element::anonymous(2u64)]);
        let err = schema.validate(&bad).unwrap_err();
        assert_eq!(
            err,
            ValidationError::Item {
                index: 1,
                source: Box::new(ValidationError::Enum(2))
            }
        );

        let too_long = Value::Array(vec![Element::anonymous(0u64); 3]);
        assert!(matches!(
            schema.validate(&too_long),
            Err(ValidationError::Length { len: 3, .. })
        ));
    }

    #[test]
    fn test_nullable() {
        let schema = Schema::Nullable(Box::new(Schema::uint8()));
        assert_eq!(schema.validate(&Value::Null).unwrap(), Value::Null);
        assert_eq!(schema.validate(&Value::Unsigned(3)).unwrap(), Value::Unsigned(3));
    }
}
