//! TLV error types.

use thiserror::Error;

/// Structural decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TlvError {
    /// Buffer ended before the element was complete
    #[error("truncated element: need {needed} more bytes")]
    Truncated {
        /// Number of missing bytes
        needed: usize,
    },

    /// Unknown element type in control byte
    #[error("unknown element type 0x{0:02x}")]
    ElementType(u8),

    /// End-of-container marker outside of a container
    #[error("unexpected end of container")]
    UnexpectedEnd,

    /// Container not closed before end of input
    #[error("container not terminated")]
    Unterminated,

    /// Extra bytes after the top-level element
    #[error("{0} trailing bytes after element")]
    TrailingBytes(usize),

    /// Container nesting exceeds the decoder limit
    #[error("nesting depth exceeds {0}")]
    Depth(usize),

    /// Declared length does not fit the platform
    #[error("length {0} exceeds limits")]
    Length(u64),

    /// UTF-8 string payload is not valid UTF-8
    #[error("invalid utf-8 string")]
    Utf8,

    /// Tag form not allowed at this position
    #[error("invalid tag: {0}")]
    Tag(&'static str),
}

/// Schema validation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Structural decode failure
    #[error("decode failed: {0}")]
    Decode(#[from] TlvError),

    /// Value has the wrong type
    #[error("Expected {expected}, got {actual}.")]
    TypeMismatch {
        /// Expected type name
        expected: &'static str,
        /// Actual type name
        actual: &'static str,
    },

    /// Numeric value outside schema bounds
    #[error("value {value} out of bounds [{min}, {max}]")]
    OutOfBounds {
        /// Offending value (as signed 128 so both signednesses fit)
        value: i128,
        /// Inclusive minimum
        min: i128,
        /// Inclusive maximum
        max: i128,
    },

    /// String, byte string or array length outside schema bounds
    #[error("length {len} out of bounds [{min}, {max}]")]
    Length {
        /// Actual length
        len: usize,
        /// Inclusive minimum
        min: usize,
        /// Inclusive maximum
        max: usize,
    },

    /// Value not in the allowed enum set
    #[error("value {0} is not a valid enum member")]
    Enum(u64),

    /// Required field missing from structure
    #[error("missing required field {name} (tag {tag})")]
    MissingField {
        /// Field name
        name: &'static str,
        /// Context tag
        tag: u8,
    },

    /// Same context tag appears twice in a structure
    #[error("duplicate field tag {0}")]
    DuplicateField(u8),

    /// Error inside a named structure field
    #[error("{name}: {source}")]
    Field {
        /// Field name
        name: &'static str,
        /// Underlying error
        source: Box<ValidationError>,
    },

    /// Error inside an array element
    #[error("[{index}]: {source}")]
    Item {
        /// Element position
        index: usize,
        /// Underlying error
        source: Box<ValidationError>,
    },
}

impl ValidationError {
    /// Wrap this error with the name of the field it occurred in
    pub fn in_field(self, name: &'static str) -> Self {
        ValidationError::Field {
            name,
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping field/item path wrappers
    pub fn root_cause(&self) -> &ValidationError {
        match self {
            ValidationError::Field { source, .. } | ValidationError::Item { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}
