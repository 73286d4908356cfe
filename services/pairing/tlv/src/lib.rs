//! Tag-length-value codec for pairing messages.
//!
//! This crate provides the compact binary encoding used by every handshake
//! message and certificate: an element model, a minimal-width encoder, a
//! bounded decoder, declarative schemas with path-carrying errors, and a
//! [`TlvObject`] trait for typed messages.
//!
//! ## Wire Format
//!
//! ```text
//! +-----------------------+--------------------------------------+
//! | control (1B)          | tag control (3b) | element type (5b) |
//! +-----------------------+--------------------------------------+
//! | tag (0/1/2/4/6/8B)    | per tag control                      |
//! +-----------------------+--------------------------------------+
//! | length (0/1/2/4/8B)   | strings and byte strings only        |
//! +-----------------------+--------------------------------------+
//! | value                 | little endian; containers end 0x18   |
//! +-----------------------+--------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod element;
pub mod error;
pub mod object;
pub mod reader;
pub mod schema;
pub mod writer;

// Re-export main types
pub use element::{Element, ElementType, Tag, TagControl, Value};
pub use error::{TlvError, ValidationError};
pub use object::{StructBuilder, StructView, TlvObject};
pub use reader::{decode, TlvReader, MAX_DEPTH};
pub use schema::{Field, Schema};
pub use writer::{encode, encode_into, encoded_len};
