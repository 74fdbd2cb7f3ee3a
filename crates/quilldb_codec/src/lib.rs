//! # QuillDB Codec
//!
//! The document value model and its encodings.
//!
//! This crate provides:
//! - [`Value`], the normalized form of every stored document field
//! - Normalization of Rust types into values with `serde` ([`to_value`],
//!   [`to_document`]) and conversion back ([`from_value`], [`from_document`])
//! - Deterministic canonical CBOR for stored document bodies
//! - A total value order ([`compare`], [`values_equal`]) and an
//!   order-preserving key encoding ([`encode_key`]) for index keys
//!
//! ## Canonical CBOR Rules
//!
//! - Map keys are strings, sorted length-first then bytewise
//! - Integers use shortest encoding
//! - Floats are always 64-bit with a single NaN pattern
//! - Instants use the extended time tag
//! - No indefinite-length items
//!
//! ## Usage
//!
//! ```
//! use quilldb_codec::{decode_document, encode_document, to_document};
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct User {
//!     name: String,
//!     age: u32,
//! }
//!
//! let doc = to_document(&User { name: "Ada".into(), age: 36 }).unwrap();
//! let bytes = encode_document(&doc).unwrap();
//! assert_eq!(decode_document(&bytes).unwrap(), doc);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod datetime;
mod de;
mod decoder;
mod encoder;
mod error;
mod keycode;
mod ordering;
mod ser;
mod value;

pub use de::{from_document, from_value};
pub use decoder::{decode_document, from_cbor, CanonicalDecoder};
pub use encoder::{encode_document, to_canonical_cbor, CanonicalEncoder};
pub use error::{CodecError, CodecResult};
pub use keycode::{encode_key, is_indexable, key_len, read_escaped, write_escaped, write_key};
pub use ordering::{compare, sort_cmp, values_equal};
pub use ser::{is_empty, to_document, to_value};
pub use value::{lookup_path, Value, ValueKind, ValueMap, MAX_DEPTH};
