//! Canonical CBOR encoder.

use crate::error::CodecResult;
use crate::value::{Value, ValueMap};
use chrono::{DateTime, Utc};

/// Tag marking an unsigned integer so it decodes back to [`Value::Unsigned`].
pub const TAG_UNSIGNED: u64 = 65_280;

/// Tag for extended time (RFC 9581): a map of `{1: seconds, -9: nanoseconds}`.
pub const TAG_EXTENDED_TIME: u64 = 1001;

/// The canonical quiet NaN bit pattern.
pub(crate) const CANONICAL_NAN: u64 = 0x7ff8_0000_0000_0000;

/// Encode a value to canonical CBOR bytes.
///
/// This function produces deterministic output:
/// - Map keys are sorted by their encoded form (length-first, then bytewise)
/// - Integers use the shortest possible encoding
/// - Floats are always written as 64-bit with a single NaN pattern
/// - No indefinite-length encoding
///
/// # Errors
///
/// Encoding a normalized value does not fail today; the result type is kept
/// so callers propagate future format checks.
pub fn to_canonical_cbor(value: &Value) -> CodecResult<Vec<u8>> {
    let mut encoder = CanonicalEncoder::new();
    encoder.encode(value)?;
    Ok(encoder.into_bytes())
}

/// Encode a document (a string-keyed mapping) to canonical CBOR bytes.
///
/// # Errors
///
/// See [`to_canonical_cbor`].
pub fn encode_document(doc: &ValueMap) -> CodecResult<Vec<u8>> {
    let mut encoder = CanonicalEncoder::with_capacity(64);
    encoder.encode_map(doc)?;
    Ok(encoder.into_bytes())
}

/// A canonical CBOR encoder.
///
/// Identical values always produce identical bytes, so encoded documents
/// can be compared and hashed directly.
#[derive(Debug, Default)]
pub struct CanonicalEncoder {
    buffer: Vec<u8>,
}

impl CanonicalEncoder {
    /// Create a new encoder.
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Create a new encoder with the specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Encode a value.
    ///
    /// # Errors
    ///
    /// See [`to_canonical_cbor`].
    pub fn encode(&mut self, value: &Value) -> CodecResult<()> {
        match value {
            Value::Null => self.encode_null(),
            Value::Bool(b) => self.encode_bool(*b),
            Value::Integer(n) => self.encode_integer(*n),
            Value::Unsigned(n) => {
                self.encode_unsigned(6, TAG_UNSIGNED);
                self.encode_unsigned(0, *n);
            }
            Value::Float(f) => self.encode_float(*f),
            Value::Text(s) => self.encode_text(s),
            Value::Bytes(b) => self.encode_bytes(b),
            Value::Time(t) => self.encode_time(t),
            Value::Array(arr) => return self.encode_array(arr),
            Value::Map(map) => return self.encode_map(map),
        }
        Ok(())
    }

    /// Consume this encoder and return the encoded bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Get a reference to the encoded bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    fn encode_null(&mut self) {
        // CBOR null is simple value 22 (0xf6)
        self.buffer.push(0xf6);
    }

    fn encode_bool(&mut self, b: bool) {
        // CBOR false is 0xf4, true is 0xf5
        self.buffer.push(if b { 0xf5 } else { 0xf4 });
    }

    #[allow(clippy::cast_sign_loss)]
    fn encode_integer(&mut self, n: i64) {
        if n >= 0 {
            self.encode_unsigned(0, n as u64);
        } else {
            // CBOR negative integers encode -(n+1): -1 is 0, -2 is 1
            self.encode_unsigned(1, !(n as u64));
        }
    }

    fn encode_float(&mut self, f: f64) {
        let bits = if f.is_nan() { CANONICAL_NAN } else { f.to_bits() };
        self.buffer.push(0xfb);
        self.buffer.extend_from_slice(&bits.to_be_bytes());
    }

    fn encode_time(&mut self, t: &DateTime<Utc>) {
        self.encode_unsigned(6, TAG_EXTENDED_TIME);
        self.encode_unsigned(5, 2);
        self.encode_integer(1);
        self.encode_integer(t.timestamp());
        self.encode_integer(-9);
        self.encode_integer(i64::from(t.timestamp_subsec_nanos()));
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode_unsigned(&mut self, major_type: u8, value: u64) {
        let mt = major_type << 5;

        if value < 24 {
            self.buffer.push(mt | (value as u8));
        } else if u8::try_from(value).is_ok() {
            self.buffer.push(mt | 24);
            self.buffer.push(value as u8);
        } else if u16::try_from(value).is_ok() {
            self.buffer.push(mt | 25);
            self.buffer.extend_from_slice(&(value as u16).to_be_bytes());
        } else if u32::try_from(value).is_ok() {
            self.buffer.push(mt | 26);
            self.buffer.extend_from_slice(&(value as u32).to_be_bytes());
        } else {
            self.buffer.push(mt | 27);
            self.buffer.extend_from_slice(&value.to_be_bytes());
        }
    }

    fn encode_bytes(&mut self, bytes: &[u8]) {
        self.encode_unsigned(2, bytes.len() as u64);
        self.buffer.extend_from_slice(bytes);
    }

    fn encode_text(&mut self, text: &str) {
        self.encode_unsigned(3, text.len() as u64);
        self.buffer.extend_from_slice(text.as_bytes());
    }

    fn encode_array(&mut self, arr: &[Value]) -> CodecResult<()> {
        self.encode_unsigned(4, arr.len() as u64);
        for item in arr {
            self.encode(item)?;
        }
        Ok(())
    }

    fn encode_map(&mut self, map: &ValueMap) -> CodecResult<()> {
        self.encode_unsigned(5, map.len() as u64);

        // Text keys encode as header + UTF-8 bytes, so length-first ordering
        // of the encoded key equals (byte length, bytes) of the string.
        let mut entries: Vec<(&String, &Value)> = map.iter().collect();
        entries.sort_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));

        for (key, value) in entries {
            self.encode_text(key);
            self.encode(value)?;
        }
        Ok(())
    }
}
