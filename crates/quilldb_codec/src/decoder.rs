//! Canonical CBOR decoder.

use crate::encoder::{TAG_EXTENDED_TIME, TAG_UNSIGNED};
use crate::error::{CodecError, CodecResult};
use crate::value::{Value, ValueMap, MAX_DEPTH};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;

/// Decode a value from CBOR bytes.
///
/// The whole input must be consumed by a single value.
///
/// # Errors
///
/// Returns an error if the bytes are not valid CBOR, are not in canonical
/// form, or contain constructs outside the document value model.
pub fn from_cbor(bytes: &[u8]) -> CodecResult<Value> {
    let mut decoder = CanonicalDecoder::new(bytes);
    let value = decoder.decode()?;
    if !decoder.is_empty() {
        return Err(CodecError::invalid_structure("trailing bytes after value"));
    }
    Ok(value)
}

/// Decode a document (a string-keyed mapping) from CBOR bytes.
///
/// # Errors
///
/// Returns an error if the bytes do not hold a canonical CBOR map.
pub fn decode_document(bytes: &[u8]) -> CodecResult<ValueMap> {
    match from_cbor(bytes)? {
        Value::Map(map) => Ok(map),
        other => Err(CodecError::decoding_failed(format!(
            "expected a document map, found {}",
            other.kind()
        ))),
    }
}

/// A canonical CBOR decoder.
///
/// This decoder validates that input follows canonical CBOR rules
/// and rejects forbidden constructs.
pub struct CanonicalDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

/// Maximum allowed element count for arrays and maps.
const MAX_CONTAINER_ELEMENTS: u64 = 16 * 1024 * 1024;

/// Maximum allowed byte/string length.
const MAX_BYTES_LENGTH: u64 = 256 * 1024 * 1024;

impl<'a> CanonicalDecoder<'a> {
    /// Create a new decoder for the given bytes.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
        }
    }

    /// Decode the next value.
    ///
    /// # Errors
    ///
    /// See [`from_cbor`].
    pub fn decode(&mut self) -> CodecResult<Value> {
        let initial_byte = self.read_byte()?;
        let major_type = initial_byte >> 5;
        let additional_info = initial_byte & 0x1f;

        match major_type {
            0 => {
                let n = self.decode_unsigned(additional_info)?;
                i64::try_from(n)
                    .map(Value::Integer)
                    .map_err(|_| CodecError::IntegerOverflow)
            }
            1 => {
                // Negative integer: value is -(n+1)
                let n = self.decode_unsigned(additional_info)?;
                i64::try_from(n)
                    .map(|n| Value::Integer(-n - 1))
                    .map_err(|_| CodecError::IntegerOverflow)
            }
            2 => self.decode_bytes(additional_info),
            3 => self.decode_text(additional_info),
            4 => self.nested(|d| d.decode_array(additional_info)),
            5 => self.nested(|d| d.decode_map(additional_info)),
            6 => self.decode_tagged(additional_info),
            7 => self.decode_simple(additional_info),
            _ => Err(CodecError::invalid_structure("invalid major type")),
        }
    }

    /// Check if all bytes have been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Get remaining bytes.
    #[must_use]
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    fn nested(
        &mut self,
        f: impl FnOnce(&mut Self) -> CodecResult<Value>,
    ) -> CodecResult<Value> {
        if self.depth >= MAX_DEPTH {
            return Err(CodecError::TooDeep {
                max_depth: MAX_DEPTH,
            });
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    #[inline]
    fn read_byte(&mut self) -> CodecResult<u8> {
        let byte = *self.data.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    #[inline]
    fn read_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(CodecError::UnexpectedEof)?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    #[inline]
    fn read_array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    #[inline]
    fn decode_unsigned(&mut self, additional_info: u8) -> CodecResult<u64> {
        const NON_CANONICAL: &str = "non-canonical: value could be encoded in fewer bytes";
        match additional_info {
            0..=23 => Ok(u64::from(additional_info)),
            24 => {
                let byte = self.read_byte()?;
                if byte < 24 {
                    return Err(CodecError::invalid_structure(NON_CANONICAL));
                }
                Ok(u64::from(byte))
            }
            25 => {
                let value = u16::from_be_bytes(self.read_array()?);
                if u8::try_from(value).is_ok() {
                    return Err(CodecError::invalid_structure(NON_CANONICAL));
                }
                Ok(u64::from(value))
            }
            26 => {
                let value = u32::from_be_bytes(self.read_array()?);
                if u16::try_from(value).is_ok() {
                    return Err(CodecError::invalid_structure(NON_CANONICAL));
                }
                Ok(u64::from(value))
            }
            27 => {
                let value = u64::from_be_bytes(self.read_array()?);
                if u32::try_from(value).is_ok() {
                    return Err(CodecError::invalid_structure(NON_CANONICAL));
                }
                Ok(value)
            }
            31 => Err(CodecError::IndefiniteLengthForbidden),
            _ => Err(CodecError::invalid_structure("reserved additional info")),
        }
    }

    fn decode_length(&mut self, additional_info: u8, max_allowed: u64) -> CodecResult<usize> {
        let claimed = self.decode_unsigned(additional_info)?;
        if claimed > max_allowed {
            return Err(CodecError::SizeLimitExceeded {
                claimed,
                max_allowed,
            });
        }
        usize::try_from(claimed).map_err(|_| CodecError::IntegerOverflow)
    }

    fn decode_bytes(&mut self, additional_info: u8) -> CodecResult<Value> {
        let len = self.decode_length(additional_info, MAX_BYTES_LENGTH)?;
        let bytes = self.read_bytes(len)?;
        Ok(Value::Bytes(bytes.to_vec()))
    }

    fn decode_text(&mut self, additional_info: u8) -> CodecResult<Value> {
        self.decode_str(additional_info)
            .map(|s| Value::Text(s.to_string()))
    }

    fn decode_str(&mut self, additional_info: u8) -> CodecResult<&'a str> {
        let len = self.decode_length(additional_info, MAX_BYTES_LENGTH)?;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    fn decode_array(&mut self, additional_info: u8) -> CodecResult<Value> {
        let len = self.decode_length(additional_info, MAX_CONTAINER_ELEMENTS)?;
        let mut items = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            items.push(self.decode()?);
        }
        Ok(Value::Array(items))
    }

    fn decode_map(&mut self, additional_info: u8) -> CodecResult<Value> {
        let len = self.decode_length(additional_info, MAX_CONTAINER_ELEMENTS)?;
        let mut map = ValueMap::new();
        let mut prev_key: Option<&'a [u8]> = None;

        for _ in 0..len {
            let key_start = self.pos;
            let initial_byte = self.read_byte()?;
            if initial_byte >> 5 != 3 {
                return Err(CodecError::NonStringKey {
                    found: format!("CBOR major type {}", initial_byte >> 5),
                });
            }
            let key = self.decode_str(initial_byte & 0x1f)?;
            let data = self.data;
            let key_bytes = &data[key_start..self.pos];

            // Keys must be strictly increasing
            if let Some(prev) = prev_key {
                if compare_cbor_bytes(prev, key_bytes) != Ordering::Less {
                    return Err(CodecError::invalid_structure(
                        "non-canonical: map keys not in sorted order",
                    ));
                }
            }
            prev_key = Some(key_bytes);

            let value = self.decode()?;
            map.insert(key.to_string(), value);
        }

        Ok(Value::Map(map))
    }

    fn decode_tagged(&mut self, additional_info: u8) -> CodecResult<Value> {
        match self.decode_unsigned(additional_info)? {
            TAG_UNSIGNED => {
                let initial_byte = self.read_byte()?;
                if initial_byte >> 5 != 0 {
                    return Err(CodecError::invalid_structure(
                        "unsigned tag must wrap a non-negative integer",
                    ));
                }
                self.decode_unsigned(initial_byte & 0x1f).map(Value::Unsigned)
            }
            TAG_EXTENDED_TIME => self.decode_time(),
            tag => Err(CodecError::unsupported_type(format!("CBOR tag {tag}"))),
        }
    }

    fn decode_time(&mut self) -> CodecResult<Value> {
        // Exactly {1: seconds, -9: nanoseconds}, in canonical key order.
        let shape = || CodecError::invalid_structure("malformed extended time");
        if self.read_byte()? != 0xa2 || self.read_byte()? != 0x01 {
            return Err(shape());
        }
        let secs = match self.decode()? {
            Value::Integer(n) => n,
            _ => return Err(shape()),
        };
        if self.read_byte()? != 0x28 {
            return Err(shape());
        }
        let nanos = match self.decode()? {
            Value::Integer(n) => u32::try_from(n).map_err(|_| shape())?,
            _ => return Err(shape()),
        };
        DateTime::<Utc>::from_timestamp(secs, nanos)
            .map(Value::Time)
            .ok_or_else(|| CodecError::decoding_failed("instant out of range"))
    }

    fn decode_simple(&mut self, additional_info: u8) -> CodecResult<Value> {
        match additional_info {
            20 => Ok(Value::Bool(false)),
            21 => Ok(Value::Bool(true)),
            22 => Ok(Value::Null),
            24 => {
                let simple = self.read_byte()?;
                match simple {
                    0..=31 => Err(CodecError::invalid_structure(
                        "non-canonical: simple value should use direct encoding",
                    )),
                    _ => Err(CodecError::unsupported_type(format!(
                        "simple value {simple}"
                    ))),
                }
            }
            25 | 26 => Err(CodecError::invalid_structure(
                "non-canonical: floats must be 64-bit",
            )),
            27 => {
                let bits = u64::from_be_bytes(self.read_array()?);
                let value = f64::from_bits(bits);
                if value.is_nan() && bits != crate::encoder::CANONICAL_NAN {
                    return Err(CodecError::invalid_structure(
                        "non-canonical: NaN payload",
                    ));
                }
                Ok(Value::Float(value))
            }
            28..=30 => Err(CodecError::invalid_structure("reserved additional info")),
            31 => Err(CodecError::invalid_structure("break without indefinite")),
            _ => Err(CodecError::unsupported_type(format!(
                "simple value {additional_info}"
            ))),
        }
    }
}

/// Compare two CBOR byte sequences for canonical ordering.
/// Uses length-first, then bytewise comparison.
fn compare_cbor_bytes(a: &[u8], b: &[u8]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::to_canonical_cbor;
    use chrono::TimeZone;

    #[test]
    fn decode_simple_values() {
        assert_eq!(from_cbor(&[0xf6]).unwrap(), Value::Null);
        assert_eq!(from_cbor(&[0xf4]).unwrap(), Value::Bool(false));
        assert_eq!(from_cbor(&[0xf5]).unwrap(), Value::Bool(true));
    }

    #[test]
    fn decode_integers() {
        assert_eq!(from_cbor(&[0x17]).unwrap(), Value::Integer(23));
        assert_eq!(from_cbor(&[0x18, 255]).unwrap(), Value::Integer(255));
        assert_eq!(from_cbor(&[0x19, 0x01, 0x00]).unwrap(), Value::Integer(256));
        assert_eq!(from_cbor(&[0x20]).unwrap(), Value::Integer(-1));
        assert_eq!(from_cbor(&[0x38, 99]).unwrap(), Value::Integer(-100));
    }

    #[test]
    fn integer_out_of_range_is_rejected() {
        let mut bytes = vec![0x1b];
        bytes.extend_from_slice(&u64::MAX.to_be_bytes());
        assert!(matches!(from_cbor(&bytes), Err(CodecError::IntegerOverflow)));
    }

    #[test]
    fn decode_tagged_unsigned() {
        let mut bytes = vec![0xd9, 0xff, 0x00, 0x1b];
        bytes.extend_from_slice(&u64::MAX.to_be_bytes());
        assert_eq!(from_cbor(&bytes).unwrap(), Value::Unsigned(u64::MAX));
    }

    #[test]
    fn decode_text_and_bytes() {
        assert_eq!(from_cbor(&[0x60]).unwrap(), Value::Text(String::new()));
        assert_eq!(
            from_cbor(&[0x65, b'h', b'e', b'l', b'l', b'o']).unwrap(),
            Value::from("hello")
        );
        assert_eq!(
            from_cbor(&[0x43, 1, 2, 3]).unwrap(),
            Value::Bytes(vec![1, 2, 3])
        );
    }

    #[test]
    fn decode_map() {
        assert_eq!(from_cbor(&[0xa0]).unwrap(), Value::Map(ValueMap::new()));
        let mut expected = ValueMap::new();
        expected.insert("a".into(), Value::Integer(1));
        assert_eq!(
            from_cbor(&[0xa1, 0x61, b'a', 0x01]).unwrap(),
            Value::Map(expected)
        );
    }

    #[test]
    fn decode_time() {
        let t = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let bytes = to_canonical_cbor(&Value::Time(t)).unwrap();
        assert_eq!(from_cbor(&bytes).unwrap(), Value::Time(t));
    }

    #[test]
    fn reject_short_floats() {
        assert!(matches!(
            from_cbor(&[0xf9, 0x00, 0x00]),
            Err(CodecError::InvalidStructure { .. })
        ));
        assert!(matches!(
            from_cbor(&[0xfa, 0x00, 0x00, 0x00, 0x00]),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn reject_noncanonical_nan() {
        assert!(from_cbor(&[0xfb, 0x7f, 0xf8, 0, 0, 0, 0, 0, 0])
            .unwrap()
            .as_f64()
            .unwrap()
            .is_nan());
        assert!(from_cbor(&[0xfb, 0x7f, 0xf0, 0, 0, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn reject_indefinite_length() {
        assert!(matches!(
            from_cbor(&[0x5f, 0x41, b'a', 0xff]),
            Err(CodecError::IndefiniteLengthForbidden)
        ));
        assert!(matches!(
            from_cbor(&[0x9f, 0x01, 0xff]),
            Err(CodecError::IndefiniteLengthForbidden)
        ));
        assert!(matches!(
            from_cbor(&[0xbf, 0x61, b'a', 0x01, 0xff]),
            Err(CodecError::IndefiniteLengthForbidden)
        ));
    }

    #[test]
    fn reject_non_shortest_encoding() {
        assert!(matches!(
            from_cbor(&[0x18, 23]),
            Err(CodecError::InvalidStructure { .. })
        ));
        assert!(matches!(
            from_cbor(&[0x19, 0x00, 0xff]),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn reject_unsorted_map_keys() {
        assert!(matches!(
            from_cbor(&[0xa2, 0x61, b'b', 0x01, 0x61, b'a', 0x02]),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn reject_non_string_map_keys() {
        assert!(matches!(
            from_cbor(&[0xa1, 0x01, 0x02]),
            Err(CodecError::NonStringKey { .. })
        ));
    }

    #[test]
    fn reject_unknown_tags_and_trailing_bytes() {
        assert!(matches!(
            from_cbor(&[0xc1, 0x00]),
            Err(CodecError::UnsupportedType { .. })
        ));
        assert!(from_cbor(&[0x01, 0x02]).is_err());
    }

    #[test]
    fn reject_excessive_nesting() {
        let bytes = vec![0x81; MAX_DEPTH + 1];
        assert!(matches!(
            from_cbor(&bytes),
            Err(CodecError::TooDeep { .. })
        ));
    }

    #[test]
    fn unexpected_eof() {
        assert!(matches!(from_cbor(&[]), Err(CodecError::UnexpectedEof)));
        assert!(matches!(from_cbor(&[0x18]), Err(CodecError::UnexpectedEof)));
        assert!(matches!(
            from_cbor(&[0x19, 0x01]),
            Err(CodecError::UnexpectedEof)
        ));
    }

    #[test]
    fn invalid_utf8_rejected() {
        assert!(matches!(
            from_cbor(&[0x62, 0xff, 0xfe]),
            Err(CodecError::InvalidUtf8)
        ));
    }

    #[test]
    fn document_must_be_map() {
        assert!(decode_document(&[0xa0]).unwrap().is_empty());
        assert!(decode_document(&[0x01]).is_err());
    }

    #[test]
    fn ciborium_output_with_sorted_keys_decodes() {
        let mut bytes = Vec::new();
        let map = ciborium::value::Value::Map(vec![
            (
                ciborium::value::Value::Text("a".into()),
                ciborium::value::Value::Integer(1.into()),
            ),
            (
                ciborium::value::Value::Text("bb".into()),
                ciborium::value::Value::Text("x".into()),
            ),
        ]);
        ciborium::ser::into_writer(&map, &mut bytes).unwrap();
        let doc = decode_document(&bytes).unwrap();
        assert_eq!(doc.get("a"), Some(&Value::Integer(1)));
        assert_eq!(doc.get("bb"), Some(&Value::from("x")));
    }
}
