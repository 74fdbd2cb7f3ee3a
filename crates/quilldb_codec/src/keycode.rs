//! Order-preserving key encoding.
//!
//! Encodes values so that comparing the encoded bytes with `memcmp` gives the
//! same result as [`crate::compare`]. Every encoding is self-delimiting, so
//! more key components can follow it and a value's encoding is never a
//! prefix of another value's encoding.
//!
//! | Class  | Layout                                                   |
//! |--------|----------------------------------------------------------|
//! | null   | `01`                                                     |
//! | bool   | `02` + `00`/`01`                                         |
//! | number | `03` + ordered f64 bits (8) + sign-flipped residual (8)  |
//! | string | `04` + escaped UTF-8 + `00 00`                           |
//! | time   | `05` + sign-flipped seconds (8) + nanoseconds (4)        |
//! | bytes  | `06` + escaped bytes + `00 00`                           |
//! | list   | `07` + element encodings + `00`                          |
//!
//! Numbers of every width share one layout: the value rounded to the nearest
//! double, then the exact integer difference between the value and that
//! double. Equal numbers encode identically regardless of their width.
//! Mappings have no order and cannot be encoded.

use crate::encoder::CANONICAL_NAN;
use crate::error::{CodecError, CodecResult};
use crate::value::Value;
use chrono::{DateTime, Utc};

// Type prefixes, in cross-class order
const TYPE_NULL: u8 = 0x01;
const TYPE_BOOL: u8 = 0x02;
const TYPE_NUMBER: u8 = 0x03;
const TYPE_STRING: u8 = 0x04;
const TYPE_TIME: u8 = 0x05;
const TYPE_BYTES: u8 = 0x06;
const TYPE_LIST: u8 = 0x07;

const LIST_END: u8 = 0x00;
const SIGN_BIT: u64 = 1 << 63;

const NUMBER_LEN: usize = 17;
const TIME_LEN: usize = 13;

/// Returns true if `value` has an order-preserving encoding.
///
/// Mappings, and lists containing mappings, are not encodable.
#[must_use]
pub fn is_indexable(value: &Value) -> bool {
    match value {
        Value::Map(_) => false,
        Value::Array(items) => items.iter().all(is_indexable),
        _ => true,
    }
}

/// Encode a value with order preservation.
///
/// # Errors
///
/// Returns [`CodecError::UnsupportedType`] if the value is or contains a
/// mapping.
pub fn encode_key(value: &Value) -> CodecResult<Vec<u8>> {
    let mut out = Vec::with_capacity(NUMBER_LEN);
    write_key(value, &mut out)?;
    Ok(out)
}

/// Append the order-preserving encoding of `value` to `out`.
///
/// # Errors
///
/// See [`encode_key`].
pub fn write_key(value: &Value, out: &mut Vec<u8>) -> CodecResult<()> {
    match value {
        Value::Null => out.push(TYPE_NULL),
        Value::Bool(b) => out.extend_from_slice(&[TYPE_BOOL, u8::from(*b)]),
        Value::Integer(_) | Value::Unsigned(_) | Value::Float(_) => write_number(value, out),
        Value::Text(s) => {
            out.push(TYPE_STRING);
            write_escaped(s.as_bytes(), out);
        }
        Value::Time(t) => write_time(t, out),
        Value::Bytes(b) => {
            out.push(TYPE_BYTES);
            write_escaped(b, out);
        }
        Value::Array(items) => {
            out.push(TYPE_LIST);
            for item in items {
                write_key(item, out)?;
            }
            out.push(LIST_END);
        }
        Value::Map(_) => {
            return Err(CodecError::unsupported_type(
                "map values have no key encoding",
            ))
        }
    }
    Ok(())
}

/// Returns the length of the encoded value at the start of `input`.
///
/// # Errors
///
/// Returns an error if `input` does not start with a complete encoding.
pub fn key_len(input: &[u8]) -> CodecResult<usize> {
    let tag = *input.first().ok_or(CodecError::UnexpectedEof)?;
    let len = match tag {
        TYPE_NULL => 1,
        TYPE_BOOL => 2,
        TYPE_NUMBER => NUMBER_LEN,
        TYPE_TIME => TIME_LEN,
        TYPE_STRING | TYPE_BYTES => 1 + escaped_len(&input[1..])?,
        TYPE_LIST => {
            let mut pos = 1;
            loop {
                match input.get(pos) {
                    None => return Err(CodecError::UnexpectedEof),
                    Some(&LIST_END) => break pos + 1,
                    Some(_) => pos += key_len(&input[pos..])?,
                }
            }
        }
        other => {
            return Err(CodecError::decoding_failed(format!(
                "unknown key type prefix {other:#04x}"
            )))
        }
    };
    if len > input.len() {
        return Err(CodecError::UnexpectedEof);
    }
    Ok(len)
}

/// Append `bytes` with every `00` escaped as `00 FF`, then the `00 00`
/// terminator.
pub fn write_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for &byte in bytes {
        if byte == 0x00 {
            out.extend_from_slice(&[0x00, 0xFF]);
        } else {
            out.push(byte);
        }
    }
    out.extend_from_slice(&[0x00, 0x00]);
}

/// Reads an escaped, terminated byte string from the start of `input`.
///
/// Returns the unescaped bytes and the number of input bytes consumed.
///
/// # Errors
///
/// Returns an error on a missing terminator or an invalid escape.
pub fn read_escaped(input: &[u8]) -> CodecResult<(Vec<u8>, usize)> {
    let mut result = Vec::new();
    let mut i = 0;
    while i < input.len() {
        if input[i] == 0x00 {
            match input.get(i + 1) {
                Some(0xFF) => {
                    result.push(0x00);
                    i += 2;
                }
                Some(0x00) => return Ok((result, i + 2)),
                _ => return Err(CodecError::decoding_failed("invalid escape in key")),
            }
        } else {
            result.push(input[i]);
            i += 1;
        }
    }
    Err(CodecError::UnexpectedEof)
}

fn escaped_len(input: &[u8]) -> CodecResult<usize> {
    let mut i = 0;
    while i < input.len() {
        if input[i] == 0x00 {
            match input.get(i + 1) {
                Some(0xFF) => i += 2,
                Some(0x00) => return Ok(i + 2),
                _ => return Err(CodecError::decoding_failed("invalid escape in key")),
            }
        } else {
            i += 1;
        }
    }
    Err(CodecError::UnexpectedEof)
}

/// Maps a double onto `u64` so that unsigned order matches numeric order.
fn ordered_bits(f: f64) -> u64 {
    let bits = f.to_bits();
    if bits & SIGN_BIT != 0 {
        // Negative: flip all bits
        !bits
    } else {
        // Positive: flip only the sign bit
        bits | SIGN_BIT
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn write_number(value: &Value, out: &mut Vec<u8>) {
    let (approx, residual) = match value {
        Value::Integer(n) => {
            let approx = *n as f64;
            (approx, i128::from(*n) - approx as i128)
        }
        Value::Unsigned(n) => {
            let approx = *n as f64;
            (approx, i128::from(*n) - approx as i128)
        }
        Value::Float(f) if f.is_nan() => (f64::from_bits(CANONICAL_NAN), 0),
        // Collapses -0.0 onto 0.0
        Value::Float(f) if *f == 0.0 => (0.0, 0),
        Value::Float(f) => (*f, 0),
        _ => (f64::from_bits(CANONICAL_NAN), 0),
    };
    // Rounding a 64-bit integer to a double moves it by at most 2^10
    let residual = residual as i64;

    out.push(TYPE_NUMBER);
    out.extend_from_slice(&ordered_bits(approx).to_be_bytes());
    out.extend_from_slice(&((residual as u64) ^ SIGN_BIT).to_be_bytes());
}

#[allow(clippy::cast_sign_loss)]
fn write_time(t: &DateTime<Utc>, out: &mut Vec<u8>) {
    out.push(TYPE_TIME);
    out.extend_from_slice(&((t.timestamp() as u64) ^ SIGN_BIT).to_be_bytes());
    out.extend_from_slice(&t.timestamp_subsec_nanos().to_be_bytes());
}
