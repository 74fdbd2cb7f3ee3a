//! Normalization of Rust values into [`Value`] through `serde`.
//!
//! Field naming follows the `serde` attributes of the input type: `rename`
//! sets the stored name, `skip` omits a field, and
//! `skip_serializing_if = "quilldb_codec::is_empty"` omits zero values.

use crate::error::{CodecError, CodecResult};
use crate::value::{Value, ValueMap, MAX_DEPTH};
use chrono::{DateTime, Utc};
use serde::ser::{self, Impossible, Serialize};

/// Newtype name used by [`crate::datetime`] to mark instants.
pub(crate) const DATETIME_TOKEN: &str = "$quilldb::private::DateTime";

/// Normalizes any serializable value.
///
/// Narrow integers become [`Value::Integer`], `u64` becomes
/// [`Value::Unsigned`], `None` and `()` become [`Value::Null`], structs and
/// maps become [`Value::Map`], sequences and tuples become [`Value::Array`].
/// Enum unit variants become their name; other variants become a single-key
/// mapping from the variant name to its content.
///
/// # Errors
///
/// Fails on maps with non-string keys, on integers outside the 64-bit
/// range, and on nesting deeper than [`MAX_DEPTH`] (which is how reference
/// cycles surface).
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> CodecResult<Value> {
    value.serialize(ValueSerializer { depth: 0 })
}

/// Normalizes a record into a document mapping.
///
/// # Errors
///
/// Fails like [`to_value`], and when the value does not normalize to a
/// mapping.
pub fn to_document<T: Serialize + ?Sized>(value: &T) -> CodecResult<ValueMap> {
    match to_value(value)? {
        Value::Map(map) => Ok(map),
        other => Err(CodecError::unsupported_type(format!(
            "a document must be a record, found {}",
            other.kind()
        ))),
    }
}

/// Returns true if `value` normalizes to the zero of its type.
///
/// Intended for `#[serde(skip_serializing_if = "quilldb_codec::is_empty")]`.
pub fn is_empty<T: Serialize + ?Sized>(value: &T) -> bool {
    to_value(value).map_or(false, |v| v.is_zero())
}

#[derive(Clone, Copy)]
struct ValueSerializer {
    depth: usize,
}

impl ValueSerializer {
    fn nested(self) -> CodecResult<Self> {
        if self.depth >= MAX_DEPTH {
            return Err(CodecError::TooDeep {
                max_depth: MAX_DEPTH,
            });
        }
        Ok(Self {
            depth: self.depth + 1,
        })
    }
}

fn single_entry(key: &str, value: Value) -> Value {
    let mut map = ValueMap::new();
    map.insert(key.to_string(), value);
    Value::Map(map)
}

impl ser::Serializer for ValueSerializer {
    type Ok = Value;
    type Error = CodecError;

    type SerializeSeq = SeqSerializer;
    type SerializeTuple = SeqSerializer;
    type SerializeTupleStruct = SeqSerializer;
    type SerializeTupleVariant = SeqSerializer;
    type SerializeMap = MapSerializer;
    type SerializeStruct = MapSerializer;
    type SerializeStructVariant = MapSerializer;

    fn serialize_bool(self, v: bool) -> CodecResult<Value> {
        Ok(Value::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> CodecResult<Value> {
        Ok(Value::Integer(i64::from(v)))
    }

    fn serialize_i16(self, v: i16) -> CodecResult<Value> {
        Ok(Value::Integer(i64::from(v)))
    }

    fn serialize_i32(self, v: i32) -> CodecResult<Value> {
        Ok(Value::Integer(i64::from(v)))
    }

    fn serialize_i64(self, v: i64) -> CodecResult<Value> {
        Ok(Value::Integer(v))
    }

    fn serialize_i128(self, v: i128) -> CodecResult<Value> {
        if let Ok(n) = i64::try_from(v) {
            Ok(Value::Integer(n))
        } else {
            u64::try_from(v)
                .map(Value::Unsigned)
                .map_err(|_| CodecError::IntegerOverflow)
        }
    }

    fn serialize_u8(self, v: u8) -> CodecResult<Value> {
        Ok(Value::Integer(i64::from(v)))
    }

    fn serialize_u16(self, v: u16) -> CodecResult<Value> {
        Ok(Value::Integer(i64::from(v)))
    }

    fn serialize_u32(self, v: u32) -> CodecResult<Value> {
        Ok(Value::Integer(i64::from(v)))
    }

    fn serialize_u64(self, v: u64) -> CodecResult<Value> {
        Ok(Value::Unsigned(v))
    }

    fn serialize_u128(self, v: u128) -> CodecResult<Value> {
        u64::try_from(v)
            .map(Value::Unsigned)
            .map_err(|_| CodecError::IntegerOverflow)
    }

    fn serialize_f32(self, v: f32) -> CodecResult<Value> {
        Ok(Value::Float(f64::from(v)))
    }

    fn serialize_f64(self, v: f64) -> CodecResult<Value> {
        Ok(Value::Float(v))
    }

    fn serialize_char(self, v: char) -> CodecResult<Value> {
        Ok(Value::Text(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> CodecResult<Value> {
        Ok(Value::Text(v.to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> CodecResult<Value> {
        Ok(Value::Bytes(v.to_vec()))
    }

    fn serialize_none(self) -> CodecResult<Value> {
        Ok(Value::Null)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> CodecResult<Value> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> CodecResult<Value> {
        Ok(Value::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> CodecResult<Value> {
        Ok(Value::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> CodecResult<Value> {
        Ok(Value::Text(variant.to_string()))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        name: &'static str,
        value: &T,
    ) -> CodecResult<Value> {
        if name != DATETIME_TOKEN {
            return value.serialize(self);
        }
        match value.serialize(self)? {
            Value::Text(s) => DateTime::parse_from_rfc3339(&s)
                .map(|t| Value::Time(t.with_timezone(&Utc)))
                .map_err(|e| CodecError::encoding_failed(format!("invalid instant {s:?}: {e}"))),
            time @ Value::Time(_) => Ok(time),
            other => Err(CodecError::encoding_failed(format!(
                "expected an instant, found {}",
                other.kind()
            ))),
        }
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> CodecResult<Value> {
        let inner = value.serialize(self.nested()?)?;
        Ok(single_entry(variant, inner))
    }

    fn serialize_seq(self, len: Option<usize>) -> CodecResult<SeqSerializer> {
        Ok(SeqSerializer {
            items: Vec::with_capacity(len.unwrap_or(0).min(1024)),
            ser: self.nested()?,
            variant: None,
        })
    }

    fn serialize_tuple(self, len: usize) -> CodecResult<SeqSerializer> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> CodecResult<SeqSerializer> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> CodecResult<SeqSerializer> {
        let mut seq = self.serialize_seq(Some(len))?;
        seq.variant = Some(variant);
        Ok(seq)
    }

    fn serialize_map(self, _len: Option<usize>) -> CodecResult<MapSerializer> {
        Ok(MapSerializer {
            map: ValueMap::new(),
            next_key: None,
            ser: self.nested()?,
            variant: None,
        })
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> CodecResult<MapSerializer> {
        self.serialize_map(Some(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> CodecResult<MapSerializer> {
        let mut map = self.serialize_map(Some(len))?;
        map.variant = Some(variant);
        Ok(map)
    }
}

struct SeqSerializer {
    items: Vec<Value>,
    ser: ValueSerializer,
    variant: Option<&'static str>,
}

impl SeqSerializer {
    fn push<T: Serialize + ?Sized>(&mut self, value: &T) -> CodecResult<()> {
        self.items.push(value.serialize(self.ser)?);
        Ok(())
    }

    fn finish(self) -> Value {
        let array = Value::Array(self.items);
        match self.variant {
            Some(variant) => single_entry(variant, array),
            None => array,
        }
    }
}

impl ser::SerializeSeq for SeqSerializer {
    type Ok = Value;
    type Error = CodecError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> CodecResult<()> {
        self.push(value)
    }

    fn end(self) -> CodecResult<Value> {
        Ok(self.finish())
    }
}

impl ser::SerializeTuple for SeqSerializer {
    type Ok = Value;
    type Error = CodecError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> CodecResult<()> {
        self.push(value)
    }

    fn end(self) -> CodecResult<Value> {
        Ok(self.finish())
    }
}

impl ser::SerializeTupleStruct for SeqSerializer {
    type Ok = Value;
    type Error = CodecError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> CodecResult<()> {
        self.push(value)
    }

    fn end(self) -> CodecResult<Value> {
        Ok(self.finish())
    }
}

impl ser::SerializeTupleVariant for SeqSerializer {
    type Ok = Value;
    type Error = CodecError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> CodecResult<()> {
        self.push(value)
    }

    fn end(self) -> CodecResult<Value> {
        Ok(self.finish())
    }
}

struct MapSerializer {
    map: ValueMap,
    next_key: Option<String>,
    ser: ValueSerializer,
    variant: Option<&'static str>,
}

impl MapSerializer {
    fn insert<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> CodecResult<()> {
        let value = value.serialize(self.ser)?;
        self.map.insert(key.to_string(), value);
        Ok(())
    }

    fn finish(self) -> Value {
        let map = Value::Map(self.map);
        match self.variant {
            Some(variant) => single_entry(variant, map),
            None => map,
        }
    }
}

impl ser::SerializeMap for MapSerializer {
    type Ok = Value;
    type Error = CodecError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> CodecResult<()> {
        self.next_key = Some(key.serialize(MapKeySerializer)?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> CodecResult<()> {
        let key = self
            .next_key
            .take()
            .ok_or_else(|| CodecError::encoding_failed("map value without a key"))?;
        self.insert(&key, value)
    }

    fn end(self) -> CodecResult<Value> {
        Ok(self.finish())
    }
}

impl ser::SerializeStruct for MapSerializer {
    type Ok = Value;
    type Error = CodecError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> CodecResult<()> {
        self.insert(key, value)
    }

    fn end(self) -> CodecResult<Value> {
        Ok(self.finish())
    }
}

impl ser::SerializeStructVariant for MapSerializer {
    type Ok = Value;
    type Error = CodecError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> CodecResult<()> {
        self.insert(key, value)
    }

    fn end(self) -> CodecResult<Value> {
        Ok(self.finish())
    }
}

/// Accepts only string-like map keys.
struct MapKeySerializer;

fn non_string_key(found: &str) -> CodecError {
    CodecError::NonStringKey {
        found: found.to_string(),
    }
}

impl ser::Serializer for MapKeySerializer {
    type Ok = String;
    type Error = CodecError;

    type SerializeSeq = Impossible<String, CodecError>;
    type SerializeTuple = Impossible<String, CodecError>;
    type SerializeTupleStruct = Impossible<String, CodecError>;
    type SerializeTupleVariant = Impossible<String, CodecError>;
    type SerializeMap = Impossible<String, CodecError>;
    type SerializeStruct = Impossible<String, CodecError>;
    type SerializeStructVariant = Impossible<String, CodecError>;

    fn serialize_str(self, v: &str) -> CodecResult<String> {
        Ok(v.to_string())
    }

    fn serialize_char(self, v: char) -> CodecResult<String> {
        Ok(v.to_string())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> CodecResult<String> {
        Ok(variant.to_string())
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> CodecResult<String> {
        value.serialize(self)
    }

    fn serialize_bool(self, _v: bool) -> CodecResult<String> {
        Err(non_string_key("bool"))
    }

    fn serialize_i8(self, _v: i8) -> CodecResult<String> {
        Err(non_string_key("integer"))
    }

    fn serialize_i16(self, _v: i16) -> CodecResult<String> {
        Err(non_string_key("integer"))
    }

    fn serialize_i32(self, _v: i32) -> CodecResult<String> {
        Err(non_string_key("integer"))
    }

    fn serialize_i64(self, _v: i64) -> CodecResult<String> {
        Err(non_string_key("integer"))
    }

    fn serialize_u8(self, _v: u8) -> CodecResult<String> {
        Err(non_string_key("integer"))
    }

    fn serialize_u16(self, _v: u16) -> CodecResult<String> {
        Err(non_string_key("integer"))
    }

    fn serialize_u32(self, _v: u32) -> CodecResult<String> {
        Err(non_string_key("integer"))
    }

    fn serialize_u64(self, _v: u64) -> CodecResult<String> {
        Err(non_string_key("integer"))
    }

    fn serialize_f32(self, _v: f32) -> CodecResult<String> {
        Err(non_string_key("float"))
    }

    fn serialize_f64(self, _v: f64) -> CodecResult<String> {
        Err(non_string_key("float"))
    }

    fn serialize_bytes(self, _v: &[u8]) -> CodecResult<String> {
        Err(non_string_key("bytes"))
    }

    fn serialize_none(self) -> CodecResult<String> {
        Err(non_string_key("null"))
    }

    fn serialize_some<T: Serialize + ?Sized>(self, _value: &T) -> CodecResult<String> {
        Err(non_string_key("option"))
    }

    fn serialize_unit(self) -> CodecResult<String> {
        Err(non_string_key("unit"))
    }

    fn serialize_unit_struct(self, _name: &'static str) -> CodecResult<String> {
        Err(non_string_key("unit struct"))
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> CodecResult<String> {
        Err(non_string_key("enum"))
    }

    fn serialize_seq(self, _len: Option<usize>) -> CodecResult<Self::SerializeSeq> {
        Err(non_string_key("sequence"))
    }

    fn serialize_tuple(self, _len: usize) -> CodecResult<Self::SerializeTuple> {
        Err(non_string_key("tuple"))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> CodecResult<Self::SerializeTupleStruct> {
        Err(non_string_key("tuple struct"))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> CodecResult<Self::SerializeTupleVariant> {
        Err(non_string_key("enum"))
    }

    fn serialize_map(self, _len: Option<usize>) -> CodecResult<Self::SerializeMap> {
        Err(non_string_key("map"))
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> CodecResult<Self::SerializeStruct> {
        Err(non_string_key("struct"))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> CodecResult<Self::SerializeStructVariant> {
        Err(non_string_key("enum"))
    }
}
