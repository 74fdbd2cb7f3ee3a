//! Conversion of normalized values back into Rust types through `serde`.

use crate::error::{CodecError, CodecResult};
use crate::ser::DATETIME_TOKEN;
use crate::value::{Value, ValueMap};
use chrono::SecondsFormat;
use serde::de::{
    self, DeserializeOwned, DeserializeSeed, EnumAccess, IntoDeserializer, MapAccess, SeqAccess,
    VariantAccess, Visitor,
};
use serde::forward_to_deserialize_any;
use std::collections::btree_map;

/// Converts a normalized value into any deserializable type.
///
/// Integer widths narrow with range checks, [`Value::Time`] is read by
/// `quilldb_codec::datetime` fields (or as an RFC 3339 string), and
/// `serde(alias)` names are accepted as fallbacks for renamed fields.
///
/// # Errors
///
/// Returns [`CodecError::Conversion`] when the value's shape does not match
/// the target type.
pub fn from_value<T: DeserializeOwned>(value: Value) -> CodecResult<T> {
    T::deserialize(value)
}

/// Converts a document mapping into any deserializable type.
///
/// # Errors
///
/// See [`from_value`].
pub fn from_document<T: DeserializeOwned>(doc: ValueMap) -> CodecResult<T> {
    from_value(Value::Map(doc))
}

fn rfc3339(value: &chrono::DateTime<chrono::Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

impl<'de> de::Deserializer<'de> for Value {
    type Error = CodecError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> CodecResult<V::Value> {
        match self {
            Value::Null => visitor.visit_unit(),
            Value::Bool(b) => visitor.visit_bool(b),
            Value::Integer(n) => visitor.visit_i64(n),
            Value::Unsigned(n) => visitor.visit_u64(n),
            Value::Float(f) => visitor.visit_f64(f),
            Value::Text(s) => visitor.visit_string(s),
            Value::Bytes(b) => visitor.visit_byte_buf(b),
            Value::Time(t) => visitor.visit_string(rfc3339(&t)),
            Value::Array(items) => visitor.visit_seq(SeqDeserializer::new(items)),
            Value::Map(map) => visitor.visit_map(MapDeserializer::new(map)),
        }
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> CodecResult<V::Value> {
        match self {
            Value::Null => visitor.visit_none(),
            other => visitor.visit_some(other),
        }
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        visitor: V,
    ) -> CodecResult<V::Value> {
        match self {
            Value::Time(t) if name == DATETIME_TOKEN => {
                visitor.visit_newtype_struct(Value::Text(rfc3339(&t)))
            }
            other => visitor.visit_newtype_struct(other),
        }
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> CodecResult<V::Value> {
        match self {
            // Byte strings read back into `Vec<u8>` and friends
            Value::Bytes(bytes) => visitor.visit_seq(SeqDeserializer::new(
                bytes.into_iter().map(|b| Value::Integer(i64::from(b))).collect(),
            )),
            other => other.deserialize_any(visitor),
        }
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> CodecResult<V::Value> {
        match self {
            Value::Text(variant) => visitor.visit_enum(EnumDeserializer {
                variant,
                value: None,
            }),
            Value::Map(map) if map.len() == 1 => {
                let mut entries = map.into_iter();
                let (variant, value) = entries
                    .next()
                    .ok_or_else(|| CodecError::conversion("empty enum mapping"))?;
                visitor.visit_enum(EnumDeserializer {
                    variant,
                    value: Some(value),
                })
            }
            other => Err(CodecError::conversion(format!(
                "expected an enum variant, found {}",
                other.kind()
            ))),
        }
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct tuple tuple_struct map struct
        identifier ignored_any
    }
}

impl<'de> IntoDeserializer<'de, CodecError> for Value {
    type Deserializer = Self;

    fn into_deserializer(self) -> Self {
        self
    }
}

struct SeqDeserializer {
    iter: std::vec::IntoIter<Value>,
}

impl SeqDeserializer {
    fn new(items: Vec<Value>) -> Self {
        Self {
            iter: items.into_iter(),
        }
    }
}

impl<'de> SeqAccess<'de> for SeqDeserializer {
    type Error = CodecError;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> CodecResult<Option<T::Value>> {
        self.iter
            .next()
            .map(|value| seed.deserialize(value))
            .transpose()
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct MapDeserializer {
    iter: btree_map::IntoIter<String, Value>,
    value: Option<Value>,
}

impl MapDeserializer {
    fn new(map: ValueMap) -> Self {
        Self {
            iter: map.into_iter(),
            value: None,
        }
    }
}

impl<'de> MapAccess<'de> for MapDeserializer {
    type Error = CodecError;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> CodecResult<Option<K::Value>> {
        match self.iter.next() {
            Some((key, value)) => {
                self.value = Some(value);
                seed.deserialize(Value::Text(key)).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> CodecResult<V::Value> {
        let value = self
            .value
            .take()
            .ok_or_else(|| CodecError::conversion("map value requested before its key"))?;
        seed.deserialize(value)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct EnumDeserializer {
    variant: String,
    value: Option<Value>,
}

impl<'de> EnumAccess<'de> for EnumDeserializer {
    type Error = CodecError;
    type Variant = VariantDeserializer;

    fn variant_seed<V: DeserializeSeed<'de>>(
        self,
        seed: V,
    ) -> CodecResult<(V::Value, VariantDeserializer)> {
        let variant = seed.deserialize(Value::Text(self.variant))?;
        Ok((variant, VariantDeserializer { value: self.value }))
    }
}

struct VariantDeserializer {
    value: Option<Value>,
}

impl<'de> VariantAccess<'de> for VariantDeserializer {
    type Error = CodecError;

    fn unit_variant(self) -> CodecResult<()> {
        match self.value {
            None | Some(Value::Null) => Ok(()),
            Some(other) => Err(CodecError::conversion(format!(
                "expected a unit variant, found {}",
                other.kind()
            ))),
        }
    }

    fn newtype_variant_seed<T: DeserializeSeed<'de>>(self, seed: T) -> CodecResult<T::Value> {
        match self.value {
            Some(value) => seed.deserialize(value),
            None => Err(CodecError::conversion("expected a newtype variant")),
        }
    }

    fn tuple_variant<V: Visitor<'de>>(self, _len: usize, visitor: V) -> CodecResult<V::Value> {
        match self.value {
            Some(Value::Array(items)) => visitor.visit_seq(SeqDeserializer::new(items)),
            _ => Err(CodecError::conversion("expected a tuple variant")),
        }
    }

    fn struct_variant<V: Visitor<'de>>(
        self,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> CodecResult<V::Value> {
        match self.value {
            Some(Value::Map(map)) => visitor.visit_map(MapDeserializer::new(map)),
            _ => Err(CodecError::conversion("expected a struct variant")),
        }
    }
}
