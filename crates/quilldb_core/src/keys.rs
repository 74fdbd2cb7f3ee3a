//! Key layout of the shared key space.
//!
//! Every key starts with a one-byte tag. Names and ids are escaped
//! (`00` becomes `00 FF`) and terminated with `00 00`, so no name can forge
//! a component boundary and every component can be parsed back.
//!
//! | Tag | Layout                                              | Value               |
//! |-----|-----------------------------------------------------|---------------------|
//! | `M` | `M`                                                 | schema record       |
//! | `M` | `M` + coll                                          | collection metadata |
//! | `D` | `D` + coll + id                                     | encoded document    |
//! | `I` | `I` + coll + field + keycode(value) + id            | empty or expiry     |
//! | `X` | `X` + expiry (u64 BE nanos) + coll + id             | empty               |

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use quilldb_codec::{key_len, read_escaped, write_escaped, write_key, Value};

const TAG_META: u8 = b'M';
const TAG_DOC: u8 = b'D';
const TAG_INDEX: u8 = b'I';
const TAG_TTL: u8 = b'X';

/// Key of the schema record.
pub(crate) const SCHEMA_KEY: &[u8] = b"M";

/// Magic bytes at the start of the schema record.
pub(crate) const SCHEMA_MAGIC: &[u8; 3] = b"QDB";

/// Prefix of all collection metadata keys.
pub(crate) fn meta_prefix() -> Vec<u8> {
    // The bare schema key sorts first; metadata keys always carry a name.
    vec![TAG_META]
}

pub(crate) fn meta_key(collection: &str) -> Vec<u8> {
    let mut key = vec![TAG_META];
    write_escaped(collection.as_bytes(), &mut key);
    key
}

/// Prefix of every document key.
pub(crate) fn doc_space() -> Vec<u8> {
    vec![TAG_DOC]
}

/// Prefix of every index entry.
pub(crate) fn index_space() -> Vec<u8> {
    vec![TAG_INDEX]
}

pub(crate) fn doc_prefix(collection: &str) -> Vec<u8> {
    let mut key = vec![TAG_DOC];
    write_escaped(collection.as_bytes(), &mut key);
    key
}

pub(crate) fn doc_key(collection: &str, id: &str) -> Vec<u8> {
    let mut key = doc_prefix(collection);
    write_escaped(id.as_bytes(), &mut key);
    key
}

/// Prefix of every index entry of a collection.
pub(crate) fn collection_index_prefix(collection: &str) -> Vec<u8> {
    let mut key = vec![TAG_INDEX];
    write_escaped(collection.as_bytes(), &mut key);
    key
}

pub(crate) fn index_prefix(collection: &str, field: &str) -> Vec<u8> {
    let mut key = collection_index_prefix(collection);
    write_escaped(field.as_bytes(), &mut key);
    key
}

/// Prefix of all entries of an index holding exactly `value`.
pub(crate) fn index_value_prefix(
    collection: &str,
    field: &str,
    value: &Value,
) -> CoreResult<Vec<u8>> {
    let mut key = index_prefix(collection, field);
    write_key(value, &mut key)?;
    Ok(key)
}

pub(crate) fn index_key(
    collection: &str,
    field: &str,
    value: &Value,
    id: &str,
) -> CoreResult<Vec<u8>> {
    let mut key = index_value_prefix(collection, field, value)?;
    write_escaped(id.as_bytes(), &mut key);
    Ok(key)
}

/// Prefix of all TTL entries.
pub(crate) fn ttl_prefix() -> Vec<u8> {
    vec![TAG_TTL]
}

pub(crate) fn ttl_key(expiry: u64, collection: &str, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(9 + collection.len() + id.len() + 4);
    key.push(TAG_TTL);
    key.extend_from_slice(&expiry.to_be_bytes());
    write_escaped(collection.as_bytes(), &mut key);
    write_escaped(id.as_bytes(), &mut key);
    key
}

/// Exclusive upper bound of TTL keys expiring at or before `now`.
pub(crate) fn ttl_upper_bound(now: u64) -> Vec<u8> {
    match now.checked_add(1) {
        Some(next) => {
            let mut key = vec![TAG_TTL];
            key.extend_from_slice(&next.to_be_bytes());
            key
        }
        None => vec![TAG_TTL + 1],
    }
}

/// Converts an instant to the stamp used in TTL keys and index entries:
/// nanoseconds since the Unix epoch, saturating at both ends.
#[allow(clippy::cast_sign_loss)]
pub(crate) fn expiry_stamp(at: &DateTime<Utc>) -> u64 {
    match at.timestamp_nanos_opt() {
        Some(nanos) if nanos <= 0 => 0,
        Some(nanos) => nanos as u64,
        None if at.timestamp() < 0 => 0,
        None => u64::MAX,
    }
}

/// Current time as an expiry stamp.
pub(crate) fn now_stamp() -> u64 {
    expiry_stamp(&Utc::now())
}

/// Encodes the index entry value: empty, or the 8-byte expiry stamp.
pub(crate) fn index_entry_value(expiry: Option<u64>) -> Vec<u8> {
    expiry.map_or_else(Vec::new, |stamp| stamp.to_be_bytes().to_vec())
}

/// Decodes the expiry stamp of an index entry value.
pub(crate) fn parse_index_entry_value(value: &[u8]) -> Option<u64> {
    <[u8; 8]>::try_from(value).ok().map(u64::from_be_bytes)
}

fn read_name(input: &[u8]) -> CoreResult<(String, usize)> {
    let (bytes, used) = read_escaped(input)?;
    let name = String::from_utf8(bytes)
        .map_err(|_| CoreError::invalid_format("key component is not UTF-8"))?;
    Ok((name, used))
}

/// Parses the collection name of a metadata key.
pub(crate) fn parse_meta_key(key: &[u8]) -> CoreResult<String> {
    let rest = key
        .strip_prefix(&[TAG_META])
        .ok_or_else(|| CoreError::invalid_format("not a metadata key"))?;
    read_name(rest).map(|(name, _)| name)
}

/// Parses the collection name of a document or index key.
pub(crate) fn parse_collection(key: &[u8]) -> CoreResult<String> {
    let rest = key
        .get(1..)
        .ok_or_else(|| CoreError::invalid_format("empty key"))?;
    read_name(rest).map(|(name, _)| name)
}

/// Parses the document id of a document key with the given prefix length.
pub(crate) fn parse_doc_id(key: &[u8], prefix_len: usize) -> CoreResult<String> {
    let rest = key
        .get(prefix_len..)
        .ok_or_else(|| CoreError::invalid_format("document key too short"))?;
    read_name(rest).map(|(id, _)| id)
}

/// Parses the document id of an index key with the given index prefix length.
pub(crate) fn parse_index_id(key: &[u8], prefix_len: usize) -> CoreResult<String> {
    let rest = key
        .get(prefix_len..)
        .ok_or_else(|| CoreError::invalid_format("index key too short"))?;
    let value_len = key_len(rest)?;
    read_name(&rest[value_len..]).map(|(id, _)| id)
}

/// Parses the field name following a collection index prefix.
pub(crate) fn parse_index_field(key: &[u8], prefix_len: usize) -> CoreResult<String> {
    let rest = key
        .get(prefix_len..)
        .ok_or_else(|| CoreError::invalid_format("index key too short"))?;
    read_name(rest).map(|(field, _)| field)
}

/// A parsed TTL key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TtlEntry {
    pub expiry: u64,
    pub collection: String,
    pub id: String,
}

pub(crate) fn parse_ttl_key(key: &[u8]) -> CoreResult<TtlEntry> {
    let malformed = || CoreError::invalid_format("malformed TTL key");
    let rest = key.strip_prefix(&[TAG_TTL]).ok_or_else(malformed)?;
    let stamp: [u8; 8] = rest
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(malformed)?;
    let (collection, used) = read_name(&rest[8..])?;
    let (id, _) = read_name(&rest[8 + used..])?;
    Ok(TtlEntry {
        expiry: u64::from_be_bytes(stamp),
        collection,
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn names_cannot_forge_boundaries() {
        // "a\0" + "b" must differ from "a" + "\0b"
        assert_ne!(doc_key("a\0", "b"), doc_key("a", "\0b"));
        let prefix = doc_prefix("a");
        assert!(!doc_key("ab", "x").starts_with(&prefix));
        assert!(doc_key("a", "x").starts_with(&prefix));
    }

    #[test]
    fn doc_ids_parse_back() {
        let prefix = doc_prefix("users");
        let key = doc_key("users", "id\0with-nul");
        assert_eq!(parse_doc_id(&key, prefix.len()).unwrap(), "id\0with-nul");
    }

    #[test]
    fn index_ids_parse_back() {
        let prefix = index_prefix("users", "age");
        let key = index_key("users", "age", &Value::Integer(30), "A").unwrap();
        assert!(key.starts_with(&prefix));
        assert_eq!(parse_index_id(&key, prefix.len()).unwrap(), "A");

        let coll_prefix = collection_index_prefix("users");
        assert_eq!(parse_index_field(&key, coll_prefix.len()).unwrap(), "age");
    }

    #[test]
    fn collection_names_parse_back() {
        let doc = doc_key("users", "A");
        let entry = index_key("users", "age", &Value::Integer(1), "A").unwrap();
        assert!(doc.starts_with(&doc_space()));
        assert!(entry.starts_with(&index_space()));
        assert_eq!(parse_collection(&doc).unwrap(), "users");
        assert_eq!(parse_collection(&entry).unwrap(), "users");
        assert!(parse_collection(&[]).is_err());
    }

    #[test]
    fn index_keys_order_by_value_then_id() {
        let k = |v: i64, id: &str| index_key("c", "n", &Value::Integer(v), id).unwrap();
        assert!(k(25, "B") < k(30, "A"));
        assert!(k(30, "A") < k(30, "C"));
    }

    #[test]
    fn index_on_map_value_fails() {
        let map = Value::Map(quilldb_codec::ValueMap::new());
        assert!(index_key("c", "f", &map, "id").is_err());
    }

    #[test]
    fn ttl_keys_order_by_expiry_and_parse_back() {
        let early = ttl_key(5, "zzz", "1");
        let late = ttl_key(6, "aaa", "1");
        assert!(early < late);
        assert!(late < ttl_upper_bound(6));
        assert!(ttl_upper_bound(5) <= late);

        let entry = parse_ttl_key(&early).unwrap();
        assert_eq!(
            entry,
            TtlEntry {
                expiry: 5,
                collection: "zzz".into(),
                id: "1".into()
            }
        );
    }

    #[test]
    fn ttl_bound_saturates() {
        assert!(ttl_key(u64::MAX, "c", "i") < ttl_upper_bound(u64::MAX));
    }

    #[test]
    fn expiry_stamps_saturate() {
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        let before = Utc.timestamp_opt(-10, 0).unwrap();
        let far = Utc.with_ymd_and_hms(3000, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(expiry_stamp(&epoch), 0);
        assert_eq!(expiry_stamp(&before), 0);
        assert_eq!(expiry_stamp(&far), u64::MAX);
        assert_eq!(expiry_stamp(&Utc.timestamp_opt(1, 5).unwrap()), 1_000_000_005);
    }

    #[test]
    fn meta_keys_parse_back() {
        let key = meta_key("orders");
        assert!(key.starts_with(&meta_prefix()));
        assert_ne!(key.as_slice(), SCHEMA_KEY);
        assert_eq!(parse_meta_key(&key).unwrap(), "orders");
    }

    #[test]
    fn index_entry_values() {
        assert!(index_entry_value(None).is_empty());
        assert_eq!(parse_index_entry_value(&index_entry_value(Some(9))), Some(9));
        assert_eq!(parse_index_entry_value(&[]), None);
    }
}
