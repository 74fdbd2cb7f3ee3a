//! Documents: string-keyed records with reserved identity and time fields.

use crate::error::CoreResult;
use chrono::{DateTime, Utc};
use quilldb_codec::{from_document, lookup_path, to_document, Value, ValueMap};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// Field holding the document id.
pub const ID_FIELD: &str = "_id";
/// Field holding the creation instant.
pub const CREATED_AT_FIELD: &str = "_created_at";
/// Field holding the expiration instant (absent or zero: never).
pub const EXPIRES_AT_FIELD: &str = "_expires_at";

/// A document.
///
/// Field paths may be dotted (`"address.city"`) to reach into nested
/// mappings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    fields: ValueMap,
}

impl Document {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a document from a normalized mapping.
    #[must_use]
    pub fn from_map(fields: ValueMap) -> Self {
        Self { fields }
    }

    /// Normalizes a serializable record into a document.
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not normalize to a mapping.
    pub fn from_serialize<T: Serialize + ?Sized>(record: &T) -> CoreResult<Self> {
        Ok(Self::from_map(to_document(record)?))
    }

    /// Converts this document into a deserializable type.
    ///
    /// # Errors
    ///
    /// Returns an error if the document's shape does not match `T`.
    pub fn unmarshal<T: DeserializeOwned>(&self) -> CoreResult<T> {
        Ok(from_document(self.fields.clone())?)
    }

    /// Returns the underlying mapping.
    #[must_use]
    pub fn as_map(&self) -> &ValueMap {
        &self.fields
    }

    /// Consumes the document and returns its mapping.
    #[must_use]
    pub fn into_map(self) -> ValueMap {
        self.fields
    }

    /// Returns the document id, if set.
    #[must_use]
    pub fn object_id(&self) -> Option<&str> {
        self.fields.get(ID_FIELD).and_then(Value::as_str)
    }

    pub(crate) fn set_object_id(&mut self, id: impl Into<String>) {
        self.fields
            .insert(ID_FIELD.to_string(), Value::Text(id.into()));
    }

    /// Returns the creation instant assigned on insert.
    #[must_use]
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.fields.get(CREATED_AT_FIELD).and_then(Value::as_time)
    }

    pub(crate) fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.fields
            .insert(CREATED_AT_FIELD.to_string(), Value::Time(at));
    }

    /// Returns the expiration instant, or `None` if the document never
    /// expires.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self.fields.get(EXPIRES_AT_FIELD) {
            Some(v @ Value::Time(t)) if !v.is_zero() => Some(*t),
            _ => None,
        }
    }

    /// Sets the expiration instant.
    pub fn set_expires_at(&mut self, at: DateTime<Utc>) {
        self.fields
            .insert(EXPIRES_AT_FIELD.to_string(), Value::Time(at));
    }

    /// Expires the document `ttl` from now.
    pub fn set_ttl(&mut self, ttl: Duration) {
        let at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|delta| Utc::now().checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.set_expires_at(at);
    }

    /// Removes the expiration instant.
    pub fn clear_expires_at(&mut self) {
        self.fields.remove(EXPIRES_AT_FIELD);
    }

    /// Returns true if the document expired at or before `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| at <= now)
    }

    /// Returns true if the document has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Returns the value at a (possibly dotted) field path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.fields, path)
    }

    /// Returns true if the field path is present (even if null).
    #[must_use]
    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Sets the value at a field path, creating intermediate mappings.
    ///
    /// Intermediate values that are not mappings are replaced.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) {
        let mut segments: Vec<&str> = path.split('.').collect();
        let last = segments.pop().unwrap_or(path);
        let mut current = &mut self.fields;
        for segment in segments {
            let slot = current.entry(segment.to_string()).or_insert(Value::Null);
            if !matches!(slot, Value::Map(_)) {
                *slot = Value::Map(ValueMap::new());
            }
            let Value::Map(map) = slot else {
                return;
            };
            current = map;
        }
        current.insert(last.to_string(), value.into());
    }

    /// Removes the value at a field path and returns it.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        match path.rsplit_once('.') {
            None => self.fields.remove(path),
            Some((parent, last)) => {
                let mut current = &mut self.fields;
                for segment in parent.split('.') {
                    current = current.get_mut(segment)?.as_map_mut()?;
                }
                current.remove(last)
            }
        }
    }

    /// Returns the top-level field names.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Returns the number of top-level fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the document has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl From<ValueMap> for Document {
    fn from(fields: ValueMap) -> Self {
        Self::from_map(fields)
    }
}

impl From<Document> for ValueMap {
    fn from(doc: Document) -> Self {
        doc.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::Deserialize;

    #[test]
    fn nested_paths() {
        let mut doc = Document::new();
        doc.set("name", "Ada");
        doc.set("address.city", "Rome");
        doc.set("address.zip", 100);

        assert_eq!(doc.get("address.city"), Some(&Value::from("Rome")));
        assert!(doc.has("address.zip"));
        assert!(!doc.has("address.street"));

        // Setting through a scalar replaces it with a mapping
        doc.set("name.first", "Ada");
        assert_eq!(doc.get("name.first"), Some(&Value::from("Ada")));

        assert_eq!(doc.remove("address.zip"), Some(Value::Integer(100)));
        assert!(!doc.has("address.zip"));
        assert_eq!(doc.remove("missing.path"), None);
    }

    #[test]
    fn expiration() {
        let mut doc = Document::new();
        assert!(doc.expires_at().is_none());
        assert!(!doc.is_expired());

        let past = Utc::now() - chrono::Duration::seconds(1);
        doc.set_expires_at(past);
        assert!(doc.is_expired());

        // Zero instant means never
        doc.set_expires_at(Utc.timestamp_opt(0, 0).unwrap());
        assert!(doc.expires_at().is_none());

        doc.set_ttl(Duration::from_secs(3600));
        assert!(!doc.is_expired());
        doc.set_ttl(Duration::MAX);
        assert_eq!(doc.expires_at(), Some(DateTime::<Utc>::MAX_UTC));

        doc.clear_expires_at();
        assert!(doc.expires_at().is_none());
    }

    #[test]
    fn serde_round_trip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Todo {
            title: String,
            completed: bool,
        }
        let todo = Todo {
            title: "write tests".into(),
            completed: false,
        };
        let doc = Document::from_serialize(&todo).unwrap();
        assert_eq!(doc.len(), 2);
        assert_eq!(doc.fields().collect::<Vec<_>>(), vec!["completed", "title"]);
        let back: Todo = doc.unmarshal().unwrap();
        assert_eq!(back, todo);
    }

    #[test]
    fn object_id_requires_text() {
        let mut doc = Document::new();
        doc.set(ID_FIELD, 5);
        assert_eq!(doc.object_id(), None);
        doc.set_object_id("abc");
        assert_eq!(doc.object_id(), Some("abc"));
    }
}
