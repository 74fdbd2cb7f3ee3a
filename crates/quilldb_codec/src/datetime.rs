//! Serde helpers that store `chrono` instants as [`crate::Value::Time`].
//!
//! `chrono`'s own `Serialize` writes instants as strings. Annotate a field
//! with `#[serde(with = "quilldb_codec::datetime")]` to keep it an instant
//! through normalization instead. Instants in any time zone are converted to
//! UTC. Other serializers see an RFC 3339 string.
//!
//! ```
//! use chrono::{DateTime, Utc};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Event {
//!     #[serde(with = "quilldb_codec::datetime")]
//!     at: DateTime<Utc>,
//!     #[serde(default, with = "quilldb_codec::datetime::option")]
//!     until: Option<DateTime<Utc>>,
//! }
//!
//! let event = Event { at: Utc::now(), until: None };
//! let doc = quilldb_codec::to_document(&event).unwrap();
//! assert!(doc["at"].as_time().is_some());
//! ```

use crate::ser::DATETIME_TOKEN;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use std::fmt;

/// Serializes an instant, converting it to UTC.
///
/// # Errors
///
/// Propagates errors from the serializer.
pub fn serialize<S, Tz>(value: &DateTime<Tz>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    Tz: TimeZone,
{
    let utc = value.with_timezone(&Utc);
    serializer.serialize_newtype_struct(
        DATETIME_TOKEN,
        &utc.to_rfc3339_opts(SecondsFormat::AutoSi, true),
    )
}

/// Deserializes an instant stored by [`serialize`] or written as RFC 3339.
///
/// # Errors
///
/// Fails if the input is not an instant.
pub fn deserialize<'de, D, Tz>(deserializer: D) -> Result<DateTime<Tz>, D::Error>
where
    D: Deserializer<'de>,
    Tz: TimeZone,
    DateTime<Tz>: From<DateTime<Utc>>,
{
    deserializer
        .deserialize_newtype_struct(DATETIME_TOKEN, InstantVisitor)
        .map(DateTime::from)
}

struct InstantVisitor;

impl<'de> Visitor<'de> for InstantVisitor {
    type Value = DateTime<Utc>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an RFC 3339 instant")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        DateTime::parse_from_rfc3339(v)
            .map(|t| t.with_timezone(&Utc))
            .map_err(E::custom)
    }

    fn visit_newtype_struct<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
        d.deserialize_str(self)
    }
}

/// Same as the parent module, for `Option<DateTime<_>>` fields.
pub mod option {
    use super::{DateTime, Deserializer, Serializer, TimeZone, Utc};
    use serde::de::{self, Visitor};
    use serde::ser::Serialize;
    use std::fmt;
    use std::marker::PhantomData;

    struct Wrapped<'a, Tz: TimeZone>(&'a DateTime<Tz>);

    impl<Tz: TimeZone> Serialize for Wrapped<'_, Tz> {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            super::serialize(self.0, serializer)
        }
    }

    /// Serializes an optional instant.
    ///
    /// # Errors
    ///
    /// Propagates errors from the serializer.
    pub fn serialize<S, Tz>(value: &Option<DateTime<Tz>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        Tz: TimeZone,
    {
        match value {
            Some(dt) => serializer.serialize_some(&Wrapped(dt)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserializes an optional instant.
    ///
    /// # Errors
    ///
    /// Fails if the input is neither null nor an instant.
    pub fn deserialize<'de, D, Tz>(deserializer: D) -> Result<Option<DateTime<Tz>>, D::Error>
    where
        D: Deserializer<'de>,
        Tz: TimeZone,
        DateTime<Tz>: From<DateTime<Utc>>,
    {
        deserializer.deserialize_option(OptionVisitor(PhantomData))
    }

    struct OptionVisitor<Tz>(PhantomData<Tz>);

    impl<'de, Tz> Visitor<'de> for OptionVisitor<Tz>
    where
        Tz: TimeZone,
        DateTime<Tz>: From<DateTime<Utc>>,
    {
        type Value = Option<DateTime<Tz>>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an optional RFC 3339 instant")
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
            super::deserialize(d).map(Some)
        }
    }
}
