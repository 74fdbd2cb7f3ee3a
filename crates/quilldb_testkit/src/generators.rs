//! Property-based test generators using proptest.
//!
//! Provides strategies for generating values, documents and criteria that
//! respect the invariants of the value domain (finite floats, valid UTC
//! instants, bounded nesting).

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use quilldb_core::query::{field, Criterion};
use quilldb_core::{Document, Value, ValueMap};

/// Strategy for generating valid collection names.
pub fn collection_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z][a-zA-Z0-9_]{0,31}").expect("Invalid regex")
}

/// Strategy for generating valid document ids.
pub fn id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z0-9]{1,12}").expect("Invalid regex")
}

/// Strategy for generating UTC instants with nanosecond precision.
pub fn instant_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    (-1_000_000_000i64..4_000_000_000, 0u32..1_000_000_000)
        .prop_filter_map("instant out of range", |(secs, nanos)| {
            DateTime::from_timestamp(secs, nanos)
        })
}

/// Strategy for generating orderable scalar values (never null, never a
/// mapping).
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        (i64::MAX as u64 + 1..=u64::MAX).prop_map(Value::Unsigned),
        (-1.0e12f64..1.0e12).prop_map(Value::Float),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
        instant_strategy().prop_map(Value::Time),
    ]
}

/// Strategy for generating small numbers, which collide often enough to
/// exercise equality and tie-breaking.
pub fn small_number_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        3 => (-20i64..20).prop_map(Value::Integer),
        1 => (-20i64..20).prop_map(|n| Value::Float(n as f64 + 0.5)),
    ]
}

/// Strategy for generating arbitrary values, including nested lists and
/// mappings.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![Just(Value::Null), scalar_strategy()];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(Value::Map),
        ]
    })
}

/// Strategy for generating document field mappings.
pub fn document_map_strategy() -> impl Strategy<Value = ValueMap> {
    prop::collection::btree_map("[a-z]{1,8}", value_strategy(), 0..6)
}

fn field_value_strategy() -> impl Strategy<Value = Option<Value>> {
    prop::option::of(prop_oneof![
        1 => Just(Value::Null),
        6 => small_number_strategy(),
        2 => "[a-c]{0,2}".prop_map(Value::Text),
    ])
}

/// Strategy for generating documents over the fields `a`, `b` and `c`.
///
/// Each field is absent, null, a small number or short text, so criteria
/// over these fields select interesting subsets.
pub fn document_strategy() -> impl Strategy<Value = Document> {
    (
        id_strategy(),
        field_value_strategy(),
        field_value_strategy(),
        field_value_strategy(),
    )
        .prop_map(|(id, a, b, c)| {
            let mut doc = Document::new();
            doc.set("_id", id);
            for (name, value) in [("a", a), ("b", b), ("c", c)] {
                if let Some(value) = value {
                    doc.set(name, value);
                }
            }
            doc
        })
}

/// Strategy for generating a batch of documents with unique ids.
pub fn document_batch_strategy(max: usize) -> impl Strategy<Value = Vec<Document>> {
    prop::collection::vec(document_strategy(), 0..max).prop_map(|docs| {
        let mut seen = std::collections::HashSet::new();
        docs.into_iter()
            .filter(|doc| seen.insert(doc.object_id().unwrap_or_default().to_string()))
            .collect()
    })
}

/// Strategy for generating leaf criteria over the fields `a`, `b` and `c`.
pub fn predicate_strategy() -> impl Strategy<Value = Criterion> {
    let name = prop::sample::select(vec!["a", "b", "c"]);
    let target = prop_oneof![
        6 => small_number_strategy(),
        1 => "[a-c]{0,2}".prop_map(Value::Text),
        1 => Just(Value::Null),
    ];
    (name, target, 0usize..10).prop_map(|(name, target, op)| {
        let f = field(name);
        match op {
            0 => f.eq(target),
            1 => f.neq(target),
            2 => f.lt(target),
            3 => f.lte(target),
            4 => f.gt(target),
            5 => f.gte(target),
            6 => f.is_in([target, Value::Integer(0)]),
            7 => f.exists(),
            8 => f.is_nil(),
            _ => f.like("^b"),
        }
    })
}

/// Strategy for generating criteria trees of bounded depth.
pub fn criterion_strategy() -> impl Strategy<Value = Criterion> {
    predicate_strategy().prop_recursive(3, 16, 3, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..4).prop_map(Criterion::all),
            prop::collection::vec(inner.clone(), 1..4).prop_map(Criterion::any),
            inner.prop_map(|c| !c),
        ]
    })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
