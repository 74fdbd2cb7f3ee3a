//! Database-wide properties checked with generated data.

use chrono::Utc;
use proptest::prelude::*;
use quilldb_core::query::{field, Direction};
use quilldb_core::{Database, Document, ErrorKind, Query, Value};
use quilldb_storage::{InMemoryBackend, KvBackend, ScanControl};
use quilldb_testkit::prelude::*;
use std::sync::Arc;

fn open_shared() -> (Arc<InMemoryBackend>, Database) {
    let backend = Arc::new(InMemoryBackend::new());
    let db = Database::open_with_backend(test_config(), backend.clone()).unwrap();
    (backend, db)
}

fn raw_keys(backend: &InMemoryBackend, prefix: &[u8]) -> usize {
    let tx = backend.begin(true).unwrap();
    let mut count = 0;
    tx.iterate(prefix, false, &mut |_, _| {
        count += 1;
        ScanControl::Continue
    })
    .unwrap();
    count
}

/// Opens an indexed and a scan-only database holding the same documents.
fn twin_databases(docs: &[Document]) -> (TestDatabase, TestDatabase) {
    let indexed = TestDatabase::memory();
    let scanning = TestDatabase::memory_with_config(test_config().use_indexes(false));
    for db in [&indexed, &scanning] {
        db.create_collection("c").unwrap();
        db.create_index("c", "a").unwrap();
        db.create_index("c", "b").unwrap();
        db.insert("c", docs.iter().cloned()).unwrap();
    }
    (indexed, scanning)
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn documents_round_trip(fields in document_map_strategy(), id in id_strategy()) {
        let db = TestDatabase::memory();
        db.create_collection("c").unwrap();
        let mut doc = Document::from_map(fields.clone());
        doc.set("_id", id.as_str());
        db.insert_one("c", doc).unwrap();

        let mut stored = db.find_by_id("c", &id).unwrap().into_map();
        stored.remove("_id");
        stored.remove("_created_at");
        prop_assert_eq!(stored, fields);
    }

    #[test]
    fn index_holds_every_indexable_value(docs in document_batch_strategy(24)) {
        let (backend, db) = open_shared();
        db.create_collection("c").unwrap();
        db.create_index("c", "a").unwrap();
        db.insert("c", docs.iter().cloned()).unwrap();

        let mut expected = 0;
        for doc in &docs {
            let Some(value) = doc.get("a").filter(|v| !v.is_null()) else {
                continue;
            };
            expected += 1;
            let query = Query::new("c").filter(field("a").eq(value.clone()));
            prop_assert!(db.explain(&query).unwrap().uses_index());
            let found = ids(&db.find_all(&query).unwrap());
            prop_assert!(found.iter().any(|id| Some(id.as_str()) == doc.object_id()));
        }
        prop_assert_eq!(raw_keys(&backend, b"I"), expected);
    }

    #[test]
    fn index_order_matches_sort_order(docs in document_batch_strategy(24), descending in any::<bool>()) {
        let (indexed, scanning) = twin_databases(&docs);
        let direction = if descending { Direction::Descending } else { Direction::Ascending };
        let query = Query::new("c")
            .filter(field("a").gte(-100))
            .sort("a", direction);

        prop_assert!(indexed.explain(&query).unwrap().uses_index());
        let streamed = ids(&indexed.find_all(&query).unwrap());
        let sorted = ids(&scanning.find_all(&query).unwrap());
        prop_assert_eq!(streamed, sorted);
    }

    #[test]
    fn plans_agree_with_scans(
        docs in document_batch_strategy(24),
        criterion in criterion_strategy(),
        skip in 0usize..4,
        limit in 0usize..6,
    ) {
        let (indexed, scanning) = twin_databases(&docs);
        let query = Query::new("c")
            .filter(criterion)
            .sort("_id", Direction::Ascending)
            .skip(skip)
            .limit(limit);

        let expected = ids(&scanning.find_all(&query).unwrap());
        prop_assert_eq!(ids(&indexed.find_all(&query).unwrap()), expected.clone());
        prop_assert_eq!(indexed.count(&query).unwrap(), expected.len());

        let manual: Vec<String> = docs
            .iter()
            .filter(|doc| query.criterion().is_some_and(|c| c.matches(doc)))
            .filter_map(|doc| doc.object_id().map(str::to_string))
            .collect();
        let mut manual = manual;
        manual.sort();
        let window: Vec<String> = manual
            .into_iter()
            .skip(skip)
            .take(if limit == 0 { usize::MAX } else { limit })
            .collect();
        prop_assert_eq!(window, expected);
    }

    #[test]
    fn failed_writes_leave_indexes_untouched(docs in document_batch_strategy(16)) {
        prop_assume!(!docs.is_empty());
        let (backend, db) = open_shared();
        db.create_collection("c").unwrap();
        db.create_index("c", "a").unwrap();
        db.insert("c", docs.iter().cloned()).unwrap();
        let entries = raw_keys(&backend, b"I");

        // A batch repeating an existing id fails as a whole.
        let mut fresh = Document::new();
        fresh.set("_id", "zz-fresh");
        fresh.set("a", 1);
        let err = db.insert("c", [fresh, docs[0].clone()]).unwrap_err();
        prop_assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        prop_assert_eq!(raw_keys(&backend, b"I"), entries);

        // A callback failure midway rolls back earlier updates.
        let mut seen = 0;
        let result = db.update_with(&Query::new("c"), |doc| {
            seen += 1;
            if seen == docs.len() {
                return Err("refused");
            }
            doc.set("a", 1000);
            Ok(())
        });
        prop_assert!(result.is_err());
        let moved = Query::new("c").filter(field("a").eq(1000));
        prop_assert_eq!(db.count(&moved).unwrap(), 0);
        prop_assert_eq!(raw_keys(&backend, b"I"), entries);
    }

    #[test]
    fn expired_documents_are_eventually_deleted(docs in document_batch_strategy(16), expire in prop::collection::vec(any::<bool>(), 16)) {
        let (backend, db) = open_shared();
        db.create_collection("c").unwrap();
        db.create_index("c", "a").unwrap();
        let past = Utc::now() - chrono::Duration::seconds(1);
        let mut live = 0;
        let docs: Vec<Document> = docs
            .into_iter()
            .zip(expire)
            .map(|(mut doc, expired)| {
                if expired {
                    doc.set_expires_at(past);
                } else {
                    live += 1;
                }
                doc
            })
            .collect();
        let expired = docs.len() - live;
        db.insert("c", docs).unwrap();

        prop_assert_eq!(db.count(&Query::new("c")).unwrap(), live);
        prop_assert_eq!(db.sweep_expired().unwrap(), expired);
        prop_assert_eq!(raw_keys(&backend, b"D"), live);
        prop_assert_eq!(raw_keys(&backend, b"X"), 0);
        prop_assert_eq!(db.sweep_expired().unwrap(), 0);
    }

    #[test]
    fn drops_are_idempotent(docs in document_batch_strategy(16)) {
        let (backend, db) = open_shared();
        db.create_collection("c").unwrap();
        db.create_index("c", "a").unwrap();
        db.insert("c", docs.iter().cloned()).unwrap();

        db.drop_index("c", "a").unwrap();
        db.drop_index("c", "a").unwrap();
        prop_assert_eq!(raw_keys(&backend, b"I"), 0);
        prop_assert_eq!(raw_keys(&backend, b"D"), docs.len());

        db.drop_collection("c").unwrap();
        prop_assert!(db.drop_collection("c").unwrap_err().is_not_found());
        prop_assert_eq!(raw_keys(&backend, b"D"), 0);

        db.create_collection("c").unwrap();
        prop_assert_eq!(db.count(&Query::new("c")).unwrap(), 0);
        prop_assert!(db.list_indexes("c").unwrap().is_empty());
    }
}

#[test]
fn null_and_missing_fields_are_not_indexed() {
    let (backend, db) = open_shared();
    db.create_collection("c").unwrap();
    db.create_index("c", "a").unwrap();
    db.insert(
        "c",
        [
            doc(serde_json::json!({ "_id": "1", "a": null })),
            doc(serde_json::json!({ "_id": "2" })),
            doc(serde_json::json!({ "_id": "3", "a": { "nested": true } })),
            doc(serde_json::json!({ "_id": "4", "a": [1, 2] })),
        ],
    )
    .unwrap();
    assert_eq!(raw_keys(&backend, b"I"), 1);

    let nil = Query::new("c").filter(field("a").is_nil());
    assert_eq!(sorted_ids(&db.find_all(&nil).unwrap()), ["1", "2"]);
    let listed = Query::new("c").filter(field("a").eq(Value::Array(vec![1.into(), 2.into()])));
    assert_eq!(ids(&db.find_all(&listed).unwrap()), ["4"]);
}
