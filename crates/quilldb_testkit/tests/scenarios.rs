//! Reference scenarios run against the public database API.

use chrono::{DateTime, FixedOffset, Utc};
use quilldb_core::query::{field, Direction, ValueRange};
use quilldb_core::{Config, Database, Document, Plan, Query, Value};
use quilldb_storage::{InMemoryBackend, KvBackend, ScanControl};
use quilldb_testkit::{doc, ids, scenarios, sorted_ids, test_config, TestDatabase};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

/// Counts the raw index entries of a backend.
fn index_entries(backend: &InMemoryBackend) -> usize {
    let tx = backend.begin(true).unwrap();
    let mut count = 0;
    tx.iterate(b"I", false, &mut |_, _| {
        count += 1;
        ScanControl::Continue
    })
    .unwrap();
    count
}

#[test]
fn s1_equality_range_and_index_order() {
    let db = scenarios::people_database();

    let thirty = Query::new("people").filter(field("age").eq(30));
    assert_eq!(
        db.explain(&thirty).unwrap(),
        Plan::IndexScan {
            field: "age".into(),
            ranges: vec![ValueRange::point(Value::Integer(30))],
        }
    );
    assert_eq!(sorted_ids(&db.find_all(&thirty).unwrap()), ["A", "C"]);

    let older = Query::new("people").filter(field("age").gt(25));
    assert!(db.explain(&older).unwrap().uses_index());
    assert_eq!(sorted_ids(&db.find_all(&older).unwrap()), ["A", "C"]);

    let by_age = Query::new("people")
        .filter(field("age").gte(0))
        .sort("age", Direction::Ascending);
    assert_eq!(ids(&db.find_all(&by_age).unwrap()), ["B", "A", "C"]);

    let by_age_desc = Query::new("people")
        .filter(field("age").gte(0))
        .sort("age", Direction::Descending);
    assert_eq!(ids(&db.find_all(&by_age_desc).unwrap()), ["C", "A", "B"]);
}

#[test]
fn s2_replace_moves_index_entry() {
    let db = TestDatabase::memory();
    db.create_collection("c").unwrap();
    db.create_index("c", "n").unwrap();
    db.insert_one("c", doc(json!({ "_id": "X", "n": 1 }))).unwrap();
    db.replace_by_id("c", "X", doc(json!({ "_id": "X", "n": 2 })))
        .unwrap();

    let one = Query::new("c").filter(field("n").gte(1).and(field("n").lte(1)));
    assert_eq!(
        db.explain(&one).unwrap(),
        Plan::IndexScan {
            field: "n".into(),
            ranges: vec![ValueRange::point(Value::Integer(1))],
        }
    );
    assert!(db.find_all(&one).unwrap().is_empty());

    let two = Query::new("c").filter(field("n").gte(2).and(field("n").lte(2)));
    assert_eq!(ids(&db.find_all(&two).unwrap()), ["X"]);
}

#[test]
fn s3_normalization() {
    #[derive(Serialize)]
    struct Record {
        i: i32,
        p: Option<i64>,
        #[serde(serialize_with = "quilldb_codec::datetime::serialize")]
        t: DateTime<FixedOffset>,
    }

    let local = DateTime::parse_from_rfc3339("2024-03-01T09:30:00.250+02:00").unwrap();
    let record = Record {
        i: 5,
        p: Some(7),
        t: local,
    };
    let doc = Document::from_serialize(&record).unwrap();
    assert_eq!(doc.get("i"), Some(&Value::Integer(5)));
    assert_eq!(doc.get("p"), Some(&Value::Integer(7)));
    assert_eq!(
        doc.get("t"),
        Some(&Value::Time(local.with_timezone(&Utc)))
    );
    assert_eq!(
        doc.get("t").and_then(Value::as_time).map(|t| t.to_rfc3339()),
        Some("2024-03-01T07:30:00.250+00:00".to_string())
    );
}

#[test]
fn s3_offset_instants_round_trip() {
    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Meeting {
        #[serde(with = "quilldb_codec::datetime")]
        starts: DateTime<FixedOffset>,
        #[serde(default, with = "quilldb_codec::datetime::option")]
        ends: Option<DateTime<FixedOffset>>,
        #[serde(default, with = "quilldb_codec::datetime::option")]
        moved: Option<DateTime<FixedOffset>>,
    }

    let starts = DateTime::parse_from_rfc3339("2024-03-01T09:30:00.123456789-05:00").unwrap();
    let ends = DateTime::parse_from_rfc3339("2024-03-01T11:00:00+09:30").unwrap();
    let meeting = Meeting {
        starts,
        ends: Some(ends),
        moved: None,
    };

    let db = TestDatabase::memory();
    db.create_collection("meetings").unwrap();
    let mut record = Document::from_serialize(&meeting).unwrap();
    assert_eq!(
        record.get("starts"),
        Some(&Value::Time(starts.with_timezone(&Utc)))
    );
    assert_eq!(record.get("ends"), Some(&Value::Time(ends.with_timezone(&Utc))));
    record.set("_id", "m1");
    db.insert_one("meetings", record).unwrap();

    let stored = db.find_by_id("meetings", "m1").unwrap();
    let back: Meeting = stored.unmarshal().unwrap();
    assert_eq!(back, meeting);
    assert_eq!(back.starts.timestamp_nanos_opt(), starts.timestamp_nanos_opt());
    assert_eq!(back.starts.offset().local_minus_utc(), 0);
}

#[test]
fn s4_expired_document_is_hidden_then_swept() {
    let backend = Arc::new(InMemoryBackend::new());
    let db = Database::open_with_backend(test_config(), backend.clone()).unwrap();
    db.create_collection("c").unwrap();
    db.create_index("c", "n").unwrap();

    let mut expired = doc(json!({ "_id": "E", "n": 1 }));
    expired.set_expires_at(Utc::now() - chrono::Duration::seconds(1));
    db.insert_one("c", expired).unwrap();

    assert!(db.find_by_id("c", "E").unwrap_err().is_not_found());
    assert!(db
        .find_all(&Query::new("c").filter(field("n").eq(1)))
        .unwrap()
        .is_empty());
    assert_eq!(index_entries(&backend), 1);

    assert_eq!(db.sweep_expired().unwrap(), 1);
    assert_eq!(index_entries(&backend), 0);
}

#[test]
fn s4_background_sweeper_tick() {
    let backend = Arc::new(InMemoryBackend::new());
    let config = Config::default().sweep_interval(Duration::from_millis(25));
    let db = Database::open_with_backend(config, backend.clone()).unwrap();
    db.create_collection("c").unwrap();
    db.create_index("c", "n").unwrap();

    let mut expired = doc(json!({ "_id": "E", "n": 1 }));
    expired.set_expires_at(Utc::now() - chrono::Duration::seconds(1));
    db.insert_one("c", expired).unwrap();

    let mut swept = false;
    for _ in 0..200 {
        if index_entries(&backend) == 0 {
            swept = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(swept, "sweeper did not remove the expired entry");
}

#[test]
fn s5_union_plan_matches_scan() {
    let rows = [
        json!({ "_id": "1", "age": 18, "name": "Y" }),
        json!({ "_id": "2", "age": 25, "name": "Y" }),
        json!({ "_id": "3", "age": 39, "name": "Z" }),
        json!({ "_id": "4", "age": 40, "name": "Z" }),
        json!({ "_id": "5", "name": "Z" }),
        json!({ "_id": "6", "age": null, "name": "W" }),
        json!({ "_id": "7", "age": 21.5 }),
    ];
    let indexed = TestDatabase::memory();
    let scanning = TestDatabase::memory_with_config(test_config().use_indexes(false));
    for db in [&indexed, &scanning] {
        db.create_collection("people").unwrap();
        db.create_index("people", "age").unwrap();
        db.insert("people", rows.iter().cloned().map(doc)).unwrap();
    }

    let criterion = field("age")
        .gt(20)
        .and(field("age").lt(40))
        .or(field("name").eq("Z"));
    let query = Query::new("people").filter(criterion);

    assert_eq!(
        indexed.explain(&query).unwrap(),
        Plan::Union(vec![
            Plan::IndexScan {
                field: "age".into(),
                ranges: vec![ValueRange {
                    low: Bound::Excluded(Value::Integer(20)),
                    high: Bound::Excluded(Value::Integer(40)),
                }],
            },
            Plan::FullScan,
        ])
    );
    assert_eq!(scanning.explain(&query).unwrap(), Plan::FullScan);

    let expected = sorted_ids(&scanning.find_all(&query).unwrap());
    assert_eq!(expected, ["2", "3", "4", "5", "7"]);
    assert_eq!(sorted_ids(&indexed.find_all(&query).unwrap()), expected);
}

#[test]
fn s6_backfilled_index_matches_scan() {
    let db = scenarios::populated_database(1000);
    let query = Query::new("items").filter(field("group").eq(3).or(field("n").lt(10)));

    assert_eq!(db.explain(&query).unwrap(), Plan::FullScan);
    let before = sorted_ids(&db.find_all(&query).unwrap());
    let expected = (0..1000).filter(|n| n % 7 == 3 || *n < 10).count();
    assert_eq!(before.len(), expected);

    db.create_index("items", "group").unwrap();
    db.create_index("items", "n").unwrap();
    assert!(db.explain(&query).unwrap().uses_index());
    assert_eq!(sorted_ids(&db.find_all(&query).unwrap()), before);
}
