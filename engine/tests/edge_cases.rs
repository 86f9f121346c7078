//! Edge case tests for tally-engine
//!
//! These tests cover boundary conditions, unusual inputs and the store-wide
//! properties of change capture and unique indexes.

use proptest::prelude::*;
use serde_json::json;
use tally_engine::{
    ChangeOperation, CollectionSchema, Document, Error, FieldDef, FieldType, Filter,
    FindOptions, RemoteChange, RestoreMode, Schema, SchemaVersion, Sort, Store, StoreSnapshot,
    WriteContext,
};

fn create_test_schema() -> Schema {
    Schema::new(SchemaVersion::new(1, 0))
        .with_collection(
            CollectionSchema::new(
                "items",
                vec![
                    FieldDef::required("name", FieldType::String),
                    FieldDef::optional("count", FieldType::Int),
                    FieldDef::optional("data", FieldType::Json),
                ],
            )
            .with_unique("name"),
        )
        .with_collection(CollectionSchema::new("notes", vec![]))
}

fn ctx(ts: u64) -> WriteContext {
    WriteContext::new("tester", ts)
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[test]
fn empty_string_fields() {
    let mut store = Store::new(create_test_schema(), "node1", "main");
    store.insert("items", "item1", json!({"name": ""}), &ctx(1000)).unwrap();

    let doc = store.get("items", "item1").unwrap().unwrap();
    assert_eq!(doc.fields["name"], "");
}

#[test]
fn unicode_strings() {
    let mut store = Store::new(create_test_schema(), "node1", "main");

    let unicode_names = vec![
        "日本語テスト",
        "Привет мир",
        "مرحبا بالعالم",
        "🎉🚀💯",
        "Hello\nWorld\tTab",
        "Null\0Test",
    ];

    for (i, name) in unicode_names.iter().enumerate() {
        let id = format!("item_{i}");
        let result = store.insert("items", id.clone(), json!({ "name": name }), &ctx(1000));
        assert!(result.is_ok(), "Failed for: {}", name);

        let found = store
            .find_one("items", &Filter::all().eq("name", *name))
            .unwrap()
            .unwrap();
        assert_eq!(found.id, id);
    }
}

#[test]
fn deeply_nested_json() {
    let mut store = Store::new(create_test_schema(), "node1", "main");
    let data = json!({"a": {"b": {"c": {"d": [1, 2, {"e": "deep"}]}}}});
    store
        .insert("items", "n", json!({"name": "nested", "data": data}), &ctx(1))
        .unwrap();

    let found = store
        .find_one("items", &Filter::all().eq("data.a.b.c.d.2.e", "deep"))
        .unwrap();
    assert!(found.is_some());

    store
        .update("items", &Filter::by_id("n"), &json!({"data.a.b.x": 1}), false, &ctx(2))
        .unwrap();
    let doc = store.get("items", "n").unwrap().unwrap();
    assert_eq!(doc.fields["data"]["a"]["b"]["x"], 1);
    assert_eq!(doc.fields["data"]["a"]["b"]["c"]["d"][2]["e"], "deep");
}

// ============================================================================
// Boundary Values
// ============================================================================

#[test]
fn large_integers() {
    let mut store = Store::new(create_test_schema(), "node1", "main");
    for (i, n) in [i64::MAX, i64::MIN, 0].iter().enumerate() {
        store
            .insert("items", format!("i{i}"), json!({"name": format!("n{i}"), "count": n}), &ctx(1))
            .unwrap();
    }
    assert_eq!(store.count("items", &Filter::all().gt("count", 0)).unwrap(), 1);
    assert_eq!(store.count("items", &Filter::all().lt("count", 0)).unwrap(), 1);
}

#[test]
fn explicit_id_in_fields_wins() {
    let mut store = Store::new(create_test_schema(), "node1", "main");
    let m = store
        .insert("items", "generated", json!({"_id": "chosen", "name": "x"}), &ctx(1))
        .unwrap();
    assert_eq!(m.changes[0].document_id, "chosen");
    assert!(store.get("items", "generated").unwrap().is_none());
}

#[test]
fn null_unique_values_do_not_collide() {
    let schema = Schema::new(SchemaVersion::new(1, 0)).with_collection(
        CollectionSchema::new("users", vec![]).with_unique("email"),
    );
    let mut store = Store::new(schema, "node1", "main");
    store.insert("users", "a", json!({"email": null}), &ctx(1)).unwrap();
    store.insert("users", "b", json!({}), &ctx(1)).unwrap();
    store.insert("users", "c", json!({"email": null}), &ctx(1)).unwrap();
    assert_eq!(store.count("users", &Filter::all()).unwrap(), 3);
}

#[test]
fn json_filter_through_store() {
    let mut store = Store::new(create_test_schema(), "node1", "main");
    for i in 0..10 {
        store
            .insert("items", format!("i{i}"), json!({"name": format!("n{i}"), "count": i}), &ctx(i))
            .unwrap();
    }

    let filter = Filter::from_json(&json!({"count": {"$gte": 3, "$lt": 6}})).unwrap();
    let docs = store
        .find("items", &filter, &FindOptions::default().sorted_by(Sort::asc("count")))
        .unwrap();
    let counts: Vec<_> = docs.iter().map(|d| d.fields["count"].clone()).collect();
    assert_eq!(counts, vec![json!(3), json!(4), json!(5)]);

    let page = store
        .find_page("items", &Filter::all(), 2, 4, Sort::default())
        .unwrap();
    assert_eq!(page.page_count, 3);
    assert_eq!(page.documents[0].id, "i5");
}

// ============================================================================
// Snapshots
// ============================================================================

#[test]
fn snapshot_round_trip_through_json() {
    let mut store = Store::new(create_test_schema(), "node1", "main");
    store.insert("items", "a", json!({"name": "one", "data": {"x": [1]}}), &ctx(1)).unwrap();
    store.insert("notes", "n", json!({"text": "free form"}), &ctx(2)).unwrap();

    let snapshot = store.export_state(None, 99).unwrap();
    let bytes = snapshot.to_json().unwrap();
    let parsed = StoreSnapshot::from_json(&bytes).unwrap();

    let mut fresh = Store::new(create_test_schema(), "node2", "main");
    fresh.import_state(&parsed).unwrap();
    assert_eq!(fresh.export_state(None, 99).unwrap().collections, snapshot.collections);
    // restore is not change capture
    assert!(fresh.pending().is_empty());
}

#[test]
fn import_rejects_unknown_collections() {
    let mut store = Store::new(create_test_schema(), "node1", "main");
    let mut snapshot = store.export_state(None, 1).unwrap();
    snapshot.add_collection("ghosts");
    assert!(matches!(
        store.import_state(&snapshot),
        Err(Error::CollectionNotFound(_))
    ));
}

#[test]
fn replace_with_duplicate_unique_values_fails_cleanly() {
    let mut store = Store::new(create_test_schema(), "node1", "main");
    store.insert("items", "keep", json!({"name": "keep"}), &ctx(1)).unwrap();

    let a = Document::from_input("a", json!({"name": "dup"}), 1, "x", None).unwrap();
    let b = Document::from_input("b", json!({"name": "dup"}), 1, "x", None).unwrap();
    let err = store
        .restore_collection("items", vec![a, b], RestoreMode::Replace)
        .unwrap_err();
    assert!(matches!(err, Error::UniqueConstraintViolation { .. }));
    assert!(store.get("items", "keep").unwrap().is_some());
}

#[test]
fn remote_update_overwrites_local_image() {
    let mut store = Store::new(create_test_schema(), "node1", "main");
    store.insert("items", "a", json!({"name": "local"}), &ctx(1)).unwrap();

    let mut remote = store.get("items", "a").unwrap().unwrap().clone();
    remote.fields.insert("name".into(), json!("remote"));
    store
        .apply_remote(
            "items",
            RemoteChange {
                operation: ChangeOperation::Update,
                document_id: "a".into(),
                document: Some(remote),
            },
        )
        .unwrap();

    assert_eq!(store.get("items", "a").unwrap().unwrap().fields["name"], "remote");
    assert_eq!(store.pending().len(), 1);
}

// ============================================================================
// Properties
// ============================================================================

#[derive(Debug, Clone)]
enum Step {
    Insert(u8),
    Update(u8),
    Remove(u8),
    UpdateAll,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0u8..8).prop_map(Step::Insert),
        (0u8..8).prop_map(Step::Update),
        (0u8..8).prop_map(Step::Remove),
        Just(Step::UpdateAll),
    ]
}

proptest! {
    #[test]
    fn pending_matches_unacknowledged_entries(steps in prop::collection::vec(step(), 0..40)) {
        let mut store = Store::new(create_test_schema(), "node1", "main");

        for (ts, s) in steps.iter().enumerate() {
            let c = ctx(ts as u64);
            let _ = match s {
                Step::Insert(k) => store
                    .insert("items", format!("i{k}"), json!({"name": format!("n{k}")}), &c)
                    .map(|_| ()),
                Step::Update(k) => store
                    .update("items", &Filter::by_id(format!("i{k}")), &json!({"count": ts}), false, &c)
                    .map(|_| ()),
                Step::Remove(k) => store
                    .remove("items", &Filter::by_id(format!("i{k}")), false, &c)
                    .map(|_| ()),
                Step::UpdateAll => store
                    .update("items", &Filter::all(), &json!({"touched": true}), true, &c)
                    .map(|_| ()),
            };
        }

        let unacknowledged = store.changelog().entries().filter(|e| !e.acknowledged).count();
        let pending = store.pending();
        prop_assert_eq!(unacknowledged, pending.len());

        let ids: Vec<_> = pending.iter().map(|e| e.id).collect();
        store.acknowledge(&ids);
        prop_assert_eq!(store.pending().len(), 0);
        prop_assert!(store.acknowledge(&ids).is_empty());
    }

    #[test]
    fn duplicate_unique_insert_never_changes_count(names in prop::collection::vec("[a-c]{1,2}", 1..30)) {
        let mut store = Store::new(create_test_schema(), "node1", "main");

        for (i, name) in names.iter().enumerate() {
            let before = store.count("items", &Filter::all()).unwrap();
            let exists = store.count("items", &Filter::all().eq("name", name.as_str())).unwrap() > 0;
            let result = store.insert("items", format!("id{i}"), json!({ "name": name }), &ctx(i as u64));

            if exists {
                let is_violation = matches!(result, Err(Error::UniqueConstraintViolation { .. }));
                prop_assert!(is_violation);
                prop_assert_eq!(store.count("items", &Filter::all()).unwrap(), before);
            } else {
                prop_assert!(result.is_ok());
                prop_assert_eq!(store.count("items", &Filter::all()).unwrap(), before + 1);
            }
        }
    }
}
