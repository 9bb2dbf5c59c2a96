mod helpers;

use helpers::{test_catalog, test_store};
use specula::store::types::{FieldValue, StructuredData};
use specula::store::{ContextStore, EntryPatch};
use tempfile::TempDir;

#[test]
fn entries_and_bubbles_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let (store, _observer) = test_store(&dir);

    let bubble = store.create_bubble("project-x", Some("the big rewrite".into())).unwrap();
    let entry = store
        .save_entry(
            "Use Redis for session caching",
            vec!["infra".into()],
            "test",
            Some(bubble.id.clone()),
        )
        .unwrap();
    drop(store);

    let reopened = ContextStore::open(dir.path().join("context.json"), None).unwrap();
    let got = reopened.get(&entry.id).unwrap().unwrap();
    assert_eq!(got.content, "Use Redis for session caching");
    assert_eq!(got.bubble_id.as_deref(), Some(bubble.id.as_str()));
    assert_eq!(reopened.list_bubbles().unwrap().len(), 1);
}

#[test]
fn store_file_has_version_and_groups() {
    let dir = TempDir::new().unwrap();
    let (store, _observer) = test_store(&dir);
    store.save_entry("anything", vec![], "test", None).unwrap();

    let raw = std::fs::read_to_string(dir.path().join("context.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(value["version"].is_number());
    assert!(value["entries"].is_array());
    assert!(value["groups"].is_array());
}

#[test]
fn version_one_file_without_groups_migrates() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("context.json");
    std::fs::write(
        &path,
        r#"{"version": 1, "entries": [{"id": "ctx-legacy", "content": "old note",
            "createdAt": "2025-01-01T00:00:00+00:00", "updatedAt": "2025-01-01T00:00:00+00:00"}]}"#,
    )
    .unwrap();

    let store = ContextStore::open(&path, None).unwrap();
    assert!(store.list_bubbles().unwrap().is_empty());
    let entry = store.get("ctx-legacy").unwrap().unwrap();
    assert_eq!(entry.content, "old note");
    assert!(entry.tags.is_empty());
    assert!(!entry.archived);
}

#[test]
fn archive_flag_persists_and_hides_everywhere() {
    let dir = TempDir::new().unwrap();
    let (store, _observer) = test_store(&dir);

    let kept = store.save_entry("kept note about caching", vec![], "test", None).unwrap();
    let gone = store.save_entry("archived note about caching", vec![], "test", None).unwrap();
    store.set_archived(&gone.id, true).unwrap();
    drop(store);

    let store = ContextStore::open(dir.path().join("context.json"), None).unwrap();
    let active_ids: Vec<String> = store.list(None).unwrap().iter().map(|e| e.id.clone()).collect();
    assert_eq!(active_ids, vec![kept.id.clone()]);

    for results in [
        store.recall("caching").unwrap(),
        store.search("note caching").unwrap(),
    ] {
        assert!(results.iter().all(|e| e.id != gone.id));
        assert!(results.iter().any(|e| e.id == kept.id));
    }

    // still reachable directly and via the archive listing
    assert!(store.get(&gone.id).unwrap().unwrap().archived);
    assert_eq!(store.list_archived().unwrap().len(), 1);
}

#[test]
fn typed_save_validation_error_still_persists() {
    let dir = TempDir::new().unwrap();
    let (store, _observer) = test_store(&dir);
    let catalog = test_catalog();

    let mut data = StructuredData::new();
    data.insert("what".into(), FieldValue::Text("Use Redis".into()));
    let result = store
        .save_typed(Some(&catalog), "decision", data, vec![], "test")
        .unwrap();

    assert!(!result.valid);
    assert!(result.validation_errors.iter().any(|e| e.contains("\"why\"")));
    assert_eq!(result.entry.type_name.as_deref(), Some("decision"));

    // the entry is really on disk and typed queries see it
    let hits = store.query_by_type("decision", &StructuredData::new()).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, result.entry.id);
}

#[test]
fn update_keeps_created_at_and_advances_updated_at() {
    let dir = TempDir::new().unwrap();
    let (store, _observer) = test_store(&dir);

    let saved = store.save_entry("draft", vec![], "test", None).unwrap();
    let updated = store
        .update(
            &saved.id,
            EntryPatch {
                content: Some("final".into()),
                ..Default::default()
            },
        )
        .unwrap()
        .unwrap();

    assert_eq!(updated.created_at, saved.created_at);
    assert!(updated.updated_at >= saved.updated_at);

    // by-value equality between the returned entry and the persisted one
    let persisted = store.get(&saved.id).unwrap().unwrap();
    assert_eq!(persisted.content, updated.content);
    assert_eq!(persisted.updated_at, updated.updated_at);
}

#[test]
fn observer_sees_store_traffic() {
    let dir = TempDir::new().unwrap();
    let (store, observer) = test_store(&dir);

    store.save_entry("observed note", vec![], "test", None).unwrap();
    store.recall("observed").unwrap();
    store.recall("no such thing").unwrap();

    let summary = observer.summary().unwrap();
    assert_eq!(summary.total_writes, 1);
    assert_eq!(summary.total_reads, 1);
    assert_eq!(summary.total_misses, 1);
    assert_eq!(summary.missed_queries.get("no such thing"), Some(&1));
}
