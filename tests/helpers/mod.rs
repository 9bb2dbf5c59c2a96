#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use specula::config::{ApprovalConfig, SpeculaConfig};
use specula::observer::{Event, EventKind, Observer};
use specula::schema::SchemaCatalog;
use specula::server::Runtime;
use specula::store::ContextStore;

/// A fresh runtime over temp files, with the LM disabled so every analysis
/// takes the deterministic path.
pub fn test_runtime(dir: &TempDir) -> Runtime {
    Runtime::new(test_config(dir)).unwrap()
}

pub fn test_config(dir: &TempDir) -> SpeculaConfig {
    let mut config = SpeculaConfig::default();
    config.storage.store_path = dir.path().join("context.json").to_string_lossy().into_owned();
    config.storage.awareness_path = dir
        .path()
        .join("awareness.json")
        .to_string_lossy()
        .into_owned();
    config.storage.schema_path = dir.path().join("schema.json").to_string_lossy().into_owned();
    config.lm.enabled = false;
    config
}

/// Store + observer wired together over temp files, without the runtime.
pub fn test_store(dir: &TempDir) -> (ContextStore, Arc<Observer>) {
    let observer = Arc::new(Observer::open(dir.path().join("awareness.json")));
    let store = ContextStore::open(
        dir.path().join("context.json"),
        Some(Arc::clone(&observer)),
    )
    .unwrap();
    (store, observer)
}

pub fn approvals(low: bool, medium: bool, high: bool) -> ApprovalConfig {
    ApprovalConfig {
        auto_approve_low: low,
        auto_approve_medium: medium,
        auto_approve_high: high,
    }
}

/// A two-required-field `decision` type plus a free `preference` type.
pub fn test_catalog() -> SchemaCatalog {
    serde_json::from_str(
        r#"{
            "version": 1,
            "types": [
                {
                    "name": "decision",
                    "description": "A technical decision about architecture or tooling",
                    "fields": {
                        "what": {"type": "string", "required": true},
                        "why": {"type": "string", "required": true}
                    }
                },
                {
                    "name": "preference",
                    "description": "A lasting preference the user expressed",
                    "fields": {
                        "topic": {"type": "string", "required": true},
                        "value": {"type": "string", "required": true}
                    }
                }
            ]
        }"#,
    )
    .unwrap()
}

pub fn write_catalog(dir: &TempDir, catalog: &SchemaCatalog) {
    specula::schema::save_catalog(dir.path().join("schema.json"), catalog).unwrap();
}

/// Rewrite an entry's timestamps in the store file to `days` ago. The store
/// reloads the file on every call, so the next operation sees the change.
pub fn backdate_entry(store_file: &Path, id: &str, days: i64) {
    let contents = std::fs::read_to_string(store_file).unwrap();
    let mut value: serde_json::Value = serde_json::from_str(&contents).unwrap();
    let then = (chrono::Utc::now() - chrono::Duration::days(days)).to_rfc3339();
    for entry in value["entries"].as_array_mut().unwrap() {
        if entry["id"] == id {
            entry["createdAt"] = serde_json::json!(then);
            entry["updatedAt"] = serde_json::json!(then);
        }
    }
    std::fs::write(store_file, serde_json::to_string_pretty(&value).unwrap()).unwrap();
}

/// Record `n` query-miss events for `query`.
pub fn record_misses(observer: &Observer, query: &str, n: usize) {
    for _ in 0..n {
        observer
            .record(Event {
                kind: EventKind::Miss,
                tool: "recall_context".into(),
                query: Some(query.into()),
                type_name: None,
                entry_ids: vec![],
                at: chrono::Utc::now().to_rfc3339(),
            })
            .unwrap();
    }
}
