mod helpers;

use std::time::Duration;

use helpers::{approvals, backdate_entry, record_misses, test_store};
use specula::control;
use specula::improver::{tick, ActionKind, TickContext};
use tempfile::TempDir;

const BUDGET: Duration = Duration::from_secs(30);
const TTL: Duration = Duration::from_secs(604_800);

#[tokio::test]
async fn stale_unread_entry_is_archived_with_high_auto_approve() {
    let dir = TempDir::new().unwrap();
    let (store, observer) = test_store(&dir);

    let entry = store
        .save_entry("ancient kafka migration notes", vec!["kafka".into()], "test", None)
        .unwrap();
    backdate_entry(&dir.path().join("context.json"), &entry.id, 200);

    let outcome = tick(TickContext {
        store: &store,
        catalog: None,
        observer: &observer,
        analyzer: None,
        approvals: &approvals(true, false, true),
        pending_ttl: TTL,
        budget: BUDGET,
    })
    .await;

    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
    assert!(store.get(&entry.id).unwrap().unwrap().archived);

    let state = observer.load_state().unwrap();
    assert!(state
        .improvements
        .iter()
        .any(|r| r.actions.iter().any(|a| a.kind == ActionKind::ArchiveStale)));
}

#[tokio::test]
async fn stale_archival_waits_for_approval_by_default() {
    let dir = TempDir::new().unwrap();
    let (store, observer) = test_store(&dir);

    let entry = store
        .save_entry("another ancient kafka note", vec!["kafka".into()], "test", None)
        .unwrap();
    backdate_entry(&dir.path().join("context.json"), &entry.id, 200);

    tick(TickContext {
        store: &store,
        catalog: None,
        observer: &observer,
        analyzer: None,
        approvals: &approvals(true, false, false),
        pending_ttl: TTL,
        budget: BUDGET,
    })
    .await;

    // not archived; a high-risk pending action sits in the queue instead
    assert!(!store.get(&entry.id).unwrap().unwrap().archived);
    let state = observer.load_state().unwrap();
    let pending: Vec<_> = state.pending_actions.iter().filter(|p| p.is_pending()).collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action.kind(), ActionKind::ArchiveStale);
    assert_eq!(pending[0].risk, specula::control::RiskLevel::High);
}

#[tokio::test]
async fn repeated_misses_produce_a_gap_stub() {
    let dir = TempDir::new().unwrap();
    let (store, observer) = test_store(&dir);
    record_misses(&observer, "deployment", 3);

    tick(TickContext {
        store: &store,
        catalog: None,
        observer: &observer,
        analyzer: None,
        approvals: &approvals(true, false, false),
        pending_ttl: TTL,
        budget: BUDGET,
    })
    .await;

    let stubs = store.list(Some("gap")).unwrap();
    assert_eq!(stubs.len(), 1);
    assert!(stubs[0].content.contains("\"deployment\""));
    assert!(stubs[0].content.contains("3 times"));
    assert!(stubs[0].has_tag("needs-input"));
    assert_eq!(stubs[0].source, "self-improvement");
}

#[tokio::test]
async fn untagged_entries_get_auto_tagged() {
    let dir = TempDir::new().unwrap();
    let (store, observer) = test_store(&dir);

    for content in [
        "deploy the staging cluster after review",
        "rotate database credentials quarterly",
        "grafana dashboards live under the infra folder",
    ] {
        store.save_entry(content, vec![], "test", None).unwrap();
    }

    tick(TickContext {
        store: &store,
        catalog: None,
        observer: &observer,
        analyzer: None,
        approvals: &approvals(true, false, false),
        pending_ttl: TTL,
        budget: BUDGET,
    })
    .await;

    for entry in store.list(None).unwrap() {
        assert!(!entry.tags.is_empty(), "entry {} still untagged", entry.id);
        assert!(entry.tags.len() <= 3);
    }
}

#[tokio::test]
async fn near_duplicates_queue_a_merge_and_approval_executes_it() {
    let dir = TempDir::new().unwrap();
    let (store, observer) = test_store(&dir);

    let older = store
        .save_entry(
            "the deploy pipeline runs on fridays after review",
            vec!["deploy".into()],
            "test",
            None,
        )
        .unwrap();
    let newer = store
        .save_entry(
            "the deploy pipeline runs on fridays after code review",
            vec!["pipeline".into()],
            "test",
            None,
        )
        .unwrap();
    store.set_type(&older.id, Some("decision")).unwrap();
    store.set_type(&newer.id, Some("decision")).unwrap();

    tick(TickContext {
        store: &store,
        catalog: None,
        observer: &observer,
        analyzer: None,
        approvals: &approvals(true, false, false),
        pending_ttl: TTL,
        budget: BUDGET,
    })
    .await;

    let state = observer.load_state().unwrap();
    let pending: Vec<_> = state
        .pending_actions
        .iter()
        .filter(|p| p.is_pending() && p.action.kind() == ActionKind::MergeDuplicates)
        .collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].preview["survivorId"], newer.id.as_str());
    assert_eq!(pending[0].preview["archivedId"], older.id.as_str());

    let outcome = control::approve(&store, &observer, &pending[0].id).unwrap();
    assert!(outcome.applied);

    let survivor = store.get(&newer.id).unwrap().unwrap();
    assert!(survivor.has_tag("deploy"), "tags should be unioned");
    assert!(survivor.has_tag("pipeline"));
    assert!(store.get(&older.id).unwrap().unwrap().archived);
}

#[tokio::test]
async fn back_to_back_ticks_are_idempotent() {
    let dir = TempDir::new().unwrap();
    let (store, observer) = test_store(&dir);

    for content in [
        "deploy the staging cluster after review",
        "rotate database credentials quarterly",
        "grafana dashboards live under the infra folder",
    ] {
        store.save_entry(content, vec![], "test", None).unwrap();
    }
    record_misses(&observer, "deployment", 3);

    let approvals_cfg = approvals(true, false, false);
    let make_ctx = || TickContext {
        store: &store,
        catalog: None,
        observer: &observer,
        analyzer: None,
        approvals: &approvals_cfg,
        pending_ttl: TTL,
        budget: BUDGET,
    };

    tick(make_ctx()).await;
    let after_first = observer.load_state().unwrap();
    let entries_after_first = store.list(None).unwrap().len();

    let second = tick(make_ctx()).await;
    let after_second = observer.load_state().unwrap();

    assert!(second.executed.is_empty(), "{:?}", second.executed);
    assert_eq!(second.queued, 0);
    assert_eq!(after_first.improvements.len(), after_second.improvements.len());
    assert_eq!(
        after_first.pending_actions.len(),
        after_second.pending_actions.len()
    );
    assert_eq!(store.list(None).unwrap().len(), entries_after_first);
}
