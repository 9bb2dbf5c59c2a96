mod helpers;

use std::time::Duration;

use helpers::{approvals, test_store};
use specula::control::{self, ActionStatus, RiskLevel};
use specula::improver::{tick, ActionKind, ImprovementAction, TickContext};
use tempfile::TempDir;

const BUDGET: Duration = Duration::from_secs(30);
const TTL: Duration = Duration::from_secs(604_800);

#[test]
fn approve_executes_once_then_becomes_a_no_op() {
    let dir = TempDir::new().unwrap();
    let (store, observer) = test_store(&dir);

    let entry = store.save_entry("note to archive", vec![], "test", None).unwrap();
    let pending = control::enqueue(
        &observer,
        ImprovementAction::ArchiveStale {
            entry_ids: vec![entry.id.clone()],
        },
        RiskLevel::High,
        TTL,
    )
    .unwrap()
    .expect("first enqueue is not a duplicate");

    let first = control::approve(&store, &observer, &pending.id).unwrap();
    assert!(first.applied);
    assert_eq!(first.affected, 1);
    assert!(store.get(&entry.id).unwrap().unwrap().archived);

    // approving again is a structured no-op and mutates nothing
    let state_before = observer.load_state().unwrap();
    let second = control::approve(&store, &observer, &pending.id).unwrap();
    assert!(!second.applied);
    let state_after = observer.load_state().unwrap();
    assert_eq!(
        state_before.improvements.len(),
        state_after.improvements.len()
    );

    // missing IDs are also a structured no-op
    let missing = control::approve(&store, &observer, "act-nope").unwrap();
    assert!(!missing.applied);
    assert!(missing.message.contains("not found"));
}

#[test]
fn status_transitions_are_monotonic() {
    let dir = TempDir::new().unwrap();
    let (store, observer) = test_store(&dir);

    let entry = store.save_entry("note", vec![], "test", None).unwrap();
    let pending = control::enqueue(
        &observer,
        ImprovementAction::ArchiveStale {
            entry_ids: vec![entry.id.clone()],
        },
        RiskLevel::High,
        TTL,
    )
    .unwrap()
    .unwrap();

    let outcome = control::dismiss(&store, &observer, &pending.id, Some("keep it")).unwrap();
    assert!(outcome.dismissed);

    // dismissed actions cannot be approved afterwards
    let approve = control::approve(&store, &observer, &pending.id).unwrap();
    assert!(!approve.applied);
    assert!(!store.get(&entry.id).unwrap().unwrap().archived);

    let state = observer.load_state().unwrap();
    let action = state.pending_actions.iter().find(|p| p.id == pending.id).unwrap();
    assert_eq!(action.status, ActionStatus::Dismissed);
    assert_eq!(action.dismissal_reason.as_deref(), Some("keep it"));
}

#[test]
fn enqueue_deduplicates_overlapping_targets() {
    let dir = TempDir::new().unwrap();
    let (_store, observer) = test_store(&dir);

    let first = control::enqueue(
        &observer,
        ImprovementAction::ArchiveStale {
            entry_ids: vec!["ctx-1".into(), "ctx-2".into()],
        },
        RiskLevel::High,
        TTL,
    )
    .unwrap();
    assert!(first.is_some());

    let overlapping = control::enqueue(
        &observer,
        ImprovementAction::ArchiveStale {
            entry_ids: vec!["ctx-2".into(), "ctx-3".into()],
        },
        RiskLevel::High,
        TTL,
    )
    .unwrap();
    assert!(overlapping.is_none());

    let disjoint = control::enqueue(
        &observer,
        ImprovementAction::ArchiveStale {
            entry_ids: vec!["ctx-9".into()],
        },
        RiskLevel::High,
        TTL,
    )
    .unwrap();
    assert!(disjoint.is_some());
}

#[test]
fn expiry_flips_overdue_actions_without_executing() {
    let dir = TempDir::new().unwrap();
    let (store, observer) = test_store(&dir);

    let entry = store.save_entry("note", vec![], "test", None).unwrap();
    let pending = control::enqueue(
        &observer,
        ImprovementAction::ArchiveStale {
            entry_ids: vec![entry.id.clone()],
        },
        RiskLevel::High,
        Duration::from_secs(0),
    )
    .unwrap()
    .unwrap();

    let later = (chrono::Utc::now() + chrono::Duration::seconds(1)).to_rfc3339();
    let expired = observer
        .with_state(|state| control::expire(state, later.clone()))
        .unwrap();
    assert_eq!(expired, 1);

    let state = observer.load_state().unwrap();
    let action = state.pending_actions.iter().find(|p| p.id == pending.id).unwrap();
    assert_eq!(action.status, ActionStatus::Expired);
    // expiry never executes the action
    assert!(!store.get(&entry.id).unwrap().unwrap().archived);
}

#[tokio::test]
async fn three_dismissals_teach_a_type_scoped_protection() {
    let dir = TempDir::new().unwrap();
    let (store, observer) = test_store(&dir);

    // three near-duplicate pairs, all typed "preference"
    let pairs = [
        (
            "user prefers tabs over spaces when editing python code",
            "user prefers tabs over spaces when editing python source code",
        ),
        (
            "meetings should land on tuesday mornings berlin timezone",
            "meetings should land on tuesday late mornings berlin timezone",
        ),
        (
            "dark theme looks better for long coding sessions",
            "dark theme looks much better for long coding sessions",
        ),
    ];
    for (a, b) in pairs {
        let first = store.save_entry(a, vec!["pref".into()], "test", None).unwrap();
        let second = store.save_entry(b, vec!["pref".into()], "test", None).unwrap();
        store.set_type(&first.id, Some("preference")).unwrap();
        store.set_type(&second.id, Some("preference")).unwrap();
    }

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
    let state = observer.load_state().unwrap();
    let merge_ids: Vec<String> = state
        .pending_actions
        .iter()
        .filter(|p| p.is_pending() && p.action.kind() == ActionKind::MergeDuplicates)
        .map(|p| p.id.clone())
        .collect();
    assert_eq!(merge_ids.len(), 3);

    for id in &merge_ids {
        let outcome =
            control::dismiss(&store, &observer, id, Some("these are distinct notes")).unwrap();
        assert!(outcome.dismissed);
    }

    // the third dismissal escalates to a type-scoped protection
    let state = observer.load_state().unwrap();
    let scoped = state
        .protections
        .iter()
        .find(|p| {
            p.scope
                .as_ref()
                .is_some_and(|s| s.get("typeName").map(String::as_str) == Some("preference"))
        })
        .expect("pattern protection learned from repeated dismissals");
    assert!(scoped.actions.contains(&ActionKind::MergeDuplicates));

    // a brand-new preference pair is no longer proposed for merging
    let first = store
        .save_entry("coffee before standup works better than after", vec![], "test", None)
        .unwrap();
    let second = store
        .save_entry("coffee just before standup works better than after", vec![], "test", None)
        .unwrap();
    store.set_type(&first.id, Some("preference")).unwrap();
    store.set_type(&second.id, Some("preference")).unwrap();

    tick(make_ctx()).await;
    let state = observer.load_state().unwrap();
    assert!(
        !state
            .pending_actions
            .iter()
            .any(|p| p.is_pending() && p.action.kind() == ActionKind::MergeDuplicates),
        "no merge may be proposed for protected preference entries"
    );
    assert!(
        !state
            .improvements
            .iter()
            .any(|r| r.actions.iter().any(|a| a.kind == ActionKind::MergeDuplicates)),
        "no merge may have been executed either"
    );
}
