//! The control plane — risk gating, the pending queue, and protections.
//!
//! Every improvement action is classified by a fixed risk table. Low-risk
//! actions auto-execute (by default); the rest land in a pending queue with
//! a TTL and wait for human approval. Dismissals teach the system: each one
//! protects the dismissed targets, and repeated dismissals of a kind within
//! one scope escalate to a pattern protection that blocks re-proposal.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::ApprovalConfig;
use crate::improver::{execute_action, ActionKind, ImprovementAction};
use crate::observer::{ActionCount, AwarenessState, ImprovementRecord, Observer};
use crate::store::types::ContextEntry;
use crate::store::ContextStore;

/// Dismissals of one kind sharing a scope before a pattern protection is
/// learned.
const PATTERN_LEARN_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Pending-action lifecycle. Transitions are monotonic: once an action
/// leaves `pending` it never returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Approved,
    Dismissed,
    Expired,
}

/// An improvement proposal awaiting a human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub id: String,
    pub created_at: String,
    pub expires_at: String,
    pub action: ImprovementAction,
    pub risk: RiskLevel,
    pub description: String,
    pub reasoning: String,
    pub preview: serde_json::Value,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dismissal_reason: Option<String>,
}

impl PendingAction {
    pub fn is_pending(&self) -> bool {
        self.status == ActionStatus::Pending
    }
}

/// A standing rule blocking re-proposal of certain action kinds. Either
/// entry-scoped (`entry_id`) or pattern/type-scoped: when `scope` is present
/// each key must match the entry's attribute (`typeName`, `source`, `tag`);
/// otherwise `pattern` is a case-insensitive substring test against the
/// entry content (or the query, for gap stubs).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Protection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<BTreeMap<String, String>>,
    pub actions: Vec<ActionKind>,
    pub reason: String,
    pub created_at: String,
}

/// The fixed risk table.
pub fn classify(kind: ActionKind) -> RiskLevel {
    match kind {
        ActionKind::AutoTag | ActionKind::CreateGapStubs | ActionKind::SuggestSchema => {
            RiskLevel::Low
        }
        ActionKind::MergeDuplicates | ActionKind::PromoteToType => RiskLevel::Medium,
        ActionKind::ArchiveStale | ActionKind::ResolveContradictions => RiskLevel::High,
    }
}

pub fn auto_approved(risk: RiskLevel, approvals: &ApprovalConfig) -> bool {
    match risk {
        RiskLevel::Low => approvals.auto_approve_low,
        RiskLevel::Medium => approvals.auto_approve_medium,
        RiskLevel::High => approvals.auto_approve_high,
    }
}

/// True if any protection blocks `kind` against this entry.
pub fn is_protected(state: &AwarenessState, entry: &ContextEntry, kind: ActionKind) -> bool {
    state.protections.iter().any(|p| {
        if !p.actions.contains(&kind) {
            return false;
        }
        if let Some(id) = &p.entry_id {
            return id == &entry.id;
        }
        if let Some(scope) = &p.scope {
            return scope.iter().all(|(key, want)| match key.as_str() {
                "typeName" => entry.type_name.as_deref() == Some(want),
                "source" => entry.source == *want,
                "tag" => entry.has_tag(want),
                _ => false,
            });
        }
        if let Some(pattern) = &p.pattern {
            return entry
                .content
                .to_lowercase()
                .contains(&pattern.to_lowercase());
        }
        false
    })
}

/// Protection check for actions that target a query rather than an entry.
pub fn is_query_protected(state: &AwarenessState, query: &str, kind: ActionKind) -> bool {
    state.protections.iter().any(|p| {
        p.actions.contains(&kind)
            && p.entry_id.is_none()
            && p.scope.is_none()
            && p.pattern
                .as_ref()
                .is_some_and(|pattern| query.to_lowercase().contains(&pattern.to_lowercase()))
    })
}

// ── Enqueue ──────────────────────────────────────────────────────────────────

/// Queue an action for approval. Returns `None` when an overlapping pending
/// action of the same kind already exists (de-duplication).
pub fn enqueue(
    observer: &Observer,
    action: ImprovementAction,
    risk: RiskLevel,
    ttl: Duration,
) -> Result<Option<PendingAction>> {
    observer.with_state(move |state| {
        let duplicate = state.pending_actions.iter().any(|p| {
            p.is_pending() && p.action.kind() == action.kind() && overlaps(&p.action, &action)
        });
        if duplicate {
            return None;
        }
        let pending = build_pending(action, risk, ttl);
        state.pending_actions.push(pending.clone());
        Some(pending)
    })
}

/// Two actions overlap when they share a target entry, or when neither has
/// entry targets (stub/suggestion actions de-duplicate per kind).
fn overlaps(a: &ImprovementAction, b: &ImprovementAction) -> bool {
    let targets_a = a.target_ids();
    let targets_b = b.target_ids();
    if targets_a.is_empty() && targets_b.is_empty() {
        return true;
    }
    targets_a.iter().any(|id| targets_b.contains(id))
}

fn build_pending(action: ImprovementAction, risk: RiskLevel, ttl: Duration) -> PendingAction {
    let now = chrono::Utc::now();
    let expires = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(7));
    let (description, reasoning) = describe(&action);
    PendingAction {
        id: format!("act-{}", uuid::Uuid::now_v7().simple()),
        created_at: now.to_rfc3339(),
        expires_at: expires.to_rfc3339(),
        preview: preview(&action),
        action,
        risk,
        description,
        reasoning,
        status: ActionStatus::Pending,
        dismissal_reason: None,
    }
}

/// Kind-specific preview object shown to the user before approval.
fn preview(action: &ImprovementAction) -> serde_json::Value {
    match action {
        ImprovementAction::AutoTag { entry_ids } => {
            serde_json::json!({ "entryIds": entry_ids })
        }
        ImprovementAction::MergeDuplicates {
            survivor_id,
            duplicate_id,
        } => serde_json::json!({ "survivorId": survivor_id, "archivedId": duplicate_id }),
        ImprovementAction::PromoteToType {
            entry_id,
            type_name,
        } => serde_json::json!({ "entryId": entry_id, "typeName": type_name }),
        ImprovementAction::ArchiveStale { entry_ids } => {
            serde_json::json!({ "entryIds": entry_ids })
        }
        ImprovementAction::CreateGapStubs { stubs } => serde_json::json!({
            "queries": stubs.iter().map(|s| s.query.clone()).collect::<Vec<_>>()
        }),
        ImprovementAction::ResolveContradictions {
            keep_id,
            archive_id,
            explanation,
        } => serde_json::json!({
            "keepId": keep_id,
            "archiveId": archive_id,
            "explanation": explanation,
        }),
        ImprovementAction::SuggestSchema { suggestions, .. } => {
            serde_json::json!({ "suggestions": suggestions })
        }
    }
}

fn describe(action: &ImprovementAction) -> (String, String) {
    match action {
        ImprovementAction::AutoTag { entry_ids } => (
            format!("Auto-tag {} untagged entries", entry_ids.len()),
            "These entries have no tags, which makes them hard to find by tag \
             filters. Keyword tags would be extracted from their content and \
             unioned with the (empty) existing set; content is not modified."
                .into(),
        ),
        ImprovementAction::MergeDuplicates {
            survivor_id,
            duplicate_id,
        } => (
            format!("Merge duplicate entries {survivor_id} and {duplicate_id}"),
            format!(
                "The two entries share the same type and their contents are \
                 nearly identical. The newer entry ({survivor_id}) would absorb \
                 any differing content and tags; the older ({duplicate_id}) \
                 would be archived, not deleted."
            ),
        ),
        ImprovementAction::PromoteToType {
            entry_id,
            type_name,
        } => (
            format!("Promote {entry_id} to type \"{type_name}\""),
            format!(
                "The entry's content shares several keywords with the \
                 \"{type_name}\" type description. Promotion only sets the type \
                 name so the entry shows up in typed queries; content and tags \
                 stay as they are."
            ),
        ),
        ImprovementAction::ArchiveStale { entry_ids } => (
            format!("Archive {} stale entries", entry_ids.len()),
            "These entries have not been updated in over six months and no \
             observed read has ever returned them. Archiving hides them from \
             recall and search; they remain retrievable by ID and can be \
             unarchived at any time."
                .into(),
        ),
        ImprovementAction::CreateGapStubs { stubs } => (
            format!("Create {} gap stubs for repeatedly missed queries", stubs.len()),
            "Agents keep searching for these terms and finding nothing. A \
             stub entry per query marks the gap and asks for input, so the \
             next search at least explains itself."
                .into(),
        ),
        ImprovementAction::ResolveContradictions {
            keep_id,
            archive_id,
            explanation,
        } => (
            format!("Resolve contradiction: keep {keep_id}, archive {archive_id}"),
            format!(
                "The two entries contradict each other ({explanation}) and \
                 their update times are more than six months apart. The newer \
                 entry would be kept; the older would be archived."
            ),
        ),
        ImprovementAction::SuggestSchema { suggestions, .. } => (
            format!("Suggest {} new context types", suggestions.len()),
            "Enough untyped entries have accumulated to suggest a shape for \
             them. The suggestions are recorded for review; the schema file \
             itself is never modified automatically."
                .into(),
        ),
    }
}

// ── Approve / dismiss / expire ───────────────────────────────────────────────

/// Result of an approve call. Approving a missing or non-pending action is
/// a no-op with `applied == false`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalOutcome {
    pub id: String,
    pub applied: bool,
    pub affected: usize,
    pub message: String,
}

/// Approve and execute a pending action.
pub fn approve(store: &ContextStore, observer: &Observer, id: &str) -> Result<ApprovalOutcome> {
    // claim inside the critical section, execute outside it (execution
    // writes store events through the same observer)
    let claimed = observer.with_state(|state| {
        let Some(pending) = state.pending_actions.iter_mut().find(|p| p.id == id) else {
            return Err(format!("pending action not found: {id}"));
        };
        if !pending.is_pending() {
            return Err(format!(
                "action {id} is {:?} and cannot be approved",
                pending.status
            ));
        }
        pending.status = ActionStatus::Approved;
        Ok(pending.action.clone())
    })?;

    let action = match claimed {
        Ok(action) => action,
        Err(message) => {
            return Ok(ApprovalOutcome {
                id: id.to_string(),
                applied: false,
                affected: 0,
                message,
            })
        }
    };

    let affected = execute_action(store, observer, &action)?;
    observer.add_improvement(ImprovementRecord {
        timestamp: chrono::Utc::now().to_rfc3339(),
        actions: vec![ActionCount {
            kind: action.kind(),
            count: affected,
        }],
        auto_executed: false,
    })?;

    Ok(ApprovalOutcome {
        id: id.to_string(),
        applied: true,
        affected,
        message: format!("executed {}", action.kind()),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DismissOutcome {
    pub id: String,
    pub dismissed: bool,
    pub protections_added: usize,
    pub message: String,
}

/// Dismiss a pending action and learn from it: every target entry gains an
/// entry-scoped protection for this kind, and three dismissals of one kind
/// sharing a target type escalate to a type-scoped pattern protection.
pub fn dismiss(
    store: &ContextStore,
    observer: &Observer,
    id: &str,
    reason: Option<&str>,
) -> Result<DismissOutcome> {
    // phase 1: mark dismissed, collect this and past dismissals of the kind
    let marked = observer.with_state(|state| {
        let Some(pending) = state.pending_actions.iter_mut().find(|p| p.id == id) else {
            return Err(format!("pending action not found: {id}"));
        };
        if !pending.is_pending() {
            return Err(format!(
                "action {id} is {:?} and cannot be dismissed",
                pending.status
            ));
        }
        pending.status = ActionStatus::Dismissed;
        pending.dismissal_reason = reason.map(str::to_string);
        let action = pending.action.clone();
        let kind = action.kind();
        let dismissed_same_kind: Vec<ImprovementAction> = state
            .pending_actions
            .iter()
            .filter(|p| p.status == ActionStatus::Dismissed && p.action.kind() == kind)
            .map(|p| p.action.clone())
            .collect();
        Ok((action, dismissed_same_kind))
    })?;

    let (action, dismissed_same_kind) = match marked {
        Ok(out) => out,
        Err(message) => {
            return Ok(DismissOutcome {
                id: id.to_string(),
                dismissed: false,
                protections_added: 0,
                message,
            })
        }
    };

    // phase 2: resolve scopes outside the awareness lock (store lookups)
    let kind = action.kind();
    let now = chrono::Utc::now().to_rfc3339();
    let mut protections: Vec<Protection> = action
        .target_ids()
        .iter()
        .map(|entry_id| Protection {
            entry_id: Some(entry_id.to_string()),
            pattern: None,
            scope: None,
            actions: vec![kind],
            reason: reason.unwrap_or("dismissed by user").to_string(),
            created_at: now.clone(),
        })
        .collect();

    if let Some(scope_type) = shared_scope(store, &action)? {
        let same_scope = dismissed_same_kind
            .iter()
            .filter(|a| {
                shared_scope(store, a)
                    .ok()
                    .flatten()
                    .is_some_and(|t| t == scope_type)
            })
            .count();
        if same_scope >= PATTERN_LEARN_THRESHOLD {
            let mut scope = BTreeMap::new();
            scope.insert("typeName".to_string(), scope_type.clone());
            protections.push(Protection {
                entry_id: None,
                pattern: Some(scope_type.clone()),
                scope: Some(scope),
                actions: vec![kind],
                reason: format!(
                    "{same_scope} {kind} actions dismissed for type \"{scope_type}\""
                ),
                created_at: now.clone(),
            });
            tracing::info!(
                kind = %kind,
                scope = %scope_type,
                "learned pattern protection from repeated dismissals"
            );
        }
    }

    // phase 3: persist the learned protections
    let added = protections.len();
    observer.with_state(move |state| {
        for protection in protections {
            let duplicate = state.protections.iter().any(|p| {
                p.entry_id == protection.entry_id
                    && p.scope == protection.scope
                    && p.actions == protection.actions
            });
            if !duplicate {
                state.protections.push(protection);
            }
        }
    })?;

    Ok(DismissOutcome {
        id: id.to_string(),
        dismissed: true,
        protections_added: added,
        message: format!("dismissed {kind}"),
    })
}

/// The type name shared by every target entry of an action, if any.
fn shared_scope(store: &ContextStore, action: &ImprovementAction) -> Result<Option<String>> {
    let mut shared: Option<String> = None;
    for id in action.target_ids() {
        let Some(entry) = store.get(id)? else {
            return Ok(None);
        };
        let Some(type_name) = entry.type_name else {
            return Ok(None);
        };
        match &shared {
            None => shared = Some(type_name),
            Some(existing) if *existing == type_name => {}
            Some(_) => return Ok(None),
        }
    }
    Ok(shared)
}

/// Expire pending actions past their TTL. Expiration never executes.
pub fn expire(state: &mut AwarenessState, now: String) -> usize {
    let mut expired = 0;
    for pending in state.pending_actions.iter_mut() {
        if pending.is_pending() && pending.expires_at < now {
            pending.status = ActionStatus::Expired;
            expired += 1;
        }
    }
    expired
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_table_is_fixed() {
        assert_eq!(classify(ActionKind::AutoTag), RiskLevel::Low);
        assert_eq!(classify(ActionKind::CreateGapStubs), RiskLevel::Low);
        assert_eq!(classify(ActionKind::SuggestSchema), RiskLevel::Low);
        assert_eq!(classify(ActionKind::MergeDuplicates), RiskLevel::Medium);
        assert_eq!(classify(ActionKind::PromoteToType), RiskLevel::Medium);
        assert_eq!(classify(ActionKind::ArchiveStale), RiskLevel::High);
        assert_eq!(classify(ActionKind::ResolveContradictions), RiskLevel::High);
    }

    #[test]
    fn default_auto_approval_is_low_only() {
        let approvals = ApprovalConfig::default();
        assert!(auto_approved(RiskLevel::Low, &approvals));
        assert!(!auto_approved(RiskLevel::Medium, &approvals));
        assert!(!auto_approved(RiskLevel::High, &approvals));
    }

    fn entry(id: &str, type_name: Option<&str>) -> ContextEntry {
        let now = chrono::Utc::now().to_rfc3339();
        ContextEntry {
            id: id.into(),
            content: "some note about deployment".into(),
            tags: vec!["infra".into()],
            source: "test".into(),
            bubble_id: None,
            type_name: type_name.map(str::to_string),
            structured_data: None,
            created_at: now.clone(),
            updated_at: now,
            archived: false,
        }
    }

    #[test]
    fn entry_scoped_protection_matches_id_and_kind() {
        let mut state = AwarenessState::default();
        state.protections.push(Protection {
            entry_id: Some("ctx-1".into()),
            pattern: None,
            scope: None,
            actions: vec![ActionKind::ArchiveStale],
            reason: "test".into(),
            created_at: chrono::Utc::now().to_rfc3339(),
        });

        assert!(is_protected(&state, &entry("ctx-1", None), ActionKind::ArchiveStale));
        assert!(!is_protected(&state, &entry("ctx-1", None), ActionKind::AutoTag));
        assert!(!is_protected(&state, &entry("ctx-2", None), ActionKind::ArchiveStale));
    }

    #[test]
    fn scope_protection_matches_type_name() {
        let mut state = AwarenessState::default();
        let mut scope = BTreeMap::new();
        scope.insert("typeName".to_string(), "preference".to_string());
        state.protections.push(Protection {
            entry_id: None,
            pattern: Some("preference".into()),
            scope: Some(scope),
            actions: vec![ActionKind::MergeDuplicates],
            reason: "test".into(),
            created_at: chrono::Utc::now().to_rfc3339(),
        });

        assert!(is_protected(
            &state,
            &entry("ctx-1", Some("preference")),
            ActionKind::MergeDuplicates
        ));
        assert!(!is_protected(
            &state,
            &entry("ctx-2", Some("decision")),
            ActionKind::MergeDuplicates
        ));
    }

    #[test]
    fn pattern_protection_matches_content_substring() {
        let mut state = AwarenessState::default();
        state.protections.push(Protection {
            entry_id: None,
            pattern: Some("deployment".into()),
            scope: None,
            actions: vec![ActionKind::AutoTag, ActionKind::CreateGapStubs],
            reason: "test".into(),
            created_at: chrono::Utc::now().to_rfc3339(),
        });

        assert!(is_protected(&state, &entry("ctx-1", None), ActionKind::AutoTag));
        assert!(is_query_protected(&state, "deployment pipeline", ActionKind::CreateGapStubs));
        assert!(!is_query_protected(&state, "staging", ActionKind::CreateGapStubs));
    }

    #[test]
    fn overlap_rules() {
        let a = ImprovementAction::ArchiveStale {
            entry_ids: vec!["ctx-1".into(), "ctx-2".into()],
        };
        let b = ImprovementAction::ArchiveStale {
            entry_ids: vec!["ctx-2".into()],
        };
        let c = ImprovementAction::ArchiveStale {
            entry_ids: vec!["ctx-3".into()],
        };
        assert!(overlaps(&a, &b));
        assert!(!overlaps(&a, &c));

        let s1 = ImprovementAction::SuggestSchema {
            suggestions: vec![],
            untyped_count: 0,
        };
        let s2 = ImprovementAction::SuggestSchema {
            suggestions: vec![],
            untyped_count: 0,
        };
        assert!(overlaps(&s1, &s2));
    }

    #[test]
    fn preview_shapes_are_kind_specific() {
        let merge = ImprovementAction::MergeDuplicates {
            survivor_id: "ctx-new".into(),
            duplicate_id: "ctx-old".into(),
        };
        let p = preview(&merge);
        assert_eq!(p["survivorId"], "ctx-new");
        assert_eq!(p["archivedId"], "ctx-old");

        let resolve = ImprovementAction::ResolveContradictions {
            keep_id: "ctx-a".into(),
            archive_id: "ctx-b".into(),
            explanation: "opposite stances".into(),
        };
        let p = preview(&resolve);
        assert_eq!(p["keepId"], "ctx-a");
        assert_eq!(p["explanation"], "opposite stances");
    }

    #[test]
    fn expire_flips_only_overdue_pending() {
        let mut state = AwarenessState::default();
        let mut overdue = build_pending(
            ImprovementAction::AutoTag {
                entry_ids: vec!["ctx-1".into()],
            },
            RiskLevel::Low,
            Duration::from_secs(0),
        );
        overdue.expires_at = "2020-01-01T00:00:00+00:00".into();
        let fresh = build_pending(
            ImprovementAction::AutoTag {
                entry_ids: vec!["ctx-2".into()],
            },
            RiskLevel::Low,
            Duration::from_secs(3600),
        );
        let mut dismissed = build_pending(
            ImprovementAction::AutoTag {
                entry_ids: vec!["ctx-3".into()],
            },
            RiskLevel::Low,
            Duration::from_secs(0),
        );
        dismissed.status = ActionStatus::Dismissed;
        dismissed.expires_at = "2020-01-01T00:00:00+00:00".into();

        state.pending_actions = vec![overdue, fresh, dismissed];
        let expired = expire(&mut state, chrono::Utc::now().to_rfc3339());
        assert_eq!(expired, 1);
        assert_eq!(state.pending_actions[0].status, ActionStatus::Expired);
        assert_eq!(state.pending_actions[1].status, ActionStatus::Pending);
        assert_eq!(state.pending_actions[2].status, ActionStatus::Dismissed);
    }
}
