//! The self-improvement loop.
//!
//! [`tick`] runs four phases — observe, decide, route, record — inside a
//! wall-clock budget, catching every error so the loop survives to the next
//! interval. Candidate actions consult the protection list, route through
//! the control plane's risk gate, and land either as executed improvements
//! (journaled) or as pending actions awaiting approval.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use crate::analyzer::{AnalysisSource, Analyzer, SchemaSuggestion};
use crate::config::ApprovalConfig;
use crate::control;
use crate::model;
use crate::observer::{ActionCount, AwarenessState, EventKind, ImprovementRecord, Observer, UsageSummary};
use crate::schema::SchemaCatalog;
use crate::store::types::ContextEntry;
use crate::store::{ContextStore, EntryPatch};

/// Word-set similarity above which two same-type entries count as duplicates.
const DUPLICATE_JACCARD: f64 = 0.8;
/// Entries untouched for this long with zero observed reads are stale enough
/// to archive.
const ARCHIVE_AFTER_DAYS: i64 = 180;
/// Contradicting entries whose update times differ by more than this get a
/// resolution proposal (archive the older).
const RESOLVE_AGE_GAP_DAYS: i64 = 180;
/// Minimum untagged entries before an auto-tag pass is worth proposing.
const AUTO_TAG_FLOOR: usize = 3;
/// Minimum untyped entries before schema suggestion is worth proposing.
const SUGGEST_SCHEMA_FLOOR: usize = 5;
/// Keywords an entry must share with a type description to be promoted.
const PROMOTE_SHARED_KEYWORDS: usize = 2;
/// Tags extracted per entry by auto-tag.
const AUTO_TAG_LIMIT: usize = 3;

/// The seven improvement action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    AutoTag,
    MergeDuplicates,
    PromoteToType,
    ArchiveStale,
    CreateGapStubs,
    ResolveContradictions,
    SuggestSchema,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoTag => "auto_tag",
            Self::MergeDuplicates => "merge_duplicates",
            Self::PromoteToType => "promote_to_type",
            Self::ArchiveStale => "archive_stale",
            Self::CreateGapStubs => "create_gap_stubs",
            Self::ResolveContradictions => "resolve_contradictions",
            Self::SuggestSchema => "suggest_schema",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_tag" => Ok(Self::AutoTag),
            "merge_duplicates" => Ok(Self::MergeDuplicates),
            "promote_to_type" => Ok(Self::PromoteToType),
            "archive_stale" => Ok(Self::ArchiveStale),
            "create_gap_stubs" => Ok(Self::CreateGapStubs),
            "resolve_contradictions" => Ok(Self::ResolveContradictions),
            "suggest_schema" => Ok(Self::SuggestSchema),
            _ => Err(format!("unknown action kind: {s}")),
        }
    }
}

/// A repeatedly missed query that deserves a stub entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapStub {
    pub query: String,
    pub misses: u32,
}

/// A concrete improvement, ready to execute. Serialized into pending
/// actions, so the shape is part of the awareness file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImprovementAction {
    #[serde(rename_all = "camelCase")]
    AutoTag { entry_ids: Vec<String> },
    #[serde(rename_all = "camelCase")]
    MergeDuplicates {
        survivor_id: String,
        duplicate_id: String,
    },
    #[serde(rename_all = "camelCase")]
    PromoteToType {
        entry_id: String,
        type_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ArchiveStale { entry_ids: Vec<String> },
    CreateGapStubs { stubs: Vec<GapStub> },
    #[serde(rename_all = "camelCase")]
    ResolveContradictions {
        keep_id: String,
        archive_id: String,
        explanation: String,
    },
    #[serde(rename_all = "camelCase")]
    SuggestSchema {
        suggestions: Vec<SchemaSuggestion>,
        /// Untyped-entry count at decision time; lets the next tick skip
        /// re-analysis when nothing changed.
        #[serde(default)]
        untyped_count: usize,
    },
}

impl ImprovementAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::AutoTag { .. } => ActionKind::AutoTag,
            Self::MergeDuplicates { .. } => ActionKind::MergeDuplicates,
            Self::PromoteToType { .. } => ActionKind::PromoteToType,
            Self::ArchiveStale { .. } => ActionKind::ArchiveStale,
            Self::CreateGapStubs { .. } => ActionKind::CreateGapStubs,
            Self::ResolveContradictions { .. } => ActionKind::ResolveContradictions,
            Self::SuggestSchema { .. } => ActionKind::SuggestSchema,
        }
    }

    /// The entries this action would touch.
    pub fn target_ids(&self) -> Vec<&str> {
        match self {
            Self::AutoTag { entry_ids } | Self::ArchiveStale { entry_ids } => {
                entry_ids.iter().map(String::as_str).collect()
            }
            Self::MergeDuplicates {
                survivor_id,
                duplicate_id,
            } => vec![survivor_id, duplicate_id],
            Self::PromoteToType { entry_id, .. } => vec![entry_id],
            Self::ResolveContradictions {
                keep_id,
                archive_id,
                ..
            } => vec![keep_id, archive_id],
            Self::CreateGapStubs { .. } | Self::SuggestSchema { .. } => vec![],
        }
    }
}

/// What one tick did.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickOutcome {
    pub executed: Vec<ActionCount>,
    pub queued: usize,
    pub expired: usize,
    pub skipped_protected: usize,
    pub budget_exhausted: bool,
    pub errors: Vec<String>,
}

/// Everything a tick needs; the analyzer is optional and the catalog may be
/// absent.
pub struct TickContext<'a> {
    pub store: &'a ContextStore,
    pub catalog: Option<&'a SchemaCatalog>,
    pub observer: &'a Observer,
    pub analyzer: Option<&'a Analyzer>,
    pub approvals: &'a ApprovalConfig,
    pub pending_ttl: Duration,
    pub budget: Duration,
}

/// Run one self-improvement tick. Never returns an error: failures are
/// collected into the outcome and logged so the loop survives.
pub async fn tick(ctx: TickContext<'_>) -> TickOutcome {
    let started = Instant::now();
    let mut outcome = TickOutcome::default();

    // ── Phase 1: observe ──
    let state = match ctx.observer.with_state(|state| {
        state.rotate();
        outcome.expired = control::expire(state, chrono::Utc::now().to_rfc3339());
        state.clone()
    }) {
        Ok(state) => state,
        Err(err) => {
            tracing::warn!(%err, "tick could not load awareness state");
            outcome.errors.push(err.to_string());
            return outcome;
        }
    };

    let (entries, _bubbles) = match ctx.store.snapshot() {
        Ok(snapshot) => snapshot,
        Err(err) => {
            tracing::warn!(%err, "tick could not snapshot the store");
            outcome.errors.push(err.to_string());
            return outcome;
        }
    };

    // ── Phase 2: decide ──
    let mut candidates = deterministic_candidates(&entries, ctx.catalog, &state, &mut outcome);

    // Analyzer-dependent candidates only while the budget holds; phases 1–2
    // must complete regardless, so the cutoff sits here.
    if started.elapsed() < ctx.budget {
        if let Some(analyzer) = ctx.analyzer {
            candidates.extend(
                analyzer_candidates(analyzer, &entries, &state, &mut outcome).await,
            );
        }
    } else {
        outcome.budget_exhausted = true;
    }

    // ── Phase 3: route ── and ── Phase 4: record ──
    for action in candidates {
        if started.elapsed() >= ctx.budget {
            outcome.budget_exhausted = true;
            tracing::warn!("tick budget exhausted, deferring remaining candidates");
            break;
        }
        let risk = control::classify(action.kind());
        if control::auto_approved(risk, ctx.approvals) {
            match execute_action(ctx.store, ctx.observer, &action) {
                Ok(count) => {
                    let record = ImprovementRecord {
                        timestamp: chrono::Utc::now().to_rfc3339(),
                        actions: vec![ActionCount {
                            kind: action.kind(),
                            count,
                        }],
                        auto_executed: true,
                    };
                    if let Err(err) = ctx.observer.add_improvement(record) {
                        outcome.errors.push(err.to_string());
                    }
                    outcome.executed.push(ActionCount {
                        kind: action.kind(),
                        count,
                    });
                }
                Err(err) => {
                    tracing::warn!(kind = %action.kind(), %err, "action execution failed");
                    outcome.errors.push(format!("{}: {err}", action.kind()));
                }
            }
        } else {
            match control::enqueue(ctx.observer, action, risk, ctx.pending_ttl) {
                Ok(Some(_)) => outcome.queued += 1,
                Ok(None) => {} // de-duplicated against an existing pending action
                Err(err) => outcome.errors.push(err.to_string()),
            }
        }
    }

    tracing::info!(
        executed = outcome.executed.len(),
        queued = outcome.queued,
        expired = outcome.expired,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "tick complete"
    );
    outcome
}

// ── Candidate generation ─────────────────────────────────────────────────────

fn deterministic_candidates(
    entries: &[ContextEntry],
    catalog: Option<&SchemaCatalog>,
    state: &AwarenessState,
    outcome: &mut TickOutcome,
) -> Vec<ImprovementAction> {
    let active: Vec<&ContextEntry> = entries.iter().filter(|e| !e.archived).collect();
    let mut candidates = Vec::new();

    // auto_tag: enough entries with an empty tag set (and content that
    // actually yields tags, so a tick over the same store proposes nothing)
    let untagged: Vec<&&ContextEntry> = active
        .iter()
        .filter(|e| e.tags.is_empty() && !extract_tags(&e.content).is_empty())
        .collect();
    if untagged.len() >= AUTO_TAG_FLOOR {
        let ids = unprotected_ids(&untagged, state, ActionKind::AutoTag, outcome);
        if !ids.is_empty() {
            candidates.push(ImprovementAction::AutoTag { entry_ids: ids });
        }
    }

    // merge_duplicates: same-type pairs above the Jaccard threshold
    let mut paired: BTreeSet<&str> = BTreeSet::new();
    for (i, first) in active.iter().enumerate() {
        if first.type_name.is_none() || paired.contains(first.id.as_str()) {
            continue;
        }
        for second in &active[i + 1..] {
            if second.type_name != first.type_name || paired.contains(second.id.as_str()) {
                continue;
            }
            if jaccard(&first.content, &second.content) <= DUPLICATE_JACCARD {
                continue;
            }
            if control::is_protected(state, first, ActionKind::MergeDuplicates)
                || control::is_protected(state, second, ActionKind::MergeDuplicates)
            {
                outcome.skipped_protected += 1;
                continue;
            }
            // the newer entry survives
            let (survivor, duplicate) = if first.updated_at >= second.updated_at {
                (first, second)
            } else {
                (second, first)
            };
            candidates.push(ImprovementAction::MergeDuplicates {
                survivor_id: survivor.id.clone(),
                duplicate_id: duplicate.id.clone(),
            });
            paired.insert(first.id.as_str());
            paired.insert(second.id.as_str());
            break;
        }
    }

    // promote_to_type: untyped entries that echo a type's description
    if let Some(catalog) = catalog {
        for entry in active.iter().filter(|e| e.type_name.is_none()) {
            let content_words = keyword_set(&entry.content);
            // first match wins; catalog order is the (arbitrary) tie-break
            let suggested = catalog.types.iter().find(|t| {
                keyword_set(&t.description)
                    .intersection(&content_words)
                    .count()
                    >= PROMOTE_SHARED_KEYWORDS
            });
            if let Some(schema_type) = suggested {
                if control::is_protected(state, entry, ActionKind::PromoteToType) {
                    outcome.skipped_protected += 1;
                    continue;
                }
                candidates.push(ImprovementAction::PromoteToType {
                    entry_id: entry.id.clone(),
                    type_name: schema_type.name.clone(),
                });
            }
        }
    }

    // archive_stale: old entries nothing ever read
    let read_ids: BTreeSet<&str> = state
        .events
        .iter()
        .filter(|e| e.kind == EventKind::Read)
        .flat_map(|e| e.entry_ids.iter().map(String::as_str))
        .collect();
    let now = chrono::Utc::now();
    let stale: Vec<&&ContextEntry> = active
        .iter()
        .filter(|e| age_days(&e.updated_at, now) > ARCHIVE_AFTER_DAYS)
        .filter(|e| !read_ids.contains(e.id.as_str()))
        .collect();
    if !stale.is_empty() {
        let ids = unprotected_ids(&stale, state, ActionKind::ArchiveStale, outcome);
        if !ids.is_empty() {
            candidates.push(ImprovementAction::ArchiveStale { entry_ids: ids });
        }
    }

    // create_gap_stubs: repeatedly missed queries without an existing stub
    let summary = UsageSummary::from_events(&state.events);
    let stubs: Vec<GapStub> = summary
        .missed_queries
        .iter()
        .filter(|(_, n)| **n >= model::MISS_GAP_THRESHOLD)
        .filter(|(query, _)| !has_gap_stub(entries, query))
        .filter(|(query, _)| {
            let blocked = control::is_query_protected(state, query, ActionKind::CreateGapStubs);
            if blocked {
                outcome.skipped_protected += 1;
            }
            !blocked
        })
        .map(|(query, misses)| GapStub {
            query: query.clone(),
            misses: *misses,
        })
        .collect();
    if !stubs.is_empty() {
        candidates.push(ImprovementAction::CreateGapStubs { stubs });
    }

    candidates
}

async fn analyzer_candidates(
    analyzer: &Analyzer,
    entries: &[ContextEntry],
    state: &AwarenessState,
    outcome: &mut TickOutcome,
) -> Vec<ImprovementAction> {
    let mut candidates = Vec::new();
    let active: Vec<&ContextEntry> = entries.iter().filter(|e| !e.archived).collect();

    // resolve_contradictions: only LM-verified contradictions may archive; the
    // opposition heuristic is display-only.
    let (source, contradictions) = analyzer.detect_contradictions(entries).await;
    if source == AnalysisSource::Lm {
        for contradiction in contradictions {
            let first = active.iter().find(|e| e.id == contradiction.first_id);
            let second = active.iter().find(|e| e.id == contradiction.second_id);
            let (Some(first), Some(second)) = (first, second) else {
                continue;
            };
            let gap = (age_days(&first.updated_at, chrono::Utc::now())
                - age_days(&second.updated_at, chrono::Utc::now()))
            .abs();
            if gap <= RESOLVE_AGE_GAP_DAYS {
                continue;
            }
            let (keep, archive) = if first.updated_at >= second.updated_at {
                (first, second)
            } else {
                (second, first)
            };
            if control::is_protected(state, keep, ActionKind::ResolveContradictions)
                || control::is_protected(state, archive, ActionKind::ResolveContradictions)
            {
                outcome.skipped_protected += 1;
                continue;
            }
            candidates.push(ImprovementAction::ResolveContradictions {
                keep_id: keep.id.clone(),
                archive_id: archive.id.clone(),
                explanation: contradiction.explanation,
            });
        }
    }

    // suggest_schema: enough untyped entries to see a shape in them; skip if
    // the recorded analysis already covered the same untyped set
    let untyped: Vec<ContextEntry> = active
        .iter()
        .filter(|e| e.type_name.is_none())
        .map(|e| (*e).clone())
        .collect();
    let already_analyzed = state
        .schema_cache
        .as_ref()
        .and_then(|cache| cache.get("untypedCount"))
        .and_then(|count| count.as_u64())
        == Some(untyped.len() as u64);
    if untyped.len() >= SUGGEST_SCHEMA_FLOOR && !already_analyzed {
        let (_, suggestions) = analyzer.suggest_types(&untyped).await;
        if !suggestions.is_empty() {
            candidates.push(ImprovementAction::SuggestSchema {
                suggestions,
                untyped_count: untyped.len(),
            });
        }
    }

    candidates
}

fn unprotected_ids(
    entries: &[&&ContextEntry],
    state: &AwarenessState,
    kind: ActionKind,
    outcome: &mut TickOutcome,
) -> Vec<String> {
    entries
        .iter()
        .filter(|e| {
            let blocked = control::is_protected(state, e, kind);
            if blocked {
                outcome.skipped_protected += 1;
            }
            !blocked
        })
        .map(|e| e.id.clone())
        .collect()
}

/// A stub for this query already exists if any entry carries the `gap` tag
/// and quotes the query.
fn has_gap_stub(entries: &[ContextEntry], query: &str) -> bool {
    let quoted = format!("\"{query}\"");
    entries
        .iter()
        .any(|e| e.has_tag("gap") && e.content.contains(&quoted))
}

// ── Action execution ─────────────────────────────────────────────────────────

/// Execute one improvement action against the store. Returns the number of
/// entries (or suggestions) affected. Shared with the control plane's
/// approve path.
pub fn execute_action(
    store: &ContextStore,
    observer: &Observer,
    action: &ImprovementAction,
) -> Result<usize> {
    match action {
        ImprovementAction::AutoTag { entry_ids } => {
            let mut touched = 0;
            for id in entry_ids {
                let Some(entry) = store.get(id)? else { continue };
                let tags = extract_tags(&entry.content);
                if !tags.is_empty() {
                    store.add_tags(id, &tags)?;
                    touched += 1;
                }
            }
            Ok(touched)
        }
        ImprovementAction::MergeDuplicates {
            survivor_id,
            duplicate_id,
        } => {
            let survivor = store
                .get(survivor_id)?
                .ok_or_else(|| anyhow!("merge survivor not found: {survivor_id}"))?;
            let duplicate = store
                .get(duplicate_id)?
                .ok_or_else(|| anyhow!("merge duplicate not found: {duplicate_id}"))?;

            let mut content = survivor.content.clone();
            if differs_nontrivially(&survivor.content, &duplicate.content) {
                content = format!("{}\n\n{}", survivor.content, duplicate.content);
            }
            let mut tags = survivor.tags.clone();
            for tag in &duplicate.tags {
                if !tags.contains(tag) {
                    tags.push(tag.clone());
                }
            }
            store.update(
                survivor_id,
                EntryPatch {
                    content: Some(content),
                    tags: Some(tags),
                    ..Default::default()
                },
            )?;
            store.set_archived(duplicate_id, true)?;
            Ok(1)
        }
        ImprovementAction::PromoteToType {
            entry_id,
            type_name,
        } => {
            store
                .set_type(entry_id, Some(type_name))?
                .ok_or_else(|| anyhow!("promotion target not found: {entry_id}"))?;
            Ok(1)
        }
        ImprovementAction::ArchiveStale { entry_ids } => {
            let mut archived = 0;
            for id in entry_ids {
                if store.set_archived(id, true)?.is_some() {
                    archived += 1;
                }
            }
            Ok(archived)
        }
        ImprovementAction::CreateGapStubs { stubs } => {
            for stub in stubs {
                store.save_entry(
                    &format!(
                        "[GAP] Agents have searched for \"{}\" {} times but no context exists.",
                        stub.query, stub.misses
                    ),
                    vec!["gap".into(), "needs-input".into()],
                    "self-improvement",
                    None,
                )?;
            }
            Ok(stubs.len())
        }
        ImprovementAction::ResolveContradictions { archive_id, .. } => {
            store
                .set_archived(archive_id, true)?
                .ok_or_else(|| anyhow!("resolution target not found: {archive_id}"))?;
            Ok(1)
        }
        ImprovementAction::SuggestSchema {
            suggestions,
            untyped_count,
        } => {
            // recorded for the user; the catalog file itself is never touched
            let count = suggestions.len();
            let suggestions = suggestions.clone();
            let untyped_count = *untyped_count;
            observer.with_state(move |state| {
                state.schema_cache = Some(serde_json::json!({
                    "lastAnalysis": chrono::Utc::now().to_rfc3339(),
                    "suggestedTypes": suggestions,
                    "untypedCount": untyped_count,
                }));
            })?;
            Ok(count)
        }
    }
}

// ── Heuristics ───────────────────────────────────────────────────────────────

const STOPWORDS: &[&str] = &[
    "this", "that", "with", "from", "have", "will", "been", "were", "they",
    "them", "than", "then", "when", "what", "where", "which", "should",
    "would", "could", "about", "into", "over", "only", "just", "also",
    "very", "much", "more", "most", "some", "each", "here", "there", "does",
    "don't", "doesn't", "always", "never", "their", "your", "ours",
];

/// Lowercased alphabetic tokens of four or more characters, stopwords out.
fn keyword_set(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 4)
        .filter(|t| t.chars().all(char::is_alphabetic))
        .filter(|t| !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// Up to three keyword tags, in first-appearance order.
pub fn extract_tags(content: &str) -> Vec<String> {
    let keywords = keyword_set(content);
    let mut tags = Vec::new();
    for token in content
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
    {
        if keywords.contains(token) && !tags.iter().any(|t: &String| t.as_str() == token) {
            tags.push(token.to_string());
            if tags.len() == AUTO_TAG_LIMIT {
                break;
            }
        }
    }
    tags
}

/// Word-set Jaccard similarity.
fn jaccard(a: &str, b: &str) -> f64 {
    let set_a: BTreeSet<String> = tokens(a);
    let set_b: BTreeSet<String> = tokens(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Contents differ non-trivially unless equal or one contains the other.
fn differs_nontrivially(a: &str, b: &str) -> bool {
    let a = a.trim();
    let b = b.trim();
    !(a == b || a.contains(b) || b.contains(a))
}

fn age_days(timestamp: &str, now: chrono::DateTime<chrono::Utc>) -> i64 {
    chrono::DateTime::parse_from_rfc3339(timestamp)
        .map(|t| (now - t.with_timezone(&chrono::Utc)).num_days())
        .unwrap_or(0)
}
