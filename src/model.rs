//! The self-model — a deterministic snapshot of store health.
//!
//! [`build`] computes identity, coverage, freshness, gaps, contradictions,
//! and an overall health verdict from the store contents, the catalog, and
//! the awareness blob. It is pure and fast (well under 100 ms at 1000
//! entries); the analyzer-enriched "deep" variant swaps in LM-verified
//! contradictions but reuses everything else.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::observer::{AwarenessState, ImprovementRecord, UsageSummary};
use crate::schema::SchemaCatalog;
use crate::store::types::{Bubble, ContextEntry};

/// Entries updated within this many days count as fresh.
pub const RECENT_DAYS: i64 = 7;
/// Entries not updated for this many days count as stale.
pub const STALE_DAYS: i64 = 90;
/// A query missed this many times becomes a gap.
pub const MISS_GAP_THRESHOLD: u32 = 3;
/// Fewer active entries than this and the store is simply sparse.
const SPARSE_FLOOR: usize = 5;
/// Average of coverage and freshness at or above this is healthy.
const HEALTHY_SCORE: f64 = 0.7;
/// How many of the stalest entries the model lists.
const STALEST_LIMIT: usize = 5;

/// Word pairs treated as opposing stances when they appear across two
/// entries of the same type. Intentionally crude; display-only.
const OPPOSITIONS: &[(&str, &str)] = &[
    ("prefer", "avoid"),
    ("use", "don't use"),
    ("always", "never"),
    ("composition", "inheritance"),
    ("class", "functional"),
    ("stateful", "stateless"),
    ("monolith", "microservice"),
];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub active_entries: usize,
    pub archived_entries: usize,
    pub by_type: BTreeMap<String, usize>,
    pub bubbles: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_entry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_entry: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Coverage {
    pub covered_types: Vec<String>,
    pub empty_types: Vec<String>,
    pub untyped_entries: usize,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleEntry {
    pub id: String,
    pub preview: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Freshness {
    pub recently_updated: usize,
    pub stale: usize,
    pub stalest: Vec<StaleEntry>,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
}

impl Severity {
    /// ASCII-art marker used in the rendered model.
    pub fn marker(&self) -> &'static str {
        match self {
            Self::Warning => "⚠",
            Self::Info => "ℹ",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Gap {
    pub description: String,
    pub severity: Severity,
    pub suggestion: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Contradiction {
    pub first_id: String,
    pub second_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub explanation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Health {
    #[serde(rename = "sparse")]
    Sparse,
    #[serde(rename = "healthy")]
    Healthy,
    #[serde(rename = "needs-attention")]
    NeedsAttention,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sparse => "sparse",
            Self::Healthy => "healthy",
            Self::NeedsAttention => "needs-attention",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfModel {
    pub generated_at: String,
    pub identity: Identity,
    pub coverage: Coverage,
    pub freshness: Freshness,
    pub gaps: Vec<Gap>,
    pub contradictions: Vec<Contradiction>,
    pub health: Health,
    pub coverage_score: f64,
    pub freshness_score: f64,
    pub recent_improvements: Vec<ImprovementRecord>,
    pub pending_actions: usize,
}

/// Compute the deterministic self-model.
pub fn build(
    entries: &[ContextEntry],
    bubbles: &[Bubble],
    catalog: Option<&SchemaCatalog>,
    awareness: Option<&AwarenessState>,
) -> SelfModel {
    let now = chrono::Utc::now();
    let active: Vec<&ContextEntry> = entries.iter().filter(|e| !e.archived).collect();

    // ── Identity ──
    let mut by_type = BTreeMap::new();
    for entry in &active {
        if let Some(t) = &entry.type_name {
            *by_type.entry(t.clone()).or_insert(0) += 1;
        }
    }
    let identity = Identity {
        active_entries: active.len(),
        archived_entries: entries.len() - active.len(),
        by_type: by_type.clone(),
        bubbles: bubbles.len(),
        oldest_entry: active.iter().map(|e| e.created_at.clone()).min(),
        newest_entry: active.iter().map(|e| e.created_at.clone()).max(),
    };

    // ── Coverage ──
    let (covered, empty): (Vec<String>, Vec<String>) = match catalog {
        Some(catalog) => catalog
            .types
            .iter()
            .map(|t| t.name.clone())
            .partition(|name| by_type.contains_key(name)),
        None => (Vec::new(), Vec::new()),
    };
    let total_types = covered.len() + empty.len();
    let coverage_score = if total_types == 0 {
        1.0
    } else {
        covered.len() as f64 / total_types as f64
    };
    let untyped = active.iter().filter(|e| e.type_name.is_none()).count();
    let coverage = Coverage {
        covered_types: covered,
        empty_types: empty.clone(),
        untyped_entries: untyped,
        score: coverage_score,
    };

    // ── Freshness ──
    let recently_updated = active
        .iter()
        .filter(|e| age_days(&e.updated_at, now).is_some_and(|d| d <= RECENT_DAYS))
        .count();
    let mut stale: Vec<&&ContextEntry> = active
        .iter()
        .filter(|e| age_days(&e.updated_at, now).is_some_and(|d| d > STALE_DAYS))
        .collect();
    stale.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
    let freshness_score = if active.is_empty() {
        1.0
    } else {
        recently_updated as f64 / active.len() as f64
    };
    let freshness = Freshness {
        recently_updated,
        stale: stale.len(),
        stalest: stale
            .iter()
            .take(STALEST_LIMIT)
            .map(|e| StaleEntry {
                id: e.id.clone(),
                preview: e.preview(),
                updated_at: e.updated_at.clone(),
            })
            .collect(),
        score: freshness_score,
    };

    // ── Gaps ──
    let mut gaps = Vec::new();
    for type_name in &empty {
        gaps.push(Gap {
            description: format!("No entries for type \"{type_name}\""),
            severity: Severity::Warning,
            suggestion: format!("Save context of type \"{type_name}\" or drop it from the schema"),
        });
    }
    if let Some(state) = awareness {
        let summary = UsageSummary::from_events(&state.events);
        let mut missed: Vec<(&String, &u32)> = summary
            .missed_queries
            .iter()
            .filter(|(_, n)| **n >= MISS_GAP_THRESHOLD)
            .collect();
        missed.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (query, count) in missed {
            gaps.push(Gap {
                description: format!(
                    "Agents searched for \"{query}\" {count} times with no results"
                ),
                severity: Severity::Warning,
                suggestion: format!("Add context covering \"{query}\""),
            });
        }
    }
    if !stale.is_empty() {
        gaps.push(Gap {
            description: format!(
                "{} entries have not been updated in over {STALE_DAYS} days",
                stale.len()
            ),
            severity: Severity::Info,
            suggestion: "Review the stalest entries and refresh or archive them".into(),
        });
    }

    // ── Contradictions ──
    let contradictions = opposition_contradictions(entries);

    // ── Health ──
    let health = if active.len() < SPARSE_FLOOR {
        Health::Sparse
    } else if (coverage_score + freshness_score) / 2.0 >= HEALTHY_SCORE {
        Health::Healthy
    } else {
        Health::NeedsAttention
    };

    // ── Recent improvements & pending count ──
    let (recent_improvements, pending_actions) = match awareness {
        Some(state) => {
            let start = state.improvements.len().saturating_sub(5);
            (
                state.improvements[start..].to_vec(),
                state
                    .pending_actions
                    .iter()
                    .filter(|p| p.is_pending())
                    .count(),
            )
        }
        None => (Vec::new(), 0),
    };

    SelfModel {
        generated_at: now.to_rfc3339(),
        identity,
        coverage,
        freshness,
        gaps,
        contradictions,
        health,
        coverage_score,
        freshness_score,
        recent_improvements,
        pending_actions,
    }
}

/// Deterministic contradiction scan: pairwise within each type bucket,
/// flagging pairs whose contents land on opposite sides of a fixed
/// opposition list. Archived entries are excluded. May flag entries that
/// merely discuss an opposition; nothing auto-resolves from this path.
///
/// Each entry's content is scanned once into a bitmask (two bits per
/// opposition), so the pairwise phase is cheap even at a thousand entries.
pub fn opposition_contradictions(entries: &[ContextEntry]) -> Vec<Contradiction> {
    let mut buckets: BTreeMap<&str, Vec<(&ContextEntry, u32)>> = BTreeMap::new();
    for entry in entries.iter().filter(|e| !e.archived) {
        if let Some(t) = &entry.type_name {
            buckets
                .entry(t.as_str())
                .or_default()
                .push((entry, stance_mask(&entry.content)));
        }
    }

    let mut found = Vec::new();
    for (type_name, bucket) in buckets {
        for (i, (first, first_mask)) in bucket.iter().enumerate() {
            for (second, second_mask) in &bucket[i + 1..] {
                if let Some((x, y)) = opposing_bits(*first_mask, *second_mask) {
                    found.push(Contradiction {
                        first_id: first.id.clone(),
                        second_id: second.id.clone(),
                        type_name: Some(type_name.to_string()),
                        explanation: format!(
                            "The entries take opposite stances (\"{x}\" vs \"{y}\")"
                        ),
                    });
                }
            }
        }
    }
    found
}

/// Which opposition sides the content mentions: bit `2i` for the left side
/// of opposition `i`, bit `2i + 1` for the right.
fn stance_mask(content: &str) -> u32 {
    let lowered = content.to_lowercase();
    let mut mask = 0u32;
    for (i, (x, y)) in OPPOSITIONS.iter().enumerate() {
        if lowered.contains(x) {
            mask |= 1 << (2 * i);
        }
        if lowered.contains(y) {
            mask |= 1 << (2 * i + 1);
        }
    }
    mask
}

fn opposing_bits(a: u32, b: u32) -> Option<(&'static str, &'static str)> {
    for (i, (x, y)) in OPPOSITIONS.iter().enumerate() {
        let left = 1 << (2 * i);
        let right = 1 << (2 * i + 1);
        if (a & left != 0 && b & right != 0) || (a & right != 0 && b & left != 0) {
            return Some((x, y));
        }
    }
    None
}

fn age_days(timestamp: &str, now: chrono::DateTime<chrono::Utc>) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(timestamp)
        .ok()
        .map(|t| (now - t.with_timezone(&chrono::Utc)).num_days())
}

impl SelfModel {
    /// Fixed human-readable rendering; this is what `introspect` returns.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("Self-model of the context store\n");
        out.push_str(&format!("Generated: {}\n\n", self.generated_at));

        out.push_str(&format!(
            "Identity: {} active entries ({} archived) across {} bubbles\n",
            self.identity.active_entries, self.identity.archived_entries, self.identity.bubbles
        ));
        if !self.identity.by_type.is_empty() {
            let breakdown: Vec<String> = self
                .identity
                .by_type
                .iter()
                .map(|(t, n)| format!("{t} ({n})"))
                .collect();
            out.push_str(&format!("  by type: {}\n", breakdown.join(", ")));
        }
        if let (Some(oldest), Some(newest)) =
            (&self.identity.oldest_entry, &self.identity.newest_entry)
        {
            out.push_str(&format!("  oldest {oldest}, newest {newest}\n"));
        }

        out.push_str(&format!(
            "\nHealth: {} (coverage {:.2}, freshness {:.2})\n",
            self.health.as_str(),
            self.coverage_score,
            self.freshness_score
        ));

        if !self.coverage.covered_types.is_empty() || !self.coverage.empty_types.is_empty() {
            out.push_str("\nCoverage\n");
            if !self.coverage.covered_types.is_empty() {
                out.push_str(&format!(
                    "  covered types: {}\n",
                    self.coverage.covered_types.join(", ")
                ));
            }
            if !self.coverage.empty_types.is_empty() {
                out.push_str(&format!(
                    "  empty types: {}\n",
                    self.coverage.empty_types.join(", ")
                ));
            }
        }
        if self.coverage.untyped_entries > 0 {
            out.push_str(&format!(
                "  {} untyped entries\n",
                self.coverage.untyped_entries
            ));
        }

        out.push_str(&format!(
            "\nFreshness: {} updated in the last {RECENT_DAYS} days, {} stale (>{STALE_DAYS} days)\n",
            self.freshness.recently_updated, self.freshness.stale
        ));
        for stale in &self.freshness.stalest {
            out.push_str(&format!(
                "  - {} \"{}\" (last updated {})\n",
                stale.id, stale.preview, stale.updated_at
            ));
        }

        if self.gaps.is_empty() {
            out.push_str("\nNo gaps detected.\n");
        } else {
            out.push_str("\nGaps\n");
            for gap in &self.gaps {
                out.push_str(&format!(
                    "  {} {} — {}\n",
                    gap.severity.marker(),
                    gap.description,
                    gap.suggestion
                ));
            }
        }

        if self.contradictions.is_empty() {
            out.push_str("\nNo contradictions detected.\n");
        } else {
            out.push_str("\nContradictions\n");
            for c in &self.contradictions {
                let type_note = c
                    .type_name
                    .as_deref()
                    .map(|t| format!(" [{t}]"))
                    .unwrap_or_default();
                out.push_str(&format!(
                    "  ⚠ {} vs {}{}: {}\n",
                    c.first_id, c.second_id, type_note, c.explanation
                ));
            }
        }

        if self.pending_actions > 0 {
            out.push_str(&format!(
                "\nPending actions: {} awaiting review\n",
                self.pending_actions
            ));
        }
        if !self.recent_improvements.is_empty() {
            out.push_str("\nRecent improvements\n");
            for record in &self.recent_improvements {
                let actions: Vec<String> = record
                    .actions
                    .iter()
                    .map(|a| format!("{} ×{}", a.kind.as_str(), a.count))
                    .collect();
                let mode = if record.auto_executed { "auto" } else { "approved" };
                out.push_str(&format!(
                    "  - {}: {} ({mode})\n",
                    record.timestamp,
                    actions.join(", ")
                ));
            }
        }

        out
    }
}

/// Per-process self-model cache: 60 s for the deterministic variant, a
/// configurable longer TTL for the analyzer-enriched deep variant. The tick
/// invalidates both on completion.
pub struct ModelCache {
    deterministic: Mutex<Option<(Instant, SelfModel)>>,
    deep: Mutex<Option<(Instant, SelfModel)>>,
    deterministic_ttl: Duration,
    deep_ttl: Duration,
}

impl ModelCache {
    pub fn new(deep_ttl: Duration) -> Self {
        Self {
            deterministic: Mutex::new(None),
            deep: Mutex::new(None),
            deterministic_ttl: Duration::from_secs(60),
            deep_ttl,
        }
    }

    pub fn get_deterministic(&self) -> Option<SelfModel> {
        Self::get(&self.deterministic, self.deterministic_ttl)
    }

    pub fn put_deterministic(&self, model: &SelfModel) {
        *self.deterministic.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((Instant::now(), model.clone()));
    }

    pub fn get_deep(&self) -> Option<SelfModel> {
        Self::get(&self.deep, self.deep_ttl)
    }

    pub fn put_deep(&self, model: &SelfModel) {
        *self.deep.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((Instant::now(), model.clone()));
    }

    pub fn invalidate(&self) {
        *self.deterministic.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.deep.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn get(slot: &Mutex<Option<(Instant, SelfModel)>>, ttl: Duration) -> Option<SelfModel> {
        let guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .as_ref()
            .filter(|(at, _)| at.elapsed() < ttl)
            .map(|(_, model)| model.clone())
    }
}
