//! Usage observation — the awareness file.
//!
//! Every store read, write, and miss lands here as an [`Event`]. The file
//! also carries the improvement journal, per-entry usefulness counters, and
//! the control plane's pending actions and protections, all in one JSON blob
//! rewritten atomically. Aggregates are recomputed from the raw event list
//! on each load rather than maintained incrementally, which keeps the format
//! robust when the file is edited by hand.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::control::{PendingAction, Protection};
use crate::improver::ActionKind;
use crate::store::write_json_atomic;

/// Log caps: beyond [`EVENT_CAP`] events the log is trimmed to the newest
/// [`EVENT_KEEP`]; aggregate contributions from trimmed events are lost.
pub const EVENT_CAP: usize = 1000;
pub const EVENT_KEEP: usize = 500;
pub const JOURNAL_CAP: usize = 200;
pub const JOURNAL_KEEP: usize = 100;

/// What an event records about a store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Read,
    Write,
    Miss,
    Delete,
}

/// One observed store operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub kind: EventKind,
    /// The tool or endpoint that drove the operation.
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub entry_ids: Vec<String>,
    pub at: String,
}

impl Event {
    pub fn write(tool: &str, type_name: Option<String>, entry_ids: Vec<String>) -> Self {
        Self {
            kind: EventKind::Write,
            tool: tool.to_string(),
            query: None,
            type_name,
            entry_ids,
            at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn read(tool: &str, type_name: Option<String>, entry_ids: Vec<String>) -> Self {
        Self {
            kind: EventKind::Read,
            tool: tool.to_string(),
            query: None,
            type_name,
            entry_ids,
            at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// A query-shaped read: a miss when no entries matched.
    pub fn query(tool: &str, query: &str, matched: &[crate::store::types::ContextEntry]) -> Self {
        Self {
            kind: if matched.is_empty() {
                EventKind::Miss
            } else {
                EventKind::Read
            },
            tool: tool.to_string(),
            query: Some(query.to_string()),
            type_name: None,
            entry_ids: matched.iter().map(|e| e.id.clone()).collect(),
            at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// One improvement journal record: what a tick (or an approval) executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImprovementRecord {
    pub timestamp: String,
    pub actions: Vec<ActionCount>,
    pub auto_executed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionCount {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub count: usize,
}

/// Per-entry helpful/unhelpful counters reported by agents. Collected for
/// future ranking signals; no current decision consumes them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usefulness {
    #[serde(default)]
    pub helpful: BTreeMap<String, u32>,
    #[serde(default)]
    pub unhelpful: BTreeMap<String, u32>,
}

/// The whole awareness blob as persisted. Every field defaults so older or
/// hand-edited files load cleanly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessState {
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub improvements: Vec<ImprovementRecord>,
    #[serde(default)]
    pub usefulness: Usefulness,
    #[serde(default)]
    pub pending_actions: Vec<PendingAction>,
    #[serde(default)]
    pub protections: Vec<Protection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_cache: Option<serde_json::Value>,
}

impl AwarenessState {
    /// Trim the event log and journal to their caps. Returns true if
    /// anything was dropped.
    pub fn rotate(&mut self) -> bool {
        let mut rotated = false;
        if self.events.len() > EVENT_CAP {
            self.events = self.events.split_off(self.events.len() - EVENT_KEEP);
            rotated = true;
        }
        if self.improvements.len() > JOURNAL_CAP {
            self.improvements = self
                .improvements
                .split_off(self.improvements.len() - JOURNAL_KEEP);
            rotated = true;
        }
        rotated
    }
}

/// Rolling aggregates recomputed from the event list.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub total_reads: u32,
    pub total_writes: u32,
    pub total_misses: u32,
    pub missed_queries: BTreeMap<String, u32>,
    pub reads_by_type: BTreeMap<String, u32>,
    pub writes_by_type: BTreeMap<String, u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
}

impl UsageSummary {
    pub fn from_events(events: &[Event]) -> Self {
        let mut summary = Self::default();
        for event in events {
            match event.kind {
                EventKind::Read => {
                    summary.total_reads += 1;
                    if let Some(t) = &event.type_name {
                        *summary.reads_by_type.entry(t.clone()).or_insert(0) += 1;
                    }
                }
                EventKind::Write => {
                    summary.total_writes += 1;
                    if let Some(t) = &event.type_name {
                        *summary.writes_by_type.entry(t.clone()).or_insert(0) += 1;
                    }
                }
                EventKind::Miss => {
                    summary.total_misses += 1;
                    // a miss without a query counts toward the total only
                    if let Some(q) = &event.query {
                        *summary.missed_queries.entry(q.clone()).or_insert(0) += 1;
                    }
                }
                EventKind::Delete => {
                    summary.total_writes += 1;
                }
            }
            summary.last_activity = Some(match summary.last_activity.take() {
                Some(prev) if prev.as_str() > event.at.as_str() => prev,
                _ => event.at.clone(),
            });
        }
        summary
    }
}

/// Handle on the awareness file. All access serializes through one mutex;
/// mutation is load-modify-save inside the critical section so stale writes
/// cannot happen.
#[derive(Debug)]
pub struct Observer {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Observer {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<AwarenessState> {
        if !self.path.exists() {
            return Ok(AwarenessState::default());
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read awareness file {}", self.path.display()))?;
        serde_json::from_str(&contents).with_context(|| {
            format!(
                "awareness file {} is corrupt; move it aside to start with empty aggregates",
                self.path.display()
            )
        })
    }

    /// Read-only snapshot of the whole blob.
    pub fn load_state(&self) -> Result<AwarenessState> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.load()
    }

    /// Load → mutate → save critical section. The control plane and improver
    /// route their pending/protection updates through this.
    pub fn with_state<T>(&self, f: impl FnOnce(&mut AwarenessState) -> T) -> Result<T> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = self.load()?;
        let out = f(&mut state);
        write_json_atomic(&self.path, &state)?;
        Ok(out)
    }

    /// Append one event, rotating if the log exceeds its cap.
    pub fn record(&self, event: Event) -> Result<()> {
        self.with_state(|state| {
            state.events.push(event);
            state.rotate();
        })
    }

    /// Recompute the running summary from the raw blob.
    pub fn summary(&self) -> Result<UsageSummary> {
        Ok(UsageSummary::from_events(&self.load_state()?.events))
    }

    /// Unique missed queries with at least `min_count` misses, most-missed
    /// first.
    pub fn missed_queries(&self, min_count: u32) -> Result<Vec<(String, u32)>> {
        let summary = self.summary()?;
        let mut missed: Vec<(String, u32)> = summary
            .missed_queries
            .into_iter()
            .filter(|(_, n)| *n >= min_count)
            .collect();
        missed.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(missed)
    }

    /// Append an improvement journal record, rotating past the journal cap.
    pub fn add_improvement(&self, record: ImprovementRecord) -> Result<()> {
        self.with_state(|state| {
            state.improvements.push(record);
            state.rotate();
        })
    }

    /// Journal records at or after the cutoff timestamp (ISO 8601).
    pub fn improvements_since(&self, cutoff: &str) -> Result<Vec<ImprovementRecord>> {
        Ok(self
            .load_state()?
            .improvements
            .into_iter()
            .filter(|r| r.timestamp.as_str() >= cutoff)
            .collect())
    }

    /// Bump an entry's helpful or unhelpful counter.
    pub fn record_usefulness(&self, entry_id: &str, helpful: bool) -> Result<u32> {
        self.with_state(|state| {
            let table = if helpful {
                &mut state.usefulness.helpful
            } else {
                &mut state.usefulness.unhelpful
            };
            let count = table.entry(entry_id.to_string()).or_insert(0);
            *count += 1;
            *count
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_observer() -> Observer {
        let dir = std::env::temp_dir().join(format!(
            "specula-obs-{}",
            uuid::Uuid::now_v7().simple()
        ));
        Observer::open(dir.join("awareness.json"))
    }

    fn miss(query: &str) -> Event {
        Event {
            kind: EventKind::Miss,
            tool: "recall_context".into(),
            query: Some(query.into()),
            type_name: None,
            entry_ids: vec![],
            at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn absent_file_yields_empty_aggregates() {
        let observer = test_observer();
        let summary = observer.summary().unwrap();
        assert_eq!(summary.total_reads, 0);
        assert!(summary.last_activity.is_none());
    }

    #[test]
    fn summary_counts_by_kind_and_type() {
        let observer = test_observer();
        observer
            .record(Event::write("save_context", Some("decision".into()), vec!["ctx-1".into()]))
            .unwrap();
        observer
            .record(Event::read("list_contexts", Some("decision".into()), vec!["ctx-1".into()]))
            .unwrap();
        observer.record(miss("deployment")).unwrap();
        observer.record(miss("deployment")).unwrap();

        let summary = observer.summary().unwrap();
        assert_eq!(summary.total_writes, 1);
        assert_eq!(summary.total_reads, 1);
        assert_eq!(summary.total_misses, 2);
        assert_eq!(summary.missed_queries.get("deployment"), Some(&2));
        assert_eq!(summary.writes_by_type.get("decision"), Some(&1));
        assert!(summary.last_activity.is_some());
    }

    #[test]
    fn miss_without_query_counts_total_only() {
        let observer = test_observer();
        let mut event = miss("x");
        event.query = None;
        observer.record(event).unwrap();

        let summary = observer.summary().unwrap();
        assert_eq!(summary.total_misses, 1);
        assert!(summary.missed_queries.is_empty());
    }

    #[test]
    fn event_log_rotates_past_cap() {
        let observer = test_observer();
        observer
            .with_state(|state| {
                for i in 0..EVENT_CAP + 1 {
                    state.events.push(Event::read(&format!("t{i}"), None, vec![]));
                }
                state.rotate();
            })
            .unwrap();

        let state = observer.load_state().unwrap();
        assert_eq!(state.events.len(), EVENT_KEEP);
        // the newest events survive
        assert_eq!(state.events.last().unwrap().tool, format!("t{}", EVENT_CAP));
    }

    #[test]
    fn journal_rotates_past_cap() {
        let observer = test_observer();
        observer
            .with_state(|state| {
                for _ in 0..JOURNAL_CAP + 1 {
                    state.improvements.push(ImprovementRecord {
                        timestamp: chrono::Utc::now().to_rfc3339(),
                        actions: vec![],
                        auto_executed: true,
                    });
                }
                state.rotate();
            })
            .unwrap();
        assert_eq!(observer.load_state().unwrap().improvements.len(), JOURNAL_KEEP);
    }

    #[test]
    fn missed_queries_filters_and_orders() {
        let observer = test_observer();
        for _ in 0..3 {
            observer.record(miss("deployment")).unwrap();
        }
        observer.record(miss("staging")).unwrap();

        let missed = observer.missed_queries(3).unwrap();
        assert_eq!(missed, vec![("deployment".to_string(), 3)]);
    }

    #[test]
    fn usefulness_counters_accumulate() {
        let observer = test_observer();
        assert_eq!(observer.record_usefulness("ctx-1", true).unwrap(), 1);
        assert_eq!(observer.record_usefulness("ctx-1", true).unwrap(), 2);
        assert_eq!(observer.record_usefulness("ctx-1", false).unwrap(), 1);

        let state = observer.load_state().unwrap();
        assert_eq!(state.usefulness.helpful.get("ctx-1"), Some(&2));
        assert_eq!(state.usefulness.unhelpful.get("ctx-1"), Some(&1));
    }

    #[test]
    fn improvements_since_cutoff() {
        let observer = test_observer();
        observer
            .add_improvement(ImprovementRecord {
                timestamp: "2020-01-01T00:00:00+00:00".into(),
                actions: vec![],
                auto_executed: true,
            })
            .unwrap();
        observer
            .add_improvement(ImprovementRecord {
                timestamp: chrono::Utc::now().to_rfc3339(),
                actions: vec![],
                auto_executed: false,
            })
            .unwrap();

        let recent = observer.improvements_since("2025-01-01T00:00:00+00:00").unwrap();
        assert_eq!(recent.len(), 1);
        assert!(!recent[0].auto_executed);
    }
}
