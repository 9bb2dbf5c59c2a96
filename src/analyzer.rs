//! LM-assisted analysis with deterministic fallbacks.
//!
//! The analyzer talks to a local Ollama-compatible endpoint
//! (`GET /api/tags` to probe, `POST /api/generate` to run). Availability is
//! probed once and cached for the process lifetime. Every transport error,
//! timeout, or unparseable response degrades silently to the deterministic
//! path — callers never see an error from this module.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::config::LmConfig;
use crate::model::{self, Contradiction};
use crate::store::types::ContextEntry;

/// At most this many of the most recently updated entries are inspected per
/// type bucket when detecting contradictions.
const CONTRADICTION_BUCKET_CAP: usize = 50;
/// At most this many untyped entries feed a schema suggestion.
const SUGGESTION_CAP: usize = 30;
/// Fewer untyped entries than this and no schema is suggested.
const SUGGESTION_FLOOR: usize = 3;
/// At most this many entries are ranked per query.
const RANK_CAP: usize = 20;
/// At most this many schema types are suggested at once.
const MAX_SUGGESTIONS: usize = 3;

/// Which path produced an analysis result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisSource {
    Lm,
    Deterministic,
}

/// A proposed schema type. Recorded for the user; never written to the
/// catalog file by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSuggestion {
    pub type_name: String,
    pub description: String,
    #[serde(default)]
    pub fields: Vec<SuggestedField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedField {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
}

pub struct Analyzer {
    http: reqwest::Client,
    base_url: String,
    model: String,
    enabled: bool,
    available: OnceCell<bool>,
}

impl Analyzer {
    pub fn new(config: &LmConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            enabled: config.enabled,
            available: OnceCell::new(),
        }
    }

    /// Probe the endpoint once: list models and confirm the configured one
    /// is present. The result is cached for the process lifetime.
    pub async fn is_available(&self) -> bool {
        if !self.enabled {
            return false;
        }
        *self
            .available
            .get_or_init(|| async {
                let url = format!("{}/api/tags", self.base_url);
                match self.http.get(&url).send().await {
                    Ok(response) => {
                        let body: serde_json::Value = match response.json().await {
                            Ok(body) => body,
                            Err(_) => return false,
                        };
                        let present = body
                            .get("models")
                            .and_then(|m| m.as_array())
                            .map(|models| {
                                models.iter().any(|m| {
                                    m.get("name")
                                        .and_then(|n| n.as_str())
                                        .is_some_and(|name| {
                                            name == self.model
                                                || name.strip_suffix(":latest")
                                                    == Some(self.model.as_str())
                                                || name.split(':').next() == Some(&self.model)
                                        })
                                })
                            })
                            .unwrap_or(false);
                        if !present {
                            tracing::warn!(
                                model = %self.model,
                                "configured model not present at LM endpoint, using deterministic analysis"
                            );
                        }
                        present
                    }
                    Err(err) => {
                        tracing::info!(%err, "LM endpoint unreachable, using deterministic analysis");
                        false
                    }
                }
            })
            .await
    }

    /// One non-streaming generation call.
    async fn generate(&self, prompt: &str) -> Result<String, reqwest::Error> {
        let url = format!("{}/api/generate", self.base_url);
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        let body: serde_json::Value = self.http.post(&url).json(&payload).send().await?.json().await?;
        Ok(body
            .get("response")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    // ── Contradiction detection ──────────────────────────────────────────────

    /// Pairwise contradiction check within each type bucket, LM-verified
    /// when available. Any transport error falls back to the opposition
    /// heuristic; a single unparseable verdict just skips that pair.
    pub async fn detect_contradictions(
        &self,
        entries: &[ContextEntry],
    ) -> (AnalysisSource, Vec<Contradiction>) {
        if !self.is_available().await {
            return (
                AnalysisSource::Deterministic,
                model::opposition_contradictions(entries),
            );
        }

        let mut buckets: BTreeMap<&str, Vec<&ContextEntry>> = BTreeMap::new();
        for entry in entries.iter().filter(|e| !e.archived) {
            if let Some(t) = &entry.type_name {
                buckets.entry(t.as_str()).or_default().push(entry);
            }
        }

        let mut found = Vec::new();
        for (type_name, mut bucket) in buckets {
            bucket.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            bucket.truncate(CONTRADICTION_BUCKET_CAP);

            for (i, first) in bucket.iter().enumerate() {
                for second in &bucket[i + 1..] {
                    let prompt = format!(
                        "Two notes of type \"{type_name}\" from a context store:\n\
                         A: {}\nB: {}\n\n\
                         Do they contradict each other? Answer with only a JSON object:\n\
                         {{\"contradiction\": true|false, \"explanation\": \"one line\"}}",
                        first.content, second.content
                    );
                    let response = match self.generate(&prompt).await {
                        Ok(response) => response,
                        Err(err) => {
                            tracing::warn!(%err, "LM call failed mid-scan, falling back");
                            return (
                                AnalysisSource::Deterministic,
                                model::opposition_contradictions(entries),
                            );
                        }
                    };
                    let Some(verdict) = extract_json::<Verdict>(&response) else {
                        continue;
                    };
                    if verdict.contradiction {
                        found.push(Contradiction {
                            first_id: first.id.clone(),
                            second_id: second.id.clone(),
                            type_name: Some(type_name.to_string()),
                            explanation: verdict.explanation,
                        });
                    }
                }
            }
        }
        (AnalysisSource::Lm, found)
    }

    // ── Schema suggestion ────────────────────────────────────────────────────

    /// Propose up to three schema types for a set of untyped entries.
    /// Fallback partitions by first tag and keeps groups of three or more.
    pub async fn suggest_types(
        &self,
        untyped: &[ContextEntry],
    ) -> (AnalysisSource, Vec<SchemaSuggestion>) {
        if untyped.len() < SUGGESTION_FLOOR {
            return (AnalysisSource::Deterministic, Vec::new());
        }
        let sample: Vec<&ContextEntry> = untyped.iter().take(SUGGESTION_CAP).collect();

        if self.is_available().await {
            let listing: String = sample
                .iter()
                .map(|e| format!("- {}\n", e.preview()))
                .collect();
            let prompt = format!(
                "These context notes are untyped:\n{listing}\n\
                 Propose at most {MAX_SUGGESTIONS} reusable context types for them. \
                 Answer with only a JSON array:\n\
                 [{{\"typeName\": \"...\", \"description\": \"...\", \
                 \"fields\": [{{\"name\": \"...\", \"type\": \"string\", \"description\": \"...\"}}]}}]"
            );
            match self.generate(&prompt).await {
                Ok(response) => {
                    if let Some(mut suggestions) =
                        extract_json::<Vec<SchemaSuggestion>>(&response)
                    {
                        suggestions.truncate(MAX_SUGGESTIONS);
                        return (AnalysisSource::Lm, suggestions);
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "LM schema suggestion failed, falling back");
                }
            }
        }

        (AnalysisSource::Deterministic, tag_group_suggestions(&sample))
    }

    // ── Summarization ────────────────────────────────────────────────────────

    /// Summarize a set of entries, optionally steered by a focus hint.
    pub async fn summarize(
        &self,
        entries: &[ContextEntry],
        focus: Option<&str>,
    ) -> (AnalysisSource, String) {
        if self.is_available().await {
            let listing: String = entries
                .iter()
                .map(|e| format!("- {}\n", e.content))
                .collect();
            let focus_line = focus
                .map(|f| format!("Focus on: {f}\n"))
                .unwrap_or_default();
            let prompt = format!(
                "Summarize these context notes in a short paragraph.\n{focus_line}{listing}"
            );
            match self.generate(&prompt).await {
                Ok(text) if !text.trim().is_empty() => {
                    return (AnalysisSource::Lm, text.trim().to_string());
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(%err, "LM summarization failed, falling back");
                }
            }
        }
        (AnalysisSource::Deterministic, digest(entries))
    }

    // ── Relevance ranking ────────────────────────────────────────────────────

    /// Rank entries by relevance to a query. LM path asks for an ordered ID
    /// list; unranked entries score 0 and sort last. Fallback scores by
    /// normalized term overlap.
    pub async fn rank(
        &self,
        query: &str,
        entries: &[ContextEntry],
    ) -> (AnalysisSource, Vec<(ContextEntry, f64)>) {
        let pool: Vec<&ContextEntry> = entries.iter().take(RANK_CAP).collect();

        if self.is_available().await {
            let listing: String = pool
                .iter()
                .map(|e| format!("{}: {}\n", e.id, e.preview()))
                .collect();
            let prompt = format!(
                "Query: {query}\nCandidate notes:\n{listing}\n\
                 Order the note IDs from most to least relevant to the query. \
                 Answer with only a JSON array of ID strings."
            );
            match self.generate(&prompt).await {
                Ok(response) => {
                    if let Some(order) = extract_json::<Vec<String>>(&response) {
                        let n = pool.len() as f64;
                        let mut ranked: Vec<(ContextEntry, f64)> = pool
                            .iter()
                            .map(|e| {
                                let score = order
                                    .iter()
                                    .position(|id| id == &e.id)
                                    .map(|idx| (n - idx as f64) / n)
                                    .unwrap_or(0.0);
                                ((*e).clone(), score)
                            })
                            .collect();
                        ranked.sort_by(|a, b| {
                            b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
                        });
                        return (AnalysisSource::Lm, ranked);
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "LM ranking failed, falling back");
                }
            }
        }

        let query_tokens = tokenize(query);
        let mut ranked: Vec<(ContextEntry, f64)> = pool
            .iter()
            .map(|e| {
                let haystack = format!(
                    "{} {} {}",
                    e.content,
                    e.tags.join(" "),
                    e.type_name.as_deref().unwrap_or_default()
                );
                ((*e).clone(), overlap_score(&query_tokens, &haystack))
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        (AnalysisSource::Deterministic, ranked)
    }
}

#[derive(Deserialize)]
struct Verdict {
    #[serde(default)]
    contradiction: bool,
    #[serde(default)]
    explanation: String,
}

// ── Deterministic fallbacks ──────────────────────────────────────────────────

/// Partition untyped entries by first tag; groups of three or more become a
/// generic one-field suggestion.
fn tag_group_suggestions(entries: &[&ContextEntry]) -> Vec<SchemaSuggestion> {
    let mut groups: BTreeMap<&str, usize> = BTreeMap::new();
    for entry in entries {
        if let Some(tag) = entry.tags.first() {
            *groups.entry(tag.as_str()).or_insert(0) += 1;
        }
    }
    groups
        .into_iter()
        .filter(|(_, count)| *count >= SUGGESTION_FLOOR)
        .take(MAX_SUGGESTIONS)
        .map(|(tag, count)| SchemaSuggestion {
            type_name: tag.to_string(),
            description: format!("Entries tagged \"{tag}\" ({count} so far)"),
            fields: vec![SuggestedField {
                name: "details".into(),
                kind: "string".into(),
                description: "Free-form details".into(),
            }],
        })
        .collect()
}

/// One-sentence digest used when no LM is available.
fn digest(entries: &[ContextEntry]) -> String {
    if entries.is_empty() {
        return "No entries to summarize.".to_string();
    }
    let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
    for entry in entries {
        *by_type
            .entry(entry.type_name.as_deref().unwrap_or("untyped"))
            .or_insert(0) += 1;
    }
    let breakdown: Vec<String> = by_type
        .iter()
        .map(|(t, n)| format!("{n} of type {t}"))
        .collect();
    let newest = entries
        .iter()
        .map(|e| e.updated_at.as_str())
        .max()
        .unwrap_or_default();
    format!(
        "{} entries ({}), newest updated {}.",
        entries.len(),
        breakdown.join(", "),
        newest
    )
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fraction of query tokens present in the haystack.
fn overlap_score(query_tokens: &[String], haystack: &str) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let haystack_tokens = tokenize(haystack);
    let hits = query_tokens
        .iter()
        .filter(|t| haystack_tokens.contains(t))
        .count();
    hits as f64 / query_tokens.len() as f64
}

/// Mine the first JSON value out of an LM reply: a fenced ```json block
/// first, then bare braces or brackets.
fn extract_json<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    if let Some(fence_start) = response.find("```json") {
        let after = &response[fence_start + "```json".len()..];
        if let Some(fence_end) = after.find("```") {
            if let Ok(value) = serde_json::from_str(after[..fence_end].trim()) {
                return Some(value);
            }
        }
    }
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (response.find(open), response.rfind(close)) {
            if end > start {
                if let Ok(value) = serde_json::from_str(response[start..=end].trim()) {
                    return Some(value);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_analyzer() -> Analyzer {
        Analyzer::new(&LmConfig {
            enabled: false,
            base_url: "http://localhost:11434".into(),
            model: "llama3.2".into(),
            timeout_ms: 10_000,
        })
    }

    fn entry(id: &str, content: &str, tags: &[&str], type_name: Option<&str>) -> ContextEntry {
        let now = chrono::Utc::now().to_rfc3339();
        ContextEntry {
            id: id.into(),
            content: content.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            source: "test".into(),
            bubble_id: None,
            type_name: type_name.map(str::to_string),
            structured_data: None,
            created_at: now.clone(),
            updated_at: now,
            archived: false,
        }
    }

    #[tokio::test]
    async fn disabled_analyzer_is_never_available() {
        assert!(!offline_analyzer().is_available().await);
    }

    #[tokio::test]
    async fn contradictions_fall_back_to_heuristic() {
        let analyzer = offline_analyzer();
        let entries = vec![
            entry("ctx-a", "Always use prepared statements", &[], Some("rule")),
            entry("ctx-b", "Never use prepared statements for bulk loads", &[], Some("rule")),
        ];
        let (source, found) = analyzer.detect_contradictions(&entries).await;
        assert_eq!(source, AnalysisSource::Deterministic);
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn too_few_entries_yield_no_suggestions() {
        let analyzer = offline_analyzer();
        let entries = vec![
            entry("ctx-1", "a", &["go"], None),
            entry("ctx-2", "b", &["go"], None),
        ];
        let (_, suggestions) = analyzer.suggest_types(&entries).await;
        assert!(suggestions.is_empty());
    }

    #[tokio::test]
    async fn tag_groups_become_suggestions() {
        let analyzer = offline_analyzer();
        let entries: Vec<ContextEntry> = (0..4)
            .map(|i| entry(&format!("ctx-{i}"), "note", &["deploy"], None))
            .chain(std::iter::once(entry("ctx-x", "note", &["misc"], None)))
            .collect();
        let (source, suggestions) = analyzer.suggest_types(&entries).await;
        assert_eq!(source, AnalysisSource::Deterministic);
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].type_name, "deploy");
        assert_eq!(suggestions[0].fields.len(), 1);
    }

    #[tokio::test]
    async fn fallback_digest_counts_types() {
        let analyzer = offline_analyzer();
        let entries = vec![
            entry("ctx-1", "a", &[], Some("decision")),
            entry("ctx-2", "b", &[], Some("decision")),
            entry("ctx-3", "c", &[], None),
        ];
        let (source, summary) = analyzer.summarize(&entries, None).await;
        assert_eq!(source, AnalysisSource::Deterministic);
        assert!(summary.contains("3 entries"));
        assert!(summary.contains("2 of type decision"));
        assert!(summary.contains("1 of type untyped"));
    }

    #[tokio::test]
    async fn fallback_ranking_orders_by_overlap() {
        let analyzer = offline_analyzer();
        let entries = vec![
            entry("ctx-1", "nothing relevant here", &[], None),
            entry("ctx-2", "redis cache eviction policy", &["redis"], None),
            entry("ctx-3", "cache sizing notes", &[], None),
        ];
        let (source, ranked) = analyzer.rank("redis cache", &entries).await;
        assert_eq!(source, AnalysisSource::Deterministic);
        assert_eq!(ranked[0].0.id, "ctx-2");
        assert!(ranked[0].1 > ranked[1].1);
        assert_eq!(ranked.last().unwrap().1, 0.0);
    }

    #[test]
    fn extract_json_fenced_and_bare() {
        let fenced = "Sure:\n```json\n{\"contradiction\": true, \"explanation\": \"x\"}\n```";
        let v: Verdict = extract_json(fenced).unwrap();
        assert!(v.contradiction);

        let bare = "the answer is {\"contradiction\": false, \"explanation\": \"y\"} ok";
        let v: Verdict = extract_json(bare).unwrap();
        assert!(!v.contradiction);

        let array = "ids: [\"ctx-1\", \"ctx-2\"]";
        let ids: Vec<String> = extract_json(array).unwrap();
        assert_eq!(ids, vec!["ctx-1", "ctx-2"]);

        assert!(extract_json::<Verdict>("no json at all").is_none());
    }
}
