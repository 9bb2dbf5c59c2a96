//! Core context store type definitions.
//!
//! Defines [`ContextEntry`] (a single stored note), [`Bubble`] (a named group
//! of entries), [`FieldValue`] (the polymorphic structured-data value), and
//! [`StoreFile`] (the on-disk document). All persisted keys are camelCase to
//! match the store file format.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single structured-data value on a typed entry.
///
/// Serialized untagged, so the on-disk JSON holds plain strings, arrays,
/// numbers, and booleans; the schema supplies the expected kind at
/// validation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
    Number(f64),
    Flag(bool),
}

impl FieldValue {
    /// Human-readable rendering used when building entry content from
    /// structured data. Lists join with `", "`.
    pub fn render(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::List(items) => items.join(", "),
            Self::Number(n) => {
                // Integral numbers render without a trailing ".0"
                if n.fract() == 0.0 && n.is_finite() {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            Self::Flag(b) => b.to_string(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// True for values that count as "empty" when a required field is checked:
    /// a blank string or an empty list.
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Text(s) => s.trim().is_empty(),
            Self::List(items) => items.is_empty(),
            Self::Number(_) | Self::Flag(_) => false,
        }
    }
}

/// Structured data attached to a typed entry: field name → value.
pub type StructuredData = BTreeMap<String, FieldValue>;

/// A single piece of context stored on the user's behalf.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEntry {
    /// Content-addressed ID: `ctx-` + truncated SHA-256 of content + creation time.
    pub id: String,
    /// The human-readable content. For typed entries this is rendered from
    /// the structured data so substring recall still works.
    pub content: String,
    /// Small ordered tag set.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Where this entry came from (e.g. `"mcp"`, `"api"`, `"self-improvement"`).
    #[serde(default)]
    pub source: String,
    /// Weak reference to a [`Bubble`]; may point at a deleted bubble.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bubble_id: Option<String>,
    /// Weak reference to a schema type; validated at save time only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    /// Structured field data for typed entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_data: Option<StructuredData>,
    /// ISO 8601 creation timestamp; set once.
    pub created_at: String,
    /// ISO 8601 last-modification timestamp; monotonically advances.
    pub updated_at: String,
    /// Soft-archive flag. Archived entries are hidden from recall, search,
    /// and typed queries but remain retrievable by ID.
    #[serde(default)]
    pub archived: bool,
}

impl ContextEntry {
    /// True if the entry has the given tag (exact match).
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// First ~80 chars of content, for previews and stale listings.
    pub fn preview(&self) -> String {
        let mut end = self.content.len().min(80);
        while !self.content.is_char_boundary(end) {
            end -= 1;
        }
        if end < self.content.len() {
            format!("{}...", &self.content[..end])
        } else {
            self.content.clone()
        }
    }
}

/// A named group of context entries. An entry belongs to at most one bubble.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bubble {
    /// Content-addressed ID: `bub-` + truncated SHA-256 of name + creation time.
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Current store file format version.
pub const STORE_VERSION: u32 = 2;

/// The on-disk store document: `{ version, entries, groups }`.
///
/// Version 1 files lacked the `groups` list; loading migrates them by
/// filling in an empty list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreFile {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub entries: Vec<ContextEntry>,
    #[serde(default)]
    pub groups: Vec<Bubble>,
}

fn default_version() -> u32 {
    STORE_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_value_renders_plain_json() {
        let v: FieldValue = serde_json::from_str("\"Redis\"").unwrap();
        assert_eq!(v, FieldValue::Text("Redis".into()));
        let v: FieldValue = serde_json::from_str("[\"a\",\"b\"]").unwrap();
        assert_eq!(v.render(), "a, b");
        let v: FieldValue = serde_json::from_str("3").unwrap();
        assert_eq!(v.render(), "3");
        let v: FieldValue = serde_json::from_str("true").unwrap();
        assert_eq!(v.render(), "true");
    }

    #[test]
    fn field_value_blankness() {
        assert!(FieldValue::Text("  ".into()).is_blank());
        assert!(FieldValue::List(vec![]).is_blank());
        assert!(!FieldValue::Number(0.0).is_blank());
        assert!(!FieldValue::Flag(false).is_blank());
    }

    #[test]
    fn store_file_migrates_missing_groups() {
        let raw = r#"{"version": 1, "entries": []}"#;
        let file: StoreFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.version, 1);
        assert!(file.groups.is_empty());
    }

    #[test]
    fn entry_round_trips_camel_case() {
        let entry = ContextEntry {
            id: "ctx-abc".into(),
            content: "Use Redis for caching".into(),
            tags: vec!["infra".into()],
            source: "mcp".into(),
            bubble_id: Some("bub-1".into()),
            type_name: Some("decision".into()),
            structured_data: None,
            created_at: "2026-01-01T00:00:00Z".into(),
            updated_at: "2026-01-01T00:00:00Z".into(),
            archived: false,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("bubbleId").is_some());
        assert!(json.get("typeName").is_some());
        assert!(json.get("createdAt").is_some());
        let back: ContextEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, entry.id);
        assert_eq!(back.type_name.as_deref(), Some("decision"));
    }

    #[test]
    fn preview_truncates_long_content() {
        let entry = ContextEntry {
            id: "ctx-x".into(),
            content: "A".repeat(200),
            tags: vec![],
            source: String::new(),
            bubble_id: None,
            type_name: None,
            structured_data: None,
            created_at: "2026-01-01T00:00:00Z".into(),
            updated_at: "2026-01-01T00:00:00Z".into(),
            archived: false,
        };
        assert_eq!(entry.preview().len(), 83);
    }
}
