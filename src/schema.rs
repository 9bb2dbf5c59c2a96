//! User-defined type catalog — loading, validation, and rendering.
//!
//! The catalog is a JSON file the user edits through the UI/REST surface.
//! The runtime only ever reads it: [`load_catalog`] returns `None` when the
//! file is absent or malformed so every typed operation can degrade to the
//! untyped path, and [`save_catalog`] exists solely for the REST `PUT
//! /api/schema` handler acting on the user's behalf.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::store::types::{FieldValue, StructuredData};

/// The kind of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    #[serde(rename = "string")]
    Text,
    #[serde(rename = "string[]")]
    TextList,
    #[serde(rename = "number")]
    Number,
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "enum")]
    Enum,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "string",
            Self::TextList => "string[]",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Enum => "enum",
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Specification of one field on a schema type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Allowed values; non-empty for `enum` fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// A user-declared context type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaType {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Field name → spec. Iterated in sorted order, which keeps rendering
    /// and validation output deterministic.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
}

/// The full type catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaCatalog {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub types: Vec<SchemaType>,
}

impl SchemaCatalog {
    /// Look up a type by name.
    pub fn get_type(&self, name: &str) -> Option<&SchemaType> {
        self.types.iter().find(|t| t.name == name)
    }
}

/// Load the catalog from disk.
///
/// Absent and malformed files both yield `None` — the runtime must survive a
/// missing catalog, and a half-edited schema file must not take typed saves
/// down with it. Malformed files are logged at warn level.
pub fn load_catalog(path: impl AsRef<Path>) -> Option<SchemaCatalog> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(catalog) => Some(catalog),
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "schema catalog unreadable, treating as absent");
            None
        }
    }
}

/// Save the catalog, creating parent directories as needed.
pub fn save_catalog(path: impl AsRef<Path>, catalog: &SchemaCatalog) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(catalog)?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write schema catalog {}", path.display()))?;
    Ok(())
}

/// Validate a data mapping against a named type.
///
/// Returns `(valid, errors)`. Unknown fields in the data are allowed and
/// preserved; error messages name the offending field in double quotes.
pub fn validate(
    catalog: &SchemaCatalog,
    type_name: &str,
    data: &StructuredData,
) -> (bool, Vec<String>) {
    let Some(schema_type) = catalog.get_type(type_name) else {
        return (false, vec![format!("Unknown context type: {type_name}")]);
    };

    let mut errors = Vec::new();
    for (field, spec) in &schema_type.fields {
        match data.get(field) {
            None => {
                if spec.required {
                    errors.push(format!("Missing required field \"{field}\""));
                }
            }
            Some(value) => {
                if spec.required && value.is_blank() {
                    errors.push(format!("Required field \"{field}\" is empty"));
                    continue;
                }
                match (spec.kind, value) {
                    (FieldKind::Text, FieldValue::Text(_)) => {}
                    (FieldKind::TextList, FieldValue::List(_)) => {}
                    (FieldKind::Number, FieldValue::Number(_)) => {}
                    (FieldKind::Boolean, FieldValue::Flag(_)) => {}
                    (FieldKind::Enum, FieldValue::Text(s)) => {
                        let allowed = spec.values.as_deref().unwrap_or(&[]);
                        if !allowed.iter().any(|v| v == s) {
                            errors.push(format!(
                                "Field \"{field}\" must be one of [{}], got \"{s}\"",
                                allowed.join(", ")
                            ));
                        }
                    }
                    (kind, _) => {
                        errors.push(format!("Field \"{field}\" must be a {kind}"));
                    }
                }
            }
        }
    }

    (errors.is_empty(), errors)
}

/// Build the display content for a typed entry:
/// `[type] key: value | key: value` — lists joined with `", "`, fields in
/// sorted order, blank values skipped.
pub fn render_content(type_name: &str, data: &StructuredData) -> String {
    let parts: Vec<String> = data
        .iter()
        .filter(|(_, v)| !v.is_blank())
        .map(|(k, v)| format!("{k}: {}", v.render()))
        .collect();
    if parts.is_empty() {
        format!("[{type_name}]")
    } else {
        format!("[{type_name}] {}", parts.join(" | "))
    }
}

/// Render a human-readable description of the catalog for agents.
pub fn describe(catalog: Option<&SchemaCatalog>) -> String {
    let Some(catalog) = catalog else {
        return "No schema defined. Entries are saved untyped; the user can add \
                context types through the UI."
            .to_string();
    };
    if catalog.types.is_empty() {
        return "Schema catalog is empty. Entries are saved untyped.".to_string();
    }

    let mut out = format!("Context types (catalog v{}):\n", catalog.version);
    for schema_type in &catalog.types {
        out.push_str(&format!("\n{} — {}\n", schema_type.name, schema_type.description));
        for (field, spec) in &schema_type.fields {
            let req = if spec.required { ", required" } else { "" };
            let values = spec
                .values
                .as_ref()
                .map(|v| format!(" [{}]", v.join("|")))
                .unwrap_or_default();
            let desc = spec
                .description
                .as_deref()
                .map(|d| format!(" — {d}"))
                .unwrap_or_default();
            out.push_str(&format!("  {field} ({}{req}){values}{desc}\n", spec.kind));
        }
    }
    out
}
