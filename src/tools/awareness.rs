//! Parameter definitions for the typed-store and self-awareness tools.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `describe_schema` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct DescribeSchemaParams {}

/// Parameters for the `save_typed_context` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SaveTypedContextParams {
    /// Name of the context type from the schema catalog.
    #[schemars(description = "Name of the context type from the schema catalog")]
    pub r#type: String,

    /// Structured field data: field name to string, string array, number, or boolean.
    #[schemars(
        description = "Structured field data: field name to string, string array, number, or boolean"
    )]
    pub data: serde_json::Value,

    /// Optional tags.
    #[schemars(description = "Optional tags")]
    pub tags: Option<Vec<String>>,

    /// Where this context came from. Defaults to 'mcp'.
    #[schemars(description = "Where this context came from. Defaults to 'mcp'.")]
    pub source: Option<String>,
}

/// Parameters for the `query_by_type` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct QueryByTypeParams {
    /// Context type to query.
    #[schemars(description = "Context type to query")]
    pub r#type: String,

    /// Structured-field equality filter, e.g. {"topic": "editor"}.
    #[schemars(description = "Structured-field equality filter, e.g. {\"topic\": \"editor\"}")]
    pub filter: Option<serde_json::Value>,

    /// Rank results by relevance (uses the analyzer when available).
    #[schemars(description = "Rank results by relevance (uses the analyzer when available)")]
    pub ranked: Option<bool>,
}

/// Parameters for the `introspect` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct IntrospectParams {
    /// Run the deeper analyzer-backed introspection (slower; may use the local LM).
    #[schemars(
        description = "Run the deeper analyzer-backed introspection (slower; may use the local LM)"
    )]
    pub deep: Option<bool>,
}

/// Parameters for the `get_gaps` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GetGapsParams {}

/// Parameters for the `report_usefulness` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReportUsefulnessParams {
    /// ID of the entry the feedback is about.
    #[schemars(description = "ID of the entry the feedback is about")]
    pub entry_id: String,

    /// True if the entry was helpful, false if not.
    #[schemars(description = "True if the entry was helpful, false if not")]
    pub helpful: bool,
}

/// Parameters for the `analyze_contradictions` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct AnalyzeContradictionsParams {}

/// Parameters for the `suggest_schema` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SuggestSchemaParams {}

/// Parameters for the `summarize_context` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SummarizeContextParams {
    /// Only summarize entries carrying this tag.
    #[schemars(description = "Only summarize entries carrying this tag")]
    pub tag: Option<String>,

    /// Optional focus hint for the summary.
    #[schemars(description = "Optional focus hint for the summary")]
    pub focus: Option<String>,
}

/// Parameters for the `get_improvements` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GetImprovementsParams {
    /// Only records at or after this ISO 8601 timestamp.
    #[schemars(description = "Only records at or after this ISO 8601 timestamp")]
    pub since: Option<String>,
}
