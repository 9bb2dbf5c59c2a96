//! Parameter definitions for the entry CRUD and search tools.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `save_context` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SaveContextParams {
    /// The content to remember.
    #[schemars(description = "The content to remember")]
    pub content: String,

    /// Optional tags for later filtering.
    #[schemars(description = "Optional tags for later filtering")]
    pub tags: Option<Vec<String>>,

    /// Where this context came from. Defaults to 'mcp'.
    #[schemars(description = "Where this context came from. Defaults to 'mcp'.")]
    pub source: Option<String>,

    /// Optional bubble (group) ID this entry belongs to.
    #[schemars(description = "Optional bubble (group) ID this entry belongs to")]
    pub bubble_id: Option<String>,
}

/// Parameters for the `recall_context` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RecallContextParams {
    /// Substring to look for in content and tags.
    #[schemars(description = "Substring to look for in content and tags")]
    pub query: String,
}

/// Parameters for the `list_contexts` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ListContextsParams {
    /// Only entries carrying this tag.
    #[schemars(description = "Only entries carrying this tag")]
    pub tag: Option<String>,

    /// List archived entries instead of active ones.
    #[schemars(description = "List archived entries instead of active ones")]
    pub archived: Option<bool>,
}

/// Parameters for the `update_context` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateContextParams {
    /// ID of the entry to update.
    #[schemars(description = "ID of the entry to update")]
    pub id: String,

    /// New content; omit to keep the current content.
    #[schemars(description = "New content; omit to keep the current content")]
    pub content: Option<String>,

    /// Replacement tag set; omit to keep the current tags.
    #[schemars(description = "Replacement tag set; omit to keep the current tags")]
    pub tags: Option<Vec<String>>,

    /// New source label.
    #[schemars(description = "New source label")]
    pub source: Option<String>,

    /// Move the entry into this bubble.
    #[schemars(description = "Move the entry into this bubble")]
    pub bubble_id: Option<String>,
}

/// Parameters for the `delete_context` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct DeleteContextParams {
    /// ID of the entry to delete permanently.
    #[schemars(description = "ID of the entry to delete permanently")]
    pub id: String,
}

/// Parameters for the `search_context` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SearchContextParams {
    /// Search terms; every term must match content, tags, or source.
    #[schemars(description = "Search terms; every term must match content, tags, or source")]
    pub query: String,
}
