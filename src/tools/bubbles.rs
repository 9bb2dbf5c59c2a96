//! Parameter definitions for the bubble (group) tools.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `create_bubble` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CreateBubbleParams {
    /// Display name for the new bubble.
    #[schemars(description = "Display name for the new bubble")]
    pub name: String,

    /// Optional description.
    #[schemars(description = "Optional description")]
    pub description: Option<String>,
}

/// Parameters for the `list_bubbles` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ListBubblesParams {}

/// Parameters for the `update_bubble` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct UpdateBubbleParams {
    /// ID of the bubble to update.
    #[schemars(description = "ID of the bubble to update")]
    pub id: String,

    /// New display name.
    #[schemars(description = "New display name")]
    pub name: Option<String>,

    /// New description.
    #[schemars(description = "New description")]
    pub description: Option<String>,
}

/// Parameters for the `delete_bubble` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct DeleteBubbleParams {
    /// ID of the bubble to delete.
    #[schemars(description = "ID of the bubble to delete")]
    pub id: String,

    /// Also delete the bubble's entries; otherwise they are orphaned.
    #[schemars(description = "Also delete the bubble's entries; otherwise they are orphaned")]
    pub cascade: Option<bool>,
}
