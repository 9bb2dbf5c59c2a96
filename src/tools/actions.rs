//! Parameter definitions for the pending-action review tools.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `review_pending_actions` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ReviewPendingActionsParams {}

/// Parameters for the `approve_action` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApproveActionParams {
    /// ID of the pending action to approve.
    #[schemars(description = "ID of the pending action to approve")]
    pub action_id: Option<String>,

    /// Batch of pending action IDs to approve.
    #[schemars(description = "Batch of pending action IDs to approve")]
    pub action_ids: Option<Vec<String>>,
}

/// Parameters for the `dismiss_action` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DismissActionParams {
    /// ID of the pending action to dismiss.
    #[schemars(description = "ID of the pending action to dismiss")]
    pub action_id: Option<String>,

    /// Batch of pending action IDs to dismiss.
    #[schemars(description = "Batch of pending action IDs to dismiss")]
    pub action_ids: Option<Vec<String>>,

    /// Why the action is being dismissed; feeds the protection list.
    #[schemars(description = "Why the action is being dismissed; feeds the protection list")]
    pub reason: Option<String>,
}
