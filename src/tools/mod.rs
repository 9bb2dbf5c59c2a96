//! The MCP tool surface.
//!
//! [`SpeculaTools`] holds the shared runtime and exposes all 23 tools via
//! the rmcp `#[tool_router]` macro. Well-formed calls always get a text
//! response; argument problems come back as error text rather than a
//! transport failure. No background work runs on this surface.

pub mod actions;
pub mod awareness;
pub mod bubbles;
pub mod entries;

use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::tool::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

use crate::control;
use crate::schema;
use crate::server::Runtime;
use crate::store::types::StructuredData;
use crate::store::EntryPatch;

use actions::{ApproveActionParams, DismissActionParams, ReviewPendingActionsParams};
use awareness::{
    AnalyzeContradictionsParams, DescribeSchemaParams, GetGapsParams, GetImprovementsParams,
    IntrospectParams, QueryByTypeParams, ReportUsefulnessParams, SaveTypedContextParams,
    SuggestSchemaParams, SummarizeContextParams,
};
use bubbles::{CreateBubbleParams, DeleteBubbleParams, ListBubblesParams, UpdateBubbleParams};
use entries::{
    DeleteContextParams, ListContextsParams, RecallContextParams, SaveContextParams,
    SearchContextParams, UpdateContextParams,
};

const DEFAULT_SOURCE: &str = "mcp";

fn json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| format!("serialization failed: {e}"))
}

/// The specula MCP tool handler. Holds the shared runtime and exposes all
/// tools via the `#[tool_router]` macro.
#[derive(Clone)]
pub struct SpeculaTools {
    tool_router: ToolRouter<Self>,
    runtime: Arc<Runtime>,
}

#[tool_router]
impl SpeculaTools {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            tool_router: Self::tool_router(),
            runtime,
        }
    }

    // ── Entries ──────────────────────────────────────────────────────────────

    #[tool(description = "Save a context entry. Content plus optional tags, source, and bubble.")]
    async fn save_context(
        &self,
        Parameters(params): Parameters<SaveContextParams>,
    ) -> Result<String, String> {
        if params.content.trim().is_empty() {
            return Err("content must not be empty".into());
        }
        let entry = self
            .runtime
            .store
            .save_entry(
                &params.content,
                params.tags.unwrap_or_default(),
                params.source.as_deref().unwrap_or(DEFAULT_SOURCE),
                params.bubble_id,
            )
            .map_err(|e| format!("save failed: {e}"))?;
        tracing::info!(id = %entry.id, "context saved");
        json(&entry)
    }

    #[tool(description = "Recall context entries whose content or tags contain a substring.")]
    async fn recall_context(
        &self,
        Parameters(params): Parameters<RecallContextParams>,
    ) -> Result<String, String> {
        if params.query.trim().is_empty() {
            return Err("query must not be empty".into());
        }
        let entries = self
            .runtime
            .store
            .recall(&params.query)
            .map_err(|e| format!("recall failed: {e}"))?;
        json(&entries)
    }

    #[tool(description = "List context entries, optionally filtered by tag. Pass archived=true for the archive.")]
    async fn list_contexts(
        &self,
        Parameters(params): Parameters<ListContextsParams>,
    ) -> Result<String, String> {
        let entries = if params.archived.unwrap_or(false) {
            self.runtime.store.list_archived()
        } else {
            self.runtime.store.list(params.tag.as_deref())
        }
        .map_err(|e| format!("list failed: {e}"))?;
        json(&entries)
    }

    #[tool(description = "Update an existing context entry's content, tags, source, or bubble.")]
    async fn update_context(
        &self,
        Parameters(params): Parameters<UpdateContextParams>,
    ) -> Result<String, String> {
        let patch = EntryPatch {
            content: params.content,
            tags: params.tags,
            source: params.source,
            bubble_id: params.bubble_id.map(Some),
        };
        let updated = self
            .runtime
            .store
            .update(&params.id, patch)
            .map_err(|e| format!("update failed: {e}"))?;
        match updated {
            Some(entry) => json(&entry),
            None => Err(format!("Context entry not found: {}", params.id)),
        }
    }

    #[tool(description = "Permanently delete a context entry by ID.")]
    async fn delete_context(
        &self,
        Parameters(params): Parameters<DeleteContextParams>,
    ) -> Result<String, String> {
        let deleted = self
            .runtime
            .store
            .delete(&params.id)
            .map_err(|e| format!("delete failed: {e}"))?;
        if deleted {
            json(&serde_json::json!({ "deleted": params.id }))
        } else {
            Err(format!("Context entry not found: {}", params.id))
        }
    }

    #[tool(description = "Search entries; every term must match content, tags, or source.")]
    async fn search_context(
        &self,
        Parameters(params): Parameters<SearchContextParams>,
    ) -> Result<String, String> {
        if params.query.trim().is_empty() {
            return Err("query must not be empty".into());
        }
        let entries = self
            .runtime
            .store
            .search(&params.query)
            .map_err(|e| format!("search failed: {e}"))?;
        json(&entries)
    }

    // ── Bubbles ──────────────────────────────────────────────────────────────

    #[tool(description = "Create a bubble (a named group of context entries).")]
    async fn create_bubble(
        &self,
        Parameters(params): Parameters<CreateBubbleParams>,
    ) -> Result<String, String> {
        if params.name.trim().is_empty() {
            return Err("name must not be empty".into());
        }
        let bubble = self
            .runtime
            .store
            .create_bubble(&params.name, params.description)
            .map_err(|e| format!("create failed: {e}"))?;
        json(&bubble)
    }

    #[tool(description = "List all bubbles.")]
    async fn list_bubbles(
        &self,
        Parameters(_params): Parameters<ListBubblesParams>,
    ) -> Result<String, String> {
        let bubbles = self
            .runtime
            .store
            .list_bubbles()
            .map_err(|e| format!("list failed: {e}"))?;
        json(&bubbles)
    }

    #[tool(description = "Rename a bubble or change its description.")]
    async fn update_bubble(
        &self,
        Parameters(params): Parameters<UpdateBubbleParams>,
    ) -> Result<String, String> {
        let updated = self
            .runtime
            .store
            .update_bubble(&params.id, params.name, params.description)
            .map_err(|e| format!("update failed: {e}"))?;
        match updated {
            Some(bubble) => json(&bubble),
            None => Err(format!("Bubble not found: {}", params.id)),
        }
    }

    #[tool(description = "Delete a bubble. cascade=true also deletes its entries; otherwise they are orphaned.")]
    async fn delete_bubble(
        &self,
        Parameters(params): Parameters<DeleteBubbleParams>,
    ) -> Result<String, String> {
        let deleted = self
            .runtime
            .store
            .delete_bubble(&params.id, params.cascade.unwrap_or(false))
            .map_err(|e| format!("delete failed: {e}"))?;
        if deleted {
            json(&serde_json::json!({ "deleted": params.id }))
        } else {
            Err(format!("Bubble not found: {}", params.id))
        }
    }

    // ── Typed store ──────────────────────────────────────────────────────────

    #[tool(description = "Describe the user's context type catalog: types, fields, and requirements.")]
    async fn describe_schema(
        &self,
        Parameters(_params): Parameters<DescribeSchemaParams>,
    ) -> Result<String, String> {
        let catalog = self.runtime.load_catalog();
        Ok(schema::describe(catalog.as_ref()))
    }

    #[tool(description = "Save a typed context entry with structured data, validated against the schema. Validation failures are reported but the entry is still saved.")]
    async fn save_typed_context(
        &self,
        Parameters(params): Parameters<SaveTypedContextParams>,
    ) -> Result<String, String> {
        let data: StructuredData = serde_json::from_value(params.data)
            .map_err(|e| format!("data must map field names to strings, string arrays, numbers, or booleans: {e}"))?;
        let catalog = self.runtime.load_catalog();
        let result = self
            .runtime
            .store
            .save_typed(
                catalog.as_ref(),
                &params.r#type,
                data,
                params.tags.unwrap_or_default(),
                params.source.as_deref().unwrap_or(DEFAULT_SOURCE),
            )
            .map_err(|e| format!("save failed: {e}"))?;
        json(&result)
    }

    #[tool(description = "Query entries of a type, optionally filtering on structured fields and ranking by relevance.")]
    async fn query_by_type(
        &self,
        Parameters(params): Parameters<QueryByTypeParams>,
    ) -> Result<String, String> {
        let filter: StructuredData = match params.filter {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| format!("filter must map field names to plain values: {e}"))?,
            None => StructuredData::new(),
        };
        let entries = self
            .runtime
            .store
            .query_by_type(&params.r#type, &filter)
            .map_err(|e| format!("query failed: {e}"))?;

        if params.ranked.unwrap_or(false) {
            let query: String = std::iter::once(params.r#type.clone())
                .chain(filter.values().map(|v| v.render()))
                .collect::<Vec<_>>()
                .join(" ");
            let (source, ranked) = self.runtime.analyzer.rank(&query, &entries).await;
            let ranked: Vec<serde_json::Value> = ranked
                .into_iter()
                .map(|(entry, score)| serde_json::json!({ "entry": entry, "score": score }))
                .collect();
            return json(&serde_json::json!({ "source": source, "results": ranked }));
        }
        json(&entries)
    }

    // ── Self-awareness ───────────────────────────────────────────────────────

    #[tool(description = "Introspect the context store: identity, coverage, freshness, gaps, contradictions, health. deep=true adds LM-verified analysis.")]
    async fn introspect(
        &self,
        Parameters(params): Parameters<IntrospectParams>,
    ) -> Result<String, String> {
        let model = if params.deep.unwrap_or(false) {
            self.runtime.self_model_deep().await
        } else {
            self.runtime.self_model()
        }
        .map_err(|e| format!("introspection failed: {e}"))?;
        Ok(model.render())
    }

    #[tool(description = "List identified gaps in the store: empty types, repeatedly missed searches, stale areas.")]
    async fn get_gaps(
        &self,
        Parameters(_params): Parameters<GetGapsParams>,
    ) -> Result<String, String> {
        let model = self
            .runtime
            .self_model()
            .map_err(|e| format!("introspection failed: {e}"))?;
        json(&model.gaps)
    }

    #[tool(description = "Report whether a recalled entry was actually helpful. Feeds future ranking signals.")]
    async fn report_usefulness(
        &self,
        Parameters(params): Parameters<ReportUsefulnessParams>,
    ) -> Result<String, String> {
        let count = self
            .runtime
            .observer
            .record_usefulness(&params.entry_id, params.helpful)
            .map_err(|e| format!("could not record usefulness: {e}"))?;
        json(&serde_json::json!({
            "entryId": params.entry_id,
            "helpful": params.helpful,
            "count": count,
        }))
    }

    #[tool(description = "Detect contradictions between same-type entries, LM-verified when a local model is available.")]
    async fn analyze_contradictions(
        &self,
        Parameters(_params): Parameters<AnalyzeContradictionsParams>,
    ) -> Result<String, String> {
        let (entries, _) = self
            .runtime
            .store
            .snapshot()
            .map_err(|e| format!("could not read store: {e}"))?;
        let (source, contradictions) = self.runtime.analyzer.detect_contradictions(&entries).await;
        json(&serde_json::json!({ "source": source, "contradictions": contradictions }))
    }

    #[tool(description = "Suggest new context types for untyped entries. Suggestions are recorded, never applied automatically.")]
    async fn suggest_schema(
        &self,
        Parameters(_params): Parameters<SuggestSchemaParams>,
    ) -> Result<String, String> {
        let (entries, _) = self
            .runtime
            .store
            .snapshot()
            .map_err(|e| format!("could not read store: {e}"))?;
        let untyped: Vec<_> = entries
            .into_iter()
            .filter(|e| !e.archived && e.type_name.is_none())
            .collect();
        let (source, suggestions) = self.runtime.analyzer.suggest_types(&untyped).await;
        json(&serde_json::json!({ "source": source, "suggestions": suggestions }))
    }

    #[tool(description = "Summarize stored context, optionally scoped to a tag and steered by a focus hint.")]
    async fn summarize_context(
        &self,
        Parameters(params): Parameters<SummarizeContextParams>,
    ) -> Result<String, String> {
        let entries = self
            .runtime
            .store
            .list(params.tag.as_deref())
            .map_err(|e| format!("could not read store: {e}"))?;
        let (source, summary) = self
            .runtime
            .analyzer
            .summarize(&entries, params.focus.as_deref())
            .await;
        json(&serde_json::json!({
            "source": source,
            "entries": entries.len(),
            "summary": summary,
        }))
    }

    #[tool(description = "List improvement journal records, optionally since a timestamp.")]
    async fn get_improvements(
        &self,
        Parameters(params): Parameters<GetImprovementsParams>,
    ) -> Result<String, String> {
        let since = params.since.as_deref().unwrap_or("1970-01-01T00:00:00+00:00");
        let records = self
            .runtime
            .observer
            .improvements_since(since)
            .map_err(|e| format!("could not read journal: {e}"))?;
        json(&records)
    }

    // ── Pending actions ──────────────────────────────────────────────────────

    #[tool(description = "List improvement actions awaiting approval, with previews and reasoning.")]
    async fn review_pending_actions(
        &self,
        Parameters(_params): Parameters<ReviewPendingActionsParams>,
    ) -> Result<String, String> {
        let state = self
            .runtime
            .observer
            .load_state()
            .map_err(|e| format!("could not read pending actions: {e}"))?;
        let pending: Vec<_> = state
            .pending_actions
            .iter()
            .filter(|p| p.is_pending())
            .collect();
        json(&pending)
    }

    #[tool(description = "Approve one or more pending actions and execute them.")]
    async fn approve_action(
        &self,
        Parameters(params): Parameters<ApproveActionParams>,
    ) -> Result<String, String> {
        let ids = collect_ids(params.action_id, params.action_ids)?;
        let mut outcomes = Vec::new();
        for id in &ids {
            let outcome = control::approve(&self.runtime.store, &self.runtime.observer, id)
                .map_err(|e| format!("approve failed: {e}"))?;
            outcomes.push(outcome);
        }
        self.runtime.cache.invalidate();
        json(&outcomes)
    }

    #[tool(description = "Dismiss one or more pending actions. The targets become protected from re-proposal.")]
    async fn dismiss_action(
        &self,
        Parameters(params): Parameters<DismissActionParams>,
    ) -> Result<String, String> {
        let ids = collect_ids(params.action_id, params.action_ids)?;
        let mut outcomes = Vec::new();
        for id in &ids {
            let outcome = control::dismiss(
                &self.runtime.store,
                &self.runtime.observer,
                id,
                params.reason.as_deref(),
            )
            .map_err(|e| format!("dismiss failed: {e}"))?;
            outcomes.push(outcome);
        }
        json(&outcomes)
    }
}

fn collect_ids(single: Option<String>, batch: Option<Vec<String>>) -> Result<Vec<String>, String> {
    let mut ids = Vec::new();
    if let Some(id) = single {
        ids.push(id);
    }
    if let Some(batch) = batch {
        ids.extend(batch);
    }
    if ids.is_empty() {
        return Err("provide actionId or actionIds".into());
    }
    Ok(ids)
}

#[tool_handler]
impl ServerHandler for SpeculaTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "specula is a self-aware context store. Use save_context / recall_context \
                 for plain notes, save_typed_context and query_by_type for structured ones \
                 (describe_schema lists the types), and introspect / get_gaps / \
                 review_pending_actions to see what the store knows about itself."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}
