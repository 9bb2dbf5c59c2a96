//! The REST surface.
//!
//! Same components as the MCP tools, over HTTP with JSON bodies. The
//! browser UI consumes exactly this API. Handlers translate missing
//! resources to 404, malformed input to 400, and persistence failures to
//! 500; analyzer-backed endpoints always answer, tagging the result with
//! its source.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

use crate::control;
use crate::schema::{self, SchemaCatalog};
use crate::server::Runtime;
use crate::store::types::StructuredData;
use crate::store::EntryPatch;

const DEFAULT_SOURCE: &str = "api";

type AppState = Arc<Runtime>;

pub fn router(runtime: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/contexts", get(list_contexts).post(create_context))
        .route("/api/contexts/search", get(search_contexts))
        .route(
            "/api/contexts/{id}",
            get(get_context).put(update_context).delete(delete_context),
        )
        .route("/api/schema", get(get_schema).put(put_schema))
        .route("/api/awareness", get(awareness))
        .route("/api/analyze", post(analyze))
        .route("/api/pending-actions", get(pending_actions))
        .route("/api/pending-actions/bulk", post(bulk_decide))
        .route("/api/pending-actions/{id}/approve", post(approve_action))
        .route("/api/pending-actions/{id}/dismiss", post(dismiss_action))
        .route("/api/bubbles", get(list_bubbles).post(create_bubble))
        .route(
            "/api/bubbles/{id}",
            get(get_bubble).put(update_bubble).delete(delete_bubble),
        )
        .route("/api/bubbles/{id}/contexts", get(bubble_contexts))
        .with_state(runtime)
}

// ── Error plumbing ───────────────────────────────────────────────────────────

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    tracing::warn!(%err, "request failed");
    ApiError(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn not_found(what: &str, id: &str) -> ApiError {
    ApiError(StatusCode::NOT_FOUND, format!("{what} not found: {id}"))
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, message.into())
}

// ── Health ───────────────────────────────────────────────────────────────────

async fn health(State(rt): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "storePath": rt.config.resolved_store_path(),
        "awarenessPath": rt.config.resolved_awareness_path(),
        "lmHost": rt.config.lm.base_url,
    }))
}

// ── Contexts ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TagQuery {
    tag: Option<String>,
}

async fn list_contexts(
    State(rt): State<AppState>,
    Query(query): Query<TagQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let entries = rt.store.list(query.tag.as_deref()).map_err(internal)?;
    Ok(Json(entries))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateContextBody {
    content: String,
    #[serde(default)]
    tags: Vec<String>,
    source: Option<String>,
    bubble_id: Option<String>,
    /// Optional type name; when present the save goes through validation.
    r#type: Option<String>,
    data: Option<serde_json::Value>,
}

async fn create_context(
    State(rt): State<AppState>,
    Json(body): Json<CreateContextBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.content.trim().is_empty() && body.r#type.is_none() {
        return Err(bad_request("content must not be empty"));
    }
    let source = body.source.as_deref().unwrap_or(DEFAULT_SOURCE);

    if let Some(type_name) = &body.r#type {
        let data: StructuredData = match body.data {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| bad_request(format!("invalid structured data: {e}")))?,
            None => StructuredData::new(),
        };
        let catalog = rt.load_catalog();
        let result = rt
            .store
            .save_typed(catalog.as_ref(), type_name, data, body.tags, source)
            .map_err(internal)?;
        return Ok((StatusCode::CREATED, Json(serde_json::to_value(result).map_err(|e| internal(e.into()))?)));
    }

    let entry = rt
        .store
        .save_entry(&body.content, body.tags, source, body.bubble_id)
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(serde_json::to_value(entry).map_err(|e| internal(e.into()))?)))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
}

async fn search_contexts(
    State(rt): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let entries = rt.store.search(&query.q).map_err(internal)?;
    Ok(Json(entries))
}

async fn get_context(
    State(rt): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match rt.store.get(&id).map_err(internal)? {
        Some(entry) => Ok(Json(entry)),
        None => Err(not_found("context entry", &id)),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateContextBody {
    content: Option<String>,
    tags: Option<Vec<String>>,
    source: Option<String>,
    bubble_id: Option<String>,
    archived: Option<bool>,
    /// Set the entry's type; an empty string clears it.
    r#type: Option<String>,
}

async fn update_context(
    State(rt): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateContextBody>,
) -> Result<impl IntoResponse, ApiError> {
    let patch = EntryPatch {
        content: body.content,
        tags: body.tags,
        source: body.source,
        bubble_id: body.bubble_id.map(Some),
    };
    let updated = rt.store.update(&id, patch).map_err(internal)?;
    let Some(mut entry) = updated else {
        return Err(not_found("context entry", &id));
    };
    if let Some(archived) = body.archived {
        if let Some(changed) = rt.store.set_archived(&id, archived).map_err(internal)? {
            entry = changed;
        }
    }
    if let Some(type_name) = body.r#type {
        let type_name = (!type_name.is_empty()).then_some(type_name);
        if let Some(changed) = rt
            .store
            .set_type(&id, type_name.as_deref())
            .map_err(internal)?
        {
            entry = changed;
        }
    }
    Ok(Json(entry))
}

async fn delete_context(
    State(rt): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if rt.store.delete(&id).map_err(internal)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("context entry", &id))
    }
}

// ── Schema ───────────────────────────────────────────────────────────────────

async fn get_schema(State(rt): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    match rt.load_catalog() {
        Some(catalog) => Ok(Json(catalog)),
        None => Err(ApiError(
            StatusCode::NOT_FOUND,
            "no schema catalog defined".into(),
        )),
    }
}

async fn put_schema(
    State(rt): State<AppState>,
    Json(catalog): Json<SchemaCatalog>,
) -> Result<impl IntoResponse, ApiError> {
    schema::save_catalog(rt.config.resolved_schema_path(), &catalog).map_err(internal)?;
    rt.cache.invalidate();
    Ok(Json(catalog))
}

// ── Awareness & analysis ─────────────────────────────────────────────────────

async fn awareness(State(rt): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let model = rt.self_model().map_err(internal)?;
    Ok(Json(model))
}

#[derive(Deserialize)]
struct AnalyzeBody {
    action: String,
    #[serde(default)]
    params: AnalyzeParams,
}

#[derive(Deserialize, Default)]
struct AnalyzeParams {
    tag: Option<String>,
    focus: Option<String>,
    query: Option<String>,
}

async fn analyze(
    State(rt): State<AppState>,
    Json(body): Json<AnalyzeBody>,
) -> Result<impl IntoResponse, ApiError> {
    match body.action.as_str() {
        "contradictions" => {
            let (entries, _) = rt.store.snapshot().map_err(internal)?;
            let (source, result) = rt.analyzer.detect_contradictions(&entries).await;
            Ok(Json(serde_json::json!({ "source": source, "result": result })))
        }
        "suggest_schema" => {
            let (entries, _) = rt.store.snapshot().map_err(internal)?;
            let untyped: Vec<_> = entries
                .into_iter()
                .filter(|e| !e.archived && e.type_name.is_none())
                .collect();
            let (source, result) = rt.analyzer.suggest_types(&untyped).await;
            Ok(Json(serde_json::json!({ "source": source, "result": result })))
        }
        "summarize" => {
            let entries = rt
                .store
                .list(body.params.tag.as_deref())
                .map_err(internal)?;
            let (source, result) = rt
                .analyzer
                .summarize(&entries, body.params.focus.as_deref())
                .await;
            Ok(Json(serde_json::json!({ "source": source, "result": result })))
        }
        "rank" => {
            let Some(query) = body.params.query else {
                return Err(bad_request("rank requires params.query"));
            };
            let entries = rt.store.list(body.params.tag.as_deref()).map_err(internal)?;
            let (source, ranked) = rt.analyzer.rank(&query, &entries).await;
            let result: Vec<serde_json::Value> = ranked
                .into_iter()
                .map(|(entry, score)| serde_json::json!({ "entry": entry, "score": score }))
                .collect();
            Ok(Json(serde_json::json!({ "source": source, "result": result })))
        }
        other => Err(bad_request(format!(
            "unknown analysis action: {other} (expected contradictions, suggest_schema, summarize, or rank)"
        ))),
    }
}

// ── Pending actions ──────────────────────────────────────────────────────────

async fn pending_actions(State(rt): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let state = rt.observer.load_state().map_err(internal)?;
    let pending: Vec<_> = state
        .pending_actions
        .into_iter()
        .filter(|p| p.is_pending())
        .collect();
    Ok(Json(pending))
}

async fn approve_action(
    State(rt): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = control::approve(&rt.store, &rt.observer, &id).map_err(internal)?;
    rt.cache.invalidate();
    Ok(Json(outcome))
}

#[derive(Deserialize, Default)]
struct DismissBody {
    reason: Option<String>,
}

async fn dismiss_action(
    State(rt): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<DismissBody>>,
) -> Result<impl IntoResponse, ApiError> {
    let reason = body.and_then(|Json(b)| b.reason);
    let outcome = control::dismiss(&rt.store, &rt.observer, &id, reason.as_deref())
        .map_err(internal)?;
    if outcome.dismissed {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Ok((StatusCode::CONFLICT, Json(outcome)).into_response())
    }
}

#[derive(Deserialize)]
struct BulkBody {
    action_ids: Vec<String>,
    decision: String,
    reason: Option<String>,
}

async fn bulk_decide(
    State(rt): State<AppState>,
    Json(body): Json<BulkBody>,
) -> Result<impl IntoResponse, ApiError> {
    let mut results = Vec::new();
    for id in &body.action_ids {
        let result = match body.decision.as_str() {
            "approve" => control::approve(&rt.store, &rt.observer, id)
                .map(|o| serde_json::to_value(o).unwrap_or_default()),
            "dismiss" => control::dismiss(&rt.store, &rt.observer, id, body.reason.as_deref())
                .map(|o| serde_json::to_value(o).unwrap_or_default()),
            other => return Err(bad_request(format!("unknown decision: {other}"))),
        };
        match result {
            Ok(value) => results.push(serde_json::json!({ "id": id, "result": value })),
            Err(err) => results.push(serde_json::json!({ "id": id, "error": err.to_string() })),
        }
    }
    rt.cache.invalidate();
    Ok(Json(results))
}

// ── Bubbles ──────────────────────────────────────────────────────────────────

async fn list_bubbles(State(rt): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let bubbles = rt.store.list_bubbles().map_err(internal)?;
    Ok(Json(bubbles))
}

#[derive(Deserialize)]
struct CreateBubbleBody {
    name: String,
    description: Option<String>,
}

async fn create_bubble(
    State(rt): State<AppState>,
    Json(body): Json<CreateBubbleBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.name.trim().is_empty() {
        return Err(bad_request("name must not be empty"));
    }
    let bubble = rt
        .store
        .create_bubble(&body.name, body.description)
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(bubble)))
}

async fn get_bubble(
    State(rt): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match rt.store.get_bubble(&id).map_err(internal)? {
        Some(bubble) => Ok(Json(bubble)),
        None => Err(not_found("bubble", &id)),
    }
}

#[derive(Deserialize)]
struct UpdateBubbleBody {
    name: Option<String>,
    description: Option<String>,
}

async fn update_bubble(
    State(rt): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateBubbleBody>,
) -> Result<impl IntoResponse, ApiError> {
    match rt
        .store
        .update_bubble(&id, body.name, body.description)
        .map_err(internal)?
    {
        Some(bubble) => Ok(Json(bubble)),
        None => Err(not_found("bubble", &id)),
    }
}

#[derive(Deserialize)]
struct CascadeQuery {
    cascade: Option<bool>,
}

async fn delete_bubble(
    State(rt): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<CascadeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if rt
        .store
        .delete_bubble(&id, query.cascade.unwrap_or(false))
        .map_err(internal)?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("bubble", &id))
    }
}

async fn bubble_contexts(
    State(rt): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if rt.store.get_bubble(&id).map_err(internal)?.is_none() {
        return Err(not_found("bubble", &id));
    }
    let entries = rt.store.entries_in_bubble(&id).map_err(internal)?;
    Ok(Json(entries))
}
