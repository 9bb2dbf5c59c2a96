//! Self-aware context runtime for AI agents.
//!
//! specula persists small structured notes ("context entries") on behalf of
//! AI agents and, over time, observes its own contents and usage to propose
//! and apply improvements. Agents talk to it over MCP (stdio) or REST; the
//! browser UI consumes the same REST API.
//!
//! # Architecture
//!
//! - **Storage**: two JSON files — the context store and the awareness blob —
//!   rewritten atomically (temp file + rename) under per-file locks
//! - **Self-model**: deterministic identity/coverage/freshness/gap/
//!   contradiction analysis, optionally enriched by a local LM endpoint
//!   (Ollama-compatible), always with a deterministic fallback
//! - **Self-improvement**: a periodic tick proposes tagging, merging,
//!   archiving, promotion, gap stubs, contradiction resolution, and schema
//!   suggestions; a risk-gated control plane auto-executes the safe ones and
//!   queues the rest for human approval
//! - **Transport**: MCP over stdio (`rmcp`) or REST (`axum`); only the HTTP
//!   process runs the background ticker
//!
//! # Modules
//!
//! - [`config`] — Configuration loading from TOML files and environment variables
//! - [`store`] — The file-backed context store: entries, bubbles, typed saves
//! - [`schema`] — The user-defined type catalog: validation and rendering
//! - [`observer`] — The awareness file: events, aggregates, journal, usefulness
//! - [`model`] — The deterministic self-model and its rendering
//! - [`analyzer`] — LM-assisted analysis with deterministic fallbacks
//! - [`improver`] — The self-improvement tick and action execution
//! - [`control`] — Risk classification, pending queue, protections
//! - [`server`] — Runtime assembly and the stdio/HTTP entry points
//! - [`http`] — The REST router
//! - [`tools`] — The MCP tool surface

pub mod analyzer;
pub mod config;
pub mod control;
pub mod http;
pub mod improver;
pub mod model;
pub mod observer;
pub mod schema;
pub mod server;
pub mod store;
pub mod tools;
