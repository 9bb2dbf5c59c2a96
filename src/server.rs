//! Server entry points and shared runtime state.
//!
//! [`Runtime`] wires the store, observer, analyzer, and self-model cache
//! together; [`serve_stdio`] exposes it over MCP and [`serve_http`] over
//! REST. Only the HTTP side runs the background improvement ticker.

use anyhow::Result;
use rmcp::ServiceExt;
use std::sync::Arc;
use std::time::Duration;

use crate::analyzer::{AnalysisSource, Analyzer};
use crate::config::SpeculaConfig;
use crate::improver::{self, TickContext, TickOutcome};
use crate::model::{self, ModelCache, SelfModel};
use crate::observer::Observer;
use crate::schema::{self, SchemaCatalog};
use crate::store::ContextStore;
use crate::tools::SpeculaTools;

/// Shared in-process state: every transport and the ticker operate on one of
/// these.
pub struct Runtime {
    pub config: SpeculaConfig,
    pub store: ContextStore,
    pub observer: Arc<Observer>,
    pub analyzer: Analyzer,
    pub cache: ModelCache,
}

impl Runtime {
    pub fn new(config: SpeculaConfig) -> Result<Self> {
        let observer = Arc::new(Observer::open(config.resolved_awareness_path()));
        let store = ContextStore::open(config.resolved_store_path(), Some(Arc::clone(&observer)))?;
        let analyzer = Analyzer::new(&config.lm);
        let cache = ModelCache::new(Duration::from_millis(config.improver.deep_cache_ttl_ms));
        Ok(Self {
            config,
            store,
            observer,
            analyzer,
            cache,
        })
    }

    /// The schema catalog is reloaded on each use so user edits through the
    /// REST surface (or the editor) take effect without a restart.
    pub fn load_catalog(&self) -> Option<SchemaCatalog> {
        schema::load_catalog(self.config.resolved_schema_path())
    }

    /// Deterministic self-model, cached for 60 seconds.
    pub fn self_model(&self) -> Result<SelfModel> {
        if let Some(cached) = self.cache.get_deterministic() {
            return Ok(cached);
        }
        let (entries, bubbles) = self.store.snapshot()?;
        let catalog = self.load_catalog();
        let state = self.observer.load_state()?;
        let built = model::build(&entries, &bubbles, catalog.as_ref(), Some(&state));
        self.cache.put_deterministic(&built);
        Ok(built)
    }

    /// Analyzer-enriched self-model: the deterministic model with the
    /// contradiction list replaced by LM-verified findings when the LM is
    /// reachable. Falls back to the deterministic model otherwise.
    pub async fn self_model_deep(&self) -> Result<SelfModel> {
        if let Some(cached) = self.cache.get_deep() {
            return Ok(cached);
        }
        let mut built = self.self_model()?;
        let (entries, _) = self.store.snapshot()?;
        let (source, contradictions) = self.analyzer.detect_contradictions(&entries).await;
        if source == AnalysisSource::Lm {
            built.contradictions = contradictions;
        }
        self.cache.put_deep(&built);
        Ok(built)
    }

    /// Run one improvement tick and invalidate the model cache.
    pub async fn run_tick(&self) -> TickOutcome {
        let catalog = self.load_catalog();
        let outcome = improver::tick(TickContext {
            store: &self.store,
            catalog: catalog.as_ref(),
            observer: &self.observer,
            analyzer: Some(&self.analyzer),
            approvals: &self.config.approvals,
            pending_ttl: Duration::from_millis(self.config.improver.pending_ttl_ms),
            budget: Duration::from_millis(self.config.improver.tick_budget_ms),
        })
        .await;
        self.cache.invalidate();
        outcome
    }
}

/// Start the MCP server over stdio transport. No background work runs here;
/// a separately running HTTP process's improvements show up as file state.
pub async fn serve_stdio(config: SpeculaConfig) -> Result<()> {
    tracing::info!("starting specula MCP server on stdio");

    let runtime = Arc::new(Runtime::new(config)?);
    let tools = SpeculaTools::new(runtime);
    let transport = rmcp::transport::stdio();

    let server = tools.serve(transport).await?;
    tracing::info!("MCP server running — waiting for client");

    server.waiting().await?;
    tracing::info!("MCP server shut down");

    Ok(())
}

/// Start the REST server with the background improvement ticker. On
/// SIGTERM/SIGINT the ticker is cancelled and given up to five seconds to
/// drain an in-flight tick.
pub async fn serve_http(config: SpeculaConfig) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let tick_enabled = config.improver.tick_enabled;
    let tick_interval = Duration::from_millis(config.improver.tick_interval_ms.max(1_000));

    let runtime = Arc::new(Runtime::new(config)?);
    match runtime.store.stats() {
        Ok(stats) => tracing::info!(
            entries = stats.total_entries,
            bubbles = stats.bubbles,
            "store loaded"
        ),
        Err(err) => tracing::warn!(%err, "could not read store stats at startup"),
    }

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    let ticker = tick_enabled.then(|| {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the first interval tick fires immediately; skip it so startup
            // is not shadowed by an improvement pass
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let outcome = runtime.run_tick().await;
                        if !outcome.errors.is_empty() {
                            tracing::warn!(errors = ?outcome.errors, "tick finished with errors");
                        }
                    }
                    _ = stop_rx.changed() => {
                        tracing::info!("ticker stopped");
                        break;
                    }
                }
            }
        })
    });

    let app = crate::http::router(Arc::clone(&runtime));
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "REST server listening at http://{bind_addr}/api");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // stop the ticker and drain any in-flight tick
    let _ = stop_tx.send(true);
    if let Some(handle) = ticker {
        if tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .is_err()
        {
            tracing::warn!("ticker did not drain within 5s, abandoning in-flight work");
        }
    }
    tracing::info!("REST server shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl-c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
