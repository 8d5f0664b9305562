//! Run orchestration for the estate analyzer: configuration, the staged
//! pipeline, reports and scheduling.

pub mod commentary;
pub mod config;
pub mod dataset;
pub mod export;
pub mod orchestrator;
pub mod pipeline;
pub mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use estate_adapters::{
    FallbackSource, FixtureSource, HttpClientConfig, HttpFetcher, ListingSource, SearchApiConfig,
    SearchApiSource,
};
use estate_core::MarketReference;
use estate_storage::SqliteStore;
use tracing::info;

pub use commentary::{CommentaryError, CommentaryProvider, CommentaryRequest, NoCommentary, RuleCommentary};
pub use config::{
    load_market_reference, load_query_pool, load_scoring_params, CommentaryKind, ConfigError, QueryPool,
    SyncConfig,
};
pub use dataset::{load_latest_dataset, load_session_dataset, SessionDataset};
pub use export::{ExportError, ExportReceipt, Exporter, NoopExporter, ReportExporter};
pub use orchestrator::{
    FailureReason, ResetOutcome, RunOrchestrator, RunState, RunStatus, RunSummary, Stage, StagePhase, Trigger,
};
pub use pipeline::{Pipeline, PipelineError};
pub use scheduler::build_scheduler;

pub const CRATE_NAME: &str = "estate-sync";

/// Market whose reference table is loaded from `market/<name>.yaml`.
pub const DEFAULT_MARKET: &str = "lyon";
/// Fixture directory used when no live source is configured or it fails.
pub const DEMO_SOURCE_ID: &str = "demo";

/// Everything a binary needs to run the analyzer, assembled from [`SyncConfig`].
pub struct SyncRuntime {
    pub config: SyncConfig,
    pub store: Arc<SqliteStore>,
    pub market: Arc<MarketReference>,
    pub orchestrator: RunOrchestrator,
}

impl SyncRuntime {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let root = config.workspace_root.clone();
        let market = Arc::new(load_market_reference(&root, DEFAULT_MARKET)?);
        let params = Arc::new(load_scoring_params(&root)?);
        let queries = load_query_pool(&root)?;

        let store = SqliteStore::connect(&config.database_url)
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;
        let store = Arc::new(store);

        let live: Option<Box<dyn ListingSource>> = match &config.serpapi_key {
            Some(key) => {
                let fetcher = HttpFetcher::new(HttpClientConfig {
                    timeout: Duration::from_secs(config.http_timeout_secs),
                    user_agent: Some(config.user_agent.clone()),
                    ..Default::default()
                })?;
                Some(Box::new(SearchApiSource::new(
                    SearchApiConfig::serpapi(key.clone()),
                    fetcher,
                    market.clone(),
                )))
            }
            None => None,
        };
        let demo = FixtureSource::from_workspace(&root, DEMO_SOURCE_ID);
        let source = FallbackSource::new(live, Box::new(demo));

        let commentary: Arc<dyn CommentaryProvider> = match config.commentary {
            CommentaryKind::None => Arc::new(NoCommentary),
            CommentaryKind::Rules => Arc::new(RuleCommentary::new((*params).clone())),
        };

        let pipeline = Pipeline::new(store.clone(), Arc::new(source), market.clone(), params)
            .with_query_pool(queries)
            .with_history_mode(config.history_mode)
            .with_exporter(Arc::new(ReportExporter::new(config.reports_dir.clone())))
            .with_commentary(commentary, config.commentary_top_n);

        info!(
            database_url = %config.database_url,
            history_mode = config.history_mode.as_str(),
            live_source = config.serpapi_key.is_some(),
            commentary = ?config.commentary,
            "sync runtime ready"
        );

        Ok(Self {
            config,
            store,
            market,
            orchestrator: RunOrchestrator::new(pipeline),
        })
    }

    pub async fn from_env() -> Result<Self> {
        let config = SyncConfig::from_env()?;
        Self::from_config(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;

    use estate_storage::HistoricalStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn demo_runtime_runs_end_to_end_and_writes_reports() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..").canonicalize().unwrap();
        let dir = tempdir().unwrap();
        let db = dir.path().join("estate.db");
        let reports = dir.path().join("reports");
        let vars: HashMap<&str, String> = HashMap::from([
            ("DATABASE_URL", format!("sqlite://{}", db.display())),
            ("REPORTS_DIR", reports.display().to_string()),
            ("ESTATE_WORKSPACE_ROOT", root.display().to_string()),
            ("ESTATE_COMMENTARY", "rules".to_string()),
        ]);
        let config = SyncConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();

        let runtime = SyncRuntime::from_config(config).await.expect("runtime");
        let status = runtime.orchestrator.run_inline().await.status().clone();
        assert_eq!(status.state, RunState::Done, "{status:?}");

        let summary = status.summary.unwrap();
        let receipt = summary.export.expect("reports exported");
        assert!(Path::new(&receipt.directory).join("report.txt").exists());
        assert!(reports.join(summary.session_id.to_string()).join("snapshots/manifest.json").exists());

        let sessions = runtime.store.sessions(5).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].source_id, DEMO_SOURCE_ID);

        let dataset = load_latest_dataset(runtime.store.as_ref(), &runtime.market).await.unwrap().unwrap();
        assert!(dataset.properties.iter().any(|p| p.analysis.commentary.is_some()));
    }
}
