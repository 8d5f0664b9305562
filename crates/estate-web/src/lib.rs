//! Axum + Askama dashboard and JSON API over the run orchestrator and the historical store.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use estate_core::{Analysis, AnalyzedProperty, Fingerprint, MarketReference, PriceHistoryEntry, Property};
use estate_storage::{HistoricalStore, StoreError};
use estate_sync::{
    build_scheduler, load_latest_dataset, ResetOutcome, RunOrchestrator, RunStatus, SessionDataset,
    SyncRuntime, Trigger,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "estate-web";

const DEFAULT_SESSIONS_LIMIT: usize = 20;
const MAX_SESSIONS_LIMIT: usize = 200;
const DASHBOARD_ROWS: usize = 25;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: RunOrchestrator,
    pub store: Arc<dyn HistoricalStore>,
    pub market: Arc<MarketReference>,
    /// Where the exporter writes `<session_id>/report.txt`; no downloads without it.
    pub reports_dir: Option<PathBuf>,
}

impl AppState {
    pub fn new(orchestrator: RunOrchestrator, store: Arc<dyn HistoricalStore>, market: Arc<MarketReference>) -> Self {
        Self {
            orchestrator,
            store,
            market,
            reports_dir: None,
        }
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    pub fn from_runtime(runtime: &SyncRuntime) -> Self {
        Self::new(
            runtime.orchestrator.clone(),
            runtime.store.clone(),
            runtime.market.clone(),
        )
        .with_reports_dir(runtime.config.reports_dir.clone())
    }
}

#[derive(Debug, Deserialize, Default)]
struct SessionsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct PropertyHistory {
    pub property: Property,
    pub price_history: Vec<PriceHistoryEntry>,
    pub analyses: Vec<Analysis>,
}

#[derive(Debug, Clone)]
struct PropertyRow {
    fingerprint: String,
    title: String,
    area: String,
    price: String,
    price_m2: String,
    vs_market: String,
    score: String,
    verdict: &'static str,
    energy: &'static str,
    undervalued: bool,
    commentary: String,
}

impl From<&AnalyzedProperty> for PropertyRow {
    fn from(row: &AnalyzedProperty) -> Self {
        let a = &row.analysis.assessment;
        Self {
            fingerprint: row.property.fingerprint.to_string(),
            title: row.property.title.clone(),
            area: row.property.area.clone(),
            price: format!("{:.0}", row.property.price),
            price_m2: format!("{:.0}", a.price_m2),
            vs_market: format!("{:+.1}%", a.price_vs_market_pct),
            score: format!("{:.1}", a.score),
            verdict: a.verdict().as_str(),
            energy: row.property.energy_rating.map_or("?", |r| r.as_str()),
            undervalued: a.undervalued,
            commentary: row.analysis.commentary.clone().unwrap_or_default(),
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    market: String,
    state: String,
    stage_label: String,
    error_message: String,
    session_id: String,
    total: usize,
    undervalued: usize,
    buy: usize,
    hold: usize,
    avoid: usize,
    rows: Vec<PropertyRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/status", get(status_handler))
        .route("/api/run", post(run_handler))
        .route("/api/reset", post(reset_handler))
        .route("/api/data", get(data_handler))
        .route("/api/sessions", get(sessions_handler))
        .route("/api/report/download", get(report_download_handler))
        .route("/api/properties/{fingerprint}/history", get(history_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web surface listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Builds the runtime from the environment, starts the scheduler when enabled, then serves.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let runtime = SyncRuntime::from_env().await?;
    let scheduler = build_scheduler(&runtime.config, runtime.orchestrator.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(
            cron_1 = %runtime.config.sync_cron_1,
            cron_2 = %runtime.config.sync_cron_2,
            "scheduler started"
        );
    }
    let port = runtime.config.web_port;
    serve(AppState::from_runtime(&runtime), port).await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let status = state.orchestrator.status();
    match load_latest_dataset(state.store.as_ref(), &state.market).await {
        Ok(dataset) => render_html(index_template(&state.market, &status, dataset.as_ref())),
        Err(err) => server_error(err.into()),
    }
}

fn index_template(market: &MarketReference, status: &RunStatus, dataset: Option<&SessionDataset>) -> IndexTemplate {
    let summary = dataset.map(|d| &d.overview.summary);
    IndexTemplate {
        market: market.name.clone(),
        state: status.state.as_str().to_string(),
        stage_label: status.stage_label.clone().unwrap_or_default(),
        error_message: status.error_message.clone().unwrap_or_default(),
        session_id: dataset.map(|d| d.session.id.to_string()).unwrap_or_else(|| "n/a".into()),
        total: summary.map_or(0, |s| s.total),
        undervalued: summary.map_or(0, |s| s.undervalued),
        buy: summary.map_or(0, |s| s.verdicts.buy),
        hold: summary.map_or(0, |s| s.verdicts.hold),
        avoid: summary.map_or(0, |s| s.verdicts.avoid),
        rows: dataset
            .map(|d| d.properties.iter().take(DASHBOARD_ROWS).map(PropertyRow::from).collect())
            .unwrap_or_default(),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<RunStatus> {
    Json(state.orchestrator.status())
}

async fn run_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.trigger() {
        Trigger::Started(status) => (StatusCode::ACCEPTED, Json(status)).into_response(),
        Trigger::Rejected(status) => (StatusCode::CONFLICT, Json(status)).into_response(),
    }
}

async fn reset_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.reset() {
        ResetOutcome::Reset(status) | ResetOutcome::AlreadyIdle(status) => {
            (StatusCode::OK, Json(status)).into_response()
        }
        ResetOutcome::Rejected(status) => (StatusCode::CONFLICT, Json(status)).into_response(),
    }
}

/// Latest completed session, or `null` before the first run completes.
async fn data_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_latest_dataset(state.store.as_ref(), &state.market).await {
        Ok(dataset) => Json(dataset).into_response(),
        Err(err) => store_error(err),
    }
}

async fn sessions_handler(State(state): State<Arc<AppState>>, Query(query): Query<SessionsQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_SESSIONS_LIMIT).clamp(1, MAX_SESSIONS_LIMIT);
    match state.store.sessions(limit).await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(err) => store_error(err),
    }
}

async fn history_handler(State(state): State<Arc<AppState>>, AxumPath(fingerprint): AxumPath<String>) -> Response {
    let fingerprint = Fingerprint::new(fingerprint);
    let property = match state.store.property(&fingerprint).await {
        Ok(Some(property)) => property,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, format!("unknown property {fingerprint}")),
        Err(err) => return store_error(err),
    };
    let price_history = match state.store.history(&fingerprint).await {
        Ok(entries) => entries,
        Err(err) => return store_error(err),
    };
    let analyses = match state.store.analysis_trend(&fingerprint).await {
        Ok(analyses) => analyses,
        Err(err) => return store_error(err),
    };
    Json(PropertyHistory {
        property,
        price_history,
        analyses,
    })
    .into_response()
}

/// Text report of the latest completed session, as an attachment.
async fn report_download_handler(State(state): State<Arc<AppState>>) -> Response {
    let no_report = || json_error(StatusCode::NOT_FOUND, "No report available".to_string());

    let session = match state.store.latest_completed_session().await {
        Ok(Some(session)) => session,
        Ok(None) => return no_report(),
        Err(err) => return store_error(err),
    };
    let Some(reports_dir) = &state.reports_dir else {
        return no_report();
    };

    let path = reports_dir.join(session.id.to_string()).join("report.txt");
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"estate-report-{}.txt\"", session.id),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(err) if err.kind() == ErrorKind::NotFound => no_report(),
        Err(err) => server_error(anyhow::Error::new(err).context(format!("reading {}", path.display()))),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

fn json_error(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn store_error(err: StoreError) -> Response {
    warn!(error = %err, "store query failed");
    let status = if err.is_constraint() {
        StatusCode::CONFLICT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_error(status, err.to_string())
}
