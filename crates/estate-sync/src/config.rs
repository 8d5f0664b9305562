use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use estate_core::{HistoryMode, MarketReference, ScoringParams, UnknownHistoryMode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ESTATE_HISTORY_MODE: {0}")]
    HistoryMode(#[from] UnknownHistoryMode),
    #[error("{key} must be a number, got `{value}`")]
    NotANumber { key: &'static str, value: String },
    #[error("ESTATE_COMMENTARY must be `none` or `rules`, got `{0}`")]
    Commentary(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentaryKind {
    None,
    Rules,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub history_mode: HistoryMode,
    pub reports_dir: PathBuf,
    pub serpapi_key: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub commentary: CommentaryKind,
    pub commentary_top_n: usize,
    pub web_port: u16,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset and blank values take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let workspace_root = get("ESTATE_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let history_mode = match get("ESTATE_HISTORY_MODE") {
            Some(raw) => raw.parse()?,
            None => HistoryMode::Cumulative,
        };
        let commentary = match get("ESTATE_COMMENTARY").as_deref() {
            None | Some("none") => CommentaryKind::None,
            Some("rules") => CommentaryKind::Rules,
            Some(other) => return Err(ConfigError::Commentary(other.to_string())),
        };

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or_else(|| "sqlite://estate.db".to_string()),
            history_mode,
            reports_dir: get("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("reports")),
            serpapi_key: get("SERPAPI_KEY"),
            user_agent: get("ESTATE_USER_AGENT").unwrap_or_else(|| "estate-analyzer/0.1".to_string()),
            http_timeout_secs: parse_number("ESTATE_HTTP_TIMEOUT_SECS", get("ESTATE_HTTP_TIMEOUT_SECS"), 30)?,
            scheduler_enabled: get("ESTATE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: get("SYNC_CRON_1").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            sync_cron_2: get("SYNC_CRON_2").unwrap_or_else(|| "0 0 18 * * *".to_string()),
            commentary,
            commentary_top_n: parse_number("ESTATE_COMMENTARY_TOP_N", get("ESTATE_COMMENTARY_TOP_N"), 5)?,
            web_port: parse_number("ESTATE_WEB_PORT", get("ESTATE_WEB_PORT"), 8000)?,
            workspace_root,
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::NotANumber { key, value }),
    }
}

/// Search query pool from `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueryPool {
    #[serde(default = "default_take")]
    pub take: usize,
    #[serde(default = "default_results_per_query")]
    pub results_per_query: u32,
    pub queries: Vec<String>,
}

fn default_take() -> usize {
    3
}

fn default_results_per_query() -> u32 {
    10
}

impl Default for QueryPool {
    fn default() -> Self {
        Self {
            take: default_take(),
            results_per_query: default_results_per_query(),
            queries: Vec::new(),
        }
    }
}

fn read_yaml_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn load_market_reference(workspace_root: &Path, market: &str) -> Result<MarketReference> {
    read_yaml_file(&workspace_root.join("market").join(format!("{market}.yaml")))
}

pub fn load_scoring_params(workspace_root: &Path) -> Result<ScoringParams> {
    read_yaml_file(&workspace_root.join("rules").join("scoring.yaml"))
}

pub fn load_query_pool(workspace_root: &Path) -> Result<QueryPool> {
    read_yaml_file(&workspace_root.join("sources.yaml"))
}
