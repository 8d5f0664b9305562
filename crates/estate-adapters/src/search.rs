//! Live ingestion through a SerpAPI-style web search endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use estate_core::{ListingDraft, MarketReference, SessionMode};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::http::HttpFetcher;
use crate::parse::{clip, parse_area, parse_energy_rating, parse_price, parse_rooms, parse_size};
use crate::{IngestionBatch, IngestionError, ListingSource, QueryPlan};

pub const SERPAPI_ENDPOINT: &str = "https://serpapi.com/search.json";

const TITLE_MAX_CHARS: usize = 120;
const DESCRIPTION_MAX_CHARS: usize = 300;

#[derive(Debug, Clone)]
pub struct SearchApiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub engine: String,
    pub language: String,
    pub country: String,
}

impl SearchApiConfig {
    pub fn serpapi(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: SERPAPI_ENDPOINT.to_string(),
            api_key: api_key.into(),
            engine: "google".to_string(),
            language: "fr".to_string(),
            country: "fr".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    organic_results: Vec<OrganicResult>,
}

#[derive(Debug, Default, Deserialize)]
struct OrganicResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    link: Option<String>,
}

pub struct SearchApiSource {
    config: SearchApiConfig,
    fetcher: HttpFetcher,
    market: Arc<MarketReference>,
}

impl SearchApiSource {
    pub const SOURCE_ID: &'static str = "serpapi";

    pub fn new(config: SearchApiConfig, fetcher: HttpFetcher, market: Arc<MarketReference>) -> Self {
        Self {
            config,
            fetcher,
            market,
        }
    }
}

#[async_trait]
impl ListingSource for SearchApiSource {
    fn source_id(&self) -> &str {
        Self::SOURCE_ID
    }

    fn mode(&self) -> SessionMode {
        SessionMode::Live
    }

    async fn fetch_listings(&self, plan: &QueryPlan) -> Result<IngestionBatch, IngestionError> {
        let per_query = plan.results_per_query.to_string();
        let mut listings = Vec::new();
        let mut failures = 0usize;
        let mut last_failure = None;

        for query in &plan.queries {
            let params = [
                ("engine", self.config.engine.as_str()),
                ("q", query.as_str()),
                ("api_key", self.config.api_key.as_str()),
                ("num", per_query.as_str()),
                ("hl", self.config.language.as_str()),
                ("gl", self.config.country.as_str()),
            ];
            let response: SearchResponse = match self
                .fetcher
                .get_json(Self::SOURCE_ID, &self.config.endpoint, &params)
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    warn!(query, error = %err, "search query failed");
                    failures += 1;
                    last_failure = Some(err.to_string());
                    continue;
                }
            };

            let fetched_at = Utc::now();
            let before = listings.len();
            listings.extend(
                response
                    .organic_results
                    .iter()
                    .filter_map(|result| draft_from_result(result, &self.market, fetched_at)),
            );
            debug!(
                query,
                results = response.organic_results.len(),
                kept = listings.len() - before,
                "search query parsed"
            );
        }

        if !plan.queries.is_empty() && failures == plan.queries.len() {
            return Err(IngestionError::Unavailable {
                source_id: Self::SOURCE_ID.to_string(),
                reason: last_failure.unwrap_or_else(|| "every query failed".to_string()),
            });
        }

        info!(queries = plan.queries.len(), failures, listings = listings.len(), "live ingestion finished");
        Ok(IngestionBatch {
            source_id: Self::SOURCE_ID.to_string(),
            mode: SessionMode::Live,
            listings,
        })
    }
}

/// Turns one search hit into a draft; hits that cannot be placed in a known area are dropped.
fn draft_from_result(
    result: &OrganicResult,
    market: &MarketReference,
    fetched_at: DateTime<Utc>,
) -> Option<ListingDraft> {
    let snippet = result.snippet.as_deref().unwrap_or_default();
    let combined = format!("{} {}", result.title, snippet);

    let parsed = parse_area(&combined)?;
    let area = market.canonical_area(&parsed).map(str::to_string).unwrap_or(parsed);
    let mut price = parse_price(&combined);
    let mut size_m2 = parse_size(&combined);

    let avg_price_m2 = market.benchmark(&area).avg_price_m2;
    match (price, size_m2) {
        (None, Some(size)) => price = Some((size * avg_price_m2).round()),
        (Some(p), None) => size_m2 = Some((p / avg_price_m2 * 10.0).round() / 10.0),
        _ => {}
    }

    Some(ListingDraft {
        source_id: SearchApiSource::SOURCE_ID.to_string(),
        external_id: result.link.clone(),
        title: clip(&result.title, TITLE_MAX_CHARS),
        price,
        size_m2,
        area: Some(area),
        rooms: parse_rooms(&combined),
        energy_rating: parse_energy_rating(&combined),
        description: Some(clip(snippet, DESCRIPTION_MAX_CHARS)).filter(|s| !s.is_empty()),
        url: result.link.clone(),
        fetched_at,
    })
}
