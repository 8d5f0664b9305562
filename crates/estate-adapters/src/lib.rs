//! Ingestion collaborators: listing sources, fixture bundles and free-text parsing.

pub mod http;
pub mod parse;
pub mod search;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use estate_core::{EnergyRating, ListingDraft, SessionMode};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub use http::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
pub use search::{SearchApiConfig, SearchApiSource};

pub const CRATE_NAME: &str = "estate-adapters";

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("listing source `{source_id}` unavailable: {reason}")]
    Unavailable { source_id: String, reason: String },
}

/// Search queries for one ingestion pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub queries: Vec<String>,
    pub results_per_query: u32,
}

impl QueryPlan {
    pub fn new(queries: Vec<String>, results_per_query: u32) -> Self {
        Self {
            queries,
            results_per_query,
        }
    }

    /// Shuffles the pool and keeps `take` queries so consecutive runs vary their coverage.
    pub fn randomized(pool: &[String], take: usize, results_per_query: u32) -> Self {
        Self::randomized_with(pool, take, results_per_query, &mut rand::rng())
    }

    pub fn randomized_with<R: Rng + ?Sized>(
        pool: &[String],
        take: usize,
        results_per_query: u32,
        rng: &mut R,
    ) -> Self {
        let mut queries = pool.to_vec();
        queries.shuffle(rng);
        queries.truncate(take);
        Self::new(queries, results_per_query)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionBatch {
    pub source_id: String,
    pub mode: SessionMode,
    pub listings: Vec<ListingDraft>,
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &str;
    fn mode(&self) -> SessionMode;

    /// An empty batch is a valid result; only [`IngestionError::Unavailable`] means no data could be obtained.
    async fn fetch_listings(&self, plan: &QueryPlan) -> Result<IngestionBatch, IngestionError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source_id: String,
    #[serde(default)]
    pub captured_from_url: Option<String>,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub listings: Vec<FixtureListing>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureListing {
    #[serde(default)]
    pub external_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub size_m2: Option<f64>,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub rooms: Option<u32>,
    #[serde(default)]
    pub energy_rating: Option<EnergyRating>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl FixtureBundle {
    pub fn drafts(&self, fetched_at: DateTime<Utc>) -> Vec<ListingDraft> {
        self.listings
            .iter()
            .map(|l| ListingDraft {
                source_id: self.source_id.clone(),
                external_id: l.external_id.clone(),
                title: l.title.clone(),
                price: l.price,
                size_m2: l.size_m2,
                area: l.area.clone(),
                rooms: l.rooms,
                energy_rating: l.energy_rating,
                description: l.description.clone(),
                url: l.url.clone(),
                fetched_at,
            })
            .collect()
    }
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Curated demo listings read from a fixture bundle on every fetch.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    source_id: String,
    path: PathBuf,
}

impl FixtureSource {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }

    /// `fixtures/<source_id>/sample/bundle.json` under the workspace root.
    pub fn from_workspace(workspace_root: &Path, source_id: &str) -> Self {
        let path = workspace_root
            .join("fixtures")
            .join(source_id)
            .join("sample")
            .join("bundle.json");
        Self::new(source_id, path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ListingSource for FixtureSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn mode(&self) -> SessionMode {
        SessionMode::Demo
    }

    async fn fetch_listings(&self, _plan: &QueryPlan) -> Result<IngestionBatch, IngestionError> {
        let bundle = load_fixture_bundle(&self.path).map_err(|err| IngestionError::Unavailable {
            source_id: self.source_id.clone(),
            reason: format!("{err:#}"),
        })?;
        info!(
            fixture_id = %bundle.fixture_id,
            listings = bundle.listings.len(),
            "loaded demo fixture"
        );
        Ok(IngestionBatch {
            source_id: self.source_id.clone(),
            mode: SessionMode::Demo,
            listings: bundle.drafts(Utc::now()),
        })
    }
}

/// Live source first, demo fixture when it is missing, unavailable or returns nothing.
pub struct FallbackSource {
    primary: Option<Box<dyn ListingSource>>,
    fallback: Box<dyn ListingSource>,
}

impl FallbackSource {
    pub fn new(primary: Option<Box<dyn ListingSource>>, fallback: Box<dyn ListingSource>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl ListingSource for FallbackSource {
    fn source_id(&self) -> &str {
        self.primary
            .as_ref()
            .map_or_else(|| self.fallback.source_id(), |p| p.source_id())
    }

    fn mode(&self) -> SessionMode {
        self.primary
            .as_ref()
            .map_or_else(|| self.fallback.mode(), |p| p.mode())
    }

    async fn fetch_listings(&self, plan: &QueryPlan) -> Result<IngestionBatch, IngestionError> {
        let Some(primary) = &self.primary else {
            info!(source_id = self.fallback.source_id(), "no live source configured; using demo data");
            return self.fallback.fetch_listings(plan).await;
        };

        match primary.fetch_listings(plan).await {
            Ok(batch) if !batch.listings.is_empty() => Ok(batch),
            Ok(_) => {
                warn!(source_id = primary.source_id(), "live source returned nothing; using demo data");
                self.fallback.fetch_listings(plan).await
            }
            Err(err) => {
                warn!(error = %err, "live source failed; using demo data");
                self.fallback.fetch_listings(plan).await
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use estate_core::{AreaBenchmark, MarketReference};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    pub fn lyon_market() -> MarketReference {
        let bench = |avg_price_m2, rental_yield_pct| AreaBenchmark {
            avg_price_m2,
            rental_yield_pct,
            appreciation_rate: 0.02,
        };
        MarketReference::new("lyon", bench(4_300.0, 4.5))
            .with_area("Lyon 3e", bench(4_300.0, 4.5))
            .with_area("Lyon 7e", bench(4_300.0, 4.8))
            .with_area("Lyon 8e", bench(3_700.0, 5.5))
    }

    /// Serves one scripted `(status, json body)` per connection, repeating the last one.
    pub async fn scripted_server(responses: Vec<(u16, String)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            let mut served = 0usize;
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let (status, body) = responses[served.min(responses.len() - 1)].clone();
                served += 1;

                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }

                let response = format!(
                    "HTTP/1.1 {status} Scripted\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{addr}/search.json"), hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct CannedSource {
        result: fn() -> Result<IngestionBatch, IngestionError>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ListingSource for CannedSource {
        fn source_id(&self) -> &str {
            "serpapi"
        }

        fn mode(&self) -> SessionMode {
            SessionMode::Live
        }

        async fn fetch_listings(&self, _plan: &QueryPlan) -> Result<IngestionBatch, IngestionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn write_bundle(dir: &Path) -> PathBuf {
        let path = dir.join("bundle.json");
        let bundle = serde_json::json!({
            "fixture_id": "unit",
            "source_id": "demo",
            "captured_at": "2026-03-01T08:00:00Z",
            "listings": [
                {"title": "T2 Guillotière", "price": 180000.0, "size_m2": 45.0, "area": "Lyon 7e", "energy_rating": "F"},
                {"title": "Annonce sans prix", "size_m2": 30.0, "area": "Lyon 3e"}
            ]
        });
        fs::write(&path, bundle.to_string()).expect("write bundle");
        path
    }

    fn live_batch() -> Result<IngestionBatch, IngestionError> {
        let draft = ListingDraft {
            source_id: "serpapi".into(),
            external_id: None,
            title: "T3 Lyon 3e".into(),
            price: Some(260_000.0),
            size_m2: Some(65.0),
            area: Some("Lyon 3e".into()),
            rooms: Some(3),
            energy_rating: None,
            description: None,
            url: None,
            fetched_at: Utc::now(),
        };
        Ok(IngestionBatch {
            source_id: "serpapi".into(),
            mode: SessionMode::Live,
            listings: vec![draft],
        })
    }

    fn empty_batch() -> Result<IngestionBatch, IngestionError> {
        Ok(IngestionBatch {
            source_id: "serpapi".into(),
            mode: SessionMode::Live,
            listings: Vec::new(),
        })
    }

    fn unavailable() -> Result<IngestionBatch, IngestionError> {
        Err(IngestionError::Unavailable {
            source_id: "serpapi".into(),
            reason: "quota exceeded".into(),
        })
    }

    fn fallback_with(
        result: fn() -> Result<IngestionBatch, IngestionError>,
        bundle: &Path,
    ) -> (FallbackSource, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let primary = CannedSource {
            result,
            calls: calls.clone(),
        };
        let source = FallbackSource::new(Some(Box::new(primary)), Box::new(FixtureSource::new("demo", bundle)));
        (source, calls)
    }

    #[test]
    fn randomized_plan_takes_a_shuffled_subset() {
        let pool: Vec<String> = (0..6).map(|i| format!("query {i}")).collect();
        let mut rng = StdRng::seed_from_u64(7);

        let plan = QueryPlan::randomized_with(&pool, 3, 10, &mut rng);
        assert_eq!(plan.queries.len(), 3);
        assert!(plan.queries.iter().all(|q| pool.contains(q)));
        assert_eq!(plan.results_per_query, 10);

        let everything = QueryPlan::randomized(&pool, 50, 10);
        assert_eq!(everything.queries.len(), pool.len());
    }

    #[tokio::test]
    async fn fixture_source_yields_demo_drafts_unvalidated() {
        let dir = tempdir().expect("tempdir");
        let source = FixtureSource::new("demo", write_bundle(dir.path()));

        let batch = source.fetch_listings(&QueryPlan::new(vec![], 0)).await.unwrap();
        assert_eq!(batch.mode, SessionMode::Demo);
        assert_eq!(batch.listings.len(), 2);
        assert_eq!(batch.listings[0].energy_rating, Some(EnergyRating::F));
        assert!(batch.listings[1].price.is_none());
    }

    #[tokio::test]
    async fn missing_fixture_is_unavailable() {
        let dir = tempdir().expect("tempdir");
        let source = FixtureSource::new("demo", dir.path().join("absent.json"));
        let err = source.fetch_listings(&QueryPlan::new(vec![], 0)).await.unwrap_err();
        assert!(matches!(err, IngestionError::Unavailable { ref source_id, .. } if source_id == "demo"));
    }

    #[tokio::test]
    async fn fallback_prefers_a_non_empty_live_batch() {
        let dir = tempdir().expect("tempdir");
        let (source, calls) = fallback_with(live_batch, &write_bundle(dir.path()));

        let batch = source.fetch_listings(&QueryPlan::new(vec!["q".into()], 10)).await.unwrap();
        assert_eq!(batch.mode, SessionMode::Live);
        assert_eq!(batch.listings.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fallback_uses_demo_data_when_live_is_empty_or_down() {
        let dir = tempdir().expect("tempdir");
        let bundle = write_bundle(dir.path());

        let cases: [fn() -> Result<IngestionBatch, IngestionError>; 2] = [empty_batch, unavailable];
        for result in cases {
            let (source, calls) = fallback_with(result, &bundle);
            let batch = source.fetch_listings(&QueryPlan::new(vec!["q".into()], 10)).await.unwrap();
            assert_eq!(batch.mode, SessionMode::Demo);
            assert_eq!(batch.source_id, "demo");
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn fallback_without_live_source_goes_straight_to_demo() {
        let dir = tempdir().expect("tempdir");
        let source = FallbackSource::new(None, Box::new(FixtureSource::new("demo", write_bundle(dir.path()))));
        assert_eq!(source.mode(), SessionMode::Demo);
        let batch = source.fetch_listings(&QueryPlan::new(vec![], 0)).await.unwrap();
        assert_eq!(batch.mode, SessionMode::Demo);
    }

    #[test]
    fn shipped_demo_fixture_parses() {
        let source = FixtureSource::from_workspace(&workspace_root(), "demo");
        let bundle = load_fixture_bundle(source.path()).expect("demo bundle");
        assert_eq!(bundle.source_id, "demo");
        assert!(bundle.listings.len() >= 10);
        assert!(bundle
            .listings
            .iter()
            .any(|l| l.energy_rating.is_some_and(EnergyRating::needs_renovation)));
    }
}
