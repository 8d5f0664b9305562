//! The four run stages: prepare, ingest, score and persist, export.
//!
//! Each stage is a separate method so the orchestrator can publish progress
//! between them. Per-listing problems (invalid data, constraint violations)
//! only move counters; store and ingestion unavailability abort the run.
//!
//! Within a batch every property gets exactly one analysis, computed from the
//! state it is left in after all of its observations are upserted.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use estate_adapters::{IngestionBatch, IngestionError, ListingSource, QueryPlan};
use estate_core::{
    score_listing, Analysis, Assessment, Fingerprint, HistoryMode, Listing, MarketReference, ScoringParams,
    ScrapeSession, SessionCounters,
};
use estate_storage::{HistoricalStore, StoreError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::commentary::{CommentaryProvider, CommentaryRequest, NoCommentary};
use crate::config::QueryPool;
use crate::dataset::{load_session_dataset, SessionDataset};
use crate::export::{ExportError, ExportReceipt, Exporter, NoopExporter};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Ingestion(#[from] IngestionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Pipeline {
    store: Arc<dyn HistoricalStore>,
    source: Arc<dyn ListingSource>,
    market: Arc<MarketReference>,
    params: Arc<ScoringParams>,
    queries: QueryPool,
    history_mode: HistoryMode,
    exporter: Arc<dyn Exporter>,
    commentary: Arc<dyn CommentaryProvider>,
    commentary_top_n: usize,
}

/// A property's final state in this batch, scored but not yet recorded.
struct Scored {
    fingerprint: Fingerprint,
    listing: Listing,
    assessment: Assessment,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn HistoricalStore>,
        source: Arc<dyn ListingSource>,
        market: Arc<MarketReference>,
        params: Arc<ScoringParams>,
    ) -> Self {
        Self {
            store,
            source,
            market,
            params,
            queries: QueryPool::default(),
            history_mode: HistoryMode::Cumulative,
            exporter: Arc::new(NoopExporter),
            commentary: Arc::new(NoCommentary),
            commentary_top_n: 0,
        }
    }

    pub fn with_query_pool(mut self, queries: QueryPool) -> Self {
        self.queries = queries;
        self
    }

    pub fn with_history_mode(mut self, mode: HistoryMode) -> Self {
        self.history_mode = mode;
        self
    }

    pub fn with_exporter(mut self, exporter: Arc<dyn Exporter>) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn with_commentary(mut self, provider: Arc<dyn CommentaryProvider>, top_n: usize) -> Self {
        self.commentary = provider;
        self.commentary_top_n = top_n;
        self
    }

    pub fn store(&self) -> &Arc<dyn HistoricalStore> {
        &self.store
    }

    pub fn market(&self) -> &MarketReference {
        &self.market
    }

    pub async fn prepare(&self) -> Result<(), PipelineError> {
        self.store.prepare(self.history_mode).await?;
        Ok(())
    }

    /// Fetches listings, then opens the session the batch will be recorded under.
    pub async fn ingest(&self) -> Result<(ScrapeSession, IngestionBatch), PipelineError> {
        let plan = QueryPlan::randomized(&self.queries.queries, self.queries.take, self.queries.results_per_query);
        debug!(queries = ?plan.queries, "query plan");

        let batch = self.source.fetch_listings(&plan).await?;
        info!(
            source_id = %batch.source_id,
            mode = batch.mode.as_str(),
            listings = batch.listings.len(),
            "ingested listings"
        );

        let session = self
            .store
            .begin_session(&batch.source_id, batch.mode, Utc::now())
            .await?;
        Ok((session, batch))
    }

    /// Upserts every observation, then scores each property once from its stored state.
    ///
    /// Observations sharing a fingerprint are applied in batch order, so a re-listing
    /// still lands in price history, and the analysis matches the price the property ends on.
    pub async fn score_and_persist(
        &self,
        session: ScrapeSession,
        batch: IngestionBatch,
    ) -> Result<SessionDataset, PipelineError> {
        let mut counters = SessionCounters {
            raw_seen: u32::try_from(batch.listings.len()).unwrap_or(u32::MAX),
            ..SessionCounters::default()
        };

        let mut groups: Vec<Vec<Listing>> = Vec::new();
        let mut group_of: HashMap<Fingerprint, usize> = HashMap::new();
        for draft in &batch.listings {
            match draft.validate() {
                Ok(listing) => {
                    let next = groups.len();
                    let index = *group_of.entry(listing.fingerprint()).or_insert(next);
                    if index == next {
                        groups.push(Vec::new());
                    }
                    groups[index].push(listing);
                }
                Err(err) => {
                    debug!(error = %err, "skipping listing");
                    counters.skipped += 1;
                }
            }
        }

        let mut scored = Vec::with_capacity(groups.len());
        for observations in groups {
            let mut current = None;
            for listing in &observations {
                match self.store.upsert(listing, session.id, Utc::now()).await {
                    Ok(outcome) => {
                        if outcome.is_new {
                            counters.created += 1;
                        } else {
                            counters.updated += 1;
                        }
                        current = Some(outcome.property);
                    }
                    Err(err) if err.is_constraint() => {
                        warn!(error = %err, title = %listing.title, "listing rejected by store");
                        counters.rejected += 1;
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            if let Some(property) = current {
                let listing = property.as_listing(&batch.source_id);
                let assessment = score_listing(&listing, &self.market, &self.params);
                scored.push(Scored {
                    fingerprint: property.fingerprint,
                    listing,
                    assessment,
                });
            }
        }

        // Commentary is part of the analysis row, so analyses are written once it is known.
        // A store failure from here on leaves the session uncompleted and out of every dataset.
        let mut commentary = self.commentary_for(&scored).await;

        for item in scored {
            let analysis = Analysis {
                commentary: commentary.remove(&item.fingerprint),
                fingerprint: item.fingerprint,
                session_id: session.id,
                assessment: item.assessment,
                analyzed_at: Utc::now(),
            };
            match self.store.record_analysis(&analysis).await {
                Ok(()) => {}
                Err(err) if err.is_constraint() => {
                    warn!(error = %err, "analysis rejected by store");
                    counters.rejected += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let session = self
            .store
            .complete_session(session.id, counters, Utc::now())
            .await?;
        info!(
            session_id = %session.id,
            raw_seen = counters.raw_seen,
            created = counters.created,
            updated = counters.updated,
            skipped = counters.skipped,
            rejected = counters.rejected,
            "session completed"
        );

        Ok(load_session_dataset(self.store.as_ref(), session, &self.market).await?)
    }

    /// Commentary for the best-scored undervalued listings; provider failures leave it empty.
    async fn commentary_for(&self, scored: &[Scored]) -> HashMap<Fingerprint, String> {
        if self.commentary_top_n == 0 {
            return Default::default();
        }

        let mut candidates: Vec<&Scored> = scored.iter().filter(|s| s.assessment.undervalued).collect();
        candidates.sort_by(|a, b| b.assessment.score.total_cmp(&a.assessment.score));

        let requests: Vec<CommentaryRequest> = candidates
            .into_iter()
            .take(self.commentary_top_n)
            .map(|s| CommentaryRequest {
                fingerprint: s.fingerprint.clone(),
                title: s.listing.title.clone(),
                area: s.listing.area.clone(),
                price: s.listing.price,
                size_m2: s.listing.size_m2,
                energy_rating: s.listing.energy_rating,
                assessment: s.assessment.clone(),
            })
            .collect();

        if requests.is_empty() {
            return Default::default();
        }

        match self.commentary.explain(&requests).await {
            Ok(map) => {
                debug!(requested = requests.len(), received = map.len(), "commentary generated");
                map
            }
            Err(err) => {
                warn!(error = %err, "commentary unavailable; continuing without it");
                Default::default()
            }
        }
    }

    pub async fn export(&self, dataset: &SessionDataset) -> Result<ExportReceipt, ExportError> {
        self.exporter.publish(dataset).await
    }
}
