use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use estate_core::{aggregate, AnalyzedProperty, MarketOverview, MarketReference, ScrapeSession, SessionStats};
use estate_storage::{HistoricalStore, StoreError};
use serde::{Deserialize, Serialize};

/// Finalized output of one session: ranked analyzed properties plus market overview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDataset {
    pub session: ScrapeSession,
    pub market: String,
    pub overview: MarketOverview,
    /// Best score first.
    pub properties: Vec<AnalyzedProperty>,
    /// Store-wide session history at the time the dataset was built.
    #[serde(default)]
    pub tracking: SessionStats,
    pub generated_at: DateTime<Utc>,
}

impl SessionDataset {
    pub fn new(session: ScrapeSession, market: &MarketReference, mut properties: Vec<AnalyzedProperty>) -> Self {
        properties.sort_by(rank);
        let overview = aggregate(&properties, market, session.counters.created);
        Self {
            session,
            market: market.name.clone(),
            overview,
            properties,
            tracking: SessionStats::default(),
            generated_at: Utc::now(),
        }
    }

    pub fn with_tracking(mut self, tracking: SessionStats) -> Self {
        self.tracking = tracking;
        self
    }

    pub fn undervalued(&self) -> impl Iterator<Item = &AnalyzedProperty> {
        self.properties.iter().filter(|p| p.analysis.assessment.undervalued)
    }
}

fn rank(a: &AnalyzedProperty, b: &AnalyzedProperty) -> Ordering {
    let (x, y) = (&a.analysis.assessment, &b.analysis.assessment);
    y.score
        .total_cmp(&x.score)
        .then(x.price_vs_market_pct.total_cmp(&y.price_vs_market_pct))
        .then_with(|| a.property.fingerprint.cmp(&b.property.fingerprint))
}

/// Joins the properties last seen in `session` with their analyses from that session.
pub async fn load_session_dataset(
    store: &dyn HistoricalStore,
    session: ScrapeSession,
    market: &MarketReference,
) -> Result<SessionDataset, StoreError> {
    let mut analyses = store.latest_analyses_for_session(session.id).await?;
    let rows = store
        .properties_seen_in_session(session.id)
        .await?
        .into_iter()
        .filter_map(|property| {
            analyses
                .remove(&property.fingerprint)
                .map(|analysis| AnalyzedProperty { property, analysis })
        })
        .collect();
    let tracking = store.session_stats().await?;
    Ok(SessionDataset::new(session, market, rows).with_tracking(tracking))
}

/// Dataset of the most recent completed session, if any.
pub async fn load_latest_dataset(
    store: &dyn HistoricalStore,
    market: &MarketReference,
) -> Result<Option<SessionDataset>, StoreError> {
    match store.latest_completed_session().await? {
        Some(session) => load_session_dataset(store, session, market).await.map(Some),
        None => Ok(None),
    }
}
