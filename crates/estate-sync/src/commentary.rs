//! Optional free-text commentary for the most promising listings of a run.
//!
//! Commentary is produced after scores are final and is stored alongside the
//! analysis; nothing downstream reads it back into scoring.

use std::collections::HashMap;

use async_trait::async_trait;
use estate_core::{Assessment, EnergyRating, Fingerprint, ScoringParams};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommentaryError {
    #[error("commentary provider unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommentaryRequest {
    pub fingerprint: Fingerprint,
    pub title: String,
    pub area: String,
    pub price: f64,
    pub size_m2: f64,
    pub energy_rating: Option<EnergyRating>,
    pub assessment: Assessment,
}

#[async_trait]
pub trait CommentaryProvider: Send + Sync {
    /// Returns commentary keyed by fingerprint; listings may be left out.
    async fn explain(
        &self,
        requests: &[CommentaryRequest],
    ) -> Result<HashMap<Fingerprint, String>, CommentaryError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoCommentary;

#[async_trait]
impl CommentaryProvider for NoCommentary {
    async fn explain(
        &self,
        _requests: &[CommentaryRequest],
    ) -> Result<HashMap<Fingerprint, String>, CommentaryError> {
        Ok(HashMap::new())
    }
}

/// Deterministic one-paragraph verdict built from the assessment figures.
#[derive(Debug, Clone, Default)]
pub struct RuleCommentary {
    params: ScoringParams,
}

impl RuleCommentary {
    pub fn new(params: ScoringParams) -> Self {
        Self { params }
    }

    fn paragraph(&self, request: &CommentaryRequest) -> String {
        let a = &request.assessment;
        let mut parts = vec![format!(
            "{}: {:.1}% vs the {} average of {:.0} EUR/m2, {:.1}% gross yield, {:.1}% projected 5-year return.",
            a.verdict(),
            a.price_vs_market_pct,
            request.area,
            a.market_avg_price_m2,
            a.rental_yield_pct,
            a.roi_5yr_pct
        )];

        match (request.energy_rating, a.renovation) {
            (Some(rating), Some(reno)) => {
                parts.push(format!(
                    "Key risk: DPE {rating} rating; bringing it to {} costs about {:.0} EUR.",
                    self.params.renovation_target, reno.cost
                ));
                parts.push(if reno.capital_gain > 0.0 {
                    format!(
                        "Tip: price the works into the offer, the estimated net gain after renovation is {:.0} EUR.",
                        reno.capital_gain
                    )
                } else {
                    "Tip: the renovation does not pay for itself at this price; negotiate harder.".to_string()
                });
            }
            (Some(rating), None) if rating.is_efficient() => {
                parts.push(format!("Key strength: DPE {rating} keeps running costs low."));
                parts.push("Tip: move quickly, efficient stock below market rarely lasts.".to_string());
            }
            _ => {
                parts.push("Key risk: limited upside beyond the current discount.".to_string());
                parts.push("Tip: confirm recent comparable sales in the building before offering.".to_string());
            }
        }

        parts.join(" ")
    }
}

#[async_trait]
impl CommentaryProvider for RuleCommentary {
    async fn explain(
        &self,
        requests: &[CommentaryRequest],
    ) -> Result<HashMap<Fingerprint, String>, CommentaryError> {
        Ok(requests
            .iter()
            .map(|r| (r.fingerprint.clone(), self.paragraph(r)))
            .collect())
    }
}
