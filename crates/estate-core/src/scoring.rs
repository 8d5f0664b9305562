//! Deterministic investment scoring.
//!
//! The score is built as an ordered series of adjustments applied to a base
//! of 5.0. The running total is clamped into `[1, 10]` after every step, so
//! later adjustments always start from an in-range value.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{EnergyRating, Listing, ListingDraft, MarketReference};

pub const BASE_SCORE: f64 = 5.0;
pub const MIN_SCORE: f64 = 1.0;
pub const MAX_SCORE: f64 = 10.0;

/// At or below this price-vs-market percentage a listing counts as discounted.
pub const DISCOUNT_THRESHOLD_PCT: f64 = -5.0;
/// Above this price-vs-market percentage a listing is penalised.
pub const PREMIUM_THRESHOLD_PCT: f64 = 10.0;

const DISCOUNT_BONUS_MIN: f64 = 1.5;
const DISCOUNT_BONUS_MAX: f64 = 2.5;
const PREMIUM_PENALTY_MIN: f64 = 1.0;
const PREMIUM_PENALTY_MAX: f64 = 2.0;
/// Bonus/penalty points per percentage point beyond the threshold.
const SLOPE_PER_PCT: f64 = 0.1;

const RENOVATION_UPSIDE_BONUS: f64 = 1.5;
const EFFICIENT_RATING_BONUS: f64 = 0.5;
const HIGH_YIELD_THRESHOLD_PCT: f64 = 5.0;
const HIGH_YIELD_BONUS: f64 = 0.5;
const STRONG_ROI_THRESHOLD_PCT: f64 = 30.0;
const STRONG_ROI_BONUS: f64 = 1.0;
const ROI_HORIZON_YEARS: i32 = 5;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoringError {
    #[error("invalid listing `{title}`: {field} {problem}")]
    InvalidListing {
        title: String,
        field: &'static str,
        problem: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Buy,
    Hold,
    Avoid,
}

impl Verdict {
    pub fn from_score(score: f64) -> Self {
        if score >= 7.0 {
            Verdict::Buy
        } else if score >= 5.0 {
            Verdict::Hold
        } else {
            Verdict::Avoid
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Buy => "BUY",
            Verdict::Hold => "HOLD",
            Verdict::Avoid => "AVOID",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergyProfile {
    /// Market value multiplier relative to a C-rated baseline.
    pub value_factor: f64,
    /// Cost per m² to bring the property up to the renovation target.
    pub reno_cost_m2: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringParams {
    pub renovation_target: EnergyRating,
    pub energy: BTreeMap<EnergyRating, EnergyProfile>,
}

impl Default for ScoringParams {
    fn default() -> Self {
        let energy = [
            (EnergyRating::A, 1.10, 0.0),
            (EnergyRating::B, 1.05, 0.0),
            (EnergyRating::C, 1.00, 100.0),
            (EnergyRating::D, 0.95, 250.0),
            (EnergyRating::E, 0.88, 450.0),
            (EnergyRating::F, 0.80, 650.0),
            (EnergyRating::G, 0.70, 900.0),
        ]
        .into_iter()
        .map(|(rating, value_factor, reno_cost_m2)| {
            (
                rating,
                EnergyProfile {
                    value_factor,
                    reno_cost_m2,
                },
            )
        })
        .collect();

        Self {
            renovation_target: EnergyRating::B,
            energy,
        }
    }
}

impl ScoringParams {
    pub fn profile(&self, rating: EnergyRating) -> EnergyProfile {
        self.energy.get(&rating).copied().unwrap_or(EnergyProfile {
            value_factor: 1.0,
            reno_cost_m2: 0.0,
        })
    }

    pub fn renovation_cost_per_m2(&self, rating: EnergyRating) -> f64 {
        self.profile(rating).reno_cost_m2
    }

    /// Value gained by moving a property priced at `price` from `current` to the target rating.
    pub fn uplift_estimate(&self, price: f64, current: EnergyRating) -> f64 {
        let from = self.profile(current).value_factor;
        let to = self.profile(self.renovation_target).value_factor;
        if from <= 0.0 {
            return 0.0;
        }
        price * (to / from - 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RenovationProjection {
    pub cost: f64,
    pub post_renovation_value: f64,
    pub capital_gain: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub score: f64,
    pub price_m2: f64,
    pub market_avg_price_m2: f64,
    pub price_vs_market_pct: f64,
    pub rental_yield_pct: f64,
    pub roi_5yr_pct: f64,
    pub undervalued: bool,
    pub renovation: Option<RenovationProjection>,
}

impl Assessment {
    pub fn verdict(&self) -> Verdict {
        Verdict::from_score(self.score)
    }
}

/// Validates `draft` and scores it.
pub fn score(
    draft: &ListingDraft,
    market: &MarketReference,
    params: &ScoringParams,
) -> Result<Assessment, ScoringError> {
    let listing = draft.validate()?;
    Ok(score_listing(&listing, market, params))
}

pub fn score_listing(listing: &Listing, market: &MarketReference, params: &ScoringParams) -> Assessment {
    let benchmark = market.benchmark(&listing.area);
    let price_m2 = listing.price_m2();
    let price_vs_market_pct = price_vs_market_pct(price_m2, benchmark.avg_price_m2);
    let discounted = price_vs_market_pct <= DISCOUNT_THRESHOLD_PCT;
    let roi_5yr_pct = roi_5yr_pct(
        listing.price,
        benchmark.appreciation_rate,
        benchmark.rental_yield_pct,
    );

    let mut total = BASE_SCORE;
    for delta in [
        market_price_adjustment(price_vs_market_pct),
        energy_adjustment(listing.energy_rating, discounted),
        yield_adjustment(benchmark.rental_yield_pct),
        roi_adjustment(roi_5yr_pct),
    ] {
        total = clamp_score(total + delta);
    }
    let score = clamp_score((total * 10.0).round() / 10.0);

    let renovation = listing
        .energy_rating
        .filter(|r| r.needs_renovation())
        .map(|rating| renovation_projection(listing, rating, params));

    Assessment {
        score,
        price_m2,
        market_avg_price_m2: benchmark.avg_price_m2,
        price_vs_market_pct,
        rental_yield_pct: benchmark.rental_yield_pct,
        roi_5yr_pct,
        undervalued: discounted,
        renovation,
    }
}

pub fn price_vs_market_pct(price_m2: f64, market_avg_m2: f64) -> f64 {
    if market_avg_m2 <= 0.0 {
        return 0.0;
    }
    (price_m2 - market_avg_m2) / market_avg_m2 * 100.0
}

/// Bonus for a discount, penalty for a premium, linear in the distance past the threshold.
pub fn market_price_adjustment(price_vs_market_pct: f64) -> f64 {
    if price_vs_market_pct <= DISCOUNT_THRESHOLD_PCT {
        let beyond = -price_vs_market_pct + DISCOUNT_THRESHOLD_PCT;
        (DISCOUNT_BONUS_MIN + beyond * SLOPE_PER_PCT).min(DISCOUNT_BONUS_MAX)
    } else if price_vs_market_pct > PREMIUM_THRESHOLD_PCT {
        let beyond = price_vs_market_pct - PREMIUM_THRESHOLD_PCT;
        -(PREMIUM_PENALTY_MIN + beyond * SLOPE_PER_PCT).min(PREMIUM_PENALTY_MAX)
    } else {
        0.0
    }
}

fn energy_adjustment(rating: Option<EnergyRating>, discounted: bool) -> f64 {
    match rating {
        Some(r) if r.needs_renovation() && discounted => RENOVATION_UPSIDE_BONUS,
        Some(r) if r.is_efficient() => EFFICIENT_RATING_BONUS,
        _ => 0.0,
    }
}

fn yield_adjustment(rental_yield_pct: f64) -> f64 {
    if rental_yield_pct > HIGH_YIELD_THRESHOLD_PCT {
        HIGH_YIELD_BONUS
    } else {
        0.0
    }
}

fn roi_adjustment(roi_5yr_pct: f64) -> f64 {
    if roi_5yr_pct > STRONG_ROI_THRESHOLD_PCT {
        STRONG_ROI_BONUS
    } else {
        0.0
    }
}

/// Five-year appreciation plus five years of gross rent, as a percentage of price.
pub fn roi_5yr_pct(price: f64, appreciation_rate: f64, rental_yield_pct: f64) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    let appreciation = price * (1.0 + appreciation_rate).powi(ROI_HORIZON_YEARS) - price;
    let rent = price * rental_yield_pct / 100.0 * f64::from(ROI_HORIZON_YEARS);
    (appreciation + rent) / price * 100.0
}

fn renovation_projection(
    listing: &Listing,
    rating: EnergyRating,
    params: &ScoringParams,
) -> RenovationProjection {
    let cost = listing.size_m2 * params.renovation_cost_per_m2(rating);
    let post_renovation_value = listing.price + params.uplift_estimate(listing.price, rating);
    RenovationProjection {
        cost,
        post_renovation_value,
        capital_gain: post_renovation_value - listing.price - cost,
    }
}

fn clamp_score(value: f64) -> f64 {
    value.clamp(MIN_SCORE, MAX_SCORE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AreaBenchmark;
    use chrono::Utc;

    fn market(avg: f64, yield_pct: f64, appreciation: f64) -> MarketReference {
        MarketReference::new(
            "test",
            AreaBenchmark {
                avg_price_m2: 4_300.0,
                rental_yield_pct: 4.5,
                appreciation_rate: 0.02,
            },
        )
        .with_area(
            "Lyon 3e",
            AreaBenchmark {
                avg_price_m2: avg,
                rental_yield_pct: yield_pct,
                appreciation_rate: appreciation,
            },
        )
    }

    fn draft(price: f64, size: f64, rating: Option<EnergyRating>) -> ListingDraft {
        ListingDraft {
            source_id: "test".into(),
            external_id: None,
            title: "Appartement".into(),
            price: Some(price),
            size_m2: Some(size),
            area: Some("Lyon 3e".into()),
            rooms: Some(2),
            energy_rating: rating,
            description: None,
            url: None,
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn discounted_f_rating_scores_buy_with_renovation() {
        let m = market(4_000.0, 4.0, 0.01);
        let a = score(&draft(180_000.0, 50.0, Some(EnergyRating::F)), &m, &ScoringParams::default())
            .expect("valid listing");

        assert!((a.price_vs_market_pct + 10.0).abs() < 1e-9);
        assert!((market_price_adjustment(a.price_vs_market_pct) - 2.0).abs() < 1e-9);
        assert_eq!(a.score, 8.5);
        assert_eq!(a.verdict(), Verdict::Buy);
        assert!(a.undervalued);

        let reno = a.renovation.expect("renovation projection for F");
        assert!((reno.cost - 50.0 * 650.0).abs() < 1e-9);
        assert!((reno.post_renovation_value - 180_000.0 * (1.05 / 0.80)).abs() < 1e-6);
        assert!((reno.capital_gain - (reno.post_renovation_value - 180_000.0 - reno.cost)).abs() < 1e-6);
    }

    #[test]
    fn premium_c_rating_scores_avoid() {
        let m = market(4_000.0, 4.0, 0.01);
        let a = score(&draft(230_000.0, 50.0, Some(EnergyRating::C)), &m, &ScoringParams::default())
            .expect("valid listing");

        assert!((a.price_vs_market_pct - 15.0).abs() < 1e-9);
        assert_eq!(a.score, 3.5);
        assert_eq!(a.verdict(), Verdict::Avoid);
        assert!(!a.undervalued);
        assert!(a.renovation.is_none());
    }

    #[test]
    fn renovation_bonus_requires_discount() {
        let m = market(4_000.0, 4.0, 0.01);
        let at_market = score(&draft(200_000.0, 50.0, Some(EnergyRating::G)), &m, &ScoringParams::default())
            .unwrap();
        assert_eq!(at_market.score, 5.0);
        assert!(at_market.renovation.is_some());

        let efficient = score(&draft(200_000.0, 50.0, Some(EnergyRating::A)), &m, &ScoringParams::default())
            .unwrap();
        assert_eq!(efficient.score, 5.5);
    }

    #[test]
    fn market_adjustment_is_linear_and_capped() {
        assert_eq!(market_price_adjustment(-5.0), 1.5);
        assert!((market_price_adjustment(-40.0) - 2.5).abs() < 1e-12);
        assert_eq!(market_price_adjustment(0.0), 0.0);
        assert_eq!(market_price_adjustment(10.0), 0.0);
        assert!((market_price_adjustment(20.0) + 2.0).abs() < 1e-9);
        assert!((market_price_adjustment(80.0) + 2.0).abs() < 1e-12);
    }

    #[test]
    fn discount_bonus_saturates_at_fifteen_percent() {
        assert!((market_price_adjustment(-10.0) - 2.0).abs() < 1e-9);
        assert!((market_price_adjustment(-14.0) - 2.4).abs() < 1e-9);
        // Flat from -15% onwards: a 20% discount earns no more than 15%.
        for pct in [-15.0, -17.5, -20.0] {
            assert!((market_price_adjustment(pct) - DISCOUNT_BONUS_MAX).abs() < 1e-9, "{pct}");
        }
        assert!((market_price_adjustment(15.0) + 1.5).abs() < 1e-9);
    }

    #[test]
    fn yield_and_roi_bonuses_apply() {
        // 5.8% yield with 2% appreciation: roi = 10.4 + 29 > 30
        let m = market(4_000.0, 5.8, 0.02);
        let a = score(&draft(200_000.0, 50.0, Some(EnergyRating::D)), &m, &ScoringParams::default())
            .unwrap();
        assert!(a.roi_5yr_pct > 30.0);
        assert_eq!(a.score, 6.5);
        assert_eq!(a.verdict(), Verdict::Hold);
    }

    #[test]
    fn score_stays_in_bounds_across_extremes() {
        let params = ScoringParams::default();
        for (avg, yield_pct, appreciation) in [(1_000.0, 9.0, 0.10), (50_000.0, 1.0, -0.05)] {
            let m = market(avg, yield_pct, appreciation);
            for price in [10_000.0, 150_000.0, 2_000_000.0] {
                for rating in EnergyRating::ALL.into_iter().map(Some).chain([None]) {
                    let a = score(&draft(price, 45.0, rating), &m, &params).unwrap();
                    assert!((MIN_SCORE..=MAX_SCORE).contains(&a.score), "{a:?}");
                    assert_eq!(a.verdict(), Verdict::from_score(a.score));
                }
            }
        }
    }

    #[test]
    fn invalid_listing_is_rejected_before_scoring() {
        let m = market(4_000.0, 4.0, 0.01);
        let mut d = draft(180_000.0, 50.0, None);
        d.size_m2 = Some(-3.0);
        assert!(matches!(
            score(&d, &m, &ScoringParams::default()),
            Err(ScoringError::InvalidListing { field: "size_m2", .. })
        ));
    }

    #[test]
    fn verdict_thresholds() {
        assert_eq!(Verdict::from_score(7.0), Verdict::Buy);
        assert_eq!(Verdict::from_score(6.9), Verdict::Hold);
        assert_eq!(Verdict::from_score(5.0), Verdict::Hold);
        assert_eq!(Verdict::from_score(4.9), Verdict::Avoid);
    }
}
