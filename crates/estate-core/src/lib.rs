//! Core domain model for the estate analyzer: listings, properties, sessions and analyses.

pub mod market;
pub mod scoring;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub use market::{
    aggregate, AreaBenchmark, AreaOverview, MarketOverview, MarketReference, MarketSummary, VerdictCounts,
};
pub use scoring::{
    score, score_listing, Assessment, EnergyProfile, RenovationProjection, ScoringError, ScoringParams,
    Verdict,
};

pub const CRATE_NAME: &str = "estate-core";

/// Width of the price bucket folded into a property fingerprint.
pub const PRICE_BUCKET_EUR: f64 = 100_000.0;

/// French DPE energy rating, ordered from most (A) to least (G) efficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EnergyRating {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
}

impl EnergyRating {
    pub const ALL: [EnergyRating; 7] = [
        EnergyRating::A,
        EnergyRating::B,
        EnergyRating::C,
        EnergyRating::D,
        EnergyRating::E,
        EnergyRating::F,
        EnergyRating::G,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EnergyRating::A => "A",
            EnergyRating::B => "B",
            EnergyRating::C => "C",
            EnergyRating::D => "D",
            EnergyRating::E => "E",
            EnergyRating::F => "F",
            EnergyRating::G => "G",
        }
    }

    /// Accepts a single rating letter, case-insensitive, surrounding whitespace ignored.
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        let mut chars = trimmed.chars();
        let letter = chars.next()?.to_ascii_uppercase();
        if chars.next().is_some() {
            return None;
        }
        Self::ALL.into_iter().find(|r| r.as_str().starts_with(letter))
    }

    /// E, F and G carry renovation upside.
    pub fn needs_renovation(self) -> bool {
        matches!(self, EnergyRating::E | EnergyRating::F | EnergyRating::G)
    }

    pub fn is_efficient(self) -> bool {
        matches!(self, EnergyRating::A | EnergyRating::B)
    }
}

impl fmt::Display for EnergyRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown energy rating `{0}`")]
pub struct UnknownEnergyRating(pub String);

impl FromStr for EnergyRating {
    type Err = UnknownEnergyRating;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| UnknownEnergyRating(s.to_string()))
    }
}

/// Where a session's listings came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Live,
    Demo,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionMode::Live => "live",
            SessionMode::Demo => "demo",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "live" => Some(SessionMode::Live),
            "demo" => Some(SessionMode::Demo),
            _ => None,
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment choice for what the store keeps between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryMode {
    /// Properties and price history accumulate across runs.
    Cumulative,
    /// Properties and price history are cleared before every run.
    Fresh,
}

impl HistoryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryMode::Cumulative => "cumulative",
            HistoryMode::Fresh => "fresh",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown history mode `{0}` (expected `cumulative` or `fresh`)")]
pub struct UnknownHistoryMode(pub String);

impl FromStr for HistoryMode {
    type Err = UnknownHistoryMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cumulative" => Ok(HistoryMode::Cumulative),
            "fresh" => Ok(HistoryMode::Fresh),
            _ => Err(UnknownHistoryMode(s.to_string())),
        }
    }
}

/// Lowercases, maps every non-alphanumeric char to a space and collapses whitespace.
pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Stable identity of a physical property across re-listings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps an already-derived fingerprint (as read back from storage or a URL).
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn derive(title: &str, area: &str, size_m2: f64, price: f64) -> Self {
        let bucket = (price / PRICE_BUCKET_EUR).floor() as i64;
        let key = format!(
            "{}|{}|{}|{}",
            normalize_text(title),
            normalize_text(area),
            size_m2.round() as i64,
            bucket
        );
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Listing record as handed over by an ingestion source; fields may be missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub source_id: String,
    pub external_id: Option<String>,
    pub title: String,
    pub price: Option<f64>,
    pub size_m2: Option<f64>,
    pub area: Option<String>,
    pub rooms: Option<u32>,
    pub energy_rating: Option<EnergyRating>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl ListingDraft {
    /// Checks that price, size and area are present and usable.
    pub fn validate(&self) -> Result<Listing, ScoringError> {
        let invalid = |field: &'static str, problem: &'static str| ScoringError::InvalidListing {
            title: self.title.clone(),
            field,
            problem,
        };

        let price = self.price.ok_or_else(|| invalid("price", "is missing"))?;
        if !price.is_finite() || price <= 0.0 {
            return Err(invalid("price", "must be positive"));
        }
        let size_m2 = self.size_m2.ok_or_else(|| invalid("size_m2", "is missing"))?;
        if !size_m2.is_finite() || size_m2 <= 0.0 {
            return Err(invalid("size_m2", "must be positive"));
        }
        let area = self
            .area
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| invalid("area", "is missing"))?;

        Ok(Listing {
            source_id: self.source_id.clone(),
            title: self.title.trim().to_string(),
            price,
            size_m2,
            area: area.to_string(),
            rooms: self.rooms,
            energy_rating: self.energy_rating,
            description: self.description.clone(),
            url: self.url.clone(),
        })
    }
}

/// A validated listing: price and size positive, area present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub source_id: String,
    pub title: String,
    pub price: f64,
    pub size_m2: f64,
    pub area: String,
    pub rooms: Option<u32>,
    pub energy_rating: Option<EnergyRating>,
    pub description: Option<String>,
    pub url: Option<String>,
}

impl Listing {
    pub fn price_m2(&self) -> f64 {
        self.price / self.size_m2
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::derive(&self.title, &self.area, self.size_m2, self.price)
    }
}

/// De-duplicated property as tracked by the historical store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub fingerprint: Fingerprint,
    pub title: String,
    pub area: String,
    pub size_m2: f64,
    pub price: f64,
    pub rooms: Option<u32>,
    pub energy_rating: Option<EnergyRating>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_session_id: Uuid,
}

impl Property {
    pub fn price_m2(&self) -> f64 {
        self.price / self.size_m2
    }

    /// The property's current stored state, in the shape the scorer takes.
    pub fn as_listing(&self, source_id: &str) -> Listing {
        Listing {
            source_id: source_id.to_string(),
            title: self.title.clone(),
            price: self.price,
            size_m2: self.size_m2,
            area: self.area.clone(),
            rooms: self.rooms,
            energy_rating: self.energy_rating,
            description: self.description.clone(),
            url: self.url.clone(),
        }
    }
}

/// Superseded price observation for a property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryEntry {
    pub fingerprint: Fingerprint,
    pub price: f64,
    pub price_m2: f64,
    pub observed_at: DateTime<Utc>,
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub raw_seen: u32,
    pub created: u32,
    pub updated: u32,
    pub skipped: u32,
    pub rejected: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeSession {
    pub id: Uuid,
    pub source_id: String,
    pub mode: SessionMode,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counters: SessionCounters,
}

impl ScrapeSession {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// How many sessions the store holds and when the first one started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub sessions: u64,
    pub tracking_since: Option<DateTime<Utc>>,
}

/// Persisted scoring result for one property in one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub fingerprint: Fingerprint,
    pub session_id: Uuid,
    pub assessment: Assessment,
    pub commentary: Option<String>,
    pub analyzed_at: DateTime<Utc>,
}

impl Analysis {
    pub fn verdict(&self) -> Verdict {
        self.assessment.verdict()
    }
}

/// A property joined with its analysis for a given session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedProperty {
    pub property: Property,
    pub analysis: Analysis,
}
