//! Market reference data and market-level aggregates over analyzed properties.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{normalize_text, AnalyzedProperty, Verdict};

/// Benchmark figures for one area.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AreaBenchmark {
    pub avg_price_m2: f64,
    pub rental_yield_pct: f64,
    /// Yearly appreciation as a fraction (0.02 = 2%).
    pub appreciation_rate: f64,
}

/// Static per-area benchmark table. Read-only once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketReference {
    pub name: String,
    /// Used for listings whose area is not in `areas`.
    pub fallback: AreaBenchmark,
    #[serde(default)]
    pub areas: BTreeMap<String, AreaBenchmark>,
}

impl MarketReference {
    pub fn new(name: impl Into<String>, fallback: AreaBenchmark) -> Self {
        Self {
            name: name.into(),
            fallback,
            areas: BTreeMap::new(),
        }
    }

    pub fn with_area(mut self, area: impl Into<String>, benchmark: AreaBenchmark) -> Self {
        self.areas.insert(area.into(), benchmark);
        self
    }

    /// Benchmark for a known area, matched case- and accent-insensitively.
    pub fn lookup(&self, area: &str) -> Option<&AreaBenchmark> {
        self.canonical_area(area).and_then(|name| self.areas.get(name))
    }

    pub fn benchmark(&self, area: &str) -> &AreaBenchmark {
        self.lookup(area).unwrap_or(&self.fallback)
    }

    /// Canonical spelling of `area` if it is a known area.
    pub fn canonical_area(&self, area: &str) -> Option<&str> {
        if let Some((name, _)) = self.areas.get_key_value(area) {
            return Some(name.as_str());
        }
        let wanted = normalize_text(area);
        self.areas
            .keys()
            .find(|name| normalize_text(name) == wanted)
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerdictCounts {
    pub buy: usize,
    pub hold: usize,
    pub avoid: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSummary {
    pub total: usize,
    pub new_properties: u32,
    pub avg_price: f64,
    pub avg_size_m2: f64,
    pub avg_price_m2: f64,
    pub undervalued: usize,
    pub best_roi_5yr_pct: f64,
    pub verdicts: VerdictCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaOverview {
    pub area: String,
    pub listings: usize,
    pub avg_price_m2: f64,
    pub market_avg_price_m2: f64,
    pub avg_vs_market_pct: f64,
    pub avg_yield_pct: f64,
    pub avg_roi_5yr_pct: f64,
    pub undervalued: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketOverview {
    pub summary: MarketSummary,
    pub areas: Vec<AreaOverview>,
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Builds the session overview. `new_properties` comes from the session counters.
pub fn aggregate(rows: &[AnalyzedProperty], market: &MarketReference, new_properties: u32) -> MarketOverview {
    let mut verdicts = VerdictCounts::default();
    for row in rows {
        match row.analysis.verdict() {
            Verdict::Buy => verdicts.buy += 1,
            Verdict::Hold => verdicts.hold += 1,
            Verdict::Avoid => verdicts.avoid += 1,
        }
    }

    let summary = MarketSummary {
        total: rows.len(),
        new_properties,
        avg_price: mean(rows.iter().map(|r| r.property.price)),
        avg_size_m2: mean(rows.iter().map(|r| r.property.size_m2)),
        avg_price_m2: mean(rows.iter().map(|r| r.property.price_m2())),
        undervalued: rows.iter().filter(|r| r.analysis.assessment.undervalued).count(),
        best_roi_5yr_pct: rows
            .iter()
            .map(|r| r.analysis.assessment.roi_5yr_pct)
            .fold(None, |best: Option<f64>, v| Some(best.map_or(v, |b| b.max(v))))
            .unwrap_or(0.0),
        verdicts,
    };

    let mut by_area: BTreeMap<&str, Vec<&AnalyzedProperty>> = BTreeMap::new();
    for row in rows {
        by_area.entry(row.property.area.as_str()).or_default().push(row);
    }

    let areas = by_area
        .into_iter()
        .map(|(area, group)| AreaOverview {
            area: area.to_string(),
            listings: group.len(),
            avg_price_m2: mean(group.iter().map(|r| r.property.price_m2())),
            market_avg_price_m2: market.benchmark(area).avg_price_m2,
            avg_vs_market_pct: mean(group.iter().map(|r| r.analysis.assessment.price_vs_market_pct)),
            avg_yield_pct: mean(group.iter().map(|r| r.analysis.assessment.rental_yield_pct)),
            avg_roi_5yr_pct: mean(group.iter().map(|r| r.analysis.assessment.roi_5yr_pct)),
            undervalued: group.iter().filter(|r| r.analysis.assessment.undervalued).count(),
        })
        .collect();

    MarketOverview { summary, areas }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{score_listing, Analysis, Listing, Property, ScoringParams};
    use chrono::Utc;
    use uuid::Uuid;

    fn lyon() -> MarketReference {
        let fallback = AreaBenchmark {
            avg_price_m2: 4_300.0,
            rental_yield_pct: 4.5,
            appreciation_rate: 0.02,
        };
        MarketReference::new("lyon", fallback)
            .with_area(
                "Lyon 8e",
                AreaBenchmark {
                    avg_price_m2: 3_700.0,
                    rental_yield_pct: 5.5,
                    appreciation_rate: 0.02,
                },
            )
            .with_area(
                "Lyon 6e",
                AreaBenchmark {
                    avg_price_m2: 6_000.0,
                    rental_yield_pct: 3.3,
                    appreciation_rate: 0.015,
                },
            )
    }

    fn row(area: &str, price: f64, size: f64, market: &MarketReference) -> AnalyzedProperty {
        let session_id = Uuid::new_v4();
        let listing = Listing {
            source_id: "demo".into(),
            title: format!("{area} {price}"),
            price,
            size_m2: size,
            area: area.into(),
            rooms: None,
            energy_rating: None,
            description: None,
            url: None,
        };
        let now = Utc::now();
        AnalyzedProperty {
            property: Property {
                fingerprint: listing.fingerprint(),
                title: listing.title.clone(),
                area: listing.area.clone(),
                size_m2: size,
                price,
                rooms: None,
                energy_rating: None,
                description: None,
                url: None,
                first_seen: now,
                last_seen: now,
                last_session_id: session_id,
            },
            analysis: Analysis {
                fingerprint: listing.fingerprint(),
                session_id,
                assessment: score_listing(&listing, market, &ScoringParams::default()),
                commentary: None,
                analyzed_at: now,
            },
        }
    }

    #[test]
    fn lookup_is_tolerant_and_falls_back() {
        let m = lyon();
        assert_eq!(m.benchmark("lyon 8E").avg_price_m2, 3_700.0);
        assert_eq!(m.benchmark("Villeurbanne").avg_price_m2, 4_300.0);
        assert_eq!(m.canonical_area("LYON 6e"), Some("Lyon 6e"));
        assert_eq!(m.canonical_area("Paris"), None);
    }

    #[test]
    fn aggregate_groups_by_area() {
        let m = lyon();
        let rows = vec![
            row("Lyon 8e", 150_000.0, 50.0, &m),
            row("Lyon 8e", 200_000.0, 50.0, &m),
            row("Lyon 6e", 360_000.0, 60.0, &m),
        ];
        let overview = aggregate(&rows, &m, 2);

        assert_eq!(overview.summary.total, 3);
        assert_eq!(overview.summary.new_properties, 2);
        assert!((overview.summary.avg_size_m2 - 160.0 / 3.0).abs() < 1e-9);
        assert_eq!(overview.areas.len(), 2);

        let eighth = overview.areas.iter().find(|a| a.area == "Lyon 8e").unwrap();
        assert_eq!(eighth.listings, 2);
        assert!((eighth.avg_price_m2 - 3_500.0).abs() < 1e-9);
        assert_eq!(eighth.market_avg_price_m2, 3_700.0);
        assert_eq!(eighth.undervalued, 1);
        assert_eq!(
            overview.summary.verdicts.buy + overview.summary.verdicts.hold + overview.summary.verdicts.avoid,
            3
        );
    }

    #[test]
    fn aggregate_of_nothing_is_zeroed() {
        let overview = aggregate(&[], &lyon(), 0);
        assert_eq!(overview.summary.total, 0);
        assert_eq!(overview.summary.avg_price, 0.0);
        assert_eq!(overview.summary.best_roi_5yr_pct, 0.0);
        assert!(overview.areas.is_empty());
    }
}
