//! Report export: JSON dataset, markdown brief, text report and parquet snapshots.

use std::fmt::Write as _;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use async_trait::async_trait;
use estate_core::{AnalyzedProperty, AreaOverview};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;

use crate::dataset::SessionDataset;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportReceipt {
    pub directory: String,
    pub files: Vec<String>,
}

#[async_trait]
pub trait Exporter: Send + Sync {
    async fn publish(&self, dataset: &SessionDataset) -> Result<ExportReceipt, ExportError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExporter;

#[async_trait]
impl Exporter for NoopExporter {
    async fn publish(&self, _dataset: &SessionDataset) -> Result<ExportReceipt, ExportError> {
        Ok(ExportReceipt {
            directory: String::new(),
            files: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub session_id: String,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `<reports_dir>/<session_id>/` with the dataset, brief, report and snapshots.
#[derive(Debug, Clone)]
pub struct ReportExporter {
    reports_dir: PathBuf,
}

impl ReportExporter {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }

    async fn write_all(&self, dataset: &SessionDataset) -> Result<ExportReceipt> {
        let dir = self.reports_dir.join(dataset.session.id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let json = serde_json::to_vec_pretty(dataset).context("serializing session dataset")?;
        fs::write(dir.join("dataset.json"), json)
            .await
            .context("writing dataset.json")?;
        fs::write(dir.join("brief.md"), render_brief(dataset))
            .await
            .context("writing brief.md")?;
        fs::write(dir.join("report.txt"), render_text_report(dataset))
            .await
            .context("writing report.txt")?;

        let manifest = export_parquet_snapshots(&dir, dataset).await?;

        let mut files = vec![
            "dataset.json".to_string(),
            "brief.md".to_string(),
            "report.txt".to_string(),
        ];
        files.extend(manifest.files.iter().map(|f| f.path.clone()));
        files.push("snapshots/manifest.json".to_string());

        Ok(ExportReceipt {
            directory: dir.display().to_string(),
            files,
        })
    }
}

#[async_trait]
impl Exporter for ReportExporter {
    async fn publish(&self, dataset: &SessionDataset) -> Result<ExportReceipt, ExportError> {
        Ok(self.write_all(dataset).await?)
    }
}

fn eur(amount: f64) -> String {
    let rounded = amount.round() as i64;
    let digits = rounded.unsigned_abs().to_string();
    let mut grouped = String::new();
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if rounded < 0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}

fn energy_label(row: &AnalyzedProperty) -> &'static str {
    row.property.energy_rating.map_or("?", |r| r.as_str())
}

pub fn render_brief(dataset: &SessionDataset) -> String {
    let s = &dataset.overview.summary;
    let mut out = String::new();
    let _ = writeln!(out, "# Estate brief: {}\n", dataset.market);
    let _ = writeln!(out, "- Session: `{}` ({})", dataset.session.id, dataset.session.mode);
    let _ = writeln!(out, "- Source: {}", dataset.session.source_id);
    let _ = writeln!(out, "- Started: {}", dataset.session.started_at.to_rfc3339());
    if let Some(done) = dataset.session.completed_at {
        let _ = writeln!(out, "- Completed: {}", done.to_rfc3339());
    }
    let c = &dataset.session.counters;
    let _ = writeln!(
        out,
        "- Listings: {} seen, {} new, {} updated, {} skipped, {} rejected",
        c.raw_seen, c.created, c.updated, c.skipped, c.rejected
    );
    let _ = writeln!(
        out,
        "- Verdicts: {} BUY, {} HOLD, {} AVOID\n",
        s.verdicts.buy, s.verdicts.hold, s.verdicts.avoid
    );

    let _ = writeln!(out, "## Top undervalued\n");
    let mut any = false;
    for row in dataset.undervalued().take(5) {
        any = true;
        let a = &row.analysis.assessment;
        let _ = writeln!(
            out,
            "- **{:.1}** {} ({}, {} EUR, {:+.1}% vs market, DPE {})",
            a.score,
            row.property.title,
            row.property.area,
            eur(row.property.price),
            a.price_vs_market_pct,
            energy_label(row)
        );
        if let Some(text) = &row.analysis.commentary {
            let _ = writeln!(out, "  - {text}");
        }
    }
    if !any {
        let _ = writeln!(out, "No undervalued listings this session.");
    }
    out
}

pub fn render_text_report(dataset: &SessionDataset) -> String {
    let width = 66;
    let rule = "=".repeat(width);
    let thin = "-".repeat(width);
    let s = &dataset.overview.summary;
    let mut out = String::new();

    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "{:^width$}", format!("{} REAL ESTATE INVESTMENT REPORT", dataset.market.to_uppercase()));
    let _ = writeln!(out, "{:^width$}", format!("Generated: {}", dataset.generated_at.format("%Y-%m-%d %H:%M")));
    let _ = writeln!(out, "{rule}");

    if dataset.properties.is_empty() {
        let _ = writeln!(out, "\n  No properties to analyze.");
        return out;
    }

    let _ = writeln!(out, "\n  MARKET OVERVIEW\n{thin}");
    let _ = writeln!(out, "  Properties analyzed : {}", s.total);
    let _ = writeln!(out, "  New this session    : {}", s.new_properties);
    if dataset.tracking.sessions > 0 {
        let since = dataset
            .tracking
            .tracking_since
            .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d").to_string());
        let _ = writeln!(
            out,
            "  Database sessions   : {} (tracking since {})",
            dataset.tracking.sessions, since
        );
    }
    let _ = writeln!(out, "  Average price       : EUR {}", eur(s.avg_price));
    let _ = writeln!(out, "  Average size        : {:.0} m2", s.avg_size_m2);
    let _ = writeln!(out, "  Average price/m2    : EUR {}", eur(s.avg_price_m2));
    let _ = writeln!(out, "  Best 5yr ROI        : {:.1}%", s.best_roi_5yr_pct);

    let _ = writeln!(out, "\n  BY AREA\n{thin}");
    let _ = writeln!(out, "  {:<14} {:>3} {:>12} {:>11} {:>7}", "Area", "#", "Avg EUR/m2", "vs Market", "Yield");
    for area in &dataset.overview.areas {
        let _ = writeln!(
            out,
            "  {:<14} {:>3} {:>12} {:>11} {:>7}",
            area.area,
            area.listings,
            format!("EUR {}", eur(area.avg_price_m2)),
            format!("{:+.1}%", area.avg_vs_market_pct),
            format!("{:.1}%", area.avg_yield_pct)
        );
    }

    let _ = writeln!(out, "\n  ALL PROPERTIES (ranked by score)\n{thin}");
    let _ = writeln!(out, "  {:>2} {:>5}  {:<30} {:>8} {:>4} {:>8}", "#", "Score", "Title", "EUR/m2", "DPE", "5yr ROI");
    for (i, row) in dataset.properties.iter().enumerate() {
        let a = &row.analysis.assessment;
        let title: String = row.property.title.chars().take(28).collect();
        let _ = writeln!(
            out,
            "  {:>2} {:>5.1}  {:<30} {:>8} {:>4} {:>7.1}%{}",
            i + 1,
            a.score,
            title,
            eur(a.price_m2),
            energy_label(row),
            a.roi_5yr_pct,
            if a.undervalued { " *" } else { "" }
        );
    }
    let _ = writeln!(out, "  (* = undervalued)");

    let undervalued: Vec<_> = dataset.undervalued().collect();
    let _ = writeln!(out, "\n  TOP UNDERVALUED PROPERTIES ({} found)\n{thin}", undervalued.len());
    if undervalued.is_empty() {
        let _ = writeln!(out, "  No significantly undervalued properties detected.");
    }
    for (i, row) in undervalued.iter().take(5).enumerate() {
        let a = &row.analysis.assessment;
        let p = &row.property;
        let _ = writeln!(out, "\n  {}. [SCORE {:.1}/10 {}] {}", i + 1, a.score, a.verdict(), p.title);
        let _ = writeln!(
            out,
            "     Price: EUR {}  |  {:.0} m2  |  EUR {}/m2  |  DPE: {}",
            eur(p.price),
            p.size_m2,
            eur(a.price_m2),
            energy_label(row)
        );
        let _ = writeln!(
            out,
            "     {:+.1}% vs market avg (EUR {}/m2) for {}",
            a.price_vs_market_pct,
            eur(a.market_avg_price_m2),
            p.area
        );
        let _ = writeln!(out, "     Yield: {:.1}%  |  5yr ROI: {:.1}%", a.rental_yield_pct, a.roi_5yr_pct);
        if let Some(reno) = a.renovation {
            let _ = writeln!(
                out,
                "     Renovation: EUR {} -> post-renovation value EUR {} (gain: EUR {})",
                eur(reno.cost),
                eur(reno.post_renovation_value),
                eur(reno.capital_gain)
            );
        }
        if let Some(text) = &row.analysis.commentary {
            let _ = writeln!(out, "     Note: {}", text.replace('\n', " "));
        }
    }

    let _ = writeln!(out, "\n{rule}\n  Estimates only. Consult a licensed advisor.\n{rule}");
    out
}

async fn export_parquet_snapshots(session_dir: &Path, dataset: &SessionDataset) -> Result<ParquetManifest> {
    let snapshot_dir = session_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let manifest_path = snapshot_dir.join("manifest.json");
    let session_dir = session_dir.to_path_buf();
    let session_id = dataset.session.id.to_string();
    let rows = dataset.properties.clone();
    let areas = dataset.overview.areas.clone();
    // Arrow and parquet write through blocking file handles.
    let manifest = tokio::task::spawn_blocking(move || {
        write_snapshots(&session_dir, &snapshot_dir, session_id, &rows, &areas)
    })
    .await
    .context("joining the parquet writer task")??;

    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest)
}

fn write_snapshots(
    session_dir: &Path,
    snapshot_dir: &Path,
    session_id: String,
    rows: &[AnalyzedProperty],
    areas: &[AreaOverview],
) -> Result<ParquetManifest> {
    let properties_path = snapshot_dir.join("properties.parquet");
    let analyses_path = snapshot_dir.join("analyses.parquet");
    let areas_path = snapshot_dir.join("areas.parquet");

    write_properties_parquet(&properties_path, rows)?;
    write_analyses_parquet(&analyses_path, rows)?;
    write_areas_parquet(&areas_path, areas)?;

    Ok(ParquetManifest {
        schema_version: 1,
        session_id,
        files: vec![
            manifest_entry("properties", session_dir, &properties_path)?,
            manifest_entry("analyses", session_dir, &analyses_path)?,
            manifest_entry("areas", session_dir, &areas_path)?,
        ],
    })
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_properties_parquet(path: &Path, rows: &[AnalyzedProperty]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("fingerprint", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("area", DataType::Utf8, false),
        ArrowField::new("price", DataType::Float64, false),
        ArrowField::new("size_m2", DataType::Float64, false),
        ArrowField::new("price_m2", DataType::Float64, false),
        ArrowField::new("rooms", DataType::UInt32, true),
        ArrowField::new("energy_rating", DataType::Utf8, true),
        ArrowField::new("first_seen", DataType::Utf8, false),
        ArrowField::new("last_seen", DataType::Utf8, false),
    ]));

    let props = rows.iter().map(|r| &r.property);
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(props.clone().map(|p| Some(p.fingerprint.as_str())).collect::<Vec<_>>())),
            Arc::new(StringArray::from(props.clone().map(|p| Some(p.title.as_str())).collect::<Vec<_>>())),
            Arc::new(StringArray::from(props.clone().map(|p| Some(p.area.as_str())).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(props.clone().map(|p| p.price).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(props.clone().map(|p| p.size_m2).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(props.clone().map(|p| p.price_m2()).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(props.clone().map(|p| p.rooms).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                props.clone().map(|p| p.energy_rating.map(|r| r.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(props.clone().map(|p| Some(p.first_seen.to_rfc3339())).collect::<Vec<_>>())),
            Arc::new(StringArray::from(props.map(|p| Some(p.last_seen.to_rfc3339())).collect::<Vec<_>>())),
        ],
    )
    .context("building properties record batch")?;
    write_parquet(path, batch)
}

fn write_analyses_parquet(path: &Path, rows: &[AnalyzedProperty]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("fingerprint", DataType::Utf8, false),
        ArrowField::new("session_id", DataType::Utf8, false),
        ArrowField::new("score", DataType::Float64, false),
        ArrowField::new("verdict", DataType::Utf8, false),
        ArrowField::new("price_vs_market_pct", DataType::Float64, false),
        ArrowField::new("rental_yield_pct", DataType::Float64, false),
        ArrowField::new("roi_5yr_pct", DataType::Float64, false),
        ArrowField::new("undervalued", DataType::Boolean, false),
        ArrowField::new("renovation_cost", DataType::Float64, true),
        ArrowField::new("capital_gain", DataType::Float64, true),
        ArrowField::new("commentary", DataType::Utf8, true),
    ]));

    let analyses = rows.iter().map(|r| &r.analysis);
    let assessments = analyses.clone().map(|a| &a.assessment);
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                analyses.clone().map(|a| Some(a.fingerprint.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                analyses.clone().map(|a| Some(a.session_id.to_string())).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(assessments.clone().map(|a| a.score).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                assessments.clone().map(|a| Some(a.verdict().as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                assessments.clone().map(|a| a.price_vs_market_pct).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(assessments.clone().map(|a| a.rental_yield_pct).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(assessments.clone().map(|a| a.roi_5yr_pct).collect::<Vec<_>>())),
            Arc::new(BooleanArray::from(assessments.clone().map(|a| a.undervalued).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(
                assessments.clone().map(|a| a.renovation.map(|r| r.cost)).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                assessments.map(|a| a.renovation.map(|r| r.capital_gain)).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                analyses.map(|a| a.commentary.as_deref()).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building analyses record batch")?;
    write_parquet(path, batch)
}

fn write_areas_parquet(path: &Path, areas: &[AreaOverview]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("area", DataType::Utf8, false),
        ArrowField::new("listings", DataType::UInt32, false),
        ArrowField::new("avg_price_m2", DataType::Float64, false),
        ArrowField::new("market_avg_price_m2", DataType::Float64, false),
        ArrowField::new("avg_vs_market_pct", DataType::Float64, false),
        ArrowField::new("avg_yield_pct", DataType::Float64, false),
        ArrowField::new("avg_roi_5yr_pct", DataType::Float64, false),
        ArrowField::new("undervalued", DataType::UInt32, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(areas.iter().map(|a| Some(a.area.as_str())).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(areas.iter().map(|a| saturating_u32(a.listings)).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(areas.iter().map(|a| a.avg_price_m2).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(areas.iter().map(|a| a.market_avg_price_m2).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(areas.iter().map(|a| a.avg_vs_market_pct).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(areas.iter().map(|a| a.avg_yield_pct).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(areas.iter().map(|a| a.avg_roi_5yr_pct).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(areas.iter().map(|a| saturating_u32(a.undervalued)).collect::<Vec<_>>())),
        ],
    )
    .context("building areas record batch")?;
    write_parquet(path, batch)
}

fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn manifest_entry(name: &str, session_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(session_dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use estate_core::{
        score_listing, Analysis, AreaBenchmark, EnergyRating, Listing, MarketReference, Property,
        ScoringParams, ScrapeSession, SessionCounters, SessionMode, SessionStats,
    };
    use serde_json::Value;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn market() -> MarketReference {
        MarketReference::new(
            "testville",
            AreaBenchmark {
                avg_price_m2: 4_000.0,
                rental_yield_pct: 4.0,
                appreciation_rate: 0.01,
            },
        )
    }

    fn dataset(prices: &[(f64, Option<EnergyRating>)]) -> SessionDataset {
        let market = market();
        let now = Utc::now();
        let session = ScrapeSession {
            id: Uuid::new_v4(),
            source_id: "demo".into(),
            mode: SessionMode::Demo,
            started_at: now,
            completed_at: Some(now),
            counters: SessionCounters {
                raw_seen: prices.len() as u32,
                created: prices.len() as u32,
                ..SessionCounters::default()
            },
        };
        let rows = prices
            .iter()
            .enumerate()
            .map(|(i, (price, rating))| {
                let listing = Listing {
                    source_id: "demo".into(),
                    title: format!("Listing {i}"),
                    price: *price,
                    size_m2: 50.0,
                    area: "Centre".into(),
                    rooms: Some(2),
                    energy_rating: *rating,
                    description: None,
                    url: None,
                };
                let fingerprint = listing.fingerprint();
                AnalyzedProperty {
                    property: Property {
                        fingerprint: fingerprint.clone(),
                        title: listing.title.clone(),
                        area: listing.area.clone(),
                        size_m2: listing.size_m2,
                        price: listing.price,
                        rooms: listing.rooms,
                        energy_rating: listing.energy_rating,
                        description: None,
                        url: None,
                        first_seen: now,
                        last_seen: now,
                        last_session_id: session.id,
                    },
                    analysis: Analysis {
                        fingerprint,
                        session_id: session.id,
                        assessment: score_listing(&listing, &market, &ScoringParams::default()),
                        commentary: Some(format!("note {i}")),
                        analyzed_at: now,
                    },
                }
            })
            .collect();
        SessionDataset::new(session, &market, rows)
    }

    #[test]
    fn dataset_is_ranked_best_first() {
        let ds = dataset(&[(230_000.0, Some(EnergyRating::C)), (180_000.0, Some(EnergyRating::F))]);
        assert_eq!(ds.properties[0].analysis.assessment.score, 8.5);
        assert_eq!(ds.properties[1].analysis.assessment.score, 3.5);
        assert_eq!(ds.undervalued().count(), 1);
        assert_eq!(ds.overview.summary.total, 2);
    }

    #[tokio::test]
    async fn report_exporter_writes_files_and_manifest() {
        let dir = tempdir().expect("tempdir");
        let ds = dataset(&[(180_000.0, Some(EnergyRating::F)), (200_000.0, None)]);

        let receipt = ReportExporter::new(dir.path()).publish(&ds).await.expect("export");
        let session_dir = dir.path().join(ds.session.id.to_string());
        assert_eq!(PathBuf::from(&receipt.directory), session_dir);
        for file in &receipt.files {
            assert!(session_dir.join(file).exists(), "{file} missing");
        }

        let manifest: Value =
            serde_json::from_slice(&std::fs::read(session_dir.join("snapshots/manifest.json")).unwrap()).unwrap();
        let files = manifest["files"].as_array().unwrap();
        assert_eq!(files.len(), 3);
        for entry in files {
            let bytes = std::fs::read(session_dir.join(entry["path"].as_str().unwrap())).unwrap();
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            assert_eq!(entry["sha256"].as_str().unwrap(), hex::encode(hasher.finalize()));
        }

        let report = std::fs::read_to_string(session_dir.join("report.txt")).unwrap();
        assert!(report.contains("TOP UNDERVALUED PROPERTIES (1 found)"));
        assert!(report.contains("Renovation: EUR 32,500"));
        let brief = std::fs::read_to_string(session_dir.join("brief.md")).unwrap();
        assert!(brief.contains("1 BUY"));
        assert!(brief.contains("note"));
    }

    #[tokio::test]
    async fn empty_dataset_still_exports() {
        let dir = tempdir().expect("tempdir");
        let ds = dataset(&[]);
        let receipt = ReportExporter::new(dir.path()).publish(&ds).await.expect("export");
        assert_eq!(receipt.files.len(), 7);
        let report = std::fs::read_to_string(dir.path().join(ds.session.id.to_string()).join("report.txt")).unwrap();
        assert!(report.contains("No properties to analyze."));
    }

    #[test]
    fn report_states_how_long_the_store_has_been_tracking() {
        let untracked = render_text_report(&dataset(&[(200_000.0, None)]));
        assert!(!untracked.contains("Database sessions"));

        let since = "2026-03-01T08:00:00Z".parse().unwrap();
        let tracked = dataset(&[(200_000.0, None)]).with_tracking(SessionStats {
            sessions: 4,
            tracking_since: Some(since),
        });
        let report = render_text_report(&tracked);
        assert!(report.contains("Database sessions   : 4 (tracking since 2026-03-01)"), "{report}");
    }

    #[test]
    fn counts_saturate_instead_of_wrapping() {
        assert_eq!(saturating_u32(12), 12);
        assert_eq!(saturating_u32(usize::MAX), u32::MAX);
    }

    #[test]
    fn eur_groups_thousands() {
        assert_eq!(eur(1_234_567.4), "1,234,567");
        assert_eq!(eur(950.0), "950");
        assert_eq!(eur(-12_500.0), "-12,500");
    }
}
