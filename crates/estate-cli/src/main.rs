use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use estate_core::Fingerprint;
use estate_storage::{HistoricalStore, SqliteStore};
use estate_sync::{RunState, SyncConfig, SyncRuntime, Trigger};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "estate-cli")]
#[command(about = "Real estate listing analyzer command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once and print the session summary.
    Sync,
    /// Create or upgrade the database schema.
    Migrate,
    /// Serve the dashboard and API, with the scheduler when enabled.
    Serve,
    /// Price history and analysis trend for one property.
    History { fingerprint: String },
    /// Most recent sessions.
    Sessions {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("estate=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let runtime = SyncRuntime::from_env().await?;
            let status = match runtime.orchestrator.run_inline().await {
                Trigger::Started(status) | Trigger::Rejected(status) => status,
            };
            if status.state == RunState::Error {
                bail!(
                    "sync failed ({}): {}",
                    status.error_reason.map_or("unknown", |r| r.as_str()),
                    status.error_message.unwrap_or_default()
                );
            }
            if let Some(summary) = status.summary {
                let c = summary.counters;
                println!(
                    "sync complete: session_id={} source={} seen={} created={} updated={} skipped={} rejected={} buy={} hold={} avoid={}",
                    summary.session_id,
                    summary.source_id,
                    c.raw_seen,
                    c.created,
                    c.updated,
                    c.skipped,
                    c.rejected,
                    summary.verdicts.buy,
                    summary.verdicts.hold,
                    summary.verdicts.avoid
                );
                match (summary.export, summary.export_error) {
                    (Some(receipt), _) => println!("reports: {}", receipt.directory),
                    (None, Some(err)) => eprintln!("report export failed: {err}"),
                    (None, None) => {}
                }
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let store = SqliteStore::connect(&config.database_url).await?;
            store.close().await;
            println!("migrations applied: {}", config.database_url);
        }
        Commands::Serve => {
            estate_web::serve_from_env().await?;
        }
        Commands::History { fingerprint } => {
            let store = connect().await?;
            let fingerprint = Fingerprint::new(fingerprint);
            let Some(property) = store.property(&fingerprint).await? else {
                bail!("unknown property {fingerprint}");
            };
            println!(
                "{} | {} | {:.0} m2 | current {:.0} EUR | first seen {} | last seen {}",
                property.title,
                property.area,
                property.size_m2,
                property.price,
                property.first_seen.to_rfc3339(),
                property.last_seen.to_rfc3339()
            );
            for entry in store.history(&fingerprint).await? {
                println!(
                    "  price {:>10.0} EUR ({:.0} EUR/m2) superseded at {}",
                    entry.price,
                    entry.price_m2,
                    entry.observed_at.to_rfc3339()
                );
            }
            for analysis in store.analysis_trend(&fingerprint).await? {
                println!(
                    "  score {:.1} {} in session {} ({})",
                    analysis.assessment.score,
                    analysis.verdict(),
                    analysis.session_id,
                    analysis.analyzed_at.to_rfc3339()
                );
            }
        }
        Commands::Sessions { limit } => {
            let store = connect().await?;
            for session in store.sessions(limit).await? {
                let c = session.counters;
                println!(
                    "{} {} {:<8} started={} completed={} seen={} created={} updated={} skipped={} rejected={}",
                    session.id,
                    session.mode,
                    session.source_id,
                    session.started_at.to_rfc3339(),
                    session.completed_at.map_or_else(|| "-".to_string(), |t| t.to_rfc3339()),
                    c.raw_seen,
                    c.created,
                    c.updated,
                    c.skipped,
                    c.rejected
                );
            }
        }
    }

    Ok(())
}

async fn connect() -> Result<SqliteStore> {
    let config = SyncConfig::from_env()?;
    Ok(SqliteStore::connect(&config.database_url).await?)
}
