//! Historical store: de-duplicated properties, price history, scrape sessions and analyses.
//!
//! [`HistoricalStore`] is the contract the sync pipeline writes through;
//! [`SqliteStore`] implements it over sqlx/SQLite with embedded migrations.
//! Every mutating call runs in its own transaction.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use estate_core::{
    Analysis, Assessment, EnergyRating, Fingerprint, HistoryMode, Listing, PriceHistoryEntry, Property,
    RenovationProjection, ScrapeSession, SessionCounters, SessionMode, SessionStats,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "estate-storage";

/// Prices closer than this are treated as unchanged.
const PRICE_EPSILON: f64 = 0.01;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable while {context}: {source}")]
    Unavailable {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("store migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("corrupt {table} row: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

impl StoreError {
    /// Constraint violations concern a single record; everything else means the store cannot be trusted.
    pub fn is_constraint(&self) -> bool {
        matches!(self, StoreError::Constraint(_))
    }
}

fn unavailable(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |source| StoreError::Unavailable { context, source }
}

/// Unique and CHECK violations reject one row; any other failure is unavailability.
fn rejected_or_unavailable(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |source| match &source {
        sqlx::Error::Database(db) if db.is_unique_violation() || db.is_check_violation() => {
            StoreError::Constraint(format!("{context}: {}", db.message()))
        }
        _ => StoreError::Unavailable { context, source },
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub property: Property,
    pub is_new: bool,
    pub price_changed: bool,
}

#[async_trait]
pub trait HistoricalStore: Send + Sync {
    /// Clears properties and price history in [`HistoryMode::Fresh`]; no-op in cumulative mode.
    async fn prepare(&self, mode: HistoryMode) -> Result<(), StoreError>;

    async fn begin_session(
        &self,
        source_id: &str,
        mode: SessionMode,
        started_at: DateTime<Utc>,
    ) -> Result<ScrapeSession, StoreError>;

    /// Writes final counters. A completed session cannot be completed again.
    async fn complete_session(
        &self,
        session_id: Uuid,
        counters: SessionCounters,
        completed_at: DateTime<Utc>,
    ) -> Result<ScrapeSession, StoreError>;

    async fn upsert(
        &self,
        listing: &Listing,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError>;

    /// At most one analysis per (fingerprint, session); a duplicate is a [`StoreError::Constraint`].
    async fn record_analysis(&self, analysis: &Analysis) -> Result<(), StoreError>;

    /// Superseded prices for a property, oldest first.
    async fn history(&self, fingerprint: &Fingerprint) -> Result<Vec<PriceHistoryEntry>, StoreError>;

    async fn latest_analyses_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<HashMap<Fingerprint, Analysis>, StoreError>;

    /// Every analysis ever recorded for a property, oldest first.
    async fn analysis_trend(&self, fingerprint: &Fingerprint) -> Result<Vec<Analysis>, StoreError>;

    async fn property(&self, fingerprint: &Fingerprint) -> Result<Option<Property>, StoreError>;

    async fn properties_seen_in_session(&self, session_id: Uuid) -> Result<Vec<Property>, StoreError>;

    async fn session(&self, session_id: Uuid) -> Result<Option<ScrapeSession>, StoreError>;

    /// Most recent sessions first.
    async fn sessions(&self, limit: usize) -> Result<Vec<ScrapeSession>, StoreError>;

    async fn latest_completed_session(&self) -> Result<Option<ScrapeSession>, StoreError>;

    /// Session count and the start of the oldest session, completed or not.
    async fn session_stats(&self) -> Result<SessionStats, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `database_url` and applies migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(unavailable("parsing the database url"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(unavailable("connecting"))?;
        let store = Self { pool };
        store.migrate().await?;
        info!(database_url, "historical store ready");
        Ok(store)
    }

    /// Private in-memory database; a single pinned connection keeps it alive.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(unavailable("parsing the database url"))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(unavailable("connecting"))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn session_by_id(&self, session_id: Uuid) -> Result<Option<ScrapeSession>, StoreError> {
        let row = sqlx::query(SESSION_SELECT_BY_ID)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable("loading a session"))?;
        row.as_ref().map(session_from_row).transpose()
    }
}

const PROPERTY_COLUMNS: &str = "fingerprint, title, area, size_m2, price, rooms, energy_rating, \
     description, url, first_seen, last_seen, last_session_id";

const SESSION_SELECT_BY_ID: &str = "SELECT id, source_id, mode, started_at, completed_at, raw_seen, \
     created, updated, skipped, rejected FROM scrape_sessions WHERE id = ?";

const ANALYSIS_COLUMNS: &str = "fingerprint, session_id, score, price_m2, market_avg_price_m2, \
     price_vs_market_pct, rental_yield_pct, roi_5yr_pct, undervalued, renovation_cost, \
     post_renovation_value, capital_gain, commentary, analyzed_at";

#[async_trait]
impl HistoricalStore for SqliteStore {
    async fn prepare(&self, mode: HistoryMode) -> Result<(), StoreError> {
        match mode {
            HistoryMode::Cumulative => {
                debug!("cumulative history mode; keeping existing properties");
                Ok(())
            }
            HistoryMode::Fresh => {
                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(unavailable("opening the reset transaction"))?;
                let history = sqlx::query("DELETE FROM price_history")
                    .execute(&mut *tx)
                    .await
                    .map_err(unavailable("clearing price history"))?;
                let properties = sqlx::query("DELETE FROM properties")
                    .execute(&mut *tx)
                    .await
                    .map_err(unavailable("clearing properties"))?;
                tx.commit()
                    .await
                    .map_err(unavailable("committing the reset"))?;
                info!(
                    properties = properties.rows_affected(),
                    price_history = history.rows_affected(),
                    "fresh history mode; cleared property state"
                );
                Ok(())
            }
        }
    }

    async fn begin_session(
        &self,
        source_id: &str,
        mode: SessionMode,
        started_at: DateTime<Utc>,
    ) -> Result<ScrapeSession, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO scrape_sessions (id, source_id, mode, started_at) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(source_id)
            .bind(mode.as_str())
            .bind(started_at)
            .execute(&self.pool)
            .await
            .map_err(unavailable("creating a session"))?;
        debug!(session_id = %id, source_id, mode = mode.as_str(), "session opened");
        Ok(ScrapeSession {
            id,
            source_id: source_id.to_string(),
            mode,
            started_at,
            completed_at: None,
            counters: SessionCounters::default(),
        })
    }

    async fn complete_session(
        &self,
        session_id: Uuid,
        counters: SessionCounters,
        completed_at: DateTime<Utc>,
    ) -> Result<ScrapeSession, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_sessions
               SET completed_at = ?, raw_seen = ?, created = ?, updated = ?, skipped = ?, rejected = ?
             WHERE id = ?
               AND completed_at IS NULL
            "#,
        )
        .bind(completed_at)
        .bind(i64::from(counters.raw_seen))
        .bind(i64::from(counters.created))
        .bind(i64::from(counters.updated))
        .bind(i64::from(counters.skipped))
        .bind(i64::from(counters.rejected))
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(unavailable("completing a session"))?;

        if result.rows_affected() == 0 {
            return Err(match self.session_by_id(session_id).await? {
                Some(_) => StoreError::Constraint(format!("session {session_id} is already completed")),
                None => StoreError::Constraint(format!("session {session_id} does not exist")),
            });
        }

        self.session_by_id(session_id)
            .await?
            .ok_or_else(|| StoreError::Constraint(format!("session {session_id} vanished")))
    }

    async fn upsert(
        &self,
        listing: &Listing,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let fingerprint = listing.fingerprint();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(unavailable("opening the upsert transaction"))?;

        let existing = sqlx::query(&format!(
            "SELECT {PROPERTY_COLUMNS} FROM properties WHERE fingerprint = ?"
        ))
        .bind(fingerprint.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable("looking up a property"))?;

        let Some(row) = existing else {
            let property = Property {
                fingerprint: fingerprint.clone(),
                title: listing.title.clone(),
                area: listing.area.clone(),
                size_m2: listing.size_m2,
                price: listing.price,
                rooms: listing.rooms,
                energy_rating: listing.energy_rating,
                description: listing.description.clone(),
                url: listing.url.clone(),
                first_seen: now,
                last_seen: now,
                last_session_id: session_id,
            };
            sqlx::query(&format!(
                "INSERT INTO properties ({PROPERTY_COLUMNS}, price_m2) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(property.fingerprint.as_str())
            .bind(&property.title)
            .bind(&property.area)
            .bind(property.size_m2)
            .bind(property.price)
            .bind(property.rooms.map(i64::from))
            .bind(property.energy_rating.map(EnergyRating::as_str))
            .bind(property.description.as_deref())
            .bind(property.url.as_deref())
            .bind(property.first_seen)
            .bind(property.last_seen)
            .bind(property.last_session_id)
            .bind(property.price_m2())
            .execute(&mut *tx)
            .await
            .map_err(rejected_or_unavailable("inserting a property"))?;
            tx.commit()
                .await
                .map_err(unavailable("committing the upsert"))?;
            debug!(fingerprint = fingerprint.short(), "new property");
            return Ok(UpsertOutcome {
                property,
                is_new: true,
                price_changed: false,
            });
        };

        let mut property = property_from_row(&row)?;
        // An earlier clock reading never moves last_seen backwards.
        let seen_at = property.last_seen.max(now);
        let price_changed = (property.price - listing.price).abs() >= PRICE_EPSILON;

        if price_changed {
            sqlx::query(
                "INSERT INTO price_history (fingerprint, price, price_m2, observed_at, session_id) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(property.fingerprint.as_str())
            .bind(property.price)
            .bind(property.price_m2())
            .bind(seen_at)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(unavailable("appending price history"))?;
            debug!(
                fingerprint = property.fingerprint.short(),
                previous = property.price,
                current = listing.price,
                "price change"
            );
            property.price = listing.price;
        }

        property.last_seen = seen_at;
        property.last_session_id = session_id;
        property.rooms = listing.rooms.or(property.rooms);
        property.energy_rating = listing.energy_rating.or(property.energy_rating);
        if listing.description.is_some() {
            property.description = listing.description.clone();
        }
        if listing.url.is_some() {
            property.url = listing.url.clone();
        }

        sqlx::query(
            r#"
            UPDATE properties
               SET price = ?, price_m2 = ?, rooms = ?, energy_rating = ?, description = ?, url = ?,
                   last_seen = ?, last_session_id = ?
             WHERE fingerprint = ?
            "#,
        )
        .bind(property.price)
        .bind(property.price_m2())
        .bind(property.rooms.map(i64::from))
        .bind(property.energy_rating.map(EnergyRating::as_str))
        .bind(property.description.as_deref())
        .bind(property.url.as_deref())
        .bind(property.last_seen)
        .bind(property.last_session_id)
        .bind(property.fingerprint.as_str())
        .execute(&mut *tx)
        .await
        .map_err(rejected_or_unavailable("updating a property"))?;
        tx.commit()
            .await
            .map_err(unavailable("committing the upsert"))?;

        Ok(UpsertOutcome {
            property,
            is_new: false,
            price_changed,
        })
    }

    async fn record_analysis(&self, analysis: &Analysis) -> Result<(), StoreError> {
        let a = &analysis.assessment;
        let result = sqlx::query(&format!(
            "INSERT INTO analyses ({ANALYSIS_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(analysis.fingerprint.as_str())
        .bind(analysis.session_id)
        .bind(a.score)
        .bind(a.price_m2)
        .bind(a.market_avg_price_m2)
        .bind(a.price_vs_market_pct)
        .bind(a.rental_yield_pct)
        .bind(a.roi_5yr_pct)
        .bind(a.undervalued)
        .bind(a.renovation.map(|r| r.cost))
        .bind(a.renovation.map(|r| r.post_renovation_value))
        .bind(a.renovation.map(|r| r.capital_gain))
        .bind(analysis.commentary.as_deref())
        .bind(analysis.analyzed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::Constraint(format!(
                "analysis for property {} already recorded in session {}",
                analysis.fingerprint, analysis.session_id
            ))),
            Err(sqlx::Error::Database(db)) if db.is_check_violation() => Err(StoreError::Constraint(format!(
                "analysis for property {} rejected: {}",
                analysis.fingerprint,
                db.message()
            ))),
            Err(err) => Err(unavailable("recording an analysis")(err)),
        }
    }

    async fn history(&self, fingerprint: &Fingerprint) -> Result<Vec<PriceHistoryEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT fingerprint, price, price_m2, observed_at, session_id
              FROM price_history
             WHERE fingerprint = ?
             ORDER BY id ASC
            "#,
        )
        .bind(fingerprint.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable("loading price history"))?;

        rows.iter()
            .map(|row| {
                Ok(PriceHistoryEntry {
                    fingerprint: Fingerprint::new(get::<String>(row, "fingerprint")?),
                    price: get(row, "price")?,
                    price_m2: get(row, "price_m2")?,
                    observed_at: get(row, "observed_at")?,
                    session_id: get(row, "session_id")?,
                })
            })
            .collect()
    }

    async fn latest_analyses_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<HashMap<Fingerprint, Analysis>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ANALYSIS_COLUMNS} FROM analyses WHERE session_id = ?"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable("loading session analyses"))?;

        rows.iter()
            .map(|row| analysis_from_row(row).map(|a| (a.fingerprint.clone(), a)))
            .collect()
    }

    async fn analysis_trend(&self, fingerprint: &Fingerprint) -> Result<Vec<Analysis>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ANALYSIS_COLUMNS} FROM analyses a \
             JOIN scrape_sessions s ON s.id = a.session_id \
             WHERE a.fingerprint = ? ORDER BY s.seq ASC"
        ))
        .bind(fingerprint.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable("loading analysis trend"))?;
        rows.iter().map(analysis_from_row).collect()
    }

    async fn property(&self, fingerprint: &Fingerprint) -> Result<Option<Property>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PROPERTY_COLUMNS} FROM properties WHERE fingerprint = ?"
        ))
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable("loading a property"))?;
        row.as_ref().map(property_from_row).transpose()
    }

    async fn properties_seen_in_session(&self, session_id: Uuid) -> Result<Vec<Property>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PROPERTY_COLUMNS} FROM properties WHERE last_session_id = ? ORDER BY area, price_m2"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable("loading session properties"))?;
        rows.iter().map(property_from_row).collect()
    }

    async fn session(&self, session_id: Uuid) -> Result<Option<ScrapeSession>, StoreError> {
        self.session_by_id(session_id).await
    }

    async fn sessions(&self, limit: usize) -> Result<Vec<ScrapeSession>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT id, source_id, mode, started_at, completed_at, raw_seen, created, updated, skipped, rejected
              FROM scrape_sessions
             ORDER BY seq DESC
             LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable("listing sessions"))?;
        rows.iter().map(session_from_row).collect()
    }

    async fn latest_completed_session(&self) -> Result<Option<ScrapeSession>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, source_id, mode, started_at, completed_at, raw_seen, created, updated, skipped, rejected
              FROM scrape_sessions
             WHERE completed_at IS NOT NULL
             ORDER BY seq DESC
             LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable("loading the latest session"))?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn session_stats(&self) -> Result<SessionStats, StoreError> {
        let total = sqlx::query("SELECT COUNT(*) AS sessions FROM scrape_sessions")
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable("counting sessions"))?;
        let sessions: i64 = get(&total, "sessions")?;

        let oldest = sqlx::query("SELECT started_at FROM scrape_sessions ORDER BY seq ASC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable("loading the oldest session"))?;
        let tracking_since = oldest
            .as_ref()
            .map(|row| get::<DateTime<Utc>>(row, "started_at"))
            .transpose()?;

        Ok(SessionStats {
            sessions: u64::try_from(sessions).unwrap_or_default(),
            tracking_since,
        })
    }
}

fn get<'r, T>(row: &'r SqliteRow, column: &'static str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column).map_err(unavailable("decoding a row"))
}

fn count(row: &SqliteRow, column: &'static str) -> Result<u32, StoreError> {
    let raw: i64 = get(row, column)?;
    u32::try_from(raw).map_err(|_| StoreError::Corrupt {
        table: "scrape_sessions",
        detail: format!("{column} = {raw}"),
    })
}

fn energy_rating(row: &SqliteRow, table: &'static str) -> Result<Option<EnergyRating>, StoreError> {
    let raw: Option<String> = get(row, "energy_rating")?;
    raw.map(|r| {
        EnergyRating::parse(&r).ok_or_else(|| StoreError::Corrupt {
            table,
            detail: format!("energy_rating = {r}"),
        })
    })
    .transpose()
}

fn property_from_row(row: &SqliteRow) -> Result<Property, StoreError> {
    let rooms: Option<i64> = get(row, "rooms")?;
    Ok(Property {
        fingerprint: Fingerprint::new(get::<String>(row, "fingerprint")?),
        title: get(row, "title")?,
        area: get(row, "area")?,
        size_m2: get(row, "size_m2")?,
        price: get(row, "price")?,
        rooms: rooms.and_then(|r| u32::try_from(r).ok()),
        energy_rating: energy_rating(row, "properties")?,
        description: get(row, "description")?,
        url: get(row, "url")?,
        first_seen: get(row, "first_seen")?,
        last_seen: get(row, "last_seen")?,
        last_session_id: get(row, "last_session_id")?,
    })
}

fn session_from_row(row: &SqliteRow) -> Result<ScrapeSession, StoreError> {
    let mode: String = get(row, "mode")?;
    Ok(ScrapeSession {
        id: get(row, "id")?,
        source_id: get(row, "source_id")?,
        mode: SessionMode::parse(&mode).ok_or_else(|| StoreError::Corrupt {
            table: "scrape_sessions",
            detail: format!("mode = {mode}"),
        })?,
        started_at: get(row, "started_at")?,
        completed_at: get(row, "completed_at")?,
        counters: SessionCounters {
            raw_seen: count(row, "raw_seen")?,
            created: count(row, "created")?,
            updated: count(row, "updated")?,
            skipped: count(row, "skipped")?,
            rejected: count(row, "rejected")?,
        },
    })
}

fn analysis_from_row(row: &SqliteRow) -> Result<Analysis, StoreError> {
    let cost: Option<f64> = get(row, "renovation_cost")?;
    let post_value: Option<f64> = get(row, "post_renovation_value")?;
    let gain: Option<f64> = get(row, "capital_gain")?;
    let renovation = match (cost, post_value, gain) {
        (Some(cost), Some(post_renovation_value), Some(capital_gain)) => Some(RenovationProjection {
            cost,
            post_renovation_value,
            capital_gain,
        }),
        _ => None,
    };

    Ok(Analysis {
        fingerprint: Fingerprint::new(get::<String>(row, "fingerprint")?),
        session_id: get(row, "session_id")?,
        assessment: Assessment {
            score: get(row, "score")?,
            price_m2: get(row, "price_m2")?,
            market_avg_price_m2: get(row, "market_avg_price_m2")?,
            price_vs_market_pct: get(row, "price_vs_market_pct")?,
            rental_yield_pct: get(row, "rental_yield_pct")?,
            roi_5yr_pct: get(row, "roi_5yr_pct")?,
            undervalued: get(row, "undervalued")?,
            renovation,
        },
        commentary: get(row, "commentary")?,
        analyzed_at: get(row, "analyzed_at")?,
    })
}
