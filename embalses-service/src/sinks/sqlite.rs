use std::{
    collections::{hash_map::Entry, HashMap},
    time::SystemTime,
};

use embalses_client::{db, domain::RawRecord};
use futures::StreamExt;
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use time::OffsetDateTime;

use crate::pipeline::{Envelope, PipelineError, Sink};

/// Counts reported by one loader run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub rejected: u64,
}

impl RunResult {
    /// Records written or confirmed by this run; rejected records excluded.
    pub fn applied(&self) -> u64 {
        self.inserted + self.updated + self.unchanged
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredReservoir {
    id: i64,
    region: Option<String>,
    capacity_hm3: Option<f64>,
    electric: Option<bool>,
}

enum ObservationWrite {
    Inserted,
    Updated,
    Unchanged,
}

fn storage(e: sqlx::Error) -> PipelineError {
    PipelineError::Storage(e.to_string())
}

/// Applies a whole bulletin as one SQLite transaction.
///
/// Reservoirs are upserted by (name, basin) and observations by
/// (reservoir, date). Nothing is visible to readers until the final commit;
/// any fatal upstream error rolls the batch back and leaves the previous
/// contents in place.
pub struct SqliteLoader {
    pool: SqlitePool,
}

impl SqliteLoader {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load an in-memory record set.
    pub async fn load(&self, records: Vec<RawRecord>) -> Result<RunResult, PipelineError> {
        let input = futures::stream::iter(records.into_iter().map(|r| Ok(Envelope::new(r))));
        self.run(input).await
    }

    async fn find_or_create_reservoir(
        conn: &mut SqliteConnection,
        rec: &RawRecord,
    ) -> Result<StoredReservoir, sqlx::Error> {
        let existing = sqlx::query_as::<_, StoredReservoir>(
            "SELECT id, region, capacity_hm3, electric FROM reservoirs WHERE name = ? AND basin = ?",
        )
        .bind(&rec.name)
        .bind(&rec.basin)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(stored) = existing {
            return Ok(stored);
        }

        let id = sqlx::query(
            "INSERT INTO reservoirs (name, name_key, sort_key, basin, region, capacity_hm3, electric) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&rec.name)
        .bind(rec.name.to_lowercase())
        .bind(db::sort_key(&rec.name))
        .bind(&rec.basin)
        .bind(&rec.region)
        .bind(rec.capacity_hm3)
        .bind(rec.electric)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        tracing::debug!(name = %rec.name, basin = %rec.basin, id, "new reservoir");
        Ok(StoredReservoir {
            id,
            region: rec.region.clone(),
            capacity_hm3: rec.capacity_hm3,
            electric: rec.electric,
        })
    }

    async fn upsert_reservoir(
        conn: &mut SqliteConnection,
        cache: &mut HashMap<(String, String), StoredReservoir>,
        rec: &RawRecord,
    ) -> Result<i64, sqlx::Error> {
        let stored = match cache.entry((rec.name.clone(), rec.basin.clone())) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(Self::find_or_create_reservoir(conn, rec).await?),
        };

        // Blank cells never erase what an earlier bulletin published.
        let region = rec.region.clone().or_else(|| stored.region.clone());
        let capacity_hm3 = rec.capacity_hm3.or(stored.capacity_hm3);
        let electric = rec.electric.or(stored.electric);

        if region != stored.region || capacity_hm3 != stored.capacity_hm3 || electric != stored.electric {
            sqlx::query("UPDATE reservoirs SET region = ?, capacity_hm3 = ?, electric = ? WHERE id = ?")
                .bind(&region)
                .bind(capacity_hm3)
                .bind(electric)
                .bind(stored.id)
                .execute(&mut *conn)
                .await?;

            tracing::info!(
                name = %rec.name,
                basin = %rec.basin,
                old_capacity = ?stored.capacity_hm3,
                new_capacity = ?capacity_hm3,
                "reservoir attributes corrected"
            );
            metrics::counter!("loader_reservoirs_corrected_total").increment(1);

            stored.region = region;
            stored.capacity_hm3 = capacity_hm3;
            stored.electric = electric;
        }

        Ok(stored.id)
    }

    async fn upsert_observation(
        conn: &mut SqliteConnection,
        reservoir_id: i64,
        rec: &RawRecord,
    ) -> Result<ObservationWrite, sqlx::Error> {
        let existing = sqlx::query_as::<_, (Option<f64>, Option<f64>)>(
            "SELECT volume_hm3, percentage FROM observations WHERE reservoir_id = ? AND obs_date = ?",
        )
        .bind(reservoir_id)
        .bind(rec.date)
        .fetch_optional(&mut *conn)
        .await?;

        match existing {
            None => {
                sqlx::query(
                    "INSERT INTO observations (reservoir_id, obs_date, volume_hm3, percentage) VALUES (?, ?, ?, ?)",
                )
                .bind(reservoir_id)
                .bind(rec.date)
                .bind(rec.volume_hm3)
                .bind(rec.percentage)
                .execute(&mut *conn)
                .await?;
                Ok(ObservationWrite::Inserted)
            }
            Some((volume, percentage)) if volume == rec.volume_hm3 && percentage == rec.percentage => {
                Ok(ObservationWrite::Unchanged)
            }
            Some(_) => {
                sqlx::query(
                    "UPDATE observations SET volume_hm3 = ?, percentage = ? WHERE reservoir_id = ? AND obs_date = ?",
                )
                .bind(rec.volume_hm3)
                .bind(rec.percentage)
                .bind(reservoir_id)
                .bind(rec.date)
                .execute(&mut *conn)
                .await?;
                Ok(ObservationWrite::Updated)
            }
        }
    }

    async fn apply_record(
        conn: &mut SqliteConnection,
        cache: &mut HashMap<(String, String), StoredReservoir>,
        rec: &RawRecord,
    ) -> Result<ObservationWrite, sqlx::Error> {
        let id = Self::upsert_reservoir(&mut *conn, cache, rec).await?;
        Self::upsert_observation(&mut *conn, id, rec).await
    }

    async fn write_run_meta(&self, applied: u64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO run_meta (id, last_updated, row_count) VALUES (1, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET last_updated = excluded.last_updated, row_count = excluded.row_count",
        )
        .bind(OffsetDateTime::now_utc())
        .bind(applied as i64)
        .execute(&self.pool)
        .await
        .map(|_| ())
    }
}

#[async_trait::async_trait]
impl Sink<RawRecord> for SqliteLoader {
    type Output = RunResult;

    async fn run<S>(&self, mut input: S) -> Result<RunResult, PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<RawRecord>, PipelineError>> + Send + Unpin + 'static,
    {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let mut cache: HashMap<(String, String), StoredReservoir> = HashMap::new();
        let mut result = RunResult::default();
        let mut earliest: Option<SystemTime> = None;

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) if !e.is_fatal() => {
                    tracing::warn!(error = %e, "record rejected, skipping");
                    result.rejected += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "upstream failure, rolling back load");
                    tx.rollback().await.map_err(storage)?;
                    return Err(e);
                }
            };

            earliest = Some(earliest.map_or(env.received_at, |t| t.min(env.received_at)));
            let rec = &env.payload;

            match Self::apply_record(&mut *tx, &mut cache, rec).await {
                Ok(ObservationWrite::Inserted) => result.inserted += 1,
                Ok(ObservationWrite::Updated) => result.updated += 1,
                Ok(ObservationWrite::Unchanged) => result.unchanged += 1,
                Err(e) => {
                    tracing::error!(error = %e, name = %rec.name, date = %rec.date, "loader write failed, rolling back");
                    metrics::counter!("loader_errors_total").increment(1);
                    tx.rollback().await.map_err(storage)?;
                    return Err(storage(e));
                }
            }
        }

        tx.commit().await.map_err(|e| {
            metrics::counter!("loader_errors_total").increment(1);
            storage(e)
        })?;

        metrics::counter!("loader_observations_inserted_total").increment(result.inserted);
        metrics::counter!("loader_observations_updated_total").increment(result.updated);
        metrics::counter!("loader_records_rejected_total").increment(result.rejected);

        if let Some(earliest) = earliest {
            if let Ok(dur) = SystemTime::now().duration_since(earliest) {
                metrics::histogram!("ingest_end_to_end_latency_seconds").record(dur.as_secs_f64());
            }
        }

        self.write_run_meta(result.applied()).await.map_err(storage)?;

        tracing::info!(
            inserted = result.inserted,
            updated = result.updated,
            unchanged = result.unchanged,
            rejected = result.rejected,
            "load committed"
        );

        Ok(result)
    }
}
