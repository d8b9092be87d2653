use serde::Serialize;
use sqlx::{Sqlite, SqlitePool, QueryBuilder};
use time::Date;

use crate::{
    domain::{NationalSummary, Observation, Reservoir, ReservoirDetail, ReservoirSnapshot, RunMeta},
    error::QueryError,
};

pub const DEFAULT_PER_PAGE: u32 = 50;
pub const MAX_PER_PAGE: u32 = 200;

/// Every reservoir joined with its own most recent observation.
const LATEST_SNAPSHOT_SQL: &str = r#"
    WITH latest AS (
        SELECT reservoir_id, MAX(obs_date) AS obs_date
        FROM observations
        GROUP BY reservoir_id
    )
    SELECT
        r.name,
        r.basin,
        r.region,
        r.capacity_hm3,
        r.electric,
        o.obs_date,
        o.volume_hm3,
        o.percentage
    FROM reservoirs r
    JOIN latest l       ON l.reservoir_id = r.id
    JOIN observations o ON o.reservoir_id = l.reservoir_id
                       AND o.obs_date     = l.obs_date
"#;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReservoirFilter {
    /// Exact basin name.
    pub basin: Option<String>,
    /// Inclusive lower bound on the latest fill percentage.
    pub min_percentage: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
}

impl Pagination {
    /// Clamp the requested page to `>= 1` and `per_page` to `1..=max_per_page`.
    pub fn new(page: Option<i64>, per_page: Option<i64>, default_per_page: u32, max_per_page: u32) -> Self {
        let max_per_page = max_per_page.max(1);
        let page = page.unwrap_or(1).clamp(1, u32::MAX as i64) as u32;
        let per_page = per_page
            .unwrap_or(default_per_page as i64)
            .clamp(1, max_per_page as i64) as u32;
        Self { page, per_page }
    }

    fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.per_page as i64
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(None, None, DEFAULT_PER_PAGE, MAX_PER_PAGE)
    }
}

/// Inclusive date bounds for a reservoir history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub since: Option<Date>,
    pub until: Option<Date>,
}

impl DateRange {
    pub fn new(since: Option<Date>, until: Option<Date>) -> Result<Self, QueryError> {
        if let (Some(s), Some(u)) = (since, until) {
            if s > u {
                return Err(QueryError::Validation(format!(
                    "'desde' ({s}) must not be after 'hasta' ({u})"
                )));
            }
        }
        Ok(Self { since, until })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
    pub pages: i64,
    pub data: Vec<T>,
}

pub async fn run_meta(pool: &SqlitePool) -> Result<RunMeta, QueryError> {
    sqlx::query_as::<_, RunMeta>("SELECT last_updated, row_count FROM run_meta WHERE id = 1")
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| QueryError::Unavailable("no ingestion run has completed yet".to_string()))
}

pub async fn national_summary(pool: &SqlitePool) -> Result<NationalSummary, QueryError> {
    let sql = format!(
        r#"
        SELECT
            COUNT(*)                            AS total_embalses,
            CAST(AVG(s.percentage) AS REAL)     AS porcentaje_medio,
            CAST(SUM(s.capacity_hm3) AS REAL)   AS capacidad_total_hm3,
            CAST(SUM(s.volume_hm3) AS REAL)     AS volumen_total_hm3,
            MAX(s.obs_date)                     AS ultima_fecha,
            COUNT(DISTINCT s.basin)             AS total_cuencas
        FROM ({LATEST_SNAPSHOT_SQL}) s
        "#
    );

    let summary = sqlx::query_as::<_, NationalSummary>(&sql)
        .fetch_one(pool)
        .await?;

    Ok(summary)
}

pub async fn basins(pool: &SqlitePool) -> Result<Vec<String>, QueryError> {
    let rows = sqlx::query_scalar::<_, String>("SELECT DISTINCT basin FROM reservoirs ORDER BY basin")
        .fetch_all(pool)
        .await?;

    Ok(rows)
}

fn push_snapshot_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &ReservoirFilter) {
    builder.push(" WHERE 1 = 1");
    if let Some(basin) = &filter.basin {
        builder.push(" AND r.basin = ").push_bind(basin.clone());
    }
    if let Some(min) = filter.min_percentage {
        builder.push(" AND o.percentage >= ").push_bind(min);
    }
}

/// One page of reservoirs at their latest observation, ordered by name with
/// case and accents folded.
///
/// The count and the page are read inside one transaction so `total` always
/// matches the rows the page was cut from.
pub async fn list_reservoirs(
    pool: &SqlitePool,
    filter: &ReservoirFilter,
    pagination: Pagination,
) -> Result<Page<ReservoirSnapshot>, QueryError> {
    let mut tx = pool.begin().await?;

    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM (");
    count.push(LATEST_SNAPSHOT_SQL);
    push_snapshot_filter(&mut count, filter);
    count.push(")");
    let total: i64 = count.build_query_scalar().fetch_one(&mut *tx).await?;

    let mut select = QueryBuilder::<Sqlite>::new(LATEST_SNAPSHOT_SQL);
    push_snapshot_filter(&mut select, filter);
    select
        .push(" ORDER BY r.sort_key, r.name, r.basin LIMIT ")
        .push_bind(pagination.per_page as i64)
        .push(" OFFSET ")
        .push_bind(pagination.offset());
    let data = select
        .build_query_as::<ReservoirSnapshot>()
        .fetch_all(&mut *tx)
        .await?;

    tx.commit().await?;

    let per_page = pagination.per_page as i64;
    Ok(Page {
        total,
        page: pagination.page,
        per_page: pagination.per_page,
        pages: (total + per_page - 1) / per_page,
        data,
    })
}

/// Look a reservoir up by name (case-insensitive, exact) and return its
/// history within `range`.
///
/// Names are only unique within a basin; when `basin` is not given and several
/// basins share the name, the alphabetically first basin wins.
pub async fn reservoir_detail(
    pool: &SqlitePool,
    name: &str,
    basin: Option<&str>,
    range: DateRange,
) -> Result<ReservoirDetail, QueryError> {
    let mut tx = pool.begin().await?;

    let mut lookup = QueryBuilder::<Sqlite>::new(
        "SELECT id, name, basin, region, capacity_hm3, electric FROM reservoirs WHERE name_key = ",
    );
    lookup.push_bind(name.trim().to_lowercase());
    if let Some(basin) = basin {
        lookup.push(" AND basin = ").push_bind(basin.to_string());
    }
    lookup.push(" ORDER BY basin LIMIT 1");

    let reservoir = lookup
        .build_query_as::<Reservoir>()
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| QueryError::NotFound(format!("embalse '{name}' no encontrado")))?;

    let mut history = QueryBuilder::<Sqlite>::new(
        "SELECT obs_date, volume_hm3, percentage FROM observations WHERE reservoir_id = ",
    );
    history.push_bind(reservoir.id);
    if let Some(since) = range.since {
        history.push(" AND obs_date >= ").push_bind(since);
    }
    if let Some(until) = range.until {
        history.push(" AND obs_date <= ").push_bind(until);
    }
    history.push(" ORDER BY obs_date ASC");

    let history = history
        .build_query_as::<Observation>()
        .fetch_all(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(ReservoirDetail {
        name: reservoir.name,
        basin: reservoir.basin,
        region: reservoir.region,
        capacity_hm3: reservoir.capacity_hm3,
        electric: reservoir.electric,
        latest: history.last().cloned(),
        history,
    })
}
