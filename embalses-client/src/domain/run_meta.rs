use serde::Serialize;
use time::{Date, OffsetDateTime};

/// Outcome of the last successful ingestion run.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct RunMeta {
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    pub row_count: i64,
}

/// National aggregates over each reservoir's most recent observation.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct NationalSummary {
    pub total_embalses: i64,
    pub porcentaje_medio: Option<f64>,
    pub capacidad_total_hm3: Option<f64>,
    pub volumen_total_hm3: Option<f64>,
    pub ultima_fecha: Option<Date>,
    pub total_cuencas: i64,
}
