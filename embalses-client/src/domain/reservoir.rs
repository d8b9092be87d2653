use serde::Serialize;
use time::Date;

use super::Observation;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Reservoir {
    pub id: i64,
    pub name: String,
    pub basin: String,
    pub region: Option<String>,
    pub capacity_hm3: Option<f64>,
    pub electric: Option<bool>,
}

/// A reservoir paired with its most recent observation.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ReservoirSnapshot {
    #[serde(rename = "nombre")]
    pub name: String,
    #[serde(rename = "cuenca")]
    pub basin: String,
    #[serde(rename = "comunidad")]
    pub region: Option<String>,
    #[serde(rename = "capacidad_hm3")]
    pub capacity_hm3: Option<f64>,
    #[serde(rename = "volumen_hm3")]
    pub volume_hm3: Option<f64>,
    #[serde(rename = "porcentaje")]
    pub percentage: Option<f64>,
    #[serde(rename = "electrico")]
    pub electric: Option<bool>,
    #[serde(rename = "fecha")]
    pub obs_date: Date,
}

/// Identity of a reservoir plus its (optionally date-bounded) history in
/// ascending date order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReservoirDetail {
    #[serde(rename = "nombre")]
    pub name: String,
    #[serde(rename = "cuenca")]
    pub basin: String,
    #[serde(rename = "comunidad")]
    pub region: Option<String>,
    #[serde(rename = "capacidad_hm3")]
    pub capacity_hm3: Option<f64>,
    #[serde(rename = "electrico")]
    pub electric: Option<bool>,
    #[serde(rename = "ultimo_dato")]
    pub latest: Option<Observation>,
    #[serde(rename = "historico")]
    pub history: Vec<Observation>,
}
