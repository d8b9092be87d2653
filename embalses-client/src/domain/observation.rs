use serde::Serialize;
use time::Date;

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Observation {
    #[serde(rename = "fecha")]
    pub obs_date: Date,
    #[serde(rename = "volumen_hm3")]
    pub volume_hm3: Option<f64>,
    #[serde(rename = "porcentaje")]
    pub percentage: Option<f64>,
}
