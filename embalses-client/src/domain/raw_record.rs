use time::Date;

/// One normalized row of the published bulletin, as produced by the fetcher.
///
/// Numeric fields are `None` when the bulletin cell was blank or could not be
/// parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub name: String,
    pub basin: String,
    pub region: Option<String>,
    pub capacity_hm3: Option<f64>,
    pub volume_hm3: Option<f64>,
    pub percentage: Option<f64>,
    pub electric: Option<bool>,
    pub date: Date,
}
