use crate::pipeline::{Envelope, PipelineError, Transform};
use embalses_client::domain::RawRecord;
use time::{macros::date, Date};

/// First and last (exclusive) dates a bulletin observation may carry.
pub const MIN_OBS_DATE: Date = date!(1988 - 01 - 01);
pub const MAX_OBS_DATE: Date = date!(2100 - 01 - 01);

/// Fill a missing percentage from `volume / capacity * 100`, rounded to two
/// decimals. Published percentages are left untouched.
pub fn derive_percentage(mut env: Envelope<RawRecord>) -> Envelope<RawRecord> {
    let r = &mut env.payload;
    if r.percentage.is_none() {
        if let (Some(volume), Some(capacity)) = (r.volume_hm3, r.capacity_hm3) {
            if capacity > 0.0 {
                r.percentage = Some((volume / capacity * 10_000.0).round() / 100.0);
            }
        }
    }
    env
}

/// Pure validation of a `RawRecord`.
///
/// Rules:
/// - date must be within [1988-01-01, 2100-01-01).
/// - volume and capacity, when present, must be non-negative.
pub fn validate_record(env: Envelope<RawRecord>) -> Result<Envelope<RawRecord>, PipelineError> {
    let r = &env.payload;

    if r.date < MIN_OBS_DATE || r.date >= MAX_OBS_DATE {
        return Err(PipelineError::Rejected(format!(
            "{} ({}): date {} out of allowed range",
            r.name, r.basin, r.date
        )));
    }

    if r.volume_hm3.is_some_and(|v| v < 0.0) {
        return Err(PipelineError::Rejected(format!(
            "{} ({}) on {}: volume must be non-negative",
            r.name, r.basin, r.date
        )));
    }

    if r.capacity_hm3.is_some_and(|c| c < 0.0) {
        return Err(PipelineError::Rejected(format!(
            "{} ({}): capacity must be non-negative",
            r.name, r.basin
        )));
    }

    Ok(env)
}

#[derive(Clone, Default)]
pub struct PercentageDerivation;

#[async_trait::async_trait]
impl Transform<RawRecord, RawRecord> for PercentageDerivation {
    async fn apply(&self, input: Envelope<RawRecord>) -> Result<Envelope<RawRecord>, PipelineError> {
        Ok(derive_percentage(input))
    }
}

#[derive(Clone, Default)]
pub struct RecordValidation;

#[async_trait::async_trait]
impl Transform<RawRecord, RawRecord> for RecordValidation {
    async fn apply(&self, input: Envelope<RawRecord>) -> Result<Envelope<RawRecord>, PipelineError> {
        match validate_record(input) {
            Ok(env) => Ok(env),
            Err(e) => {
                metrics::counter!("validation_rejected_total").increment(1);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(date: Date, capacity: Option<f64>, volume: Option<f64>, percentage: Option<f64>) -> Envelope<RawRecord> {
        Envelope::new(RawRecord {
            name: "Alcántara".to_string(),
            basin: "Tajo".to_string(),
            region: Some("Extremadura".to_string()),
            capacity_hm3: capacity,
            volume_hm3: volume,
            percentage,
            electric: Some(true),
            date,
        })
    }

    #[test]
    fn derives_missing_percentage_rounded_to_two_decimals() {
        let env = derive_percentage(record(date!(2024 - 01 - 02), Some(3162.0), Some(1890.4), None));
        assert_eq!(env.payload.percentage, Some(59.78));
    }

    #[test]
    fn keeps_published_percentage() {
        let env = derive_percentage(record(date!(2024 - 01 - 02), Some(3162.0), Some(1890.4), Some(60.0)));
        assert_eq!(env.payload.percentage, Some(60.0));
    }

    #[test]
    fn cannot_derive_without_positive_capacity() {
        let env = derive_percentage(record(date!(2024 - 01 - 02), Some(0.0), Some(10.0), None));
        assert_eq!(env.payload.percentage, None);
        let env = derive_percentage(record(date!(2024 - 01 - 02), None, Some(10.0), None));
        assert_eq!(env.payload.percentage, None);
        let env = derive_percentage(record(date!(2024 - 01 - 02), Some(100.0), None, None));
        assert_eq!(env.payload.percentage, None);
    }

    #[test]
    fn validation_accepts_valid_record() {
        assert!(validate_record(record(date!(2024 - 01 - 02), Some(3162.0), Some(1890.4), None)).is_ok());
        assert!(validate_record(record(MIN_OBS_DATE, None, None, None)).is_ok());
    }

    #[test]
    fn validation_rejects_out_of_range_dates() {
        let res = validate_record(record(date!(1987 - 12 - 31), Some(1.0), Some(1.0), None));
        assert!(matches!(res, Err(PipelineError::Rejected(_))));
        let res = validate_record(record(MAX_OBS_DATE, Some(1.0), Some(1.0), None));
        assert!(matches!(res, Err(PipelineError::Rejected(_))));
    }

    #[test]
    fn validation_rejects_negative_quantities() {
        let res = validate_record(record(date!(2024 - 01 - 02), Some(3162.0), Some(-0.1), None));
        assert!(matches!(res, Err(PipelineError::Rejected(msg)) if msg.contains("volume")));
        let res = validate_record(record(date!(2024 - 01 - 02), Some(-1.0), Some(1.0), None));
        assert!(matches!(res, Err(PipelineError::Rejected(msg)) if msg.contains("capacity")));
    }

    #[tokio::test]
    async fn transforms_chain_in_pipeline_order() {
        let env = PercentageDerivation
            .apply(record(date!(2024 - 01 - 09), Some(3162.0), Some(1900.0), None))
            .await
            .unwrap();
        let env = RecordValidation.apply(env).await.unwrap();
        assert_eq!(env.payload.percentage, Some(60.09));
    }
}
