use embalses_client::{
    db::reservoir_queries::{DateRange, Pagination, ReservoirFilter},
    QueryError,
};
use serde::Deserialize;
use time::{macros::format_description, Date};

/// Raw `/api/embalses` query string. Values are kept as text so malformed
/// input is reported in the API's own error format.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub cuenca: Option<String>,
    pub min_porc: Option<String>,
    pub page: Option<String>,
    pub per_page: Option<String>,
}

/// Raw `/api/embalses/:nombre` query string.
#[derive(Debug, Default, Deserialize)]
pub struct DetailParams {
    pub desde: Option<String>,
    pub hasta: Option<String>,
    pub cuenca: Option<String>,
}

/// Blank parameters count as absent.
fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_int(name: &str, value: &Option<String>) -> Result<Option<i64>, QueryError> {
    present(value)
        .map(|v| {
            v.parse::<i64>()
                .map_err(|_| QueryError::Validation(format!("'{name}' must be an integer, got '{v}'")))
        })
        .transpose()
}

fn parse_percentage(name: &str, value: &Option<String>) -> Result<Option<f64>, QueryError> {
    present(value)
        .map(|v| {
            v.parse::<f64>()
                .ok()
                .filter(|p| p.is_finite())
                .ok_or_else(|| QueryError::Validation(format!("'{name}' must be a number, got '{v}'")))
        })
        .transpose()
}

fn parse_iso_date(name: &str, value: &Option<String>) -> Result<Option<Date>, QueryError> {
    let format = format_description!("[year]-[month]-[day]");
    present(value)
        .map(|v| {
            Date::parse(v, format).map_err(|_| {
                QueryError::Validation(format!("'{name}' must be a date as YYYY-MM-DD, got '{v}'"))
            })
        })
        .transpose()
}

impl ListParams {
    pub fn filter(&self) -> Result<ReservoirFilter, QueryError> {
        Ok(ReservoirFilter {
            basin: present(&self.cuenca).map(str::to_string),
            min_percentage: parse_percentage("min_porc", &self.min_porc)?,
        })
    }

    pub fn pagination(&self, default_per_page: u32, max_per_page: u32) -> Result<Pagination, QueryError> {
        Ok(Pagination::new(
            parse_int("page", &self.page)?,
            parse_int("per_page", &self.per_page)?,
            default_per_page,
            max_per_page,
        ))
    }
}

impl DetailParams {
    pub fn range(&self) -> Result<DateRange, QueryError> {
        DateRange::new(
            parse_iso_date("desde", &self.desde)?,
            parse_iso_date("hasta", &self.hasta)?,
        )
    }

    pub fn basin(&self) -> Option<&str> {
        present(&self.cuenca)
    }
}
