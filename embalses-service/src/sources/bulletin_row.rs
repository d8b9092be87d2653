use embalses_client::domain::RawRecord;
use time::{Date, Month};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Name,
    Basin,
    Region,
    Capacity,
    Volume,
    Percentage,
    Date,
    Electric,
}

/// Header spellings seen in MITECO exports, after normalization.
const COLUMN_ALIASES: &[(&str, Column)] = &[
    ("EMBALSE_NOMBRE", Column::Name),
    ("NOMBRE_EMBALSE", Column::Name),
    ("EMBALSE", Column::Name),
    ("NOMBRE", Column::Name),
    ("AMBITO_NOMBRE", Column::Basin),
    ("CUENCA", Column::Basin),
    ("AMBITO", Column::Basin),
    ("COMUNIDAD", Column::Region),
    ("COMUNIDAD_AUTONOMA", Column::Region),
    ("CCAA", Column::Region),
    ("AGUA_TOTAL", Column::Capacity),
    ("CAPACIDAD", Column::Capacity),
    ("CAPACIDAD_TOTAL", Column::Capacity),
    ("CAP_TOTAL", Column::Capacity),
    ("AGUA_ACTUAL", Column::Volume),
    ("VOLUMEN", Column::Volume),
    ("PORCENTAJE", Column::Percentage),
    ("PORC", Column::Percentage),
    ("FECHA", Column::Date),
    ("ELECTRICO_FLAG", Column::Electric),
];

fn normalize_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .trim()
        .trim_matches('"')
        .trim()
        .to_uppercase()
        .replace(' ', "_")
}

fn column_for(header: &str) -> Option<Column> {
    let normalized = normalize_header(header);
    COLUMN_ALIASES
        .iter()
        .find(|(alias, _)| *alias == normalized)
        .map(|(_, column)| *column)
}

/// Positions of the bulletin columns within one tabular file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    name: usize,
    basin: usize,
    region: Option<usize>,
    capacity: Option<usize>,
    volume: usize,
    percentage: Option<usize>,
    date: usize,
    electric: Option<usize>,
}

impl ColumnMap {
    /// Resolve header positions. The first header matching a column wins.
    ///
    /// A file without name, basin, date or volume columns is not a bulletin
    /// table we understand; the reason is returned rather than mis-parsing it.
    pub fn from_headers<'a, I>(headers: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let headers: Vec<&str> = headers.into_iter().collect();
        let find = |wanted: Column| headers.iter().position(|h| column_for(h) == Some(wanted));
        let require = |wanted: Column, label: &str| {
            find(wanted).ok_or_else(|| format!("missing {label} column (headers: {headers:?})"))
        };

        Ok(Self {
            name: require(Column::Name, "reservoir name")?,
            basin: require(Column::Basin, "basin")?,
            region: find(Column::Region),
            capacity: find(Column::Capacity),
            volume: require(Column::Volume, "volume")?,
            percentage: find(Column::Percentage),
            date: require(Column::Date, "date")?,
            electric: find(Column::Electric),
        })
    }

    /// Map one row. Unparsable numeric cells become `None`; a row without a
    /// name, basin or readable date is returned as `Err` with the reason.
    pub fn to_record(&self, fields: &[String]) -> Result<RawRecord, String> {
        let get = |idx: usize| fields.get(idx).map(|s| s.as_str()).unwrap_or("");
        let get_opt = |idx: Option<usize>| idx.map(get).unwrap_or("");

        let name = parse_optional_string(get(self.name)).ok_or("missing reservoir name")?;
        let basin = parse_optional_string(get(self.basin)).ok_or("missing basin")?;
        let date_str = get(self.date);
        let date = parse_date(date_str).ok_or_else(|| format!("unreadable date '{date_str}'"))?;

        Ok(RawRecord {
            name,
            basin,
            region: parse_optional_string(get_opt(self.region)),
            capacity_hm3: parse_decimal(get_opt(self.capacity)),
            volume_hm3: parse_decimal(get(self.volume)),
            percentage: parse_decimal(get_opt(self.percentage)),
            electric: parse_flag(get_opt(self.electric)),
            date,
        })
    }
}

fn parse_optional_string(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parse a number written with either `,` or `.` as decimal separator.
///
/// When both appear, the rightmost one is the decimal separator and the other
/// is a thousands separator (`1.890,4` and `1,890.4` both give 1890.4).
pub fn parse_decimal(s: &str) -> Option<f64> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }

    let normalized = match (t.rfind(','), t.rfind('.')) {
        (Some(comma), Some(dot)) if dot > comma => t.replace(',', ""),
        (Some(_), _) => t.replace('.', "").replace(',', "."),
        _ => t.to_string(),
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "-1" | "true" | "s" | "si" | "sí" | "yes" | "y" => Some(true),
        "0" | "false" | "n" | "no" => Some(false),
        _ => None,
    }
}

/// Accepts `YYYY-MM-DD` (optionally followed by a time), `DD/MM/YYYY`, and the
/// `MM/DD/YY HH:MM:SS` layout Access exports use.
pub fn parse_date(s: &str) -> Option<Date> {
    let t = s.trim().trim_matches('"');
    let day_part = t.split(|c: char| c.is_whitespace() || c == 'T').next()?;

    if day_part.contains('-') {
        let mut parts = day_part.splitn(3, '-');
        let year: i32 = parts.next()?.parse().ok()?;
        let month: u8 = parts.next()?.parse().ok()?;
        let day: u8 = parts.next()?.parse().ok()?;
        return make_date(year, month, day);
    }

    let parts: Vec<&str> = day_part.split('/').collect();
    if parts.len() != 3 {
        return None;
    }
    match parts[2].len() {
        4 => make_date(parts[2].parse().ok()?, parts[1].parse().ok()?, parts[0].parse().ok()?),
        2 => {
            let yy: i32 = parts[2].parse().ok()?;
            let year = if yy >= 50 { 1900 + yy } else { 2000 + yy };
            make_date(year, parts[0].parse().ok()?, parts[1].parse().ok()?)
        }
        _ => None,
    }
}

fn make_date(year: i32, month: u8, day: u8) -> Option<Date> {
    let month = Month::try_from(month).ok()?;
    Date::from_calendar_date(year, month, day).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn decimal_parsing_tolerates_locale_separators() {
        assert_eq!(parse_decimal("91,00"), Some(91.0));
        assert_eq!(parse_decimal("91.5"), Some(91.5));
        assert_eq!(parse_decimal(" 1.890,4 "), Some(1890.4));
        assert_eq!(parse_decimal("1,890.4"), Some(1890.4));
        assert_eq!(parse_decimal("3162"), Some(3162.0));
        assert_eq!(parse_decimal(""), None);
        assert_eq!(parse_decimal("   "), None);
        assert_eq!(parse_decimal("n/d"), None);
        assert_eq!(parse_decimal("NaN"), None);
    }

    #[test]
    fn date_parsing_accepts_published_layouts() {
        assert_eq!(parse_date("2024-01-09"), Some(date!(2024 - 01 - 09)));
        assert_eq!(parse_date("2024-01-09 00:00:00"), Some(date!(2024 - 01 - 09)));
        assert_eq!(parse_date("2024-01-09T00:00:00"), Some(date!(2024 - 01 - 09)));
        assert_eq!(parse_date("09/01/2024"), Some(date!(2024 - 01 - 09)));
        assert_eq!(parse_date("01/09/24 00:00:00"), Some(date!(2024 - 01 - 09)));
        assert_eq!(parse_date("03/15/88 00:00:00"), Some(date!(1988 - 03 - 15)));
        assert_eq!(parse_date("2024-02-30"), None);
        assert_eq!(parse_date("semana 2"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn headers_resolve_through_aliases() {
        let map = ColumnMap::from_headers([
            "\u{feff}AMBITO_NOMBRE",
            "embalse nombre",
            "FECHA",
            "AGUA_TOTAL",
            "AGUA_ACTUAL",
            "ELECTRICO_FLAG",
        ])
        .unwrap();

        assert_eq!(map.basin, 0);
        assert_eq!(map.name, 1);
        assert_eq!(map.date, 2);
        assert_eq!(map.capacity, Some(3));
        assert_eq!(map.volume, 4);
        assert_eq!(map.electric, Some(5));
        assert_eq!(map.region, None);
        assert_eq!(map.percentage, None);
    }

    #[test]
    fn missing_required_column_is_reported() {
        let res = ColumnMap::from_headers(["EMBALSE_NOMBRE", "AMBITO_NOMBRE", "AGUA_ACTUAL"]);
        match res {
            Err(msg) => {
                assert!(msg.starts_with("missing date column"));
                assert!(!msg.contains("parse error"));
            }
            other => panic!("expected missing column, got {other:?}"),
        }
    }

    #[test]
    fn row_maps_to_record_with_nullable_numbers() {
        let map = ColumnMap::from_headers([
            "CUENCA", "EMBALSE", "COMUNIDAD", "CAPACIDAD", "VOLUMEN", "PORCENTAJE", "FECHA",
        ])
        .unwrap();

        let rec = map
            .to_record(&row(&["Tajo", "Alcántara", "Extremadura", "3.162,0", "1890,4", "", "02/01/2024"]))
            .unwrap();
        assert_eq!(rec.name, "Alcántara");
        assert_eq!(rec.basin, "Tajo");
        assert_eq!(rec.region.as_deref(), Some("Extremadura"));
        assert_eq!(rec.capacity_hm3, Some(3162.0));
        assert_eq!(rec.volume_hm3, Some(1890.4));
        assert_eq!(rec.percentage, None);
        assert_eq!(rec.electric, None);
        assert_eq!(rec.date, date!(2024 - 01 - 02));

        let rec = map
            .to_record(&row(&["Tajo", "Alcántara", "", "-", "", "", "2024-01-09"]))
            .unwrap();
        assert_eq!(rec.region, None);
        assert_eq!(rec.capacity_hm3, None);
        assert_eq!(rec.volume_hm3, None);
    }

    #[test]
    fn rows_without_identity_or_date_are_skipped() {
        let map = ColumnMap::from_headers(["CUENCA", "EMBALSE", "VOLUMEN", "FECHA"]).unwrap();

        assert!(map.to_record(&row(&["Tajo", " ", "1", "2024-01-09"])).is_err());
        assert!(map.to_record(&row(&["", "Alcántara", "1", "2024-01-09"])).is_err());
        assert!(map.to_record(&row(&["Tajo", "Alcántara", "1", "mañana"])).is_err());
        // Short rows are treated as blank cells.
        assert!(map.to_record(&row(&["Tajo", "Alcántara"])).is_err());
    }

    #[test]
    fn electric_flag_accepts_access_booleans() {
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag("-1"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("Sí"), Some(true));
        assert_eq!(parse_flag(""), None);
    }
}
