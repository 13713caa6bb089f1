use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveDateTime};

/// Date-only layouts found in core-banking extracts, tried in order.
/// Day-first comes before month-first: the bank's extracts are day-first.
pub const DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%Y-%m-%d", "%m/%d/%Y", "%d-%m-%Y", "%Y/%m/%d"];

/// Layouts tried once every `DATE_FORMATS` entry has failed.
const FALLBACK_DATE_FORMATS: &[&str] = &["%d-%b-%Y", "%d %b %Y", "%d-%b-%y", "%Y%m%d"];

const FALLBACK_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%m/%d/%Y %H:%M:%S",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateParse {
    Parsed { date: NaiveDate, format: &'static str },
    Empty,
    Failed { raw: String, reason: String },
}

impl DateParse {
    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            DateParse::Parsed { date, .. } => Some(*date),
            _ => None,
        }
    }
}

pub fn parse_date(raw: Option<&str>) -> DateParse {
    let value = match raw.map(str::trim) {
        None | Some("") => return DateParse::Empty,
        Some(value) => value,
    };

    if value.eq_ignore_ascii_case("nan") || value.eq_ignore_ascii_case("null") {
        return DateParse::Empty;
    }

    for format in DATE_FORMATS.iter().chain(FALLBACK_DATE_FORMATS) {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return DateParse::Parsed { date, format };
        }
    }

    for format in FALLBACK_DATETIME_FORMATS {
        if let Ok(stamp) = NaiveDateTime::parse_from_str(value, format) {
            return DateParse::Parsed {
                date: stamp.date(),
                format,
            };
        }
    }

    if let Ok(stamp) = DateTime::parse_from_rfc3339(value) {
        return DateParse::Parsed {
            date: stamp.date_naive(),
            format: "rfc3339",
        };
    }

    let tried =
        DATE_FORMATS.len() + FALLBACK_DATE_FORMATS.len() + FALLBACK_DATETIME_FORMATS.len() + 1;
    DateParse::Failed {
        raw: value.to_string(),
        reason: format!("no match among {tried} accepted layouts"),
    }
}

pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Last calendar day of the month that `date` falls in.
pub fn last_of_month(date: NaiveDate) -> NaiveDate {
    first_of_month(date)
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .unwrap_or(date)
}

/// First day of every month from `start`'s month through `end`'s month.
/// Empty when `start` is after `end`.
pub fn month_starts(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut months = Vec::new();
    let last = first_of_month(end);
    let mut cursor = first_of_month(start);

    while cursor <= last {
        months.push(cursor);
        match cursor.checked_add_months(Months::new(1)) {
            Some(next) => cursor = next,
            None => break,
        }
    }

    months
}
