use thiserror::Error;

/// Data-quality conditions that stop a single metric from being computed.
///
/// None of these abort a reporting pass: a calculator returns the issue and the
/// report renders that section as "no data available".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataIssue {
    #[error("column '{column}' is missing from the {table} table")]
    MissingColumn {
        table: &'static str,
        column: &'static str,
    },

    #[error("the {table} table was not loaded")]
    MissingSourceTable { table: &'static str },

    #[error("{metric} has a zero or undefined denominator")]
    UndefinedRatio { metric: &'static str },

    #[error("year {year} is outside the supported calendar range")]
    PeriodOutOfRange { year: i32 },

    #[error("could not parse '{raw}' in {table}.{column} as a date")]
    DateParseFailure {
        table: &'static str,
        column: &'static str,
        raw: String,
    },
}

pub type MetricResult<T> = Result<T, DataIssue>;
