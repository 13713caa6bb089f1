use chrono::{DateTime, Datelike, NaiveDate, Utc};
use uuid::Uuid;

/// Who asked for a report and the instant it is computed "as of".
///
/// Passed explicitly to anything time-dependent so a report can be reproduced
/// for a past date and two runs over the same data agree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportContext {
    pub run_id: Uuid,
    pub as_of: DateTime<Utc>,
    pub requested_by: Option<String>,
    pub reference_year: i32,
}

impl ReportContext {
    pub fn new(as_of: DateTime<Utc>, requested_by: Option<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            as_of,
            requested_by,
            reference_year: as_of.year(),
        }
    }

    pub fn now(requested_by: Option<String>) -> Self {
        Self::new(Utc::now(), requested_by)
    }

    /// Report as of the end of `date` (UTC).
    pub fn as_of_date(date: NaiveDate, requested_by: Option<String>) -> Self {
        let as_of = date
            .and_hms_opt(23, 59, 59)
            .map(|stamp| stamp.and_utc())
            .unwrap_or_else(Utc::now);
        Self::new(as_of, requested_by)
    }

    pub fn with_reference_year(mut self, year: i32) -> Self {
        self.reference_year = year;
        self
    }

    pub fn as_of_date_naive(&self) -> NaiveDate {
        self.as_of.date_naive()
    }
}
