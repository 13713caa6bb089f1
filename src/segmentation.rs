use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::MetricResult;
use crate::metrics::percentage;
use crate::models::{
    AccountColumn, AccountRecord, AccountSchema, AccountTable, ActivityBreakdownRow, Dimension,
    RecencyBucket, RecencyDistribution,
};

pub const DEFAULT_ACTIVITY_THRESHOLD_DAYS: i64 = 90;

/// Upper bound (inclusive, in days) of each recency bucket.
pub const RECENCY_BUCKETS: [(&str, i64); 8] = [
    ("0-30 days", 30),
    ("31-60 days", 60),
    ("61-90 days", 90),
    ("91-120 days", 120),
    ("121-150 days", 150),
    ("151-180 days", 180),
    ("181-365 days", 365),
    ("365+ days", i64::MAX),
];

/// Products or branches listed in an activity breakdown.
pub const ACTIVITY_BREAKDOWN_LIMIT: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentedAccount<'a> {
    pub account: &'a AccountRecord,
    pub days_since_last_txn: Option<i64>,
    pub status: ActivityStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivitySegments<'a> {
    pub threshold_days: i64,
    pub active: Vec<SegmentedAccount<'a>>,
    pub inactive: Vec<SegmentedAccount<'a>>,
}

impl ActivitySegments<'_> {
    pub fn total(&self) -> usize {
        self.active.len() + self.inactive.len()
    }

    pub fn active_share(&self) -> Option<f64> {
        percentage(self.active.len() as f64, self.total() as f64)
    }
}

impl<'a> ActivitySegments<'a> {
    pub fn all(&self) -> impl Iterator<Item = &SegmentedAccount<'a>> {
        self.active.iter().chain(self.inactive.iter())
    }
}

pub fn classify(days_since_last_txn: Option<i64>, threshold_days: i64) -> ActivityStatus {
    match days_since_last_txn {
        Some(days) if days <= threshold_days => ActivityStatus::Active,
        _ => ActivityStatus::Inactive,
    }
}

/// Splits accounts into Active (last transaction within `threshold_days` of
/// `as_of`) and Inactive (everything else, including accounts with no
/// last-transaction date). Input order is preserved within each side.
pub fn segment_by_activity(
    accounts: &AccountTable,
    threshold_days: i64,
    as_of: DateTime<Utc>,
) -> MetricResult<ActivitySegments<'_>> {
    accounts.schema.require(AccountColumn::LastTransactionDate)?;

    let today = as_of.date_naive();
    let mut segments = ActivitySegments {
        threshold_days,
        active: Vec::new(),
        inactive: Vec::new(),
    };

    for account in &accounts.records {
        let days_since_last_txn = account.last_transaction_on.map(|d| (today - d).num_days());
        let status = classify(days_since_last_txn, threshold_days);
        let segmented = SegmentedAccount {
            account,
            days_since_last_txn,
            status,
        };
        match status {
            ActivityStatus::Active => segments.active.push(segmented),
            ActivityStatus::Inactive => segments.inactive.push(segmented),
        }
    }

    log::debug!(
        "activity segmentation at {threshold_days}d: {} active, {} inactive",
        segments.active.len(),
        segments.inactive.len()
    );
    Ok(segments)
}

/// Accounts per days-since-last-transaction bucket. Accounts without a date
/// and those dated after the as-of day are counted apart.
pub fn recency_distribution(segments: &ActivitySegments<'_>) -> RecencyDistribution {
    let mut counts = [0usize; RECENCY_BUCKETS.len()];
    let mut no_transaction = 0;
    let mut future_dated = 0;

    for segmented in segments.all() {
        match segmented.days_since_last_txn {
            None => no_transaction += 1,
            Some(days) if days < 0 => future_dated += 1,
            Some(days) => {
                if let Some(slot) = RECENCY_BUCKETS.iter().position(|(_, upper)| days <= *upper) {
                    counts[slot] += 1;
                }
            }
        }
    }

    RecencyDistribution {
        buckets: RECENCY_BUCKETS
            .iter()
            .zip(counts)
            .map(|(&(label, _), accounts)| RecencyBucket { label, accounts })
            .collect(),
        no_transaction,
        future_dated,
    }
}

/// Active and inactive counts per product or branch, largest first.
pub fn activity_by(
    schema: &AccountSchema,
    segments: &ActivitySegments<'_>,
    dimension: Dimension,
) -> MetricResult<Vec<ActivityBreakdownRow>> {
    schema.require(dimension.column())?;

    let mut groups: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for segmented in segments.all() {
        let Some(key) = dimension.key(segmented.account) else {
            continue;
        };
        let entry = groups.entry(key).or_default();
        match segmented.status {
            ActivityStatus::Active => entry.0 += 1,
            ActivityStatus::Inactive => entry.1 += 1,
        }
    }

    let mut rows: Vec<ActivityBreakdownRow> = groups
        .into_iter()
        .map(|(key, (active, inactive))| {
            let total = active + inactive;
            ActivityBreakdownRow {
                key: key.to_string(),
                active,
                inactive,
                total,
                activity_rate: percentage(active as f64, total as f64).unwrap_or(0.0),
            }
        })
        .collect();
    rows.sort_by(|a, b| b.total.cmp(&a.total));
    rows.truncate(ACTIVITY_BREAKDOWN_LIMIT);
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DataIssue;
    use crate::models::AccountSchema;
    use chrono::{Duration, NaiveDate, TimeZone};

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 1, 9, 30, 0).unwrap()
    }

    fn account(customer: &str, days_ago: Option<i64>) -> AccountRecord {
        AccountRecord {
            account_number: format!("A-{customer}"),
            customer_id: Some(customer.to_string()),
            last_transaction_on: days_ago.map(|d| as_of().date_naive() - Duration::days(d)),
            ..AccountRecord::default()
        }
    }

    fn table(records: Vec<AccountRecord>) -> AccountTable {
        AccountTable::new(AccountSchema::complete(), records)
    }

    fn customers(side: &[SegmentedAccount<'_>]) -> Vec<String> {
        side.iter()
            .filter_map(|s| s.account.customer_id.clone())
            .collect()
    }

    #[test]
    fn classifies_by_recency_and_missing_dates() {
        let accounts = table(vec![
            account("1", Some(95)),
            account("2", Some(10)),
            account("3", None),
        ]);
        let segments = segment_by_activity(&accounts, 90, as_of()).unwrap();

        assert_eq!(customers(&segments.active), vec!["2"]);
        assert_eq!(customers(&segments.inactive), vec!["1", "3"]);
        assert_eq!(segments.inactive[1].days_since_last_txn, None);
        assert_eq!(segments.inactive[0].days_since_last_txn, Some(95));
    }

    #[test]
    fn threshold_boundary_is_inclusive() {
        let accounts = table(vec![account("edge", Some(90)), account("past", Some(91))]);
        let segments = segment_by_activity(&accounts, 90, as_of()).unwrap();
        assert_eq!(customers(&segments.active), vec!["edge"]);
        assert_eq!(customers(&segments.inactive), vec!["past"]);
    }

    #[test]
    fn partitions_every_account_exactly_once() {
        let records: Vec<AccountRecord> = (0..40)
            .map(|i| account(&i.to_string(), if i % 7 == 0 { None } else { Some(i * 5) }))
            .collect();
        let accounts = table(records);

        for threshold in [1, 30, 90, 180] {
            let segments = segment_by_activity(&accounts, threshold, as_of()).unwrap();
            assert_eq!(segments.total(), accounts.len());

            let mut seen: Vec<&str> = segments
                .active
                .iter()
                .chain(segments.inactive.iter())
                .map(|s| s.account.account_number.as_str())
                .collect();
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len(), accounts.len());
        }
    }

    #[test]
    fn longer_window_never_shrinks_active_set() {
        let records: Vec<AccountRecord> =
            (0..60).map(|i| account(&i.to_string(), Some(i * 4))).collect();
        let accounts = table(records);

        let mut previous = 0;
        for threshold in [30, 60, 90, 120, 180] {
            let active = segment_by_activity(&accounts, threshold, as_of()).unwrap().active.len();
            assert!(active >= previous, "threshold {threshold} shrank active set");
            previous = active;
        }
    }

    #[test]
    fn repeated_calls_agree() {
        let accounts = table(vec![account("1", Some(5)), account("2", None)]);
        let first = segment_by_activity(&accounts, 30, as_of()).unwrap();
        let second = segment_by_activity(&accounts, 30, as_of()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_last_transaction_column_is_reported() {
        let schema = AccountSchema::complete().without(AccountColumn::LastTransactionDate);
        let accounts = AccountTable::new(schema, vec![account("1", Some(5))]);
        assert_eq!(
            segment_by_activity(&accounts, 90, as_of()).unwrap_err(),
            DataIssue::MissingColumn {
                table: "accounts",
                column: "ACNTS_LAST_TRAN_DATE",
            }
        );
    }

    #[test]
    fn future_dated_transactions_count_as_active() {
        let mut account = account("1", None);
        account.last_transaction_on = NaiveDate::from_ymd_opt(2025, 10, 5);
        let accounts = table(vec![account]);
        let segments = segment_by_activity(&accounts, 30, as_of()).unwrap();
        assert_eq!(segments.active.len(), 1);
        assert_eq!(segments.active[0].days_since_last_txn, Some(-4));
    }

    #[test]
    fn recency_buckets_close_on_their_upper_bound() {
        let days = [0, 30, 31, 60, 90, 91, 150, 180, 181, 365, 366, 2000];
        let mut records: Vec<AccountRecord> =
            days.iter().map(|d| account(&d.to_string(), Some(*d))).collect();
        records.push(account("none", None));
        let mut future = account("future", None);
        future.last_transaction_on = NaiveDate::from_ymd_opt(2025, 10, 3);
        records.push(future);
        let accounts = table(records);

        let segments = segment_by_activity(&accounts, 90, as_of()).unwrap();
        let distribution = recency_distribution(&segments);

        let counts: Vec<usize> = distribution.buckets.iter().map(|b| b.accounts).collect();
        assert_eq!(counts, vec![2, 2, 1, 1, 1, 1, 2, 2]);
        assert_eq!(distribution.buckets[7].label, "365+ days");
        assert_eq!(distribution.no_transaction, 1);
        assert_eq!(distribution.future_dated, 1);
    }

    fn placed(customer: &str, product: &str, branch: &str, days_ago: Option<i64>) -> AccountRecord {
        AccountRecord {
            product_code: Some(product.to_string()),
            branch_code: Some(branch.to_string()),
            ..account(customer, days_ago)
        }
    }

    #[test]
    fn activity_rates_per_product_and_branch() {
        let accounts = table(vec![
            placed("1", "SAV", "B1", Some(5)),
            placed("2", "SAV", "B1", Some(200)),
            placed("3", "SAV", "B2", None),
            placed("4", "CUR", "B2", Some(10)),
        ]);
        let segments = segment_by_activity(&accounts, 90, as_of()).unwrap();

        let by_product = activity_by(&accounts.schema, &segments, Dimension::Product).unwrap();
        assert_eq!(by_product[0].key, "SAV");
        assert_eq!((by_product[0].active, by_product[0].inactive), (1, 2));
        assert_eq!(by_product[0].total, 3);
        assert!((by_product[0].activity_rate - 33.333).abs() < 0.01);
        assert_eq!(by_product[1].activity_rate, 100.0);

        let by_branch = activity_by(&accounts.schema, &segments, Dimension::Branch).unwrap();
        assert_eq!(by_branch.len(), 2);
        assert_eq!(by_branch[0].key, "B1");
        assert_eq!(by_branch[1].activity_rate, 50.0);
    }

    #[test]
    fn activity_breakdown_keeps_the_largest_groups() {
        let records: Vec<AccountRecord> = (0..20)
            .flat_map(|b| {
                (0..=b).map(move |n| {
                    placed(&format!("{b}-{n}"), "SAV", &format!("B{b:02}"), Some(1))
                })
            })
            .collect();
        let accounts = table(records);
        let segments = segment_by_activity(&accounts, 90, as_of()).unwrap();

        let rows = activity_by(&accounts.schema, &segments, Dimension::Branch).unwrap();
        assert_eq!(rows.len(), ACTIVITY_BREAKDOWN_LIMIT);
        assert_eq!(rows[0].key, "B19");
        assert_eq!(rows[0].total, 20);

        let schema = AccountSchema::complete().without(AccountColumn::BranchCode);
        assert!(activity_by(&schema, &segments, Dimension::Branch).is_err());
    }
}
