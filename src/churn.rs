//! Month-over-month customer churn.
//!
//! The snapshot path uses the monthly active-customer series and is the
//! reference figure. When no snapshot exists, churn is approximated from
//! account closure dates against today's customer count. That denominator is
//! not the historical base, so the result is tagged
//! [`ChurnMethod::ClosureApproximation`] and must be labelled as such.

use std::collections::{BTreeMap, BTreeSet};

use crate::dates::first_of_month;
use crate::error::{DataIssue, MetricResult};
use crate::loader::SNAPSHOTS_TABLE;
use crate::metrics::{customer_ids, percentage};
use crate::models::{
    AccountColumn, AccountTable, ChurnMethod, ChurnReport, ChurnRow, MonthlySnapshot,
};

pub fn monthly_churn(
    snapshots: Option<&[MonthlySnapshot]>,
    accounts: Option<&AccountTable>,
) -> MetricResult<ChurnReport> {
    match (snapshots, accounts) {
        (Some(series), _) if !series.is_empty() => Ok(churn_from_snapshots(series)),
        (_, Some(accounts)) => {
            log::warn!("no customer snapshot available; approximating churn from account closures");
            churn_from_closures(accounts)
        }
        _ => Err(DataIssue::MissingSourceTable { table: SNAPSHOTS_TABLE }),
    }
}

/// Only net decreases count as churn; net increases are reported as growth.
pub fn churn_from_snapshots(series: &[MonthlySnapshot]) -> ChurnReport {
    let mut ordered = series.to_vec();
    ordered.sort_by_key(|s| s.month);

    let mut rows = Vec::with_capacity(ordered.len());
    let mut previous: Option<u64> = None;

    for snapshot in &ordered {
        let current = snapshot.active_customers;
        let (churned, growth, rate) = match previous {
            Some(prev) => {
                let churned = prev.saturating_sub(current);
                let growth = current.saturating_sub(prev);
                let rate = percentage(churned as f64, prev as f64).unwrap_or(0.0);
                (Some(churned), Some(growth), Some(rate))
            }
            None => (None, None, None),
        };

        rows.push(ChurnRow {
            month: snapshot.month,
            churned_customers: churned,
            customer_growth: growth,
            churn_rate: rate,
            active_customers: Some(current),
        });
        previous = Some(current);
    }

    ChurnReport {
        method: ChurnMethod::Snapshot,
        rows,
    }
}

/// Distinct customers closing an account in each month, as a share of the
/// current total customer count.
pub fn churn_from_closures(accounts: &AccountTable) -> MetricResult<ChurnReport> {
    accounts.schema.require(AccountColumn::ClosureDate)?;
    accounts.schema.require(AccountColumn::CustomerId)?;

    let total_customers = customer_ids(&accounts.records).len();
    if total_customers == 0 {
        return Err(DataIssue::UndefinedRatio { metric: "churn rate" });
    }

    let mut closures: BTreeMap<_, BTreeSet<&str>> = BTreeMap::new();
    for account in &accounts.records {
        if let (Some(closed), Some(customer)) =
            (account.closed_on, account.customer_id.as_deref())
        {
            closures.entry(first_of_month(closed)).or_default().insert(customer);
        }
    }

    let rows = closures
        .into_iter()
        .map(|(month, customers)| ChurnRow {
            month,
            churned_customers: Some(customers.len() as u64),
            customer_growth: None,
            churn_rate: percentage(customers.len() as f64, total_customers as f64),
            active_customers: None,
        })
        .collect();

    Ok(ChurnReport {
        method: ChurnMethod::ClosureApproximation,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountRecord, AccountSchema};
    use chrono::NaiveDate;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn series(counts: &[u64]) -> Vec<MonthlySnapshot> {
        counts
            .iter()
            .enumerate()
            .map(|(i, c)| MonthlySnapshot {
                month: ymd(2025, i as u32 + 1, 1),
                active_customers: *c,
            })
            .collect()
    }

    fn closed(number: &str, customer: &str, closed_on: Option<NaiveDate>) -> AccountRecord {
        AccountRecord {
            account_number: number.to_string(),
            customer_id: Some(customer.to_string()),
            closed_on,
            ..AccountRecord::default()
        }
    }

    #[test]
    fn snapshot_churn_separates_losses_from_growth() {
        let report = churn_from_snapshots(&series(&[1000, 950, 980, 900]));
        assert_eq!(report.method, ChurnMethod::Snapshot);

        let churned: Vec<Option<u64>> = report.rows.iter().map(|r| r.churned_customers).collect();
        let growth: Vec<Option<u64>> = report.rows.iter().map(|r| r.customer_growth).collect();
        assert_eq!(churned, vec![None, Some(50), Some(0), Some(80)]);
        assert_eq!(growth, vec![None, Some(0), Some(30), Some(0)]);

        assert_eq!(report.rows[0].churn_rate, None);
        assert_eq!(report.rows[1].churn_rate, Some(5.0));
        assert_eq!(report.rows[2].churn_rate, Some(0.0));
        let march = report.rows[3].churn_rate.unwrap();
        assert!((march - 80.0 / 980.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn snapshot_series_is_sorted_before_deltas() {
        let mut months = series(&[1000, 950, 980, 900]);
        months.reverse();
        let report = churn_from_snapshots(&months);
        assert_eq!(report.rows[0].month, ymd(2025, 1, 1));
        assert_eq!(report.rows[3].churned_customers, Some(80));
    }

    #[test]
    fn zero_prior_base_gives_zero_rate() {
        let report = churn_from_snapshots(&series(&[0, 0, 10]));
        assert_eq!(report.rows[1].churn_rate, Some(0.0));
        assert_eq!(report.rows[2].churn_rate, Some(0.0));
        assert_eq!(report.rows[2].customer_growth, Some(10));
    }

    #[test]
    fn single_month_has_no_churn() {
        let report = churn_from_snapshots(&series(&[500]));
        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.rows[0].churned_customers, None);
        assert_eq!(report.rows[0].active_customers, Some(500));
    }

    #[test]
    fn falls_back_to_closures_and_tags_the_method() {
        let accounts = AccountTable::new(
            AccountSchema::complete(),
            vec![
                closed("1", "C1", Some(ymd(2025, 3, 4))),
                closed("2", "C1", Some(ymd(2025, 3, 20))),
                closed("3", "C2", Some(ymd(2025, 3, 9))),
                closed("4", "C3", Some(ymd(2025, 5, 1))),
                closed("5", "C4", None),
            ],
        );
        let report = monthly_churn(None, Some(&accounts)).unwrap();

        assert_eq!(report.method, ChurnMethod::ClosureApproximation);
        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.rows[0].month, ymd(2025, 3, 1));
        assert_eq!(report.rows[0].churned_customers, Some(2));
        assert_eq!(report.rows[0].churn_rate, Some(50.0));
        assert_eq!(report.rows[1].churn_rate, Some(25.0));
        assert_eq!(report.rows[0].active_customers, None);
    }

    #[test]
    fn prefers_snapshot_when_both_exist() {
        let accounts = AccountTable::new(
            AccountSchema::complete(),
            vec![closed("1", "C1", Some(ymd(2025, 3, 4)))],
        );
        let snapshots = series(&[10, 8]);
        let report = monthly_churn(Some(snapshots.as_slice()), Some(&accounts)).unwrap();
        assert_eq!(report.method, ChurnMethod::Snapshot);

        let empty: Vec<MonthlySnapshot> = Vec::new();
        let report = monthly_churn(Some(empty.as_slice()), Some(&accounts)).unwrap();
        assert_eq!(report.method, ChurnMethod::ClosureApproximation);
    }

    #[test]
    fn no_sources_means_no_data() {
        assert_eq!(
            monthly_churn(None, None),
            Err(DataIssue::MissingSourceTable { table: "customer_snapshots" })
        );
        let empty = AccountTable::new(AccountSchema::complete(), Vec::new());
        assert_eq!(
            monthly_churn(None, Some(&empty)),
            Err(DataIssue::UndefinedRatio { metric: "churn rate" })
        );
    }

    #[test]
    fn repeated_calls_agree() {
        let months = series(&[1000, 950, 980, 900]);
        assert_eq!(churn_from_snapshots(&months), churn_from_snapshots(&months));
    }
}
