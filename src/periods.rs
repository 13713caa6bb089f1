//! Quarter and month bucketing with period-over-period deltas.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, NaiveDate};

use crate::dates::{last_of_month, month_starts};
use crate::error::{DataIssue, MetricResult};
use crate::loader::GL_CATEGORIES_TABLE;
use crate::metrics::{growth_rate, tally_branches};
use crate::models::{
    AccountColumn, AccountTable, BranchPerformance, Dimension, IncomeCategoryRow, LookupTable,
    MonthlyRevenueRow, QuarterRow, QuarterlyBreakdownRow, RevenueEntry,
};

/// Quarters reported per year. The portal tracks Q1 through Q3 only.
pub const TRACKED_QUARTERS: u32 = 3;

/// Products or branches listed in a quarterly breakdown.
pub const QUARTERLY_BREAKDOWN_LIMIT: usize = 10;

/// Branches listed in the campaign activity table.
pub const CAMPAIGN_BRANCH_LIMIT: usize = 15;

pub const GL_CODE_COLUMN: &str = "Gl Code";
pub const GL_NAME_COLUMN: &str = "Gl Name";
pub const GL_TYPE_COLUMN: &str = "Gl Type";
const INCOME_GL_TYPES: [&str; 2] = ["I", "Income"];

/// Inclusive first and last calendar day of quarter `quarter` (1-based) in `year`.
pub fn quarter_bounds(year: i32, quarter: u32) -> Option<(NaiveDate, NaiveDate)> {
    if !(1..=4).contains(&quarter) {
        return None;
    }
    let start = NaiveDate::from_ymd_opt(year, (quarter - 1) * 3 + 1, 1)?;
    let last_month = NaiveDate::from_ymd_opt(year, quarter * 3, 1)?;
    Some((start, last_of_month(last_month)))
}

/// Bounds of every tracked quarter of `year`.
pub fn tracked_quarters(year: i32) -> MetricResult<Vec<(u32, NaiveDate, NaiveDate)>> {
    (1..=TRACKED_QUARTERS)
        .map(|quarter| {
            quarter_bounds(year, quarter)
                .map(|(start, end)| (quarter, start, end))
                .ok_or(DataIssue::PeriodOutOfRange { year })
        })
        .collect()
}

/// Funded-account counts for Q1-Q3 of `year`. An account is funded in a
/// quarter when its last transaction date falls inside the quarter.
pub fn quarterly_funded_accounts(
    accounts: &AccountTable,
    year: i32,
) -> MetricResult<Vec<QuarterRow>> {
    accounts.schema.require(AccountColumn::LastTransactionDate)?;

    let mut rows: Vec<QuarterRow> = Vec::with_capacity(TRACKED_QUARTERS as usize);
    for (quarter, period_start, period_end) in tracked_quarters(year)? {
        let funded_accounts = accounts
            .records
            .iter()
            .filter_map(|a| a.last_transaction_on)
            .filter(|d| *d >= period_start && *d <= period_end)
            .count();

        let growth_from_previous = rows
            .last()
            .filter(|prev| prev.funded_accounts > 0)
            .map(|prev| growth_rate(funded_accounts as f64, prev.funded_accounts as f64));

        rows.push(QuarterRow {
            quarter_label: format!("Q{quarter} {year}"),
            funded_accounts,
            period_start,
            period_end,
            growth_from_previous,
        });
    }

    Ok(rows)
}

/// Funded accounts per quarter for the busiest products or branches of `year`,
/// ranked by their Q1-Q3 total.
pub fn quarterly_breakdown(
    accounts: &AccountTable,
    year: i32,
    dimension: Dimension,
) -> MetricResult<Vec<QuarterlyBreakdownRow>> {
    accounts.schema.require(AccountColumn::LastTransactionDate)?;
    accounts.schema.require(dimension.column())?;
    let quarters = tracked_quarters(year)?;

    let mut counts: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for account in &accounts.records {
        let (Some(key), Some(date)) = (dimension.key(account), account.last_transaction_on)
        else {
            continue;
        };
        let in_quarter = |(_, start, end): &(u32, NaiveDate, NaiveDate)| {
            date >= *start && date <= *end
        };
        let Some(slot) = quarters.iter().position(in_quarter) else {
            continue;
        };
        counts.entry(key).or_insert_with(|| vec![0; quarters.len()])[slot] += 1;
    }

    let mut rows: Vec<QuarterlyBreakdownRow> = counts
        .into_iter()
        .map(|(key, funded_by_quarter)| QuarterlyBreakdownRow {
            key: key.to_string(),
            total: funded_by_quarter.iter().sum(),
            funded_by_quarter,
        })
        .collect();
    rows.sort_by(|a, b| b.total.cmp(&a.total));
    rows.truncate(QUARTERLY_BREAKDOWN_LIMIT);
    Ok(rows)
}

/// One row per calendar month from `start` through `end`, summing revenue by
/// posting month. Months without postings still get a row: zero revenue when a
/// revenue table exists, undefined revenue when it does not. The relative
/// change is undefined after a zero month.
pub fn monthly_revenue(
    revenue: Option<&[RevenueEntry]>,
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<MonthlyRevenueRow> {
    let mut rows: Vec<MonthlyRevenueRow> = Vec::new();

    for month in month_starts(start, end) {
        let totals = revenue.map(|entries| {
            entries
                .iter()
                .filter(|e| {
                    e.posted_on
                        .is_some_and(|d| d.year() == month.year() && d.month() == month.month())
                })
                .fold((0.0, 0.0), |(total, non_funded), e| {
                    let nf = if e.non_funded { e.amount } else { 0.0 };
                    (total + e.amount, non_funded + nf)
                })
        });

        let revenue_total = totals.map(|(total, _)| total);
        let previous = rows.last().and_then(|row| row.revenue);
        let (mom_change, mom_change_abs) = match (previous, revenue_total) {
            (Some(prev), Some(curr)) => {
                let relative = (prev != 0.0).then(|| growth_rate(curr, prev));
                (relative, Some(curr - prev))
            }
            _ => (None, None),
        };

        rows.push(MonthlyRevenueRow {
            month,
            month_name: month.format("%B %Y").to_string(),
            revenue: revenue_total,
            non_funded_income: totals.map(|(_, non_funded)| non_funded),
            mom_change,
            mom_change_abs,
        });
    }

    rows
}

/// Like `monthly_revenue`, but reports a missing revenue table as an issue.
pub fn campaign_revenue(
    revenue: Option<&[RevenueEntry]>,
    start: NaiveDate,
    end: NaiveDate,
) -> (Vec<MonthlyRevenueRow>, Option<DataIssue>) {
    let rows = monthly_revenue(revenue, start, end);
    let issue = revenue
        .is_none()
        .then_some(DataIssue::MissingSourceTable {
            table: crate::loader::REVENUE_TABLE,
        });
    (rows, issue)
}

/// Accounts whose last transaction falls in the window, per branch, busiest first.
pub fn campaign_branch_activity(
    accounts: &AccountTable,
    start: NaiveDate,
    end: NaiveDate,
) -> MetricResult<Vec<BranchPerformance>> {
    accounts.schema.require(AccountColumn::BranchCode)?;
    accounts.schema.require(AccountColumn::LastTransactionDate)?;

    let in_window = accounts
        .records
        .iter()
        .filter(|a| a.last_transaction_on.is_some_and(|d| d >= start && d <= end));
    let mut rows = tally_branches(in_window);
    rows.sort_by(|a, b| b.total_accounts.cmp(&a.total_accounts));
    rows.truncate(CAMPAIGN_BRANCH_LIMIT);
    Ok(rows)
}

/// Income GL accounts grouped by category name. Revenue is summed over the
/// window when the revenue extract carries GL codes.
pub fn income_categories(
    gl: Option<&LookupTable>,
    revenue: Option<&[RevenueEntry]>,
    start: NaiveDate,
    end: NaiveDate,
) -> MetricResult<Vec<IncomeCategoryRow>> {
    let gl = gl.ok_or(DataIssue::MissingSourceTable {
        table: GL_CATEGORIES_TABLE,
    })?;
    let column = |name: &'static str| {
        gl.column(name).ok_or(DataIssue::MissingColumn {
            table: GL_CATEGORIES_TABLE,
            column: name,
        })
    };
    let type_col = column(GL_TYPE_COLUMN)?;
    let name_col = column(GL_NAME_COLUMN)?;
    let code_col = gl.column(GL_CODE_COLUMN);

    let mut categories: BTreeMap<&str, (usize, BTreeSet<&str>)> = BTreeMap::new();
    for row in &gl.rows {
        let is_income = LookupTable::cell(row, type_col)
            .is_some_and(|t| INCOME_GL_TYPES.iter().any(|i| t.eq_ignore_ascii_case(i)));
        if !is_income {
            continue;
        }
        let Some(name) = LookupTable::cell(row, name_col) else {
            continue;
        };
        let entry = categories.entry(name).or_default();
        entry.0 += 1;
        if let Some(code) = code_col.and_then(|c| LookupTable::cell(row, c)) {
            entry.1.insert(code);
        }
    }

    let window_revenue = |codes: &BTreeSet<&str>| {
        code_col?;
        let entries = revenue?;
        Some(
            entries
                .iter()
                .filter(|e| e.posted_on.is_some_and(|d| d >= start && d <= end))
                .filter(|e| e.gl_code.as_deref().is_some_and(|c| codes.contains(c)))
                .map(|e| e.amount)
                .sum::<f64>(),
        )
    };

    let mut rows: Vec<IncomeCategoryRow> = categories
        .iter()
        .map(|(name, (gl_accounts, codes))| IncomeCategoryRow {
            name: name.to_string(),
            gl_accounts: *gl_accounts,
            revenue: window_revenue(codes),
        })
        .collect();
    rows.sort_by(|a, b| b.gl_accounts.cmp(&a.gl_accounts));
    Ok(rows)
}
