use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;

use crate::error::{DataIssue, MetricResult};
use crate::models::{
    AccountColumn, AccountMixRow, AccountRecord, AccountTable, BranchPerformance,
    CustomerSegmentRow, DormancyMetrics, HoldingCount, ProductHolding,
};

/// Product classes that are base account types rather than cross-sold products.
const BASE_PRODUCT_CLASSES: [&str; 2] = ["account", "card"];

/// Customer segments by number of accounts held, as inclusive ranges.
pub const ACCOUNT_SEGMENTS: [(&str, usize, usize); 4] = [
    ("Single Account", 1, 1),
    ("2-3 Accounts", 2, 3),
    ("4-5 Accounts", 4, 5),
    ("6+ Accounts", 6, usize::MAX),
];

/// `part / whole * 100`, or `None` when the ratio is undefined.
pub fn percentage(part: f64, whole: f64) -> Option<f64> {
    if whole == 0.0 || !whole.is_finite() {
        return None;
    }
    Some(part / whole * 100.0).filter(|p| p.is_finite())
}

/// Percent change from `previous` to `current`; 0 when `previous` is zero.
pub fn growth_rate(current: f64, previous: f64) -> f64 {
    if previous == 0.0 || previous.is_nan() || current.is_nan() {
        return 0.0;
    }
    let growth = (current - previous) / previous * 100.0;
    if growth.is_finite() {
        growth
    } else {
        0.0
    }
}

pub fn compound_growth_rate(values: &[f64], periods: f64) -> f64 {
    let (Some(start), Some(end)) = (values.first(), values.last()) else {
        return 0.0;
    };
    if values.len() < 2 || periods == 0.0 || *start <= 0.0 {
        return 0.0;
    }
    let cagr = ((end / start).powf(1.0 / periods) - 1.0) * 100.0;
    if cagr.is_finite() {
        cagr
    } else {
        0.0
    }
}

pub(crate) fn customer_ids(records: &[AccountRecord]) -> BTreeSet<&str> {
    records
        .iter()
        .filter_map(|a| a.customer_id.as_deref())
        .collect()
}

/// Distinct customers across all accounts, open or closed.
pub fn unique_customer_count(accounts: &AccountTable) -> MetricResult<usize> {
    accounts.schema.require(AccountColumn::CustomerId)?;
    Ok(customer_ids(&accounts.records).len())
}

pub fn avg_products_per_customer(accounts: &AccountTable) -> MetricResult<f64> {
    accounts.schema.require(AccountColumn::CustomerId)?;
    accounts.schema.require(AccountColumn::ProductCode)?;
    accounts.schema.require(AccountColumn::ProductClass)?;

    let mut products: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for account in &accounts.records {
        let is_base_class = account
            .product_class
            .as_deref()
            .is_some_and(|class| {
                BASE_PRODUCT_CLASSES
                    .iter()
                    .any(|b| class.eq_ignore_ascii_case(b))
            });
        if is_base_class {
            continue;
        }
        if let (Some(customer), Some(product)) =
            (account.customer_id.as_deref(), account.product_code.as_deref())
        {
            products.entry(customer).or_default().insert(product);
        }
    }

    if products.is_empty() {
        return Err(DataIssue::UndefinedRatio {
            metric: "average products per customer",
        });
    }

    let total: usize = products.values().map(BTreeSet::len).sum();
    Ok(total as f64 / products.len() as f64)
}

/// How many distinct products each customer holds, across every product class.
pub fn product_holding(accounts: &AccountTable) -> MetricResult<ProductHolding> {
    accounts.schema.require(AccountColumn::CustomerId)?;
    accounts.schema.require(AccountColumn::ProductCode)?;

    let mut products: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for account in &accounts.records {
        if let (Some(customer), Some(product)) =
            (account.customer_id.as_deref(), account.product_code.as_deref())
        {
            products.entry(customer).or_default().insert(product);
        }
    }
    if products.is_empty() {
        return Err(DataIssue::UndefinedRatio {
            metric: "products per customer",
        });
    }

    let mut distribution: BTreeMap<usize, usize> = BTreeMap::new();
    for held in products.values() {
        *distribution.entry(held.len()).or_insert(0) += 1;
    }
    let customers_holding = |n: usize| distribution.get(&n).copied().unwrap_or(0);

    Ok(ProductHolding {
        customers: products.len(),
        one_product: customers_holding(1),
        two_products: customers_holding(2),
        three_or_more: distribution.range(3..).map(|(_, count)| count).sum(),
        max_products: distribution.keys().next_back().copied().unwrap_or(0),
        distribution: distribution
            .iter()
            .map(|(&products, &customers)| HoldingCount { products, customers })
            .collect(),
    })
}

/// Customers grouped by how many accounts they hold. Empty segments are left out.
pub fn customer_segments(accounts: &AccountTable) -> MetricResult<Vec<CustomerSegmentRow>> {
    accounts.schema.require(AccountColumn::CustomerId)?;

    let mut per_customer: BTreeMap<&str, usize> = BTreeMap::new();
    for customer in accounts.records.iter().filter_map(|a| a.customer_id.as_deref()) {
        *per_customer.entry(customer).or_insert(0) += 1;
    }

    Ok(ACCOUNT_SEGMENTS
        .iter()
        .filter_map(|&(segment, low, high)| {
            let counts: Vec<usize> = per_customer
                .values()
                .copied()
                .filter(|n| (low..=high).contains(n))
                .collect();
            let min_accounts = *counts.iter().min()?;
            let max_accounts = *counts.iter().max()?;
            Some(CustomerSegmentRow {
                segment,
                customers: counts.len(),
                avg_accounts: counts.iter().sum::<usize>() as f64 / counts.len() as f64,
                min_accounts,
                max_accounts,
            })
        })
        .collect())
}

/// Mean customer relationship length in years: each customer's mean account
/// age, averaged over customers.
pub fn customer_tenure_years(accounts: &AccountTable, as_of: NaiveDate) -> MetricResult<f64> {
    accounts.schema.require(AccountColumn::CustomerId)?;
    accounts.schema.require(AccountColumn::OpeningDate)?;

    let mut ages: BTreeMap<&str, (i64, usize)> = BTreeMap::new();
    for account in &accounts.records {
        if let (Some(customer), Some(opened)) =
            (account.customer_id.as_deref(), account.opened_on)
        {
            let entry = ages.entry(customer).or_insert((0, 0));
            entry.0 += (as_of - opened).num_days();
            entry.1 += 1;
        }
    }

    if ages.is_empty() {
        return Err(DataIssue::UndefinedRatio {
            metric: "customer tenure",
        });
    }

    let mean_days = ages
        .values()
        .map(|(days, count)| *days as f64 / *count as f64)
        .sum::<f64>()
        / ages.len() as f64;
    Ok(mean_days / 365.25)
}

/// Share of customers holding an account at `start` who still hold one at `end`.
pub fn retention_rate(
    accounts: &AccountTable,
    start: NaiveDate,
    end: NaiveDate,
) -> MetricResult<f64> {
    accounts.schema.require(AccountColumn::CustomerId)?;
    accounts.schema.require(AccountColumn::OpeningDate)?;
    accounts.schema.require(AccountColumn::ClosureDate)?;

    let mut at_start = BTreeSet::new();
    let mut retained = BTreeSet::new();
    for account in &accounts.records {
        let (Some(customer), Some(opened)) = (account.customer_id.as_deref(), account.opened_on)
        else {
            continue;
        };
        if opened >= start {
            continue;
        }
        if account.closed_on.map_or(true, |closed| closed >= start) {
            at_start.insert(customer);
        }
        if account.closed_on.map_or(true, |closed| closed >= end) {
            retained.insert(customer);
        }
    }

    percentage(retained.len() as f64, at_start.len() as f64).ok_or(DataIssue::UndefinedRatio {
        metric: "retention rate",
    })
}

pub fn dormancy_metrics(accounts: &AccountTable) -> DormancyMetrics {
    let total = accounts.len();
    let count_flag = |column: AccountColumn, flag: fn(&AccountRecord) -> Option<bool>| {
        accounts.schema.has(column).then(|| {
            accounts
                .records
                .iter()
                .filter(|a| flag(a) == Some(true))
                .count()
        })
    };

    let dormant = count_flag(AccountColumn::Dormant, |a| a.dormant);
    let inoperative = count_flag(AccountColumn::Inoperative, |a| a.inoperative);

    DormancyMetrics {
        total_accounts: total,
        dormant_accounts: dormant,
        dormant_rate: dormant.and_then(|n| percentage(n as f64, total as f64)),
        inoperative_accounts: inoperative,
        inoperative_rate: inoperative.and_then(|n| percentage(n as f64, total as f64)),
    }
}

/// Accounts that are not closed and, when the extract carries a status, are ACTIVE.
pub fn open_accounts(accounts: &AccountTable) -> Vec<&AccountRecord> {
    let check_status = accounts.schema.has(AccountColumn::CreationStatus);
    accounts
        .records
        .iter()
        .filter(|a| !a.is_closed())
        .filter(|a| {
            !check_status
                || a.creation_status
                    .as_deref()
                    .is_some_and(|s| s.eq_ignore_ascii_case("active"))
        })
        .collect()
}

pub fn branch_performance(accounts: &AccountTable) -> MetricResult<Vec<BranchPerformance>> {
    accounts.schema.require(AccountColumn::BranchCode)?;
    Ok(tally_branches(accounts.records.iter()))
}

/// Accounts and distinct customers per branch, in branch-code order.
pub(crate) fn tally_branches<'a>(
    records: impl Iterator<Item = &'a AccountRecord>,
) -> Vec<BranchPerformance> {
    let mut branches: BTreeMap<&str, (usize, BTreeSet<&str>)> = BTreeMap::new();
    for account in records {
        let Some(branch) = account.branch_code.as_deref() else {
            continue;
        };
        let entry = branches.entry(branch).or_default();
        entry.0 += 1;
        if let Some(customer) = account.customer_id.as_deref() {
            entry.1.insert(customer);
        }
    }

    branches
        .into_iter()
        .map(|(branch, (total_accounts, customers))| BranchPerformance {
            branch_code: branch.to_string(),
            total_accounts,
            unique_customers: customers.len(),
        })
        .collect()
}

/// Account counts per (product, currency).
pub fn account_mix(accounts: &AccountTable) -> MetricResult<Vec<AccountMixRow>> {
    accounts.schema.require(AccountColumn::ProductCode)?;
    accounts.schema.require(AccountColumn::CurrencyCode)?;

    let mut mix: BTreeMap<(&str, &str), (usize, Option<&str>, Option<&str>)> = BTreeMap::new();
    for account in &accounts.records {
        if let (Some(product), Some(currency)) =
            (account.product_code.as_deref(), account.currency_code.as_deref())
        {
            let entry = mix.entry((product, currency)).or_insert((0, None, None));
            entry.0 += 1;
            entry.1 = entry.1.or(account.product_name.as_deref());
            entry.2 = entry.2.or(account.product_group.as_deref());
        }
    }

    Ok(mix
        .into_iter()
        .map(|((product, currency), (account_count, name, group))| AccountMixRow {
            product_code: product.to_string(),
            currency: currency.to_string(),
            product_name: name.map(str::to_string),
            product_group: group.map(str::to_string),
            account_count,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountSchema;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn account(number: &str, customer: &str, product: &str, class: &str) -> AccountRecord {
        AccountRecord {
            account_number: number.to_string(),
            customer_id: Some(customer.to_string()),
            product_code: Some(product.to_string()),
            product_class: Some(class.to_string()),
            ..AccountRecord::default()
        }
    }

    #[test]
    fn growth_follows_formula_and_guards_zero() {
        assert_eq!(growth_rate(150.0, 100.0), 50.0);
        assert_eq!(growth_rate(50.0, 100.0), -50.0);
        assert_eq!(growth_rate(10.0, 0.0), 0.0);
        assert_eq!(growth_rate(0.0, 0.0), 0.0);
        assert_eq!(growth_rate(10.0, f64::NAN), 0.0);
    }

    #[test]
    fn percentage_is_undefined_for_zero_base() {
        assert_eq!(percentage(90.0, 300.0), Some(30.0));
        assert_eq!(percentage(5.0, 0.0), None);
    }

    #[test]
    fn compound_growth_guards_degenerate_inputs() {
        let cagr = compound_growth_rate(&[100.0, 110.0, 121.0], 2.0);
        assert!((cagr - 10.0).abs() < 1e-9);
        assert_eq!(compound_growth_rate(&[100.0], 1.0), 0.0);
        assert_eq!(compound_growth_rate(&[0.0, 50.0], 1.0), 0.0);
        assert_eq!(compound_growth_rate(&[100.0, 120.0], 0.0), 0.0);
    }

    #[test]
    fn unique_customers_ignore_status_and_need_the_column() {
        let mut closed = account("3", "C2", "SAV", "Deposit");
        closed.closed_on = Some(ymd(2025, 1, 1));
        let records = vec![
            account("1", "C1", "SAV", "Deposit"),
            account("2", "C1", "LOAN", "Loan"),
            closed,
        ];
        let table = AccountTable::new(AccountSchema::complete(), records.clone());
        assert_eq!(unique_customer_count(&table), Ok(2));

        let bare = AccountTable::new(AccountSchema::default(), records);
        assert!(matches!(
            unique_customer_count(&bare),
            Err(DataIssue::MissingColumn { column: "ACNTS_CLIENT_NUM", .. })
        ));
    }

    #[test]
    fn products_per_customer_excludes_base_classes() {
        let records = vec![
            account("1", "C1", "SAV", "ACCOUNT"),
            account("2", "C1", "VISA", "Card"),
            account("3", "C1", "LOAN", "Loan"),
            account("4", "C1", "FD", "Deposit"),
            account("5", "C2", "LOAN", "Loan"),
            account("6", "C3", "CARD", "card"),
        ];
        let table = AccountTable::new(AccountSchema::complete(), records);
        let avg = avg_products_per_customer(&table).unwrap();
        assert!((avg - 1.5).abs() < 1e-9);
    }

    #[test]
    fn products_per_customer_without_eligible_products_is_undefined() {
        let records = vec![account("1", "C1", "SAV", "Account")];
        let table = AccountTable::new(AccountSchema::complete(), records);
        assert!(matches!(
            avg_products_per_customer(&table),
            Err(DataIssue::UndefinedRatio { .. })
        ));
    }

    #[test]
    fn tenure_averages_per_customer_first() {
        let mut a = account("1", "C1", "SAV", "Deposit");
        a.opened_on = Some(ymd(2023, 1, 1));
        let mut b = account("2", "C1", "SAV", "Deposit");
        b.opened_on = Some(ymd(2024, 1, 1));
        let mut c = account("3", "C2", "SAV", "Deposit");
        c.opened_on = Some(ymd(2024, 1, 1));
        let table = AccountTable::new(AccountSchema::complete(), vec![a, b, c]);

        let as_of = ymd(2025, 1, 1);
        let days_since = |opened: NaiveDate| (as_of - opened).num_days();
        let c1 = (days_since(ymd(2023, 1, 1)) + days_since(ymd(2024, 1, 1))) as f64 / 2.0;
        let c2 = (as_of - ymd(2024, 1, 1)).num_days() as f64;
        let expected = (c1 + c2) / 2.0 / 365.25;
        assert!((customer_tenure_years(&table, as_of).unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn retention_counts_customers_surviving_the_period() {
        let mut stays = account("1", "C1", "SAV", "Deposit");
        stays.opened_on = Some(ymd(2024, 1, 1));
        let mut leaves = account("2", "C2", "SAV", "Deposit");
        leaves.opened_on = Some(ymd(2024, 1, 1));
        leaves.closed_on = Some(ymd(2025, 2, 15));
        let mut too_new = account("3", "C3", "SAV", "Deposit");
        too_new.opened_on = Some(ymd(2025, 2, 1));
        let table = AccountTable::new(AccountSchema::complete(), vec![stays, leaves, too_new]);

        let rate = retention_rate(&table, ymd(2025, 1, 1), ymd(2025, 3, 31)).unwrap();
        assert_eq!(rate, 50.0);
        assert!(retention_rate(&table, ymd(2020, 1, 1), ymd(2020, 3, 31)).is_err());
    }

    #[test]
    fn dormancy_reports_only_present_flags() {
        let mut a = account("1", "C1", "SAV", "Deposit");
        a.dormant = Some(true);
        let b = account("2", "C2", "SAV", "Deposit");
        let schema = AccountSchema::default().with(AccountColumn::Dormant);
        let metrics = dormancy_metrics(&AccountTable::new(schema, vec![a, b]));

        assert_eq!(metrics.total_accounts, 2);
        assert_eq!(metrics.dormant_accounts, Some(1));
        assert_eq!(metrics.dormant_rate, Some(50.0));
        assert_eq!(metrics.inoperative_accounts, None);
        assert_eq!(metrics.inoperative_rate, None);
    }

    #[test]
    fn open_accounts_drop_closed_and_non_active() {
        let mut active = account("1", "C1", "SAV", "Deposit");
        active.creation_status = Some("Active".to_string());
        let mut pending = account("2", "C2", "SAV", "Deposit");
        pending.creation_status = Some("PENDING".to_string());
        let mut closed = account("3", "C3", "SAV", "Deposit");
        closed.creation_status = Some("ACTIVE".to_string());
        closed.closed_on = Some(ymd(2025, 1, 1));
        let table = AccountTable::new(AccountSchema::complete(), vec![active, pending, closed]);

        let open: Vec<&str> = open_accounts(&table)
            .iter()
            .map(|a| a.account_number.as_str())
            .collect();
        assert_eq!(open, vec!["1"]);
    }

    #[test]
    fn branch_and_mix_group_deterministically() {
        let mut a = account("1", "C1", "SAV", "Deposit");
        a.branch_code = Some("B2".to_string());
        a.currency_code = Some("USD".to_string());
        a.product_name = Some("Savings".to_string());
        let mut b = account("2", "C1", "SAV", "Deposit");
        b.branch_code = Some("B1".to_string());
        b.currency_code = Some("USD".to_string());
        let mut c = account("3", "C2", "SAV", "Deposit");
        c.branch_code = Some("B2".to_string());
        c.currency_code = Some("ZWG".to_string());
        let table = AccountTable::new(AccountSchema::complete(), vec![a, b, c]);

        let branches = branch_performance(&table).unwrap();
        assert_eq!(branches[0].branch_code, "B1");
        assert_eq!(branches[1].total_accounts, 2);
        assert_eq!(branches[1].unique_customers, 2);

        let mix = account_mix(&table).unwrap();
        assert_eq!(mix.len(), 2);
        assert_eq!(mix[0].currency, "USD");
        assert_eq!(mix[0].account_count, 2);
        assert_eq!(mix[0].product_name.as_deref(), Some("Savings"));
    }

    #[test]
    fn holding_counts_distinct_products_per_customer() {
        let accounts = AccountTable::new(
            AccountSchema::complete(),
            vec![
                account("1", "C1", "SAV", "Account"),
                account("2", "C1", "SAV", "Account"),
                account("3", "C2", "SAV", "Account"),
                account("4", "C2", "CARD", "Card"),
                account("5", "C3", "SAV", "Account"),
                account("6", "C3", "CARD", "Card"),
                account("7", "C3", "LOAN", "Loan"),
                account("8", "C3", "FD", "Deposit"),
            ],
        );
        let holding = product_holding(&accounts).unwrap();
        assert_eq!(holding.customers, 3);
        assert_eq!(holding.one_product, 1);
        assert_eq!(holding.two_products, 1);
        assert_eq!(holding.three_or_more, 1);
        assert_eq!(holding.max_products, 4);
        assert_eq!(
            holding.distribution,
            vec![
                HoldingCount { products: 1, customers: 1 },
                HoldingCount { products: 2, customers: 1 },
                HoldingCount { products: 4, customers: 1 },
            ]
        );

        let empty = AccountTable::new(AccountSchema::complete(), Vec::new());
        assert!(matches!(product_holding(&empty), Err(DataIssue::UndefinedRatio { .. })));
    }

    #[test]
    fn segments_customers_by_account_count() {
        let mut records = Vec::new();
        for (customer, held) in [("C1", 1), ("C2", 1), ("C3", 2), ("C4", 3), ("C5", 7)] {
            for n in 0..held {
                records.push(account(&format!("{customer}-{n}"), customer, "SAV", "Account"));
            }
        }
        let accounts = AccountTable::new(AccountSchema::complete(), records);

        let rows = customer_segments(&accounts).unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.segment).collect();
        assert_eq!(names, vec!["Single Account", "2-3 Accounts", "6+ Accounts"]);
        assert_eq!(rows[0].customers, 2);
        assert_eq!(rows[1].avg_accounts, 2.5);
        assert_eq!((rows[1].min_accounts, rows[1].max_accounts), (2, 3));
        assert_eq!(rows[2].max_accounts, 7);
    }
}
