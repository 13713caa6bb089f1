use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{DataIssue, MetricResult};
use crate::metrics::percentage;
use crate::models::{
    AccountColumn, AccountTable, Channel, ChannelAdoptionRow, Concentration, PenetrationRow,
};

fn by_rate_desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// Share of the whole customer base holding each product. Rates are against
/// `total_customers`, so they are comparable across products and may sum past 100.
pub fn product_penetration(
    accounts: &AccountTable,
    total_customers: usize,
) -> MetricResult<Vec<PenetrationRow>> {
    accounts.schema.require(AccountColumn::ProductCode)?;
    accounts.schema.require(AccountColumn::CustomerId)?;
    if total_customers == 0 {
        return Err(DataIssue::UndefinedRatio {
            metric: "product penetration",
        });
    }

    struct Holding<'a> {
        customers: BTreeSet<&'a str>,
        accounts: usize,
        name: Option<&'a str>,
        class: Option<&'a str>,
    }

    let mut products: BTreeMap<&str, Holding<'_>> = BTreeMap::new();
    for account in &accounts.records {
        let Some(code) = account.product_code.as_deref() else {
            continue;
        };
        let holding = products.entry(code).or_insert_with(|| Holding {
            customers: BTreeSet::new(),
            accounts: 0,
            name: None,
            class: None,
        });
        holding.accounts += 1;
        if let Some(customer) = account.customer_id.as_deref() {
            holding.customers.insert(customer);
        }
        holding.name = holding.name.or(account.product_name.as_deref());
        holding.class = holding.class.or(account.product_class.as_deref());
    }

    let mut rows: Vec<PenetrationRow> = products
        .into_iter()
        .map(|(code, holding)| PenetrationRow {
            product_code: code.to_string(),
            product_name: holding.name.map(str::to_string),
            product_class: holding.class.map(str::to_string),
            unique_customers: holding.customers.len(),
            total_accounts: holding.accounts,
            penetration_rate: percentage(holding.customers.len() as f64, total_customers as f64)
                .unwrap_or(0.0),
        })
        .collect();

    // Stable sort: ties stay in product-code order.
    rows.sort_by(|a, b| by_rate_desc(a.penetration_rate, b.penetration_rate));
    Ok(rows)
}

/// Share of all accounts held by the top 10% and 20% of customers ranked by
/// account count. Count-based, not balance-weighted.
pub fn account_concentration(accounts: &AccountTable) -> MetricResult<Concentration> {
    accounts.schema.require(AccountColumn::CustomerId)?;

    let total_accounts = accounts.len();
    if total_accounts == 0 {
        return Err(DataIssue::UndefinedRatio {
            metric: "account concentration",
        });
    }

    let mut per_customer: BTreeMap<&str, usize> = BTreeMap::new();
    for customer in accounts.records.iter().filter_map(|a| a.customer_id.as_deref()) {
        *per_customer.entry(customer).or_insert(0) += 1;
    }

    let mut counts: Vec<usize> = per_customer.into_values().collect();
    counts.sort_unstable_by(|a, b| b.cmp(a));

    let total_customers = counts.len();
    let top = |fraction: f64| -> (usize, usize) {
        let customers = (total_customers as f64 * fraction).floor() as usize;
        (customers, counts.iter().take(customers).sum())
    };
    let (top_10pct_customers, top_10pct_accounts) = top(0.10);
    let (top_20pct_customers, top_20pct_accounts) = top(0.20);
    let share = |n: usize| percentage(n as f64, total_accounts as f64).unwrap_or(0.0);

    Ok(Concentration {
        total_customers,
        total_accounts,
        top_10pct_customers,
        top_10pct_accounts,
        top_10pct_share: share(top_10pct_accounts),
        top_20pct_customers,
        top_20pct_accounts,
        top_20pct_share: share(top_20pct_accounts),
    })
}

/// Enabled-account share per channel. Channels whose flag column is absent
/// from the extract are skipped.
pub fn channel_adoption(
    accounts: &AccountTable,
    channels: &[Channel],
) -> MetricResult<Vec<ChannelAdoptionRow>> {
    let total_accounts = accounts.len();
    let present: Vec<Channel> = channels
        .iter()
        .copied()
        .filter(|c| accounts.schema.has(AccountColumn::Channel(*c)))
        .collect();

    if present.is_empty() {
        let column = channels.first().copied().unwrap_or(Channel::InternetBanking).column();
        return Err(DataIssue::MissingColumn {
            table: crate::models::ACCOUNTS_TABLE,
            column,
        });
    }
    if total_accounts == 0 {
        return Err(DataIssue::UndefinedRatio {
            metric: "channel adoption",
        });
    }

    let mut rows: Vec<ChannelAdoptionRow> = present
        .into_iter()
        .map(|channel| {
            let enabled_accounts = accounts
                .records
                .iter()
                .filter(|a| a.channel_enabled(channel))
                .count();
            ChannelAdoptionRow {
                channel,
                label: channel.label(),
                enabled_accounts,
                adoption_rate: percentage(enabled_accounts as f64, total_accounts as f64)
                    .unwrap_or(0.0),
            }
        })
        .collect();

    rows.sort_by(|a, b| by_rate_desc(a.adoption_rate, b.adoption_rate));
    Ok(rows)
}
