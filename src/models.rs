use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;

use crate::error::{DataIssue, MetricResult};

/// Self-service and assisted channels carried as Y/N flags on the account extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Channel {
    InternetBanking,
    MobileBanking,
    Atm,
    SmsBanking,
    CallCenter,
    Teller,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::InternetBanking,
        Channel::MobileBanking,
        Channel::Atm,
        Channel::SmsBanking,
        Channel::CallCenter,
        Channel::Teller,
    ];

    pub fn column(self) -> &'static str {
        match self {
            Channel::InternetBanking => "ACNTS_INET_OPERN",
            Channel::MobileBanking => "ACNTS_MBLBNK_OPERN",
            Channel::Atm => "ACNTS_ATM_OPERN",
            Channel::SmsBanking => "ACNTS_SMS_OPERN",
            Channel::CallCenter => "ACNTS_CALL_CENTER_OPERN",
            Channel::Teller => "ACNTS_TELLER_OPERN",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Channel::InternetBanking => "Internet Banking",
            Channel::MobileBanking => "Mobile Banking",
            Channel::Atm => "ATM",
            Channel::SmsBanking => "SMS Banking",
            Channel::CallCenter => "Call Center",
            Channel::Teller => "Teller/Branch",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountRecord {
    pub account_number: String,
    pub customer_id: Option<String>,
    pub product_code: Option<String>,
    pub branch_code: Option<String>,
    pub currency_code: Option<String>,
    pub opened_on: Option<NaiveDate>,
    pub last_transaction_on: Option<NaiveDate>,
    pub closed_on: Option<NaiveDate>,
    pub creation_status: Option<String>,
    pub dormant: Option<bool>,
    pub inoperative: Option<bool>,
    pub channels: BTreeMap<Channel, bool>,
    pub product_name: Option<String>,
    pub product_class: Option<String>,
    pub product_group: Option<String>,
}

impl AccountRecord {
    pub fn is_closed(&self) -> bool {
        self.closed_on.is_some()
    }

    pub fn channel_enabled(&self, channel: Channel) -> bool {
        self.channels.get(&channel).copied().unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub code: String,
    pub name: Option<String>,
    pub class: Option<String>,
    pub group: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthlySnapshot {
    pub month: NaiveDate,
    pub active_customers: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RevenueEntry {
    pub gl_code: Option<String>,
    pub posted_on: Option<NaiveDate>,
    pub amount: f64,
    pub non_funded: bool,
}

/// Loosely typed lookup tables (sector codes, GL categories) addressed by header name.
#[derive(Debug, Clone, Default)]
pub struct LookupTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl LookupTable {
    /// Index of the header matching `name`, ignoring case and padding.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
    }

    pub fn cell(row: &[String], index: usize) -> Option<&str> {
        row.get(index).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuarterRow {
    pub quarter_label: String,
    pub funded_accounts: usize,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub growth_from_previous: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyRevenueRow {
    pub month: NaiveDate,
    pub month_name: String,
    pub revenue: Option<f64>,
    pub non_funded_income: Option<f64>,
    pub mom_change: Option<f64>,
    pub mom_change_abs: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChurnMethod {
    Snapshot,
    ClosureApproximation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChurnRow {
    pub month: NaiveDate,
    pub churned_customers: Option<u64>,
    pub customer_growth: Option<u64>,
    pub churn_rate: Option<f64>,
    pub active_customers: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChurnReport {
    pub method: ChurnMethod,
    pub rows: Vec<ChurnRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PenetrationRow {
    pub product_code: String,
    pub product_name: Option<String>,
    pub product_class: Option<String>,
    pub unique_customers: usize,
    pub total_accounts: usize,
    pub penetration_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Concentration {
    pub total_customers: usize,
    pub total_accounts: usize,
    pub top_10pct_customers: usize,
    pub top_10pct_accounts: usize,
    pub top_10pct_share: f64,
    pub top_20pct_customers: usize,
    pub top_20pct_accounts: usize,
    pub top_20pct_share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelAdoptionRow {
    pub channel: Channel,
    pub label: &'static str,
    pub enabled_accounts: usize,
    pub adoption_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DormancyMetrics {
    pub total_accounts: usize,
    pub dormant_accounts: Option<usize>,
    pub dormant_rate: Option<f64>,
    pub inoperative_accounts: Option<usize>,
    pub inoperative_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchPerformance {
    pub branch_code: String,
    pub total_accounts: usize,
    pub unique_customers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountMixRow {
    pub product_code: String,
    pub currency: String,
    pub product_name: Option<String>,
    pub product_group: Option<String>,
    pub account_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecencyBucket {
    pub label: &'static str,
    pub accounts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecencyDistribution {
    pub buckets: Vec<RecencyBucket>,
    pub no_transaction: usize,
    pub future_dated: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityBreakdownRow {
    pub key: String,
    pub active: usize,
    pub inactive: usize,
    pub total: usize,
    pub activity_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HoldingCount {
    pub products: usize,
    pub customers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductHolding {
    pub customers: usize,
    pub one_product: usize,
    pub two_products: usize,
    pub three_or_more: usize,
    pub max_products: usize,
    pub distribution: Vec<HoldingCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerSegmentRow {
    pub segment: &'static str,
    pub customers: usize,
    pub avg_accounts: f64,
    pub min_accounts: usize,
    pub max_accounts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuarterlyBreakdownRow {
    pub key: String,
    pub total: usize,
    pub funded_by_quarter: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncomeCategoryRow {
    pub name: String,
    pub gl_accounts: usize,
    pub revenue: Option<f64>,
}

/// Account attribute used to break a metric down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Product,
    Branch,
}

impl Dimension {
    pub fn column(self) -> AccountColumn {
        match self {
            Dimension::Product => AccountColumn::ProductCode,
            Dimension::Branch => AccountColumn::BranchCode,
        }
    }

    /// Products group by joined name where available, else by code.
    pub fn key(self, account: &AccountRecord) -> Option<&str> {
        match self {
            Dimension::Product => account
                .product_name
                .as_deref()
                .or(account.product_code.as_deref()),
            Dimension::Branch => account.branch_code.as_deref(),
        }
    }
}

/// Narrows the account table before segmenting. A criterion on a column the
/// extract does not carry is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccountFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

fn criterion<'a>(
    schema: &AccountSchema,
    column: AccountColumn,
    wanted: &'a Option<String>,
) -> Option<&'a str> {
    wanted.as_deref().filter(|_| schema.has(column))
}

impl AccountFilter {
    pub fn is_empty(&self) -> bool {
        self.branch.is_none()
            && self.product.is_none()
            && self.currency.is_none()
            && self.status.is_none()
    }

    /// Product matches on code or joined name; status ignores case.
    pub fn matches(&self, schema: &AccountSchema, account: &AccountRecord) -> bool {
        if let Some(branch) = criterion(schema, AccountColumn::BranchCode, &self.branch) {
            if account.branch_code.as_deref() != Some(branch) {
                return false;
            }
        }
        if let Some(product) = criterion(schema, AccountColumn::ProductCode, &self.product) {
            if account.product_code.as_deref() != Some(product)
                && account.product_name.as_deref() != Some(product)
            {
                return false;
            }
        }
        if let Some(currency) = criterion(schema, AccountColumn::CurrencyCode, &self.currency) {
            if account.currency_code.as_deref() != Some(currency) {
                return false;
            }
        }
        if let Some(status) = criterion(schema, AccountColumn::CreationStatus, &self.status) {
            if !account
                .creation_status
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case(status))
            {
                return false;
            }
        }
        true
    }

    pub fn apply(&self, accounts: &AccountTable) -> AccountTable {
        let records: Vec<AccountRecord> = accounts
            .records
            .iter()
            .filter(|a| self.matches(&accounts.schema, a))
            .cloned()
            .collect();
        log::debug!("filter {self} kept {} of {} accounts", records.len(), accounts.len());
        AccountTable::new(accounts.schema.clone(), records)
    }

    /// Borrows the table untouched when there is nothing to filter on.
    pub fn narrow<'a>(&self, accounts: &'a AccountTable) -> Cow<'a, AccountTable> {
        if self.is_empty() {
            Cow::Borrowed(accounts)
        } else {
            Cow::Owned(self.apply(accounts))
        }
    }
}

impl fmt::Display for AccountFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let criteria = [
            ("branch", &self.branch),
            ("product", &self.product),
            ("currency", &self.currency),
            ("status", &self.status),
        ];
        let parts: Vec<String> = criteria
            .iter()
            .filter_map(|(name, value)| value.as_deref().map(|v| format!("{name} {v}")))
            .collect();
        if parts.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}

/// Optional account columns. `ACNTS_ACCOUNT_NUMBER` is the row key and always present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccountColumn {
    CustomerId,
    ProductCode,
    BranchCode,
    CurrencyCode,
    OpeningDate,
    LastTransactionDate,
    ClosureDate,
    CreationStatus,
    Dormant,
    Inoperative,
    ProductClass,
    Channel(Channel),
}

impl AccountColumn {
    pub fn name(self) -> &'static str {
        match self {
            AccountColumn::CustomerId => "ACNTS_CLIENT_NUM",
            AccountColumn::ProductCode => "ACNTS_PROD_CODE",
            AccountColumn::BranchCode => "ACNTS_BRN_CODE",
            AccountColumn::CurrencyCode => "ACNTS_CURR_CODE",
            AccountColumn::OpeningDate => "ACNTS_OPENING_DATE",
            AccountColumn::LastTransactionDate => "ACNTS_LAST_TRAN_DATE",
            AccountColumn::ClosureDate => "ACNTS_CLOSURE_DATE",
            AccountColumn::CreationStatus => "ACNTS_CREATION_STATUS",
            AccountColumn::Dormant => "ACNTS_DORMANT_ACNT",
            AccountColumn::Inoperative => "ACNTS_INOP_ACNT",
            AccountColumn::ProductClass => "Product Class",
            AccountColumn::Channel(channel) => channel.column(),
        }
    }

    pub fn all() -> Vec<AccountColumn> {
        let mut columns = vec![
            AccountColumn::CustomerId,
            AccountColumn::ProductCode,
            AccountColumn::BranchCode,
            AccountColumn::CurrencyCode,
            AccountColumn::OpeningDate,
            AccountColumn::LastTransactionDate,
            AccountColumn::ClosureDate,
            AccountColumn::CreationStatus,
            AccountColumn::Dormant,
            AccountColumn::Inoperative,
        ];
        columns.extend(Channel::ALL.iter().map(|c| AccountColumn::Channel(*c)));
        columns
    }
}

/// Which optional columns the loaded account extract carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountSchema {
    columns: BTreeSet<AccountColumn>,
}

impl AccountSchema {
    pub fn from_headers<'a>(headers: impl IntoIterator<Item = &'a str>) -> Self {
        let present: BTreeSet<&str> = headers.into_iter().map(str::trim).collect();
        let columns = AccountColumn::all()
            .into_iter()
            .filter(|column| present.contains(column.name()))
            .collect();
        Self { columns }
    }

    /// Every optional column, including the joined product class.
    #[cfg(test)]
    pub fn complete() -> Self {
        let mut columns: BTreeSet<AccountColumn> = AccountColumn::all().into_iter().collect();
        columns.insert(AccountColumn::ProductClass);
        Self { columns }
    }

    #[cfg(test)]
    pub fn with(mut self, column: AccountColumn) -> Self {
        self.columns.insert(column);
        self
    }

    #[cfg(test)]
    pub fn without(mut self, column: AccountColumn) -> Self {
        self.columns.remove(&column);
        self
    }

    pub fn insert(&mut self, column: AccountColumn) {
        self.columns.insert(column);
    }

    pub fn has(&self, column: AccountColumn) -> bool {
        self.columns.contains(&column)
    }

    pub fn require(&self, column: AccountColumn) -> MetricResult<()> {
        if self.has(column) {
            Ok(())
        } else {
            Err(DataIssue::MissingColumn {
                table: ACCOUNTS_TABLE,
                column: column.name(),
            })
        }
    }
}

pub const ACCOUNTS_TABLE: &str = "accounts";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountTable {
    pub schema: AccountSchema,
    pub records: Vec<AccountRecord>,
}

impl AccountTable {
    pub fn new(schema: AccountSchema, records: Vec<AccountRecord>) -> Self {
        Self { schema, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
