//! Loads the CSV extracts into typed, read-only tables.
//!
//! Every table except accounts is optional. A table that fails to load is logged
//! and left empty so the metrics that do not depend on it still render.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context};
use chrono::{Datelike, NaiveDate};
use csv::{ByteRecord, StringRecord};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::DataSources;
use crate::dates::{first_of_month, parse_date, DateParse};
use crate::error::DataIssue;
use crate::models::{
    AccountColumn, AccountRecord, AccountSchema, AccountTable, Channel, LookupTable,
    MonthlySnapshot, Product, RevenueEntry, ACCOUNTS_TABLE,
};

pub const PRODUCTS_TABLE: &str = "products";
pub const SECTORS_TABLE: &str = "sectors";
pub const GL_CATEGORIES_TABLE: &str = "gl_categories";
pub const SNAPSHOTS_TABLE: &str = "customer_snapshots";
pub const REVENUE_TABLE: &str = "revenue";

const MAX_ISSUE_SAMPLES: usize = 20;

/// Everything the calculators read for one reporting pass.
#[derive(Debug, Default)]
pub struct Dataset {
    pub accounts: Option<AccountTable>,
    pub products: Option<Vec<Product>>,
    pub sectors: Option<LookupTable>,
    pub gl_categories: Option<LookupTable>,
    pub snapshots: Option<Vec<MonthlySnapshot>>,
    pub revenue: Option<Vec<RevenueEntry>>,
    pub quality: DataQuality,
}

/// Counts of the rows and fields that were dropped or nulled during loading.
#[derive(Debug, Clone, Default)]
pub struct DataQuality {
    pub date_failures: BTreeMap<(&'static str, &'static str), usize>,
    pub skipped_rows: BTreeMap<&'static str, usize>,
    pub load_errors: Vec<String>,
    pub samples: Vec<DataIssue>,
}

impl DataQuality {
    fn record_date(
        &mut self,
        table: &'static str,
        column: &'static str,
        parsed: DateParse,
    ) -> Option<NaiveDate> {
        if let DateParse::Failed { raw, reason } = &parsed {
            log::debug!("{table}.{column}: '{raw}' rejected ({reason})");
            *self.date_failures.entry((table, column)).or_insert(0) += 1;
            if self.samples.len() < MAX_ISSUE_SAMPLES {
                self.samples.push(DataIssue::DateParseFailure {
                    table,
                    column,
                    raw: raw.clone(),
                });
            }
        }
        parsed.date()
    }

    fn skip_row(&mut self, table: &'static str) {
        *self.skipped_rows.entry(table).or_insert(0) += 1;
    }

    pub fn total_date_failures(&self) -> usize {
        self.date_failures.values().sum()
    }

    pub fn is_clean(&self) -> bool {
        self.date_failures.is_empty()
            && self.skipped_rows.is_empty()
            && self.load_errors.is_empty()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAccountRow {
    #[serde(rename = "ACNTS_ACCOUNT_NUMBER")]
    account_number: Option<String>,
    #[serde(rename = "ACNTS_CLIENT_NUM")]
    customer_id: Option<String>,
    #[serde(rename = "ACNTS_PROD_CODE")]
    product_code: Option<String>,
    #[serde(rename = "ACNTS_BRN_CODE")]
    branch_code: Option<String>,
    #[serde(rename = "ACNTS_CURR_CODE")]
    currency_code: Option<String>,
    #[serde(rename = "ACNTS_OPENING_DATE")]
    opening_date: Option<String>,
    #[serde(rename = "ACNTS_LAST_TRAN_DATE")]
    last_transaction_date: Option<String>,
    #[serde(rename = "ACNTS_CLOSURE_DATE")]
    closure_date: Option<String>,
    #[serde(rename = "ACNTS_CREATION_STATUS")]
    creation_status: Option<String>,
    #[serde(rename = "ACNTS_DORMANT_ACNT")]
    dormant: Option<String>,
    #[serde(rename = "ACNTS_INOP_ACNT")]
    inoperative: Option<String>,
    #[serde(rename = "ACNTS_INET_OPERN")]
    internet_banking: Option<String>,
    #[serde(rename = "ACNTS_MBLBNK_OPERN")]
    mobile_banking: Option<String>,
    #[serde(rename = "ACNTS_ATM_OPERN")]
    atm: Option<String>,
    #[serde(rename = "ACNTS_SMS_OPERN")]
    sms_banking: Option<String>,
    #[serde(rename = "ACNTS_CALL_CENTER_OPERN")]
    call_center: Option<String>,
    #[serde(rename = "ACNTS_TELLER_OPERN")]
    teller: Option<String>,
}

impl RawAccountRow {
    fn channel_flag(&self, channel: Channel) -> Option<&str> {
        let value = match channel {
            Channel::InternetBanking => &self.internet_banking,
            Channel::MobileBanking => &self.mobile_banking,
            Channel::Atm => &self.atm,
            Channel::SmsBanking => &self.sms_banking,
            Channel::CallCenter => &self.call_center,
            Channel::Teller => &self.teller,
        };
        value.as_deref()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawProductRow {
    #[serde(rename = "Product Code")]
    code: Option<String>,
    #[serde(rename = "Product Name")]
    name: Option<String>,
    #[serde(rename = "Product Class")]
    class: Option<String>,
    #[serde(rename = "Product Group Code")]
    group: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSnapshotRow {
    #[serde(rename = "TRAN_MONTH")]
    tran_month: Option<String>,
    #[serde(rename = "month")]
    month: Option<String>,
    #[serde(rename = "COMMON_CUSTOMERS")]
    common_customers: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRevenueRow {
    #[serde(rename = "GL_CODE")]
    gl_code: Option<String>,
    #[serde(rename = "TRAN_DATE")]
    tran_date: Option<String>,
    #[serde(rename = "AMOUNT")]
    amount: Option<String>,
    #[serde(rename = "INCOME_TYPE")]
    income_type: Option<String>,
}

fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader)
}

/// Decodes field by field, replacing invalid UTF-8, so a stray Latin-1 byte
/// only blurs the field it sits in.
fn decode_lossy(record: &ByteRecord) -> StringRecord {
    record.iter().map(String::from_utf8_lossy).collect()
}

/// Header and records of one extract. Records the reader cannot split are
/// counted as skipped; I/O failures fail the table.
fn read_records<R: Read>(
    reader: R,
    table: &'static str,
    quality: &mut DataQuality,
) -> anyhow::Result<(StringRecord, Vec<StringRecord>)> {
    let mut reader = csv_reader(reader);
    let headers = decode_lossy(
        reader
            .byte_headers()
            .with_context(|| format!("failed to read {table} headers"))?,
    );

    let mut records = Vec::new();
    for result in reader.byte_records() {
        match result {
            Ok(record) => records.push(decode_lossy(&record)),
            Err(err) if err.is_io_error() => {
                return Err(err).with_context(|| format!("failed to read {table}"));
            }
            Err(err) => {
                log::warn!("skipping malformed {table} row: {err}");
                quality.skip_row(table);
            }
        }
    }
    Ok((headers, records))
}

fn deserialize_rows<T: DeserializeOwned>(
    headers: &StringRecord,
    records: &[StringRecord],
    table: &'static str,
    quality: &mut DataQuality,
) -> Vec<T> {
    records
        .iter()
        .filter_map(|record| match record.deserialize::<T>(Some(headers)) {
            Ok(row) => Some(row),
            Err(err) => {
                log::warn!("skipping malformed {table} row: {err}");
                quality.skip_row(table);
                None
            }
        })
        .collect()
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("nan"))
}

fn parse_flag(value: Option<&str>) -> Option<bool> {
    match value.map(str::trim) {
        None | Some("") => None,
        Some(v) => Some(v.eq_ignore_ascii_case("Y")),
    }
}

fn parse_number(value: &str) -> Option<f64> {
    value
        .trim()
        .replace(',', "")
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
}

pub fn read_accounts<R: Read>(
    reader: R,
    quality: &mut DataQuality,
) -> anyhow::Result<AccountTable> {
    let (headers, raw) = read_records(reader, ACCOUNTS_TABLE, quality)?;
    if !headers.iter().any(|h| h == "ACNTS_ACCOUNT_NUMBER") {
        bail!(DataIssue::MissingColumn {
            table: ACCOUNTS_TABLE,
            column: "ACNTS_ACCOUNT_NUMBER",
        });
    }
    let schema = AccountSchema::from_headers(headers.iter());
    let mut records = Vec::new();

    let rows: Vec<RawAccountRow> = deserialize_rows(&headers, &raw, ACCOUNTS_TABLE, quality);
    for row in rows {
        let Some(account_number) = clean(row.account_number.clone()) else {
            quality.skip_row(ACCOUNTS_TABLE);
            continue;
        };

        let channels = Channel::ALL
            .iter()
            .filter_map(|channel| {
                parse_flag(row.channel_flag(*channel)).map(|flag| (*channel, flag))
            })
            .collect();

        records.push(AccountRecord {
            account_number,
            customer_id: clean(row.customer_id),
            product_code: clean(row.product_code),
            branch_code: clean(row.branch_code),
            currency_code: clean(row.currency_code),
            opened_on: quality.record_date(
                ACCOUNTS_TABLE,
                AccountColumn::OpeningDate.name(),
                parse_date(row.opening_date.as_deref()),
            ),
            last_transaction_on: quality.record_date(
                ACCOUNTS_TABLE,
                AccountColumn::LastTransactionDate.name(),
                parse_date(row.last_transaction_date.as_deref()),
            ),
            closed_on: quality.record_date(
                ACCOUNTS_TABLE,
                AccountColumn::ClosureDate.name(),
                parse_date(row.closure_date.as_deref()),
            ),
            creation_status: clean(row.creation_status),
            dormant: parse_flag(row.dormant.as_deref()),
            inoperative: parse_flag(row.inoperative.as_deref()),
            channels,
            product_name: None,
            product_class: None,
            product_group: None,
        });
    }

    Ok(AccountTable::new(schema, records))
}

pub fn read_products<R: Read>(
    reader: R,
    quality: &mut DataQuality,
) -> anyhow::Result<Vec<Product>> {
    let (headers, raw) = read_records(reader, PRODUCTS_TABLE, quality)?;
    let rows: Vec<RawProductRow> = deserialize_rows(&headers, &raw, PRODUCTS_TABLE, quality);
    let mut products = Vec::new();

    for row in rows {
        match clean(row.code) {
            Some(code) => products.push(Product {
                code,
                name: clean(row.name),
                class: clean(row.class),
                group: clean(row.group),
            }),
            None => quality.skip_row(PRODUCTS_TABLE),
        }
    }

    Ok(products)
}

/// Resolves a snapshot month label. Bare month numbers are anchored to `reference_year`.
fn snapshot_month(label: &str, reference_year: i32) -> DateParse {
    let label = label.trim();
    let as_number = label
        .parse::<u32>()
        .ok()
        .or_else(|| label.parse::<f64>().ok().filter(|n| n.fract() == 0.0).map(|n| n as u32));

    if let Some(month) = as_number {
        return match NaiveDate::from_ymd_opt(reference_year, month, 1) {
            Some(date) => DateParse::Parsed {
                date,
                format: "month-number",
            },
            None => DateParse::Failed {
                raw: label.to_string(),
                reason: "month number outside 1-12".to_string(),
            },
        };
    }

    if let Ok(date) = NaiveDate::parse_from_str(&format!("{label}-01"), "%Y-%m-%d") {
        return DateParse::Parsed {
            date,
            format: "%Y-%m",
        };
    }

    match parse_date(Some(label)) {
        DateParse::Parsed { date, format } => DateParse::Parsed {
            date: first_of_month(date),
            format,
        },
        other => other,
    }
}

pub fn read_snapshots<R: Read>(
    reader: R,
    reference_year: i32,
    quality: &mut DataQuality,
) -> anyhow::Result<Vec<MonthlySnapshot>> {
    let (headers, raw) = read_records(reader, SNAPSHOTS_TABLE, quality)?;
    if !headers.iter().any(|h| h == "COMMON_CUSTOMERS") {
        bail!(DataIssue::MissingColumn {
            table: SNAPSHOTS_TABLE,
            column: "COMMON_CUSTOMERS",
        });
    }

    let rows: Vec<RawSnapshotRow> = deserialize_rows(&headers, &raw, SNAPSHOTS_TABLE, quality);
    let mut snapshots = Vec::new();
    for row in rows {
        let label = clean(row.month).or_else(|| clean(row.tran_month));
        let month = match label {
            Some(label) => {
                let parsed = snapshot_month(&label, reference_year);
                quality.record_date(SNAPSHOTS_TABLE, "TRAN_MONTH", parsed)
            }
            None => None,
        };
        let active = clean(row.common_customers)
            .as_deref()
            .and_then(parse_number)
            .filter(|n| *n >= 0.0);

        match (month, active) {
            (Some(month), Some(active)) => snapshots.push(MonthlySnapshot {
                month,
                active_customers: active.round() as u64,
            }),
            _ => quality.skip_row(SNAPSHOTS_TABLE),
        }
    }

    Ok(snapshots)
}

pub fn read_revenue<R: Read>(
    reader: R,
    quality: &mut DataQuality,
) -> anyhow::Result<Vec<RevenueEntry>> {
    let (headers, raw) = read_records(reader, REVENUE_TABLE, quality)?;
    let rows: Vec<RawRevenueRow> = deserialize_rows(&headers, &raw, REVENUE_TABLE, quality);
    let mut entries = Vec::new();

    for row in rows {
        let Some(amount) = clean(row.amount).as_deref().and_then(parse_number) else {
            quality.skip_row(REVENUE_TABLE);
            continue;
        };
        let non_funded = clean(row.income_type)
            .map(|t| t.to_ascii_uppercase().replace(['-', ' '], "_"))
            .is_some_and(|t| t == "NON_FUNDED" || t == "NONFUNDED");

        let posted_on = parse_date(row.tran_date.as_deref());
        entries.push(RevenueEntry {
            gl_code: clean(row.gl_code),
            posted_on: quality.record_date(REVENUE_TABLE, "TRAN_DATE", posted_on),
            amount,
            non_funded,
        });
    }

    Ok(entries)
}

pub fn read_lookup<R: Read>(
    reader: R,
    table: &'static str,
    quality: &mut DataQuality,
) -> anyhow::Result<LookupTable> {
    let (headers, records) = read_records(reader, table, quality)?;
    Ok(LookupTable {
        headers: headers.iter().map(str::to_string).collect(),
        rows: records
            .iter()
            .map(|record| record.iter().map(str::to_string).collect())
            .collect(),
    })
}

/// Copies product name, class and group onto each account by product code.
pub fn join_products(accounts: &mut AccountTable, products: &[Product]) {
    let by_code: HashMap<&str, &Product> =
        products.iter().map(|p| (p.code.as_str(), p)).collect();
    let mut matched = 0usize;

    for account in accounts.records.iter_mut() {
        let Some(product) = account
            .product_code
            .as_deref()
            .and_then(|code| by_code.get(code))
        else {
            continue;
        };
        account.product_name = product.name.clone();
        account.product_class = product.class.clone();
        account.product_group = product.group.clone();
        matched += 1;
    }

    if products.iter().any(|p| p.class.is_some()) {
        accounts.schema.insert(AccountColumn::ProductClass);
    }
    log::debug!("joined product details onto {matched} of {} accounts", accounts.len());
}

fn open_table<T>(
    path: Option<&Path>,
    table: &'static str,
    quality: &mut DataQuality,
    read: impl FnOnce(std::fs::File, &mut DataQuality) -> anyhow::Result<T>,
) -> Option<T> {
    let Some(path) = path else {
        log::warn!("no {table} file found; metrics that need it will report no data");
        return None;
    };

    let loaded = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))
        .and_then(|file| read(file, quality));

    match loaded {
        Ok(value) => {
            log::info!("loaded {table} from {}", path.display());
            Some(value)
        }
        Err(err) => {
            log::warn!("could not load {table} from {}: {err:#}", path.display());
            quality.load_errors.push(format!("{table}: {err:#}"));
            None
        }
    }
}

pub fn load_dataset(sources: &DataSources, reference_year: i32) -> Dataset {
    let mut quality = DataQuality::default();

    let mut accounts = open_table(
        sources.accounts.as_deref(),
        ACCOUNTS_TABLE,
        &mut quality,
        read_accounts,
    );
    let products = open_table(
        sources.products.as_deref(),
        PRODUCTS_TABLE,
        &mut quality,
        read_products,
    );
    let sectors = open_table(sources.sectors.as_deref(), SECTORS_TABLE, &mut quality, |file, q| {
        read_lookup(file, SECTORS_TABLE, q)
    });
    let gl_categories = open_table(
        sources.gl_categories.as_deref(),
        GL_CATEGORIES_TABLE,
        &mut quality,
        |file, q| read_lookup(file, GL_CATEGORIES_TABLE, q),
    );
    let snapshots = open_table(
        sources.snapshots.as_deref(),
        SNAPSHOTS_TABLE,
        &mut quality,
        |file, q| read_snapshots(file, reference_year, q),
    );
    let revenue = open_table(
        sources.revenue.as_deref(),
        REVENUE_TABLE,
        &mut quality,
        read_revenue,
    );

    if let (Some(accounts), Some(products)) = (accounts.as_mut(), products.as_deref()) {
        join_products(accounts, products);
    }

    for ((table, column), count) in &quality.date_failures {
        log::warn!(
            "{count} unparseable dates in {table}.{column}; those fields are treated as missing"
        );
    }
    for sample in &quality.samples {
        log::debug!("sample issue: {sample}");
    }
    if accounts.as_ref().is_some_and(AccountTable::is_empty) {
        log::warn!("{ACCOUNTS_TABLE} table loaded but has no rows");
    }
    let lookups = [(SECTORS_TABLE, &sectors), (GL_CATEGORIES_TABLE, &gl_categories)];
    for (table, lookup) in lookups {
        if lookup.as_ref().is_some_and(LookupTable::is_empty) {
            log::warn!("{table} lookup loaded but has no rows");
        }
    }
    if let Some(accounts) = &accounts {
        let years: Vec<i32> = accounts
            .records
            .iter()
            .filter_map(|a| a.last_transaction_on.map(|d| d.year()))
            .collect();
        if let (Some(min), Some(max)) = (years.iter().min(), years.iter().max()) {
            log::debug!("last-transaction dates span {min}..={max}");
        }
    }

    Dataset {
        accounts,
        products,
        sectors,
        gl_categories,
        snapshots,
        revenue,
        quality,
    }
}
