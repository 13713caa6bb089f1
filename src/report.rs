use std::fmt::Write;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::churn;
use crate::context::ReportContext;
use crate::error::{DataIssue, MetricResult};
use crate::loader::Dataset;
use crate::metrics;
use crate::models::{
    AccountFilter, AccountMixRow, AccountSchema, AccountTable, ActivityBreakdownRow,
    BranchPerformance, Channel, ChannelAdoptionRow, ChurnMethod, ChurnReport, Concentration,
    CustomerSegmentRow, Dimension, DormancyMetrics, IncomeCategoryRow, MonthlyRevenueRow,
    PenetrationRow, ProductHolding, QuarterRow, QuarterlyBreakdownRow, RecencyDistribution,
    ACCOUNTS_TABLE,
};
use crate::penetration;
use crate::periods;
use crate::segmentation::{self, ActivitySegments};

/// A metric that either computed or explains why there is nothing to show.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Section<T> {
    Available(T),
    NoData(String),
}

impl<T> From<MetricResult<T>> for Section<T> {
    fn from(result: MetricResult<T>) -> Self {
        match result {
            Ok(value) => Section::Available(value),
            Err(issue) => {
                log::info!("metric skipped: {issue}");
                Section::NoData(issue.to_string())
            }
        }
    }
}

#[cfg(test)]
impl<T> Section<T> {
    pub fn available(&self) -> Option<&T> {
        match self {
            Section::Available(value) => Some(value),
            Section::NoData(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub threshold_days: i64,
    pub year: i32,
    pub campaign_start: NaiveDate,
    pub campaign_end: NaiveDate,
    pub channels: Vec<Channel>,
    pub filter: AccountFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivitySummary {
    pub threshold_days: i64,
    pub active_accounts: usize,
    pub inactive_accounts: usize,
    pub never_transacted: usize,
    pub active_share: Option<f64>,
}

impl From<&ActivitySegments<'_>> for ActivitySummary {
    fn from(segments: &ActivitySegments<'_>) -> Self {
        Self {
            threshold_days: segments.threshold_days,
            active_accounts: segments.active.len(),
            inactive_accounts: segments.inactive.len(),
            never_transacted: segments
                .inactive
                .iter()
                .filter(|s| s.days_since_last_txn.is_none())
                .count(),
            active_share: segments.active_share(),
        }
    }
}

/// Activity split plus its recency and product/branch breakdowns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityReport {
    #[serde(flatten)]
    pub summary: ActivitySummary,
    #[serde(skip_serializing_if = "AccountFilter::is_empty")]
    pub filter: AccountFilter,
    pub recency: RecencyDistribution,
    pub by_product: Section<Vec<ActivityBreakdownRow>>,
    pub by_branch: Section<Vec<ActivityBreakdownRow>>,
}

pub fn activity_report(
    schema: &AccountSchema,
    segments: &ActivitySegments<'_>,
    filter: &AccountFilter,
) -> ActivityReport {
    ActivityReport {
        summary: ActivitySummary::from(segments),
        filter: filter.clone(),
        recency: segmentation::recency_distribution(segments),
        by_product: segmentation::activity_by(schema, segments, Dimension::Product).into(),
        by_branch: segmentation::activity_by(schema, segments, Dimension::Branch).into(),
    }
}

/// Segments the filtered accounts and builds the activity breakdowns.
pub fn activity_section(
    accounts: MetricResult<&AccountTable>,
    filter: &AccountFilter,
    threshold_days: i64,
    as_of: DateTime<Utc>,
) -> Section<ActivityReport> {
    accounts
        .and_then(|table| {
            let narrowed = filter.narrow(table);
            let segments = segmentation::segment_by_activity(&narrowed, threshold_days, as_of)?;
            Ok(activity_report(&narrowed.schema, &segments, filter))
        })
        .into()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryMetrics {
    pub total_accounts: usize,
    pub open_accounts: usize,
    pub unique_customers: Section<usize>,
    pub avg_products_per_customer: Section<f64>,
    pub customer_tenure_years: Section<f64>,
    pub retention_rate_ytd: Section<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataSummary {
    pub accounts: Option<usize>,
    pub products: Option<usize>,
    pub sectors: Option<usize>,
    pub gl_categories: Option<usize>,
    pub snapshots: Option<usize>,
    pub revenue_entries: Option<usize>,
    pub date_parse_failures: usize,
    pub skipped_rows: usize,
    pub load_errors: Vec<String>,
}

pub fn data_summary(dataset: &Dataset) -> DataSummary {
    DataSummary {
        accounts: dataset.accounts.as_ref().map(AccountTable::len),
        products: dataset.products.as_ref().map(Vec::len),
        sectors: dataset.sectors.as_ref().map(|t| t.len()),
        gl_categories: dataset.gl_categories.as_ref().map(|t| t.len()),
        snapshots: dataset.snapshots.as_ref().map(Vec::len),
        revenue_entries: dataset.revenue.as_ref().map(Vec::len),
        date_parse_failures: dataset.quality.total_date_failures(),
        skipped_rows: dataset.quality.skipped_rows.values().sum(),
        load_errors: dataset.quality.load_errors.clone(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignSection {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub rows: Vec<MonthlyRevenueRow>,
    pub note: Option<String>,
    pub branches: Section<Vec<BranchPerformance>>,
    pub income_categories: Section<Vec<IncomeCategoryRow>>,
}

pub fn campaign_section(dataset: &Dataset, start: NaiveDate, end: NaiveDate) -> CampaignSection {
    let revenue = dataset.revenue.as_deref();
    let (rows, issue) = periods::campaign_revenue(revenue, start, end);
    let branches = accounts_of(dataset)
        .and_then(|a| periods::campaign_branch_activity(a, start, end))
        .into();
    let income_categories =
        periods::income_categories(dataset.gl_categories.as_ref(), revenue, start, end).into();

    CampaignSection {
        start,
        end,
        rows,
        note: issue.map(|i| i.to_string()),
        branches,
        income_categories,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KpiReport {
    pub run_id: uuid::Uuid,
    pub as_of: chrono::DateTime<chrono::Utc>,
    pub requested_by: Option<String>,
    pub data: DataSummary,
    pub summary: Section<SummaryMetrics>,
    pub product_holding: Section<ProductHolding>,
    pub customer_segments: Section<Vec<CustomerSegmentRow>>,
    pub activity: Section<ActivityReport>,
    pub quarterly: Section<Vec<QuarterRow>>,
    pub quarterly_by_product: Section<Vec<QuarterlyBreakdownRow>>,
    pub quarterly_by_branch: Section<Vec<QuarterlyBreakdownRow>>,
    pub churn: Section<ChurnReport>,
    pub penetration: Section<Vec<PenetrationRow>>,
    pub concentration: Section<Concentration>,
    pub channels: Section<Vec<ChannelAdoptionRow>>,
    pub dormancy: Section<DormancyMetrics>,
    pub branches: Section<Vec<BranchPerformance>>,
    pub account_mix: Section<Vec<AccountMixRow>>,
    pub campaign: CampaignSection,
}

pub fn accounts_of(dataset: &Dataset) -> MetricResult<&AccountTable> {
    dataset
        .accounts
        .as_ref()
        .ok_or(DataIssue::MissingSourceTable { table: ACCOUNTS_TABLE })
}

pub fn summary_metrics(accounts: &AccountTable, ctx: &ReportContext) -> SummaryMetrics {
    let as_of = ctx.as_of_date_naive();
    let year_start = NaiveDate::from_ymd_opt(ctx.reference_year, 1, 1).unwrap_or(as_of);

    SummaryMetrics {
        total_accounts: accounts.len(),
        open_accounts: metrics::open_accounts(accounts).len(),
        unique_customers: metrics::unique_customer_count(accounts).into(),
        avg_products_per_customer: metrics::avg_products_per_customer(accounts).into(),
        customer_tenure_years: metrics::customer_tenure_years(accounts, as_of).into(),
        retention_rate_ytd: metrics::retention_rate(accounts, year_start, as_of).into(),
    }
}

/// Runs every calculator over `dataset`. Individual failures become
/// `Section::NoData`; the report itself always builds.
pub fn build_report(
    dataset: &Dataset,
    ctx: &ReportContext,
    options: &ReportOptions,
) -> KpiReport {
    let accounts = accounts_of(dataset);

    let summary = accounts.clone().map(|a| summary_metrics(a, ctx)).into();
    let product_holding = accounts.clone().and_then(metrics::product_holding).into();
    let customer_segments = accounts.clone().and_then(metrics::customer_segments).into();
    let activity = activity_section(
        accounts.clone(),
        &options.filter,
        options.threshold_days,
        ctx.as_of,
    );
    let quarterly = accounts
        .clone()
        .and_then(|a| periods::quarterly_funded_accounts(a, options.year))
        .into();
    let quarterly_by = |dimension: Dimension| -> Section<Vec<QuarterlyBreakdownRow>> {
        accounts
            .clone()
            .and_then(|a| periods::quarterly_breakdown(a, options.year, dimension))
            .into()
    };
    let churn = churn::monthly_churn(dataset.snapshots.as_deref(), accounts.clone().ok()).into();
    let penetration = accounts
        .clone()
        .and_then(|a| {
            metrics::unique_customer_count(a).and_then(|n| penetration::product_penetration(a, n))
        })
        .into();
    let concentration = accounts.clone().and_then(penetration::account_concentration).into();
    let channels = accounts
        .clone()
        .and_then(|a| penetration::channel_adoption(a, &options.channels))
        .into();
    let dormancy = accounts.clone().map(metrics::dormancy_metrics).into();
    let branches = accounts.clone().and_then(metrics::branch_performance).into();
    let account_mix = accounts.clone().and_then(metrics::account_mix).into();

    KpiReport {
        run_id: ctx.run_id,
        as_of: ctx.as_of,
        requested_by: ctx.requested_by.clone(),
        data: data_summary(dataset),
        summary,
        product_holding,
        customer_segments,
        activity,
        quarterly,
        quarterly_by_product: quarterly_by(Dimension::Product),
        quarterly_by_branch: quarterly_by(Dimension::Branch),
        churn,
        penetration,
        concentration,
        channels,
        dormancy,
        branches,
        account_mix,
        campaign: campaign_section(dataset, options.campaign_start, options.campaign_end),
    }
}

fn no_data(output: &mut String, reason: &str) {
    let _ = writeln!(output, "No data available ({reason}).");
}

fn opt_pct(value: Option<f64>) -> String {
    value.map_or_else(|| "N/A".to_string(), |v| format!("{v:+.1}%"))
}

fn opt_count(value: Option<u64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

/// One bullet per row, or the no-data reason.
fn render_rows<T>(output: &mut String, section: &Section<Vec<T>>, line: impl Fn(&T) -> String) {
    match section {
        Section::Available(rows) if rows.is_empty() => {
            let _ = writeln!(output, "No rows.");
        }
        Section::Available(rows) => {
            for row in rows {
                let _ = writeln!(output, "- {}", line(row));
            }
        }
        Section::NoData(reason) => no_data(output, reason),
    }
}

pub fn render_data_summary(output: &mut String, data: &DataSummary) {
    let loaded =
        |n: Option<usize>| n.map_or_else(|| "not loaded".to_string(), |n| format!("{n} rows"));
    let _ = writeln!(output, "## Data Sources");
    let _ = writeln!(output, "- Accounts: {}", loaded(data.accounts));
    let _ = writeln!(output, "- Products: {}", loaded(data.products));
    let _ = writeln!(output, "- Sector classification: {}", loaded(data.sectors));
    let _ = writeln!(output, "- GL categories: {}", loaded(data.gl_categories));
    let _ = writeln!(output, "- Customer snapshots: {}", loaded(data.snapshots));
    let _ = writeln!(output, "- Revenue postings: {}", loaded(data.revenue_entries));
    if data.date_parse_failures > 0 || data.skipped_rows > 0 {
        let _ = writeln!(
            output,
            "- Data quality: {} unparseable dates treated as missing, {} rows skipped",
            data.date_parse_failures, data.skipped_rows
        );
    }
    for error in &data.load_errors {
        let _ = writeln!(output, "- Load error: {error}");
    }
}

pub fn render_summary(output: &mut String, summary: &Section<SummaryMetrics>) {
    let _ = writeln!(output, "## Executive Summary");
    let summary = match summary {
        Section::Available(summary) => summary,
        Section::NoData(reason) => return no_data(output, reason),
    };

    let _ = writeln!(output, "- Total accounts: {}", summary.total_accounts);
    let _ = writeln!(output, "- Open accounts: {}", summary.open_accounts);
    match &summary.unique_customers {
        Section::Available(n) => {
            let _ = writeln!(output, "- Unique customers: {n}");
        }
        Section::NoData(reason) => {
            let _ = writeln!(output, "- Unique customers: no data ({reason})");
        }
    }
    let scalar = |output: &mut String, label: &str, value: &Section<f64>, unit: &str| match value {
        Section::Available(v) => {
            let _ = writeln!(output, "- {label}: {v:.2}{unit}");
        }
        Section::NoData(reason) => {
            let _ = writeln!(output, "- {label}: no data ({reason})");
        }
    };
    scalar(output, "Average products per customer", &summary.avg_products_per_customer, "");
    scalar(output, "Average customer tenure", &summary.customer_tenure_years, " years");
    scalar(output, "Customer retention (year to date)", &summary.retention_rate_ytd, "%");
}

pub fn render_product_holding(output: &mut String, holding: &Section<ProductHolding>) {
    let _ = writeln!(output, "## Products per Customer");
    let h = match holding {
        Section::Available(h) => h,
        Section::NoData(reason) => return no_data(output, reason),
    };
    let share = |n: usize| {
        metrics::percentage(n as f64, h.customers as f64).map_or_else(String::new, |p| {
            format!(" ({p:.1}%)")
        })
    };
    let _ = writeln!(output, "- 1 product: {}{}", h.one_product, share(h.one_product));
    let _ = writeln!(output, "- 2 products: {}{}", h.two_products, share(h.two_products));
    let _ = writeln!(output, "- 3+ products: {}{}", h.three_or_more, share(h.three_or_more));
    let _ = writeln!(output, "- Most products held by one customer: {}", h.max_products);
}

pub fn render_customer_segments(output: &mut String, segments: &Section<Vec<CustomerSegmentRow>>) {
    let _ = writeln!(output, "## Customer Segments by Account Count");
    render_rows(output, segments, |row| {
        format!(
            "{}: {} customers, {:.2} accounts on average (min {}, max {})",
            row.segment, row.customers, row.avg_accounts, row.min_accounts, row.max_accounts
        )
    });
}

fn breakdown_line(row: &ActivityBreakdownRow) -> String {
    format!(
        "{}: {} active, {} inactive of {} ({:.1}% active)",
        row.key, row.active, row.inactive, row.total, row.activity_rate
    )
}

pub fn render_activity(output: &mut String, activity: &Section<ActivityReport>) {
    let _ = writeln!(output, "## Account Activity");
    let report = match activity {
        Section::Available(report) => report,
        Section::NoData(reason) => return no_data(output, reason),
    };

    let a = &report.summary;
    if !report.filter.is_empty() {
        let _ = writeln!(output, "- Filtered to {}", report.filter);
    }
    let _ = writeln!(
        output,
        "- Active (last transaction within {} days): {}",
        a.threshold_days, a.active_accounts
    );
    let _ = writeln!(
        output,
        "- Inactive: {} ({} with no recorded transaction)",
        a.inactive_accounts, a.never_transacted
    );
    if let Some(share) = a.active_share {
        let _ = writeln!(output, "- Active share: {share:.1}%");
    }

    let _ = writeln!(output, "\n### Days Since Last Transaction");
    for bucket in &report.recency.buckets {
        let _ = writeln!(output, "- {}: {}", bucket.label, bucket.accounts);
    }
    let _ = writeln!(output, "- No transaction recorded: {}", report.recency.no_transaction);
    if report.recency.future_dated > 0 {
        let _ = writeln!(
            output,
            "- Dated after the as-of day: {}",
            report.recency.future_dated
        );
    }

    let _ = writeln!(output, "\n### Activity by Product");
    render_rows(output, &report.by_product, breakdown_line);
    let _ = writeln!(output, "\n### Activity by Branch");
    render_rows(output, &report.by_branch, breakdown_line);
}

pub fn render_quarterly(output: &mut String, quarterly: &Section<Vec<QuarterRow>>) {
    let _ = writeln!(output, "## Funded Accounts by Quarter");
    match quarterly {
        Section::Available(rows) => {
            for row in rows {
                let _ = writeln!(
                    output,
                    "- {} ({} to {}): {} funded accounts, growth {}",
                    row.quarter_label,
                    row.period_start,
                    row.period_end,
                    row.funded_accounts,
                    opt_pct(row.growth_from_previous)
                );
            }
            if let (Some(first), Some(last)) = (rows.first(), rows.last()) {
                if rows.len() > 1 && first.funded_accounts > 0 {
                    let funded: Vec<f64> = rows.iter().map(|r| r.funded_accounts as f64).collect();
                    let cagr = metrics::compound_growth_rate(&funded, (rows.len() - 1) as f64);
                    let _ = writeln!(
                        output,
                        "- Compound quarterly growth {} to {}: {cagr:+.1}%",
                        first.quarter_label, last.quarter_label
                    );
                }
            }
        }
        Section::NoData(reason) => no_data(output, reason),
    }
}

pub fn render_quarterly_breakdown(
    output: &mut String,
    dimension: Dimension,
    rows: &Section<Vec<QuarterlyBreakdownRow>>,
) {
    let label = match dimension {
        Dimension::Product => "Product",
        Dimension::Branch => "Branch",
    };
    let _ = writeln!(output, "## Funded Accounts by {label} and Quarter");
    render_rows(output, rows, |row| {
        let quarters: Vec<String> = row
            .funded_by_quarter
            .iter()
            .enumerate()
            .map(|(i, n)| format!("Q{} {n}", i + 1))
            .collect();
        format!("{}: {} (total {})", row.key, quarters.join(", "), row.total)
    });
}

pub fn render_churn(output: &mut String, churn: &Section<ChurnReport>) {
    let _ = writeln!(output, "## Monthly Churn");
    let report = match churn {
        Section::Available(report) => report,
        Section::NoData(reason) => return no_data(output, reason),
    };

    if report.method == ChurnMethod::ClosureApproximation {
        let _ = writeln!(
            output,
            "> Approximation: no customer snapshot was available. Churn is derived from account \
             closures divided by today's customer count, not the historical monthly base, and is \
             not comparable with snapshot-based churn."
        );
    }
    if report.rows.is_empty() {
        let _ = writeln!(output, "No churn events recorded.");
        return;
    }
    for row in &report.rows {
        let _ = writeln!(
            output,
            "- {}: churned {}, growth {}, churn rate {}, active {}",
            row.month.format("%b %Y"),
            opt_count(row.churned_customers),
            opt_count(row.customer_growth),
            row.churn_rate.map_or_else(|| "N/A".to_string(), |r| format!("{r:.2}%")),
            opt_count(row.active_customers)
        );
    }
}

pub fn render_penetration(output: &mut String, penetration: &Section<Vec<PenetrationRow>>) {
    let _ = writeln!(output, "## Product Penetration");
    match penetration {
        Section::Available(rows) if rows.is_empty() => {
            let _ = writeln!(output, "No products held.");
        }
        Section::Available(rows) => {
            for row in rows {
                let _ = writeln!(
                    output,
                    "- {} ({}): {:.1}% of customers, {} customers, {} accounts",
                    row.product_code,
                    row.product_name.as_deref().unwrap_or("unnamed"),
                    row.penetration_rate,
                    row.unique_customers,
                    row.total_accounts
                );
            }
        }
        Section::NoData(reason) => no_data(output, reason),
    }
}

pub fn render_concentration(output: &mut String, concentration: &Section<Concentration>) {
    let _ = writeln!(output, "## Account Concentration");
    match concentration {
        Section::Available(c) => {
            let _ = writeln!(
                output,
                "- {} customers hold {} accounts",
                c.total_customers, c.total_accounts
            );
            let _ = writeln!(
                output,
                "- Top 10% ({} customers): {} accounts, {:.1}% share",
                c.top_10pct_customers, c.top_10pct_accounts, c.top_10pct_share
            );
            let _ = writeln!(
                output,
                "- Top 20% ({} customers): {} accounts, {:.1}% share",
                c.top_20pct_customers, c.top_20pct_accounts, c.top_20pct_share
            );
        }
        Section::NoData(reason) => no_data(output, reason),
    }
}

pub fn render_channels(output: &mut String, channels: &Section<Vec<ChannelAdoptionRow>>) {
    let _ = writeln!(output, "## Channel Adoption");
    match channels {
        Section::Available(rows) => {
            for row in rows {
                let _ = writeln!(
                    output,
                    "- {}: {} accounts ({:.1}%)",
                    row.label, row.enabled_accounts, row.adoption_rate
                );
            }
        }
        Section::NoData(reason) => no_data(output, reason),
    }
}

pub fn render_dormancy(output: &mut String, dormancy: &Section<DormancyMetrics>) {
    let _ = writeln!(output, "## Dormancy");
    let d = match dormancy {
        Section::Available(d) => d,
        Section::NoData(reason) => return no_data(output, reason),
    };
    let line = |count: Option<usize>, rate: Option<f64>| match (count, rate) {
        (Some(n), Some(r)) => format!("{n} ({r:.1}%)"),
        (Some(n), None) => n.to_string(),
        _ => "not in extract".to_string(),
    };
    let _ = writeln!(output, "- Dormant accounts: {}", line(d.dormant_accounts, d.dormant_rate));
    let _ = writeln!(
        output,
        "- Inoperative accounts: {}",
        line(d.inoperative_accounts, d.inoperative_rate)
    );
}

pub fn render_branches(output: &mut String, branches: &Section<Vec<BranchPerformance>>) {
    let _ = writeln!(output, "## Branch Performance");
    match branches {
        Section::Available(rows) => {
            for row in rows {
                let _ = writeln!(
                    output,
                    "- Branch {}: {} accounts, {} customers",
                    row.branch_code, row.total_accounts, row.unique_customers
                );
            }
        }
        Section::NoData(reason) => no_data(output, reason),
    }
}

pub fn render_account_mix(output: &mut String, mix: &Section<Vec<AccountMixRow>>) {
    let _ = writeln!(output, "## Accounts by Product and Currency");
    match mix {
        Section::Available(rows) => {
            for row in rows {
                let _ = writeln!(
                    output,
                    "- {} {} ({}{}): {} accounts",
                    row.product_code,
                    row.currency,
                    row.product_name.as_deref().unwrap_or("unnamed"),
                    row.product_group
                        .as_deref()
                        .map(|g| format!(", group {g}"))
                        .unwrap_or_default(),
                    row.account_count
                );
            }
        }
        Section::NoData(reason) => no_data(output, reason),
    }
}

pub fn render_campaign(output: &mut String, campaign: &CampaignSection) {
    let _ = writeln!(
        output,
        "## Campaign Revenue ({} to {})",
        campaign.start, campaign.end
    );
    if let Some(note) = &campaign.note {
        let _ = writeln!(
            output,
            "No revenue data available ({note}); months are listed without values."
        );
    }
    for row in &campaign.rows {
        match row.revenue {
            Some(revenue) => {
                let _ = writeln!(
                    output,
                    "- {}: revenue {:.2} (non-funded {:.2}), MoM {}",
                    row.month_name,
                    revenue,
                    row.non_funded_income.unwrap_or(0.0),
                    opt_pct(row.mom_change)
                );
            }
            None => {
                let _ = writeln!(output, "- {}: no data", row.month_name);
            }
        }
    }

    let _ = writeln!(output, "\n### Branches Active in the Campaign Window");
    render_rows(output, &campaign.branches, |row| {
        format!(
            "Branch {}: {} accounts, {} customers",
            row.branch_code, row.total_accounts, row.unique_customers
        )
    });
    let _ = writeln!(output, "\n### Income GL Categories");
    render_rows(output, &campaign.income_categories, |row| {
        let revenue = row
            .revenue
            .map(|r| format!(", revenue {r:.2}"))
            .unwrap_or_default();
        format!("{}: {} GL accounts{revenue}", row.name, row.gl_accounts)
    });
}

pub fn render_markdown(report: &KpiReport) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Marketing KPI Report");
    let _ = writeln!(
        output,
        "Generated as of {} for {} (run {})",
        report.as_of.format("%Y-%m-%d %H:%M UTC"),
        report.requested_by.as_deref().unwrap_or("unknown user"),
        report.run_id
    );

    type Renderer = fn(&mut String, &KpiReport);
    let sections: &[Renderer] = &[
        |o, r| render_data_summary(o, &r.data),
        |o, r| render_summary(o, &r.summary),
        |o, r| render_product_holding(o, &r.product_holding),
        |o, r| render_customer_segments(o, &r.customer_segments),
        |o, r| render_activity(o, &r.activity),
        |o, r| render_quarterly(o, &r.quarterly),
        |o, r| render_quarterly_breakdown(o, Dimension::Product, &r.quarterly_by_product),
        |o, r| render_quarterly_breakdown(o, Dimension::Branch, &r.quarterly_by_branch),
        |o, r| render_churn(o, &r.churn),
        |o, r| render_penetration(o, &r.penetration),
        |o, r| render_concentration(o, &r.concentration),
        |o, r| render_channels(o, &r.channels),
        |o, r| render_dormancy(o, &r.dormancy),
        |o, r| render_branches(o, &r.branches),
        |o, r| render_campaign(o, &r.campaign),
    ];
    for render in sections {
        let _ = writeln!(output);
        render(&mut output, report);
    }
    let _ = writeln!(output);
    render_account_mix(&mut output, &report.account_mix);

    output
}

pub fn render_json(report: &KpiReport) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::DataQuality;
    use crate::models::{AccountRecord, AccountSchema, MonthlySnapshot};
    use chrono::Duration;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ctx() -> ReportContext {
        ReportContext::as_of_date(ymd(2025, 10, 1), Some("analyst".to_string()))
    }

    fn options() -> ReportOptions {
        ReportOptions {
            threshold_days: 90,
            year: 2025,
            campaign_start: ymd(2025, 6, 1),
            campaign_end: ymd(2025, 9, 30),
            channels: Channel::ALL.to_vec(),
            filter: AccountFilter::default(),
        }
    }

    fn dataset() -> Dataset {
        let today = ymd(2025, 10, 1);
        let records = vec![
            AccountRecord {
                account_number: "1".to_string(),
                customer_id: Some("C1".to_string()),
                product_code: Some("SAV".to_string()),
                last_transaction_on: Some(today - Duration::days(95)),
                opened_on: Some(ymd(2020, 1, 1)),
                ..AccountRecord::default()
            },
            AccountRecord {
                account_number: "2".to_string(),
                customer_id: Some("C2".to_string()),
                product_code: Some("LOAN".to_string()),
                last_transaction_on: Some(today - Duration::days(10)),
                opened_on: Some(ymd(2022, 1, 1)),
                ..AccountRecord::default()
            },
            AccountRecord {
                account_number: "3".to_string(),
                customer_id: Some("C3".to_string()),
                product_code: Some("SAV".to_string()),
                opened_on: Some(ymd(2024, 1, 1)),
                ..AccountRecord::default()
            },
        ];
        let schema = AccountSchema::from_headers([
            "ACNTS_ACCOUNT_NUMBER",
            "ACNTS_CLIENT_NUM",
            "ACNTS_PROD_CODE",
            "ACNTS_LAST_TRAN_DATE",
            "ACNTS_OPENING_DATE",
            "ACNTS_CLOSURE_DATE",
        ]);
        Dataset {
            accounts: Some(AccountTable::new(schema, records)),
            snapshots: Some(vec![
                MonthlySnapshot {
                    month: ymd(2025, 1, 1),
                    active_customers: 1000,
                },
                MonthlySnapshot {
                    month: ymd(2025, 2, 1),
                    active_customers: 950,
                },
            ]),
            quality: DataQuality::default(),
            ..Dataset::default()
        }
    }

    #[test]
    fn report_survives_missing_tables_and_columns() {
        let report = build_report(&dataset(), &ctx(), &options());

        let activity = report.activity.available().unwrap();
        assert_eq!(
            activity.summary,
            ActivitySummary {
                threshold_days: 90,
                active_accounts: 1,
                inactive_accounts: 2,
                never_transacted: 1,
                active_share: crate::metrics::percentage(1.0, 3.0),
            }
        );
        assert_eq!(activity.recency.no_transaction, 1);
        assert_eq!(activity.by_product.available().map(Vec::len), Some(2));
        assert!(matches!(activity.by_branch, Section::NoData(_)));
        assert!(matches!(report.channels, Section::NoData(_)));
        assert!(matches!(report.branches, Section::NoData(_)));
        assert!(matches!(
            report.churn,
            Section::Available(ChurnReport {
                method: ChurnMethod::Snapshot,
                ..
            })
        ));
        assert!(report.campaign.note.is_some());
        assert_eq!(report.campaign.rows.len(), 4);
        assert!(matches!(report.campaign.branches, Section::NoData(_)));
        assert!(matches!(report.campaign.income_categories, Section::NoData(_)));

        let summary = report.summary.available().unwrap();
        assert_eq!(summary.unique_customers, Section::Available(3));
        assert!(matches!(summary.avg_products_per_customer, Section::NoData(_)));
    }

    #[test]
    fn no_accounts_renders_no_data_everywhere() {
        let report = build_report(&Dataset::default(), &ctx(), &options());
        let markdown = render_markdown(&report);

        assert!(markdown.contains("# Marketing KPI Report"));
        assert!(markdown.contains("No data available (the accounts table was not loaded)."));
        assert!(markdown.contains("## Monthly Churn"));
        assert!(markdown.contains("- Accounts: not loaded"));
    }

    #[test]
    fn markdown_flags_approximate_churn() {
        let mut data = dataset();
        data.snapshots = None;
        let report = build_report(&data, &ctx(), &options());
        let markdown = render_markdown(&report);
        assert!(markdown.contains("> Approximation: no customer snapshot was available."));
    }

    #[test]
    fn markdown_shows_undefined_growth_as_na() {
        let report = build_report(&dataset(), &ctx(), &options());
        let markdown = render_markdown(&report);
        assert!(markdown
            .contains("- Q1 2025 (2025-01-01 to 2025-03-31): 0 funded accounts, growth N/A"));
        assert!(markdown.contains("- Jan 2025: churned -, growth -, churn rate N/A, active 1000"));
        assert!(
            markdown.contains("- Feb 2025: churned 50, growth 0, churn rate 5.00%, active 950")
        );
    }

    #[test]
    fn json_output_tags_sections() {
        let report = build_report(&dataset(), &ctx(), &options());
        let json: serde_json::Value =
            serde_json::from_str(&render_json(&report).unwrap()).unwrap();
        assert_eq!(json["activity"]["status"], "available");
        assert_eq!(json["activity"]["value"]["active_accounts"], 1);
        assert_eq!(json["activity"]["value"]["recency"]["no_transaction"], 1);
        assert!(json["activity"]["value"].get("filter").is_none());
        assert_eq!(json["product_holding"]["value"]["one_product"], 3);
        assert_eq!(json["channels"]["status"], "no_data");
        assert_eq!(json["churn"]["value"]["method"], "snapshot");
    }

    #[test]
    fn filter_narrows_activity_but_not_the_summary() {
        let mut options = options();
        options.filter.product = Some("SAV".to_string());
        let report = build_report(&dataset(), &ctx(), &options);

        let activity = report.activity.available().unwrap();
        assert_eq!(activity.summary.active_accounts, 0);
        assert_eq!(activity.summary.inactive_accounts, 2);
        assert_eq!(report.summary.available().unwrap().total_accounts, 3);

        let markdown = render_markdown(&report);
        assert!(markdown.contains("- Filtered to product SAV"));
        assert!(markdown.contains("- 91-120 days: 1"));
    }

    #[test]
    fn markdown_lists_new_breakdowns() {
        let report = build_report(&dataset(), &ctx(), &options());
        let markdown = render_markdown(&report);

        assert!(markdown.contains("## Funded Accounts by Product and Quarter"));
        assert!(markdown.contains("- LOAN: Q1 0, Q2 0, Q3 1 (total 1)"));
        assert!(markdown.contains("- SAV: 0 active, 2 inactive of 2 (0.0% active)"));
        assert!(markdown.contains("- Single Account: 3 customers, 1.00 accounts on average"));
        assert!(markdown.contains("- 1 product: 3 (100.0%)"));
        assert!(markdown.contains("### Income GL Categories"));
        assert!(markdown.contains("No data available (the gl_categories table was not loaded)."));
    }
}
