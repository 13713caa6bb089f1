use std::path::PathBuf;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};

mod churn;
mod config;
mod context;
mod dates;
mod db;
mod error;
mod loader;
mod metrics;
mod models;
mod penetration;
mod periods;
mod report;
mod segmentation;

use config::{DataSources, SourceOverrides};
use context::ReportContext;
use models::{AccountFilter, Channel, Dimension};
use report::{ReportOptions, Section};
use segmentation::{ActivityStatus, DEFAULT_ACTIVITY_THRESHOLD_DAYS};

#[derive(Parser)]
#[command(name = "kpi-metrics")]
#[command(about = "Marketing KPI metrics over core-banking account extracts", long_about = None)]
struct Cli {
    #[command(flatten)]
    data: DataArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct DataArgs {
    /// Directory holding the CSV extracts
    #[arg(long, global = true, env = "KPI_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,
    #[arg(long, global = true)]
    accounts: Option<PathBuf>,
    #[arg(long, global = true)]
    products: Option<PathBuf>,
    #[arg(long, global = true)]
    sectors: Option<PathBuf>,
    #[arg(long, global = true)]
    gl_categories: Option<PathBuf>,
    #[arg(long, global = true)]
    snapshot: Option<PathBuf>,
    #[arg(long, global = true)]
    revenue: Option<PathBuf>,
    /// Compute as of the end of this date instead of now
    #[arg(long, global = true)]
    as_of: Option<NaiveDate>,
    /// Year that bare snapshot month numbers belong to
    #[arg(long, global = true)]
    reference_year: Option<i32>,
    #[arg(long, global = true, env = "KPI_USER")]
    user: Option<String>,
    #[arg(long, global = true, value_enum, default_value_t = Format::Markdown)]
    format: Format,
}

/// Narrows the accounts before activity segmentation
#[derive(Args, Clone, Default)]
struct FilterArgs {
    /// Only accounts held at this branch code
    #[arg(long)]
    branch: Option<String>,
    /// Only accounts of this product code or name
    #[arg(long)]
    product: Option<String>,
    /// Only accounts in this currency
    #[arg(long)]
    currency: Option<String>,
    /// Only accounts with this creation status
    #[arg(long)]
    status: Option<String>,
}

impl From<FilterArgs> for AccountFilter {
    fn from(args: FilterArgs) -> Self {
        AccountFilter {
            branch: args.branch,
            product: args.product,
            currency: args.currency,
            status: args.status,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Markdown,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the audit-log schema
    InitDb,
    /// Show recent audit-log entries
    Audit {
        /// Only show entries logged by this user
        #[arg(long)]
        username: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Loaded tables and headline customer figures
    Summary,
    /// Split accounts into active and inactive by last transaction date
    Activity {
        #[arg(long, default_value_t = DEFAULT_ACTIVITY_THRESHOLD_DAYS)]
        threshold_days: i64,
        /// Also list this many accounts, longest since last transaction first
        #[arg(long, default_value_t = 0)]
        list: usize,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Funded accounts per quarter, overall and by product and branch
    Quarterly {
        #[arg(long)]
        year: Option<i32>,
    },
    /// Month-over-month customer churn
    Churn,
    /// Product penetration across the customer base
    Penetration {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Share of accounts held by the top customers
    Concentration,
    /// Digital and assisted channel adoption
    Channels,
    /// Monthly revenue over a campaign window
    Campaign {
        #[arg(long)]
        start: Option<NaiveDate>,
        #[arg(long)]
        end: Option<NaiveDate>,
    },
    /// Generate the full KPI report
    Report {
        #[arg(long, default_value_t = DEFAULT_ACTIVITY_THRESHOLD_DAYS)]
        threshold_days: i64,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        campaign_start: Option<NaiveDate>,
        #[arg(long)]
        campaign_end: Option<NaiveDate>,
        #[arg(long, default_value = "kpi_report.md")]
        out: PathBuf,
        #[command(flatten)]
        filter: FilterArgs,
    },
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

/// The non-funded income campaign ran June through September.
fn campaign_window(
    year: i32,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> anyhow::Result<(NaiveDate, NaiveDate)> {
    let start = match start {
        Some(date) => date,
        None => NaiveDate::from_ymd_opt(year, 6, 1).context("invalid campaign year")?,
    };
    let end = match end {
        Some(date) => date,
        None => NaiveDate::from_ymd_opt(year, 9, 30).context("invalid campaign year")?,
    };
    if start > end {
        anyhow::bail!("campaign start {start} is after campaign end {end}");
    }
    Ok((start, end))
}

fn emit<T: Serialize>(
    format: Format,
    section: &Section<T>,
    render: impl FnOnce(&mut String, &Section<T>),
) -> anyhow::Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(section)?),
        Format::Markdown => {
            let mut output = String::new();
            render(&mut output, section);
            print!("{output}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let args = cli.data;

    match cli.command {
        Commands::InitDb => {
            let pool = connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
            return Ok(());
        }
        Commands::Audit { username, limit } => {
            let pool = connect().await?;
            let entries = db::fetch_recent_actions(&pool, username.as_deref(), limit).await?;
            if entries.is_empty() {
                println!("No audit entries recorded.");
            }
            for entry in entries {
                println!(
                    "- {} {} by {} ({}){}{}",
                    entry.created_at.format("%Y-%m-%d %H:%M"),
                    entry.action,
                    entry.username.as_deref().unwrap_or("unknown"),
                    entry.run_id,
                    entry
                        .dashboard
                        .map(|d| format!(" on {d}"))
                        .unwrap_or_default(),
                    entry.details.map(|d| format!(": {d}")).unwrap_or_default()
                );
            }
            return Ok(());
        }
        _ => {}
    }

    let mut ctx = match args.as_of {
        Some(date) => ReportContext::as_of_date(date, args.user.clone()),
        None => ReportContext::now(args.user.clone()),
    };
    if let Some(year) = args.reference_year {
        ctx = ctx.with_reference_year(year);
    }

    let overrides = SourceOverrides {
        accounts: args.accounts.clone(),
        products: args.products.clone(),
        sectors: args.sectors.clone(),
        gl_categories: args.gl_categories.clone(),
        snapshots: args.snapshot.clone(),
        revenue: args.revenue.clone(),
    };
    let sources = DataSources::discover(&args.data_dir, overrides)?;
    let dataset = loader::load_dataset(&sources, ctx.reference_year);
    if !dataset.quality.is_clean() {
        log::warn!(
            "some input rows or fields could not be read; \
             run `summary` for the data-quality breakdown"
        );
    }
    let accounts = report::accounts_of(&dataset);

    match cli.command {
        Commands::Summary => {
            let summary: Section<_> =
                accounts.clone().map(|a| report::summary_metrics(a, &ctx)).into();
            let holding: Section<_> = accounts.clone().and_then(metrics::product_holding).into();
            let segments: Section<_> = accounts.and_then(metrics::customer_segments).into();
            let data = report::data_summary(&dataset);
            match args.format {
                Format::Json => {
                    let value = serde_json::json!({
                        "data": data,
                        "summary": summary,
                        "product_holding": holding,
                        "customer_segments": segments,
                    });
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
                Format::Markdown => {
                    let mut output = String::new();
                    report::render_data_summary(&mut output, &data);
                    output.push('\n');
                    report::render_summary(&mut output, &summary);
                    output.push('\n');
                    report::render_product_holding(&mut output, &holding);
                    output.push('\n');
                    report::render_customer_segments(&mut output, &segments);
                    print!("{output}");
                }
            }
        }
        Commands::Activity {
            threshold_days,
            list,
            filter,
        } => {
            let filter = AccountFilter::from(filter);
            let narrowed = accounts.map(|a| filter.narrow(a));
            let activity = narrowed.as_ref().map_err(Clone::clone).and_then(|table| {
                segmentation::segment_by_activity(table, threshold_days, ctx.as_of)
                    .map(|segments| (table, segments))
            });
            if list > 0 && args.format == Format::Markdown {
                if let Ok((_, segments)) = &activity {
                    let mut ranked: Vec<_> = segments.all().collect();
                    ranked.sort_by_key(|s| {
                        std::cmp::Reverse(s.days_since_last_txn.unwrap_or(i64::MAX))
                    });
                    println!("Accounts by time since last transaction:");
                    for s in ranked.into_iter().take(list) {
                        let status = match s.status {
                            ActivityStatus::Active => "active",
                            ActivityStatus::Inactive => "inactive",
                        };
                        let since = s
                            .days_since_last_txn
                            .map_or_else(|| "no transactions".to_string(), |d| format!("{d} days"));
                        println!(
                            "- {} (customer {}, {status}): {since}",
                            s.account.account_number,
                            s.account.customer_id.as_deref().unwrap_or("unknown"),
                        );
                    }
                    println!();
                }
            }
            let section: Section<_> = activity
                .map(|(table, segments)| {
                    report::activity_report(&table.schema, &segments, &filter)
                })
                .into();
            emit(args.format, &section, report::render_activity)?;
        }
        Commands::Quarterly { year } => {
            let year = year.unwrap_or(ctx.reference_year);
            let quarters: Section<_> = accounts
                .clone()
                .and_then(|a| periods::quarterly_funded_accounts(a, year))
                .into();
            let by_product: Section<_> = accounts
                .clone()
                .and_then(|a| periods::quarterly_breakdown(a, year, Dimension::Product))
                .into();
            let by_branch: Section<_> = accounts
                .and_then(|a| periods::quarterly_breakdown(a, year, Dimension::Branch))
                .into();
            match args.format {
                Format::Json => {
                    let value = serde_json::json!({
                        "quarters": quarters,
                        "by_product": by_product,
                        "by_branch": by_branch,
                    });
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
                Format::Markdown => {
                    let mut output = String::new();
                    report::render_quarterly(&mut output, &quarters);
                    output.push('\n');
                    for (dimension, rows) in [
                        (Dimension::Product, &by_product),
                        (Dimension::Branch, &by_branch),
                    ] {
                        output.push('\n');
                        report::render_quarterly_breakdown(&mut output, dimension, rows);
                    }
                    print!("{output}");
                }
            }
        }
        Commands::Churn => {
            let section: Section<_> =
                churn::monthly_churn(dataset.snapshots.as_deref(), accounts.ok()).into();
            emit(args.format, &section, report::render_churn)?;
        }
        Commands::Penetration { limit } => {
            let section: Section<_> = accounts
                .and_then(|a| {
                    metrics::unique_customer_count(a)
                        .and_then(|n| penetration::product_penetration(a, n))
                })
                .map(|rows| rows.into_iter().take(limit).collect::<Vec<_>>())
                .into();
            emit(args.format, &section, report::render_penetration)?;
        }
        Commands::Concentration => {
            let section: Section<_> = accounts.and_then(penetration::account_concentration).into();
            emit(args.format, &section, report::render_concentration)?;
        }
        Commands::Channels => {
            let section: Section<_> = accounts
                .and_then(|a| penetration::channel_adoption(a, &Channel::ALL))
                .into();
            emit(args.format, &section, report::render_channels)?;
        }
        Commands::Campaign { start, end } => {
            let (start, end) = campaign_window(ctx.reference_year, start, end)?;
            let campaign = report::campaign_section(&dataset, start, end);
            match args.format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&campaign)?),
                Format::Markdown => {
                    let mut output = String::new();
                    report::render_campaign(&mut output, &campaign);
                    print!("{output}");
                }
            }
        }
        Commands::Report {
            threshold_days,
            year,
            campaign_start,
            campaign_end,
            out,
            filter,
        } => {
            let year = year.unwrap_or(ctx.reference_year);
            let (campaign_start, campaign_end) =
                campaign_window(year, campaign_start, campaign_end)?;
            let options = ReportOptions {
                threshold_days,
                year,
                campaign_start,
                campaign_end,
                channels: Channel::ALL.to_vec(),
                filter: filter.into(),
            };
            let kpi_report = report::build_report(&dataset, &ctx, &options);
            let rendered = match args.format {
                Format::Json => report::render_json(&kpi_report)?,
                Format::Markdown => report::render_markdown(&kpi_report),
            };
            std::fs::write(&out, rendered)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());

            if std::env::var_os("DATABASE_URL").is_some() {
                let details = serde_json::json!({
                    "out": out.display().to_string(),
                    "threshold_days": threshold_days,
                    "year": year,
                    "filter": options.filter,
                });
                let logged = match connect().await {
                    Ok(pool) => {
                        let dashboard = Some("kpi_report");
                        db::log_action(&pool, &ctx, "report_generated", dashboard, Some(&details))
                            .await
                    }
                    Err(err) => Err(err),
                };
                if let Err(err) = logged {
                    log::warn!("report written but audit entry failed: {err:#}");
                }
            } else {
                log::info!("DATABASE_URL not set; skipping audit entry");
            }
        }
        Commands::InitDb | Commands::Audit { .. } => unreachable!("handled before loading data"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn campaign_defaults_to_june_through_september() {
        let (start, end) = campaign_window(2025, None, None).unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2025, 9, 30).unwrap());
    }

    #[test]
    fn campaign_rejects_inverted_window() {
        let start = NaiveDate::from_ymd_opt(2025, 9, 1);
        let end = NaiveDate::from_ymd_opt(2025, 6, 1);
        assert!(campaign_window(2025, start, end).is_err());
    }

    #[test]
    fn parses_report_arguments() {
        let cli = Cli::try_parse_from([
            "kpi-metrics",
            "--data-dir",
            "extracts",
            "report",
            "--threshold-days",
            "60",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.data.data_dir, PathBuf::from("extracts"));
        assert!(cli.data.format == Format::Json);
        match cli.command {
            Commands::Report { threshold_days, .. } => assert_eq!(threshold_days, 60),
            _ => panic!("expected report command"),
        }
    }

    #[test]
    fn parses_activity_filters_and_lookup_overrides() {
        let cli = Cli::try_parse_from([
            "kpi-metrics",
            "activity",
            "--branch",
            "101",
            "--status",
            "active",
            "--gl-categories",
            "gl.csv",
        ])
        .unwrap();
        assert_eq!(cli.data.gl_categories, Some(PathBuf::from("gl.csv")));
        assert_eq!(cli.data.sectors, None);
        match cli.command {
            Commands::Activity { filter, .. } => {
                let filter = AccountFilter::from(filter);
                assert_eq!(filter.branch.as_deref(), Some("101"));
                assert_eq!(filter.status.as_deref(), Some("active"));
                assert_eq!(filter.product, None);
            }
            _ => panic!("expected activity command"),
        }
    }
}
