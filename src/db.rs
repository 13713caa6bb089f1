use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::context::ReportContext;

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub run_id: Uuid,
    pub username: Option<String>,
    pub action: String,
    pub dashboard: Option<String>,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn log_action(
    pool: &PgPool,
    ctx: &ReportContext,
    action: &str,
    dashboard: Option<&str>,
    details: Option<&serde_json::Value>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO kpi_portal.audit_log (run_id, username, action, dashboard, details)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(ctx.run_id)
    .bind(ctx.requested_by.as_deref())
    .bind(action)
    .bind(dashboard)
    .bind(details.map(|d| d.to_string()))
    .execute(pool)
    .await?;

    log::debug!("audit: {action} by {:?} (run {})", ctx.requested_by, ctx.run_id);
    Ok(())
}

pub async fn fetch_recent_actions(
    pool: &PgPool,
    username: Option<&str>,
    limit: i64,
) -> anyhow::Result<Vec<AuditEntry>> {
    let mut query = String::from(
        "SELECT run_id, username, action, dashboard, details, created_at \
         FROM kpi_portal.audit_log",
    );
    if username.is_some() {
        query.push_str(" WHERE username = $2");
    }
    query.push_str(" ORDER BY created_at DESC LIMIT $1");

    let mut rows = sqlx::query(&query).bind(limit.max(1));
    if let Some(value) = username {
        rows = rows.bind(value);
    }

    let records = rows.fetch_all(pool).await?;
    let mut entries = Vec::with_capacity(records.len());

    for row in records {
        entries.push(AuditEntry {
            run_id: row.get("run_id"),
            username: row.get("username"),
            action: row.get("action"),
            dashboard: row.get("dashboard"),
            details: row.get("details"),
            created_at: row.get("created_at"),
        });
    }

    Ok(entries)
}
