//! Extraction history.
//!
//! Every finished extraction records its output file and record count,
//! keyed by query. `harvest history` lists the table and `harvest update`
//! uses it to find the file to merge into.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;

use crate::config::Config;
use crate::db;
use crate::migrate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub query: String,
    pub file_path: PathBuf,
    pub result_count: i64,
    pub updated_at: i64,
}

/// Insert or replace the entry for `query`.
pub async fn record(
    pool: &SqlitePool,
    query: &str,
    file_path: &std::path::Path,
    result_count: usize,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO history (query, file_path, result_count, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(query) DO UPDATE SET
            file_path = excluded.file_path,
            result_count = excluded.result_count,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(query)
    .bind(file_path.display().to_string())
    .bind(result_count as i64)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn lookup(pool: &SqlitePool, query: &str) -> Result<Option<HistoryEntry>> {
    let row = sqlx::query(
        "SELECT query, file_path, result_count, updated_at FROM history WHERE query = ?",
    )
    .bind(query)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| HistoryEntry {
        query: row.get("query"),
        file_path: PathBuf::from(row.get::<String, _>("file_path")),
        result_count: row.get("result_count"),
        updated_at: row.get("updated_at"),
    }))
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<HistoryEntry>> {
    let rows = sqlx::query(
        "SELECT query, file_path, result_count, updated_at FROM history ORDER BY updated_at DESC",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| HistoryEntry {
            query: row.get("query"),
            file_path: PathBuf::from(row.get::<String, _>("file_path")),
            result_count: row.get("result_count"),
            updated_at: row.get("updated_at"),
        })
        .collect())
}

/// Run the history command: print every recorded extraction.
pub async fn run_history(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;
    let entries = list(&pool).await?;

    if entries.is_empty() {
        println!("No extractions recorded yet.");
        pool.close().await;
        return Ok(());
    }

    println!("  {:>8}   {:<16} {:<40} FILE", "RECORDS", "UPDATED", "QUERY");
    println!("  {}", "-".repeat(96));
    for e in &entries {
        println!(
            "  {:>8}   {:<16} {:<40} {}",
            e.result_count,
            format_ts_relative(e.updated_at),
            truncate(&e.query, 40),
            e.file_path.display()
        );
    }
    println!();

    pool.close().await;
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
