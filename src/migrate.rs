use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table the CLI uses. Safe to run repeatedly.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    // Finished extractions, one row per query
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS history (
            query TEXT PRIMARY KEY,
            file_path TEXT NOT NULL,
            result_count INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Cached key classification
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS credential_levels (
            key TEXT PRIMARY KEY,
            level INTEGER NOT NULL,
            verified_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_history_updated_at ON history(updated_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
