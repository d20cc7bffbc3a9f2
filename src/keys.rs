//! Key classification commands and the level cache.
//!
//! Classified levels are stored in the `credential_levels` table so that a
//! normal run does not have to verify every key first. Keys missing from
//! the cache are verified on startup; `harvest keys check` re-verifies all
//! of them.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;

use crate::client::{HttpSearchApi, SearchApi};
use crate::config::Config;
use crate::credentials::{mask_key, Classification, CredentialPool};
use crate::db;
use crate::migrate;
use crate::models::PrivilegeLevel;
use crate::proxy::ProxySelector;

/// Cached `(level, verified_at)` for every key in the table.
pub async fn load_levels(pool: &SqlitePool) -> Result<HashMap<String, (PrivilegeLevel, i64)>> {
    let rows = sqlx::query("SELECT key, level, verified_at FROM credential_levels")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let level: i64 = row.get("level");
            let level = PrivilegeLevel(level.clamp(-1, 3) as i8);
            (row.get("key"), (level, row.get("verified_at")))
        })
        .collect())
}

pub async fn save_levels(pool: &SqlitePool, results: &[Classification]) -> Result<()> {
    let now = Utc::now().timestamp();
    for r in results {
        sqlx::query(
            r#"
            INSERT INTO credential_levels (key, level, verified_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                level = excluded.level,
                verified_at = excluded.verified_at
            "#,
        )
        .bind(&r.key)
        .bind(i64::from(r.level.0))
        .bind(now)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Build the credential pool from config, filling levels from the cache
/// and verifying any key the cache does not know.
pub async fn open_pool(
    config: &Config,
    db: &SqlitePool,
    api: &dyn SearchApi,
) -> Result<Arc<CredentialPool>> {
    if config.keys.is_empty() {
        bail!("No API keys configured. Add `keys = [\"...\"]` to the config file.");
    }

    let cache = load_levels(db).await?;
    let pool = CredentialPool::new(&config.keys);
    let mut unknown = 0;
    for credential in pool.snapshot() {
        match cache.get(&credential.key) {
            Some((level, verified_at)) => {
                pool.set_level(&credential.key, *level, DateTime::from_timestamp(*verified_at, 0))
            }
            None => unknown += 1,
        }
    }

    if unknown > 0 {
        tracing::info!(unknown, "verifying keys missing from the level cache");
        let proxies = ProxySelector::new(&config.proxy.pool, config.proxy.fallback.as_deref());
        let results = pool.classify(api, &proxies).await;
        save_levels(db, &results).await?;
    }

    if !pool.has_usable() {
        tracing::warn!("no configured key passed verification");
    }
    Ok(Arc::new(pool))
}

/// `harvest keys check`: verify every key and refresh the cache.
pub async fn run_keys_check(config: &Config) -> Result<()> {
    if config.keys.is_empty() {
        bail!("No API keys configured. Add `keys = [\"...\"]` to the config file.");
    }
    let db = db::connect(config).await?;
    migrate::ensure_schema(&db).await?;

    let api = HttpSearchApi::new(&config.api);
    let pool = CredentialPool::new(&config.keys);
    let proxies = ProxySelector::new(&config.proxy.pool, config.proxy.fallback.as_deref());
    let results = pool.classify(&api, &proxies).await;
    save_levels(&db, &results).await?;

    println!("{:<4} {:<12} {:<16} {:<20} STATUS", "#", "KEY", "LEVEL", "USER");
    for r in &results {
        let status = match &r.error {
            Some(e) => format!("error: {}", e),
            None => "ok".to_string(),
        };
        println!(
            "{:<4} {:<12} {:<16} {:<20} {}",
            r.index,
            mask_key(&r.key),
            r.level.to_string(),
            r.username.as_deref().unwrap_or("-"),
            status
        );
    }

    db.close().await;
    Ok(())
}

/// `harvest keys list`: print cached levels without contacting the remote.
pub async fn run_keys_list(config: &Config) -> Result<()> {
    let db = db::connect(config).await?;
    migrate::ensure_schema(&db).await?;
    let cache = load_levels(&db).await?;

    println!("{:<4} {:<12} {:<16} VERIFIED", "#", "KEY", "LEVEL");
    for (i, key) in config.keys.iter().enumerate() {
        let (level, verified) = match cache.get(key.trim()) {
            Some((level, ts)) => (level.to_string(), crate::history::format_ts_relative(*ts)),
            None => ("-".to_string(), "never".to_string()),
        };
        println!("{:<4} {:<12} {:<16} {}", i + 1, mask_key(key), level, verified);
    }

    db.close().await;
    Ok(())
}
