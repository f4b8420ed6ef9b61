//! Database statistics.
//!
//! A quick summary of what's indexed: compound, molecule and atom counts,
//! dedup links, quarantine, and a per-bucket breakdown. Used by
//! `anchor stats`.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use anchor_core::models::{Provenance, QUARANTINE_TAG};
use anchor_core::store::Store;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Clone, Serialize)]
pub struct BucketStats {
    pub bucket: String,
    pub atoms: i64,
    pub tags: i64,
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub compounds: i64,
    pub molecules: i64,
    pub atoms: i64,
    pub variant_links: i64,
    pub tag_assocs: i64,
    pub quarantined: i64,
    pub oversized: i64,
    pub buckets: Vec<BucketStats>,
}

async fn count(pool: &SqlitePool, sql: &str) -> Result<i64> {
    Ok(sqlx::query_scalar(sql).fetch_one(pool).await?)
}

pub async fn collect(pool: &SqlitePool) -> Result<StoreStats> {
    let quarantined: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM atoms a WHERE a.provenance = ? \
         OR EXISTS (SELECT 1 FROM tag_assoc t WHERE t.atom_id = a.id AND t.tag = ?)",
    )
    .bind(Provenance::Quarantined.as_str())
    .bind(QUARANTINE_TAG)
    .fetch_one(pool)
    .await?;

    let bucket_rows = sqlx::query(
        r#"
        SELECT
            m.bucket AS bucket,
            COUNT(DISTINCT m.atom_id) AS atoms,
            (SELECT COUNT(DISTINCT t.tag) FROM tag_assoc t WHERE t.bucket = m.bucket) AS tags,
            MAX(a.last_seen) AS last_seen
        FROM atom_buckets m
        JOIN atoms a ON a.id = m.atom_id
        GROUP BY m.bucket
        ORDER BY atoms DESC, bucket ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut buckets = Vec::with_capacity(bucket_rows.len());
    for row in &bucket_rows {
        buckets.push(BucketStats {
            bucket: row.try_get("bucket")?,
            atoms: row.try_get("atoms")?,
            tags: row.try_get("tags")?,
            last_seen: row.try_get("last_seen")?,
        });
    }

    Ok(StoreStats {
        compounds: count(pool, "SELECT COUNT(*) FROM compounds").await?,
        molecules: count(pool, "SELECT COUNT(*) FROM molecules").await?,
        atoms: count(pool, "SELECT COUNT(*) FROM atoms").await?,
        variant_links: count(pool, "SELECT COUNT(*) FROM variant_of").await?,
        tag_assocs: count(pool, "SELECT COUNT(*) FROM tag_assoc").await?,
        quarantined,
        oversized: count(pool, "SELECT COUNT(*) FROM molecules WHERE oversized = 1").await?,
        buckets,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config, json: bool) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let stats = collect(store.pool()).await;
    store.close().await;
    let stats = stats?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    if json {
        let mut value = serde_json::to_value(&stats)?;
        value["db_size_bytes"] = serde_json::json!(db_size);
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Anchor — Database Stats");
    println!("=======================");
    println!();
    println!("  Database:     {}", config.db.path.display());
    println!("  Size:         {}", format_bytes(db_size));
    println!();
    println!("  Compounds:    {}", stats.compounds);
    println!("  Molecules:    {} ({} oversized)", stats.molecules, stats.oversized);
    println!("  Atoms:        {}", stats.atoms);
    println!("  Variants:     {}", stats.variant_links);
    println!("  Tag links:    {}", stats.tag_assocs);
    println!("  Quarantined:  {}", stats.quarantined);

    if !stats.buckets.is_empty() {
        println!();
        println!("  By bucket:");
        println!("  {:<24} {:>8} {:>8}   {}", "BUCKET", "ATOMS", "TAGS", "LAST SEEN");
        println!("  {}", "-".repeat(60));
        for b in &stats.buckets {
            let seen = b
                .last_seen
                .map(format_ts_relative)
                .unwrap_or_else(|| "never".to_string());
            println!("  {:<24} {:>8} {:>8}   {}", b.bucket, b.atoms, b.tags, seen);
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix-millisecond timestamp relative to now ("3 hours ago").
fn format_ts_relative(ts_ms: i64) -> String {
    let delta = (chrono::Utc::now().timestamp_millis() - ts_ms) / 1000;

    if delta < 0 {
        return format_ts_iso(ts_ms);
    }

    let plural = |n: i64| if n == 1 { "" } else { "s" };
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        format!("{} min{} ago", delta / 60, plural(delta / 60))
    } else if delta < 86400 {
        format!("{} hour{} ago", delta / 3600, plural(delta / 3600))
    } else if delta < 86400 * 30 {
        format!("{} day{} ago", delta / 86400, plural(delta / 86400))
    } else {
        format_ts_iso(ts_ms)
    }
}

fn format_ts_iso(ts_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts_ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_format_ts_relative() {
        let now = chrono::Utc::now().timestamp_millis();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 2 * 3600 * 1000), "2 hours ago");
        assert_eq!(format_ts_relative(now - 86400 * 1000 - 5000), "1 day ago");
    }
}
