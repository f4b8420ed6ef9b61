//! Schema creation. Every statement is idempotent, so `anchor init` can be
//! re-run against an existing database.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS compounds (
        id TEXT PRIMARY KEY,
        path TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        provenance TEXT NOT NULL,
        signature INTEGER NOT NULL,
        content TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS atoms (
        pk INTEGER PRIMARY KEY,
        id TEXT NOT NULL UNIQUE,
        content TEXT NOT NULL,
        content_hash TEXT NOT NULL UNIQUE,
        source_path TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        content_type TEXT NOT NULL,
        fingerprint INTEGER NOT NULL,
        fp_band0 INTEGER NOT NULL,
        fp_band1 INTEGER NOT NULL,
        fp_band2 INTEGER NOT NULL,
        fp_band3 INTEGER NOT NULL,
        provenance TEXT NOT NULL,
        first_seen INTEGER NOT NULL,
        last_seen INTEGER NOT NULL,
        occurrences INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS molecules (
        id TEXT PRIMARY KEY,
        compound_id TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        start_byte INTEGER NOT NULL,
        end_byte INTEGER NOT NULL,
        content_type TEXT NOT NULL,
        numeric_value REAL,
        numeric_unit TEXT,
        fingerprint INTEGER NOT NULL,
        timestamp INTEGER NOT NULL,
        atom_id TEXT,
        oversized INTEGER NOT NULL DEFAULT 0,
        continued INTEGER NOT NULL DEFAULT 0,
        UNIQUE(compound_id, sequence)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tag_assoc (
        atom_id TEXT NOT NULL,
        tag TEXT NOT NULL,
        bucket TEXT NOT NULL,
        PRIMARY KEY (atom_id, tag, bucket)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS atom_buckets (
        atom_id TEXT NOT NULL,
        bucket TEXT NOT NULL,
        PRIMARY KEY (atom_id, bucket)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS variant_of (
        atom_id TEXT NOT NULL,
        canonical_id TEXT NOT NULL,
        distance INTEGER NOT NULL,
        PRIMARY KEY (atom_id, canonical_id)
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_compounds_path ON compounds(path)",
    "CREATE INDEX IF NOT EXISTS idx_molecules_atom_id ON molecules(atom_id)",
    "CREATE INDEX IF NOT EXISTS idx_atoms_band0 ON atoms(fp_band0)",
    "CREATE INDEX IF NOT EXISTS idx_atoms_band1 ON atoms(fp_band1)",
    "CREATE INDEX IF NOT EXISTS idx_atoms_band2 ON atoms(fp_band2)",
    "CREATE INDEX IF NOT EXISTS idx_atoms_band3 ON atoms(fp_band3)",
    "CREATE INDEX IF NOT EXISTS idx_atoms_last_seen ON atoms(last_seen DESC)",
    "CREATE INDEX IF NOT EXISTS idx_tag_assoc_pair ON tag_assoc(tag, bucket)",
    "CREATE INDEX IF NOT EXISTS idx_tag_assoc_bucket ON tag_assoc(bucket)",
    "CREATE INDEX IF NOT EXISTS idx_atom_buckets_bucket ON atom_buckets(bucket)",
    "CREATE INDEX IF NOT EXISTS idx_variant_of_canonical ON variant_of(canonical_id)",
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables, indexes, and the full-text index on an open pool.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    for statement in TABLES.iter().chain(INDEXES) {
        sqlx::query(statement).execute(pool).await?;
    }

    // Databases created before atom_buckets existed only recorded buckets
    // through tag rows.
    sqlx::query(
        "INSERT OR IGNORE INTO atom_buckets (atom_id, bucket) \
         SELECT DISTINCT atom_id, bucket FROM tag_assoc",
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='atoms_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            "CREATE VIRTUAL TABLE atoms_fts USING fts5(content, content='atoms', content_rowid='pk')",
        )
        .execute(pool)
        .await?;
        // Index anything inserted before the FTS table existed.
        sqlx::query("INSERT INTO atoms_fts(atoms_fts) VALUES('rebuild')")
            .execute(pool)
            .await?;
    }

    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS atoms_fts_insert AFTER INSERT ON atoms BEGIN
            INSERT INTO atoms_fts(rowid, content) VALUES (new.pk, new.content);
        END
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
