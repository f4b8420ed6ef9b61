//! `anchor quarantine`: soft-remove atoms from retrieval.

use std::sync::Arc;

use anyhow::{bail, Result};

use anchor_core::Engine;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

pub async fn run_quarantine(config: &Config, atom_ids: &[String], reason: Option<&str>) -> Result<()> {
    let store = Arc::new(SqliteStore::open(config).await?);
    let engine = Engine::new(store, config.engine_config())?;
    let report = engine.quarantine(atom_ids, reason).await;
    engine.shutdown().await;
    let report = report?;

    for id in &report.missing {
        eprintln!("warning: atom not found: {}", id);
    }
    if report.quarantined == 0 {
        bail!("No matching atoms to quarantine");
    }
    println!(
        "quarantined {} of {} atoms ({} tags added)",
        report.quarantined, report.requested, report.tags_added
    );
    Ok(())
}
