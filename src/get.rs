//! `anchor get`: print one atom with its provenance trail.

use anyhow::{bail, Result};

use anchor_core::store::Store;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

pub async fn run_get(config: &Config, atom_id: &str) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let result = print_atom(&store, atom_id).await;
    store.close().await;
    result
}

async fn print_atom(store: &SqliteStore, atom_id: &str) -> Result<()> {
    let Some(atom) = store.get_atoms(&[atom_id.to_string()]).await?.into_iter().next() else {
        bail!("Atom not found: {}", atom_id);
    };

    println!("--- Atom ---");
    println!("id:           {}", atom.id);
    println!("source:       {} #{}", atom.source_path, atom.sequence);
    println!("type:         {}", atom.content_type);
    println!("provenance:   {}", atom.provenance);
    println!("fingerprint:  {:016x}", atom.fingerprint);
    println!("first_seen:   {}", format_ts_ms(atom.first_seen));
    println!("last_seen:    {}", format_ts_ms(atom.last_seen));
    println!("occurrences:  {}", atom.occurrences);
    println!("buckets:      {}", atom.buckets.join(", "));
    println!("tags:         {}", atom.tags.join(", "));
    if atom.is_quarantined() {
        println!("status:       quarantined");
    }

    if let Some(molecule) = store.locate_atom(&atom.id).await? {
        println!(
            "location:     {} bytes {}..{}{}{}",
            molecule.compound_id,
            molecule.start_byte,
            molecule.end_byte,
            if molecule.oversized { " (oversized)" } else { "" },
            if molecule.continued { " (continued)" } else { "" }
        );
    }

    let links = store.variant_links(&atom.id).await?;
    if !links.is_empty() {
        println!();
        println!("--- Variants ({}) ---", links.len());
        for (variant, canonical, distance) in &links {
            if variant == &atom.id {
                println!("  variant of {} (distance {})", canonical, distance);
            } else {
                println!("  canonical for {} (distance {})", variant, distance);
            }
        }
    }

    println!();
    println!("--- Content ---");
    println!("{}", atom.content);
    Ok(())
}

fn format_ts_ms(ts: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
