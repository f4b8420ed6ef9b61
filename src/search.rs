//! `anchor search` and `anchor context`.
//!
//! Both run the three-phase tag-walker against the SQLite store. `search`
//! lists the retrieved atoms (optionally inflated into source windows);
//! `context` packs them into the character budget and prints the packed
//! text on stdout with the stats on stderr.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use anchor_core::engine::InflatedContext;
use anchor_core::models::Provenance;
use anchor_core::walker::{PhaseReport, SearchOutcome, SearchRequest, SearchStats};
use anchor_core::Engine;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

/// Default character budget for CLI queries.
pub const DEFAULT_BUDGET: usize = 8000;

const EXCERPT_CHARS: usize = 160;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub buckets: Vec<String>,
    pub tags: Vec<String>,
    pub budget: usize,
    pub provenance: Option<Provenance>,
    pub inflate: bool,
    pub json: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            buckets: Vec::new(),
            tags: Vec::new(),
            budget: DEFAULT_BUDGET,
            provenance: None,
            inflate: false,
            json: false,
        }
    }
}

impl SearchOptions {
    fn request(&self, query: &str) -> SearchRequest {
        let request = SearchRequest::new(query, self.budget)
            .buckets(self.buckets.clone())
            .tags(self.tags.clone());
        match self.provenance {
            Some(p) => request.provenance(p),
            None => request,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchOutput<'a> {
    #[serde(flatten)]
    outcome: &'a SearchOutcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    inflated: Vec<InflatedContext>,
}

async fn open_engine(config: &Config) -> Result<Engine<SqliteStore>> {
    let store = Arc::new(SqliteStore::open(config).await?);
    Ok(Engine::new(store, config.engine_config())?)
}

pub async fn run_search(config: &Config, query: &str, options: &SearchOptions) -> Result<()> {
    let engine = open_engine(config).await?;
    let result = search_and_print(&engine, query, options).await;
    engine.shutdown().await;
    result
}

async fn search_and_print(
    engine: &Engine<SqliteStore>,
    query: &str,
    options: &SearchOptions,
) -> Result<()> {
    let outcome = engine.search(&options.request(query)).await?;
    let inflated = if options.inflate {
        engine.inflate(&outcome.atoms).await?
    } else {
        Vec::new()
    };
    warn_degraded(&outcome.stats);

    if options.json {
        let output = SearchOutput {
            outcome: &outcome,
            inflated,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if outcome.atoms.is_empty() {
        println!("No results.");
        println!("{}", phase_line(&outcome.stats));
        return Ok(());
    }

    for (i, hit) in outcome.atoms.iter().enumerate() {
        let atom = &hit.atom;
        println!(
            "{}. [{:.2}] {:<6} {} #{}",
            i + 1,
            hit.score,
            format!("{:?}", hit.phase).to_lowercase(),
            atom.source_path,
            atom.sequence
        );
        if let Some(gravity) = hit.gravity {
            println!(
                "    gravity: {:.3} (hop {} from {})",
                gravity,
                hit.hop,
                hit.anchor_id.as_deref().unwrap_or("-")
            );
        }
        if !atom.tags.is_empty() {
            println!("    tags: {}", atom.tags.join(", "));
        }
        println!("    buckets: {}", atom.buckets.join(", "));
        match inflated.iter().find(|c| c.atom_id == atom.id) {
            Some(window) => {
                println!(
                    "    context [{}..{}]: \"{}\"",
                    window.start,
                    window.end,
                    one_line(&window.text)
                );
            }
            None => println!("    excerpt: \"{}\"", excerpt(&atom.content)),
        }
        println!("    id: {}", atom.id);
        println!();
    }
    println!("{}", phase_line(&outcome.stats));
    Ok(())
}

pub async fn run_context(config: &Config, query: &str, options: &SearchOptions) -> Result<()> {
    let engine = open_engine(config).await?;
    let result = context_and_print(&engine, query, options).await;
    engine.shutdown().await;
    result
}

async fn context_and_print(
    engine: &Engine<SqliteStore>,
    query: &str,
    options: &SearchOptions,
) -> Result<()> {
    let outcome = engine.search(&options.request(query)).await?;
    warn_degraded(&outcome.stats);
    let packed = engine.assemble_context(query, &outcome.atoms, options.budget)?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&packed)?);
        return Ok(());
    }

    println!("{}", packed.text);
    let s = &packed.stats;
    eprintln!(
        "context: {} chars (~{} tokens), {:.1}% of {}, {} atoms ({} truncated){}",
        s.char_count,
        s.token_estimate,
        s.fill_percent,
        s.char_budget,
        s.atom_count,
        s.truncated_count,
        if s.temporal { ", recency-weighted" } else { "" }
    );
    eprintln!("{}", phase_line(&outcome.stats));
    Ok(())
}

fn warn_degraded(stats: &SearchStats) {
    if !stats.degraded {
        return;
    }
    for (name, report) in [
        ("strict", &stats.strict),
        ("fuzzy", &stats.fuzzy),
        ("walk", &stats.walk),
    ] {
        if let Some(err) = &report.error {
            eprintln!("warning: {} phase failed: {}", name, err);
        }
    }
}

fn phase_line(stats: &SearchStats) -> String {
    let part = |name: &str, r: &PhaseReport| {
        if r.ran {
            format!("{}={}", name, r.contributed)
        } else {
            format!("{}=-", name)
        }
    };
    format!(
        "phases: {} {} {}  visited={}  chars {}/{}",
        part("strict", &stats.strict),
        part("fuzzy", &stats.fuzzy),
        part("walk", &stats.walk),
        stats.visited,
        stats.char_count,
        stats.char_budget
    )
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn excerpt(text: &str) -> String {
    let line = one_line(text);
    match line.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}…", &line[..cut]),
        None => line,
    }
}
