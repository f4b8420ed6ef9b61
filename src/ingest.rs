//! Ingestion runner.
//!
//! Coordinates a run: filesystem connector → file load (HTML cleaning on a
//! blocking thread) → [`Engine::ingest`] per file → run summary. Unreadable
//! files and chunk failures are reported and counted; they never abort the
//! run. Ctrl-C
//! sets the shared [`CancelFlag`], which the engine checks between chunks.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;

use anchor_core::ingest::{CancelFlag, IngestRequest};
use anchor_core::models::{ContentType, Provenance};
use anchor_core::segment::segment_with;
use anchor_core::store::Store;
use anchor_core::{AnchorError, Engine};

use crate::config::{Config, FilesystemConnectorConfig};
use crate::connector_fs::{self, SourceFile};
use crate::extract::{clean_html, extract_metadata, is_html_path};
use crate::progress::{IngestProgressEvent, IngestProgressReporter, ProgressMode};
use crate::sqlite_store::SqliteStore;

const CONNECTOR: &str = "filesystem";

/// Command-line overrides for a run.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Overrides `connectors.filesystem.provenance`.
    pub provenance: Option<Provenance>,
    /// Replaces `connectors.filesystem.buckets` when non-empty.
    pub buckets: Vec<String>,
    /// Added to `connectors.filesystem.tags`.
    pub tags: Vec<String>,
    pub dry_run: bool,
    pub limit: Option<usize>,
}

/// Totals for one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub files_seen: usize,
    pub files_ingested: usize,
    /// Rejected before anything was written (e.g. not UTF-8).
    pub files_skipped: usize,
    /// Could not be read from disk.
    pub files_failed: usize,
    /// Ingested with at least one rolled-back chunk.
    pub files_partial: usize,
    pub atoms_written: usize,
    pub variants_linked: usize,
    pub exact_duplicates: usize,
    pub molecules_written: usize,
    pub tags_written: usize,
    pub oversized_units: usize,
    pub chunks_committed: usize,
    pub chunks_failed: usize,
    pub cancelled: bool,
}

/// A file read from disk, ready for the engine.
struct LoadedFile {
    content: Vec<u8>,
    extra_tags: Vec<String>,
}

pub async fn run_ingest(config: &Config, options: &IngestOptions, progress: ProgressMode) -> Result<()> {
    let fs_config = config
        .connectors
        .filesystem
        .as_ref()
        .ok_or_else(|| anyhow!("Filesystem connector not configured: add [connectors.filesystem]"))?;
    if options.provenance == Some(Provenance::Quarantined) {
        bail!("--provenance quarantined is not allowed for ingestion; use `anchor quarantine`");
    }

    let reporter = progress.reporter();
    reporter.report(IngestProgressEvent::Discovering {
        connector: CONNECTOR.to_string(),
    });
    let mut files = connector_fs::scan_filesystem(fs_config)?;
    if let Some(lim) = options.limit {
        files.truncate(lim);
    }

    if options.dry_run {
        return dry_run(config, &files).await;
    }

    let store = Arc::new(SqliteStore::open(config).await?);
    let engine = Engine::new(store, config.engine_config())?;

    let cancel = CancelFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current chunk");
            on_interrupt.cancel();
        }
    });

    let summary = ingest_files(&engine, fs_config, &files, options, &cancel, reporter.as_ref()).await;
    engine.shutdown().await;
    let summary = summary?;

    println!("ingest {}", CONNECTOR);
    println!("  files: {}", summary.files_seen);
    println!("  ingested: {}", summary.files_ingested);
    if summary.files_skipped > 0 {
        println!("  skipped: {}", summary.files_skipped);
    }
    if summary.files_failed > 0 {
        println!("  failed: {}", summary.files_failed);
    }
    println!("  atoms written: {}", summary.atoms_written);
    println!("  variants linked: {}", summary.variants_linked);
    println!("  exact duplicates: {}", summary.exact_duplicates);
    println!("  molecules written: {}", summary.molecules_written);
    println!("  oversized units: {}", summary.oversized_units);
    println!("  chunks committed: {}", summary.chunks_committed);
    println!("  chunks failed: {}", summary.chunks_failed);
    if summary.cancelled {
        println!("cancelled");
    } else if summary.chunks_failed > 0 || summary.files_failed > 0 {
        println!("partial: re-run to retry failed files and chunks");
    } else {
        println!("ok");
    }
    Ok(())
}

/// Ingest `files` in order. A file that cannot be read is counted in
/// `files_failed` and the run moves on; only store errors outside the
/// per-chunk contract end it early.
pub async fn ingest_files<S: Store>(
    engine: &Engine<S>,
    fs_config: &FilesystemConnectorConfig,
    files: &[SourceFile],
    options: &IngestOptions,
    cancel: &CancelFlag,
    reporter: &dyn IngestProgressReporter,
) -> Result<RunSummary> {
    let provenance = options.provenance.unwrap_or(fs_config.provenance);
    let buckets = if options.buckets.is_empty() {
        fs_config.buckets.clone()
    } else {
        options.buckets.clone()
    };

    let mut summary = RunSummary {
        files_seen: files.len(),
        ..Default::default()
    };

    for (n, file) in files.iter().enumerate() {
        if cancel.is_cancelled() {
            summary.cancelled = true;
            break;
        }

        let loaded = match load_file(file).await {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(path = %file.relative_path, error = %e, "file failed");
                summary.files_failed += 1;
                reporter.report(IngestProgressEvent::FileFailed {
                    path: file.relative_path.clone(),
                    message: format!("{:#}", e),
                });
                reporter.report(IngestProgressEvent::Ingesting {
                    connector: CONNECTOR.to_string(),
                    n: (n + 1) as u64,
                    total: files.len() as u64,
                    path: file.relative_path.clone(),
                });
                continue;
            }
        };
        let mut tags = fs_config.tags.clone();
        tags.extend(options.tags.iter().cloned());
        tags.extend(loaded.extra_tags);

        let request = IngestRequest::new(file.relative_path.clone(), loaded.content)
            .provenance(provenance)
            .buckets(buckets.clone())
            .tags(tags)
            .observed_at(file.modified_ms);

        match engine.ingest(&request, cancel).await {
            Ok(report) => {
                summary.files_ingested += 1;
                summary.atoms_written += report.atoms_written;
                summary.variants_linked += report.variants_linked;
                summary.exact_duplicates += report.exact_duplicates;
                summary.molecules_written += report.molecules_written;
                summary.tags_written += report.tags_written;
                summary.oversized_units += report.oversized_units;
                summary.chunks_committed += report.chunks_committed;
                summary.chunks_failed += report.errors.len();
                if !report.errors.is_empty() {
                    summary.files_partial += 1;
                }
                for failure in &report.errors {
                    reporter.report(IngestProgressEvent::ChunkFailed {
                        path: file.relative_path.clone(),
                        chunk_index: failure.chunk_index,
                        message: failure.message.clone(),
                    });
                }
                if report.cancelled {
                    summary.cancelled = true;
                }
            }
            Err(AnchorError::Validation(msg)) => {
                tracing::warn!(path = %file.relative_path, "skipped: {}", msg);
                summary.files_skipped += 1;
            }
            Err(e) => return Err(e.into()),
        }

        reporter.report(IngestProgressEvent::Ingesting {
            connector: CONNECTOR.to_string(),
            n: (n + 1) as u64,
            total: files.len() as u64,
            path: file.relative_path.clone(),
        });
    }

    tracing::info!(
        files = summary.files_ingested,
        failed_files = summary.files_failed,
        atoms = summary.atoms_written,
        failed_chunks = summary.chunks_failed,
        "ingestion run finished"
    );
    Ok(summary)
}

/// Read a file on a blocking thread; HTML is cleaned there too and its
/// `<meta name="keywords">` entries become tags.
async fn load_file(file: &SourceFile) -> Result<LoadedFile> {
    let path = file.absolute_path.clone();
    let html = is_html_path(&file.relative_path);
    tokio::task::spawn_blocking(move || -> Result<LoadedFile> {
        let bytes =
            std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        if !html {
            return Ok(LoadedFile {
                content: bytes,
                extra_tags: Vec::new(),
            });
        }
        match String::from_utf8(bytes) {
            Ok(text) => {
                let meta = extract_metadata(&text);
                Ok(LoadedFile {
                    content: clean_html(&text).into_bytes(),
                    extra_tags: meta.keywords,
                })
            }
            // Left for the engine to reject as invalid UTF-8.
            Err(e) => Ok(LoadedFile {
                content: e.into_bytes(),
                extra_tags: Vec::new(),
            }),
        }
    })
    .await?
}

async fn dry_run(config: &Config, files: &[SourceFile]) -> Result<()> {
    let mut total_bytes = 0u64;
    let mut molecules = 0usize;
    let mut unreadable = 0usize;
    for file in files {
        let loaded = match load_file(file).await {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(path = %file.relative_path, error = %e, "file failed");
                unreadable += 1;
                continue;
            }
        };
        total_bytes += loaded.content.len() as u64;
        if let Ok(text) = std::str::from_utf8(&loaded.content) {
            let content_type = ContentType::from_path(&file.relative_path);
            molecules += segment_with(text, content_type, &config.segmentation).len();
        }
    }
    println!("ingest {} (dry-run)", CONNECTOR);
    println!("  files found: {}", files.len());
    if unreadable > 0 {
        println!("  unreadable: {}", unreadable);
    }
    println!("  bytes: {}", total_bytes);
    println!("  estimated molecules: {}", molecules);
    Ok(())
}
