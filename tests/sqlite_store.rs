//! Engine tests against the SQLite store in a temporary database.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use anchor_core::ingest::{CancelFlag, IngestRequest};
use anchor_core::models::Provenance;
use anchor_core::store::{AtomFilter, FingerprintQuery, FingerprintScope, MatchMode, Store, TextQuery};
use anchor_core::walker::{Phase, SearchRequest};
use anchor_core::Engine;
use anchor_engine::config::{load_config, Config};
use anchor_engine::connector_fs::SourceFile;
use anchor_engine::ingest::{ingest_files, IngestOptions};
use anchor_engine::progress::{IngestProgressEvent, IngestProgressReporter};
use anchor_engine::sqlite_store::SqliteStore;
use anchor_engine::stats;

const T0: i64 = 1_700_000_000_000;
const HOUR: i64 = 3_600_000;

fn test_config(dir: &Path, extra: &str) -> Config {
    let path = dir.join("anchor.toml");
    fs::write(
        &path,
        format!(
            "[db]\npath = \"{}/anchor.sqlite\"\n\n[retrieval]\nseed = 7\n{}",
            dir.display(),
            extra
        ),
    )
    .unwrap();
    load_config(&path).unwrap()
}

async fn engine_in(dir: &Path, extra: &str) -> Engine<SqliteStore> {
    let config = test_config(dir, extra);
    let store = SqliteStore::open(&config).await.unwrap();
    Engine::new(Arc::new(store), config.engine_config()).unwrap()
}

async fn ingest(
    engine: &Engine<SqliteStore>,
    path: &str,
    content: &str,
    at: i64,
) -> anchor_core::ingest::IngestReport {
    engine
        .ingest(
            &IngestRequest::new(path, content)
                .observed_at(at)
                .buckets(vec!["ops".into()]),
            &CancelFlag::new(),
        )
        .await
        .unwrap()
}

const RUNBOOK: &str = "Drain the node before upgrading the kubelet.\n\n\
Cordon it first so no new pods land there.\n\n\
After the upgrade, uncordon the node and watch the #deploy dashboard.\n";

#[tokio::test]
async fn reingest_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_in(tmp.path(), "\n[segmentation]\nmax_chunk_size = 64\n").await;

    let first = ingest(&engine, "runbook.md", RUNBOOK, T0).await;
    assert!(first.is_complete());
    assert_eq!(first.atoms_written, 3);
    let after_first = stats::collect(engine.store().pool()).await.unwrap();

    let second = ingest(&engine, "runbook.md", RUNBOOK, T0 + HOUR).await;
    assert_eq!(second.compound_id, first.compound_id);
    assert_eq!(second.atoms_written, 0);
    assert_eq!(second.molecules_written, 0);
    assert_eq!(second.exact_duplicates, 3);

    let after_second = stats::collect(engine.store().pool()).await.unwrap();
    assert_eq!(after_second.atoms, after_first.atoms);
    assert_eq!(after_second.molecules, after_first.molecules);
    assert_eq!(after_second.tag_assocs, after_first.tag_assocs);
    engine.shutdown().await;
}

#[tokio::test]
async fn data_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_in(tmp.path(), "").await;
    ingest(&engine, "runbook.md", RUNBOOK, T0).await;
    let count = engine.store().atom_count().await.unwrap();
    engine.shutdown().await;

    let reopened = engine_in(tmp.path(), "").await;
    assert_eq!(reopened.store().atom_count().await.unwrap(), count);
    let outcome = reopened
        .search(&SearchRequest::new("kubelet", 2000))
        .await
        .unwrap();
    assert_eq!(outcome.atoms[0].phase, Phase::Strict);
    reopened.shutdown().await;
}

#[tokio::test]
async fn shared_paragraph_is_stored_once() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_in(tmp.path(), "\n[segmentation]\nmax_chunk_size = 64\n").await;
    let shared = "Rotate the signing keys every ninety days.";

    ingest(&engine, "a.md", &format!("Intro for the first team.\n\n{}", shared), T0).await;
    let report = ingest(&engine, "b.md", &format!("Intro for the second team.\n\n{}", shared), T0 + HOUR).await;
    assert_eq!(report.exact_duplicates, 1);

    let hits = engine
        .store()
        .text_search(&TextQuery {
            terms: &["signing".to_string(), "keys".to_string()],
            mode: MatchMode::All,
            filter: &AtomFilter::default(),
            limit: 10,
        })
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    let atom = &hits[0].atom;
    assert_eq!(atom.occurrences, 2);
    assert_eq!(atom.first_seen, T0);
    assert_eq!(atom.last_seen, T0 + HOUR);
    assert_eq!(atom.buckets, vec!["ops".to_string()]);
    engine.shutdown().await;
}

#[tokio::test]
async fn text_search_any_and_all() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_in(tmp.path(), "\n[segmentation]\nmax_chunk_size = 64\n").await;
    ingest(&engine, "runbook.md", RUNBOOK, T0).await;

    let terms = vec!["kubelet".to_string(), "dashboard".to_string()];
    let filter = AtomFilter::default();
    let all = engine
        .store()
        .text_search(&TextQuery {
            terms: &terms,
            mode: MatchMode::All,
            filter: &filter,
            limit: 10,
        })
        .await
        .unwrap();
    assert!(all.is_empty());

    let any = engine
        .store()
        .text_search(&TextQuery {
            terms: &terms,
            mode: MatchMode::Any,
            filter: &filter,
            limit: 10,
        })
        .await
        .unwrap();
    assert_eq!(any.len(), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn tag_neighbors_share_a_tag() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_in(tmp.path(), "").await;
    let a = ingest(&engine, "a.md", "Kubelet upgrade notes for the #infra team.", T0).await;
    ingest(&engine, "b.md", "Terraform plan review checklist for #infra.", T0 + HOUR).await;
    ingest(&engine, "c.md", "Lunch menu for Friday.", T0).await;

    let anchor = engine
        .store()
        .molecules_for(&a.compound_id)
        .await
        .unwrap()
        .into_iter()
        .find_map(|m| m.atom_id)
        .unwrap();
    let neighbors = engine
        .store()
        .tag_neighbors(&[anchor.clone()], &[], &AtomFilter::default(), 10)
        .await
        .unwrap();
    assert_eq!(neighbors.len(), 1);
    assert_eq!(neighbors[0].anchor_id, anchor);
    assert_eq!(neighbors[0].atom.source_path, "b.md");
    assert!(neighbors[0].shared_tags >= 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn scoped_candidates_include_recent_bucket_atoms() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_in(tmp.path(), "").await;
    ingest(&engine, "old.md", "An old note about disk quotas.", T0).await;
    ingest(&engine, "new.md", "A new note about network policies.", T0 + 10 * HOUR).await;

    let records = engine
        .store()
        .fingerprint_candidates(&FingerprintQuery {
            scope: FingerprintScope::Scoped {
                // Bands no stored atom is likely to share.
                bands: [0xdead, 0xbeef, 0xf00d, 0xcafe],
                buckets: vec!["ops".into()],
                since: T0 + 5 * HOUR,
            },
            limit: 10,
        })
        .await
        .unwrap();
    assert_eq!(records.len(), 1);

    let all = engine
        .store()
        .fingerprint_candidates(&FingerprintQuery {
            scope: FingerprintScope::Exhaustive,
            limit: 10,
        })
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn quarantine_hides_from_search() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_in(tmp.path(), "").await;
    ingest(&engine, "runbook.md", RUNBOOK, T0).await;

    let outcome = engine.search(&SearchRequest::new("kubelet", 2000)).await.unwrap();
    let id = outcome.atoms[0].atom.id.clone();

    let report = engine.quarantine(&[id.clone(), "missing".into()], Some("stale")).await.unwrap();
    assert_eq!(report.quarantined, 1);
    assert_eq!(report.missing, vec!["missing".to_string()]);

    let hidden = engine.search(&SearchRequest::new("kubelet", 2000)).await.unwrap();
    assert!(hidden.atoms.iter().all(|a| a.atom.id != id));

    let only = engine
        .search(&SearchRequest::new("kubelet", 2000).provenance(Provenance::Quarantined))
        .await
        .unwrap();
    assert_eq!(only.atoms.len(), 1);
    assert!(only.atoms[0].atom.is_quarantined());

    let stats = stats::collect(engine.store().pool()).await.unwrap();
    assert_eq!(stats.quarantined, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn bucket_filter_applies_to_search() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_in(tmp.path(), "").await;
    ingest(&engine, "runbook.md", RUNBOOK, T0).await;

    let other = engine
        .search(&SearchRequest::new("kubelet", 2000).buckets(vec!["finance".into()]))
        .await
        .unwrap();
    assert!(other.atoms.is_empty());

    let ops = engine
        .search(&SearchRequest::new("kubelet", 2000).buckets(vec!["ops".into()]))
        .await
        .unwrap();
    assert!(!ops.atoms.is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn tagless_atom_keeps_its_bucket() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_in(tmp.path(), "").await;
    let report = engine
        .ingest(
            &IngestRequest::new("cat.md", "The cat sat.").buckets(vec!["work".into()]),
            &CancelFlag::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.tags_written, 0);

    let work = engine
        .search(&SearchRequest::new("cat", 2000).buckets(vec!["work".into()]))
        .await
        .unwrap();
    assert_eq!(work.atoms.len(), 1);
    assert_eq!(work.atoms[0].atom.buckets, vec!["work".to_string()]);

    let stats = stats::collect(engine.store().pool()).await.unwrap();
    assert_eq!(stats.buckets.len(), 1);
    assert_eq!(stats.buckets[0].bucket, "work");
    assert_eq!(stats.buckets[0].atoms, 1);
    assert_eq!(stats.buckets[0].tags, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn exact_duplicate_is_searchable_in_both_buckets() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_in(tmp.path(), "").await;
    let text = "Restart the kubelet when the node reports pressure.";
    engine
        .ingest(
            &IngestRequest::new("personal.md", text)
                .observed_at(T0)
                .buckets(vec!["personal".into()]),
            &CancelFlag::new(),
        )
        .await
        .unwrap();
    let second = engine
        .ingest(
            &IngestRequest::new("work.md", text)
                .observed_at(T0 + HOUR)
                .buckets(vec!["work".into()])
                .tags(vec!["oncall".into()]),
            &CancelFlag::new(),
        )
        .await
        .unwrap();
    assert_eq!(second.exact_duplicates, 1);
    assert!(second.tags_written > 0);

    for bucket in ["personal", "work"] {
        let hits = engine
            .search(&SearchRequest::new("kubelet", 2000).buckets(vec![bucket.into()]))
            .await
            .unwrap();
        assert_eq!(hits.atoms.len(), 1, "bucket {}", bucket);
    }
    let oncall = engine
        .search(
            &SearchRequest::new("kubelet", 2000)
                .buckets(vec!["work".into()])
                .tags(vec!["oncall".into()]),
        )
        .await
        .unwrap();
    assert_eq!(oncall.atoms.len(), 1);
    assert!(oncall.atoms[0].atom.tags.contains(&"oncall".to_string()));
    engine.shutdown().await;
}

#[derive(Default)]
struct Recorder(Mutex<Vec<IngestProgressEvent>>);

impl IngestProgressReporter for Recorder {
    fn report(&self, event: IngestProgressEvent) {
        self.0.lock().unwrap().push(event);
    }
}

#[tokio::test]
async fn unreadable_file_does_not_stop_the_run() {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(docs.join("b.md"), "Rotate the signing keys every ninety days.").unwrap();

    let extra = format!(
        "\n[connectors.filesystem]\nroot = \"{}\"\nbuckets = [\"ops\"]\n",
        docs.display()
    );
    let config = test_config(tmp.path(), &extra);
    let engine = Engine::new(
        Arc::new(SqliteStore::open(&config).await.unwrap()),
        config.engine_config(),
    )
    .unwrap();
    let fs_config = config.connectors.filesystem.clone().unwrap();

    let files = vec![
        SourceFile {
            relative_path: "a.md".into(),
            absolute_path: docs.join("a.md"),
            modified_ms: T0,
            size: 0,
        },
        SourceFile {
            relative_path: "b.md".into(),
            absolute_path: docs.join("b.md"),
            modified_ms: T0,
            size: 42,
        },
    ];
    let recorder = Recorder::default();
    let summary = ingest_files(
        &engine,
        &fs_config,
        &files,
        &IngestOptions::default(),
        &CancelFlag::new(),
        &recorder,
    )
    .await
    .unwrap();

    assert_eq!(summary.files_seen, 2);
    assert_eq!(summary.files_failed, 1);
    assert_eq!(summary.files_ingested, 1);
    assert!(summary.molecules_written > 0);
    let events = recorder.0.lock().unwrap();
    assert!(events
        .iter()
        .any(|e| matches!(e, IngestProgressEvent::FileFailed { path, .. } if path == "a.md")));

    let hits = engine.search(&SearchRequest::new("signing", 2000)).await.unwrap();
    assert_eq!(hits.atoms.len(), 1);
    assert_eq!(hits.atoms[0].atom.source_path, "b.md");
    drop(events);
    engine.shutdown().await;
}
