use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn anchor_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("anchor");
    path
}

fn write_config(root: &Path, extra: &str) -> PathBuf {
    let config_content = format!(
        r#"[db]
path = "{root}/data/anchor.sqlite"

[connectors.filesystem]
root = "{root}/files"
include_globs = ["**/*.md", "**/*.txt", "**/*.html"]
exclude_globs = []
follow_symlinks = false
buckets = ["notes"]
{extra}
"#,
        root = root.display(),
        extra = extra
    );

    let config_path = root.join("config").join("anchor.toml");
    fs::write(&config_path, config_content).unwrap();
    config_path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::create_dir_all(root.join("config")).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    ).unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    ).unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    ).unwrap();
    fs::write(
        files_dir.join("ops.html"),
        r#"<html><head><title>Ops Runbook</title>
<meta name="keywords" content="observability, oncall">
<script>var secrettoken = "hidden";</script></head>
<body><h1>Runbook</h1><p>Grafana dashboards show alerting latency.</p></body></html>"#,
    ).unwrap();

    let config_path = write_config(&root, "");
    (tmp, config_path)
}

fn run_anchor(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = anchor_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run anchor binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn ingested_env() -> (TempDir, PathBuf) {
    let (tmp, config_path) = setup_test_env();
    let (_, _, ok) = run_anchor(&config_path, &["init"]);
    assert!(ok, "init failed");
    let (stdout, stderr, ok) = run_anchor(&config_path, &["ingest"]);
    assert!(ok, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    (tmp, config_path)
}

fn first_id(config_path: &Path, query: &str) -> String {
    let (stdout, stderr, ok) = run_anchor(config_path, &["search", query, "--json"]);
    assert!(ok, "search failed: {}", stderr);
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    value["atoms"][0]["atom"]["id"]
        .as_str()
        .unwrap_or_else(|| panic!("no hit for {:?}: {}", query, stdout))
        .to_string()
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_anchor(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/anchor.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_anchor(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_anchor(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_filesystem() {
    let (_tmp, config_path) = setup_test_env();

    run_anchor(&config_path, &["init"]);
    let (stdout, stderr, success) = run_anchor(&config_path, &["ingest"]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("files: 4"), "got: {}", stdout);
    assert!(stdout.contains("chunks failed: 0"));
    assert!(stdout.trim_end().ends_with("ok"));
}

#[test]
fn test_reingest_writes_no_new_atoms() {
    let (_tmp, config_path) = ingested_env();

    let (stdout, _, success) = run_anchor(&config_path, &["ingest"]);
    assert!(success);
    assert!(
        stdout.contains("atoms written: 0"),
        "Expected no new atoms on re-ingest, got: {}",
        stdout
    );
    assert!(stdout.contains("exact duplicates: 4"), "got: {}", stdout);
}

#[test]
fn test_copied_file_is_exact_duplicate() {
    let (tmp, config_path) = setup_test_env();
    let files_dir = tmp.path().join("files");
    fs::copy(files_dir.join("alpha.md"), files_dir.join("alpha-copy.md")).unwrap();

    run_anchor(&config_path, &["init"]);
    let (stdout, _, success) = run_anchor(&config_path, &["ingest"]);
    assert!(success);
    assert!(stdout.contains("files: 5"));
    assert!(stdout.contains("exact duplicates: 1"), "got: {}", stdout);

    let (stats, _, _) = run_anchor(&config_path, &["stats", "--json"]);
    let value: serde_json::Value = serde_json::from_str(&stats).unwrap();
    assert_eq!(value["compounds"], 5);
    assert_eq!(value["atoms"], 4);
}

#[test]
fn test_ingest_dry_run() {
    let (_tmp, config_path) = setup_test_env();

    run_anchor(&config_path, &["init"]);
    let (stdout, _, success) = run_anchor(&config_path, &["ingest", "--dry-run"]);
    assert!(success);
    assert!(stdout.contains("dry-run"));
    assert!(stdout.contains("files found: 4"));

    let (stats, _, _) = run_anchor(&config_path, &["stats", "--json"]);
    let value: serde_json::Value = serde_json::from_str(&stats).unwrap();
    assert_eq!(value["atoms"], 0, "dry run must not write");
}

#[test]
fn test_ingest_with_limit() {
    let (_tmp, config_path) = setup_test_env();

    run_anchor(&config_path, &["init"]);
    let (stdout, _, success) = run_anchor(&config_path, &["ingest", "--limit", "1"]);
    assert!(success);
    assert!(stdout.contains("files: 1"));
}

#[test]
fn test_ingest_rejects_quarantined_provenance() {
    let (_tmp, config_path) = setup_test_env();

    run_anchor(&config_path, &["init"]);
    let (_, stderr, success) =
        run_anchor(&config_path, &["ingest", "--provenance", "quarantined"]);
    assert!(!success);
    assert!(stderr.contains("not allowed"), "got: {}", stderr);
}

#[test]
fn test_search_keyword() {
    let (_tmp, config_path) = ingested_env();

    let (stdout, _, success) = run_anchor(&config_path, &["search", "kubernetes"]);
    assert!(success, "search failed");
    assert!(
        stdout.contains("gamma.txt"),
        "Expected gamma.txt in results, got: {}",
        stdout
    );
    assert!(stdout.contains("phases: strict="));
}

#[test]
fn test_search_deterministic() {
    let (_tmp, config_path) = ingested_env();

    let (stdout1, _, _) = run_anchor(&config_path, &["search", "document", "--json"]);
    let (stdout2, _, _) = run_anchor(&config_path, &["search", "document", "--json"]);
    assert_eq!(
        stdout1, stdout2,
        "Search results should be deterministic across runs"
    );
}

#[test]
fn test_search_empty_query() {
    let (_tmp, config_path) = setup_test_env();

    run_anchor(&config_path, &["init"]);
    let (stdout, _, success) = run_anchor(&config_path, &["search", ""]);
    assert!(success, "Empty query should not panic");
    assert!(stdout.contains("No results"));
}

#[test]
fn test_search_no_results_json() {
    let (_tmp, config_path) = ingested_env();

    let (stdout, _, success) = run_anchor(&config_path, &["search", "zzzqqq", "--json"]);
    assert!(success);
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(value["stats"]["atomCount"], 0);
    assert_eq!(value["atoms"].as_array().map(|a| a.len()), Some(0));
}

#[test]
fn test_search_zero_budget_fails() {
    let (_tmp, config_path) = ingested_env();

    let (_, stderr, success) = run_anchor(&config_path, &["search", "rust", "--budget", "0"]);
    assert!(!success);
    assert!(stderr.contains("budget"), "got: {}", stderr);
}

#[test]
fn test_search_respects_budget() {
    let (_tmp, config_path) = ingested_env();

    let (stdout, _, success) = run_anchor(&config_path, &["search", "document", "--budget", "200", "--json"]);
    assert!(success);
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let chars = value["stats"]["charCount"].as_u64().unwrap();
    let atoms = value["stats"]["atomCount"].as_u64().unwrap();
    assert!(atoms >= 1);
    // Only the last admitted atom of a phase may overflow.
    assert!(atoms == 1 || chars <= 200 + 150, "chars={} atoms={}", chars, atoms);
}

#[test]
fn test_html_is_cleaned_before_ingest() {
    let (_tmp, config_path) = ingested_env();

    let (stdout, _, success) = run_anchor(&config_path, &["search", "secrettoken"]);
    assert!(success);
    assert!(stdout.contains("No results"), "script text leaked: {}", stdout);

    let (stdout, _, success) = run_anchor(&config_path, &["search", "grafana dashboards"]);
    assert!(success);
    assert!(stdout.contains("ops.html"), "got: {}", stdout);
}

#[test]
fn test_html_keywords_become_tags() {
    let (_tmp, config_path) = ingested_env();

    let (stdout, _, success) =
        run_anchor(&config_path, &["search", "dashboards", "--tag", "observability"]);
    assert!(success);
    assert!(stdout.contains("ops.html"), "got: {}", stdout);

    let (stdout, _, success) =
        run_anchor(&config_path, &["search", "dashboards", "--tag", "no-such-tag"]);
    assert!(success);
    assert!(stdout.contains("No results"));
}

#[test]
fn test_bucket_filter() {
    let (_tmp, config_path) = ingested_env();

    let (stdout, _, _) = run_anchor(&config_path, &["search", "kubernetes", "--bucket", "notes"]);
    assert!(stdout.contains("gamma.txt"));

    let (stdout, _, _) = run_anchor(&config_path, &["search", "kubernetes", "--bucket", "elsewhere"]);
    assert!(stdout.contains("No results"));
}

#[test]
fn test_context_prints_text_and_stats() {
    let (_tmp, config_path) = ingested_env();

    let (stdout, stderr, success) = run_anchor(&config_path, &["context", "kubernetes"]);
    assert!(success, "context failed: {}", stderr);
    assert!(stdout.contains("Kubernetes"), "got: {}", stdout);
    assert!(stderr.contains("context:"), "got: {}", stderr);
}

#[test]
fn test_context_json() {
    let (_tmp, config_path) = ingested_env();

    let (stdout, _, success) = run_anchor(&config_path, &["context", "python", "--json", "--budget", "4000"]);
    assert!(success);
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(value["text"].as_str().unwrap().contains("Python"));
    assert_eq!(value["stats"]["char_budget"], 4000);
}

#[test]
fn test_get_atom() {
    let (_tmp, config_path) = ingested_env();

    let id = first_id(&config_path, "rust");
    let (stdout, _, success) = run_anchor(&config_path, &["get", &id]);
    assert!(success, "get should succeed");
    assert!(stdout.contains("--- Atom ---"));
    assert!(stdout.contains(&id));
    assert!(stdout.contains("alpha.md"));
    assert!(stdout.contains("--- Content ---"));
}

#[test]
fn test_get_missing_atom() {
    let (_tmp, config_path) = setup_test_env();

    run_anchor(&config_path, &["init"]);

    let (_, stderr, success) = run_anchor(&config_path, &["get", "nonexistent-id"]);
    assert!(!success, "get with missing ID should fail");
    assert!(
        stderr.contains("not found"),
        "Should report not found, got: {}",
        stderr
    );
}

#[test]
fn test_quarantine_hides_atom() {
    let (_tmp, config_path) = ingested_env();

    let id = first_id(&config_path, "kubernetes");
    let (stdout, stderr, success) =
        run_anchor(&config_path, &["quarantine", &id, "--reason", "stale"]);
    assert!(success, "quarantine failed: {}", stderr);
    assert!(stdout.contains("quarantined 1 of 1"), "got: {}", stdout);

    let (stdout, _, _) = run_anchor(&config_path, &["search", "kubernetes"]);
    assert!(stdout.contains("No results"), "got: {}", stdout);

    let (stdout, _, _) =
        run_anchor(&config_path, &["search", "kubernetes", "--provenance", "quarantined"]);
    assert!(stdout.contains("gamma.txt"), "got: {}", stdout);

    let (stdout, _, _) = run_anchor(&config_path, &["get", &id]);
    assert!(stdout.contains("quarantined"));
}

#[test]
fn test_quarantine_unknown_ids_fails() {
    let (_tmp, config_path) = ingested_env();

    let (_, stderr, success) = run_anchor(&config_path, &["quarantine", "nope"]);
    assert!(!success);
    assert!(stderr.contains("No matching atoms"));
}

#[test]
fn test_stats() {
    let (_tmp, config_path) = ingested_env();

    let (stdout, _, success) = run_anchor(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Atoms:"));
    assert!(stdout.contains("notes"));
}

#[test]
fn test_invalid_config_fails() {
    let (tmp, _) = setup_test_env();
    let config_path = write_config(tmp.path(), "\n[segmentation]\nmax_chunk_size = 0\n");

    let (_, stderr, success) = run_anchor(&config_path, &["init"]);
    assert!(!success, "zero max_chunk_size should be rejected");
    assert!(stderr.contains("max_chunk_size"), "got: {}", stderr);
}

#[test]
fn test_small_chunks_dedup_shared_paragraph() {
    let (tmp, _) = setup_test_env();
    let config_path = write_config(tmp.path(), "\n[segmentation]\nmax_chunk_size = 48\n");
    let files_dir = tmp.path().join("files");
    for f in ["alpha.md", "beta.md", "gamma.txt", "ops.html"] {
        fs::remove_file(files_dir.join(f)).unwrap();
    }
    let shared = "Shared boilerplate paragraph in every file.";
    fs::write(files_dir.join("one.txt"), format!("First file intro text here.\n\n{}", shared)).unwrap();
    fs::write(files_dir.join("two.txt"), format!("Second file intro text here.\n\n{}", shared)).unwrap();

    run_anchor(&config_path, &["init"]);
    let (stdout, stderr, success) = run_anchor(&config_path, &["ingest"]);
    assert!(success, "ingest failed: {}", stderr);
    assert!(stdout.contains("exact duplicates: 1"), "got: {}", stdout);

    let (stdout, _, _) = run_anchor(&config_path, &["search", "boilerplate", "--json"]);
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let hit = &value["atoms"][0]["atom"];
    assert_eq!(hit["occurrences"], 2);
}

#[test]
fn test_completions() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_anchor(&config_path, &["completions", "bash"]);
    assert!(success);
    assert!(stdout.contains("anchor"));
}
