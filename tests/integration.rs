use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn hts_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("hts");
    path
}

const HEADINGS: &str = r#"[
  {"source": "statute-text", "chapter": 84, "heading": "8409.91", "edition": "2025-01-01",
   "title": "Parts for spark-ignition engines",
   "text": "8409.91 Parts suitable for use solely or principally with spark-ignition reciprocating internal combustion piston engine parts."},
  {"source": "statute-text", "chapter": 84, "heading": "8407.10", "edition": "2025-01-01",
   "title": "Aircraft engines",
   "text": "8407.10 Aircraft engines: spark-ignition reciprocating or rotary internal combustion piston engines."},
  {"source": "statute-text", "chapter": 1, "heading": "0101.21", "edition": "2025-01-01",
   "title": "Purebred breeding horses",
   "text": "0101.21 Live horses: purebred breeding animals."}
]"#;

const RULINGS: &str = "{\"source\": \"ruling\", \"natural_key\": \"NY-N312345\", \"title\": \"Cylinder heads\", \"text\": \"The cylinder head is a part of a reciprocating piston engine and is classified in subheading 8409.91.\"}\n";

fn setup_test_env(embedding: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let records_dir = root.join("records");
    fs::create_dir_all(&records_dir).unwrap();
    fs::write(records_dir.join("headings.json"), HEADINGS).unwrap();
    fs::write(records_dir.join("rulings.jsonl"), RULINGS).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/hts.sqlite"

[chunking]
window_size = 64
overlap = 8

[embedding]
provider = "{embedding}"
dims = 64

[generation]
provider = "stub"

[metrics]
path = "{root}/data/metrics.jsonl"

[logging]
level = "warn"
"#,
        root = root.display(),
        embedding = embedding,
    );

    let config_path = config_dir.join("hts.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_hts(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = hts_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run hts binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn ingested(embedding: &str) -> (TempDir, PathBuf) {
    let (tmp, config_path) = setup_test_env(embedding);
    let (_, stderr, ok) = run_hts(&config_path, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    let records = tmp.path().join("records");
    let (stdout, stderr, ok) = run_hts(&config_path, &["ingest", records.to_str().unwrap()]);
    assert!(ok, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    (tmp, config_path)
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env("disabled");

    let (stdout, _, success1) = run_hts(&config_path, &["init"]);
    assert!(success1, "First init failed");
    assert!(stdout.contains("initialized"));

    let (_, _, success2) = run_hts(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_is_idempotent() {
    let (tmp, config_path) = setup_test_env("disabled");
    run_hts(&config_path, &["init"]);
    let records = tmp.path().join("records");

    let (stdout1, _, ok1) = run_hts(&config_path, &["ingest", records.to_str().unwrap()]);
    assert!(ok1);
    assert!(stdout1.contains("created: 4"), "{}", stdout1);

    let (stdout2, _, ok2) = run_hts(&config_path, &["ingest", records.to_str().unwrap()]);
    assert!(ok2);
    assert!(stdout2.contains("created: 0"));
    assert!(stdout2.contains("unchanged: 4"));
}

#[test]
fn test_ingest_dry_run_writes_nothing() {
    let (tmp, config_path) = setup_test_env("disabled");
    run_hts(&config_path, &["init"]);
    let records = tmp.path().join("records");

    let (stdout, _, ok) = run_hts(
        &config_path,
        &["ingest", records.to_str().unwrap(), "--dry-run"],
    );
    assert!(ok);
    assert!(stdout.contains("valid records: 4"));

    let (stats, _, _) = run_hts(&config_path, &["stats"]);
    assert!(stats.contains("Documents:   0"), "{}", stats);
}

#[test]
fn test_changed_text_is_a_version_conflict() {
    let (tmp, config_path) = ingested("disabled");

    let changed = tmp.path().join("changed.jsonl");
    fs::write(
        &changed,
        "{\"source\": \"ruling\", \"natural_key\": \"NY-N312345\", \"text\": \"Revised ruling text for cylinder heads.\"}\n",
    )
    .unwrap();

    let (stdout, stderr, ok) = run_hts(&config_path, &["ingest", changed.to_str().unwrap()]);
    assert!(!ok, "conflicting ingest should exit non-zero");
    assert!(stdout.contains("version conflicts: 1"), "{}", stdout);
    assert!(stderr.contains("--on-conflict revise"));

    let (stdout, _, ok) = run_hts(
        &config_path,
        &["ingest", changed.to_str().unwrap(), "--on-conflict", "revise"],
    );
    assert!(ok);
    assert!(stdout.contains("revised: 1"));

    let (doc, _, ok) = run_hts(&config_path, &["get", "ruling:NY-N312345"]);
    assert!(ok);
    assert!(doc.contains("revision:     2"));
    assert!(doc.contains("Revised ruling text"));
}

#[test]
fn test_search_lexical_only() {
    let (_tmp, config_path) = ingested("disabled");

    let (stdout, stderr, ok) = run_hts(&config_path, &["search", "purebred horses", "--explain"]);
    assert!(ok, "search failed: {}", stderr);
    assert!(stdout.contains("mode: lexical_only (alpha 0.00)"));
    assert!(stdout.starts_with("mode:"));
    assert!(stdout.contains("1. [1.000] htsus:01:0101.21@2025-01-01"));
    assert!(stdout.contains("semantic: -"));
}

#[test]
fn test_search_no_results() {
    let (_tmp, config_path) = ingested("disabled");

    let (stdout, _, ok) = run_hts(&config_path, &["search", "submarine periscopes"]);
    assert!(ok);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_search_deterministic() {
    let (_tmp, config_path) = ingested("disabled");

    let (first, _, _) = run_hts(&config_path, &["search", "reciprocating piston engine", "--json"]);
    let (second, _, _) = run_hts(&config_path, &["search", "reciprocating piston engine", "--json"]);
    assert_eq!(first, second);
}

#[test]
fn test_hybrid_search_with_stub_embeddings() {
    let (_tmp, config_path) = ingested("stub");

    let (stdout, stderr, ok) = run_hts(&config_path, &["search", "live horses", "--json"]);
    assert!(ok, "search failed: {}", stderr);
    let response: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(response["mode"], "hybrid");
    assert_eq!(response["semantic_degraded"], false);
    assert!(!response["results"].as_array().unwrap().is_empty());
}

#[test]
fn test_classify_answers_with_citations() {
    let (tmp, config_path) = ingested("disabled");

    let (stdout, stderr, ok) = run_hts(
        &config_path,
        &["classify", "reciprocating engine parts", "--json"],
    );
    assert!(ok, "classify failed: {}", stderr);
    let response: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(response["decision"], "ANSWER");
    assert_eq!(response["answer"], "8409.91");
    assert!(response["disclaimer"].as_str().unwrap().contains("Not legal advice"));
    assert!(!response["citations"].as_array().unwrap().is_empty());

    let metrics = fs::read_to_string(tmp.path().join("data/metrics.jsonl")).unwrap();
    assert_eq!(metrics.lines().count(), 1);
    let record: serde_json::Value = serde_json::from_str(metrics.lines().next().unwrap()).unwrap();
    assert_eq!(record["decision"], "ANSWER");
}

#[test]
fn test_classify_abstains_without_candidates() {
    let (_tmp, config_path) = ingested("disabled");

    let (stdout, _, ok) = run_hts(&config_path, &["classify", "submarine periscopes"]);
    assert!(ok);
    assert!(stdout.starts_with("ABSTAIN (no_candidates)"));
    assert!(stdout.contains("NO_CONFIDENT_CLASSIFICATION"));
    assert!(stdout.contains("Not legal advice"));
}

#[test]
fn test_get_and_delete() {
    let (_tmp, config_path) = ingested("disabled");

    let (stdout, _, ok) = run_hts(&config_path, &["get", "htsus:84:8407.10@2025-01-01", "--json"]);
    assert!(ok);
    let doc: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(doc["source"], "statute-text");
    assert_eq!(doc["chunks"][0]["chunk_id"], "htsus:84:8407.10@2025-01-01#s0-o0");

    let (stdout, _, ok) = run_hts(&config_path, &["delete", "htsus:84:8407.10@2025-01-01"]);
    assert!(ok);
    assert!(stdout.contains("deleted"));

    let (_, stderr, ok) = run_hts(&config_path, &["get", "htsus:84:8407.10@2025-01-01"]);
    assert!(!ok);
    assert!(stderr.contains("document not found"));
}

#[test]
fn test_embed_pending_with_stub_provider() {
    let (_tmp, config_path) = setup_test_env("stub");
    run_hts(&config_path, &["init"]);

    let (stats, _, _) = run_hts(&config_path, &["stats"]);
    assert!(stats.contains("Embedded:    0 / 0"));

    let (stdout, _, ok) = run_hts(&config_path, &["embed", "pending", "--dry-run"]);
    assert!(ok);
    assert!(stdout.contains("chunks needing embeddings: 0"));
}

#[test]
fn test_ingest_embeds_inline_when_enabled() {
    let (_tmp, config_path) = ingested("stub");

    let (stats, _, ok) = run_hts(&config_path, &["stats"]);
    assert!(ok);
    assert!(stats.contains("Documents:   4"));
    assert!(stats.contains("(100%)"), "{}", stats);

    let (stdout, _, ok) = run_hts(&config_path, &["embed", "rebuild"]);
    assert!(ok);
    assert!(stdout.contains("failed: 0"));
}

#[test]
fn test_embed_pending_errors_when_disabled() {
    let (_tmp, config_path) = ingested("disabled");

    let (_, stderr, ok) = run_hts(&config_path, &["embed", "pending"]);
    assert!(!ok);
    assert!(stderr.contains("disabled"));
}

#[test]
fn test_eval_reports_hit_rates() {
    let (tmp, config_path) = ingested("disabled");

    let golden = tmp.path().join("golden.jsonl");
    fs::write(
        &golden,
        "{\"query\": \"reciprocating engine parts\", \"expected_code\": \"8409.91\"}\n\
         {\"query\": \"submarine periscopes\", \"expected_code\": \"9005.80\"}\n",
    )
    .unwrap();

    let (stdout, stderr, ok) = run_hts(&config_path, &["eval", golden.to_str().unwrap(), "--json"]);
    assert!(ok, "eval failed: {}", stderr);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["total"], 2);
    assert_eq!(report["hits_at_1"], 1);
    assert_eq!(report["abstained"], 1);
}

#[test]
fn test_invalid_config_fails_fast() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("hts.toml");
    fs::write(
        &config_path,
        format!(
            "[db]\npath = \"{}/hts.sqlite\"\n[retrieval]\nalpha = 1.5\n",
            tmp.path().display()
        ),
    )
    .unwrap();

    let (_, stderr, ok) = run_hts(&config_path, &["init"]);
    assert!(!ok);
    assert!(stderr.contains("alpha"));
    assert!(!tmp.path().join("hts.sqlite").exists());
}
