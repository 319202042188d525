//! Ingestion front-end: source records from JSON / JSONL files.
//!
//! `hts ingest <PATH>...` accepts files and directories. A `.json` file
//! holds an array of records (or a single record); a `.jsonl` file holds
//! one record per line. Directories are walked recursively for both.
//!
//! # Record format
//!
//! ```json
//! {"source": "statute-text", "chapter": "84", "heading": "8407.10",
//!  "edition": "2025-01-01", "title": "Spark-ignition engines",
//!  "text": "...", "metadata": {"chapter_title": "Nuclear reactors, boilers, machinery"}}
//! ```
//!
//! `natural_key` may be given directly instead of `chapter` + `heading`.
//! Each record goes through [`hts_harness_core::ingest::ingest`]; when an
//! embedding provider is configured, new chunks are embedded inline
//! (non-fatal on failure).

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use hts_harness_core::chunk::ChunkingPolicy;
use hts_harness_core::embedding::EmbeddingProvider;
use hts_harness_core::error::Error as CoreError;
use hts_harness_core::ingest::{ingest, ConflictPolicy, IngestStatus};
use hts_harness_core::models::{DocumentInput, Metadata, SourceKind};
use hts_harness_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::embed_cmd;
use crate::embedding;
use crate::sqlite_store::SqliteStore;

/// One line or array element of an ingestion file.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRecord {
    pub source: String,
    #[serde(default)]
    pub natural_key: Option<String>,
    #[serde(default)]
    pub chapter: Option<serde_json::Value>,
    #[serde(default)]
    pub heading: Option<String>,
    #[serde(default)]
    pub edition: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl SourceRecord {
    /// Resolve the record into a [`DocumentInput`].
    pub fn into_input(self) -> Result<DocumentInput> {
        let source: SourceKind = self.source.parse()?;
        if self.text.trim().is_empty() {
            bail!("record has no text");
        }
        let natural_key = match (self.natural_key, self.chapter, self.heading) {
            (Some(key), _, _) => key,
            (None, Some(chapter), Some(heading)) => {
                format!("{}:{}", chapter_label(&chapter)?, heading.trim())
            }
            _ => bail!("record needs natural_key, or chapter and heading"),
        };
        Ok(DocumentInput {
            source,
            natural_key,
            edition: self.edition,
            title: self.title,
            text: self.text,
            metadata: self.metadata,
        })
    }
}

/// Chapters are two-digit labels; numeric input is zero-padded.
fn chapter_label(chapter: &serde_json::Value) -> Result<String> {
    match chapter {
        serde_json::Value::Number(n) => n
            .as_u64()
            .map(|n| format!("{:02}", n))
            .ok_or_else(|| anyhow!("chapter must be a non-negative integer, got {}", n)),
        serde_json::Value::String(s) => {
            let s = s.trim();
            match s.parse::<u64>() {
                Ok(n) => Ok(format!("{:02}", n)),
                Err(_) => Ok(s.to_string()),
            }
        }
        other => bail!("chapter must be a string or number, got {}", other),
    }
}

/// A record with where it came from, for error messages.
#[derive(Debug, Clone)]
pub struct LocatedRecord {
    pub origin: String,
    pub record: SourceRecord,
}

/// Read every record under `paths`, in file-name order.
pub fn read_records(paths: &[PathBuf]) -> Result<Vec<LocatedRecord>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file() && is_record_file(e.path()))
                .map(|e| e.into_path())
                .collect();
            found.sort();
            files.extend(found);
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            bail!("No such file or directory: {}", path.display());
        }
    }

    let mut records = Vec::new();
    for file in &files {
        records.extend(read_file(file)?);
    }
    Ok(records)
}

fn is_record_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json") | Some("jsonl")
    )
}

fn read_file(path: &Path) -> Result<Vec<LocatedRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let display = path.display().to_string();

    if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
        let mut out = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: SourceRecord = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid record", display, i + 1))?;
            out.push(LocatedRecord {
                origin: format!("{}:{}", display, i + 1),
                record,
            });
        }
        return Ok(out);
    }

    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("{}: invalid JSON", display))?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        single => vec![single],
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let record: SourceRecord = serde_json::from_value(item)
                .with_context(|| format!("{}[{}]: invalid record", display, i))?;
            Ok(LocatedRecord {
                origin: format!("{}[{}]", display, i),
                record,
            })
        })
        .collect()
}

/// Tally of one ingestion run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub created: u64,
    pub unchanged: u64,
    pub revised: u64,
    pub rechunked: u64,
    pub conflicts: u64,
    pub failed: u64,
    pub chunks_written: u64,
    pub embeddings_written: u64,
    pub embeddings_pending: u64,
}

/// Ingest records one by one.
///
/// A version conflict or an invalid record is reported and skipped; the
/// rest of the batch still goes in. Storage errors abort the run.
pub async fn ingest_records(
    store: &dyn Store,
    records: Vec<LocatedRecord>,
    policy: &ChunkingPolicy,
    on_conflict: ConflictPolicy,
    embedder: Option<(&dyn EmbeddingProvider, usize)>,
) -> Result<IngestReport> {
    let mut report = IngestReport::default();

    for LocatedRecord { origin, record } in records {
        let input = match record.into_input() {
            Ok(input) => input,
            Err(e) => {
                eprintln!("Error: {}: {}", origin, e);
                report.failed += 1;
                continue;
            }
        };

        let outcome = match ingest(store, &input, policy, on_conflict).await {
            Ok(outcome) => outcome,
            Err(e) => match e.downcast_ref::<CoreError>() {
                Some(CoreError::VersionConflict { .. }) => {
                    eprintln!("Error: {}: {}", origin, e);
                    report.conflicts += 1;
                    continue;
                }
                Some(CoreError::InvalidIdentity(_)) => {
                    eprintln!("Error: {}: {}", origin, e);
                    report.failed += 1;
                    continue;
                }
                _ => return Err(e.context(format!("while ingesting {}", origin))),
            },
        };

        tracing::debug!(doc_id = %outcome.doc_id, status = %outcome.status, "ingested");
        match outcome.status {
            IngestStatus::Created => report.created += 1,
            IngestStatus::Unchanged => report.unchanged += 1,
            IngestStatus::Revised => report.revised += 1,
            IngestStatus::Rechunked => report.rechunked += 1,
        }
        if !outcome.changed() {
            continue;
        }
        report.chunks_written += outcome.chunk_ids.len() as u64;

        if let Some((provider, batch_size)) = embedder {
            let summary =
                embed_cmd::embed_document_inline(store, provider, &outcome.doc_id, batch_size).await;
            report.embeddings_written += summary.embedded;
            report.embeddings_pending += summary.failed;
        }
    }

    Ok(report)
}

/// CLI entry point for `hts ingest`.
pub async fn run_ingest(
    config: &Config,
    paths: &[PathBuf],
    on_conflict: Option<ConflictPolicy>,
    dry_run: bool,
) -> Result<()> {
    let records = read_records(paths)?;
    let policy = config.chunking_policy()?;

    if dry_run {
        let mut valid = 0usize;
        for r in &records {
            match r.record.clone().into_input() {
                Ok(_) => valid += 1,
                Err(e) => eprintln!("Error: {}: {}", r.origin, e),
            }
        }
        println!("ingest (dry-run)");
        println!("  records found: {}", records.len());
        println!("  valid records: {}", valid);
        return Ok(());
    }

    let provider = if config.embedding.is_enabled() {
        match embedding::create_provider(&config.embedding) {
            Ok(p) => Some(p),
            Err(e) => {
                eprintln!("Warning: could not create embedding provider: {}", e);
                None
            }
        }
    } else {
        None
    };

    let store = SqliteStore::new(db::connect(config).await?);
    let total = records.len();
    let report = ingest_records(
        &store,
        records,
        &policy,
        on_conflict.unwrap_or(config.ingest.on_conflict),
        provider
            .as_deref()
            .map(|p| (p, config.embedding.batch_size)),
    )
    .await;
    store.close().await;
    let report = report?;

    println!("ingest");
    println!("  records: {}", total);
    println!("  created: {}", report.created);
    println!("  unchanged: {}", report.unchanged);
    println!("  revised: {}", report.revised);
    println!("  rechunked: {}", report.rechunked);
    println!("  chunks written: {}", report.chunks_written);
    if config.embedding.is_enabled() {
        println!("  embeddings written: {}", report.embeddings_written);
        println!("  embeddings pending: {}", report.embeddings_pending);
    }
    if report.conflicts > 0 {
        println!("  version conflicts: {}", report.conflicts);
    }
    if report.failed > 0 {
        println!("  failed: {}", report.failed);
    }

    if report.conflicts > 0 || report.failed > 0 {
        bail!(
            "{} version conflict(s) and {} invalid record(s); rerun with --on-conflict revise to accept changed text",
            report.conflicts,
            report.failed
        );
    }
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::StubProvider;
    use hts_harness_core::store::memory::InMemoryStore;
    use tempfile::TempDir;

    const JSONL: &str = r#"{"source":"statute-text","chapter":84,"heading":"8407.10","edition":"2025-01-01","text":"Spark-ignition reciprocating piston engines for aircraft."}

{"source":"ruling","natural_key":"HQ-H301234","text":"Engine parts of heading 8409 are classified by their principal use."}
"#;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    fn policy() -> ChunkingPolicy {
        ChunkingPolicy::new(180, 30).unwrap()
    }

    #[test]
    fn test_chapter_and_heading_form_natural_key() {
        let records = {
            let dir = TempDir::new().unwrap();
            let path = write(&dir, "a.jsonl", JSONL);
            read_records(&[path]).unwrap()
        };
        assert_eq!(records.len(), 2);
        assert!(records[0].origin.ends_with("a.jsonl:1"));
        let input = records[0].record.clone().into_input().unwrap();
        assert_eq!(input.natural_key, "84:8407.10");
        assert_eq!(input.source, SourceKind::StatuteText);
    }

    #[test]
    fn test_numeric_chapters_are_padded() {
        assert_eq!(chapter_label(&serde_json::json!(1)).unwrap(), "01");
        assert_eq!(chapter_label(&serde_json::json!("7")).unwrap(), "07");
        assert_eq!(chapter_label(&serde_json::json!("XCIX")).unwrap(), "XCIX");
        assert!(chapter_label(&serde_json::json!(true)).is_err());
    }

    #[test]
    fn test_directory_walk_reads_json_arrays_and_skips_other_files() {
        let dir = TempDir::new().unwrap();
        write(&dir, "b/rulings.json", r#"[{"source":"ruling","natural_key":"NY-N1","text":"t"}]"#);
        write(&dir, "a/single.json", r#"{"source":"ruling","natural_key":"NY-N2","text":"t"}"#);
        write(&dir, "notes.txt", "ignored");

        let records = read_records(&[dir.path().to_path_buf()]).unwrap();
        let keys: Vec<_> = records
            .iter()
            .map(|r| r.record.natural_key.clone().unwrap())
            .collect();
        assert_eq!(keys, vec!["NY-N2", "NY-N1"]);
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let record: SourceRecord =
            serde_json::from_str(r#"{"source":"ruling","text":"t"}"#).unwrap();
        assert!(record.into_input().is_err());
    }

    #[tokio::test]
    async fn test_ingest_records_counts_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.jsonl", JSONL);
        let store = InMemoryStore::new();
        let stub = StubProvider::new(32);

        let first = ingest_records(
            &store,
            read_records(&[path.clone()]).unwrap(),
            &policy(),
            ConflictPolicy::Reject,
            Some((&stub, 8)),
        )
        .await
        .unwrap();
        assert_eq!(first.created, 2);
        assert_eq!(first.chunks_written, 2);
        assert_eq!(first.embeddings_written, 2);

        let second = ingest_records(
            &store,
            read_records(&[path]).unwrap(),
            &policy(),
            ConflictPolicy::Reject,
            None,
        )
        .await
        .unwrap();
        assert_eq!(second.unchanged, 2);
        assert_eq!(second.chunks_written, 0);
    }

    #[tokio::test]
    async fn test_conflict_is_counted_and_batch_continues() {
        let dir = TempDir::new().unwrap();
        let v1 = write(&dir, "v1.jsonl", r#"{"source":"ruling","natural_key":"HQ-1","text":"Original text."}"#);
        let v2 = write(
            &dir,
            "v2.jsonl",
            "{\"source\":\"ruling\",\"natural_key\":\"HQ-1\",\"text\":\"Changed text.\"}\n\
             {\"source\":\"ruling\",\"natural_key\":\"HQ-2\",\"text\":\"Another.\"}\n\
             {\"source\":\"statute-text\",\"natural_key\":\"84:8407\",\"text\":\"No edition.\"}\n",
        );
        let store = InMemoryStore::new();
        ingest_records(&store, read_records(&[v1]).unwrap(), &policy(), ConflictPolicy::Reject, None)
            .await
            .unwrap();

        let report = ingest_records(&store, read_records(&[v2]).unwrap(), &policy(), ConflictPolicy::Reject, None)
            .await
            .unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.created, 1);
        assert_eq!(report.failed, 1);
        let doc = store.get_document("ruling:HQ-1").await.unwrap().unwrap();
        assert_eq!(doc.body, "Original text.");
    }
}
