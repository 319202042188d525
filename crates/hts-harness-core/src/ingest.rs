//! Idempotent document ingestion against a [`Store`].
//!
//! # Algorithm
//!
//! 1. Derive `doc_id` from `(source, natural_key, edition)`.
//! 2. Canonicalize the text and hash it.
//! 3. Compare against the stored document:
//!
//! | Stored | Hash | Chunks | Result |
//! |--------|------|--------|--------|
//! | none | | | write revision 1, [`IngestStatus::Created`] |
//! | present | same | same | no write, [`IngestStatus::Unchanged`] |
//! | present | same | differ (policy changed) | rewrite chunks, [`IngestStatus::Rechunked`] |
//! | present | differs | | [`ConflictPolicy::Reject`]: `VersionConflict`; [`ConflictPolicy::Revise`]: bump revision, [`IngestStatus::Revised`] |

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::chunk::{build_chunks, ChunkingPolicy};
use crate::error::Error;
use crate::identity::{assign_document_id, canonicalize, check_version, content_hash, VersionCheck};
use crate::models::{Document, DocumentInput};
use crate::store::Store;

/// What to do with changed text under an unchanged `doc_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    #[default]
    Reject,
    Revise,
}

impl FromStr for ConflictPolicy {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "reject" => Ok(ConflictPolicy::Reject),
            "revise" => Ok(ConflictPolicy::Revise),
            other => Err(Error::config(format!(
                "ingest.on_conflict must be 'reject' or 'revise', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Created,
    Unchanged,
    Revised,
    Rechunked,
}

impl fmt::Display for IngestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IngestStatus::Created => "created",
            IngestStatus::Unchanged => "unchanged",
            IngestStatus::Revised => "revised",
            IngestStatus::Rechunked => "rechunked",
        })
    }
}

/// `{doc_id, chunk_ids}` plus what happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub doc_id: String,
    pub chunk_ids: Vec<String>,
    pub content_hash: String,
    pub revision: i64,
    pub status: IngestStatus,
}

impl IngestOutcome {
    /// Whether the store was written.
    pub fn changed(&self) -> bool {
        self.status != IngestStatus::Unchanged
    }
}

/// Ingest one document. Re-ingesting identical input is a no-op that
/// returns the same identifiers.
pub async fn ingest<S: Store + ?Sized>(
    store: &S,
    input: &DocumentInput,
    policy: &ChunkingPolicy,
    on_conflict: ConflictPolicy,
) -> Result<IngestOutcome> {
    let doc_id = assign_document_id(input.source, &input.natural_key, input.edition.as_deref())?;
    let body = canonicalize(&input.text);
    if body.is_empty() {
        bail!("document {} has no text", doc_id);
    }
    let hash = content_hash(&body);
    let chunks = build_chunks(&doc_id, &body, policy);
    let chunk_ids: Vec<String> = chunks.iter().map(|c| c.chunk_id.clone()).collect();

    let existing = store.get_document(&doc_id).await?;
    let (revision, status) = match check_version(existing.as_ref(), &hash) {
        VersionCheck::New => (1, IngestStatus::Created),
        VersionCheck::Unchanged => {
            let stored = store.get_chunks(&doc_id).await?;
            let same = stored.len() == chunks.len()
                && stored
                    .iter()
                    .zip(&chunks)
                    .all(|(a, b)| a.chunk_id == b.chunk_id && a.content_hash == b.content_hash);
            let revision = existing.as_ref().map(|d| d.revision).unwrap_or(1);
            if same {
                tracing::debug!(doc_id = %doc_id, "unchanged; skipping");
                return Ok(IngestOutcome {
                    doc_id,
                    chunk_ids,
                    content_hash: hash,
                    revision,
                    status: IngestStatus::Unchanged,
                });
            }
            (revision, IngestStatus::Rechunked)
        }
        VersionCheck::Conflict { stored_hash } => match on_conflict {
            ConflictPolicy::Reject => {
                return Err(Error::VersionConflict {
                    doc_id,
                    stored_hash,
                    incoming_hash: hash,
                }
                .into())
            }
            ConflictPolicy::Revise => {
                let revision = existing.as_ref().map(|d| d.revision).unwrap_or(0) + 1;
                tracing::warn!(doc_id = %doc_id, revision, "content changed without an edition bump; recording new revision");
                (revision, IngestStatus::Revised)
            }
        },
    };

    let doc = Document {
        doc_id: doc_id.clone(),
        source: input.source,
        natural_key: input.natural_key.clone(),
        edition: input.edition.clone(),
        revision,
        content_hash: hash.clone(),
        title: input.title.clone(),
        body,
        metadata: input.metadata.clone(),
        ingested_at: Utc::now().timestamp(),
    };
    store.put_document(&doc, &chunks).await?;
    tracing::info!(doc_id = %doc_id, chunks = chunks.len(), status = %status, "ingested");

    Ok(IngestOutcome {
        doc_id,
        chunk_ids,
        content_hash: hash,
        revision,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Metadata, SourceKind};
    use crate::store::memory::InMemoryStore;

    fn input(text: &str) -> DocumentInput {
        DocumentInput {
            source: SourceKind::StatuteText,
            natural_key: "84:8407.10".into(),
            edition: Some("2025-01-01".into()),
            title: Some("Spark-ignition engines".into()),
            text: text.into(),
            metadata: Metadata::new(),
        }
    }

    fn policy() -> ChunkingPolicy {
        ChunkingPolicy::new(5, 1).unwrap()
    }

    const TEXT: &str = "Heading 8407\n\nSpark-ignition reciprocating or rotary internal combustion piston engines.";

    #[tokio::test]
    async fn test_reingest_is_idempotent() {
        let store = InMemoryStore::new();
        let first = ingest(&store, &input(TEXT), &policy(), ConflictPolicy::Reject).await.unwrap();
        let second = ingest(&store, &input(TEXT), &policy(), ConflictPolicy::Reject).await.unwrap();
        assert_eq!(first.status, IngestStatus::Created);
        assert_eq!(second.status, IngestStatus::Unchanged);
        assert_eq!(first.doc_id, "htsus:84:8407.10@2025-01-01");
        assert_eq!(first.chunk_ids, second.chunk_ids);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(store.stats().await.unwrap().chunks as usize, first.chunk_ids.len());
    }

    #[tokio::test]
    async fn test_whitespace_only_changes_are_unchanged() {
        let store = InMemoryStore::new();
        ingest(&store, &input(TEXT), &policy(), ConflictPolicy::Reject).await.unwrap();
        let spaced = TEXT.replace(' ', "  ");
        let out = ingest(&store, &input(&spaced), &policy(), ConflictPolicy::Reject).await.unwrap();
        assert_eq!(out.status, IngestStatus::Unchanged);
    }

    #[tokio::test]
    async fn test_changed_text_rejected() {
        let store = InMemoryStore::new();
        ingest(&store, &input(TEXT), &policy(), ConflictPolicy::Reject).await.unwrap();
        let err = ingest(&store, &input("Different text."), &policy(), ConflictPolicy::Reject)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::VersionConflict { .. })
        ));
        let doc = store.get_document("htsus:84:8407.10@2025-01-01").await.unwrap().unwrap();
        assert_eq!(doc.revision, 1);
    }

    #[tokio::test]
    async fn test_changed_text_revised() {
        let store = InMemoryStore::new();
        ingest(&store, &input(TEXT), &policy(), ConflictPolicy::Revise).await.unwrap();
        let out = ingest(&store, &input("Different text."), &policy(), ConflictPolicy::Revise)
            .await
            .unwrap();
        assert_eq!(out.status, IngestStatus::Revised);
        assert_eq!(out.revision, 2);
        let history = store.revisions(&out.doc_id).await.unwrap();
        assert_eq!(history.iter().map(|r| r.revision).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(store.get_chunks(&out.doc_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_new_policy_rechunks() {
        let store = InMemoryStore::new();
        ingest(&store, &input(TEXT), &policy(), ConflictPolicy::Reject).await.unwrap();
        let wide = ChunkingPolicy::new(100, 0).unwrap();
        let out = ingest(&store, &input(TEXT), &wide, ConflictPolicy::Reject).await.unwrap();
        assert_eq!(out.status, IngestStatus::Rechunked);
        assert_eq!(out.chunk_ids.len(), 1);
        assert_eq!(store.revisions(&out.doc_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_text_and_bad_identity() {
        let store = InMemoryStore::new();
        assert!(ingest(&store, &input("  \n "), &policy(), ConflictPolicy::Reject).await.is_err());
        let mut no_edition = input(TEXT);
        no_edition.edition = None;
        assert!(ingest(&store, &no_edition, &policy(), ConflictPolicy::Reject).await.is_err());
    }

    #[test]
    fn test_conflict_policy_parse() {
        assert_eq!("revise".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Revise);
        assert!("overwrite".parse::<ConflictPolicy>().is_err());
    }
}
