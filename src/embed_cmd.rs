//! Embedding backfill: `hts embed pending` and `hts embed rebuild`.
//!
//! Chunks are stored without vectors at ingestion time unless inline
//! embedding succeeds. These commands fill the gap in batches of
//! `embedding.batch_size`. A failed batch is reported and skipped; the
//! chunks stay pending for the next run.

use anyhow::{bail, Result};
use std::sync::Arc;

use hts_harness_core::embedding::{check_vectors, EmbeddingProvider};
use hts_harness_core::models::Chunk;
use hts_harness_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::sqlite_store::SqliteStore;

/// Counts reported by the embed commands.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmbedSummary {
    pub total: u64,
    pub embedded: u64,
    pub failed: u64,
}

fn enabled_provider(config: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    embedding::create_provider(&config.embedding)
}

/// Embed chunks that have no vector yet.
pub async fn run_embed_pending(
    config: &Config,
    limit: Option<usize>,
    batch_size_override: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    let provider = enabled_provider(config)?;
    let store = SqliteStore::new(db::connect(config).await?);
    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);

    let pending = store.pending_embeddings(limit.unwrap_or(usize::MAX)).await?;
    if dry_run {
        println!("embed pending (dry-run)");
        println!("  chunks needing embeddings: {}", pending.len());
        store.close().await;
        return Ok(());
    }
    if pending.is_empty() {
        println!("embed pending");
        println!("  all chunks up to date");
        store.close().await;
        return Ok(());
    }

    let summary = embed_chunks(&store, provider.as_ref(), &pending, batch_size).await?;
    println!("embed pending");
    println!("  total pending: {}", summary.total);
    println!("  embedded: {}", summary.embedded);
    println!("  failed: {}", summary.failed);

    store.close().await;
    Ok(())
}

/// Drop every vector and embed all chunks again, e.g. after a model change.
pub async fn run_embed_rebuild(config: &Config, batch_size_override: Option<usize>) -> Result<()> {
    let provider = enabled_provider(config)?;
    let store = SqliteStore::new(db::connect(config).await?);
    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);

    let cleared = store.clear_embeddings().await?;
    println!("embed rebuild: cleared {} existing embeddings", cleared);

    let all = store.pending_embeddings(usize::MAX).await?;
    if all.is_empty() {
        println!("  no chunks to embed");
        store.close().await;
        return Ok(());
    }

    let summary = embed_chunks(&store, provider.as_ref(), &all, batch_size).await?;
    println!("embed rebuild");
    println!("  total chunks: {}", summary.total);
    println!("  embedded: {}", summary.embedded);
    println!("  failed: {}", summary.failed);

    store.close().await;
    Ok(())
}

/// Embed `chunks` in batches and store the vectors.
///
/// Provider failures and malformed responses fail only their batch.
/// Storage errors propagate.
pub async fn embed_chunks(
    store: &dyn Store,
    provider: &dyn EmbeddingProvider,
    chunks: &[Chunk],
    batch_size: usize,
) -> Result<EmbedSummary> {
    let mut summary = EmbedSummary {
        total: chunks.len() as u64,
        ..Default::default()
    };

    for batch in chunks.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = match provider.embed(&texts).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, size = batch.len(), "embedding batch failed");
                summary.failed += batch.len() as u64;
                continue;
            }
        };
        if let Err(e) = check_vectors(&vectors, batch.len(), provider.dims()) {
            tracing::warn!(error = %e, size = batch.len(), "embedding batch malformed");
            summary.failed += batch.len() as u64;
            continue;
        }

        for (chunk, vector) in batch.iter().zip(&vectors) {
            store
                .upsert_embedding(&chunk.chunk_id, vector, provider.model_name())
                .await?;
            summary.embedded += 1;
        }
    }

    Ok(summary)
}

/// Embed a freshly ingested document's chunks. Never fails the ingestion:
/// errors leave the chunks pending and are counted as such.
pub async fn embed_document_inline(
    store: &dyn Store,
    provider: &dyn EmbeddingProvider,
    doc_id: &str,
    batch_size: usize,
) -> EmbedSummary {
    let chunks = match store.get_chunks(doc_id).await {
        Ok(chunks) => chunks,
        Err(e) => {
            tracing::warn!(doc_id, error = %e, "could not load chunks for inline embedding");
            return EmbedSummary::default();
        }
    };
    let missing: Vec<Chunk> = chunks.into_iter().filter(|c| c.embedding.is_none()).collect();

    match embed_chunks(store, provider, &missing, batch_size).await {
        Ok(summary) => summary,
        Err(e) => {
            tracing::warn!(doc_id, error = %e, "inline embedding failed");
            EmbedSummary {
                total: missing.len() as u64,
                embedded: 0,
                failed: missing.len() as u64,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::StubProvider;
    use async_trait::async_trait;
    use hts_harness_core::chunk::ChunkingPolicy;
    use hts_harness_core::ingest::{ingest, ConflictPolicy};
    use hts_harness_core::models::{DocumentInput, Metadata, SourceKind};
    use hts_harness_core::store::memory::InMemoryStore;

    async fn seeded() -> (InMemoryStore, String) {
        let store = InMemoryStore::new();
        let input = DocumentInput {
            source: SourceKind::Ruling,
            natural_key: "HQ-H301234".into(),
            edition: None,
            title: None,
            text: "one two three four five six seven eight nine ten eleven twelve.".into(),
            metadata: Metadata::new(),
        };
        let policy = ChunkingPolicy::new(4, 1).unwrap();
        let out = ingest(&store, &input, &policy, ConflictPolicy::Reject).await.unwrap();
        (store, out.doc_id)
    }

    /// Returns vectors of the wrong width.
    struct Misshapen;

    #[async_trait]
    impl EmbeddingProvider for Misshapen {
        fn model_name(&self) -> &str {
            "misshapen"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0]).collect())
        }
    }

    #[tokio::test]
    async fn test_embed_chunks_fills_every_pending_chunk() {
        let (store, _) = seeded().await;
        let pending = store.pending_embeddings(usize::MAX).await.unwrap();
        assert!(pending.len() > 2);

        let summary = embed_chunks(&store, &StubProvider::new(16), &pending, 2).await.unwrap();
        assert_eq!(summary.embedded, pending.len() as u64);
        assert_eq!(summary.failed, 0);
        assert!(store.pending_embeddings(usize::MAX).await.unwrap().is_empty());
        assert_eq!(
            store.embedding_model(&pending[0].chunk_id).as_deref(),
            Some("stub-hash")
        );
    }

    #[tokio::test]
    async fn test_malformed_vectors_leave_chunks_pending() {
        let (store, doc_id) = seeded().await;
        let summary = embed_document_inline(&store, &Misshapen, &doc_id, 64).await;
        assert_eq!(summary.embedded, 0);
        assert_eq!(summary.failed, summary.total);
        assert_eq!(
            store.pending_embeddings(usize::MAX).await.unwrap().len() as u64,
            summary.total
        );
    }
}
